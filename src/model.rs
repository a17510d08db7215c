use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppErr, AppResult};

pub const ROOM_NAME_MAX: usize = 255;
pub const POST_NAME_MAX: usize = 32;
pub const COMMENT_MAX:   usize = 255;
pub const ANONYMOUS:     &str  = "anonymous";

/* ------------ rooms ------------ */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id:                  i64,
    pub hashed_id:           String,
    pub name:                String,
    pub password_hash:       Option<String>,
    pub password_updated_at: Option<DateTime<Utc>>,
    pub is_open:             bool,
    pub updated_at:          DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRoom {
    pub hashed_id: String,
    pub name:      String,
}

/// Changed room columns. `None` leaves a column untouched; the inner `Option`
/// of the nullable columns distinguishes "set to null" from "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name:                Option<String>,
    pub password_hash:       Option<Option<String>>,
    pub password_updated_at: Option<Option<DateTime<Utc>>>,
    pub is_open:             Option<bool>,
    pub updated_at:          Option<DateTime<Utc>>,
}

impl RoomPatch {
    /// Builds a patch from a change-feed row; only keys present in the row are carried.
    pub fn from_row(row: &Value) -> AppResult<Self> {
        let obj = row
            .as_object()
            .ok_or_else(|| AppErr::Bus(format!("room row is not an object: {row}")))?;
        Ok(Self {
            name:                column(obj, "name")?,
            password_hash:       column(obj, "password_hash")?,
            password_updated_at: column(obj, "password_updated_at")?,
            is_open:             column(obj, "is_open")?,
            updated_at:          column(obj, "updated_at")?,
        })
    }
}

fn column<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> AppResult<Option<T>> {
    obj.get(key)
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(crate::error::bus)
}

impl Room {
    /// Merges present fields; returns whether anything changed.
    pub fn merge(&mut self, patch: &RoomPatch) -> bool {
        let before = self.clone();
        if let Some(name) = &patch.name { self.name = name.clone(); }
        if let Some(hash) = &patch.password_hash { self.password_hash = hash.clone(); }
        if let Some(at) = patch.password_updated_at { self.password_updated_at = at; }
        if let Some(open) = patch.is_open { self.is_open = open; }
        if let Some(at) = patch.updated_at { self.updated_at = self.updated_at.max(at); }
        *self != before
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }
}

/* ------------ posts ------------ */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id:         i64,
    pub room_id:    Option<i64>,
    pub name:       Option<String>,
    pub comment:    String,
    pub color:      String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS)
    }

    /// Ordering key: store timestamp first, id breaks ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub room_id: i64,
    pub name:    Option<String>,
    pub comment: String,
    pub color:   String,
}

/// What a viewer typed into the post form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostDraft {
    #[serde(default)]
    pub name:    Option<String>,
    pub comment: String,
}

impl PostDraft {
    /// Checks the form constraints and returns the cleaned `(name, comment)`.
    pub fn validate(&self) -> AppResult<(Option<String>, String)> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);
        if let Some(n) = &name {
            if n.chars().count() > POST_NAME_MAX {
                return Err(AppErr::Invalid(format!("name must be at most {POST_NAME_MAX} characters")));
            }
        }

        if self.comment.trim().is_empty() {
            return Err(AppErr::Invalid("comment is required".into()));
        }
        if self.comment.chars().count() > COMMENT_MAX {
            return Err(AppErr::Invalid(format!("comment must be at most {COMMENT_MAX} characters")));
        }
        Ok((name, self.comment.clone()))
    }
}

pub fn validate_room_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppErr::Invalid("room name is required".into()));
    }
    if name.chars().count() > ROOM_NAME_MAX {
        return Err(AppErr::Invalid(format!("room name must be at most {ROOM_NAME_MAX} characters")));
    }
    Ok(name.to_owned())
}
