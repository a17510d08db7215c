use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::{
    config::SyncConfig,
    error::{AppErr, AppResult},
    model::{NewPost, NewRoom, Post, Room, RoomPatch},
    realtime::{ChangeKind, Hub, RowChange},
};

/// Result of a soft-clear: the posts that left the room, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detached {
    pub ids: Vec<i64>,
}

impl Detached {
    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

/// Rooms + posts tables as the sync core sees them.
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn find_room(&self, hashed_id: &str) -> AppResult<Option<Room>>;
    async fn insert_room(&self, room: NewRoom) -> AppResult<Room>;
    /// Writes the present fields and stamps `updated_at`.
    async fn update_room(&self, room_id: i64, patch: RoomPatch) -> AppResult<Room>;
    /// Posts of a room, oldest first.
    async fn list_posts(&self, room_id: i64) -> AppResult<Vec<Post>>;
    async fn insert_post(&self, post: NewPost) -> AppResult<Post>;
    /// Nulls the room reference of every post in the room; rows are kept.
    async fn detach_posts(&self, room_id: i64) -> AppResult<Detached>;
}

type RoomRow = (i64, String, String, Option<String>, Option<i64>, bool, i64);
type PostRow = (i64, Option<i64>, Option<String>, String, String, i64);

/* ------------ sqlx / SQLite ------------ */
#[derive(Clone)]
pub struct SqliteStore {
    pool:  SqlitePool,
    rooms: String,
    posts: String,
    feed:  Option<Hub>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, cfg: &SyncConfig) -> Self {
        Self { pool, rooms: cfg.rooms_table.clone(), posts: cfg.posts_table.clone(), feed: None }
    }

    /// Publishes every committed write to `hub` as a row change.
    pub fn with_change_feed(mut self, hub: Hub) -> Self {
        self.feed = Some(hub);
        self
    }

    pub async fn bootstrap(&self) -> AppResult<()> {
        let (rooms, posts) = (&self.rooms, &self.posts);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {rooms} (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                hashed_id           TEXT    NOT NULL UNIQUE,
                name                TEXT    NOT NULL,
                password_hash       TEXT,
                password_updated_at INTEGER,
                is_open             INTEGER NOT NULL DEFAULT 0,
                updated_at          INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {posts} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id    INTEGER REFERENCES {rooms}(id),
                name       TEXT,
                comment    TEXT    NOT NULL,
                color      TEXT    NOT NULL,
                created_at INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {posts}_room_created ON {posts} (room_id, created_at)"
        ))
        .execute(&self.pool)
        .await?;
        tracing::info!(%rooms, %posts, "schema ready");
        Ok(())
    }

    fn room_columns() -> &'static str {
        "id, hashed_id, name, password_hash, password_updated_at, is_open, updated_at"
    }

    fn publish<T: Serialize>(&self, table: &str, kind: ChangeKind, old: Option<&T>, new: Option<&T>) {
        let Some(hub) = &self.feed else { return };
        let encode = |row: Option<&T>| row.map(serde_json::to_value).transpose();
        match (encode(old), encode(new)) {
            (Ok(old), Ok(new)) => hub.publish_change(RowChange { table: table.to_string(), kind, old, new }),
            (Err(e), _) | (_, Err(e)) => tracing::warn!(%table, error = %e, "change not published"),
        }
    }
}

fn ts(ms: i64) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppErr::Db(sqlx::Error::Decode(format!("bad timestamp {ms}").into())))
}

fn room_from((id, hashed_id, name, password_hash, pw_at, is_open, updated_at): RoomRow) -> AppResult<Room> {
    Ok(Room {
        id,
        hashed_id,
        name,
        password_hash,
        password_updated_at: pw_at.map(ts).transpose()?,
        is_open,
        updated_at: ts(updated_at)?,
    })
}

fn post_from((id, room_id, name, comment, color, created_at): PostRow) -> AppResult<Post> {
    Ok(Post { id, room_id, name, comment, color, created_at: ts(created_at)? })
}

#[async_trait]
impl BoardStore for SqliteStore {
    async fn find_room(&self, hashed_id: &str) -> AppResult<Option<Room>> {
        let row: Option<RoomRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE hashed_id = ?",
            Self::room_columns(),
            self.rooms
        ))
        .bind(hashed_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(room_from).transpose()
    }

    async fn insert_room(&self, room: NewRoom) -> AppResult<Room> {
        let now = Utc::now();
        let res = sqlx::query(&format!(
            "INSERT INTO {} (hashed_id, name, is_open, updated_at) VALUES (?, ?, 0, ?)",
            self.rooms
        ))
        .bind(&room.hashed_id)
        .bind(&room.name)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let room = Room {
            id: res.last_insert_rowid(),
            hashed_id: room.hashed_id,
            name: room.name,
            password_hash: None,
            password_updated_at: None,
            is_open: false,
            updated_at: ts(now.timestamp_millis())?,
        };
        self.publish(&self.rooms, ChangeKind::Insert, None, Some(&room));
        Ok(room)
    }

    async fn update_room(&self, room_id: i64, patch: RoomPatch) -> AppResult<Room> {
        let select = format!("SELECT {} FROM {} WHERE id = ?", Self::room_columns(), self.rooms);
        let mut tx = self.pool.begin().await?;

        let old: Option<RoomRow> = sqlx::query_as(&select).bind(room_id).fetch_optional(&mut *tx).await?;
        let old = room_from(old.ok_or(AppErr::NotFound)?)?;

        // never go backwards, so later writes always win on the viewers' side
        let stamp = Utc::now().timestamp_millis().max(old.updated_at.timestamp_millis());
        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET updated_at = ", self.rooms));
        qb.push_bind(stamp);
        if let Some(name) = patch.name {
            qb.push(", name = ").push_bind(name);
        }
        if let Some(hash) = patch.password_hash {
            qb.push(", password_hash = ").push_bind(hash);
        }
        if let Some(at) = patch.password_updated_at {
            qb.push(", password_updated_at = ").push_bind(at.map(|t| t.timestamp_millis()));
        }
        if let Some(open) = patch.is_open {
            qb.push(", is_open = ").push_bind(open);
        }
        qb.push(" WHERE id = ").push_bind(room_id);
        qb.build().execute(&mut *tx).await?;

        let new: RoomRow = sqlx::query_as(&select).bind(room_id).fetch_one(&mut *tx).await?;
        tx.commit().await?;

        let new = room_from(new)?;
        self.publish(&self.rooms, ChangeKind::Update, Some(&old), Some(&new));
        Ok(new)
    }

    async fn list_posts(&self, room_id: i64) -> AppResult<Vec<Post>> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT id, room_id, name, comment, color, created_at FROM {}
             WHERE room_id = ? ORDER BY created_at ASC, id ASC",
            self.posts
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(post_from).collect()
    }

    async fn insert_post(&self, post: NewPost) -> AppResult<Post> {
        let created_at = Utc::now().timestamp_millis();
        let res = sqlx::query(&format!(
            "INSERT INTO {} (room_id, name, comment, color, created_at) VALUES (?, ?, ?, ?, ?)",
            self.posts
        ))
        .bind(post.room_id)
        .bind(&post.name)
        .bind(&post.comment)
        .bind(&post.color)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let post = Post {
            id: res.last_insert_rowid(),
            room_id: Some(post.room_id),
            name: post.name,
            comment: post.comment,
            color: post.color,
            created_at: ts(created_at)?,
        };
        self.publish(&self.posts, ChangeKind::Insert, None, Some(&post));
        Ok(post)
    }

    async fn detach_posts(&self, room_id: i64) -> AppResult<Detached> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT id, room_id, name, comment, color, created_at FROM {}
             WHERE room_id = ? ORDER BY created_at ASC, id ASC",
            self.posts
        ))
        .bind(room_id)
        .fetch_all(&mut *tx)
        .await?;
        let posts = rows.into_iter().map(post_from).collect::<AppResult<Vec<_>>>()?;

        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();
        if !ids.is_empty() {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET room_id = NULL WHERE room_id = ", self.posts));
            qb.push_bind(room_id).push(" AND id IN (");
            let mut list = qb.separated(", ");
            for id in &ids {
                list.push_bind(*id);
            }
            list.push_unseparated(")");
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        for old in &posts {
            let new = Post { room_id: None, ..old.clone() };
            self.publish(&self.posts, ChangeKind::Update, Some(old), Some(&new));
        }
        tracing::info!(room_id, count = ids.len(), "posts detached");
        Ok(Detached { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{ChannelEvent, Filter};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let s = SqliteStore::new(pool, &SyncConfig::default());
        s.bootstrap().await.unwrap();
        s
    }

    async fn room(s: &SqliteStore, hashed: &str) -> Room {
        s.insert_room(NewRoom { hashed_id: hashed.into(), name: "Chat A".into() }).await.unwrap()
    }

    fn new_post(room_id: i64, comment: &str) -> NewPost {
        NewPost { room_id, name: None, comment: comment.into(), color: "#61afef".into() }
    }

    #[tokio::test]
    async fn room_round_trip_by_hashed_id() {
        let s = store().await;
        let created = room(&s, "abc").await;
        assert_eq!(s.find_room("abc").await.unwrap(), Some(created));
        assert_eq!(s.find_room("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hashed_id_is_unique() {
        let s = store().await;
        room(&s, "abc").await;
        let dup = s.insert_room(NewRoom { hashed_id: "abc".into(), name: "x".into() }).await;
        assert!(matches!(dup, Err(AppErr::Db(_))));
    }

    #[tokio::test]
    async fn update_writes_only_present_fields() {
        let s = store().await;
        let r = room(&s, "abc").await;
        let updated = s
            .update_room(r.id, RoomPatch { is_open: Some(true), ..Default::default() })
            .await
            .unwrap();
        assert!(updated.is_open);
        assert_eq!(updated.name, "Chat A");
        assert!(updated.updated_at >= r.updated_at);

        let missing = s.update_room(999, RoomPatch::default()).await;
        assert!(matches!(missing, Err(AppErr::NotFound)));
    }

    #[tokio::test]
    async fn posts_come_back_in_order_and_detach_keeps_rows() {
        let s = store().await;
        let a = room(&s, "a").await;
        let b = room(&s, "b").await;
        s.insert_post(new_post(a.id, "hi")).await.unwrap();
        s.insert_post(new_post(b.id, "elsewhere")).await.unwrap();
        s.insert_post(new_post(a.id, "there")).await.unwrap();

        let posts = s.list_posts(a.id).await.unwrap();
        let comments: Vec<_> = posts.iter().map(|p| p.comment.as_str()).collect();
        assert_eq!(comments, ["hi", "there"]);

        let detached = s.detach_posts(a.id).await.unwrap();
        assert_eq!(detached.ids, posts.iter().map(|p| p.id).collect::<Vec<_>>());
        assert!(s.list_posts(a.id).await.unwrap().is_empty());
        assert_eq!(s.list_posts(b.id).await.unwrap().len(), 1);

        let (orphans,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE room_id IS NULL")
            .fetch_one(&s.pool)
            .await
            .unwrap();
        assert_eq!(orphans, 2);
    }

    #[tokio::test]
    async fn detaching_an_empty_room_detaches_nothing() {
        let s = store().await;
        let r = room(&s, "abc").await;
        let detached = s.detach_posts(r.id).await.unwrap();
        assert_eq!(detached, Detached::default());
        assert_eq!(detached.count(), 0);

        s.insert_post(new_post(r.id, "after")).await.unwrap();
        assert_eq!(s.list_posts(r.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writes_feed_the_hub() {
        let hub = Hub::new();
        let s = store().await.with_change_feed(hub.clone());
        let r = room(&s, "abc").await;
        let mut sub = hub
            .channel("room:abc")
            .on_change(ChangeKind::Insert, "posts", Filter::eq("room_id", r.id))
            .on_change(ChangeKind::Update, "rooms", Filter::eq("hashed_id", "abc"))
            .subscribe()
            .unwrap();

        s.insert_post(new_post(r.id, "hi")).await.unwrap();
        s.update_room(r.id, RoomPatch { name: Some("Chat B".into()), ..Default::default() })
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
                Ok(Some(ChannelEvent::Change(c))) => seen.push((c.table, c.kind)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            seen,
            [("posts".to_string(), ChangeKind::Insert), ("rooms".to_string(), ChangeKind::Update)]
        );
    }
}
