use chrono::{DateTime, Utc};
use serde::Serialize;

use super::store::{RoomStateStore, SyncStatus};

/// Shown instead of each line of a hidden comment.
pub const MASK_LINE: &str = "no peeking!";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomView {
    pub hashed_id:    String,
    pub name:         String,
    pub has_password: bool,
    pub revealed:     bool,
    pub status:       SyncStatus,
    pub typing:       usize,
    pub posts:        Vec<PostView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostView {
    pub number:     usize,
    pub name:       String,
    pub color:      String,
    pub created_at: DateTime<Utc>,
    pub lines:      Vec<String>,
    pub hidden:     bool,
}

/// Projects the snapshot for a viewer. Digests never appear, and neither do
/// hidden comments.
pub fn render(state: &RoomStateStore, typing: usize) -> Option<RoomView> {
    let room = state.room()?;
    let revealed = room.is_open || !room.has_password();

    let posts = state
        .posts()
        .iter()
        .enumerate()
        .map(|(i, p)| PostView {
            number:     i + 1,
            name:       p.display_name().to_string(),
            color:      p.color.clone(),
            created_at: p.created_at,
            lines:      p
                .comment
                .split('\n')
                .map(|line| if revealed { line.to_string() } else { MASK_LINE.to_string() })
                .collect(),
            hidden:     !revealed,
        })
        .collect();

    Some(RoomView {
        hashed_id: room.hashed_id.clone(),
        name: room.name.clone(),
        has_password: room.has_password(),
        revealed,
        status: state.status(),
        typing,
        posts,
    })
}
