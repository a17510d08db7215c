use std::collections::HashSet;

use crate::model::{Post, Room, RoomPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Fetching,
    Subscribing,
    Subscribed,
    /// Snapshot is loaded but no live updates arrive.
    Offline,
    NotFound,
    TornDown,
}

/// In-memory snapshot of one room: metadata, ordered posts, connection status.
#[derive(Debug, Default)]
pub struct RoomStateStore {
    room:          Option<Room>,
    posts:         Vec<Post>,
    ids:           HashSet<i64>,
    /// Posts known to have left the room; their inserts are never applied again.
    detached:      HashSet<i64>,
    status:        SyncStatus,
}

impl RoomStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SyncStatus) {
        self.status = status;
    }

    /// Replaces the snapshot with a fetch result. `None` marks the room as not found.
    ///
    /// Re-seeding the same room keeps whichever metadata carries the later
    /// `updated_at`, and drops fetched posts already known to be detached.
    pub fn seed(&mut self, room: Option<Room>, posts: Vec<Post>) {
        let Some(mut room) = room else {
            self.room = None;
            self.clear_posts();
            self.status = SyncStatus::NotFound;
            return;
        };

        match self.room.take() {
            Some(current) if current.id == room.id && current.updated_at > room.updated_at => {
                room = current;
            }
            Some(current) if current.id != room.id => self.detached.clear(),
            _ => {}
        }
        self.room = Some(room);

        self.clear_posts();
        for post in posts {
            self.apply_post_inserted(post);
        }
    }

    /// Adds a post at its `(created_at, id)` position unless already present.
    pub fn apply_post_inserted(&mut self, post: Post) -> bool {
        if self.ids.contains(&post.id) {
            return false;
        }
        if self.detached.contains(&post.id) {
            return false;
        }
        let key = post.sort_key();
        let at = self.posts.partition_point(|p| p.sort_key() < key);
        self.ids.insert(post.id);
        self.posts.insert(at, post);
        true
    }

    /// A post left this room through a soft-clear.
    pub fn apply_post_detached(&mut self, id: i64) -> bool {
        self.detached.insert(id);
        if !self.ids.remove(&id) {
            return false;
        }
        self.posts.retain(|p| p.id != id);
        true
    }

    /// Merges the present fields unless the patch is older than what we hold.
    pub fn apply_room_updated(&mut self, patch: &RoomPatch) -> bool {
        let Some(room) = self.room.as_mut() else { return false };
        if patch.updated_at.is_some_and(|at| at < room.updated_at) {
            return false;
        }
        room.merge(patch)
    }

    /// Drops the posts a reset detached. Ids not seen yet are remembered so a
    /// late insert for them stays out; anything else is left alone.
    pub fn apply_reset(&mut self, detached: &[i64]) -> bool {
        let before = self.posts.len();
        self.detached.extend(detached.iter().copied());
        for id in detached {
            self.ids.remove(id);
        }
        self.posts.retain(|p| !self.detached.contains(&p.id));
        self.posts.len() != before
    }

    fn clear_posts(&mut self) {
        self.posts.clear();
        self.ids.clear();
    }
}
