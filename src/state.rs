use std::sync::Arc;

use crate::{
    config::SyncConfig,
    db::BoardStore,
    realtime::Hub,
    sync::RoomSyncSession,
};

/* ------------ shared by every request ------------ */
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BoardStore>,
    pub hub:   Hub,
    pub sync:  SyncConfig,
}

impl AppState {
    /// A fresh, idle session for one viewer.
    pub fn session(&self) -> RoomSyncSession {
        RoomSyncSession::new(self.store.clone(), self.hub.clone(), self.sync.clone())
    }
}
