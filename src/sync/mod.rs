//! Room realtime-synchronization core.

pub mod color;
pub mod gate;
pub mod presence;
pub mod session;
pub mod store;
pub mod view;

pub use color::ColorAllocator;
pub use gate::PasswordGate;
pub use presence::{PresenceState, PresenceTracker};
pub use session::{RoomSyncSession, SessionUpdate};
pub use store::{RoomStateStore, SyncStatus};
pub use view::RoomView;
