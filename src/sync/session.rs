use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use crate::{
    config::SyncConfig,
    db::{BoardStore, Detached},
    error::{AppErr, AppResult},
    model::{validate_room_name, NewPost, Post, PostDraft, Room, RoomPatch},
    realtime::{ChangeKind, ChannelEvent, Filter, Hub, Subscription},
};

use super::{
    color::ColorAllocator,
    gate::PasswordGate,
    presence::{PresenceState, PresenceTracker},
    store::{RoomStateStore, SyncStatus},
    view::{render, RoomView},
};

pub const RESET_EVENT: &str = "reset";

pub fn topic_for(hashed_id: &str) -> String {
    format!("room:{hashed_id}")
}

/// What changed for the viewer after one step of [`RoomSyncSession::next_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Room,
    Posts,
    Typing(usize),
    /// Someone changed the room password; the reveal state was closed with it.
    PasswordChanged,
    Status(SyncStatus),
}

enum Woke {
    Event(Option<ChannelEvent>),
    Idle,
}

/// One viewer's live view of one room.
///
/// `Idle → Fetching → Subscribing → Subscribed → TornDown`, with `NotFound`
/// as the terminal state of a failed lookup and `Offline` when the snapshot
/// loaded but the channel did not.
pub struct RoomSyncSession {
    store:     Arc<dyn BoardStore>,
    hub:       Hub,
    cfg:       SyncConfig,
    hashed_id: Option<String>,
    state:     RoomStateStore,
    colors:    ColorAllocator,
    presence:  PresenceTracker,
    sub:       Option<Subscription>,
    resync:    bool,
}

impl RoomSyncSession {
    pub fn new(store: Arc<dyn BoardStore>, hub: Hub, cfg: SyncConfig) -> Self {
        let presence = PresenceTracker::new(uuid::Uuid::new_v4().to_string(), cfg.typing_idle);
        Self {
            store,
            hub,
            cfg,
            hashed_id: None,
            state: RoomStateStore::new(),
            colors: ColorAllocator::new(),
            presence,
            sub: None,
            resync: false,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status()
    }

    pub fn state(&self) -> &RoomStateStore {
        &self.state
    }

    pub fn hashed_id(&self) -> Option<&str> {
        self.hashed_id.as_deref()
    }

    pub fn presence_key(&self) -> &str {
        self.presence.key()
    }

    pub fn typing_count(&self) -> usize {
        self.presence.typing_count()
    }

    pub fn is_typing(&self) -> bool {
        self.presence.is_typing()
    }

    pub fn view(&self) -> Option<RoomView> {
        render(&self.state, self.presence.typing_count())
    }

    /* ------------ lifecycle ------------ */

    /// Starts a fresh cycle for `hashed_id`, tearing down whatever came before.
    pub async fn enter(&mut self, hashed_id: &str) -> AppResult<()> {
        self.teardown();
        self.state = RoomStateStore::new();
        self.colors = ColorAllocator::new();
        self.presence = PresenceTracker::new(uuid::Uuid::new_v4().to_string(), self.cfg.typing_idle);
        self.hashed_id = Some(hashed_id.to_string());
        self.resync = false;

        self.state.set_status(SyncStatus::Fetching);
        let room = match self.store.find_room(hashed_id).await {
            Ok(Some(room)) => room,
            Ok(None) => return Err(self.not_found(AppErr::NotFound)),
            Err(e)   => return Err(self.not_found(e)),
        };

        // the channel opens before the snapshot is read so nothing written in between is missed
        self.state.set_status(SyncStatus::Subscribing);
        self.sub = match self.open_channel(&room) {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(%hashed_id, error = %e, "subscribe failed; continuing without live updates");
                None
            }
        };

        match tokio::try_join!(self.store.find_room(hashed_id), self.store.list_posts(room.id)) {
            Ok((Some(room), posts)) => self.state.seed(Some(room), posts),
            Ok((None, _)) => return Err(self.not_found(AppErr::NotFound)),
            Err(e)        => return Err(self.not_found(e)),
        }

        let status = match self.sub.as_mut().map(|s| s.track(&PresenceState::default())) {
            Some(Ok(())) => SyncStatus::Subscribed,
            Some(Err(e)) => {
                tracing::warn!(%hashed_id, error = %e, "presence track failed");
                self.close_channel();
                SyncStatus::Offline
            }
            None => SyncStatus::Offline,
        };
        self.state.set_status(status);
        tracing::info!(%hashed_id, posts = self.state.posts().len(), ?status, "room entered");
        Ok(())
    }

    /// Cancels the idle timer, untracks presence and closes the channel.
    /// Safe to call any number of times.
    pub fn teardown(&mut self) {
        self.presence.force_idle();
        self.close_channel();
        if !matches!(self.state.status(), SyncStatus::Idle | SyncStatus::NotFound) {
            self.state.set_status(SyncStatus::TornDown);
        }
    }

    fn not_found(&mut self, err: AppErr) -> AppErr {
        match &err {
            AppErr::NotFound => tracing::info!(hashed_id = ?self.hashed_id, "room not found"),
            other => tracing::warn!(hashed_id = ?self.hashed_id, error = %other, "room fetch failed"),
        }
        self.close_channel();
        self.state.seed(None, Vec::new());
        err
    }

    fn open_channel(&self, room: &Room) -> AppResult<Subscription> {
        self.hub
            .channel(&topic_for(&room.hashed_id))
            .presence_key(self.presence.key())
            .on_change(ChangeKind::Insert, &self.cfg.posts_table, Filter::eq("room_id", room.id))
            .on_change(ChangeKind::Update, &self.cfg.posts_table, Filter::eq("room_id", room.id))
            .on_change(ChangeKind::Update, &self.cfg.rooms_table, Filter::eq("hashed_id", room.hashed_id.as_str()))
            .on_broadcast(RESET_EVENT)
            .subscribe()
    }

    fn close_channel(&mut self) {
        if let Some(mut sub) = self.sub.take() {
            sub.untrack();
            sub.close();
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state.status(), SyncStatus::Subscribed | SyncStatus::Offline)
    }

    /* ------------ incoming ------------ */

    /// Waits for the next change worth re-rendering. `None` once torn down or
    /// when nothing can arrive any more.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if !self.is_live() {
                return None;
            }
            // stays set until a refetch lands; cancelled or failed ones retry on the next wake
            if self.resync {
                if let Some(update) = self.refetch().await {
                    self.resync = false;
                    return Some(update);
                }
            }
            let deadline = self.presence.deadline();
            if self.sub.is_none() && deadline.is_none() {
                return None;
            }

            let woke = {
                let sub = self.sub.as_mut();
                tokio::select! {
                    ev = recv_from(sub)     => Woke::Event(ev),
                    _  = sleep_opt(deadline) => Woke::Idle,
                }
            };

            match woke {
                Woke::Idle => {
                    if let Some(state) = self.presence.expire(Instant::now()) {
                        self.publish_presence(state);
                    }
                }
                Woke::Event(None) => {
                    tracing::warn!(hashed_id = ?self.hashed_id, "channel closed under us");
                    self.sub = None;
                    self.state.set_status(SyncStatus::Offline);
                    return Some(SessionUpdate::Status(SyncStatus::Offline));
                }
                Woke::Event(Some(ev)) => {
                    if let Some(update) = self.dispatch(ev) {
                        return Some(update);
                    }
                }
            }
        }
    }

    /// Applies one channel event to the snapshot. No-op outside a live session.
    pub fn dispatch(&mut self, ev: ChannelEvent) -> Option<SessionUpdate> {
        if !self.is_live() {
            return None;
        }
        let room_id = self.state.room()?.id;

        match ev {
            ChannelEvent::Change(change) if change.table == self.cfg.posts_table => {
                let post: Post = match serde_json::from_value(change.new?) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable post change");
                        return None;
                    }
                };
                let changed = match (change.kind, post.room_id == Some(room_id)) {
                    (ChangeKind::Insert, true) => self.state.apply_post_inserted(post),
                    (_, false)                 => self.state.apply_post_detached(post.id),
                    _                          => false,
                };
                changed.then_some(SessionUpdate::Posts)
            }
            ChannelEvent::Change(change) if change.table == self.cfg.rooms_table => {
                let patch = match RoomPatch::from_row(change.new.as_ref()?) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable room change");
                        return None;
                    }
                };
                let before = self.state.room()?.password_hash.clone();
                if !self.state.apply_room_updated(&patch) {
                    return None;
                }
                if self.state.room()?.password_hash != before {
                    Some(SessionUpdate::PasswordChanged)
                } else {
                    Some(SessionUpdate::Room)
                }
            }
            ChannelEvent::Change(_) => None,
            ChannelEvent::Broadcast { event, payload } if event == RESET_EVENT => {
                let ids: Vec<i64> = match payload.get("ids").cloned().map(serde_json::from_value) {
                    Some(Ok(ids)) => ids,
                    other => {
                        tracing::warn!(?other, "undecodable reset payload");
                        return None;
                    }
                };
                self.state.apply_reset(&ids).then_some(SessionUpdate::Posts)
            }
            ChannelEvent::Broadcast { .. } => None,
            ChannelEvent::PresenceSync(snapshot) => self.presence.sync(&snapshot).map(SessionUpdate::Typing),
            ChannelEvent::Lagged(n) => {
                tracing::warn!(hashed_id = ?self.hashed_id, missed = n, "receiver lagged; refetching");
                self.resync = true;
                None
            }
        }
    }

    async fn refetch(&mut self) -> Option<SessionUpdate> {
        let room_id = self.state.room()?.id;
        let hashed_id = self.hashed_id.clone()?;
        match tokio::try_join!(self.store.find_room(&hashed_id), self.store.list_posts(room_id)) {
            Ok((Some(room), posts)) => {
                self.state.seed(Some(room), posts);
                // presence snapshots may have been dropped with the rest
                self.presence.sync(&self.hub.presence(&topic_for(&hashed_id)));
                Some(SessionUpdate::Room)
            }
            Ok((None, _)) => {
                tracing::warn!(%hashed_id, "room vanished during resync");
                None
            }
            Err(e) => {
                tracing::warn!(%hashed_id, error = %e, "resync failed");
                None
            }
        }
    }

    /* ------------ outgoing ------------ */

    fn live_room(&self) -> AppResult<&Room> {
        if !self.is_live() {
            return Err(AppErr::NotFound);
        }
        self.state.room().ok_or(AppErr::NotFound)
    }

    fn publish_presence(&mut self, state: PresenceState) {
        if let Some(sub) = self.sub.as_mut() {
            if let Err(e) = sub.track(&state) {
                tracing::warn!(error = %e, "presence update dropped");
            }
        }
    }

    /// A keystroke in the post form.
    pub fn keystroke(&mut self) {
        if self.sub.is_none() {
            return;
        }
        if let Some(state) = self.presence.keystroke(Instant::now()) {
            self.publish_presence(state);
        }
    }

    /// Writes a post tagged with this session's next color. The post shows up
    /// through its insert notification.
    pub async fn submit_post(&mut self, draft: &PostDraft) -> AppResult<Post> {
        let room_id = self.live_room()?.id;
        let (name, comment) = draft.validate()?;
        if let Some(state) = self.presence.force_idle() {
            self.publish_presence(state);
        }

        let color = self.colors.next().to_string();
        let post = self.store.insert_post(NewPost { room_id, name, comment, color }).await?;
        tracing::debug!(room_id, post_id = post.id, "post written");
        Ok(post)
    }

    pub async fn set_password(&mut self, plaintext: &str) -> AppResult<()> {
        let room_id = self.live_room()?.id;
        let mut gate = PasswordGate::for_room(self.live_room()?);
        gate.set_secret(plaintext)?;

        let patch = RoomPatch {
            password_hash:       Some(gate.digest().map(str::to_owned)),
            password_updated_at: Some(gate.updated_at()),
            is_open:             Some(false),
            ..Default::default()
        };
        self.store.update_room(room_id, patch).await?;
        Ok(())
    }

    /// Renames the room and shows the new name right away.
    pub async fn rename(&mut self, name: &str) -> AppResult<()> {
        let room_id = self.live_room()?.id;
        let name = validate_room_name(name)?;

        let updated = self
            .store
            .update_room(room_id, RoomPatch { name: Some(name), ..Default::default() })
            .await?;
        self.state.apply_room_updated(&RoomPatch {
            name:       Some(updated.name),
            updated_at: Some(updated.updated_at),
            ..Default::default()
        });
        Ok(())
    }

    /// Opens (with the secret, if one is set) or closes the comments for everyone.
    pub async fn toggle_visibility(&mut self, requested_open: bool, plaintext: Option<&str>) -> AppResult<bool> {
        let room = self.live_room()?;
        let room_id = room.id;
        let open = PasswordGate::for_room(room).toggle_visibility(requested_open, plaintext)?;

        self.store
            .update_room(room_id, RoomPatch { is_open: Some(open), ..Default::default() })
            .await?;
        Ok(open)
    }

    /// Detaches every post from the room, tells the other viewers, clears locally.
    pub async fn reset(&mut self, plaintext: &str) -> AppResult<Detached> {
        let room = self.live_room()?;
        let room_id = room.id;
        PasswordGate::for_room(room).authorize_destructive(plaintext)?;

        let detached = self.store.detach_posts(room_id).await?;
        if let Some(sub) = &self.sub {
            if let Err(e) = sub.send_broadcast(RESET_EVENT, json!({ "ids": detached.ids })) {
                tracing::warn!(room_id, error = %e, "reset broadcast failed");
            }
        }
        self.state.apply_reset(&detached.ids);
        Ok(detached)
    }
}

impl Drop for RoomSyncSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn recv_from(sub: Option<&mut Subscription>) -> Option<ChannelEvent> {
    match sub {
        Some(sub) => sub.recv().await,
        None      => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None     => std::future::pending().await,
    }
}
