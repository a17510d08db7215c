use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path,
    },
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{invalid, AppErr, AppResult},
    model::PostDraft,
    state::AppState,
    sync::{RoomSyncSession, SessionUpdate},
};

type Tx = SplitSink<WebSocket, Message>;

/// What a viewer can ask for over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCmd {
    Post {
        #[serde(default)]
        name:    Option<String>,
        comment: String,
    },
    Typing,
    SetPassword { password: String },
    Rename { name: String },
    Toggle {
        open: bool,
        #[serde(default)]
        password: Option<String>,
    },
    Reset { password: String },
}

enum Reply {
    Quiet,
    Ack(&'static str),
    View,
}

pub fn router() -> Router {
    Router::new().route("/room/:hashed_id", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(hashed_id): Path<String>,
    Extension(app): Extension<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |s| viewer_ws(s, hashed_id, app))
}

/* ---------------- per viewer ---------------- */
async fn viewer_ws(sock: WebSocket, hashed_id: String, app: AppState) {
    let (mut tx, mut rx) = sock.split();
    let mut session = app.session();

    if let Err(e) = session.enter(&hashed_id).await {
        let frame = match e {
            AppErr::NotFound => json!({ "type": "not_found" }),
            other            => error_frame(&other),
        };
        send(&mut tx, frame).await.ok();
        return;
    }
    if send_view(&mut tx, &session).await.is_err() {
        return;
    }

    let mut updates = true;
    loop {
        let sent = tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(raw))) => match handle_cmd(&mut session, &raw).await {
                    Ok(Reply::Quiet)   => Ok(()),
                    Ok(Reply::Ack(a))  => send(&mut tx, json!({ "type": "ack", "action": a })).await,
                    Ok(Reply::View)    => send_view(&mut tx, &session).await,
                    Err(e)             => send(&mut tx, error_frame(&e)).await,
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => Ok(()),
            },
            update = session.next_update(), if updates => match update {
                Some(SessionUpdate::Typing(n)) => send(&mut tx, json!({ "type": "typing", "count": n })).await,
                Some(SessionUpdate::PasswordChanged) => {
                    match send(&mut tx, json!({ "type": "notice", "notice": "password_changed" })).await {
                        Ok(()) => send_view(&mut tx, &session).await,
                        err    => err,
                    }
                }
                Some(_) => send_view(&mut tx, &session).await,
                None => { updates = false; Ok(()) }
            },
        };
        if sent.is_err() {
            break;
        }
    }

    session.teardown();
    tracing::debug!(%hashed_id, "viewer left");
}

async fn handle_cmd(session: &mut RoomSyncSession, raw: &str) -> AppResult<Reply> {
    let cmd: ClientCmd = serde_json::from_str(raw).map_err(invalid)?;
    match cmd {
        ClientCmd::Post { name, comment } => {
            session.submit_post(&PostDraft { name, comment }).await?;
            Ok(Reply::Ack("post"))
        }
        ClientCmd::Typing => {
            session.keystroke();
            Ok(Reply::Quiet)
        }
        ClientCmd::SetPassword { password } => {
            session.set_password(&password).await?;
            Ok(Reply::Ack("set_password"))
        }
        ClientCmd::Rename { name } => {
            session.rename(&name).await?;
            Ok(Reply::View)
        }
        ClientCmd::Toggle { open, password } => {
            session.toggle_visibility(open, password.as_deref()).await?;
            Ok(Reply::Ack("toggle"))
        }
        ClientCmd::Reset { password } => {
            session.reset(&password).await?;
            Ok(Reply::View)
        }
    }
}

fn error_frame(e: &AppErr) -> Value {
    let message = match e {
        AppErr::NotFound | AppErr::Invalid(_) | AppErr::Denied => e.to_string(),
        _ => "something went wrong, please try again".to_string(),
    };
    json!({ "type": "error", "kind": e.kind(), "message": message })
}

async fn send_view(tx: &mut Tx, session: &RoomSyncSession) -> Result<(), axum::Error> {
    match session.view() {
        Some(view) => send(tx, json!({ "type": "room", "room": view })).await,
        None       => send(tx, json!({ "type": "not_found" })).await,
    }
}

async fn send(tx: &mut Tx, frame: Value) -> Result<(), axum::Error> {
    tx.send(Message::Text(frame.to_string())).await
}
