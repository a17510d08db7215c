use axum::{http::StatusCode, routing::post, Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppResult,
    model::{validate_room_name, NewRoom},
    state::AppState,
    utils::digest::room_hashed_id,
};

#[derive(Deserialize)]
pub struct CreateRoom {
    name: String,
}

#[derive(Serialize)]
pub struct CreatedRoom {
    hashed_id: String,
    url:       String,
}

pub fn router() -> Router {
    Router::new().route("/rooms", post(create_room))
}

/* ---------------- create ---------------- */
async fn create_room(
    Extension(app): Extension<AppState>,
    Json(p): Json<CreateRoom>,
) -> AppResult<(StatusCode, Json<CreatedRoom>)> {
    let name = validate_room_name(&p.name)?;
    let room = app
        .store
        .insert_room(NewRoom { hashed_id: room_hashed_id(), name })
        .await?;
    tracing::info!(room_id = room.id, "room created");

    let url = format!("/room/{}", room.hashed_id);
    Ok((StatusCode::CREATED, Json(CreatedRoom { hashed_id: room.hashed_id, url })))
}
