use axum::{http::StatusCode, response::IntoResponse};
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppErr>;

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("room not found")]
    NotFound,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("password does not match")]
    Denied,

    #[error("DB: {0}")]
    Db(#[from] sqlx::Error),

    #[error("realtime: {0}")]
    Bus(String),


    #[error("config: {0}")]
    Config(String),
}

impl AppErr {
    /// Stable tag sent to viewers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            AppErr::NotFound   => "not_found",
            AppErr::Invalid(_) => "invalid",
            AppErr::Denied     => "denied",
            AppErr::Db(_)      => "store",
            AppErr::Bus(_)     => "realtime",
            AppErr::Config(_)  => "config",
        }
    }
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let (code, body) = match self {
            AppErr::NotFound       => (StatusCode::NOT_FOUND, AppErr::NotFound.to_string()),
            AppErr::Invalid(msg)   => (StatusCode::BAD_REQUEST, msg),
            AppErr::Denied         => (StatusCode::FORBIDDEN, AppErr::Denied.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "something went wrong".to_string())
            }
        };
        (code, body).into_response()
    }
}

/* ── helpers: turn anything displayable into Invalid / Bus ── */
pub fn invalid<E: Display>(e: E) -> AppErr { AppErr::Invalid(e.to_string()) }
pub fn bus<E: Display>(e: E) -> AppErr { AppErr::Bus(e.to_string()) }
