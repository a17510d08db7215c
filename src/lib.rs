pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod sync;
pub mod utils {
    pub mod digest;
}
