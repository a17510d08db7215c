use std::{env, path::PathBuf, time::Duration};

use crate::error::{AppErr, AppResult};

/* ------------ process config (env / .env) ------------ */
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr:    String,
    pub static_dir:   PathBuf,
    pub body_limit:   usize,
    pub sync:         SyncConfig,
}

/* ------------ what a room session needs ------------ */
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub rooms_table: String,
    pub posts_table: String,
    pub typing_idle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rooms_table: "rooms".into(),
            posts_table: "posts".into(),
            typing_idle: Duration::from_millis(3_000),
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            rooms_table: table_name(get("ROOMS_TABLE").unwrap_or(defaults.rooms_table))?,
            posts_table: table_name(get("POSTS_TABLE").unwrap_or(defaults.posts_table))?,
            typing_idle: match get("TYPING_IDLE_MS") {
                Some(ms) => Duration::from_millis(number("TYPING_IDLE_MS", &ms)?),
                None     => defaults.typing_idle,
            },
        };
        if sync.rooms_table == sync.posts_table {
            return Err(AppErr::Config("ROOMS_TABLE and POSTS_TABLE must differ".into()));
        }

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://board.db?mode=rwc".into()),
            bind_addr:    get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            static_dir:   get("STATIC_DIR").unwrap_or_else(|| "static".into()).into(),
            body_limit:   match get("BODY_LIMIT") {
                Some(n) => number("BODY_LIMIT", &n)? as usize,
                None    => 64 * 1024,
            },
            sync,
        })
    }
}

fn number(key: &str, raw: &str) -> AppResult<u64> {
    raw.trim()
        .parse()
        .map_err(|_| AppErr::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

/// Table names are spliced into SQL, so only plain identifiers are accepted.
fn table_name(name: String) -> AppResult<String> {
    let mut chars = name.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(AppErr::Config(format!("invalid table name {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> AppResult<Config> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:3000");
        assert_eq!(cfg.sync.rooms_table, "rooms");
        assert_eq!(cfg.sync.posts_table, "posts");
        assert_eq!(cfg.sync.typing_idle, Duration::from_secs(3));
    }

    #[test]
    fn reads_overrides() {
        let cfg = load(&[("POSTS_TABLE", "board_posts"), ("TYPING_IDLE_MS", "1500")]).unwrap();
        assert_eq!(cfg.sync.posts_table, "board_posts");
        assert_eq!(cfg.sync.typing_idle, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_sql_in_table_names() {
        assert!(matches!(load(&[("ROOMS_TABLE", "rooms; drop")]), Err(AppErr::Config(_))));
        assert!(matches!(load(&[("POSTS_TABLE", "1posts")]), Err(AppErr::Config(_))));
        assert!(matches!(load(&[("POSTS_TABLE", "rooms")]), Err(AppErr::Config(_))));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(load(&[("TYPING_IDLE_MS", "soon")]).is_err());
    }
}
