use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::ShiftCache;
use crate::jobs::ReconcileQueue;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub shift_cache: ShiftCache,
    pub queue: Option<ReconcileQueue>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            shift_cache: ShiftCache::default(),
            queue: None,
        }
    }
}
