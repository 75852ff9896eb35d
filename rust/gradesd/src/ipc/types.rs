use std::path::PathBuf;
use std::rc::Rc;

use serde::Deserialize;

use crate::autosave::SystemClock;
use crate::config::Config;
use crate::db::SqliteStore;
use crate::session::GradeEntrySession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<SqliteStore>,
    /// At most one open evaluation at a time.
    pub session: Option<GradeEntrySession>,
    pub config: Config,
    pub clock: Rc<SystemClock>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        AppState {
            workspace: None,
            store: None,
            session: None,
            config,
            clock: Rc::new(SystemClock::new()),
        }
    }
}
