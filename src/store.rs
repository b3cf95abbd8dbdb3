use std::{
    fs,
    path::{Path, PathBuf},
};

use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::types::Database;

/// File-backed conversation store. The whole document lives in memory behind a
/// single lock; every mutation is lock -> modify -> rewrite-file -> unlock, so
/// no two logical operations can interleave mid-update.
pub struct Store {
    path: PathBuf,
    db: Mutex<Database>,
}

impl Store {
    /// Loads the durable file, creating it with the default structure when it
    /// is missing. An unreadable or unparsable file is discarded and
    /// reinitialized rather than crashing the server.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let db = load_or_init(&path);
        Self {
            path,
            db: Mutex::new(db),
        }
    }

    pub async fn read<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        let db = self.db.lock().await;
        f(&db)
    }

    /// Applies a mutation and rewrites the file wholesale before releasing the
    /// lock. A failed write is logged; the in-memory state stays authoritative
    /// until the next successful rewrite.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Database) -> T) -> T {
        let mut db = self.db.lock().await;
        let result = f(&mut db);
        persist(&self.path, &db);
        result
    }
}

fn load_or_init(path: &Path) -> Database {
    if !path.exists() {
        let db = Database::initial();
        persist(path, &db);
        return db;
    }

    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Database>(&raw) {
            Ok(db) => db,
            Err(err) => {
                warn!(path = %path.display(), %err, "durable store unparsable, reinitializing");
                let db = Database::initial();
                persist(path, &db);
                db
            }
        },
        Err(err) => {
            warn!(path = %path.display(), %err, "durable store unreadable, reinitializing");
            let db = Database::initial();
            persist(path, &db);
            db
        }
    }
}

fn persist(path: &Path, db: &Database) {
    let Ok(raw) = serde_json::to_string_pretty(db) else {
        error!(path = %path.display(), "failed to serialize durable store");
        return;
    };
    if let Err(err) = fs::write(path, raw) {
        error!(path = %path.display(), %err, "failed to rewrite durable store");
    }
}
