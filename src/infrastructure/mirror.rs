use crate::domain::models::Ledger;
use crate::infrastructure::error::InfraError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// Fast, device-local cache of a user's ledger. Reads may be stale relative
// to the durable store; an unparsable payload loads as absent rather than
// an error.
pub trait LedgerMirror: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<Ledger>, InfraError>;
    fn save(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError>;
    fn remove(&self, user_id: &str) -> Result<(), InfraError>;
}

fn mirror_key(user_id: &str) -> String {
    format!("timeTracking_{user_id}")
}

const MIRROR_SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

pub fn initialize_mirror_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(MIRROR_SCHEMA_SQL)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteLedgerMirror {
    db_path: PathBuf,
}

impl SqliteLedgerMirror {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

impl LedgerMirror for SqliteLedgerMirror {
    fn load(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
        let connection = self.connect()?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT payload FROM ledger_mirror WHERE mirror_key = ?1",
                params![mirror_key(user_id)],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<Ledger>(&payload) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(error) => {
                log::warn!(
                    "discarding corrupt ledger mirror payload for user {user_id}: {error}"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
        let payload = serde_json::to_string(ledger)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO ledger_mirror (mirror_key, payload, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(mirror_key) DO UPDATE SET
               payload = excluded.payload,
               updated_at = excluded.updated_at",
            params![mirror_key(user_id), payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM ledger_mirror WHERE mirror_key = ?1",
            params![mirror_key(user_id)],
        )?;
        Ok(())
    }
}

// Stores the JSON payload rather than the value so corrupt-payload
// behavior can be exercised the same way as with SQLite.
#[derive(Debug, Default)]
pub struct InMemoryLedgerMirror {
    payloads: Mutex<HashMap<String, String>>,
}

impl InMemoryLedgerMirror {
    pub fn seed_raw(&self, user_id: &str, payload: &str) -> Result<(), InfraError> {
        let mut payloads = self.lock()?;
        payloads.insert(mirror_key(user_id), payload.to_string());
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, InfraError> {
        self.payloads
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("mirror lock poisoned: {error}")))
    }
}

impl LedgerMirror for InMemoryLedgerMirror {
    fn load(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
        let payloads = self.lock()?;
        let Some(payload) = payloads.get(&mirror_key(user_id)) else {
            return Ok(None);
        };
        match serde_json::from_str::<Ledger>(payload) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(error) => {
                log::warn!(
                    "discarding corrupt ledger mirror payload for user {user_id}: {error}"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
        let payload = serde_json::to_string(ledger)?;
        let mut payloads = self.lock()?;
        payloads.insert(mirror_key(user_id), payload);
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<(), InfraError> {
        let mut payloads = self.lock()?;
        payloads.remove(&mirror_key(user_id));
        Ok(())
    }
}
