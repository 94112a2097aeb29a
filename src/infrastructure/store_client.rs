use crate::domain::models::{EntryDelta, Ledger};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

// Authoritative backing store for per-user ledger documents. `apply_deltas`
// is the hot write path and merges additively, so concurrent sessions
// combine instead of last-writer-wins; `put` replaces the whole document
// and is reserved for reconciliation writes.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Ledger>, InfraError>;
    async fn apply_deltas(&self, user_id: &str, deltas: &[EntryDelta]) -> Result<(), InfraError>;
    async fn put(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct HttpLedgerStore {
    client: Client,
    base_url: String,
    collection: String,
}

#[derive(Debug, Serialize)]
struct ApplyDeltasRequest<'a> {
    deltas: &'a [EntryDelta],
}

impl HttpLedgerStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            collection: collection.into(),
        }
    }

    fn document_endpoint(&self, user_id: &str) -> Result<Url, InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::Store("user id must not be empty".to_string()));
        }
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| InfraError::Store(format!("invalid ledger api base url: {error}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::Store("ledger api base URL cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.push(&self.collection);
            segments.push(user_id);
        }
        Ok(url)
    }

    fn deltas_endpoint(&self, user_id: &str) -> Result<Url, InfraError> {
        let mut url = self.document_endpoint(user_id)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::Store("ledger document URL cannot be a base".to_string()))?;
            segments.push("deltas");
        }
        Ok(url)
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("ledger api error: http {}", status.as_u16())
        } else {
            format!("ledger api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Store(message)
    }

    fn transport_error(context: &str, error: reqwest::Error) -> InfraError {
        InfraError::Store(format!("network error while {context}: {error}"))
    }
}

#[async_trait]
impl LedgerStore for HttpLedgerStore {
    async fn get(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
        let url = self.document_endpoint(user_id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| Self::transport_error("reading ledger document", error))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::http_error(status, &body));
        }

        let ledger = response
            .json::<Ledger>()
            .await
            .map_err(|error| Self::transport_error("decoding ledger document", error))?;
        Ok(Some(ledger))
    }

    async fn apply_deltas(&self, user_id: &str, deltas: &[EntryDelta]) -> Result<(), InfraError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let url = self.deltas_endpoint(user_id)?;
        let response = self
            .client
            .post(url)
            .json(&ApplyDeltasRequest { deltas })
            .send()
            .await
            .map_err(|error| Self::transport_error("applying ledger deltas", error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn put(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
        let url = self.document_endpoint(user_id)?;
        let response = self
            .client
            .put(url)
            .json(ledger)
            .send()
            .await
            .map_err(|error| Self::transport_error("writing ledger document", error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}

// Applies deltas with the same additive-merge semantics the HTTP backend
// is expected to implement; derived fields are left for readers.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    documents: Mutex<HashMap<String, Ledger>>,
}

impl InMemoryLedgerStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Ledger>>, InfraError> {
        self.documents
            .lock()
            .map_err(|error| InfraError::Store(format!("store lock poisoned: {error}")))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
        let documents = self.lock()?;
        Ok(documents.get(user_id).cloned())
    }

    async fn apply_deltas(&self, user_id: &str, deltas: &[EntryDelta]) -> Result<(), InfraError> {
        use crate::domain::models::{TimeEntry, RETENTION_DAYS};

        let mut documents = self.lock()?;
        let ledger = documents.entry(user_id.to_string()).or_default();
        for delta in deltas {
            match ledger
                .entries
                .iter_mut()
                .find(|entry| entry.date == delta.date)
            {
                Some(entry) => entry.minutes_spent += delta.minutes_delta,
                None => ledger.entries.push(TimeEntry {
                    date: delta.date,
                    minutes_spent: delta.minutes_delta,
                }),
            }
            ledger.total_minutes += u64::from(delta.minutes_delta);
        }
        ledger.entries.sort_by(|a, b| b.date.cmp(&a.date));
        ledger.entries.truncate(RETENTION_DAYS);
        Ok(())
    }

    async fn put(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
        let mut documents = self.lock()?;
        documents.insert(user_id.to_string(), ledger.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn document_endpoint_nests_collection_and_user() {
        let store = HttpLedgerStore::new("https://store.example/api/", "userTimeTracking");
        let url = store.document_endpoint("alice").expect("build url");
        assert_eq!(
            url.as_str(),
            "https://store.example/api/userTimeTracking/alice"
        );

        let deltas = store.deltas_endpoint("alice").expect("build deltas url");
        assert_eq!(
            deltas.as_str(),
            "https://store.example/api/userTimeTracking/alice/deltas"
        );
    }

    #[test]
    fn document_endpoint_rejects_blank_user() {
        let store = HttpLedgerStore::new("https://store.example/api/", "userTimeTracking");
        assert!(store.document_endpoint("  ").is_err());
    }

    #[tokio::test]
    async fn in_memory_store_merges_deltas_additively() {
        let store = InMemoryLedgerStore::default();
        store
            .apply_deltas(
                "alice",
                &[EntryDelta {
                    date: date("2024-03-01"),
                    minutes_delta: 30,
                }],
            )
            .await
            .expect("first flush");
        // A second session flushing for the same day adds, not replaces.
        store
            .apply_deltas(
                "alice",
                &[EntryDelta {
                    date: date("2024-03-01"),
                    minutes_delta: 12,
                }],
            )
            .await
            .expect("second flush");

        let ledger = store
            .get("alice")
            .await
            .expect("get document")
            .expect("document exists");
        assert_eq!(ledger.entries.len(), 1);
        assert_eq!(ledger.entries[0].minutes_spent, 42);
        assert_eq!(ledger.total_minutes, 42);
    }

    #[tokio::test]
    async fn put_replaces_the_whole_document() {
        let store = InMemoryLedgerStore::default();
        let mut ledger = Ledger::default();
        ledger.total_minutes = 100;
        store.put("alice", &ledger).await.expect("put document");

        let replacement = Ledger::default();
        store
            .put("alice", &replacement)
            .await
            .expect("put replacement");
        assert_eq!(
            store
                .get("alice")
                .await
                .expect("get document")
                .expect("document exists")
                .total_minutes,
            0
        );
    }
}
