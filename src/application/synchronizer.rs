use crate::domain::models::{merge_deltas, push_delta, EntryDelta, Ledger};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::mirror::LedgerMirror;
use crate::infrastructure::store_client::LedgerStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Duration as TokioDuration};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    ledger: Ledger,
    pending: Vec<EntryDelta>,
}

// Reconciles the in-memory ledger, the local mirror, and the durable
// store. The state mutex is never held across an await: flush snapshots
// the pending deltas, drops the lock, and merges them back on failure.
pub struct SyncService<M, D>
where
    M: LedgerMirror,
    D: LedgerStore,
{
    user_id: String,
    mirror: Arc<M>,
    store: Arc<D>,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
    state: Mutex<SyncState>,
}

impl<M, D> SyncService<M, D>
where
    M: LedgerMirror,
    D: LedgerStore,
{
    pub fn new(user_id: impl Into<String>, mirror: Arc<M>, store: Arc<D>) -> Self {
        Self {
            user_id: user_id.into(),
            mirror,
            store,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
            state: Mutex::new(SyncState::default()),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SyncState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("sync state lock poisoned: {error}")))
    }

    // Hydrates from the mirror, overwrites with the durable document when
    // one exists, and writes the reconciled ledger back to the mirror.
    pub async fn load(&self) -> Result<(), InfraError> {
        let now = self.now();

        if let Some(mirrored) = self.mirror.load(&self.user_id)? {
            let mut state = self.lock_state()?;
            state.ledger = mirrored;
        }

        match self.store.get(&self.user_id).await {
            Ok(Some(durable)) => {
                let mut state = self.lock_state()?;
                state.ledger = durable;
            }
            Ok(None) => {}
            Err(error) => {
                // The mirror value stays authoritative until the store
                // answers again.
                log::warn!(
                    "durable ledger read failed for user {}: {error}",
                    self.user_id
                );
            }
        }

        let snapshot = {
            let mut state = self.lock_state()?;
            state.ledger.recompute_derived(now);
            state.ledger.clone()
        };
        self.mirror.save(&self.user_id, &snapshot)?;
        Ok(())
    }

    // After this returns the mirror matches the in-memory ledger; the
    // durable store catches up on the next flush.
    pub fn attribute_minutes(&self, minutes: u32) -> Result<bool, InfraError> {
        if minutes == 0 {
            return Ok(false);
        }

        let now = self.now();
        let today = now.date_naive();
        let snapshot = {
            let mut state = self.lock_state()?;
            state.ledger.record(today, minutes, now);
            push_delta(&mut state.pending, today, minutes);
            state.ledger.clone()
        };
        self.mirror.save(&self.user_id, &snapshot)?;
        Ok(true)
    }

    // On failure the deltas are merged back so the next flush carries them.
    pub async fn flush(&self) -> Result<(), InfraError> {
        let deltas = {
            let mut state = self.lock_state()?;
            std::mem::take(&mut state.pending)
        };
        if deltas.is_empty() {
            return Ok(());
        }

        match self.apply_deltas_with_retry(&deltas).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let mut state = self.lock_state()?;
                merge_deltas(&mut state.pending, deltas);
                Err(error)
            }
        }
    }

    async fn apply_deltas_with_retry(&self, deltas: &[EntryDelta]) -> Result<(), InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.store.apply_deltas(&self.user_id, deltas).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub fn today_minutes(&self) -> Result<u32, InfraError> {
        let now = self.now();
        let state = self.lock_state()?;
        Ok(state.ledger.today_minutes(now))
    }

    // Stored derived field; not recomputed on call.
    pub fn week_minutes(&self) -> Result<u64, InfraError> {
        let state = self.lock_state()?;
        Ok(state.ledger.weekly_minutes)
    }

    pub fn month_minutes(&self) -> Result<u64, InfraError> {
        let state = self.lock_state()?;
        Ok(state.ledger.monthly_minutes)
    }

    pub fn snapshot(&self) -> Result<Ledger, InfraError> {
        let state = self.lock_state()?;
        Ok(state.ledger.clone())
    }

    #[cfg(test)]
    fn pending_deltas(&self) -> Vec<EntryDelta> {
        self.lock_state().expect("state lock").pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TimeEntry;
    use crate::infrastructure::mirror::InMemoryLedgerMirror;
    use crate::infrastructure::store_client::InMemoryLedgerStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_now(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn now_provider(value: &str) -> NowProvider {
        let now = fixed_now(value);
        Arc::new(move || now)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        }
    }

    #[derive(Debug, Clone)]
    enum FakeWriteResponse {
        Success,
        TransientError,
        PermanentError,
    }

    // Scripted durable store: answers `apply_deltas` from a queue and
    // counts calls, in front of a real in-memory document.
    #[derive(Debug, Default)]
    struct FakeLedgerStore {
        inner: InMemoryLedgerStore,
        write_responses: Mutex<VecDeque<FakeWriteResponse>>,
        get_document: Mutex<Option<Ledger>>,
        get_fails: Mutex<bool>,
        apply_calls: AtomicUsize,
    }

    impl FakeLedgerStore {
        fn with_write_responses(responses: Vec<FakeWriteResponse>) -> Self {
            Self {
                write_responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        fn with_document(ledger: Ledger) -> Self {
            Self {
                get_document: Mutex::new(Some(ledger)),
                ..Self::default()
            }
        }

        fn failing_reads() -> Self {
            Self {
                get_fails: Mutex::new(true),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FakeLedgerStore {
        async fn get(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
            if *self.get_fails.lock().expect("get_fails lock") {
                return Err(InfraError::Store(
                    "network error while reading ledger document".to_string(),
                ));
            }
            if let Some(ledger) = self.get_document.lock().expect("document lock").clone() {
                return Ok(Some(ledger));
            }
            self.inner.get(user_id).await
        }

        async fn apply_deltas(
            &self,
            user_id: &str,
            deltas: &[EntryDelta],
        ) -> Result<(), InfraError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .write_responses
                .lock()
                .expect("write response lock")
                .pop_front()
                .unwrap_or(FakeWriteResponse::Success);

            match response {
                FakeWriteResponse::Success => self.inner.apply_deltas(user_id, deltas).await,
                FakeWriteResponse::TransientError => Err(InfraError::Store(
                    "network error while applying ledger deltas".to_string(),
                )),
                FakeWriteResponse::PermanentError => Err(InfraError::Store(
                    "ledger api error: http 403".to_string(),
                )),
            }
        }

        async fn put(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
            self.inner.put(user_id, ledger).await
        }
    }

    // Counts saves so no-op paths can assert that no write happened.
    #[derive(Debug, Default)]
    struct CountingMirror {
        inner: InMemoryLedgerMirror,
        saves: AtomicUsize,
    }

    impl LedgerMirror for CountingMirror {
        fn load(&self, user_id: &str) -> Result<Option<Ledger>, InfraError> {
            self.inner.load(user_id)
        }

        fn save(&self, user_id: &str, ledger: &Ledger) -> Result<(), InfraError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(user_id, ledger)
        }

        fn remove(&self, user_id: &str) -> Result<(), InfraError> {
            self.inner.remove(user_id)
        }
    }

    fn service(
        mirror: Arc<CountingMirror>,
        store: Arc<FakeLedgerStore>,
    ) -> SyncService<CountingMirror, FakeLedgerStore> {
        SyncService::new("alice", mirror, store)
            .with_now_provider(now_provider("2024-03-03T12:00:00Z"))
            .with_retry_policy(fast_retry())
    }

    fn durable_ledger() -> Ledger {
        Ledger {
            total_minutes: 500,
            entries: vec![TimeEntry {
                date: date("2024-03-02"),
                minutes_spent: 55,
            }],
            weekly_minutes: 0,
            monthly_minutes: 0,
        }
    }

    #[test]
    fn new_service_starts_with_an_empty_ledger() {
        let sync = SyncService::new(
            "alice",
            Arc::new(InMemoryLedgerMirror::default()),
            Arc::new(InMemoryLedgerStore::default()),
        );

        assert_eq!(sync.user_id(), "alice");
        assert_eq!(sync.snapshot().expect("snapshot"), Ledger::default());
        assert!(sync.pending_deltas().is_empty());
    }

    #[tokio::test]
    async fn load_prefers_durable_store_over_mirror() {
        let mirror = Arc::new(CountingMirror::default());
        let mut stale = Ledger::default();
        stale.record(date("2024-03-01"), 10, fixed_now("2024-03-01T12:00:00Z"));
        mirror.save("alice", &stale).expect("seed mirror");

        let store = Arc::new(FakeLedgerStore::with_document(durable_ledger()));
        let sync = service(Arc::clone(&mirror), store);
        sync.load().await.expect("load");

        let snapshot = sync.snapshot().expect("snapshot");
        assert_eq!(snapshot.total_minutes, 500);
        assert_eq!(snapshot.entries.len(), 1);
        // Derived fields are recomputed from the durable entries.
        assert_eq!(snapshot.weekly_minutes, 55);
        assert_eq!(snapshot.monthly_minutes, 55);
        // The reconciled ledger is written back to the mirror.
        assert_eq!(mirror.load("alice").expect("mirror read"), Some(snapshot));
    }

    #[tokio::test]
    async fn load_falls_back_to_mirror_when_store_is_down() {
        let mirror = Arc::new(CountingMirror::default());
        let mut cached = Ledger::default();
        cached.record(date("2024-03-02"), 25, fixed_now("2024-03-02T12:00:00Z"));
        mirror.save("alice", &cached).expect("seed mirror");

        let store = Arc::new(FakeLedgerStore::failing_reads());
        let sync = service(Arc::clone(&mirror), store);
        sync.load().await.expect("load despite store outage");

        let snapshot = sync.snapshot().expect("snapshot");
        assert_eq!(snapshot.total_minutes, 25);
        assert_eq!(snapshot.weekly_minutes, 25);
    }

    #[tokio::test]
    async fn load_treats_corrupt_mirror_as_absent() {
        let mirror = Arc::new(CountingMirror::default());
        mirror
            .inner
            .seed_raw("alice", "{broken json")
            .expect("seed corrupt payload");

        let store = Arc::new(FakeLedgerStore::with_document(durable_ledger()));
        let sync = service(Arc::clone(&mirror), store);
        sync.load().await.expect("load");

        assert_eq!(sync.snapshot().expect("snapshot").total_minutes, 500);
    }

    #[tokio::test]
    async fn attribute_minutes_updates_ledger_and_mirror_synchronously() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::default());
        let sync = service(Arc::clone(&mirror), store);

        assert!(sync.attribute_minutes(7).expect("attribute"));
        assert_eq!(sync.today_minutes().expect("today"), 7);
        assert_eq!(sync.week_minutes().expect("week"), 7);
        assert_eq!(sync.month_minutes().expect("month"), 7);

        let mirrored = mirror
            .load("alice")
            .expect("mirror read")
            .expect("mirror present");
        assert_eq!(mirrored, sync.snapshot().expect("snapshot"));
    }

    #[tokio::test]
    async fn attribute_zero_minutes_is_a_no_op_without_mirror_write() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::default());
        let sync = service(Arc::clone(&mirror), store);

        assert!(!sync.attribute_minutes(0).expect("attribute zero"));
        assert_eq!(mirror.saves.load(Ordering::SeqCst), 0);
        assert_eq!(sync.snapshot().expect("snapshot"), Ledger::default());
    }

    #[tokio::test]
    async fn flush_sends_coalesced_deltas_and_clears_them() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::default());
        let sync = service(mirror, Arc::clone(&store));

        sync.attribute_minutes(5).expect("attribute");
        sync.attribute_minutes(3).expect("attribute");
        sync.flush().await.expect("flush");

        assert_eq!(store.apply_calls.load(Ordering::SeqCst), 1);
        let durable = store
            .inner
            .get("alice")
            .await
            .expect("get document")
            .expect("document exists");
        assert_eq!(durable.entries[0].minutes_spent, 8);

        // Nothing pending means the next flush never reaches the store.
        sync.flush().await.expect("empty flush");
        assert_eq!(store.apply_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_deltas_for_the_next_attempt() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::with_write_responses(vec![
            FakeWriteResponse::PermanentError,
        ]));
        let sync = service(mirror, Arc::clone(&store));

        sync.attribute_minutes(9).expect("attribute");
        assert!(sync.flush().await.is_err());
        assert_eq!(sync.pending_deltas().len(), 1);

        sync.attribute_minutes(1).expect("attribute more");
        sync.flush().await.expect("second flush");
        let durable = store
            .inner
            .get("alice")
            .await
            .expect("get document")
            .expect("document exists");
        assert_eq!(durable.entries[0].minutes_spent, 10);
        assert!(sync.pending_deltas().is_empty());
    }

    #[tokio::test]
    async fn transient_write_errors_retry_with_backoff() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::with_write_responses(vec![
            FakeWriteResponse::TransientError,
            FakeWriteResponse::TransientError,
            FakeWriteResponse::Success,
        ]));
        let sync = service(mirror, Arc::clone(&store));

        sync.attribute_minutes(4).expect("attribute");
        sync.flush().await.expect("flush after retries");
        assert_eq!(store.apply_calls.load(Ordering::SeqCst), 3);
        assert!(sync.pending_deltas().is_empty());
    }

    #[tokio::test]
    async fn permanent_write_errors_do_not_retry() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::with_write_responses(vec![
            FakeWriteResponse::PermanentError,
            FakeWriteResponse::Success,
        ]));
        let sync = service(mirror, Arc::clone(&store));

        sync.attribute_minutes(4).expect("attribute");
        assert!(sync.flush().await.is_err());
        assert_eq!(store.apply_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mirror = Arc::new(CountingMirror::default());
        let store = Arc::new(FakeLedgerStore::with_write_responses(vec![
            FakeWriteResponse::TransientError,
            FakeWriteResponse::TransientError,
            FakeWriteResponse::TransientError,
        ]));
        let sync = service(mirror, Arc::clone(&store));

        sync.attribute_minutes(4).expect("attribute");
        assert!(sync.flush().await.is_err());
        assert_eq!(store.apply_calls.load(Ordering::SeqCst), 3);
        assert_eq!(sync.pending_deltas().len(), 1);
    }
}
