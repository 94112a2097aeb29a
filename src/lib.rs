pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, BootstrapResult};
pub use application::synchronizer::{NowProvider, RetryPolicy, SyncService};
pub use application::tracker::{SessionTracker, TrackerConfig};
pub use domain::models::{EntryDelta, Ledger, TimeEntry, RETENTION_DAYS};
pub use domain::series::{
    axis_step, build_series, format_minutes, SeriesPoint, SeriesRange, TimeSeries,
};
pub use infrastructure::config::{load_tracking_config, TrackingConfig};
pub use infrastructure::error::InfraError;
pub use infrastructure::mirror::{
    initialize_mirror_database, InMemoryLedgerMirror, LedgerMirror, SqliteLedgerMirror,
};
pub use infrastructure::store_client::{HttpLedgerStore, InMemoryLedgerStore, LedgerStore};
