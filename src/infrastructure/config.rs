use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::Path;

const TRACKING_JSON: &str = "tracking.json";
const DEFAULT_COLLECTION: &str = "userTimeTracking";
const DEFAULT_TICK_SECONDS: u64 = 60;
const DEFAULT_FLUSH_SECONDS: u64 = 300;

// Runtime tunables read from `config/tracking.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingConfig {
    pub store_base_url: Option<String>,
    pub collection: String,
    pub tick_seconds: u64,
    pub flush_seconds: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            store_base_url: None,
            collection: DEFAULT_COLLECTION.to_string(),
            tick_seconds: DEFAULT_TICK_SECONDS,
            flush_seconds: DEFAULT_FLUSH_SECONDS,
        }
    }
}

fn default_tracking_json() -> serde_json::Value {
    serde_json::json!({
        "schema": 1,
        "storeBaseUrl": null,
        "collection": DEFAULT_COLLECTION,
        "tickSeconds": DEFAULT_TICK_SECONDS,
        "flushSeconds": DEFAULT_FLUSH_SECONDS,
    })
}

pub fn ensure_default_config(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(TRACKING_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_tracking_json())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_tracking_config(config_dir: &Path) -> Result<TrackingConfig, InfraError> {
    let path = config_dir.join(TRACKING_JSON);
    let parsed = read_config(&path)?;

    let store_base_url = parsed
        .get("storeBaseUrl")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);
    let collection = parsed
        .get("collection")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_COLLECTION)
        .to_string();
    let tick_seconds = parsed
        .get("tickSeconds")
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TICK_SECONDS);
    let flush_seconds = parsed
        .get("flushSeconds")
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_FLUSH_SECONDS);

    Ok(TrackingConfig {
        store_base_url,
        collection,
        tick_seconds,
        flush_seconds,
    })
}
