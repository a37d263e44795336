//! On-disk cache of raw market catalogues, one JSON file per exchange.

use crate::errors::Result;
use crate::models::{ExchangeId, MarketDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCacheEntry {
    pub saved_at: DateTime<Utc>,
    pub markets: Vec<MarketDescriptor>,
}

impl MarketCacheEntry {
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.saved_at).to_std() {
            Ok(age) => age <= max_age,
            // saved_at in the future: clock moved backwards, trust the entry
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketCache {
    base_dir: PathBuf,
    max_age: Duration,
}

impl MarketCache {
    pub fn new(base_dir: impl Into<PathBuf>, max_age: Duration) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir, max_age })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Cached markets for `exchange` if present and not older than `max_age`.
    pub fn load(&self, exchange: &ExchangeId) -> Option<Vec<MarketDescriptor>> {
        let entry = self.load_entry(exchange)?;
        if entry.is_fresh(self.max_age, Utc::now()) {
            Some(entry.markets)
        } else {
            None
        }
    }

    /// Reads the raw entry regardless of age. Unreadable files count as a miss.
    pub fn load_entry(&self, exchange: &ExchangeId) -> Option<MarketCacheEntry> {
        let path = self.path_for(exchange);
        if !path.exists() {
            return None;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%exchange, %error, "[CACHE] failed to load cached markets");
                None
            }
        }
    }

    /// Writes through a temp file and renames it into place. Failures are
    /// logged, never propagated: the cache is an optimisation.
    pub fn save(&self, exchange: &ExchangeId, markets: &[MarketDescriptor]) {
        let entry = MarketCacheEntry {
            saved_at: Utc::now(),
            markets: markets.to_vec(),
        };
        if let Err(error) = self.write_entry(exchange, &entry) {
            warn!(%exchange, %error, "[CACHE] failed to save cached markets");
        }
    }

    fn write_entry(&self, exchange: &ExchangeId, entry: &MarketCacheEntry) -> Result<()> {
        let path = self.path_for(exchange);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(entry)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn path_for(&self, exchange: &ExchangeId) -> PathBuf {
        let safe_name: String = exchange
            .as_str()
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{safe_name}.json"))
    }
}
