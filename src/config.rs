//! Configuration loader and application settings.

use crate::errors::{AppError, Result};
use crate::models::{ExchangeId, Pair};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Job controller sizing.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker pool size for discovery/scan/fallback jobs.
    pub max_workers: usize,
    /// Outbound exchange calls allowed in flight across all jobs.
    pub max_http: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_http: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub quotes: Vec<String>,
    pub min_exchanges: usize,
    pub cache_dir: PathBuf,
    /// Cached catalogues older than this are reloaded from the exchange.
    pub cache_max_age: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            quotes: vec!["USDT".into(), "USDC".into()],
            min_exchanges: 5,
            cache_dir: default_cache_dir(),
            cache_max_age: Duration::from_secs(12 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_pairs: usize,
    pub interval: Duration,
    /// A symbol is not re-fetched from the same exchange before this elapses.
    pub min_refresh_interval: Duration,
    /// Per-cycle cap of individual fetches for exchanges without batch tickers.
    pub batch_size: usize,
    pub outlier_pct: f64,
    pub max_intrabook_spread_pct: Option<f64>,
    /// Spread % at or above which a pair becomes a live profit row.
    pub opportunity_threshold_pct: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_pairs: 300,
            interval: Duration::from_millis(2000),
            min_refresh_interval: Duration::from_millis(4000),
            batch_size: 20,
            outlier_pct: 5.0,
            max_intrabook_spread_pct: None,
            opportunity_threshold_pct: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub no_symbol: Duration,
    pub error: Duration,
    /// Identical errors for one exchange are logged at most once per window.
    pub log_window: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            no_symbol: Duration::from_secs(60),
            error: Duration::from_secs(12),
            log_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub pair: Pair,
    pub exchanges: Vec<ExchangeId>,
    /// A streaming exchange silent for longer than this is polled over HTTP.
    pub stale_after: Duration,
    pub min_spread_pct: f64,
    pub top_n: usize,
    pub only_ws: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pair: Pair::from("BTC/USDT"),
            exchanges: crate::stream::streaming_exchanges(),
            stale_after: Duration::from_millis(5000),
            min_spread_pct: 0.0,
            top_n: 10,
            only_ws: false,
        }
    }
}

/// Consolidated application configuration.
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    pub controller: ControllerConfig,
    pub discovery: DiscoveryConfig,
    pub scan: ScanConfig,
    pub cooldown: CooldownConfig,
    pub monitor: MonitorConfig,
}

impl ScannerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = ScannerConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SCAN_MAX_WORKERS") {
            cfg.controller.max_workers = parse_positive("SCAN_MAX_WORKERS", &v)?;
        }
        if let Some(v) = get("SCAN_MAX_HTTP") {
            cfg.controller.max_http = parse_positive("SCAN_MAX_HTTP", &v)?;
        }

        if let Some(v) = get("SCAN_QUOTES") {
            cfg.discovery.quotes = split_list(&v).map(|q| q.to_uppercase()).collect();
            if cfg.discovery.quotes.is_empty() {
                return Err(AppError::Config("SCAN_QUOTES must name a currency".into()));
            }
        }
        if let Some(v) = get("SCAN_MIN_EXCHANGES") {
            cfg.discovery.min_exchanges = parse_positive("SCAN_MIN_EXCHANGES", &v)?;
        }
        if let Some(v) = get("MARKET_CACHE_DIR") {
            cfg.discovery.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MARKET_CACHE_MAX_AGE_SECS") {
            cfg.discovery.cache_max_age =
                Duration::from_secs(parse_value("MARKET_CACHE_MAX_AGE_SECS", &v)?);
        }

        if let Some(v) = get("SCAN_MAX_PAIRS") {
            cfg.scan.max_pairs = parse_positive("SCAN_MAX_PAIRS", &v)?;
        }
        if let Some(v) = get("SCAN_INTERVAL_MS") {
            cfg.scan.interval = Duration::from_millis(parse_positive("SCAN_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("SCAN_MIN_REFRESH_MS") {
            cfg.scan.min_refresh_interval =
                Duration::from_millis(parse_value("SCAN_MIN_REFRESH_MS", &v)?);
        }
        if let Some(v) = get("SCAN_BATCH_SIZE") {
            cfg.scan.batch_size = parse_positive("SCAN_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SCAN_OUTLIER_PCT") {
            cfg.scan.outlier_pct = parse_value("SCAN_OUTLIER_PCT", &v)?;
        }
        if let Some(v) = get("SCAN_MAX_INTRABOOK_SPREAD_PCT") {
            cfg.scan.max_intrabook_spread_pct =
                Some(parse_value("SCAN_MAX_INTRABOOK_SPREAD_PCT", &v)?);
        }
        if let Some(v) = get("SCAN_OPPORTUNITY_PCT") {
            cfg.scan.opportunity_threshold_pct = parse_value("SCAN_OPPORTUNITY_PCT", &v)?;
        }

        if let Some(v) = get("NO_SYMBOL_COOLDOWN_SECS") {
            cfg.cooldown.no_symbol = Duration::from_secs(parse_value("NO_SYMBOL_COOLDOWN_SECS", &v)?);
        }
        if let Some(v) = get("ERROR_COOLDOWN_SECS") {
            cfg.cooldown.error = Duration::from_secs(parse_value("ERROR_COOLDOWN_SECS", &v)?);
        }

        if let Some(v) = get("MONITOR_PAIR") {
            let pair = Pair::new(v.trim().to_uppercase());
            if pair.split().is_none() {
                return Err(AppError::Config(format!(
                    "MONITOR_PAIR must look like BASE/QUOTE, got {pair}"
                )));
            }
            cfg.monitor.pair = pair;
        }
        if let Some(v) = get("MONITOR_EXCHANGES") {
            cfg.monitor.exchanges = split_list(&v).map(ExchangeId::new).collect();
        }
        if let Some(v) = get("WS_STALE_AFTER_MS") {
            cfg.monitor.stale_after = Duration::from_millis(parse_positive("WS_STALE_AFTER_MS", &v)?);
        }
        if let Some(v) = get("MIN_SPREAD_PCT") {
            cfg.monitor.min_spread_pct = parse_value("MIN_SPREAD_PCT", &v)?;
        }
        if let Some(v) = get("TOP_N") {
            cfg.monitor.top_n = parse_value("TOP_N", &v)?;
        }
        if let Some(v) = get("ONLY_WS") {
            cfg.monitor.only_ws = matches!(v.trim(), "1" | "true" | "TRUE" | "yes");
        }

        Ok(cfg)
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".arbitrage-scanner")
        .join("market_cache")
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{key}: cannot parse {raw:?}")))
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
{
    let value: T = parse_value(key, raw)?;
    if value <= T::default() {
        return Err(AppError::Config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<ScannerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScannerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.controller.max_workers, 4);
        assert_eq!(cfg.controller.max_http, 4);
        assert_eq!(cfg.scan.min_refresh_interval, Duration::from_secs(4));
        assert_eq!(cfg.scan.outlier_pct, 5.0);
        assert_eq!(cfg.cooldown.no_symbol, Duration::from_secs(60));
        assert_eq!(cfg.cooldown.error, Duration::from_secs(12));
        assert_eq!(cfg.discovery.quotes, vec!["USDT", "USDC"]);
        assert!(cfg.scan.max_intrabook_spread_pct.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = load(&[
            ("SCAN_QUOTES", "usdt, eur"),
            ("SCAN_MIN_EXCHANGES", "2"),
            ("SCAN_MAX_INTRABOOK_SPREAD_PCT", "1.5"),
            ("MONITOR_PAIR", "eth/usdc"),
            ("MONITOR_EXCHANGES", "Binance,OKX"),
            ("ONLY_WS", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.discovery.quotes, vec!["USDT", "EUR"]);
        assert_eq!(cfg.discovery.min_exchanges, 2);
        assert_eq!(cfg.scan.max_intrabook_spread_pct, Some(1.5));
        assert_eq!(cfg.monitor.pair, Pair::from("ETH/USDC"));
        assert_eq!(cfg.monitor.exchanges.len(), 2);
        assert!(cfg.monitor.only_ws);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        assert!(matches!(
            load(&[("SCAN_MAX_HTTP", "many")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            load(&[("SCAN_MAX_WORKERS", "0")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            load(&[("MONITOR_PAIR", "BTCUSDT")]),
            Err(AppError::Config(_))
        ));
    }
}
