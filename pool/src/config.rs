use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::jobs::CoinbaseParams;

/// Extranonce1 is derived per session and always 4 bytes
pub const EXTRANONCE1_SIZE: usize = 4;

/// One listening port with its fixed share difficulty
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TierConfig {
    pub name: String,
    pub port: u16,
    pub difficulty: u64,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Memory,
    Redis,
}

impl FromStr for BusBackend {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(PoolError::Config(format!("unknown bus backend {:?}", other))),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub bind_host: String,
    pub tiers: Vec<TierConfig>,
    pub api_listen: String,

    pub node_rpc_url: String,
    pub node_rpc_user: Option<String>,
    pub node_rpc_password: Option<String>,
    pub poll_interval_ms: u64,
    pub stale_job_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,

    /// Percent of each block reward kept by the pool
    pub pool_fee_percent: Decimal,
    /// Hex output script paid by the coinbase
    pub payout_script: String,
    pub pool_tag: String,
    pub extranonce2_size: usize,
    /// Allowed drift of a submitted ntime past the job time
    pub ntime_tolerance_secs: u32,

    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub banned_ips: Vec<IpAddr>,

    pub bus_backend: BusBackend,
    pub redis_url: String,
    pub bus_prefix: String,
    pub bus_queues: Vec<String>,
    pub ledger_queue: String,
    pub bus_retry_attempts: u32,
    pub bus_retry_backoff_ms: u64,

    pub payout_history_len: usize,
    /// Depth a found block needs before its window is paid; 0 pays on acceptance
    pub block_confirmations: u64,
    pub maturity_poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            tiers: vec![
                TierConfig { name: "low".to_string(), port: 3333, difficulty: 16 },
                TierConfig { name: "mid".to_string(), port: 3334, difficulty: 256 },
                TierConfig { name: "high".to_string(), port: 3335, difficulty: 4096 },
            ],
            api_listen: "0.0.0.0:8080".to_string(),
            node_rpc_url: "http://127.0.0.1:8332/".to_string(),
            node_rpc_user: None,
            node_rpc_password: None,
            poll_interval_ms: 1_000,
            stale_job_timeout_secs: 120,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            pool_fee_percent: dec!(1),
            payout_script: String::new(),
            pool_tag: "/tierpool/".to_string(),
            extranonce2_size: 4,
            ntime_tolerance_secs: 7_200,
            idle_timeout_secs: 600,
            max_connections: 10_000,
            max_connections_per_ip: 64,
            banned_ips: Vec::new(),
            bus_backend: BusBackend::Memory,
            redis_url: "redis://127.0.0.1/".to_string(),
            bus_prefix: "tierpool".to_string(),
            bus_queues: vec!["ledger".to_string(), "stats".to_string()],
            ledger_queue: "ledger".to_string(),
            bus_retry_attempts: 5,
            bus_retry_backoff_ms: 200,
            payout_history_len: 256,
            block_confirmations: 100,
            maturity_poll_secs: 30,
        }
    }
}

fn set_parsed<T: FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| PoolError::Config(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}

/// `name:port:difficulty,...`
pub fn parse_tiers(raw: &str) -> Result<Vec<TierConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            if parts.len() != 3 {
                return Err(PoolError::Config(format!("tier {:?} is not name:port:difficulty", entry)));
            }
            let port = parts[1]
                .parse()
                .map_err(|e| PoolError::Config(format!("tier {:?} port: {}", entry, e)))?;
            let difficulty = parts[2]
                .parse()
                .map_err(|e| PoolError::Config(format!("tier {:?} difficulty: {}", entry, e)))?;
            Ok(TierConfig {
                name: parts[0].to_string(),
                port,
                difficulty,
            })
        })
        .collect()
}

impl Config {
    /// Defaults, then `pool_config.json` (or `POOL_CONFIG`), then `POOL_*` env vars
    pub fn load() -> Result<Self> {
        let path = std::env::var("POOL_CONFIG").unwrap_or_else(|_| "pool_config.json".to_string());
        let file = match std::fs::read_to_string(&path) {
            Ok(txt) => {
                tracing::info!("Loaded pool config from {}", path);
                Some(txt)
            }
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), &|key: &str| std::env::var(key).ok())
    }

    pub fn from_sources(
        file: Option<&str>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut cfg = match file {
            Some(txt) => serde_json::from_str::<Config>(txt)
                .map_err(|e| PoolError::Config(format!("pool config: {}", e)))?,
            None => Config::default(),
        };

        set_parsed(env, "POOL_BIND_HOST", &mut cfg.bind_host)?;
        if let Some(raw) = env("POOL_TIERS") {
            cfg.tiers = parse_tiers(&raw)?;
        }
        set_parsed(env, "POOL_API_LISTEN", &mut cfg.api_listen)?;
        set_parsed(env, "POOL_NODE_RPC_URL", &mut cfg.node_rpc_url)?;
        if let Some(user) = env("POOL_NODE_RPC_USER") {
            cfg.node_rpc_user = Some(user);
        }
        if let Some(password) = env("POOL_NODE_RPC_PASSWORD") {
            cfg.node_rpc_password = Some(password);
        }
        set_parsed(env, "POOL_POLL_INTERVAL_MS", &mut cfg.poll_interval_ms)?;
        set_parsed(env, "POOL_STALE_JOB_TIMEOUT_SECS", &mut cfg.stale_job_timeout_secs)?;
        set_parsed(env, "POOL_BACKOFF_INITIAL_MS", &mut cfg.backoff_initial_ms)?;
        set_parsed(env, "POOL_BACKOFF_MAX_MS", &mut cfg.backoff_max_ms)?;
        set_parsed(env, "POOL_FEE_PERCENT", &mut cfg.pool_fee_percent)?;
        set_parsed(env, "POOL_PAYOUT_SCRIPT", &mut cfg.payout_script)?;
        set_parsed(env, "POOL_TAG", &mut cfg.pool_tag)?;
        set_parsed(env, "POOL_EXTRANONCE2_SIZE", &mut cfg.extranonce2_size)?;
        set_parsed(env, "POOL_NTIME_TOLERANCE_SECS", &mut cfg.ntime_tolerance_secs)?;
        set_parsed(env, "POOL_IDLE_TIMEOUT_SECS", &mut cfg.idle_timeout_secs)?;
        set_parsed(env, "POOL_MAX_CONNECTIONS", &mut cfg.max_connections)?;
        set_parsed(env, "POOL_MAX_CONNECTIONS_PER_IP", &mut cfg.max_connections_per_ip)?;
        if let Some(raw) = env("POOL_BANNED_IPS") {
            cfg.banned_ips = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .map_err(|e| PoolError::Config(format!("banned ip {:?}: {}", s, e)))
                })
                .collect::<Result<_>>()?;
        }
        set_parsed(env, "POOL_BUS_BACKEND", &mut cfg.bus_backend)?;
        set_parsed(env, "POOL_REDIS_URL", &mut cfg.redis_url)?;
        set_parsed(env, "POOL_BUS_PREFIX", &mut cfg.bus_prefix)?;
        if let Some(raw) = env("POOL_BUS_QUEUES") {
            cfg.bus_queues = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        set_parsed(env, "POOL_LEDGER_QUEUE", &mut cfg.ledger_queue)?;
        set_parsed(env, "POOL_BUS_RETRY_ATTEMPTS", &mut cfg.bus_retry_attempts)?;
        set_parsed(env, "POOL_BUS_RETRY_BACKOFF_MS", &mut cfg.bus_retry_backoff_ms)?;
        set_parsed(env, "POOL_PAYOUT_HISTORY_LEN", &mut cfg.payout_history_len)?;
        set_parsed(env, "POOL_BLOCK_CONFIRMATIONS", &mut cfg.block_confirmations)?;
        set_parsed(env, "POOL_MATURITY_POLL_SECS", &mut cfg.maturity_poll_secs)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(PoolError::Config(msg));

        if self.tiers.is_empty() {
            return bad("at least one tier is required".to_string());
        }
        let mut ports = HashSet::new();
        let mut names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.is_empty() {
                return bad(format!("tier on port {} has no name", tier.port));
            }
            if tier.difficulty == 0 {
                return bad(format!("tier {} has zero difficulty", tier.name));
            }
            if !ports.insert(tier.port) {
                return bad(format!("port {} used by more than one tier", tier.port));
            }
            if !names.insert(tier.name.as_str()) {
                return bad(format!("tier name {} is not unique", tier.name));
            }
        }

        if self.pool_fee_percent < Decimal::ZERO || self.pool_fee_percent >= dec!(100) {
            return bad(format!("pool fee {}% outside [0, 100)", self.pool_fee_percent));
        }
        match hex::decode(&self.payout_script) {
            Ok(script) if !script.is_empty() => {}
            _ => return bad("payout_script must be non-empty hex".to_string()),
        }
        if self.pool_tag.len() > 40 {
            return bad("pool_tag longer than 40 bytes".to_string());
        }
        if !(2..=8).contains(&self.extranonce2_size) {
            return bad(format!("extranonce2_size {} outside 2..=8", self.extranonce2_size));
        }
        if self.poll_interval_ms == 0 {
            return bad("poll_interval_ms must be positive".to_string());
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return bad("backoff_initial_ms must be in 1..=backoff_max_ms".to_string());
        }
        if self.max_connections == 0 || self.max_connections_per_ip == 0 {
            return bad("connection limits must be positive".to_string());
        }
        if self.maturity_poll_secs == 0 {
            return bad("maturity_poll_secs must be positive".to_string());
        }
        if !self.bus_queues.iter().any(|q| q == &self.ledger_queue) {
            return bad(format!("ledger_queue {} is not in bus_queues", self.ledger_queue));
        }
        Ok(())
    }

    /// Fee as a fraction of the block reward
    pub fn fee_fraction(&self) -> Decimal {
        self.pool_fee_percent / dec!(100)
    }

    pub fn coinbase_params(&self) -> Result<CoinbaseParams> {
        let payout_script = hex::decode(&self.payout_script)
            .map_err(|e| PoolError::Config(format!("payout_script: {}", e)))?;
        Ok(CoinbaseParams {
            payout_script,
            pool_tag: self.pool_tag.as_bytes().to_vec(),
            extranonce1_size: EXTRANONCE1_SIZE,
            extranonce2_size: self.extranonce2_size,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn maturity_poll_interval(&self) -> Duration {
        Duration::from_secs(self.maturity_poll_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const SCRIPT: &str = "76a914000000000000000000000000000000000000000088ac";

    #[test]
    fn test_parse_tiers() {
        let tiers = parse_tiers("cpu:3333:8, gpu:3334:1024").unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[1], TierConfig { name: "gpu".into(), port: 3334, difficulty: 1024 });
        assert!(parse_tiers("cpu:3333").is_err());
        assert!(parse_tiers("cpu:notaport:8").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = format!(r#"{{"payout_script": "{}", "pool_fee_percent": "2.5"}}"#, SCRIPT);
        let env = env_of(&[("POOL_TIERS", "asic:4000:65536"), ("POOL_BUS_BACKEND", "redis")]);
        let cfg = Config::from_sources(Some(&file), &env).unwrap();
        assert_eq!(cfg.tiers.len(), 1);
        assert_eq!(cfg.tiers[0].port, 4000);
        assert_eq!(cfg.bus_backend, BusBackend::Redis);
        assert_eq!(cfg.fee_fraction(), dec!(0.025));
        // untouched fields keep defaults
        assert_eq!(cfg.extranonce2_size, 4);
    }

    #[test]
    fn test_missing_payout_script_is_rejected() {
        let env = env_of(&[]);
        assert!(matches!(Config::from_sources(None, &env), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_duplicate_tier_port_is_rejected() {
        let env = env_of(&[
            ("POOL_PAYOUT_SCRIPT", SCRIPT),
            ("POOL_TIERS", "a:3333:1,b:3333:2"),
        ]);
        assert!(Config::from_sources(None, &env).is_err());
    }

    #[test]
    fn test_unparseable_env_is_an_error() {
        let env = env_of(&[("POOL_PAYOUT_SCRIPT", SCRIPT), ("POOL_MAX_CONNECTIONS", "lots")]);
        assert!(Config::from_sources(None, &env).is_err());
    }

    #[test]
    fn test_coinbase_params_from_config() {
        let env = env_of(&[("POOL_PAYOUT_SCRIPT", SCRIPT)]);
        let cfg = Config::from_sources(None, &env).unwrap();
        let params = cfg.coinbase_params().unwrap();
        assert_eq!(params.extranonce1_size, EXTRANONCE1_SIZE);
        assert_eq!(params.payout_script.len(), 25);
    }

    #[test]
    fn test_block_maturity_settings() {
        let env = env_of(&[("POOL_PAYOUT_SCRIPT", SCRIPT)]);
        let cfg = Config::from_sources(None, &env).unwrap();
        assert_eq!(cfg.block_confirmations, 100);
        assert_eq!(cfg.maturity_poll_interval(), Duration::from_secs(30));

        let env = env_of(&[
            ("POOL_PAYOUT_SCRIPT", SCRIPT),
            ("POOL_BLOCK_CONFIRMATIONS", "0"),
            ("POOL_MATURITY_POLL_SECS", "5"),
        ]);
        let cfg = Config::from_sources(None, &env).unwrap();
        assert_eq!(cfg.block_confirmations, 0);
        assert_eq!(cfg.maturity_poll_interval(), Duration::from_secs(5));

        let env = env_of(&[("POOL_PAYOUT_SCRIPT", SCRIPT), ("POOL_MATURITY_POLL_SECS", "0")]);
        assert!(Config::from_sources(None, &env).is_err());
    }
}
