//! Pool configuration: a TOML file on disk, overridable via `TOS_POOL__*`
//! environment variables (`config` crate conventions).

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_directive: String,
    pub pool_address: String,
    /// Algorithm-opaque difficulty-1 target, as 64 lowercase hex chars
    /// (spec §9 open question (a)).
    pub max_target_hex: String,

    pub storage: StorageConfig,
    pub upstreams: Vec<UpstreamEntry>,
    pub upstream_policy: UpstreamPolicyConfig,
    pub dispatcher: DispatcherSection,
    pub validator: ValidatorSection,
    pub protocol: ProtocolSection,
    pub vardiff: VardiffSection,
    pub ban_policy: BanPolicySection,
    pub session: SessionSection,
    pub stratum: StratumSection,
    pub ws_getwork: WsGetworkSection,
    pub xatum: XatumSection,
    pub wallet: WalletSection,
    pub payout: PayoutSection,
    pub unlocker: UnlockerSection,
    pub admin: AdminSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_directive: "info".into(),
            pool_address: String::new(),
            max_target_hex: "0".repeat(62) + "ff",
            storage: StorageConfig::default(),
            upstreams: Vec::new(),
            upstream_policy: UpstreamPolicyConfig::default(),
            dispatcher: DispatcherSection::default(),
            validator: ValidatorSection::default(),
            protocol: ProtocolSection::default(),
            vardiff: VardiffSection::default(),
            ban_policy: BanPolicySection::default(),
            session: SessionSection::default(),
            stratum: StratumSection::default(),
            ws_getwork: WsGetworkSection::default(),
            xatum: XatumSection::default(),
            wallet: WalletSection::default(),
            payout: PayoutSection::default(),
            unlocker: UnlockerSection::default(),
            admin: AdminSection::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(config::Environment::with_prefix("TOS_POOL").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn max_target(&self) -> anyhow::Result<[u8; 32]> {
        let bytes = tos_pool_util::hex_to_bytes(&self.max_target_hex)?;
        if bytes.len() != 32 {
            anyhow::bail!("max_target_hex must decode to exactly 32 bytes, got {}", bytes.len());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub redis_url: Option<String>,

    /// TTL applied to the per-address hashrate zset (spec §4.2: "has a TTL
    /// >= hashrate window"). Should be at least as wide as the largest
    /// window any hashrate query uses.
    pub hashrate_window_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { redis_url: None, hashrate_window_secs: 3600 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamEntry {
    pub name: String,
    pub url: String,
    pub weight: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamPolicyConfig {
    pub health_check_interval_secs: u64,
    pub max_failures: u32,
    pub recovery_threshold: u32,
}

impl Default for UpstreamPolicyConfig {
    fn default() -> Self {
        UpstreamPolicyConfig { health_check_interval_secs: 15, max_failures: 3, recovery_threshold: 2 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub job_refresh_interval_secs: u64,
    pub job_max_age_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        DispatcherSection { job_refresh_interval_secs: 1, job_max_age_secs: 60 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub dup_tracker_capacity: usize,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        ValidatorSection { dup_tracker_capacity: 4096 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub extranonce1_width: usize,
    pub extranonce2_size: usize,
    pub initial_difficulty: f64,
    pub stale_grace_secs: u64,
    pub trust_threshold: f64,
    pub trust_check_percent: u8,
    pub recent_jobs_kept: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        ProtocolSection {
            extranonce1_width: 4,
            extranonce2_size: 4,
            initial_difficulty: 16384.0,
            stale_grace_secs: 30,
            trust_threshold: 0.99,
            trust_check_percent: 10,
            recent_jobs_kept: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VardiffSection {
    pub target_time_secs: f64,
    pub retarget_secs: u64,
    pub variance: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

impl Default for VardiffSection {
    fn default() -> Self {
        VardiffSection {
            target_time_secs: 10.0,
            retarget_secs: 60,
            variance: 0.3,
            min_difficulty: 1.0,
            max_difficulty: 1_000_000_000.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BanPolicySection {
    pub ban_threshold_percent: f64,
    pub ban_duration_secs: u64,
    pub malformed_json_limit: u32,
    pub max_connections_per_ip: u32,
    pub min_shares_for_ratio: u64,
}

impl Default for BanPolicySection {
    fn default() -> Self {
        BanPolicySection {
            ban_threshold_percent: 50.0,
            ban_duration_secs: 3600,
            malformed_json_limit: 10,
            max_connections_per_ip: 8,
            min_shares_for_ratio: 20,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub idle_timeout_secs: u64,
    pub initial_grace_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection { idle_timeout_secs: 600, initial_grace_secs: 60, housekeeping_interval_secs: 30 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StratumSection {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    pub max_line_bytes: usize,
}

impl Default for StratumSection {
    fn default() -> Self {
        StratumSection { enabled: true, bind_addr: "0.0.0.0:3333".parse().unwrap(), max_line_bytes: 8192 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WsGetworkSection {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for WsGetworkSection {
    fn default() -> Self {
        WsGetworkSection { enabled: false, bind_addr: "0.0.0.0:3334".parse().unwrap() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct XatumSection {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
}

impl Default for XatumSection {
    fn default() -> Self {
        XatumSection {
            enabled: false,
            bind_addr: "0.0.0.0:3335".parse().unwrap(),
            cert_path: "tls/cert.pem".into(),
            key_path: "tls/key.pem".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WalletSection {
    pub url: String,
    pub timeout_secs: u64,
    pub basic_auth_user: Option<String>,
    pub basic_auth_pass: Option<String>,
}

impl WalletSection {
    pub fn basic_auth(&self) -> Option<(String, String)> {
        match (&self.basic_auth_user, &self.basic_auth_pass) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

impl Default for WalletSection {
    fn default() -> Self {
        WalletSection {
            url: "http://127.0.0.1:8545".into(),
            timeout_secs: 30,
            basic_auth_user: None,
            basic_auth_pass: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PayoutSection {
    pub threshold: u64,
    pub withdrawal_fee_fixed: u64,
    pub withdrawal_fee_rate: f64,
    pub max_addresses_per_tx: usize,
    pub lock_ttl_secs: u64,
    pub wallet_max_attempts: u32,
    pub reconcile_grace_secs: u64,
    pub interval_secs: u64,
}

impl Default for PayoutSection {
    fn default() -> Self {
        PayoutSection {
            threshold: 1_000_000_000,
            withdrawal_fee_fixed: 1_000_000,
            withdrawal_fee_rate: 0.0,
            max_addresses_per_tx: 50,
            lock_ttl_secs: 120,
            wallet_max_attempts: 3,
            reconcile_grace_secs: 600,
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UnlockerSection {
    pub immature_depth: u64,
    pub mature_depth: u64,
    pub reorg_check_window: u64,
    pub pool_fee_percent: f64,
    pub fee_address: String,
    pub interval_secs: u64,
}

impl Default for UnlockerSection {
    fn default() -> Self {
        UnlockerSection {
            immature_depth: 10,
            mature_depth: 60,
            reorg_check_window: 3,
            pool_fee_percent: 1.0,
            fee_address: String::new(),
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    pub token: String,
    pub cors_domains: Vec<String>,
}

impl Default for AdminSection {
    fn default() -> Self {
        AdminSection {
            enabled: true,
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            token: String::new(),
            cors_domains: Vec::new(),
        }
    }
}
