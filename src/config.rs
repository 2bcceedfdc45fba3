use std::env;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment.
/// Every knob has a default so a bare `reelstream` invocation works.
#[derive(Debug, Clone)]
pub struct Config {
    pub download_root: PathBuf,
    pub listen_addr: SocketAddr,
    pub segment_duration_sec: u64,
    pub swarm_port_range: Range<u16>,
    pub max_retries: u32,
    pub retry_cooldown: Duration,
    pub seed_reap_after: Duration,
    pub evict_after_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            listen_addr: "0.0.0.0:8000".parse().unwrap(),
            segment_duration_sec: 600,
            swarm_port_range: 6881..6891,
            max_retries: 3,
            retry_cooldown: Duration::from_secs(30),
            seed_reap_after: Duration::from_secs(3600),
            evict_after_days: 30,
        }
    }
}

fn default_download_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("reelstream").join("downloads"))
        .unwrap_or_else(|| PathBuf::from("./downloads"))
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let download_root = env::var("DOWNLOAD_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.download_root);

        let listen_addr = parse_or(
            "LISTEN_ADDR",
            env::var("LISTEN_ADDR").ok().and_then(|v| v.parse().ok()),
            defaults.listen_addr,
        );

        let segment_duration_sec = parse_or(
            "SEGMENT_DURATION_SEC",
            env::var("SEGMENT_DURATION_SEC")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|d| *d > 0),
            defaults.segment_duration_sec,
        );

        let swarm_port_range = parse_or(
            "SWARM_PORT_RANGE",
            env::var("SWARM_PORT_RANGE")
                .ok()
                .and_then(|v| parse_port_range(&v)),
            defaults.swarm_port_range,
        );

        let max_retries = parse_or(
            "MAX_RETRIES",
            env::var("MAX_RETRIES").ok().and_then(|v| v.parse().ok()),
            defaults.max_retries,
        );

        let retry_cooldown = parse_or(
            "RETRY_COOLDOWN_SEC",
            env::var("RETRY_COOLDOWN_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            defaults.retry_cooldown,
        );

        let seed_reap_after = parse_or(
            "SEED_REAP_AFTER_SEC",
            env::var("SEED_REAP_AFTER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            defaults.seed_reap_after,
        );

        let evict_after_days = parse_or(
            "EVICT_AFTER_DAYS",
            env::var("EVICT_AFTER_DAYS").ok().and_then(|v| v.parse().ok()),
            defaults.evict_after_days,
        );

        Self {
            download_root,
            listen_addr,
            segment_duration_sec,
            swarm_port_range,
            max_retries,
            retry_cooldown,
            seed_reap_after,
            evict_after_days,
        }
    }

    /// Root directory for per-movie assets: `<download_root>/movies`.
    pub fn movies_dir(&self) -> PathBuf {
        self.download_root.join("movies")
    }
}

fn parse_or<T>(var: &str, parsed: Option<T>, default: T) -> T {
    if env::var_os(var).is_some() && parsed.is_none() {
        tracing::warn!("ignoring malformed {var}, using default");
    }
    parsed.unwrap_or(default)
}

/// `"6881-6891"` -> `6881..6891`. The upper bound is exclusive, matching
/// what librqbit expects for its listen range.
fn parse_port_range(s: &str) -> Option<Range<u16>> {
    let (lo, hi) = s.split_once('-')?;
    let lo: u16 = lo.trim().parse().ok()?;
    let hi: u16 = hi.trim().parse().ok()?;
    if lo >= hi {
        return None;
    }
    Some(lo..hi)
}
