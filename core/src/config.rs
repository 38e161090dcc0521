/// Configuration management
use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 7070;
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000/api";

/// Tunables for the event admission gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// How long an admission record stays active
    pub processing_window: Duration,

    /// Maximum acceptances of one event id inside a window
    pub max_processing_count: u32,

    /// Minimum gap between two globally admitted events
    pub min_processing_interval: Duration,

    /// How long the global lock is held after an acceptance
    pub lock_duration: Duration,

    /// Prune expired records every N admission calls
    pub prune_every: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            processing_window: Duration::from_secs(300),
            max_processing_count: 1,
            min_processing_interval: Duration::from_millis(300),
            lock_duration: Duration::from_secs(1),
            prune_every: 50,
        }
    }
}

/// Tunables for the rate-limited sync client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum gap between two regular fetches
    pub min_interval: Duration,

    /// Minimum gap for opportunistic fetches on app foreground
    pub background_min_interval: Duration,

    /// Backoff used when a 429 carries no advisory wait
    pub rate_limit_fallback: Duration,

    /// Page size used for badge reconciliation
    pub sync_page_size: u32,

    /// Periodic poll interval
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(30),
            background_min_interval: Duration::from_secs(10),
            rate_limit_fallback: Duration::from_secs(60),
            sync_page_size: 100,
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Tunables for the navigation router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    /// Pause before dispatching so the app can finish mounting
    pub settle_delay: Duration,

    /// Pause after a navigation before draining the pending slot
    pub drain_delay: Duration,

    /// Repeated taps on the same notification inside this window are dropped
    pub tap_dedup_window: Duration,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            drain_delay: Duration::from_millis(500),
            tap_dedup_window: Duration::from_secs(2),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the notification server (without trailing slash)
    pub server_url: String,

    /// Bearer token sent to the notification server
    pub auth_token: Option<String>,

    /// Signed-in user; socket messages sent by this user are not counted
    pub user_id: Option<String>,

    /// Local control API address
    pub api_addr: SocketAddr,

    /// Run the periodic poller
    pub enable_polling: bool,

    pub admission: AdmissionConfig,
    pub sync: SyncConfig,
    pub navigation: NavigationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            auth_token: None,
            user_id: None,
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            enable_polling: true,
            admission: AdmissionConfig::default(),
            sync: SyncConfig::default(),
            navigation: NavigationConfig::default(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let program = args
            .first()
            .cloned()
            .unwrap_or_else(|| "badgesyncd".to_string());
        let usage = || {
            format!(
                "Usage: {} [--server <url>] [--token <token>] [--user <id>] [--api-port <port>] [--poll-secs <n>] [--no-poll]",
                program
            )
        };

        let mut config = Self::default();
        let mut api_port: Option<u16> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        NotifyError::Config("--server requires a URL argument".to_string())
                    })?;
                    config.server_url = url.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        NotifyError::Config("--token requires a value".to_string())
                    })?;
                    config.auth_token = Some(token.clone());
                    i += 2;
                }
                "--user" => {
                    let user = args.get(i + 1).ok_or_else(|| {
                        NotifyError::Config("--user requires a user id".to_string())
                    })?;
                    config.user_id = Some(user.clone());
                    i += 2;
                }
                "--api-port" => {
                    let p = args.get(i + 1).ok_or_else(|| {
                        NotifyError::Config("--api-port requires a port argument".to_string())
                    })?;
                    api_port = Some(parse_port(p, "--api-port")?);
                    i += 2;
                }
                "--poll-secs" => {
                    let secs = args.get(i + 1).ok_or_else(|| {
                        NotifyError::Config("--poll-secs requires a number".to_string())
                    })?;
                    let secs = secs.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                        NotifyError::Config("--poll-secs must be a positive number".to_string())
                    })?;
                    config.sync.poll_interval = Duration::from_secs(secs);
                    i += 2;
                }
                "--no-poll" => {
                    config.enable_polling = false;
                    i += 1;
                }
                other => {
                    return Err(NotifyError::Config(format!(
                        "Unknown argument '{}'\n{}",
                        other,
                        usage()
                    )));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("BADGESYNC_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(token) = std::env::var("BADGESYNC_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Ok(p) = std::env::var("BADGESYNC_API_PORT") {
            api_port = Some(parse_port(&p, "BADGESYNC_API_PORT")?);
        }

        if let Some(port) = api_port {
            config.api_addr = SocketAddr::from(([127, 0, 0, 1], port));
        }

        if !config.server_url.starts_with("http://") {
            return Err(NotifyError::Config(format!(
                "Server URL must start with http:// (got '{}')\n{}",
                config.server_url,
                usage()
            )));
        }

        Ok(config)
    }
}

fn parse_port(value: &str, source: &str) -> Result<u16> {
    value.trim().parse::<u16>().map_err(|_| {
        NotifyError::Config(format!(
            "{} must be a valid number (0-65535), got '{}'",
            source, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_without_flags() {
        let config = Config::from_args(&args(&["badgesyncd"])).unwrap();
        assert!(config.enable_polling);
        assert_eq!(config.admission.max_processing_count, 1);
        assert_eq!(config.sync.min_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_flags_parsed() {
        let config = Config::from_args(&args(&[
            "badgesyncd",
            "--server",
            "http://api.local:8000/v1/",
            "--user",
            "u1",
            "--poll-secs",
            "15",
            "--no-poll",
        ]))
        .unwrap();
        assert_eq!(config.server_url, "http://api.local:8000/v1");
        assert_eq!(config.user_id.as_deref(), Some("u1"));
        assert_eq!(config.sync.poll_interval, Duration::from_secs(15));
        assert!(!config.enable_polling);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        assert!(Config::from_args(&args(&["badgesyncd", "--api-port", "nope"])).is_err());
        assert!(Config::from_args(&args(&["badgesyncd", "--poll-secs", "0"])).is_err());
        assert!(Config::from_args(&args(&["badgesyncd", "--server"])).is_err());
        assert!(Config::from_args(&args(&["badgesyncd", "--bogus"])).is_err());
    }

    #[test]
    fn test_port_parsing_shared_by_flag_and_env() {
        assert_eq!(parse_port("7171", "BADGESYNC_API_PORT").unwrap(), 7171);
        let err = parse_port("seventy", "BADGESYNC_API_PORT").unwrap_err();
        assert!(matches!(err, NotifyError::Config(ref m) if m.contains("BADGESYNC_API_PORT")));
        assert!(parse_port("70000", "--api-port").is_err());
    }
}
