// src/config.rs
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080). Port 0 picks an ephemeral port.
    pub port: u16,

    /// Directory request URLs are resolved under (default: /var/www/html)
    pub doc_root: PathBuf,

    /// Worker threads (default: one per CPU)
    pub workers: usize,

    /// Pin worker threads to cores (default: true)
    pub pin_workers: bool,

    /// Jobs the pool queue holds before refusing (default: 10000)
    pub max_requests: usize,

    /// Connection table size; descriptors at or above it are turned away
    /// (default: 65536)
    pub max_fd: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("/var/www/html"),
            workers: num_cpus::get(),
            pin_workers: true,
            max_requests: 10_000,
            max_fd: 65_536,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default)
        };

        Config {
            host: lookup("ETUDE_HOST").unwrap_or(defaults.host),
            port: lookup("ETUDE_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            doc_root: lookup("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            workers: number("ETUDE_WORKERS", defaults.workers),
            pin_workers: lookup("ETUDE_PIN_WORKERS")
                .map(|v| {
                    !matches!(
                        v.trim().to_lowercase().as_str(),
                        "false" | "0" | "no" | "off"
                    )
                })
                .unwrap_or(defaults.pin_workers),
            max_requests: number("ETUDE_MAX_REQUESTS", defaults.max_requests),
            max_fd: number("ETUDE_MAX_FD", defaults.max_fd),
        }
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
