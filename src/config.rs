use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `GATEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// JSON seed for the directory; an empty directory when unset.
    pub directory: Option<PathBuf>,
    pub utc_offset_minutes: i32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "gatebook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            directory: None,
            utc_offset_minutes: 0,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "GATEBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("GATEBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("GATEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("GATEBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "GATEBOOK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "GATEBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            directory: lookup("GATEBOOK_DIRECTORY").map(PathBuf::from),
            utc_offset_minutes: parsed(&lookup, "GATEBOOK_UTC_OFFSET_MINUTES")
                .unwrap_or(defaults.utc_offset_minutes),
            tls_cert: lookup("GATEBOOK_TLS_CERT"),
            tls_key: lookup("GATEBOOK_TLS_KEY"),
            metrics_port: parsed(&lookup, "GATEBOOK_METRICS_PORT"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("appointments.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
