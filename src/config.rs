use std::path::PathBuf;

use ulid::Ulid;

use crate::engine::PromotionStrategy;

/// Paths of the PEM certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once at startup from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub admins: Vec<Ulid>,
    pub max_connections: usize,
    /// WAL appends after which the background compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// Create the default providers on startup if they are missing.
    pub seed: bool,
    pub promotion: PromotionStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotwise".into(),
            admins: Vec::new(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            seed: false,
            promotion: PromotionStrategy::Fifo,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, reason: String },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
            ConfigError::TlsPair => write!(
                f,
                "both SLOTWISE_TLS_CERT and SLOTWISE_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(v) = get("SLOTWISE_PORT") {
            config.port = parse("SLOTWISE_PORT", &v)?;
        }
        if let Some(v) = get("SLOTWISE_BIND") {
            config.bind = v;
        }
        if let Some(v) = get("SLOTWISE_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SLOTWISE_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = get("SLOTWISE_ADMINS") {
            config.admins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse("SLOTWISE_ADMINS", s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("SLOTWISE_MAX_CONNECTIONS") {
            config.max_connections = parse("SLOTWISE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("SLOTWISE_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("SLOTWISE_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SLOTWISE_METRICS_PORT") {
            config.metrics_port = Some(parse("SLOTWISE_METRICS_PORT", &v)?);
        }
        if let Some(v) = get("SLOTWISE_SEED") {
            config.seed = parse_flag("SLOTWISE_SEED", &v)?;
        }
        if let Some(v) = get("SLOTWISE_PROMOTION") {
            config.promotion = parse("SLOTWISE_PROMOTION", &v)?;
        }
        config.tls = match (get("SLOTWISE_TLS_CERT"), get("SLOTWISE_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "SLOTWISE_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotwise.wal"));
    }

    #[test]
    fn reads_all_variables() {
        let admin = Ulid::new();
        let admin_list = format!("{admin}, ");
        let config = from_pairs(&[
            ("SLOTWISE_PORT", "6543"),
            ("SLOTWISE_BIND", "127.0.0.1"),
            ("SLOTWISE_DATA_DIR", "/var/lib/slotwise"),
            ("SLOTWISE_PASSWORD", "hunter2"),
            ("SLOTWISE_ADMINS", &admin_list),
            ("SLOTWISE_MAX_CONNECTIONS", "8"),
            ("SLOTWISE_COMPACT_THRESHOLD", "50"),
            ("SLOTWISE_METRICS_PORT", "9090"),
            ("SLOTWISE_TLS_CERT", "cert.pem"),
            ("SLOTWISE_TLS_KEY", "key.pem"),
            ("SLOTWISE_SEED", "yes"),
            ("SLOTWISE_PROMOTION", "nearest"),
        ])
        .unwrap();

        assert_eq!(config.port, 6543);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotwise"));
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.admins, vec![admin]);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(
            config.tls,
            Some(TlsPaths {
                cert: "cert.pem".into(),
                key: "key.pem".into()
            })
        );
        assert!(config.seed);
        assert_eq!(config.promotion, PromotionStrategy::Nearest);
    }

    #[test]
    fn tls_requires_both_paths() {
        assert_eq!(
            from_pairs(&[("SLOTWISE_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPair)
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = from_pairs(&[("SLOTWISE_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("SLOTWISE_PORT"));

        let err = from_pairs(&[("SLOTWISE_ADMINS", "root")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SLOTWISE_ADMINS", .. }));

        assert!(from_pairs(&[("SLOTWISE_PROMOTION", "random")]).is_err());
        assert!(from_pairs(&[("SLOTWISE_SEED", "maybe")]).is_err());
        assert!(from_pairs(&[("SLOTWISE_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = from_pairs(&[("SLOTWISE_PORT", "  ")]).unwrap();
        assert_eq!(config.port, 5433);
    }
}
