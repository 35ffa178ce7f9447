#![forbid(unsafe_code)]

use std::path::PathBuf;

use base64::Engine as _;
use vocare_engines::phone::PhoneNormalizer;
use vocare_engines::token::{SigningSecret, TokenConfig, TokenIssueError};
use vocare_storage::json_file::default_store_path;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_ROSTER_RELOAD_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Every accepted submission is written to the store before responding.
    Direct,
    /// Accepted submissions wait in the pending buffer for collection or flush.
    Buffered,
}

impl PersistenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Buffered => "buffered",
        }
    }
}

/// When a durable row is first created for a phone key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPolicy {
    OnLogin,
    OnSubmission,
}

impl CreationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnLogin => "on_login",
            Self::OnSubmission => "on_submission",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("VOCARE_PERSISTENCE_MODE must be 'direct' or 'buffered', got '{0}'")]
    UnknownPersistenceMode(String),
    #[error("VOCARE_IDENTITY_CREATION must be 'on_login' or 'on_submission', got '{0}'")]
    UnknownCreationPolicy(String),
    #[error("no numbering plan for region '{0}'")]
    UnsupportedRegion(String),
    #[error("set only one of VOCARE_TOKEN_SECRET and VOCARE_TOKEN_SECRET_B64")]
    ConflictingSecrets,
    #[error("VOCARE_TOKEN_SECRET_B64 is not valid base64")]
    SecretEncoding,
    #[error("token secret rejected: {0}")]
    Secret(#[from] TokenIssueError),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub http_bind: String,
    pub token: TokenConfig,
    /// `None` means a random secret is generated at startup.
    pub token_secret: Option<SigningSecret>,
    pub persistence: PersistenceMode,
    pub creation: CreationPolicy,
    pub store_path: PathBuf,
    /// `None` disables periodic reloads.
    pub roster_reload_interval_ms: Option<u64>,
    pub flush_worker_enabled: bool,
    pub flush_interval_ms: u64,
    pub region: String,
}

impl ServiceConfig {
    pub fn mvp_v1() -> Self {
        Self {
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            token: TokenConfig::mvp_v1(),
            token_secret: None,
            persistence: PersistenceMode::Buffered,
            creation: CreationPolicy::OnSubmission,
            store_path: default_store_path(),
            roster_reload_interval_ms: Some(DEFAULT_ROSTER_RELOAD_INTERVAL_MS),
            flush_worker_enabled: false,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            region: "BR".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Out-of-range numbers fall back to their defaults; unknown enum values
    /// and bad secrets are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::mvp_v1();
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(bind) = var("VOCARE_HTTP_BIND") {
            config.http_bind = bind;
        }
        if let Some(token) = parse_bounded_u64(var("VOCARE_TOKEN_TTL_MINUTES"), 1..=1_440)
            .and_then(|minutes| TokenConfig::with_ttl_minutes(minutes).ok())
        {
            config.token = token;
        }
        config.token_secret = parse_token_secret(
            var("VOCARE_TOKEN_SECRET"),
            var("VOCARE_TOKEN_SECRET_B64"),
        )?;

        if let Some(mode) = var("VOCARE_PERSISTENCE_MODE") {
            config.persistence = match mode.to_ascii_lowercase().as_str() {
                "direct" => PersistenceMode::Direct,
                "buffered" => PersistenceMode::Buffered,
                _ => return Err(ConfigError::UnknownPersistenceMode(mode)),
            };
        }
        if let Some(policy) = var("VOCARE_IDENTITY_CREATION") {
            config.creation = match policy.to_ascii_lowercase().as_str() {
                "on_login" => CreationPolicy::OnLogin,
                "on_submission" => CreationPolicy::OnSubmission,
                _ => return Err(ConfigError::UnknownCreationPolicy(policy)),
            };
        }
        if let Some(path) = var("VOCARE_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }

        match var("VOCARE_ROSTER_RELOAD_INTERVAL_MS").as_deref() {
            Some("0") => config.roster_reload_interval_ms = None,
            raw => {
                if let Some(ms) =
                    parse_bounded_u64(raw.map(str::to_string), 1_000..=86_400_000)
                {
                    config.roster_reload_interval_ms = Some(ms);
                }
            }
        }
        config.flush_worker_enabled = parse_flag(var("VOCARE_FLUSH_WORKER_ENABLED"), false);
        if let Some(ms) = parse_bounded_u64(var("VOCARE_FLUSH_INTERVAL_MS"), 100..=600_000) {
            config.flush_interval_ms = ms;
        }

        if let Some(region) = var("VOCARE_REGION") {
            if PhoneNormalizer::for_region(&region).is_none() {
                return Err(ConfigError::UnsupportedRegion(region));
            }
            config.region = region.to_ascii_uppercase();
        }

        Ok(config)
    }

    pub fn phone_normalizer(&self) -> Result<PhoneNormalizer, ConfigError> {
        PhoneNormalizer::for_region(&self.region)
            .ok_or_else(|| ConfigError::UnsupportedRegion(self.region.clone()))
    }
}

fn parse_bounded_u64(raw: Option<String>, range: std::ops::RangeInclusive<u64>) -> Option<u64> {
    raw.and_then(|v| v.parse::<u64>().ok())
        .filter(|v| range.contains(v))
}

fn parse_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            _ => default,
        },
        None => default,
    }
}

fn parse_token_secret(
    raw: Option<String>,
    b64: Option<String>,
) -> Result<Option<SigningSecret>, ConfigError> {
    match (raw, b64) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingSecrets),
        (Some(raw), None) => Ok(Some(SigningSecret::new(raw.into_bytes())?)),
        (None, Some(b64)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map_err(|_| ConfigError::SecretEncoding)?;
            Ok(Some(SigningSecret::new(bytes)?))
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::Engine as _;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn at_config_01_defaults_without_env() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_bind, DEFAULT_HTTP_BIND);
        assert_eq!(config.token.ttl_secs, 3_600);
        assert!(config.token_secret.is_none());
        assert_eq!(config.persistence, PersistenceMode::Buffered);
        assert_eq!(config.creation, CreationPolicy::OnSubmission);
        assert_eq!(config.roster_reload_interval_ms, Some(300_000));
        assert!(!config.flush_worker_enabled);
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.region, "BR");
    }

    #[test]
    fn at_config_02_out_of_range_numbers_fall_back() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("VOCARE_TOKEN_TTL_MINUTES", "0"),
            ("VOCARE_FLUSH_INTERVAL_MS", "5"),
            ("VOCARE_ROSTER_RELOAD_INTERVAL_MS", "abc"),
        ]))
        .unwrap();
        assert_eq!(config.token.ttl_secs, 3_600);
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.roster_reload_interval_ms, Some(300_000));

        let config = ServiceConfig::from_lookup(lookup(&[
            ("VOCARE_TOKEN_TTL_MINUTES", "15"),
            ("VOCARE_ROSTER_RELOAD_INTERVAL_MS", "0"),
            ("VOCARE_FLUSH_WORKER_ENABLED", " Yes "),
        ]))
        .unwrap();
        assert_eq!(config.token.ttl_secs, 900);
        assert_eq!(config.roster_reload_interval_ms, None);
        assert!(config.flush_worker_enabled);
    }

    #[test]
    fn at_config_03_policies_parse_or_fail() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("VOCARE_PERSISTENCE_MODE", "DIRECT"),
            ("VOCARE_IDENTITY_CREATION", "on_login"),
        ]))
        .unwrap();
        assert_eq!(config.persistence, PersistenceMode::Direct);
        assert_eq!(config.creation, CreationPolicy::OnLogin);

        assert_eq!(
            ServiceConfig::from_lookup(lookup(&[("VOCARE_PERSISTENCE_MODE", "sheets")]))
                .unwrap_err(),
            ConfigError::UnknownPersistenceMode("sheets".to_string())
        );
        assert!(matches!(
            ServiceConfig::from_lookup(lookup(&[("VOCARE_REGION", "US")])),
            Err(ConfigError::UnsupportedRegion(_))
        ));
    }

    #[test]
    fn at_config_04_secret_sources() {
        let raw = "0123456789abcdef0123456789abcdef";
        let config =
            ServiceConfig::from_lookup(lookup(&[("VOCARE_TOKEN_SECRET", raw)])).unwrap();
        assert_eq!(
            config.token_secret,
            Some(SigningSecret::new(raw.as_bytes().to_vec()).unwrap())
        );

        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let config =
            ServiceConfig::from_lookup(lookup(&[("VOCARE_TOKEN_SECRET_B64", b64.as_str())]))
                .unwrap();
        assert_eq!(
            config.token_secret,
            Some(SigningSecret::new(vec![7u8; 32]).unwrap())
        );

        assert!(matches!(
            ServiceConfig::from_lookup(lookup(&[("VOCARE_TOKEN_SECRET", "short")])),
            Err(ConfigError::Secret(TokenIssueError::WeakSecret { got: 5 }))
        ));
        assert_eq!(
            ServiceConfig::from_lookup(lookup(&[("VOCARE_TOKEN_SECRET_B64", "***")]))
                .unwrap_err(),
            ConfigError::SecretEncoding
        );
        assert_eq!(
            ServiceConfig::from_lookup(lookup(&[
                ("VOCARE_TOKEN_SECRET", raw),
                ("VOCARE_TOKEN_SECRET_B64", b64.as_str()),
            ]))
            .unwrap_err(),
            ConfigError::ConflictingSecrets
        );
    }
}
