//! Configuration types: per-run campaign limits and SMTP relay settings.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Rate and volume constraints for one campaign run.
///
/// Immutable for the lifetime of the run; validated once at start. Delays
/// are an inclusive band in seconds from which each inter-send pause is
/// drawn uniformly at random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CampaignLimits {
    /// Minimum pause between consecutive attempts, in seconds.
    pub min_delay_secs: u64,
    /// Maximum pause between consecutive attempts, in seconds.
    pub max_delay_secs: u64,
    /// Maximum successful sends per calendar day.
    pub max_per_day: u32,
}

impl CampaignLimits {
    pub fn new(min_delay_secs: u64, max_delay_secs: u64, max_per_day: u32) -> Self {
        Self {
            min_delay_secs,
            max_delay_secs,
            max_per_day,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_secs < self.min_delay_secs {
            return Err(ConfigError::InvalidValue {
                key: "max_delay_secs".into(),
                message: format!(
                    "must be >= min_delay_secs ({} < {})",
                    self.max_delay_secs, self.min_delay_secs
                ),
            });
        }
        if self.max_per_day == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_per_day".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Build limits from `MAILFLOW_MIN_DELAY_SECS`, `MAILFLOW_MAX_DELAY_SECS`
    /// and `MAILFLOW_MAX_PER_DAY`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let limits = Self {
            min_delay_secs: env_parse("MAILFLOW_MIN_DELAY_SECS", 30)?,
            max_delay_secs: env_parse("MAILFLOW_MAX_DELAY_SECS", 60)?,
            max_per_day: env_parse("MAILFLOW_MAX_PER_DAY", 50)?,
        };
        limits.validate()?;
        Ok(limits)
    }
}

impl Default for CampaignLimits {
    fn default() -> Self {
        Self {
            min_delay_secs: 30,
            max_delay_secs: 60,
            max_per_day: 50,
        }
    }
}

/// SMTP relay configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILFLOW_SMTP_HOST` is not set (relay disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAILFLOW_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("MAILFLOW_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAILFLOW_SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("MAILFLOW_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("MAILFLOW_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
