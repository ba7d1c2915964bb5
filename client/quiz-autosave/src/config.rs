use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;
use url::Url;

use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub autosave: AutosaveSettings,
    pub gateway: GatewaySettings,
    pub backup: BackupSettings,
    pub dev_server: DevServerSettings,
}

/// Timing and retry knobs of the save pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AutosaveSettings {
    pub debounce: Duration,
    pub retry: RetryPolicy,
    pub success_display: Duration,
    pub request_timeout: Duration,
    pub flush_timeout: Duration,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(3000),
            retry: RetryPolicy::default(),
            success_display: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(10_000),
            flush_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Http,
    Mock,
}

impl FromStr for GatewayKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(GatewayKind::Http),
            "mock" => Ok(GatewayKind::Mock),
            other => Err(ConfigError::Message(format!(
                "Unknown gateway kind '{}', expected 'http' or 'mock'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub kind: GatewayKind,
    pub api_base_url: Url,
    pub auth_token: Option<String>,
    pub mock_latency: Duration,
    pub mock_failure_rate: f64,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DevServerSettings {
    pub bind_addr: String,
    /// Bearer token the dev server requires; `None` disables the check.
    pub auth_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Self::from_settings(&settings)
    }

    /// Extracts values with fallbacks to plain ENV variables or defaults.
    pub fn from_settings(settings: &config::Config) -> Result<Self, ConfigError> {
        let defaults = AutosaveSettings::default();

        let max_attempts = read_u64(
            settings,
            "autosave.max_retries",
            Some("AUTOSAVE_MAX_RETRIES"),
            defaults.retry.max_attempts as u64,
        )
        .clamp(1, u32::MAX as u64) as u32;

        let retry = RetryPolicy {
            max_attempts,
            base_backoff: read_millis(
                settings,
                "autosave.retry_delay_ms",
                Some("AUTOSAVE_RETRY_DELAY_MS"),
                defaults.retry.base_backoff,
            ),
            max_backoff: read_millis(
                settings,
                "autosave.max_retry_delay_ms",
                None,
                defaults.retry.max_backoff,
            ),
            jitter_max: Some(read_millis(
                settings,
                "autosave.retry_jitter_ms",
                None,
                Duration::ZERO,
            ))
            .filter(|jitter| !jitter.is_zero()),
        };

        let autosave = AutosaveSettings {
            debounce: read_millis(
                settings,
                "autosave.debounce_ms",
                Some("AUTOSAVE_DEBOUNCE_MS"),
                defaults.debounce,
            ),
            retry,
            success_display: read_millis(
                settings,
                "autosave.success_display_ms",
                None,
                defaults.success_display,
            ),
            request_timeout: read_millis(
                settings,
                "autosave.request_timeout_ms",
                None,
                defaults.request_timeout,
            ),
            flush_timeout: read_millis(
                settings,
                "autosave.flush_timeout_ms",
                None,
                defaults.flush_timeout,
            ),
        };

        let kind = read_string(settings, "gateway.kind", Some("AUTOSAVE_GATEWAY"))
            .map(|value| value.parse::<GatewayKind>())
            .transpose()?
            .unwrap_or(GatewayKind::Http);

        let api_base_url = read_string(settings, "gateway.api_base_url", Some("API_BASE_URL"))
            .unwrap_or_else(|| "http://localhost:8081/api".to_string());
        let api_base_url = Url::parse(&api_base_url).map_err(|e| {
            ConfigError::Message(format!("Invalid gateway.api_base_url '{}': {}", api_base_url, e))
        })?;

        let mock_failure_rate = settings
            .get_float("gateway.mock_failure_rate")
            .unwrap_or(0.0);
        if !(0.0..=1.0).contains(&mock_failure_rate) {
            return Err(ConfigError::Message(format!(
                "gateway.mock_failure_rate must be within 0..=1, got {}",
                mock_failure_rate
            )));
        }

        let gateway = GatewaySettings {
            kind,
            api_base_url,
            auth_token: read_string(settings, "gateway.auth_token", Some("AUTH_TOKEN")),
            mock_latency: read_millis(
                settings,
                "gateway.mock_latency_ms",
                None,
                Duration::from_millis(200),
            ),
            mock_failure_rate,
        };

        let backup = BackupSettings {
            dir: read_string(settings, "backup.dir", Some("AUTOSAVE_BACKUP_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".autosave")),
        };

        let dev_server = DevServerSettings {
            bind_addr: read_string(settings, "dev_server.bind_addr", Some("DEV_SERVER_ADDR"))
                .unwrap_or_else(|| "127.0.0.1:8081".to_string()),
            auth_token: read_string(settings, "dev_server.auth_token", None),
        };

        Ok(Config {
            autosave,
            gateway,
            backup,
            dev_server,
        })
    }
}

fn read_string(settings: &config::Config, key: &str, env_key: Option<&str>) -> Option<String> {
    settings
        .get_string(key)
        .ok()
        .or_else(|| env_key.and_then(|k| env::var(k).ok()))
        .filter(|value| !value.trim().is_empty())
}

fn read_u64(settings: &config::Config, key: &str, env_key: Option<&str>, default: u64) -> u64 {
    settings
        .get_int(key)
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .or_else(|| env_key.and_then(|k| env::var(k).ok()?.parse::<u64>().ok()))
        .unwrap_or(default)
}

fn read_millis(
    settings: &config::Config,
    key: &str,
    env_key: Option<&str>,
    default: Duration,
) -> Duration {
    Duration::from_millis(read_u64(settings, key, env_key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(overrides: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        Config::from_settings(&builder.build()?)
    }

    #[test]
    fn explicit_settings_override_defaults() {
        let config = build(&[
            ("autosave.debounce_ms", "500"),
            ("autosave.max_retries", "5"),
            ("autosave.retry_delay_ms", "250"),
            ("gateway.kind", "mock"),
            ("gateway.api_base_url", "https://quiz.example.com/api"),
            ("backup.dir", "/tmp/autosave"),
        ])
        .unwrap();

        assert_eq!(config.autosave.debounce, Duration::from_millis(500));
        assert_eq!(config.autosave.retry.max_attempts, 5);
        assert_eq!(config.autosave.retry.base_backoff, Duration::from_millis(250));
        assert_eq!(config.autosave.retry.jitter_max, None);
        assert_eq!(config.gateway.kind, GatewayKind::Mock);
        assert_eq!(config.gateway.api_base_url.host_str(), Some("quiz.example.com"));
        assert_eq!(config.backup.dir, PathBuf::from("/tmp/autosave"));
    }

    #[test]
    fn zero_retries_is_clamped_to_one_attempt() {
        let config = build(&[("autosave.max_retries", "0")]).unwrap();
        assert_eq!(config.autosave.retry.max_attempts, 1);
    }

    #[test]
    fn unknown_gateway_kind_is_rejected() {
        assert!(build(&[("gateway.kind", "carrier-pigeon")]).is_err());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(build(&[("gateway.api_base_url", "not a url")]).is_err());
    }

    #[test]
    fn failure_rate_must_be_a_probability() {
        assert!(build(&[("gateway.mock_failure_rate", "1.5")]).is_err());
    }
}
