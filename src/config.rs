//! Settings loaded from defaults, optional files and the environment
//!
//! Later sources override earlier ones:
//! built-in defaults → `config/default` → `config/{ENVIRONMENT}` →
//! `config/local` → the file named by `LLM_PROXY_CONFIG` → `LLM_PROXY_*`
//! variables (`__` separates nested keys, e.g. `LLM_PROXY_LOKI__URL`) →
//! `BEDROCK_REGION`.

use crate::infrastructure::loki_exporter::{BatchSize, LokiConfig};
use crate::proxy::types::{ProxyConfig, DEFAULT_MAX_REQUEST_BODY};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub use config::ConfigError;

/// Variable naming an extra settings file
pub const CONFIG_FILE_ENV: &str = "LLM_PROXY_CONFIG";
pub const ENV_PREFIX: &str = "LLM_PROXY";
pub const BEDROCK_REGION_ENV: &str = "BEDROCK_REGION";

/// Headers always masked in logs
pub const DEFAULT_EXTRA_SENSITIVE_HEADERS: &[&str] = &["x-amz-security-token"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub listen_host: String,
    pub listen_port: u16,
    pub log_root: PathBuf,
    pub machine_id: String,
    /// Added to the fixed list of masked header names
    #[serde(default)]
    pub sensitive_header_names: Vec<String>,
    /// Provider name to dotted JSON paths, replacing that provider's defaults
    #[serde(default)]
    pub client_session_id_json_paths: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub upstream_overrides: Vec<UpstreamOverride>,
    pub max_request_body: usize,
    #[serde(
        default,
        with = "duration_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_read_timeout: Option<Duration>,
    pub max_open_files: usize,
    pub loki: LokiSettings,
    pub bedrock: BedrockSettings,
    pub logging: LoggingSettings,
}

/// Send requests for `host` to `base_url` instead of `https://host`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamOverride {
    pub host: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LokiSettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub batch_size: usize,
    #[serde(with = "duration_format")]
    pub batch_wait: Duration,
    pub retry_max: u32,
    pub use_gzip: bool,
    pub environment: String,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BedrockSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Base URL replacing `https://bedrock-runtime.<region>.amazonaws.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8787,
            log_root: default_log_root(),
            machine_id: default_machine_id(),
            sensitive_header_names: DEFAULT_EXTRA_SENSITIVE_HEADERS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            client_session_id_json_paths: HashMap::new(),
            upstream_overrides: Vec::new(),
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            idle_read_timeout: None,
            max_open_files: 256,
            loki: LokiSettings::default(),
            bedrock: BedrockSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LokiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            auth_token: None,
            batch_size: 100,
            batch_wait: Duration::from_secs(1),
            retry_max: 5,
            use_gzip: true,
            environment: "local".to_string(),
            queue_capacity: 10_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_log_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm-proxy")
        .join("logs")
}

fn default_machine_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Ok(path) = env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(File::with_name(&path));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("sensitive_header_names"),
            )
            .set_override_option("bedrock.region", env::var(BEDROCK_REGION_ENV).ok())?
            .build()?
            .try_deserialize()
    }

    pub fn sessions_db_path(&self) -> PathBuf {
        self.log_root.join("sessions.db")
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            machine_id: self.machine_id.clone(),
            max_request_body: self.max_request_body,
            idle_read_timeout: self.idle_read_timeout,
            upstream_overrides: self
                .upstream_overrides
                .iter()
                .map(|o| (o.host.to_ascii_lowercase(), o.base_url.clone()))
                .collect(),
        }
    }
}

impl LokiSettings {
    /// Exporter configuration, `None` when export is off or has no URL
    pub fn exporter_config(&self) -> Result<Option<LokiConfig>, ConfigError> {
        let url = match (&self.url, self.enabled) {
            (Some(url), true) if !url.is_empty() => url.clone(),
            _ => return Ok(None),
        };
        let batch_size = BatchSize::try_new(self.batch_size)
            .map_err(|e| ConfigError::Message(format!("loki.batch_size: {e}")))?;
        Ok(Some(LokiConfig {
            url,
            auth_token: self.auth_token.clone().filter(|t| !t.is_empty()),
            batch_size,
            batch_wait: self.batch_wait,
            retry_max: self.retry_max,
            use_gzip: self.use_gzip,
            environment: self.environment.clone(),
            queue_capacity: self.queue_capacity,
        }))
    }
}

/// Human-readable durations (`"1s"`, `"500ms"`) in settings
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(s) => humantime::parse_duration(s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen_host, "127.0.0.1");
        assert_eq!(settings.listen_port, 8787);
        assert!(settings.log_root.ends_with(".llm-proxy/logs"));
        assert!(!settings.machine_id.is_empty());
        assert_eq!(settings.sensitive_header_names, vec!["x-amz-security-token"]);
        assert_eq!(settings.max_open_files, 256);
        assert!(settings.idle_read_timeout.is_none());
        assert!(!settings.loki.enabled);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_durations_are_human_readable() {
        let loki: LokiSettings = serde_json::from_value(json!({
            "enabled": true,
            "url": "http://127.0.0.1:3100/loki/api/v1/push",
            "batch_size": 10,
            "batch_wait": "250ms",
            "retry_max": 2,
            "use_gzip": false,
            "environment": "test",
            "queue_capacity": 100
        }))
        .unwrap();
        assert_eq!(loki.batch_wait, Duration::from_millis(250));

        let value = serde_json::to_value(&loki).unwrap();
        assert_eq!(value["batch_wait"], "250ms");
    }

    #[test]
    fn test_exporter_config_requires_enabled_and_url() {
        let mut loki = LokiSettings::default();
        assert!(loki.exporter_config().unwrap().is_none());

        loki.url = Some("http://127.0.0.1:1".to_string());
        assert!(loki.exporter_config().unwrap().is_none());

        loki.enabled = true;
        let config = loki.exporter_config().unwrap().unwrap();
        assert_eq!(*config.batch_size.as_ref(), 100);

        loki.batch_size = 0;
        assert!(loki.exporter_config().is_err());
    }

    #[test]
    fn test_proxy_config_maps_overrides() {
        let settings = Settings {
            upstream_overrides: vec![UpstreamOverride {
                host: "API.Anthropic.com".to_string(),
                base_url: "http://127.0.0.1:9000".to_string(),
            }],
            idle_read_timeout: Some(Duration::from_secs(30)),
            ..Settings::default()
        };
        let proxy = settings.proxy_config();
        assert_eq!(
            proxy.upstream_overrides.get("api.anthropic.com").map(String::as_str),
            Some("http://127.0.0.1:9000")
        );
        assert_eq!(proxy.idle_read_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_settings_file_layering() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            r#"
listen_port = 9999
idle_read_timeout = "2m"

[[upstream_overrides]]
host = "api.openai.com"
base_url = "http://127.0.0.1:4000"

[client_session_id_json_paths]
openai = ["metadata.session"]

[loki]
enabled = true
url = "http://loki:3100/loki/api/v1/push"
batch_wait = "5s"
"#,
        )
        .unwrap();

        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default()).unwrap())
            .add_source(File::from(path.as_path()))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.listen_port, 9999);
        assert_eq!(settings.listen_host, "127.0.0.1");
        assert_eq!(settings.idle_read_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.upstream_overrides[0].host, "api.openai.com");
        assert_eq!(
            settings.client_session_id_json_paths["openai"],
            vec!["metadata.session".to_string()]
        );
        assert!(settings.loki.enabled);
        assert_eq!(settings.loki.batch_wait, Duration::from_secs(5));
        assert_eq!(settings.loki.batch_size, 100);
    }
}
