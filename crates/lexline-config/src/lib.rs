use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub auth: Auth,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub sla: Sla,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Static token for the synthetic admin principal.
    pub admin_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: i64,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: i64,
    /// Reserved: expiring sessions server-side is not implemented, so
    /// only `false` is accepted.
    #[serde(default)]
    pub auto_expiry: bool,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            max_duration_minutes: default_max_duration_minutes(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            auto_expiry: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sla {
    #[serde(default = "default_response_hours")]
    pub response_hours: i64,
}

impl Default for Sla {
    fn default() -> Self {
        Sla {
            response_hours: default_response_hours(),
        }
    }
}

fn default_max_duration_minutes() -> i64 {
    60
}

fn default_idle_timeout_minutes() -> i64 {
    10
}

fn default_response_hours() -> i64 {
    24
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.auth.admin_token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "auth.admin_token must be non-empty".to_string(),
        ));
    }
    if cfg.session.max_duration_minutes < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "session.max_duration_minutes must be >= 1".to_string(),
        ));
    }
    if cfg.session.idle_timeout_minutes < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "session.idle_timeout_minutes must be >= 1".to_string(),
        ));
    }
    if cfg.session.auto_expiry {
        return Err(ConfigError::UnsupportedConfig(
            "session.auto_expiry=true is not implemented; sessions end only on explicit command"
                .to_string(),
        ));
    }
    if cfg.sla.response_hours < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "sla.response_hours must be >= 1".to_string(),
        ));
    }
    Ok(())
}
