use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use parley_core::ratelimit::RateLimitConfig;
use parley_core::CoreConfig;
use serde::{Deserialize, Serialize};

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Object-store collaborator. Only the bucket reaches the engine, for
    /// attachment URL validation.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:50054".into(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/parley.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "generate_secret")]
    pub jwt_secret: String,
    /// Remote identity collaborator. Local JWT validation is used when unset.
    pub user_service_addr: Option<String>,
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    pub firebase_credentials_path: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_secret(),
            user_service_addr: None,
            identity_timeout_ms: default_identity_timeout_ms(),
            firebase_credentials_path: None,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub slow_consumer_grace_ms: u64,
    pub drain_deadline_ms: u64,
    pub idle_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub rpc_deadline_ms: u64,
    pub registry_shards: usize,
    pub presence_offline_grace_ms: u64,
    pub membership_ttl_secs: u64,
    pub frames_per_minute: u32,
    pub typing_per_minute: u32,
    pub presence_per_minute: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            queue_capacity: core.queue_capacity,
            slow_consumer_grace_ms: core.slow_consumer_grace.as_millis() as u64,
            drain_deadline_ms: core.drain_deadline.as_millis() as u64,
            idle_threshold_secs: core.idle_threshold.as_secs(),
            sweep_interval_secs: core.sweep_interval.as_secs(),
            rpc_deadline_ms: core.rpc_deadline.as_millis() as u64,
            registry_shards: core.registry_shards,
            presence_offline_grace_ms: core.presence_offline_grace.as_millis() as u64,
            membership_ttl_secs: core.membership_ttl.as_secs(),
            frames_per_minute: core.rate_limits.frames_per_minute,
            typing_per_minute: core.rate_limits.typing_per_minute,
            presence_per_minute: core.rate_limits.presence_per_minute,
        }
    }
}

/// What happened while loading, reported once logging is up.
#[derive(Debug, Default)]
pub struct LoadNotes {
    pub generated: bool,
    pub warnings: Vec<String>,
}

fn default_max_connections() -> u32 {
    10
}

fn default_identity_timeout_ms() -> u64 {
    3000
}

fn generate_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn parse_knob<T: FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
    warnings: &mut Vec<String>,
) {
    if let Some(raw) = env(key) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warnings.push(format!("ignoring unparseable {key}={raw:?}; keeping default")),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn load(path: &str) -> Result<(Self, LoadNotes)> {
        Self::load_with(path, &|key| std::env::var(key).ok())
    }

    /// Reads (or generates) the TOML file, then applies environment overrides
    /// looked up through `env`.
    pub fn load_with(
        path: &str,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(Self, LoadNotes)> {
        let mut notes = LoadNotes::default();
        let mut config = if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            if let Some(parent) = Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config)?)?;
            notes.generated = true;
            config
        };

        config.apply_env(env, &mut notes.warnings);
        config.validate()?;
        Ok((config, notes))
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>, warnings: &mut Vec<String>) {
        if let Some(port) = non_empty(env("PORT")) {
            match port.parse::<u16>() {
                Ok(port) => self.server.bind_address = format!("0.0.0.0:{port}"),
                Err(_) => warnings.push(format!("ignoring unparseable PORT={port:?}; keeping default")),
            }
        }
        if let Some(value) = non_empty(env("PARLEY_BIND_ADDRESS")) {
            self.server.bind_address = value;
        }
        parse_knob(env, "PARLEY_LOG_FORMAT", &mut self.server.log_format, warnings);

        if let Some(host) = non_empty(env("DB_HOST")) {
            let port = non_empty(env("DB_PORT")).unwrap_or_else(|| "5432".into());
            let user = non_empty(env("DB_USER")).unwrap_or_else(|| "postgres".into());
            let password = env("DB_PASSWORD").unwrap_or_default();
            let name = non_empty(env("DB_NAME")).unwrap_or_else(|| "parley".into());
            self.database.url = format!("postgres://{user}:{password}@{host}:{port}/{name}");
        }
        if let Some(url) = non_empty(env("PARLEY_DATABASE_URL")) {
            self.database.url = url;
        }

        if let Some(addr) = non_empty(env("USER_SERVICE_ADDR")) {
            self.auth.user_service_addr = Some(addr);
        }
        if let Some(secret) = non_empty(env("JWT_SECRET")) {
            self.auth.jwt_secret = secret;
        }
        if let Some(path) = non_empty(env("FIREBASE_CREDENTIALS_PATH")) {
            self.auth.firebase_credentials_path = Some(path);
        }

        if let Some(region) = non_empty(env("AWS_REGION")) {
            self.object_store.region = Some(region);
        }
        if let Some(bucket) = non_empty(env("AWS_S3_BUCKET")) {
            self.object_store.bucket = Some(bucket);
        }
        if let Some(key) = non_empty(env("AWS_ACCESS_KEY_ID")) {
            self.object_store.access_key_id = Some(key);
        }
        if let Some(secret) = non_empty(env("AWS_SECRET_ACCESS_KEY")) {
            self.object_store.secret_access_key = Some(secret);
        }

        let engine = &mut self.engine;
        parse_knob(env, "PARLEY_QUEUE_CAPACITY", &mut engine.queue_capacity, warnings);
        parse_knob(env, "PARLEY_SLOW_CONSUMER_GRACE_MS", &mut engine.slow_consumer_grace_ms, warnings);
        parse_knob(env, "PARLEY_DRAIN_DEADLINE_MS", &mut engine.drain_deadline_ms, warnings);
        parse_knob(env, "PARLEY_IDLE_THRESHOLD_SECS", &mut engine.idle_threshold_secs, warnings);
        parse_knob(env, "PARLEY_SWEEP_INTERVAL_SECS", &mut engine.sweep_interval_secs, warnings);
        parse_knob(env, "PARLEY_RPC_DEADLINE_MS", &mut engine.rpc_deadline_ms, warnings);
        parse_knob(env, "PARLEY_REGISTRY_SHARDS", &mut engine.registry_shards, warnings);
        parse_knob(
            env,
            "PARLEY_PRESENCE_OFFLINE_GRACE_MS",
            &mut engine.presence_offline_grace_ms,
            warnings,
        );
    }

    fn validate(&self) -> Result<()> {
        if self.auth.user_service_addr.is_none()
            && self.auth.jwt_secret.trim().len() < MIN_JWT_SECRET_LEN
        {
            anyhow::bail!(
                "Invalid auth.jwt_secret: local token validation needs a secret of at least {MIN_JWT_SECRET_LEN} characters"
            );
        }
        if self.engine.queue_capacity == 0 {
            anyhow::bail!("engine.queue_capacity must be at least 1");
        }
        if self.engine.sweep_interval_secs == 0 {
            anyhow::bail!("engine.sweep_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn core_config(&self) -> CoreConfig {
        let engine = &self.engine;
        CoreConfig {
            queue_capacity: engine.queue_capacity,
            slow_consumer_grace: Duration::from_millis(engine.slow_consumer_grace_ms),
            drain_deadline: Duration::from_millis(engine.drain_deadline_ms),
            idle_threshold: Duration::from_secs(engine.idle_threshold_secs),
            sweep_interval: Duration::from_secs(engine.sweep_interval_secs),
            rpc_deadline: Duration::from_millis(engine.rpc_deadline_ms),
            registry_shards: engine.registry_shards.max(1),
            presence_offline_grace: Duration::from_millis(engine.presence_offline_grace_ms),
            membership_ttl: Duration::from_secs(engine.membership_ttl_secs),
            s3_bucket: self.object_store.bucket.clone(),
            rate_limits: RateLimitConfig {
                frames_per_minute: engine.frames_per_minute,
                typing_per_minute: engine.typing_per_minute,
                presence_per_minute: engine.presence_per_minute,
            },
        }
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.identity_timeout_ms)
    }
}

fn generate_config_template(config: &Config) -> Result<String> {
    let body = toml::to_string_pretty(config)?;
    Ok(format!(
        "# Parley Server Configuration\n# Generated automatically on first run. Environment variables override these values.\n\n{body}"
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_is_generated_with_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let (config, notes) = Config::load_with(path, &env_of(&[])).expect("load");
        assert!(notes.generated);
        assert_eq!(config.server.bind_address, "0.0.0.0:50054");
        assert_eq!(config.engine.queue_capacity, 256);
        assert!(config.auth.jwt_secret.len() >= MIN_JWT_SECRET_LEN);

        // Second load reads the generated file back, secret included.
        let (reloaded, notes) = Config::load_with(path, &env_of(&[])).expect("reload");
        assert!(!notes.generated);
        assert_eq!(reloaded.auth.jwt_secret, config.auth.jwt_secret);
    }

    #[test]
    fn db_host_composes_postgres_url_and_explicit_url_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let env = env_of(&[
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("DB_USER", "chat"),
            ("DB_PASSWORD", "pw"),
            ("DB_NAME", "chatdb"),
        ]);
        let (config, _) = Config::load_with(path, &env).expect("load");
        assert_eq!(config.database.url, "postgres://chat:pw@db.internal:6543/chatdb");

        let env = env_of(&[
            ("DB_HOST", "db.internal"),
            ("PARLEY_DATABASE_URL", "sqlite::memory:"),
        ]);
        let (config, _) = Config::load_with(path, &env).expect("load");
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn port_and_bind_address_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let (config, _) = Config::load_with(path, &env_of(&[("PORT", "6000")])).expect("load");
        assert_eq!(config.server.bind_address, "0.0.0.0:6000");

        let env = env_of(&[("PORT", "6000"), ("PARLEY_BIND_ADDRESS", "127.0.0.1:7000")]);
        let (config, _) = Config::load_with(path, &env).expect("load");
        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
    }

    #[test]
    fn unparseable_knob_warns_and_keeps_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let env = env_of(&[
            ("PARLEY_QUEUE_CAPACITY", "lots"),
            ("PARLEY_DRAIN_DEADLINE_MS", "750"),
            ("PARLEY_LOG_FORMAT", "json"),
        ]);
        let (config, notes) = Config::load_with(path, &env).expect("load");
        assert_eq!(config.engine.queue_capacity, 256);
        assert_eq!(config.engine.drain_deadline_ms, 750);
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(notes.warnings.len(), 1);
        assert!(notes.warnings[0].contains("PARLEY_QUEUE_CAPACITY"));
        assert_eq!(config.core_config().drain_deadline, Duration::from_millis(750));
    }

    #[test]
    fn short_secret_fails_only_for_local_identity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let err = Config::load_with(path, &env_of(&[("JWT_SECRET", "short")]))
            .expect_err("short secret rejected");
        assert!(err.to_string().contains("jwt_secret"));

        let env = env_of(&[("JWT_SECRET", "short"), ("USER_SERVICE_ADDR", "users:50051")]);
        let (config, _) = Config::load_with(path, &env).expect("remote identity");
        assert_eq!(config.auth.user_service_addr.as_deref(), Some("users:50051"));
    }

    #[test]
    fn bucket_reaches_core_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("parley.toml");
        let path = path.to_str().expect("utf8 path");

        let env = env_of(&[("AWS_S3_BUCKET", "attachments"), ("AWS_REGION", "eu-west-1")]);
        let (config, _) = Config::load_with(path, &env).expect("load");
        assert_eq!(config.core_config().s3_bucket.as_deref(), Some("attachments"));
        assert_eq!(config.object_store.region.as_deref(), Some("eu-west-1"));
    }
}
