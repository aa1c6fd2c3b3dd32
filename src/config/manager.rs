// Configuration loading, overrides and validation
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use super::{AppConfig, ConfigError};

/// Prefix of every environment variable that overrides the configuration
pub const ENV_PREFIX: &str = "SEEDPING_";

/// Configuration manager for loading, overriding and saving the app configuration
#[derive(Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    config: Arc<RwLock<AppConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            config: Arc::new(RwLock::new(AppConfig::default())),
        }
    }

    /// Load configuration from file, keeping the defaults if it does not exist
    pub async fn load(&self) -> Result<(), ConfigError> {
        if !self.config_path.exists() {
            info!(path = ?self.config_path, "configuration file not found, using defaults");
            return Ok(());
        }

        info!(path = ?self.config_path, "loading configuration");
        let content = fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Io {
            path: self.config_path.clone(),
            source,
        })?;
        let loaded: AppConfig = if is_json(&self.config_path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        *self.config.write().await = loaded;
        debug!("configuration loaded");
        Ok(())
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<(), ConfigError> {
        info!(path = ?self.config_path, "saving configuration");
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let config = self.config.read().await;
        let content = if is_json(&self.config_path) {
            serde_json::to_string_pretty(&*config)?
        } else {
            serde_yaml::to_string(&*config)?
        };
        fs::write(&self.config_path, content).map_err(|source| ConfigError::Io {
            path: self.config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Apply `SEEDPING_*` variables from the process environment
    pub async fn load_from_env(&self) -> Result<(), ConfigError> {
        let mut config = self.config.write().await;
        apply_env_overrides(&mut config, std::env::vars())?;
        debug!("environment overrides applied");
        Ok(())
    }

    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, new_config: AppConfig) {
        *self.config.write().await = new_config;
    }

    /// Check the configuration, reporting every violation at once
    pub async fn validate(&self) -> Result<(), ConfigError> {
        validate(&*self.config.read().await)
    }

    pub fn get_config_path(&self) -> &Path {
        &self.config_path
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

/// Apply overrides from `vars`; only names starting with `SEEDPING_` are considered
pub fn apply_env_overrides(
    config: &mut AppConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<(), ConfigError> {
    for (var, value) in vars {
        let Some(key) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match key {
            "NODE_NAME" => config.node.node_name = value,
            "CLUSTER_NAME" => config.node.cluster_name = value,
            "LISTEN_ADDRESS" => config.node.listen_address = parse::<SocketAddr>(&var, &value)?,
            "PUBLISH_ADDRESS" => config.node.publish_address = Some(parse::<SocketAddr>(&var, &value)?),
            "SEED_HOSTS" => {
                config.discovery.seed_hosts = value
                    .split(',')
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "DEFAULT_PORT" => config.discovery.default_port = parse(&var, &value)?,
            "MAX_CONCURRENT_RESOLVERS" => config.discovery.max_concurrent_resolvers = parse(&var, &value)?,
            "RESOLVE_TIMEOUT_MS" => config.discovery.resolve_timeout = parse_millis(&var, &value)?,
            "PING_TIMEOUT_MS" => config.discovery.ping_timeout = parse_millis(&var, &value)?,
            "PING_INTERVAL_MS" => config.discovery.ping_interval = parse_millis(&var, &value)?,
            "MAX_PENDING_PROBES" => config.discovery.max_pending_probes = parse(&var, &value)?,
            "LOG_LEVEL" => config.logging.level = value,
            _ => debug!(var = %var, "ignoring unknown configuration variable"),
        }
    }
    Ok(())
}

fn parse<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_millis(var: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(var, value).map(Duration::from_millis)
}

/// Collect every violation in `config`
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.node.node_name.trim().is_empty() {
        errors.push("node name cannot be empty".to_string());
    }
    if config.node.cluster_name.trim().is_empty() {
        errors.push("cluster name cannot be empty".to_string());
    }
    if config.discovery.default_port == 0 {
        errors.push("default port must be greater than 0".to_string());
    }
    if config.discovery.max_concurrent_resolvers < 1 {
        errors.push("max concurrent resolvers must be at least 1".to_string());
    }
    if config.discovery.resolve_timeout.is_zero() {
        errors.push("resolve timeout must be greater than 0".to_string());
    }
    if config.discovery.ping_timeout.is_zero() {
        errors.push("ping timeout must be greater than 0".to_string());
    }
    if config.discovery.ping_interval.is_zero() {
        errors.push("ping interval must be greater than 0".to_string());
    }
    if config.discovery.max_pending_probes == 0 {
        errors.push("max pending probes must be greater than 0".to_string());
    }
    if config.discovery.seed_hosts.iter().any(|host| host.trim().is_empty()) {
        errors.push("seed hosts cannot contain empty entries".to_string());
    }
    if EnvFilter::try_new(&config.logging.level).is_err() {
        errors.push(format!("invalid logging level [{}]", config.logging.level));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            vars(&[
                ("SEEDPING_NODE_NAME", "edge-3"),
                ("SEEDPING_SEED_HOSTS", "10.0.0.1, 10.0.0.2:9400,,"),
                ("SEEDPING_PING_TIMEOUT_MS", "1500"),
                ("SEEDPING_PUBLISH_ADDRESS", "10.0.0.9:9300"),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(config.node.node_name, "edge-3");
        assert_eq!(config.discovery.seed_hosts, vec!["10.0.0.1", "10.0.0.2:9400"]);
        assert_eq!(config.discovery.ping_timeout, Duration::from_millis(1500));
        assert_eq!(config.node.publish_address, Some(SocketAddr::from(([10, 0, 0, 9], 9300))));
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = AppConfig::default();
        let result = apply_env_overrides(&mut config, vars(&[("SEEDPING_DEFAULT_PORT", "ninety")]));
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let mut config = AppConfig::default();
        config.node.cluster_name = String::new();
        config.discovery.max_concurrent_resolvers = 0;
        config.discovery.ping_timeout = Duration::ZERO;

        match validate(&config) {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected violations, got {:?}", other),
        }
        assert!(validate(&AppConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load_both_formats() {
        let dir = std::env::temp_dir().join(format!("seed-ping-config-{}", uuid::Uuid::new_v4()));
        for name in ["node.yaml", "node.json"] {
            let path = dir.join(name);
            let manager = ConfigManager::new(path.clone());
            let mut config = AppConfig::default();
            config.node.node_name = format!("from-{}", name);
            config.discovery.seed_hosts = vec!["seed-a".to_string(), "seed-b:9301".to_string()];
            manager.update_config(config.clone()).await;
            manager.save().await.unwrap();

            let reloaded = ConfigManager::new(path);
            reloaded.load().await.unwrap();
            assert_eq!(reloaded.get_config().await, config);
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_file_keeps_defaults() {
        let manager = ConfigManager::new(PathBuf::from("/nonexistent/seed-ping/config.yaml"));
        manager.load().await.unwrap();
        assert_eq!(manager.get_config().await, AppConfig::default());
    }
}
