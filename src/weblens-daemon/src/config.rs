use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_NAME: &str = "prod";
pub const DEFAULT_ROUTER_PORT: u16 = 8080;

/// One entry in the config file, selected by `CONFIG_NAME`. Environment
/// variables override file values; see [`Config::load`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub router_host: Option<String>,
    pub router_port: Option<u16>,
    pub db_path: Option<String>,
    pub media_root: Option<String>,
    pub caches_root: Option<String>,
    pub ui_path: Option<String>,
    pub pool_worker_count: Option<usize>,
    pub log_level: Option<String>,
    pub detach_ui: Option<bool>,
    pub host_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub router_host: String,
    pub router_port: u16,
    pub db_path: PathBuf,
    pub media_root: PathBuf,
    pub caches_root: PathBuf,
    pub ui_path: Option<PathBuf>,
    pub pool_worker_count: usize,
    pub log_level: String,
    pub detach_ui: bool,
    pub host_url: String,
    pub core_api_key: Option<String>,
    pub ollama_host: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(2)
        .max(1)
}

impl Config {
    /// Resolve configuration: the `CONFIG_NAME` entry of the config file at
    /// `CONFIG_PATH` (or `<APP_ROOT>/config/config.json`), overridden by
    /// `MEDIA_ROOT`, `CACHES_PATH`, `SERVER_PORT`, `ROUTER_HOST`,
    /// `LOG_LEVEL`, `CORE_API_KEY`, and `OLLAMA_HOST`.
    pub fn load() -> Config {
        let app_root = env_var("APP_ROOT").map(PathBuf::from).unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });

        let config_path = env_var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| app_root.join("config/config.json"));
        let config_name =
            env_var("CONFIG_NAME").unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string());

        let file = Self::read_config_entry(&config_path, &config_name).unwrap_or_else(|err| {
            warn!("could not read config [{}] from {}: {}", config_name, config_path.display(), err);
            ConfigFile::default()
        });

        let media_root = env_var("MEDIA_ROOT")
            .or(file.media_root)
            .map(PathBuf::from)
            .unwrap_or_else(|| app_root.join("data"));
        let caches_root = env_var("CACHES_PATH")
            .or(file.caches_root)
            .map(PathBuf::from)
            .unwrap_or_else(|| app_root.join("caches"));

        Config {
            router_host: env_var("ROUTER_HOST")
                .or(file.router_host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            router_port: env_var("SERVER_PORT")
                .and_then(|p| p.parse().ok())
                .or(file.router_port)
                .unwrap_or(DEFAULT_ROUTER_PORT),
            db_path: file
                .db_path
                .map(PathBuf::from)
                .unwrap_or_else(|| app_root.join("weblens.db")),
            media_root,
            caches_root,
            ui_path: file.ui_path.map(PathBuf::from),
            pool_worker_count: file.pool_worker_count.unwrap_or_else(default_worker_count),
            log_level: env_var("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "default".to_string()),
            detach_ui: file.detach_ui.unwrap_or(false),
            host_url: file.host_url.unwrap_or_default(),
            core_api_key: env_var("CORE_API_KEY"),
            ollama_host: env_var("OLLAMA_HOST"),
        }
    }

    fn read_config_entry(path: &Path, name: &str) -> Result<ConfigFile, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let all: std::collections::HashMap<String, ConfigFile> =
            serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        all.get(name)
            .cloned()
            .ok_or_else(|| format!("no config entry named {}", name))
    }

    /// Map the config log level onto an env_logger filter.
    pub fn log_filter(&self) -> &str {
        match self.log_level.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "quiet" => "error",
            _ => "info",
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_config_entry_parses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"prod": {"routerPort": 9090, "logLevel": "debug", "poolWorkerCount": 4}}"#,
        )
        .unwrap();

        let entry = Config::read_config_entry(&path, "prod").unwrap();
        assert_eq!(entry.router_port, Some(9090));
        assert_eq!(entry.log_level.as_deref(), Some("debug"));
        assert_eq!(entry.pool_worker_count, Some(4));
        assert!(Config::read_config_entry(&path, "dev").is_err());
    }
}
