//! Configuration loading and management

use std::path::{Path, PathBuf};

use quorum_core::{QuorumError, Result};

use crate::{ConfigValidator, QuorumConfig};

/// Prefix for environment overrides, e.g. `QUORUM_CLUSTER__NODE_ID=2`
pub const ENV_PREFIX: &str = "QUORUM";

/// Configuration loader with hierarchical loading support
pub struct ConfigLoader {
    /// Search paths for configuration files
    search_paths: Vec<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                "/etc/quorum".to_string(),
                "~/.quorum".to_string(),
                ".".to_string(),
            ],
        }
    }

    pub fn with_search_paths(mut self, paths: Vec<String>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest precedence)
    /// 2. Local configuration file (quorum.toml)
    /// 3. `config.toml` in the search paths, later paths winning
    /// 4. Default values (lowest precedence)
    pub async fn load(&self) -> Result<QuorumConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&self.default_config()?, config::FileFormat::Toml));

        for path in self.config_files("config.toml") {
            builder = builder.add_source(config::File::from(path));
        }

        if Path::new("quorum.toml").exists() {
            builder = builder.add_source(config::File::with_name("quorum.toml"));
        }

        self.finish(builder)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<QuorumConfig> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(&self.default_config()?, config::FileFormat::Toml))
            .add_source(config::File::from(path.as_ref().to_path_buf()));

        self.finish(builder)
    }

    /// Save current configuration to a file
    pub async fn save_to_file<P: AsRef<Path>>(&self, config: &QuorumConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| QuorumError::config(format!("Failed to serialize configuration: {}", e)))?;

        tokio::fs::write(path, toml_string)
            .await
            .map_err(|e| QuorumError::config(format!("Failed to write configuration file: {}", e)))?;

        Ok(())
    }

    fn finish(
        &self,
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<QuorumConfig> {
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.members")
                    .with_list_parse_key("cluster.passive_members")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| QuorumError::config(format!("Failed to build configuration: {}", e)))?;

        let mut quorum_config: QuorumConfig = config
            .try_deserialize()
            .map_err(|e| QuorumError::config(format!("Failed to deserialize configuration: {}", e)))?;

        self.post_process(&mut quorum_config)?;

        Ok(quorum_config)
    }

    fn default_config(&self) -> Result<String> {
        toml::to_string_pretty(&QuorumConfig::default())
            .map_err(|e| QuorumError::config(format!("Failed to serialize default config: {}", e)))
    }

    fn config_files(&self, filename: &str) -> Vec<PathBuf> {
        self.search_paths
            .iter()
            .filter_map(|search_path| {
                let mut path = if let Some(rest) = search_path.strip_prefix("~/") {
                    let mut home = PathBuf::from(std::env::var_os("HOME")?);
                    home.push(rest);
                    home
                } else {
                    PathBuf::from(search_path)
                };
                path.push(filename);
                path.exists().then_some(path)
            })
            .collect()
    }

    fn post_process(&self, config: &mut QuorumConfig) -> Result<()> {
        // Expand tilde in the data directory
        if let Some(home) = std::env::var_os("HOME") {
            let dir = &config.cluster.data_directory;
            if dir.starts_with("~") {
                let home_str = home.to_string_lossy();
                config.cluster.data_directory =
                    dir.to_string_lossy().replacen('~', &home_str, 1).into();
            }
        }

        config.cluster.members.sort_unstable();
        config.cluster.members.dedup();

        ConfigValidator::validate(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
