use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use kestrel_core::ModuleConfig;

const DEFAULT_CONFIG_FILE: &str = "/var/lib/kestrel/kestrel.ini";

/// Daemon configuration, backed by an `INI` file parsed on creation.
/// Each section becomes the [`ModuleConfig`] of one component.
#[derive(Debug, Clone, Default)]
pub struct KestrelConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl KestrelConfig {
    /// Load the default file, or empty configuration when it does not
    /// exist.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file; missing files are an error here.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();

        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        for (section, prop) in &conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self { configs })
    }

    /// Configuration of one component; empty when the section is
    /// missing.
    pub fn module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }
}
