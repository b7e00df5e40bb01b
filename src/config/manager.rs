use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::AppConfig;
use crate::utils::get_app_config_path;

/// 配置持久化接口
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<AppConfig>;
    fn save(&self, config: &AppConfig) -> Result<()>;
}

/// 基于 JSON 文件的配置管理器
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 使用默认路径创建配置管理器
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_path: get_app_config_path()?,
        })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl ConfigStore for ConfigManager {
    fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            log::info!("Config file not found, creating default config");
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {:?}", self.config_path))?;
        let mut config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", self.config_path))?;

        // 名称是主键，重复项只保留第一个
        let before = config.servers.len();
        let mut seen = std::collections::HashSet::new();
        config.servers.retain(|s| seen.insert(s.name.clone()));
        if config.servers.len() != before {
            log::warn!(
                "Dropped {} servers with duplicate names from config",
                before - config.servers.len()
            );
        }
        config.normalize();

        Ok(config)
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        // 先写临时文件再替换，避免写到一半时崩溃留下损坏的配置
        let tmp_path = self.config_path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.config_path)?;
        log::debug!("Config saved to: {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProtocolSettings, ProxyMode, ServerDescriptor, VmessSettings};

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));
        let config = manager.load().unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(manager.config_path().exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"));
        let mut config = AppConfig::default();
        config.servers.push(ServerDescriptor::new(
            "a",
            "a.com",
            443,
            ProtocolSettings::Vmess(VmessSettings::new("id")),
        ));
        config.active_server = Some("a".to_string());
        config.proxy_mode = ProxyMode::Pac;
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.proxy_mode, ProxyMode::Pac);
        assert_eq!(loaded.servers.len(), 1);
        assert!(loaded.servers[0].connected);
    }

    #[test]
    fn test_load_drops_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let server = ServerDescriptor::new(
            "dup",
            "a.com",
            443,
            ProtocolSettings::Vmess(VmessSettings::new("id")),
        );
        let config = AppConfig {
            servers: vec![server.clone(), server],
            ..Default::default()
        };
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = ConfigManager::with_path(&path).load().unwrap();
        assert_eq!(loaded.servers.len(), 1);
    }
}
