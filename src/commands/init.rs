//! Init command implementation

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::store::{Storage, StorageBackend};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub backend: Option<BackendKind>,
    pub force: bool,
}

/// Write a default configuration and prepare the storage schema
pub async fn cmd_init(options: InitOptions) -> Result<Config> {
    let InitOptions {
        base_dir,
        config_path,
        backend,
        force,
    } = options;

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.paths.config_file = config_path;
    if let Some(backend) = backend {
        config.storage.backend = backend.to_string();
    }
    config.validate()?;
    config.save()?;

    match Storage::open(&config).await {
        Ok(storage) => {
            info!("Storage schema ready at {}", storage.get_storage_info().await?.location);
            storage.close().await;
        }
        // The networked store may not be running yet; the schema is created on first use
        Err(e) if config.storage.backend_kind()? == BackendKind::Networked => {
            warn!("Could not reach the networked store: {}. You can retry later.", e);
        }
        Err(e) => return Err(e),
    }

    Ok(config)
}

/// Print the outcome of `init`
pub fn print_init(config: &Config) {
    println!("✓ Initialized answerbank at {:?}", config.paths.base_dir);
    println!("\nConfiguration: {:?}", config.paths.config_file);
    println!("Storage backend: {}", config.storage.backend);
    println!("Knowledge base: {:?}", config.source_path());
    println!("\nNext steps:");
    println!("  answerbank migrate --dry-run       # Preview the change set");
    println!("  answerbank migrate --validate      # Embed and verify");
    println!("  answerbank query --category cards \"lost PIN\"  # Search one category");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(tmp: &TempDir, force: bool) -> InitOptions {
        InitOptions {
            base_dir: tmp.path().to_path_buf(),
            config_path: tmp.path().join("config.toml"),
            backend: None,
            force,
        }
    }

    #[tokio::test]
    async fn test_init_creates_config_and_database() {
        let tmp = TempDir::new().unwrap();
        let config = cmd_init(options(&tmp, false)).await.unwrap();

        assert!(config.paths.config_file.exists());
        assert!(config.sqlite_path().exists());
        let loaded = Config::load(&config.paths.config_file).unwrap();
        assert_eq!(loaded.storage.backend_kind().unwrap(), BackendKind::Embedded);
    }

    #[tokio::test]
    async fn test_init_refuses_to_overwrite_without_force() {
        let tmp = TempDir::new().unwrap();
        cmd_init(options(&tmp, false)).await.unwrap();

        assert!(matches!(
            cmd_init(options(&tmp, false)).await,
            Err(Error::Config(_))
        ));
        assert!(cmd_init(options(&tmp, true)).await.is_ok());
    }
}
