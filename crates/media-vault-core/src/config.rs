use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub import: ImportConfig,
    pub extractor: ExtractorConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the managed tree (`content/`, `proxies/`, `exports/`).
    pub root_dir: PathBuf,
    pub catalog_path: PathBuf,
    /// Advisory quota used by the gateway's storage estimate.
    pub quota_bytes: u64,
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./media-vault-data"),
            catalog_path: PathBuf::from("./media-vault-data/catalog.db"),
            quota_bytes: 50 * GIB,
            chunk_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Guards against mis-handled selections, not a product limit.
    pub max_file_size: u64,
    pub ignore_patterns: Vec<String>,
    /// Directory imports copy bytes into the content store instead of linking.
    pub copy_into_store: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * GIB,
            ignore_patterns: vec!["**/.*".to_string()],
            copy_into_store: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub timeout_secs: u64,
    pub batch_concurrency: usize,
    pub thumbnail_size: u32,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            batch_concurrency: 3,
            thumbnail_size: 320,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub threshold_width: u32,
    pub threshold_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub audio_bitrate_kbps: u32,
    pub extension: String,
    pub auto_generate: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            threshold_width: 1920,
            threshold_height: 1080,
            max_width: 1280,
            max_height: 720,
            audio_bitrate_kbps: 128,
            extension: "mp4".to_string(),
            auto_generate: true,
        }
    }
}

/// Defaults, then `Config.toml` if present, then `MEDIA_VAULT__SECTION__KEY`
/// environment overrides.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    build_configuration(ConfigFile::with_name("Config").required(false))
}

pub fn load_configuration_from(path: &Path) -> Result<AppConfig, ConfigError> {
    build_configuration(ConfigFile::from(path).required(true))
}

fn build_configuration<S>(file: S) -> Result<AppConfig, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let defaults = Config::try_from(&AppConfig::default())?;
    let builder = Config::builder()
        .add_source(defaults)
        .add_source(file)
        .add_source(
            Environment::with_prefix("MEDIA_VAULT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for dir in dirs {
        if result.iter().any(|kept| dir.starts_with(kept)) {
            continue;
        }
        result.retain(|kept| !kept.starts_with(&dir));
        result.push(dir);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = AppConfig::default();
        assert_eq!(config.extractor.timeout(), Duration::from_secs(30));
        assert_eq!(config.extractor.batch_concurrency, 3);
        assert_eq!(
            (config.proxy.threshold_width, config.proxy.threshold_height),
            (1920, 1080)
        );
        assert_eq!((config.proxy.max_width, config.proxy.max_height), (1280, 720));
        assert!(config.import.max_file_size > GIB);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        fs::write(
            &path,
            "[storage]\nroot_dir = \"/srv/vault\"\n\n[proxy]\nauto_generate = false\n",
        )
        .unwrap();

        let config = load_configuration_from(&path).unwrap();
        assert_eq!(config.storage.root_dir, PathBuf::from("/srv/vault"));
        assert!(!config.proxy.auto_generate);
        assert_eq!(config.proxy.max_width, 1280);
        assert_eq!(config.extractor.thumbnail_size, 320);
    }

    #[test]
    fn test_non_overlapping_no_overlap() {
        let dirs = vec![
            PathBuf::from("/home/user/footage"),
            PathBuf::from("/home/user/music"),
            PathBuf::from("/var/data"),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_non_overlapping_with_subdirectory() {
        let dirs = vec![
            PathBuf::from("/home/user/footage/day1"),
            PathBuf::from("/home/user/footage"),
            PathBuf::from("/var/data"),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 2);
        assert!(result.contains(&PathBuf::from("/home/user/footage")));
        assert!(!result.contains(&PathBuf::from("/home/user/footage/day1")));
    }
}
