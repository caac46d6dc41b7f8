use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Llama,
    #[default]
    Ollama,
    OpenAi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Llama => "llama",
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Server address. Each backend has its own default when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub vision_model: Option<String>,

    #[serde(default)]
    pub embedding_model: Option<String>,

    /// Expected embedding length; also requested from APIs that support it.
    #[serde(default)]
    pub dimensions: Option<usize>,

    /// Falls back to `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_seed")]
    pub seed: i64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Requests allowed per `rate_window_secs` on metered APIs.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
}

fn default_seed() -> i64 {
    385480504
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_window_secs() -> u64 {
    60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            vision_model: None,
            embedding_model: None,
            dimensions: None,
            api_key: None,
            seed: default_seed(),
            timeout_secs: default_timeout_secs(),
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_errors() -> usize {
    5
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            batch_size: default_batch_size(),
            max_errors: default_max_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string()]
}

fn default_insert_batch_size() -> usize {
    200
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            extensions: default_image_extensions(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Failed items tolerated per run before giving up.
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pictor")
        .join("pictor.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            backend: BackendConfig::default(),
            query: QueryConfig::default(),
            scanner: ScannerConfig::default(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config from `PICTOR_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Loads `path`, writing out the defaults first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("PICTOR_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pictor")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pictor").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.query.top_k, 5);
        assert_eq!(config.query.batch_size, 1000);
        assert_eq!(config.scanner.insert_batch_size, 200);
        assert_eq!(config.backend.rate_limit, 10);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.db_path, config.db_path);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            db_path = "/srv/photos/pictor.db"

            [backend]
            kind = "openai"
            dimensions = 512

            [query]
            top_k = 10
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/srv/photos/pictor.db"));
        assert_eq!(config.backend.kind, BackendKind::OpenAi);
        assert_eq!(config.backend.kind.as_str(), "openai");
        assert_eq!(config.backend.dimensions, Some(512));
        assert_eq!(config.backend.timeout_secs, 120);
        assert_eq!(config.query.top_k, 10);
        assert_eq!(config.query.max_errors, 5);
        assert_eq!(config.scanner.extensions, vec!["jpg", "jpeg"]);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backend]\nkind = \"gopher\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
