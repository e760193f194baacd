use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::document::ConfigurationDocument;
use crate::errors::ConfigError;

/// Parses a configuration source into a document.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ConfigurationDocument, ConfigError>;
}

/// Reads documents from disk, picking the format from the file extension.
///
/// `.toml` files are parsed as TOML, everything else as YAML.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDocumentParser;

impl DocumentParser for FileDocumentParser {
    fn parse(&self, path: &Path) -> Result<ConfigurationDocument, ConfigError> {
        let source = path.to_string_lossy().to_string();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead(source.clone(), e))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            ConfigurationDocument::from_toml_str(&source, &content)
        } else {
            ConfigurationDocument::from_yaml_str(&source, &content)
        }
    }
}

lazy_static! {
    static ref GLOBAL_CACHE: Arc<ConfigurationCache> = Arc::new(ConfigurationCache::new());
}

/// Memoized configuration loader keyed by source path.
///
/// Lookups of cached documents only touch the map's shard lock. A miss takes
/// the cache-wide creation lock and checks again before parsing, so each path
/// is parsed at most once even under concurrent first access.
pub struct ConfigurationCache {
    parser: Arc<dyn DocumentParser>,
    documents: DashMap<PathBuf, Arc<ConfigurationDocument>>,
    create_lock: Mutex<()>,
}

impl ConfigurationCache {
    /// Create a cache reading files from disk
    pub fn new() -> Self {
        Self::with_parser(Arc::new(FileDocumentParser))
    }

    /// Create a cache with a custom parser (for testing)
    pub fn with_parser(parser: Arc<dyn DocumentParser>) -> Self {
        Self {
            parser,
            documents: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Process-wide cache shared by every context in the process.
    pub fn global() -> Arc<ConfigurationCache> {
        GLOBAL_CACHE.clone()
    }

    /// Load a document, parsing it only on first access.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<ConfigurationDocument>, ConfigError> {
        let path = path.as_ref();
        if let Some(document) = self.documents.get(path) {
            return Ok(document.value().clone());
        }

        let _guard = self.create_lock.lock();
        if let Some(document) = self.documents.get(path) {
            return Ok(document.value().clone());
        }

        let document = Arc::new(self.parser.parse(path)?);
        self.documents.insert(path.to_path_buf(), document.clone());
        tracing::info!("已加载配置文件: {:?}", path);
        Ok(document)
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.documents.contains_key(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for ConfigurationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_returns_same_instance() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "application.yaml", "app:\n  name: demo\n");

        let cache = ConfigurationCache::new();
        let first = cache.load(&path).unwrap();
        let second = cache.load(&path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get_str("app.name", ""), "demo");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_toml_extension_selects_toml_parser() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "application.toml", "[app]\nname = \"demo\"\nport = 8080\n");

        let document = ConfigurationCache::new().load(&path).unwrap();
        assert_eq!(document.get_int("app.port", 0), 8080);
    }

    #[test]
    fn test_missing_file_is_not_cached() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.yaml");

        let cache = ConfigurationCache::new();
        assert!(matches!(cache.load(&path), Err(ConfigError::FileRead(..))));
        assert!(!cache.contains(&path));
    }
}
