//! Filesystem persistence for page contexts and engine configuration
//!
//! Contexts live under `<root>/contexts/` as one JSON document each, named by
//! the blake3 hash of the context id. Every write goes through a temp file
//! and a rename so a crash never leaves a half-written context behind.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::EngineConfig;
use super::context::{PageContext, PageContextId};
use super::store::PersistentTier;

/// Storage layout rooted at one directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the contexts directory path
    pub fn contexts_dir(&self) -> PathBuf {
        self.root.join("contexts")
    }

    /// File holding one context
    pub fn context_path(&self, id: &PageContextId) -> PathBuf {
        let digest = blake3::hash(id.to_string().as_bytes());
        self.contexts_dir().join(format!("{}.json", digest.to_hex()))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    /// it over the target and syncs the parent directory.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(data).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file, `None` when it does not exist
    pub fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read file: {:?}", path)),
        }
    }

    /// Remove a file; a missing file is not an error
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove file: {:?}", path)),
        }
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }
}

/// Initialize storage directories under `root`
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.contexts_dir())?;
    Ok(())
}

/// Write engine configuration to `<root>/config.json`
pub fn write_config(root: &Path, config: &EngineConfig) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load engine configuration from `<root>/config.json`
pub fn load_config(root: &Path) -> Result<EngineConfig> {
    let storage = Storage::new(root.to_path_buf());
    let path = storage.config_path();
    let data = storage
        .read_optional(&path)?
        .with_context(|| format!("No config at {:?}", path))?;
    serde_json::from_slice(&data).context("Failed to deserialize config")
}

/// Persistent tier backed by one JSON file per context
#[derive(Debug)]
pub struct FileTier {
    storage: Storage,
    writes: Mutex<()>,
}

impl FileTier {
    /// Open (and create if needed) a file tier rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        init_storage(&root)?;
        Ok(Self {
            storage: Storage::new(root),
            writes: Mutex::new(()),
        })
    }

    /// Underlying layout
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl PersistentTier for FileTier {
    fn save(&self, context: &PageContext) -> Result<()> {
        let json = serde_json::to_vec(context)
            .with_context(|| format!("Failed to serialize context {}", context.id))?;
        let path = self.storage.context_path(&context.id);
        // temp files are per path; serialize writers
        let _guard = self.writes.lock();
        self.storage.write_atomic(&path, &json)
    }

    fn load(&self, id: &PageContextId) -> Result<Option<PageContext>> {
        let path = self.storage.context_path(id);
        let Some(data) = self.storage.read_optional(&path)? else {
            return Ok(None);
        };
        let context = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to deserialize context {id}"))?;
        Ok(Some(context))
    }

    fn delete(&self, id: &PageContextId) -> Result<()> {
        self.storage.remove_file(&self.storage.context_path(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(page: &str) -> PageContext {
        let mut ctx = PageContext::new(PageContextId::new("S1", page, 1_000));
        ctx.form_ids.push("F1".into());
        ctx.tree = Some(Arc::new(serde_json::json!({ "ServerId": "F1", "Children": [] })));
        ctx
    }

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        init_storage(temp.path()).unwrap();
        assert!(temp.path().join("contexts").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            write_echo_timeout_ms: 250,
            control_path_prefix: "client".into(),
            ..EngineConfig::default()
        };
        write_config(temp.path(), &config).unwrap();
        let loaded = load_config(temp.path()).unwrap();
        assert_eq!(loaded.write_echo_timeout_ms, 250);
        assert_eq!(loaded.control_path_prefix, "client");
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let file = temp.path().join("test.dat");
        storage.write_atomic(&file, b"Hello, world!").unwrap();
        assert_eq!(
            storage.read_optional(&file).unwrap().as_deref(),
            Some(&b"Hello, world!"[..])
        );
        assert!(!file.with_extension("tmp").exists());
    }

    #[test]
    fn file_tier_saves_loads_and_deletes() {
        let temp = TempDir::new().unwrap();
        let tier = FileTier::open(temp.path()).unwrap();
        let ctx = context("21");

        tier.save(&ctx).unwrap();
        assert_eq!(tier.load(&ctx.id).unwrap(), Some(ctx.clone()));

        tier.delete(&ctx.id).unwrap();
        assert_eq!(tier.load(&ctx.id).unwrap(), None);
        tier.delete(&ctx.id).unwrap();
    }

    #[test]
    fn distinct_ids_get_distinct_files() {
        let temp = TempDir::new().unwrap();
        let tier = FileTier::open(temp.path()).unwrap();
        let a = context("21");
        let b = context("22");
        assert_ne!(
            tier.storage().context_path(&a.id),
            tier.storage().context_path(&b.id)
        );
    }

    #[test]
    fn corrupt_files_are_errors_not_misses() {
        let temp = TempDir::new().unwrap();
        let tier = FileTier::open(temp.path()).unwrap();
        let ctx = context("21");
        fs::write(tier.storage().context_path(&ctx.id), b"{not json").unwrap();
        assert!(tier.load(&ctx.id).is_err());
    }
}
