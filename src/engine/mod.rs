//! Protocol engine and public API
//!
//! This module provides the [`Engine`] struct that owns the page context
//! store, the filter state cache and the session directory, and exposes the
//! caller-facing page operations (see [`pages`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// Submodules
pub mod changes;
pub mod context;
pub mod correlator;
pub mod decompress;
pub mod error;
pub mod filter;
pub mod pages;
pub mod records;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tree;
pub mod wire;

use correlator::{Correlator, Session, SessionDirectory};
use decompress::Decompressor;
use filter::FilterStateCache;
use store::{NoPersistence, PageContextStore, PersistentTier};
use tree::DEFAULT_PATH_PREFIX;

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for persisted page contexts; memory only when unset
    pub persist_root: Option<PathBuf>,

    /// Prefix of structural control paths (`<prefix>:c[0]/...`)
    pub control_path_prefix: String,

    /// Unwrap compressed response payloads
    pub decompress_responses: bool,

    /// Required wait for the form of a page being opened
    pub open_timeout_ms: u64,

    /// Optional wait for echoed changes after a write
    pub write_echo_timeout_ms: u64,

    /// Optional wait for a data refresh after filtering or reloading
    pub refresh_timeout_ms: u64,

    /// Wait for a form shown by an action (required only for navigation)
    pub action_timeout_ms: u64,

    /// Fallback system action codes by action name
    pub action_codes: BTreeMap<String, u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_root: None,
            control_path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            decompress_responses: true,
            open_timeout_ms: 10_000,
            write_echo_timeout_ms: 1_000,
            refresh_timeout_ms: 5_000,
            action_timeout_ms: 3_000,
            action_codes: default_action_codes(),
        }
    }
}

/// Built-in system action codes
pub fn default_action_codes() -> BTreeMap<String, u32> {
    [
        ("New", 10),
        ("Delete", 20),
        ("View", 30),
        ("Edit", 40),
        ("Refresh", 60),
    ]
    .into_iter()
    .map(|(name, code)| (name.to_string(), code))
    .collect()
}

impl EngineConfig {
    /// Load from `<root>/config.json`
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        storage::load_config(root)
    }

    /// Save to `<root>/config.json`
    pub fn save(&self, root: &Path) -> anyhow::Result<()> {
        storage::write_config(root, self)
    }

    /// Fallback code for an action name, case-insensitively
    pub fn action_code(&self, name: &str) -> Option<u32> {
        self.action_codes
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, code)| *code)
    }

    pub(crate) fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub(crate) fn write_echo_timeout(&self) -> Duration {
        Duration::from_millis(self.write_echo_timeout_ms)
    }

    pub(crate) fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub(crate) fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// The protocol engine
///
/// Owns the page context store and the filter state cache; sessions are
/// looked up through the injected directory.
pub struct Engine {
    config: EngineConfig,
    sessions: Arc<dyn SessionDirectory>,
    store: PageContextStore,
    filters: FilterStateCache,
}

impl Engine {
    /// Create an engine, persisting to `config.persist_root` when set
    pub fn new(config: EngineConfig, sessions: Arc<dyn SessionDirectory>) -> anyhow::Result<Self> {
        let tier: Arc<dyn PersistentTier> = match &config.persist_root {
            Some(root) => Arc::new(storage::FileTier::open(root)?),
            None => Arc::new(NoPersistence),
        };
        Ok(Self::with_tier(config, sessions, tier))
    }

    /// Create an engine over an explicit persistent tier
    pub fn with_tier(
        config: EngineConfig,
        sessions: Arc<dyn SessionDirectory>,
        tier: Arc<dyn PersistentTier>,
    ) -> Self {
        tracing::info!(
            prefix = %config.control_path_prefix,
            persist = config.persist_root.is_some(),
            "engine initialized"
        );
        Self {
            store: PageContextStore::new(tier, Arc::clone(&sessions)),
            filters: FilterStateCache::new(),
            sessions,
            config,
        }
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Page context store
    pub fn store(&self) -> &PageContextStore {
        &self.store
    }

    /// Filter state cache
    pub fn filters(&self) -> &FilterStateCache {
        &self.filters
    }

    /// Forget everything tied to a session (after it disconnects)
    pub fn forget_session(&self, session_id: &str) {
        let removed = self.store.remove_session(session_id);
        self.filters.clear_session(session_id);
        tracing::info!(session = %session_id, contexts = removed, "session state dropped");
    }

    /// Drop all in-memory state; persisted contexts remain
    pub fn shutdown(&self) {
        let contexts = self.store.len();
        self.store.clear();
        self.filters.clear();
        tracing::info!(contexts, "engine shut down");
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.session(session_id)
    }

    pub(crate) fn correlator(&self, session: Arc<dyn Session>) -> Correlator {
        Correlator::new(session, Decompressor::new(self.config.decompress_responses))
    }
}
