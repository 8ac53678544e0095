//! Two-tier page context store
//!
//! The memory tier is authoritative while the process lives. The persistent
//! tier only survives restarts: lookups that miss memory fall back to it and
//! promote the hit. Persistence failures are logged and never fail an
//! operation.
//!
//! Lookups validate the identifier first and then require the owning session
//! to still be live, so a context can never outlive its session.

use super::context::{PageContext, PageContextId};
use super::correlator::SessionDirectory;
use super::error::{EngineError, NotFoundError, Result};
use anyhow::Context as _;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Durable storage for contexts
pub trait PersistentTier: Send + Sync {
    /// Store or replace a context
    fn save(&self, context: &PageContext) -> anyhow::Result<()>;
    /// Fetch a context, `None` when absent
    fn load(&self, id: &PageContextId) -> anyhow::Result<Option<PageContext>>;
    /// Remove a context; absent is not an error
    fn delete(&self, id: &PageContextId) -> anyhow::Result<()>;
}

/// Tier that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl PersistentTier for NoPersistence {
    fn save(&self, _context: &PageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn load(&self, _id: &PageContextId) -> anyhow::Result<Option<PageContext>> {
        Ok(None)
    }

    fn delete(&self, _id: &PageContextId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-process tier holding serialized contexts, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<PageContextId, Vec<u8>>>,
}

impl MemoryTier {
    /// Empty tier
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contexts
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PersistentTier for MemoryTier {
    fn save(&self, context: &PageContext) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(context).context("Failed to serialize context")?;
        self.entries.write().insert(context.id.clone(), bytes);
        Ok(())
    }

    fn load(&self, id: &PageContextId) -> anyhow::Result<Option<PageContext>> {
        let entries = self.entries.read();
        let Some(bytes) = entries.get(id) else {
            return Ok(None);
        };
        let context = serde_json::from_slice(bytes).context("Failed to deserialize context")?;
        Ok(Some(context))
    }

    fn delete(&self, id: &PageContextId) -> anyhow::Result<()> {
        self.entries.write().remove(id);
        Ok(())
    }
}

/// Page contexts keyed by id
pub struct PageContextStore {
    memory: RwLock<HashMap<PageContextId, Arc<PageContext>>>,
    // last revision written to the tier, per context; held across the save
    persisted: Mutex<HashMap<PageContextId, u64>>,
    tier: Arc<dyn PersistentTier>,
    sessions: Arc<dyn SessionDirectory>,
}

impl PageContextStore {
    /// Store over a persistent tier, checking liveness against `sessions`
    pub fn new(tier: Arc<dyn PersistentTier>, sessions: Arc<dyn SessionDirectory>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            persisted: Mutex::new(HashMap::new()),
            tier,
            sessions,
        }
    }

    /// Create an empty context for a page
    pub fn create(&self, session_id: &str, page_id: &str) -> (Arc<PageContext>, PageContextId) {
        self.create_with(session_id, page_id, |_| {})
    }

    /// Create a context, letting `init` populate it before it is published
    pub fn create_with(
        &self,
        session_id: &str,
        page_id: &str,
        init: impl FnOnce(&mut PageContext),
    ) -> (Arc<PageContext>, PageContextId) {
        let context = {
            let mut memory = self.memory.write();
            let mut opened_at = Utc::now().timestamp_millis();
            let mut id = PageContextId::new(session_id, page_id, opened_at);
            // same page opened twice within a millisecond
            while memory.contains_key(&id) {
                opened_at += 1;
                id = PageContextId::new(session_id, page_id, opened_at);
            }

            let mut context = PageContext::new(id.clone());
            init(&mut context);
            let context = Arc::new(context);
            memory.insert(id, Arc::clone(&context));
            context
        };
        self.persist(&context);
        tracing::debug!(page_context = %context.id, "created page context");
        let id = context.id.clone();
        (context, id)
    }

    /// Look up a context by its textual id
    pub fn get(&self, id: &str) -> Result<Arc<PageContext>> {
        let id = PageContextId::parse(id)?;
        self.get_id(&id)
    }

    /// Look up a context.
    ///
    /// Order: session liveness, memory, persistent tier (promoting a hit).
    /// An id without a timestamp names the most recently opened resident
    /// context of its page; the returned context carries the full id.
    pub fn get_id(&self, id: &PageContextId) -> Result<Arc<PageContext>> {
        if self.sessions.session(id.session_id()).is_none() {
            return Err(NotFoundError::SessionGone {
                session_id: id.session_id().to_string(),
                address: id.address(),
            }
            .into());
        }

        if id.opened_at().is_none() {
            return self
                .latest_for_page(id.session_id(), id.page_id())
                .ok_or_else(|| self.gone(id));
        }

        if let Some(context) = self.memory.read().get(id) {
            return Ok(Arc::clone(context));
        }

        match self.tier.load(id) {
            Ok(Some(context)) => {
                let context = Arc::new(context);
                let promoted = Arc::clone(
                    self.memory
                        .write()
                        .entry(id.clone())
                        .or_insert_with(|| Arc::clone(&context)),
                );
                tracing::debug!(page_context = %id, "promoted page context from persistent tier");
                Ok(promoted)
            }
            Ok(None) => Err(self.gone(id)),
            Err(err) => {
                tracing::warn!(page_context = %id, error = %err, "persistent tier lookup failed");
                Err(self.gone(id))
            }
        }
    }

    /// Apply `f` to a fresh copy of the context and publish the result.
    ///
    /// Readers holding the previous snapshot are unaffected.
    pub fn update<R>(&self, id: &PageContextId, f: impl FnOnce(&mut PageContext) -> R) -> Result<R> {
        // make sure it is resident (and the session is live)
        let resident = self.get_id(id)?.id.clone();

        let (result, updated) = {
            let mut memory = self.memory.write();
            let Some(current) = memory.get_mut(&resident) else {
                return Err(self.gone(id));
            };
            let mut next = (**current).clone();
            let result = f(&mut next);
            next.touch();
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            (result, next)
        };
        self.persist(&updated);
        Ok(result)
    }

    /// Flag a context as needing a server refresh before its next read
    pub fn mark_stale(&self, id: &PageContextId) -> Result<()> {
        self.update(id, |context| context.needs_refresh = true)
    }

    /// Drop a context from both tiers
    pub fn invalidate(&self, id: &PageContextId) -> Option<Arc<PageContext>> {
        let removed = self.memory.write().remove(id);
        let mut persisted = self.persisted.lock();
        persisted.remove(id);
        if let Err(err) = self.tier.delete(id) {
            tracing::warn!(page_context = %id, error = %err, "failed to delete persisted context");
        }
        removed
    }

    /// Drop every context belonging to a session; returns how many were resident
    pub fn remove_session(&self, session_id: &str) -> usize {
        let removed: Vec<PageContextId> = {
            let mut memory = self.memory.write();
            let ids: Vec<PageContextId> = memory
                .keys()
                .filter(|id| id.session_id() == session_id)
                .cloned()
                .collect();
            for id in &ids {
                memory.remove(id);
            }
            ids
        };
        let mut persisted = self.persisted.lock();
        for id in &removed {
            persisted.remove(id);
            if let Err(err) = self.tier.delete(id) {
                tracing::warn!(page_context = %id, error = %err, "failed to delete persisted context");
            }
        }
        removed.len()
    }

    /// Ids of every resident context of a session
    pub fn ids_for_session(&self, session_id: &str) -> Vec<PageContextId> {
        let mut ids: Vec<PageContextId> = self
            .memory
            .read()
            .keys()
            .filter(|id| id.session_id() == session_id)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Most recently opened resident context for a page
    pub fn latest_for_page(&self, session_id: &str, page_id: &str) -> Option<Arc<PageContext>> {
        self.memory
            .read()
            .values()
            .filter(|ctx| ctx.session_id() == session_id && ctx.page_id() == page_id)
            .max_by_key(|ctx| ctx.id.opened_at())
            .cloned()
    }

    /// Number of resident contexts
    pub fn len(&self) -> usize {
        self.memory.read().len()
    }

    /// Whether no context is resident
    pub fn is_empty(&self) -> bool {
        self.memory.read().is_empty()
    }

    /// Drop the memory tier; persisted contexts remain
    pub fn clear(&self) {
        self.memory.write().clear();
    }

    // Saves are ordered by revision: a snapshot older than the one already
    // written, or one whose context has since been dropped, is skipped.
    fn persist(&self, context: &PageContext) {
        let mut persisted = self.persisted.lock();
        if persisted
            .get(&context.id)
            .is_some_and(|&revision| revision >= context.revision)
        {
            tracing::trace!(page_context = %context.id, revision = context.revision, "newer snapshot already persisted");
            return;
        }
        if !self.memory.read().contains_key(&context.id) {
            return;
        }
        match self.tier.save(context) {
            Ok(()) => {
                persisted.insert(context.id.clone(), context.revision);
            }
            Err(err) => tracing::warn!(
                page_context = %context.id,
                error = %err,
                "failed to persist page context; continuing from memory"
            ),
        }
    }

    fn gone(&self, id: &PageContextId) -> EngineError {
        NotFoundError::ContextGone {
            page_context_id: id.to_string(),
            address: id.address(),
        }
        .into()
    }
}
