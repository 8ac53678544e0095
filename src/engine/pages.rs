//! Caller-facing page operations: open, read, write, act, close
//!
//! Each operation is a short sequence of interactions driven through a
//! [`Correlator`]. Sub-steps run strictly in order; the page context is
//! updated copy-on-write after each one, so a failure part-way leaves the
//! cache at the last confirmed state.

use super::Engine;
use super::changes::FieldValue;
use super::context::{PageContext, PageContextId};
use super::correlator::{
    Correlator, HandlerPredicate, Requirement, Session, WaitOptions, ensure_no_remote_errors,
};
use super::error::{EngineError, ErrorAddress, NotFoundError, ProtocolError, Result};
use super::filter::{FilterPhase, FilterPlan, FilterState, parse_filters};
use super::records::{self, Record};
use super::sync::{apply_handlers, build_cache, record_write};
use super::tree::{
    ActionMeta, FieldMeta, RepeaterMeta, TreeStatus, TreeSummary, diagnose, form_identity,
};
use super::wire::{FilterOperation, Handler, Interaction, find_shown_form};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// A freshly opened (or reopened) page
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedPage {
    /// Identifier for subsequent operations
    pub page_context_id: PageContextId,
    /// Primary server form
    pub form_id: String,
    /// Form caption
    pub caption: Option<String>,
    /// Page-level fields
    pub fields: Vec<FieldMeta>,
    /// Repeaters
    pub repeaters: Vec<RepeaterMeta>,
    /// Actions
    pub actions: Vec<ActionMeta>,
    /// Whether the tree parsed
    pub tree_status: TreeStatus,
    /// Whether the form was already open and its cached state reused
    pub reused: bool,
}

/// Confirmation of a successful write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    /// Context written to
    pub page_context_id: PageContextId,
    /// Form written to
    pub form_id: String,
    /// Resolved control path
    pub control_path: String,
    /// Caller-facing field label
    pub field: String,
    /// Value written
    pub value: FieldValue,
    /// Echoed changes merged into the cache
    pub echoed: usize,
    /// Whether an echo arrived, synchronously or pushed
    pub confirmed: bool,
}

/// A rejected write
#[derive(Debug, Error)]
#[error("write to '{field}' failed: {error}")]
pub struct WriteFailure {
    /// Field the caller tried to write
    pub field: String,
    /// What went wrong
    #[source]
    pub error: EngineError,
    /// Server-provided message, when the server rejected the value
    pub remote_message: Option<String>,
}

impl WriteFailure {
    fn new(field: &str, error: EngineError) -> Self {
        let remote_message = match &error {
            EngineError::Protocol(ProtocolError::Remote { message, .. }) => Some(message.clone()),
            _ => None,
        };
        Self {
            field: field.to_string(),
            error,
            remote_message,
        }
    }
}

/// Result of invoking an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActOutcome {
    /// The action ran on the current page
    Completed,
    /// The action showed another form, now addressable by this id
    Navigated(PageContextId),
}

impl Engine {
    /// Open a page and cache its form tree
    pub async fn open_page(&self, session_id: &str, page_id: &str) -> Result<OpenedPage> {
        if session_id.trim().is_empty() {
            return Err(EngineError::validation("session id is empty", ErrorAddress::default()));
        }
        if page_id.trim().is_empty() || page_id.contains(':') {
            return Err(EngineError::validation(
                format!("invalid page id '{page_id}'"),
                ErrorAddress::default(),
            ));
        }
        let session = self.session(session_id).ok_or_else(|| NotFoundError::SessionGone {
            session_id: session_id.to_string(),
            address: ErrorAddress::default(),
        })?;

        if let Some(reopened) = self.reopen(session.as_ref(), page_id) {
            return Ok(reopened);
        }

        let correlator = self.correlator(session);
        let interaction = Interaction::OpenForm {
            page_id: page_id.to_string(),
        };
        let correlated = correlator
            .invoke_and_wait(
                &interaction,
                HandlerPredicate::form_shown().or_remote_message(),
                WaitOptions::required(self.config().open_timeout()),
            )
            .await?;
        ensure_no_remote_errors(correlated.all_handlers(), &ErrorAddress::default())?;

        let tree = correlated
            .matched()
            .and_then(find_shown_form)
            .cloned()
            .ok_or_else(|| NotFoundError::Page {
                page_id: page_id.to_string(),
                address: ErrorAddress::default(),
            })?;
        let form_id = form_identity(&tree)
            .server_id
            .or_else(|| correlator.session().open_form_id(page_id))
            .ok_or_else(|| {
                ProtocolError::unexpected("shown form carries no server id", ErrorAddress::default())
            })?;

        let handlers = build_cache(&correlated.into_handlers());
        let (context, id) = self.store().create_with(session_id, page_id, |ctx| {
            ctx.form_ids.push(form_id.clone());
            ctx.tree = Some(Arc::new(tree));
            ctx.handlers = Arc::new(handlers);
        });
        tracing::info!(page_context = %id, form_id = %form_id, "page opened");
        Ok(self.describe(&context, false))
    }

    // A page whose form is still open gets a fresh context sharing the cache.
    fn reopen(&self, session: &dyn Session, page_id: &str) -> Option<OpenedPage> {
        let form_id = session.open_form_id(page_id)?;
        let previous = self.store().latest_for_page(session.id(), page_id)?;
        if previous.primary_form_id() != Some(form_id.as_str()) || previous.tree.is_none() {
            return None;
        }
        let (context, id) = self.store().create_with(session.id(), page_id, |ctx| {
            ctx.form_ids = previous.form_ids.clone();
            ctx.tree = previous.tree.clone();
            ctx.handlers = Arc::clone(&previous.handlers);
            ctx.needs_refresh = previous.needs_refresh;
        });
        tracing::debug!(page_context = %id, form_id = %form_id, "reusing open form");
        Some(self.describe(&context, true))
    }

    fn describe(&self, context: &PageContext, reused: bool) -> OpenedPage {
        let summary = context.summary(&self.config().control_path_prefix);
        OpenedPage {
            page_context_id: context.id.clone(),
            form_id: context.primary_form_id().unwrap_or_default().to_string(),
            caption: context
                .tree
                .as_deref()
                .and_then(|tree| form_identity(tree).caption),
            fields: summary.fields,
            repeaters: summary.repeaters,
            actions: summary.actions,
            tree_status: diagnose(context.tree.as_deref()),
            reused,
        }
    }

    /// Read a page as flat records, optionally filtered.
    ///
    /// Reading without filters while filters are believed active clears
    /// them, marks the page stale and fails with a retryable
    /// [`ProtocolError::StaleFilter`]; the next read reloads.
    pub async fn read_page(&self, page_context_id: &str, filters: Option<&Value>) -> Result<Vec<Record>> {
        let id = PageContextId::parse(page_context_id)?;
        let requested = match filters {
            Some(spec) => {
                parse_filters(spec).map_err(|message| EngineError::validation(message, id.address()))?
            }
            None => FilterState::new(),
        };

        let context = self.store().get_id(&id)?;
        let id = context.id.clone();
        let form_id = primary_form(&context)?;
        let correlator = self.correlator(self.live_session(&id)?);

        if requested.is_empty() {
            let stale = self
                .filters()
                .clear_filter_state_for_page(id.session_id(), id.page_id());
            if !stale.is_empty() {
                if let Err(err) = self.store().mark_stale(&id) {
                    tracing::warn!(page_context = %id, error = %err, "could not mark page stale");
                }
                return Err(ProtocolError::StaleFilter {
                    page_id: id.page_id().to_string(),
                    fields: stale.into_keys().collect(),
                    address: context.address(),
                }
                .into());
            }
        } else {
            self.sync_filters(&correlator, &context, &form_id, &requested)
                .await?;
        }

        let mut context = self.store().get_id(&id)?;
        if context.needs_refresh {
            context = self.reload(&correlator, &id, &form_id).await?;
        }

        let summary = context.summary(&self.config().control_path_prefix);
        let records = records::flatten(&summary, &context.handlers, &form_id);
        Ok(records::apply_filters(
            records,
            &label_filters(&summary, requested),
        ))
    }

    async fn sync_filters(
        &self,
        correlator: &Correlator,
        context: &PageContext,
        form_id: &str,
        requested: &FilterState,
    ) -> Result<()> {
        let (session_id, page_id) = (context.session_id(), context.page_id());
        let plan = FilterPlan::between(&self.filters().filter_state(session_id, page_id), requested);
        if plan.is_noop() {
            tracing::debug!(page_context = %context.id, "requested filters already active");
            return Ok(());
        }

        let summary = context.summary(&self.config().control_path_prefix);
        let repeater = summary.primary_repeater().ok_or_else(|| {
            EngineError::validation("page has no repeater to filter", context.address())
        })?;

        for field in &plan.remove {
            let address = context
                .address()
                .with_control(repeater.path.clone())
                .with_field(field.clone());
            let column_id = filter_column(repeater, field, &address)?;
            let handlers = correlator
                .invoke(&Interaction::RegisterFilter {
                    form_id: form_id.to_string(),
                    control_path: repeater.path.clone(),
                    column_id,
                    operation: FilterOperation::RemoveLine,
                })
                .await?;
            ensure_no_remote_errors(&handlers, &address)?;
            self.filters().remove_filter(session_id, page_id, field);
            self.merge_into(&context.id, &handlers);
        }

        for (field, condition) in &plan.apply {
            let address = context
                .address()
                .with_control(repeater.path.clone())
                .with_field(field.clone());
            let column_id = filter_column(repeater, field, &address)?;
            let mut phase = FilterPhase::Unset;

            let applied = async {
                let registered = correlator
                    .invoke(&Interaction::RegisterFilter {
                        form_id: form_id.to_string(),
                        control_path: repeater.path.clone(),
                        column_id: column_id.clone(),
                        operation: FilterOperation::AddLine,
                    })
                    .await?;
                ensure_no_remote_errors(&registered, &address)?;
                phase = FilterPhase::Registered;
                self.merge_into(&context.id, &registered);

                let correlated = correlator
                    .invoke_and_wait(
                        &Interaction::SaveFilterValue {
                            form_id: form_id.to_string(),
                            control_path: repeater.path.clone(),
                            column_id: column_id.clone(),
                            expression: condition.expression(),
                        },
                        HandlerPredicate::data_refresh(form_id).or_remote_message(),
                        WaitOptions::optional(self.config().refresh_timeout()),
                    )
                    .await?;
                ensure_no_remote_errors(correlated.all_handlers(), &address)?;
                phase = FilterPhase::Active;
                self.merge_into(&context.id, &correlated.into_handlers());
                Ok::<(), EngineError>(())
            }
            .await;

            if let Err(err) = applied {
                tracing::warn!(
                    page_context = %context.id,
                    field = %field,
                    phase = ?phase,
                    error = %err,
                    "filter not applied"
                );
                return Err(err);
            }
            self.filters()
                .set_filter(session_id, page_id, field, condition.clone());
            tracing::debug!(
                page_context = %context.id,
                field = %field,
                filter = %condition,
                phase = ?phase,
                "filter active"
            );
        }
        Ok(())
    }

    async fn reload(
        &self,
        correlator: &Correlator,
        id: &PageContextId,
        form_id: &str,
    ) -> Result<Arc<PageContext>> {
        let correlated = correlator
            .invoke_and_wait(
                &Interaction::LoadForm {
                    form_id: form_id.to_string(),
                },
                HandlerPredicate::data_refresh(form_id),
                WaitOptions::optional(self.config().refresh_timeout()),
            )
            .await?;
        ensure_no_remote_errors(correlated.all_handlers(), &id.address().with_form(form_id))?;

        let handlers = correlated.into_handlers();
        self.store().update(id, |ctx| {
            apply_handlers(ctx.handlers_mut(), &handlers);
            if let Some(tree) = find_shown_form(&handlers) {
                ctx.tree = Some(Arc::new(tree.clone()));
            }
            ctx.needs_refresh = false;
        })?;
        tracing::debug!(page_context = %id, "page reloaded");
        self.store().get_id(id)
    }

    /// Write a field by control path or by caption/name
    pub async fn write_field(
        &self,
        page_context_id: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> std::result::Result<WriteReceipt, WriteFailure> {
        self.try_write(page_context_id, field, value.into())
            .await
            .map_err(|error| WriteFailure::new(field, error))
    }

    async fn try_write(&self, page_context_id: &str, target: &str, value: FieldValue) -> Result<WriteReceipt> {
        let id = PageContextId::parse(page_context_id)?;
        if target.trim().is_empty() {
            return Err(EngineError::validation("field name is empty", id.address()));
        }
        let context = self.store().get_id(&id)?;
        let id = context.id.clone();
        let form_id = primary_form(&context)?;
        let correlator = self.correlator(self.live_session(&id)?);

        let prefix = &self.config().control_path_prefix;
        let summary = context.summary(prefix);
        let (control_path, label) = match summary.field(target) {
            Some(field) if field.readonly || !field.enabled => {
                return Err(EngineError::validation(
                    format!("field '{}' is not editable", field.label()),
                    context.address().with_control(field.path.clone()).with_field(target),
                ));
            }
            Some(field) => (field.path.clone(), field.label().to_string()),
            None if target.starts_with(&format!("{prefix}:")) => (target.to_string(), target.to_string()),
            None => {
                return Err(NotFoundError::Field {
                    field: target.to_string(),
                    address: context.address().with_field(target),
                }
                .into());
            }
        };
        let address = context
            .address()
            .with_control(control_path.clone())
            .with_field(label.clone());

        let correlated = correlator
            .invoke_and_wait(
                &Interaction::SaveValue {
                    form_id: form_id.clone(),
                    control_path: control_path.clone(),
                    new_value: value.as_wire_text(),
                },
                HandlerPredicate::changes_for(form_id.clone()).or_remote_message(),
                WaitOptions::optional(self.config().write_echo_timeout()),
            )
            .await?;
        ensure_no_remote_errors(correlated.all_handlers(), &address)?;

        let confirmed = correlated.source.is_some();
        let echo = correlated.into_handlers();
        let echoed = match self.store().update(&id, |ctx| {
            record_write(ctx.handlers_mut(), &form_id, &control_path, value.clone(), &echo)
        }) {
            Ok(sync) => sync.echo.touched(),
            Err(err) => {
                // the write itself succeeded; only the local mirror is behind
                tracing::warn!(page_context = %id, error = %err, "could not record write locally");
                0
            }
        };
        tracing::debug!(
            page_context = %id,
            form_id = %form_id,
            control_path = %control_path,
            echoed,
            confirmed,
            "field written"
        );

        Ok(WriteReceipt {
            page_context_id: id,
            form_id,
            control_path,
            field: label,
            value,
            echoed,
            confirmed,
        })
    }

    /// Invoke an action; a shown form is followed when it appears in time
    pub async fn act(&self, page_context_id: &str, action: &str) -> Result<ActOutcome> {
        self.invoke_action(page_context_id, action, Requirement::Optional)
            .await
    }

    /// Invoke an action that must show another form
    pub async fn navigate(&self, page_context_id: &str, action: &str) -> Result<ActOutcome> {
        self.invoke_action(page_context_id, action, Requirement::Required)
            .await
    }

    async fn invoke_action(
        &self,
        page_context_id: &str,
        action: &str,
        requirement: Requirement,
    ) -> Result<ActOutcome> {
        let id = PageContextId::parse(page_context_id)?;
        if action.trim().is_empty() {
            return Err(EngineError::validation("action name is empty", id.address()));
        }
        let context = self.store().get_id(&id)?;
        let id = context.id.clone();
        let form_id = primary_form(&context)?;
        let correlator = self.correlator(self.live_session(&id)?);

        let summary = context.summary(&self.config().control_path_prefix);
        let (control_path, system_action) = self.resolve_action(&summary, action, &context)?;
        let mut address = context.address();
        if let Some(path) = &control_path {
            address = address.with_control(path.clone());
        }

        let timeout = self.config().action_timeout();
        let options = match requirement {
            Requirement::Required => WaitOptions::required(timeout),
            Requirement::Optional => WaitOptions::optional(timeout),
        };
        let correlated = correlator
            .invoke_and_wait(
                &Interaction::InvokeAction {
                    form_id: form_id.clone(),
                    control_path,
                    system_action,
                },
                HandlerPredicate::form_shown().or_remote_message(),
                options,
            )
            .await
            .map_err(|err| match err {
                EngineError::Protocol(protocol) => {
                    EngineError::Protocol(protocol.with_address(address.clone()))
                }
                other => other,
            })?;
        ensure_no_remote_errors(correlated.all_handlers(), &address)?;

        let shown = correlated.matched().and_then(find_shown_form).cloned();
        let handlers = correlated.into_handlers();

        // server-side state may have changed under the source page
        if let Err(err) = self.store().update(&id, |ctx| {
            apply_handlers(ctx.handlers_mut(), &handlers);
            ctx.needs_refresh = true;
        }) {
            tracing::warn!(page_context = %id, error = %err, "could not mark source page stale");
        }

        let Some(tree) = shown else {
            tracing::debug!(page_context = %id, action = %action, "action completed");
            return Ok(ActOutcome::Completed);
        };
        let identity = form_identity(&tree);
        let new_form = identity.server_id.clone().ok_or_else(|| {
            ProtocolError::unexpected("shown form carries no server id", address.clone())
        })?;

        if new_form == form_id {
            if let Err(err) = self
                .store()
                .update(&id, |ctx| ctx.tree = Some(Arc::new(tree)))
            {
                tracing::warn!(page_context = %id, error = %err, "could not refresh form tree");
            }
            return Ok(ActOutcome::Completed);
        }

        let page_id = identity
            .page_id
            .unwrap_or_else(|| new_form.replace(':', "_"));
        let cache = build_cache(&handlers);
        let (_, new_id) = self.store().create_with(id.session_id(), &page_id, |ctx| {
            ctx.form_ids.push(new_form.clone());
            ctx.tree = Some(Arc::new(tree));
            ctx.handlers = Arc::new(cache);
        });
        tracing::info!(from = %id, to = %new_id, action = %action, "action navigated");
        Ok(ActOutcome::Navigated(new_id))
    }

    /// Make a list row current by bookmark
    pub async fn select_row(&self, page_context_id: &str, bookmark: &str) -> Result<()> {
        let id = PageContextId::parse(page_context_id)?;
        if bookmark.is_empty() {
            return Err(EngineError::validation("bookmark is empty", id.address()));
        }
        let context = self.store().get_id(&id)?;
        let id = context.id.clone();
        let form_id = primary_form(&context)?;
        let correlator = self.correlator(self.live_session(&id)?);

        let summary = context.summary(&self.config().control_path_prefix);
        let repeater = summary.primary_repeater().ok_or_else(|| {
            EngineError::validation("page has no rows to select", context.address())
        })?;
        let handlers = correlator
            .invoke(&Interaction::SetCurrentRow {
                form_id,
                control_path: repeater.path.clone(),
                bookmark: bookmark.to_string(),
            })
            .await?;
        ensure_no_remote_errors(&handlers, &context.address().with_control(repeater.path.clone()))?;
        self.merge_into(&id, &handlers);
        Ok(())
    }

    /// Close the page's form and drop its context
    pub async fn close_page(&self, page_context_id: &str) -> Result<()> {
        let id = PageContextId::parse(page_context_id)?;
        let context = self.store().get_id(&id)?;
        let id = context.id.clone();
        let session = self.live_session(&id)?;

        if let Some(form_id) = context.primary_form_id() {
            let still_open = session.open_form_ids().iter().any(|open| open == form_id);
            if still_open {
                let handlers = self
                    .correlator(session)
                    .invoke(&Interaction::CloseForm {
                        form_id: form_id.to_string(),
                    })
                    .await?;
                ensure_no_remote_errors(&handlers, &context.address())?;
            }
        }

        self.store().invalidate(&id);
        if self
            .store()
            .latest_for_page(id.session_id(), id.page_id())
            .is_none()
        {
            self.filters()
                .clear_filter_state_for_page(id.session_id(), id.page_id());
        }
        tracing::info!(page_context = %id, "page closed");
        Ok(())
    }

    /// Close every page of a session concurrently
    pub async fn close_session_pages(&self, session_id: &str) -> Vec<(PageContextId, Result<()>)> {
        let ids = self.store().ids_for_session(session_id);
        let results = join_all(ids.iter().map(|id| {
            let text = id.to_string();
            async move { self.close_page(&text).await }
        }))
        .await;
        ids.into_iter().zip(results).collect()
    }

    // Tree actions first; the fixed code table only when the tree has no match.
    fn resolve_action(
        &self,
        summary: &TreeSummary,
        action: &str,
        context: &PageContext,
    ) -> Result<(Option<String>, Option<u32>)> {
        if let Some(meta) = summary.action(action) {
            if !meta.enabled {
                return Err(EngineError::validation(
                    format!("action '{action}' is disabled"),
                    context.address().with_control(meta.path.clone()),
                ));
            }
            return Ok((Some(meta.path.clone()), meta.system_action));
        }
        match self.config().action_code(action) {
            Some(code) => {
                tracing::warn!(
                    page_context = %context.id,
                    action = %action,
                    code,
                    "action not in form tree; falling back to system action code"
                );
                Ok((None, Some(code)))
            }
            None => Err(NotFoundError::Action {
                action: action.to_string(),
                address: context.address(),
            }
            .into()),
        }
    }

    fn live_session(&self, id: &PageContextId) -> Result<Arc<dyn Session>> {
        self.session(id.session_id()).ok_or_else(|| {
            NotFoundError::SessionGone {
                session_id: id.session_id().to_string(),
                address: id.address(),
            }
            .into()
        })
    }

    fn merge_into(&self, id: &PageContextId, handlers: &[Handler]) {
        if let Err(err) = self
            .store()
            .update(id, |ctx| apply_handlers(ctx.handlers_mut(), handlers))
        {
            tracing::warn!(page_context = %id, error = %err, "could not merge handlers into cache");
        }
    }
}

fn primary_form(context: &PageContext) -> Result<String> {
    context
        .primary_form_id()
        .map(String::from)
        .ok_or_else(|| ProtocolError::unexpected("page context has no form", context.address()).into())
}

fn filter_column(repeater: &RepeaterMeta, field: &str, address: &ErrorAddress) -> Result<String> {
    let column = repeater.column(field).ok_or_else(|| NotFoundError::Field {
        field: field.to_string(),
        address: address.clone(),
    })?;
    column
        .column_id
        .clone()
        .or_else(|| column.name.clone())
        .ok_or_else(|| {
            ProtocolError::unexpected(
                format!("column '{}' has no filter id", column.label()),
                address.clone(),
            )
            .into()
        })
}

// callers may name columns by id or caption; records are keyed by label
fn label_filters(summary: &TreeSummary, requested: FilterState) -> FilterState {
    let Some(repeater) = summary.primary_repeater() else {
        return requested;
    };
    requested
        .into_iter()
        .map(|(field, condition)| {
            let label = repeater
                .column(&field)
                .map(|column| column.label().to_string())
                .unwrap_or(field);
            (label, condition)
        })
        .collect()
}
