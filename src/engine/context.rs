//! Page contexts and their identifiers

use super::error::{EngineError, ErrorAddress};
use super::tree::TreeSummary;
use super::wire::Handler;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const PAGE_MARKER: &str = "page";

/// Identifier of one open page: `{session}:page:{page}:{openedAtMillis}`.
///
/// Parsed from the right so session ids may themselves contain colons. The
/// timestamp segment is optional on input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PageContextId {
    session_id: String,
    page_id: String,
    opened_at: Option<i64>,
}

impl PageContextId {
    /// Identifier for a page opened at `opened_at` (milliseconds since epoch)
    pub fn new(session_id: impl Into<String>, page_id: impl Into<String>, opened_at: i64) -> Self {
        Self {
            session_id: session_id.into(),
            page_id: page_id.into(),
            opened_at: Some(opened_at),
        }
    }

    /// Parse and validate an identifier
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let invalid = |reason: &str| {
            EngineError::validation(
                format!("invalid page context id '{text}': {reason}"),
                ErrorAddress::page_context(text),
            )
        };

        let segments: Vec<&str> = text.split(':').collect();
        if segments.len() < 3 {
            return Err(invalid("expected at least 3 colon-separated segments"));
        }

        let n = segments.len();
        let (session, page_id, opened_at) = if n >= 4
            && segments[n - 3] == PAGE_MARKER
            && segments[n - 1].parse::<i64>().is_ok()
        {
            let opened_at = segments[n - 1]
                .parse::<i64>()
                .map_err(|_| invalid("timestamp is not a number"))?;
            (&segments[..n - 3], segments[n - 2], Some(opened_at))
        } else if segments[n - 2] == PAGE_MARKER {
            (&segments[..n - 2], segments[n - 1], None)
        } else {
            return Err(invalid("missing 'page' marker"));
        };

        let session_id = session.join(":");
        if session_id.is_empty() {
            return Err(invalid("empty session id"));
        }
        if page_id.is_empty() {
            return Err(invalid("empty page id"));
        }

        Ok(Self {
            session_id,
            page_id: page_id.to_string(),
            opened_at,
        })
    }

    /// Owning session
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Page identifier
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Milliseconds since epoch when the page was opened
    pub fn opened_at(&self) -> Option<i64> {
        self.opened_at
    }

    /// Error address naming this context
    pub fn address(&self) -> ErrorAddress {
        ErrorAddress::page_context(self.to_string())
    }
}

impl fmt::Display for PageContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{PAGE_MARKER}:{}", self.session_id, self.page_id)?;
        if let Some(opened_at) = self.opened_at {
            write!(f, ":{opened_at}")?;
        }
        Ok(())
    }
}

impl FromStr for PageContextId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<PageContextId> for String {
    fn from(id: PageContextId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PageContextId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Locally mirrored state of one open page.
///
/// Stored behind `Arc` and replaced wholesale on update; the tree and the
/// handler cache are shared between successive snapshots until written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    /// Identifier
    pub id: PageContextId,
    /// Server forms backing the page; the first is the primary form
    pub form_ids: Vec<String>,
    /// Form tree from the last `FormToShow`
    pub tree: Option<Arc<Value>>,
    /// Interpreted handler cache
    pub handlers: Arc<Vec<Handler>>,
    /// Cached data may no longer reflect the server
    pub needs_refresh: bool,
    /// When the page was opened
    pub opened_at: DateTime<Utc>,
    /// Last local modification
    pub updated_at: DateTime<Utc>,
    /// Bumped on every update
    pub revision: u64,
}

impl PageContext {
    /// Empty context for a freshly opened page
    pub fn new(id: PageContextId) -> Self {
        let opened_at = id
            .opened_at()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);
        Self {
            id,
            form_ids: Vec::new(),
            tree: None,
            handlers: Arc::new(Vec::new()),
            needs_refresh: false,
            opened_at,
            updated_at: opened_at,
            revision: 0,
        }
    }

    /// Owning session
    pub fn session_id(&self) -> &str {
        self.id.session_id()
    }

    /// Page identifier
    pub fn page_id(&self) -> &str {
        self.id.page_id()
    }

    /// Primary server form
    pub fn primary_form_id(&self) -> Option<&str> {
        self.form_ids.first().map(String::as_str)
    }

    /// Metadata extracted from the tree; empty when there is none
    pub fn summary(&self, prefix: &str) -> TreeSummary {
        self.tree
            .as_deref()
            .map(|tree| TreeSummary::from_tree(tree, prefix))
            .unwrap_or_default()
    }

    /// Handler cache for in-place mutation (copy-on-write)
    pub fn handlers_mut(&mut self) -> &mut Vec<Handler> {
        Arc::make_mut(&mut self.handlers)
    }

    /// Record a local modification
    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Error address naming this context and its primary form
    pub fn address(&self) -> ErrorAddress {
        let address = self.id.address();
        match self.primary_form_id() {
            Some(form_id) => address.with_form(form_id),
            None => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_identifier_round_trips_through_display() {
        let id = PageContextId::parse("S1:page:21:1700000000000").unwrap();
        assert_eq!(id.session_id(), "S1");
        assert_eq!(id.page_id(), "21");
        assert_eq!(id.opened_at(), Some(1_700_000_000_000));
        assert_eq!(id.to_string(), "S1:page:21:1700000000000");
    }

    #[test]
    fn session_ids_may_contain_colons() {
        let id = PageContextId::parse("tenant:S1:page:22:5").unwrap();
        assert_eq!(id.session_id(), "tenant:S1");
        assert_eq!(id.page_id(), "22");
    }

    #[test]
    fn timestamp_is_optional() {
        let id = PageContextId::parse("S1:page:21").unwrap();
        assert_eq!(id.opened_at(), None);
        assert_eq!(id.to_string(), "S1:page:21");
    }

    #[test]
    fn malformed_identifiers_are_validation_errors() {
        for text in ["", "S1", "S1:21", "S1:form:21:5", ":page:21:5", "S1:page::5"] {
            let err = PageContextId::parse(text).unwrap_err();
            assert!(
                matches!(err, EngineError::Validation { .. }),
                "{text:?} gave {err}"
            );
        }
    }

    #[test]
    fn context_serializes_with_string_id() {
        let ctx = PageContext::new(PageContextId::new("S1", "21", 1_000));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["id"], "S1:page:21:1000");
        let back: PageContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn handler_cache_is_copy_on_write() {
        let mut ctx = PageContext::new(PageContextId::new("S1", "21", 1));
        let snapshot = ctx.clone();
        ctx.handlers_mut().push(Handler::Callback(Vec::new()));
        assert_eq!(ctx.handlers.len(), 1);
        assert!(snapshot.handlers.is_empty());
    }
}
