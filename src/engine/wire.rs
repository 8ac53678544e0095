//! Handler envelopes and outgoing interactions
//!
//! A response is a list of handler envelopes `{handlerType, parameters}`.
//! [`Handler`] is the tagged union the engine works with; it decodes from
//! [`RawHandler`] and serializes back to the same envelope, so unknown
//! envelopes survive a cache round trip intact.

use super::changes::{Change, ChangeKind, classify};
use super::error::RemoteMessageKind;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Change handler discriminator
pub const CHANGE_HANDLER: &str = "DN.LogicalClientChangeHandler";
/// Event handler discriminator
pub const EVENT_HANDLER: &str = "DN.LogicalClientEventRaisingHandler";
/// Callback completion discriminator
pub const CALLBACK_HANDLER: &str = "DN.CallbackResponseProperties";

/// Event name carrying a newly shown form
pub const FORM_TO_SHOW: &str = "FormToShow";

/// Handler types that carry remote messages, and the kind they map to.
pub const MESSAGE_HANDLERS: &[(&str, RemoteMessageKind)] = &[
    ("DN.ErrorMessageProperties", RemoteMessageKind::Error),
    ("DN.ErrorDialogProperties", RemoteMessageKind::Error),
    ("DN.ValidationMessageProperties", RemoteMessageKind::Validation),
    ("DN.ConfirmDialogProperties", RemoteMessageKind::Confirm),
];

/// Handler envelope exactly as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHandler {
    /// Discriminator
    #[serde(rename = "handlerType")]
    pub handler_type: String,
    /// Positional parameters
    #[serde(default)]
    pub parameters: Vec<Value>,
}

/// Set of changes the server reported for one form
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Form the changes apply to
    pub form_id: String,
    /// Changes in arrival order
    pub changes: Vec<Change>,
    /// Parameters past the change list, kept for round trips
    pub trailing: Vec<Value>,
}

/// A raised client event such as `FormToShow`
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    /// Event name
    pub name: String,
    /// Remaining parameters
    pub arguments: Vec<Value>,
}

impl ClientEvent {
    /// Form tree carried by a `FormToShow` event
    pub fn shown_form(&self) -> Option<&Value> {
        if self.name != FORM_TO_SHOW {
            return None;
        }
        self.arguments.iter().find(|arg| arg.is_object())
    }
}

/// Remote message (error, validation failure or confirmation request)
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    /// Message kind
    pub kind: RemoteMessageKind,
    /// Original discriminator
    pub handler_type: String,
    /// Best-effort human-readable text
    pub message: String,
    /// Control path the message points at, when the server names one
    pub control_path: Option<String>,
    /// Original parameters
    pub parameters: Vec<Value>,
}

/// Discriminated handler envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawHandler")]
pub enum Handler {
    /// Field and row changes for a form
    Changes(ChangeSet),
    /// Raised client event
    Event(ClientEvent),
    /// Interaction completion notice
    Callback(Vec<Value>),
    /// Error, validation or confirmation payload
    Message(RemoteMessage),
    /// Anything the engine does not interpret
    Other(RawHandler),
}

impl From<RawHandler> for Handler {
    fn from(raw: RawHandler) -> Self {
        match raw.handler_type.as_str() {
            CHANGE_HANDLER => match decode_change_set(&raw.parameters) {
                Some(set) => Handler::Changes(set),
                None => Handler::Other(raw),
            },
            EVENT_HANDLER => match raw.parameters.split_first() {
                Some((Value::String(name), rest)) => Handler::Event(ClientEvent {
                    name: name.clone(),
                    arguments: rest.to_vec(),
                }),
                _ => Handler::Other(raw),
            },
            CALLBACK_HANDLER => Handler::Callback(raw.parameters),
            other => match message_kind(other) {
                Some(kind) => Handler::Message(decode_message(kind, raw)),
                None => Handler::Other(raw),
            },
        }
    }
}

// Borrowed envelope so serializing a cached handler never clones it and a
// change that fails to serialize fails the whole handler.
#[derive(Serialize)]
struct Envelope<'a, P: Serialize> {
    #[serde(rename = "handlerType")]
    handler_type: &'a str,
    parameters: P,
}

struct ChangeParameters<'a>(&'a ChangeSet);

impl Serialize for ChangeParameters<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let set = self.0;
        let mut seq = serializer.serialize_seq(Some(2 + set.trailing.len()))?;
        seq.serialize_element(&set.form_id)?;
        seq.serialize_element(&set.changes)?;
        for extra in &set.trailing {
            seq.serialize_element(extra)?;
        }
        seq.end()
    }
}

struct EventParameters<'a>(&'a ClientEvent);

impl Serialize for EventParameters<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let event = self.0;
        let mut seq = serializer.serialize_seq(Some(1 + event.arguments.len()))?;
        seq.serialize_element(&event.name)?;
        for argument in &event.arguments {
            seq.serialize_element(argument)?;
        }
        seq.end()
    }
}

impl Serialize for Handler {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Handler::Changes(set) => Envelope {
                handler_type: CHANGE_HANDLER,
                parameters: ChangeParameters(set),
            }
            .serialize(serializer),
            Handler::Event(event) => Envelope {
                handler_type: EVENT_HANDLER,
                parameters: EventParameters(event),
            }
            .serialize(serializer),
            Handler::Callback(parameters) => Envelope {
                handler_type: CALLBACK_HANDLER,
                parameters,
            }
            .serialize(serializer),
            Handler::Message(message) => Envelope {
                handler_type: &message.handler_type,
                parameters: &message.parameters,
            }
            .serialize(serializer),
            Handler::Other(raw) => raw.serialize(serializer),
        }
    }
}

fn decode_change_set(parameters: &[Value]) -> Option<ChangeSet> {
    let form_id = parameters.first()?.as_str()?.to_string();
    let changes = match parameters.get(1) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match serde_json::from_value::<Change>(item.clone()) {
                Ok(change) => Some(change),
                Err(err) => {
                    tracing::debug!(form_id = %form_id, error = %err, "skipping undecodable change");
                    None
                }
            })
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return None,
    };
    let trailing = parameters.iter().skip(2).cloned().collect();
    Some(ChangeSet {
        form_id,
        changes,
        trailing,
    })
}

fn message_kind(handler_type: &str) -> Option<RemoteMessageKind> {
    MESSAGE_HANDLERS
        .iter()
        .find(|(name, _)| *name == handler_type)
        .map(|(_, kind)| *kind)
}

fn decode_message(kind: RemoteMessageKind, raw: RawHandler) -> RemoteMessage {
    let mut message = None;
    let mut control_path = None;

    for parameter in &raw.parameters {
        match parameter {
            Value::String(text) if message.is_none() => message = Some(text.clone()),
            Value::Object(map) => {
                if message.is_none() {
                    message = ["Message", "message", "Text", "Caption"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(Value::as_str))
                        .map(String::from);
                }
                if control_path.is_none() {
                    control_path = ["ControlPath", "controlPath"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(Value::as_str))
                        .map(String::from);
                }
            }
            _ => {}
        }
    }

    RemoteMessage {
        kind,
        handler_type: raw.handler_type,
        message: message.unwrap_or_else(|| format!("{kind} reported by server")),
        control_path,
        parameters: raw.parameters,
    }
}

impl Handler {
    /// Change set, if this is a change handler
    pub fn as_changes(&self) -> Option<&ChangeSet> {
        match self {
            Handler::Changes(set) => Some(set),
            _ => None,
        }
    }

    /// Remote message, if this handler carries one
    pub fn as_message(&self) -> Option<&RemoteMessage> {
        match self {
            Handler::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Form tree, if this is a `FormToShow` event
    pub fn shown_form(&self) -> Option<&Value> {
        match self {
            Handler::Event(event) => event.shown_form(),
            _ => None,
        }
    }

    /// Whether this handler carries a change of the given kind for a form
    pub fn has_change(&self, form_id: &str, kind: ChangeKind) -> bool {
        self.as_changes().is_some_and(|set| {
            set.form_id == form_id
                && set
                    .changes
                    .iter()
                    .any(|change| classify(change) == Some(kind))
        })
    }
}

/// Decode a list of handler envelopes
pub fn decode_handlers(value: Value) -> Result<Vec<Handler>, serde_json::Error> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value),
        single @ Value::Object(_) => Ok(vec![serde_json::from_value(single)?]),
        other => Err(serde::de::Error::custom(format!(
            "expected handler list, got {other}"
        ))),
    }
}

/// First `FormToShow` tree in a batch
pub fn find_shown_form(handlers: &[Handler]) -> Option<&Value> {
    handlers.iter().find_map(Handler::shown_form)
}

/// Operation applied by a filter registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperation {
    /// Add a filter line for a column
    AddLine,
    /// Remove the filter line for a column
    RemoveLine,
}

impl FilterOperation {
    fn code(&self) -> u32 {
        match self {
            FilterOperation::AddLine => 1,
            FilterOperation::RemoveLine => 2,
        }
    }
}

/// Outgoing protocol interaction
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    /// Open a page, creating a new form
    OpenForm {
        /// Page to open
        page_id: String,
    },
    /// Reload the data of an open form
    LoadForm {
        /// Target form
        form_id: String,
    },
    /// Close an open form
    CloseForm {
        /// Target form
        form_id: String,
    },
    /// Write a value into a control
    SaveValue {
        /// Target form
        form_id: String,
        /// Target control
        control_path: String,
        /// Value as text
        new_value: String,
    },
    /// Invoke an action control or a system action code
    InvokeAction {
        /// Target form
        form_id: String,
        /// Action control, when resolved from the tree
        control_path: Option<String>,
        /// Numeric system action, when known
        system_action: Option<u32>,
    },
    /// Register (or remove) a column filter line
    RegisterFilter {
        /// Target form
        form_id: String,
        /// Repeater the filter applies to
        control_path: String,
        /// Composite table/field identifier of the column
        column_id: String,
        /// Add or remove
        operation: FilterOperation,
    },
    /// Set the expression of a registered filter line
    SaveFilterValue {
        /// Target form
        form_id: String,
        /// Repeater the filter applies to
        control_path: String,
        /// Composite table/field identifier of the column
        column_id: String,
        /// Filter expression in remote syntax
        expression: String,
    },
    /// Select a row by bookmark
    SetCurrentRow {
        /// Target form
        form_id: String,
        /// Repeater
        control_path: String,
        /// Row bookmark
        bookmark: String,
    },
}

impl Interaction {
    /// Interaction name used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Interaction::OpenForm { .. } => "OpenForm",
            Interaction::LoadForm { .. } => "LoadForm",
            Interaction::CloseForm { .. } => "CloseForm",
            Interaction::SaveValue { .. } => "SaveValue",
            Interaction::InvokeAction { .. } => "InvokeAction",
            Interaction::RegisterFilter { .. } => "Filter",
            Interaction::SaveFilterValue { .. } => "SaveFilterValue",
            Interaction::SetCurrentRow { .. } => "SetCurrentRow",
        }
    }

    /// Form targeted by this interaction
    pub fn form_id(&self) -> Option<&str> {
        match self {
            Interaction::OpenForm { .. } => None,
            Interaction::LoadForm { form_id }
            | Interaction::CloseForm { form_id }
            | Interaction::SaveValue { form_id, .. }
            | Interaction::InvokeAction { form_id, .. }
            | Interaction::RegisterFilter { form_id, .. }
            | Interaction::SaveFilterValue { form_id, .. }
            | Interaction::SetCurrentRow { form_id, .. } => Some(form_id),
        }
    }

    /// Control targeted by this interaction
    pub fn control_path(&self) -> Option<&str> {
        match self {
            Interaction::SaveValue { control_path, .. }
            | Interaction::RegisterFilter { control_path, .. }
            | Interaction::SaveFilterValue { control_path, .. }
            | Interaction::SetCurrentRow { control_path, .. } => Some(control_path),
            Interaction::InvokeAction { control_path, .. } => control_path.as_deref(),
            _ => None,
        }
    }

    /// Whether this interaction is part of the filter protocol
    pub fn is_filter_step(&self) -> bool {
        matches!(
            self,
            Interaction::RegisterFilter { .. } | Interaction::SaveFilterValue { .. }
        )
    }

    /// Wire encoding with a fresh callback id
    pub fn to_wire(&self) -> Value {
        self.to_wire_with_callback(&Uuid::new_v4().to_string())
    }

    /// Wire encoding with a caller-chosen callback id
    pub fn to_wire_with_callback(&self, callback_id: &str) -> Value {
        let named = match self {
            Interaction::OpenForm { page_id } => json!({ "page": page_id }),
            Interaction::LoadForm { .. } | Interaction::CloseForm { .. } => json!({}),
            Interaction::SaveValue { new_value, .. } => json!({ "newValue": new_value }),
            Interaction::InvokeAction { system_action, .. } => match system_action {
                Some(code) => json!({ "systemAction": code }),
                None => json!({}),
            },
            Interaction::RegisterFilter {
                column_id,
                operation,
                ..
            } => json!({ "filterColumnId": column_id, "filterOperation": operation.code() }),
            Interaction::SaveFilterValue {
                column_id,
                expression,
                ..
            } => json!({ "filterColumnId": column_id, "filterValue": expression }),
            Interaction::SetCurrentRow { bookmark, .. } => json!({ "key": bookmark }),
        };

        let mut envelope = Map::new();
        envelope.insert("interactionName".into(), Value::String(self.name().into()));
        if let Some(form_id) = self.form_id() {
            envelope.insert("formId".into(), Value::String(form_id.into()));
        }
        if let Some(path) = self.control_path() {
            envelope.insert("controlPath".into(), Value::String(path.into()));
        }
        envelope.insert("namedParameters".into(), named);
        envelope.insert("callbackId".into(), Value::String(callback_id.into()));
        Value::Object(envelope)
    }
}
