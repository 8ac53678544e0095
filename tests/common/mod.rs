//! Scripted fake session shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use formlink::engine::error::TransportError;
use formlink::engine::wire::{CHANGE_HANDLER, EVENT_HANDLER, FORM_TO_SHOW, Interaction};
use formlink::{Engine, EngineConfig, Session, SessionRegistry};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What the fake server does with one interaction
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// Synchronous response payload
    pub sync: Value,
    /// Payloads pushed on the event stream before the response returns
    pub pushed: Vec<Value>,
    /// Transport failure instead of a response
    pub fail: Option<TransportError>,
}

impl Reply {
    pub fn sync(sync: Value) -> Self {
        Self {
            sync,
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::sync(json!([]))
    }

    pub fn pushed(sync: Value, pushed: Value) -> Self {
        Self {
            sync,
            pushed: vec![pushed],
            fail: None,
        }
    }

    pub fn fail(error: TransportError) -> Self {
        Self {
            fail: Some(error),
            ..Self::default()
        }
    }
}

type Responder = Box<dyn FnMut(&Interaction) -> Reply + Send>;

/// Session whose server side is a closure
pub struct FakeSession {
    id: String,
    events: broadcast::Sender<Value>,
    responder: Mutex<Responder>,
    calls: Mutex<Vec<Interaction>>,
    open_forms: Mutex<HashMap<String, String>>,
}

impl FakeSession {
    pub fn new(id: &str, responder: impl FnMut(&Interaction) -> Reply + Send + 'static) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: id.to_string(),
            events,
            responder: Mutex::new(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
            open_forms: Mutex::new(HashMap::new()),
        })
    }

    /// Every interaction received so far
    pub fn calls(&self) -> Vec<Interaction> {
        self.calls.lock().clone()
    }

    /// Number of interactions with this wire name
    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.name() == name).count()
    }

    /// Number of filter round trips
    pub fn filter_calls(&self) -> usize {
        self.calls.lock().iter().filter(|call| call.is_filter_step()).count()
    }

    /// Push an unsolicited payload on the event stream
    pub fn push(&self, payload: Value) {
        let _ = self.events.send(payload);
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn track_forms(&self, interaction: &Interaction, reply: &Reply) {
        match interaction {
            Interaction::OpenForm { page_id } => {
                let shown = std::iter::once(&reply.sync)
                    .chain(reply.pushed.iter())
                    .find_map(shown_server_id);
                if let Some(form_id) = shown {
                    self.open_forms.lock().insert(page_id.clone(), form_id);
                }
            }
            Interaction::CloseForm { form_id } => {
                self.open_forms.lock().retain(|_, open| open != form_id);
            }
            _ => {}
        }
    }
}

fn shown_server_id(payload: &Value) -> Option<String> {
    payload.as_array()?.iter().find_map(|handler| {
        let params = handler.get("parameters")?.as_array()?;
        if handler.get("handlerType")?.as_str()? != EVENT_HANDLER
            || params.first()?.as_str()? != FORM_TO_SHOW
        {
            return None;
        }
        params.get(1)?.get("ServerId")?.as_str().map(String::from)
    })
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, interaction: &Interaction) -> Result<Value, TransportError> {
        self.calls.lock().push(interaction.clone());
        let reply = {
            let mut responder = self.responder.lock();
            (*responder)(interaction)
        };
        if let Some(error) = reply.fail {
            return Err(error);
        }
        self.track_forms(interaction, &reply);
        for payload in &reply.pushed {
            let _ = self.events.send(payload.clone());
        }
        Ok(reply.sync)
    }

    fn events(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    fn open_form_id(&self, page_id: &str) -> Option<String> {
        self.open_forms.lock().get(page_id).cloned()
    }

    fn open_form_ids(&self) -> Vec<String> {
        self.open_forms.lock().values().cloned().collect()
    }
}

/// Engine with one registered fake session and short waits
pub fn engine_with(session: Arc<FakeSession>) -> (Engine, Arc<SessionRegistry>) {
    init_tracing();
    let registry = Arc::new(SessionRegistry::new());
    registry.register(session);
    let config = EngineConfig {
        open_timeout_ms: 500,
        refresh_timeout_ms: 200,
        action_timeout_ms: 200,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, registry.clone()).expect("engine");
    (engine, registry)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn form_to_show(tree: Value) -> Value {
    json!([{ "handlerType": EVENT_HANDLER, "parameters": [FORM_TO_SHOW, tree] }])
}

pub fn changes(form_id: &str, changes: Value) -> Value {
    json!([{ "handlerType": CHANGE_HANDLER, "parameters": [form_id, changes] }])
}

/// Concatenate handler lists into one response
pub fn batch(parts: &[Value]) -> Value {
    Value::Array(
        parts
            .iter()
            .filter_map(Value::as_array)
            .flatten()
            .cloned()
            .collect(),
    )
}

pub fn validation_message(text: &str) -> Value {
    json!([{ "handlerType": "DN.ValidationMessageProperties", "parameters": [text] }])
}

pub const LIST_FORM: &str = "F-LIST";
pub const CARD_FORM: &str = "F-CARD";
pub const REPEATER_PATH: &str = "server:c[0]";

/// Customer list: one repeater with No. and Name columns, plus actions
pub fn list_tree() -> Value {
    json!({
        "ServerId": LIST_FORM,
        "PageId": "21",
        "Caption": "Customers",
        "Children": [
            {
                "t": "rc",
                "Name": "CustomerList",
                "Columns": [
                    { "t": "sc", "Caption": "No.", "ColumnBinder": { "Name": "18_Customer.1" } },
                    { "t": "sc", "Caption": "Name", "ColumnBinder": { "Name": "18_Customer.2" } }
                ],
                "Children": [{ "t": "sc", "Caption": "row template" }]
            },
            { "t": "ac", "Caption": "&Edit", "Name": "EditAction" },
            { "t": "ac", "Caption": "Disabled", "Enabled": false }
        ]
    })
}

/// Customer card: page-level fields and one action
pub fn card_tree() -> Value {
    json!({
        "ServerId": CARD_FORM,
        "PageId": "30",
        "Caption": "Customer Card",
        "Children": [
            {
                "t": "gc",
                "Caption": "General",
                "Children": [
                    { "t": "sc", "Caption": "No.", "StringValue": "10000", "Editable": false },
                    { "t": "sc", "Caption": "Name", "StringValue": "Adatum" },
                    { "t": "dc", "Caption": "Balance", "DecimalValue": 12.5 }
                ]
            },
            { "t": "ac", "Caption": "Post", "SystemAction": 70 }
        ]
    })
}

pub const CUSTOMERS: &[(&str, &str, &str)] = &[
    ("B1", "10000", "Adatum"),
    ("B2", "20000", "Trey Research"),
    ("B3", "30000", "School of Fine Art"),
];

/// Refresh of the list repeater with the given rows, mixing both dialects
pub fn refresh(rows: &[(&str, &str, &str)]) -> Value {
    let row_changes: Vec<Value> = rows
        .iter()
        .enumerate()
        .map(|(index, (bookmark, no, name))| {
            let tag = if index % 2 == 0 { "DataRowInserted" } else { "drich" };
            json!({
                "t": tag,
                tag: [index, {
                    "bookmark": bookmark,
                    "cells": { "18_Customer.1": no, "18_Customer.2": { "StringValue": name } }
                }]
            })
        })
        .collect();
    changes(
        LIST_FORM,
        json!([{
            "t": "DataRefreshChange",
            "ControlReference": { "formId": LIST_FORM, "controlPath": REPEATER_PATH },
            "RowChanges": row_changes
        }]),
    )
}

/// Server-side evaluation of plain equality expressions; anything fancier
/// matches every row
pub fn rows_matching(expression: &str, column_id: &str) -> Vec<(&'static str, &'static str, &'static str)> {
    if expression.starts_with(['@', '<', '>', '=']) || expression.contains("..") {
        return CUSTOMERS.to_vec();
    }
    let wanted = expression.trim_matches('\'');
    CUSTOMERS
        .iter()
        .copied()
        .filter(|(_, no, name)| match column_id {
            "18_Customer.1" => *no == wanted,
            "18_Customer.2" => *name == wanted,
            _ => true,
        })
        .collect()
}
