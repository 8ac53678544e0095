mod common;

use common::*;
use formlink::engine::error::NotFoundError;
use formlink::engine::wire::Interaction;
use formlink::{Engine, EngineConfig, EngineError, SessionRegistry};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn card_session() -> Arc<FakeSession> {
    FakeSession::new("S1", |interaction| match interaction {
        Interaction::OpenForm { .. } => Reply::sync(form_to_show(card_tree())),
        _ => Reply::empty(),
    })
}

fn persistent_engine(root: &TempDir, registry: Arc<SessionRegistry>) -> Engine {
    let config = EngineConfig {
        persist_root: Some(root.path().to_path_buf()),
        write_echo_timeout_ms: 50,
        ..EngineConfig::default()
    };
    Engine::new(config, registry).unwrap()
}

#[tokio::test]
async fn contexts_survive_an_engine_restart() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    registry.register(card_session());

    let id = {
        let engine = persistent_engine(&temp, registry.clone());
        let id = engine.open_page("S1", "30").await.unwrap().page_context_id.to_string();
        engine.write_field(&id, "Name", "Acme").await.unwrap();
        engine.shutdown();
        assert!(engine.store().is_empty());
        id
    };

    let engine = persistent_engine(&temp, registry);
    let records = engine.read_page(&id, None).await.unwrap();
    assert_eq!(records[0].get("Name"), Some(&json!("Acme")));
    // promoted back into memory
    assert_eq!(engine.store().len(), 1);
}

#[tokio::test]
async fn persisted_contexts_still_require_a_live_session() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    registry.register(card_session());

    let engine = persistent_engine(&temp, registry.clone());
    let id = engine.open_page("S1", "30").await.unwrap().page_context_id.to_string();
    engine.shutdown();
    registry.remove("S1");

    let err = engine.read_page(&id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(NotFoundError::SessionGone { .. })), "{err}");
}

#[tokio::test]
async fn forgetting_a_session_deletes_its_persisted_contexts() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    registry.register(card_session());

    let engine = persistent_engine(&temp, registry.clone());
    let id = engine.open_page("S1", "30").await.unwrap().page_context_id.to_string();
    engine.forget_session("S1");
    assert!(engine.store().is_empty());

    let err = engine.read_page(&id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(NotFoundError::ContextGone { .. })), "{err}");
}

#[test]
fn config_round_trips_through_the_root() {
    let temp = TempDir::new().unwrap();
    let mut config = EngineConfig {
        open_timeout_ms: 2_500,
        ..EngineConfig::default()
    };
    config.action_codes.insert("Release".to_string(), 80);
    config.save(temp.path()).unwrap();

    let loaded = EngineConfig::load(temp.path()).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.action_code("release"), Some(80));
    assert_eq!(loaded.action_code("EDIT"), Some(40));
}

#[test]
fn missing_config_keys_take_defaults() {
    let config: EngineConfig = serde_json::from_value(json!({ "open_timeout_ms": 42 })).unwrap();
    assert_eq!(config.open_timeout_ms, 42);
    assert_eq!(config.write_echo_timeout_ms, 1_000);
    assert_eq!(config.control_path_prefix, "server");
    assert_eq!(config.action_code("Refresh"), Some(60));
}
