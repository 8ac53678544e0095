mod common;

use common::*;
use formlink::engine::error::{NotFoundError, ProtocolError, RemoteMessageKind};
use formlink::engine::filter::{FilterCondition, FilterOperator};
use formlink::engine::wire::{FilterOperation, Interaction};
use formlink::EngineError;
use serde_json::json;
use std::sync::Arc;

/// Server that evaluates equality filters and pushes the filtered refresh
fn filter_server() -> Arc<FakeSession> {
    FakeSession::new("S1", |interaction| match interaction {
        Interaction::OpenForm { page_id } if page_id == "30" => {
            Reply::sync(form_to_show(card_tree()))
        }
        Interaction::OpenForm { .. } => {
            Reply::sync(batch(&[form_to_show(list_tree()), refresh(CUSTOMERS)]))
        }
        Interaction::RegisterFilter {
            operation: FilterOperation::RemoveLine,
            ..
        } => Reply::sync(refresh(CUSTOMERS)),
        Interaction::SaveFilterValue {
            column_id,
            expression,
            ..
        } => Reply::pushed(json!([]), refresh(&rows_matching(expression, column_id))),
        Interaction::LoadForm { .. } => Reply::sync(refresh(CUSTOMERS)),
        _ => Reply::empty(),
    })
}

fn registrations(session: &FakeSession) -> Vec<(String, FilterOperation)> {
    session
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Interaction::RegisterFilter {
                column_id,
                operation,
                ..
            } => Some((column_id, operation)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn filtered_read_registers_and_sets_the_filter() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();

    let records = engine
        .read_page(&id, Some(&json!({ "No.": "10000" })))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("Name"), Some(&json!("Adatum")));

    assert_eq!(
        registrations(&session),
        vec![("18_Customer.1".to_string(), FilterOperation::AddLine)]
    );
    assert_eq!(session.count("SaveFilterValue"), 1);

    let state = engine.filters().filter_state("S1", "21");
    assert_eq!(state.len(), 1);
    assert_eq!(state.get("No."), Some(&FilterCondition::equals("10000")));
}

#[tokio::test]
async fn reapplying_the_same_filter_skips_the_server() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();
    let filters = json!({ "No.": "10000" });

    let first = engine.read_page(&id, Some(&filters)).await.unwrap();
    session.reset_calls();

    let second = engine.read_page(&id, Some(&filters)).await.unwrap();
    assert_eq!(session.filter_calls(), 0);
    assert!(session.calls().is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn changing_filters_removes_the_old_line_first() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();

    engine
        .read_page(&id, Some(&json!({ "No.": "10000" })))
        .await
        .unwrap();
    session.reset_calls();

    let records = engine
        .read_page(&id, Some(&json!({ "Name": "Trey Research" })))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("No."), Some(&json!("20000")));

    assert_eq!(
        registrations(&session),
        vec![
            ("18_Customer.1".to_string(), FilterOperation::RemoveLine),
            ("18_Customer.2".to_string(), FilterOperation::AddLine),
        ]
    );
    let state = engine.filters().filter_state("S1", "21");
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["Name"]);
}

#[tokio::test]
async fn unfiltered_read_after_filtering_reports_stale_state() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let first = engine.open_page("S1", "21").await.unwrap().page_context_id;

    let filtered = engine
        .read_page(&first.to_string(), Some(&json!({ "No.": "10000" })))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let reopened = engine.open_page("S1", "21").await.unwrap();
    assert!(reopened.reused);
    let id = reopened.page_context_id.to_string();

    let err = engine.read_page(&id, None).await.unwrap_err();
    assert!(
        matches!(err, EngineError::Protocol(ProtocolError::StaleFilter { .. })),
        "{err}"
    );
    assert!(err.is_retryable());
    assert!(engine.filters().filter_state("S1", "21").is_empty());
    assert!(engine.store().get(&id).unwrap().needs_refresh);

    // the retry reloads the whole list
    let records = engine.read_page(&id, None).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(session.count("LoadForm"), 1);
}

#[tokio::test]
async fn operator_filters_are_sent_in_server_syntax() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();

    let records = engine
        .read_page(&id, Some(&json!({ "Name": { "operator": "startsWith", "value": "Sch" } })))
        .await
        .unwrap();

    let sent = session.calls().into_iter().find_map(|call| match call {
        Interaction::SaveFilterValue { expression, .. } => Some(expression),
        _ => None,
    });
    assert_eq!(sent.as_deref(), Some("@Sch*"));

    // the fake server does not understand the expression; local filtering still narrows
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("Name"), Some(&json!("School of Fine Art")));
    assert_eq!(
        engine.filters().filter_state("S1", "21").get("Name"),
        Some(&FilterCondition::new(FilterOperator::StartsWith, "Sch"))
    );
}

#[tokio::test]
async fn malformed_filters_fail_validation_without_io() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();
    session.reset_calls();

    for spec in [
        json!([1, 2]),
        json!({ "No.": { "operator": "~", "value": "1" } }),
        json!({ "No.": { "operator": "between", "value": "1" } }),
    ] {
        let err = engine.read_page(&id, Some(&spec)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }), "{spec}: {err}");
    }
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn filtering_needs_a_known_column() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());

    let list = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();
    let err = engine
        .read_page(&list, Some(&json!({ "Balance": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(NotFoundError::Field { .. })), "{err}");

    let card = engine.open_page("S1", "30").await.unwrap().page_context_id.to_string();
    let err = engine
        .read_page(&card, Some(&json!({ "Name": "Adatum" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }), "{err}");
    assert_eq!(session.filter_calls(), 0);
}

#[tokio::test]
async fn rejected_filter_value_is_not_cached() {
    let session = FakeSession::new("S1", |interaction| match interaction {
        Interaction::OpenForm { .. } => {
            Reply::sync(batch(&[form_to_show(list_tree()), refresh(CUSTOMERS)]))
        }
        Interaction::SaveFilterValue { .. } => Reply::sync(validation_message("Invalid filter")),
        _ => Reply::empty(),
    });
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();

    let err = engine
        .read_page(&id, Some(&json!({ "No.": "1*" })))
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some(RemoteMessageKind::Validation));
    assert!(engine.filters().filter_state("S1", "21").is_empty());

    // nothing was believed active, so an unfiltered read is not stale
    let records = engine.read_page(&id, None).await.unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn closing_the_last_context_clears_filter_state() {
    let session = filter_server();
    let (engine, _registry) = engine_with(session.clone());
    let id = engine.open_page("S1", "21").await.unwrap().page_context_id.to_string();
    engine
        .read_page(&id, Some(&json!({ "No.": "10000" })))
        .await
        .unwrap();
    assert!(!engine.filters().filter_state("S1", "21").is_empty());

    engine.close_page(&id).await.unwrap();
    assert!(engine.filters().filter_state("S1", "21").is_empty());
}
