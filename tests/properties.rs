use formlink::PageContextId;
use formlink::engine::changes::{
    CHANGE_TAGS, Change, ChangeTagTable, classify, extract_value, row_payload,
};
use formlink::engine::tree::{ControlKind, walk_controls};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::HashSet;

fn control_tree() -> impl Strategy<Value = Value> {
    let leaf = (
        prop::sample::select(vec!["sc", "dc", "bc", "ac", "zz"]),
        "[A-Za-z &.]{0,8}",
    )
        .prop_map(|(t, caption)| json!({ "t": t, "Caption": caption }));
    leaf.prop_recursive(4, 48, 5, |inner| {
        (
            prop::sample::select(vec!["gc", "fc", "rc", "lf"]),
            prop::collection::vec(inner, 0..5),
        )
            .prop_map(|(t, children)| json!({ "t": t, "Children": children }))
    })
}

// nodes the walk visits: everything except what sits under a repeater
fn visible_nodes(node: &Value) -> usize {
    let below = if node.get("t").and_then(Value::as_str) == Some("rc") {
        0
    } else {
        node.get("Children")
            .and_then(Value::as_array)
            .map(|children| children.iter().map(visible_nodes).sum())
            .unwrap_or(0)
    };
    1 + below
}

proptest! {
    #[test]
    fn walk_is_deterministic_and_addresses_are_unique(tree in control_tree()) {
        let first: Vec<String> = walk_controls(&tree).into_iter().map(|w| w.address).collect();
        let second: Vec<String> = walk_controls(&tree).into_iter().map(|w| w.address).collect();
        prop_assert_eq!(&first, &second);

        let unique: HashSet<&String> = first.iter().collect();
        prop_assert_eq!(unique.len(), first.len());
        prop_assert_eq!(first.len(), visible_nodes(&tree));
        prop_assert_eq!(first[0].as_str(), "server:");
        for address in &first[1..] {
            prop_assert!(address.starts_with("server:c["), "{}", address);
        }
    }

    #[test]
    fn repeater_children_are_never_walked(tree in control_tree()) {
        for walked in walk_controls(&tree) {
            if walked.kind == ControlKind::Repeater {
                let prefix = format!("{}/", walked.address);
                let nested = walk_controls(&tree)
                    .into_iter()
                    .filter(|other| other.address.starts_with(&prefix))
                    .count();
                prop_assert_eq!(nested, 0);
            }
        }
    }

    #[test]
    fn both_dialects_classify_and_carry_the_same_value(
        index in 0..CHANGE_TAGS.len(),
        text in "[ -~]{0,12}",
    ) {
        let spelling = &CHANGE_TAGS[index];
        let build = |tag: &str| -> Change {
            serde_json::from_value(json!({
                "t": tag,
                "ControlReference": { "formId": "F1", "controlPath": "server:c[0]" },
                "Changes": { "StringValue": text },
            }))
            .unwrap()
        };
        let modern = build(spelling.modern);
        let legacy = build(spelling.legacy);

        prop_assert_eq!(classify(&modern), Some(spelling.kind));
        prop_assert_eq!(classify(&legacy), Some(spelling.kind));
        prop_assert_eq!(extract_value(&modern), extract_value(&legacy));
    }

    #[test]
    fn both_dialects_carry_the_same_row(
        bookmark in "[A-Z0-9]{1,6}",
        position in 0u64..100,
        cell in "[a-zA-Z ]{0,10}",
    ) {
        let table = ChangeTagTable::builtin();
        let row = |tag: &str| -> Change {
            serde_json::from_value(json!({
                "t": tag,
                tag: [position, { "bookmark": bookmark, "cells": { "Name": cell } }],
            }))
            .unwrap()
        };
        let modern = row_payload(table, &row("DataRowInserted"));
        let legacy = row_payload(table, &row("drich"));
        prop_assert!(modern.is_some());
        prop_assert_eq!(modern, legacy);
    }

    #[test]
    fn ids_with_fewer_than_three_segments_are_rejected(
        segments in prop::collection::vec("[a-z0-9]{0,6}", 1..=2),
    ) {
        let text = segments.join(":");
        prop_assert!(PageContextId::parse(&text).is_err(), "{}", text);
    }

    #[test]
    fn ids_round_trip_with_colons_in_the_session(
        session in "[a-z]{1,3}[0-9](:[a-z]{1,3}[0-9]){0,2}",
        page in "[0-9]{1,5}",
        opened_at in 0i64..4_000_000_000_000,
    ) {
        let id = PageContextId::new(session.clone(), page.clone(), opened_at);
        let parsed = PageContextId::parse(&id.to_string()).unwrap();
        prop_assert_eq!(parsed.session_id(), session.as_str());
        prop_assert_eq!(parsed.page_id(), page.as_str());
        prop_assert_eq!(parsed.opened_at(), Some(opened_at));
        prop_assert_eq!(parsed, id);
    }
}
