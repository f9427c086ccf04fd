//! Property-based tests using proptest to verify delivery invariants

mod common;

use common::tracing_capture::capture_logs;
use common::{chain_model, finish, runtime_with, RecordingConnector};
use proptest::prelude::*;
use routine_fabric::descriptors::{derive_intent_id, is_descendant_of};
use routine_fabric::intents::{ExecuteRoutineIntent, TaskResult};
use routine_fabric::providers::InMemoryStorage;
use routine_fabric::ValueContainer;
use serde_json::json;
use std::sync::Arc;

fn arb_intent_id() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,12}(/[0-9]{1,3}){0,4}").unwrap()
}

/// One redelivery: either the callee's continuation or the caller's execute.
#[derive(Debug, Clone)]
enum Delivery {
    Continue(i64),
    Execute,
}

fn arb_deliveries() -> impl Strategy<Value = Vec<Delivery>> {
    prop::collection::vec(
        prop_oneof![
            3 => any::<i32>().prop_map(|v| Delivery::Continue(v as i64)),
            1 => Just(Delivery::Execute),
        ],
        1..8,
    )
}

fn current_thread() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Derived ids extend their parent and never loop back onto it.
    #[test]
    fn prop_derived_ids_are_descendants(parent in arb_intent_id(), seqs in prop::collection::vec(0u32..50, 1..5)) {
        let mut id = parent.clone();
        for seq in seqs {
            let child = derive_intent_id(&id, seq);
            prop_assert!(is_descendant_of(&child, &id));
            prop_assert!(is_descendant_of(&child, &parent));
            prop_assert!(!is_descendant_of(&parent, &child));
            id = child;
        }
    }

    /// However often continuations and executes are redelivered, only the
    /// first result counts and every routine finishes exactly once.
    #[test]
    fn prop_redeliveries_finish_each_routine_once(deliveries in arb_deliveries()) {
        let (logs, _guard) = capture_logs();
        let outcome = current_thread().block_on(async {
            let connector = RecordingConnector::new();
            let runtime = runtime_with(chain_model(true), Arc::new(InMemoryStorage::new()), &connector, json!({}));
            let root = ExecuteRoutineIntent::new("A", "Foo", "prop").with_parameters(ValueContainer::new());
            runtime.execute(root.clone()).await.unwrap();
            let baz = connector.scheduled()[0].clone();

            let mut first = None;
            for delivery in &deliveries {
                match delivery {
                    Delivery::Continue(v) => {
                        first.get_or_insert(*v);
                        runtime.continue_routine(finish(&baz, TaskResult::Value(json!(v)))).await.unwrap();
                    }
                    Delivery::Execute => {
                        runtime.execute(root.clone()).await.unwrap();
                    }
                }
            }
            let foo = runtime.execute(root).await.unwrap();
            (first, foo.result, connector.scheduled().len())
        });

        let (first, result, scheduled) = outcome;
        prop_assert_eq!(scheduled, 1, "Baz is scheduled once");
        match first {
            Some(v) => {
                prop_assert_eq!(result, Some(TaskResult::Value(json!({ "foo": v + 1 }))));
                prop_assert_eq!(logs.count("routine finished", "service", "A"), 1);
                prop_assert_eq!(logs.count("routine finished", "service", "B"), 1);
            }
            None => {
                prop_assert_eq!(result, None);
                prop_assert!(!logs.contains_message("routine finished"));
            }
        }
    }
}
