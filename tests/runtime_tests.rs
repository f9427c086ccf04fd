//! Transition runner behaviour: replay checks, save points, storage routing,
//! envelope state transport, recovery and optimistic-concurrency retries.

mod common;

use common::tracing_capture::capture_logs;
use common::{chain_model, finish, runtime_with, ConflictInjectingStorage, RecordingConnector, RECORDING};
use routine_fabric::intents::{ActiveRoutineInfo, TaskResult};
use routine_fabric::providers::{InMemoryStorage, MethodStateStorage};
use routine_fabric::runtime::{Journal, JournalStep};
use routine_fabric::{
    Client, CommunicationModel, EngineError, FabricConfig, MethodId, RoutineError, RoutineStatus, Runtime,
    ServiceDefinition, ServiceId, ValueContainer,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// B.Bar awaits C.Baz then C.Qux and answers their sum.
fn two_step_model() -> CommunicationModel {
    CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Bar", |ctx, _params| async move {
            let baz = ctx.call("C", "Baz", ValueContainer::new()).await?;
            let qux = ctx.call("C", "Qux", ValueContainer::new()).await?;
            Ok::<_, RoutineError>(json!(baz.as_i64().unwrap_or_default() + qux.as_i64().unwrap_or_default()))
        }))
        .service(ServiceDefinition::external("C"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn changed_call_order_on_replay_is_nondeterminism() {
    let flipped = Arc::new(AtomicBool::new(false));
    let flag = flipped.clone();
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Bar", move |ctx, _params| {
            let method = if flag.load(Ordering::SeqCst) { "Qux" } else { "Baz" };
            async move {
                let v = ctx.call("C", method, ValueContainer::new()).await?;
                Ok::<_, RoutineError>(v)
            }
        }))
        .service(ServiceDefinition::external("C"))
        .build()
        .unwrap();
    let connector = RecordingConnector::new();
    let runtime = runtime_with(model, Arc::new(InMemoryStorage::new()), &connector, json!({}));
    let client = Client::new(runtime.clone());

    let info = client
        .invoke_with_id("B", "Bar", "nd", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert!(!info.is_complete());

    flipped.store(true, Ordering::SeqCst);
    let baz = &connector.scheduled()[0];
    let err = runtime
        .continue_routine(finish(baz, TaskResult::Value(json!(1))))
        .await
        .unwrap_err();
    match err {
        EngineError::Nondeterminism { key, message } => {
            assert!(key.contains("nd"));
            assert!(message.contains("call C.Baz") && message.contains("call C.Qux"), "{message}");
        }
        other => panic!("expected nondeterminism, got {other:?}"),
    }
    assert_eq!(connector.scheduled().len(), 1, "nothing new is dispatched");
}

#[tokio::test]
async fn suspending_without_an_awaited_call_is_an_invariant_violation() {
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Stall", |_ctx, _params| async move {
            futures::future::pending::<()>().await;
            Ok::<_, RoutineError>(json!(null))
        }))
        .build()
        .unwrap();
    let runtime = Runtime::builder(model).build().unwrap();
    let err = Client::new(runtime)
        .invoke("B", "Stall", ValueContainer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation(m) if m.contains("without awaiting")));
}

#[tokio::test]
async fn save_points_are_journaled_before_the_next_call() {
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Bar", |ctx, _params| async move {
            ctx.save_state().await?;
            let v = ctx.call("C", "Baz", ValueContainer::new()).await?;
            Ok::<_, RoutineError>(v)
        }))
        .service(ServiceDefinition::external("C"))
        .build()
        .unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let connector = RecordingConnector::new();
    let runtime = runtime_with(model, storage.clone(), &connector, json!({}));

    Client::new(runtime.clone())
        .invoke_with_id("B", "Bar", "sp", ValueContainer::new(), Default::default())
        .await
        .unwrap();

    let state = storage
        .read_state(&ServiceId::new("B"), &MethodId::new("Bar").persisted("sp"))
        .await
        .unwrap()
        .unwrap();
    let journal: Journal = runtime.serializer().field(&state.method_state, "journal").unwrap();
    assert_eq!(journal.len(), 2);
    assert!(matches!(&journal.steps[0], JournalStep::SaveState { intent_id } if intent_id == "sp/0"));
    assert!(matches!(&journal.steps[1], JournalStep::Call { intent_id, result: None, .. } if intent_id == "sp/1"));
    assert_eq!(connector.scheduled()[0].id, "sp/1");
}

#[tokio::test]
async fn services_are_routed_to_their_configured_storage() {
    let default = Arc::new(InMemoryStorage::new());
    let archive = Arc::new(InMemoryStorage::new());
    let connector = RecordingConnector::new();
    let config = json!({
        "services": {
            "B": { "storage": "archive" },
            "C": { "connector": { "type": RECORDING } }
        }
    });
    let runtime = Runtime::builder(chain_model(true))
        .default_storage(default.clone())
        .storage("archive", archive.clone())
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(connector.factory())
        .build()
        .unwrap();

    Client::new(runtime)
        .invoke_with_id("A", "Foo", "route", ValueContainer::new(), Default::default())
        .await
        .unwrap();

    assert_eq!(default.state_count().await, 1, "A.Foo waits in the default storage");
    assert_eq!(archive.state_count().await, 1, "B.Bar waits in the archive");
    assert!(archive
        .read_state(&ServiceId::new("B"), &MethodId::new("Bar").persisted("route/0"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn envelope_transport_carries_state_instead_of_storing_it() {
    let storage = Arc::new(InMemoryStorage::new());
    let connector = RecordingConnector::new();
    let runtime = runtime_with(
        chain_model(true),
        storage.clone(),
        &connector,
        json!({ "global": { "state_transport": "envelope" } }),
    );
    let client = Client::new(runtime.clone());

    let foo = client
        .invoke_with_id("A", "Foo", "env", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert!(!foo.is_complete());
    assert_eq!(storage.state_count().await, 0);
    assert_eq!(client.status(&foo).await.unwrap(), None, "nothing is stored for a carried routine");

    let baz = connector.scheduled()[0].clone();
    assert!(baz.caller_state.is_some());

    runtime
        .continue_routine(finish(&baz, TaskResult::Value(json!(41))))
        .await
        .unwrap();
    let outcome = client.wait_for_result(&foo, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, TaskResult::Value(json!({ "foo": 42 })));
    assert_eq!(storage.state_count().await, 0);
}

#[tokio::test]
async fn cancelling_a_routine_whose_state_is_in_flight() {
    let storage = Arc::new(InMemoryStorage::new());
    let connector = RecordingConnector::new();
    let runtime = runtime_with(
        chain_model(true),
        storage.clone(),
        &connector,
        json!({ "global": { "state_transport": "envelope" } }),
    );
    let client = Client::new(runtime.clone());

    let foo = client
        .invoke_with_id("A", "Foo", "env-c", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert_eq!(storage.state_count().await, 0);

    assert!(client.cancel(&foo).await.unwrap(), "a pending attempt accepts cancellation");
    assert_eq!(connector.cancellations(), vec!["env-c/0/0".to_string()]);
    assert_eq!(client.status(&foo).await.unwrap(), Some(RoutineStatus::Suspended));
    assert_eq!(storage.state_count().await, 2, "Foo and Bar each hold a cancellation marker");

    // The callee reports back with the state it carried; the marker turns the
    // resumed routines into canceled ones.
    let baz = connector.scheduled()[0].clone();
    runtime
        .continue_routine(finish(&baz, TaskResult::Canceled))
        .await
        .unwrap();
    assert_eq!(
        client.wait_for_result(&foo, Duration::from_secs(1)).await.unwrap(),
        TaskResult::Canceled
    );
    assert_eq!(client.status(&foo).await.unwrap(), Some(RoutineStatus::Canceled));
    assert!(!client.cancel(&foo).await.unwrap());
}

#[tokio::test]
async fn attempts_canceled_before_they_start_end_canceled() {
    let connector = RecordingConnector::new();
    let runtime = runtime_with(chain_model(true), Arc::new(InMemoryStorage::new()), &connector, json!({}));
    let client = Client::new(runtime);

    let early = client
        .invoke_with_id("A", "Foo", "early", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    // Cancel a sibling id that was never executed, then execute it.
    let never = ActiveRoutineInfo::pending(early.service.clone(), early.method.clone(), "later");
    assert!(client.cancel(&never).await.unwrap());

    let later = client
        .invoke_with_id("A", "Foo", "later", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert_eq!(later.result, Some(TaskResult::Canceled));
    assert_eq!(connector.scheduled().len(), 1, "only the first attempt reached Baz");
}

#[tokio::test]
async fn recover_redispatches_calls_lost_after_commit() {
    let (logs, _guard) = capture_logs();
    let storage = Arc::new(InMemoryStorage::new());
    let connector = RecordingConnector::new();
    let runtime = runtime_with(chain_model(true), storage.clone(), &connector, json!({}));
    let client = Client::new(runtime.clone());

    connector.fail_next(1);
    let err = client
        .invoke_with_id("B", "Bar", "rec", ValueContainer::new(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
    assert_eq!(
        runtime.status(&"B".into(), &"Bar".into(), "rec").await.unwrap(),
        Some(RoutineStatus::Suspended),
        "state was committed before the dispatch failed"
    );

    connector.answer_inline("Baz", TaskResult::Value(json!(9)));
    let info = runtime.recover(&"B".into(), &"Bar".into(), "rec").await.unwrap();
    assert_eq!(info.result, Some(TaskResult::Value(json!(10))));
    assert_eq!(connector.scheduled().len(), 1);
    assert!(logs.contains_message("recovery dispatched outstanding calls"));

    // Finished attempts recover to their outcome.
    let again = runtime.recover(&"B".into(), &"Bar".into(), "rec").await.unwrap();
    assert_eq!(again.result, Some(TaskResult::Value(json!(10))));
}

#[tokio::test]
async fn conflicting_writes_are_retried_from_fresh_state() {
    let inner = Arc::new(InMemoryStorage::new());
    let storage = Arc::new(ConflictInjectingStorage::new(inner.clone(), 2, 1));
    let connector = RecordingConnector::new();
    let config = json!({ "services": { "C": { "connector": { "type": RECORDING } } } });
    let runtime = Runtime::builder(two_step_model())
        .default_storage(storage.clone())
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(connector.factory())
        .build()
        .unwrap();

    Client::new(runtime.clone())
        .invoke_with_id("B", "Bar", "cf", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    let baz = connector.scheduled()[0].clone();
    runtime
        .continue_routine(finish(&baz, TaskResult::Value(json!(1))))
        .await
        .unwrap();

    assert_eq!(storage.writes(), 3, "the conflicting write was repeated once");
    let ids: Vec<String> = connector.scheduled().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["cf/0".to_string(), "cf/1".to_string()], "Qux is dispatched once");

    let qux = connector.scheduled()[1].clone();
    let done = runtime
        .continue_routine(finish(&qux, TaskResult::Value(json!(2))))
        .await
        .unwrap();
    assert_eq!(done.result, Some(TaskResult::Value(json!(3))));
}

#[tokio::test]
async fn conflict_retries_are_bounded() {
    let storage = Arc::new(ConflictInjectingStorage::new(Arc::new(InMemoryStorage::new()), 2, u32::MAX));
    let connector = RecordingConnector::new();
    let config = json!({ "services": { "C": { "connector": { "type": RECORDING } } } });
    let runtime = Runtime::builder(two_step_model())
        .default_storage(storage.clone())
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(connector.factory())
        .build()
        .unwrap();

    Client::new(runtime.clone())
        .invoke_with_id("B", "Bar", "cf2", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    let baz = connector.scheduled()[0].clone();
    let err = runtime
        .continue_routine(finish(&baz, TaskResult::Value(json!(1))))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyConflict { attempts: 5, .. }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(connector.scheduled().len(), 1);
}

#[tokio::test]
async fn replayed_steps_do_not_log_through_routine_macros() {
    let (logs, _guard) = capture_logs();
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Bar", |ctx, _params| async move {
            routine_fabric::routine_info!(ctx, "asking C");
            let v = ctx.call("C", "Baz", ValueContainer::new()).await?;
            routine_fabric::routine_info!(ctx, answer = %v, "C answered");
            Ok::<_, RoutineError>(v)
        }))
        .service(ServiceDefinition::external("C"))
        .build()
        .unwrap();
    let connector = RecordingConnector::new();
    let runtime = runtime_with(model, Arc::new(InMemoryStorage::new()), &connector, json!({}));

    Client::new(runtime.clone())
        .invoke_with_id("B", "Bar", "log", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    let baz = connector.scheduled()[0].clone();
    runtime
        .continue_routine(finish(&baz, TaskResult::Value(json!(5))))
        .await
        .unwrap();

    assert_eq!(logs.count("asking C", "intent_id", "log"), 1);
    assert_eq!(logs.count("C answered", "service", "B"), 1);
}
