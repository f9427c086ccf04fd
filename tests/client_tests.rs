mod common;

use common::{chain_model, finish, runtime_with, RecordingConnector};
use routine_fabric::intents::TaskResult;
use routine_fabric::providers::InMemoryStorage;
use routine_fabric::{Client, CommunicationModel, EngineError, RoutineError, Runtime, ServiceDefinition, ValueContainer};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize)]
struct Greeting {
    name: String,
    excited: bool,
}

fn greeter() -> Arc<Runtime> {
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("Greeter").method("Hello", |ctx, params| async move {
            let name: String = params.get("name")?;
            let excited: bool = params.get_opt("excited")?.unwrap_or(false);
            let tenant = ctx.flow_value("tenant").unwrap_or_else(|| "public".into());
            let mark = if excited { "!" } else { "." };
            Ok::<_, RoutineError>(json!(format!("[{tenant}] Hello, {name}{mark}")))
        }))
        .build()
        .unwrap();
    Runtime::builder(model).build().unwrap()
}

#[tokio::test]
async fn call_returns_inline_outcomes() {
    let client = Client::new(greeter());
    let result = client
        .call(
            "Greeter",
            "Hello",
            ValueContainer::new().with("name", "Ada"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(result, TaskResult::Value(json!("[public] Hello, Ada.")));
}

#[tokio::test]
async fn typed_parameters_and_flow_context_reach_the_routine() {
    let client = Client::new(greeter());
    let info = client
        .invoke_typed(
            "Greeter",
            "Hello",
            &Greeting {
                name: "Grace".into(),
                excited: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(info.result, Some(TaskResult::Value(json!("[public] Hello, Grace!"))));

    let flow = [("tenant".to_string(), "acme".to_string())].into_iter().collect();
    let info = client
        .invoke_with_id("Greeter", "Hello", "g-1", ValueContainer::new().with("name", "Linus"), flow)
        .await
        .unwrap();
    assert_eq!(info.result, Some(TaskResult::Value(json!("[acme] Hello, Linus."))));
}

#[tokio::test]
async fn reinvoking_a_finished_id_serves_the_stored_outcome() {
    let client = Client::new(greeter());
    let first = client
        .invoke_with_id("Greeter", "Hello", "same", ValueContainer::new().with("name", "A"), Default::default())
        .await
        .unwrap();
    let second = client
        .invoke_with_id("Greeter", "Hello", "same", ValueContainer::new().with("name", "B"), Default::default())
        .await
        .unwrap();
    assert_eq!(first.result, second.result);
}

#[tokio::test]
async fn missing_parameters_fault_the_routine() {
    let client = Client::new(greeter());
    let info = client.invoke("Greeter", "Hello", ValueContainer::new()).await.unwrap();
    match info.result {
        Some(TaskResult::Fault(error)) => assert!(error.message.contains("name"), "{error}"),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_targets_are_resolution_errors() {
    let client = Client::new(greeter());
    let err = client.invoke("Greeter", "Goodbye", ValueContainer::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Resolution(_)));
    assert!(!err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn waiting_on_a_suspended_routine_times_out() {
    let connector = RecordingConnector::new();
    let runtime = runtime_with(chain_model(true), Arc::new(InMemoryStorage::new()), &connector, json!({}));
    let client = Client::new(runtime);

    let info = client
        .invoke_with_id("B", "Bar", "slow", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    let err = client
        .wait_for_result(&info, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Timeout("B.Bar#slow".into()));
}

#[tokio::test]
async fn waiters_wake_when_the_routine_finishes() {
    let connector = RecordingConnector::new();
    let runtime = runtime_with(chain_model(true), Arc::new(InMemoryStorage::new()), &connector, json!({}));
    let client = Client::new(runtime.clone());

    let info = client
        .invoke_with_id("B", "Bar", "wake", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    let waiter = {
        let client = client.clone();
        let info = info.clone();
        tokio::spawn(async move { client.wait_for_result(&info, Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;

    let baz = connector.scheduled()[0].clone();
    runtime
        .continue_routine(finish(&baz, TaskResult::Value(json!(1))))
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), TaskResult::Value(json!(2)));
}
