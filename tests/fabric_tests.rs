//! Fabric routing: event fan-out, discovery fallback and loopback transport
//! between two runtimes.

mod common;

use common::{finish, RecordingConnector, RECORDING};
use routine_fabric::config::ConnectorConfig;
use routine_fabric::fabric::{FabricError, LoopbackConnectorFactory, LoopbackNetwork, StaticDiscovery};
use routine_fabric::intents::TaskResult;
use routine_fabric::providers::InMemoryStorage;
use routine_fabric::{
    Client, CommunicationModel, EngineError, FabricConfig, ResolutionError, RoutineError, Runtime, ServiceDefinition,
    Subscription, ValueContainer,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Seen = Arc<Mutex<Vec<(String, String, Value)>>>;

/// Orders publishes `Placed`; Mail subscribes in the model, Audit at runtime.
fn order_model(seen: &Seen) -> CommunicationModel {
    let mail = seen.clone();
    let audit = seen.clone();
    CommunicationModel::builder()
        .service(
            ServiceDefinition::local("Orders")
                .event("Placed", ["order"])
                .method("Place", |ctx, params| async move {
                    let order: String = params.get("order")?;
                    ctx.raise_event("Placed", ValueContainer::new().with("order", &order));
                    Ok::<_, RoutineError>(json!({ "placed": order }))
                }),
        )
        .service(
            ServiceDefinition::local("Mail")
                .subscribe("Orders", "Placed", "Send")
                .method("Send", move |ctx, params| {
                    let seen = mail.clone();
                    async move {
                        let order = params.get_raw("order").cloned().unwrap_or_default();
                        seen.lock().unwrap().push(("Mail".into(), ctx.intent_id(), order));
                        Ok::<_, RoutineError>(Value::Null)
                    }
                }),
        )
        .service(ServiceDefinition::local("Audit").method("Record", move |ctx, params| {
            let seen = audit.clone();
            async move {
                let order = params.get_raw("order").cloned().unwrap_or_default();
                seen.lock().unwrap().push(("Audit".into(), ctx.intent_id(), order));
                Ok::<_, RoutineError>(Value::Null)
            }
        }))
        .build()
        .unwrap()
}

fn audit_subscription() -> Subscription {
    Subscription {
        publisher: "Orders".into(),
        event: "Placed".into(),
        subscriber: "Audit".into(),
        method: "Record".into(),
    }
}

#[tokio::test]
async fn raised_events_start_every_subscriber() {
    let seen = Seen::default();
    let runtime = Runtime::builder(order_model(&seen)).build().unwrap();
    runtime.subscribe(audit_subscription());
    runtime.subscribe(audit_subscription());
    let client = Client::new(runtime);

    let started = client
        .raise_event("Orders", "Placed", ValueContainer::new().with("order", "o-7"))
        .await
        .unwrap();
    assert_eq!(started, 2, "duplicate runtime subscriptions count once");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    for (subscriber, intent_id, order) in &seen {
        assert_eq!(order, &json!("o-7"));
        let method = if subscriber == "Mail" { "Send" } else { "Record" };
        assert!(intent_id.ends_with(&format!("/{subscriber}.{method}")), "{intent_id}");
    }
}

#[tokio::test]
async fn routines_raise_events_when_they_finish() {
    let seen = Seen::default();
    let runtime = Runtime::builder(order_model(&seen)).build().unwrap();
    let client = Client::new(runtime);

    let info = client
        .invoke_with_id("Orders", "Place", "p-1", ValueContainer::new().with("order", "o-1"), Default::default())
        .await
        .unwrap();
    assert_eq!(info.result, Some(TaskResult::Value(json!({ "placed": "o-1" }))));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![("Mail".to_string(), "p-1/0/Mail.Send".to_string(), json!("o-1"))]);
}

#[tokio::test]
async fn events_missing_declared_parameters_are_rejected() {
    let seen = Seen::default();
    let client = Client::new(Runtime::builder(order_model(&seen)).build().unwrap());

    let err = client
        .raise_event("Orders", "Placed", ValueContainer::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Resolution(ResolutionError::MissingEventParameter { ref parameter, .. }) if parameter == "order"
    ));
    let err = client
        .raise_event("Orders", "Shipped", ValueContainer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Resolution(ResolutionError::UnknownEvent { .. })));
    assert!(seen.lock().unwrap().is_empty());
}

fn caller_of_c() -> CommunicationModel {
    CommunicationModel::builder()
        .service(ServiceDefinition::local("B").method("Bar", |ctx, _params| async move {
            let v = ctx.call("C", "Baz", ValueContainer::new()).await?;
            Ok::<_, RoutineError>(v)
        }))
        .service(ServiceDefinition::external("C"))
        .service(ServiceDefinition::external("D"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn discovery_fills_in_services_missing_from_configuration() {
    let connector = RecordingConnector::new();
    let discovery = StaticDiscovery::new().with("C", ConnectorConfig::new(RECORDING, json!({})));
    let runtime = Runtime::builder(caller_of_c())
        .connector_factory(connector.factory())
        .discovery(Arc::new(discovery))
        .build()
        .unwrap();
    let client = Client::new(runtime.clone());

    client
        .invoke_with_id("B", "Bar", "disc", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert_eq!(connector.scheduled()[0].id, "disc/0");
    assert!(runtime.fabric().selector().directory().lookup("C").is_some());

    let err = client.invoke("D", "Anything", ValueContainer::new()).await.unwrap_err();
    assert_eq!(err, EngineError::Fabric(FabricError::ServiceNotRegistered("D".into())));
}

#[tokio::test]
async fn loopback_runtimes_exchange_calls_and_carried_state() {
    let network = LoopbackNetwork::new();
    let supplier = RecordingConnector::new();

    let warehouse_model = CommunicationModel::builder()
        .service(ServiceDefinition::local("Inventory").method("Reserve", |ctx, params| async move {
            let sku: String = params.get("sku")?;
            let shipped = ctx
                .call("Supplier", "Order", ValueContainer::new().with("sku", &sku))
                .await?;
            Ok::<_, RoutineError>(json!({ "sku": sku, "eta": shipped }))
        }))
        .service(ServiceDefinition::external("Supplier"))
        .service(ServiceDefinition::external("Checkout"))
        .build()
        .unwrap();
    let warehouse_config = json!({
        "services": {
            "Supplier": { "connector": { "type": RECORDING } },
            "Checkout": { "connector": { "type": "loopback", "settings": { "endpoint": "shop" } } }
        }
    });
    let warehouse = Runtime::builder(warehouse_model)
        .config(FabricConfig::from_json_str(&warehouse_config.to_string()).unwrap())
        .connector_factory(supplier.factory())
        .connector_factory(Arc::new(LoopbackConnectorFactory::new(network.clone())))
        .build()
        .unwrap();
    network.bind("warehouse", warehouse.endpoint());

    let shop_model = CommunicationModel::builder()
        .service(ServiceDefinition::local("Checkout").method("Run", |ctx, _params| async move {
            let reservation = ctx
                .call("Inventory", "Reserve", ValueContainer::new().with("sku", "A-1"))
                .await?;
            Ok::<_, RoutineError>(json!({ "reservation": reservation }))
        }))
        .service(ServiceDefinition::external("Inventory").remote_method("Reserve"))
        .build()
        .unwrap();
    let shop_config = json!({
        "global": { "state_transport": "envelope" },
        "services": {
            "Inventory": { "connector": { "type": "loopback", "settings": { "endpoint": "warehouse" } } }
        }
    });
    let shop_storage = Arc::new(InMemoryStorage::new());
    let shop = Runtime::builder(shop_model)
        .default_storage(shop_storage.clone())
        .config(FabricConfig::from_json_str(&shop_config.to_string()).unwrap())
        .connector_factory(Arc::new(LoopbackConnectorFactory::new(network.clone())))
        .build()
        .unwrap();
    network.bind("shop", shop.endpoint());

    let client = Client::new(shop.clone());
    let run = client
        .invoke_with_id("Checkout", "Run", "lb", ValueContainer::new(), Default::default())
        .await
        .unwrap();
    assert!(!run.is_complete());
    assert_eq!(shop_storage.state_count().await, 0, "checkout state travelled to the warehouse");

    let order = supplier.scheduled()[0].clone();
    assert_eq!(order.id, "lb/0/0");
    warehouse
        .continue_routine(finish(&order, TaskResult::Value(json!("tomorrow"))))
        .await
        .unwrap();

    let outcome = client.wait_for_result(&run, Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        outcome,
        TaskResult::Value(json!({ "reservation": { "sku": "A-1", "eta": "tomorrow" } }))
    );
}

#[tokio::test]
async fn unbound_loopback_endpoints_surface_as_transport_errors() {
    let network = LoopbackNetwork::new();
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::external("Inventory"))
        .build()
        .unwrap();
    let config = json!({
        "services": {
            "Inventory": { "connector": { "type": "loopback", "settings": { "endpoint": "gone" } } }
        }
    });
    let runtime = Runtime::builder(model)
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(Arc::new(LoopbackConnectorFactory::new(network)))
        .build()
        .unwrap();
    let err = Client::new(runtime)
        .invoke("Inventory", "Reserve", ValueContainer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
}

#[tokio::test]
async fn remote_resolution_failures_keep_their_class() {
    let network = LoopbackNetwork::new();
    let warehouse_model = CommunicationModel::builder()
        .service(ServiceDefinition::local("Inventory").method("Reserve", |_ctx, _params| async move {
            Ok::<_, RoutineError>(json!("reserved"))
        }))
        .build()
        .unwrap();
    let warehouse = Runtime::builder(warehouse_model).build().unwrap();
    network.bind("warehouse", warehouse.endpoint());

    let model = CommunicationModel::builder()
        .service(ServiceDefinition::external("Inventory"))
        .build()
        .unwrap();
    let config = json!({
        "services": {
            "Inventory": { "connector": { "type": "loopback", "settings": { "endpoint": "warehouse" } } }
        }
    });
    let shop = Runtime::builder(model)
        .config(FabricConfig::from_json_str(&config.to_string()).unwrap())
        .connector_factory(Arc::new(LoopbackConnectorFactory::new(network)))
        .build()
        .unwrap();
    let client = Client::new(shop);

    let reserved = client
        .call("Inventory", "Reserve", ValueContainer::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reserved, TaskResult::Value(json!("reserved")));

    let err = client
        .invoke("Inventory", "NoSuchMethod", ValueContainer::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Resolution(ResolutionError::UnknownMethod {
            service: "Inventory".into(),
            method: "NoSuchMethod".into(),
        })
    );
    assert!(!err.is_retryable());
}
