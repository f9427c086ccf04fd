use routine_fabric::fabric::{LoopbackConnectorFactory, LoopbackNetwork};
use routine_fabric::runtime::observability::{init_logging, ObservabilityConfig};
use routine_fabric::{
    routine_info, Client, CommunicationModel, FabricConfig, RoutineError, Runtime, ServiceDefinition, ValueContainer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Warehouse side: owns inventory.
fn warehouse_model() -> Result<CommunicationModel, Box<dyn std::error::Error>> {
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::local("Inventory").method("Reserve", |ctx, params| async move {
            let sku: String = params.get("sku")?;
            let qty: u32 = params.get("qty")?;
            routine_info!(ctx, sku = %sku, qty, "reserving stock");
            Ok::<_, RoutineError>(json!({ "sku": sku, "reserved": qty }))
        }))
        .build()?;
    Ok(model)
}

/// Shop side: checkout calls the warehouse over the loopback transport.
fn shop_model() -> Result<CommunicationModel, Box<dyn std::error::Error>> {
    let model = CommunicationModel::builder()
        .service(ServiceDefinition::external("Inventory").remote_method("Reserve"))
        .service(ServiceDefinition::local("Payments").method("Charge", |_ctx, params| async move {
            let amount: u64 = params.get("amount")?;
            if amount > 1_000 {
                return Err(RoutineError::fault("amount exceeds the card limit"));
            }
            Ok::<_, RoutineError>(json!({ "charged": amount }))
        }))
        .service(ServiceDefinition::local("Checkout").method("Run", |ctx, params| async move {
            let sku: String = params.get("sku")?;
            let reservation = ctx
                .call("Inventory", "Reserve", ValueContainer::new().with("sku", &sku).with("qty", 2))
                .await?;
            routine_info!(ctx, reservation = %reservation, "stock reserved");
            let receipt = ctx
                .call("Payments", "Charge", ValueContainer::new().with("amount", 250))
                .await?;
            Ok::<_, RoutineError>(json!({ "reservation": reservation, "receipt": receipt }))
        }))
        .build()?;
    Ok(model)
}

const SHOP_CONFIG: &str = r#"{
    "global": { "state_transport": "envelope" },
    "services": {
        "Inventory": { "connector": { "type": "loopback", "settings": { "endpoint": "warehouse" } } }
    }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = init_logging(&ObservabilityConfig::default()) {
        eprintln!("fabric-demo: {e}");
    }

    let network = LoopbackNetwork::new();
    let warehouse = Runtime::builder(warehouse_model()?).build()?;
    network.bind("warehouse", warehouse.endpoint());

    let shop = Runtime::builder(shop_model()?)
        .config(FabricConfig::from_json_str(SHOP_CONFIG)?)
        .connector_factory(Arc::new(LoopbackConnectorFactory::new(network.clone())))
        .build()?;
    network.bind("shop", shop.endpoint());

    let client = Client::new(shop);
    let result = client
        .call(
            "Checkout",
            "Run",
            ValueContainer::new().with("sku", "A-1"),
            Duration::from_secs(5),
        )
        .await?;
    println!("checkout finished: {}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
