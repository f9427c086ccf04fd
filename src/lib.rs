//! # Routine Fabric
//!
//! Durable routines that call each other across services and processes.
//!
//! A routine is an async method body. When it awaits a call to another
//! service, the runtime records the call in the routine's journal, persists the
//! journal, dispatches the call through the fabric and lets the body go. When
//! the callee's result arrives (inline, or later as a continuation) the body is
//! replayed from its journal up to the awaited call and resumes from there.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use routine_fabric::{Client, CommunicationModel, RoutineError, Runtime, ServiceDefinition, TaskResult, ValueContainer};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = CommunicationModel::builder()
//!     .service(ServiceDefinition::local("Greeter").method("Hello", |_ctx, params| async move {
//!         let name: String = params.get("name")?;
//!         Ok::<_, RoutineError>(json!(format!("Hello, {name}!")))
//!     }))
//!     .service(ServiceDefinition::local("Front").method("Greet", |ctx, _params| async move {
//!         let greeting = ctx
//!             .call("Greeter", "Hello", ValueContainer::new().with("name", "Rust"))
//!             .await?;
//!         Ok::<_, RoutineError>(greeting)
//!     }))
//!     .build()?;
//!
//! let runtime = Runtime::builder(model).build()?;
//! let client = Client::new(runtime);
//! let result = client
//!     .call("Front", "Greet", ValueContainer::new(), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(result, TaskResult::Value(json!("Hello, Rust!")));
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! Bodies are replayed, so the sequence of `ctx.call` / `ctx.save_state`
//! awaits must be the same on every replay. Diverging replays fail the
//! transition with [`EngineError::Nondeterminism`]. Use [`routine_info!`] and
//! friends for logs that should not repeat on replay.
//!
//! ## Modules
//!
//! - [`serialization`]: value containers and the converter chain
//! - [`model`]: declared services and their resolvers
//! - [`correlation`]: durable ids for triggers and cancellation sources
//! - [`providers`]: state and result storage backends
//! - [`runtime`]: transition runner, routine context and notifier
//! - [`fabric`]: connector selection and transports

pub mod client;
pub mod config;
pub mod correlation;
pub mod descriptors;
pub mod error;
pub mod fabric;
pub mod intents;
pub mod model;
pub mod providers;
pub mod runtime;
pub mod serialization;

#[macro_use]
mod logging;

#[cfg(feature = "provider-test")]
pub mod provider_validation;
#[cfg(feature = "provider-test")]
pub mod provider_validations;

pub use client::Client;
pub use config::{EffectiveSettings, FabricConfig, StateTransport};
pub use descriptors::{CallerDescriptor, ContinuationDescriptor, EventId, MethodId, PersistedMethodId, ServiceId};
pub use error::{EngineError, ResolutionError};
pub use fabric::{Fabric, FabricConnector, FabricConnectorFactory, FabricError};
pub use intents::{ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, FlowContext, Intent, TaskResult};
pub use model::{CommunicationModel, ServiceCategory, ServiceDefinition, Subscription};
pub use providers::{MethodExecutionState, MethodStateStorage, StorageError};
pub use runtime::{
    FnRoutine, RoutineContext, RoutineError, RoutineHandler, RoutineStatus, Runtime, RuntimeBuilder, RuntimeOptions,
};
pub use serialization::{ErrorValue, Format, SerializedState, ValueContainer, ValueSerializer};
