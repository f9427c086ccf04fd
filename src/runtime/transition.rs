//! Transition runner: executes one routine attempt from its current state to
//! the next suspension or to its outcome.
//!
//! A transition polls the body with a no-op waker. Whatever the body emits is
//! committed first (state written, or carried in the single outgoing call when
//! the envelope transport applies) and dispatched second. Results that come
//! back synchronously are applied and the same body is polled again.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

use super::context::{call_intent, ApplyOutcome, Journal, JournalStep, RoutineContext};
use super::notifier::{completion_key, CompletionNotifier};
use super::{RoutineHandler, RoutineStatus, RuntimeOptions};
use crate::config::{EffectiveSettings, FabricConfig, PrimitiveKind, StateTransport};
use crate::correlation::{CancellationRegistry, CancellationSource};
use crate::descriptors::{CallerDescriptor, ContinuationDescriptor, MethodId, PersistedMethodId, ServiceId};
use crate::error::{EngineError, ResolutionError};
use crate::fabric::Fabric;
use crate::intents::{
    ActiveRoutineInfo, ContinueRoutineIntent, ExecuteRoutineIntent, FlowContext, Intent, TaskResult,
};
use crate::model::CommunicationModel;
use crate::providers::{MethodExecutionState, MethodStateStorage};
use crate::serialization::{SerializedState, ValueContainer, ValueSerializer};

const JOURNAL_FIELD: &str = "journal";
const CANCELLATION_FIELD: &str = "cancellation";

/// Durable id of an attempt's cancellation source.
pub fn cancellation_id(service: &ServiceId, method: &MethodId, intent_id: &str) -> String {
    format!("cts:{}", completion_key(service, method, intent_id))
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    fut.poll(&mut cx)
}

fn is_conflict(error: &EngineError) -> bool {
    matches!(error, EngineError::Storage(e) if e.is_conflict())
}

/// Why a transition runs. Only transitions other than the scheduling one push
/// their outcome to the continuation; a scheduling transition returns it inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionSource {
    Schedule,
    Continue,
    Cancel,
    Recover,
}

/// A locally hosted method with everything needed to run it.
#[derive(Clone)]
struct Located {
    service: ServiceId,
    method: MethodId,
    handler: Arc<dyn RoutineHandler>,
    settings: EffectiveSettings,
    storage: Arc<dyn MethodStateStorage>,
}

/// Per-attempt scope through which a transition persists state.
struct TransitionCarrier {
    located: Located,
    intent_id: String,
    etag: Option<String>,
    parameters: ValueContainer,
    flow_context: FlowContext,
    caller: Option<CallerDescriptor>,
    continuation: Option<ContinuationDescriptor>,
    caller_state: Option<SerializedState>,
    source: TransitionSource,
    /// Journal changed since the last write.
    dirty: bool,
}

impl TransitionCarrier {
    fn from_state(located: Located, state: MethodExecutionState, source: TransitionSource) -> Self {
        Self {
            located,
            intent_id: state.method.intent_id,
            etag: state.method.etag,
            parameters: state.parameters,
            flow_context: state.flow_context,
            caller: state.caller,
            continuation: state.continuation,
            caller_state: state.caller_state,
            source,
            dirty: true,
        }
    }

    fn persisted_method(&self) -> PersistedMethodId {
        self.located
            .method
            .persisted(self.intent_id.clone())
            .with_etag(self.etag.clone())
    }

    fn self_descriptor(&self) -> CallerDescriptor {
        CallerDescriptor {
            service: self.located.service.clone(),
            method: self.located.method.clone(),
            intent_id: self.intent_id.clone(),
        }
    }

    fn key(&self) -> String {
        completion_key(&self.located.service, &self.located.method, &self.intent_id)
    }

    fn pending(&self) -> ActiveRoutineInfo {
        ActiveRoutineInfo::pending(
            self.located.service.clone(),
            self.located.method.clone(),
            self.intent_id.clone(),
        )
    }
}

/// The call whose envelope currently holds a routine's state.
#[derive(Debug, Clone)]
struct CarriedCall {
    service: ServiceId,
    method: MethodId,
    intent_id: String,
}

/// A stored state without a journal only records a cancellation request for an
/// attempt whose real state is elsewhere (in flight, or not yet started).
fn is_cancellation_marker(state: &MethodExecutionState) -> bool {
    !state.method_state.contains(JOURNAL_FIELD)
}

/// Inputs of a transition that resumes from stored (or carried) state.
struct Resume {
    results: Vec<(String, TaskResult)>,
    carried_state: Option<SerializedState>,
    source: TransitionSource,
    /// Run even when no new result was applied.
    force: bool,
}

/// Executes transitions for every routine this runtime hosts.
pub struct TransitionRunner {
    model: CommunicationModel,
    fabric: Fabric,
    storages: HashMap<String, Arc<dyn MethodStateStorage>>,
    config: FabricConfig,
    serializer: Arc<ValueSerializer>,
    notifier: Arc<CompletionNotifier>,
    cancellations: CancellationRegistry,
    options: RuntimeOptions,
    /// Attempt key -> call carrying its state, for attempts suspended in envelope mode.
    carried: Mutex<HashMap<String, CarriedCall>>,
}

impl TransitionRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: CommunicationModel,
        fabric: Fabric,
        storages: HashMap<String, Arc<dyn MethodStateStorage>>,
        config: FabricConfig,
        serializer: Arc<ValueSerializer>,
        notifier: Arc<CompletionNotifier>,
        cancellations: CancellationRegistry,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            model,
            fabric,
            storages,
            config,
            serializer,
            notifier,
            cancellations,
            options,
            carried: Mutex::new(HashMap::new()),
        }
    }

    fn carried(&self) -> MutexGuard<'_, HashMap<String, CarriedCall>> {
        self.carried.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn model(&self) -> &CommunicationModel {
        &self.model
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn serializer(&self) -> &ValueSerializer {
        &self.serializer
    }

    pub fn notifier(&self) -> &Arc<CompletionNotifier> {
        &self.notifier
    }

    pub fn cancellation_registry(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Storage and settings used for `method` on `service`.
    pub fn storage_for(&self, service: &ServiceId, method: &MethodId) -> Result<Arc<dyn MethodStateStorage>, EngineError> {
        Ok(self.locate(service, method)?.storage)
    }

    fn locate(&self, service: &ServiceId, method: &MethodId) -> Result<Located, EngineError> {
        let service_ref = self.model.service_resolver().resolve(service)?;
        if !service_ref.is_local() {
            return Err(ResolutionError::NotHostedLocally(service_ref.id.name.clone()).into());
        }
        let method_ref = self.model.method_resolver().resolve(&service_ref, method)?;
        let handler = method_ref.handler()?.clone();
        let settings = self.config.resolve(
            &service_ref.id.name,
            service_ref.category,
            PrimitiveKind::Method,
            &method_ref.method.name,
        );
        let storage = self
            .storages
            .get(&settings.storage)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no storage named '{}'", settings.storage)))?;
        Ok(Located {
            service: service_ref.id,
            method: method.clone(),
            handler,
            settings,
            storage,
        })
    }

    /// Run a new attempt, or answer a duplicate delivery of one.
    pub async fn execute(&self, intent: ExecuteRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        let located = self.locate(&intent.service, &intent.method)?;
        let service = located.service.clone();
        let method = located.method.clone();

        if let Some(result) = located.storage.try_read_result(&service, &method, &intent.id).await? {
            debug!(target: "routine_fabric::runtime", service = %service, method = %method, intent_id = %intent.id, "execute of a finished attempt; serving its outcome");
            return Ok(ActiveRoutineInfo::completed(service, method, intent.id, result));
        }
        let cts_id = cancellation_id(&service, &method, &intent.id);
        let running = self.cancellations.try_get(&cts_id).is_some();
        let stored = if running {
            None
        } else {
            located.storage.read_state(&service, &method.persisted(intent.id.clone())).await?
        };
        let (source, etag) = match stored {
            Some(marker) if is_cancellation_marker(&marker) => {
                debug!(target: "routine_fabric::runtime", service = %service, method = %method, intent_id = %intent.id, "attempt was canceled before it started");
                (self.cancellation_of(&marker, &service, &method)?, marker.method.etag)
            }
            Some(_) => {
                debug!(target: "routine_fabric::runtime", service = %service, method = %method, intent_id = %intent.id, running, "duplicate execute of a pending attempt");
                return Ok(ActiveRoutineInfo::pending(service, method, intent.id));
            }
            None if running => {
                debug!(target: "routine_fabric::runtime", service = %service, method = %method, intent_id = %intent.id, running, "duplicate execute of a pending attempt");
                return Ok(ActiveRoutineInfo::pending(service, method, intent.id));
            }
            None => {
                let source = CancellationSource::new();
                self.cancellations.register_with_id(&source, &cts_id);
                (source, None)
            }
        };
        let this = CallerDescriptor {
            service: service.clone(),
            method: method.clone(),
            intent_id: intent.id.clone(),
        };
        let ctx = RoutineContext::new(this, intent.flow_context.clone(), Journal::default(), source);
        info!(
            target: "routine_fabric::runtime",
            service = %service,
            method = %method,
            intent_id = %intent.id,
            caller = ?intent.caller.as_ref().map(ToString::to_string),
            "routine started"
        );
        let intent_id = intent.id.clone();
        let carrier = TransitionCarrier {
            located,
            intent_id: intent.id,
            etag,
            parameters: intent.parameters,
            flow_context: intent.flow_context,
            caller: intent.caller,
            continuation: intent.continuation,
            caller_state: intent.caller_state,
            source: TransitionSource::Schedule,
            dirty: false,
        };

        let mut learned = Vec::new();
        match self.drive(carrier, ctx, &mut learned).await {
            Err(e) if is_conflict(&e) => {
                debug!(target: "routine_fabric::runtime", service = %service, method = %method, intent_id = %intent_id, "another delivery stored this attempt first; resuming from its state");
                let resume = Resume {
                    results: learned,
                    carried_state: None,
                    source: TransitionSource::Schedule,
                    force: true,
                };
                self.resume(&service, &method, &intent_id, resume).await
            }
            other => other,
        }
    }

    /// Resume a suspended attempt with the result it awaited.
    pub async fn continue_routine(&self, intent: ContinueRoutineIntent) -> Result<ActiveRoutineInfo, EngineError> {
        let service = intent.target.service.clone();
        let method = intent.target.method.method_id();
        let intent_id = intent.target.method.intent_id.clone();
        let task_id = intent.task_id().to_string();
        debug!(
            target: "routine_fabric::runtime",
            service = %service,
            method = %method,
            intent_id = %intent_id,
            task_id = %task_id,
            outcome = intent.result.kind(),
            "continuation received"
        );
        let resume = Resume {
            results: vec![(task_id, intent.result)],
            carried_state: intent.caller_state,
            source: TransitionSource::Continue,
            force: false,
        };
        self.resume(&service, &method, &intent_id, resume).await
    }

    async fn resume(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        mut resume: Resume,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let located = self.locate(service, method)?;
        let service = located.service.clone();
        let key = completion_key(&service, method, intent_id);
        let persisted = method.persisted(intent_id.to_string());
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(result) = located.storage.try_read_result(&service, method, intent_id).await? {
                debug!(target: "routine_fabric::runtime", key = %key, "attempt already finished");
                return Ok(ActiveRoutineInfo::completed(service, method.clone(), intent_id, result));
            }

            let stored = located.storage.read_state(&service, &persisted).await?;
            let mut marker = None;
            let state = match (&resume.carried_state, stored) {
                (Some(carried), stored) => {
                    let mut state: MethodExecutionState = self.serializer.deserialize(carried)?;
                    if let Some(stored) = stored {
                        if is_cancellation_marker(&stored) {
                            marker = Some(self.cancellation_of(&stored, &service, method)?);
                        }
                        state.method.etag = stored.method.etag;
                    }
                    state
                }
                (None, Some(state)) => state,
                (None, None) => {
                    return Err(EngineError::InvariantViolation(format!(
                        "{key} has neither an outcome nor a persisted state"
                    )))
                }
            };

            let mut journal = self.journal_of(&state)?;
            let mut applied = false;
            for (task_id, result) in &resume.results {
                match journal.apply_result(task_id, result.clone()) {
                    ApplyOutcome::Applied => applied = true,
                    ApplyOutcome::AlreadyResolved => {
                        debug!(target: "routine_fabric::runtime", key = %key, task_id = %task_id, "duplicate result ignored")
                    }
                    ApplyOutcome::UnknownTask => {
                        warn!(target: "routine_fabric::runtime", key = %key, task_id = %task_id, "result for a task this routine never scheduled")
                    }
                }
            }
            if !applied && !resume.force {
                return Ok(ActiveRoutineInfo::pending(service, method.clone(), intent_id));
            }

            let cancellation = self.cancellation_of(&state, &service, method)?;
            if marker.is_some_and(|m| m.is_cancellation_requested()) && cancellation.cancel() {
                debug!(target: "routine_fabric::runtime", key = %key, "cancellation recorded while the state was in flight");
            }
            self.carried().remove(&key);
            let this = CallerDescriptor {
                service: service.clone(),
                method: method.clone(),
                intent_id: intent_id.to_string(),
            };
            let ctx = RoutineContext::new(this, state.flow_context.clone(), journal, cancellation);
            let carrier = TransitionCarrier::from_state(located.clone(), state, resume.source);

            let mut learned = Vec::new();
            match self.drive(carrier, ctx, &mut learned).await {
                Err(e) if is_conflict(&e) => {
                    if attempts >= self.options.max_conflict_retries {
                        return Err(EngineError::ConcurrencyConflict { key, attempts });
                    }
                    debug!(target: "routine_fabric::runtime", key = %key, attempts, "state changed underneath the transition; re-reading");
                    resume.results.extend(learned);
                    resume.carried_state = None;
                }
                other => return other,
            }
        }
    }

    fn journal_of(&self, state: &MethodExecutionState) -> Result<Journal, EngineError> {
        if state.method_state.contains(JOURNAL_FIELD) {
            Ok(self.serializer.field(&state.method_state, JOURNAL_FIELD)?)
        } else {
            Ok(Journal::default())
        }
    }

    fn cancellation_of(
        &self,
        state: &MethodExecutionState,
        service: &ServiceId,
        method: &MethodId,
    ) -> Result<Arc<CancellationSource>, EngineError> {
        if state.method_state.contains(CANCELLATION_FIELD) {
            return Ok(self.serializer.field(&state.method_state, CANCELLATION_FIELD)?);
        }
        let source = CancellationSource::new();
        self.cancellations
            .register_with_id(&source, &cancellation_id(service, method, &state.method.intent_id));
        Ok(source)
    }

    /// Poll the body until it completes or suspends with nothing left to do.
    async fn drive(
        &self,
        mut carrier: TransitionCarrier,
        ctx: RoutineContext,
        learned: &mut Vec<(String, TaskResult)>,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let handler = carrier.located.handler.clone();
        let mut body = handler.invoke(ctx.clone(), carrier.parameters.clone());

        loop {
            let polled = poll_once(body.as_mut());
            if let Some(message) = ctx.take_nondeterminism() {
                return Err(EngineError::Nondeterminism {
                    key: carrier.key(),
                    message,
                });
            }
            let intents = ctx.take_intents();

            match polled {
                Poll::Ready(outcome) => {
                    return self.complete(&mut carrier, TaskResult::from_result(outcome), intents).await;
                }
                Poll::Pending if intents.is_empty() => {
                    if ctx.outstanding_calls() == 0 {
                        return Err(EngineError::InvariantViolation(format!(
                            "{} suspended without awaiting a routine call",
                            carrier.key()
                        )));
                    }
                    if carrier.dirty {
                        self.persist(&mut carrier, &ctx).await?;
                    }
                    debug!(target: "routine_fabric::runtime", key = %carrier.key(), "routine suspended");
                    return Ok(carrier.pending());
                }
                Poll::Pending => {
                    let progressed = self.commit_and_dispatch(&mut carrier, &ctx, intents, learned).await?;
                    if !progressed && !ctx.is_cancellation_requested() {
                        debug!(target: "routine_fabric::runtime", key = %carrier.key(), "routine suspended");
                        return Ok(carrier.pending());
                    }
                }
            }
        }
    }

    /// Commit emitted intents, then dispatch them. Returns whether the body can
    /// make progress when polled again.
    async fn commit_and_dispatch(
        &self,
        carrier: &mut TransitionCarrier,
        ctx: &RoutineContext,
        intents: Vec<Intent>,
        learned: &mut Vec<(String, TaskResult)>,
    ) -> Result<bool, EngineError> {
        let mut calls = Vec::new();
        let mut events = Vec::new();
        let mut saves = 0usize;
        for intent in intents {
            match intent {
                Intent::Execute(call) => calls.push(call),
                Intent::RaiseEvent(event) => events.push(event),
                Intent::SaveState(_) => saves += 1,
                Intent::Continue(_) => {}
            }
        }

        let carry_state = carrier.located.settings.state_transport == StateTransport::Envelope
            && saves == 0
            && calls.len() == 1
            && ctx.outstanding_calls() == 1;
        if carry_state {
            let snapshot = self.snapshot(carrier, ctx)?;
            let state = self.serializer.serialize(&snapshot, carrier.located.settings.serializer_format)?;
            if let Some(call) = calls.first_mut() {
                debug!(target: "routine_fabric::runtime", key = %carrier.key(), call = %call.id, bytes = state.data.len(), "state travels with the call");
                call.caller_state = Some(state);
                self.carried().insert(
                    carrier.key(),
                    CarriedCall {
                        service: call.service.clone(),
                        method: call.method.clone(),
                        intent_id: call.id.clone(),
                    },
                );
            }
        } else {
            self.persist(carrier, ctx).await?;
        }

        for event in events {
            self.fabric.raise_event(event).await?;
        }

        let mut progressed = saves > 0;
        for call in calls {
            let id = call.id.clone();
            let info = self.fabric.execute(call).await?;
            if let Some(result) = info.result {
                if ctx.apply_result(&id, result.clone()) {
                    learned.push((id, result));
                    carrier.dirty = true;
                    progressed = true;
                }
            }
        }
        Ok(progressed)
    }

    fn snapshot(&self, carrier: &TransitionCarrier, ctx: &RoutineContext) -> Result<MethodExecutionState, EngineError> {
        let format = carrier.located.settings.serializer_format;
        let mut method_state = ValueContainer::new();
        self.serializer.insert_field(&mut method_state, JOURNAL_FIELD, &ctx.journal(), format)?;
        self.serializer
            .insert_field(&mut method_state, CANCELLATION_FIELD, &ctx.cancellation(), format)?;
        Ok(MethodExecutionState {
            service: carrier.located.service.clone(),
            method: carrier.persisted_method(),
            flow_context: carrier.flow_context.clone(),
            parameters: carrier.parameters.clone(),
            method_state,
            continuation: carrier.continuation.clone(),
            caller_state: carrier.caller_state.clone(),
            caller: carrier.caller.clone(),
        })
    }

    async fn persist(&self, carrier: &mut TransitionCarrier, ctx: &RoutineContext) -> Result<(), EngineError> {
        let state = self.snapshot(carrier, ctx)?;
        let etag = carrier
            .located
            .storage
            .write_state(&carrier.located.service, &state.method, &state)
            .await?;
        debug!(
            target: "routine_fabric::runtime",
            key = %carrier.key(),
            storage = carrier.located.storage.name(),
            etag = %etag,
            "state committed"
        );
        carrier.etag = Some(etag);
        carrier.dirty = false;
        Ok(())
    }

    async fn complete(
        &self,
        carrier: &mut TransitionCarrier,
        result: TaskResult,
        leftovers: Vec<Intent>,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let service = carrier.located.service.clone();
        let method = carrier.located.method.clone();
        let storage = carrier.located.storage.clone();
        storage.write_result(&service, &method, &carrier.intent_id, &result).await?;
        let outcome = storage
            .try_read_result(&service, &method, &carrier.intent_id)
            .await?
            .unwrap_or(result);

        for intent in leftovers {
            match intent {
                Intent::RaiseEvent(event) => {
                    self.fabric.raise_event(event).await?;
                }
                Intent::Execute(call) => {
                    warn!(target: "routine_fabric::runtime", key = %carrier.key(), call = %call.id, "call was never awaited before the routine finished; dropped")
                }
                _ => {}
            }
        }

        self.cancellations
            .stop_tracking(&cancellation_id(&service, &method, &carrier.intent_id));
        self.carried().remove(&carrier.key());
        self.notifier
            .notify(&service, &method, &carrier.intent_id, outcome.clone());
        info!(
            target: "routine_fabric::runtime",
            service = %service,
            method = %method,
            intent_id = %carrier.intent_id,
            outcome = outcome.kind(),
            "routine finished"
        );

        if carrier.source != TransitionSource::Schedule {
            if let Some(target) = carrier.continuation.clone() {
                let continuation = ContinueRoutineIntent {
                    id: carrier.intent_id.clone(),
                    target,
                    source: Some(carrier.self_descriptor()),
                    result: outcome.clone(),
                    caller_state: carrier.caller_state.take(),
                };
                self.fabric.continue_routine(continuation).await?;
            }
        }
        Ok(ActiveRoutineInfo::completed(service, method, carrier.intent_id.clone(), outcome))
    }

    /// Request cancellation of an attempt. Returns `false` only when it had already finished.
    ///
    /// An attempt whose state is not in storage (carried in an envelope, or not
    /// started yet) gets a cancellation marker instead, which the next
    /// transition of that attempt picks up.
    pub async fn request_cancellation(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<bool, EngineError> {
        let located = self.locate(service, method)?;
        let service = located.service.clone();
        let key = completion_key(&service, method, intent_id);
        if located.storage.try_read_result(&service, method, intent_id).await?.is_some() {
            debug!(target: "routine_fabric::runtime", key = %key, "cancellation of a finished attempt ignored");
            return Ok(false);
        }

        let live = self.cancellations.try_get(&cancellation_id(&service, method, intent_id));
        if let Some(source) = &live {
            source.cancel();
        }

        let persisted = method.persisted(intent_id.to_string());
        let mut attempts = 0u32;
        let (outstanding, marked_only) = loop {
            attempts += 1;
            let (mut state, outstanding) = match located.storage.read_state(&service, &persisted).await? {
                Some(state) if !is_cancellation_marker(&state) => {
                    let outstanding: Vec<CarriedCall> = self
                        .journal_of(&state)?
                        .outstanding_calls()
                        .filter_map(|step| match step {
                            JournalStep::Call {
                                intent_id,
                                service,
                                method,
                                ..
                            } => Some(CarriedCall {
                                service: service.clone(),
                                method: method.clone(),
                                intent_id: intent_id.clone(),
                            }),
                            _ => None,
                        })
                        .collect();
                    (state, outstanding)
                }
                // The first transition is still running and observes the flag itself.
                None if live.is_some() => return Ok(true),
                stored => {
                    let marker = stored.unwrap_or_else(|| MethodExecutionState {
                        service: service.clone(),
                        method: persisted.clone(),
                        flow_context: FlowContext::default(),
                        parameters: ValueContainer::new(),
                        method_state: ValueContainer::new(),
                        continuation: None,
                        caller_state: None,
                        caller: None,
                    });
                    let carried = self.carried().get(&key).cloned();
                    (marker, carried.into_iter().collect())
                }
            };
            let marked_only = is_cancellation_marker(&state);
            let source = self.cancellation_of(&state, &service, method)?;
            source.cancel();
            self.serializer.insert_field(
                &mut state.method_state,
                CANCELLATION_FIELD,
                &source,
                located.settings.serializer_format,
            )?;
            match located.storage.write_state(&service, &state.method, &state).await {
                Ok(_) => break (outstanding, marked_only),
                Err(e) if e.is_conflict() && attempts < self.options.max_conflict_retries => continue,
                Err(e) if e.is_conflict() => return Err(EngineError::ConcurrencyConflict { key, attempts }),
                Err(e) => return Err(e.into()),
            }
        };
        info!(target: "routine_fabric::runtime", key = %key, outstanding = outstanding.len(), marked_only, "cancellation requested");

        for call in &outstanding {
            if let Err(e) = self
                .fabric
                .request_cancellation(&call.service, &call.method, &call.intent_id)
                .await
            {
                warn!(target: "routine_fabric::runtime", key = %key, callee = %call.service, error = %e, "could not propagate cancellation");
            }
        }

        // A live transition observes the flag itself; a marker has no body to run.
        if !marked_only
            && live.is_none()
            && located.storage.try_read_result(&service, method, intent_id).await?.is_none()
        {
            let resume = Resume {
                results: Vec::new(),
                carried_state: None,
                source: TransitionSource::Cancel,
                force: true,
            };
            self.resume(&service, method, intent_id, resume).await?;
        }
        Ok(true)
    }

    /// Re-dispatch the outstanding calls of a suspended attempt, e.g. after a
    /// crash between committing its state and dispatching its intents.
    pub async fn recover(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<ActiveRoutineInfo, EngineError> {
        let located = self.locate(service, method)?;
        let service = located.service.clone();
        if let Some(result) = located.storage.try_read_result(&service, method, intent_id).await? {
            return Ok(ActiveRoutineInfo::completed(service, method.clone(), intent_id, result));
        }
        let key = completion_key(&service, method, intent_id);
        let state = located
            .storage
            .read_state(&service, &method.persisted(intent_id.to_string()))
            .await?
            .ok_or_else(|| EngineError::InvariantViolation(format!("{key} has no persisted state to recover")))?;
        let journal = self.journal_of(&state)?;
        let this = CallerDescriptor {
            service: service.clone(),
            method: method.clone(),
            intent_id: intent_id.to_string(),
        };

        let mut results = Vec::new();
        let mut redispatched = 0usize;
        for step in journal.outstanding_calls() {
            if let JournalStep::Call {
                intent_id: call_id,
                service: callee,
                method: callee_method,
                parameters,
                ..
            } = step
            {
                let call = call_intent(
                    &this,
                    &state.flow_context,
                    call_id.clone(),
                    callee.clone(),
                    callee_method.clone(),
                    parameters.clone(),
                );
                redispatched += 1;
                if let Some(result) = self.fabric.execute(call).await?.result {
                    results.push((call_id.clone(), result));
                }
            }
        }
        info!(target: "routine_fabric::runtime", key = %key, redispatched, answered = results.len(), "recovery dispatched outstanding calls");

        if results.is_empty() {
            return Ok(ActiveRoutineInfo::pending(service, method.clone(), intent_id));
        }
        let resume = Resume {
            results,
            carried_state: None,
            source: TransitionSource::Recover,
            force: false,
        };
        self.resume(&service, method, intent_id, resume).await
    }

    pub async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo, EngineError> {
        let located = self.locate(&info.service, &info.method)?;
        let result = located
            .storage
            .try_read_result(&located.service, &info.method, &info.intent_id)
            .await?;
        let poll_after_ms = if result.is_none() { self.options.poll_after_ms } else { None };
        Ok(ActiveRoutineInfo {
            service: located.service,
            method: info.method.clone(),
            intent_id: info.intent_id.clone(),
            result,
            poll_after_ms,
        })
    }

    /// `None` when this runtime knows nothing about the attempt.
    pub async fn status(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<RoutineStatus>, EngineError> {
        let located = self.locate(service, method)?;
        let service = located.service.clone();
        if let Some(result) = located.storage.try_read_result(&service, method, intent_id).await? {
            return Ok(Some(RoutineStatus::from(&result)));
        }
        if self
            .cancellations
            .try_get(&cancellation_id(&service, method, intent_id))
            .is_some()
        {
            return Ok(Some(RoutineStatus::Running));
        }
        let state = located
            .storage
            .read_state(&service, &method.persisted(intent_id.to_string()))
            .await?;
        Ok(state.map(|_| RoutineStatus::Suspended))
    }
}
