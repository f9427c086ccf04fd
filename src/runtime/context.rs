//! Routine context: the only door a routine body has to the outside world.
//!
//! Each suspend point claims the next call-site sequence number on its first
//! poll. The journal records, per sequence, what was scheduled and (for calls)
//! the result once known. Re-running a body against its journal replays every
//! recorded step without emitting it again.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use super::RoutineError;
use crate::correlation::CancellationSource;
use crate::descriptors::{
    derive_intent_id, CallerDescriptor, ContinuationDescriptor, EventId, MethodId, PersistedMethodId, ServiceId,
};
use crate::intents::{ExecuteRoutineIntent, FlowContext, Intent, RaiseEventIntent, SaveStateIntent, TaskResult};
use crate::serialization::{ErrorValue, ValueContainer};

/// One recorded suspend point or effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalStep {
    Call {
        intent_id: String,
        service: ServiceId,
        method: MethodId,
        #[serde(default)]
        parameters: ValueContainer,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TaskResult>,
    },
    SaveState {
        intent_id: String,
    },
    Event {
        intent_id: String,
        service: ServiceId,
        event: EventId,
    },
}

impl JournalStep {
    pub fn intent_id(&self) -> &str {
        match self {
            JournalStep::Call { intent_id, .. }
            | JournalStep::SaveState { intent_id }
            | JournalStep::Event { intent_id, .. } => intent_id,
        }
    }

    /// Calls are resolved once their result is known; other steps always are.
    pub fn is_resolved(&self) -> bool {
        match self {
            JournalStep::Call { result, .. } => result.is_some(),
            _ => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            JournalStep::Call { service, method, .. } => format!("call {service}.{method}"),
            JournalStep::SaveState { .. } => "save_state".to_string(),
            JournalStep::Event { service, event, .. } => format!("event {service}.{event}"),
        }
    }
}

/// Outcome of applying an awaited result to a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The step already had a result; a duplicate delivery.
    AlreadyResolved,
    UnknownTask,
}

/// Ordered record of a routine's suspend points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default)]
    pub steps: Vec<JournalStep>,
}

impl Journal {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply_result(&mut self, task_id: &str, outcome: TaskResult) -> ApplyOutcome {
        for step in &mut self.steps {
            if let JournalStep::Call { intent_id, result, .. } = step {
                if intent_id == task_id {
                    if result.is_some() {
                        return ApplyOutcome::AlreadyResolved;
                    }
                    *result = Some(outcome);
                    return ApplyOutcome::Applied;
                }
            }
        }
        ApplyOutcome::UnknownTask
    }

    /// Calls scheduled but not yet answered.
    pub fn outstanding_calls(&self) -> impl Iterator<Item = &JournalStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s, JournalStep::Call { result: None, .. }))
    }

    /// Index of the first step that was still waiting when the journal was loaded.
    fn replay_horizon(&self) -> usize {
        self.steps.iter().position(|s| !s.is_resolved()).unwrap_or(self.steps.len())
    }
}

pub(crate) struct ContextInner {
    service: ServiceId,
    method: MethodId,
    intent_id: String,
    flow_context: FlowContext,
    journal: Journal,
    next_seq: usize,
    replay_horizon: usize,
    emitted: Vec<Intent>,
    cancellation: Arc<CancellationSource>,
    nondeterminism: Option<String>,
}

impl ContextInner {
    fn caller(&self) -> CallerDescriptor {
        CallerDescriptor {
            service: self.service.clone(),
            method: self.method.clone(),
            intent_id: self.intent_id.clone(),
        }
    }

    fn step_id(&self, seq: usize) -> String {
        derive_intent_id(&self.intent_id, seq as u32)
    }

    /// Check that the recorded step at `seq` is the same effect; flag otherwise.
    fn verify(&mut self, seq: usize, expected: &str) -> bool {
        let recorded = self.journal.steps[seq].describe();
        if recorded == expected {
            return true;
        }
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(format!("step {seq}: journal has {recorded}, routine now requests {expected}"));
        }
        false
    }
}

/// Handle passed to routine bodies. Cheap to clone.
#[derive(Clone)]
pub struct RoutineContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl RoutineContext {
    pub(crate) fn new(
        caller: CallerDescriptor,
        flow_context: FlowContext,
        journal: Journal,
        cancellation: Arc<CancellationSource>,
    ) -> Self {
        let replay_horizon = journal.replay_horizon();
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                service: caller.service,
                method: caller.method,
                intent_id: caller.intent_id,
                flow_context,
                journal,
                next_seq: 0,
                replay_horizon,
                emitted: Vec::new(),
                cancellation,
                nondeterminism: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn service(&self) -> ServiceId {
        self.lock().service.clone()
    }

    pub fn method(&self) -> MethodId {
        self.lock().method.clone()
    }

    pub fn intent_id(&self) -> String {
        self.lock().intent_id.clone()
    }

    /// This attempt as seen by the routines it calls.
    pub fn caller_descriptor(&self) -> CallerDescriptor {
        self.lock().caller()
    }

    pub fn flow_context(&self) -> FlowContext {
        self.lock().flow_context.clone()
    }

    pub fn flow_value(&self, key: &str) -> Option<String> {
        self.lock().flow_context.get(key).cloned()
    }

    /// True while the body re-executes steps recorded by an earlier transition.
    pub fn is_replaying(&self) -> bool {
        let g = self.lock();
        g.next_seq < g.replay_horizon
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.lock().cancellation.is_cancellation_requested()
    }

    /// Call `method` on `service` and suspend until its result arrives.
    pub fn call(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        parameters: ValueContainer,
    ) -> RoutineCall {
        RoutineCall {
            ctx: self.clone(),
            seq: None,
            service: service.into(),
            method: method.into(),
            parameters: Some(parameters),
        }
    }

    /// [`call`](Self::call), decoding the returned value.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        service: impl Into<ServiceId>,
        method: impl Into<MethodId>,
        parameters: ValueContainer,
    ) -> Result<T, RoutineError> {
        let value = self.call(service, method, parameters).await?;
        serde_json::from_value(value).map_err(|e| RoutineError::Fault(ErrorValue::new("decode", e.to_string())))
    }

    /// Persist the routine's state here, then keep running.
    pub fn save_state(&self) -> SavePoint {
        SavePoint {
            ctx: self.clone(),
            seq: None,
        }
    }

    /// Publish `event` from this service. Never suspends.
    pub fn raise_event(&self, event: impl Into<EventId>, parameters: ValueContainer) {
        let mut g = self.lock();
        let seq = g.next_seq;
        let service = g.service.clone();
        let event = event.into();
        let expected = format!("event {service}.{event}");
        if seq < g.journal.len() {
            g.verify(seq, &expected);
            g.next_seq += 1;
            return;
        }
        let id = g.step_id(seq);
        g.journal.steps.push(JournalStep::Event {
            intent_id: id.clone(),
            service: service.clone(),
            event: event.clone(),
        });
        g.next_seq += 1;
        let intent = RaiseEventIntent {
            id,
            service,
            event,
            parameters,
            source: Some(g.caller()),
            flow_context: g.flow_context.clone(),
        };
        g.emitted.push(Intent::RaiseEvent(intent));
    }

    pub(crate) fn take_intents(&self) -> Vec<Intent> {
        std::mem::take(&mut self.lock().emitted)
    }

    pub(crate) fn take_nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.take()
    }

    /// Feed a result learned during the current transition. Returns whether it was new.
    pub(crate) fn apply_result(&self, task_id: &str, result: TaskResult) -> bool {
        self.lock().journal.apply_result(task_id, result) == ApplyOutcome::Applied
    }

    pub(crate) fn outstanding_calls(&self) -> usize {
        self.lock().journal.outstanding_calls().count()
    }

    pub(crate) fn journal(&self) -> Journal {
        self.lock().journal.clone()
    }

    pub(crate) fn cancellation(&self) -> Arc<CancellationSource> {
        self.lock().cancellation.clone()
    }
}

/// Build the execute intent for a call made by `caller`.
pub(crate) fn call_intent(
    caller: &CallerDescriptor,
    flow_context: &FlowContext,
    id: String,
    service: ServiceId,
    method: MethodId,
    parameters: ValueContainer,
) -> ExecuteRoutineIntent {
    let continuation = ContinuationDescriptor {
        service: caller.service.clone(),
        method: caller.method.persisted(caller.intent_id.clone()),
        task_id: Some(id.clone()),
        continue_at_ms: None,
    };
    ExecuteRoutineIntent {
        id,
        service,
        method,
        caller: Some(caller.clone()),
        flow_context: flow_context.clone(),
        parameters,
        continuation: Some(continuation),
        caller_state: None,
    }
}

/// Future returned by [`RoutineContext::call`].
pub struct RoutineCall {
    ctx: RoutineContext,
    seq: Option<usize>,
    service: ServiceId,
    method: MethodId,
    parameters: Option<ValueContainer>,
}

impl Future for RoutineCall {
    type Output = Result<Value, RoutineError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut g = this.ctx.lock();

        let seq = match this.seq {
            Some(seq) => seq,
            None => {
                let seq = g.next_seq;
                let expected = format!("call {}.{}", this.service, this.method);
                if seq < g.journal.len() {
                    if !g.verify(seq, &expected) {
                        return Poll::Pending;
                    }
                } else {
                    if g.cancellation.is_cancellation_requested() {
                        return Poll::Ready(Err(RoutineError::Canceled));
                    }
                    let id = g.step_id(seq);
                    let parameters = this.parameters.take().unwrap_or_default();
                    g.journal.steps.push(JournalStep::Call {
                        intent_id: id.clone(),
                        service: this.service.clone(),
                        method: this.method.clone(),
                        parameters: parameters.clone(),
                        result: None,
                    });
                    let intent = call_intent(
                        &g.caller(),
                        &g.flow_context,
                        id,
                        this.service.clone(),
                        this.method.clone(),
                        parameters,
                    );
                    g.emitted.push(Intent::Execute(intent));
                }
                g.next_seq += 1;
                this.seq = Some(seq);
                seq
            }
        };

        match &g.journal.steps[seq] {
            JournalStep::Call { result: Some(result), .. } => Poll::Ready(result.clone().into_result()),
            _ if g.cancellation.is_cancellation_requested() => Poll::Ready(Err(RoutineError::Canceled)),
            _ => Poll::Pending,
        }
    }
}

/// Future returned by [`RoutineContext::save_state`].
pub struct SavePoint {
    ctx: RoutineContext,
    seq: Option<usize>,
}

impl Future for SavePoint {
    type Output = Result<(), RoutineError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut g = this.ctx.lock();
        if this.seq.is_some() {
            return Poll::Ready(Ok(()));
        }
        let seq = g.next_seq;
        if seq < g.journal.len() {
            if !g.verify(seq, "save_state") {
                return Poll::Pending;
            }
            g.next_seq += 1;
            this.seq = Some(seq);
            return Poll::Ready(Ok(()));
        }
        if g.cancellation.is_cancellation_requested() {
            return Poll::Ready(Err(RoutineError::Canceled));
        }
        let id = g.step_id(seq);
        g.journal.steps.push(JournalStep::SaveState { intent_id: id.clone() });
        let intent = SaveStateIntent {
            id,
            service: g.service.clone(),
            method: PersistedMethodId {
                name: g.method.name.clone(),
                intent_id: g.intent_id.clone(),
                etag: None,
            },
        };
        g.emitted.push(Intent::SaveState(intent));
        g.next_seq += 1;
        this.seq = Some(seq);
        // resumes once the runner has committed the state
        Poll::Pending
    }
}
