//! Per-unit retry loop around the remote model: credential rotation,
//! backoff after each full pass over the pool, and a fixed attempt budget.

use std::thread;
use std::time::Duration;

use sentiscope_contracts::credentials::CredentialPool;
use sentiscope_contracts::errors::PipelineError;
use sentiscope_contracts::events::{EventPayload, EventWriter};
use serde_json::Value;

use crate::providers::{error_chain_text, AnalysisProvider, AnalysisRequest};
use crate::units::WorkUnit;

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeState {
    Attempt,
    Rotate,
    Backoff,
    Success,
    Abandoned,
}

impl InvokeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::Rotate => "rotate",
            Self::Backoff => "backoff",
            Self::Success => "success",
            Self::Abandoned => "abandoned",
        }
    }
}

/// What happened while in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    CallOk,
    CallFailed,
    /// The pool moved to the next credential. `cycle_complete` is set when
    /// the attempt count reached a multiple of the pool size.
    Rotated { cycle_complete: bool },
    Waited { budget_spent: bool },
}

/// Transition table. Events that do not apply to a state leave it unchanged;
/// terminal states never change.
pub fn transition(state: InvokeState, event: StepEvent) -> InvokeState {
    use InvokeState::*;
    match (state, event) {
        (Attempt, StepEvent::CallOk) => Success,
        (Attempt, StepEvent::CallFailed) => Rotate,
        (Rotate, StepEvent::Rotated { cycle_complete: true }) => Backoff,
        (Rotate, StepEvent::Rotated { cycle_complete: false }) => Attempt,
        (Backoff, StepEvent::Waited { budget_spent: true }) => Abandoned,
        (Backoff, StepEvent::Waited { budget_spent: false }) => Attempt,
        (unchanged, _) => unchanged,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// Full passes over the pool before a unit is abandoned.
    pub cycles: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            cycles: 1,
        }
    }
}

impl RetryPolicy {
    pub fn budget(&self, pool_size: usize) -> usize {
        pool_size * self.cycles.max(1)
    }
}

/// Successful call result.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub text: String,
    /// Provider calls made, including the successful one.
    pub calls: usize,
    pub credential: String,
}

/// Owns the provider and the credential pool for a whole run. The pool
/// cursor carries over from one unit to the next.
pub struct ResilientInvoker<P: AnalysisProvider> {
    provider: P,
    pool: CredentialPool,
    policy: RetryPolicy,
    events: EventWriter,
    trace: Vec<InvokeState>,
}

impl<P: AnalysisProvider> ResilientInvoker<P> {
    pub fn new(
        mut provider: P,
        pool: CredentialPool,
        policy: RetryPolicy,
        events: EventWriter,
    ) -> Self {
        provider.configure(pool.current());
        Self {
            provider,
            pool,
            policy,
            events,
            trace: Vec::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// States visited by the most recent call, starting with `Attempt`.
    pub fn last_trace(&self) -> &[InvokeState] {
        &self.trace
    }

    pub fn call_with_resilience(
        &mut self,
        unit: &WorkUnit,
        request: &AnalysisRequest,
    ) -> Result<Invocation, PipelineError> {
        let pool_size = self.pool.len();
        let budget = self.policy.budget(pool_size);
        let mut attempts = 0usize;
        let mut calls = 0usize;
        let mut response = None;
        let mut state = InvokeState::Attempt;
        self.trace.clear();
        self.trace.push(state);

        while !state.is_terminal() {
            let event = match state {
                InvokeState::Attempt => {
                    calls += 1;
                    match self.provider.invoke(request) {
                        Ok(text) => {
                            response = Some(text);
                            StepEvent::CallOk
                        }
                        Err(err) => {
                            let detail = error_chain_text(&err, 400);
                            log::warn!(
                                "{} call {calls} with {} failed: {detail}",
                                unit.label(),
                                self.pool.current().label()
                            );
                            self.unit_event(
                                "attempt_failed",
                                unit,
                                [
                                    ("credential", Value::from(self.pool.current().label())),
                                    ("call", Value::from(calls)),
                                    ("error", Value::from(detail)),
                                ],
                            );
                            StepEvent::CallFailed
                        }
                    }
                }
                InvokeState::Rotate => {
                    let from = self.pool.current().label().to_string();
                    let next = self.pool.rotate().clone();
                    self.provider.configure(&next);
                    attempts += 1;
                    self.unit_event(
                        "credential_rotated",
                        unit,
                        [
                            ("from", Value::from(from)),
                            ("to", Value::from(next.label())),
                            ("attempts", Value::from(attempts)),
                        ],
                    );
                    StepEvent::Rotated {
                        cycle_complete: attempts % pool_size == 0,
                    }
                }
                InvokeState::Backoff => {
                    log::info!(
                        "all {pool_size} credentials failed for {}; waiting {}s",
                        unit.label(),
                        self.policy.backoff.as_secs()
                    );
                    self.unit_event(
                        "backoff_started",
                        unit,
                        [
                            ("seconds", Value::from(self.policy.backoff.as_secs_f64())),
                            ("attempts", Value::from(attempts)),
                        ],
                    );
                    if !self.policy.backoff.is_zero() {
                        thread::sleep(self.policy.backoff);
                    }
                    StepEvent::Waited {
                        budget_spent: attempts >= budget,
                    }
                }
                InvokeState::Success | InvokeState::Abandoned => break,
            };
            state = transition(state, event);
            self.trace.push(state);
        }

        match response {
            Some(text) if state == InvokeState::Success => Ok(Invocation {
                text,
                calls,
                credential: self.pool.current().label().to_string(),
            }),
            _ => {
                self.unit_event(
                    "unit_abandoned",
                    unit,
                    [("attempts", Value::from(attempts))],
                );
                Err(PipelineError::CredentialExhausted {
                    unit_id: unit.unit_id.clone(),
                    attempts,
                })
            }
        }
    }

    fn unit_event<const N: usize>(
        &self,
        event_type: &str,
        unit: &WorkUnit,
        fields: [(&str, Value); N],
    ) {
        let payload = fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<EventPayload>();
        self.events
            .unit_event(event_type, &unit.unit_id, &unit.file_name, payload);
    }
}
