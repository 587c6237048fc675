use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use log::{debug, warn};
use serde_json::Value;

use crate::field::{ErrorMessage, Scope};
use crate::store::{FormError, FormResult, FormStore, StoreState, assemble_value, write_lock};

/// Fallback display text for a transport fault that carries no
/// structured payload. The UI always has something to render.
pub const FALLBACK_SUBMIT_MESSAGE: &str = "Something went wrong, please try again";

/// Submission state machine. `Succeeded` and `Failed` are the idle
/// terminal states; a new attempt restarts from either of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    AwaitingServer,
    Succeeded,
    Failed,
}

impl SubmitState {
    /// True while an attempt is in flight; this guards re-entrant submits.
    pub fn is_submitting(self) -> bool {
        matches!(self, SubmitState::Validating | SubmitState::AwaitingServer)
    }
}

pub(crate) fn transition_submit_state(state: &mut StoreState, next: SubmitState) -> FormResult<()> {
    let current = state.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::AwaitingServer)
            | (SubmitState::Validating, SubmitState::Succeeded)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::AwaitingServer, SubmitState::Succeeded)
            | (SubmitState::AwaitingServer, SubmitState::Failed)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    debug!("submit state {current:?} -> {next:?}");
    state.submit_state = next;
    Ok(())
}

/// Failure surfaced by a [`SubmitTransport`]: an optional status code and
/// an optional structured body. The core assumes nothing about the wire
/// protocol behind it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransportError {
    pub status_code: Option<u16>,
    pub body: Option<Value>,
}

impl TransportError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            body: None,
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Display text for this failure: the body's message when it has one,
    /// the generic fallback otherwise.
    pub fn message(&self) -> ErrorMessage {
        self.body
            .as_ref()
            .and_then(ErrorMessage::from_payload)
            .unwrap_or_else(|| ErrorMessage::new(FALLBACK_SUBMIT_MESSAGE))
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "transport failure (status {status})"),
            None => f.write_str("transport failure"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type BoxedTransportFuture = Pin<Box<dyn Future<Output = Result<Value, TransportError>> + Send>>;

/// Capability for sending the assembled snapshot somewhere. Timeouts and
/// retries are the transport's business, not the pipeline's.
pub trait SubmitTransport: Send + Sync {
    fn send(&self, value: Value) -> BoxedTransportFuture;
}

impl<F> SubmitTransport for F
where
    F: Fn(Value) -> BoxedTransportFuture + Send + Sync,
{
    fn send(&self, value: Value) -> BoxedTransportFuture {
        (self)(value)
    }
}

/// How one submit attempt ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    /// Both stages passed; carries the opaque success payload (`Null`
    /// when no async stage is configured).
    Success(Value),
    /// The synchronous submit validation produced errors; the async stage
    /// never ran.
    Invalid,
    /// The async stage failed; the error lives under [`Scope::OnSubmit`].
    Failed,
    /// Another attempt was already in flight; nothing happened.
    Rejected,
}

impl FormStore {
    /// Runs one submit attempt: synchronous validation first, then the
    /// async stage, each gated on the previous one. The attempt's result
    /// fully replaces the error map from any earlier attempt.
    ///
    /// Control only suspends while awaiting the async stage; every state
    /// change on either side of it is synchronous and serialized.
    pub async fn submit(&self) -> FormResult<SubmitOutcome> {
        {
            let mut state = write_lock(&self.state, "preparing submit")?;
            if state.submit_state.is_submitting() {
                warn!("submit rejected: a submission is already in flight");
                return Ok(SubmitOutcome::Rejected);
            }
            transition_submit_state(&mut state, SubmitState::Validating)?;
            state.submit_count = state.submit_count.saturating_add(1);
        }
        self.publish()?;

        let errors = self.run_submit_validation()?;
        if !errors.is_empty() {
            self.apply_error_map(errors)?;
            {
                let mut state = write_lock(&self.state, "recording failed validation")?;
                transition_submit_state(&mut state, SubmitState::Failed)?;
            }
            self.publish()?;
            return Ok(SubmitOutcome::Invalid);
        }

        // The new attempt owns the error map from here on; nothing from a
        // previous attempt survives into the async stage.
        self.apply_error_map(BTreeMap::new())?;

        let Some(on_submit_async) = self.validators.on_submit_async.clone() else {
            {
                let mut state = write_lock(&self.state, "completing submit")?;
                transition_submit_state(&mut state, SubmitState::Succeeded)?;
            }
            self.publish()?;
            return Ok(SubmitOutcome::Success(Value::Null));
        };

        let snapshot_value = {
            let mut state = write_lock(&self.state, "entering server stage")?;
            transition_submit_state(&mut state, SubmitState::AwaitingServer)?;
            assemble_value(&state)
        };
        self.publish()?;

        match on_submit_async(snapshot_value).await {
            Ok(payload) => {
                {
                    let mut state = write_lock(&self.state, "completing submit")?;
                    state.error_map.remove(&Scope::OnSubmit);
                    transition_submit_state(&mut state, SubmitState::Succeeded)?;
                }
                self.publish()?;
                Ok(SubmitOutcome::Success(payload))
            }
            Err(messages) => {
                let messages = if messages.is_empty() {
                    vec![ErrorMessage::new(FALLBACK_SUBMIT_MESSAGE)]
                } else {
                    messages
                };
                {
                    let mut state = write_lock(&self.state, "recording failed submit")?;
                    state.error_map.insert(Scope::OnSubmit, messages);
                    transition_submit_state(&mut state, SubmitState::Failed)?;
                }
                self.publish()?;
                Ok(SubmitOutcome::Failed)
            }
        }
    }
}
