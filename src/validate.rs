use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;
use serde_json::Value;

use crate::field::{ErrorMessage, FieldPath, Scope, ValidationTicket};
use crate::store::{FormResult, FormStore, assemble_value, read_lock, write_lock};
use crate::submit::SubmitTransport;

/// Synchronous validation capability: a pure projection from the full
/// value snapshot to an ordered list of scoped error messages.
pub trait Schema: Send + Sync {
    fn validate(&self, snapshot: &Value) -> Vec<(Scope, ErrorMessage)>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Vec<(Scope, ErrorMessage)> + Send + Sync,
{
    fn validate(&self, snapshot: &Value) -> Vec<(Scope, ErrorMessage)> {
        (self)(snapshot)
    }
}

pub type BoxedSubmitFuture = Pin<Box<dyn Future<Output = Result<Value, Vec<ErrorMessage>>> + Send>>;
pub(crate) type SubmitValidatorFn = Arc<dyn Fn(Value) -> BoxedSubmitFuture + Send + Sync>;

pub type BoxedFieldFuture = Pin<Box<dyn Future<Output = Vec<ErrorMessage>> + Send>>;
type AsyncFieldFn = Arc<dyn Fn(Value) -> BoxedFieldFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) struct AsyncFieldValidatorEntry {
    pub(crate) debounce: Duration,
    pub(crate) run: AsyncFieldFn,
}

/// Per-trigger validator configuration. Every trigger is optional; an
/// absent trigger is a no-op and the form counts as valid for it.
#[derive(Clone, Default)]
pub struct Validators {
    pub(crate) on_change: Option<Arc<dyn Schema>>,
    pub(crate) on_blur: Option<Arc<dyn Schema>>,
    pub(crate) on_submit: Option<Arc<dyn Schema>>,
    pub(crate) on_submit_async: Option<SubmitValidatorFn>,
    pub(crate) on_change_async: BTreeMap<FieldPath, Vec<AsyncFieldValidatorEntry>>,
    pub(crate) on_blur_async: BTreeMap<FieldPath, Vec<AsyncFieldValidatorEntry>>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs on every value change, scoped to the path that changed.
    pub fn on_change(mut self, schema: impl Schema + 'static) -> Self {
        self.on_change = Some(Arc::new(schema));
        self
    }

    /// Runs on blur, scoped to the path that was touched.
    pub fn on_blur(mut self, schema: impl Schema + 'static) -> Self {
        self.on_blur = Some(Arc::new(schema));
        self
    }

    /// Runs at submit time against the full snapshot and produces the
    /// complete error map for the attempt.
    pub fn on_submit(mut self, schema: impl Schema + 'static) -> Self {
        self.on_submit = Some(Arc::new(schema));
        self
    }

    /// Async submit stage. Invoked only after the submit-trigger schema
    /// produced zero errors, never speculatively in parallel with it.
    /// A failure value lands in the error map under [`Scope::OnSubmit`].
    pub fn on_submit_async<F, Fut>(mut self, validator: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Vec<ErrorMessage>>> + Send + 'static,
    {
        self.on_submit_async = Some(Arc::new(move |value| {
            Box::pin(validator(value)) as BoxedSubmitFuture
        }));
        self
    }

    /// Wires the async submit stage to a transport. A structured failure
    /// body is normalized to its display message; a bare transport fault
    /// falls back to a generic one.
    pub fn submit_with<Tr>(self, transport: Tr) -> Self
    where
        Tr: SubmitTransport + 'static,
    {
        let transport = Arc::new(transport);
        self.on_submit_async(move |value| {
            let transport = transport.clone();
            async move {
                match transport.send(value).await {
                    Ok(payload) => Ok(payload),
                    Err(error) => Err(vec![error.message()]),
                }
            }
        })
    }

    /// Debounced async validator for one path, run after its value
    /// changes. Results apply last-ticket-wins.
    pub fn on_change_async<F, Fut>(
        self,
        path: impl Into<FieldPath>,
        debounce_ms: u64,
        validator: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ErrorMessage>> + Send + 'static,
    {
        self.push_async_field(AsyncTrigger::Change, path.into(), debounce_ms, validator)
    }

    /// Debounced async validator for one path, run after it is blurred.
    pub fn on_blur_async<F, Fut>(
        self,
        path: impl Into<FieldPath>,
        debounce_ms: u64,
        validator: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ErrorMessage>> + Send + 'static,
    {
        self.push_async_field(AsyncTrigger::Blur, path.into(), debounce_ms, validator)
    }

    fn push_async_field<F, Fut>(
        mut self,
        trigger: AsyncTrigger,
        path: FieldPath,
        debounce_ms: u64,
        validator: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ErrorMessage>> + Send + 'static,
    {
        let entry = AsyncFieldValidatorEntry {
            debounce: Duration::from_millis(debounce_ms),
            run: Arc::new(move |value| Box::pin(validator(value)) as BoxedFieldFuture),
        };
        let registry = match trigger {
            AsyncTrigger::Change => &mut self.on_change_async,
            AsyncTrigger::Blur => &mut self.on_blur_async,
        };
        registry.entry(path).or_default().push(entry);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AsyncTrigger {
    Change,
    Blur,
}

impl FormStore {
    /// Runs a trigger schema against the snapshot and keeps only the
    /// errors scoped to the field that actually changed.
    pub(crate) fn apply_path_scoped_validation(
        &self,
        schema: &dyn Schema,
        path: &FieldPath,
        snapshot_value: &Value,
    ) -> FormResult<()> {
        let errors = schema
            .validate(snapshot_value)
            .into_iter()
            .filter_map(|(scope, message)| (scope.as_field() == Some(path)).then_some(message))
            .collect();
        self.set_errors(path, errors)
    }

    /// The complete error map for one submit attempt. A panicking schema
    /// is caught and surfaced under the submit scope rather than silently
    /// swallowed or propagated.
    pub(crate) fn run_submit_validation(
        &self,
    ) -> FormResult<BTreeMap<Scope, Vec<ErrorMessage>>> {
        let Some(schema) = self.validators.on_submit.clone() else {
            return Ok(BTreeMap::new());
        };
        let snapshot_value = self.snapshot_value()?;

        let mut map: BTreeMap<Scope, Vec<ErrorMessage>> = BTreeMap::new();
        match catch_unwind(AssertUnwindSafe(|| schema.validate(&snapshot_value))) {
            Ok(findings) => {
                for (scope, message) in findings {
                    map.entry(scope).or_default().push(message);
                }
            }
            Err(panic) => {
                map.entry(Scope::OnSubmit)
                    .or_default()
                    .push(ErrorMessage::new(panic_text(panic.as_ref())));
            }
        }
        Ok(map)
    }

    /// Runs the submit-trigger schema outside the submission pipeline and
    /// replaces the error map with its result.
    pub fn validate(&self) -> FormResult<bool> {
        let map = self.run_submit_validation()?;
        let valid = map.is_empty();
        self.apply_error_map(map)?;
        self.publish()?;
        Ok(valid)
    }

    /// [`FormStore::set_value`] plus the async change-trigger validators
    /// registered for the path.
    pub async fn set_value_async(
        &self,
        path: &FieldPath,
        value: impl Into<Value>,
    ) -> FormResult<()> {
        self.set_value(path, value)?;
        self.run_async_field_validators(AsyncTrigger::Change, path)
            .await
    }

    /// [`FormStore::set_touched`] plus the async blur-trigger validators
    /// registered for the path.
    pub async fn set_touched_async(&self, path: &FieldPath) -> FormResult<()> {
        self.set_touched(path)?;
        self.run_async_field_validators(AsyncTrigger::Blur, path)
            .await
    }

    pub(crate) async fn run_async_field_validators(
        &self,
        trigger: AsyncTrigger,
        path: &FieldPath,
    ) -> FormResult<()> {
        let entries = {
            let registry = match trigger {
                AsyncTrigger::Change => &self.validators.on_change_async,
                AsyncTrigger::Blur => &self.validators.on_blur_async,
            };
            registry.get(path).cloned().unwrap_or_default()
        };

        for entry in entries {
            let (ticket, snapshot_value) = self.begin_async_validation(path)?;
            if !entry.debounce.is_zero() {
                Delay::new(entry.debounce).await;
                if !self.is_latest_ticket(path, ticket)? {
                    continue;
                }
            }
            let errors = (entry.run)(snapshot_value).await;
            self.finish_async_validation(path, ticket, errors)?;
        }
        Ok(())
    }

    fn begin_async_validation(
        &self,
        path: &FieldPath,
    ) -> FormResult<(ValidationTicket, Value)> {
        let (ticket, snapshot_value) = {
            let mut state = write_lock(&self.state, "starting async field validation")?;
            let ticket = state
                .tickets
                .get(path)
                .copied()
                .unwrap_or(ValidationTicket(0))
                .next();
            state.tickets.insert(path.clone(), ticket);
            if let Some(field) = state.fields.get_mut(path) {
                field.meta.validating = true;
            }
            (ticket, assemble_value(&state))
        };
        self.publish()?;
        Ok((ticket, snapshot_value))
    }

    fn is_latest_ticket(&self, path: &FieldPath, ticket: ValidationTicket) -> FormResult<bool> {
        let state = read_lock(&self.state, "checking latest validation ticket")?;
        Ok(state.tickets.get(path).copied() == Some(ticket))
    }

    /// Applies an async result only while its ticket is still the latest
    /// for the path; a superseded run is dropped on the floor.
    fn finish_async_validation(
        &self,
        path: &FieldPath,
        ticket: ValidationTicket,
        errors: Vec<ErrorMessage>,
    ) -> FormResult<()> {
        {
            let state = read_lock(&self.state, "finishing async field validation")?;
            if state.tickets.get(path).copied() != Some(ticket) {
                return Ok(());
            }
        }
        self.set_errors(path, errors)?;
        self.publish()
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "form validation panicked".to_owned()
    }
}
