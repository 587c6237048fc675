use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::field::{ErrorMessage, FieldMeta, FieldPath, FieldState, Scope, ValidationTicket};
use crate::handle::FieldHandle;
use crate::submit::SubmitState;
use crate::subscribe::{Subscription, SubscriptionBus};
use crate::validate::Validators;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
    DuplicatePath(FieldPath),
    UnknownPath(FieldPath),
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    InvalidDefaults(String),
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
            FormError::DuplicatePath(path) => {
                write!(f, "field path `{path}` is already registered")
            }
            FormError::UnknownPath(path) => {
                write!(f, "field path `{path}` is not registered")
            }
            FormError::InvalidStateTransition { from, to } => {
                write!(f, "invalid submit state transition: {from:?} -> {to:?}")
            }
            FormError::InvalidDefaults(error) => {
                write!(f, "default values must serialize to an object tree: {error}")
            }
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

pub(crate) struct StoreState {
    pub(crate) fields: BTreeMap<FieldPath, FieldState>,
    pub(crate) order: Vec<FieldPath>,
    pub(crate) defaults: BTreeMap<FieldPath, Value>,
    pub(crate) submit_state: SubmitState,
    pub(crate) submit_count: u32,
    pub(crate) error_map: BTreeMap<Scope, Vec<ErrorMessage>>,
    pub(crate) tickets: BTreeMap<FieldPath, ValidationTicket>,
}

/// Owned copy of the store's state handed to selectors and subscribers.
///
/// `is_valid` and `is_submitting` are derived on assembly rather than
/// stored, so they cannot diverge from the error map and submit state.
#[derive(Clone, Debug, PartialEq)]
pub struct FormSnapshot {
    pub value: Value,
    pub submit_state: SubmitState,
    pub submit_count: u32,
    pub is_submitting: bool,
    pub is_dirty: bool,
    pub is_valid: bool,
    pub field_meta: BTreeMap<FieldPath, FieldMeta>,
    pub error_map: BTreeMap<Scope, Vec<ErrorMessage>>,
}

impl FormSnapshot {
    pub fn field_value(&self, path: &FieldPath) -> Option<&Value> {
        path.lookup(&self.value)
    }

    pub fn meta(&self, path: &FieldPath) -> Option<&FieldMeta> {
        self.field_meta.get(path)
    }

    pub fn errors_for(&self, scope: &Scope) -> &[ErrorMessage] {
        self.error_map.get(scope).map_or(&[], Vec::as_slice)
    }
}

/// One form session: the field tree, its error map, and the submit state
/// machine, behind a selector-based subscription surface.
///
/// Cheap to clone; clones share the same session. Construct one store per
/// form and drop it when the session ends.
#[derive(Clone)]
pub struct FormStore {
    pub(crate) state: Arc<RwLock<StoreState>>,
    pub(crate) bus: SubscriptionBus<FormSnapshot>,
    pub(crate) validators: Arc<Validators>,
    batch_depth: Arc<AtomicUsize>,
    pending_notify: Arc<AtomicBool>,
}

impl Default for FormStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FormStore {
    pub fn new() -> Self {
        Self::with_validators(Validators::new())
    }

    pub fn with_validators(validators: Validators) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                fields: BTreeMap::new(),
                order: Vec::new(),
                defaults: BTreeMap::new(),
                submit_state: SubmitState::Idle,
                submit_count: 0,
                error_map: BTreeMap::new(),
                tickets: BTreeMap::new(),
            })),
            bus: SubscriptionBus::new(),
            validators: Arc::new(validators),
            batch_depth: Arc::new(AtomicUsize::new(0)),
            pending_notify: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a field with its default value. Every field carries a
    /// default from the moment it exists; `dirty` is always computed
    /// against it. Registering the same path twice is a configuration
    /// defect and fails hard.
    pub fn register(
        &self,
        path: impl Into<FieldPath>,
        default: impl Into<Value>,
    ) -> FormResult<FieldHandle> {
        let path = path.into();
        let default = default.into();
        {
            let mut state = write_lock(&self.state, "registering field")?;
            if state.defaults.contains_key(&path) {
                return Err(FormError::DuplicatePath(path));
            }
            state.fields.insert(path.clone(), FieldState::seeded(&default));
            state.defaults.insert(path.clone(), default);
            state.order.push(path.clone());
        }
        debug!("registered field `{path}`");
        self.publish()?;
        Ok(FieldHandle::new(self.clone(), path))
    }

    /// Registers one field per leaf of a nested default-values tree.
    /// Objects recurse into dotted paths; scalars and arrays are leaves.
    pub fn register_defaults<T: Serialize>(&self, defaults: &T) -> FormResult<Vec<FieldHandle>> {
        let tree = serde_json::to_value(defaults)
            .map_err(|error| FormError::InvalidDefaults(error.to_string()))?;
        if !tree.is_object() {
            return Err(FormError::InvalidDefaults(
                "top-level default values must be an object".to_owned(),
            ));
        }

        let mut leaves = Vec::new();
        flatten_leaves(None, &tree, &mut leaves);

        let mut handles = Vec::with_capacity(leaves.len());
        self.batch(|store| {
            for (path, default) in leaves {
                handles.push(store.register(path, default)?);
            }
            Ok(())
        })?;
        Ok(handles)
    }

    /// Handle for an already registered path.
    pub fn handle(&self, path: impl Into<FieldPath>) -> FormResult<FieldHandle> {
        let path = path.into();
        let state = read_lock(&self.state, "resolving field handle")?;
        if !state.defaults.contains_key(&path) {
            return Err(FormError::UnknownPath(path));
        }
        drop(state);
        Ok(FieldHandle::new(self.clone(), path))
    }

    pub fn value(&self, path: &FieldPath) -> FormResult<Value> {
        let state = read_lock(&self.state, "reading field value")?;
        state
            .fields
            .get(path)
            .map(|field| field.value.clone())
            .ok_or_else(|| FormError::UnknownPath(path.clone()))
    }

    pub fn meta(&self, path: &FieldPath) -> FormResult<FieldMeta> {
        let state = read_lock(&self.state, "reading field meta")?;
        state
            .fields
            .get(path)
            .map(|field| field.meta.clone())
            .ok_or_else(|| FormError::UnknownPath(path.clone()))
    }

    /// Writes a field value, recomputes `dirty` against the registered
    /// default, runs the change-trigger validator for this path if one is
    /// configured, and fires one notification pass.
    pub fn set_value(&self, path: &FieldPath, value: impl Into<Value>) -> FormResult<()> {
        let value = value.into();
        let snapshot_value = {
            let mut state = write_lock(&self.state, "writing field value")?;
            let default = state
                .defaults
                .get(path)
                .cloned()
                .ok_or_else(|| FormError::UnknownPath(path.clone()))?;
            if let Some(field) = state.fields.get_mut(path) {
                field.value = value;
                field.meta.dirty = field.value != default;
            }
            assemble_value(&state)
        };

        if let Some(schema) = self.validators.on_change.clone() {
            self.apply_path_scoped_validation(&*schema, path, &snapshot_value)?;
        }
        self.publish()
    }

    /// Marks a field touched (idempotent blur marker) and runs the
    /// blur-trigger validator for this path if one is configured.
    pub fn set_touched(&self, path: &FieldPath) -> FormResult<()> {
        let snapshot_value = {
            let mut state = write_lock(&self.state, "touching field")?;
            let field = state
                .fields
                .get_mut(path)
                .ok_or_else(|| FormError::UnknownPath(path.clone()))?;
            field.meta.touched = true;
            assemble_value(&state)
        };

        if let Some(schema) = self.validators.on_blur.clone() {
            self.apply_path_scoped_validation(&*schema, path, &snapshot_value)?;
        }
        self.publish()
    }

    /// Replaces one path's errors. Reserved to the validation and
    /// submission stages; the UI layer only ever reads errors.
    pub(crate) fn set_errors(
        &self,
        path: &FieldPath,
        errors: Vec<ErrorMessage>,
    ) -> FormResult<()> {
        let mut state = write_lock(&self.state, "writing field errors")?;
        let field = state
            .fields
            .get_mut(path)
            .ok_or_else(|| FormError::UnknownPath(path.clone()))?;
        field.meta.validating = false;
        field.meta.errors = errors.clone();
        if errors.is_empty() {
            state.error_map.remove(&Scope::Field(path.clone()));
        } else {
            state.error_map.insert(Scope::Field(path.clone()), errors);
        }
        Ok(())
    }

    /// Atomically replaces the whole error map and mirrors field-scoped
    /// entries into the owning field's metadata. Replace, never merge.
    pub fn set_error_map(&self, map: BTreeMap<Scope, Vec<ErrorMessage>>) -> FormResult<()> {
        self.apply_error_map(map)?;
        self.publish()
    }

    pub(crate) fn apply_error_map(
        &self,
        map: BTreeMap<Scope, Vec<ErrorMessage>>,
    ) -> FormResult<()> {
        let mut state = write_lock(&self.state, "replacing error map")?;
        state.error_map = map;
        let StoreState {
            fields, error_map, ..
        } = &mut *state;
        for (path, field) in fields.iter_mut() {
            field.meta.errors = error_map
                .get(&Scope::Field(path.clone()))
                .cloned()
                .unwrap_or_default();
        }
        Ok(())
    }

    /// The nested value tree reconstructed from all registered fields, in
    /// registration order.
    pub fn snapshot_value(&self) -> FormResult<Value> {
        let state = read_lock(&self.state, "assembling value snapshot")?;
        Ok(assemble_value(&state))
    }

    pub fn snapshot(&self) -> FormResult<FormSnapshot> {
        let state = read_lock(&self.state, "creating form snapshot")?;
        Ok(build_snapshot(&state))
    }

    /// Subscribes a selector-gated observer to this store. The callback
    /// fires only when the selected projection changes.
    pub fn subscribe<V, F, C>(&self, selector: F, callback: C) -> FormResult<Subscription<FormSnapshot>>
    where
        V: Clone + PartialEq + Send + 'static,
        F: Fn(&FormSnapshot) -> V + Send + 'static,
        C: FnMut(&V) + Send + 'static,
    {
        let current = self.snapshot()?;
        Ok(self.bus.subscribe(&current, selector, callback))
    }

    /// Coalesces every mutation inside `f` into a single notification pass.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> FormResult<R>) -> FormResult<R> {
        self.batch_depth.fetch_add(1, Ordering::SeqCst);
        let result = f(self);
        self.batch_depth.fetch_sub(1, Ordering::SeqCst);
        if self.batch_depth.load(Ordering::SeqCst) == 0
            && self.pending_notify.swap(false, Ordering::SeqCst)
        {
            let snapshot = self.snapshot()?;
            self.bus.notify(&snapshot);
        }
        result
    }

    /// Restores every field to its default and clears all session
    /// bookkeeping except the registrations themselves.
    pub fn reset(&self) -> FormResult<()> {
        {
            let mut state = write_lock(&self.state, "resetting form")?;
            let StoreState {
                fields, defaults, ..
            } = &mut *state;
            for (path, field) in fields.iter_mut() {
                if let Some(default) = defaults.get(path) {
                    field.value = default.clone();
                }
                field.meta = FieldMeta::default();
            }
            state.submit_state = SubmitState::Idle;
            state.submit_count = 0;
            state.error_map.clear();
            state.tickets.clear();
        }
        debug!("form reset to defaults");
        self.publish()
    }

    pub(crate) fn publish(&self) -> FormResult<()> {
        if self.batch_depth.load(Ordering::SeqCst) > 0 {
            self.pending_notify.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let snapshot = self.snapshot()?;
        self.bus.notify(&snapshot);
        Ok(())
    }
}

pub(crate) fn build_snapshot(state: &StoreState) -> FormSnapshot {
    FormSnapshot {
        value: assemble_value(state),
        submit_state: state.submit_state,
        submit_count: state.submit_count,
        is_submitting: state.submit_state.is_submitting(),
        is_dirty: state.fields.values().any(|field| field.meta.dirty),
        is_valid: state.error_map.is_empty(),
        field_meta: state
            .fields
            .iter()
            .map(|(path, field)| (path.clone(), field.meta.clone()))
            .collect(),
        error_map: state.error_map.clone(),
    }
}

/// Rebuilds the nested value shape from dotted paths: `a.b` contributes
/// `{"a": {"b": <value>}}`. An intermediate segment that already holds a
/// scalar is replaced by an object; the later registration wins.
pub(crate) fn assemble_value(state: &StoreState) -> Value {
    let mut root = Map::new();
    for path in &state.order {
        if let Some(field) = state.fields.get(path) {
            insert_at_path(&mut root, path, field.value.clone());
        }
    }
    Value::Object(root)
}

fn insert_at_path(root: &mut Map<String, Value>, path: &FieldPath, value: Value) {
    let segments: Vec<&str> = path.segments().collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let entry = current
            .entry((*segment).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry.as_object_mut() {
            Some(map) => current = map,
            None => return,
        }
    }
    if let Some(last) = segments.last() {
        current.insert((*last).to_owned(), value);
    }
}

fn flatten_leaves(prefix: Option<String>, value: &Value, out: &mut Vec<(FieldPath, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = match &prefix {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key.clone(),
                };
                flatten_leaves(Some(path), child, out);
            }
        }
        leaf => {
            if let Some(path) = prefix {
                out.push((FieldPath::new(path), leaf.clone()));
            }
        }
    }
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
