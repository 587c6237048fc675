use serde_json::Value;

use crate::field::{ErrorMessage, FieldMeta, FieldPath};
use crate::store::{FormError, FormResult, FormStore, read_lock};

/// Cheap handle bound to one registered field. UI fragments hold one of
/// these instead of the whole store.
#[derive(Clone)]
pub struct FieldHandle {
    store: FormStore,
    path: FieldPath,
}

impl std::fmt::Debug for FieldHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FieldHandle {
    pub(crate) fn new(store: FormStore, path: FieldPath) -> Self {
        Self { store, path }
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn value(&self) -> FormResult<Value> {
        self.store.value(&self.path)
    }

    pub fn set_value(&self, value: impl Into<Value>) -> FormResult<()> {
        self.store.set_value(&self.path, value)
    }

    pub async fn set_value_async(&self, value: impl Into<Value>) -> FormResult<()> {
        self.store.set_value_async(&self.path, value).await
    }

    /// Blur marker; idempotent.
    pub fn blur(&self) -> FormResult<()> {
        self.store.set_touched(&self.path)
    }

    pub async fn blur_async(&self) -> FormResult<()> {
        self.store.set_touched_async(&self.path).await
    }

    pub fn meta(&self) -> FormResult<FieldMeta> {
        self.store.meta(&self.path)
    }

    /// Errors a UI layer should render under the field: hidden until the
    /// field has been touched or a submit attempt has happened, so a form
    /// does not open covered in red.
    pub fn errors_for_display(&self) -> FormResult<Vec<ErrorMessage>> {
        let state = read_lock(&self.store.state, "reading display errors")?;
        let field = state
            .fields
            .get(&self.path)
            .ok_or_else(|| FormError::UnknownPath(self.path.clone()))?;
        if !field.meta.touched && state.submit_count == 0 {
            return Ok(Vec::new());
        }
        Ok(field.meta.errors.clone())
    }

    pub fn text(&self) -> FormResult<String> {
        Ok(self
            .value()?
            .as_str()
            .map(str::to_owned)
            .unwrap_or_default())
    }

    pub fn set_text(&self, text: impl Into<String>) -> FormResult<()> {
        self.set_value(text.into())
    }

    pub fn flag(&self) -> FormResult<bool> {
        Ok(self.value()?.as_bool().unwrap_or(false))
    }

    pub fn set_flag(&self, flag: bool) -> FormResult<()> {
        self.set_value(flag)
    }

    pub fn number(&self) -> FormResult<f64> {
        Ok(self.value()?.as_f64().unwrap_or(0.0))
    }

    pub fn set_number(&self, number: f64) -> FormResult<()> {
        self.set_value(number)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

impl SelectOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Closed set of field control variants over the common handle
/// capability. Each variant accepts only the input its widget can
/// produce; raw input that does not fit is dropped, not coerced.
#[derive(Clone)]
pub enum FieldControl {
    Text(FieldHandle),
    TextArea(FieldHandle),
    Select {
        handle: FieldHandle,
        options: Vec<SelectOption>,
    },
    Slider {
        handle: FieldHandle,
        min: f64,
        max: f64,
    },
    Toggle(FieldHandle),
}

impl FieldControl {
    pub fn handle(&self) -> &FieldHandle {
        match self {
            FieldControl::Text(handle) | FieldControl::TextArea(handle) => handle,
            FieldControl::Select { handle, .. } => handle,
            FieldControl::Slider { handle, .. } => handle,
            FieldControl::Toggle(handle) => handle,
        }
    }

    /// Routes raw UI input through the variant's typed rules: selects
    /// only accept one of their options, sliders parse and clamp,
    /// toggles parse booleans.
    pub fn input(&self, raw: &str) -> FormResult<()> {
        match self {
            FieldControl::Text(handle) | FieldControl::TextArea(handle) => handle.set_text(raw),
            FieldControl::Select { handle, options } => {
                if options.iter().any(|option| option.value == raw) {
                    handle.set_text(raw)
                } else {
                    Ok(())
                }
            }
            FieldControl::Slider { handle, min, max } => match raw.parse::<f64>() {
                Ok(number) if number.is_finite() => handle.set_number(number.clamp(*min, *max)),
                _ => Ok(()),
            },
            FieldControl::Toggle(handle) => match raw.parse::<bool>() {
                Ok(flag) => handle.set_flag(flag),
                Err(_) => Ok(()),
            },
        }
    }

    pub fn blur(&self) -> FormResult<()> {
        self.handle().blur()
    }

    pub fn display_value(&self) -> FormResult<String> {
        match self {
            FieldControl::Text(handle)
            | FieldControl::TextArea(handle)
            | FieldControl::Select { handle, .. } => handle.text(),
            FieldControl::Slider { handle, .. } => Ok(handle.number()?.to_string()),
            FieldControl::Toggle(handle) => Ok(handle.flag()?.to_string()),
        }
    }
}
