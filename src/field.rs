use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Dotted path identifying a field's position in the nested value tree,
/// e.g. `address.zip`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldPath(Arc<str>);

impl FieldPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Walks a nested value tree along this path's segments.
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in self.segments() {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl Borrow<str> for FieldPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Key into the form-level error map: a field path, or the reserved
/// submit scope that collects cross-field and server-side errors.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Scope {
    Field(FieldPath),
    OnSubmit,
}

impl Scope {
    pub const ON_SUBMIT_TOKEN: &'static str = "onSubmit";

    pub fn field(path: impl Into<FieldPath>) -> Self {
        Self::Field(path.into())
    }

    pub fn as_field(&self) -> Option<&FieldPath> {
        match self {
            Self::Field(path) => Some(path),
            Self::OnSubmit => None,
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(path) => Display::fmt(path, f),
            Self::OnSubmit => f.write_str(Self::ON_SUBMIT_TOKEN),
        }
    }
}

/// Display text for one validation failure. Presence means "invalid";
/// there are no severity levels.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ErrorMessage(String);

impl ErrorMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Normalizes a server or validator payload to display text. Accepts a
    /// plain string or an object carrying a `message` key; anything else
    /// has no displayable form.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match payload {
            Value::String(text) => Some(Self(text.clone())),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(|text| Self(text.to_owned())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ErrorMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorMessage {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for ErrorMessage {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Per-field bookkeeping alongside the value.
///
/// `touched` is set on first blur and never reset within a session.
/// `errors` always reflects the latest validation pass for the path;
/// stale async results are discarded by ticket before they get here.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldMeta {
    pub touched: bool,
    pub dirty: bool,
    pub validating: bool,
    pub errors: Vec<ErrorMessage>,
}

/// Value plus metadata for one registered field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldState {
    pub value: Value,
    pub meta: FieldMeta,
}

impl FieldState {
    pub(crate) fn seeded(default: &Value) -> Self {
        Self {
            value: default.clone(),
            meta: FieldMeta::default(),
        }
    }
}

/// Monotonic per-path sequence number for async validation runs. A result
/// is applied only while its ticket is still the latest for the path.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

impl ValidationTicket {
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
