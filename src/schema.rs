use std::sync::Arc;

use serde_json::Value;

use crate::field::{ErrorMessage, FieldPath, Scope};
use crate::validate::Schema;

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type CrossRule = Arc<dyn Fn(&Value) -> Vec<ErrorMessage> + Send + Sync>;

#[derive(Clone)]
enum RuleKind {
    Required,
    MinLen(usize),
    MaxLen(usize),
    Email,
    Custom(Predicate),
}

#[derive(Clone)]
struct Rule {
    path: FieldPath,
    kind: RuleKind,
    message: ErrorMessage,
}

/// Per-path rule set implementing [`Schema`]. Rules evaluate in
/// registration order; each failing rule contributes one message scoped
/// to its path. Cross-field rules report under [`Scope::OnSubmit`].
#[derive(Clone, Default)]
pub struct RuleSchema {
    rules: Vec<Rule>,
    cross: Vec<CrossRule>,
}

impl RuleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-empty string, or any non-null value for non-string fields.
    pub fn required(self, path: impl Into<FieldPath>, message: impl Into<ErrorMessage>) -> Self {
        self.rule(path, RuleKind::Required, message)
    }

    pub fn min_len(
        self,
        path: impl Into<FieldPath>,
        min: usize,
        message: impl Into<ErrorMessage>,
    ) -> Self {
        self.rule(path, RuleKind::MinLen(min), message)
    }

    pub fn max_len(
        self,
        path: impl Into<FieldPath>,
        max: usize,
        message: impl Into<ErrorMessage>,
    ) -> Self {
        self.rule(path, RuleKind::MaxLen(max), message)
    }

    /// Exact length as a min/max pair sharing one message; at most one of
    /// the two can fail for a given value.
    pub fn exact_len(
        self,
        path: impl Into<FieldPath>,
        len: usize,
        message: impl Into<ErrorMessage>,
    ) -> Self {
        let path = path.into();
        let message = message.into();
        self.rule(path.clone(), RuleKind::MinLen(len), message.clone())
            .rule(path, RuleKind::MaxLen(len), message)
    }

    pub fn email(self, path: impl Into<FieldPath>, message: impl Into<ErrorMessage>) -> Self {
        self.rule(path, RuleKind::Email, message)
    }

    /// Custom predicate; `true` means valid. Missing values are presented
    /// to the predicate as `Null`.
    pub fn custom(
        self,
        path: impl Into<FieldPath>,
        message: impl Into<ErrorMessage>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rule(path, RuleKind::Custom(Arc::new(predicate)), message)
    }

    /// Cross-field rule over the whole snapshot; its findings land in the
    /// submit scope rather than under any single path.
    pub fn cross(
        mut self,
        rule: impl Fn(&Value) -> Vec<ErrorMessage> + Send + Sync + 'static,
    ) -> Self {
        self.cross.push(Arc::new(rule));
        self
    }

    fn rule(
        mut self,
        path: impl Into<FieldPath>,
        kind: RuleKind,
        message: impl Into<ErrorMessage>,
    ) -> Self {
        self.rules.push(Rule {
            path: path.into(),
            kind,
            message: message.into(),
        });
        self
    }
}

impl Schema for RuleSchema {
    fn validate(&self, snapshot: &Value) -> Vec<(Scope, ErrorMessage)> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if !rule.kind.holds(rule.path.lookup(snapshot)) {
                findings.push((Scope::Field(rule.path.clone()), rule.message.clone()));
            }
        }
        for cross in &self.cross {
            for message in cross(snapshot) {
                findings.push((Scope::OnSubmit, message));
            }
        }
        findings
    }
}

impl RuleKind {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            RuleKind::Required => match value {
                None | Some(Value::Null) => false,
                Some(Value::String(text)) => !text.is_empty(),
                Some(_) => true,
            },
            RuleKind::MinLen(min) => text_len(value) >= *min,
            RuleKind::MaxLen(max) => text_len(value) <= *max,
            RuleKind::Email => value.and_then(Value::as_str).is_some_and(is_email),
            RuleKind::Custom(predicate) => predicate(value.unwrap_or(&Value::Null)),
        }
    }
}

/// Length rules apply to strings; a missing or non-string value counts
/// as length zero.
fn text_len(value: Option<&Value>) -> usize {
    value
        .and_then(Value::as_str)
        .map_or(0, |text| text.chars().count())
}

fn is_email(text: &str) -> bool {
    if text.contains(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || domain.contains("..") {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}
