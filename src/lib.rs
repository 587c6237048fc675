pub mod field;
pub mod handle;
pub mod schema;
pub mod store;
pub mod submit;
pub mod subscribe;
pub mod validate;

#[cfg(test)]
mod tests;

pub use field::{ErrorMessage, FieldMeta, FieldPath, FieldState, Scope, ValidationTicket};
pub use handle::{FieldControl, FieldHandle, SelectOption};
pub use schema::RuleSchema;
pub use store::{FormError, FormResult, FormSnapshot, FormStore};
pub use submit::{
    BoxedTransportFuture, FALLBACK_SUBMIT_MESSAGE, SubmitOutcome, SubmitState, SubmitTransport,
    TransportError,
};
pub use subscribe::{Subscription, SubscriptionBus};
pub use validate::{BoxedFieldFuture, BoxedSubmitFuture, Schema, Validators};
