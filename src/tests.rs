use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use futures_timer::Delay;
use serde_json::{Value, json};

use crate::store::write_lock;
use crate::submit::transition_submit_state;
use crate::{
    BoxedTransportFuture, ErrorMessage, FALLBACK_SUBMIT_MESSAGE, FieldControl, FieldPath,
    FormError, FormStore, RuleSchema, Scope, SelectOption, SubmitOutcome, SubmitState,
    SubmitTransport, SubscriptionBus, TransportError, Validators,
};

struct CountingTransport {
    calls: Arc<AtomicUsize>,
    delay_ms: u64,
    response: Result<Value, TransportError>,
}

impl SubmitTransport for CountingTransport {
    fn send(&self, _value: Value) -> BoxedTransportFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms;
        let response = self.response.clone();
        Box::pin(async move {
            if delay_ms > 0 {
                Delay::new(Duration::from_millis(delay_ms)).await;
            }
            response
        })
    }
}

fn counting_transport(
    calls: &Arc<AtomicUsize>,
    delay_ms: u64,
    response: Result<Value, TransportError>,
) -> CountingTransport {
    CountingTransport {
        calls: calls.clone(),
        delay_ms,
        response,
    }
}

#[test]
fn register_duplicate_path_is_rejected() {
    let store = FormStore::new();
    store.register("email", "").expect("first registration");
    let error = store
        .register("email", "")
        .expect_err("second registration must fail");
    assert_eq!(error, FormError::DuplicatePath(FieldPath::new("email")));
}

#[test]
fn mutating_unregistered_path_is_rejected() {
    let store = FormStore::new();
    let path = FieldPath::new("ghost");
    assert_eq!(
        store.set_value(&path, "x").expect_err("must fail"),
        FormError::UnknownPath(path.clone())
    );
    assert_eq!(
        store.set_touched(&path).expect_err("must fail"),
        FormError::UnknownPath(path)
    );
}

#[test]
fn set_value_tracks_dirty_against_default() {
    let store = FormStore::new();
    let field = store.register("name", "Jane").expect("register");

    field.set_value("Janet").expect("set changed value");
    assert!(field.meta().expect("meta").dirty);

    field.set_value("Jane").expect("set default back");
    assert!(!field.meta().expect("meta").dirty);
}

#[test]
fn touch_is_idempotent() {
    let store = FormStore::new();
    let field = store.register("name", "").expect("register");

    field.blur().expect("first blur");
    let once = field.meta().expect("meta");
    field.blur().expect("second blur");
    let twice = field.meta().expect("meta");

    assert!(once.touched);
    assert_eq!(once, twice);
}

#[test]
fn unrelated_field_change_does_not_notify_selector() {
    let store = FormStore::new();
    store.register("a", "").expect("register a");
    store.register("b", "").expect("register b");

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let path_a = FieldPath::new("a");
    let selector_path = path_a.clone();
    let _subscription = store
        .subscribe(
            move |snapshot| snapshot.field_value(&selector_path).cloned(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("subscribe");

    store
        .set_value(&FieldPath::new("b"), "changed")
        .expect("set b");
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    store.set_value(&path_a, "changed").expect("set a");
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn unsubscribe_is_idempotent() {
    let store = FormStore::new();
    let field = store.register("a", "").expect("register");

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let subscription = store
        .subscribe(
            |snapshot| snapshot.value.clone(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("subscribe");

    field.set_value("one").expect("set");
    subscription.unsubscribe();
    subscription.unsubscribe();
    field.set_value("two").expect("set after unsubscribe");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn bus_seeds_projection_at_subscribe_time() {
    let bus: SubscriptionBus<i32> = SubscriptionBus::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _subscription = bus.subscribe(
        &7,
        |state| *state,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    bus.notify(&7);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    bus.notify(&8);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn batch_coalesces_notification_passes() {
    let store = FormStore::new();
    store.register("a", "").expect("register a");
    store.register("b", "").expect("register b");
    store.register("c", "").expect("register c");

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _subscription = store
        .subscribe(
            |snapshot| snapshot.value.clone(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("subscribe");

    store
        .batch(|store| {
            store.set_value(&FieldPath::new("a"), "1")?;
            store.set_value(&FieldPath::new("b"), "2")?;
            store.set_value(&FieldPath::new("c"), "3")
        })
        .expect("batch");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn register_defaults_flattens_nested_objects() {
    let store = FormStore::new();
    let defaults = json!({
        "email": "jane@example.com",
        "address": { "city": "Springfield", "zip": "62704" }
    });
    let handles = store.register_defaults(&defaults).expect("register tree");

    let paths: Vec<&str> = handles.iter().map(|h| h.path().as_str()).collect();
    assert_eq!(paths, vec!["address.city", "address.zip", "email"]);
    assert_eq!(store.snapshot_value().expect("snapshot"), defaults);
}

#[test]
fn snapshot_value_nests_dotted_paths() {
    let store = FormStore::new();
    store.register("address.zip", "62704").expect("register");
    store.register("address.city", "Springfield").expect("register");
    store.register("email", "jane@example.com").expect("register");

    assert_eq!(
        store.snapshot_value().expect("snapshot"),
        json!({
            "address": { "zip": "62704", "city": "Springfield" },
            "email": "jane@example.com"
        })
    );
}

#[test]
fn change_validator_scopes_errors_to_changed_path() {
    let schema = RuleSchema::new()
        .min_len("a", 3, "a too short")
        .min_len("b", 3, "b too short");
    let store = FormStore::with_validators(Validators::new().on_change(schema));
    store.register("a", "").expect("register a");
    store.register("b", "").expect("register b");

    store.set_value(&FieldPath::new("a"), "x").expect("set a");

    let snapshot = store.snapshot().expect("snapshot");
    assert_eq!(
        snapshot.errors_for(&Scope::field("a")),
        &[ErrorMessage::new("a too short")]
    );
    // `b` is just as invalid, but nothing changed it
    assert!(snapshot.errors_for(&Scope::field("b")).is_empty());
}

#[test]
fn blur_validator_runs_on_touch() {
    let schema = RuleSchema::new().exact_len("zip", 5, "Zip must be 5 char");
    let store = FormStore::with_validators(Validators::new().on_blur(schema));
    let zip = store.register("zip", "").expect("register");

    zip.set_value("123").expect("set");
    assert!(zip.meta().expect("meta").errors.is_empty());

    zip.blur().expect("blur");
    let meta = zip.meta().expect("meta");
    assert!(meta.touched);
    assert_eq!(meta.errors, vec![ErrorMessage::new("Zip must be 5 char")]);
}

#[test]
fn field_errors_hidden_until_touched_or_submitted() {
    let schema = RuleSchema::new().min_len("name", 1, "required");
    let store = FormStore::with_validators(Validators::new().on_change(schema));
    let name = store.register("name", "x").expect("register");

    name.set_value("").expect("set invalid");
    assert!(name.errors_for_display().expect("display").is_empty());
    assert!(!name.meta().expect("meta").errors.is_empty());

    name.blur().expect("blur");
    assert_eq!(
        name.errors_for_display().expect("display"),
        vec![ErrorMessage::new("required")]
    );
}

#[test]
fn set_error_map_replaces_and_mirrors_into_meta() {
    let store = FormStore::new();
    let field = store.register("email", "").expect("register");

    let mut map = std::collections::BTreeMap::new();
    map.insert(Scope::field("email"), vec![ErrorMessage::new("bad email")]);
    map.insert(Scope::OnSubmit, vec![ErrorMessage::new("server said no")]);
    store.set_error_map(map).expect("set map");

    assert_eq!(
        field.meta().expect("meta").errors,
        vec![ErrorMessage::new("bad email")]
    );
    assert!(!store.snapshot().expect("snapshot").is_valid);

    store
        .set_error_map(std::collections::BTreeMap::new())
        .expect("clear map");
    assert!(field.meta().expect("meta").errors.is_empty());
    assert!(store.snapshot().expect("snapshot").is_valid);
}

#[test]
fn panicking_submit_schema_lands_in_submit_scope() {
    let store = FormStore::with_validators(Validators::new().on_submit(
        |_snapshot: &Value| -> Vec<(Scope, ErrorMessage)> { panic!("schema exploded") },
    ));
    store.register("email", "").expect("register");

    let valid = store.validate().expect("validate");
    assert!(!valid);
    let snapshot = store.snapshot().expect("snapshot");
    assert_eq!(
        snapshot.errors_for(&Scope::OnSubmit),
        &[ErrorMessage::new("schema exploded")]
    );
}

#[test]
fn submit_sync_failure_skips_async_stage() {
    let calls = Arc::new(AtomicUsize::new(0));
    let schema = RuleSchema::new().min_len("password", 4, "too short");
    let store = FormStore::with_validators(
        Validators::new()
            .on_submit(schema)
            .submit_with(counting_transport(&calls, 0, Ok(json!({"message": "ok"})))),
    );
    store.register("password", "abc").expect("register");

    let outcome = block_on(store.submit()).expect("submit");

    assert_eq!(outcome, SubmitOutcome::Invalid);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let snapshot = store.snapshot().expect("snapshot");
    assert_eq!(snapshot.submit_state, SubmitState::Failed);
    assert!(!snapshot.is_submitting);
    assert_eq!(
        snapshot.errors_for(&Scope::field("password")),
        &[ErrorMessage::new("too short")]
    );
}

#[test]
fn submit_replaces_previous_attempt_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let schema = RuleSchema::new().min_len("password", 4, "too short");
    let store = FormStore::with_validators(
        Validators::new()
            .on_submit(schema)
            .submit_with(counting_transport(&calls, 0, Ok(json!({"message": "ok"})))),
    );
    let password = store.register("password", "abc").expect("register");

    assert_eq!(
        block_on(store.submit()).expect("first submit"),
        SubmitOutcome::Invalid
    );
    assert!(!store.snapshot().expect("snapshot").is_valid);

    password.set_value("password").expect("fix password");
    let outcome = block_on(store.submit()).expect("second submit");

    assert_eq!(outcome, SubmitOutcome::Success(json!({"message": "ok"})));
    let snapshot = store.snapshot().expect("snapshot");
    assert!(snapshot.error_map.is_empty());
    assert_eq!(snapshot.submit_state, SubmitState::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn reentrant_submit_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = FormStore::with_validators(Validators::new().submit_with(counting_transport(
        &calls,
        80,
        Ok(json!({"message": "ok"})),
    )));
    store.register("email", "jane@example.com").expect("register");

    let slow_store = store.clone();
    let slow = thread::spawn(move || {
        block_on(slow_store.submit()).expect("slow submit")
    });
    thread::sleep(Duration::from_millis(15));

    let outcome = block_on(store.submit()).expect("re-entrant submit");
    assert_eq!(outcome, SubmitOutcome::Rejected);
    assert!(store.snapshot().expect("snapshot").is_submitting);

    let first = slow.join().expect("slow thread joins");
    assert_eq!(first, SubmitOutcome::Success(json!({"message": "ok"})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.snapshot().expect("snapshot").submit_state,
        SubmitState::Succeeded
    );
}

#[test]
fn submit_without_async_stage_succeeds_with_null_payload() {
    let store = FormStore::new();
    store.register("email", "jane@example.com").expect("register");

    let outcome = block_on(store.submit()).expect("submit");
    assert_eq!(outcome, SubmitOutcome::Success(Value::Null));
    assert_eq!(
        store.snapshot().expect("snapshot").submit_state,
        SubmitState::Succeeded
    );
}

#[test]
fn transport_fault_without_body_uses_fallback_message() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = FormStore::with_validators(Validators::new().submit_with(counting_transport(
        &calls,
        0,
        Err(TransportError::new()),
    )));
    store.register("email", "jane@example.com").expect("register");

    let outcome = block_on(store.submit()).expect("submit");
    assert_eq!(outcome, SubmitOutcome::Failed);
    let snapshot = store.snapshot().expect("snapshot");
    assert_eq!(
        snapshot.errors_for(&Scope::OnSubmit),
        &[ErrorMessage::new(FALLBACK_SUBMIT_MESSAGE)]
    );
    assert_eq!(snapshot.submit_state, SubmitState::Failed);
}

#[test]
fn async_change_validator_latest_ticket_wins() {
    let store = FormStore::with_validators(Validators::new().on_change_async(
        "email",
        30,
        |snapshot: Value| async move {
            let text = snapshot
                .get("email")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if text.contains("bad") {
                vec![ErrorMessage::new("email invalid")]
            } else {
                Vec::new()
            }
        },
    ));
    store.register("email", "").expect("register");
    let path = FieldPath::new("email");

    let first = {
        let store = store.clone();
        let path = path.clone();
        thread::spawn(move || {
            block_on(store.set_value_async(&path, "bad@example.com")).expect("first set");
        })
    };
    thread::sleep(Duration::from_millis(10));
    let second = {
        let store = store.clone();
        let path = path.clone();
        thread::spawn(move || {
            block_on(store.set_value_async(&path, "good@example.com")).expect("second set");
        })
    };

    first.join().expect("first thread joins");
    second.join().expect("second thread joins");

    let meta = store.meta(&path).expect("meta");
    assert!(meta.errors.is_empty());
    assert!(!meta.validating);
    assert_eq!(store.value(&path).expect("value"), json!("good@example.com"));
}

#[test]
fn blur_async_validator_applies_errors() {
    let store = FormStore::with_validators(Validators::new().on_blur_async(
        "email",
        0,
        |snapshot: Value| async move {
            let text = snapshot
                .get("email")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if text.is_empty() {
                vec![ErrorMessage::new("required")]
            } else {
                Vec::new()
            }
        },
    ));
    store.register("email", "").expect("register");
    let path = FieldPath::new("email");

    block_on(store.set_touched_async(&path)).expect("blur");

    let meta = store.meta(&path).expect("meta");
    assert!(meta.touched);
    assert_eq!(meta.errors, vec![ErrorMessage::new("required")]);
}

#[test]
fn illegal_submit_state_transition_is_reported() {
    let store = FormStore::new();
    let mut state = write_lock(&store.state, "test setup").expect("lock");
    let error =
        transition_submit_state(&mut state, SubmitState::AwaitingServer).expect_err("must fail");
    assert_eq!(
        error,
        FormError::InvalidStateTransition {
            from: SubmitState::Idle,
            to: SubmitState::AwaitingServer,
        }
    );
}

#[test]
fn error_message_normalizes_payload_shapes() {
    assert_eq!(
        ErrorMessage::from_payload(&json!("plain text")),
        Some(ErrorMessage::new("plain text"))
    );
    assert_eq!(
        ErrorMessage::from_payload(&json!({"message": "structured"})),
        Some(ErrorMessage::new("structured"))
    );
    assert_eq!(ErrorMessage::from_payload(&json!(42)), None);
}

#[test]
fn select_control_rejects_unknown_option() {
    let store = FormStore::new();
    let handle = store.register("state", "IL").expect("register");
    let control = FieldControl::Select {
        handle,
        options: vec![
            SelectOption::new("Illinois", "IL"),
            SelectOption::new("Missouri", "MO"),
        ],
    };

    control.input("MO").expect("valid option");
    assert_eq!(control.display_value().expect("display"), "MO");

    control.input("XX").expect("unknown option is dropped");
    assert_eq!(control.display_value().expect("display"), "MO");
}

#[test]
fn slider_control_parses_and_clamps() {
    let store = FormStore::new();
    let handle = store.register("age", 21.0).expect("register");
    let control = FieldControl::Slider {
        handle,
        min: 0.0,
        max: 100.0,
    };

    control.input("250").expect("clamped input");
    assert_eq!(control.handle().number().expect("number"), 100.0);

    control.input("not a number").expect("garbage is dropped");
    assert_eq!(control.handle().number().expect("number"), 100.0);
}

#[test]
fn toggle_control_parses_booleans() {
    let store = FormStore::new();
    let handle = store.register("subscribe", false).expect("register");
    let control = FieldControl::Toggle(handle);

    control.input("true").expect("parse true");
    assert!(control.handle().flag().expect("flag"));

    control.input("maybe").expect("garbage is dropped");
    assert!(control.handle().flag().expect("flag"));
}

#[test]
fn reset_restores_defaults_and_clears_session_state() {
    let schema = RuleSchema::new().min_len("name", 3, "too short");
    let store = FormStore::with_validators(Validators::new().on_change(schema));
    let name = store.register("name", "Jane").expect("register");

    name.set_value("x").expect("set invalid");
    name.blur().expect("blur");
    assert!(!store.snapshot().expect("snapshot").is_valid);

    store.reset().expect("reset");

    let snapshot = store.snapshot().expect("snapshot");
    assert!(snapshot.is_valid);
    assert!(!snapshot.is_dirty);
    assert_eq!(snapshot.submit_state, SubmitState::Idle);
    assert_eq!(snapshot.field_value(&FieldPath::new("name")), Some(&json!("Jane")));
    let meta = name.meta().expect("meta");
    assert!(!meta.touched);
    assert!(meta.errors.is_empty());
}

#[test]
fn validating_flag_is_visible_while_async_validator_waits() {
    let saw_validating = Arc::new(Mutex::new(Vec::new()));
    let observed = saw_validating.clone();
    let store = FormStore::with_validators(Validators::new().on_change_async(
        "email",
        0,
        |_snapshot: Value| async move {
            Delay::new(Duration::from_millis(30)).await;
            Vec::new()
        },
    ));
    store.register("email", "").expect("register");
    let path = FieldPath::new("email");
    let meta_path = path.clone();
    let _subscription = store
        .subscribe(
            move |snapshot| snapshot.meta(&meta_path).map(|meta| meta.validating),
            move |validating| {
                if let Ok(mut seen) = observed.lock() {
                    seen.push(*validating);
                }
            },
        )
        .expect("subscribe");

    block_on(store.set_value_async(&path, "jane@example.com")).expect("set");

    let seen = saw_validating.lock().expect("observed flags");
    assert_eq!(seen.as_slice(), &[Some(true), Some(false)]);
}
