use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use accord_net_handshake::{
    Done, EncodeError, Encoder, Handshake, HandshakeConfig, HandshakeError, JsonEncoder, Modify,
    ModifyError, NegotiationError, Outcome, Payload, QueryStringEncoder, SessionId,
    TimerRegistry, TokioTimers,
};
use accord_timers::TimerCallback;
use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde_json::json;

#[derive(Debug)]
struct Ctx {
    hi: &'static str,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn handshake(config: HandshakeConfig) -> Handshake<Ctx> {
    init_tracing();
    Handshake::new(Ctx { hi: "mom" }, config).unwrap()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// Records registry calls without ever firing a timer.
#[derive(Debug, Default)]
struct RecordingTimers {
    calls: Mutex<Vec<String>>,
}

impl RecordingTimers {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl TimerRegistry for RecordingTimers {
    fn schedule(&self, key: &str, after: Duration, _callback: TimerCallback) {
        self.calls.lock().push(format!("schedule {key} {after:?}"));
    }

    fn cancel(&self, key: &str) -> bool {
        self.calls.lock().push(format!("cancel {key}"));
        true
    }

    fn cancel_all(&self) -> usize {
        self.calls.lock().push("cancel_all".to_owned());
        0
    }

    fn is_pending(&self, _key: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn encodes_template_fields_in_insertion_order() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("foo", "bar").unwrap();
    shake.set("hello", 1314).unwrap();
    shake.refresh().unwrap();

    let seen = counter();
    let delivered = counter();
    let (seen_in_step, delivered_in_callback) = (Arc::clone(&seen), Arc::clone(&delivered));
    let (tx, rx) = tokio::sync::oneshot::channel();

    shake
        .negotiate(
            Modify::sync(move |ctx: &Ctx, _| {
                assert_eq!(ctx.hi, "mom");
                seen_in_step.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            move |ctx, error, encoded| {
                assert_eq!(ctx.hi, "mom");
                delivered_in_callback.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((error, encoded));
            },
        )
        .unwrap();

    let (error, encoded) = rx.await.unwrap();
    assert_eq!(error, None);
    assert_eq!(encoded, "foo=bar&hello=1314");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(shake.pending(), 0);
}

#[tokio::test]
async fn deferred_step_works_on_a_clone() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("hello", 1314).unwrap().refresh().unwrap();
    let live = shake.payload().unwrap();

    let outcome = shake
        .negotiate_async(Modify::deferred(move |_, payload, done| {
            assert_eq!(payload.snapshot(), live);
            payload.insert("foo", "bar");
            done.ok();
        }))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(outcome.encoded, "hello=1314&foo=bar");
    assert_eq!(shake.payload().unwrap().get("foo"), None);
}

#[tokio::test]
async fn sync_error_is_reported_and_embedded() {
    let shake = handshake(HandshakeConfig::default());

    let outcome = shake
        .negotiate_async(Modify::sync(|_, _| Err("Im sorry".into())))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(
        outcome.error,
        Some(NegotiationError::Modification(ModifyError::new("Im sorry")))
    );
    assert_eq!(outcome.error.unwrap().to_string(), "Im sorry");
    assert!(outcome.encoded.contains("error=Im%20sorry"));
}

#[tokio::test]
async fn deferred_error_is_reported_and_embedded() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("version", "1.0").unwrap().refresh().unwrap();

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, _, done| done.fail("not allowed")))
        .unwrap()
        .await
        .unwrap();

    assert!(!outcome.is_ok());
    assert_eq!(outcome.encoded, "version=1.0&error=not%20allowed");
}

#[tokio::test(start_paused = true)]
async fn times_out_when_step_never_completes() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, _, _done| {}))
        .unwrap()
        .await
        .unwrap();

    let error = outcome.error.unwrap();
    assert_matches!(error, NegotiationError::Timeout(timeout) if timeout == Duration::from_millis(100));
    assert!(error.to_string().contains("timely manner"));
    assert_eq!(
        outcome.encoded,
        "error=handshake%20did%20not%20complete%20in%20a%20timely%20manner"
    );
    assert_eq!(shake.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_does_not_fire_early_and_fires_once() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));
    let slot: Arc<Mutex<Option<Done>>> = Arc::default();
    let calls = counter();

    let (store, count) = (Arc::clone(&slot), Arc::clone(&calls));
    shake
        .negotiate(
            Modify::deferred(move |_, _, done| *store.lock() = Some(done)),
            move |_, error, _| {
                if error.is_some_and(|error| error.is_timeout()) {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(shake.pending(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let done = slot.lock().take().unwrap();
    assert!(!done.is_pending());
    done.ok();
    done.fail("too late");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn completion_cancels_deadline_and_ignores_repeats() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));
    let calls = counter();
    let outcomes: Arc<Mutex<Vec<Option<NegotiationError>>>> = Arc::default();

    let (count, seen) = (Arc::clone(&calls), Arc::clone(&outcomes));
    shake
        .negotiate(
            Modify::deferred(|_, _, done| {
                let again = done.clone();
                done.ok();
                again.fail("second");
                done.ok();
            }),
            move |_, error, _| {
                count.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(error);
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*outcomes.lock(), vec![None]);
}

#[tokio::test]
async fn custom_json_encoder() {
    let shake = handshake(HandshakeConfig::default().with_encoder(JsonEncoder));
    shake.set("hello", 1314).unwrap().refresh().unwrap();

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, payload, done| {
            payload.insert("foo", "bar");
            done.ok();
        }))
        .unwrap()
        .await
        .unwrap();

    let decoded = JsonEncoder::decode(&outcome.encoded).unwrap();
    assert_eq!(decoded["foo"], "bar");
    assert_eq!(decoded["hello"], 1314);
}

#[tokio::test]
async fn encoder_failure_yields_error_payload_without_error() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("hello", 1314).unwrap().refresh().unwrap();

    let outcome = shake
        .negotiate_async(Modify::sync(|_, payload| {
            payload.insert("foo".into(), json!({ "bar": "bar" }));
            Ok(())
        }))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(outcome.error, None);
    let decoded = QueryStringEncoder::decode(&outcome.encoded).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded["error"], "cannot encode object value for key: foo");
}

#[tokio::test]
async fn encoder_failure_keeps_original_negotiation_error() {
    let failing = |_: &Payload| -> Result<String, EncodeError> { Err(EncodeError::custom("encoder offline")) };
    let fallback_aware = move |payload: &Payload| -> Result<String, EncodeError> {
        if payload.len() == 1 && payload.contains_key("error") {
            return JsonEncoder.encode(payload);
        }
        failing(payload)
    };
    let shake = handshake(HandshakeConfig::default().with_encoder(fallback_aware));

    let outcome = shake
        .negotiate_async(Modify::sync(|_, payload| {
            payload.insert("extra".into(), json!(1));
            Err("rejected".into())
        }))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(outcome.error.unwrap().to_string(), "rejected");
    let decoded = JsonEncoder::decode(&outcome.encoded).unwrap();
    assert_eq!(decoded["error"], "encoder offline");
}

#[tokio::test(start_paused = true)]
async fn dispose_cancels_deadlines_and_closes_sessions() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));
    let calls = counter();

    let count = Arc::clone(&calls);
    shake
        .negotiate(Modify::deferred(|_, _, _| {}), move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let pending = shake
        .negotiate_async(Modify::deferred(|_, _, _| {}))
        .unwrap();
    assert_eq!(shake.pending(), 2);

    assert!(shake.dispose());
    assert!(!shake.dispose());
    assert_eq!(shake.pending(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_matches!(pending.await, Err(HandshakeError::Disposed));
}

#[tokio::test]
async fn done_after_dispose_is_discarded() {
    let shake = handshake(HandshakeConfig::default());
    let slot: Arc<Mutex<Option<Done>>> = Arc::default();

    let store = Arc::clone(&slot);
    let negotiation = shake
        .negotiate_async(Modify::deferred(move |_, _, done| *store.lock() = Some(done)))
        .unwrap();
    shake.dispose();

    let done = slot.lock().take().unwrap();
    assert!(!done.is_pending());
    done.ok();
    assert_matches!(negotiation.await, Err(HandshakeError::Disposed));
}

#[tokio::test]
async fn injected_timers_and_ids() {
    let timers = Arc::new(RecordingTimers::default());
    let next = counter();
    let config = HandshakeConfig::default()
        .with_timeout(Some(Duration::from_secs(2)))
        .with_timers(timers.clone())
        .with_id_generator(move || SessionId::new(format!("session-{}", next.fetch_add(1, Ordering::SeqCst))));
    let shake = handshake(config);

    let outcome = shake.negotiate_async(Modify::noop()).unwrap().await.unwrap();
    assert_eq!(outcome, Outcome { error: None, encoded: String::new() });

    shake.dispose();
    assert_eq!(
        timers.calls(),
        ["schedule session-0 2s", "cancel session-0", "cancel_all"]
    );
}

#[tokio::test]
async fn no_deadline_without_timeout() {
    let timers = Arc::new(RecordingTimers::default());
    let shake = handshake(
        HandshakeConfig::default()
            .without_timeout()
            .with_timers(timers.clone()),
    );
    assert_eq!(shake.timeout(), None);

    shake.negotiate_async(Modify::noop()).unwrap().await.unwrap();
    assert!(timers.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_step_completes_from_another_task() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("hello", 1314).unwrap().refresh().unwrap();

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, payload, done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                payload.insert("foo", "bar");
                done.ok();
            });
        }))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome {
            error: None,
            encoded: "hello=1314&foo=bar".to_owned(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_negotiations_do_not_interfere() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));
    shake.set("base", true).unwrap().refresh().unwrap();

    let first = shake
        .negotiate_async(Modify::deferred(|_, payload, done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                payload.insert("who", "first");
                done.ok();
            });
        }))
        .unwrap();
    let second = shake
        .negotiate_async(Modify::deferred(|_, payload, _done| {
            payload.insert("who", "second");
        }))
        .unwrap();

    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.encoded, "base=true&who=first");
    assert!(first.is_ok());
    assert_eq!(
        second.encoded,
        "base=true&who=second&error=handshake%20did%20not%20complete%20in%20a%20timely%20manner"
    );
    assert_matches!(second.error, Some(NegotiationError::Timeout(_)));
}

#[tokio::test]
async fn step_can_reject_with_any_error() {
    let shake = handshake(HandshakeConfig::default());

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, _, done| {
            let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "peer is banned");
            done.fail(ModifyError::from_error(&err));
        }))
        .unwrap()
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(NegotiationError::Modification(ref err)) if err.message() == "peer is banned"
    );
    assert_eq!(outcome.encoded, "error=peer%20is%20banned");
}

#[tokio::test]
async fn deferred_step_completes_after_editing_under_lock() {
    let shake = handshake(HandshakeConfig::default());
    shake.set("hello", 1314).unwrap().refresh().unwrap();

    let outcome = shake
        .negotiate_async(Modify::deferred(|_, payload, done| {
            let accepted = payload.with(|payload| {
                payload.remove("hello");
                payload.insert("sid".into(), json!("abc"));
                payload.len() == 1
            });
            if accepted {
                done.ok();
            } else {
                done.fail("unexpected fields");
            }
        }))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(outcome, Outcome { error: None, encoded: "sid=abc".to_owned() });
}

#[tokio::test(start_paused = true)]
async fn completion_disarms_the_deadline() {
    let timers = Arc::new(TokioTimers::new().unwrap());
    let shake = handshake(
        HandshakeConfig::default()
            .with_timers(timers.clone())
            .with_id_generator(|| SessionId::new("only")),
    );
    let slot: Arc<Mutex<Option<Done>>> = Arc::default();

    let store = Arc::clone(&slot);
    let negotiation = shake
        .negotiate_async(Modify::deferred(move |_, _, done| *store.lock() = Some(done)))
        .unwrap();
    assert!(timers.is_pending("only"));

    let done = slot.lock().take().unwrap();
    done.ok();
    assert!(!timers.is_pending("only"));
    assert!(negotiation.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn dropped_done_without_deadline_abandons_negotiation() {
    let shake = handshake(HandshakeConfig::default().without_timeout());
    let calls = counter();

    for _ in 0..1000 {
        let count = Arc::clone(&calls);
        shake
            .negotiate(Modify::deferred(|_, _, done| drop(done)), move |_, _, _| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let negotiation = shake
        .negotiate_async(Modify::deferred(|_, _, done| drop(done)))
        .unwrap();
    assert_eq!(shake.pending(), 0);

    let result = tokio::time::timeout(Duration::from_secs(3600), negotiation)
        .await
        .unwrap();
    assert_matches!(result, Err(HandshakeError::Abandoned));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn abandoned_only_after_last_done_clone_drops() {
    let shake = handshake(HandshakeConfig::default().without_timeout());
    let slot: Arc<Mutex<Option<Done>>> = Arc::default();

    let store = Arc::clone(&slot);
    let negotiation = shake
        .negotiate_async(Modify::deferred(move |_, _, done| {
            let kept = done.clone();
            drop(done);
            *store.lock() = Some(kept);
        }))
        .unwrap();
    assert_eq!(shake.pending(), 1);

    let done = slot.lock().take().unwrap();
    assert!(done.is_pending());
    drop(done);
    assert_eq!(shake.pending(), 0);
    assert_matches!(negotiation.await, Err(HandshakeError::Abandoned));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handshake_disposes_it() {
    let shake = handshake(HandshakeConfig::default().with_timeout(Some(Duration::from_millis(100))));
    let calls = counter();

    let count = Arc::clone(&calls);
    shake
        .negotiate(Modify::deferred(|_, _, _| {}), move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let pending = shake
        .negotiate_async(Modify::deferred(|_, _, _| {}))
        .unwrap();

    drop(shake);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_matches!(pending.await, Err(HandshakeError::Disposed));
}
