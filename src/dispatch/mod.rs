//! Notification dispatcher.
//!
//! Inbound id-less messages go through, in order:
//!
//! ```text
//! alias normalisation → payload validation → seq dedup → session filter → handlers
//! ```
//!
//! The two drops (stale `seq`, stale `session_id`) are expected results of
//! async racing and are never surfaced as errors; they are logged at debug
//! level and counted in [`DispatchStats`].
//!
//! There is no global registry: construct a [`Dispatcher`], share it behind
//! an `Arc`, subscribe with [`Dispatcher::on`].

pub mod alias;
pub mod payload;
pub mod stream;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::rpc::Notification;
use crate::session::ActiveSession;

pub use alias::AliasTable;
pub use payload::{
    AudioLevel, AudioSource, Event, ModelInfo, ModelProgress, PayloadError, RecordingStatus,
    StatusChanged, TranscriptComplete, TranscriptFailure,
};
pub use stream::{SeqVerdict, SequenceTracker, StreamKey};

// ---------------------------------------------------------------------------
// Delivery / Handler
// ---------------------------------------------------------------------------

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub stream: StreamKey,
    pub seq: Option<i64>,
    pub event: Event,
}

/// A stream subscriber.  An `Err` (or a panic) is logged and does not stop
/// the remaining handlers.
pub type Handler = Arc<dyn Fn(&Delivery) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by [`Dispatcher::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { handlers: usize, failed: usize },
    DuplicateSeq { last: i64 },
    StaleSession,
    UnknownMethod,
    InvalidPayload(String),
}

// ---------------------------------------------------------------------------
// DispatchStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub duplicate_seq: u64,
    pub stale_session: u64,
    pub unknown: u64,
    pub invalid: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    duplicate_seq: AtomicU64,
    stale_session: AtomicU64,
    unknown: AtomicU64,
    invalid: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicate_seq: self.duplicate_seq.load(Ordering::Relaxed),
            stale_session: self.stale_session.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    aliases: AliasTable,
    sequences: Mutex<SequenceTracker>,
    handlers: RwLock<HashMap<StreamKey, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
    active: ActiveSession,
    counters: Counters,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("aliases", &self.aliases)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// `active` is the state machine's session slot, read for filtering.
    pub fn new(aliases: AliasTable, active: ActiveSession) -> Self {
        Self {
            aliases,
            sequences: Mutex::new(SequenceTracker::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            active,
            counters: Counters::default(),
        }
    }

    /// Register `handler` for `stream`.  Handlers run in registration order.
    pub fn on<F>(&self, stream: StreamKey, handler: F) -> HandlerId
    where
        F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(stream)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler.  Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Forget every stream's last `seq`.  Called when a new worker instance
    /// starts, since it brings its own sequence space.
    pub fn reset_sequences(&self) {
        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        log::debug!("dispatch: sequence counters reset");
    }

    pub fn last_seq(&self, stream: StreamKey) -> Option<i64> {
        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_seq(stream)
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Dispatch one inbound notification from the worker.
    pub fn dispatch(&self, note: &Notification) -> DispatchOutcome {
        let method = self.aliases.normalize(&note.method);

        let Some(stream) = StreamKey::for_method(method) else {
            log::debug!("dispatch: ignoring unknown notification {}", note.method);
            Counters::bump(&self.counters.unknown);
            return DispatchOutcome::UnknownMethod;
        };

        let event = match Event::parse(method, note.params.as_ref()) {
            Ok(event) => event,
            Err(PayloadError::UnknownMethod(_)) => {
                log::debug!("dispatch: no payload type for {method}");
                Counters::bump(&self.counters.unknown);
                return DispatchOutcome::UnknownMethod;
            }
            Err(e) => {
                log::warn!("dispatch: {e}");
                Counters::bump(&self.counters.invalid);
                return DispatchOutcome::InvalidPayload(e.to_string());
            }
        };

        // (a) sequence dedup
        let seq = payload::extract_seq(note.params.as_ref());
        let verdict = self
            .sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .offer(stream, seq);
        if let SeqVerdict::Stale { last } = verdict {
            log::debug!("dispatch: drop {method} seq={seq:?} (last {last})");
            Counters::bump(&self.counters.duplicate_seq);
            return DispatchOutcome::DuplicateSeq { last };
        }

        // (b) session filter
        if let Some(session_id) = event.session_id() {
            if !self.active.is_active(session_id) {
                log::debug!("dispatch: drop {method} for stale session {session_id}");
                Counters::bump(&self.counters.stale_session);
                return DispatchOutcome::StaleSession;
            }
        }

        // (c) fan out
        self.deliver(Delivery { stream, seq, event })
    }

    /// Deliver a host-originated event (e.g. supervisor status) straight to
    /// the handlers, skipping dedup and session filtering.
    pub fn publish_local(&self, event: Event) -> DispatchOutcome {
        let Some(stream) = StreamKey::for_method(event.method()) else {
            return DispatchOutcome::UnknownMethod;
        };
        self.deliver(Delivery {
            stream,
            seq: None,
            event,
        })
    }

    fn deliver(&self, delivery: Delivery) -> DispatchOutcome {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&delivery.stream)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut failed = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&delivery))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    log::warn!("dispatch: {} handler failed: {e:#}", delivery.stream);
                }
                Err(_) => {
                    failed += 1;
                    log::error!("dispatch: {} handler panicked", delivery.stream);
                }
            }
        }

        Counters::bump(&self.counters.delivered);
        for _ in 0..failed {
            Counters::bump(&self.counters.handler_failures);
        }
        DispatchOutcome::Delivered {
            handlers: handlers.len(),
            failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionId};
    use serde_json::{json, Value};

    fn note(method: &str, params: Value) -> Notification {
        Notification::new(method, Some(params))
    }

    fn complete(session: &str, seq: Option<i64>, text: &str) -> Notification {
        let mut params = json!({"session_id": session, "text": text});
        if let Some(seq) = seq {
            params["seq"] = json!(seq);
        }
        note("transcript:complete", params)
    }

    /// Dispatcher with session `id` active and a recorder on `stream`.
    fn recording_dispatcher(
        id: &str,
        stream: StreamKey,
    ) -> (Dispatcher, Arc<Mutex<Vec<Delivery>>>) {
        let active = ActiveSession::new();
        active.begin(Session {
            id: SessionId::from(id),
            created_at: std::time::SystemTime::now(),
        });
        let dispatcher = Dispatcher::new(AliasTable::legacy(), active);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.on(stream, move |d| {
            sink.lock().unwrap().push(d.clone());
            Ok(())
        });
        (dispatcher, seen)
    }

    #[test]
    fn sequence_5_5_3_6_delivers_two() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);

        for seq in [5, 5, 3, 6] {
            dispatcher.dispatch(&complete("A", Some(seq), "t"));
        }

        let seqs: Vec<_> = seen.lock().unwrap().iter().map(|d| d.seq).collect();
        assert_eq!(seqs, vec![Some(5), Some(6)]);
        assert_eq!(dispatcher.stats().duplicate_seq, 2);
    }

    #[test]
    fn unsequenced_events_always_pass() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);
        dispatcher.dispatch(&complete("A", Some(9), "x"));
        for _ in 0..3 {
            dispatcher.dispatch(&complete("A", None, "y"));
        }
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn stale_session_is_dropped_silently() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);

        let outcome = dispatcher.dispatch(&complete("B", Some(1), "other"));
        assert_eq!(outcome, DispatchOutcome::StaleSession);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(dispatcher.stats().stale_session, 1);
    }

    #[test]
    fn untagged_events_skip_the_session_filter() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Audio);
        dispatcher.dispatch(&note("audio:level", json!({"source": "meter", "rms": 0.1, "peak": 0.4})));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn legacy_names_land_on_canonical_streams() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);
        dispatcher.dispatch(&note(
            "event.transcription_complete",
            json!({"session_id": "A", "text": "legacy"}),
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event.method(), "transcript:complete");
    }

    #[test]
    fn failing_handler_does_not_block_the_next_one() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);
        // Registered after the recorder, then one that panics, then another.
        dispatcher.on(StreamKey::Transcript, |_| anyhow::bail!("nope"));
        dispatcher.on(StreamKey::Transcript, |_| panic!("handler bug"));
        let tail = Arc::new(Mutex::new(0));
        let tail_sink = Arc::clone(&tail);
        dispatcher.on(StreamKey::Transcript, move |_| {
            *tail_sink.lock().unwrap() += 1;
            Ok(())
        });

        let outcome = dispatcher.dispatch(&complete("A", None, "x"));
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                handlers: 4,
                failed: 2
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(*tail.lock().unwrap(), 1);
        assert_eq!(dispatcher.stats().handler_failures, 2);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new(AliasTable::empty(), ActiveSession::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            dispatcher.on(StreamKey::Model, move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        dispatcher.dispatch(&note("model:progress", json!({"status": "ready"})));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn off_unsubscribes() {
        let dispatcher = Dispatcher::new(AliasTable::empty(), ActiveSession::new());
        let id = dispatcher.on(StreamKey::Model, |_| Ok(()));
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        let outcome = dispatcher.dispatch(&note("model:progress", json!({"status": "ready"})));
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                handlers: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn reset_sequences_accepts_low_seq_again() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);
        dispatcher.dispatch(&complete("A", Some(40), "before restart"));
        dispatcher.reset_sequences();
        assert_eq!(dispatcher.last_seq(StreamKey::Transcript), None);
        dispatcher.dispatch(&complete("A", Some(1), "after restart"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn invalid_payload_does_not_consume_seq() {
        let (dispatcher, seen) = recording_dispatcher("A", StreamKey::Transcript);
        let bad = note("transcript:complete", json!({"seq": 3}));
        assert!(matches!(
            dispatcher.dispatch(&bad),
            DispatchOutcome::InvalidPayload(_)
        ));
        dispatcher.dispatch(&complete("A", Some(3), "good"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_notifications_are_counted() {
        let dispatcher = Dispatcher::new(AliasTable::empty(), ActiveSession::new());
        assert_eq!(
            dispatcher.dispatch(&note("weather:report", json!({}))),
            DispatchOutcome::UnknownMethod
        );
        assert_eq!(
            dispatcher.dispatch(&note("event.audio_level", json!({}))),
            DispatchOutcome::UnknownMethod
        );
        assert_eq!(dispatcher.stats().unknown, 2);
    }

    #[test]
    fn publish_local_bypasses_filters() {
        let dispatcher = Dispatcher::new(AliasTable::empty(), ActiveSession::new());
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        dispatcher.on(StreamKey::Sidecar, move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });
        dispatcher.publish_local(Event::SidecarStatus(crate::session::SidecarStatus::default()));
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
