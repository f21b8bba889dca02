//! Worker process supervisor.
//!
//! One [`Supervisor`] task owns the worker's lifecycle:
//!
//! ```text
//! starting ──probe ok──▶ ready ──crash / 2 failed probes / fatal timeout──▶ restarting
//! restarting ──backoff──▶ (relaunch) ──probe ok──▶ ready
//! restarting ──breaker open──▶ failed ──restart()──▶ restarting
//! any ──stop()──▶ stopped
//! ```
//!
//! Every move into `restarting` or `failed` first flushes the correlator's
//! pending table and resets the dispatcher's sequence counters; the new
//! worker instance starts its own sequence space.
//!
//! While a worker is attached, a pump task routes its frames: responses to
//! the correlator, notifications to the dispatcher, worker-initiated
//! requests get `E_METHOD_NOT_FOUND`.

pub mod backoff;
pub mod process;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::dispatch::{Dispatcher, Event};
use crate::rpc::methods::PING;
use crate::rpc::{
    framed, CallPolicy, Correlator, ErrorKind, FrameReader, Message, RpcError, RpcEvent,
    TransportEvent,
};
use crate::session::{SidecarState, SidecarStatus};

pub use backoff::{Backoff, CircuitBreaker};
pub use process::{CommandLauncher, WorkerHandle, WorkerLauncher, WorkerProcess};

// ---------------------------------------------------------------------------
// SupervisorError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe unavailable")]
    MissingPipe(&'static str),

    #[error("supervisor is not running")]
    Gone,
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Gone => ErrorKind::NotReady,
            _ => ErrorKind::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Restart,
    Stop,
}

/// Cheap-to-clone control surface for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    status: watch::Receiver<SidecarStatus>,
    malformed: Arc<AtomicU64>,
}

impl SupervisorHandle {
    pub fn status(&self) -> SidecarStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SidecarStatus> {
        self.status.clone()
    }

    /// Lines from the worker that were not valid JSON-RPC.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Manual restart.  The only way out of `failed`; also resets backoff
    /// and the circuit breaker.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.control
            .send(Control::Restart)
            .await
            .map_err(|_| SupervisorError::Gone)
    }

    /// Shut the worker down and wait until the supervisor reports `stopped`.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        if self.control.send(Control::Stop).await.is_err() {
            // Task already gone; nothing left to stop.
            return Ok(());
        }
        self.wait_for(|s| s.state == SidecarState::Stopped)
            .await
            .map(|_| ())
    }

    /// Resolve once the status satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> Result<SidecarStatus, SupervisorError>
    where
        F: Fn(&SidecarStatus) -> bool,
    {
        let mut rx = self.status.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| SupervisorError::Gone)?;
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Why a worker instance stopped being served.
#[derive(Debug)]
enum Exit {
    Fault(String),
    Restart,
    Stop,
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<Dispatcher>,
    status: watch::Sender<SidecarStatus>,
    control: mpsc::Receiver<Control>,
    malformed: Arc<AtomicU64>,
    backoff: Backoff,
    breaker: CircuitBreaker,
    restart_count: u32,
}

impl Supervisor {
    /// Start supervising in a background task.
    pub fn spawn(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        correlator: Arc<Correlator>,
        dispatcher: Arc<Dispatcher>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SidecarStatus::default());
        let malformed = Arc::new(AtomicU64::new(0));
        let (backoff, breaker) = backoff::from_config(&config);

        let supervisor = Supervisor {
            config,
            launcher,
            correlator,
            dispatcher,
            status: status_tx,
            control: control_rx,
            malformed: Arc::clone(&malformed),
            backoff,
            breaker,
            restart_count: 0,
        };
        let task = tokio::spawn(supervisor.run());

        let handle = SupervisorHandle {
            control: control_tx,
            status: status_rx,
            malformed,
        };
        (handle, task)
    }

    fn set_status(&self, state: SidecarState, message: Option<String>) {
        let status = SidecarStatus {
            state,
            restart_count: self.restart_count,
            message,
        };
        log::info!(
            "supervisor: worker {:?} (restarts {})",
            status.state,
            status.restart_count
        );
        self.status.send_replace(status.clone());
        self.dispatcher.publish_local(Event::SidecarStatus(status));
    }

    /// Drop the current connection: pending calls fail, sequences restart.
    async fn reset_connection(&self) {
        self.correlator.flush().await;
        self.dispatcher.reset_sequences();
    }

    async fn run(mut self) {
        let mut rpc_events = self.correlator.subscribe();
        self.set_status(SidecarState::Starting, None);

        loop {
            let exit = match self.launcher.launch().await {
                Ok(handle) => self.serve(handle, &mut rpc_events).await,
                Err(e) => {
                    log::error!("supervisor: {e}");
                    Exit::Fault(e.to_string())
                }
            };

            match exit {
                Exit::Stop => break,
                Exit::Restart => {
                    self.reset_connection().await;
                    self.backoff.reset();
                    self.breaker.reset();
                    self.restart_count += 1;
                    self.set_status(SidecarState::Restarting, Some("manual restart".into()));
                }
                Exit::Fault(reason) => {
                    log::warn!("supervisor: worker fault: {reason}");
                    self.reset_connection().await;
                    self.restart_count += 1;

                    if self.breaker.record() {
                        log::error!(
                            "supervisor: {} restarts within {:?}, giving up",
                            self.breaker.recent(),
                            self.config.breaker_window()
                        );
                        self.set_status(
                            SidecarState::Failed,
                            Some(format!("worker keeps failing ({reason}); restart required")),
                        );
                        match self.control.recv().await {
                            Some(Control::Restart) => {
                                self.backoff.reset();
                                self.breaker.reset();
                                self.set_status(
                                    SidecarState::Restarting,
                                    Some("manual restart".into()),
                                );
                                continue;
                            }
                            Some(Control::Stop) | None => break,
                        }
                    }

                    let delay = self.backoff.next_delay();
                    self.set_status(SidecarState::Restarting, Some(reason));
                    log::info!("supervisor: restarting in {delay:?}");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        cmd = self.control.recv() => match cmd {
                            Some(Control::Restart) => {
                                self.backoff.reset();
                                self.breaker.reset();
                            }
                            Some(Control::Stop) | None => break,
                        },
                    }
                }
            }
        }

        self.reset_connection().await;
        self.set_status(SidecarState::Stopped, None);
    }

    /// Run one worker instance until it faults or we are told to stop.
    async fn serve(
        &mut self,
        handle: WorkerHandle,
        rpc_events: &mut tokio::sync::broadcast::Receiver<RpcEvent>,
    ) -> Exit {
        let WorkerHandle {
            stdin,
            stdout,
            mut process,
        } = handle;
        let (reader, writer) = framed(stdout, stdin);
        self.dispatcher.reset_sequences();
        self.correlator.attach(writer);

        let mut pump = tokio::spawn(pump(
            reader,
            Arc::clone(&self.correlator),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.malformed),
        ));

        let mut health = tokio::time::interval(self.config.health_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let probe = CallPolicy::new(self.config.probe_timeout(), 0);
        let mut failures = 0u32;
        let mut ready_since: Option<Instant> = None;
        let mut settled = false;

        let exit = loop {
            tokio::select! {
                ended = &mut pump => {
                    let reason = ended.unwrap_or_else(|e| format!("pump task failed: {e}"));
                    break Exit::Fault(reason);
                }
                code = process.wait() => {
                    break Exit::Fault(format!("worker exited ({code:?})"));
                }
                event = rpc_events.recv() => {
                    if let Ok(RpcEvent::FatalTimeout { method }) = event {
                        break Exit::Fault(format!("{method} timed out; worker unhealthy"));
                    }
                }
                cmd = self.control.recv() => match cmd {
                    Some(Control::Restart) => break Exit::Restart,
                    Some(Control::Stop) | None => break Exit::Stop,
                },
                _ = health.tick() => {
                    match self.correlator.call_with(PING, None, probe).await {
                        Ok(_) => {
                            failures = 0;
                            let since = *ready_since.get_or_insert_with(|| {
                                self.set_status(SidecarState::Ready, None);
                                Instant::now()
                            });
                            if !settled && since.elapsed() >= self.config.healthy_reset() {
                                log::debug!("supervisor: sustained healthy, resetting backoff");
                                self.backoff.reset();
                                self.breaker.reset();
                                settled = true;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            log::warn!(
                                "supervisor: health probe failed ({failures}/{}): {e}",
                                self.config.unhealthy_after
                            );
                            if failures >= self.config.unhealthy_after.max(1) {
                                break Exit::Fault(format!("{failures} failed health probes"));
                            }
                        }
                    }
                }
            }
        };

        pump.abort();
        if let Err(e) = process.kill().await {
            log::debug!("supervisor: kill: {e}");
        }
        exit
    }
}

/// Route inbound frames until the stream ends.  Returns why it ended.
async fn pump<R>(
    mut reader: FrameReader<R>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<Dispatcher>,
    malformed: Arc<AtomicU64>,
) -> String
where
    R: AsyncRead + Unpin,
{
    while let Some(event) = reader.next().await {
        match event {
            Ok(TransportEvent::Frame(value)) => {
                route(value, &correlator, &dispatcher, &malformed).await;
            }
            Ok(TransportEvent::ParseError(e)) => {
                malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("supervisor: malformed line from worker: {e}");
            }
            Err(e) => return format!("transport: {e}"),
        }
    }
    "worker closed its output".into()
}

async fn route(
    value: Value,
    correlator: &Correlator,
    dispatcher: &Dispatcher,
    malformed: &AtomicU64,
) {
    match Message::classify(value) {
        Ok(Message::Response(response)) => {
            correlator.handle_response(response);
        }
        Ok(Message::Notification(note)) => {
            dispatcher.dispatch(&note);
        }
        Ok(Message::Request(request)) => {
            log::warn!(
                "supervisor: worker called {} on the host; not supported",
                request.method
            );
            correlator
                .reply(request.id, Err(RpcError::method_not_found(&request.method)))
                .await;
        }
        Err(e) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            log::warn!("supervisor: unrecognised frame from worker: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::{answer_all, script, FakeLauncher};
    use super::*;
    use crate::dispatch::{AliasTable, StreamKey};
    use crate::rpc::{MethodTable, RpcCaller};
    use crate::session::ActiveSession;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            health_interval_ms: 5_000,
            probe_timeout_ms: 1_000,
            unhealthy_after: 2,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 4_000,
            healthy_reset_secs: 60,
            breaker_max_restarts: 4,
            breaker_window_secs: 300,
        }
    }

    fn start(
        launcher: Arc<FakeLauncher>,
    ) -> (SupervisorHandle, Arc<Correlator>, Arc<Dispatcher>) {
        let correlator = Arc::new(Correlator::new(MethodTable::default()));
        let dispatcher = Arc::new(Dispatcher::new(AliasTable::legacy(), ActiveSession::new()));
        let (handle, _task) = Supervisor::spawn(
            test_config(),
            launcher,
            Arc::clone(&correlator),
            Arc::clone(&dispatcher),
        );
        (handle, correlator, dispatcher)
    }

    // ---- tests ---

    #[tokio::test(start_paused = true)]
    async fn healthy_worker_becomes_ready() {
        let launcher = FakeLauncher::new(script(|_, r, w| answer_all(r, w, None)));
        let (handle, correlator, _dispatcher) = start(launcher.clone());

        let status = handle
            .wait_for(|s| s.state == SidecarState::Ready)
            .await
            .unwrap();
        assert_eq!(status.restart_count, 0);
        assert!(correlator.call("system.info", None).await.is_ok());

        handle.stop().await.unwrap();
        assert_eq!(handle.status().state, SidecarState::Stopped);
        assert_eq!(launcher.launches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_loop_backs_off_then_trips_breaker() {
        // Worker exits immediately every time.
        let launcher = FakeLauncher::new(script(|_, _r, _w| async {}));
        let (handle, _correlator, _dispatcher) = start(launcher.clone());

        let status = handle
            .wait_for(|s| s.state == SidecarState::Failed)
            .await
            .unwrap();
        assert_eq!(status.restart_count, 4);

        let launches = launcher.launches();
        assert_eq!(launches.len(), 4);
        let gaps: Vec<Duration> = launches.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_secs(1));
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps {gaps:?}");

        // No automatic restart once failed.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.launches().len(), 4);
        assert_eq!(handle.status().state, SidecarState::Failed);

        handle.restart().await.unwrap();
        handle
            .wait_for(|s| s.state == SidecarState::Restarting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(launcher.launches().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_health_resets_backoff_and_breaker() {
        // Two quick crashes, then a worker that stays healthy past
        // `healthy_reset` (60s) and exits at 92.5s. Everything after crashes.
        let launcher = FakeLauncher::new(script(|n, r, w| async move {
            if n == 3 {
                let _ = tokio::time::timeout(
                    Duration::from_millis(92_500),
                    answer_all(r, w, None),
                )
                .await;
            }
        }));
        let (handle, _correlator, _dispatcher) = start(launcher.clone());

        let status = handle
            .wait_for(|s| s.state == SidecarState::Failed)
            .await
            .unwrap();

        // Without the reset the third fault would wait the 4s cap and the
        // fourth would trip the breaker.
        let launches = launcher.launches();
        assert_eq!(launches.len(), 6, "breaker counted pre-reset faults");
        assert_eq!(status.restart_count, 6);

        let healthy_for = Duration::from_millis(92_500);
        let gap = launches[3] - launches[2];
        assert!(gap >= healthy_for + Duration::from_secs(1), "gap {gap:?}");
        assert!(gap < healthy_for + Duration::from_secs(2), "gap {gap:?}");
        assert!(launches[4] - launches[3] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_is_restarted_after_two_failed_probes() {
        let launcher = FakeLauncher::new(script(|n, mut r, w| async move {
            if n == 1 {
                // Keep the pipes open, never answer.
                while r.next().await.is_some() {}
                drop(w);
            } else {
                answer_all(r, w, None).await;
            }
        }));
        let (handle, _correlator, _dispatcher) = start(launcher.clone());

        let status = handle
            .wait_for(|s| s.state == SidecarState::Ready)
            .await
            .unwrap();
        assert_eq!(status.restart_count, 1);
        assert_eq!(launcher.launches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_rejects_pending_calls_with_connection_reset() {
        let launcher = FakeLauncher::new(script(|_, r, w| {
            answer_all(r, w, Some("recording.start"))
        }));
        let (handle, correlator, _dispatcher) = start(launcher.clone());
        handle
            .wait_for(|s| s.state == SidecarState::Ready)
            .await
            .unwrap();

        let err = correlator
            .call("recording.start", Some(json!({"session_id": "A"})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::connection_reset());
        assert_eq!(correlator.pending_len(), 0);

        let status = handle
            .wait_for(|s| s.state == SidecarState::Restarting)
            .await
            .unwrap();
        assert_eq!(status.restart_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_worker_starts_a_fresh_sequence_space() {
        let launcher = FakeLauncher::new(script(|n, r, w| async move {
            let seq = if n == 1 { 10 } else { 1 };
            let note = json!({"jsonrpc": "2.0", "method": "model:progress",
                              "params": {"seq": seq, "status": "ready"}});
            let _ = w.send(&note).await;
            if n == 1 {
                return;
            }
            answer_all(r, w, None).await;
        }));
        let correlator = Arc::new(Correlator::new(MethodTable::default()));
        let dispatcher = Arc::new(Dispatcher::new(AliasTable::legacy(), ActiveSession::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.on(StreamKey::Model, move |d| {
            sink.lock().unwrap().push(d.seq);
            Ok(())
        });
        let (handle, _task) = Supervisor::spawn(
            test_config(),
            launcher,
            correlator,
            Arc::clone(&dispatcher),
        );

        handle
            .wait_for(|s| s.state == SidecarState::Ready && s.restart_count == 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(10), Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_requests_get_method_not_found() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let launcher = FakeLauncher::new(script(move |_, mut r, w| {
            let tx = Arc::clone(&tx);
            async move {
                let ask = json!({"jsonrpc": "2.0", "id": "w1", "method": "host.prompt"});
                let _ = w.send(&ask).await;
                while let Some(Ok(TransportEvent::Frame(frame))) = r.next().await {
                    match Message::classify(frame) {
                        Ok(Message::Response(resp)) => {
                            if let Some(tx) = tx.lock().unwrap().take() {
                                let _ = tx.send(resp);
                            }
                        }
                        Ok(Message::Request(req)) => {
                            let reply = json!({"jsonrpc": "2.0", "id": req.id, "result": {}});
                            let _ = w.send(&reply).await;
                        }
                        _ => {}
                    }
                }
            }
        }));
        let (_handle, _correlator, _dispatcher) = start(launcher);

        let resp = rx.await.unwrap();
        assert_eq!(resp.id, crate::rpc::RequestId::Text("w1".into()));
        assert_eq!(resp.outcome.unwrap_err().kind, ErrorKind::MethodNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_lines_are_counted_not_fatal() {
        let launcher = FakeLauncher::new(script(|_, r, w| async move {
            let _ = w.send(&json!("just a string")).await;
            answer_all(r, w, None).await;
        }));
        let (handle, _correlator, _dispatcher) = start(launcher.clone());
        handle
            .wait_for(|s| s.state == SidecarState::Ready)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.malformed_frames(), 1);
        assert_eq!(launcher.launches().len(), 1);
    }
}
