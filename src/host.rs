//! Host wiring.
//!
//! [`Host::start`] builds every component from an [`AppConfig`] and connects
//! them:
//!
//! ```text
//!            ┌──────────── SessionMachine ◀─── handlers ───┐
//!   UI ──▶   │   commands        │ RpcCaller               │
//!            │                   ▼                         │
//!            │              Correlator ◀── responses ──┐   │
//!            │                   │ frames              │   │
//!            │                   ▼                     │   │
//!            │   Supervisor ── worker stdio ── pump ───┴─▶ Dispatcher
//!            │        │
//!            └─ RpcEvent::FatalTimeout ──▶ SessionMachine::fail
//! ```
//!
//! Model downloads go to the worker first; a worker without
//! `model.download` falls back to the local [`ArtifactManager`].

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::artifact::{ArtifactError, ArtifactManager, ArtifactSource, ArtifactSpec, HttpSource};
use crate::config::AppConfig;
use crate::dispatch::{AliasTable, Dispatcher, Event, ModelProgress, StreamKey};
use crate::rpc::methods::{MODEL_DOWNLOAD, MODEL_PURGE};
use crate::rpc::{Correlator, ErrorKind, MethodTable, RpcCaller, RpcError, RpcEvent};
use crate::session::{
    ActiveSession, HostEvent, ModelState, ModelStatus, Progress, SessionError, SessionMachine,
    SidecarState,
};
use crate::supervisor::{Supervisor, SupervisorHandle, WorkerLauncher};

pub struct Host {
    config: AppConfig,
    correlator: Arc<Correlator>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionMachine>,
    supervisor: SupervisorHandle,
    artifacts: Arc<ArtifactManager>,
    source: Arc<dyn ArtifactSource>,
    /// Model id last initialised successfully; held in use for purge until
    /// the worker that loaded it goes away.
    loaded: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Host {
    /// Wire everything up and launch the worker.  Must run inside a tokio
    /// runtime.
    pub async fn start(config: AppConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::start_with_source(config, launcher, Arc::new(HttpSource::new())).await
    }

    /// As [`Host::start`], with a custom source for local downloads.
    pub async fn start_with_source(
        config: AppConfig,
        launcher: Arc<dyn WorkerLauncher>,
        source: Arc<dyn ArtifactSource>,
    ) -> Self {
        let correlator = Arc::new(Correlator::new(MethodTable::from_config(&config.rpc)));
        let active = ActiveSession::new();
        let dispatcher = Arc::new(Dispatcher::new(
            AliasTable::from_config(&config.dispatch),
            active.clone(),
        ));

        let rpc: Arc<dyn RpcCaller> = correlator.clone();
        let session = Arc::new(SessionMachine::new(
            rpc,
            active,
            config.session.history_limit,
        ));
        session.register(&dispatcher);

        let artifacts = Arc::new(ArtifactManager::new(config.models_dir()));
        match artifacts.sweep_staging().await {
            Ok(0) => {}
            Ok(n) => log::info!("host: removed {n} stale staging dir(s)"),
            Err(e) => log::warn!("host: staging sweep failed: {e}"),
        }

        let loaded = Arc::new(Mutex::new(None));
        release_on_restart(&dispatcher, Arc::clone(&loaded), Arc::clone(&artifacts));

        // Subscribe before the supervisor can produce anything.
        let escalations = tokio::spawn(forward_escalations(
            correlator.subscribe(),
            Arc::clone(&session),
        ));
        let (supervisor, supervisor_task) = Supervisor::spawn(
            config.supervisor.clone(),
            launcher,
            Arc::clone(&correlator),
            Arc::clone(&dispatcher),
        );

        log::info!("host: started (models in {})", artifacts.root().display());
        Self {
            config,
            correlator,
            dispatcher,
            session,
            supervisor,
            artifacts,
            source,
            loaded,
            tasks: vec![escalations, supervisor_task],
        }
    }

    pub fn session(&self) -> &Arc<SessionMachine> {
        &self.session
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn artifacts(&self) -> &Arc<ArtifactManager> {
        &self.artifacts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.session.subscribe()
    }

    /// Initialise the engine with `model`, marking it in use locally.
    pub async fn initialize_model(&self, model: &str) -> Result<Value, SessionError> {
        let result = self
            .session
            .initialize_model(json!({ "model": model }))
            .await?;

        let previous = self
            .loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(model.to_string());
        if let Some(previous) = previous.filter(|p| p != model) {
            self.artifacts.release(&previous);
        }
        self.artifacts.mark_in_use(model);
        Ok(result)
    }

    /// Ask the worker to fetch `id`; fall back to a local download when the
    /// worker does not implement `model.download`.
    pub async fn download_model(&self, id: &str) -> Result<Value, RpcError> {
        let params = json!({ "model_id": id });
        match self.correlator.call(MODEL_DOWNLOAD, Some(params)).await {
            Err(e) if e.kind == ErrorKind::MethodNotFound => {
                log::info!("host: worker cannot download, fetching {id} locally");
                self.download_locally(id).await.map_err(RpcError::from)
            }
            other => other,
        }
    }

    async fn download_locally(&self, id: &str) -> Result<Value, ArtifactError> {
        let entry = self
            .config
            .artifacts
            .find(id)
            .ok_or_else(|| ArtifactError::Unknown(id.to_string()))?;
        let spec = ArtifactSpec::from(entry);

        let dispatcher = Arc::clone(&self.dispatcher);
        let model_id = id.to_string();
        let report = move |progress: Progress| {
            dispatcher.publish_local(Event::ModelProgress(ModelProgress {
                model_id: Some(model_id.clone()),
                status: ModelStatus {
                    status: ModelState::Downloading,
                    progress: Some(progress),
                    error: None,
                },
            }));
        };

        let result = self
            .artifacts
            .install(&spec, self.source.as_ref(), &report)
            .await;
        let status = match &result {
            Ok(_) => ModelStatus::ready(),
            Err(e) => ModelStatus::failed(e.to_string()),
        };
        self.dispatcher
            .publish_local(Event::ModelProgress(ModelProgress {
                model_id: Some(id.to_string()),
                status,
            }));

        let path = result?;
        Ok(json!({ "model_id": id, "path": path.display().to_string(), "source": "local" }))
    }

    /// Purge one model or all of them.  Refuses with `E_NOT_READY` while the
    /// target is loaded.
    pub async fn purge_models(&self, id: Option<&str>) -> Result<Value, RpcError> {
        let in_use = match id {
            Some(id) => self.artifacts.is_in_use(id).then(|| id.to_string()),
            None => self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        };
        if let Some(busy) = in_use {
            return Err(ArtifactError::InUse(busy).into());
        }

        let params = id.map(|id| json!({ "model_id": id }));
        match self.correlator.call(MODEL_PURGE, params).await {
            Err(e) if e.kind == ErrorKind::MethodNotFound => {
                let removed = self.artifacts.purge(id).await?;
                Ok(json!({ "removed": removed, "source": "local" }))
            }
            other => other,
        }
    }

    /// Stop the worker and background tasks.
    pub async fn shutdown(self) {
        if let Err(e) = self.supervisor.stop().await {
            log::warn!("host: supervisor stop: {e}");
        }
        for task in self.tasks {
            task.abort();
        }
        log::info!("host: shut down");
    }
}

/// A restarted, failed or stopped worker no longer holds the loaded model.
fn release_on_restart(
    dispatcher: &Dispatcher,
    loaded: Arc<Mutex<Option<String>>>,
    artifacts: Arc<ArtifactManager>,
) {
    dispatcher.on(StreamKey::Sidecar, move |delivery| {
        let Event::SidecarStatus(status) = &delivery.event else {
            return Ok(());
        };
        if matches!(
            status.state,
            SidecarState::Restarting | SidecarState::Failed | SidecarState::Stopped
        ) {
            let previous = loaded.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(id) = previous {
                log::debug!("host: worker gone, releasing {id}");
                artifacts.release(&id);
            }
        }
        Ok(())
    });
}

/// Fatal-on-timeout calls put the session into `error`; the supervisor
/// handles the worker side on its own subscription.
async fn forward_escalations(
    mut events: broadcast::Receiver<RpcEvent>,
    session: Arc<SessionMachine>,
) {
    loop {
        match events.recv().await {
            Ok(RpcEvent::FatalTimeout { method }) => {
                session.fail(format!("{method} timed out; restart required"));
            }
            Ok(RpcEvent::Flushed { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("host: missed {n} rpc event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
