//! In-memory worker doubles shared by the supervisor and host tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, DuplexStream};
use tokio::time::Instant;

use crate::rpc::{
    FrameReader, FrameWriter, Message, Request, Response, RpcError, TransportEvent,
};

use super::{SupervisorError, WorkerHandle, WorkerLauncher, WorkerProcess};

/// Body of one fake worker instance; gets its 1-based launch number.
pub(crate) type Script = Arc<
    dyn Fn(usize, FrameReader<DuplexStream>, FrameWriter) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

pub(crate) fn script<F, Fut>(f: F) -> Script
where
    F: Fn(usize, FrameReader<DuplexStream>, FrameWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |n, r, w| Box::pin(f(n, r, w)))
}

struct FakeProcess {
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        std::future::pending().await
    }
}

/// Launches a [`Script`] on a pair of `duplex` pipes per launch.
pub(crate) struct FakeLauncher {
    script: Script,
    launches: Mutex<Vec<Instant>>,
}

impl FakeLauncher {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            launches: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn launches(&self) -> Vec<Instant> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<WorkerHandle, SupervisorError> {
        let n = {
            let mut launches = self.launches.lock().unwrap();
            launches.push(Instant::now());
            launches.len()
        };
        let (host_out, worker_in) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        tokio::spawn((self.script)(
            n,
            FrameReader::new(worker_in),
            FrameWriter::new(worker_out),
        ));
        Ok(WorkerHandle {
            stdin: Box::new(host_out),
            stdout: Box::new(host_in),
            process: Box::new(FakeProcess {
                alive: Arc::new(AtomicBool::new(true)),
            }),
        })
    }
}

pub(crate) fn reply(req: &Request, result: Value) -> Value {
    Message::Response(Response {
        id: req.id.clone(),
        outcome: Ok(result),
    })
    .to_value()
}

pub(crate) fn reply_err(req: &Request, error: RpcError) -> Value {
    Message::Response(Response {
        id: req.id.clone(),
        outcome: Err(error),
    })
    .to_value()
}

/// Feed every request to `handler` and send back whatever frames it returns
/// (empty = stay silent).
pub(crate) async fn serve_with<F>(
    mut reader: FrameReader<DuplexStream>,
    writer: FrameWriter,
    mut handler: F,
) where
    F: FnMut(Request) -> Vec<Value> + Send,
{
    while let Some(Ok(TransportEvent::Frame(frame))) = reader.next().await {
        let Ok(Message::Request(req)) = Message::classify(frame) else {
            continue;
        };
        for out in handler(req) {
            if writer.send(&out).await.is_err() {
                return;
            }
        }
    }
}

/// Answer every request with `{"ok": true}`; hang up when `stop_on` arrives.
pub(crate) async fn answer_all(
    mut reader: FrameReader<DuplexStream>,
    writer: FrameWriter,
    stop_on: Option<&'static str>,
) {
    while let Some(Ok(TransportEvent::Frame(frame))) = reader.next().await {
        let Ok(Message::Request(req)) = Message::classify(frame) else {
            continue;
        };
        if Some(req.method.as_str()) == stop_on {
            return;
        }
        if writer.send(&reply(&req, json!({"ok": true}))).await.is_err() {
            return;
        }
    }
}
