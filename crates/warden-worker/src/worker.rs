//! The worker thread body.
//!
//! Each worker runs on its own OS thread with a current-thread tokio runtime.
//! It initializes the dispatcher, reports `Ready` (or `InitFailed`), and then
//! serves commands until told to shut down, killed, or its command channel
//! closes. Requests execute concurrently; a panicking handler is caught at the
//! task boundary and reported as a `HANDLER_PANIC` response.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use warden_core::error::codes;
use warden_core::types::now;

use crate::dispatcher::{CommandDispatcher, WorkerBackend};
use crate::protocol::{
    Envelope, HeartbeatReport, MemoryUsage, ResponseError, WorkerCommand, WorkerReply, WorkerResponse,
};

/// Channel ends owned by the worker thread.
pub(crate) struct WorkerChannels {
    pub commands: mpsc::UnboundedReceiver<WorkerCommand>,
    pub replies: mpsc::UnboundedSender<WorkerReply>,
    /// Fires on forced termination
    pub kill: oneshot::Receiver<()>,
}

/// Entry point of the worker thread.
pub(crate) fn run(backend: Box<dyn WorkerBackend>, channels: WorkerChannels) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build worker runtime");
            let _ = channels.replies.send(WorkerReply::InitFailed {
                message: format!("failed to build worker runtime: {e}"),
            });
            return;
        }
    };

    runtime.block_on(serve(backend, channels));
}

/// Bookkeeping for a request executing inside the worker.
struct InFlight {
    request_id: String,
    correlation_id: Option<String>,
    action: String,
}

async fn serve(backend: Box<dyn WorkerBackend>, channels: WorkerChannels) {
    let WorkerChannels {
        mut commands,
        replies,
        mut kill,
    } = channels;
    let started = Instant::now();

    let initialized = tokio::select! {
        biased;
        _ = &mut kill => {
            debug!("Worker killed during initialization");
            return;
        }
        result = CommandDispatcher::initialize(backend) => result,
    };

    let dispatcher = match initialized {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            warn!(error = %e, "Worker backend initialization failed");
            let _ = replies.send(WorkerReply::InitFailed { message: e.to_string() });
            return;
        }
    };

    let actions = dispatcher.actions().await;
    if replies.send(WorkerReply::Ready { actions }).is_err() {
        return;
    }
    info!("Worker ready");

    let mut tasks: JoinSet<WorkerResponse> = JoinSet::new();
    let mut in_flight: HashMap<tokio::task::Id, InFlight> = HashMap::new();
    let mut handled: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = &mut kill => {
                warn!(in_flight = tasks.len(), "Worker killed");
                return;
            }

            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                handled += 1;
                let response = match joined {
                    Ok((id, response)) => {
                        in_flight.remove(&id);
                        response
                    }
                    Err(e) => {
                        let Some(request) = in_flight.remove(&e.id()) else {
                            continue;
                        };
                        panic_response(request, e)
                    }
                };
                if replies.send(WorkerReply::Response(response)).is_err() {
                    debug!("Supervisor gone, worker exiting");
                    return;
                }
            }

            command = commands.recv() => match command {
                Some(WorkerCommand::Request { request_id, envelope }) => {
                    let request = InFlight {
                        request_id: request_id.clone(),
                        correlation_id: envelope.correlation_id.clone(),
                        action: envelope.message_type.clone(),
                    };
                    let handle = tasks.spawn(execute(dispatcher.clone(), request_id, envelope));
                    in_flight.insert(handle.id(), request);
                }
                Some(WorkerCommand::Heartbeat { probe_id }) => {
                    let report = HeartbeatReport {
                        probe_id,
                        timestamp: now(),
                        memory: read_memory_usage(),
                        in_flight: tasks.len(),
                        handled,
                        uptime_ms: started.elapsed().as_millis() as u64,
                    };
                    if replies.send(WorkerReply::Heartbeat(report)).is_err() {
                        return;
                    }
                }
                Some(WorkerCommand::Shutdown) => {
                    info!(in_flight = tasks.len(), "Worker shutting down");
                    tasks.shutdown().await;
                    dispatcher.shutdown().await;
                    let _ = replies.send(WorkerReply::ShutdownAck);
                    return;
                }
                None => {
                    debug!("Command channel closed, worker exiting");
                    tasks.shutdown().await;
                    dispatcher.shutdown().await;
                    return;
                }
            },
        }
    }
}

async fn execute(dispatcher: Arc<CommandDispatcher>, request_id: String, envelope: Envelope) -> WorkerResponse {
    let Envelope {
        message_type,
        payload,
        correlation_id,
        ..
    } = envelope;

    match dispatcher.handle(&message_type, payload).await {
        Ok(data) => WorkerResponse::ok(request_id, correlation_id, data),
        Err(error) => WorkerResponse::failed(request_id, correlation_id, error),
    }
}

fn panic_response(request: InFlight, error: JoinError) -> WorkerResponse {
    let detail = if error.is_panic() {
        panic_message(&*error.into_panic())
    } else {
        "handler task cancelled".to_string()
    };
    error!(action = %request.action, request_id = %request.request_id, panic = %detail, "Handler panicked");

    WorkerResponse::failed(
        request.request_id,
        request.correlation_id,
        ResponseError::new(
            codes::HANDLER_PANIC,
            &request.action,
            format!("Action {} panicked: {detail}", request.action),
        ),
    )
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Memory of the current process, read from `/proc/self/status`.
///
/// Threads share one address space, so this is the process figure. Zero when
/// procfs is unavailable.
pub fn read_memory_usage() -> MemoryUsage {
    let Ok(content) = std::fs::read_to_string("/proc/self/status") else {
        return MemoryUsage::default();
    };
    parse_proc_status(&content)
}

fn parse_proc_status(content: &str) -> MemoryUsage {
    let kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    let mut usage = MemoryUsage::default();
    for line in content.lines() {
        if line.starts_with("VmRSS:") {
            usage.rss_bytes = kb(line) * 1024;
        } else if line.starts_with("VmSize:") {
            usage.virtual_bytes = kb(line) * 1024;
        }
    }
    usage
}
