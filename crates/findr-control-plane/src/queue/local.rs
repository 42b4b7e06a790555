//! Local worker-pool backend of [`DispatchQueue`].
//!
//! A session binds its listening port (preferred port first, OS-assigned
//! port as fallback) and serves the HTTP status API on it. Submitted tasks
//! go through a single dispatcher that hands them, in submission order, to
//! a fixed number of worker slots.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use findr_core::{QueueTaskId, SessionId};

use super::executor;
use super::log::QueueLog;
use super::{DispatchError, DispatchQueue, FinishedTask, QueueInitError, QueueStats, TaskSpec};
use crate::config::QueueConfig;
use crate::http;
use crate::state::PoolState;

/// Shared by the dispatcher and every running task.
struct DispatchContext {
    state: Arc<PoolState>,
    permits: Arc<Semaphore>,
    sandbox_root: PathBuf,
    monitor: bool,
    log: Arc<QueueLog>,
    results_tx: mpsc::UnboundedSender<FinishedTask>,
}

/// A queue session backed by local worker slots.
pub struct LocalWorkQueue {
    state: Arc<PoolState>,
    local_addr: SocketAddr,
    sandbox_root: PathBuf,
    log: Arc<QueueLog>,
    dispatch_tx: Option<mpsc::UnboundedSender<(QueueTaskId, TaskSpec)>>,
    results_rx: mpsc::UnboundedReceiver<FinishedTask>,
    outstanding: usize,
    next_id: u64,
    http: JoinHandle<()>,
}

impl LocalWorkQueue {
    /// Start a session: bind the listener, open the queue log, start the
    /// HTTP status API and the dispatcher.
    pub async fn bind(config: &QueueConfig, log_path: &Path) -> Result<Self, QueueInitError> {
        let workers = config.workers.max(1);
        let listener = bind_listener(&config.bind_host, config.preferred_port).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| QueueInitError::Bind {
                host: config.bind_host.clone(),
                preferred: config.preferred_port,
                source,
            })?;

        tokio::fs::create_dir_all(&config.sandbox_root)
            .await
            .map_err(|source| QueueInitError::Sandbox {
                path: config.sandbox_root.clone(),
                source,
            })?;

        let log = Arc::new(QueueLog::open(log_path).map_err(|source| QueueInitError::Log {
            path: log_path.to_path_buf(),
            source,
        })?);

        let session = SessionId::generate();
        let state = PoolState::new(session.clone(), workers);
        log.session_started(&session, local_addr.port(), workers);

        let router = http::create_router(state.clone());
        let http = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Queue status server stopped, tasks keep running");
            }
        });

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(DispatchContext {
            state: state.clone(),
            permits: Arc::new(Semaphore::new(workers)),
            sandbox_root: config.sandbox_root.clone(),
            monitor: config.monitor,
            log: log.clone(),
            results_tx,
        });
        tokio::spawn(run_dispatcher(ctx, dispatch_rx));

        let ip = best_guess_ip().unwrap_or(local_addr.ip());
        info!(
            session = %session,
            addr = %SocketAddr::new(ip, local_addr.port()),
            workers,
            "Queue launched, status API at http://{}:{}/v1/stats",
            ip,
            local_addr.port()
        );

        Ok(Self {
            state,
            local_addr,
            sandbox_root: config.sandbox_root.clone(),
            log,
            dispatch_tx: Some(dispatch_tx),
            results_rx,
            outstanding: 0,
            next_id: 0,
            http,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session id of this queue.
    pub fn session(&self) -> &SessionId {
        &self.state.session
    }
}

#[async_trait]
impl DispatchQueue for LocalWorkQueue {
    async fn submit(&mut self, task: TaskSpec) -> Result<QueueTaskId, DispatchError> {
        let tx = self.dispatch_tx.as_ref().ok_or(DispatchError::Closed)?;

        self.next_id += 1;
        let id = QueueTaskId::new(self.next_id);
        let tag = task.tag.clone();

        self.state.task_submitted().await;
        tx.send((id, task)).map_err(|_| DispatchError::Closed)?;
        self.outstanding += 1;
        self.log.task_event("SUBMITTED", id, &tag);
        debug!(task_id = %id, tag = %tag, "Task queued");
        Ok(id)
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<FinishedTask>, DispatchError> {
        if self.outstanding == 0 {
            return Ok(None);
        }

        match tokio::time::timeout(timeout, self.results_rx.recv()).await {
            Ok(Some(task)) => {
                self.outstanding -= 1;
                Ok(Some(task))
            }
            Ok(None) => Err(DispatchError::Lost {
                outstanding: self.outstanding,
            }),
            Err(_) => Ok(None),
        }
    }

    fn is_empty(&self) -> bool {
        self.outstanding == 0
    }

    async fn stats(&self) -> QueueStats {
        self.state.snapshot().await
    }

    fn port(&self) -> u16 {
        self.local_addr.port()
    }

    async fn shutdown(&mut self) {
        self.dispatch_tx = None;
        self.http.abort();
        // Only removes the sandbox root if every task sandbox is gone.
        if let Err(e) = tokio::fs::remove_dir(&self.sandbox_root).await {
            debug!(path = %self.sandbox_root.display(), error = %e, "Sandbox root left in place");
        }
        info!(session = %self.state.session, "Queue session closed");
    }
}

impl Drop for LocalWorkQueue {
    fn drop(&mut self) {
        self.http.abort();
    }
}

/// Bind the preferred port, falling back to an OS-assigned one.
async fn bind_listener(host: &str, preferred: u16) -> Result<TcpListener, QueueInitError> {
    match TcpListener::bind((host, preferred)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!(
                port = preferred,
                error = %e,
                "Preferred queue port unavailable, using an OS-assigned port"
            );
            TcpListener::bind((host, 0))
                .await
                .map_err(|source| QueueInitError::Bind {
                    host: host.to_string(),
                    preferred,
                    source,
                })
        }
    }
}

/// Hand queued tasks to worker slots in submission order.
async fn run_dispatcher(
    ctx: Arc<DispatchContext>,
    mut rx: mpsc::UnboundedReceiver<(QueueTaskId, TaskSpec)>,
) {
    while let Some((id, spec)) = rx.recv().await {
        let permit = match ctx.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let slot = ctx.state.task_started(id).await;
            ctx.log.task_event("DISPATCHED", id, &spec.tag);
            debug!(task_id = %id, slot = ?slot, "Task dispatched");

            let clock = Instant::now();
            let sandbox = executor::sandbox_dir(&ctx.sandbox_root, &ctx.state.session, id);
            let finished = executor::run_task(id, &spec, &sandbox, ctx.monitor).await;

            ctx.state.task_finished(slot, clock.elapsed()).await;
            ctx.log.task_finished(id, &spec.tag, finished.exit_status);
            drop(permit);

            if ctx.results_tx.send(finished).is_err() {
                warn!(task_id = %id, "Queue session dropped before task result was collected");
            }
        });
    }
}

/// Local IP a worker on another host would most likely reach. Connecting a
/// UDP socket sends nothing; it only selects the outbound interface.
fn best_guess_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use findr_core::ReduceCommand;

    use crate::queue::FileSpec;

    fn queue_config(dir: &Path, port: u16) -> QueueConfig {
        QueueConfig {
            bind_host: "127.0.0.1".to_string(),
            preferred_port: port,
            workers: 2,
            monitor: true,
            sandbox_root: dir.join("sandbox"),
        }
    }

    fn shell_task(dir: &Path, name: &str, script: &str) -> TaskSpec {
        let command = ReduceCommand::new("sh", vec!["-c".to_string(), script.to_string()]);
        TaskSpec {
            tag: command.tag(),
            command,
            input: FileSpec::uncached(&dir.join(format!("{name}.cfg"))).unwrap(),
            output: FileSpec::uncached(&dir.join("out").join(format!("{name}.out"))).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_falls_back_when_preferred_port_taken() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut queue = LocalWorkQueue::bind(&queue_config(dir.path(), port), &dir.path().join("q.log"))
            .await
            .unwrap();

        assert_ne!(queue.port(), port);
        assert_ne!(queue.port(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_runs_task_and_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cfg"), "hello\n").unwrap();

        let mut queue = LocalWorkQueue::bind(&queue_config(dir.path(), 0), &dir.path().join("q.log"))
            .await
            .unwrap();
        queue
            .submit(shell_task(dir.path(), "a", "cat a.cfg > a.out"))
            .await
            .unwrap();
        assert!(!queue.is_empty());

        let finished = queue.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(finished.succeeded());
        assert!(queue.is_empty());

        let collected = std::fs::read_to_string(dir.path().join("out/a.out")).unwrap();
        assert_eq!(collected, "hello\n");

        let usage = finished.resources.unwrap();
        assert_eq!(usage.bytes_read, 6);
        assert_eq!(usage.bytes_written, 6);

        let stats = queue.stats().await;
        assert_eq!(stats.tasks_submitted, 1);
        assert_eq!(stats.tasks_complete, 1);

        let log = std::fs::read_to_string(dir.path().join("q.log")).unwrap();
        assert!(log.contains("SUBMITTED"));
        assert!(log.contains("FINISHED"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.cfg"), "x").unwrap();

        let mut queue = LocalWorkQueue::bind(&queue_config(dir.path(), 0), &dir.path().join("q.log"))
            .await
            .unwrap();
        queue
            .submit(shell_task(dir.path(), "bad", "echo broken >&2; exit 3"))
            .await
            .unwrap();
        queue
            .submit(shell_task(dir.path(), "missing", "true"))
            .await
            .unwrap();

        let mut results = Vec::new();
        while !queue.is_empty() {
            if let Some(task) = queue.wait(Duration::from_secs(10)).await.unwrap() {
                results.push(task);
            }
        }
        results.sort_by_key(|t| t.id);

        assert_eq!(results[0].exit_status, Some(3));
        assert_eq!(results[0].stderr, "broken");
        assert_eq!(results[1].exit_status, None);
        assert!(results[1].error.as_deref().unwrap().contains("stage input"));
        queue.shutdown().await;
    }
}
