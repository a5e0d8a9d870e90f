//! Binding between one document and one kernel connection.
//!
//! A `Session` owns at most one [`KernelConnection`] at a time, tracks the
//! kernel status and the session execution counter, and routes the kernel's
//! event stream to whoever is waiting on a given request. Status changes are
//! pushed to subscribers through a `watch` of the current status and a
//! broadcast of [`SessionEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{NotebookError, Result};
use crate::kernel::{KernelConnection, KernelEvent, KernelInfo, KernelSpec, KernelStatus};
use crate::output::OutputRecord;
use crate::registry::ConnectionRegistry;

const SESSION_EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged {
        from: KernelStatus,
        to: KernelStatus,
    },
    KernelChanged {
        kernel: KernelSpec,
    },
}

/// What the kernel reported for one dispatched execution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecutionEvent {
    Output(OutputRecord),
    Finished,
    Aborted,
}

/// An execution the kernel accepted.
pub(crate) struct Dispatched {
    pub msg_id: String,
    pub execution_count: u32,
    pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
}

/// Kernel answer to a complete request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionReply {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Default)]
struct Routes {
    executions: HashMap<String, mpsc::UnboundedSender<ExecutionEvent>>,
    /// Pending complete requests, tagged with the order they were sent in.
    completions: HashMap<String, (u64, oneshot::Sender<CompletionReply>)>,
    completion_seq: u64,
    execution_count: u32,
}

impl Routes {
    fn register_completion(&mut self, msg_id: String) -> oneshot::Receiver<CompletionReply> {
        let (tx, rx) = oneshot::channel();
        self.completion_seq += 1;
        self.completions.insert(msg_id, (self.completion_seq, tx));
        rx
    }

    /// Hand `reply` to the request `msg_id`. The kernel answers shell
    /// requests in order, so anything sent before it will never be answered
    /// and is dropped along with requests nobody is waiting on.
    fn resolve_completion(&mut self, msg_id: &str, reply: CompletionReply) -> bool {
        let Some((seq, tx)) = self.completions.remove(msg_id) else {
            return false;
        };
        let before = self.completions.len();
        self.completions
            .retain(|_, (pending, tx)| *pending > seq && !tx.is_closed());
        let stale = before - self.completions.len();
        if stale > 0 {
            debug!("[session] Dropped {} stale completion requests", stale);
        }
        let _ = tx.send(reply);
        true
    }

    /// Resolve everything in flight as aborted.
    fn abort_all(&mut self) {
        for (msg_id, tx) in self.executions.drain() {
            debug!("[session] Aborting execution {}", msg_id);
            let _ = tx.send(ExecutionEvent::Aborted);
        }
        self.completions.clear();
    }
}

/// State shared between the session and its router task.
///
/// Status is only ever written while `routes` is locked, so a check of the
/// current status and the transition that follows it are atomic.
struct Shared {
    status: watch::Sender<KernelStatus>,
    events: broadcast::Sender<SessionEvent>,
    routes: StdMutex<Routes>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    fn set_status(&self, _routes: &mut Routes, to: KernelStatus) {
        let from = self.status.send_replace(to);
        if from != to {
            debug!("[session] Status {} -> {}", from, to);
            let _ = self.events.send(SessionEvent::StatusChanged { from, to });
        }
    }
}

/// Unregisters a complete request when its caller stops waiting.
struct PendingCompletion {
    shared: Arc<Shared>,
    msg_id: String,
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        self.shared.routes().completions.remove(&self.msg_id);
    }
}

struct Binding {
    connection: Arc<KernelConnection>,
    router: JoinHandle<()>,
}

/// One document's view of a kernel.
pub struct Session {
    id: String,
    registry: Arc<ConnectionRegistry>,
    initial_kernel: Option<KernelSpec>,
    path: StdMutex<String>,
    binding: RwLock<Option<Binding>>,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(registry: Arc<ConnectionRegistry>, path: &str, kernel: Option<KernelSpec>) -> Self {
        let (status, _) = watch::channel(KernelStatus::Unknown);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            registry,
            initial_kernel: kernel,
            path: StdMutex::new(path.to_string()),
            binding: RwLock::new(None),
            shared: Arc::new(Shared {
                status,
                events,
                routes: StdMutex::new(Routes::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> String {
        self.path.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_path(&self, path: &str) {
        if let Ok(mut current) = self.path.lock() {
            *current = path.to_string();
        }
    }

    pub fn status(&self) -> KernelStatus {
        self.shared.status()
    }

    /// Watch the current status.
    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Executions dispatched on the current binding.
    pub fn execution_count(&self) -> u32 {
        self.shared.routes().execution_count
    }

    /// The kernel this session is bound to.
    pub async fn kernel(&self) -> Option<KernelSpec> {
        self.binding
            .read()
            .await
            .as_ref()
            .map(|b| b.connection.spec().clone())
    }

    pub async fn kernel_info(&self) -> Option<KernelInfo> {
        self.binding
            .read()
            .await
            .as_ref()
            .map(|b| b.connection.info().clone())
    }

    /// Bind the initial kernel: `unknown -> starting -> idle`.
    ///
    /// Does nothing once the session has left `unknown`, or when it was
    /// created without a kernel.
    pub async fn initialize(&self) -> Result<()> {
        let Some(spec) = self.initial_kernel.clone() else {
            return Ok(());
        };
        {
            let mut routes = self.shared.routes();
            if self.shared.status() != KernelStatus::Unknown {
                return Ok(());
            }
            self.shared.set_status(&mut routes, KernelStatus::Starting);
        }

        info!("[session] {} starting kernel {}", self.id, spec.id);
        let connection = match self.registry.acquire(&spec).await {
            Ok(connection) => connection,
            Err(e) => {
                let mut routes = self.shared.routes();
                self.shared.set_status(&mut routes, KernelStatus::Unknown);
                return Err(e);
            }
        };

        let previous = {
            let mut binding = self.binding.write().await;
            let previous = binding.replace(self.bind(connection));
            let mut routes = self.shared.routes();
            routes.execution_count = 0;
            self.shared.set_status(&mut routes, KernelStatus::Idle);
            previous
        };
        self.unbind(previous).await;
        Ok(())
    }

    /// Swap to a different kernel.
    ///
    /// The new connection is acquired before anything changes; if that fails
    /// the session stays on its current kernel. At the swap, executions still
    /// running on the old kernel resolve as aborted and the execution counter
    /// restarts from the new kernel's start.
    pub async fn change_kernel(&self, spec: &KernelSpec) -> Result<()> {
        info!("[session] {} changing kernel to {}", self.id, spec.id);
        let connection = self.registry.acquire(spec).await?;

        let previous = {
            let mut binding = self.binding.write().await;
            let previous = binding.replace(self.bind(connection));
            let mut routes = self.shared.routes();
            routes.abort_all();
            routes.execution_count = 0;
            self.shared.set_status(&mut routes, KernelStatus::Idle);
            previous
        };
        let _ = self.shared.events.send(SessionEvent::KernelChanged {
            kernel: spec.clone(),
        });

        self.unbind(previous).await;
        Ok(())
    }

    /// Release the kernel. The session ends up `dead`.
    pub async fn shutdown(&self) -> Result<()> {
        let previous = {
            let mut binding = self.binding.write().await;
            let previous = binding.take();
            let mut routes = self.shared.routes();
            routes.abort_all();
            if previous.is_some() {
                self.shared.set_status(&mut routes, KernelStatus::Dead);
            }
            previous
        };
        self.unbind(previous).await;
        Ok(())
    }

    pub async fn interrupt(&self) -> Result<()> {
        let binding = self.binding.read().await;
        let binding = binding.as_ref().ok_or(NotebookError::NotReady {
            status: self.status(),
        })?;
        {
            let mut routes = self.shared.routes();
            if self.shared.status() == KernelStatus::Busy {
                self.shared.set_status(&mut routes, KernelStatus::Interrupted);
            }
        }
        binding.connection.interrupt().await
    }

    /// Restart the kernel process. The execution counter keeps counting.
    pub async fn restart(&self) -> Result<()> {
        let binding = self.binding.read().await;
        let binding = binding.as_ref().ok_or(NotebookError::NotReady {
            status: self.status(),
        })?;
        info!("[session] {} restarting {}", self.id, binding.connection.id());
        binding.connection.restart().await
    }

    /// Send code to the kernel.
    ///
    /// Requires `idle`: the session moves to `busy` atomically with the check,
    /// and back to `idle` when this execution finishes. The counter only
    /// advances once the kernel has the request.
    pub(crate) async fn dispatch(&self, code: &str) -> Result<Dispatched> {
        let binding = self.binding.read().await;
        let Some(binding) = binding.as_ref() else {
            return Err(NotebookError::NotReady {
                status: self.status(),
            });
        };

        let msg_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.shared.routes();
            let status = self.shared.status();
            if status != KernelStatus::Idle || !routes.executions.is_empty() {
                return Err(NotebookError::NotReady { status });
            }
            routes.executions.insert(msg_id.clone(), tx);
            self.shared.set_status(&mut routes, KernelStatus::Busy);
        }

        if let Err(e) = binding.connection.execute(&msg_id, code).await {
            warn!("[session] execute_request {} failed: {}", msg_id, e);
            let mut routes = self.shared.routes();
            routes.executions.remove(&msg_id);
            let status = match e {
                NotebookError::TransportDisconnected => KernelStatus::Disconnected,
                _ => KernelStatus::Idle,
            };
            // The router may already have moved the status on
            if self.shared.status() == KernelStatus::Busy {
                self.shared.set_status(&mut routes, status);
            }
            return Err(e);
        }

        let execution_count = {
            let mut routes = self.shared.routes();
            routes.execution_count += 1;
            routes.execution_count
        };
        debug!(
            "[session] Dispatched {} as execution {}",
            msg_id, execution_count
        );

        Ok(Dispatched {
            msg_id,
            execution_count,
            events: rx,
        })
    }

    /// Ask the kernel for completions at `cursor_pos`.
    ///
    /// Waits for the reply without a deadline; callers bound the wait.
    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Result<CompletionReply> {
        let (_pending, rx) = {
            let binding = self.binding.read().await;
            let status = self.status();
            let binding = match binding.as_ref() {
                Some(b) if !status.is_unavailable() => b,
                _ => return Err(NotebookError::NotReady { status }),
            };

            let msg_id = Uuid::new_v4().to_string();
            let rx = self.shared.routes().register_completion(msg_id.clone());
            let pending = PendingCompletion {
                shared: self.shared.clone(),
                msg_id,
            };

            binding
                .connection
                .complete(&pending.msg_id, code, cursor_pos)
                .await?;
            (pending, rx)
        };

        rx.await.map_err(|_| NotebookError::ChannelClosed)
    }

    fn bind(&self, connection: Arc<KernelConnection>) -> Binding {
        let events = connection.subscribe();
        let router = tokio::spawn(route_events(
            events,
            self.shared.clone(),
            connection.id().to_string(),
        ));
        Binding { connection, router }
    }

    async fn unbind(&self, previous: Option<Binding>) {
        if let Some(old) = previous {
            old.router.abort();
            if let Err(e) = self.registry.release(old.connection.id()).await {
                warn!(
                    "[session] Failed to release {}: {}",
                    old.connection.id(),
                    e
                );
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(binding) = self.binding.try_write() {
            if let Some(binding) = binding.as_ref() {
                binding.router.abort();
            }
        }
    }
}

/// Route one connection's events to the requests waiting on them.
async fn route_events(
    mut events: broadcast::Receiver<KernelEvent>,
    shared: Arc<Shared>,
    kernel_id: String,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[session] Router for {} lagged {} events", kernel_id, n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                error!("[session] Event stream for {} closed", kernel_id);
                let mut routes = shared.routes();
                routes.abort_all();
                shared.set_status(&mut routes, KernelStatus::Dead);
                return;
            }
        };

        let mut routes = shared.routes();
        match event {
            KernelEvent::Status {
                state,
                parent_msg_id: Some(parent),
            } => {
                if state != KernelStatus::Idle {
                    continue;
                }
                // Idle for our request: the execution is complete
                if let Some(tx) = routes.executions.remove(&parent) {
                    let _ = tx.send(ExecutionEvent::Finished);
                    if routes.executions.is_empty()
                        && matches!(
                            shared.status(),
                            KernelStatus::Busy | KernelStatus::Interrupted
                        )
                    {
                        shared.set_status(&mut routes, KernelStatus::Idle);
                    }
                }
            }
            KernelEvent::Status {
                state,
                parent_msg_id: None,
            } => match state {
                KernelStatus::Restarting | KernelStatus::Dead => {
                    routes.abort_all();
                    shared.set_status(&mut routes, state);
                }
                KernelStatus::Idle | KernelStatus::Starting => {
                    shared.set_status(&mut routes, state);
                }
                other => debug!("[session] Ignoring lifecycle status {}", other),
            },
            KernelEvent::ExecuteInput {
                parent_msg_id,
                execution_count,
            } => {
                debug!(
                    "[session] Kernel accepted {} as In[{}]",
                    parent_msg_id, execution_count
                );
            }
            KernelEvent::Output {
                parent_msg_id,
                output,
            } => match routes.executions.get(&parent_msg_id) {
                Some(tx) => {
                    let _ = tx.send(ExecutionEvent::Output(output));
                }
                None => debug!(
                    "[session] Dropping {} output for {}",
                    output.output_type(),
                    parent_msg_id
                ),
            },
            KernelEvent::CompleteReply {
                parent_msg_id,
                matches,
                cursor_start,
                cursor_end,
            } => {
                let reply = CompletionReply {
                    matches,
                    cursor_start,
                    cursor_end,
                };
                if !routes.resolve_completion(&parent_msg_id, reply) {
                    debug!("[session] No request waiting on completion {}", parent_msg_id);
                }
            }
            KernelEvent::Disconnected => {
                warn!("[session] Transport to {} dropped", kernel_id);
                routes.abort_all();
                shared.set_status(&mut routes, KernelStatus::Disconnected);
            }
            KernelEvent::Reconnected => {
                info!("[session] Transport to {} restored", kernel_id);
                shared.set_status(&mut routes, KernelStatus::Idle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedConfig;
    use crate::testing::InMemoryLauncher;
    use futures::FutureExt;
    use std::time::Duration;

    fn session(launcher: Arc<InMemoryLauncher>, kernel: Option<&str>) -> Session {
        let registry = Arc::new(ConnectionRegistry::new(launcher, EmbedConfig::default()));
        Session::new(registry, "test.ipynb", kernel.map(KernelSpec::new))
    }

    async fn finish(dispatched: &mut Dispatched) -> Vec<ExecutionEvent> {
        let mut seen = Vec::new();
        while let Some(event) = dispatched.events.recv().await {
            let done = !matches!(event, ExecutionEvent::Output(_));
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_initialize_transitions() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        let mut events = session.subscribe();
        assert_eq!(session.status(), KernelStatus::Unknown);

        session.initialize().await.unwrap();
        assert_eq!(session.status(), KernelStatus::Idle);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StatusChanged {
                from: KernelStatus::Unknown,
                to: KernelStatus::Starting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StatusChanged {
                from: KernelStatus::Starting,
                to: KernelStatus::Idle
            }
        );

        // Second call is a no-op
        session.initialize().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initialize_failure_returns_to_unknown() {
        let launcher = Arc::new(InMemoryLauncher::new());
        launcher.fail_kernel("broken");
        let session = session(launcher, Some("broken"));
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, NotebookError::KernelStart { .. }));
        assert_eq!(session.status(), KernelStatus::Unknown);
    }

    #[tokio::test]
    async fn test_dispatch_requires_kernel() {
        let session = session(Arc::new(InMemoryLauncher::new()), None);
        session.initialize().await.unwrap();
        let err = session.dispatch("1").await.err().unwrap();
        assert!(matches!(
            err,
            NotebookError::NotReady {
                status: KernelStatus::Unknown
            }
        ));
        assert_eq!(session.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_routes_outputs_and_returns_to_idle() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();

        let mut dispatched = session.dispatch("print(1)\n2").await.unwrap();
        assert_eq!(dispatched.execution_count, 1);
        let events = finish(&mut dispatched).await;
        assert_eq!(
            events,
            vec![
                ExecutionEvent::Output(OutputRecord::stream("stdout", "1\n")),
                ExecutionEvent::Output(OutputRecord::plain_result(Some(1), "2")),
                ExecutionEvent::Finished,
            ]
        );
        assert_eq!(session.status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_busy_session_rejects_dispatch() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();

        let mut first = session.dispatch("sleep(100)").await.unwrap();
        let err = session.dispatch("1").await.err().unwrap();
        assert!(matches!(
            err,
            NotebookError::NotReady {
                status: KernelStatus::Busy
            }
        ));
        assert_eq!(session.execution_count(), 1);
        finish(&mut first).await;
        assert_eq!(session.dispatch("1").await.unwrap().execution_count, 2);
    }

    #[tokio::test]
    async fn test_interrupt_goes_through_interrupted() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();
        let mut watch = session.watch_status();

        let mut dispatched = session.dispatch("input()").await.unwrap();
        // Let the kernel pick the request up
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.interrupt().await.unwrap();
        assert_eq!(session.status(), KernelStatus::Interrupted);

        let events = finish(&mut dispatched).await;
        assert!(matches!(
            &events[0],
            ExecutionEvent::Output(OutputRecord::Error { ename, .. }) if ename == "KeyboardInterrupt"
        ));
        watch
            .wait_for(|s| *s == KernelStatus::Idle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_preserves_counter() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();
        let mut dispatched = session.dispatch("1").await.unwrap();
        finish(&mut dispatched).await;

        let mut events = session.subscribe();
        session.restart().await.unwrap();
        loop {
            if let SessionEvent::StatusChanged {
                from: KernelStatus::Restarting,
                to: KernelStatus::Idle,
            } = events.recv().await.unwrap()
            {
                break;
            }
        }

        let mut dispatched = session.dispatch("1").await.unwrap();
        assert_eq!(dispatched.execution_count, 2);
        finish(&mut dispatched).await;
    }

    #[tokio::test]
    async fn test_change_kernel_aborts_in_flight() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let session = session(launcher.clone(), Some("memory"));
        session.initialize().await.unwrap();
        let mut events = session.subscribe();

        let mut dispatched = session.dispatch("input()").await.unwrap();
        session
            .change_kernel(&KernelSpec::new("memory").with_id("other"))
            .await
            .unwrap();

        assert_eq!(finish(&mut dispatched).await, vec![ExecutionEvent::Aborted]);
        assert_eq!(session.status(), KernelStatus::Idle);
        assert_eq!(session.execution_count(), 0);
        assert_eq!(session.kernel().await.unwrap().id, "other");
        assert!(launcher.kernel("memory").unwrap().is_dead());

        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            saw_change |= matches!(event, SessionEvent::KernelChanged { .. });
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn test_failed_change_keeps_current_kernel() {
        let launcher = Arc::new(InMemoryLauncher::new());
        launcher.fail_kernel("broken");
        let session = session(launcher, Some("memory"));
        session.initialize().await.unwrap();

        assert!(session
            .change_kernel(&KernelSpec::new("broken"))
            .await
            .is_err());
        assert_eq!(session.kernel().await.unwrap().id, "memory");
        assert_eq!(session.status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_and_reconnect_restores() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let session = session(launcher.clone(), Some("memory"));
        session.initialize().await.unwrap();
        let mut watch = session.watch_status();

        let mut dispatched = session.dispatch("input()").await.unwrap();
        launcher.kernel("memory").unwrap().simulate_disconnect();

        assert_eq!(finish(&mut dispatched).await, vec![ExecutionEvent::Aborted]);
        // The registry supervisor reconnects and the session goes idle again
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|s| *s == KernelStatus::Idle),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_complete_routes_reply() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();
        let reply = session.complete("x = pr", 6).await.unwrap();
        assert_eq!(reply.matches, vec!["print".to_string()]);
        assert_eq!((reply.cursor_start, reply.cursor_end), (4, 6));
    }

    #[test]
    fn test_completion_reply_drops_earlier_requests() {
        let mut routes = Routes::default();
        let mut timed_out = routes.register_completion("first".into());
        let answered = routes.register_completion("second".into());
        let later = routes.register_completion("third".into());

        let reply = CompletionReply {
            matches: vec!["print".into()],
            cursor_start: 0,
            cursor_end: 2,
        };
        assert!(routes.resolve_completion("second", reply.clone()));
        assert!(!routes.resolve_completion("second", reply.clone()));

        assert!(timed_out.try_recv().is_err());
        assert_eq!(answered.blocking_recv().unwrap(), reply);
        assert_eq!(routes.completions.len(), 1);
        assert!(routes.completions.contains_key("third"));

        drop(later);
        let _ = routes.register_completion("fourth".into());
        assert!(routes.resolve_completion("fourth", reply));
        assert!(routes.completions.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_complete_unregisters() {
        let session = session(Arc::new(InMemoryLauncher::new()), Some("memory"));
        session.initialize().await.unwrap();

        // Polled once and dropped before the router gets to the reply
        assert!(session.complete("pr", 2).now_or_never().is_none());
        assert!(session.shared.routes().completions.is_empty());

        let reply = session.complete("x = pr", 6).await.unwrap();
        assert_eq!(reply.matches, vec!["print".to_string()]);
        assert!(session.shared.routes().completions.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let session = session(launcher.clone(), Some("memory"));
        session.initialize().await.unwrap();
        session.shutdown().await.unwrap();
        assert_eq!(session.status(), KernelStatus::Dead);
        assert!(session.kernel().await.is_none());
        assert!(launcher.kernel("memory").unwrap().is_dead());
    }
}
