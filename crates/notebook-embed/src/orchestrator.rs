//! Top-level coordinator for one notebook document.
//!
//! An `Orchestrator` owns the document, its [`Session`], the active-cell
//! selection and an execution queue. Host code never touches these
//! directly: it dispatches [`Command`]s through the [`Store`] (or an
//! [`OrchestratorHandle`]) and watches [`StoreEvent`](crate::store::StoreEvent)s.
//!
//! Three tasks run per orchestrator:
//!
//! - the command task handles commands one at a time, so at most one
//!   document transaction is in flight
//! - the queue task executes queued cells in order, waiting for the kernel
//!   to become idle before each one
//! - the session task mirrors kernel status into the store
//!
//! `Run` and `RunAll` only enqueue. Running a cell that is already queued or
//! executing is coalesced into the existing entry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::completion::{
    CompletionReconciliator, CompletionRequest, CompletionResponse, KernelCompletionProvider,
};
use crate::config::EmbedConfig;
use crate::document::{CellType, NotebookDocument};
use crate::error::{NotebookError, Result};
use crate::execution::{ExecutionAdapter, ExecutionDelta, ExecutionStream};
use crate::execution_queue::{ExecutionQueue, ExecutionQueueState};
use crate::kernel::{KernelSpec, KernelStatus};
use crate::output::ExecutionStatus;
use crate::registry::ConnectionRegistry;
use crate::session::{Session, SessionEvent};
use crate::store::{CommandReceipt, Envelope, NotebookView, OrchestratorHandle, Store};
use crate::transactor::{self, Selection};

/// Bumped whenever a [`Command`] variant is added, removed or changes shape.
pub const COMMAND_SET_VERSION: u32 = 1;

/// Everything host code can ask an orchestrator to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "kebab-case")]
pub enum Command {
    /// Run the selected cells
    Run,
    RunAll,
    InsertAbove(CellType),
    InsertBelow(CellType),
    /// Delete the selected cells
    Delete,
    /// Change the type of the selected cells
    ChangeCellType(CellType),
    /// Interrupt the kernel and drop queued cells
    Interrupt,
    Save,
    /// Replace the active cell's source
    SetSource(String),
    SetActive(usize),
    /// Select from the anchor up to this index
    ExtendSelection(usize),
    Restart,
    ChangeKernel(KernelSpec),
    /// Drop queued cells, leaving the executing one alone
    ClearQueue,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run => "run",
            Command::RunAll => "run-all",
            Command::InsertAbove(_) => "insert-above",
            Command::InsertBelow(_) => "insert-below",
            Command::Delete => "delete",
            Command::ChangeCellType(_) => "change-cell-type",
            Command::Interrupt => "interrupt",
            Command::Save => "save",
            Command::SetSource(_) => "set-source",
            Command::SetActive(_) => "set-active",
            Command::ExtendSelection(_) => "extend-selection",
            Command::Restart => "restart",
            Command::ChangeKernel(_) => "change-kernel",
            Command::ClearQueue => "clear-queue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// No kernel bound yet
    Unbound,
    BoundIdle,
    /// Cells queued or executing
    BoundBusy,
    Disposed,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Unbound => write!(f, "unbound"),
            OrchestratorState::BoundIdle => write!(f, "bound_idle"),
            OrchestratorState::BoundBusy => write!(f, "bound_busy"),
            OrchestratorState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Where `Save` writes the document.
#[async_trait]
pub trait NotebookSink: Send + Sync {
    /// Path or other description of the destination, used as the session
    /// path. Empty for unsaved documents, which get `config.default_path`.
    fn location(&self) -> String;

    async fn save(&self, document: &NotebookDocument) -> Result<()>;
}

/// Saves `.ipynb` files, outputs included.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotebookSink for FileSink {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn save(&self, document: &NotebookDocument) -> Result<()> {
        let content = document.to_ipynb()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        info!("[orchestrator] Saved {}", self.path.display());
        Ok(())
    }
}

struct Inner {
    id: String,
    store: Arc<Store>,
    session: Arc<Session>,
    adapter: ExecutionAdapter,
    completion: CompletionReconciliator,
    sink: Arc<dyn NotebookSink>,
    kernel: Option<KernelSpec>,
    kernel_ready_timeout: Duration,
    document: StdMutex<NotebookDocument>,
    selection: StdMutex<Selection>,
    queue: StdMutex<ExecutionQueue>,
    queue_ready: Notify,
    state: watch::Sender<OrchestratorState>,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator for `document` and register it with `store`.
    ///
    /// The kernel is `kernel` if given, else the document's kernelspec, else
    /// `config.default_kernel`. Nothing is started until [`bind`](Self::bind).
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ConnectionRegistry>,
        config: &EmbedConfig,
        document: NotebookDocument,
        sink: Arc<dyn NotebookSink>,
        kernel: Option<KernelSpec>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let kernel = kernel
            .or_else(|| document.kernel_name().map(KernelSpec::new))
            .or_else(|| config.default_kernel.as_deref().map(KernelSpec::new));

        let location = sink.location();
        let path = if location.is_empty() {
            config.default_path.as_str()
        } else {
            location.as_str()
        };
        let session = Arc::new(Session::new(registry, path, kernel.clone()));
        let completion = CompletionReconciliator::new(config.completion_timeout());
        completion.set_providers(vec![Arc::new(KernelCompletionProvider::new(session.clone()))]);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session_events = session.subscribe();
        let (state, _) = watch::channel(OrchestratorState::Unbound);
        store.register(&id, NotebookView::new(&document, kernel.clone()), commands_tx);

        let inner = Arc::new(Inner {
            id,
            store,
            adapter: ExecutionAdapter::new(session.clone()),
            session,
            completion,
            sink,
            kernel,
            kernel_ready_timeout: config.kernel_ready_timeout(),
            document: StdMutex::new(document),
            selection: StdMutex::new(Selection::new(0)),
            queue: StdMutex::new(ExecutionQueue::new()),
            queue_ready: Notify::new(),
            state,
        });
        info!("[orchestrator] Created {}", inner.id);

        let tasks = vec![
            tokio::spawn(run_commands(inner.clone(), commands_rx)),
            tokio::spawn(run_queue(inner.clone())),
            tokio::spawn(forward_session_events(inner.clone(), session_events)),
        ];

        Self {
            inner,
            tasks: StdMutex::new(tasks),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.borrow()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Snapshot of the document.
    pub fn document(&self) -> NotebookDocument {
        self.inner.document().clone()
    }

    pub fn selection(&self) -> Selection {
        self.inner.selection().clone()
    }

    pub fn queue_state(&self) -> ExecutionQueueState {
        self.inner.queue().state()
    }

    /// Weak dispatch handle for host UI code.
    pub fn handle(&self) -> OrchestratorHandle {
        self.inner.store.handle(&self.inner.id)
    }

    /// Dispatch through the store, as the UI would.
    pub fn dispatch(&self, command: Command) -> Result<CommandReceipt> {
        self.inner.store.dispatch(&self.inner.id, command)
    }

    /// Start the document's kernel: `unbound -> bound_idle`.
    ///
    /// Without a kernel to start the orchestrator stays unbound until a
    /// `ChangeKernel` command. Start failures are recorded in the store and
    /// returned.
    pub async fn bind(&self) -> Result<OrchestratorState> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let Some(kernel) = inner.kernel.clone() else {
            debug!("[orchestrator] {} has no kernel to bind", inner.id);
            return Ok(self.state());
        };

        if let Err(e) = inner.session.initialize().await {
            error!("[orchestrator] {} failed to bind {}: {}", inner.id, kernel.id, e);
            inner.publish_error(&e.to_string());
            return Err(e);
        }
        // A ChangeKernel handled before bind leaves initialize a no-op; publish
        // what the session actually holds.
        if let Some(bound) = inner.session.kernel().await {
            inner.stored(inner.store.set_kernel(&inner.id, &bound));
            inner.mark_bound();
        }
        Ok(self.state())
    }

    /// Complete the active cell's source at `cursor`.
    pub async fn complete(&self, cursor: usize) -> CompletionResponse {
        if self.state() == OrchestratorState::Disposed {
            return CompletionResponse::empty(cursor);
        }
        let source = {
            let document = self.inner.document();
            let active = self.inner.selection().active();
            document
                .cell(active)
                .map(|c| c.source.clone())
                .unwrap_or_default()
        };
        self.inner
            .completion
            .complete(&CompletionRequest::new(&source, cursor))
            .await
    }

    /// Wait until no cells are queued or executing.
    pub async fn wait_idle(&self) -> OrchestratorState {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|s| *s != OrchestratorState::BoundBusy)
            .await
            .map(|s| *s)
            .unwrap_or(OrchestratorState::Disposed)
    }

    /// Stop every task, release the session and leave the store view
    /// `disposed`. Nothing is written to the store afterwards.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let was = inner.state.send_replace(OrchestratorState::Disposed);
        if was == OrchestratorState::Disposed {
            return;
        }
        inner.store.dispose(&inner.id);
        self.abort_tasks();
        let cancelled = inner.queue().cancel_all();
        if !cancelled.is_empty() {
            info!("[queue] Dropped {} cells on dispose", cancelled.len());
        }
        inner.completion.set_providers(Vec::new());
        if let Err(e) = inner.session.shutdown().await {
            warn!("[orchestrator] {} session shutdown failed: {}", inner.id, e);
        }
        info!("[orchestrator] Disposed {}", inner.id);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.abort_tasks();
        if self.inner.state.send_replace(OrchestratorState::Disposed) != OrchestratorState::Disposed
        {
            self.inner.store.dispose(&self.inner.id);
        }
    }
}

impl Inner {
    fn document(&self) -> MutexGuard<'_, NotebookDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, ExecutionQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state() {
            OrchestratorState::Disposed => Err(NotebookError::Disposed),
            _ => Ok(()),
        }
    }

    fn ensure_bound(&self) -> Result<()> {
        match self.state() {
            OrchestratorState::Disposed => Err(NotebookError::Disposed),
            OrchestratorState::Unbound => Err(NotebookError::NotReady {
                status: self.session.status(),
            }),
            _ => Ok(()),
        }
    }

    /// Store writes fail only once the view is disposed.
    fn stored(&self, result: Result<()>) {
        if let Err(e) = result {
            debug!("[orchestrator] {} store write dropped: {}", self.id, e);
        }
    }

    fn publish_error(&self, message: &str) {
        self.stored(self.store.set_error(&self.id, message));
    }

    fn transition<F>(&self, f: F)
    where
        F: FnOnce(OrchestratorState) -> OrchestratorState,
    {
        let mut changed = None;
        self.state.send_if_modified(|state| {
            if *state == OrchestratorState::Disposed {
                return false;
            }
            let next = f(*state);
            if next == *state {
                return false;
            }
            debug!("[orchestrator] {} {} -> {}", self.id, state, next);
            *state = next;
            changed = Some(next);
            true
        });
        if let Some(next) = changed {
            self.stored(self.store.set_state(&self.id, next));
        }
    }

    /// Publish the queue and derive busy/idle from it. Called with the
    /// queue locked so state follows queue contents in order.
    fn publish_queue(&self, queue: &ExecutionQueue) {
        self.stored(self.store.set_queue(&self.id, queue.state()));
        let busy = !queue.is_empty();
        self.transition(|state| match state {
            OrchestratorState::BoundIdle | OrchestratorState::BoundBusy if busy => {
                OrchestratorState::BoundBusy
            }
            OrchestratorState::BoundIdle | OrchestratorState::BoundBusy => {
                OrchestratorState::BoundIdle
            }
            other => other,
        });
    }

    fn mark_bound(&self) {
        let queue = self.queue();
        self.transition(|state| match state {
            OrchestratorState::Unbound => OrchestratorState::BoundIdle,
            other => other,
        });
        self.publish_queue(&queue);
    }

    /// Run a document edit with the selection, then publish both.
    fn mutate<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut NotebookDocument, &mut Selection) -> Result<T>,
    {
        let mut document = self.document();
        let mut selection = self.selection();
        let value = edit(&mut document, &mut selection)?;
        selection.clamp(document.len());
        self.stored(self.store.set_cells(&self.id, &document));
        self.stored(self.store.set_selection(&self.id, &selection));
        Ok(value)
    }

    /// Move the selection; the document itself is not touched.
    fn select<F>(&self, index: usize, update: F) -> Result<()>
    where
        F: FnOnce(&mut Selection, &NotebookDocument),
    {
        let document = self.document();
        if index >= document.len() {
            return Err(NotebookError::MutationConflict {
                index,
                len: document.len(),
            });
        }
        let mut selection = self.selection();
        update(&mut selection, &document);
        self.stored(self.store.set_selection(&self.id, &selection));
        Ok(())
    }

    /// An execution-side edit to one cell.
    fn edit_cell<F>(&self, edit: F)
    where
        F: FnOnce(&mut NotebookDocument) -> Result<()>,
    {
        let mut document = self.document();
        match edit(&mut document) {
            Ok(()) => self.stored(self.store.set_cells(&self.id, &document)),
            Err(NotebookError::CellNotFound(id)) => {
                debug!("[queue] Cell {} was removed while executing", id)
            }
            Err(e) => warn!("[queue] Failed to update cell: {}", e),
        }
    }

    fn active_cell_id(&self) -> Result<String> {
        let document = self.document();
        let active = self.selection().active();
        document
            .cell(active)
            .map(|c| c.id.clone())
            .ok_or(NotebookError::MutationConflict {
                index: active,
                len: document.len(),
            })
    }

    fn enqueue(&self, cell_ids: &[String]) -> Result<()> {
        if cell_ids.is_empty() {
            return Ok(());
        }
        self.ensure_bound()?;
        let mut queue = self.queue();
        for cell_id in cell_ids {
            if queue.enqueue(cell_id) {
                info!("[queue] Enqueue cell: {}", cell_id);
            } else {
                debug!("[queue] Cell {} already queued, coalesced", cell_id);
            }
        }
        self.publish_queue(&queue);
        drop(queue);
        self.queue_ready.notify_one();
        Ok(())
    }

    fn clear_pending(&self) {
        let mut queue = self.queue();
        let cleared = queue.clear_pending();
        if !cleared.is_empty() {
            info!("[queue] Cleared {} pending cells", cleared.len());
        }
        self.publish_queue(&queue);
    }

    /// Render markdown cells among `indices` and return the code cells to run.
    fn prepare_run(&self, indices: Option<Vec<usize>>) -> Vec<String> {
        let mut document = self.document();
        let indices = indices.unwrap_or_else(|| (0..document.len()).collect());
        let mut to_run = Vec::new();
        let mut rendered = false;
        for index in indices {
            let Some(cell) = document.cell(index) else {
                continue;
            };
            let id = cell.id.clone();
            match cell.cell_type {
                CellType::Code => to_run.push(id),
                CellType::Markdown => {
                    rendered |= transactor::set_rendered(&mut document, &id, true).is_ok();
                }
                CellType::Raw => {}
            }
        }
        if rendered {
            self.stored(self.store.set_cells(&self.id, &document));
        }
        to_run
    }

    async fn handle(&self, command: Command) -> Result<()> {
        match command {
            Command::Run => {
                let indices = {
                    let document = self.document();
                    self.selection().indices(&document)
                };
                let to_run = self.prepare_run(Some(indices));
                self.enqueue(&to_run)
            }
            Command::RunAll => {
                let to_run = self.prepare_run(None);
                self.enqueue(&to_run)
            }
            Command::InsertAbove(cell_type) => self.mutate(|document, selection| {
                let at = selection.active().min(document.len());
                transactor::insert_cell(document, at, cell_type, "")?;
                selection.set_active(at);
                Ok(())
            }),
            Command::InsertBelow(cell_type) => self.mutate(|document, selection| {
                let at = (selection.active() + 1).min(document.len());
                transactor::insert_cell(document, at, cell_type, "")?;
                selection.set_active(at);
                Ok(())
            }),
            Command::Delete => self.mutate(|document, selection| {
                transactor::delete_selected(document, selection).map(|_| ())
            }),
            Command::ChangeCellType(cell_type) => self.mutate(|document, selection| {
                transactor::change_selected_cell_type(document, selection, cell_type).map(|_| ())
            }),
            Command::SetSource(source) => {
                let cell_id = self.active_cell_id()?;
                self.mutate(|document, _| transactor::set_source(document, &cell_id, &source))
            }
            Command::SetActive(index) => self.select(index, |selection, _| {
                selection.set_active(index);
            }),
            Command::ExtendSelection(index) => self.select(index, |selection, document| {
                selection.extend(document, index);
            }),
            Command::Interrupt => {
                self.clear_pending();
                self.adapter.interrupt().await
            }
            Command::ClearQueue => {
                self.clear_pending();
                Ok(())
            }
            Command::Restart => {
                self.ensure_bound()?;
                self.clear_pending();
                self.session.restart().await
            }
            Command::ChangeKernel(kernel) => {
                self.session.change_kernel(&kernel).await?;
                self.completion
                    .set_providers(vec![Arc::new(KernelCompletionProvider::new(
                        self.session.clone(),
                    ))]);
                self.mark_bound();
                Ok(())
            }
            Command::Save => self.save().await,
        }
    }

    async fn save(&self) -> Result<()> {
        let (snapshot, requested_at) = {
            let mut document = self.document();
            let requested_at = document.request_save();
            (document.clone(), requested_at)
        };
        self.sink.save(&snapshot).await?;

        let dirty = {
            let mut document = self.document();
            // Outputs may have arrived while the sink was writing.
            if document.cells() == snapshot.cells() {
                document.mark_saved();
            }
            document.is_dirty()
        };
        self.stored(self.store.set_saved(&self.id, requested_at, dirty));
        Ok(())
    }

    /// Submit `source` once the session is idle, within the ready timeout.
    async fn dispatch_when_ready(&self, source: &str) -> Result<ExecutionStream> {
        let deadline = Instant::now() + self.kernel_ready_timeout;
        let mut status = self.session.watch_status();
        loop {
            let idle = tokio::time::timeout_at(
                deadline,
                status.wait_for(|s| *s == KernelStatus::Idle),
            )
            .await
            .map(|r| r.is_ok());
            match idle {
                Err(_) => {
                    return Err(NotebookError::NotReady {
                        status: self.session.status(),
                    })
                }
                Ok(false) => return Err(NotebookError::ChannelClosed),
                Ok(true) => {}
            }

            match self.adapter.execute(source).await {
                // Another submitter won the idle slot; its busy status is
                // already published, so the next wait_for blocks until idle.
                Err(NotebookError::NotReady { status: seen })
                    if seen != KernelStatus::Idle && Instant::now() < deadline => {}
                // Refused while reporting idle: wait for the next transition.
                Err(NotebookError::NotReady { .. }) if Instant::now() < deadline => {
                    match tokio::time::timeout_at(deadline, status.changed()).await {
                        Err(_) => {
                            return Err(NotebookError::NotReady {
                                status: self.session.status(),
                            })
                        }
                        Ok(Err(_)) => return Err(NotebookError::ChannelClosed),
                        Ok(Ok(())) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn execute_cell(&self, cell_id: &str) {
        let source = {
            let document = self.document();
            document
                .find_cell_index(cell_id)
                .and_then(|i| document.cell(i))
                .filter(|c| c.cell_type == CellType::Code)
                .map(|c| c.source.clone())
        };
        let Some(source) = source else {
            info!("[queue] Cell {} not found, skipping", cell_id);
            return;
        };

        let mut stream = match self.dispatch_when_ready(&source).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("[queue] Execution failed: cell={}, error={}", cell_id, e);
                self.clear_pending();
                self.publish_error(&e.to_string());
                return;
            }
        };
        info!(
            "[queue] Execution started: cell={}, msg_id={}",
            cell_id,
            stream.msg_id()
        );
        self.edit_cell(|document| transactor::clear_outputs(document, cell_id));

        while let Some(delta) = stream.recv().await {
            match delta {
                ExecutionDelta::Started { execution_count } => {
                    self.edit_cell(|document| {
                        transactor::set_execution_count(document, cell_id, Some(execution_count))
                    });
                }
                ExecutionDelta::Output(output) => {
                    self.edit_cell(|document| transactor::append_output(document, cell_id, output));
                }
                ExecutionDelta::Completed(result) => {
                    match result.status {
                        ExecutionStatus::Aborted => {
                            warn!("[queue] Execution aborted: cell={}", cell_id)
                        }
                        status => debug!("[queue] Execution done: cell={} ({:?})", cell_id, status),
                    }
                }
            }
        }
    }
}

async fn run_commands(inner: Arc<Inner>, mut commands: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(Envelope { command, done }) = commands.recv().await {
        if inner.ensure_live().is_err() {
            let _ = done.send(Err(NotebookError::Disposed));
            break;
        }
        debug!("[orchestrator] {} handling {}", inner.id, command.name());
        let name = command.name();
        let result = inner.handle(command).await;
        if let Err(e) = &result {
            warn!("[orchestrator] {} {} failed: {}", inner.id, name, e);
            inner.publish_error(&e.to_string());
        }
        let _ = done.send(result);
    }
    debug!("[orchestrator] {} command channel closed", inner.id);
}

async fn run_queue(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut queue = inner.queue();
            let next = queue.dequeue();
            if next.is_some() {
                inner.publish_queue(&queue);
            }
            next
        };
        let Some(cell_id) = next else {
            inner.queue_ready.notified().await;
            continue;
        };

        inner.execute_cell(&cell_id).await;

        let mut queue = inner.queue();
        queue.complete(&cell_id);
        inner.publish_queue(&queue);
    }
}

async fn forward_session_events(inner: Arc<Inner>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatusChanged { to, .. }) => {
                inner.stored(inner.store.set_status(&inner.id, to));
                if to.is_unavailable() {
                    inner.publish_error(&format!("Kernel {}", to));
                }
            }
            Ok(SessionEvent::KernelChanged { kernel }) => {
                inner.stored(inner.store.set_kernel(&inner.id, &kernel));
            }
            Err(RecvError::Lagged(n)) => {
                warn!("[orchestrator] {} missed {} session events", inner.id, n);
                inner.stored(inner.store.set_status(&inner.id, inner.session.status()));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputRecord;
    use crate::testing::{InMemoryLauncher, MemorySink};

    struct Fixture {
        store: Arc<Store>,
        sink: Arc<MemorySink>,
        orchestrator: Orchestrator,
    }

    fn fixture(document: NotebookDocument, kernel: Option<&str>) -> Fixture {
        let store = Arc::new(Store::new());
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(InMemoryLauncher::new()),
            EmbedConfig::default(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            registry,
            &EmbedConfig::default(),
            document,
            sink.clone(),
            kernel.map(KernelSpec::new),
        );
        Fixture {
            store,
            sink,
            orchestrator,
        }
    }

    fn code_cells(sources: &[&str]) -> NotebookDocument {
        NotebookDocument::with_cells(
            sources
                .iter()
                .map(|s| crate::document::Cell::code(s))
                .collect(),
        )
    }

    async fn run(orchestrator: &Orchestrator, command: Command) -> Result<()> {
        orchestrator.dispatch(command)?.done().await
    }

    #[test]
    fn test_command_serialization() {
        let json = serde_json::to_value(Command::ChangeCellType(CellType::Markdown)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"command": "change-cell-type", "arg": "markdown"})
        );
        let run: Command = serde_json::from_value(serde_json::json!({"command": "run-all"})).unwrap();
        assert_eq!(run, Command::RunAll);
        assert_eq!(run.name(), "run-all");
    }

    #[tokio::test]
    async fn test_unsaved_document_uses_default_path() {
        let f = fixture(NotebookDocument::new(), Some("memory"));
        assert_eq!(f.orchestrator.session().path(), crate::config::DEFAULT_PATH);

        let config = EmbedConfig {
            default_path: "scratch.ipynb".into(),
            ..EmbedConfig::default()
        };
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(InMemoryLauncher::new()),
            config.clone(),
        ));
        let orchestrator = Orchestrator::new(
            f.store.clone(),
            registry,
            &config,
            NotebookDocument::new(),
            Arc::new(FileSink::new("notes/analysis.ipynb")),
            None,
        );
        assert_eq!(orchestrator.session().path(), "notes/analysis.ipynb");
    }

    #[tokio::test]
    async fn test_bind_moves_to_bound_idle() {
        let f = fixture(NotebookDocument::new(), Some("memory"));
        assert_eq!(f.orchestrator.state(), OrchestratorState::Unbound);
        assert_eq!(f.orchestrator.bind().await.unwrap(), OrchestratorState::BoundIdle);

        let view = f.store.view(f.orchestrator.id()).unwrap();
        assert_eq!(view.state, OrchestratorState::BoundIdle);
        assert_eq!(view.kernel, Some(KernelSpec::new("memory")));
    }

    #[tokio::test]
    async fn test_kernel_from_document_metadata() {
        let mut document = NotebookDocument::new();
        document.metadata.insert(
            "kernelspec".into(),
            serde_json::json!({"name": "memory", "display_name": "Memory"}),
        );
        let f = fixture(document, None);
        assert_eq!(f.orchestrator.bind().await.unwrap(), OrchestratorState::BoundIdle);
    }

    #[tokio::test]
    async fn test_run_without_kernel_is_recorded() {
        let f = fixture(code_cells(&["1"]), None);
        assert_eq!(f.orchestrator.bind().await.unwrap(), OrchestratorState::Unbound);

        let err = run(&f.orchestrator, Command::Run).await.unwrap_err();
        assert!(matches!(err, NotebookError::NotReady { .. }));
        let view = f.store.view(f.orchestrator.id()).unwrap();
        assert!(view.last_error.is_some());
        assert!(!view.queue.processing);
    }

    #[tokio::test]
    async fn test_run_all_executes_in_order() {
        let f = fixture(code_cells(&["x = 20", "print(x)", "x * 2"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();

        run(&f.orchestrator, Command::RunAll).await.unwrap();
        assert_eq!(f.orchestrator.wait_idle().await, OrchestratorState::BoundIdle);

        let document = f.orchestrator.document();
        let counts: Vec<_> = document.cells().iter().map(|c| c.execution_count).collect();
        assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(document.cells()[1].outputs, vec![OutputRecord::stream("stdout", "20\n")]);
        assert_eq!(
            document.cells()[2].outputs,
            vec![OutputRecord::plain_result(Some(3), "40")]
        );

        let view = f.store.view(f.orchestrator.id()).unwrap();
        assert_eq!(view.cells[2].outputs.len(), 1);
        assert_eq!(view.status, KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_repeated_run_is_coalesced() {
        let f = fixture(code_cells(&["sleep(100)\n1"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();

        run(&f.orchestrator, Command::Run).await.unwrap();
        run(&f.orchestrator, Command::Run).await.unwrap();
        run(&f.orchestrator, Command::Run).await.unwrap();
        f.orchestrator.wait_idle().await;

        assert_eq!(f.orchestrator.session().execution_count(), 1);
        assert_eq!(f.orchestrator.document().cells()[0].execution_count, Some(1));
    }

    #[tokio::test]
    async fn test_markdown_run_renders_and_raw_is_skipped() {
        let document = NotebookDocument::with_cells(vec![
            crate::document::Cell::markdown("# Title"),
            crate::document::Cell::raw("raw"),
        ]);
        let f = fixture(document, Some("memory"));
        f.orchestrator.bind().await.unwrap();

        run(&f.orchestrator, Command::RunAll).await.unwrap();
        assert_eq!(f.orchestrator.state(), OrchestratorState::BoundIdle);
        let document = f.orchestrator.document();
        assert!(document.cells()[0].rendered);
        assert_eq!(f.orchestrator.session().execution_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_and_change_type_commands() {
        let f = fixture(code_cells(&["a"]), Some("memory"));

        run(&f.orchestrator, Command::InsertBelow(CellType::Code)).await.unwrap();
        run(&f.orchestrator, Command::SetSource("b".into())).await.unwrap();
        run(&f.orchestrator, Command::InsertAbove(CellType::Raw)).await.unwrap();
        assert_eq!(f.orchestrator.selection().active(), 1);

        run(&f.orchestrator, Command::ExtendSelection(2)).await.unwrap();
        run(&f.orchestrator, Command::ChangeCellType(CellType::Markdown))
            .await
            .unwrap();

        let document = f.orchestrator.document();
        let cells: Vec<_> = document
            .cells()
            .iter()
            .map(|c| (c.cell_type, c.source.as_str()))
            .collect();
        assert_eq!(
            cells,
            vec![
                (CellType::Code, "a"),
                (CellType::Markdown, ""),
                (CellType::Markdown, "b"),
            ]
        );
        let view = f.store.view(f.orchestrator.id()).unwrap();
        assert_eq!(view.active_cell, 2);
        assert!(view.selected.is_empty());
        assert!(view.dirty);
    }

    #[tokio::test]
    async fn test_set_active_out_of_range_is_conflict() {
        let f = fixture(code_cells(&["a"]), None);
        let err = run(&f.orchestrator, Command::SetActive(4)).await.unwrap_err();
        assert!(matches!(err, NotebookError::MutationConflict { index: 4, len: 1 }));
        assert_eq!(f.orchestrator.selection().active(), 0);
    }

    #[tokio::test]
    async fn test_save_writes_sink_and_clears_dirty() {
        let f = fixture(code_cells(&["1+1"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();
        run(&f.orchestrator, Command::Run).await.unwrap();
        f.orchestrator.wait_idle().await;

        run(&f.orchestrator, Command::Save).await.unwrap();
        let saved = f.sink.last().unwrap();
        assert_eq!(saved.cells()[0].outputs[0].text_plain().as_deref(), Some("2"));

        let view = f.store.view(f.orchestrator.id()).unwrap();
        assert!(view.saved_at.is_some());
        assert!(!view.dirty);
        assert!(!f.orchestrator.document().is_dirty());
    }

    #[tokio::test]
    async fn test_interrupt_clears_queue() {
        let f = fixture(code_cells(&["input()", "1", "2"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();
        run(&f.orchestrator, Command::RunAll).await.unwrap();

        let mut status = f.orchestrator.session().watch_status();
        status.wait_for(|s| *s == KernelStatus::Busy).await.unwrap();
        // Let the kernel pick the request up
        tokio::time::sleep(Duration::from_millis(20)).await;
        run(&f.orchestrator, Command::Interrupt).await.unwrap();
        f.orchestrator.wait_idle().await;

        let document = f.orchestrator.document();
        assert_eq!(document.cells()[0].outputs[0].output_type(), "error");
        assert_eq!(document.cells()[1].execution_count, None);
        assert_eq!(document.cells()[2].execution_count, None);
    }

    #[tokio::test]
    async fn test_complete_on_active_cell() {
        let f = fixture(code_cells(&["pr"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();
        let response = f.orchestrator.complete(2).await;
        assert_eq!(response.labels(), vec!["print"]);
        assert_eq!((response.start, response.end), (0, 2));
    }

    #[tokio::test]
    async fn test_dispose_stops_writes_and_commands() {
        let f = fixture(code_cells(&["1"]), Some("memory"));
        f.orchestrator.bind().await.unwrap();
        let handle = f.orchestrator.handle();
        let session = f.orchestrator.session().clone();

        f.orchestrator.dispose().await;
        let mut events = f.store.subscribe();

        assert!(matches!(
            handle.dispatch(Command::Run),
            Err(NotebookError::Disposed)
        ));
        assert!(!handle.is_live());
        assert_eq!(session.status(), KernelStatus::Dead);
        assert!(f.orchestrator.bind().await.is_err());
        assert!(f.orchestrator.complete(0).await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }
}
