//! Observable state shared between orchestrators and the host UI.
//!
//! One `Store` per host application, passed around as `Arc<Store>`. Each
//! orchestrator publishes a [`NotebookView`] under its id; every write is
//! broadcast as a [`StoreEvent`] before the write call returns. Commands
//! travel the other way through [`Store::dispatch`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::document::{Cell, CellType, NotebookDocument};
use crate::error::{NotebookError, Result};
use crate::execution_queue::ExecutionQueueState;
use crate::kernel::{KernelSpec, KernelStatus};
use crate::orchestrator::{Command, OrchestratorState};
use crate::output::OutputRecord;
use crate::transactor::Selection;

const STORE_EVENT_CAPACITY: usize = 256;

/// What the UI renders for one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellView {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    pub execution_count: Option<u32>,
    pub outputs: Vec<OutputRecord>,
    pub rendered: bool,
}

impl From<&Cell> for CellView {
    fn from(cell: &Cell) -> Self {
        Self {
            id: cell.id.clone(),
            cell_type: cell.cell_type,
            source: cell.source.clone(),
            execution_count: cell.execution_count,
            outputs: cell.outputs.clone(),
            rendered: cell.rendered,
        }
    }
}

/// Everything the store knows about one orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotebookView {
    pub status: KernelStatus,
    pub state: OrchestratorState,
    pub kernel: Option<KernelSpec>,
    pub active_cell: usize,
    pub selected: Vec<String>,
    pub cells: Vec<CellView>,
    pub queue: ExecutionQueueState,
    pub dirty: bool,
    pub saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_command: Option<Command>,
}

impl NotebookView {
    pub(crate) fn new(doc: &NotebookDocument, kernel: Option<KernelSpec>) -> Self {
        Self {
            status: KernelStatus::Unknown,
            state: OrchestratorState::Unbound,
            kernel,
            active_cell: 0,
            selected: Vec::new(),
            cells: doc.cells().iter().map(CellView::from).collect(),
            queue: ExecutionQueueState::default(),
            dirty: doc.is_dirty(),
            saved_at: None,
            last_error: None,
            last_command: None,
        }
    }

    pub fn active(&self) -> Option<&CellView> {
        self.cells.get(self.active_cell)
    }

    pub fn cell(&self, cell_id: &str) -> Option<&CellView> {
        self.cells.iter().find(|c| c.id == cell_id)
    }
}

/// Change notifications, one per store write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    Registered {
        id: String,
    },
    CommandRecorded {
        id: String,
        command: Command,
    },
    StatusChanged {
        id: String,
        status: KernelStatus,
    },
    StateChanged {
        id: String,
        state: OrchestratorState,
    },
    KernelChanged {
        id: String,
        kernel: KernelSpec,
    },
    SelectionChanged {
        id: String,
        active_cell: usize,
        selected: Vec<String>,
    },
    CellsChanged {
        id: String,
        dirty: bool,
    },
    QueueChanged {
        id: String,
        queue: ExecutionQueueState,
    },
    Saved {
        id: String,
        at: DateTime<Utc>,
    },
    Error {
        id: String,
        message: String,
    },
    Removed {
        id: String,
    },
}

impl StoreEvent {
    /// The orchestrator the event belongs to.
    pub fn id(&self) -> &str {
        match self {
            StoreEvent::Registered { id }
            | StoreEvent::CommandRecorded { id, .. }
            | StoreEvent::StatusChanged { id, .. }
            | StoreEvent::StateChanged { id, .. }
            | StoreEvent::KernelChanged { id, .. }
            | StoreEvent::SelectionChanged { id, .. }
            | StoreEvent::CellsChanged { id, .. }
            | StoreEvent::QueueChanged { id, .. }
            | StoreEvent::Saved { id, .. }
            | StoreEvent::Error { id, .. }
            | StoreEvent::Removed { id } => id,
        }
    }
}

/// A command on its way to an orchestrator.
pub(crate) struct Envelope {
    pub command: Command,
    pub done: oneshot::Sender<Result<()>>,
}

/// Resolves once the orchestrator has handled a dispatched command.
///
/// Dropping the receipt does not cancel the command.
#[derive(Debug)]
pub struct CommandReceipt(oneshot::Receiver<Result<()>>);

impl CommandReceipt {
    /// The handler's outcome; `Disposed` if the orchestrator went away first.
    pub async fn done(self) -> Result<()> {
        self.0.await.map_err(|_| NotebookError::Disposed)?
    }
}

struct Entry {
    view: NotebookView,
    commands: Option<mpsc::UnboundedSender<Envelope>>,
}

pub struct Store {
    entries: StdMutex<HashMap<String, Entry>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            entries: StdMutex::new(HashMap::new()),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn view(&self, id: &str) -> Option<NotebookView> {
        self.entries().get(id).map(|e| e.view.clone())
    }

    /// A weak dispatch handle for orchestrator `id`.
    pub fn handle(self: &Arc<Self>, id: &str) -> OrchestratorHandle {
        OrchestratorHandle {
            id: id.to_string(),
            store: Arc::downgrade(self),
        }
    }

    /// Record `command` as the latest intent for `id` and pass it to its
    /// orchestrator.
    pub fn dispatch(&self, id: &str, command: Command) -> Result<CommandReceipt> {
        let mut entries = self.entries();
        let entry = entries.get_mut(id).ok_or(NotebookError::Disposed)?;
        let Some(commands) = entry.commands.as_ref() else {
            return Err(NotebookError::Disposed);
        };
        let (done, receipt) = oneshot::channel();
        let envelope = Envelope {
            command: command.clone(),
            done,
        };
        if commands.send(envelope).is_err() {
            entry.commands = None;
            return Err(NotebookError::Disposed);
        }
        debug!("[store] {} <- {}", id, command.name());
        entry.view.last_command = Some(command.clone());
        let _ = self.events.send(StoreEvent::CommandRecorded {
            id: id.to_string(),
            command,
        });
        Ok(CommandReceipt(receipt))
    }

    pub(crate) fn register(
        &self,
        id: &str,
        view: NotebookView,
        commands: mpsc::UnboundedSender<Envelope>,
    ) {
        let mut entries = self.entries();
        entries.insert(
            id.to_string(),
            Entry {
                view,
                commands: Some(commands),
            },
        );
        let _ = self.events.send(StoreEvent::Registered { id: id.to_string() });
    }

    /// Apply `f` to the view of `id` and broadcast the event it returns.
    ///
    /// Writes to unknown or disposed orchestrators are rejected.
    pub(crate) fn write<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NotebookView) -> StoreEvent,
    {
        let mut entries = self.entries();
        let entry = entries.get_mut(id).ok_or(NotebookError::Disposed)?;
        if entry.view.state == OrchestratorState::Disposed {
            return Err(NotebookError::Disposed);
        }
        let event = f(&mut entry.view);
        let _ = self.events.send(event);
        Ok(())
    }

    pub(crate) fn set_status(&self, id: &str, status: KernelStatus) -> Result<()> {
        self.write(id, |view| {
            view.status = status;
            StoreEvent::StatusChanged {
                id: id.to_string(),
                status,
            }
        })
    }

    pub(crate) fn set_state(&self, id: &str, state: OrchestratorState) -> Result<()> {
        self.write(id, |view| {
            view.state = state;
            StoreEvent::StateChanged {
                id: id.to_string(),
                state,
            }
        })
    }

    pub(crate) fn set_kernel(&self, id: &str, kernel: &KernelSpec) -> Result<()> {
        self.write(id, |view| {
            view.kernel = Some(kernel.clone());
            view.last_error = None;
            StoreEvent::KernelChanged {
                id: id.to_string(),
                kernel: kernel.clone(),
            }
        })
    }

    pub(crate) fn set_selection(&self, id: &str, selection: &Selection) -> Result<()> {
        let selected: Vec<String> = selection.selected_ids().map(str::to_string).collect();
        self.write(id, |view| {
            view.active_cell = selection.active();
            view.selected = selected.clone();
            StoreEvent::SelectionChanged {
                id: id.to_string(),
                active_cell: selection.active(),
                selected,
            }
        })
    }

    pub(crate) fn set_cells(&self, id: &str, doc: &NotebookDocument) -> Result<()> {
        self.write(id, |view| {
            view.cells = doc.cells().iter().map(CellView::from).collect();
            view.dirty = doc.is_dirty();
            StoreEvent::CellsChanged {
                id: id.to_string(),
                dirty: view.dirty,
            }
        })
    }

    pub(crate) fn set_queue(&self, id: &str, queue: ExecutionQueueState) -> Result<()> {
        self.write(id, |view| {
            view.queue = queue.clone();
            StoreEvent::QueueChanged {
                id: id.to_string(),
                queue,
            }
        })
    }

    pub(crate) fn set_saved(&self, id: &str, at: DateTime<Utc>, dirty: bool) -> Result<()> {
        self.write(id, |view| {
            view.saved_at = Some(at);
            view.dirty = dirty;
            StoreEvent::Saved {
                id: id.to_string(),
                at,
            }
        })
    }

    pub(crate) fn set_error(&self, id: &str, message: &str) -> Result<()> {
        self.write(id, |view| {
            view.last_error = Some(message.to_string());
            StoreEvent::Error {
                id: id.to_string(),
                message: message.to_string(),
            }
        })
    }

    /// Final write for `id`: the view moves to `disposed`, commands stop
    /// being accepted, and later writes are rejected.
    pub(crate) fn dispose(&self, id: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.commands = None;
        if entry.view.state == OrchestratorState::Disposed {
            return;
        }
        entry.view.state = OrchestratorState::Disposed;
        let _ = self.events.send(StoreEvent::StateChanged {
            id: id.to_string(),
            state: OrchestratorState::Disposed,
        });
    }

    /// Forget a disposed orchestrator's view.
    pub fn remove(&self, id: &str) -> Option<NotebookView> {
        let mut entries = self.entries();
        match entries.get(id).map(|e| e.view.state) {
            Some(OrchestratorState::Disposed) => {}
            Some(state) => {
                warn!("[store] Refusing to remove {} while {}", id, state);
                return None;
            }
            None => return None,
        }
        let removed = entries.remove(id).map(|e| e.view);
        let _ = self.events.send(StoreEvent::Removed { id: id.to_string() });
        removed
    }
}

/// The UI's way back to an orchestrator: its id plus a weak store reference.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    id: String,
    store: Weak<Store>,
}

impl OrchestratorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dispatch(&self, command: Command) -> Result<CommandReceipt> {
        let store = self.store.upgrade().ok_or(NotebookError::Disposed)?;
        store.dispatch(&self.id, command)
    }

    pub fn view(&self) -> Option<NotebookView> {
        self.store.upgrade()?.view(&self.id)
    }

    pub fn is_live(&self) -> bool {
        self.view()
            .is_some_and(|v| v.state != OrchestratorState::Disposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(store: &Store, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        store.register(id, NotebookView::new(&NotebookDocument::new(), None), tx);
        rx
    }

    #[test]
    fn test_dispatch_unknown_id_is_disposed() {
        let store = Store::new();
        assert!(matches!(
            store.dispatch("nope", Command::Run),
            Err(NotebookError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_records_and_routes() {
        let store = Store::new();
        let mut events = store.subscribe();
        let mut rx = registered(&store, "nb");

        let receipt = store
            .dispatch("nb", Command::InsertBelow(CellType::Markdown))
            .unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.command, Command::InsertBelow(CellType::Markdown));
        envelope.done.send(Ok(())).unwrap();
        receipt.done().await.unwrap();
        assert_eq!(
            store.view("nb").unwrap().last_command,
            Some(Command::InsertBelow(CellType::Markdown))
        );
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Registered { id: "nb".into() });
        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::CommandRecorded { .. }
        ));
    }

    #[test]
    fn test_writes_rejected_after_dispose() {
        let store = Store::new();
        let _rx = registered(&store, "nb");
        store.set_status("nb", KernelStatus::Idle).unwrap();

        store.dispose("nb");
        let mut events = store.subscribe();
        assert!(store.set_status("nb", KernelStatus::Busy).is_err());
        assert!(store.dispatch("nb", Command::Run).is_err());
        assert!(events.try_recv().is_err());

        let view = store.view("nb").unwrap();
        assert_eq!(view.status, KernelStatus::Idle);
        assert_eq!(view.state, OrchestratorState::Disposed);
    }

    #[test]
    fn test_dropped_receiver_is_disposed() {
        let store = Store::new();
        drop(registered(&store, "nb"));
        assert!(matches!(
            store.dispatch("nb", Command::Save),
            Err(NotebookError::Disposed)
        ));
    }

    #[test]
    fn test_handle_does_not_keep_store_alive() {
        let store = Arc::new(Store::new());
        let _rx = registered(&store, "nb");
        let handle = store.handle("nb");
        assert!(handle.is_live());
        handle.dispatch(Command::Interrupt).unwrap();

        drop(store);
        assert!(!handle.is_live());
        assert!(matches!(
            handle.dispatch(Command::Interrupt),
            Err(NotebookError::Disposed)
        ));
    }

    #[test]
    fn test_remove_only_after_dispose() {
        let store = Store::new();
        let _rx = registered(&store, "nb");
        assert!(store.remove("nb").is_none());
        store.dispose("nb");
        assert!(store.remove("nb").is_some());
        assert!(store.ids().is_empty());
    }
}
