//! Kernel connections and the transport seam.
//!
//! The coordination core never touches the wire protocol. It talks to a
//! kernel through [`KernelChannel`]: requests go out with a caller-chosen
//! `msg_id`, and everything the kernel sends back arrives as a
//! [`KernelEvent`] on a single broadcast channel per connection, tagged with
//! the `msg_id` of the request it answers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::output::OutputRecord;

/// Capacity of each connection's event broadcast.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A request for a kernel, keyed by a logical identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Logical identifier the registry shares connections by
    pub id: String,
    /// Kernelspec name to launch (e.g. "python3")
    pub name: String,
}

impl KernelSpec {
    /// A spec whose logical id is the kernelspec name itself.
    pub fn new(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
        }
    }

    /// Use a distinct logical id, so two documents can hold separate kernels
    /// of the same kind.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// Language/runtime metadata negotiated during the kernel_info handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub language: String,
    pub implementation: String,
    pub protocol_version: String,
    pub banner: String,
}

/// A kernelspec the launcher is able to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelspecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

/// Kernel / session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Nothing is known yet (no kernel bound)
    Unknown,
    /// Kernel is starting up
    Starting,
    /// Kernel is ready and idle
    Idle,
    /// Kernel is executing code
    Busy,
    /// Kernel is restarting
    Restarting,
    /// An interrupt was sent and has not been acknowledged yet
    Interrupted,
    /// The transport dropped; the registry may reconnect it
    Disconnected,
    /// Kernel is gone for good
    Dead,
}

impl KernelStatus {
    /// Terminal or transport-level states in which no execution can start.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KernelStatus::Dead | KernelStatus::Disconnected)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Interrupted => write!(f, "interrupted"),
            KernelStatus::Disconnected => write!(f, "disconnected"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Something the kernel (or the transport) reported.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// Execution-state change. `parent_msg_id` is the request that caused it,
    /// `None` for lifecycle changes (starting, restarting, dead).
    Status {
        state: KernelStatus,
        parent_msg_id: Option<String>,
    },
    /// The kernel accepted an execute request and assigned it a count.
    ExecuteInput {
        parent_msg_id: String,
        execution_count: u32,
    },
    /// An output produced by an execute request.
    Output {
        parent_msg_id: String,
        output: OutputRecord,
    },
    /// Reply to a complete request.
    CompleteReply {
        parent_msg_id: String,
        matches: Vec<String>,
        cursor_start: usize,
        cursor_end: usize,
    },
    /// The duplex channel dropped.
    Disconnected,
    /// The duplex channel came back after a reconnect.
    Reconnected,
}

/// Opaque duplex channel to one running kernel.
///
/// Implementations must deliver events for a given request in the order the
/// kernel produced them, and must emit [`KernelEvent::Disconnected`] when the
/// channel drops rather than going silent.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    /// Metadata from the kernel_info handshake.
    fn info(&self) -> KernelInfo;

    /// Subscribe to everything the kernel sends.
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    /// Send an execute request tagged with `msg_id`.
    async fn execute(&self, msg_id: &str, code: &str) -> Result<()>;

    /// Send a complete request tagged with `msg_id`.
    async fn complete(&self, msg_id: &str, code: &str, cursor_pos: usize) -> Result<()>;

    async fn interrupt(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    /// Re-establish a dropped transport.
    async fn reconnect(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Starts kernels for the connection registry.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel for `spec` and complete its handshake.
    async fn start(&self, spec: &KernelSpec) -> Result<Arc<dyn KernelChannel>>;

    /// Kernelspecs this launcher can start.
    async fn available(&self) -> Vec<KernelspecInfo>;
}

/// A live kernel owned by the connection registry.
pub struct KernelConnection {
    spec: KernelSpec,
    info: KernelInfo,
    channel: Arc<dyn KernelChannel>,
}

impl KernelConnection {
    pub fn new(spec: KernelSpec, channel: Arc<dyn KernelChannel>) -> Self {
        let info = channel.info();
        Self {
            spec,
            info,
            channel,
        }
    }

    /// The logical identifier this connection is registered under.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn info(&self) -> &KernelInfo {
        &self.info
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.channel.subscribe()
    }

    pub async fn execute(&self, msg_id: &str, code: &str) -> Result<()> {
        self.channel.execute(msg_id, code).await
    }

    pub async fn complete(&self, msg_id: &str, code: &str, cursor_pos: usize) -> Result<()> {
        self.channel.complete(msg_id, code, cursor_pos).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.channel.interrupt().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.channel.restart().await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.channel.shutdown().await
    }
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("spec", &self.spec)
            .field("info", &self.info)
            .finish()
    }
}
