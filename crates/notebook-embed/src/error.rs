//! Error types shared by every layer of the coordination core.
//!
//! Local, expected conditions (`NotReady`, empty completions) are absorbed at
//! component boundaries; infrastructure failures (`KernelStart`,
//! `TransportDisconnected`) travel up to the orchestrator, which records them
//! in the store instead of propagating further.

use crate::kernel::KernelStatus;

/// Error type for notebook coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    #[error("Kernel {kernel} failed to start: {message}")]
    KernelStart { kernel: String, message: String },

    #[error("Session not ready (status: {status})")]
    NotReady { status: KernelStatus },

    #[error("Kernel transport disconnected")]
    TransportDisconnected,

    #[error("Cell index {index} out of range for {len} cells")]
    MutationConflict { index: usize, len: usize },

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error("Unknown cell type: {0}")]
    UnknownCellType(String),

    #[error("Invalid notebook format: {0}")]
    Format(String),

    #[error("Kernel error: {0}")]
    Kernel(String),

    #[error("Notebook has been disposed")]
    Disposed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NotebookError>;
