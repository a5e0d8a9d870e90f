//! notebook-embed - Kernel sessions, execution and cell mutations for notebooks
//! embedded in a host application.
//!
//! The crate coordinates three things that change concurrently: the kernel
//! behind a notebook, the notebook document, and the host UI watching both.
//! A shared [`ConnectionRegistry`] owns kernel connections; each document gets
//! an [`Orchestrator`] holding its [`Session`], and every change the
//! orchestrator makes is published into an injected [`Store`].
//!
//! Kernels sit behind the [`KernelChannel`] trait. [`LocalKernelLauncher`]
//! starts real Jupyter kernels over ZeroMQ; [`testing::InMemoryLauncher`]
//! provides a deterministic in-process kernel.

pub mod completion;
pub mod config;
pub mod document;
pub mod error;
pub mod execution;
pub mod execution_queue;
pub mod kernel;
pub mod local;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod session;
pub mod store;
pub mod testing;
pub mod transactor;

pub use completion::{
    CompletionItem, CompletionProvider, CompletionReconciliator, CompletionRequest,
    CompletionResponse, KernelCompletionProvider, DEFAULT_COMPLETION_TIMEOUT,
};
pub use config::{load_config, EmbedConfig};
pub use document::{Cell, CellType, NotebookDocument};
pub use error::{NotebookError, Result};
pub use execution::{ExecutionAdapter, ExecutionDelta, ExecutionMode, ExecutionStream};
pub use kernel::{
    KernelChannel, KernelConnection, KernelEvent, KernelInfo, KernelLauncher, KernelSpec,
    KernelStatus, KernelspecInfo,
};
pub use local::LocalKernelLauncher;
pub use orchestrator::{
    Command, FileSink, NotebookSink, Orchestrator, OrchestratorState, COMMAND_SET_VERSION,
};
pub use output::{ExecutionResult, ExecutionStatus, OutputRecord};
pub use registry::ConnectionRegistry;
pub use session::{Session, SessionEvent};
pub use store::{CommandReceipt, NotebookView, OrchestratorHandle, Store, StoreEvent};
pub use transactor::Selection;
