//! Submitting code and streaming back what it produced.

use std::sync::{Arc, Mutex as StdMutex};

use log::debug;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::output::{ExecutionResult, ExecutionStatus, OutputRecord};
use crate::session::{Dispatched, ExecutionEvent, Session};

/// How an adapter treats outputs from earlier submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Each submission replaces the displayed outputs (notebook cells)
    #[default]
    Cell,
    /// Outputs accumulate across submissions (consoles)
    Console,
}

/// One step of an execution, in the order the kernel produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionDelta {
    /// The kernel accepted the code under this count
    Started { execution_count: u32 },
    Output(OutputRecord),
    /// Terminal: no more deltas follow
    Completed(ExecutionResult),
}

/// Streams an execution's outputs into a display area.
pub struct ExecutionAdapter {
    session: Arc<Session>,
    mode: ExecutionMode,
    displayed: Arc<StdMutex<Vec<OutputRecord>>>,
}

impl ExecutionAdapter {
    pub fn new(session: Arc<Session>) -> Self {
        Self::with_mode(session, ExecutionMode::Cell)
    }

    /// An adapter whose outputs accumulate across submissions.
    pub fn console(session: Arc<Session>) -> Self {
        Self::with_mode(session, ExecutionMode::Console)
    }

    pub fn with_mode(session: Arc<Session>, mode: ExecutionMode) -> Self {
        Self {
            session,
            mode,
            displayed: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Outputs currently displayed.
    pub fn outputs(&self) -> Vec<OutputRecord> {
        self.displayed.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut displayed) = self.displayed.lock() {
            displayed.clear();
        }
    }

    /// Submit `source` to the kernel.
    ///
    /// Fails with `NotReady` unless the session is idle; a rejected
    /// submission leaves both the counter and the displayed outputs alone.
    pub async fn execute(&self, source: &str) -> Result<ExecutionStream> {
        let dispatched = self.session.dispatch(source).await?;
        if self.mode == ExecutionMode::Cell {
            self.clear();
        }
        Ok(ExecutionStream::new(dispatched, self.displayed.clone()))
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.session.interrupt().await
    }
}

/// The deltas of one execution.
pub struct ExecutionStream {
    msg_id: String,
    execution_count: u32,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    displayed: Arc<StdMutex<Vec<OutputRecord>>>,
    outputs: Vec<OutputRecord>,
    started: bool,
    done: bool,
}

impl ExecutionStream {
    fn new(dispatched: Dispatched, displayed: Arc<StdMutex<Vec<OutputRecord>>>) -> Self {
        Self {
            msg_id: dispatched.msg_id,
            execution_count: dispatched.execution_count,
            events: dispatched.events,
            displayed,
            outputs: Vec::new(),
            started: false,
            done: false,
        }
    }

    /// The request id the kernel tags this execution's messages with.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    /// Next delta, or `None` after `Completed`.
    pub async fn recv(&mut self) -> Option<ExecutionDelta> {
        if !self.started {
            self.started = true;
            return Some(ExecutionDelta::Started {
                execution_count: self.execution_count,
            });
        }
        if self.done {
            return None;
        }

        match self.events.recv().await {
            Some(ExecutionEvent::Output(output)) => {
                let output = self.stamp(output);
                self.outputs.push(output.clone());
                if let Ok(mut displayed) = self.displayed.lock() {
                    displayed.push(output.clone());
                }
                Some(ExecutionDelta::Output(output))
            }
            Some(ExecutionEvent::Finished) => {
                let status = if self.outputs.iter().any(OutputRecord::is_error) {
                    ExecutionStatus::Error
                } else {
                    ExecutionStatus::Ok
                };
                Some(self.complete(status))
            }
            Some(ExecutionEvent::Aborted) | None => {
                debug!("[execution] {} aborted", self.msg_id);
                Some(self.complete(ExecutionStatus::Aborted))
            }
        }
    }

    /// Drain the stream into its final result.
    pub async fn collect(mut self) -> ExecutionResult {
        while let Some(delta) = self.recv().await {
            if let ExecutionDelta::Completed(result) = delta {
                return result;
            }
        }
        self.result(ExecutionStatus::Aborted)
    }

    fn complete(&mut self, status: ExecutionStatus) -> ExecutionDelta {
        self.done = true;
        ExecutionDelta::Completed(self.result(status))
    }

    fn result(&self, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            execution_count: Some(self.execution_count),
            outputs: self.outputs.clone(),
            status,
        }
    }

    /// Results carry the session's count, not the kernel's.
    fn stamp(&self, output: OutputRecord) -> OutputRecord {
        match output {
            OutputRecord::ExecuteResult { data, metadata, .. } => OutputRecord::ExecuteResult {
                execution_count: Some(self.execution_count),
                data,
                metadata,
            },
            other => other,
        }
    }
}
