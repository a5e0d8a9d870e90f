//! A deterministic kernel that runs in-process.
//!
//! `InMemoryKernel` understands a tiny calculator language, enough to drive
//! every path of the coordination core without a Jupyter installation:
//!
//! - integer arithmetic with `+ - * / %` and parentheses (`1+1`)
//! - assignment (`x = 40 + 2`), with variables kept until restart
//! - `print(expr)` and `print("text")` to stdout
//! - `raise Name("message")` to produce an error output
//! - `input()`, which blocks until interrupted
//! - `sleep(ms)`, which blocks for `ms` milliseconds or until interrupted
//!
//! The last line's value becomes the `execute_result`.
//!
//! [`MemorySink`] stands in for a file when saving.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::document::NotebookDocument;
use crate::error::{NotebookError, Result};
use crate::kernel::{
    KernelChannel, KernelEvent, KernelInfo, KernelLauncher, KernelSpec, KernelStatus,
    KernelspecInfo, EVENT_CHANNEL_CAPACITY,
};
use crate::orchestrator::NotebookSink;
use crate::output::OutputRecord;

/// Kernelspec name the in-memory launcher advertises.
pub const MEMORY_KERNEL_NAME: &str = "memory";

const BUILTINS: &[&str] = &["input", "print", "raise", "sleep"];

struct ExecuteRequest {
    msg_id: String,
    code: String,
}

#[derive(Default)]
struct KernelState {
    variables: HashMap<String, i64>,
    execution_count: u32,
    disconnected: bool,
    dead: bool,
    refuse_reconnect: bool,
}

/// In-process kernel used by tests and the CLI's `memory` kernel.
pub struct InMemoryKernel {
    name: String,
    events: broadcast::Sender<KernelEvent>,
    requests: mpsc::UnboundedSender<ExecuteRequest>,
    interrupt: Arc<Notify>,
    state: Arc<Mutex<KernelState>>,
}

impl InMemoryKernel {
    /// Create a kernel and spawn its execution worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(name: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (requests, rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(Notify::new());
        let state = Arc::new(Mutex::new(KernelState::default()));

        tokio::spawn(run_worker(
            rx,
            events.clone(),
            interrupt.clone(),
            state.clone(),
        ));

        Arc::new(Self {
            name: name.to_string(),
            events,
            requests,
            interrupt,
            state,
        })
    }

    /// Drop the transport as if the socket had gone away.
    pub fn simulate_disconnect(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnected = true;
        }
        let _ = self.events.send(KernelEvent::Disconnected);
    }

    /// Make subsequent reconnect attempts fail.
    pub fn refuse_reconnect(&self, refuse: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse_reconnect = refuse;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().map(|s| !s.disconnected).unwrap_or(false)
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().map(|s| s.dead).unwrap_or(true)
    }

    fn check_sendable(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| NotebookError::Kernel("kernel state poisoned".into()))?;
        if state.dead {
            return Err(NotebookError::Kernel(format!("{} is shut down", self.name)));
        }
        if state.disconnected {
            return Err(NotebookError::TransportDisconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl KernelChannel for InMemoryKernel {
    fn info(&self) -> KernelInfo {
        KernelInfo {
            language: "calc".to_string(),
            implementation: "in-memory".to_string(),
            protocol_version: "5.3".to_string(),
            banner: format!("in-memory kernel ({})", self.name),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn execute(&self, msg_id: &str, code: &str) -> Result<()> {
        self.check_sendable()?;
        self.requests
            .send(ExecuteRequest {
                msg_id: msg_id.to_string(),
                code: code.to_string(),
            })
            .map_err(|_| NotebookError::ChannelClosed)
    }

    async fn complete(&self, msg_id: &str, code: &str, cursor_pos: usize) -> Result<()> {
        self.check_sendable()?;

        let cursor = cursor_pos.min(code.len());
        let before = code.get(..cursor).unwrap_or(code);
        let start = before
            .rfind(|c: char| !(c.is_alphanumeric() || c == '_'))
            .map(|i| i + 1)
            .unwrap_or(0);
        let prefix = &before[start..];

        let mut matches: Vec<String> = BUILTINS.iter().map(|s| s.to_string()).collect();
        if let Ok(state) = self.state.lock() {
            matches.extend(state.variables.keys().cloned());
        }
        matches.retain(|m| !prefix.is_empty() && m.starts_with(prefix));
        matches.sort();

        let _ = self.events.send(KernelEvent::CompleteReply {
            parent_msg_id: msg_id.to_string(),
            matches,
            cursor_start: start,
            cursor_end: cursor,
        });
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.check_sendable()?;
        debug!("[memory-kernel] Interrupt {}", self.name);
        self.interrupt.notify_waiters();
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.check_sendable()?;
        info!("[memory-kernel] Restarting {}", self.name);
        let _ = self.events.send(KernelEvent::Status {
            state: KernelStatus::Restarting,
            parent_msg_id: None,
        });
        self.interrupt.notify_waiters();
        if let Ok(mut state) = self.state.lock() {
            state.variables.clear();
            state.execution_count = 0;
        }
        let _ = self.events.send(KernelEvent::Status {
            state: KernelStatus::Idle,
            parent_msg_id: None,
        });
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| NotebookError::Kernel("kernel state poisoned".into()))?;
            if state.dead {
                return Err(NotebookError::Kernel(format!("{} is shut down", self.name)));
            }
            if state.refuse_reconnect {
                return Err(NotebookError::TransportDisconnected);
            }
            state.disconnected = false;
        }
        let _ = self.events.send(KernelEvent::Reconnected);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            if state.dead {
                return Ok(());
            }
            state.dead = true;
        }
        self.interrupt.notify_waiters();
        let _ = self.events.send(KernelEvent::Status {
            state: KernelStatus::Dead,
            parent_msg_id: None,
        });
        Ok(())
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<ExecuteRequest>,
    events: broadcast::Sender<KernelEvent>,
    interrupt: Arc<Notify>,
    state: Arc<Mutex<KernelState>>,
) {
    while let Some(request) = rx.recv().await {
        let dead = state.lock().map(|s| s.dead).unwrap_or(true);
        if dead {
            break;
        }
        // Registered before anything is emitted so an interrupt sent right
        // after the caller sees execute_input is never lost.
        let interrupted = interrupt.notified();
        tokio::pin!(interrupted);

        let parent = request.msg_id.clone();
        let _ = events.send(KernelEvent::Status {
            state: KernelStatus::Busy,
            parent_msg_id: Some(parent.clone()),
        });

        let count = match state.lock() {
            Ok(mut s) => {
                s.execution_count += 1;
                s.execution_count
            }
            Err(_) => break,
        };
        let _ = events.send(KernelEvent::ExecuteInput {
            parent_msg_id: parent.clone(),
            execution_count: count,
        });

        let lines: Vec<&str> = request
            .code
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        for (i, line) in lines.iter().enumerate() {
            let is_last = i + 1 == lines.len();
            let step = match Statement::parse(line) {
                Statement::Input => {
                    (&mut interrupted).await;
                    Err(keyboard_interrupt())
                }
                Statement::Sleep(expr) => match evaluate(&expr, &state) {
                    Ok(ms) => {
                        let ms = u64::try_from(ms).unwrap_or(0);
                        tokio::select! {
                            _ = &mut interrupted => Err(keyboard_interrupt()),
                            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(None),
                        }
                    }
                    Err(e) => Err(e),
                },
                Statement::Print(arg) => {
                    let text = match string_literal(&arg) {
                        Some(s) => Ok(s.to_string()),
                        None => evaluate(&arg, &state).map(|v| v.to_string()),
                    };
                    text.map(|t| Some(OutputRecord::stream("stdout", &format!("{}\n", t))))
                }
                Statement::Raise { ename, evalue } => Err(OutputRecord::error(
                    &ename,
                    &evalue,
                    vec![format!("{}: {}", ename, evalue)],
                )),
                Statement::Assign { name, expr } => evaluate(&expr, &state).map(|value| {
                    if let Ok(mut s) = state.lock() {
                        s.variables.insert(name, value);
                    }
                    None
                }),
                Statement::Expr(expr) => evaluate(&expr, &state).map(|value| {
                    is_last.then(|| OutputRecord::plain_result(Some(count), &value.to_string()))
                }),
            };

            match step {
                Ok(Some(output)) => {
                    let _ = events.send(KernelEvent::Output {
                        parent_msg_id: parent.clone(),
                        output,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    let _ = events.send(KernelEvent::Output {
                        parent_msg_id: parent.clone(),
                        output: error,
                    });
                    break;
                }
            }
        }

        let _ = events.send(KernelEvent::Status {
            state: KernelStatus::Idle,
            parent_msg_id: Some(parent),
        });
    }
    debug!("[memory-kernel] Worker stopped");
}

fn keyboard_interrupt() -> OutputRecord {
    OutputRecord::error("KeyboardInterrupt", "", vec!["KeyboardInterrupt".into()])
}

fn string_literal(s: &str) -> Option<&str> {
    let s = s.trim();
    ['"', '\'']
        .iter()
        .find_map(|q| s.strip_prefix(*q).and_then(|rest| rest.strip_suffix(*q)))
}

enum Statement {
    Input,
    Sleep(String),
    Print(String),
    Raise { ename: String, evalue: String },
    Assign { name: String, expr: String },
    Expr(String),
}

impl Statement {
    fn parse(line: &str) -> Self {
        if line == "input()" {
            return Statement::Input;
        }
        if let Some(arg) = call_argument(line, "sleep") {
            return Statement::Sleep(arg.to_string());
        }
        if let Some(arg) = call_argument(line, "print") {
            return Statement::Print(arg.to_string());
        }
        if let Some(rest) = line.strip_prefix("raise ") {
            let rest = rest.trim();
            return match rest.split_once('(') {
                Some((name, arg)) => Statement::Raise {
                    ename: name.trim().to_string(),
                    evalue: string_literal(arg.trim_end_matches(')'))
                        .unwrap_or(arg.trim_end_matches(')'))
                        .to_string(),
                },
                None => Statement::Raise {
                    ename: rest.to_string(),
                    evalue: String::new(),
                },
            };
        }
        if let Some((lhs, rhs)) = line.split_once('=') {
            let name = lhs.trim();
            if is_identifier(name) {
                return Statement::Assign {
                    name: name.to_string(),
                    expr: rhs.trim().to_string(),
                };
            }
        }
        Statement::Expr(line.to_string())
    }
}

fn call_argument<'a>(line: &'a str, func: &str) -> Option<&'a str> {
    line.strip_prefix(func)
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn evaluate(expr: &str, state: &Mutex<KernelState>) -> std::result::Result<i64, OutputRecord> {
    let variables = state
        .lock()
        .map(|s| s.variables.clone())
        .unwrap_or_default();
    let mut parser = ExprParser {
        chars: expr.chars().collect(),
        pos: 0,
        variables: &variables,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(syntax_error(expr));
    }
    Ok(value)
}

fn syntax_error(expr: &str) -> OutputRecord {
    OutputRecord::error(
        "SyntaxError",
        "invalid syntax",
        vec![format!("  {}", expr), "SyntaxError: invalid syntax".into()],
    )
}

struct ExprParser<'a> {
    chars: Vec<char>,
    pos: usize,
    variables: &'a HashMap<String, i64>,
}

type EvalResult = std::result::Result<i64, OutputRecord>;

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn source(&self) -> String {
        self.chars.iter().collect()
    }

    fn expr(&mut self) -> EvalResult {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = match op {
                '+' => value.checked_add(rhs),
                _ => value.checked_sub(rhs),
            }
            .ok_or_else(overflow)?;
        }
        Ok(value)
    }

    fn term(&mut self) -> EvalResult {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op != '*' && rhs == 0 {
                return Err(OutputRecord::error(
                    "ZeroDivisionError",
                    "division by zero",
                    vec!["ZeroDivisionError: division by zero".into()],
                ));
            }
            value = match op {
                '*' => value.checked_mul(rhs),
                '/' => value.checked_div_euclid(rhs),
                _ => value.checked_rem_euclid(rhs),
            }
            .ok_or_else(overflow)?;
        }
        Ok(value)
    }

    fn factor(&mut self) -> EvalResult {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                self.factor()?.checked_neg().ok_or_else(overflow)
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err(syntax_error(&self.source()));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                digits.parse().map_err(|_| overflow())
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                while self
                    .chars
                    .get(self.pos)
                    .is_some_and(|c| c.is_alphanumeric() || *c == '_')
                {
                    self.pos += 1;
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.variables.get(&name).copied().ok_or_else(|| {
                    OutputRecord::error(
                        "NameError",
                        &format!("name '{}' is not defined", name),
                        vec![format!("NameError: name '{}' is not defined", name)],
                    )
                })
            }
            _ => Err(syntax_error(&self.source())),
        }
    }
}

fn overflow() -> OutputRecord {
    OutputRecord::error(
        "OverflowError",
        "integer overflow",
        vec!["OverflowError: integer overflow".into()],
    )
}

/// Launcher for [`InMemoryKernel`]s.
#[derive(Default)]
pub struct InMemoryLauncher {
    start_delay: Duration,
    failing: Mutex<HashSet<String>>,
    starts: AtomicUsize,
    kernels: Mutex<HashMap<String, Arc<InMemoryKernel>>>,
}

impl InMemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every start, so concurrent acquires overlap.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Make starts of the kernelspec `name` fail.
    pub fn fail_kernel(&self, name: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(name.to_string());
        }
    }

    /// Number of kernels started so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// The most recent kernel started for the logical id `id`.
    pub fn kernel(&self, id: &str) -> Option<Arc<InMemoryKernel>> {
        self.kernels.lock().ok()?.get(id).cloned()
    }
}

#[async_trait]
impl KernelLauncher for InMemoryLauncher {
    async fn start(&self, spec: &KernelSpec) -> Result<Arc<dyn KernelChannel>> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        let refused = self
            .failing
            .lock()
            .map(|f| f.contains(&spec.name))
            .unwrap_or(false);
        if refused {
            return Err(NotebookError::KernelStart {
                kernel: spec.name.clone(),
                message: "kernel process exited during startup".to_string(),
            });
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        let kernel = InMemoryKernel::spawn(&spec.name);
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.insert(spec.id.clone(), kernel.clone());
        }
        info!("[memory-kernel] Started {} ({})", spec.id, spec.name);
        Ok(kernel)
    }

    async fn available(&self) -> Vec<KernelspecInfo> {
        vec![KernelspecInfo {
            name: MEMORY_KERNEL_NAME.to_string(),
            display_name: "In-memory calculator".to_string(),
            language: "calc".to_string(),
        }]
    }
}

/// A [`NotebookSink`] that keeps every saved `.ipynb` in memory.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saved.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// The most recent save, parsed back.
    pub fn last(&self) -> Option<NotebookDocument> {
        let saved = self.saved.lock().ok()?;
        NotebookDocument::from_ipynb(saved.last()?).ok()
    }

    pub fn last_ipynb(&self) -> Option<String> {
        self.saved.lock().ok()?.last().cloned()
    }
}

#[async_trait]
impl NotebookSink for MemorySink {
    fn location(&self) -> String {
        String::new()
    }

    async fn save(&self, document: &NotebookDocument) -> Result<()> {
        let content = document.to_ipynb()?;
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(content);
        Ok(())
    }
}
