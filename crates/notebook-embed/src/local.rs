//! Local Jupyter kernels over ZeroMQ.
//!
//! Launches a kernelspec found by `runtimelib`, writes a connection file to
//! the Jupyter runtime dir, and keeps a persistent shell writer plus iopub and
//! shell reader tasks. Everything the reader tasks see is translated into
//! [`KernelEvent`]s on one broadcast channel.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use jupyter_protocol::{
    CompleteRequest, ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{NotebookError, Result};
use crate::kernel::{
    KernelChannel, KernelEvent, KernelInfo, KernelLauncher, KernelSpec, KernelStatus,
    KernelspecInfo, EVENT_CHANNEL_CAPACITY,
};
use crate::output::OutputRecord;

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Launches kernelspecs installed on this machine.
#[derive(Debug, Default, Clone)]
pub struct LocalKernelLauncher;

impl LocalKernelLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KernelLauncher for LocalKernelLauncher {
    async fn start(&self, spec: &KernelSpec) -> Result<Arc<dyn KernelChannel>> {
        let kernel = LocalKernel::launch(&spec.name)
            .await
            .map_err(|e| NotebookError::KernelStart {
                kernel: spec.name.clone(),
                message: e.to_string(),
            })?;
        Ok(Arc::new(kernel))
    }

    async fn available(&self) -> Vec<KernelspecInfo> {
        runtimelib::list_kernelspecs()
            .await
            .into_iter()
            .map(|s| KernelspecInfo {
                name: s.kernel_name,
                display_name: s.kernelspec.display_name,
                language: s.kernelspec.language,
            })
            .collect()
    }
}

struct Running {
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    session_id: String,
    shell_writer: runtimelib::DealerSendConnection,
    iopub_task: JoinHandle<()>,
    shell_reader_task: JoinHandle<()>,
    _process: tokio::process::Child,
}

impl Running {
    fn stop_readers(&self) {
        self.iopub_task.abort();
        self.shell_reader_task.abort();
    }
}

/// A kernel process started from a local kernelspec.
pub struct LocalKernel {
    kernelspec_name: String,
    info: StdMutex<KernelInfo>,
    events: broadcast::Sender<KernelEvent>,
    running: Mutex<Option<Running>>,
}

struct Channels {
    session_id: String,
    shell_writer: runtimelib::DealerSendConnection,
    iopub_task: JoinHandle<()>,
    shell_reader_task: JoinHandle<()>,
    info: KernelInfo,
}

impl LocalKernel {
    /// Start the kernel process and complete the kernel_info handshake.
    pub async fn launch(kernelspec_name: &str) -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (running, info) = start_process(kernelspec_name, &events).await?;
        Ok(Self {
            kernelspec_name: kernelspec_name.to_string(),
            info: StdMutex::new(info),
            events,
            running: Mutex::new(Some(running)),
        })
    }

    async fn send_shell(&self, mut message: JupyterMessage, msg_id: &str) -> Result<()> {
        let mut guard = self.running.lock().await;
        let running = guard
            .as_mut()
            .ok_or_else(|| NotebookError::Kernel("No kernel running".into()))?;
        // Replies are routed by the caller's id, registered before this send.
        message.header.msg_id = msg_id.to_string();
        running.shell_writer.send(message).await.map_err(|e| {
            warn!("[local-kernel] shell send failed: {}", e);
            NotebookError::TransportDisconnected
        })
    }

    async fn send_control(&self, message: JupyterMessage) -> anyhow::Result<()> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or_else(|| anyhow!("No kernel running"))?;
        let mut control = runtimelib::create_client_control_connection(
            &running.connection_info,
            &running.session_id,
        )
        .await?;
        control.send(message).await?;
        Ok(())
    }

    async fn stop(&self, running: Running) {
        running.stop_readers();
        if let Ok(mut control) = runtimelib::create_client_control_connection(
            &running.connection_info,
            &running.session_id,
        )
        .await
        {
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            control.send(request).await.ok();
        }
        tokio::fs::remove_file(&running.connection_file).await.ok();
    }

    fn emit_lifecycle(&self, state: KernelStatus) {
        let _ = self.events.send(KernelEvent::Status {
            state,
            parent_msg_id: None,
        });
    }
}

async fn start_process(
    kernelspec_name: &str,
    events: &broadcast::Sender<KernelEvent>,
) -> anyhow::Result<(Running, KernelInfo)> {
    let kernelspec = runtimelib::find_kernelspec(kernelspec_name).await?;

    let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(ip, 5).await?;

    let connection_info = ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: Some(kernelspec_name.to_string()),
    };

    let runtime_dir = runtimelib::dirs::runtime_dir();
    tokio::fs::create_dir_all(&runtime_dir).await?;

    let kernel_id: String =
        petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_file = runtime_dir.join(format!("nbembed-kernel-{}.json", kernel_id));
    tokio::fs::write(
        &connection_file,
        serde_json::to_string_pretty(&connection_info)?,
    )
    .await?;

    info!(
        "[local-kernel] Starting {} at {:?}",
        kernelspec_name, connection_file
    );

    let process = kernelspec
        .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))?
        .kill_on_drop(true)
        .spawn()?;

    // Give the kernel a moment to bind its sockets
    tokio::time::sleep(Duration::from_millis(500)).await;

    let channels = match connect(&connection_info, events).await {
        Ok(channels) => channels,
        Err(e) => {
            tokio::fs::remove_file(&connection_file).await.ok();
            return Err(e);
        }
    };

    info!("[local-kernel] Kernel started: {}", kernel_id);
    Ok((
        Running {
            connection_info,
            connection_file,
            session_id: channels.session_id,
            shell_writer: channels.shell_writer,
            iopub_task: channels.iopub_task,
            shell_reader_task: channels.shell_reader_task,
            _process: process,
        },
        channels.info,
    ))
}

/// Open iopub and shell, verify the kernel with kernel_info, and spawn the
/// reader tasks.
async fn connect(
    connection_info: &ConnectionInfo,
    events: &broadcast::Sender<KernelEvent>,
) -> anyhow::Result<Channels> {
    let session_id = Uuid::new_v4().to_string();

    let mut iopub =
        runtimelib::create_client_iopub_connection(connection_info, "", &session_id).await?;

    let identity = runtimelib::peer_identity_for_session(&session_id)?;
    let mut shell = runtimelib::create_client_shell_connection_with_identity(
        connection_info,
        &session_id,
        identity,
    )
    .await?;

    let request: JupyterMessage = KernelInfoRequest::default().into();
    shell.send(request).await?;

    let info = match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
        Ok(Ok(msg)) => match msg.content {
            JupyterMessageContent::KernelInfoReply(reply) => KernelInfo {
                language: reply.language_info.name.clone(),
                implementation: reply.implementation.clone(),
                protocol_version: reply.protocol_version.clone(),
                banner: reply.banner.clone(),
            },
            _ => {
                debug!("[local-kernel] handshake reply: {}", msg.header.msg_type);
                KernelInfo::default()
            }
        },
        Ok(Err(e)) => {
            error!("[local-kernel] Error reading kernel_info_reply: {}", e);
            return Err(anyhow!("Kernel did not respond: {}", e));
        }
        Err(_) => {
            error!("[local-kernel] Timeout waiting for kernel_info_reply");
            return Err(anyhow!(
                "Kernel did not respond within {}s",
                KERNEL_INFO_TIMEOUT.as_secs()
            ));
        }
    };

    let (shell_writer, mut shell_reader) = shell.split();

    let iopub_events = events.clone();
    let iopub_task = tokio::spawn(async move {
        loop {
            match iopub.read().await {
                Ok(message) => {
                    debug!(
                        "[local-kernel] iopub: type={} parent_msg_id={:?}",
                        message.header.msg_type,
                        message.parent_header.as_ref().map(|h| &h.msg_id)
                    );
                    if let Some(event) = translate_iopub(&message) {
                        let _ = iopub_events.send(event);
                    }
                }
                Err(e) => {
                    error!("[local-kernel] iopub read error: {}", e);
                    let _ = iopub_events.send(KernelEvent::Disconnected);
                    break;
                }
            }
        }
    });

    let shell_events = events.clone();
    let shell_reader_task = tokio::spawn(async move {
        loop {
            match shell_reader.read().await {
                Ok(msg) => {
                    let parent_msg_id = msg.parent_header.as_ref().map(|h| h.msg_id.clone());
                    match (msg.content, parent_msg_id) {
                        (JupyterMessageContent::CompleteReply(reply), Some(parent_msg_id)) => {
                            let _ = shell_events.send(KernelEvent::CompleteReply {
                                parent_msg_id,
                                matches: reply.matches,
                                cursor_start: reply.cursor_start,
                                cursor_end: reply.cursor_end,
                            });
                        }
                        _ => {
                            debug!("[local-kernel] shell reply: type={}", msg.header.msg_type);
                        }
                    }
                }
                Err(e) => {
                    error!("[local-kernel] shell read error: {}", e);
                    break;
                }
            }
        }
    });

    Ok(Channels {
        session_id,
        shell_writer,
        iopub_task,
        shell_reader_task,
        info,
    })
}

/// Translate one iopub message into the event the session routes on.
fn translate_iopub(message: &JupyterMessage) -> Option<KernelEvent> {
    let parent_msg_id = message.parent_header.as_ref().map(|h| h.msg_id.clone());

    match &message.content {
        JupyterMessageContent::Status(status) => {
            let state = match status.execution_state {
                jupyter_protocol::ExecutionState::Busy => KernelStatus::Busy,
                jupyter_protocol::ExecutionState::Idle => KernelStatus::Idle,
                jupyter_protocol::ExecutionState::Starting => KernelStatus::Starting,
                jupyter_protocol::ExecutionState::Restarting => KernelStatus::Restarting,
                jupyter_protocol::ExecutionState::Terminating
                | jupyter_protocol::ExecutionState::Dead => KernelStatus::Dead,
            };
            Some(KernelEvent::Status {
                state,
                parent_msg_id,
            })
        }
        JupyterMessageContent::ExecuteInput(input) => Some(KernelEvent::ExecuteInput {
            parent_msg_id: parent_msg_id?,
            execution_count: input.execution_count.0 as u32,
        }),
        content => {
            let output = message_content_to_nbformat(content)?;
            match OutputRecord::from_nbformat(output) {
                Ok(output) => Some(KernelEvent::Output {
                    parent_msg_id: parent_msg_id?,
                    output,
                }),
                Err(e) => {
                    warn!("[local-kernel] Dropping malformed output: {}", e);
                    None
                }
            }
        }
    }
}

/// Convert an iopub output message to nbformat output JSON.
fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<serde_json::Value> {
    use serde_json::json;

    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

#[async_trait]
impl KernelChannel for LocalKernel {
    fn info(&self) -> KernelInfo {
        self.info.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn execute(&self, msg_id: &str, code: &str) -> Result<()> {
        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        self.send_shell(message, msg_id).await?;
        debug!("[local-kernel] Sent execute_request: msg_id={}", msg_id);
        Ok(())
    }

    async fn complete(&self, msg_id: &str, code: &str, cursor_pos: usize) -> Result<()> {
        let message: JupyterMessage = CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        }
        .into();
        self.send_shell(message, msg_id).await
    }

    async fn interrupt(&self) -> Result<()> {
        let request: JupyterMessage = InterruptRequest {}.into();
        self.send_control(request)
            .await
            .map_err(|e| NotebookError::Kernel(e.to_string()))?;
        info!("[local-kernel] Sent interrupt_request");
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        info!("[local-kernel] Restarting {}", self.kernelspec_name);
        self.emit_lifecycle(KernelStatus::Restarting);

        let mut guard = self.running.lock().await;
        if let Some(old) = guard.take() {
            self.stop(old).await;
        }

        let (running, info) = start_process(&self.kernelspec_name, &self.events)
            .await
            .map_err(|e| {
                self.emit_lifecycle(KernelStatus::Dead);
                NotebookError::KernelStart {
                    kernel: self.kernelspec_name.clone(),
                    message: e.to_string(),
                }
            })?;
        *guard = Some(running);
        if let Ok(mut current) = self.info.lock() {
            *current = info;
        }
        drop(guard);

        self.emit_lifecycle(KernelStatus::Idle);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.running.lock().await;
        let running = guard
            .as_mut()
            .ok_or_else(|| NotebookError::Kernel("No kernel running".into()))?;

        running.stop_readers();
        let channels = connect(&running.connection_info, &self.events)
            .await
            .map_err(|e| {
                warn!("[local-kernel] Reconnect failed: {}", e);
                NotebookError::TransportDisconnected
            })?;
        running.session_id = channels.session_id;
        running.shell_writer = channels.shell_writer;
        running.iopub_task = channels.iopub_task;
        running.shell_reader_task = channels.shell_reader_task;
        drop(guard);

        info!("[local-kernel] Reconnected to {}", self.kernelspec_name);
        let _ = self.events.send(KernelEvent::Reconnected);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            info!("[local-kernel] Shutting down {}", self.kernelspec_name);
            self.stop(running).await;
            self.emit_lifecycle(KernelStatus::Dead);
        }
        Ok(())
    }
}
