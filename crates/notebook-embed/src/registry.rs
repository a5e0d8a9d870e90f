//! Shared kernel connections, keyed by logical kernel id.
//!
//! Sessions never start kernels themselves. They `acquire` a connection from
//! the registry, which either hands out the live one for that id or starts a
//! new one through the configured [`KernelLauncher`]. Concurrent acquires of
//! the same id wait on a single start. The connection is torn down when the
//! last holder releases it, or immediately on `shutdown`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;

use crate::config::EmbedConfig;
use crate::error::{NotebookError, Result};
use crate::kernel::{KernelConnection, KernelEvent, KernelLauncher, KernelSpec, KernelspecInfo};

struct Slot {
    refs: usize,
    cell: Arc<OnceCell<Arc<KernelConnection>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Slot {
    fn teardown(self) -> Option<Arc<KernelConnection>> {
        if let Some(task) = self.supervisor {
            task.abort();
        }
        self.cell.get().cloned()
    }
}

/// A live connection as reported by [`ConnectionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub id: String,
    pub kernel_name: String,
    pub ref_count: usize,
}

/// Owns every kernel connection in the host application.
pub struct ConnectionRegistry {
    launcher: Arc<dyn KernelLauncher>,
    config: EmbedConfig,
    slots: StdMutex<HashMap<String, Slot>>,
}

impl ConnectionRegistry {
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: EmbedConfig) -> Self {
        Self {
            launcher,
            config,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // A poisoned map only means a panic elsewhere; the map itself is intact.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the live connection for `spec.id`, starting it if needed.
    ///
    /// Each successful call must be balanced by a [`release`](Self::release).
    pub async fn acquire(&self, spec: &KernelSpec) -> Result<Arc<KernelConnection>> {
        let cell = {
            let mut slots = self.slots();
            let slot = slots.entry(spec.id.clone()).or_insert_with(|| Slot {
                refs: 0,
                cell: Arc::new(OnceCell::new()),
                supervisor: None,
            });
            slot.refs += 1;
            slot.cell.clone()
        };

        let started = cell
            .get_or_try_init(|| async {
                info!("[registry] Starting kernel {} ({})", spec.id, spec.name);
                let channel = self.launcher.start(spec).await?;
                Ok::<_, NotebookError>(Arc::new(KernelConnection::new(spec.clone(), channel)))
            })
            .await;

        match started {
            Ok(connection) => {
                let connection = connection.clone();
                let registered = {
                    let mut slots = self.slots();
                    match slots.get_mut(&spec.id) {
                        Some(slot) if Arc::ptr_eq(&slot.cell, &cell) => {
                            if slot.supervisor.is_none() {
                                slot.supervisor = Some(self.spawn_supervisor(&connection));
                            }
                            debug!("[registry] Acquired {} (refs={})", spec.id, slot.refs);
                            true
                        }
                        _ => false,
                    }
                };
                if registered {
                    return Ok(connection);
                }
                warn!("[registry] {} was shut down while starting", spec.id);
                connection.shutdown().await.ok();
                Err(NotebookError::KernelStart {
                    kernel: spec.name.clone(),
                    message: "connection was shut down during start".to_string(),
                })
            }
            Err(e) => {
                error!("[registry] Failed to start {}: {}", spec.id, e);
                let mut slots = self.slots();
                if let Some(slot) = slots.get_mut(&spec.id) {
                    if Arc::ptr_eq(&slot.cell, &cell) {
                        slot.refs = slot.refs.saturating_sub(1);
                        if slot.refs == 0 && slot.cell.get().is_none() {
                            slots.remove(&spec.id);
                        }
                    }
                }
                Err(match e {
                    e @ NotebookError::KernelStart { .. } => e,
                    other => NotebookError::KernelStart {
                        kernel: spec.name.clone(),
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    /// Drop one reference to `id`; the connection shuts down at zero.
    pub async fn release(&self, id: &str) -> Result<()> {
        let torn_down = {
            let mut slots = self.slots();
            match slots.get_mut(id) {
                Some(slot) => {
                    slot.refs = slot.refs.saturating_sub(1);
                    debug!("[registry] Released {} (refs={})", id, slot.refs);
                    if slot.refs == 0 {
                        slots.remove(id).and_then(Slot::teardown)
                    } else {
                        None
                    }
                }
                None => {
                    debug!("[registry] Release of unknown connection {}", id);
                    None
                }
            }
        };

        if let Some(connection) = torn_down {
            info!("[registry] Last reference to {} released, shutting down", id);
            connection.shutdown().await?;
        }
        Ok(())
    }

    /// Tear down `id` regardless of how many holders it has.
    pub async fn shutdown(&self, id: &str) -> Result<()> {
        let torn_down = self.slots().remove(id).and_then(Slot::teardown);
        if let Some(connection) = torn_down {
            info!("[registry] Shutting down {}", id);
            connection.shutdown().await?;
        }
        Ok(())
    }

    /// Tear down every connection.
    pub async fn shutdown_all(&self) {
        let connections: Vec<_> = self
            .slots()
            .drain()
            .filter_map(|(_, slot)| slot.teardown())
            .collect();
        for connection in connections {
            if let Err(e) = connection.shutdown().await {
                warn!("[registry] Failed to shut down {}: {}", connection.id(), e);
            }
        }
    }

    /// The live connection for `id`, without taking a reference.
    pub fn get(&self, id: &str) -> Option<Arc<KernelConnection>> {
        self.slots().get(id).and_then(|slot| slot.cell.get().cloned())
    }

    /// Live connections and their reference counts.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self
            .slots()
            .iter()
            .filter_map(|(id, slot)| {
                slot.cell.get().map(|connection| RegistryEntry {
                    id: id.clone(),
                    kernel_name: connection.spec().name.clone(),
                    ref_count: slot.refs,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn ref_count(&self, id: &str) -> usize {
        self.slots().get(id).map(|slot| slot.refs).unwrap_or(0)
    }

    /// Kernelspecs the launcher can start.
    pub async fn available_kernels(&self) -> Vec<KernelspecInfo> {
        self.launcher.available().await
    }

    /// Re-establish the transport of `id`.
    pub async fn reconnect(&self, id: &str) -> Result<()> {
        let connection = self
            .get(id)
            .ok_or_else(|| NotebookError::Kernel(format!("No live connection {}", id)))?;
        connection.reconnect().await
    }

    /// Watch a connection for transport drops and try to bring it back.
    fn spawn_supervisor(&self, connection: &Arc<KernelConnection>) -> JoinHandle<()> {
        let mut events = connection.subscribe();
        let weak: Weak<KernelConnection> = Arc::downgrade(connection);
        let attempts = self.config.reconnect_attempts;
        let delay = self.config.reconnect_delay();
        let id = connection.id().to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(KernelEvent::Disconnected) => {
                        warn!("[registry] {} disconnected", id);
                        let mut recovered = false;
                        for attempt in 1..=attempts {
                            tokio::time::sleep(delay).await;
                            let Some(connection) = weak.upgrade() else {
                                return;
                            };
                            match connection.reconnect().await {
                                Ok(()) => {
                                    info!("[registry] {} reconnected (attempt {})", id, attempt);
                                    recovered = true;
                                    break;
                                }
                                Err(e) => {
                                    warn!(
                                        "[registry] Reconnect {} attempt {}/{} failed: {}",
                                        id, attempt, attempts, e
                                    );
                                }
                            }
                        }
                        if !recovered {
                            error!("[registry] Giving up on {} after {} attempts", id, attempts);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[registry] Supervisor for {} lagged {} events", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        for (_, slot) in self.slots().drain() {
            if let Some(task) = slot.supervisor {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryLauncher;
    use std::time::Duration;

    fn registry(launcher: Arc<InMemoryLauncher>) -> ConnectionRegistry {
        let config = EmbedConfig {
            reconnect_delay_ms: 10,
            ..EmbedConfig::default()
        };
        ConnectionRegistry::new(launcher, config)
    }

    #[tokio::test]
    async fn test_acquire_shares_connection() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let registry = registry(launcher.clone());
        let spec = KernelSpec::new("memory");

        let a = registry.acquire(&spec).await.unwrap();
        let b = registry.acquire(&spec).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(launcher.starts(), 1);
        assert_eq!(registry.ref_count("memory"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_starts_once() {
        let launcher = Arc::new(InMemoryLauncher::new().with_start_delay(Duration::from_millis(50)));
        let registry = Arc::new(registry(launcher.clone()));
        let spec = KernelSpec::new("memory");

        let (a, b) = tokio::join!(registry.acquire(&spec), registry.acquire(&spec));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(launcher.starts(), 1);
    }

    #[tokio::test]
    async fn test_release_tears_down_at_zero() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let registry = registry(launcher.clone());
        let spec = KernelSpec::new("memory");

        registry.acquire(&spec).await.unwrap();
        registry.acquire(&spec).await.unwrap();
        registry.release("memory").await.unwrap();
        assert_eq!(registry.list().len(), 1);
        registry.release("memory").await.unwrap();
        assert!(registry.list().is_empty());
        assert!(launcher.kernel("memory").unwrap().is_dead());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_slot() {
        let launcher = Arc::new(InMemoryLauncher::new());
        launcher.fail_kernel("broken");
        let registry = registry(launcher.clone());

        let err = registry.acquire(&KernelSpec::new("broken")).await.unwrap_err();
        assert!(matches!(err, NotebookError::KernelStart { ref kernel, .. } if kernel == "broken"));
        assert_eq!(registry.ref_count("broken"), 0);
        assert!(registry.get("broken").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ignores_ref_count() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let registry = registry(launcher.clone());
        let spec = KernelSpec::new("memory");

        registry.acquire(&spec).await.unwrap();
        registry.acquire(&spec).await.unwrap();
        registry.shutdown("memory").await.unwrap();
        assert!(registry.list().is_empty());
        assert!(launcher.kernel("memory").unwrap().is_dead());
    }

    #[tokio::test]
    async fn test_supervisor_reconnects_dropped_transport() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let registry = registry(launcher.clone());
        registry.acquire(&KernelSpec::new("memory")).await.unwrap();

        let kernel = launcher.kernel("memory").unwrap();
        kernel.simulate_disconnect();
        assert!(!kernel.is_connected());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !kernel.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor should reconnect");
    }

    #[tokio::test]
    async fn test_list_reports_live_connections() {
        let launcher = Arc::new(InMemoryLauncher::new());
        let registry = registry(launcher);
        registry
            .acquire(&KernelSpec::new("memory").with_id("b"))
            .await
            .unwrap();
        registry
            .acquire(&KernelSpec::new("memory").with_id("a"))
            .await
            .unwrap();
        let ids: Vec<_> = registry.list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.available_kernels().await[0].name, "memory");
    }
}
