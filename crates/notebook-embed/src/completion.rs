//! Code completion across one or more providers.
//!
//! The reconciliator fans a request out to every provider, takes the first
//! non-empty answer, and gives up with an empty response once the timeout
//! passes. A provider that never answers cannot hold up the caller.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::Session;

/// Default time a completion request waits for its providers.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Source snapshot plus cursor offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub text: String,
    pub offset: usize,
}

impl CompletionRequest {
    pub fn new(text: &str, offset: usize) -> Self {
        Self {
            text: text.to_string(),
            offset,
        }
    }
}

/// One suggestion; lower rank sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionItem {
    pub label: String,
    pub rank: usize,
}

/// Ranked suggestions and the range of text they replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub items: Vec<CompletionItem>,
    pub start: usize,
    pub end: usize,
}

impl CompletionResponse {
    /// No suggestions, anchored at `offset`.
    pub fn empty(offset: usize) -> Self {
        Self {
            items: Vec::new(),
            start: offset,
            end: offset,
        }
    }

    /// Rank `labels` in the order given.
    pub fn from_labels(labels: Vec<String>, start: usize, end: usize) -> Self {
        Self {
            items: labels
                .into_iter()
                .enumerate()
                .map(|(rank, label)| CompletionItem { label, rank })
                .collect(),
            start,
            end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.label.as_str()).collect()
    }
}

/// Something that can answer completion requests.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Completions from the kernel behind a session.
pub struct KernelCompletionProvider {
    session: Arc<Session>,
}

impl KernelCompletionProvider {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CompletionProvider for KernelCompletionProvider {
    fn name(&self) -> &str {
        "kernel"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let reply = self.session.complete(&request.text, request.offset).await?;
        Ok(CompletionResponse::from_labels(
            reply.matches,
            reply.cursor_start,
            reply.cursor_end,
        ))
    }
}

type ProviderSet = Arc<Vec<Arc<dyn CompletionProvider>>>;

/// Reconciles completion requests against the active provider set.
pub struct CompletionReconciliator {
    providers: RwLock<ProviderSet>,
    timeout: Duration,
}

impl Default for CompletionReconciliator {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_TIMEOUT)
    }
}

impl CompletionReconciliator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(Arc::new(Vec::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the provider set. Requests already running keep the set they
    /// started with.
    pub fn set_providers(&self, providers: Vec<Arc<dyn CompletionProvider>>) {
        let names: Vec<_> = providers.iter().map(|p| p.name().to_string()).collect();
        debug!("[completion] Providers set to {:?}", names);
        match self.providers.write() {
            Ok(mut current) => *current = Arc::new(providers),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(providers),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> ProviderSet {
        match self.providers.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn complete(&self, request: &CompletionRequest) -> CompletionResponse {
        self.complete_with_timeout(request, self.timeout).await
    }

    /// First non-empty provider answer within `timeout`, else empty.
    pub async fn complete_with_timeout(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> CompletionResponse {
        let providers = self.snapshot();
        if providers.is_empty() {
            return CompletionResponse::empty(request.offset);
        }

        // Spawned so a timed-out provider keeps running detached instead of
        // being dropped mid-request.
        let mut pending: FuturesUnordered<_> = providers
            .iter()
            .map(|provider| {
                let provider = provider.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let result = provider.complete(&request).await;
                    (provider.name().to_string(), result)
                })
            })
            .collect();

        let first = tokio::time::timeout(timeout, async {
            while let Some(joined) = pending.next().await {
                match joined {
                    Ok((_, Ok(response))) if !response.is_empty() => return Some(response),
                    Ok((name, Ok(_))) => debug!("[completion] {} had no suggestions", name),
                    Ok((name, Err(e))) => debug!("[completion] {} failed: {}", name, e),
                    Err(e) => warn!("[completion] Provider task panicked: {}", e),
                }
            }
            None
        })
        .await;

        match first {
            Ok(Some(response)) => response,
            Ok(None) => CompletionResponse::empty(request.offset),
            Err(_) => {
                debug!(
                    "[completion] No answer within {}ms",
                    timeout.as_millis()
                );
                CompletionResponse::empty(request.offset)
            }
        }
    }
}
