//! Outbound provider trait and the throttled wrapper around it.
//!
//! The concrete clients (market data, LLM) live in the surrounding
//! application; they implement [`Provider`] and get wrapped in a
//! [`ThrottledProvider`] so every call first passes through the shared
//! [`ApiThrottler`]. Any client goes through [`ThrottledProvider::call`];
//! chat clients additionally get [`ChatProvider`] forwarded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::telemetry;
use crate::throttle::ApiThrottler;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// An external service reached over the network.
pub trait Provider: Send + Sync {
    /// Name used as the throttle key, e.g. `"openai"` or `"yfinance"`.
    fn name(&self) -> &str;
}

/// LLM-style provider.
#[async_trait]
pub trait ChatProvider: Provider {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
}

// ---------------------------------------------------------------------------
// ThrottledProvider
// ---------------------------------------------------------------------------

/// Gates every call to the inner provider behind a token from the shared
/// throttler. A timed-out acquisition comes back as a
/// [`ThrottleError`](crate::error::ThrottleError) inside the `anyhow::Error`
/// and the inner provider is never called.
pub struct ThrottledProvider<P> {
    inner: P,
    throttler: Arc<ApiThrottler>,
    timeout: Option<Duration>,
}

impl<P: Provider> ThrottledProvider<P> {
    pub fn new(inner: P, throttler: Arc<ApiThrottler>) -> Self {
        Self {
            inner,
            throttler,
            timeout: None,
        }
    }

    /// Give up waiting for a token after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Run `work` against the inner provider once a token is granted.
    ///
    /// ```ignore
    /// let price = yfinance.call("quote", |client| client.quote("AAPL")).await?;
    /// ```
    pub async fn call<'a, F, Fut, T>(&'a self, operation: &str, work: F) -> anyhow::Result<T>
    where
        F: FnOnce(&'a P) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let name = self.inner.name();
        let mut wait_span = telemetry::trace_acquisition(name);
        let permit = match self.throttler.throttle_async(name, self.timeout).await {
            Ok(permit) => {
                wait_span.set_status(true, "");
                permit
            }
            Err(err) => {
                wait_span.set_status(false, &err.to_string());
                return Err(err.into());
            }
        };
        drop(wait_span);

        let mut call_span = telemetry::trace_outbound_call(name, operation);
        call_span.set_attribute("throttle.waited_ms", permit.waited().as_millis().to_string());
        let result = work(&self.inner).await;
        call_span.set_status(result.is_ok(), &format!("{operation} failed"));
        result
    }
}

impl<P: Provider> Provider for ThrottledProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[async_trait]
impl<P: ChatProvider> ChatProvider for ThrottledProvider<P> {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.call("chat", |inner| inner.chat(request)).await
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for ThrottledProvider<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledProvider")
            .field("inner", &self.inner)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stub implementation
// ---------------------------------------------------------------------------

/// Returns canned responses and counts how often it was called. Useful for
/// tests and offline development.
#[derive(Debug)]
pub struct StubProvider {
    pub name: String,
    pub response_text: String,
    calls: std::sync::atomic::AtomicUsize,
}

impl StubProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response_text: format!("Hello from {name}"),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new("stub")
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn chat(&self, _request: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(ChatResponse {
            content: self.response_text.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
