//! Mock providers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use palisade::{GenerateOptions, GenerateRequest, GenerateResponse, PalisadeError, Provider, Result};

/// Mock provider that fails N times then succeeds.
pub struct FailThenSucceed {
    name: String,
    fail_count: AtomicU32,
    fail_with: fn(&str) -> PalisadeError,
    total_calls: AtomicU32,
    latency: Option<Duration>,
}

impl FailThenSucceed {
    pub fn new(name: &str, failures: u32, fail_with: fn(&str) -> PalisadeError) -> Self {
        Self {
            name: name.to_string(),
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
            latency: None,
        }
    }

    /// Provider that never fails.
    pub fn healthy(name: &str) -> Self {
        Self::new(name, 0, unavailable)
    }

    /// Provider that always fails with `fail_with`.
    pub fn broken(name: &str, fail_with: fn(&str) -> PalisadeError) -> Self {
        Self::new(name, u32::MAX, fail_with)
    }

    /// Sleep this long before answering.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for FailThenSucceed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _options: &GenerateOptions,
    ) -> Result<GenerateResponse> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let remaining = self.fail_count.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::Relaxed);
            return Err((self.fail_with)(&self.name));
        }
        Ok(GenerateResponse::new(
            &self.name,
            format!("{}: {}", self.name, request.prompt),
        ))
    }
}

pub fn unavailable(provider: &str) -> PalisadeError {
    PalisadeError::provider(provider, "service unavailable")
}

pub fn rate_limited(provider: &str) -> PalisadeError {
    PalisadeError::provider(provider, "rate limit exceeded")
}

pub fn unauthorized(provider: &str) -> PalisadeError {
    PalisadeError::provider_status(provider, 401, "invalid api key")
}

pub fn bad_request(provider: &str) -> PalisadeError {
    PalisadeError::provider_status(provider, 400, "malformed request")
}

/// Provider whose failure mode can be switched on and off mid-test.
pub struct Flaky {
    name: String,
    failing: std::sync::atomic::AtomicBool,
    total_calls: AtomicU32,
}

impl Flaky {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failing: std::sync::atomic::AtomicBool::new(false),
            total_calls: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for Flaky {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _options: &GenerateOptions,
    ) -> Result<GenerateResponse> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(unavailable(&self.name));
        }
        Ok(GenerateResponse::new(
            &self.name,
            format!("{}: {}", self.name, request.prompt),
        ))
    }
}
