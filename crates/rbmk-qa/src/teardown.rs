//! Last-in-first-out release of simulation resources.

use std::fmt;

use futures_util::future::BoxFuture;
use rbmk_netem::{ServerHandle, Stack};
use thiserror::Error;

/// A resource released during teardown.
pub trait Close: Send {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), String>>;
}

impl Close for Stack {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), String>> {
        Box::pin(async move { Stack::close(&self).map_err(|err| err.to_string()) })
    }
}

impl Close for ServerHandle {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), String>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

/// A labelled [`Close`] registered with a [`TeardownStack`].
pub struct Closer {
    label: String,
    resource: Box<dyn Close>,
}

impl Closer {
    pub fn new(label: impl Into<String>, resource: impl Close + 'static) -> Self {
        Self {
            label: label.into(),
            resource: Box::new(resource),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer").field("label", &self.label).finish()
    }
}

/// Labels of the released resources, in release order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub closed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFailure {
    pub label: String,
    pub error: String,
}

/// Every closer ran, but some of them failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {} closers failed during teardown", failures.len(), report.closed.len())]
pub struct TeardownError {
    pub report: TeardownReport,
    pub failures: Vec<CloseFailure>,
}

#[derive(Debug, Default)]
pub struct TeardownStack {
    closers: Vec<Closer>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, closer: Closer) {
        tracing::trace!(label = closer.label(), "registered closer");
        self.closers.push(closer);
    }

    pub fn len(&self) -> usize {
        self.closers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }

    /// Labels in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.closers.iter().map(|c| c.label.clone()).collect()
    }

    /// Pop and release every closer, newest first. Failures do not stop the unwinding.
    pub async fn unwind(mut self) -> Result<TeardownReport, TeardownError> {
        let mut report = TeardownReport::default();
        let mut failures = Vec::new();
        while let Some(Closer { label, resource }) = self.closers.pop() {
            if let Err(error) = resource.close().await {
                tracing::warn!(%label, %error, "closer failed");
                failures.push(CloseFailure {
                    label: label.clone(),
                    error,
                });
            }
            report.closed.push(label);
        }
        tracing::debug!(closed = report.closed.len(), failed = failures.len(), "teardown finished");
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(TeardownError { report, failures })
        }
    }
}
