//! Execution context for the client's background work
//!
//! Every client runs its session driver on a tokio runtime. The runtime can be
//! owned by one client, shared between several clients through a
//! [`SharedRuntime`] handle, or borrowed from the runtime the caller is
//! already running in.

use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::ConfigurationError;

/// Reference-counted handle to a multi-threaded tokio runtime
///
/// Clone the handle for every client that should share the worker threads.
/// Each holder gives its reference back with [`SharedRuntime::release`] (or by
/// dropping it); the runtime shuts down once the last reference is gone.
/// Clients holding a clone keep the runtime alive until they are torn down.
#[derive(Clone)]
pub struct SharedRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    runtime: Option<Runtime>,
    handle: Handle,
    worker_threads: usize,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(
                "Last reference released, shutting down runtime ({} workers)",
                self.worker_threads
            );
            // Does not block, so the last holder may live inside another runtime.
            runtime.shutdown_background();
        }
    }
}

impl SharedRuntime {
    /// Starts a runtime with the given number of worker threads (at least one).
    pub fn new(worker_threads: usize) -> Result<Self, ConfigurationError> {
        let worker_threads = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("tb-device-client")
            .enable_all()
            .build()
            .map_err(|e| ConfigurationError::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                runtime: Some(runtime),
                handle,
                worker_threads,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    /// Number of live references, including this one.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Gives this reference back. Shuts the runtime down if it was the last.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for SharedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRuntime")
            .field("worker_threads", &self.inner.worker_threads)
            .field("holders", &self.holders())
            .finish()
    }
}

/// Where a client runs its background work
#[derive(Debug, Default)]
pub enum RuntimeProvider {
    /// Use a runtime shared with other clients
    Shared(SharedRuntime),
    /// Start a dedicated single-worker runtime for this client
    #[default]
    Owned,
    /// Use the tokio runtime the constructor is called from
    Current,
}

/// Resolved execution context held by a client
pub(crate) struct ExecutionContext {
    handle: Handle,
    runtime: Option<SharedRuntime>,
}

impl ExecutionContext {
    /// Splits into the spawn handle and the runtime reference (if any) that
    /// has to stay alive until the client's background work has finished.
    pub(crate) fn into_parts(self) -> (Handle, Option<SharedRuntime>) {
        (self.handle, self.runtime)
    }
}

impl RuntimeProvider {
    pub(crate) fn resolve(self) -> Result<ExecutionContext, ConfigurationError> {
        match self {
            RuntimeProvider::Shared(runtime) => Ok(ExecutionContext {
                handle: runtime.handle(),
                runtime: Some(runtime),
            }),
            RuntimeProvider::Owned => {
                let runtime = SharedRuntime::new(1)?;
                Ok(ExecutionContext {
                    handle: runtime.handle(),
                    runtime: Some(runtime),
                })
            }
            RuntimeProvider::Current => {
                let handle = Handle::try_current()
                    .map_err(|e| ConfigurationError::Runtime(e.to_string()))?;
                Ok(ExecutionContext {
                    handle,
                    runtime: None,
                })
            }
        }
    }
}
