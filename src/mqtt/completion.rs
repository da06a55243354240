//! Single-outcome handle for client operations
//!
//! Each operation returns a [`Completion`] as soon as its request is queued.
//! The completion resolves exactly once, to `Ok` with the operation's value or
//! `Err` with a [`TransportError`]. It can be awaited, handed a callback, or
//! blocked on from synchronous code.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::TransportError;

pub type OperationResult<T> = Result<T, TransportError>;

/// Pending outcome of one client operation
#[must_use = "a completion does nothing unless awaited, waited on or given a callback"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<OperationResult<T>>,
    handle: Handle,
}

/// Sending half kept by the session driver
#[derive(Debug)]
pub(crate) struct Responder<T> {
    tx: oneshot::Sender<OperationResult<T>>,
}

impl<T> Responder<T> {
    /// Consumes the responder, so an operation cannot be resolved twice.
    pub(crate) fn resolve(self, result: OperationResult<T>) {
        // The caller may have dropped its completion; nothing to report then.
        let _ = self.tx.send(result);
    }
}

impl<T> Completion<T> {
    pub(crate) fn channel(handle: Handle) -> (Responder<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (Responder { tx }, Completion { rx, handle })
    }

    /// A completion that is already resolved.
    pub(crate) fn ready(handle: Handle, result: OperationResult<T>) -> Completion<T> {
        let (responder, completion) = Self::channel(handle);
        responder.resolve(result);
        completion
    }

    /// Runs `callback` with the outcome on the client's execution context.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(OperationResult<T>) + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle.clone();
        handle.spawn(async move {
            callback(self.await);
        });
    }

    /// Blocks the current thread until the outcome is known.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait(self) -> OperationResult<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(TransportError::ShutDown))
    }
}

impl<T> Future for Completion<T> {
    type Output = OperationResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TransportError::ShutDown)))
    }
}
