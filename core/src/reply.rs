/// Held reply handles for asynchronous client calls
///
/// A [`Responder`] is the server half: it is stored in a session while a Link
/// Engine callback is outstanding and resolved exactly once. Resolution
/// consumes the responder, so a second reply is not expressible. A [`Reply`]
/// is the caller half; it can be polled without blocking or awaited.

use crate::error::{BluetoothError, HostResult};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::error;

/// Create a connected responder/reply pair for the named method
pub fn channel(method: &'static str) -> (Responder, Reply) {
    let (tx, rx) = oneshot::channel();
    (
        Responder {
            tx: Some(tx),
            method,
        },
        Reply { rx, method },
    )
}

/// Server half of a pending reply
#[derive(Debug)]
pub struct Responder {
    tx: Option<oneshot::Sender<HostResult<()>>>,
    method: &'static str,
}

impl Responder {
    /// Name of the method this responder answers
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Resolve with the given result
    pub fn send(mut self, result: HostResult<()>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have gone away; nothing left to do then.
            let _ = tx.send(result);
        }
    }

    /// Resolve with success
    pub fn reply_ok(self) {
        self.send(Ok(()))
    }

    /// Resolve with an error
    pub fn reply_err(self, err: BluetoothError) {
        self.send(Err(err))
    }

    /// True once the caller dropped its [`Reply`]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            error!("{} reply dropped without a response", self.method);
            let _ = tx.send(Err(BluetoothError::Failed(format!(
                "{} abandoned",
                self.method
            ))));
        }
    }
}

/// Caller half of a pending reply
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<HostResult<()>>,
    method: &'static str,
}

impl Reply {
    /// Name of the method this reply belongs to
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Take the result if it has been delivered, without blocking
    pub fn try_take(&mut self) -> Option<HostResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BluetoothError::Failed(
                format!("{} reply channel closed", self.method),
            ))),
        }
    }
}

impl Future for Reply {
    type Output = HostResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let method = self.method;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BluetoothError::Failed(format!(
                    "{} reply channel closed",
                    method
                )))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_pending_until_resolved() {
        let (responder, mut reply) = channel("Pair");
        assert_eq!(reply.try_take(), None);

        responder.reply_ok();
        assert_eq!(reply.try_take(), Some(Ok(())));
    }

    #[test]
    fn test_reply_error() {
        let (responder, mut reply) = channel("Connect");
        responder.reply_err(BluetoothError::AlreadyExists("connected".to_string()));

        let result = reply.try_take().expect("resolved");
        assert!(matches!(result, Err(BluetoothError::AlreadyExists(_))));
    }

    #[test]
    fn test_dropped_responder_resolves_failed() {
        let (responder, mut reply) = channel("Disconnect");
        drop(responder);

        let result = reply.try_take().expect("resolved on drop");
        assert!(matches!(result, Err(BluetoothError::Failed(_))));
    }

    #[test]
    fn test_responder_sees_closed_reply() {
        let (responder, reply) = channel("Pair");
        assert!(!responder.is_closed());
        drop(reply);
        assert!(responder.is_closed());
        responder.reply_ok();
    }

    #[tokio::test]
    async fn test_reply_is_awaitable() {
        let (responder, reply) = channel("SuspendDone");
        responder.reply_ok();
        assert_eq!(reply.await, Ok(()));
    }
}
