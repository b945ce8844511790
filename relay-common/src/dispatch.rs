use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use tokio::sync::Notify;

use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::metrics_consts::{DISPATCHES_IN_FLIGHT, DISPATCH_DURATION, DISPATCH_FAILURES};

/// User logic run once per received message.
///
/// Delivery is at-least-once: a message whose dispatch had not completed
/// before a crash is delivered again, so handlers must be idempotent.
/// Returning an error does not stop anything, it is logged and the message
/// counts as processed.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Counts dispatches that have started and not yet finished, across every
/// worker of a run.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one dispatch until the returned guard is dropped.
    pub fn enter(&self) -> InFlightGuard {
        let count = self.inner.count.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(DISPATCHES_IN_FLIGHT).set(count as f64);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once no dispatch is running.
    pub async fn wait_idle(&self) {
        loop {
            // Register before reading the count so a concurrent drop to zero
            // still wakes us
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.inner.count.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!(DISPATCHES_IN_FLIGHT).set(remaining as f64);
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Run the handler on one message. Errors and panics stop here: they are
/// turned into a `DispatchError` and never reach the worker.
pub async fn dispatch<H>(handler: &H, envelope: Envelope) -> Result<(), DispatchError>
where
    H: MessageHandler + ?Sized,
{
    let partition = envelope.partition().clone();
    let offset = envelope.offset();

    let start = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(envelope))
        .catch_unwind()
        .await;
    histogram!(DISPATCH_DURATION).record(start.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            counter!(DISPATCH_FAILURES, "reason" => "error").increment(1);
            Err(DispatchError::Handler {
                partition,
                offset,
                error,
            })
        }
        Err(payload) => {
            counter!(DISPATCH_FAILURES, "reason" => "panic").increment(1);
            Err(DispatchError::Panicked {
                partition,
                offset,
                message: panic_message(payload.as_ref()),
            })
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
