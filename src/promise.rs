//! Single-shot result cells connecting pipelines to their callers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::client::error::Error;

type OnWait = Box<dyn FnOnce() + Send>;

/// Write half of a single-shot result cell.
///
/// Exactly one of [`Promise::set_value`] and [`Promise::set_error`] is
/// called, exactly once; both consume the promise, so double fulfillment is
/// unrepresentable.
pub struct Promise<T> {
    tx: oneshot::Sender<Result<T, Error>>,
}

impl<T> Promise<T> {
    /// A fresh promise and the delivery that will observe it.
    pub fn pair() -> (Self, Delivery<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Delivery { rx, on_wait: None })
    }

    /// Like [`Promise::pair`], with a hook that runs at most once, on the
    /// delivery's first poll, before it suspends.
    pub fn pair_with_hook(hook: impl FnOnce() + Send + 'static) -> (Self, Delivery<T>) {
        let (promise, mut delivery) = Self::pair();
        delivery.on_wait = Some(Box::new(hook));
        (promise, delivery)
    }

    pub fn set_value(self, value: T) {
        // The caller may have dropped the delivery; that is their loss.
        let _ = self.tx.send(Ok(value));
    }

    pub fn set_error(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    pub fn settle(self, result: Result<T, Error>) {
        let _ = self.tx.send(result);
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// Read half of a single-shot result cell.
///
/// Resolves once the matching [`Promise`] is fulfilled; a promise dropped
/// unfulfilled surfaces as [`Error::PromiseDropped`].
pub struct Delivery<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    on_wait: Option<OnWait>,
}

impl<T> Future for Delivery<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(hook) = this.on_wait.take() {
            hook();
        }
        Pin::new(&mut this.rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(Error::PromiseDropped),
        })
    }
}

impl<T> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("has_hook", &self.on_wait.is_some())
            .finish()
    }
}
