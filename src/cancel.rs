use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::Error;

/// Cooperative cancellation handle shared by the scanner, the worker pool
/// and any readers blocked on the output.
///
/// Internally a zero-capacity channel whose sender is dropped on
/// cancellation: every clone of the receiver becomes permanently ready,
/// which makes the token usable inside `crossbeam_channel::select!`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    cause: Mutex<Option<Error>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx,
                cause: Mutex::new(None),
            }),
        }
    }

    /// Cancels the token, recording `cause`. The first cancellation wins;
    /// later calls are ignored.
    pub fn cancel(&self, cause: Error) {
        let mut tx = self.inner.tx.lock().unwrap();
        if tx.is_some() {
            *self.inner.cause.lock().unwrap() = Some(cause);
            *tx = None;
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.tx.lock().unwrap().is_none()
    }

    /// The recorded cancellation cause, defaulting to [`Error::Canceled`].
    pub fn cause(&self) -> Error {
        self.inner
            .cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Error::Canceled)
    }

    /// Receiver to race against in `select!`; it only ever completes (with
    /// a disconnect) once the token has been canceled.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
