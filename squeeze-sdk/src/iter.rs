//! Blocking iterator over client events
//!
//! Lets the host consume [`ClientEvent`]s without async/await.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::event::ClientEvent;

/// Blocking iterator over [`ClientEvent`]s
///
/// `next()` blocks until an event is available or the client has shut
/// down. Use [`try_recv`](Self::try_recv) for non-blocking access.
pub struct ClientEventIterator {
    rx: Arc<Mutex<mpsc::Receiver<ClientEvent>>>,
}

impl ClientEventIterator {
    pub(crate) fn new(rx: Arc<Mutex<mpsc::Receiver<ClientEvent>>>) -> Self {
        Self { rx }
    }

    /// Block until an event is available
    ///
    /// Returns `None` once the worker has stopped.
    pub fn recv(&self) -> Option<ClientEvent> {
        self.rx.lock().ok()?.recv().ok()
    }

    /// Receive an event if one is waiting
    pub fn try_recv(&self) -> Option<ClientEvent> {
        self.rx.lock().ok()?.try_recv().ok()
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        self.rx.lock().ok()?.recv_timeout(timeout).ok()
    }

    /// Iterate over the events currently waiting, without blocking
    pub fn try_iter(&self) -> TryIterator<'_> {
        TryIterator { inner: self }
    }
}

impl Iterator for ClientEventIterator {
    type Item = ClientEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Clone for ClientEventIterator {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Non-blocking iterator over currently available events
pub struct TryIterator<'a> {
    inner: &'a ClientEventIterator,
}

impl<'a> Iterator for TryIterator<'a> {
    type Item = ClientEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}
