use std::future::poll_fn;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::metadata::HeaderList;

use super::{ClientStream, IncomingStream, ResponseSink, TransportError};

/// Default capacity of per-stream frame channels.
pub const CHANNEL_CAPACITY: usize = 64;

/// Peer identity reported for in-process streams.
pub const PEER: &str = "in-process";

/// Create a connected in-process listener and connector.
///
/// `capacity` bounds both the queue of not-yet-accepted streams and each
/// stream's frame channels.
pub fn listener(capacity: usize) -> (MemListener, MemConnector) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let listener = MemListener {
        rx: Arc::new(Mutex::new(rx)),
    };
    (listener, MemConnector { tx, capacity })
}

/// Server side of an in-process endpoint.
///
/// Clones share one queue, so one clone can run the accept loop while
/// another closes the endpoint. Only one clone should accept at a time.
#[derive(Debug, Clone)]
pub struct MemListener {
    rx: Arc<Mutex<mpsc::Receiver<IncomingStream>>>,
}

impl MemListener {
    /// Next opened stream, or `None` once every connector is dropped or the
    /// listener was closed and drained.
    pub async fn accept(&self) -> Option<IncomingStream> {
        poll_fn(|cx| self.rx.lock().poll_recv(cx)).await
    }

    /// Take a queued stream without waiting.
    pub fn try_accept(&self) -> Option<IncomingStream> {
        self.rx.lock().try_recv().ok()
    }

    /// Refuse further streams. `open` fails from the moment this returns;
    /// streams queued before can still be accepted.
    pub fn close(&self) {
        self.rx.lock().close();
    }
}

/// Client side of an in-process endpoint.
#[derive(Debug, Clone)]
pub struct MemConnector {
    tx: mpsc::Sender<IncomingStream>,
    capacity: usize,
}

impl MemConnector {
    /// Open a stream to `path`.
    ///
    /// Fails with [`TransportError::Closed`] once the listener is gone.
    pub async fn open(
        &self,
        path: &str,
        headers: HeaderList,
    ) -> Result<ClientStream, TransportError> {
        let (req_tx, req_rx) = mpsc::channel(self.capacity);
        let (resp_tx, resp_rx) = mpsc::channel(self.capacity);
        let stream = IncomingStream {
            path: path.to_string(),
            headers,
            peer: PEER.to_string(),
            inbound: req_rx,
            outbound: ResponseSink::direct(resp_tx),
        };
        self.tx
            .send(stream)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(ClientStream::new(req_tx, resp_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
