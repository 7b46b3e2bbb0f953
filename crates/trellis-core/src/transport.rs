//! Transport contract between the dispatcher and a multiplexed connection.
//!
//! A backend delivers one [`IncomingStream`] per client stream: the request
//! path and headers, an ordered channel of [`RequestFrame`]s, and a
//! [`ResponseSink`] accepting header blocks, data frames and a terminal
//! trailer block. The client end of a stream is a [`ClientStream`].
//!
//! Backends live in their own modules under `transport/`:
//! - [`mem`]: in-process, channel based.
//! - [`stream`]: varint-framed multiplexing over any byte stream (TCP, TLS).

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::message::{self, MessageBuffer};
use crate::metadata::{HeaderList, Metadata, MetadataError};
use crate::status::Status;

/// Frame flowing from the client to the server on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFrame {
    /// A chunk of length-prefixed request messages.
    Data(Bytes),
    /// The client finished sending requests.
    End,
    /// The client aborted the stream.
    Reset,
}

/// Frame flowing from the server to the client on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// Response header block, sent at most once and before any data.
    Headers(HeaderList),
    /// A chunk of length-prefixed response messages.
    Data(Bytes),
    /// Terminal trailer block carrying the status.
    Trailers(HeaderList),
}

/// A new stream as seen by the server.
///
/// A closed `inbound` channel that never delivered [`RequestFrame::End`]
/// means the client went away and is treated like a reset. After the end,
/// a departing client shows up as a [`RequestFrame::Reset`] or as
/// [`ResponseSink::closed`] resolving.
#[derive(Debug)]
pub struct IncomingStream {
    pub path: String,
    pub headers: HeaderList,
    pub peer: String,
    pub inbound: mpsc::Receiver<RequestFrame>,
    pub outbound: ResponseSink,
}

/// Server-side writer for one stream's response frames.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    inner: SinkInner,
}

#[derive(Debug, Clone)]
enum SinkInner {
    /// Dedicated per-stream channel.
    Direct(mpsc::Sender<ResponseFrame>),
    /// Connection-wide channel shared by all streams, tagged with the id.
    Muxed {
        id: u32,
        tx: mpsc::Sender<(u32, ResponseFrame)>,
    },
}

impl ResponseSink {
    pub fn direct(tx: mpsc::Sender<ResponseFrame>) -> Self {
        ResponseSink {
            inner: SinkInner::Direct(tx),
        }
    }

    pub fn muxed(id: u32, tx: mpsc::Sender<(u32, ResponseFrame)>) -> Self {
        ResponseSink {
            inner: SinkInner::Muxed { id, tx },
        }
    }

    pub async fn send(&self, frame: ResponseFrame) -> Result<(), TransportError> {
        match &self.inner {
            SinkInner::Direct(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            SinkInner::Muxed { id, tx } => {
                tx.send((*id, frame)).await.map_err(|_| TransportError::Closed)
            }
        }
    }

    /// Queue `frame` without waiting.
    pub fn try_send(&self, frame: ResponseFrame) -> Result<(), TransportError> {
        fn refused<T>(err: mpsc::error::TrySendError<T>) -> TransportError {
            match err {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }
        }
        match &self.inner {
            SinkInner::Direct(tx) => tx.try_send(frame).map_err(refused),
            SinkInner::Muxed { id, tx } => tx.try_send((*id, frame)).map_err(refused),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SinkInner::Direct(tx) => tx.is_closed(),
            SinkInner::Muxed { tx, .. } => tx.is_closed(),
        }
    }

    /// Resolves once nobody reads this stream's responses anymore: the
    /// client dropped its end, or the whole connection went away.
    pub async fn closed(&self) {
        match &self.inner {
            SinkInner::Direct(tx) => tx.closed().await,
            SinkInner::Muxed { tx, .. } => tx.closed().await,
        }
    }
}

/// Client end of one stream.
#[derive(Debug)]
pub struct ClientStream {
    outbound: mpsc::Sender<RequestFrame>,
    inbound: mpsc::Receiver<ResponseFrame>,
}

impl ClientStream {
    pub fn new(
        outbound: mpsc::Sender<RequestFrame>,
        inbound: mpsc::Receiver<ResponseFrame>,
    ) -> Self {
        ClientStream { outbound, inbound }
    }

    /// Send one request message, framed with the message prefix.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        let framed = message::frame(payload).map_err(protocol)?;
        self.send_data(framed).await
    }

    /// Send raw data frame bytes as-is.
    pub async fn send_data(&self, data: Bytes) -> Result<(), TransportError> {
        self.send(RequestFrame::Data(data)).await
    }

    /// Signal end of requests.
    pub async fn end(&self) -> Result<(), TransportError> {
        self.send(RequestFrame::End).await
    }

    /// Abort the stream.
    pub async fn reset(&self) -> Result<(), TransportError> {
        self.send(RequestFrame::Reset).await
    }

    async fn send(&self, frame: RequestFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next response frame, or `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<ResponseFrame> {
        self.inbound.recv().await
    }

    /// Read the rest of the response up to and including the trailers.
    pub async fn collect(mut self) -> Result<CallResponse, TransportError> {
        let mut headers = HeaderList::new();
        let mut messages = Vec::new();
        let mut buf = MessageBuffer::new(None);
        while let Some(frame) = self.inbound.recv().await {
            match frame {
                ResponseFrame::Headers(h) => headers = h,
                ResponseFrame::Data(data) => {
                    buf.push(&data);
                    while let Some(msg) = buf.try_decode().map_err(protocol)? {
                        messages.push(msg);
                    }
                }
                ResponseFrame::Trailers(trailers) => {
                    buf.finish().map_err(protocol)?;
                    let status = Status::from_trailers(&trailers).map_err(protocol)?;
                    return Ok(CallResponse {
                        headers,
                        messages,
                        status,
                    });
                }
            }
        }
        Err(TransportError::Closed)
    }
}

fn protocol(err: impl fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

/// A complete response as observed by a client.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// Response header block; empty for a trailers-only response.
    pub headers: HeaderList,
    /// Decoded response message payloads, in order.
    pub messages: Vec<Bytes>,
    pub status: Status,
}

impl CallResponse {
    /// Custom response metadata, without reserved headers.
    pub fn metadata(&self) -> Result<Metadata, MetadataError> {
        let mut md = Metadata::from_headers(&self.headers)?;
        md.remove("content-type");
        Ok(md)
    }

    /// Concatenate the decoded payloads, for assertions in tests.
    pub fn payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        for m in &self.messages {
            out.extend_from_slice(m);
        }
        out.freeze()
    }
}

/// Error from a transport backend.
#[derive(Debug)]
pub enum TransportError {
    /// The peer or the listener is gone.
    Closed,
    /// A non-blocking send found the frame channel full.
    Full,
    Io(std::io::Error),
    /// The peer violated the framing protocol.
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Full => write!(f, "frame channel full"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
