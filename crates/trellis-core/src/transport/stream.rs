//! Multiplexed streams over a single byte stream.
//!
//! Every frame on the wire is
//!
//! ```text
//! varint length | u32 stream id (LE) | u8 kind | payload
//! ```
//!
//! where `length` covers id, kind and payload. A stream opens with a
//! HEADERS frame whose header block includes the `:path` pseudo-header.
//! Header blocks are a varint count followed by varint-length-prefixed
//! name and value strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::metadata::HeaderList;

use super::{ClientStream, IncomingStream, RequestFrame, ResponseFrame, ResponseSink, TransportError};

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on a single wire frame (16 MiB).
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Size of the stream id and kind that precede every payload.
const FRAME_HEADER_LEN: usize = 5;

/// Default capacity of the connection and per-stream frame channels.
pub const DEFAULT_CAPACITY: usize = 64;

/// Pseudo-header carrying the request path.
pub const PATH_HEADER: &str = ":path";

const KIND_HEADERS: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_END: u8 = 2;
const KIND_RESET: u8 = 3;
const KIND_TRAILERS: u8 = 4;

fn encode_varint(mut value: u64, out: &mut BytesMut) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

/// Decode a varint from the front of `buf`, advancing it.
fn decode_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

enum VarintResult {
    Value(u64),
    /// Stream ended before any varint bytes were read.
    CleanEof,
    TruncatedVarint,
    TooLong,
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<VarintResult, std::io::Error> {
    let mut value: u64 = 0;
    for bytes_read in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(if bytes_read == 0 {
                    VarintResult::CleanEof
                } else {
                    VarintResult::TruncatedVarint
                });
            }
            Err(e) => return Err(e),
        }
        value |= ((byte[0] & 0x7F) as u64) << (7 * bytes_read);
        if byte[0] & 0x80 == 0 {
            return Ok(VarintResult::Value(value));
        }
    }
    Ok(VarintResult::TooLong)
}

#[derive(Debug)]
struct WireFrame {
    id: u32,
    kind: u8,
    payload: Bytes,
}

fn encode_frame(id: u32, kind: u8, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(MAX_VARINT_LEN + FRAME_HEADER_LEN + payload.len());
    encode_varint((FRAME_HEADER_LEN + payload.len()) as u64, &mut out);
    out.put_u32_le(id);
    out.put_u8(kind);
    out.put_slice(payload);
    out
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: u32,
    kind: u8,
    payload: &[u8],
) -> Result<(), TransportError> {
    let frame = encode_frame(id, kind, payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean close between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WireFrame>, TransportError> {
    let len = match read_varint(reader).await? {
        VarintResult::Value(len) => len as usize,
        VarintResult::CleanEof => return Ok(None),
        VarintResult::TruncatedVarint => {
            return Err(TransportError::Protocol("connection closed inside a frame length".into()));
        }
        VarintResult::TooLong => {
            return Err(TransportError::Protocol("frame length varint too long".into()));
        }
    };
    if len < FRAME_HEADER_LEN {
        return Err(TransportError::Protocol(format!("frame too short: {} bytes", len)));
    }
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_LEN
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let mut buf = Bytes::from(buf);
    let id = buf.get_u32_le();
    let kind = buf.get_u8();
    Ok(Some(WireFrame {
        id,
        kind,
        payload: buf,
    }))
}

fn encode_headers(headers: &[(String, String)]) -> Bytes {
    let mut out = BytesMut::new();
    encode_varint(headers.len() as u64, &mut out);
    for (name, value) in headers {
        encode_varint(name.len() as u64, &mut out);
        out.put_slice(name.as_bytes());
        encode_varint(value.len() as u64, &mut out);
        out.put_slice(value.as_bytes());
    }
    out.freeze()
}

fn decode_headers(mut buf: &[u8]) -> Result<HeaderList, TransportError> {
    fn malformed() -> TransportError {
        TransportError::Protocol("malformed header block".into())
    }
    fn string(buf: &mut &[u8]) -> Result<String, TransportError> {
        let len = decode_varint(buf).ok_or_else(malformed)? as usize;
        if buf.len() < len {
            return Err(malformed());
        }
        let (s, rest) = buf.split_at(len);
        *buf = rest;
        String::from_utf8(s.to_vec()).map_err(|_| malformed())
    }

    let count = decode_varint(&mut buf).ok_or_else(malformed)? as usize;
    let mut headers = HeaderList::with_capacity(count.min(64));
    for _ in 0..count {
        let name = string(&mut buf)?;
        let value = string(&mut buf)?;
        headers.push((name, value));
    }
    if !buf.is_empty() {
        return Err(malformed());
    }
    Ok(headers)
}

type StreamMap<T> = Arc<Mutex<HashMap<u32, mpsc::Sender<T>>>>;

fn sender<T>(map: &StreamMap<T>, id: u32) -> Option<mpsc::Sender<T>> {
    map.lock().get(&id).cloned()
}

/// Serve the server side of one connection.
///
/// Each stream the client opens is handed to `incoming`. Returns once the
/// connection is closed and every stream's response has been written (or
/// the connection failed). Streams still open when the client disconnects
/// receive [`RequestFrame::Reset`].
pub async fn serve_connection<S>(
    io: S,
    peer: String,
    incoming: mpsc::Sender<IncomingStream>,
    capacity: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let capacity = capacity.max(1);
    let (mut reader, mut writer) = tokio::io::split(io);
    let streams: StreamMap<RequestFrame> = Arc::new(Mutex::new(HashMap::new()));
    let (out_tx, mut out_rx) = mpsc::channel::<(u32, ResponseFrame)>(capacity);

    let write_streams = streams.clone();
    let write_loop = async move {
        while let Some((id, frame)) = out_rx.recv().await {
            let (kind, payload) = match frame {
                ResponseFrame::Headers(h) => (KIND_HEADERS, encode_headers(&h)),
                ResponseFrame::Data(data) => (KIND_DATA, data),
                ResponseFrame::Trailers(t) => {
                    write_streams.lock().remove(&id);
                    (KIND_TRAILERS, encode_headers(&t))
                }
            };
            write_frame(&mut writer, id, kind, &payload).await?;
        }
        let _ = writer.shutdown().await;
        Ok::<_, TransportError>(())
    };

    let read_streams = streams.clone();
    let read_loop = async move {
        let result = read_requests(&mut reader, &peer, &read_streams, &incoming, out_tx, capacity).await;
        // Whatever is still open lost its client.
        let orphaned: Vec<_> = read_streams.lock().drain().map(|(_, tx)| tx).collect();
        for tx in orphaned {
            let _ = tx.try_send(RequestFrame::Reset);
        }
        result
    };

    let (read, write) = tokio::join!(read_loop, write_loop);
    read.and(write)
}

async fn read_requests<R: AsyncRead + Unpin>(
    reader: &mut R,
    peer: &str,
    streams: &StreamMap<RequestFrame>,
    incoming: &mpsc::Sender<IncomingStream>,
    out_tx: mpsc::Sender<(u32, ResponseFrame)>,
    capacity: usize,
) -> Result<(), TransportError> {
    while let Some(frame) = read_frame(reader).await? {
        match frame.kind {
            KIND_HEADERS => {
                let mut headers = decode_headers(&frame.payload)?;
                let Some(pos) = headers.iter().position(|(n, _)| n == PATH_HEADER) else {
                    return Err(TransportError::Protocol(format!(
                        "stream {} opened without {}",
                        frame.id, PATH_HEADER
                    )));
                };
                let (_, path) = headers.remove(pos);
                let (tx, rx) = mpsc::channel(capacity);
                if streams.lock().insert(frame.id, tx).is_some() {
                    return Err(TransportError::Protocol(format!(
                        "stream {} opened twice",
                        frame.id
                    )));
                }
                let stream = IncomingStream {
                    path,
                    headers,
                    peer: peer.to_string(),
                    inbound: rx,
                    outbound: ResponseSink::muxed(frame.id, out_tx.clone()),
                };
                if incoming.send(stream).await.is_err() {
                    tracing::debug!(peer, "server stopped taking streams");
                    return Ok(());
                }
            }
            KIND_DATA | KIND_END => {
                let req = if frame.kind == KIND_DATA {
                    RequestFrame::Data(frame.payload)
                } else {
                    RequestFrame::End
                };
                if let Some(tx) = sender(streams, frame.id) {
                    let _ = tx.send(req).await;
                }
            }
            KIND_RESET => {
                let tx = streams.lock().remove(&frame.id);
                if let Some(tx) = tx {
                    let _ = tx.send(RequestFrame::Reset).await;
                }
            }
            kind => {
                return Err(TransportError::Protocol(format!("unexpected frame kind {}", kind)));
            }
        }
    }
    Ok(())
}

enum Outbound {
    Open(HeaderList),
    Frame(RequestFrame),
}

/// Client side of a multiplexed connection.
///
/// Spawns a reader and a writer task on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    out_tx: mpsc::Sender<(u32, Outbound)>,
    streams: StreamMap<ResponseFrame>,
    next_id: AtomicU32,
    capacity: usize,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Open(_) => f.write_str("Open"),
            Outbound::Frame(frame) => write!(f, "Frame({:?})", frame),
        }
    }
}

impl StreamClient {
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_capacity(io, DEFAULT_CAPACITY)
    }

    pub fn with_capacity<S>(io: S, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (mut reader, mut writer) = tokio::io::split(io);
        let (out_tx, mut out_rx) = mpsc::channel::<(u32, Outbound)>(capacity);
        let streams: StreamMap<ResponseFrame> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some((id, out)) = out_rx.recv().await {
                let (kind, payload) = match out {
                    Outbound::Open(headers) => (KIND_HEADERS, encode_headers(&headers)),
                    Outbound::Frame(RequestFrame::Data(data)) => (KIND_DATA, data),
                    Outbound::Frame(RequestFrame::End) => (KIND_END, Bytes::new()),
                    Outbound::Frame(RequestFrame::Reset) => (KIND_RESET, Bytes::new()),
                };
                if let Err(e) = write_frame(&mut writer, id, kind, &payload).await {
                    tracing::debug!(error = %e, "client connection write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let read_streams = streams.clone();
        tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "client connection read failed");
                        break;
                    }
                };
                let resp = match frame.kind {
                    KIND_HEADERS | KIND_TRAILERS => match decode_headers(&frame.payload) {
                        Ok(h) if frame.kind == KIND_HEADERS => ResponseFrame::Headers(h),
                        Ok(t) => ResponseFrame::Trailers(t),
                        Err(e) => {
                            tracing::debug!(error = %e, "bad header block from server");
                            break;
                        }
                    },
                    KIND_DATA => ResponseFrame::Data(frame.payload),
                    _ => continue,
                };
                let terminal = matches!(resp, ResponseFrame::Trailers(_));
                let tx = if terminal {
                    read_streams.lock().remove(&frame.id)
                } else {
                    sender(&read_streams, frame.id)
                };
                if let Some(tx) = tx {
                    let _ = tx.send(resp).await;
                }
            }
            read_streams.lock().clear();
        });

        StreamClient {
            inner: Arc::new(ClientInner {
                out_tx,
                streams,
                next_id: AtomicU32::new(1),
                capacity,
            }),
        }
    }

    /// Open a stream to `path`.
    ///
    /// Dropping the returned stream before its trailers arrived resets it,
    /// whether or not it sent [`RequestFrame::End`].
    pub async fn open(&self, path: &str, headers: HeaderList) -> Result<ClientStream, TransportError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = mpsc::channel(self.inner.capacity);
        self.inner.streams.lock().insert(id, resp_tx);

        let mut block = HeaderList::with_capacity(headers.len() + 1);
        block.push((PATH_HEADER.to_string(), path.to_string()));
        block.extend(headers);
        if self.inner.out_tx.send((id, Outbound::Open(block))).await.is_err() {
            self.inner.streams.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        let (req_tx, mut req_rx) = mpsc::channel(self.inner.capacity);
        let out_tx = self.inner.out_tx.clone();
        let streams = self.inner.streams.clone();
        tokio::spawn(async move {
            let mut reset = false;
            while let Some(frame) = req_rx.recv().await {
                reset = matches!(frame, RequestFrame::Reset);
                if out_tx.send((id, Outbound::Frame(frame))).await.is_err() {
                    return;
                }
            }
            // The reader removes a stream once its trailers arrive; one
            // still registered here was abandoned mid-response.
            let abandoned = streams.lock().remove(&id).is_some();
            if abandoned && !reset {
                let _ = out_tx.send((id, Outbound::Frame(RequestFrame::Reset))).await;
            }
        });

        Ok(ClientStream::new(req_tx, resp_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.out_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Code, Status};

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut out = BytesMut::new();
            encode_varint(value, &mut out);
            let mut slice = &out[..];
            assert_eq!(decode_varint(&mut slice), Some(value));
            assert!(slice.is_empty());
        }
        let mut truncated: &[u8] = &[0x80, 0x80];
        assert_eq!(decode_varint(&mut truncated), None);
    }

    #[test]
    fn header_block_layout() {
        let block = encode_headers(&[(":path".into(), "/a/b".into())]);
        assert_eq!(&block[..], b"\x01\x05:path\x04/a/b");
        assert_eq!(
            decode_headers(&block).unwrap(),
            vec![(":path".to_string(), "/a/b".to_string())]
        );
        assert!(decode_headers(b"\x01\x05:pa").is_err());
        assert!(decode_headers(b"\x00extra").is_err());
    }

    #[tokio::test]
    async fn frame_round_trip_and_clean_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, 9, KIND_DATA, b"payload").await.unwrap();
        drop(a);
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame.id, 9);
        assert_eq!(frame.kind, KIND_DATA);
        assert_eq!(&frame.payload[..], b"payload");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_short_frames() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[2, 0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn client_and_server_exchange_a_call() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(4);
        let server = tokio::spawn(serve_connection(server_io, "peer-1".into(), tx, 16));

        let client = StreamClient::new(client_io);
        let call = client
            .open("/pkg.Echo/Say", vec![("x-trace".into(), "t1".into())])
            .await
            .unwrap();
        call.send_message(b"hi").await.unwrap();
        call.end().await.unwrap();

        let mut incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.path, "/pkg.Echo/Say");
        assert_eq!(incoming.headers, vec![("x-trace".to_string(), "t1".to_string())]);
        assert_eq!(incoming.peer, "peer-1");
        assert!(matches!(incoming.inbound.recv().await, Some(RequestFrame::Data(_))));
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::End));

        let out = incoming.outbound.clone();
        out.send(ResponseFrame::Headers(vec![(":status".into(), "200".into())]))
            .await
            .unwrap();
        out.send(ResponseFrame::Data(crate::message::frame(b"hello").unwrap()))
            .await
            .unwrap();
        out.send(ResponseFrame::Trailers(Status::ok().to_trailers()))
            .await
            .unwrap();

        let response = call.collect().await.unwrap();
        assert_eq!(response.messages, vec![Bytes::from("hello")]);
        assert_eq!(response.status.code(), Code::Ok);

        drop((incoming, out, client, rx));
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_client_stream_resets_it() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(serve_connection(server_io, "peer".into(), tx, 16));

        let client = StreamClient::new(client_io);
        let call = client.open("/a/b", vec![]).await.unwrap();
        let mut incoming = rx.recv().await.unwrap();
        drop(call);
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::Reset));
    }

    #[tokio::test]
    async fn dropping_client_stream_after_end_resets_it() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(serve_connection(server_io, "peer".into(), tx, 16));

        let client = StreamClient::new(client_io);
        let call = client.open("/a/b", vec![]).await.unwrap();
        call.end().await.unwrap();
        let mut incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::End));
        drop(call);
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::Reset));
    }

    #[tokio::test]
    async fn finished_stream_is_not_reset_on_drop() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(serve_connection(server_io, "peer".into(), tx, 16));

        let client = StreamClient::new(client_io);
        let call = client.open("/a/b", vec![]).await.unwrap();
        call.end().await.unwrap();
        let mut incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::End));
        incoming
            .outbound
            .send(ResponseFrame::Trailers(Status::ok().to_trailers()))
            .await
            .unwrap();
        let response = call.collect().await.unwrap();
        assert_eq!(response.status.code(), Code::Ok);

        // The server forgot the stream with its trailers, so a reset would
        // not reach it; the channel just closes.
        assert_eq!(incoming.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn closing_connection_resets_open_streams() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(serve_connection(server_io, "peer".into(), tx, 16));

        let mut client_io = client_io;
        let open = encode_headers(&[(PATH_HEADER.into(), "/a/b".into())]);
        client_io.write_all(&encode_frame(1, KIND_HEADERS, &open)).await.unwrap();

        let mut incoming = rx.recv().await.unwrap();
        drop(client_io);
        assert_eq!(incoming.inbound.recv().await, Some(RequestFrame::Reset));
    }
}
