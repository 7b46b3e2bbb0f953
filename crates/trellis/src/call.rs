//! Call surfaces: what a handler sees of one call.
//!
//! Every surface dereferences to a [`CallContext`], which carries the
//! request metadata, the peer, the cancellation flag and `send_metadata`.
//! Writes and completions made after the call has terminated, for example
//! after the client cancelled, are dropped without error.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use trellis_core::{Metadata, Status};

use crate::inflight::{CallControl, MetadataRefusal};

/// Output a handler sends to the call's driver.
pub(crate) enum Reply<Res> {
    Metadata(Metadata),
    Message(Res),
    Finish(Status),
    Complete {
        result: Result<Res, Status>,
        trailer: Metadata,
    },
}

pub(crate) struct CallShared {
    pub(crate) path: String,
    pub(crate) peer: String,
    pub(crate) metadata: Metadata,
    pub(crate) control: Arc<CallControl>,
}

/// Operations every call surface shares.
pub struct CallContext<Res> {
    shared: Arc<CallShared>,
    replies: mpsc::Sender<Reply<Res>>,
}

impl<Res> Clone for CallContext<Res> {
    fn clone(&self) -> Self {
        CallContext {
            shared: self.shared.clone(),
            replies: self.replies.clone(),
        }
    }
}

impl<Res> fmt::Debug for CallContext<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("path", &self.shared.path)
            .field("peer", &self.shared.peer)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<Res> CallContext<Res> {
    pub(crate) fn new(shared: Arc<CallShared>, replies: mpsc::Sender<Reply<Res>>) -> Self {
        CallContext { shared, replies }
    }

    /// Method path of the call, e.g. `/pkg.Service/Method`.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Transport-level identity of the client.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Request metadata, without transport-reserved headers.
    pub fn metadata(&self) -> &Metadata {
        &self.shared.metadata
    }

    /// Whether the client aborted the call (or the server was forced down).
    pub fn is_cancelled(&self) -> bool {
        self.shared.control.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.shared.control.cancelled().await
    }

    /// Send response headers.
    ///
    /// Allowed once, before the first response message. Later calls are
    /// logged and ignored.
    pub fn send_metadata(&self, metadata: Metadata) {
        match self.shared.control.claim_metadata() {
            Ok(()) => {
                if self.replies.try_send(Reply::Metadata(metadata)).is_err() {
                    tracing::debug!(path = %self.shared.path, "call already terminated; metadata dropped");
                }
            }
            Err(MetadataRefusal::AlreadySent) => {
                tracing::warn!(path = %self.shared.path, "response metadata sent more than once; ignoring");
            }
            Err(MetadataRefusal::AfterMessage) => {
                tracing::warn!(
                    path = %self.shared.path,
                    "response metadata sent after the first response message; ignoring"
                );
            }
            Err(MetadataRefusal::AfterEnd) => {
                tracing::warn!(path = %self.shared.path, "response metadata sent after the call ended; ignoring");
            }
        }
    }
}

/// Completion callback for unary and client-streaming calls.
///
/// Cloneable; the first [`send`](UnaryCallback::send) wins and later ones
/// are logged and ignored. A call whose callback is never invoked stays
/// open until the client cancels or the server is forced down.
pub struct UnaryCallback<Res> {
    ctx: CallContext<Res>,
}

impl<Res> Clone for UnaryCallback<Res> {
    fn clone(&self) -> Self {
        UnaryCallback {
            ctx: self.ctx.clone(),
        }
    }
}

impl<Res> fmt::Debug for UnaryCallback<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryCallback")
            .field("path", &self.ctx.shared.path)
            .field("completed", &self.ctx.shared.control.is_finished())
            .finish()
    }
}

impl<Res> UnaryCallback<Res> {
    pub(crate) fn new(ctx: CallContext<Res>) -> Self {
        UnaryCallback { ctx }
    }

    /// Complete the call with a response or an error status.
    ///
    /// An error carrying code `OK` is reported as `UNKNOWN`.
    pub fn send(&self, result: Result<Res, Status>) {
        self.send_with_trailer(result, Metadata::new())
    }

    /// Complete the call, adding `trailer` to the trailing metadata.
    pub fn send_with_trailer(&self, result: Result<Res, Status>, trailer: Metadata) {
        if !self.ctx.shared.control.claim_finish() {
            if self.ctx.is_cancelled() {
                tracing::debug!(path = %self.ctx.shared.path, "call already terminated; completion dropped");
            } else {
                tracing::warn!(path = %self.ctx.shared.path, "completion callback invoked more than once; ignoring");
            }
            return;
        }
        if self
            .ctx
            .replies
            .try_send(Reply::Complete { result, trailer })
            .is_err()
        {
            tracing::debug!(path = %self.ctx.shared.path, "call already terminated; completion dropped");
        }
    }
}

/// Surface of a unary call: the single decoded request.
pub struct UnaryCall<Req, Res> {
    ctx: CallContext<Res>,
    request: Req,
}

impl<Req, Res> UnaryCall<Req, Res> {
    pub(crate) fn new(ctx: CallContext<Res>, request: Req) -> Self {
        UnaryCall { ctx, request }
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn into_request(self) -> Req {
        self.request
    }
}

impl<Req, Res> Deref for UnaryCall<Req, Res> {
    type Target = CallContext<Res>;

    fn deref(&self) -> &CallContext<Res> {
        &self.ctx
    }
}

impl<Req: fmt::Debug, Res> fmt::Debug for UnaryCall<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryCall")
            .field("ctx", &self.ctx)
            .field("request", &self.request)
            .finish()
    }
}

/// Surface of a client-streaming call.
///
/// The handler runs once the client finished sending; the surface is a
/// [`Stream`] over every request received.
pub struct ClientStreamingCall<Req, Res> {
    ctx: CallContext<Res>,
    requests: VecDeque<Req>,
}

impl<Req, Res> ClientStreamingCall<Req, Res> {
    pub(crate) fn new(ctx: CallContext<Res>, requests: Vec<Req>) -> Self {
        ClientStreamingCall {
            ctx,
            requests: requests.into(),
        }
    }

    /// Requests not yet consumed.
    pub fn remaining(&self) -> usize {
        self.requests.len()
    }

    pub fn into_requests(self) -> Vec<Req> {
        self.requests.into()
    }
}

impl<Req, Res> Unpin for ClientStreamingCall<Req, Res> {}

impl<Req, Res> Stream for ClientStreamingCall<Req, Res> {
    type Item = Req;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Req>> {
        Poll::Ready(self.get_mut().requests.pop_front())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.requests.len(), Some(self.requests.len()))
    }
}

impl<Req, Res> Deref for ClientStreamingCall<Req, Res> {
    type Target = CallContext<Res>;

    fn deref(&self) -> &CallContext<Res> {
        &self.ctx
    }
}

/// Live sequence of requests, fed as frames arrive.
///
/// Ends when the client finishes sending or the call terminates.
pub struct RequestStream<Req> {
    rx: mpsc::UnboundedReceiver<Req>,
}

impl<Req> RequestStream<Req> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Req>) -> Self {
        RequestStream { rx }
    }

    /// Next request, or `None` once the request side is done.
    pub async fn recv(&mut self) -> Option<Req> {
        self.rx.recv().await
    }
}

impl<Req> Stream for RequestStream<Req> {
    type Item = Req;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Req>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<Req> fmt::Debug for RequestStream<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream").finish_non_exhaustive()
    }
}

/// Writes response messages of a streaming-response call.
///
/// Cloneable, so several tasks can write; messages are sent in the order
/// the writes complete.
pub struct ResponseWriter<Res> {
    ctx: CallContext<Res>,
}

impl<Res> Clone for ResponseWriter<Res> {
    fn clone(&self) -> Self {
        ResponseWriter {
            ctx: self.ctx.clone(),
        }
    }
}

impl<Res> fmt::Debug for ResponseWriter<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResponseWriter").field(&self.ctx).finish()
    }
}

impl<Res> ResponseWriter<Res> {
    pub(crate) fn new(ctx: CallContext<Res>) -> Self {
        ResponseWriter { ctx }
    }

    /// Send one response message.
    pub async fn write(&self, value: Res) {
        let control = &self.ctx.shared.control;
        if control.is_finished() {
            tracing::debug!(path = %self.ctx.shared.path, "write after end; dropping");
            return;
        }
        control.mark_message_written();
        // A closed channel means the call already terminated.
        let _ = self.ctx.replies.send(Reply::Message(value)).await;
    }

    /// End the call with `OK`.
    pub async fn end(&self) {
        self.end_with_status(Status::ok()).await
    }

    /// End the call with `OK` and trailing metadata.
    pub async fn end_with_trailer(&self, trailer: Metadata) {
        self.end_with_status(Status::ok().with_metadata(trailer)).await
    }

    /// End the call with an explicit status.
    pub async fn end_with_status(&self, status: Status) {
        if !self.ctx.shared.control.claim_finish() {
            if self.ctx.is_cancelled() {
                tracing::debug!(path = %self.ctx.shared.path, "call already terminated; end dropped");
            } else {
                tracing::warn!(path = %self.ctx.shared.path, "response stream ended more than once; ignoring");
            }
            return;
        }
        let _ = self.ctx.replies.send(Reply::Finish(status)).await;
    }
}

impl<Res> Deref for ResponseWriter<Res> {
    type Target = CallContext<Res>;

    fn deref(&self) -> &CallContext<Res> {
        &self.ctx
    }
}

/// Surface of a server-streaming call.
///
/// The handler starts before the request arrives; [`request`] waits for it.
///
/// [`request`]: ServerStreamingCall::request
pub struct ServerStreamingCall<Req, Res> {
    writer: ResponseWriter<Res>,
    requests: RequestStream<Req>,
    request: Option<Req>,
}

impl<Req, Res> ServerStreamingCall<Req, Res> {
    pub(crate) fn new(writer: ResponseWriter<Res>, requests: RequestStream<Req>) -> Self {
        ServerStreamingCall {
            writer,
            requests,
            request: None,
        }
    }

    /// Wait for the single request. `None` if the call terminated first.
    pub async fn request(&mut self) -> Option<&Req> {
        if self.request.is_none() {
            self.request = self.requests.recv().await;
        }
        self.request.as_ref()
    }

    /// Like [`request`](ServerStreamingCall::request), taking ownership.
    pub async fn take_request(&mut self) -> Option<Req> {
        match self.request.take() {
            Some(req) => Some(req),
            None => self.requests.recv().await,
        }
    }

    pub fn writer(&self) -> ResponseWriter<Res> {
        self.writer.clone()
    }
}

impl<Req, Res> Deref for ServerStreamingCall<Req, Res> {
    type Target = ResponseWriter<Res>;

    fn deref(&self) -> &ResponseWriter<Res> {
        &self.writer
    }
}

/// Surface of a bidirectional-streaming call.
///
/// A [`Stream`] of requests plus the [`ResponseWriter`] operations. Use
/// [`split`](BidiStreamingCall::split) to read and write from different
/// tasks.
pub struct BidiStreamingCall<Req, Res> {
    writer: ResponseWriter<Res>,
    requests: RequestStream<Req>,
}

impl<Req, Res> BidiStreamingCall<Req, Res> {
    pub(crate) fn new(writer: ResponseWriter<Res>, requests: RequestStream<Req>) -> Self {
        BidiStreamingCall { writer, requests }
    }

    pub async fn recv(&mut self) -> Option<Req> {
        self.requests.recv().await
    }

    pub fn split(self) -> (RequestStream<Req>, ResponseWriter<Res>) {
        (self.requests, self.writer)
    }
}

impl<Req, Res> Stream for BidiStreamingCall<Req, Res> {
    type Item = Req;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Req>> {
        Pin::new(&mut self.get_mut().requests).poll_next(cx)
    }
}

impl<Req, Res> Deref for BidiStreamingCall<Req, Res> {
    type Target = ResponseWriter<Res>;

    fn deref(&self) -> &ResponseWriter<Res> {
        &self.writer
    }
}
