//! Per-call driver.
//!
//! Every resolved stream gets one driver task. It is the only writer of the
//! stream's response frames and walks the call through
//! `RECEIVING_REQUEST -> HANDLER_RUNNING -> SENDING_RESPONSE -> TERMINATED`:
//!
//! - Unary and client-streaming calls buffer request messages until the
//!   client ends its side, then invoke the handler once.
//! - Server-streaming and bidi calls invoke the handler right away and feed
//!   request messages into its live sequence as frames arrive.
//!
//! The handler runs in its own task and talks to the driver through a
//! reply channel, so a slow or stuck handler never blocks frame intake,
//! and a panicking one is turned into `UNKNOWN`. Exactly one trailer block
//! is written per call.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use trellis_core::message::{self, MessageBuffer};
use trellis_core::{
    HeaderList, IncomingStream, Metadata, MetadataError, RequestFrame, ResponseFrame, ResponseSink,
    Status,
};

use crate::call::{
    BidiStreamingCall, CallContext, CallShared, ClientStreamingCall, Reply, RequestStream,
    ResponseWriter, ServerStreamingCall, UnaryCall, UnaryCallback,
};
use crate::handler::Handler;
use crate::inflight::CallControl;
use crate::options::ServerOptions;
use crate::registry::{MethodKind, RegisteredMethod};

/// Request headers owned by the transport, never shown to handlers.
pub const RESERVED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "te",
    "user-agent",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
];

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    ReceivingRequest,
    HandlerRunning,
    SendingResponse,
    Terminated,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::ReceivingRequest => "RECEIVING_REQUEST",
            CallState::HandlerRunning => "HANDLER_RUNNING",
            CallState::SendingResponse => "SENDING_RESPONSE",
            CallState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved stream handed to a method's driver.
pub(crate) struct IncomingCall {
    pub(crate) stream: IncomingStream,
    pub(crate) control: Arc<CallControl>,
    pub(crate) options: Arc<ServerOptions>,
}

/// Status for a path with no registered method.
pub(crate) fn unimplemented(path: &str) -> Status {
    Status::unimplemented(format!("The server does not implement the method {}", path))
}

/// Status for streams refused while the server shuts down.
pub(crate) fn shutting_down() -> Status {
    Status::unavailable("server is shutting down")
}

/// Answer a stream with a trailers-only response, without running a driver.
pub(crate) async fn reject(outbound: ResponseSink, status: Status) {
    let _ = outbound
        .send(ResponseFrame::Trailers(status.to_trailers()))
        .await;
}

/// Request metadata from stream headers, minus reserved headers.
pub(crate) fn request_metadata(headers: &[(String, String)]) -> Result<Metadata, MetadataError> {
    let mut metadata = Metadata::from_headers(headers)?;
    for name in RESERVED_REQUEST_HEADERS {
        metadata.remove(name);
    }
    Ok(metadata)
}

/// Response header block: fixed headers, then custom metadata.
pub(crate) fn response_headers(metadata: &Metadata) -> HeaderList {
    let mut headers = vec![
        (":status".to_string(), "200".to_string()),
        ("content-type".to_string(), "application/grpc".to_string()),
    ];
    headers.extend(metadata.to_headers());
    headers
}

/// How a call ends.
enum Outcome {
    Finish(Status),
    Cancelled,
    Forced,
}

/// What one inbound frame amounted to.
enum Inbound<Req> {
    Messages(Vec<Req>),
    End,
    /// Nothing new, e.g. the channel closed after the client's end.
    Idle,
    Reset,
    Failed(Status),
}

struct Driver<Req, Res> {
    method: Arc<RegisteredMethod<Req, Res>>,
    control: Arc<CallControl>,
    inbound: mpsc::Receiver<RequestFrame>,
    outbound: ResponseSink,
    buffer: MessageBuffer,
    max_send: Option<usize>,
    state: CallState,
    headers_sent: bool,
    inbound_open: bool,
    request_ended: bool,
    received: usize,
}

impl<Req, Res> Driver<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn transition(&mut self, to: CallState) {
        if self.state == to {
            return;
        }
        tracing::debug!(
            call_id = self.control.id(),
            path = self.control.path(),
            from = %self.state,
            to = %to,
            "call state"
        );
        self.state = to;
    }

    fn on_frame(&mut self, frame: Option<RequestFrame>) -> Inbound<Req> {
        match frame {
            None if self.request_ended => {
                self.inbound_open = false;
                Inbound::Idle
            }
            None | Some(RequestFrame::Reset) => Inbound::Reset,
            Some(RequestFrame::End) => {
                if self.request_ended {
                    return Inbound::Idle;
                }
                self.request_ended = true;
                match self.buffer.finish() {
                    Ok(()) => Inbound::End,
                    Err(e) => Inbound::Failed(e.status()),
                }
            }
            Some(RequestFrame::Data(_)) if self.request_ended => {
                tracing::debug!(call_id = self.control.id(), "data after end of request; ignoring");
                Inbound::Idle
            }
            Some(RequestFrame::Data(data)) => {
                self.buffer.push(&data);
                let mut requests = Vec::new();
                loop {
                    match self.buffer.try_decode() {
                        Ok(Some(bytes)) => match self.method.deserializer.deserialize(&bytes) {
                            Ok(req) => {
                                self.received += 1;
                                requests.push(req);
                            }
                            Err(e) => return Inbound::Failed(e.request_status()),
                        },
                        Ok(None) => break,
                        Err(e) => return Inbound::Failed(e.status()),
                    }
                }
                Inbound::Messages(requests)
            }
        }
    }

    /// Buffer the whole request side for unary and client-streaming calls.
    async fn collect_requests(&mut self) -> Result<Vec<Req>, Outcome> {
        let mut requests = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = self.control.forced() => return Err(Outcome::Forced),
                _ = self.outbound.closed() => return Err(Outcome::Cancelled),
                frame = self.inbound.recv() => match self.on_frame(frame) {
                    Inbound::Messages(msgs) => requests.extend(msgs),
                    Inbound::End => return Ok(requests),
                    Inbound::Idle => {}
                    Inbound::Reset => return Err(Outcome::Cancelled),
                    Inbound::Failed(status) => return Err(Outcome::Finish(status)),
                },
            }
        }
    }

    /// Write one frame, giving up when the server is forced down while the
    /// client is not reading.
    async fn write(&mut self, frame: ResponseFrame) -> Result<(), Outcome> {
        tokio::select! {
            biased;
            _ = self.control.forced() => Err(Outcome::Forced),
            sent = self.outbound.send(frame) => sent.map_err(|_| Outcome::Cancelled),
        }
    }

    async fn send_headers(&mut self, metadata: &Metadata) -> Result<(), Outcome> {
        if self.headers_sent {
            return Ok(());
        }
        self.headers_sent = true;
        self.transition(CallState::SendingResponse);
        self.write(ResponseFrame::Headers(response_headers(metadata)))
            .await
    }

    async fn send_message(&mut self, value: Res) -> Result<(), Outcome> {
        let bytes = self
            .method
            .serializer
            .serialize(&value)
            .map_err(|e| Outcome::Finish(e.response_status()))?;
        let limit = self.max_send.unwrap_or(message::MAX_MESSAGE_LENGTH);
        if bytes.len() > limit {
            return Err(Outcome::Finish(Status::resource_exhausted(format!(
                "sent message larger than max ({} vs. {})",
                bytes.len(),
                limit
            ))));
        }
        let framed = message::frame(&bytes).map_err(|e| Outcome::Finish(e.status()))?;
        self.send_headers(&Metadata::new()).await?;
        self.write(ResponseFrame::Data(framed)).await
    }

    /// Apply one reply; `Some` once the call is over.
    async fn on_reply(&mut self, reply: Reply<Res>) -> Option<Outcome> {
        let result = match reply {
            Reply::Metadata(metadata) => {
                if self.headers_sent {
                    tracing::warn!(
                        call_id = self.control.id(),
                        "response metadata arrived after headers were sent; ignoring"
                    );
                    return None;
                }
                self.send_headers(&metadata).await
            }
            Reply::Message(value) => self.send_message(value).await,
            Reply::Finish(status) => return Some(Outcome::Finish(status)),
            Reply::Complete { result, trailer } => {
                return Some(match result {
                    Ok(value) => match self.send_message(value).await {
                        Ok(()) => Outcome::Finish(Status::ok().with_metadata(trailer)),
                        Err(outcome) => outcome,
                    },
                    Err(status) => {
                        let mut status = status.into_error();
                        status.metadata_mut().merge(&trailer);
                        Outcome::Finish(status)
                    }
                });
            }
        };
        result.err()
    }

    async fn finish(&mut self, outcome: Outcome) {
        let (status, wait) = match outcome {
            Outcome::Finish(status) => (status, true),
            Outcome::Cancelled => {
                self.control.cancel();
                tracing::debug!(call_id = self.control.id(), "call cancelled by client");
                (Status::cancelled("call cancelled by client"), false)
            }
            Outcome::Forced => {
                self.control.cancel();
                (shutting_down(), false)
            }
        };
        // Late writes and completions from the handler are dropped from here on.
        self.control.claim_finish();
        // Trailers-only when nothing was sent before. Cancelled and forced
        // calls never wait for room in the channel, and a client that is
        // already gone changes nothing.
        let trailers = ResponseFrame::Trailers(status.to_trailers());
        let written = if !wait {
            self.outbound.try_send(trailers).is_ok()
        } else {
            match self.write(trailers.clone()).await {
                Ok(()) => true,
                Err(Outcome::Forced) => self.outbound.try_send(trailers).is_ok(),
                Err(_) => false,
            }
        };
        if !written {
            tracing::debug!(call_id = self.control.id(), "trailers not delivered");
        }
        self.transition(CallState::Terminated);
        tracing::debug!(
            call_id = self.control.id(),
            path = self.control.path(),
            code = %status.code(),
            details = status.details(),
            "call finished"
        );
    }
}

/// Drive one call of `method` to its terminal status.
pub(crate) async fn drive<Req, Res>(method: Arc<RegisteredMethod<Req, Res>>, call: IncomingCall)
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let IncomingCall {
        stream,
        control,
        options,
    } = call;
    let IncomingStream {
        path,
        headers,
        peer,
        inbound,
        outbound,
    } = stream;

    let kind = method.handler.kind();
    let mut driver = Driver {
        method: method.clone(),
        control: control.clone(),
        inbound,
        outbound,
        buffer: MessageBuffer::new(options.max_receive_message_length),
        max_send: options.max_send_message_length,
        state: CallState::ReceivingRequest,
        headers_sent: false,
        inbound_open: true,
        request_ended: false,
        received: 0,
    };
    tracing::debug!(call_id = control.id(), path = %path, kind = %kind, peer = %peer, "call started");

    let metadata = match request_metadata(&headers) {
        Ok(md) => md,
        Err(e) => {
            let status = Status::internal(format!("invalid request metadata: {}", e));
            driver.finish(Outcome::Finish(status)).await;
            return;
        }
    };

    let (reply_tx, mut replies) = mpsc::channel(options.reply_buffer.max(2));
    let shared = Arc::new(CallShared {
        path,
        peer,
        metadata,
        control: control.clone(),
    });
    let ctx = CallContext::new(shared, reply_tx);

    let mut requests: Option<mpsc::UnboundedSender<Req>> = None;
    let handler: BoxFuture<'static, ()> = match &method.handler {
        Handler::Unary(h) => {
            let mut received = match driver.collect_requests().await {
                Ok(r) => r,
                Err(outcome) => return driver.finish(outcome).await,
            };
            let request = match (received.pop(), received.is_empty()) {
                (Some(request), true) => request,
                (None, _) => {
                    let status = Status::internal("no request message");
                    return driver.finish(Outcome::Finish(status)).await;
                }
                (Some(_), false) => {
                    let status = Status::internal("too many requests");
                    return driver.finish(Outcome::Finish(status)).await;
                }
            };
            let h = h.clone();
            let callback = UnaryCallback::new(ctx.clone());
            Box::pin(async move { h.call(UnaryCall::new(ctx, request), callback).await })
        }
        Handler::ClientStreaming(h) => {
            let received = match driver.collect_requests().await {
                Ok(r) => r,
                Err(outcome) => return driver.finish(outcome).await,
            };
            let h = h.clone();
            let callback = UnaryCallback::new(ctx.clone());
            Box::pin(async move { h.call(ClientStreamingCall::new(ctx, received), callback).await })
        }
        Handler::ServerStreaming(h) => {
            let (tx, rx) = mpsc::unbounded_channel();
            requests = Some(tx);
            let h = h.clone();
            let call = ServerStreamingCall::new(ResponseWriter::new(ctx), RequestStream::new(rx));
            Box::pin(async move { h.call(call).await })
        }
        Handler::BidiStreaming(h) => {
            let (tx, rx) = mpsc::unbounded_channel();
            requests = Some(tx);
            let h = h.clone();
            let call = BidiStreamingCall::new(ResponseWriter::new(ctx), RequestStream::new(rx));
            Box::pin(async move { h.call(call).await })
        }
    };

    driver.transition(CallState::HandlerRunning);
    let mut join = tokio::spawn(handler);
    let mut replies_open = true;
    let mut handler_done = false;

    let outcome = loop {
        if !replies_open && handler_done && kind.response_streamed() {
            // Every writer is gone without an explicit end.
            break Outcome::Finish(Status::ok());
        }
        tokio::select! {
            biased;
            _ = control.forced() => break Outcome::Forced,
            _ = driver.outbound.closed() => break Outcome::Cancelled,
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => {
                    if let Some(outcome) = driver.on_reply(reply).await {
                        break outcome;
                    }
                }
                None => replies_open = false,
            },
            frame = driver.inbound.recv(), if driver.inbound_open => match driver.on_frame(frame) {
                Inbound::Messages(msgs) => {
                    if kind == MethodKind::ServerStreaming && driver.received > 1 {
                        break Outcome::Finish(Status::internal("too many requests"));
                    }
                    if let Some(tx) = &requests {
                        for msg in msgs {
                            let _ = tx.send(msg);
                        }
                    }
                }
                Inbound::End => {
                    requests = None;
                    if kind == MethodKind::ServerStreaming && driver.received == 0 {
                        break Outcome::Finish(Status::internal("no request message"));
                    }
                }
                Inbound::Idle => {}
                Inbound::Reset => break Outcome::Cancelled,
                Inbound::Failed(status) => break Outcome::Finish(status),
            },
            joined = &mut join, if !handler_done => {
                handler_done = true;
                if let Err(e) = joined {
                    let message = panic_message(e);
                    tracing::error!(
                        call_id = control.id(),
                        path = control.path(),
                        panic = %message,
                        "handler panicked"
                    );
                    break Outcome::Finish(Status::unknown(message));
                }
            }
        }
    };

    drop(requests);
    driver.finish(outcome).await;
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked".to_string()
            }
        }
        Err(_) => "handler task was cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers_are_stripped() {
        let headers = vec![
            ("content-type".to_string(), "application/grpc".to_string()),
            ("te".to_string(), "trailers".to_string()),
            ("user-agent".to_string(), "test/1.0".to_string()),
            ("grpc-timeout".to_string(), "1S".to_string()),
            ("x-request-id".to_string(), "abc".to_string()),
        ];
        let md = request_metadata(&headers).unwrap();
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("x-request-id")[0].as_text(), Some("abc"));
    }

    #[test]
    fn bad_request_metadata_is_an_error() {
        let headers = vec![("bad key".to_string(), "v".to_string())];
        assert!(request_metadata(&headers).is_err());
    }

    #[test]
    fn response_headers_lead_with_fixed_headers() {
        let mut md = Metadata::new();
        md.add("x-a", "1").unwrap();
        let headers = response_headers(&md);
        assert_eq!(headers[0], (":status".to_string(), "200".to_string()));
        assert_eq!(headers[1].1, "application/grpc");
        assert_eq!(headers[2], ("x-a".to_string(), "1".to_string()));
    }

    #[test]
    fn unimplemented_details_name_the_path() {
        let status = unimplemented("/pkg.Svc/Nope");
        assert_eq!(status.code(), trellis_core::Code::Unimplemented);
        assert_eq!(status.details(), "The server does not implement the method /pkg.Svc/Nope");
    }

    #[test]
    fn call_state_names() {
        assert_eq!(CallState::HandlerRunning.to_string(), "HANDLER_RUNNING");
        assert_eq!(CallState::Terminated.as_str(), "TERMINATED");
    }
}
