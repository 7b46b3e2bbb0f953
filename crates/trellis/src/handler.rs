//! Method handlers, one trait per call cardinality.
//!
//! Closures returning futures implement the traits directly. A handler is
//! registered wrapped in the [`Handler`] enum, whose variant decides how
//! the dispatcher drives the call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::call::{BidiStreamingCall, ClientStreamingCall, ServerStreamingCall, UnaryCall, UnaryCallback};
use crate::registry::MethodKind;

/// Single request in, single response out through a [`UnaryCallback`].
pub trait UnaryHandler<Req, Res>: Send + Sync + 'static {
    fn call(&self, call: UnaryCall<Req, Res>, callback: UnaryCallback<Res>) -> BoxFuture<'static, ()>;
}

impl<Req, Res, F, Fut> UnaryHandler<Req, Res> for F
where
    F: Fn(UnaryCall<Req, Res>, UnaryCallback<Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, call: UnaryCall<Req, Res>, callback: UnaryCallback<Res>) -> BoxFuture<'static, ()> {
        Box::pin(self(call, callback))
    }
}

/// Sequence of requests in, single response out through a [`UnaryCallback`].
pub trait ClientStreamingHandler<Req, Res>: Send + Sync + 'static {
    fn call(
        &self,
        call: ClientStreamingCall<Req, Res>,
        callback: UnaryCallback<Res>,
    ) -> BoxFuture<'static, ()>;
}

impl<Req, Res, F, Fut> ClientStreamingHandler<Req, Res> for F
where
    F: Fn(ClientStreamingCall<Req, Res>, UnaryCallback<Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(
        &self,
        call: ClientStreamingCall<Req, Res>,
        callback: UnaryCallback<Res>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self(call, callback))
    }
}

/// Single request in, responses written to the call.
pub trait ServerStreamingHandler<Req, Res>: Send + Sync + 'static {
    fn call(&self, call: ServerStreamingCall<Req, Res>) -> BoxFuture<'static, ()>;
}

impl<Req, Res, F, Fut> ServerStreamingHandler<Req, Res> for F
where
    F: Fn(ServerStreamingCall<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, call: ServerStreamingCall<Req, Res>) -> BoxFuture<'static, ()> {
        Box::pin(self(call))
    }
}

/// Live request sequence in, responses written to the call.
pub trait BidiStreamingHandler<Req, Res>: Send + Sync + 'static {
    fn call(&self, call: BidiStreamingCall<Req, Res>) -> BoxFuture<'static, ()>;
}

impl<Req, Res, F, Fut> BidiStreamingHandler<Req, Res> for F
where
    F: Fn(BidiStreamingCall<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, call: BidiStreamingCall<Req, Res>) -> BoxFuture<'static, ()> {
        Box::pin(self(call))
    }
}

/// A handler tagged with its call cardinality.
pub enum Handler<Req, Res> {
    Unary(Arc<dyn UnaryHandler<Req, Res>>),
    ClientStreaming(Arc<dyn ClientStreamingHandler<Req, Res>>),
    ServerStreaming(Arc<dyn ServerStreamingHandler<Req, Res>>),
    BidiStreaming(Arc<dyn BidiStreamingHandler<Req, Res>>),
}

impl<Req, Res> Handler<Req, Res> {
    /// Wrap a unary handler.
    ///
    /// ```
    /// use trellis::{Handler, Status, UnaryCall, UnaryCallback};
    ///
    /// type Greet = UnaryCall<String, String>;
    ///
    /// let handler = Handler::unary(|call: Greet, callback: UnaryCallback<String>| async move {
    ///     if call.request().is_empty() {
    ///         callback.send(Err(Status::invalid_argument("empty name")));
    ///     } else {
    ///         callback.send(Ok(format!("hello {}", call.request())));
    ///     }
    /// });
    /// assert_eq!(handler.kind(), trellis::MethodKind::Unary);
    /// ```
    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(UnaryCall<Req, Res>, UnaryCallback<Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::Unary(Arc::new(f))
    }

    pub fn client_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(ClientStreamingCall<Req, Res>, UnaryCallback<Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::ClientStreaming(Arc::new(f))
    }

    pub fn server_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(ServerStreamingCall<Req, Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::ServerStreaming(Arc::new(f))
    }

    pub fn bidi_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(BidiStreamingCall<Req, Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::BidiStreaming(Arc::new(f))
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            Handler::Unary(_) => MethodKind::Unary,
            Handler::ClientStreaming(_) => MethodKind::ClientStreaming,
            Handler::ServerStreaming(_) => MethodKind::ServerStreaming,
            Handler::BidiStreaming(_) => MethodKind::Bidirectional,
        }
    }
}

impl<Req, Res> Clone for Handler<Req, Res> {
    fn clone(&self) -> Self {
        match self {
            Handler::Unary(h) => Handler::Unary(h.clone()),
            Handler::ClientStreaming(h) => Handler::ClientStreaming(h.clone()),
            Handler::ServerStreaming(h) => Handler::ServerStreaming(h.clone()),
            Handler::BidiStreaming(h) => Handler::BidiStreaming(h.clone()),
        }
    }
}

impl<Req, Res> fmt::Debug for Handler<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}
