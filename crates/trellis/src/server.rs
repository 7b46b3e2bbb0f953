//! Server lifecycle: bind, start, route streams, shut down.
//!
//! ```text
//! Idle --start--> Started --try_shutdown--> Draining --idle--> ShutDown
//!                    \______________force_shutdown_____________/
//! ```
//!
//! Endpoints bound before `start` are held and only accept once the server
//! starts; endpoints bound afterwards accept right away. Shutting down closes
//! in-process endpoints before returning, and answers streams already queued
//! on them with `UNAVAILABLE`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use trellis_core::transport::mem::{self, MemConnector, MemListener};
use trellis_core::transport::stream;
use trellis_core::{Deserializer, IncomingStream, ResponseFrame, Serializer, ServerCredentials};

use crate::dispatch::{self, IncomingCall};
use crate::error::ServerError;
use crate::handler::Handler;
use crate::inflight::{CallControl, InFlight};
use crate::options::ServerOptions;
use crate::registry::Registry;
use crate::service::{ServiceDefinition, ServiceImplementation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Started,
    Draining,
    ShutDown,
}

/// A bound endpoint not accepting yet.
enum Endpoint {
    Tcp {
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    },
    Mem(MemListener),
}

struct ServerInner {
    options: Arc<ServerOptions>,
    state: Mutex<State>,
    /// Frozen copy of the registry, set by `start`.
    registry: OnceLock<Arc<Registry>>,
    calls: Arc<InFlight>,
    next_call_id: AtomicU64,
    next_conn_id: AtomicU64,
    pending: Mutex<Vec<Endpoint>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Handles onto in-process endpoints being accepted from.
    mem_listeners: Mutex<Vec<MemListener>>,
    connections: Mutex<HashMap<u64, AbortHandle>>,
}

/// An RPC server: a method registry plus the endpoints serving it.
pub struct Server {
    registry: Arc<Registry>,
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(ServerOptions::default())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &*self.inner.state.lock())
            .field("registry", &self.registry)
            .field("in_flight", &self.inner.calls.len())
            .finish()
    }
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Server {
            registry: Arc::new(Registry::new()),
            inner: Arc::new(ServerInner {
                options: Arc::new(options),
                state: Mutex::new(State::Idle),
                registry: OnceLock::new(),
                calls: Arc::new(InFlight::default()),
                next_call_id: AtomicU64::new(1),
                next_conn_id: AtomicU64::new(1),
                pending: Mutex::new(Vec::new()),
                accept_tasks: Mutex::new(Vec::new()),
                mem_listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a handler under `path`.
    ///
    /// Returns `false` if `path` is already registered or the server has
    /// started.
    pub fn register<Req, Res>(
        &mut self,
        path: impl Into<String>,
        handler: Handler<Req, Res>,
        serializer: Serializer<Res>,
        deserializer: Deserializer<Req>,
    ) -> bool
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let path = path.into();
        match Arc::get_mut(&mut self.registry) {
            Some(registry) => registry.register(path, handler, serializer, deserializer),
            None => {
                tracing::warn!(path = %path, "cannot register a method after the server started");
                false
            }
        }
    }

    /// Register every method of a service. See [`Registry::add_service`].
    pub fn add_service(
        &mut self,
        definition: &ServiceDefinition,
        implementation: &ServiceImplementation,
    ) -> Result<(), ServerError> {
        let registry = Arc::get_mut(&mut self.registry).ok_or(ServerError::AlreadyRunning)?;
        registry.add_service(definition, implementation)
    }

    /// Bind a TCP endpoint and return its port.
    ///
    /// `address` is `host:port`; port 0 picks a free port.
    pub async fn bind(&self, address: &str, credentials: &ServerCredentials) -> Result<u16, ServerError> {
        self.inner.bind_tcp(address, credentials).await
    }

    /// Callback form of [`bind`](Server::bind). Must be called inside a
    /// Tokio runtime.
    pub fn bind_async<F>(&self, address: impl Into<String>, credentials: ServerCredentials, callback: F)
    where
        F: FnOnce(Result<u16, ServerError>) + Send + 'static,
    {
        let inner = self.inner.clone();
        let address = address.into();
        tokio::spawn(async move {
            callback(inner.bind_tcp(&address, &credentials).await);
        });
    }

    /// Bind an in-process endpoint and return the connector clients use
    /// to open streams on it.
    pub fn bind_in_process(&self) -> Result<MemConnector, ServerError> {
        let (listener, connector) = mem::listener(self.inner.options.request_buffer);
        self.inner.add_endpoint(Endpoint::Mem(listener))?;
        tracing::debug!("bound in-process endpoint");
        Ok(connector)
    }

    /// Start accepting calls on every bound endpoint.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut state = self.inner.state.lock();
        match *state {
            State::Idle => {}
            State::Started => return Err(ServerError::AlreadyStarted),
            State::Draining | State::ShutDown => return Err(ServerError::ShutDown),
        }
        let endpoints = std::mem::take(&mut *self.inner.pending.lock());
        if endpoints.is_empty() {
            return Err(ServerError::NotBound);
        }
        // Freezing the registry makes later registration fail.
        let _ = self.inner.registry.set(self.registry.clone());
        *state = State::Started;
        drop(state);

        let count = endpoints.len();
        for endpoint in endpoints {
            self.inner.spawn_accept(endpoint);
        }
        tracing::info!(endpoints = count, methods = self.registry.len(), "server started");
        Ok(())
    }

    /// Stop accepting new calls, wait for in-flight calls to terminate,
    /// then invoke `callback`. Must be called inside a Tokio runtime.
    pub fn try_shutdown<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let draining = self.inner.begin_drain();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if draining {
                inner.finish_drain().await;
            }
            callback();
        });
    }

    /// Async form of [`try_shutdown`](Server::try_shutdown).
    pub async fn shutdown(&self) {
        if self.inner.begin_drain() {
            self.inner.clone().finish_drain().await;
        }
    }

    /// End every in-flight call with `UNAVAILABLE` and stop all endpoints.
    pub fn force_shutdown(&self) {
        self.inner.force();
    }

    /// Number of calls that have not terminated yet.
    pub fn in_flight(&self) -> usize {
        self.inner.calls.len()
    }
}

impl ServerInner {
    fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), State::Draining | State::ShutDown)
    }

    async fn bind_tcp(self: &Arc<Self>, address: &str, credentials: &ServerCredentials) -> Result<u16, ServerError> {
        if self.is_closed() {
            return Err(ServerError::ShutDown);
        }
        let tls = credentials.tls_config()?.map(TlsAcceptor::from);
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?
            .port();
        let secure = tls.is_some();
        self.add_endpoint(Endpoint::Tcp { listener, tls })?;
        tracing::debug!(address, port, secure, "bound tcp endpoint");
        Ok(port)
    }

    fn add_endpoint(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), ServerError> {
        let state = self.state.lock();
        match *state {
            State::Idle => {
                self.pending.lock().push(endpoint);
                Ok(())
            }
            State::Started => {
                drop(state);
                self.spawn_accept(endpoint);
                Ok(())
            }
            State::Draining | State::ShutDown => Err(ServerError::ShutDown),
        }
    }

    fn spawn_accept(self: &Arc<Self>, endpoint: Endpoint) {
        let inner = self.clone();
        let task = match endpoint {
            Endpoint::Tcp { listener, tls } => tokio::spawn(inner.accept_tcp(listener, tls)),
            Endpoint::Mem(listener) => {
                self.mem_listeners.lock().push(listener.clone());
                tokio::spawn(inner.accept_mem(listener))
            }
        };
        self.accept_tasks.lock().push(task);
        // A shutdown may have raced with this endpoint being added.
        if self.is_closed() {
            self.stop_accepting();
        }
    }

    async fn accept_tcp(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if self.is_closed() {
                tracing::debug!(peer = %addr, "refusing connection while shutting down");
                return;
            }
            let _ = socket.set_nodelay(true);
            let peer = addr.to_string();
            tracing::debug!(peer = %peer, "accepted connection");

            let inner = self.clone();
            let tls = tls.clone();
            self.spawn_connection(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(io) => inner.serve_connection(io, peer).await,
                        Err(e) => tracing::debug!(peer = %peer, error = %e, "tls handshake failed"),
                    },
                    None => inner.serve_connection(socket, peer).await,
                }
            });
        }
    }

    async fn accept_mem(self: Arc<Self>, listener: MemListener) {
        while let Some(stream) = listener.accept().await {
            self.dispatch(stream);
        }
    }

    fn spawn_connection<F>(self: &Arc<Self>, serve: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let mut connections = self.connections.lock();
        let task = tokio::spawn(async move {
            let _guard = ConnectionGuard { inner, id };
            serve.await;
        });
        connections.insert(id, task.abort_handle());
    }

    async fn serve_connection<S>(self: Arc<Self>, io: S, peer: String)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = self.options.request_buffer;
        let (tx, mut rx) = mpsc::channel(capacity);
        let route = async {
            while let Some(stream) = rx.recv().await {
                self.dispatch(stream);
            }
        };
        let (served, ()) = tokio::join!(stream::serve_connection(io, peer.clone(), tx, capacity), route);
        match served {
            Ok(()) => tracing::debug!(peer = %peer, "connection closed"),
            Err(e) => tracing::debug!(peer = %peer, error = %e, "connection failed"),
        }
    }

    /// Route one stream to its method's driver.
    fn dispatch(self: &Arc<Self>, stream: IncomingStream) {
        let state = self.state.lock();
        if *state != State::Started {
            drop(state);
            tracing::debug!(path = %stream.path, "refusing stream while shutting down");
            tokio::spawn(dispatch::reject(stream.outbound, dispatch::shutting_down()));
            return;
        }
        let Some(entry) = self.registry.get().and_then(|r| r.lookup(&stream.path)).cloned() else {
            drop(state);
            tracing::debug!(path = %stream.path, "unknown method");
            let status = dispatch::unimplemented(&stream.path);
            tokio::spawn(dispatch::reject(stream.outbound, status));
            return;
        };

        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(CallControl::new(id, stream.path.clone()));
        // Tracked before the state lock is released, so a drain that starts
        // now waits for this call.
        let guard = self.calls.insert(control.clone());
        drop(state);

        let span = tracing::debug_span!("call", id, path = %stream.path);
        let call = IncomingCall {
            stream,
            control,
            options: self.options.clone(),
        };
        tokio::spawn(
            async move {
                let _guard = guard;
                entry.serve(call).await;
            }
            .instrument(span),
        );
    }

    fn stop_accepting(&self) {
        let listeners = std::mem::take(&mut *self.mem_listeners.lock());
        for listener in &listeners {
            refuse_queued(listener);
        }
        let tasks = std::mem::take(&mut *self.accept_tasks.lock());
        for task in tasks {
            task.abort();
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        for endpoint in &pending {
            if let Endpoint::Mem(listener) = endpoint {
                refuse_queued(listener);
            }
        }
    }

    fn abort_connections(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for conn in connections.into_values() {
            conn.abort();
        }
    }

    /// Enter `Draining` and stop every endpoint. `false` if the server is
    /// already shut down.
    fn begin_drain(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == State::ShutDown {
                return false;
            }
            *state = State::Draining;
        }
        self.stop_accepting();
        true
    }

    /// Wait for in-flight calls, then drop the connections.
    async fn finish_drain(self: Arc<Self>) {
        tracing::info!(in_flight = self.calls.len(), "server draining");
        self.calls.wait_idle().await;
        self.abort_connections();
        let mut state = self.state.lock();
        if *state == State::Draining {
            *state = State::ShutDown;
            tracing::info!("server shut down");
        }
    }

    fn force(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == State::ShutDown && self.calls.len() == 0 {
                return;
            }
            *state = State::ShutDown;
        }
        self.stop_accepting();
        let calls = self.calls.snapshot();
        tracing::info!(in_flight = calls.len(), "forcing server shutdown");
        for control in &calls {
            control.force_shutdown();
        }
        // Connections stay up until the forced calls wrote their trailers.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    inner.calls.wait_idle().await;
                    inner.abort_connections();
                });
            }
            Err(_) => self.abort_connections(),
        }
    }
}

/// Close `listener` and answer the streams it had queued.
fn refuse_queued(listener: &MemListener) {
    listener.close();
    while let Some(stream) = listener.try_accept() {
        tracing::debug!(path = %stream.path, "refusing queued stream while shutting down");
        let trailers = ResponseFrame::Trailers(dispatch::shutting_down().to_trailers());
        let _ = stream.outbound.try_send(trailers);
    }
}

struct ConnectionGuard {
    inner: Arc<ServerInner>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections.lock().remove(&self.id);
    }
}
