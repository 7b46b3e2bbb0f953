//! Method registry: path to handler and codecs.
//!
//! Filled before the server starts and frozen afterwards; the server then
//! shares it read-only between connections, so lookups take no lock.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use trellis_core::{Deserializer, Serializer};

use crate::dispatch::{self, IncomingCall};
use crate::error::ServerError;
use crate::handler::Handler;
use crate::service::{ServiceDefinition, ServiceImplementation};

/// RPC method kind (streaming semantics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Single request, single response
    Unary = 0,
    /// Multiple requests, single response
    ClientStreaming = 1,
    /// Single request, multiple responses
    ServerStreaming = 2,
    /// Multiple requests and responses
    Bidirectional = 3,
}

impl MethodKind {
    pub fn from_flags(request_streamed: bool, response_streamed: bool) -> Self {
        match (request_streamed, response_streamed) {
            (false, false) => MethodKind::Unary,
            (true, false) => MethodKind::ClientStreaming,
            (false, true) => MethodKind::ServerStreaming,
            (true, true) => MethodKind::Bidirectional,
        }
    }

    pub fn request_streamed(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::Bidirectional)
    }

    pub fn response_streamed(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::Bidirectional)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStreaming => "client_streaming",
            MethodKind::ServerStreaming => "server_streaming",
            MethodKind::Bidirectional => "bidi_streaming",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered method with its request and response types erased.
pub(crate) trait MethodEntry: Send + Sync + 'static {
    fn kind(&self) -> MethodKind;
    fn original_name(&self) -> Option<&str>;
    fn serve(self: Arc<Self>, call: IncomingCall) -> BoxFuture<'static, ()>;
}

pub(crate) struct RegisteredMethod<Req, Res> {
    pub(crate) handler: Handler<Req, Res>,
    pub(crate) serializer: Serializer<Res>,
    pub(crate) deserializer: Deserializer<Req>,
    pub(crate) original_name: Option<String>,
}

impl<Req, Res> MethodEntry for RegisteredMethod<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn kind(&self) -> MethodKind {
        self.handler.kind()
    }

    fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    fn serve(self: Arc<Self>, call: IncomingCall) -> BoxFuture<'static, ()> {
        Box::pin(dispatch::drive(self, call))
    }
}

/// Method table keyed by path.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn MethodEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            methods: HashMap::new(),
        }
    }

    /// Register a handler under `path`.
    ///
    /// Returns `false`, keeping the existing handler, if `path` is taken.
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
        let entry = RegisteredMethod {
            handler,
            serializer,
            deserializer,
            original_name: None,
        };
        self.insert(path.into(), Arc::new(entry))
    }

    fn insert(&mut self, path: String, entry: Arc<dyn MethodEntry>) -> bool {
        match self.methods.entry(path) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Register every method of `definition`, bound to the handler of the
    /// same name in `implementation` (or, failing that, of the method's
    /// original name).
    ///
    /// All-or-nothing: on error nothing is registered.
    pub fn add_service(
        &mut self,
        definition: &ServiceDefinition,
        implementation: &ServiceImplementation,
    ) -> Result<(), ServerError> {
        let mut bound: Vec<(String, Arc<dyn MethodEntry>)> = Vec::with_capacity(definition.len());
        for (name, method) in definition.iter() {
            let handler = implementation
                .get(name)
                .or_else(|| method.original_name().and_then(|n| implementation.get(n)))
                .ok_or_else(|| ServerError::MissingImplementation {
                    method: name.to_string(),
                })?;
            let entry = method
                .bind(handler)
                .ok_or_else(|| ServerError::HandlerTypeMismatch {
                    method: name.to_string(),
                })?;
            let path = method.path();
            if self.contains(path) || bound.iter().any(|(p, _)| p == path) {
                return Err(ServerError::DuplicateMethod {
                    path: path.to_string(),
                });
            }
            bound.push((path.to_string(), entry));
        }
        for (path, entry) in bound {
            self.methods.insert(path, entry);
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<&Arc<dyn MethodEntry>> {
        self.methods.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.methods.contains_key(path)
    }

    pub fn kind(&self, path: &str) -> Option<MethodKind> {
        self.methods.get(path).map(|m| m.kind())
    }

    pub fn original_name(&self, path: &str) -> Option<&str> {
        self.methods.get(path).and_then(|m| m.original_name())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.paths().collect();
        paths.sort_unstable();
        f.debug_struct("Registry").field("methods", &paths).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use bytes::Bytes;
    use trellis_core::{Status, codec};

    use super::*;
    use crate::call::{BidiStreamingCall, ServerStreamingCall, UnaryCall, UnaryCallback};
    use crate::service::MethodDefinition;

    type EchoCall = UnaryCall<String, String>;

    fn echo() -> Handler<String, String> {
        Handler::unary(|call: EchoCall, callback: UnaryCallback<String>| async move {
            callback.send(Ok(call.into_request()));
        })
    }

    fn failing() -> Handler<String, String> {
        Handler::unary(|_call: EchoCall, callback: UnaryCallback<String>| async move {
            callback.send(Err(Status::internal("second")));
        })
    }

    #[test]
    fn method_kind_flags() {
        for kind in [
            MethodKind::Unary,
            MethodKind::ClientStreaming,
            MethodKind::ServerStreaming,
            MethodKind::Bidirectional,
        ] {
            assert_eq!(
                MethodKind::from_flags(kind.request_streamed(), kind.response_streamed()),
                kind
            );
        }
        assert_eq!(MethodKind::ServerStreaming.to_string(), "server_streaming");
    }

    #[test]
    fn register_is_first_wins() {
        let (ser, de) = codec::utf8();
        let mut registry = Registry::new();
        assert!(registry.register("/pkg.Echo/Say", echo(), ser.clone(), de.clone()));
        assert!(!registry.register("/pkg.Echo/Say", failing(), ser.clone(), de.clone()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.kind("/pkg.Echo/Say"), Some(MethodKind::Unary));
        assert!(registry.lookup("/pkg.Echo/Missing").is_none());

        let stream = Handler::server_streaming(|call: ServerStreamingCall<String, String>| async move {
            call.end().await;
        });
        assert!(registry.register("/pkg.Echo/Many", stream, ser, de));
        assert_eq!(registry.kind("/pkg.Echo/Many"), Some(MethodKind::ServerStreaming));
    }

    #[test]
    fn responses_only_need_to_be_send() {
        let (_, de) = codec::utf8();
        let ser = codec::Serializer::new(|n: &Cell<u32>| Ok(Bytes::from(n.get().to_string())));
        let count = Handler::unary(
            |_call: UnaryCall<String, Cell<u32>>, callback: UnaryCallback<Cell<u32>>| async move {
                callback.send(Ok(Cell::new(3)));
            },
        );
        let mut registry = Registry::new();
        assert!(registry.register("/pkg.Counter/Get", count, ser, de));
        assert_eq!(registry.kind("/pkg.Counter/Get"), Some(MethodKind::Unary));
    }

    fn echo_definition() -> ServiceDefinition {
        let (ser, de) = codec::utf8();
        ServiceDefinition::new()
            .method(
                "Say",
                MethodDefinition::new("/pkg.Echo/Say", MethodKind::Unary, ser.clone(), de.clone()),
            )
            .method(
                "Shout",
                MethodDefinition::new("/pkg.Echo/Shout", MethodKind::Unary, ser, de)
                    .with_original_name("shout"),
            )
    }

    #[test]
    fn add_service_binds_by_name_and_original_name() {
        let implementation = ServiceImplementation::new()
            .handler("Say", echo())
            .handler("shout", echo());
        let mut registry = Registry::new();
        registry
            .add_service(&echo_definition(), &implementation)
            .unwrap();
        assert!(registry.contains("/pkg.Echo/Say"));
        assert!(registry.contains("/pkg.Echo/Shout"));
        assert_eq!(registry.original_name("/pkg.Echo/Shout"), Some("shout"));
    }

    #[test]
    fn add_service_fails_fast_and_registers_nothing() {
        let implementation = ServiceImplementation::new().handler("Say", echo());
        let mut registry = Registry::new();
        let err = registry
            .add_service(&echo_definition(), &implementation)
            .unwrap_err();
        assert!(matches!(err, ServerError::MissingImplementation { ref method } if method == "Shout"));
        assert!(registry.is_empty());
    }

    #[test]
    fn add_service_rejects_wrong_handler_types() {
        let wrong_types =
            Handler::unary(|_call: UnaryCall<Vec<u8>, String>, callback: UnaryCallback<String>| async move {
                callback.send(Ok(String::new()));
            });
        let implementation = ServiceImplementation::new()
            .handler("Say", wrong_types)
            .handler("Shout", echo());
        let err = Registry::new()
            .add_service(&echo_definition(), &implementation)
            .unwrap_err();
        assert!(matches!(err, ServerError::HandlerTypeMismatch { ref method } if method == "Say"));

        let wrong_kind = Handler::bidi_streaming(|call: BidiStreamingCall<String, String>| async move {
            call.end().await;
        });
        let implementation = ServiceImplementation::new()
            .handler("Say", wrong_kind)
            .handler("Shout", echo());
        let err = Registry::new()
            .add_service(&echo_definition(), &implementation)
            .unwrap_err();
        assert!(matches!(err, ServerError::HandlerTypeMismatch { .. }));
    }

    #[test]
    fn add_service_rejects_taken_paths() {
        let (ser, de) = codec::utf8();
        let mut registry = Registry::new();
        registry.register("/pkg.Echo/Say", echo(), ser, de);
        let implementation = ServiceImplementation::new()
            .handler("Say", echo())
            .handler("Shout", echo());
        let err = registry
            .add_service(&echo_definition(), &implementation)
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateMethod { .. }));
        assert!(!registry.contains("/pkg.Echo/Shout"));
    }
}
