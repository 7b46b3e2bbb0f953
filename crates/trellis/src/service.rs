//! Service definitions and implementations for [`Registry::add_service`].
//!
//! A [`ServiceDefinition`] maps method names to [`MethodDefinition`]s (path,
//! cardinality, codecs); a [`ServiceImplementation`] maps the same names to
//! [`Handler`]s. Both are typically produced by generated code.
//!
//! [`Registry::add_service`]: crate::Registry::add_service

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use trellis_core::{Deserializer, Serializer};

use crate::handler::Handler;
use crate::registry::{MethodEntry, MethodKind, RegisteredMethod};

/// Description of one method: route, cardinality and codecs.
pub struct MethodDefinition<Req, Res> {
    pub path: String,
    pub request_stream: bool,
    pub response_stream: bool,
    pub serializer: Serializer<Res>,
    pub deserializer: Deserializer<Req>,
    pub original_name: Option<String>,
}

impl<Req, Res> MethodDefinition<Req, Res> {
    pub fn new(
        path: impl Into<String>,
        kind: MethodKind,
        serializer: Serializer<Res>,
        deserializer: Deserializer<Req>,
    ) -> Self {
        MethodDefinition {
            path: path.into(),
            request_stream: kind.request_streamed(),
            response_stream: kind.response_streamed(),
            serializer,
            deserializer,
            original_name: None,
        }
    }

    /// Display name used in source, e.g. `sayHello` for `SayHello`.
    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }

    pub fn kind(&self) -> MethodKind {
        MethodKind::from_flags(self.request_stream, self.response_stream)
    }
}

impl<Req, Res> Clone for MethodDefinition<Req, Res> {
    fn clone(&self) -> Self {
        MethodDefinition {
            path: self.path.clone(),
            request_stream: self.request_stream,
            response_stream: self.response_stream,
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
            original_name: self.original_name.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for MethodDefinition<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("path", &self.path)
            .field("kind", &self.kind())
            .field("original_name", &self.original_name)
            .finish_non_exhaustive()
    }
}

/// A method definition with its types erased.
pub(crate) trait DefinedMethod: Send + Sync {
    fn path(&self) -> &str;
    fn kind(&self) -> MethodKind;
    fn original_name(&self) -> Option<&str>;
    /// Pair with a handler; `None` if the handler's types or cardinality
    /// do not match.
    fn bind(&self, handler: &(dyn Any + Send + Sync)) -> Option<Arc<dyn MethodEntry>>;
}

impl<Req, Res> DefinedMethod for MethodDefinition<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> MethodKind {
        MethodDefinition::kind(self)
    }

    fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    fn bind(&self, handler: &(dyn Any + Send + Sync)) -> Option<Arc<dyn MethodEntry>> {
        let handler = handler.downcast_ref::<Handler<Req, Res>>()?;
        if handler.kind() != MethodDefinition::kind(self) {
            return None;
        }
        Some(Arc::new(RegisteredMethod {
            handler: handler.clone(),
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
            original_name: self.original_name.clone(),
        }))
    }
}

/// Method name to method definition, in insertion order.
#[derive(Default)]
pub struct ServiceDefinition {
    methods: Vec<(String, Box<dyn DefinedMethod>)>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        ServiceDefinition {
            methods: Vec::new(),
        }
    }

    /// Builder form of [`add_method`](ServiceDefinition::add_method).
    pub fn method<Req, Res>(mut self, name: impl Into<String>, method: MethodDefinition<Req, Res>) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        self.add_method(name, method);
        self
    }

    /// Add a method, replacing any previous method of the same name.
    pub fn add_method<Req, Res>(&mut self, name: impl Into<String>, method: MethodDefinition<Req, Res>)
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let name = name.into();
        let method: Box<dyn DefinedMethod> = Box::new(method);
        match self.methods.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = method,
            None => self.methods.push((name, method)),
        }
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(n, _)| n.as_str())
    }

    /// Path of the method called `name`.
    pub fn path(&self, name: &str) -> Option<&str> {
        self.find(name).map(|m| m.path())
    }

    pub fn kind(&self, name: &str) -> Option<MethodKind> {
        self.find(name).map(|m| m.kind())
    }

    fn find(&self, name: &str) -> Option<&dyn DefinedMethod> {
        self.methods
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_ref())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &dyn DefinedMethod)> {
        self.methods.iter().map(|(n, m)| (n.as_str(), m.as_ref()))
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.methods.iter().map(|(n, m)| (n, m.path())))
            .finish()
    }
}

/// Method name to handler.
#[derive(Default)]
pub struct ServiceImplementation {
    handlers: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ServiceImplementation {
    pub fn new() -> Self {
        ServiceImplementation {
            handlers: HashMap::new(),
        }
    }

    /// Builder form of [`insert`](ServiceImplementation::insert).
    pub fn handler<Req, Res>(mut self, name: impl Into<String>, handler: Handler<Req, Res>) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        self.insert(name, handler);
        self
    }

    pub fn insert<Req, Res>(&mut self, name: impl Into<String>, handler: Handler<Req, Res>)
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}

impl fmt::Debug for ServiceImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use trellis_core::codec;

    use super::*;
    use crate::call::{UnaryCall, UnaryCallback};

    #[test]
    fn definition_keeps_order_and_replaces_by_name() {
        let (ser, de) = codec::utf8();
        let mut def = ServiceDefinition::new()
            .method("B", MethodDefinition::new("/s/B", MethodKind::Unary, ser.clone(), de.clone()))
            .method("A", MethodDefinition::new("/s/A", MethodKind::Bidirectional, ser.clone(), de.clone()));
        def.add_method("B", MethodDefinition::new("/s/B2", MethodKind::ServerStreaming, ser, de));

        assert_eq!(def.names().collect::<Vec<_>>(), vec!["B", "A"]);
        assert_eq!(def.path("B"), Some("/s/B2"));
        assert_eq!(def.kind("B"), Some(MethodKind::ServerStreaming));
        assert_eq!(def.kind("A"), Some(MethodKind::Bidirectional));
        assert_eq!(def.path("C"), None);
    }

    #[test]
    fn method_definition_flags_follow_kind() {
        let (ser, de) = codec::raw();
        let def = MethodDefinition::new("/s/M", MethodKind::ClientStreaming, ser, de).with_original_name("m");
        assert!(def.request_stream);
        assert!(!def.response_stream);
        assert_eq!(def.kind(), MethodKind::ClientStreaming);
        assert_eq!(def.clone().original_name.as_deref(), Some("m"));
    }

    #[test]
    fn bind_checks_types() {
        let (ser, de) = codec::utf8();
        let def = MethodDefinition::new("/s/M", MethodKind::Unary, ser, de);
        let good = Handler::unary(|_c: UnaryCall<String, String>, cb: UnaryCallback<String>| async move {
            cb.send(Ok(String::new()))
        });
        let bad = Handler::unary(|_c: UnaryCall<String, Vec<u8>>, cb: UnaryCallback<Vec<u8>>| async move {
            cb.send(Ok(Vec::new()))
        });
        let good: Box<dyn Any + Send + Sync> = Box::new(good);
        let bad: Box<dyn Any + Send + Sync> = Box::new(bad);
        assert!(DefinedMethod::bind(&def, good.as_ref()).is_some());
        assert!(DefinedMethod::bind(&def, bad.as_ref()).is_none());
    }
}
