#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod call;
mod dispatch;
mod error;
mod handler;
mod inflight;
mod options;
mod registry;
mod server;
mod service;

// Re-export core types
pub use trellis_core::{
    Code,
    // Codecs
    CodecError,
    Deserializer,
    // Credentials
    CredentialsError,
    KeyCertPair,
    Metadata,
    MetadataError,
    MetadataValue,
    Serializer,
    ServerCredentials,
    Status,
    TlsSettings,
};

// Codec constructors and transports, for clients and tests
pub use trellis_core::{codec, transport};

#[doc(hidden)]
pub extern crate trellis_core;

pub use call::{
    BidiStreamingCall, CallContext, ClientStreamingCall, RequestStream, ResponseWriter,
    ServerStreamingCall, UnaryCall, UnaryCallback,
};
pub use dispatch::{CallState, RESERVED_REQUEST_HEADERS};
pub use error::ServerError;
pub use handler::{
    BidiStreamingHandler, ClientStreamingHandler, Handler, ServerStreamingHandler, UnaryHandler,
};
pub use options::{DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH, ServerOptions};
pub use registry::{MethodKind, Registry};
pub use server::Server;
pub use service::{MethodDefinition, ServiceDefinition, ServiceImplementation};
