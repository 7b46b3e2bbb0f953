#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod codec;
pub mod credentials;
pub mod message;
pub mod metadata;
pub mod status;
pub mod transport;

pub use codec::{CodecError, Deserializer, Serializer};
pub use credentials::{CredentialsError, KeyCertPair, ServerCredentials, TlsSettings};
pub use message::{MessageBuffer, MessageError};
pub use metadata::{HeaderList, Metadata, MetadataError, MetadataValue};
pub use status::{Code, Status};
pub use transport::{
    CallResponse, ClientStream, IncomingStream, RequestFrame, ResponseFrame, ResponseSink,
    TransportError,
};
