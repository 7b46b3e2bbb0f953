//! Call outcome codes and the terminal status of a call.
//!
//! Every call ends with exactly one [`Status`]. The numeric values of
//! [`Code`] are wire-stable and must never change.

use std::fmt;

use crate::metadata::{HeaderList, Metadata, MetadataError};

/// Trailer carrying the decimal status code.
pub const STATUS_HEADER: &str = "grpc-status";

/// Trailer carrying the percent-encoded status details.
pub const MESSAGE_HEADER: &str = "grpc-message";

/// Outcome codes, `Ok = 0` through `Unauthenticated = 16`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Convert from a wire value. Values outside 0..=16 map to `Unknown`.
    pub fn from_i32(val: i32) -> Self {
        match val {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Convert to the wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code.as_i32()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a call: code, details and trailing metadata.
///
/// `Status` is also the error type handlers report failures with; its
/// `Display` output is the details string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    details: String,
    metadata: Metadata,
}

impl Status {
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Status {
            code,
            details: details.into(),
            metadata: Metadata::new(),
        }
    }

    /// Successful completion with no details.
    pub fn ok() -> Self {
        Status::new(Code::Ok, "OK")
    }

    pub fn cancelled(details: impl Into<String>) -> Self {
        Status::new(Code::Cancelled, details)
    }

    pub fn unknown(details: impl Into<String>) -> Self {
        Status::new(Code::Unknown, details)
    }

    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Status::new(Code::InvalidArgument, details)
    }

    pub fn resource_exhausted(details: impl Into<String>) -> Self {
        Status::new(Code::ResourceExhausted, details)
    }

    pub fn unimplemented(details: impl Into<String>) -> Self {
        Status::new(Code::Unimplemented, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Status::new(Code::Internal, details)
    }

    pub fn unavailable(details: impl Into<String>) -> Self {
        Status::new(Code::Unavailable, details)
    }

    /// Attach trailing metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Normalise a status reported as an error.
    ///
    /// `Ok` never accompanies an error, so an error carrying it becomes
    /// `Unknown` with the same details and metadata.
    pub fn into_error(mut self) -> Self {
        if self.code == Code::Ok {
            self.code = Code::Unknown;
        }
        self
    }

    /// Encode as a trailer block: status code, details, then metadata.
    pub fn to_trailers(&self) -> HeaderList {
        let mut trailers = vec![
            (STATUS_HEADER.to_string(), self.code.as_i32().to_string()),
            (MESSAGE_HEADER.to_string(), percent_encode(&self.details)),
        ];
        trailers.extend(self.metadata.to_headers());
        trailers
    }

    /// Decode a trailer block produced by [`Status::to_trailers`].
    ///
    /// A missing or unparsable code is `Unknown`.
    pub fn from_trailers(trailers: &[(String, String)]) -> Result<Self, MetadataError> {
        let mut code = Code::Unknown;
        let mut details = String::new();
        let mut rest = HeaderList::new();
        for (name, value) in trailers {
            match name.as_str() {
                STATUS_HEADER => {
                    code = value.parse().map(Code::from_i32).unwrap_or(Code::Unknown);
                }
                MESSAGE_HEADER => details = percent_decode(value),
                _ => rest.push((name.clone(), value.clone())),
            }
        }
        Ok(Status {
            code,
            details,
            metadata: Metadata::from_headers(&rest)?,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.details)
    }
}

impl std::error::Error for Status {}

impl From<MetadataError> for Status {
    fn from(err: MetadataError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

/// Percent-encode bytes outside printable ASCII, and `%` itself.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inverse of [`percent_encode`]; malformed escapes pass through verbatim.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_values_are_wire_stable() {
        for val in 0..=16 {
            assert_eq!(Code::from_i32(val).as_i32(), val);
        }
        assert_eq!(Code::Ok as i32, 0);
        assert_eq!(Code::InvalidArgument as i32, 3);
        assert_eq!(Code::Unimplemented as i32, 12);
        assert_eq!(Code::Unavailable as i32, 14);
        assert_eq!(Code::Unauthenticated as i32, 16);
    }

    #[test]
    fn unknown_code_values() {
        assert_eq!(Code::from_i32(17), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn code_display() {
        assert_eq!(Code::Ok.to_string(), "OK");
        assert_eq!(Code::InvalidArgument.to_string(), "INVALID_ARGUMENT");
        assert_eq!(Code::DataLoss.to_string(), "DATA_LOSS");
    }

    #[test]
    fn status_is_an_error_with_details_as_message() {
        let status = Status::invalid_argument("bad field");
        let err: &dyn std::error::Error = &status;
        assert_eq!(err.to_string(), "bad field");
    }

    #[test]
    fn ok_never_accompanies_an_error() {
        let status = Status::new(Code::Ok, "looked fine").into_error();
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.details(), "looked fine");

        let status = Status::internal("boom").into_error();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn trailers_round_trip() {
        let mut md = Metadata::new();
        md.add("retry-after", "5").unwrap();
        md.add("detail-bin", vec![7u8, 8, 9]).unwrap();
        let status = Status::new(Code::ResourceExhausted, "quota 100% used\nretry").with_metadata(md);

        let trailers = status.to_trailers();
        assert_eq!(trailers[0], ("grpc-status".to_string(), "8".to_string()));
        assert_eq!(trailers[1].1, "quota 100%25 used%0Aretry");

        assert_eq!(Status::from_trailers(&trailers).unwrap(), status);
    }

    #[test]
    fn trailers_without_code_are_unknown() {
        let status = Status::from_trailers(&[]).unwrap();
        assert_eq!(status.code(), Code::Unknown);

        let trailers = vec![("grpc-status".to_string(), "nope".to_string())];
        assert_eq!(Status::from_trailers(&trailers).unwrap().code(), Code::Unknown);
    }

    #[test]
    fn percent_coding_handles_unicode_and_stray_percent() {
        let encoded = percent_encode("héllo");
        assert_eq!(encoded, "h%C3%A9llo");
        assert_eq!(percent_decode(&encoded), "héllo");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn metadata_errors_are_invalid_argument() {
        let status = Status::from(MetadataError::InvalidKey("A B".into()));
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
