//! Server configuration.

/// Default limit on a single received message (4 MiB).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Largest request message accepted, in bytes. `None` disables the limit.
    ///
    /// Default: 4 MiB
    pub max_receive_message_length: Option<usize>,

    /// Largest response message sent, in bytes. `None` disables the limit.
    ///
    /// Default: unlimited
    pub max_send_message_length: Option<usize>,

    /// Capacity of per-stream transport channels.
    ///
    /// Default: 64
    pub request_buffer: usize,

    /// Capacity of the channel carrying handler output to the dispatcher.
    ///
    /// Default: 16
    pub reply_buffer: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_receive_message_length: Some(DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH),
            max_send_message_length: None,
            request_buffer: 64,
            reply_buffer: 16,
        }
    }
}

impl ServerOptions {
    pub fn with_max_receive_message_length(mut self, limit: Option<usize>) -> Self {
        self.max_receive_message_length = limit;
        self
    }

    pub fn with_max_send_message_length(mut self, limit: Option<usize>) -> Self {
        self.max_send_message_length = limit;
        self
    }

    pub fn with_request_buffer(mut self, capacity: usize) -> Self {
        self.request_buffer = capacity.max(1);
        self
    }

    pub fn with_reply_buffer(mut self, capacity: usize) -> Self {
        self.reply_buffer = capacity.max(1);
        self
    }
}
