use std::collections::HashMap;

/// Message handed to the outbox for later delivery.
///
/// `OutgoingMessage` is an immutable value supplied by the caller. It
/// bundles the destination with the message headers and payload.
///
/// ## Design
///
/// - `destination_address` names where the message must be delivered; the
///   outbox stores it but never interprets it
/// - `headers` carry message metadata (e.g. routing keys, content types,
///   or tracing information) as a plain string mapping
/// - `body` is an opaque binary payload
///
/// Keeping headers and payload separated makes it easier to:
/// - Serialize and persist messages
/// - Attach transport-specific metadata
/// - Reuse the same payload across different delivery mechanisms
///
/// ## Conversion
///
/// `OutgoingMessage` implements `From<(destination, headers, body)>` for
/// ergonomic construction when the parts are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use std::collections::HashMap;
/// use postbox::OutgoingMessage;
///
/// let message = OutgoingMessage::new("orders", HashMap::new(), vec![1, 2, 3]);
///
/// // or, equivalently
/// let message: OutgoingMessage = ("orders", HashMap::new(), vec![1, 2, 3]).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Where the message must be delivered.
    pub destination_address: String,
    /// Message metadata.
    pub headers: HashMap<String, String>,
    /// Message payload.
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    /// Create a new outgoing message.
    pub fn new(
        destination_address: impl Into<String>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            destination_address: destination_address.into(),
            headers,
            body,
        }
    }
}

impl<A> From<(A, HashMap<String, String>, Vec<u8>)> for OutgoingMessage
where
    A: Into<String>,
{
    fn from(value: (A, HashMap<String, String>, Vec<u8>)) -> Self {
        OutgoingMessage {
            destination_address: value.0.into(),
            headers: value.1,
            body: value.2,
        }
    }
}

/// Provenance metadata applied to every row of one append call.
///
/// All fields are optional and stored verbatim; the outbox does not
/// interpret them. The correlation id additionally scopes claims: batches
/// claimed with a correlation filter only ever see rows appended with the
/// same id, enabling independent processing streams over one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOptions {
    /// Identifier of the message in the caller's own messaging scheme.
    pub message_id: Option<String>,
    /// Queue the message originated from.
    pub source_queue: Option<String>,
    /// Grouping key for claim scoping.
    pub correlation_id: Option<String>,
}

impl AppendOptions {
    /// Set the message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the source queue.
    pub fn with_source_queue(mut self, source_queue: impl Into<String>) -> Self {
        self.source_queue = Some(source_queue.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Message claimed from the outbox.
///
/// Read-side projection produced by a claim. The `id` is the
/// backend-assigned identifier defining insertion order; headers are
/// already decoded back into their mapping form.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    /// Backend-assigned identifier, ascending in insertion order.
    pub id: i64,
    /// Where the message must be delivered.
    pub destination_address: String,
    /// Decoded message metadata.
    pub headers: HashMap<String, String>,
    /// Message payload.
    pub body: Vec<u8>,
}
