//! Outbox abstractions and backend drivers.
//!
//! This module implements the *transactional outbox pattern*, providing a
//! reliable way to persist messages atomically with application state and
//! hand them to a dispatch loop later, exactly once per claim.
//!
//! The outbox is responsible for **durability, ordering and exclusive
//! claiming**, while delivery concerns belong to the dispatch loop and
//! transport layers built on top of it.
//!
//! ## Responsibilities
//!
//! - Persist messages atomically with application state
//! - Reserve batches of pending messages for dispatch without letting
//!   concurrent claimers block each other or receive overlapping rows
//! - Keep a claim reversible until the claimer explicitly completes it
//!
//! ## Components
//!
//! - [`Outbox`]: High-level façade over an outbox backend
//! - [`AppendMessages`]: Trait for appending messages
//! - [`ClaimMessages`]: Trait for claiming batches of pending messages
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use tracing::instrument;
use tracing_error::SpanTrace;

use crate::message::{AppendOptions, OutgoingMessage};

/// Default number of rows reserved by a claim.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl OutboxError {
    /// Create a backend-related outbox error.
    fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// High-level façade over an outbox backend.
///
/// `Outbox` provides a stable, ergonomic API for staging and claiming
/// messages while delegating persistence and claim behavior to the
/// underlying backend.
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Append messages to the outbox within the caller's transaction.
    ///
    /// Messages are staged but **not** sent; delivery happens when a claim
    /// completes. This method is typically called within the same
    /// transaction that mutates application state, which is what makes the
    /// outbox pattern atomic.
    #[instrument(skip(self, messages, tx))]
    pub async fn append_messages(
        &self,
        messages: impl IntoIterator<Item = impl Into<OutgoingMessage>>,
        options: &AppendOptions,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), OutboxError>
    where
        D: AppendMessages,
        D::Error: Into<tower::BoxError>,
    {
        let messages: Vec<OutgoingMessage> = messages.into_iter().map(Into::into).collect();

        self.0
            .append_messages(messages, options, tx)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }

    /// Append messages in a transaction opened and committed internally.
    ///
    /// Use this when there is no surrounding business transaction to join;
    /// the whole sequence still becomes visible atomically.
    #[instrument(skip(self, messages))]
    pub async fn append(
        &self,
        messages: impl IntoIterator<Item = impl Into<OutgoingMessage>>,
        options: &AppendOptions,
    ) -> Result<(), OutboxError>
    where
        D: AppendMessages,
        D::Error: Into<tower::BoxError>,
    {
        let messages: Vec<OutgoingMessage> = messages.into_iter().map(Into::into).collect();

        self.0
            .append(messages, options)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }

    /// Claim up to `max_batch_size` oldest pending messages.
    ///
    /// The returned batch owns the claim: completing it makes the removal
    /// permanent, disposing (or dropping) it returns the messages to the
    /// pending pool. With a correlation id, only rows appended under the
    /// same id are considered. Dispatch loops without specific sizing
    /// requirements use [`DEFAULT_BATCH_SIZE`].
    #[instrument(skip(self))]
    pub async fn claim_messages(
        &self,
        max_batch_size: usize,
        correlation_id: Option<&str>,
    ) -> Result<D::Batch, OutboxError>
    where
        D: ClaimMessages,
        D::Error: Into<tower::BoxError>,
    {
        self.0
            .claim_messages(max_batch_size, correlation_id)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }
}

/// Trait for appending messages to the outbox.
///
/// Implementations must ensure durability and transactional guarantees:
/// either every message of a call becomes visible, or none does.
#[async_trait::async_trait]
pub trait AppendMessages {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic staging.
    type Transaction<'a>;

    /// Append a batch of messages inside the caller's open transaction.
    ///
    /// The caller commits; until then the rows are invisible to claimers.
    async fn append_messages(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;

    /// Append a batch of messages in an internally managed transaction,
    /// committed before this method returns.
    ///
    /// An empty batch is a valid no-op.
    async fn append(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
    ) -> Result<(), Self::Error>;
}

/// Trait for claiming batches of pending messages from the outbox.
///
/// A claim must reserve its rows exclusively: two concurrent claims over
/// the same correlation scope never return overlapping messages, and a
/// claim that is not completed leaves its rows eligible for a future one.
#[async_trait::async_trait]
pub trait ClaimMessages {
    /// Backend-specific error type.
    type Error;
    /// Batch type owning the claim until it is completed or disposed.
    type Batch;

    /// Reserve up to `max_batch_size` oldest pending messages, optionally
    /// scoped to one correlation id.
    async fn claim_messages(
        &self,
        max_batch_size: usize,
        correlation_id: Option<&str>,
    ) -> Result<Self::Batch, Self::Error>;
}
