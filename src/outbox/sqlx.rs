use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::codec::{HeaderCodec, JsonHeaderCodec};
use crate::message::{AppendOptions, OutboxMessage, OutgoingMessage};
use crate::outbox::{AppendMessages, ClaimMessages};

/// Type alias for the Postgres outbox with the default header codec.
pub type PgOutbox = SqlxOutbox<PgPool, JsonHeaderCodec>;

/// Column bound of `correlation_id`.
const CORRELATION_ID_MAX: usize = 16;
/// Column bound of `message_id`, `source_queue` and `destination_address`.
const TEXT_FIELD_MAX: usize = 255;

/// Seam through which the outbox obtains transactions.
///
/// The outbox never opens a raw connection itself: every operation that
/// needs a transaction asks the provider for one. [`PgPool`] is the
/// production implementation; test doubles can wrap it to observe or
/// restrict transaction usage.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Begin a transaction owned by the caller.
    async fn begin(&self) -> Result<sqlx::PgTransaction<'static>, sqlx::Error>;
}

#[async_trait]
impl ConnectionProvider for PgPool {
    async fn begin(&self) -> Result<sqlx::PgTransaction<'static>, sqlx::Error> {
        sqlx::Pool::begin(self).await
    }
}

/// SQLx-based outbox driver.
///
/// Appends stage rows inside a caller-supplied or internally managed
/// transaction; claims reserve the oldest pending rows with a
/// `DELETE ... FOR UPDATE SKIP LOCKED ... RETURNING` statement, so
/// concurrent claimers neither block each other nor receive overlapping
/// rows.
#[derive(Clone)]
pub struct SqlxOutbox<P, C = JsonHeaderCodec> {
    provider: P,
    codec: C,
}

impl<P, C> SqlxOutbox<P, C>
where
    P: ConnectionProvider,
    C: HeaderCodec,
{
    /// Creates a new outbox without touching the schema.
    ///
    /// Use when the outbox table is provisioned externally.
    pub fn new_uninitialized(provider: P, codec: C) -> Self {
        Self { provider, codec }
    }

    /// Creates a new outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(provider: P, codec: C) -> Result<Self, Error> {
        let outbox = Self::new_uninitialized(provider, codec);
        outbox.ensure_table().await?;
        Ok(outbox)
    }

    /// Ensures the outbox table exists.
    ///
    /// Two processes may bootstrap concurrently: when creation fails but
    /// the table exists afterwards, the race lost is treated as success.
    /// Any other creation failure is fatal.
    async fn ensure_table(&self) -> Result<(), Error> {
        let mut tx = self.provider.begin().await?;
        let created = sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                correlation_id VARCHAR(16),
                message_id VARCHAR(255),
                source_queue VARCHAR(255),
                destination_address VARCHAR(255) NOT NULL,
                headers TEXT,
                body BYTEA,
                sent BOOLEAN NOT NULL DEFAULT FALSE
            )",
        )
        .execute(&mut *tx)
        .await;

        match created {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                drop(tx);
                if self.table_exists().await? {
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn table_exists(&self) -> Result<bool, Error> {
        let mut tx = self.provider.begin().await?;
        let oid: Option<String> = sqlx::query_scalar("SELECT to_regclass('outbox')::text")
            .fetch_one(&mut *tx)
            .await?;
        tx.rollback().await?;
        Ok(oid.is_some())
    }
}

/// SQLx `AppendMessages` driver implementation.
#[async_trait]
impl<P, C> AppendMessages for SqlxOutbox<P, C>
where
    P: ConnectionProvider,
    C: HeaderCodec,
{
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(count = messages.len()))]
    async fn append_messages(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Error> {
        validate_append(&messages, options)?;

        for message in messages {
            let headers = self.codec.encode(&message.headers).map_err(Error::codec)?;

            sqlx::query(
                "INSERT INTO outbox \
                 (correlation_id, message_id, source_queue, destination_address, headers, body) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(options.correlation_id.as_deref())
            .bind(options.message_id.as_deref())
            .bind(options.source_queue.as_deref())
            .bind(&message.destination_address)
            .bind(headers)
            .bind(&message.body)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(count = messages.len()))]
    async fn append(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
    ) -> Result<(), Error> {
        // Validated here as well so bad input fails before a transaction
        // is opened.
        validate_append(&messages, options)?;

        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.provider.begin().await?;
        self.append_messages(messages, options, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// SQLx `ClaimMessages` driver implementation.
#[async_trait]
impl<P, C> ClaimMessages for SqlxOutbox<P, C>
where
    P: ConnectionProvider,
    C: HeaderCodec,
{
    type Error = Error;
    type Batch = OutboxBatch;

    #[tracing::instrument(skip(self))]
    async fn claim_messages(
        &self,
        max_batch_size: usize,
        correlation_id: Option<&str>,
    ) -> Result<OutboxBatch, Error> {
        if max_batch_size == 0 {
            return Err(Error::invalid_argument("max_batch_size must be at least 1"));
        }

        let mut tx = self.provider.begin().await?;

        // Locked rows belong to a concurrent claimer and are skipped, so
        // parallel claims always reserve disjoint subsets.
        let query = if correlation_id.is_some() {
            "DELETE FROM outbox WHERE id IN (
                SELECT id FROM outbox WHERE correlation_id = $2
                ORDER BY id LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) RETURNING id, destination_address, headers, body"
        } else {
            "DELETE FROM outbox WHERE id IN (
                SELECT id FROM outbox
                ORDER BY id LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) RETURNING id, destination_address, headers, body"
        };

        let mut query = sqlx::query(query).bind(max_batch_size as i64);
        if let Some(correlation_id) = correlation_id {
            query = query.bind(correlation_id);
        }

        // On any failure from here on the transaction is dropped, which
        // rolls it back and returns the connection to the provider.
        let rows = query.fetch_all(&mut *tx).await?;

        if rows.is_empty() {
            // No work; release the transaction instead of holding it idle.
            tx.rollback().await?;
            return Ok(OutboxBatch::resolved());
        }

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let headers: Option<String> = row.try_get("headers")?;
            let headers = match headers {
                Some(raw) => self.codec.decode(&raw).map_err(Error::codec)?,
                None => HashMap::new(),
            };
            let body: Option<Vec<u8>> = row.try_get("body")?;

            messages.push(OutboxMessage {
                id: row.try_get("id")?,
                destination_address: row.try_get("destination_address")?,
                headers,
                body: body.unwrap_or_default(),
            });
        }
        // RETURNING emits rows in no defined order.
        messages.sort_by_key(|m| m.id);

        Ok(OutboxBatch {
            messages,
            tx: Some(tx),
        })
    }
}

/// Batch of messages claimed from the outbox.
///
/// The batch exclusively owns the transaction that removed its rows; no
/// other component may use that connection while the batch is alive. It
/// resolves exactly once:
///
/// - [`complete`](OutboxBatch::complete) commits the removal; the messages
///   are now permanently dispatched
/// - [`dispose`](OutboxBatch::dispose) rolls it back; the messages return
///   to the pending pool for a future claim
///
/// Dropping an unresolved batch takes the dispose path: the underlying
/// transaction rolls back when it goes out of scope, so a claimer that
/// fails mid-dispatch never loses messages. Both operations consume the
/// batch, so a second terminal call is rejected at compile time.
pub struct OutboxBatch {
    messages: Vec<OutboxMessage>,
    tx: Option<sqlx::PgTransaction<'static>>,
}

impl OutboxBatch {
    /// An empty batch with nothing left to resolve.
    fn resolved() -> Self {
        Self {
            messages: Vec::new(),
            tx: None,
        }
    }

    /// The claimed messages, ascending by id.
    pub fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    /// Number of claimed messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the claim found no pending rows.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Commit the claim; every message in the batch counts as dispatched.
    #[tracing::instrument(skip(self), fields(count = self.messages.len()))]
    pub async fn complete(mut self) -> Result<(), Error> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Roll the claim back; the messages become claimable again.
    #[tracing::instrument(skip(self), fields(count = self.messages.len()))]
    pub async fn dispose(mut self) -> Result<(), Error> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for OutboxBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxBatch")
            .field("messages", &self.messages.len())
            .field("resolved", &self.tx.is_none())
            .finish()
    }
}

fn validate_append(messages: &[OutgoingMessage], options: &AppendOptions) -> Result<(), Error> {
    check_len(
        "correlation_id",
        options.correlation_id.as_deref(),
        CORRELATION_ID_MAX,
    )?;
    check_len("message_id", options.message_id.as_deref(), TEXT_FIELD_MAX)?;
    check_len(
        "source_queue",
        options.source_queue.as_deref(),
        TEXT_FIELD_MAX,
    )?;

    for message in messages {
        if message.destination_address.is_empty() {
            return Err(Error::invalid_argument(
                "destination_address must not be empty",
            ));
        }
        check_len(
            "destination_address",
            Some(&message.destination_address),
            TEXT_FIELD_MAX,
        )?;
    }
    Ok(())
}

/// Rejects values that would not fit their column before any I/O happens.
fn check_len(field: &'static str, value: Option<&str>, max: usize) -> Result<(), Error> {
    match value {
        Some(value) if value.chars().count() > max => Err(Error::invalid_argument(format!(
            "{field} exceeds {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    /// Error from the database layer, propagated unmodified.
    Database(sqlx::Error),
    /// The header codec rejected a mapping or its persisted form.
    Codec(tower::BoxError),
    /// Invalid argument, detected before any I/O.
    InvalidArgument(String),
}

impl Error {
    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::InvalidArgument(message.into()),
        }
    }

    fn codec(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Codec(err.into()),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &SqlxDriverErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Codec(err) => writeln!(f, "Header codec error: {}", err),
            SqlxDriverErrorKind::InvalidArgument(msg) => writeln!(f, "Invalid argument: {}", msg),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Codec(err) => Some(err.as_ref()),
            SqlxDriverErrorKind::InvalidArgument(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}
