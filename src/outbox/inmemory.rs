use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::message::{AppendOptions, OutboxMessage, OutgoingMessage};
use crate::outbox::{AppendMessages, ClaimMessages};

/// An in-memory outbox for testing or local usage.
///
/// Mirrors the claim protocol of the SQL driver without a database: rows
/// are kept in insertion order, a claim reserves the oldest unclaimed rows,
/// and the reservation stays reversible until the batch completes. Claimed
/// rows are invisible to other claims but remain in the store, exactly as
/// uncommitted deletes do in the SQL driver.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    store: Arc<Mutex<Store>>,
}

#[derive(Default)]
struct Store {
    next_id: i64,
    rows: BTreeMap<i64, StoredRow>,
    claimed: HashSet<i64>,
}

struct StoredRow {
    correlation_id: Option<String>,
    destination_address: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl InMemoryOutbox {
    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_rows(&self, messages: Vec<OutgoingMessage>, options: &AppendOptions) {
        let mut store = self.lock();
        for message in messages {
            store.next_id += 1;
            let id = store.next_id;
            store.rows.insert(
                id,
                StoredRow {
                    correlation_id: options.correlation_id.clone(),
                    destination_address: message.destination_address,
                    headers: message.headers,
                    body: message.body,
                },
            );
        }
    }
}

#[async_trait]
impl AppendMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = ();

    /// Insert messages into the in-memory store.
    async fn append_messages(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), InMemoryOutboxError> {
        self.insert_rows(messages, options);
        Ok(())
    }

    async fn append(
        &self,
        messages: Vec<OutgoingMessage>,
        options: &AppendOptions,
    ) -> Result<(), InMemoryOutboxError> {
        self.insert_rows(messages, options);
        Ok(())
    }
}

#[async_trait]
impl ClaimMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Batch = InMemoryBatch;

    /// Reserve the oldest unclaimed rows, optionally scoped to one
    /// correlation id.
    async fn claim_messages(
        &self,
        max_batch_size: usize,
        correlation_id: Option<&str>,
    ) -> Result<InMemoryBatch, InMemoryOutboxError> {
        if max_batch_size == 0 {
            return Err(InMemoryOutboxError::invalid_argument(
                "max_batch_size must be at least 1",
            ));
        }

        let mut store = self.lock();
        let ids: Vec<i64> = store
            .rows
            .iter()
            .filter(|(id, row)| {
                !store.claimed.contains(*id)
                    && correlation_id
                        .map_or(true, |scope| row.correlation_id.as_deref() == Some(scope))
            })
            .take(max_batch_size)
            .map(|(id, _)| *id)
            .collect();

        let messages = ids
            .iter()
            .map(|id| {
                let row = &store.rows[id];
                OutboxMessage {
                    id: *id,
                    destination_address: row.destination_address.clone(),
                    headers: row.headers.clone(),
                    body: row.body.clone(),
                }
            })
            .collect();
        store.claimed.extend(ids.iter().copied());

        Ok(InMemoryBatch {
            messages,
            ids,
            store: Arc::clone(&self.store),
            resolved: false,
        })
    }
}

/// Batch of messages claimed from the in-memory outbox.
///
/// Resolves exactly once: [`complete`](InMemoryBatch::complete) removes the
/// rows for good, [`dispose`](InMemoryBatch::dispose) or dropping the batch
/// returns them to the pending pool.
pub struct InMemoryBatch {
    messages: Vec<OutboxMessage>,
    ids: Vec<i64>,
    store: Arc<Mutex<Store>>,
    resolved: bool,
}

impl InMemoryBatch {
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

    /// Remove the claimed rows for good.
    pub fn complete(mut self) {
        self.release(true);
    }

    /// Return the claimed rows to the pending pool.
    pub fn dispose(mut self) {
        self.release(false);
    }

    fn release(&mut self, remove_rows: bool) {
        if self.resolved {
            return;
        }
        self.resolved = true;

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            store.claimed.remove(id);
            if remove_rows {
                store.rows.remove(id);
            }
        }
    }
}

impl Drop for InMemoryBatch {
    /// An unresolved batch releases its claim on drop, as a rolled-back
    /// transaction would.
    fn drop(&mut self) {
        self.release(false);
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn invalid_argument(message: &'static str) -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::InvalidArgument(message),
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::InvalidArgument(msg) => {
                write!(f, "Invalid argument: {}", msg)
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    InvalidArgument(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;

    fn message(destination: &str, body: &[u8]) -> OutgoingMessage {
        OutgoingMessage::new(destination, HashMap::new(), body.to_vec())
    }

    #[tokio::test]
    async fn claims_come_back_in_insertion_order() {
        let outbox = InMemoryOutbox::default();
        outbox
            .append(
                vec![message("a", b"1"), message("b", b"2"), message("c", b"3")],
                &AppendOptions::default(),
            )
            .await
            .unwrap();

        let batch = outbox.claim_messages(2, None).await.unwrap();
        let destinations: Vec<&str> = batch
            .messages()
            .iter()
            .map(|m| m.destination_address.as_str())
            .collect();
        assert_eq!(destinations, vec!["a", "b"]);
        batch.complete();

        let rest = outbox.claim_messages(10, None).await.unwrap();
        assert_eq!(rest.messages()[0].destination_address, "c");
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let outbox = InMemoryOutbox::default();
        outbox
            .append(
                (0..4).map(|i| message(&format!("d{i}"), b"x")).collect(),
                &AppendOptions::default(),
            )
            .await
            .unwrap();

        let first = outbox.claim_messages(2, None).await.unwrap();
        let second = outbox.claim_messages(10, None).await.unwrap();

        let first_ids: Vec<i64> = first.messages().iter().map(|m| m.id).collect();
        let second_ids: Vec<i64> = second.messages().iter().map(|m| m.id).collect();
        assert_eq!(first_ids.len(), 2);
        assert_eq!(second_ids.len(), 2);
        assert!(first_ids.iter().all(|id| !second_ids.contains(id)));
    }

    #[tokio::test]
    async fn disposed_rows_are_claimable_again() {
        let outbox = InMemoryOutbox::default();
        outbox
            .append(vec![message("a", b"1")], &AppendOptions::default())
            .await
            .unwrap();

        let batch = outbox.claim_messages(1, None).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch.dispose();

        let again = outbox.claim_messages(1, None).await.unwrap();
        assert_eq!(again.len(), 1);
        again.complete();

        let empty = outbox.claim_messages(1, None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn dropped_batch_releases_its_claim() {
        let outbox = InMemoryOutbox::default();
        outbox
            .append(vec![message("a", b"1")], &AppendOptions::default())
            .await
            .unwrap();

        {
            let batch = outbox.claim_messages(1, None).await.unwrap();
            assert_eq!(batch.len(), 1);
        }

        let again = outbox.claim_messages(1, None).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn claims_respect_correlation_scope() {
        let outbox = InMemoryOutbox::default();
        outbox
            .append(
                vec![message("a", b"1")],
                &AppendOptions::default().with_correlation_id("left"),
            )
            .await
            .unwrap();
        outbox
            .append(
                vec![message("b", b"2")],
                &AppendOptions::default().with_correlation_id("right"),
            )
            .await
            .unwrap();

        let scoped = outbox.claim_messages(10, Some("right")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped.messages()[0].destination_address, "b");

        let missing = outbox.claim_messages(10, Some("absent")).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let outbox = InMemoryOutbox::default();
        assert!(outbox.claim_messages(0, None).await.is_err());
    }

    #[tokio::test]
    async fn facade_wraps_append_and_claim() {
        let outbox = Outbox::new(InMemoryOutbox::default());

        outbox
            .append(
                vec![message("orders", b"payload")],
                &AppendOptions::default(),
            )
            .await
            .unwrap();

        let batch = outbox.claim_messages(10, None).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.messages()[0].body, b"payload");
        batch.complete();
    }
}
