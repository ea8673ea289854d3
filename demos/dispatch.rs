use std::collections::HashMap;
use std::time::Duration;

use postbox::outbox::sqlx::{OutboxBatch, PgOutbox};
use postbox::{AppendMessages, AppendOptions, ClaimMessages, JsonHeaderCodec, OutgoingMessage};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Greeting {
    id: i32,
    message: String,
}

/// Stand-in for the transport collaborator: delivery is just a log line.
async fn deliver(batch: &OutboxBatch) {
    for message in batch.messages() {
        tracing::info!(
            id = message.id,
            destination = %message.destination_address,
            bytes = message.body.len(),
            "delivered"
        );
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().unwrap();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    // Appender: stages one message per tick, atomically.
    let pool_clone = pool.clone();
    let cancel_appender = cancel.clone();
    let appender_handle = tokio::spawn(async move {
        let outbox = PgOutbox::try_new(pool_clone.clone(), JsonHeaderCodec)
            .await
            .unwrap();

        let mut id = 0;
        loop {
            let body = serde_json::to_vec(&Greeting {
                id,
                message: "Hello".to_owned(),
            })
            .unwrap();
            let message = OutgoingMessage::new(
                "greetings",
                HashMap::from([("content-type".to_owned(), "application/json".to_owned())]),
                body,
            );

            let mut tx = pool_clone.begin().await.unwrap();
            // ... business-logic updates would share this transaction ...
            outbox
                .append_messages(
                    vec![message],
                    &AppendOptions::default().with_message_id(format!("greeting-{id}")),
                    &mut tx,
                )
                .await
                .expect("failed to stage message");
            tx.commit().await.unwrap();

            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if cancel_appender.is_cancelled() {
                break;
            }
        }
    });

    // Dispatch loop: claim a batch, deliver it, complete on success.
    let dispatch_handle = tokio::spawn(async move {
        let outbox = PgOutbox::try_new(pool.clone(), JsonHeaderCodec).await.unwrap();

        loop {
            let batch = outbox.claim_messages(10, None).await.unwrap();
            if batch.is_empty() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                deliver(&batch).await;
                batch.complete().await.unwrap();
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    });

    tokio::try_join!(cancel_handle, appender_handle, dispatch_handle).unwrap();
}
