#![doc = include_str!("../README.md")]

pub mod codec;
pub mod message;
pub mod outbox;

#[doc(inline)]
pub use codec::{HeaderCodec, JsonHeaderCodec};

#[doc(inline)]
pub use message::{AppendOptions, OutboxMessage, OutgoingMessage};

#[doc(inline)]
pub use outbox::{AppendMessages, ClaimMessages, Outbox, OutboxError, DEFAULT_BATCH_SIZE};
