//! # Distributed image-upscaling task coordination core
//!
//! Coordinates a pipeline where clients upload images to object
//! storage, a back tier persists processing tasks and streams them to
//! a broker, a pool of workers runs an external upscaler under bounded
//! concurrency, and completions are fanned out to live client sessions.
//!
//! ## Architecture
//!
//! - `model`: shared domain types (queue entries, user files, broker
//!   wire payloads)
//! - `ost`: concurrent order-statistics tree backing O(log N) queue
//!   rank queries
//! - `cache`: bounded LRU with single-flight load-on-miss
//! - `taskstore`: persistent queue/userfiles/outbox, transactional
//! - `cached_store`: wraps `taskstore` with the rank tree and a hot
//!   per-user file map
//! - `broker`: `T_req`/`T_res` producer and consumer
//! - `outbox`: periodic outbox-to-broker pump
//! - `idempotency`: short-TTL duplicate-delivery guard
//! - `session`: live user-session registry
//! - `objectstore`: presigned-URL blob transfer interface
//! - `worker`: `T_req` consumer running the upscaler pipeline
//! - `completion`: `T_res` consumer finalizing state and notifying
//!   clients
//! - `config`: per-binary environment configuration

#![warn(clippy::all)]

/// Crate version, surfaced in each binary's startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod broker;
pub mod cache;
pub mod cached_store;
pub mod completion;
pub mod config;
pub mod idempotency;
pub mod model;
pub mod objectstore;
pub mod ost;
pub mod outbox;
pub mod session;
pub mod taskstore;
pub mod worker;

pub use cached_store::CachedStore;
pub use completion::CompletionSink;
pub use idempotency::IdempotencyGuard;
pub use outbox::OutboxPump;
pub use session::SessionRegistry;
pub use taskstore::TaskStore;
pub use worker::Worker;
