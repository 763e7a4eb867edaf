//! Keyed byte-blob storage: a TCP server backed by an in-memory
//! write-through cache over a one-file-per-key disk mirror, and a
//! connection-per-request client.

pub mod client;
pub mod server;
pub mod store;

pub use client::BucketClient;
pub use server::serve;
pub use store::BucketStore;

/// Payloads below this ride inline in a `set` request or `get` reply; larger
/// ones use the `big-set` / `__big__` handshake.
pub const SMALL_PAYLOAD_THRESHOLD: usize = 2048;
