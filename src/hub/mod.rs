//! The hub: authoritative step-state store and scheduler, its framed TCP
//! server, and the client used by workers and submitters.

pub mod client;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::HubClient;
pub use server::serve;
pub use store::{HubStore, HubStoreConfig, StepRecord};
