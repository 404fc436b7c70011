//! Pull playable media links out of feeds into a filesystem delivery queue.
//!
//! - [`extract`] - streaming extractors turning feed documents into [`Record`]s
//! - [`feed`] - `selector+url` dispatch, HTTP fetch and ingestion
//! - [`store`] - the pending/seen [`DeliveryStore`]
//! - [`record`] - records and their storage keys
//! - [`config`] - optional TOML configuration

pub mod config;
pub mod extract;
pub mod feed;
pub mod record;
pub mod store;

pub use feed::{ingest, Dispatcher, Extraction};
pub use record::{make_key, Key, Record};
pub use store::{DeliveryStore, StoreError};
