
pub mod constants;
pub mod errors;
pub mod document;
pub mod index;
pub mod mvcc;
pub mod store;
pub mod conflict;
pub mod buffer;
pub mod locks;
pub mod options;
pub mod transaction;
pub mod tx_collection;
pub mod query;
pub mod cursor;
pub mod registry;
pub mod database;
pub mod collection;
pub mod server;
pub mod metrics;

pub use constants::*;
pub use server::Server;
pub use database::Database;
pub use collection::Collection;
pub use transaction::Transaction;
pub use tx_collection::TxCollection;
pub use cursor::Cursor;
pub use metrics::{Metrics, MetricsSnapshot};
