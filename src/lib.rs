
pub mod core;

pub use core::{Server, Database, Collection, Transaction, TxCollection, Cursor};
pub use core::options::{TransactionOptions, AccessMode, QueryOptions, WriteOptions, ServerOptions, TransactionConfig};
pub use core::registry::{TransactionStatus, TxStatus, IdleSweeper};
pub use core::document::{DocumentMeta, Revision};
pub use core::cursor::QueryStats;
pub use core::index::IndexDefinition;
pub use core::errors::{Error, Result};
pub use core::metrics::MetricsSnapshot;
