
pub type TransactionID = u64;

/// Position in a database's commit order. Snapshots and version
/// visibility are expressed in commit sequences.
pub type CommitSeq = u64;

pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 900.0;

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_FINISHED_HISTORY: usize = 1024;

pub const MAX_KEY_LENGTH: usize = 254;

pub const MAX_NAME_LENGTH: usize = 256;

pub const KEY_ATTRIBUTE: &str = "_key";
pub const ID_ATTRIBUTE: &str = "_id";
pub const REV_ATTRIBUTE: &str = "_rev";

pub const SYSTEM_ATTRIBUTES: [&str; 3] = [KEY_ATTRIBUTE, ID_ATTRIBUTE, REV_ATTRIBUTE];
