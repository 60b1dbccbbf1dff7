use crate::core::constants::*;
use crate::core::document::Revision;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Intent a transaction holds on a collection. Ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    Exclusive,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Exclusive => "exclusive",
        }
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Options a transaction is created with.
///
/// Build it with the typed builder or parse the document form
/// `{collections: {read, write, exclusive}, waitForSync, lockTimeout, allowImplicit}`
/// with [`TransactionOptions::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub exclusive: Vec<String>,
    pub wait_for_sync: bool,
    /// Seconds to wait for intents. `Some(0.0)` waits forever, `None`
    /// falls back to the server default.
    pub lock_timeout: Option<f64>,
    pub allow_implicit: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            read: Vec::new(),
            write: Vec::new(),
            exclusive: Vec::new(),
            wait_for_sync: false,
            lock_timeout: None,
            allow_implicit: true,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn write<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclusive<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn wait_for_sync(mut self, wait_for_sync: bool) -> Self {
        self.wait_for_sync = wait_for_sync;
        self
    }

    pub fn lock_timeout(mut self, secs: f64) -> Self {
        self.lock_timeout = Some(secs);
        self
    }

    pub fn allow_implicit(mut self, allow: bool) -> Self {
        self.allow_implicit = allow;
        self
    }

    /// Parses and validates the document form of the options.
    pub fn from_value(config: &Value) -> Result<Self> {
        let obj = config
            .as_object()
            .ok_or_else(|| Error::bad_parameter("transaction options must be an object"))?;

        let collections = match obj.get("collections") {
            Some(Value::Object(c)) => c,
            Some(_) => return Err(Error::bad_parameter("'collections' must be an object")),
            None => return Err(Error::bad_parameter("missing 'collections' attribute")),
        };

        let mut options = TransactionOptions {
            read: collection_list(collections.get("read"), "read")?,
            write: collection_list(collections.get("write"), "write")?,
            exclusive: collection_list(collections.get("exclusive"), "exclusive")?,
            ..Default::default()
        };

        if let Some(allow) = collections.get("allowImplicit").or_else(|| obj.get("allowImplicit")) {
            options.allow_implicit = allow
                .as_bool()
                .ok_or_else(|| Error::bad_parameter("'allowImplicit' must be a boolean"))?;
        }

        if let Some(sync) = obj.get("waitForSync") {
            options.wait_for_sync = sync
                .as_bool()
                .ok_or_else(|| Error::bad_parameter("'waitForSync' must be a boolean"))?;
        }

        if let Some(timeout) = obj.get("lockTimeout") {
            let secs = timeout
                .as_f64()
                .ok_or_else(|| Error::bad_parameter("'lockTimeout' must be a number"))?;
            options.lock_timeout = Some(secs);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.lock_timeout {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::bad_parameter(format!(
                    "'lockTimeout' must be a finite, non-negative number, got {}",
                    secs
                )));
            }
        }

        for name in self.read.iter().chain(&self.write).chain(&self.exclusive) {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                return Err(Error::bad_parameter(format!("invalid collection name '{}'", name)));
            }
        }
        Ok(())
    }

    /// Strongest requested intent per collection, ordered by name.
    pub fn intents(&self) -> BTreeMap<String, AccessMode> {
        let mut intents = BTreeMap::new();
        let declared = [
            (&self.read, AccessMode::Read),
            (&self.write, AccessMode::Write),
            (&self.exclusive, AccessMode::Exclusive),
        ];
        for (names, mode) in declared {
            for name in names {
                let entry = intents.entry(name.clone()).or_insert(mode);
                if mode > *entry {
                    *entry = mode;
                }
            }
        }
        intents
    }

    /// Effective wait for intents; `None` waits forever. Timeouts too large
    /// to represent wait forever as well.
    pub fn lock_wait(&self, default_secs: f64) -> Option<Duration> {
        let secs = self.lock_timeout.unwrap_or(default_secs);
        if secs <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(secs).ok()
    }
}

fn collection_list(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(name)) => Ok(vec![name.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::bad_parameter(format!("'collections.{}' must only contain strings", field))
                })
            })
            .collect(),
        Some(_) => Err(Error::bad_parameter(format!(
            "'collections.{}' must be a string or an array of strings",
            field
        ))),
    }
}

/// Options for a query run inside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Produce rows lazily instead of executing the whole query at open.
    pub stream: bool,
    /// Report the total row count. Only available for non-streaming cursors.
    pub count: bool,
}

impl QueryOptions {
    pub fn streaming() -> Self {
        Self { stream: true, count: false }
    }
}

/// Per-operation options for document writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub if_match: Option<Revision>,
    /// When false, a `_rev` inside the document acts like `if_match`.
    pub ignore_revs: bool,
    /// Keep the revision given in `_rev` instead of generating one.
    pub is_restore: bool,
    pub keep_null: bool,
    pub merge_objects: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            if_match: None,
            ignore_revs: true,
            is_restore: false,
            keep_null: true,
            merge_objects: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_match(mut self, rev: Revision) -> Self {
        self.if_match = Some(rev);
        self
    }

    pub fn ignore_revs(mut self, ignore: bool) -> Self {
        self.ignore_revs = ignore;
        self
    }

    pub fn restore() -> Self {
        Self {
            is_restore: true,
            ..Self::default()
        }
    }

    pub fn keep_null(mut self, keep: bool) -> Self {
        self.keep_null = keep;
        self
    }

    pub fn merge_objects(mut self, merge: bool) -> Self {
        self.merge_objects = merge;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Wait for intents when a transaction does not set `lockTimeout`.
    pub default_lock_timeout_secs: f64,
    /// Running transactions idle for longer are aborted. 0 disables.
    pub idle_timeout_ms: u64,
    /// Finished transactions remembered per database for status lookups.
    pub finished_history: usize,
    /// Maximum buffered writes per transaction. 0 is unlimited.
    pub max_transaction_operations: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            default_lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            finished_history: DEFAULT_FINISHED_HISTORY,
            max_transaction_operations: 0,
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.default_lock_timeout_secs.is_finite() || self.default_lock_timeout_secs < 0.0 {
            return Err(Error::bad_parameter("default_lock_timeout_secs must be a finite, non-negative number"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Retry policy of `Database::execute_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_retries: usize,
    pub retry_backoff_base_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_base_ms: 1,
            max_retry_backoff_ms: 100,
        }
    }
}

impl TransactionConfig {
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(factor)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejects(config: Value) {
        let err = TransactionOptions::from_value(&config).unwrap_err();
        assert_eq!(err.code(), 10, "expected BadParameter for {}", config);
    }

    #[test]
    fn test_parse_full_options() {
        let options = TransactionOptions::from_value(&json!({
            "collections": {"read": "a", "write": ["b", "c"], "exclusive": []},
            "waitForSync": true,
            "lockTimeout": 2.5,
            "allowImplicit": false,
        }))
        .unwrap();

        assert_eq!(options.read, vec!["a"]);
        assert_eq!(options.write, vec!["b", "c"]);
        assert!(options.exclusive.is_empty());
        assert!(options.wait_for_sync);
        assert_eq!(options.lock_timeout, Some(2.5));
        assert!(!options.allow_implicit);
    }

    #[test]
    fn test_empty_collections_are_allowed() {
        let options = TransactionOptions::from_value(&json!({"collections": {}})).unwrap();
        assert!(options.intents().is_empty());
        assert!(options.allow_implicit);
    }

    #[test]
    fn test_malformed_options() {
        rejects(json!("collections"));
        rejects(json!([]));
        rejects(json!({}));
        rejects(json!({"collections": true}));
        rejects(json!({"collections": {"read": 1}}));
        rejects(json!({"collections": {"write": ["a", 2]}}));
        rejects(json!({"collections": {"write": {"a": true}}}));
        rejects(json!({"collections": {}, "lockTimeout": -1}));
        rejects(json!({"collections": {}, "lockTimeout": "10"}));
        rejects(json!({"collections": {}, "waitForSync": "yes"}));
        rejects(json!({"collections": {}, "allowImplicit": 1}));
        rejects(json!({"collections": {"read": [""]}}));
    }

    #[test]
    fn test_builder_rejects_non_finite_timeout() {
        assert!(TransactionOptions::new().lock_timeout(f64::NAN).validate().is_err());
        assert!(TransactionOptions::new().lock_timeout(f64::INFINITY).validate().is_err());
        assert!(TransactionOptions::new().lock_timeout(0.0).validate().is_ok());
    }

    #[test]
    fn test_intents_keep_strongest_mode() {
        let options = TransactionOptions::new()
            .read(["a", "b"])
            .write(["b"])
            .exclusive(["c", "a"]);
        let intents = options.intents();
        assert_eq!(intents["a"], AccessMode::Exclusive);
        assert_eq!(intents["b"], AccessMode::Write);
        assert_eq!(intents["c"], AccessMode::Exclusive);
    }

    #[test]
    fn test_lock_wait() {
        assert_eq!(TransactionOptions::new().lock_wait(900.0), Some(Duration::from_secs(900)));
        assert_eq!(TransactionOptions::new().lock_timeout(0.0).lock_wait(900.0), None);
        assert_eq!(
            TransactionOptions::new().lock_timeout(0.5).lock_wait(900.0),
            Some(Duration::from_millis(500))
        );
        assert_eq!(TransactionOptions::new().lock_timeout(1e20).lock_wait(900.0), None);
        assert_eq!(TransactionOptions::new().lock_wait(1e20), None);
    }

    #[test]
    fn test_server_options_from_json() {
        let options: ServerOptions = serde_json::from_value(json!({"idle_timeout_ms": 0})).unwrap();
        assert_eq!(options.idle_timeout(), None);
        assert_eq!(options.finished_history, DEFAULT_FINISHED_HISTORY);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = TransactionConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(1));
        assert_eq!(config.backoff(3), Duration::from_millis(8));
        assert_eq!(config.backoff(40), Duration::from_millis(100));
        assert_eq!(config.backoff(200), Duration::from_millis(100));
    }
}
