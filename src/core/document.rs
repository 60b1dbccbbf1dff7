use crate::core::constants::*;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque, strictly increasing document revision.
///
/// Rendered as `_` followed by lowercase hex; callers should treat the
/// text as an opaque token and only compare revisions for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Revision(raw)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "_{:x}", self.0)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('_').unwrap_or(s);
        u64::from_str_radix(digits, 16)
            .ok()
            .filter(|raw| *raw != 0)
            .map(Revision)
            .ok_or_else(|| Error::bad_parameter(format!("invalid revision '{}'", s)))
    }
}

impl Serialize for Revision {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Hybrid clock handing out revisions: wall-clock microseconds when the
/// clock moves forward, last + 1 otherwise.
#[derive(Debug, Default)]
pub struct RevisionClock {
    last: AtomicU64,
}

impl RevisionClock {
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    /// Fails once the clock has reached the largest representable
    /// revision, which only a restored revision can push it to.
    pub fn next(&self) -> Result<Revision> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let following = current.checked_add(1).ok_or_else(|| Error::TransactionInternal {
                reason: format!("revision clock exhausted at {}", Revision(current)),
            })?;
            let candidate = now.max(following);
            match self.last.compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(Revision(candidate)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Restored revisions come from outside the clock; make sure no fresh
    /// revision can ever equal one of them.
    pub fn observe(&self, rev: Revision) {
        self.last.fetch_max(rev.0, Ordering::SeqCst);
    }
}

/// Generates numeric document keys, skipping past numeric keys that
/// callers supplied themselves.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last: AtomicU64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    /// `None` once the largest numeric key has been handed out or observed.
    pub fn next(&self) -> Option<String> {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| last.checked_add(1))
            .ok()
            .map(|last| (last + 1).to_string())
    }

    pub fn observe(&self, key: &str) {
        if let Ok(n) = key.parse::<u64>() {
            self.last.fetch_max(n, Ordering::SeqCst);
        }
    }
}

/// Identity of a written document, returned by every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentMeta {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: Revision,
    #[serde(rename = "_oldRev", skip_serializing_if = "Option::is_none")]
    pub old_rev: Option<Revision>,
}

impl DocumentMeta {
    pub(crate) fn new(collection: &str, key: &str, rev: Revision, old_rev: Option<Revision>) -> Self {
        Self {
            key: key.to_string(),
            id: format!("{}/{}", collection, key),
            rev,
            old_rev,
        }
    }
}

/// A document split into its system attributes and stored payload.
#[derive(Debug, Clone)]
pub(crate) struct SplitDocument {
    pub key: Option<String>,
    pub rev: Option<Revision>,
    pub payload: Map<String, Value>,
}

pub(crate) fn split_document(collection: &str, doc: &Value) -> Result<SplitDocument> {
    let obj = doc.as_object().ok_or_else(|| Error::DocumentTypeInvalid {
        reason: format!("document for collection '{}' must be an object", collection),
    })?;

    let key = match obj.get(KEY_ATTRIBUTE) {
        None | Some(Value::Null) => None,
        Some(Value::String(key)) => {
            validate_key(key)?;
            Some(key.clone())
        }
        Some(other) => {
            return Err(Error::DocumentKeyBad { key: other.to_string() });
        }
    };

    let rev = match obj.get(REV_ATTRIBUTE) {
        None | Some(Value::Null) => None,
        Some(Value::String(rev)) => Some(rev.parse()?),
        Some(other) => {
            return Err(Error::bad_parameter(format!("invalid revision {}", other)));
        }
    };

    let payload = obj
        .iter()
        .filter(|(name, _)| !SYSTEM_ATTRIBUTES.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(SplitDocument { key, rev, payload })
}

/// Resolves a document selector: either a key string, an `_id` string
/// (`collection/key`) or an object carrying `_key`.
pub(crate) fn selector_key(collection: &str, selector: &Value) -> Result<String> {
    match selector {
        Value::String(s) => {
            let key = match s.split_once('/') {
                Some((_, key)) => key,
                None => s.as_str(),
            };
            validate_key(key)?;
            Ok(key.to_string())
        }
        Value::Object(obj) => match obj.get(KEY_ATTRIBUTE) {
            Some(Value::String(key)) => {
                validate_key(key)?;
                Ok(key.clone())
            }
            _ => Err(Error::DocumentKeyBad {
                key: format!("missing _key in selector for '{}'", collection),
            }),
        },
        other => Err(Error::DocumentKeyBad { key: other.to_string() }),
    }
}

pub fn validate_key(key: &str) -> Result<()> {
    let valid_char = |c: char| {
        c.is_ascii_alphanumeric() || "_-:.@()+,=;$!*'%".contains(c)
    };

    if key.is_empty() || key.len() > MAX_KEY_LENGTH || !key.chars().all(valid_char) {
        return Err(Error::DocumentKeyBad { key: key.to_string() });
    }
    Ok(())
}

/// Builds the externally visible form of a stored document.
pub(crate) fn materialize(collection: &str, key: &str, rev: Revision, payload: &Map<String, Value>) -> Value {
    let mut out = Map::with_capacity(payload.len() + 3);
    out.insert(KEY_ATTRIBUTE.to_string(), Value::String(key.to_string()));
    out.insert(ID_ATTRIBUTE.to_string(), Value::String(format!("{}/{}", collection, key)));
    out.insert(REV_ATTRIBUTE.to_string(), Value::String(rev.to_string()));
    for (name, value) in payload {
        out.insert(name.clone(), value.clone());
    }
    Value::Object(out)
}

/// Applies an update patch to a stored payload.
pub(crate) fn apply_patch(
    base: &Map<String, Value>,
    patch: &Map<String, Value>,
    keep_null: bool,
    merge_objects: bool,
) -> Map<String, Value> {
    let mut out = base.clone();
    for (name, value) in patch {
        if value.is_null() && !keep_null {
            out.remove(name);
            continue;
        }

        let merged = match (out.get(name), value) {
            (Some(Value::Object(old)), Value::Object(new)) if merge_objects => {
                Value::Object(apply_patch(old, new, keep_null, merge_objects))
            }
            _ => value.clone(),
        };
        out.insert(name.clone(), merged);
    }
    out
}
