use crate::core::constants::*;
use crate::core::document::Revision;
use crate::core::errors::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// What a buffered write expects the committed revision of its key to be
/// when the transaction commits. `None` expects the key to be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictToken {
    pub collection: String,
    pub key: String,
    pub expected: Option<Revision>,
}

/// Outcome of validating one token against the committed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Token matches; carries the revision the key will have after apply
    /// (`None` for a removal).
    Ok(Option<Revision>),
    Conflict {
        expected: Option<Revision>,
        actual: Option<Revision>,
    },
}

impl Validation {
    #[cfg(test)]
    pub(crate) fn is_ok(&self) -> bool {
        matches!(self, Validation::Ok(_))
    }

    pub fn into_result(self, token: &ConflictToken) -> Result<Option<Revision>> {
        match self {
            Validation::Ok(next) => Ok(next),
            Validation::Conflict { expected, actual } => Err(conflict_error(
                &token.collection,
                &token.key,
                expected,
                actual,
            )),
        }
    }
}

pub(crate) fn conflict_error(
    collection: &str,
    key: &str,
    expected: Option<Revision>,
    actual: Option<Revision>,
) -> Error {
    Error::Conflict {
        collection: collection.to_string(),
        key: key.to_string(),
        expected: expected.map(|r| r.to_string()),
        actual: actual.map(|r| r.to_string()),
    }
}

/// Decides document-level write contention for one database.
///
/// Two mechanisms cooperate: key claims catch two running transactions
/// writing the same key (the second writer fails at its write), and token
/// validation catches anything committed since the writer's snapshot.
pub struct ConflictDetector {
    claims: Mutex<HashMap<(String, String), TransactionID>>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn validate(&self, token: &ConflictToken, actual: Option<Revision>, next: Option<Revision>) -> Validation {
        if token.expected == actual {
            Validation::Ok(next)
        } else {
            Validation::Conflict {
                expected: token.expected,
                actual,
            }
        }
    }

    /// Claims `(collection, key)` for `tx_id`. Returns true when the claim
    /// is new, false when `tx_id` already held it.
    pub fn claim(&self, tx_id: TransactionID, collection: &str, key: &str) -> Result<bool> {
        let mut claims = self.claims.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "conflict.claims".to_string() })?;

        let slot = (collection.to_string(), key.to_string());
        match claims.get(&slot) {
            Some(holder) if *holder == tx_id => Ok(false),
            Some(holder) => {
                debug!(trx = tx_id, holder = *holder, collection, key, "key already claimed");
                Err(Error::Conflict {
                    collection: slot.0,
                    key: slot.1,
                    expected: None,
                    actual: None,
                })
            }
            None => {
                claims.insert(slot, tx_id);
                Ok(true)
            }
        }
    }

    pub fn release_all<'a>(&self, tx_id: TransactionID, slots: impl IntoIterator<Item = &'a (String, String)>) {
        let mut claims = self.claims.lock().recover_poison();
        for slot in slots {
            if claims.get(slot) == Some(&tx_id) {
                claims.remove(slot);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn holder(&self, collection: &str, key: &str) -> Option<TransactionID> {
        let claims = self.claims.lock().recover_poison();
        claims.get(&(collection.to_string(), key.to_string())).copied()
    }

    #[cfg(test)]
    pub(crate) fn claim_count(&self) -> usize {
        self.claims.lock().recover_poison().len()
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}
