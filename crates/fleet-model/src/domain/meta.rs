use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Monotonic version of a service's task template.
///
/// The API layer bumps it whenever the template changes materially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

/// Store-maintained bookkeeping for a record.
///
/// `version` is the commit index of the last transaction that wrote the record and is
/// checked on update for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub version: u64,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Default for Meta {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
