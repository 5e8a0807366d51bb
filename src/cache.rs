use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AirhostError, Result};

/// Claims on WhatsApp message ids, so a webhook redelivery is processed once
#[cfg_attr(test, mockall::automock)]
pub trait DeliveryLog: Send + Sync {
    /// Record a message id. Returns `false` if it was already recorded.
    fn mark_seen(&self, whatsapp_message_id: &str) -> Result<bool>;

    /// Attach the conversation a claimed message was filed under
    fn assign_conversation(&self, whatsapp_message_id: &str, conversation_id: &str) -> Result<()>;

    /// Release a claim so a redelivery is accepted again
    fn forget(&self, whatsapp_message_id: &str) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct DeliveryEntry {
    whatsapp_message_id: String,
    conversation_id: Option<String>,
    seen_at: DateTime<Utc>,
}

impl DeliveryEntry {
    fn new(whatsapp_message_id: &str, conversation_id: Option<&str>) -> Self {
        Self {
            whatsapp_message_id: whatsapp_message_id.to_string(),
            conversation_id: conversation_id.map(ToString::to_string),
            seen_at: Utc::now(),
        }
    }
}

/// sled-backed [`DeliveryLog`]. Entries are kept until [`DeliveryCache::prune_older_than`].
#[derive(Clone)]
pub struct DeliveryCache {
    db: sled::Db,
}

impl DeliveryCache {
    /// Open (creating if needed) the cache directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)
            .map_err(|e| AirhostError::Cache(format!("Failed to open delivery cache at {}: {e}", path.display())))?;
        Ok(Self { db })
    }

    /// Cache that lives only as long as the process
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Drop entries older than `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for item in self.db.iter() {
            let (key, data) = item?;
            let entry: DeliveryEntry = bincode::deserialize(&data)?;
            if entry.seen_at < cutoff {
                self.db.remove(key)?;
                removed += 1;
            }
        }
        self.db.flush()?;
        Ok(removed)
    }
}

impl DeliveryLog for DeliveryCache {
    fn mark_seen(&self, whatsapp_message_id: &str) -> Result<bool> {
        let data = bincode::serialize(&DeliveryEntry::new(whatsapp_message_id, None))?;
        let inserted = self
            .db
            .compare_and_swap(whatsapp_message_id.as_bytes(), None::<&[u8]>, Some(data))?
            .is_ok();
        if !inserted {
            debug!(whatsapp_message_id, "Duplicate webhook delivery");
        }
        Ok(inserted)
    }

    fn assign_conversation(&self, whatsapp_message_id: &str, conversation_id: &str) -> Result<()> {
        let entry = DeliveryEntry::new(whatsapp_message_id, Some(conversation_id));
        self.db.insert(whatsapp_message_id.as_bytes(), bincode::serialize(&entry)?)?;
        Ok(())
    }

    fn forget(&self, whatsapp_message_id: &str) -> Result<()> {
        self.db.remove(whatsapp_message_id.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
impl DeliveryCache {
    pub(crate) fn mark_seen_at(&self, whatsapp_message_id: &str, seen_at: DateTime<Utc>) -> Result<()> {
        let mut entry = DeliveryEntry::new(whatsapp_message_id, None);
        entry.seen_at = seen_at;
        self.db.insert(whatsapp_message_id.as_bytes(), bincode::serialize(&entry)?)?;
        Ok(())
    }
}
