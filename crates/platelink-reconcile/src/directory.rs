use crate::ReconcileError;
use platelink_core::keys::NAMESPACE_PREFIXES;
use platelink_core::{Key, PrimaryEntry};
use platelink_storage::KeyValueStore;
use std::collections::BTreeSet;
use tracing::info;

/// Point lookups and administrative wipes over the association namespace.
pub struct Directory<'s, S: KeyValueStore + ?Sized> {
    store: &'s S,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryLookup {
    pub primary_id: String,
    /// `None` when the pointer dangles (primary hash missing).
    pub entry: Option<PrimaryEntry>,
}

impl<'s, S: KeyValueStore + ?Sized> Directory<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    pub fn get_by_primary(&self, primary_id: &str) -> Result<Option<PrimaryEntry>, ReconcileError> {
        let fields = self.store.hash_get_all(&Key::primary(primary_id))?;
        Ok(PrimaryEntry::from_fields(primary_id, &fields)?)
    }

    pub fn get_by_secondary(
        &self,
        secondary_id: &str,
    ) -> Result<Option<SecondaryLookup>, ReconcileError> {
        let Some(primary_id) = self.store.get(&Key::secondary(secondary_id))? else {
            return Ok(None);
        };
        let entry = self.get_by_primary(&primary_id)?;
        Ok(Some(SecondaryLookup { primary_id, entry }))
    }

    pub fn batch_members(&self, batch_tag: &str) -> Result<BTreeSet<String>, ReconcileError> {
        Ok(self.store.set_members(&Key::batch(batch_tag))?)
    }

    /// Removes every primary, secondary and batch key. Returns the number of keys
    /// removed.
    pub fn clear_all(&self) -> Result<u64, ReconcileError> {
        let mut removed = 0;
        for prefix in NAMESPACE_PREFIXES {
            removed += self.store.delete_prefix(prefix)?;
        }
        info!(event = "store_cleared", removed);
        Ok(removed)
    }
}
