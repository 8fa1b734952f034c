use crate::{ContractError, IncomingRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const PRIMARY_PREFIX: &str = "primary:";
pub const SECONDARY_PREFIX: &str = "secondary:";
pub const BATCH_PREFIX: &str = "batch:";
pub const NAMESPACE_PREFIXES: [&str; 3] = [PRIMARY_PREFIX, SECONDARY_PREFIX, BATCH_PREFIX];

pub const FIELD_SECONDARY_ID: &str = "secondaryId";
pub const FIELD_OWNER_LABEL: &str = "ownerLabel";
pub const FIELD_LAST_MODIFIED: &str = "lastModified";
pub const FIELD_BATCH_TAG: &str = "batchTag";

/// Logical key in the association namespace.
///
/// `Primary` addresses a hash, `Secondary` a string holding the owning primary id,
/// `Batch` a set of primary ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Primary(String),
    Secondary(String),
    Batch(String),
}

impl Key {
    pub fn primary(id: impl Into<String>) -> Self {
        Key::Primary(id.into())
    }

    pub fn secondary(id: impl Into<String>) -> Self {
        Key::Secondary(id.into())
    }

    pub fn batch(tag: impl Into<String>) -> Self {
        Key::Batch(tag.into())
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Key::Primary(_) => PRIMARY_PREFIX,
            Key::Secondary(_) => SECONDARY_PREFIX,
            Key::Batch(_) => BATCH_PREFIX,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Key::Primary(id) | Key::Secondary(id) | Key::Batch(id) => id,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}", self.prefix(), self.id())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.id())
    }
}

/// Decoded form of the `primary:<id>` hash.
///
/// `secondary_id` is `None` once a reassignment cleared it from the previous owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryEntry {
    pub secondary_id: Option<String>,
    pub owner_label: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub batch_tag: Option<String>,
}

impl PrimaryEntry {
    pub fn from_record(record: &IncomingRecord, run_batch_tag: &str) -> Self {
        Self {
            secondary_id: Some(record.secondary_id.clone()),
            owner_label: record.owner_label.clone(),
            last_modified: Some(record.last_modified),
            batch_tag: Some(
                record
                    .batch_tag
                    .clone()
                    .unwrap_or_else(|| run_batch_tag.to_string()),
            ),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(4);
        if let Some(secondary_id) = &self.secondary_id {
            fields.push((FIELD_SECONDARY_ID.to_string(), secondary_id.clone()));
        }
        fields.push((FIELD_OWNER_LABEL.to_string(), self.owner_label.clone()));
        if let Some(last_modified) = self.last_modified {
            fields.push((FIELD_LAST_MODIFIED.to_string(), last_modified.to_rfc3339()));
        }
        if let Some(batch_tag) = &self.batch_tag {
            fields.push((FIELD_BATCH_TAG.to_string(), batch_tag.clone()));
        }
        fields
    }

    /// Returns `None` for an absent hash (no fields at all).
    pub fn from_fields(
        primary_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, ContractError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let last_modified = fields
            .get(FIELD_LAST_MODIFIED)
            .map(|value| {
                DateTime::parse_from_rfc3339(value)
                    .map(|timestamp| timestamp.with_timezone(&Utc))
                    .map_err(|err| ContractError::CorruptEntry {
                        key: Key::primary(primary_id).to_string(),
                        reason: format!("{FIELD_LAST_MODIFIED}: {err}"),
                    })
            })
            .transpose()?;

        Ok(Some(Self {
            secondary_id: fields
                .get(FIELD_SECONDARY_ID)
                .filter(|value| !value.is_empty())
                .cloned(),
            owner_label: fields.get(FIELD_OWNER_LABEL).cloned().unwrap_or_default(),
            last_modified,
            batch_tag: fields.get(FIELD_BATCH_TAG).cloned(),
        }))
    }
}
