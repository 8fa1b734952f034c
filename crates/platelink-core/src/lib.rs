use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod keys;

pub use keys::{Key, PrimaryEntry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("batch must contain at least one record")]
    EmptyBatch,
    #[error("record {index} is missing required field {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("batch payload invalid: {reason}")]
    InvalidPayload { reason: String },
    #[error("stored entry {key} is corrupt: {reason}")]
    CorruptEntry { key: String, reason: String },
}

/// One row of the external feed, keyed by chassis id (primary) and plate (secondary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRecord {
    pub primary_id: String,
    pub secondary_id: String,
    pub owner_label: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub batch_tag: Option<String>,
}

impl IncomingRecord {
    pub fn new(
        primary_id: impl Into<String>,
        secondary_id: impl Into<String>,
        owner_label: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            primary_id: primary_id.into(),
            secondary_id: secondary_id.into(),
            owner_label: owner_label.into(),
            last_modified,
            batch_tag: None,
        }
    }
}

/// A batch as submitted by a caller: either a bare JSON array of records or an
/// object carrying an explicit tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBatch {
    pub batch_tag: Option<String>,
    pub records: Vec<IncomingRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchPayload {
    Records(Vec<IncomingRecord>),
    Tagged {
        #[serde(default, rename = "batchTag")]
        batch_tag: Option<String>,
        records: Vec<IncomingRecord>,
    },
}

impl IncomingBatch {
    pub fn parse_json(raw: &str) -> Result<Self, ContractError> {
        let payload = serde_json::from_str::<BatchPayload>(raw).map_err(|err| {
            ContractError::InvalidPayload {
                reason: err.to_string(),
            }
        })?;
        let batch = match payload {
            BatchPayload::Records(records) => Self {
                batch_tag: None,
                records,
            },
            BatchPayload::Tagged { batch_tag, records } => Self { batch_tag, records },
        };
        Ok(batch)
    }
}

/// Structural checks only: an empty batch or a record without one of its two
/// identifiers is rejected as a whole.
pub fn validate_batch(records: &[IncomingRecord]) -> Result<(), ContractError> {
    if records.is_empty() {
        return Err(ContractError::EmptyBatch);
    }
    for (index, record) in records.iter().enumerate() {
        if record.primary_id.trim().is_empty() {
            return Err(ContractError::MissingField {
                index,
                field: "primaryId",
            });
        }
        if record.secondary_id.trim().is_empty() {
            return Err(ContractError::MissingField {
                index,
                field: "secondaryId",
            });
        }
    }
    Ok(())
}

pub fn generate_batch_tag(now: DateTime<Utc>) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("batch-{}-{}", now.format("%Y%m%d%H%M%S%3f"), &nonce[..8])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    New,
    Unchanged,
    SecondaryChanged,
    PrimaryReassigned,
}

impl Disposition {
    pub const ALL: [Disposition; 4] = [
        Disposition::New,
        Disposition::Unchanged,
        Disposition::SecondaryChanged,
        Disposition::PrimaryReassigned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::New => "new",
            Disposition::Unchanged => "unchanged",
            Disposition::SecondaryChanged => "secondary_changed",
            Disposition::PrimaryReassigned => "primary_reassigned",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Disposition::Unchanged)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "new" => Ok(Disposition::New),
            "unchanged" => Ok(Disposition::Unchanged),
            "secondary_changed" | "secondary-changed" => Ok(Disposition::SecondaryChanged),
            "primary_reassigned" | "primary-reassigned" => Ok(Disposition::PrimaryReassigned),
            other => Err(format!("Unknown disposition: {other}")),
        }
    }
}

/// A record whose conditional mutation never committed within its retry bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub primary_id: String,
    pub secondary_id: String,
    pub disposition: Disposition,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_tag: String,
    pub total_records: usize,
    pub new: usize,
    pub unchanged: usize,
    pub secondary_changed: usize,
    pub primary_reassigned: usize,
    pub applied: usize,
    pub converged: usize,
    pub retry_exhausted: usize,
    pub failed_records: Vec<RecordFailure>,
    /// Batch-level failures only; a record that exhausts its retries lands in
    /// `failed_records` instead.
    pub errors: usize,
    pub error_messages: Vec<String>,
    pub processing_time_ms: u64,
}

impl BatchOutcome {
    pub fn new(batch_tag: impl Into<String>, total_records: usize) -> Self {
        Self {
            batch_tag: batch_tag.into(),
            total_records,
            new: 0,
            unchanged: 0,
            secondary_changed: 0,
            primary_reassigned: 0,
            applied: 0,
            converged: 0,
            retry_exhausted: 0,
            failed_records: Vec::new(),
            errors: 0,
            error_messages: Vec::new(),
            processing_time_ms: 0,
        }
    }

    pub fn record_disposition(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::New => self.new += 1,
            Disposition::Unchanged => self.unchanged += 1,
            Disposition::SecondaryChanged => self.secondary_changed += 1,
            Disposition::PrimaryReassigned => self.primary_reassigned += 1,
        }
    }

    pub fn count_for(&self, disposition: Disposition) -> usize {
        match disposition {
            Disposition::New => self.new,
            Disposition::Unchanged => self.unchanged,
            Disposition::SecondaryChanged => self.secondary_changed,
            Disposition::PrimaryReassigned => self.primary_reassigned,
        }
    }

    pub fn record_exhausted(&mut self, failure: RecordFailure) {
        self.retry_exhausted += 1;
        self.failed_records.push(failure);
    }

    pub fn record_fatal(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.error_messages.push(message.into());
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.retry_exhausted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn validate_rejects_empty_batch() {
        assert_eq!(validate_batch(&[]), Err(ContractError::EmptyBatch));
    }

    #[test]
    fn validate_reports_first_record_missing_an_identifier() {
        let records = vec![
            IncomingRecord::new("T1", "AA111BB", "Rossi", ts()),
            IncomingRecord::new("T2", "  ", "Bianchi", ts()),
            IncomingRecord::new("", "CC222DD", "Verdi", ts()),
        ];

        assert_eq!(
            validate_batch(&records),
            Err(ContractError::MissingField {
                index: 1,
                field: "secondaryId",
            })
        );
    }

    #[test]
    fn validate_accepts_blank_owner_label() {
        let records = vec![IncomingRecord::new("T1", "AA111BB", "", ts())];
        assert!(validate_batch(&records).is_ok());
    }

    #[test]
    fn parse_json_accepts_bare_array_and_tagged_envelope() {
        let bare = r#"[
            {"primaryId": "T1", "secondaryId": "AA111BB", "ownerLabel": "Rossi",
             "lastModified": "2026-03-02T09:30:00Z"}
        ]"#;
        let batch = IncomingBatch::parse_json(bare).expect("bare array");
        assert_eq!(batch.batch_tag, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].last_modified, ts());
        assert_eq!(batch.records[0].batch_tag, None);

        let tagged = r#"{
            "batchTag": "feed-7",
            "records": [
                {"primaryId": "T2", "secondaryId": "CC222DD", "ownerLabel": "Bianchi",
                 "lastModified": "2026-03-02T09:30:00Z", "batchTag": "upstream-1"}
            ]
        }"#;
        let batch = IncomingBatch::parse_json(tagged).expect("tagged envelope");
        assert_eq!(batch.batch_tag.as_deref(), Some("feed-7"));
        assert_eq!(batch.records[0].batch_tag.as_deref(), Some("upstream-1"));
    }

    #[test]
    fn parse_json_rejects_records_without_timestamp() {
        let raw = r#"[{"primaryId": "T1", "secondaryId": "AA111BB", "ownerLabel": "Rossi"}]"#;
        let err = IncomingBatch::parse_json(raw).expect_err("missing lastModified");
        assert!(matches!(err, ContractError::InvalidPayload { .. }));
    }

    #[test]
    fn generated_batch_tags_carry_time_and_differ_per_call() {
        let first = generate_batch_tag(ts());
        let second = generate_batch_tag(ts());

        assert!(first.starts_with("batch-20260302093000000-"));
        assert_eq!(first.len(), "batch-20260302093000000-".len() + 8);
        assert_ne!(first, second);
    }

    #[test]
    fn disposition_parses_both_separators() {
        assert_eq!(
            "secondary-changed".parse::<Disposition>(),
            Ok(Disposition::SecondaryChanged)
        );
        assert_eq!(
            " PRIMARY_REASSIGNED ".parse::<Disposition>(),
            Ok(Disposition::PrimaryReassigned)
        );
        assert!("moved".parse::<Disposition>().is_err());
        for disposition in Disposition::ALL {
            assert_eq!(disposition.as_str().parse::<Disposition>(), Ok(disposition));
        }
    }

    #[test]
    fn outcome_is_clean_only_without_fatal_errors_or_exhausted_records() {
        let mut outcome = BatchOutcome::new("b-1", 2);
        outcome.record_disposition(Disposition::New);
        outcome.record_disposition(Disposition::PrimaryReassigned);
        assert!(outcome.is_clean());
        assert_eq!(outcome.count_for(Disposition::New), 1);
        assert_eq!(outcome.count_for(Disposition::PrimaryReassigned), 1);

        outcome.record_exhausted(RecordFailure {
            primary_id: "T2".to_string(),
            secondary_id: "AA111BB".to_string(),
            disposition: Disposition::PrimaryReassigned,
            attempts: 5,
            reason: "condition failed".to_string(),
        });
        assert!(!outcome.is_clean());
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.retry_exhausted, 1);
    }
}
