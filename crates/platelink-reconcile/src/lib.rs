mod classify;
mod directory;
mod mutator;
mod reader;

pub use classify::classify;
pub use directory::{Directory, SecondaryLookup};
pub use mutator::{build_transaction, MutationResult, Mutator, RetryPolicy};
pub use reader::{read_batch_state, ObservedState, ProcessingContext};

use chrono::Utc;
use platelink_core::{
    generate_batch_tag, validate_batch, BatchOutcome, ContractError, Disposition,
    IncomingRecord, RecordFailure,
};
use platelink_storage::{KeyValueStore, StorageError};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
}

/// Retry bounds per mutating disposition. Reassignment touches two primaries and
/// gets the most attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub new: RetryPolicy,
    pub secondary_changed: RetryPolicy,
    pub primary_reassigned: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::with_base_delay(DEFAULT_BASE_DELAY)
    }
}

impl ReconcileConfig {
    pub fn with_base_delay(base_delay: Duration) -> Self {
        Self {
            new: RetryPolicy::new(3, base_delay),
            secondary_changed: RetryPolicy::new(3, base_delay),
            primary_reassigned: RetryPolicy::new(5, base_delay),
        }
    }

    pub fn policy_for(&self, disposition: Disposition) -> Option<&RetryPolicy> {
        match disposition {
            Disposition::New => Some(&self.new),
            Disposition::Unchanged => None,
            Disposition::SecondaryChanged => Some(&self.secondary_changed),
            Disposition::PrimaryReassigned => Some(&self.primary_reassigned),
        }
    }
}

/// Batch coordinator: one pipelined read, pure classification, then guarded
/// mutations group by group.
pub struct Reconciler<'s, S: KeyValueStore + ?Sized> {
    store: &'s S,
    config: ReconcileConfig,
}

impl<'s, S: KeyValueStore + ?Sized> Reconciler<'s, S> {
    pub fn new(store: &'s S, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn directory(&self) -> Directory<'s, S> {
        Directory::new(self.store)
    }

    /// Rejects structurally invalid batches before touching the store. Once
    /// processing starts, failures are reported inside the returned outcome.
    pub fn process_batch(
        &self,
        records: &[IncomingRecord],
        batch_tag: Option<&str>,
    ) -> Result<BatchOutcome, ReconcileError> {
        validate_batch(records)?;

        let started = Instant::now();
        let batch_tag = batch_tag
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| generate_batch_tag(Utc::now()));
        let mut outcome = BatchOutcome::new(batch_tag.clone(), records.len());
        info!(event = "batch_start", batch_tag = %batch_tag, records = records.len());

        if let Err(err) = self.run(records, &batch_tag, &mut outcome) {
            error!(event = "batch_fatal", batch_tag = %batch_tag, error = %err);
            outcome.record_fatal(err.to_string());
        }

        outcome.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            event = "batch_complete",
            batch_tag = %batch_tag,
            new = outcome.new,
            unchanged = outcome.unchanged,
            secondary_changed = outcome.secondary_changed,
            primary_reassigned = outcome.primary_reassigned,
            applied = outcome.applied,
            converged = outcome.converged,
            retry_exhausted = outcome.retry_exhausted,
            errors = outcome.errors,
            elapsed_ms = outcome.processing_time_ms
        );
        Ok(outcome)
    }

    fn run(
        &self,
        records: &[IncomingRecord],
        batch_tag: &str,
        outcome: &mut BatchOutcome,
    ) -> Result<(), ReconcileError> {
        let contexts = read_batch_state(self.store, records)?;
        info!(event = "batch_read", batch_tag = %batch_tag, contexts = contexts.len());

        let mut groups: BTreeMap<Disposition, Vec<&ProcessingContext>> = BTreeMap::new();
        for context in &contexts {
            outcome.record_disposition(context.disposition);
            groups.entry(context.disposition).or_default().push(context);
        }
        info!(
            event = "batch_classified",
            batch_tag = %batch_tag,
            new = outcome.new,
            unchanged = outcome.unchanged,
            secondary_changed = outcome.secondary_changed,
            primary_reassigned = outcome.primary_reassigned
        );

        let mutator = Mutator::new(self.store, batch_tag);
        for (disposition, group) in groups {
            let Some(policy) = self.config.policy_for(disposition) else {
                continue;
            };
            for context in group {
                match mutator.apply(context, policy) {
                    MutationResult::Applied { .. } => outcome.applied += 1,
                    MutationResult::Converged { .. } => outcome.converged += 1,
                    MutationResult::Exhausted {
                        disposition,
                        attempts,
                        reason,
                    } => outcome.record_exhausted(RecordFailure {
                        primary_id: context.record.primary_id.clone(),
                        secondary_id: context.record.secondary_id.clone(),
                        disposition,
                        attempts,
                        reason,
                    }),
                }
            }
        }
        Ok(())
    }
}
