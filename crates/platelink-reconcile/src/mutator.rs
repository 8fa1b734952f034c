use crate::reader::{read_record_state, ObservedState, ProcessingContext};
use platelink_core::keys::{FIELD_LAST_MODIFIED, FIELD_SECONDARY_ID};
use platelink_core::{Disposition, IncomingRecord, Key, PrimaryEntry};
use platelink_storage::{CommitOutcome, ConditionalTxn, Guard, KeyValueStore, WriteOp};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry with linear backoff: the wait before attempt `n` is
/// `base_delay * (n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationResult {
    Applied {
        disposition: Disposition,
        attempts: u32,
    },
    /// A re-read found the store already in the record's target state.
    Converged { attempts: u32 },
    Exhausted {
        disposition: Disposition,
        attempts: u32,
        reason: String,
    },
}

/// Builds the guarded transaction for one record, or `None` when nothing needs
/// writing.
pub fn build_transaction(
    disposition: Disposition,
    record: &IncomingRecord,
    observed: &ObservedState,
    run_batch_tag: &str,
) -> Option<ConditionalTxn> {
    let primary_key = Key::primary(&record.primary_id);
    let secondary_key = Key::secondary(&record.secondary_id);
    let observed_secondary = observed.secondary_of_primary().map(str::to_string);
    let observed_primary = observed.primary_of_secondary().map(str::to_string);

    let txn = match disposition {
        Disposition::Unchanged => return None,
        Disposition::New => {
            // Both absent for a genuinely new pair; for a half-written pair the guard
            // pins the partial state that was read.
            let primary_guard = if observed.primary_exists() {
                Guard::HashFieldEquals {
                    key: primary_key.clone(),
                    field: FIELD_SECONDARY_ID.to_string(),
                    expected: observed_secondary,
                }
            } else {
                Guard::KeyAbsent(primary_key.clone())
            };
            let secondary_guard = if observed.secondary_exists() {
                Guard::ValueEquals {
                    key: secondary_key.clone(),
                    expected: observed_primary,
                }
            } else {
                Guard::KeyAbsent(secondary_key.clone())
            };

            ConditionalTxn::new()
                .guard(primary_guard)
                .guard(secondary_guard)
                .write(WriteOp::HashSet {
                    key: primary_key,
                    fields: PrimaryEntry::from_record(record, run_batch_tag).to_fields(),
                })
                .write(WriteOp::Set {
                    key: secondary_key,
                    value: record.primary_id.clone(),
                })
                .write(WriteOp::SetAdd {
                    key: Key::batch(run_batch_tag),
                    member: record.primary_id.clone(),
                })
        }
        Disposition::SecondaryChanged => {
            let mut txn = ConditionalTxn::new().guard(Guard::HashFieldEquals {
                key: primary_key.clone(),
                field: FIELD_SECONDARY_ID.to_string(),
                expected: observed_secondary.clone(),
            });
            if let Some(old_secondary) = observed_secondary
                .as_deref()
                .filter(|old| *old != record.secondary_id)
            {
                txn = txn.write(WriteOp::DeleteIfValue {
                    key: Key::secondary(old_secondary),
                    expected: record.primary_id.clone(),
                });
            }
            let fields = vec![
                (FIELD_SECONDARY_ID.to_string(), record.secondary_id.clone()),
                (
                    FIELD_LAST_MODIFIED.to_string(),
                    record.last_modified.to_rfc3339(),
                ),
            ];
            txn.write(WriteOp::Set {
                key: secondary_key,
                value: record.primary_id.clone(),
            })
            .write(WriteOp::HashSet {
                key: primary_key,
                fields,
            })
        }
        Disposition::PrimaryReassigned => {
            let mut txn = ConditionalTxn::new().guard(Guard::ValueEquals {
                key: secondary_key.clone(),
                expected: observed_primary.clone(),
            });
            if let Some(old_primary) = observed_primary
                .as_deref()
                .filter(|old| *old != record.primary_id)
            {
                txn = txn.write(WriteOp::HashDeleteFieldIf {
                    key: Key::primary(old_primary),
                    field: FIELD_SECONDARY_ID.to_string(),
                    expected: record.secondary_id.clone(),
                });
            }
            txn.write(WriteOp::Set {
                key: secondary_key,
                value: record.primary_id.clone(),
            })
            .write(WriteOp::HashSet {
                key: primary_key,
                fields: PrimaryEntry::from_record(record, run_batch_tag).to_fields(),
            })
        }
    };
    Some(txn)
}

/// Applies one record's mutation under its CAS guard, re-reading and
/// reclassifying between attempts.
pub struct Mutator<'a, S: KeyValueStore + ?Sized> {
    store: &'a S,
    batch_tag: &'a str,
}

impl<'a, S: KeyValueStore + ?Sized> Mutator<'a, S> {
    pub fn new(store: &'a S, batch_tag: &'a str) -> Self {
        Self { store, batch_tag }
    }

    pub fn apply(&self, context: &ProcessingContext, policy: &RetryPolicy) -> MutationResult {
        let record = &context.record;
        let mut observed = context.observed.clone();
        let mut disposition = context.disposition;
        let mut last_failure = String::from("no attempt made");

        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                let delay = policy.delay_before(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                match read_record_state(self.store, record) {
                    Ok(fresh) => observed = fresh,
                    Err(err) => {
                        warn!(
                            event = "record_attempt_error",
                            primary_id = %record.primary_id,
                            attempt,
                            error = %err
                        );
                        last_failure = format!("re-read failed: {err}");
                        continue;
                    }
                }
                disposition = observed.classify(record);
            }

            let Some(txn) = build_transaction(disposition, record, &observed, self.batch_tag)
            else {
                debug!(
                    event = "record_converged",
                    primary_id = %record.primary_id,
                    secondary_id = %record.secondary_id,
                    attempt
                );
                return MutationResult::Converged { attempts: attempt };
            };

            match self.store.commit(&txn) {
                Ok(CommitOutcome::Committed) => {
                    debug!(
                        event = "record_applied",
                        primary_id = %record.primary_id,
                        secondary_id = %record.secondary_id,
                        disposition = %disposition,
                        attempt
                    );
                    return MutationResult::Applied {
                        disposition,
                        attempts: attempt,
                    };
                }
                Ok(CommitOutcome::ConditionFailed { failed_guard }) => {
                    debug!(
                        event = "record_condition_failed",
                        primary_id = %record.primary_id,
                        disposition = %disposition,
                        attempt,
                        failed_guard
                    );
                    last_failure = format!("condition failed on attempt {attempt}");
                }
                Err(err) => {
                    warn!(
                        event = "record_attempt_error",
                        primary_id = %record.primary_id,
                        disposition = %disposition,
                        attempt,
                        error = %err
                    );
                    last_failure = format!("commit failed: {err}");
                }
            }
        }

        let reason = if disposition == context.disposition {
            last_failure
        } else {
            format!("{last_failure} (last attempted as {disposition})")
        };
        warn!(
            event = "record_retry_exhausted",
            primary_id = %record.primary_id,
            secondary_id = %record.secondary_id,
            disposition = %context.disposition,
            last_disposition = %disposition,
            attempts = policy.max_attempts,
            reason = %reason
        );
        MutationResult::Exhausted {
            disposition: context.disposition,
            attempts: policy.max_attempts,
            reason,
        }
    }
}
