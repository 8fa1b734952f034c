use crate::classify::classify;
use crate::ReconcileError;
use platelink_core::{Disposition, IncomingRecord, Key, PrimaryEntry};
use platelink_storage::{KeyValueStore, ReadCommand, Reply, StorageError};

/// What the store held for a record's two keys at read time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    pub primary: Option<PrimaryEntry>,
    pub secondary_pointer: Option<String>,
}

impl ObservedState {
    pub fn primary_exists(&self) -> bool {
        self.primary.is_some()
    }

    pub fn secondary_exists(&self) -> bool {
        self.secondary_pointer.is_some()
    }

    pub fn secondary_of_primary(&self) -> Option<&str> {
        self.primary
            .as_ref()
            .and_then(|entry| entry.secondary_id.as_deref())
    }

    pub fn primary_of_secondary(&self) -> Option<&str> {
        self.secondary_pointer.as_deref()
    }

    pub fn classify(&self, record: &IncomingRecord) -> Disposition {
        classify(
            self.primary_exists(),
            self.secondary_exists(),
            self.secondary_of_primary(),
            self.primary_of_secondary(),
            record,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingContext {
    pub record: IncomingRecord,
    pub disposition: Disposition,
    pub observed: ObservedState,
}

impl ProcessingContext {
    pub fn previously_observed_secondary(&self) -> Option<&str> {
        self.observed.secondary_of_primary()
    }

    pub fn previously_observed_primary(&self) -> Option<&str> {
        self.observed.primary_of_secondary()
    }
}

fn state_commands(record: &IncomingRecord) -> [ReadCommand; 2] {
    [
        ReadCommand::HashGetAll(Key::primary(&record.primary_id)),
        ReadCommand::Get(Key::secondary(&record.secondary_id)),
    ]
}

fn observed_from_replies(
    record: &IncomingRecord,
    primary_reply: Reply,
    secondary_reply: Reply,
) -> Result<ObservedState, ReconcileError> {
    let fields = primary_reply.into_hash()?;
    Ok(ObservedState {
        primary: PrimaryEntry::from_fields(&record.primary_id, &fields)?,
        secondary_pointer: secondary_reply.into_value()?,
    })
}

/// Reads both keys of every record in a single pipelined round trip and classifies
/// each record against what came back.
pub fn read_batch_state<S: KeyValueStore + ?Sized>(
    store: &S,
    records: &[IncomingRecord],
) -> Result<Vec<ProcessingContext>, ReconcileError> {
    let commands = records.iter().flat_map(state_commands).collect::<Vec<_>>();
    let replies = store.pipeline(&commands)?;
    if replies.len() != commands.len() {
        return Err(StorageError::PipelineLength {
            sent: commands.len(),
            received: replies.len(),
        }
        .into());
    }

    let mut replies = replies.into_iter();
    let mut contexts = Vec::with_capacity(records.len());
    for record in records {
        let (Some(primary_reply), Some(secondary_reply)) = (replies.next(), replies.next()) else {
            break;
        };
        let observed = observed_from_replies(record, primary_reply, secondary_reply)?;
        contexts.push(ProcessingContext {
            record: record.clone(),
            disposition: observed.classify(record),
            observed,
        });
    }
    Ok(contexts)
}

/// Fresh read of one record's keys, used between retry attempts.
pub(crate) fn read_record_state<S: KeyValueStore + ?Sized>(
    store: &S,
    record: &IncomingRecord,
) -> Result<ObservedState, ReconcileError> {
    let commands = state_commands(record);
    let replies = store.pipeline(&commands)?;
    let received = replies.len();
    let mut replies = replies.into_iter();
    match (replies.next(), replies.next(), received) {
        (Some(primary_reply), Some(secondary_reply), 2) => {
            observed_from_replies(record, primary_reply, secondary_reply)
        }
        _ => Err(StorageError::PipelineLength { sent: 2, received }.into()),
    }
}
