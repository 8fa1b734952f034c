use platelink_core::{Disposition, IncomingRecord};

/// Decision table for one record against the stored state of its two keys.
///
/// Rules are checked in a fixed order and the first match wins:
/// 1. neither key exists: `New`
/// 2. both exist and point at each other as the record says: `Unchanged`
/// 3. the primary exists with a different secondary: `SecondaryChanged`
/// 4. the secondary exists pointing at a different primary: `PrimaryReassigned`
/// 5. anything else (half-written pairs): `New`
///
/// Rule 3 wins over rule 4 when both apply, so a record whose plate already belongs
/// to another chassis is handled as a plate change on its own chassis.
pub fn classify(
    primary_exists: bool,
    secondary_exists: bool,
    stored_secondary_of_primary: Option<&str>,
    stored_primary_of_secondary: Option<&str>,
    record: &IncomingRecord,
) -> Disposition {
    let secondary_matches = stored_secondary_of_primary == Some(record.secondary_id.as_str());
    let primary_matches = stored_primary_of_secondary == Some(record.primary_id.as_str());

    if !primary_exists && !secondary_exists {
        return Disposition::New;
    }
    if primary_exists && secondary_exists && secondary_matches && primary_matches {
        return Disposition::Unchanged;
    }
    if primary_exists && !secondary_matches {
        return Disposition::SecondaryChanged;
    }
    if secondary_exists && !primary_matches {
        return Disposition::PrimaryReassigned;
    }
    Disposition::New
}
