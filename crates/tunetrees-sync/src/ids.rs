//! UUIDv7 generation and validation.
//!
//! IDs are client-generatable and chronologically ordered so a newly created
//! row sorts after everything that came before it without a round trip to the
//! remote for an id allocation.

use uuid::Uuid;

/// Generates a new time-ordered id for a locally created row.
pub fn new_row_id() -> Uuid {
    Uuid::now_v7()
}

/// Validates that an incoming id (from remote, or from a client we don't
/// control) conforms to UUIDv7. We don't reject v4 outright — older rows
/// created before this scheme was adopted may still carry v4 ids — but we do
/// record whether an id is time-ordered so callers can decide how much to
/// trust insertion order derived from it.
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}

pub fn parse(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}
