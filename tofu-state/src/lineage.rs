//! Lineage identifiers for state snapshots

/// Generate a new lineage identifier for a fresh state history.
///
/// Panics if the operating system cannot supply randomness; that is an
/// environment failure rather than something callers can recover from.
pub fn new_lineage() -> String {
    uuid::Uuid::new_v4().to_string()
}
