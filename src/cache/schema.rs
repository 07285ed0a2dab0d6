//! Cache schema version gate.

/// Version of the on-disk cache layout. Bump whenever cached payload shapes
/// change; older caches are wiped on the next start.
pub const SCHEMA_VERSION: u32 = 1;

/// Outcome of comparing the stored schema version with the compiled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDecision {
  /// Stored data predates this layout (or no marker exists): wipe everything.
  Wipe,
  /// Stored data is usable as-is.
  Proceed,
}

/// Decide what to do with an existing cache at startup.
pub fn schema_decision(stored: Option<u32>, compiled: u32) -> SchemaDecision {
  match stored {
    Some(version) if version >= compiled => SchemaDecision::Proceed,
    _ => SchemaDecision::Wipe,
  }
}
