use crate::data_model::{Entity, Path, Version};

/// What observers and readers see for a path.
///
/// `value` is the authoritative base with every unresolved local write layered on top; `dirty` is
/// set exactly when at least one such write exists.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub path: Path,
    pub value: Entity,
    pub version: Option<Version>,
    pub dirty: bool,
}
