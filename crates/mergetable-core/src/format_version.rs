//! File format versions for mergetable
//!
//! Version constants and magic numbers for every file the engine writes,
//! so readers can reject files they do not understand.

/// Journal format version
pub const JOURNAL_FORMAT_VERSION: u16 = 1;

/// Block segment format version
pub const BLOCK_SEGMENT_FORMAT_VERSION: u16 = 1;

/// Tree segment format version
pub const TREE_SEGMENT_FORMAT_VERSION: u16 = 1;

/// Magic numbers for file validation
pub mod magic {
    /// Journal magic: "MTJL" (MergeTable JournaL)
    pub const JOURNAL: u32 = 0x4D544A4C;

    /// Block segment magic: "MTBK"
    pub const BLOCK_SEGMENT: u32 = 0x4D54424B;

    /// Tree segment magic: "MTBT"
    pub const TREE_SEGMENT: u32 = 0x4D544254;
}

/// Version compatibility information
pub struct FormatVersion {
    /// Current version of this format
    pub current: u16,
    /// Minimum supported version for reading
    pub min_read: u16,
}

impl FormatVersion {
    /// Check if a version can be read
    pub fn can_read(&self, version: u16) -> bool {
        version >= self.min_read && version <= self.current
    }
}

/// Journal format version info
pub fn journal_version() -> FormatVersion {
    FormatVersion {
        current: JOURNAL_FORMAT_VERSION,
        min_read: 1,
    }
}

/// Block segment format version info
pub fn block_segment_version() -> FormatVersion {
    FormatVersion {
        current: BLOCK_SEGMENT_FORMAT_VERSION,
        min_read: 1,
    }
}

/// Tree segment format version info
pub fn tree_segment_version() -> FormatVersion {
    FormatVersion {
        current: TREE_SEGMENT_FORMAT_VERSION,
        min_read: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v = journal_version();
        assert!(v.can_read(1));
        assert!(!v.can_read(0));
        assert!(!v.can_read(999));
    }

    #[test]
    fn test_magics_are_distinct() {
        assert_ne!(magic::JOURNAL, magic::BLOCK_SEGMENT);
        assert_ne!(magic::BLOCK_SEGMENT, magic::TREE_SEGMENT);
    }
}
