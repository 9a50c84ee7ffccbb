

//! Byte ranges within an image file.

use std::fmt;


/// Identifies a contiguous run of bytes in a file,
/// defined by an offset and a length.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileSegment {

    /// Offset of the first byte, from the beginning of the file.
    pub offset: u64,

    /// Number of bytes in the segment.
    pub length: u64,
}

impl FileSegment {

    /// The distinguished null segment, with offset and length zero.
    pub const NULL: FileSegment = FileSegment { offset: 0, length: 0 };

    #[inline]
    pub fn new(offset: u64, length: u64) -> Self {
        FileSegment { offset, length }
    }

    /// The offset of the first byte after the segment.
    #[inline]
    pub fn end(self) -> u64 {
        self.offset + self.length
    }

    /// Whether the first byte of the other segment is
    /// the byte right after the last byte of this segment.
    #[inline]
    pub fn is_contiguous_to(self, other: FileSegment) -> bool {
        self.end() == other.offset
    }

    /// Shrinks the segment as if the first `count` bytes were removed.
    /// The count must not exceed the length.
    #[inline]
    pub fn trim_front(&mut self, count: u64) {
        debug_assert!(count <= self.length, "removing more bytes than the segment has");
        self.offset += count;
        self.length -= count;
    }
}

impl fmt::Display for FileSegment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "[{}:{}]", self.offset, self.length)
    }
}
