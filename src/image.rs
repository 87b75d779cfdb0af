//! In-memory binary image with virtual address mapping.

use std::sync::Arc;

use crate::{Address, Architecture};

/// A mapped region of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment or section name
    pub name: String,
    /// Virtual address the region is mapped at
    pub virtual_address: Address,
    /// Offset of the region in the file data
    pub file_offset: usize,
    /// Size of the file-backed part of the region in bytes
    pub size: usize,
    /// Whether this region contains executable code
    pub executable: bool,
}

impl Segment {
    /// Create a new segment
    pub fn new(
        name: impl Into<String>,
        virtual_address: Address,
        file_offset: usize,
        size: usize,
        executable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            virtual_address,
            file_offset,
            size,
            executable,
        }
    }

    /// Get the end virtual address of this segment
    pub fn end_address(&self) -> Address {
        self.virtual_address + self.size as Address
    }

    /// Whether `va` falls inside this segment
    pub fn contains(&self, va: Address) -> bool {
        va >= self.virtual_address && va < self.end_address()
    }
}

/// The already-resident native binary the analysis reads method bodies from.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    /// Detected architecture
    pub architecture: Architecture,
    /// Mapped regions
    pub segments: Vec<Segment>,
    /// Exported symbols with their virtual addresses
    exports: Vec<(String, Address)>,
    data: Arc<[u8]>,
}

impl BinaryImage {
    /// Build an image from file data and its segment map.
    pub fn new(architecture: Architecture, data: impl Into<Arc<[u8]>>, segments: Vec<Segment>) -> Self {
        Self {
            architecture,
            segments,
            exports: Vec::new(),
            data: data.into(),
        }
    }

    pub fn with_exports(mut self, exports: Vec<(String, Address)>) -> Self {
        self.exports = exports;
        self
    }

    /// Exported symbols, as key function discovery consumes them.
    pub fn exports(&self) -> &[(String, Address)] {
        &self.exports
    }

    /// An image that maps `code` verbatim at `base`.
    pub fn raw(architecture: Architecture, base: Address, code: &[u8]) -> Self {
        let segment = Segment::new("raw", base, 0, code.len(), true);
        Self::new(architecture, code.to_vec(), vec![segment])
    }

    /// Whole file contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Find the segment that maps `va`.
    pub fn segment_for(&self, va: Address) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(va))
    }

    /// Whether `va` is mapped at all.
    pub fn is_mapped(&self, va: Address) -> bool {
        self.segment_for(va).is_some()
    }

    /// Bytes from `va` to the end of its segment, capped at `max_len`.
    ///
    /// Returns `None` when the address is not mapped.
    pub fn bytes_at(&self, va: Address, max_len: usize) -> Option<&[u8]> {
        let segment = self.segment_for(va)?;
        let start = segment.file_offset + (va - segment.virtual_address) as usize;
        let segment_end = segment.file_offset + segment.size;
        let end = segment_end.min(start.saturating_add(max_len)).min(self.data.len());
        if start >= end {
            return None;
        }
        Some(&self.data[start..end])
    }

    /// Read a little-endian pointer-sized value at `va`.
    pub fn read_u64(&self, va: Address) -> Option<u64> {
        let bytes = self.bytes_at(va, 8)?;
        let array: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(array))
    }

    /// Get all executable segments
    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_image_mapping() {
        let image = BinaryImage::raw(Architecture::X86_64, 0x1000, &[0x90, 0x90, 0xc3]);

        assert!(image.is_mapped(0x1000));
        assert!(image.is_mapped(0x1002));
        assert!(!image.is_mapped(0x1003));
        assert_eq!(image.bytes_at(0x1001, 16), Some(&[0x90, 0xc3][..]));
        assert_eq!(image.bytes_at(0x1000, 1), Some(&[0x90][..]));
        assert!(image.bytes_at(0x2000, 16).is_none());
    }

    #[test]
    fn test_file_offset_translation() {
        let data = vec![0u8, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd];
        let image = BinaryImage::new(
            Architecture::AArch64,
            data,
            vec![Segment::new(".text", 0x40_0000, 4, 4, true)],
        );

        assert_eq!(image.bytes_at(0x40_0002, 8), Some(&[0xcc, 0xdd][..]));
        assert_eq!(image.executable_segments().count(), 1);
    }

    #[test]
    fn test_read_u64() {
        let mut data = vec![0u8; 16];
        data[8..16].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        let image = BinaryImage::raw(Architecture::X86_64, 0x100, &data);

        assert_eq!(image.read_u64(0x108), Some(0x1122_3344_5566_7788));
        assert_eq!(image.read_u64(0x10c), None);
    }
}
