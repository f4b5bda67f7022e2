//! Relocation records attached to compiled code.
//!
//! A compiler emits machine code at a scratch buffer address together
//! with a relocation section describing every address-bearing site in
//! the code. When the code is copied to its final location the section
//! is re-walked and each site is rewritten.
//!
//! The section is a packed sequence of 5-byte records: a mode byte
//! followed by the little-endian `u32` offset of the site from the start
//! of the instructions. Every site holds a little-endian `u64`: the
//! runtime-stub id tag for [`RelocMode::RuntimeStubCall`], an absolute
//! address for the other rewritable modes.

use std::ptr::{read_unaligned, write_unaligned};

/// Kinds of relocation records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocMode {
    /// Direct call to another function of the same module.
    InterWasmCall = 0,
    /// Call to a runtime stub, tagged with a [`crate::RuntimeStubId`].
    RuntimeStubCall = 1,
    /// Absolute reference to a location in the same code object.
    InternalReference = 2,
    /// Same as `InternalReference` with an architecture-specific
    /// encoding of the stored value.
    InternalReferenceEncoded = 3,
    /// Reference to an address outside any code region; never moves.
    ExternalReference = 4,
    /// Reference to statically placed code outside the managed regions.
    OffHeapTarget = 5,
    /// Address of a code object's first instruction, read back by
    /// tier-up checks.
    CodeTableEntry = 6,
    Comment = 7,
    ConstPool = 8,
    VeneerPool = 9,
}

impl RelocMode {
    fn from_u8(byte: u8) -> Option<RelocMode> {
        Some(match byte {
            0 => RelocMode::InterWasmCall,
            1 => RelocMode::RuntimeStubCall,
            2 => RelocMode::InternalReference,
            3 => RelocMode::InternalReferenceEncoded,
            4 => RelocMode::ExternalReference,
            5 => RelocMode::OffHeapTarget,
            6 => RelocMode::CodeTableEntry,
            7 => RelocMode::Comment,
            8 => RelocMode::ConstPool,
            9 => RelocMode::VeneerPool,
            _ => return None,
        })
    }

    /// Whether sites with this mode are rewritten when code moves.
    pub fn needs_rewrite(self) -> bool {
        matches!(
            self,
            RelocMode::InterWasmCall
                | RelocMode::RuntimeStubCall
                | RelocMode::InternalReference
                | RelocMode::InternalReferenceEncoded
                | RelocMode::CodeTableEntry
        )
    }
}

/// One parsed relocation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocEntry {
    pub mode: RelocMode,
    /// Offset of the relocation site from the start of the instructions.
    pub offset: u32,
}

const RELOC_RECORD_SIZE: usize = 5;

/// Iterator over the records of a relocation section. A malformed
/// section is a compiler bug and panics.
pub struct RelocIterator<'a> {
    bytes: &'a [u8],
}

impl<'a> RelocIterator<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        assert_eq!(
            bytes.len() % RELOC_RECORD_SIZE,
            0,
            "truncated relocation section"
        );
        Self { bytes }
    }
}

impl<'a> Iterator for RelocIterator<'a> {
    type Item = RelocEntry;

    fn next(&mut self) -> Option<RelocEntry> {
        if self.bytes.is_empty() {
            return None;
        }
        let (record, rest) = self.bytes.split_at(RELOC_RECORD_SIZE);
        self.bytes = rest;
        let mode = RelocMode::from_u8(record[0])
            .unwrap_or_else(|| panic!("invalid relocation mode byte {:#x}", record[0]));
        let offset = u32::from_le_bytes([record[1], record[2], record[3], record[4]]);
        Some(RelocEntry { mode, offset })
    }
}

/// Encode records into the section format. This is the writer side used
/// by compilers producing a [`crate::CodeDescriptor`].
pub fn encode(entries: &[RelocEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * RELOC_RECORD_SIZE);
    for entry in entries {
        bytes.push(entry.mode as u8);
        bytes.extend_from_slice(&entry.offset.to_le_bytes());
    }
    bytes
}

/// Read the `u64` stored at a relocation site.
///
/// # Safety
///
/// `addr` must point at 8 readable bytes.
pub(crate) unsafe fn read_site_value(addr: usize) -> u64 {
    read_unaligned(addr as *const u64)
}

/// Overwrite the `u64` stored at a relocation site.
///
/// # Safety
///
/// `addr` must point at 8 writable bytes.
pub(crate) unsafe fn write_site_value(addr: usize, value: u64) {
    write_unaligned(addr as *mut u64, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_iterate_round_trip() {
        let entries = [
            RelocEntry {
                mode: RelocMode::InterWasmCall,
                offset: 0x10,
            },
            RelocEntry {
                mode: RelocMode::RuntimeStubCall,
                offset: 0x200,
            },
            RelocEntry {
                mode: RelocMode::VeneerPool,
                offset: 0,
            },
        ];
        let bytes = encode(&entries);
        assert_eq!(bytes.len(), 15);
        let parsed: Vec<_> = RelocIterator::new(&bytes).collect();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn rewrite_mask() {
        assert!(RelocMode::InterWasmCall.needs_rewrite());
        assert!(RelocMode::RuntimeStubCall.needs_rewrite());
        assert!(RelocMode::CodeTableEntry.needs_rewrite());
        assert!(!RelocMode::ExternalReference.needs_rewrite());
        assert!(!RelocMode::Comment.needs_rewrite());
    }

    #[test]
    #[should_panic(expected = "truncated relocation section")]
    fn truncated_section_panics() {
        RelocIterator::new(&[0, 1, 2]);
    }

    #[test]
    fn site_value_round_trip() {
        let mut site = [0u8; 9];
        unsafe {
            // Deliberately unaligned.
            write_site_value(site.as_mut_ptr() as usize + 1, 0x1122_3344_5566_7788);
            assert_eq!(
                read_site_value(site.as_ptr() as usize + 1),
                0x1122_3344_5566_7788
            );
        }
    }
}
