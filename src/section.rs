//! Input-section and object bookkeeping.
//!
//! The engine does not parse ELF files; a collaborator (the linker proper)
//! registers relocatable objects, hands over byte snapshots of their
//! executable sections, and records the branch relocations found in them.
//! Mapping-symbol information (`$x`/`$d`) is carried as span markers so the
//! erratum scanners never decode literal-pool data as instructions.

use alloc::string::String;
use alloc::vec::Vec;

use crate::stub::SymbolId;

/// Crate-wide identity of an input section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId {
    /// Index of the owning relocatable object.
    pub obj: u32,
    /// Section index within that object.
    pub shndx: u32,
}

/// What a mapping-symbol span contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Instructions (`$x`).
    Code,
    /// Literal-pool data (`$d`).
    Data,
}

/// A span marker: from `offset` to the next marker (or section end), the
/// section holds `kind` content.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    /// Byte offset where the span starts.
    pub offset: u64,
    /// Content kind from here to the next marker.
    pub kind: SpanKind,
}

/// A `b`/`bl` relocation recorded against an input section.
#[derive(Debug, Clone, Copy)]
pub struct BranchReloc {
    /// Byte offset of the branch instruction within the section.
    pub offset: u64,
    /// Relocation type: `R_AARCH64_CALL26` or `R_AARCH64_JUMP26`.
    pub r_type: u32,
    /// The branch target symbol.
    pub symbol: SymbolId,
    /// The relocation addend.
    pub addend: i64,
}

/// An executable input section registered for relaxation.
#[derive(Debug)]
pub struct InputSection {
    /// Pre-relocation byte snapshot of the section contents.
    pub(crate) data: Vec<u8>,
    /// Required alignment within the output section.
    pub(crate) align: u64,
    /// Mapping-symbol span markers, sorted by offset.
    pub(crate) spans: Vec<Span>,
    /// Branch relocations against this section.
    pub(crate) relocs: Vec<BranchReloc>,
    /// Output address, assigned each relaxation pass.
    pub(crate) address: u64,
}

impl InputSection {
    /// Wrap a section snapshot. Until span markers are added the whole
    /// section is treated as code.
    pub fn new(data: Vec<u8>, align: u64) -> Self {
        Self {
            data,
            align: align.max(1),
            spans: Vec::new(),
            relocs: Vec::new(),
            address: 0,
        }
    }

    /// Section size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Currently assigned output address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Record a mapping-symbol marker. Markers must be added in increasing
    /// offset order.
    pub fn add_span(&mut self, offset: u64, kind: SpanKind) {
        debug_assert!(self.spans.last().is_none_or(|s| s.offset <= offset));
        self.spans.push(Span { offset, kind });
    }

    /// Record a branch relocation against this section.
    pub fn add_branch_reloc(&mut self, reloc: BranchReloc) {
        self.relocs.push(reloc);
    }

    /// Iterate the code spans as `(start, end)` byte ranges.
    ///
    /// With no markers the whole section is one code span, matching inputs
    /// assembled without mapping symbols.
    pub(crate) fn code_spans(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let size = self.size();
        let implicit = self.spans.is_empty();
        let markers = self.spans.iter().enumerate().filter_map(move |(i, s)| {
            if s.kind != SpanKind::Code {
                return None;
            }
            let end = self
                .spans
                .get(i + 1)
                .map(|next| next.offset)
                .unwrap_or(size)
                .min(size);
            (s.offset < end).then_some((s.offset, end))
        });
        core::iter::once((0, size))
            .filter(move |_| implicit && size > 0)
            .chain(markers)
    }
}

/// A relocatable object registered with the relaxer.
#[derive(Debug)]
pub struct RelaxObject {
    /// Display name for diagnostics.
    pub(crate) name: String,
    /// Registered sections, ordered by section index.
    pub(crate) sections: alloc::collections::BTreeMap<u32, InputSection>,
}

impl RelaxObject {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            sections: alloc::collections::BTreeMap::new(),
        }
    }

    /// Display name for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
