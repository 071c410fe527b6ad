//! Stub variants and their instruction templates.
//!
//! A *reloc stub* extends the reach of a `b`/`bl` whose destination is
//! outside the ±128 MiB direct-branch range. An *erratum stub* holds a
//! relocated copy of a Cortex-A53 erratum trigger instruction plus a branch
//! back to the insn after the trigger site.

use crate::insn::{self, Insn};

/// Maximum forward offset of a direct branch (26-bit word immediate).
pub const MAX_BRANCH_OFFSET: i64 = ((1 << 25) - 1) << 2;
/// Maximum backward offset of a direct branch.
pub const MIN_BRANCH_OFFSET: i64 = -(1 << 25) << 2;

/// Whether a direct `b`/`bl` can reach `destination` from `address`.
#[inline]
pub fn branch_offset_in_range(address: u64, destination: u64) -> bool {
    let offset = destination.wrapping_sub(address) as i64;
    (MIN_BRANCH_OFFSET..=MAX_BRANCH_OFFSET).contains(&offset)
}

/// Whether an `adrp` at `address` can materialize the page of `destination`.
#[inline]
pub fn adrp_in_range(address: u64, destination: u64) -> bool {
    let pages = (insn::page(destination).wrapping_sub(insn::page(address)) as i64) >> 12;
    (-(1 << 20)..(1 << 20)).contains(&pages)
}

// Stub bodies. ip0/ip1 (x16/x17) are the ABI's intra-procedure-call scratch
// registers, free for use between the branch and its destination.

/// `adrp x16, dest; add x16, x16, :lo12:dest; br x16`, padded to 16 bytes.
const ADRP_BRANCH: [Insn; 4] = [0x9000_0010, 0x9100_0210, 0xD61F_0200, 0x0000_0000];

/// `ldr x16, #8; br x16; .xword dest`.
const LONG_BRANCH_ABS: [Insn; 4] = [0x5800_0050, 0xD61F_0200, 0x0000_0000, 0x0000_0000];

/// `ldr x16, #16; adr x17, #0; add x16, x16, x17; br x16; .xword rel-dest`,
/// padded to 32 bytes.
const LONG_BRANCH_PCREL: [Insn; 8] = [
    0x5800_0090,
    0x1000_0011,
    0x8B11_0210,
    0xD61F_0200,
    0x0000_0000,
    0x0000_0000,
    0x0000_0000,
    0x0000_0000,
];

/// Size in bytes of an erratum stub: the copied trigger insn and a `b` back.
pub const ERRATUM_STUB_SIZE: u64 = 8;

/// The reloc-stub body variants, from cheapest to most general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StubKind {
    /// Page-relative: destination within ±4 GiB of the stub.
    AdrpBranch,
    /// Absolute 64-bit literal; only valid in non-position-independent links.
    LongBranchAbs,
    /// PC-relative 64-bit literal; valid everywhere, largest body.
    LongBranchPcrel,
}

impl StubKind {
    /// The stub's instruction template, literal slots included.
    pub(crate) fn template(self) -> &'static [Insn] {
        match self {
            StubKind::AdrpBranch => &ADRP_BRANCH,
            StubKind::LongBranchAbs => &LONG_BRANCH_ABS,
            StubKind::LongBranchPcrel => &LONG_BRANCH_PCREL,
        }
    }

    /// Size of the stub body in bytes.
    #[inline]
    pub fn size(self) -> u64 {
        (self.template().len() * insn::BYTES_PER_INSN) as u64
    }
}

/// Pick the cheapest reloc-stub variant for a branch from `address` to
/// `destination`, or `None` when the branch reaches directly.
pub fn stub_kind_for_branch(address: u64, destination: u64, pic: bool) -> Option<StubKind> {
    if branch_offset_in_range(address, destination) {
        None
    } else if adrp_in_range(address, destination) {
        Some(StubKind::AdrpBranch)
    } else if pic {
        Some(StubKind::LongBranchPcrel)
    } else {
        Some(StubKind::LongBranchAbs)
    }
}

/// Identity of the symbol a branch relocation targets.
///
/// Global symbols are shared across objects and identified by the
/// collaborator's symbol-table index; locals are scoped to their object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolId {
    /// Index into the collaborator's global symbol table.
    Global(u32),
    /// A local symbol, scoped by defining object and `r_sym` index.
    Local {
        /// Index of the defining relocatable object.
        obj: u32,
        /// Symbol index within that object's symbol table.
        r_sym: u32,
    },
}

/// Deduplication key for reloc stubs.
///
/// Two branches share one stub exactly when kind, target symbol and addend
/// all agree. The destination *address* is deliberately absent: it moves
/// between relaxation passes while the key stays stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelocStubKey {
    /// The stub body variant.
    pub kind: StubKind,
    /// The branch target symbol.
    pub symbol: SymbolId,
    /// The relocation addend.
    pub addend: i64,
}

/// A materialized reloc stub within its table's reloc region.
#[derive(Debug, Clone, Copy)]
pub struct RelocStub {
    /// The stub body variant.
    pub kind: StubKind,
    /// Byte offset within the owning table's reloc-stub region.
    pub offset: u64,
    /// Current branch destination; refreshed each relaxation pass.
    pub destination: u64,
}

impl RelocStub {
    /// Size of the stub body in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.kind.size()
    }
}

/// Which Cortex-A53 erratum a stub works around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErratumKind {
    /// ADRP at the end of a 4 KiB page followed by a dependent load/store.
    E843419,
    /// Memory access followed by a 64-bit multiply-accumulate.
    E835769,
}

/// An erratum stub: one trigger site, never shared.
///
/// Identified by `(obj, shndx, offset)` of the trigger instruction; the
/// scanner refreshes `insn`, `address` and `destination` on every pass
/// instead of inserting a duplicate.
#[derive(Debug, Clone, Copy)]
pub struct ErratumStub {
    /// Which erratum this stub fixes.
    pub kind: ErratumKind,
    /// The trigger instruction word as found in the input section.
    pub insn: Insn,
    /// Byte offset within the owning table's erratum region.
    pub offset: u64,
    /// Output address of the trigger instruction.
    pub address: u64,
    /// Where the stub branches back to: the word after the trigger.
    pub destination: u64,
    /// For 843419: section offset of the sequence's ADRP, used by the
    /// in-place ADR rewrite. Zero-valued for 835769.
    pub adrp_offset: u64,
}

/// Total order key for erratum stubs: trigger site identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErratumSite {
    /// Index of the relocatable object holding the trigger.
    pub obj: u32,
    /// Input section index within that object.
    pub shndx: u32,
    /// Byte offset of the trigger instruction within the section.
    pub offset: u64,
}
