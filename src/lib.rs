//! AArch64 link-time relaxation.
//!
//! When an output image grows past the ±128 MiB reach of a direct `b`/`bl`,
//! the linker must route far branches through small trampolines (stubs) and
//! re-run layout until the stub tables stop growing. The same machinery
//! carries the Cortex-A53 erratum workarounds (843419 and 835769), which
//! also patch instructions by branching through per-section stubs.
//!
//! This crate is that engine, factored out of the linker proper: it owns
//! stub selection, section grouping, the fixed-point relaxation loop, the
//! erratum scanners and the final patch-back. ELF parsing, symbol
//! resolution and relocation application stay with the caller, which talks
//! to the engine through byte snapshots, [`BranchReloc`] records and a
//! [`SymbolResolver`].
//!
//! ```
//! use elf_relax::{BranchReloc, InputSection, RelaxConfig, Relaxer, SymbolId};
//!
//! # fn main() -> elf_relax::Result<()> {
//! let mut relaxer = Relaxer::new(RelaxConfig::default())?;
//! let obj = relaxer.add_object("hello.o")?;
//! let text = relaxer.add_output_section(0x40_0000)?;
//!
//! // bl <far_function>
//! let mut section = InputSection::new(0x9400_0000u32.to_le_bytes().to_vec(), 4);
//! section.add_branch_reloc(BranchReloc {
//!     offset: 0,
//!     r_type: elf::abi::R_AARCH64_CALL26,
//!     symbol: SymbolId::Global(0),
//!     addend: 0,
//! });
//! relaxer.add_input_section(text, obj, 1, section)?;
//!
//! // The target sits 512 MiB away; relaxation inserts an adrp stub.
//! relaxer.relax(&|_| Some(0x2040_0000u64))?;
//! let reloc = BranchReloc {
//!     offset: 0,
//!     r_type: elf::abi::R_AARCH64_CALL26,
//!     symbol: SymbolId::Global(0),
//!     addend: 0,
//! };
//! let stub = relaxer.stub_target_for_branch(obj, 1, &reloc, 0x2040_0000)?;
//! assert!(stub.is_some());
//! # Ok(())
//! # }
//! ```

#![no_std]

extern crate alloc;

mod erratum;
mod error;
mod group;
pub mod insn;
mod relax;
mod section;
mod stub;
mod table;

pub use error::Error;
pub use group::{Group, DEFAULT_GROUP_BUDGET};
pub use relax::{ErrataFix, ErratumFix, RelaxConfig, Relaxer, SymbolResolver};
pub use section::{BranchReloc, InputSection, RelaxObject, SectionId, Span, SpanKind};
pub use stub::{
    adrp_in_range, branch_offset_in_range, stub_kind_for_branch, ErratumKind, ErratumSite,
    ErratumStub, RelocStub, RelocStubKey, StubKind, SymbolId, ERRATUM_STUB_SIZE,
    MAX_BRANCH_OFFSET, MIN_BRANCH_OFFSET,
};
pub use table::StubTable;

/// Alias of [`core::result::Result`] with this crate's [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
