//! The relaxation driver.
//!
//! Runs the whole pipeline: group sections under a byte budget, assign
//! addresses, scan branches and erratum sequences, and repeat until no stub
//! table changes size. After convergence the driver answers stub-address
//! queries, patches erratum sites in relocated section views and renders the
//! stub tables.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use elf::abi;

use crate::erratum;
use crate::error::{config_error, malformed_error, overflow_error, relax_error};
use crate::group::{self, Group, DEFAULT_GROUP_BUDGET};
use crate::insn;
use crate::section::{BranchReloc, InputSection, RelaxObject, SectionId};
use crate::stub::{self, ErratumKind, ErratumSite, RelocStubKey, StubKind, SymbolId};
use crate::table::{align_up, Map, StubTable};
use crate::Result;

bitflags! {
    /// Selection of Cortex-A53 errata to scan for and patch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrataFix: u8 {
        /// ADRP at a page boundary followed by a dependent load/store.
        const E843419 = 1 << 0;
        /// Memory access followed by a 64-bit multiply-accumulate.
        const E835769 = 1 << 1;
    }
}

/// Relaxation parameters. Fixed once the first pass runs.
#[derive(Debug, Clone)]
pub struct RelaxConfig {
    /// Target machine; must be `EM_AARCH64`.
    pub machine: u16,
    /// Whether the link is position-independent. Selects the literal-stub
    /// flavor for branches beyond ADRP reach.
    pub position_independent: bool,
    /// Stub-group byte budget override. `None` uses the direct-branch span
    /// less stub-table headroom.
    pub stub_group_size: Option<u64>,
    /// When set, a group closes at its stub-table owner, so every member
    /// branches forward to its table. When unset the group extends past the
    /// owner for up to another budget's worth of bytes.
    pub stubs_after_branch: bool,
    /// Which errata to work around.
    pub errata: ErrataFix,
    /// Cap on relaxation passes before giving up.
    pub max_passes: u32,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            machine: abi::EM_AARCH64,
            position_independent: false,
            stub_group_size: None,
            stubs_after_branch: true,
            errata: ErrataFix::empty(),
            max_passes: 64,
        }
    }
}

/// Symbol-address oracle supplied by the linker proper.
///
/// Must return the *final branch destination* for the symbol: for a symbol
/// that branches through a PLT that is the PLT entry's address, not the
/// symbol's own. Returning `None` marks the symbol undefined; undefined
/// targets get no stub.
///
/// Re-queried on every pass, so the answers may track layout changes.
pub trait SymbolResolver {
    /// The current destination address for `symbol`.
    fn address_of(&self, symbol: SymbolId) -> Option<u64>;
}

impl<F> SymbolResolver for F
where
    F: Fn(SymbolId) -> Option<u64>,
{
    fn address_of(&self, symbol: SymbolId) -> Option<u64> {
        self(symbol)
    }
}

/// Record of one patched erratum site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErratumFix {
    /// Object holding the trigger.
    pub obj: u32,
    /// Section index within the object.
    pub shndx: u32,
    /// Section offset of the trigger instruction.
    pub offset: u64,
    /// Which erratum was fixed.
    pub kind: ErratumKind,
    /// Whether the fix happened in place (ADRP rewritten to ADR, or the
    /// sequence was gone after TLS relaxation) instead of branching through
    /// the stub.
    pub optimized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Inputs may still be registered.
    Building,
    /// Relaxation has converged; layout and stubs are final.
    Converged,
}

#[derive(Debug)]
struct OutputSection {
    address: u64,
    members: Vec<SectionId>,
    end: u64,
}

/// The relaxation engine.
pub struct Relaxer {
    config: RelaxConfig,
    objects: Vec<RelaxObject>,
    output_sections: Vec<OutputSection>,
    tables: Vec<StubTable>,
    groups: Vec<Group>,
    table_of_section: Map<SectionId, usize>,
    table_of_owner: Map<SectionId, usize>,
    state: State,
    passes: u32,
}

impl Relaxer {
    /// Validate `config` and create an empty engine.
    pub fn new(config: RelaxConfig) -> Result<Self> {
        if config.machine != abi::EM_AARCH64 {
            return Err(config_error("relaxation is only defined for EM_AARCH64"));
        }
        if let Some(budget) = config.stub_group_size {
            if budget < StubKind::LongBranchPcrel.size() {
                return Err(config_error("stub group budget cannot hold a single stub"));
            }
        }
        if config.max_passes == 0 {
            return Err(config_error("pass limit must be nonzero"));
        }
        Ok(Self {
            config,
            objects: Vec::new(),
            output_sections: Vec::new(),
            tables: Vec::new(),
            groups: Vec::new(),
            table_of_section: Map::default(),
            table_of_owner: Map::default(),
            state: State::Building,
            passes: 0,
        })
    }

    fn check_building(&self) -> Result<()> {
        if self.state != State::Building {
            return Err(relax_error("inputs cannot change after relaxation"));
        }
        Ok(())
    }

    fn check_converged(&self) -> Result<()> {
        if self.state != State::Converged {
            return Err(relax_error("relaxation has not converged yet"));
        }
        Ok(())
    }

    /// Register a relocatable object. Returns its index.
    pub fn add_object(&mut self, name: impl Into<String>) -> Result<u32> {
        self.check_building()?;
        self.objects.push(RelaxObject::new(name.into()));
        Ok((self.objects.len() - 1) as u32)
    }

    /// Register an output section with its base address. Returns its index.
    /// Input sections are appended to it in layout order.
    pub fn add_output_section(&mut self, address: u64) -> Result<u32> {
        self.check_building()?;
        self.output_sections.push(OutputSection {
            address,
            members: Vec::new(),
            end: address,
        });
        Ok((self.output_sections.len() - 1) as u32)
    }

    /// Append an input section to output section `osec`.
    pub fn add_input_section(
        &mut self,
        osec: u32,
        obj: u32,
        shndx: u32,
        section: InputSection,
    ) -> Result<()> {
        self.check_building()?;
        let object = self
            .objects
            .get_mut(obj as usize)
            .ok_or_else(|| relax_error("unknown object index"))?;
        let out = self
            .output_sections
            .get_mut(osec as usize)
            .ok_or_else(|| relax_error("unknown output section index"))?;
        if object.sections.contains_key(&shndx) {
            return Err(relax_error("input section registered twice"));
        }
        object.sections.insert(shndx, section);
        out.members.push(SectionId { obj, shndx });
        Ok(())
    }

    /// Run relaxation to a fixed point. Returns the number of passes.
    pub fn relax<R: SymbolResolver>(&mut self, resolver: &R) -> Result<u32> {
        self.check_building()?;
        self.build_groups();
        loop {
            if self.passes == self.config.max_passes {
                return Err(relax_error("stub sizes failed to converge within the pass limit"));
            }
            self.passes += 1;
            self.assign_addresses();
            self.scan(resolver)?;
            // Poll every table so the per-table bookkeeping advances in
            // lockstep; breaking at the first change would leave later
            // tables comparing against a stale pass.
            let mut changed = false;
            for table in &mut self.tables {
                changed |= table.size_changed_since_last_pass();
            }
            log::debug!(
                "relaxation pass {}: {}",
                self.passes,
                if changed { "stub tables changed size" } else { "converged" }
            );
            if !changed {
                break;
            }
        }
        self.state = State::Converged;
        Ok(self.passes)
    }

    /// Number of passes run so far.
    #[inline]
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// The stub-table groups, in layout order. Empty before the first pass.
    #[inline]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    fn build_groups(&mut self) {
        let budget = self.config.stub_group_size.unwrap_or(DEFAULT_GROUP_BUDGET);
        let Self {
            config,
            objects,
            output_sections,
            tables,
            groups,
            table_of_section,
            table_of_owner,
            ..
        } = self;
        for out in output_sections.iter() {
            let members: Vec<(SectionId, u64)> = out
                .members
                .iter()
                .map(|id| {
                    let size = objects[id.obj as usize].sections[&id.shndx].size();
                    (*id, size)
                })
                .collect();
            for g in group::group_sections(&members, budget, config.stubs_after_branch) {
                let idx = tables.len();
                tables.push(StubTable::new());
                for id in &g.sections {
                    table_of_section.insert(*id, idx);
                }
                table_of_owner.insert(g.owner, idx);
                groups.push(g);
            }
        }
        log::debug!("grouped input sections into {} stub-table groups", groups.len());
    }

    /// Lay out every output section: members in order at their alignment,
    /// stub tables appended to their owners at 8-byte alignment.
    fn assign_addresses(&mut self) {
        let Self {
            objects,
            output_sections,
            tables,
            table_of_owner,
            ..
        } = self;
        for out in output_sections.iter_mut() {
            let mut cursor = out.address;
            for id in &out.members {
                if let Some(sec) = objects[id.obj as usize].sections.get_mut(&id.shndx) {
                    cursor = align_up(cursor, sec.align);
                    sec.address = cursor;
                    cursor += sec.size();
                }
                if let Some(&t) = table_of_owner.get(id) {
                    let table = &mut tables[t];
                    table.set_address(align_up(cursor, 8));
                    cursor = table.address() + table.size();
                }
            }
            out.end = cursor;
        }
    }

    /// One scan pass: grow stub tables from branch relocations and erratum
    /// sequences at the current addresses.
    fn scan<R: SymbolResolver>(&mut self, resolver: &R) -> Result<()> {
        let Self {
            config,
            objects,
            tables,
            table_of_section,
            ..
        } = self;
        for (obj_idx, object) in objects.iter().enumerate() {
            for (&shndx, sec) in &object.sections {
                let id = SectionId { obj: obj_idx as u32, shndx };
                let Some(&tidx) = table_of_section.get(&id) else {
                    continue;
                };
                let table = &mut tables[tidx];
                for reloc in &sec.relocs {
                    if reloc.r_type != abi::R_AARCH64_CALL26
                        && reloc.r_type != abi::R_AARCH64_JUMP26
                    {
                        return Err(malformed_error(
                            "branch relocation record with a non-branch type",
                        ));
                    }
                    let Some(address) = resolver.address_of(reloc.symbol) else {
                        continue;
                    };
                    let destination = address.wrapping_add(reloc.addend as u64);
                    let branch = sec.address + reloc.offset;
                    let Some(kind) = stub::stub_kind_for_branch(
                        branch,
                        destination,
                        config.position_independent,
                    ) else {
                        continue;
                    };
                    let key = RelocStubKey {
                        kind,
                        symbol: reloc.symbol,
                        addend: reloc.addend,
                    };
                    if table.upsert_reloc_stub(key, destination) {
                        log::debug!(
                            "{}: {:?} stub for branch at {:#x} to {:#x}",
                            object.name,
                            kind,
                            branch,
                            destination
                        );
                    }
                }
                if config.errata.contains(ErrataFix::E843419) {
                    for (start, end) in sec.code_spans() {
                        for hit in erratum::scan_843419_span(&sec.data, start, end, sec.address) {
                            table.upsert_erratum_stub(
                                ErratumSite { obj: id.obj, shndx, offset: hit.offset },
                                ErratumKind::E843419,
                                hit.insn,
                                sec.address + hit.offset,
                                hit.adrp_offset,
                            );
                        }
                    }
                }
                if config.errata.contains(ErrataFix::E835769) {
                    for (start, end) in sec.code_spans() {
                        for hit in erratum::scan_835769_span(&sec.data, start, end) {
                            table.upsert_erratum_stub(
                                ErratumSite { obj: id.obj, shndx, offset: hit.offset },
                                ErratumKind::E835769,
                                hit.insn,
                                sec.address + hit.offset,
                                0,
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Final output address of an input section.
    pub fn section_address(&self, obj: u32, shndx: u32) -> Option<u64> {
        self.objects
            .get(obj as usize)
            .and_then(|o| o.sections.get(&shndx))
            .map(|s| s.address)
    }

    /// End address of an output section, stub tables included.
    pub fn output_section_end(&self, osec: u32) -> Option<u64> {
        self.output_sections.get(osec as usize).map(|o| o.end)
    }

    /// The stub table serving a section's group, if the section is grouped.
    pub fn stub_table_for(&self, obj: u32, shndx: u32) -> Option<&StubTable> {
        let idx = self.table_of_section.get(&SectionId { obj, shndx })?;
        Some(&self.tables[*idx])
    }

    /// The stub table appended to a section, if the section is a group's
    /// owner.
    pub fn owned_stub_table(&self, obj: u32, shndx: u32) -> Option<&StubTable> {
        let idx = self.table_of_owner.get(&SectionId { obj, shndx })?;
        Some(&self.tables[*idx])
    }

    /// Whether a branch must be re-pointed at a stub, and at which address.
    ///
    /// `destination` is the branch's resolved target (addend applied).
    /// Returns `Ok(None)` when the branch reaches directly. An out-of-range
    /// branch with no stub on file means the scan and the caller disagree
    /// about the layout, which is reported as a malformed state.
    pub fn stub_target_for_branch(
        &self,
        obj: u32,
        shndx: u32,
        reloc: &BranchReloc,
        destination: u64,
    ) -> Result<Option<u64>> {
        self.check_converged()?;
        let sec = self
            .objects
            .get(obj as usize)
            .and_then(|o| o.sections.get(&shndx))
            .ok_or_else(|| relax_error("unknown input section"))?;
        let branch = sec.address + reloc.offset;
        let Some(kind) =
            stub::stub_kind_for_branch(branch, destination, self.config.position_independent)
        else {
            return Ok(None);
        };
        let table = self
            .stub_table_for(obj, shndx)
            .ok_or_else(|| malformed_error("out-of-range branch in an ungrouped section"))?;
        let key = RelocStubKey {
            kind,
            symbol: reloc.symbol,
            addend: reloc.addend,
        };
        let stub = table
            .reloc_stub(&key)
            .ok_or_else(|| malformed_error("no stub on file for an out-of-range branch"))?;
        Ok(Some(table.reloc_stub_address(stub)))
    }

    /// Patch every erratum trigger of one section inside `view`, the
    /// section's relocated bytes. Returns the fixes applied.
    ///
    /// Call after the collaborator has applied relocations to `view` and
    /// before the section is written out; the stub table must be rendered
    /// afterwards, since patching captures the relocated trigger words.
    pub fn fix_errata(&mut self, obj: u32, shndx: u32, view: &mut [u8]) -> Result<Vec<ErratumFix>> {
        self.check_converged()?;
        let id = SectionId { obj, shndx };
        let Some(&tidx) = self.table_of_section.get(&id) else {
            return Ok(Vec::new());
        };
        let Self { objects, tables, .. } = self;
        let object = objects
            .get(obj as usize)
            .ok_or_else(|| relax_error("unknown object index"))?;
        let section_address = object
            .sections
            .get(&shndx)
            .ok_or_else(|| relax_error("unknown input section"))?
            .address;
        let table = &mut tables[tidx];
        let region = table.erratum_region_base();
        let mut fixes = Vec::new();
        for (site, erratum_stub) in table.erratum_stubs_for_mut(obj, shndx) {
            let offset = site.offset as usize;
            if offset + 4 > view.len() {
                return Err(malformed_error("erratum trigger beyond the section view"));
            }
            let relocated = insn::read_insn(view, offset);
            match erratum_stub.kind {
                ErratumKind::E843419 => {
                    // Relocation may change the immediate, never the shape.
                    if !insn::is_ldst_uimm(relocated)
                        || insn::rt(relocated) != insn::rt(erratum_stub.insn)
                        || insn::rn(relocated) != insn::rn(erratum_stub.insn)
                    {
                        return Err(malformed_error(alloc::format!(
                            "{}: relocated 843419 site at section {} offset {:#x} is not the scanned load/store",
                            object.name, shndx, site.offset
                        )));
                    }
                    erratum_stub.insn = relocated;
                }
                ErratumKind::E835769 => {
                    if relocated != erratum_stub.insn {
                        return Err(malformed_error(alloc::format!(
                            "{}: relocated 835769 site at section {} offset {:#x} is not the scanned multiply-accumulate",
                            object.name, shndx, site.offset
                        )));
                    }
                }
            }
            let in_place = erratum_stub.kind == ErratumKind::E843419
                && fix_843419_in_place(view, erratum_stub.adrp_offset as usize, section_address)?;
            if !in_place {
                let stub_address = region + erratum_stub.offset;
                let b = insn::construct_b(stub_address.wrapping_sub(erratum_stub.address) as i64)
                    .map_err(|_| {
                        overflow_error(alloc::format!(
                            "{}: erratum stub for section {} offset {:#x} is out of branch range of its trigger; a smaller stub_group_size keeps stubs reachable",
                            object.name, shndx, site.offset
                        ))
                    })?;
                insn::write_insn(view, offset, b);
            }
            log::info!(
                "{}: fixed {:?} at section {} offset {:#x}{}",
                object.name,
                erratum_stub.kind,
                shndx,
                site.offset,
                if in_place { " in place" } else { "" }
            );
            fixes.push(ErratumFix {
                obj,
                shndx,
                offset: site.offset,
                kind: erratum_stub.kind,
                optimized: in_place,
            });
        }
        Ok(fixes)
    }

    /// Render a group owner's stub table into `view`, which must cover
    /// exactly the table's bytes at its assigned address.
    pub fn write_stub_table(&self, obj: u32, shndx: u32, view: &mut [u8]) -> Result<()> {
        self.check_converged()?;
        let table = self
            .owned_stub_table(obj, shndx)
            .ok_or_else(|| relax_error("section does not own a stub table"))?;
        if view.len() as u64 != table.size() {
            return Err(relax_error("stub table view has the wrong size"));
        }
        table.write(view)
    }
}

/// Try to neutralize a 843419 trigger without the stub branch.
///
/// Rewrites the sequence's ADRP into a plain ADR when the target fits the
/// ±1 MiB ADR range. A `mrs Rt, tpidr_el0` at (or right before) the ADRP
/// site is TLS-relaxation residue: the ADRP no longer exists and the hazard
/// is gone. Returns whether the trigger needs no branch redirect.
fn fix_843419_in_place(view: &mut [u8], adrp_offset: usize, section_address: u64) -> Result<bool> {
    if adrp_offset + 4 > view.len() {
        return Err(malformed_error("843419 adrp site beyond the section view"));
    }
    let word = insn::read_insn(view, adrp_offset);
    if insn::is_mrs_tpidr_el0(word) {
        return Ok(true);
    }
    if !insn::is_adrp(word) {
        if adrp_offset >= 4 && insn::is_mrs_tpidr_el0(insn::read_insn(view, adrp_offset - 4)) {
            return Ok(true);
        }
        return Err(malformed_error("843419 sequence lost its adrp after relocation"));
    }
    let pc = section_address + adrp_offset as u64;
    let target = insn::page(pc).wrapping_add(insn::adrp_decode_imm(word) as u64);
    let imm = target.wrapping_sub(pc) as i64;
    if !(-(1 << 20)..(1 << 20)).contains(&imm) {
        return Ok(false);
    }
    // adrp -> adr: clear the op bit, re-encode the immediate in bytes.
    let adr = insn::adr_encode_imm(word & 0x7FFF_FFFF, imm)?;
    insn::write_insn(view, adrp_offset, adr);
    Ok(true)
}
