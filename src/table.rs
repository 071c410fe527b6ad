//! Stub tables.
//!
//! One table serves one group of input sections. Its layout is two regions:
//! keyed, deduplicated reloc stubs first, then the erratum stubs in trigger
//! order. Offsets within a region are stable once assigned; only the table's
//! base address moves between relaxation passes.

use alloc::collections::BTreeMap;
use core::ops::Bound;

use crate::error::overflow_error;
use crate::insn::{self, Insn};
use crate::stub::{
    ErratumKind, ErratumSite, ErratumStub, RelocStub, RelocStubKey, StubKind, ERRATUM_STUB_SIZE,
};
use crate::Result;

/// Hash map with the crate's fixed-seed hasher. Deterministic across runs,
/// so stub layout never depends on address-space randomization.
pub(crate) type Map<K, V> = hashbrown::HashMap<K, V, foldhash::fast::FixedState>;

#[inline]
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A stub table: the reloc- and erratum-stub pool appended to its group's
/// owner section.
#[derive(Debug, Default)]
pub struct StubTable {
    address: u64,
    reloc_stubs: Map<RelocStubKey, RelocStub>,
    reloc_size: u64,
    erratum_stubs: BTreeMap<ErratumSite, ErratumStub>,
    erratum_size: u64,
    prev_size: u64,
}

impl StubTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current base address of the table.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    pub(crate) fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    /// Total table size in bytes: the reloc region padded to 4, then the
    /// erratum region.
    #[inline]
    pub fn size(&self) -> u64 {
        align_up(self.reloc_size, 4) + self.erratum_size
    }

    /// Whether the table holds no stubs at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reloc_stubs.is_empty() && self.erratum_stubs.is_empty()
    }

    pub(crate) fn reloc_stub_count(&self) -> usize {
        self.reloc_stubs.len()
    }

    pub(crate) fn erratum_stub_count(&self) -> usize {
        self.erratum_stubs.len()
    }

    /// Find a stub by key and refresh its destination, or materialize a new
    /// one at the end of the reloc region. Returns whether the table grew.
    pub(crate) fn upsert_reloc_stub(&mut self, key: RelocStubKey, destination: u64) -> bool {
        if let Some(stub) = self.reloc_stubs.get_mut(&key) {
            stub.destination = destination;
            return false;
        }
        let offset = align_up(self.reloc_size, 4);
        self.reloc_size = offset + key.kind.size();
        self.reloc_stubs.insert(
            key,
            RelocStub {
                kind: key.kind,
                offset,
                destination,
            },
        );
        true
    }

    /// Look up a reloc stub by key.
    pub fn reloc_stub(&self, key: &RelocStubKey) -> Option<&RelocStub> {
        self.reloc_stubs.get(key)
    }

    /// Output address of a reloc stub.
    pub fn reloc_stub_address(&self, stub: &RelocStub) -> u64 {
        self.address + stub.offset
    }

    /// Find an erratum stub by trigger site and refresh its captured word and
    /// addresses, or append a new one to the erratum region. Erratum stubs
    /// are never shared, so the site is the whole identity.
    pub(crate) fn upsert_erratum_stub(
        &mut self,
        site: ErratumSite,
        kind: ErratumKind,
        trigger: Insn,
        address: u64,
        adrp_offset: u64,
    ) -> bool {
        if let Some(stub) = self.erratum_stubs.get_mut(&site) {
            stub.insn = trigger;
            stub.address = address;
            stub.destination = address + 4;
            stub.adrp_offset = adrp_offset;
            return false;
        }
        let offset = self.erratum_size;
        self.erratum_size += ERRATUM_STUB_SIZE;
        self.erratum_stubs.insert(
            site,
            ErratumStub {
                kind,
                insn: trigger,
                offset,
                address,
                destination: address + 4,
                adrp_offset,
            },
        );
        true
    }

    /// Erratum stubs whose triggers live in one input section, in offset
    /// order.
    pub fn erratum_stubs_for(
        &self,
        obj: u32,
        shndx: u32,
    ) -> impl Iterator<Item = (&ErratumSite, &ErratumStub)> {
        let lo = ErratumSite { obj, shndx, offset: 0 };
        let hi = ErratumSite { obj, shndx, offset: u64::MAX };
        self.erratum_stubs
            .range((Bound::Included(lo), Bound::Included(hi)))
    }

    pub(crate) fn erratum_stubs_for_mut(
        &mut self,
        obj: u32,
        shndx: u32,
    ) -> impl Iterator<Item = (&ErratumSite, &mut ErratumStub)> {
        let lo = ErratumSite { obj, shndx, offset: 0 };
        let hi = ErratumSite { obj, shndx, offset: u64::MAX };
        self.erratum_stubs
            .range_mut((Bound::Included(lo), Bound::Included(hi)))
    }

    /// Start of the erratum region: the 4-aligned end of the reloc region.
    pub(crate) fn erratum_region_base(&self) -> u64 {
        align_up(self.address + self.reloc_size, 4)
    }

    /// Output address of an erratum stub.
    pub fn erratum_stub_address(&self, stub: &ErratumStub) -> u64 {
        self.erratum_region_base() + stub.offset
    }

    /// Compare the table's size against the previous pass and record the new
    /// value. Called exactly once per table per pass.
    pub(crate) fn size_changed_since_last_pass(&mut self) -> bool {
        let size = self.size();
        let changed = size != self.prev_size;
        self.prev_size = size;
        changed
    }

    /// Render the table into `view`, a buffer covering exactly its bytes.
    pub(crate) fn write(&self, view: &mut [u8]) -> Result<()> {
        debug_assert_eq!(view.len() as u64, self.size());
        view.fill(0);
        for stub in self.reloc_stubs.values() {
            self.write_reloc_stub(stub, view)?;
        }
        let erratum_base = align_up(self.reloc_size, 4);
        for (site, stub) in &self.erratum_stubs {
            self.write_erratum_stub(site, stub, erratum_base, view)?;
        }
        Ok(())
    }

    fn write_reloc_stub(&self, stub: &RelocStub, view: &mut [u8]) -> Result<()> {
        let base = stub.offset as usize;
        let address = self.reloc_stub_address(stub);
        let template = stub.kind.template();
        for (i, word) in template.iter().enumerate() {
            insn::write_insn(view, base + i * insn::BYTES_PER_INSN, *word);
        }
        match stub.kind {
            StubKind::AdrpBranch => {
                let delta = insn::page(stub.destination).wrapping_sub(insn::page(address)) as i64;
                let adrp = insn::adrp_encode_imm(template[0], delta)?;
                insn::write_insn(view, base, adrp);
                let add = insn::add_encode_imm12(template[1], stub.destination & 0xFFF);
                insn::write_insn(view, base + 4, add);
            }
            StubKind::LongBranchAbs => {
                view[base + 8..base + 16].copy_from_slice(&stub.destination.to_le_bytes());
            }
            StubKind::LongBranchPcrel => {
                // The literal is relative to the adr at the stub's second word.
                let rel = stub.destination.wrapping_sub(address + 4);
                view[base + 16..base + 24].copy_from_slice(&rel.to_le_bytes());
            }
        }
        Ok(())
    }

    fn write_erratum_stub(
        &self,
        site: &ErratumSite,
        stub: &ErratumStub,
        region: u64,
        view: &mut [u8],
    ) -> Result<()> {
        let base = (region + stub.offset) as usize;
        let address = self.erratum_stub_address(stub);
        // Branch back is measured from the stub's second word.
        let back = stub.destination.wrapping_sub(address + 4) as i64;
        let b = insn::construct_b(back).map_err(|_| {
            overflow_error(alloc::format!(
                "erratum stub for object {} section {} offset {:#x} is out of branch range of its trigger; a smaller stub_group_size keeps stubs reachable",
                site.obj, site.shndx, site.offset
            ))
        })?;
        insn::write_insn(view, base, stub.insn);
        insn::write_insn(view, base + 4, b);
        Ok(())
    }
}
