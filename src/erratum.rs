//! Cortex-A53 erratum sequence detectors.
//!
//! Both scanners are pure: they walk a code span of an input-section
//! snapshot and report trigger sites; stub allocation and patching live in
//! the relaxation driver.
//!
//! Erratum 843419: an ADRP in one of the last two words of a 4 KiB page,
//! followed (directly or with one unrelated instruction in between) by a
//! load/store with unsigned immediate addressing that uses the ADRP's
//! destination as its base.
//!
//! Erratum 835769: a memory access directly followed by a 64-bit
//! multiply-accumulate, unless the first is an integer load feeding the
//! multiply (a true dependency stalls the pipeline and dodges the bug).

use alloc::vec::Vec;

use crate::insn::{self, Insn};

/// A 843419 hit. Offsets are relative to the section start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Found843419 {
    /// Offset of the sequence's ADRP.
    pub adrp_offset: u64,
    /// Offset of the dependent load/store (the patched instruction).
    pub offset: u64,
    /// The load/store word.
    pub insn: Insn,
}

/// A 835769 hit. The multiply-accumulate is the patched instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Found835769 {
    /// Offset of the multiply-accumulate, relative to the section start.
    pub offset: u64,
    /// The multiply-accumulate word.
    pub insn: Insn,
}

/// Whether `word` writes integer register `reg`.
///
/// Loads write their transfer registers; other non-branch instructions are
/// taken to write their `rd` field. Erring towards "does not write" only
/// costs a redundant stub, never a missed fix.
fn writes_reg(word: Insn, reg: u32) -> bool {
    if let Some(m) = insn::mem_op(word) {
        return m.load && !m.simd && (m.rt == reg || (m.pair && m.rt2 == reg));
    }
    insn::rd(word) == reg
}

/// The 843419 sequence test at an ADRP site.
///
/// `second` is the word after the ADRP; `third` the one after that, when the
/// span still covers it. Returns the offset delta (4 or 8) from the ADRP to
/// the dependent load/store.
fn e843419_sequence(adrp: Insn, second: Insn, third: Option<Insn>) -> Option<u64> {
    debug_assert!(insn::is_adrp(adrp));
    let base = insn::rd(adrp);
    if insn::is_ldst_uimm(second) && insn::rn(second) == base {
        return Some(4);
    }
    // One unrelated instruction may sit between: anything that is not a
    // branch and leaves the ADRP's destination intact.
    let third = third?;
    if insn::is_branch(second) || writes_reg(second, base) {
        return None;
    }
    (insn::is_ldst_uimm(third) && insn::rn(third) == base).then_some(8)
}

/// Scan one code span for 843419 triggers.
///
/// Only ADRPs at page offsets 0xFF8 and 0xFFC can trigger, so the scan hops
/// from page end to page end. Spans whose output address is not word-aligned
/// cannot hold instructions at those offsets and are skipped.
pub(crate) fn scan_843419_span(
    data: &[u8],
    span_start: u64,
    span_end: u64,
    address: u64,
) -> Vec<Found843419> {
    let mut found = Vec::new();
    if (address + span_start) & 3 == 0 {
        let mut offset = span_start;
        // Hop to the first candidate page offset at or after the span start.
        // Word alignment leaves 0xFF8 and 0xFFC as the only candidates per
        // page.
        let page_off = (address + offset) & 0xFFF;
        if page_off < 0xFF8 {
            offset += 0xFF8 - page_off;
        }
        while offset + 8 <= span_end {
            let adrp = insn::read_insn(data, offset as usize);
            if insn::is_adrp(adrp) {
                let second = insn::read_insn(data, (offset + 4) as usize);
                let third = (offset + 12 <= span_end)
                    .then(|| insn::read_insn(data, (offset + 8) as usize));
                if let Some(delta) = e843419_sequence(adrp, second, third) {
                    found.push(Found843419 {
                        adrp_offset: offset,
                        offset: offset + delta,
                        insn: if delta == 4 {
                            second
                        } else {
                            insn::read_insn(data, (offset + 8) as usize)
                        },
                    });
                }
            }
            // 0xFF8 -> 0xFFC, 0xFFC -> next page's 0xFF8.
            offset += if (address + offset) & 0xFFF == 0xFF8 { 4 } else { 0xFFC };
        }
    }
    found
}

/// The 835769 sequence test on two adjacent words.
fn e835769_sequence(first: Insn, second: Insn) -> bool {
    if !insn::is_mlxl(second) {
        return false;
    }
    let Some(m) = insn::mem_op(first) else {
        return false;
    };
    if m.simd {
        return true;
    }
    if m.load {
        let deps = [insn::rn(second), insn::rm(second), insn::ra(second)];
        if deps.contains(&m.rt) || (m.pair && deps.contains(&m.rt2)) {
            // True read-after-write dependency; the sequence is safe.
            return false;
        }
    }
    true
}

/// Scan one code span for 835769 triggers.
pub(crate) fn scan_835769_span(data: &[u8], span_start: u64, span_end: u64) -> Vec<Found835769> {
    let mut found = Vec::new();
    let mut offset = span_start;
    while offset + 8 <= span_end {
        let first = insn::read_insn(data, offset as usize);
        let second = insn::read_insn(data, (offset + 4) as usize);
        if e835769_sequence(first, second) {
            found.push(Found835769 {
                offset: offset + 4,
                insn: second,
            });
            // The multiply-accumulate cannot open the next pair.
            offset += 4;
        }
        offset += 4;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const NOP: Insn = 0xD503_201F;
    // adrp x1, #0
    const ADRP_X1: Insn = 0x9000_0001;
    // ldr x2, [x1]
    const LDR_X2_X1: Insn = 0xF940_0022;
    // ldr x1, [x3] (clobbers the adrp destination)
    const LDR_X1_X3: Insn = 0xF940_0061;
    // ldr x4, [x3]
    const LDR_X4_X3: Insn = 0xF940_0064;
    // ldp x4, x5, [x3]
    const LDP_X4_X5_X3: Insn = 0xA940_1464;
    // str x4, [x3]
    const STR_X4_X3: Insn = 0xF900_0064;
    // madd x0, x4, x5, x6
    const MADD_X0_X4_X5_X6: Insn = 0x9B05_1880;
    // madd x0, x1, x2, x3
    const MADD_X0_X1_X2_X3: Insn = 0x9B02_0C20;
    // mul x0, x1, x2
    const MUL_X0_X1_X2: Insn = 0x9B02_7C20;

    fn section(words: &[(u64, Insn)], size: usize) -> vec::Vec<u8> {
        let mut data = vec![0u8; size];
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&NOP.to_le_bytes());
        }
        for &(off, word) in words {
            data[off as usize..off as usize + 4].copy_from_slice(&word.to_le_bytes());
        }
        data
    }

    #[test]
    fn adjacent_sequence_at_page_end_is_found() {
        let data = section(&[(0xFF8, ADRP_X1), (0xFFC, LDR_X2_X1)], 0x1010);
        let found = scan_843419_span(&data, 0, data.len() as u64, 0);
        assert_eq!(
            found,
            vec![Found843419 { adrp_offset: 0xFF8, offset: 0xFFC, insn: LDR_X2_X1 }]
        );
    }

    #[test]
    fn sequence_away_from_page_end_is_ignored() {
        let data = section(&[(0x800, ADRP_X1), (0x804, LDR_X2_X1)], 0x1010);
        assert!(scan_843419_span(&data, 0, data.len() as u64, 0).is_empty());
    }

    #[test]
    fn page_offset_accounts_for_section_address() {
        // Section placed at 0x800: the adrp at section offset 0x7F8 sits at
        // output page offset 0xFF8.
        let data = section(&[(0x7F8, ADRP_X1), (0x7FC, LDR_X2_X1)], 0x810);
        let found = scan_843419_span(&data, 0, data.len() as u64, 0x800);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].adrp_offset, 0x7F8);
    }

    #[test]
    fn one_unrelated_insn_may_intervene() {
        let data = section(&[(0xFFC, ADRP_X1), (0x1000, NOP), (0x1004, LDR_X2_X1)], 0x1010);
        let found = scan_843419_span(&data, 0, data.len() as u64, 0);
        assert_eq!(
            found,
            vec![Found843419 { adrp_offset: 0xFFC, offset: 0x1004, insn: LDR_X2_X1 }]
        );
    }

    #[test]
    fn intervening_branch_breaks_the_sequence() {
        let b = insn::construct_b(0x40).unwrap();
        let data = section(&[(0xFFC, ADRP_X1), (0x1000, b), (0x1004, LDR_X2_X1)], 0x1010);
        assert!(scan_843419_span(&data, 0, data.len() as u64, 0).is_empty());
    }

    #[test]
    fn intervening_clobber_of_base_breaks_the_sequence() {
        let data = section(
            &[(0xFFC, ADRP_X1), (0x1000, LDR_X1_X3), (0x1004, LDR_X2_X1)],
            0x1010,
        );
        assert!(scan_843419_span(&data, 0, data.len() as u64, 0).is_empty());
    }

    #[test]
    fn independent_base_register_is_no_trigger() {
        // Load based on x3, not the adrp's x1.
        let data = section(&[(0xFF8, ADRP_X1), (0xFFC, LDR_X4_X3)], 0x1010);
        assert!(scan_843419_span(&data, 0, data.len() as u64, 0).is_empty());
    }

    #[test]
    fn multiple_pages_are_scanned() {
        let data = section(
            &[
                (0xFF8, ADRP_X1),
                (0xFFC, LDR_X2_X1),
                (0x1FFC, ADRP_X1),
                (0x2000, LDR_X2_X1),
            ],
            0x2010,
        );
        let found = scan_843419_span(&data, 0, data.len() as u64, 0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].offset, 0xFFC);
        assert_eq!(found[1].offset, 0x2000);
    }

    #[test]
    fn misaligned_span_is_skipped() {
        let data = section(&[(0xFF8, ADRP_X1), (0xFFC, LDR_X2_X1)], 0x1010);
        assert!(scan_843419_span(&data, 0, data.len() as u64, 2).is_empty());
    }

    #[test]
    fn independent_load_then_mac_is_flagged() {
        let data = section(&[(0x10, LDR_X4_X3), (0x14, MADD_X0_X1_X2_X3)], 0x20);
        let found = scan_835769_span(&data, 0, data.len() as u64);
        assert_eq!(found, vec![Found835769 { offset: 0x14, insn: MADD_X0_X1_X2_X3 }]);
    }

    #[test]
    fn dependent_load_then_mac_is_safe() {
        // x4 feeds the multiply's rm.
        let data = section(&[(0x10, LDR_X4_X3), (0x14, MADD_X0_X4_X5_X6)], 0x20);
        assert!(scan_835769_span(&data, 0, data.len() as u64).is_empty());
    }

    #[test]
    fn dependent_pair_load_is_safe() {
        // x5 (the pair's second register) feeds the multiply.
        let data = section(&[(0x10, LDP_X4_X5_X3), (0x14, MADD_X0_X4_X5_X6)], 0x20);
        assert!(scan_835769_span(&data, 0, data.len() as u64).is_empty());
    }

    #[test]
    fn store_then_mac_is_flagged() {
        let data = section(&[(0x10, STR_X4_X3), (0x14, MADD_X0_X4_X5_X6)], 0x20);
        assert_eq!(scan_835769_span(&data, 0, data.len() as u64).len(), 1);
    }

    #[test]
    fn plain_mul_is_no_trigger() {
        let data = section(&[(0x10, LDR_X4_X3), (0x14, MUL_X0_X1_X2)], 0x20);
        assert!(scan_835769_span(&data, 0, data.len() as u64).is_empty());
    }

    #[test]
    fn matched_mac_does_not_open_next_pair() {
        // mem; mac; mac: the second mac pairs with the first mac, not with
        // the memory op, so only one site is reported.
        let data = section(
            &[(0x10, LDR_X4_X3), (0x14, MADD_X0_X1_X2_X3), (0x18, MADD_X0_X1_X2_X3)],
            0x20,
        );
        let found = scan_835769_span(&data, 0, data.len() as u64);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 0x14);
    }
}
