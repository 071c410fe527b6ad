//! AArch64 instruction codec.
//!
//! Pure bit-field pack/unpack helpers for the instruction families the
//! relaxation engine cares about: ADR/ADRP, unconditional and indirect
//! branches, loads/stores, multiply-accumulate, and MOVZ/MOVN. Decoding and
//! encoding match the ISA bit positions exactly; every encode helper reports
//! overflow instead of truncating, since a silently truncated immediate
//! miscompiles the output program.

use crate::error::overflow_error;
use crate::Result;

/// A raw 32-bit AArch64 instruction word.
pub type Insn = u32;

/// Instruction length in bytes.
pub const BYTES_PER_INSN: usize = 4;

/// Zero register encoding.
pub const ZR: u32 = 31;

#[inline]
fn bit(insn: Insn, pos: u32) -> u32 {
    (insn >> pos) & 1
}

#[inline]
fn bits(insn: Insn, pos: u32, len: u32) -> u32 {
    (insn >> pos) & ((1 << len) - 1)
}

/// Destination register field, bits 4:0.
#[inline]
pub fn rd(insn: Insn) -> u32 {
    bits(insn, 0, 5)
}

/// First source / base register field, bits 9:5.
#[inline]
pub fn rn(insn: Insn) -> u32 {
    bits(insn, 5, 5)
}

/// Second source register field, bits 20:16.
#[inline]
pub fn rm(insn: Insn) -> u32 {
    bits(insn, 16, 5)
}

/// Accumulator register of 3-source data-processing insns, bits 14:10.
#[inline]
pub fn ra(insn: Insn) -> u32 {
    bits(insn, 10, 5)
}

/// Transfer register of load/store insns, bits 4:0.
#[inline]
pub fn rt(insn: Insn) -> u32 {
    bits(insn, 0, 5)
}

/// Second transfer register of load/store pair insns, bits 14:10.
#[inline]
pub fn rt2(insn: Insn) -> u32 {
    bits(insn, 10, 5)
}

/// The "op31" field of 3-source data-processing insns, bits 23:21.
#[inline]
pub fn op31(insn: Insn) -> u32 {
    bits(insn, 21, 3)
}

/// Whether the word is an `adr` instruction.
#[inline]
pub fn is_adr(insn: Insn) -> bool {
    (insn & 0x9F00_0000) == 0x1000_0000
}

/// Whether the word is an `adrp` instruction.
#[inline]
pub fn is_adrp(insn: Insn) -> bool {
    (insn & 0x9F00_0000) == 0x9000_0000
}

/// Whether the word is `mrs Rt, tpidr_el0` (TLS relaxation residue).
#[inline]
pub fn is_mrs_tpidr_el0(insn: Insn) -> bool {
    (insn & 0xFFFF_FFE0) == 0xD53B_D040
}

/// Whether the word is an unconditional `b`.
#[inline]
pub fn is_b(insn: Insn) -> bool {
    (insn & 0xFC00_0000) == 0x1400_0000
}

/// Whether the word is a `bl`.
#[inline]
pub fn is_bl(insn: Insn) -> bool {
    (insn & 0xFC00_0000) == 0x9400_0000
}

/// Whether the word is a `blr`.
#[inline]
pub fn is_blr(insn: Insn) -> bool {
    (insn & 0xFFFF_FC1F) == 0xD63F_0000
}

/// Whether the word is a `br`.
#[inline]
pub fn is_br(insn: Insn) -> bool {
    (insn & 0xFFFF_FC1F) == 0xD61F_0000
}

/// Whether the word is any branch the erratum scanners must not look past.
#[inline]
pub fn is_branch(insn: Insn) -> bool {
    is_b(insn) || is_bl(insn) || is_br(insn) || is_blr(insn)
}

// Load/store encoding-space predicates. See C4-182 of the ARM ARM; the
// LD_PCREL, LDST_RO, LDST_UI and LDST_UIMM spaces also cover prefetch ops.

#[inline]
fn is_ld(insn: Insn) -> bool {
    bit(insn, 22) == 1
}

#[inline]
fn is_ldst(insn: Insn) -> bool {
    (insn & 0x0A00_0000) == 0x0800_0000
}

#[inline]
fn is_ldst_ex(insn: Insn) -> bool {
    (insn & 0x3F00_0000) == 0x0800_0000
}

#[inline]
fn is_ldst_pcrel(insn: Insn) -> bool {
    (insn & 0x3B00_0000) == 0x1800_0000
}

#[inline]
fn is_ldst_nap(insn: Insn) -> bool {
    (insn & 0x3B80_0000) == 0x2800_0000
}

#[inline]
fn is_ldstp_pi(insn: Insn) -> bool {
    (insn & 0x3B80_0000) == 0x2880_0000
}

#[inline]
fn is_ldstp_o(insn: Insn) -> bool {
    (insn & 0x3B80_0000) == 0x2900_0000
}

#[inline]
fn is_ldstp_pre(insn: Insn) -> bool {
    (insn & 0x3B80_0000) == 0x2980_0000
}

#[inline]
fn is_ldst_ui(insn: Insn) -> bool {
    (insn & 0x3B20_0C00) == 0x3800_0000
}

#[inline]
fn is_ldst_piimm(insn: Insn) -> bool {
    (insn & 0x3B20_0C00) == 0x3800_0400
}

#[inline]
fn is_ldst_u(insn: Insn) -> bool {
    (insn & 0x3B20_0C00) == 0x3800_0800
}

#[inline]
fn is_ldst_preimm(insn: Insn) -> bool {
    (insn & 0x3B20_0C00) == 0x3800_0C00
}

#[inline]
fn is_ldst_ro(insn: Insn) -> bool {
    (insn & 0x3B20_0C00) == 0x3820_0800
}

/// Whether the word is in the "load/store register (unsigned immediate)"
/// encoding class. This is the addressing form erratum 843419 triggers on.
#[inline]
pub fn is_ldst_uimm(insn: Insn) -> bool {
    (insn & 0x3B00_0000) == 0x3900_0000
}

#[inline]
fn is_ldst_simd_m(insn: Insn) -> bool {
    (insn & 0xBFBF_0000) == 0x0C00_0000
}

#[inline]
fn is_ldst_simd_m_pi(insn: Insn) -> bool {
    (insn & 0xBFA0_0000) == 0x0C80_0000
}

#[inline]
fn is_ldst_simd_s(insn: Insn) -> bool {
    (insn & 0xBF9F_0000) == 0x0D00_0000
}

#[inline]
fn is_ldst_simd_s_pi(insn: Insn) -> bool {
    (insn & 0xBF80_0000) == 0x0D80_0000
}

/// A classified memory-access instruction.
///
/// For scalar accesses `rt2 == rt`; for pair (and multi-register SIMD)
/// accesses `rt` and `rt2` bound the transferred register range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOp {
    /// First transfer register.
    pub rt: u32,
    /// Second transfer register (equal to `rt` for scalar accesses).
    pub rt2: u32,
    /// Whether this is a pair access.
    pub pair: bool,
    /// Whether this is a load (as opposed to a store).
    pub load: bool,
    /// Whether this is a SIMD/FP access (`V` bit set).
    pub simd: bool,
}

/// Classify a word as a load/store.
///
/// Returns `None` when the word is not in the load/store encoding space.
/// Covers the integer and SIMD/FP single and pair forms the erratum
/// scanners care about.
pub fn mem_op(insn: Insn) -> Option<MemOp> {
    if !is_ldst(insn) {
        return None;
    }

    let simd = bit(insn, 26) == 1;
    if is_ldst_ex(insn) {
        let pair = bit(insn, 21) == 1;
        return Some(MemOp {
            rt: rt(insn),
            rt2: if pair { rt2(insn) } else { rt(insn) },
            pair,
            load: is_ld(insn),
            simd,
        });
    }
    if is_ldst_nap(insn) || is_ldstp_pi(insn) || is_ldstp_o(insn) || is_ldstp_pre(insn) {
        return Some(MemOp {
            rt: rt(insn),
            rt2: rt2(insn),
            pair: true,
            load: is_ld(insn),
            simd,
        });
    }
    if is_ldst_pcrel(insn)
        || is_ldst_ui(insn)
        || is_ldst_piimm(insn)
        || is_ldst_u(insn)
        || is_ldst_preimm(insn)
        || is_ldst_ro(insn)
        || is_ldst_uimm(insn)
    {
        let load = if is_ldst_pcrel(insn) {
            true
        } else {
            let opc_v = bits(insn, 22, 2) | (bit(insn, 26) << 2);
            matches!(opc_v, 1 | 2 | 3 | 5 | 7)
        };
        return Some(MemOp {
            rt: rt(insn),
            rt2: rt(insn),
            pair: false,
            load,
            simd,
        });
    }
    if is_ldst_simd_m(insn) || is_ldst_simd_m_pi(insn) {
        let r0 = rt(insn);
        let r1 = match bits(insn, 12, 4) {
            0 | 2 => r0 + 3,
            4 | 6 => r0 + 2,
            7 => r0,
            8 | 10 => r0 + 1,
            _ => return None,
        };
        return Some(MemOp {
            rt: r0,
            rt2: r1,
            pair: r1 != r0,
            load: bit(insn, 22) == 1,
            simd: true,
        });
    }
    if is_ldst_simd_s(insn) || is_ldst_simd_s_pi(insn) {
        let r0 = rt(insn);
        let r = bit(insn, 21);
        let r1 = match bits(insn, 13, 3) {
            0 | 2 | 4 | 6 => r0 + r,
            1 | 3 | 5 | 7 => r0 + if r == 0 { 2 } else { 3 },
            _ => return None,
        };
        return Some(MemOp {
            rt: r0,
            rt2: r1,
            pair: r1 != r0,
            load: bit(insn, 22) == 1,
            simd: true,
        });
    }
    None
}

/// Whether the word is a multiply-accumulate (MADD/MSUB class and the long
/// variants), excluding plain MUL which is encoded as MADD with `ra == xzr`.
#[inline]
pub fn is_mlxl(insn: Insn) -> bool {
    let mac = (insn & 0xFF00_0000) == 0x9B00_0000;
    mac && matches!(op31(insn), 0 | 1 | 5) && ra(insn) != ZR
}

/// 4 KiB page truncation: `page(addr) = addr & !0xFFF`.
#[inline]
pub fn page(addr: u64) -> u64 {
    addr & !0xFFF
}

/// Retrieve the 33-bit signed value encoded in an `adrp` (the 21-bit
/// immediate multiplied by the page size, sign-extended to 64 bits).
pub fn adrp_decode_imm(adrp: Insn) -> i64 {
    debug_assert!(is_adrp(adrp));
    let imm21 = (bits(adrp, 29, 2) | (bits(adrp, 5, 19) << 2)) as u64;
    // Sign bit of the 33-bit value is bit 32.
    (((imm21 << 12) as i64) << 31) >> 31
}

/// Encode a 21-bit signed byte offset into an `adr` (or, without the range
/// interpretation, an `adrp`) word: 2 low bits at 30:29, 19 high bits at 23:5.
/// All other bits of the instruction are left untouched.
pub fn adr_encode_imm(adr: Insn, imm21: i64) -> Result<Insn> {
    if !(-(1 << 20)..(1 << 20)).contains(&imm21) {
        return Err(overflow_error("adr immediate out of 21-bit signed range"));
    }
    let imm = imm21 as u32 & 0x1F_FFFF;
    let cleared = adr & !((0x7FFFF << 5) | (0x3 << 29));
    Ok(cleared | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5))
}

/// Encode a page delta into an `adrp` word. The delta must be page-aligned
/// and within the 33-bit signed range of the instruction.
pub fn adrp_encode_imm(adrp: Insn, page_delta: i64) -> Result<Insn> {
    if page_delta & 0xFFF != 0 {
        return Err(overflow_error("adrp page delta not page-aligned"));
    }
    if !(-(1i64 << 32)..(1i64 << 32)).contains(&page_delta) {
        return Err(overflow_error("adrp page delta out of 33-bit signed range"));
    }
    let imm = (page_delta >> 12) as u32 & 0x1F_FFFF;
    let cleared = adrp & !((0x7FFFF << 5) | (0x3 << 29));
    Ok(cleared | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5))
}

/// Encode an unsigned 12-bit immediate into an `add Rd, Rn, #imm` word at
/// bits 21:10. Used for the low 12 bits of a page-split address.
#[inline]
pub fn add_encode_imm12(add: Insn, imm12: u64) -> Insn {
    debug_assert!(imm12 <= 0xFFF);
    (add & !(0xFFF << 10)) | ((imm12 as u32 & 0xFFF) << 10)
}

/// Encode a 26-bit signed word-granularity branch immediate at bits 25:0.
/// The byte offset must be word-aligned and within ±128 MiB.
pub fn branch_encode_imm(insn: Insn, byte_offset: i64) -> Result<Insn> {
    if byte_offset & 0x3 != 0 {
        return Err(overflow_error("branch offset not word-aligned"));
    }
    if !(-(1i64 << 27)..(1i64 << 27)).contains(&byte_offset) {
        return Err(overflow_error("branch offset out of 26-bit immediate range"));
    }
    let imm = (byte_offset >> 2) as u32 & 0x03FF_FFFF;
    Ok((insn & !0x03FF_FFFF) | imm)
}

/// Construct an unconditional `b` with the given byte offset.
pub fn construct_b(byte_offset: i64) -> Result<Insn> {
    branch_encode_imm(0x1400_0000, byte_offset)
}

/// Encode a 16-bit chunk of `value` (taken at bit position `lsl`, one of 0,
/// 16, 32, 48) into a MOVZ/MOVN word. Non-negative values select the MOVZ
/// opcode (bits 30:29 = 0b10); negative values select MOVN (0b00) with the
/// bit-inverted operand. Reports overflow when the remaining bits of the
/// (possibly inverted) value do not fit above the selected chunk.
pub fn movnz_encode_imm(insn: Insn, value: i64, lsl: u32) -> Result<Insn> {
    debug_assert!(matches!(lsl, 0 | 16 | 32 | 48));
    let (operand, opc) = if value >= 0 {
        (value as u64, 0x2u32)
    } else {
        (!(value as u64), 0x0u32)
    };
    if (operand >> lsl) > 0xFFFF {
        return Err(overflow_error("movz/movn immediate out of range"));
    }
    let chunk = ((operand >> lsl) & 0xFFFF) as u32;
    let cleared = insn & !((0xFFFF << 5) | (0x3 << 29));
    Ok(cleared | (opc << 29) | (chunk << 5))
}

/// Read a little-endian instruction word from `bytes` at `offset`.
#[inline]
pub(crate) fn read_insn(bytes: &[u8], offset: usize) -> Insn {
    Insn::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Write a little-endian instruction word into `bytes` at `offset`.
#[inline]
pub(crate) fn write_insn(bytes: &mut [u8], offset: usize, insn: Insn) {
    bytes[offset..offset + 4].copy_from_slice(&insn.to_le_bytes());
}
