use elf::abi;
use elf_relax::{
    BranchReloc, ErrataFix, ErratumKind, InputSection, RelaxConfig, Relaxer, SpanKind, StubKind,
    SymbolId,
};

const NOP: u32 = 0xD503_201F;
const BL: u32 = 0x9400_0000;
// adrp x1, #0
const ADRP_X1: u32 = 0x9000_0001;
// ldr x2, [x1]
const LDR_X2_X1: u32 = 0xF940_0022;
// ldr x4, [x3]
const LDR_X4_X3: u32 = 0xF940_0064;
// madd x0, x1, x2, x3
const MADD: u32 = 0x9B02_0C20;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn words(v: &[u32]) -> Vec<u8> {
    v.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn read_word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn branch_target(b: u32, address: u64) -> u64 {
    let imm = (((b & 0x03FF_FFFF) as i64) << 38 >> 38) * 4;
    address.wrapping_add(imm as u64)
}

fn call_reloc(offset: u64, sym: u32) -> BranchReloc {
    BranchReloc {
        offset,
        r_type: abi::R_AARCH64_CALL26,
        symbol: SymbolId::Global(sym),
        addend: 0,
    }
}

/// All branches in range: one pass, no stubs, layout untouched.
#[test]
fn near_branches_need_no_stubs() {
    init();
    let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
    let obj = relaxer.add_object("near.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    let mut sec = InputSection::new(words(&[BL, BL, NOP]), 4);
    sec.add_branch_reloc(call_reloc(0, 1));
    sec.add_branch_reloc(call_reloc(4, 2));
    relaxer.add_input_section(text, obj, 1, sec).unwrap();

    let passes = relaxer
        .relax(&|sym| match sym {
            SymbolId::Global(1) => Some(0x41_0000u64),
            SymbolId::Global(2) => Some(0x3F_0000u64),
            _ => None,
        })
        .unwrap();
    assert_eq!(passes, 1);
    assert!(relaxer.stub_table_for(obj, 1).unwrap().is_empty());
    assert_eq!(relaxer.output_section_end(text), Some(0x40_000C));
}

/// A branch past ±128 MiB is routed through an adrp stub at the section
/// tail, and the layout grows by the stub table.
#[test]
fn far_branch_is_routed_through_a_stub() {
    init();
    let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
    let obj = relaxer.add_object("far.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    let mut sec = InputSection::new(words(&[BL, NOP]), 4);
    sec.add_branch_reloc(call_reloc(0, 1));
    relaxer.add_input_section(text, obj, 1, sec).unwrap();

    let dest = 0x40_0000u64 + 0x2000_0123;
    let passes = relaxer.relax(&move |_| Some(dest)).unwrap();
    assert_eq!(passes, 2);

    let reloc = call_reloc(0, 1);
    let stub_addr = relaxer
        .stub_target_for_branch(obj, 1, &reloc, dest)
        .unwrap()
        .expect("far branch must be re-routed");
    assert_eq!(stub_addr, 0x40_0008);

    let table = relaxer.owned_stub_table(obj, 1).unwrap();
    assert_eq!(table.size(), 16);
    let mut view = vec![0u8; 16];
    relaxer.write_stub_table(obj, 1, &mut view).unwrap();
    // adrp x16, page(dest); add x16, x16, dest & 0xfff; br x16
    let adrp = read_word(&view, 0);
    assert_eq!(adrp & 0x9F00_001F, 0x9000_0010);
    assert_eq!(
        elf_relax::insn::page(stub_addr).wrapping_add(elf_relax::insn::adrp_decode_imm(adrp) as u64),
        elf_relax::insn::page(dest)
    );
    let add = read_word(&view, 4);
    assert_eq!((add >> 10) & 0xFFF, 0x123);
    assert_eq!(read_word(&view, 8), 0xD61F_0200);
}

/// Branches to one (symbol, addend) share a stub; a different addend splits.
#[test]
fn stubs_deduplicate_by_symbol_and_addend() {
    init();
    let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
    let obj = relaxer.add_object("dedup.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    let mut sec = InputSection::new(words(&[BL, BL, BL, NOP]), 4);
    sec.add_branch_reloc(call_reloc(0, 1));
    sec.add_branch_reloc(call_reloc(4, 1));
    sec.add_branch_reloc(BranchReloc {
        offset: 8,
        r_type: abi::R_AARCH64_JUMP26,
        symbol: SymbolId::Global(1),
        addend: 16,
    });
    relaxer.add_input_section(text, obj, 1, sec).unwrap();

    let dest = 0x40_0000u64 + 0x1000_0000;
    relaxer.relax(&move |_| Some(dest)).unwrap();
    let table = relaxer.stub_table_for(obj, 1).unwrap();
    // Two keys: (sym 1, +0) and (sym 1, +16).
    assert_eq!(table.size(), 32);

    let a = relaxer
        .stub_target_for_branch(obj, 1, &call_reloc(0, 1), dest)
        .unwrap();
    let b = relaxer
        .stub_target_for_branch(obj, 1, &call_reloc(4, 1), dest)
        .unwrap();
    assert_eq!(a, b);
}

/// Two branch sites in different sections of one group, same symbol and
/// addend, share a single stub.
#[test]
fn one_stub_serves_branches_across_sections() {
    init();
    let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
    let obj = relaxer.add_object("shared.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    for shndx in [1, 2] {
        let mut sec = InputSection::new(words(&[BL, NOP]), 4);
        sec.add_branch_reloc(call_reloc(0, 7));
        relaxer.add_input_section(text, obj, shndx, sec).unwrap();
    }
    let dest = 0x40_0000u64 + 0x1000_0000;
    relaxer.relax(&move |_| Some(dest)).unwrap();

    let table = relaxer.stub_table_for(obj, 1).unwrap();
    assert_eq!(table.size(), StubKind::AdrpBranch.size());
    let a = relaxer
        .stub_target_for_branch(obj, 1, &call_reloc(0, 7), dest)
        .unwrap();
    let b = relaxer
        .stub_target_for_branch(obj, 2, &call_reloc(0, 7), dest)
        .unwrap();
    assert_eq!(a, b);
    assert!(a.is_some());
    // One table, owned by the group's tail section.
    assert!(relaxer.owned_stub_table(obj, 1).is_none());
    assert!(relaxer.owned_stub_table(obj, 2).is_some());
}

/// Position-independent links use the pc-relative literal stub beyond ADRP
/// reach; static links use the absolute one.
#[test]
fn literal_stub_flavor_follows_link_kind() {
    init();
    let dest = 0x10_0000_0000u64;
    for (pic, expect) in [(false, StubKind::LongBranchAbs), (true, StubKind::LongBranchPcrel)] {
        let cfg = RelaxConfig { position_independent: pic, ..Default::default() };
        let mut relaxer = Relaxer::new(cfg).unwrap();
        let obj = relaxer.add_object("lit.o").unwrap();
        let text = relaxer.add_output_section(0x40_0000).unwrap();
        let mut sec = InputSection::new(words(&[BL]), 4);
        sec.add_branch_reloc(call_reloc(0, 1));
        relaxer.add_input_section(text, obj, 1, sec).unwrap();
        relaxer.relax(&move |_| Some(dest)).unwrap();

        let table = relaxer.owned_stub_table(obj, 1).unwrap();
        assert_eq!(table.size(), expect.size());
        let mut view = vec![0u8; table.size() as usize];
        relaxer.write_stub_table(obj, 1, &mut view).unwrap();
        match expect {
            StubKind::LongBranchAbs => {
                assert_eq!(u64::from_le_bytes(view[8..16].try_into().unwrap()), dest);
            }
            StubKind::LongBranchPcrel => {
                let lit = u64::from_le_bytes(view[16..24].try_into().unwrap());
                assert_eq!(table.address() + 4 + lit, dest);
            }
            StubKind::AdrpBranch => unreachable!(),
        }
    }
}

/// 843419: an ADRP in the last words of a page with a dependent load gets an
/// erratum stub; patch-back redirects the load into the stub and the stub
/// branches back past it.
#[test]
fn erratum_843419_is_patched_through_a_stub() {
    init();
    let cfg = RelaxConfig { errata: ErrataFix::E843419, ..Default::default() };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("e843419.o").unwrap();
    let text = relaxer.add_output_section(0).unwrap();

    let mut data = words(&vec![NOP; 0x400]);
    // Far page target so the ADR rewrite cannot apply.
    let adrp = {
        let base = 0x1000_0000i64;
        elf_relax::insn::adrp_encode_imm(ADRP_X1, base).unwrap()
    };
    data[0xFF8..0xFFC].copy_from_slice(&adrp.to_le_bytes());
    data[0xFFC..0x1000].copy_from_slice(&LDR_X2_X1.to_le_bytes());
    relaxer
        .add_input_section(text, obj, 1, InputSection::new(data.clone(), 4))
        .unwrap();

    let passes = relaxer.relax(&|_| None::<u64>).unwrap();
    assert_eq!(passes, 2);
    let table = relaxer.stub_table_for(obj, 1).unwrap();
    assert_eq!(table.size(), 8);
    let stub_addr = 0x1000;
    assert_eq!(table.address(), stub_addr);

    let mut view = data;
    let fixes = relaxer.fix_errata(obj, 1, &mut view).unwrap();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].kind, ErratumKind::E843419);
    assert_eq!(fixes[0].offset, 0xFFC);
    assert!(!fixes[0].optimized);

    // The load is now a branch into the stub.
    let b = read_word(&view, 0xFFC);
    assert_eq!(b & 0xFC00_0000, 0x1400_0000);
    assert_eq!(branch_target(b, 0xFFC), stub_addr);
    // The ADRP itself is untouched.
    assert_eq!(read_word(&view, 0xFF8), adrp);

    // The stub re-runs the load and branches back to 0x1000.
    let mut stub = vec![0u8; 8];
    relaxer.write_stub_table(obj, 1, &mut stub).unwrap();
    assert_eq!(read_word(&stub, 0), LDR_X2_X1);
    assert_eq!(branch_target(read_word(&stub, 4), stub_addr + 4), 0x1000);
}

/// 843419 with a near target: the ADRP is rewritten to a plain ADR and no
/// branch redirect happens.
#[test]
fn erratum_843419_near_target_is_fixed_in_place() {
    init();
    let cfg = RelaxConfig { errata: ErrataFix::E843419, ..Default::default() };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("e843419adr.o").unwrap();
    let text = relaxer.add_output_section(0).unwrap();

    let mut data = words(&vec![NOP; 0x400]);
    data[0xFF8..0xFFC].copy_from_slice(&ADRP_X1.to_le_bytes());
    data[0xFFC..0x1000].copy_from_slice(&LDR_X2_X1.to_le_bytes());
    relaxer
        .add_input_section(text, obj, 1, InputSection::new(data.clone(), 4))
        .unwrap();
    relaxer.relax(&|_| None::<u64>).unwrap();

    let mut view = data;
    let fixes = relaxer.fix_errata(obj, 1, &mut view).unwrap();
    assert_eq!(fixes.len(), 1);
    assert!(fixes[0].optimized);
    // adrp became adr x1; the load still follows it directly.
    let adr = read_word(&view, 0xFF8);
    assert_eq!(adr & 0x9F00_001F, 0x1000_0001);
    assert_eq!(read_word(&view, 0xFFC), LDR_X2_X1);
}

/// Data spans are never scanned for erratum sequences.
#[test]
fn erratum_scan_skips_data_spans() {
    init();
    let cfg = RelaxConfig { errata: ErrataFix::E843419, ..Default::default() };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("spans.o").unwrap();
    let text = relaxer.add_output_section(0).unwrap();

    let mut data = words(&vec![NOP; 0x400]);
    data[0xFF8..0xFFC].copy_from_slice(&ADRP_X1.to_le_bytes());
    data[0xFFC..0x1000].copy_from_slice(&LDR_X2_X1.to_le_bytes());
    let mut sec = InputSection::new(data, 4);
    sec.add_span(0, SpanKind::Code);
    sec.add_span(0xF00, SpanKind::Data);
    relaxer.add_input_section(text, obj, 1, sec).unwrap();

    relaxer.relax(&|_| None::<u64>).unwrap();
    assert!(relaxer.stub_table_for(obj, 1).unwrap().is_empty());
}

/// 835769: a memory access feeding into a multiply-accumulate gets the
/// multiply duplicated into a stub.
#[test]
fn erratum_835769_is_patched_through_a_stub() {
    init();
    let cfg = RelaxConfig { errata: ErrataFix::E835769, ..Default::default() };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("e835769.o").unwrap();
    let text = relaxer.add_output_section(0).unwrap();

    let data = words(&[LDR_X4_X3, MADD, NOP, NOP]);
    relaxer
        .add_input_section(text, obj, 1, InputSection::new(data.clone(), 4))
        .unwrap();
    relaxer.relax(&|_| None::<u64>).unwrap();

    let table = relaxer.stub_table_for(obj, 1).unwrap();
    assert_eq!(table.size(), 8);
    let stub_addr = table.address();
    assert_eq!(stub_addr, 16);

    let mut view = data;
    let fixes = relaxer.fix_errata(obj, 1, &mut view).unwrap();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].kind, ErratumKind::E835769);
    assert_eq!(fixes[0].offset, 4);
    assert!(!fixes[0].optimized);

    let b = read_word(&view, 4);
    assert_eq!(branch_target(b, 4), stub_addr);

    let mut stub = vec![0u8; 8];
    relaxer.write_stub_table(obj, 1, &mut stub).unwrap();
    assert_eq!(read_word(&stub, 0), MADD);
    assert_eq!(branch_target(read_word(&stub, 4), stub_addr + 4), 8);
}

/// A trigger left past branch range of its group's table is a reported
/// error naming the site and the stub_group_size remedy, on both the
/// patch-back and the table-render paths.
#[test]
fn out_of_range_erratum_stub_names_the_site() {
    init();
    let cfg = RelaxConfig {
        errata: ErrataFix::E835769,
        stub_group_size: Some(1 << 28),
        ..Default::default()
    };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("wide.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();

    let trigger = words(&[LDR_X4_X3, MADD]);
    relaxer
        .add_input_section(text, obj, 1, InputSection::new(trigger.clone(), 4))
        .unwrap();
    // 128 MiB of non-code between the trigger and the group's table.
    let mut filler = InputSection::new(vec![0u8; 1 << 27], 8);
    filler.add_span(0, SpanKind::Data);
    relaxer.add_input_section(text, obj, 2, filler).unwrap();
    relaxer.relax(&|_| None::<u64>).unwrap();

    let mut view = trigger;
    let err = relaxer.fix_errata(obj, 1, &mut view).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("wide.o"), "{msg}");
    assert!(msg.contains("offset 0x4"), "{msg}");
    assert!(msg.contains("stub_group_size"), "{msg}");

    let table = relaxer.stub_table_for(obj, 2).unwrap();
    let mut stub = vec![0u8; table.size() as usize];
    let err = relaxer.write_stub_table(obj, 2, &mut stub).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("offset 0x4"), "{msg}");
    assert!(msg.contains("stub_group_size"), "{msg}");
}

/// Ten 1 MiB sections under a 4 MiB budget form three groups, tables at the
/// fourth, eighth and last sections.
#[test]
fn grouping_respects_the_byte_budget() {
    init();
    const MIB: usize = 1 << 20;
    let cfg = RelaxConfig { stub_group_size: Some(4 * MIB as u64), ..Default::default() };
    let mut relaxer = Relaxer::new(cfg).unwrap();
    let obj = relaxer.add_object("big.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    for shndx in 1..=10 {
        relaxer
            .add_input_section(text, obj, shndx, InputSection::new(vec![0u8; MIB], 16))
            .unwrap();
    }
    relaxer.relax(&|_| None::<u64>).unwrap();

    let owners: Vec<u32> = (1..=10)
        .filter(|&s| relaxer.owned_stub_table(obj, s).is_some())
        .collect();
    assert_eq!(owners, vec![4, 8, 10]);
    // Every section is served by some table.
    for s in 1..=10 {
        assert!(relaxer.stub_table_for(obj, s).is_some());
    }
}

/// Identical inputs produce byte-identical stub tables.
#[test]
fn stub_layout_is_deterministic() {
    init();
    let build = || {
        let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
        let obj = relaxer.add_object("det.o").unwrap();
        let text = relaxer.add_output_section(0x40_0000).unwrap();
        let mut sec = InputSection::new(words(&vec![BL; 8]), 4);
        for i in 0..8u32 {
            sec.add_branch_reloc(call_reloc(i as u64 * 4, i % 5));
        }
        relaxer.add_input_section(text, obj, 1, sec).unwrap();
        relaxer
            .relax(&|sym| match sym {
                SymbolId::Global(n) => Some(0x40_0000u64 + 0x1000_0000 + n as u64 * 0x100),
                _ => None,
            })
            .unwrap();
        let table = relaxer.owned_stub_table(obj, 1).unwrap();
        let mut view = vec![0u8; table.size() as usize];
        relaxer.write_stub_table(obj, 1, &mut view).unwrap();
        (table.address(), view)
    };
    assert_eq!(build(), build());
}

/// A converged engine answers the same query identically forever, and
/// rejects late input mutation.
#[test]
fn convergence_is_final() {
    init();
    let mut relaxer = Relaxer::new(RelaxConfig::default()).unwrap();
    let obj = relaxer.add_object("final.o").unwrap();
    let text = relaxer.add_output_section(0x40_0000).unwrap();
    let mut sec = InputSection::new(words(&[BL]), 4);
    sec.add_branch_reloc(call_reloc(0, 1));
    relaxer.add_input_section(text, obj, 1, sec).unwrap();
    let dest = 0x50_0000u64 + 0x2000_0000;
    relaxer.relax(&move |_| Some(dest)).unwrap();

    let first = relaxer
        .stub_target_for_branch(obj, 1, &call_reloc(0, 1), dest)
        .unwrap();
    let second = relaxer
        .stub_target_for_branch(obj, 1, &call_reloc(0, 1), dest)
        .unwrap();
    assert_eq!(first, second);
    assert!(relaxer.add_object("late.o").is_err());
    assert!(relaxer
        .add_input_section(text, obj, 2, InputSection::new(vec![0u8; 4], 4))
        .is_err());
}
