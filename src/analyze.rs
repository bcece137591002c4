//! Single-pass analysis of a contiguous code region.
//!
//! Both passes walk the region as a stream of 4-byte words with a
//! one-instruction look-back, which is all it takes to resolve the two
//! register idioms the search depends on: `ADRP`+`ADD`/`LDR` address
//! materialization and `MOV`+`MOVK` wide immediates. Undecodable words are
//! skipped without disturbing the look-back; the pc always advances, so a
//! stretch of embedded data cannot desynchronize the remaining stream.

use crate::disasm::{decompose, Instruction, Operand, Operation};
use std::collections::BTreeMap;

/// The instruction words of `code`, paired with their addresses.
fn words(code: &[u8], base: u64) -> impl Iterator<Item = (u64, u32)> + '_ {
  code.chunks_exact(4).enumerate().map(move |(i, w)| {
    (base + 4 * i as u64, u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
  })
}

/// Resolve an `ADRP` pair: `prev` must be the `ADRP`, `inst` an `ADD` or
/// `LDR` whose source register is the `ADRP` destination. Returns the
/// combined address, or `None` when the registers do not line up.
fn adrp_pair_target(prev: Option<&Instruction>, inst: &Instruction) -> Option<u64> {
  let prev = prev?;
  if prev.operation != Operation::Adrp {
    return None;
  }
  let (Some(&Operand::Reg(page_reg)), Some(&Operand::Imm64(page))) =
    (prev.operands.first(), prev.operands.get(1))
  else {
    return None;
  };
  match inst.operation {
    Operation::Ldr => match inst.operands.get(1) {
      Some(&Operand::Mem { base, offset }) if base == page_reg => Some(page.wrapping_add(offset)),
      _ => None,
    },
    Operation::Add => match (inst.operands.get(1), inst.operands.get(2)) {
      (Some(&Operand::Reg(src)), Some(&Operand::Imm64(imm))) if src == page_reg =>
        Some(page.wrapping_add(imm)),
      _ => None,
    },
    _ => None,
  }
}

/// Resolve a `MOV`+`MOVK` pair into the materialized 64-bit value. `prev`
/// must be the `MOV`, `inst` a `MOVK` sharing its destination register.
fn movk_value(prev: Option<&Instruction>, inst: &Instruction) -> Option<u64> {
  let prev = prev?;
  if prev.operation != Operation::Mov {
    return None;
  }
  let (Some(&Operand::Reg(mov_reg)), Some(&Operand::Imm64(mov_imm))) =
    (prev.operands.first(), prev.operands.get(1))
  else {
    return None;
  };
  match (inst.operands.first(), inst.operands.get(1)) {
    (Some(&Operand::Reg(rd)), Some(&Operand::Imm32 { value, lsl })) if rd == mov_reg =>
      Some(mov_imm | u64::from(value) << lsl),
    _ => None,
  }
}

/// Walk `code` (loaded at `base`) and record one cross-reference per
/// resolvable instruction:
///
/// * `B`, `BL`, `CBZ`: the branch target.
/// * `ADR` and literal-form `LDR`: the absolute address loaded.
/// * `ADD`/`LDR` completing an `ADRP` pair: the combined address, keyed by
///   the address of the second instruction.
///
/// The map is ordered by instruction address, so consumers that need a
/// unique match see candidates deterministically.
#[must_use]
pub fn cross_references(code: &[u8], base: u64) -> BTreeMap<u64, u64> {
  let mut refs = BTreeMap::new();
  let mut prev: Option<Instruction> = None;
  for (pc, word) in words(code, base) {
    let Ok(inst) = decompose(pc, word) else { continue };
    match inst.operation {
      Operation::B | Operation::Bl =>
        if let Some(&Operand::Imm64(target)) = inst.operands.first() {
          refs.insert(pc, target);
        },
      Operation::Cbz | Operation::Adr =>
        if let Some(&Operand::Imm64(target)) = inst.operands.get(1) {
          refs.insert(pc, target);
        },
      Operation::Ldr if matches!(inst.operands.get(1), Some(Operand::Imm64(_))) =>
        if let Some(&Operand::Imm64(target)) = inst.operands.get(1) {
          refs.insert(pc, target);
        },
      Operation::Add | Operation::Ldr =>
        if let Some(target) = adrp_pair_target(prev.as_ref(), &inst) {
          refs.insert(pc, target);
        },
      Operation::Adrp | Operation::Mov | Operation::Movk => {}
    }
    prev = Some(inst);
  }
  refs
}

/// Values recovered from the setup instructions ahead of a failure branch.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowValues {
  /// The most recent `ADRP`-pair result inside the window.
  pub addr: Option<u64>,
  /// The most recent materialized size inside the window.
  pub size: Option<u64>,
}

/// Re-walk `code`, extracting the blob pointer and size from instructions
/// whose address lies strictly between `lo` and `hi`.
///
/// Look-back state is carried across the window edge, so an `ADRP` sitting
/// just outside still pairs with an `ADD` inside. The size is taken from a
/// plain `MOV` with a 64-bit immediate, or from a `MOV`+`MOVK` pair; later
/// matches win.
#[must_use]
pub fn window_values(code: &[u8], base: u64, lo: u64, hi: u64) -> WindowValues {
  let mut out = WindowValues::default();
  let mut prev: Option<Instruction> = None;
  for (pc, word) in words(code, base) {
    let Ok(inst) = decompose(pc, word) else { continue };
    if lo < pc && pc < hi {
      if let Some(target) = adrp_pair_target(prev.as_ref(), &inst) {
        out.addr = Some(target);
      } else if inst.operation == Operation::Mov {
        if let Some(&Operand::Imm64(imm)) = inst.operands.get(1) {
          out.size = Some(imm);
        }
      } else if inst.operation == Operation::Movk {
        if let Some(value) = movk_value(prev.as_ref(), &inst) {
          out.size = Some(value);
        }
      }
    }
    prev = Some(inst);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn le(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
  }

  #[test]
  fn adrp_add_fusion() {
    // ADRP X8, #0x1000 ; ADD X8, X8, #0x10
    let code = le(&[0xb000_0008, 0x9100_4108]);
    let refs = cross_references(&code, 0);
    assert_eq!(refs.get(&4), Some(&0x1010));
    assert!(!refs.contains_key(&0));
  }

  #[test]
  fn adrp_add_register_mismatch() {
    // ADRP X8, #0x1000 ; ADD X9, X9, #0x10: no fusion
    let code = le(&[0xb000_0008, 0x9100_4129]);
    let refs = cross_references(&code, 0);
    assert!(refs.is_empty());
  }

  #[test]
  fn adrp_ldr_fusion() {
    // ADRP X8, #0x1000 ; LDR X1, [X8, #0x18]
    let code = le(&[0xb000_0008, 0xf940_0d01]);
    let refs = cross_references(&code, 0);
    assert_eq!(refs.get(&4), Some(&0x1018));
  }

  #[test]
  fn junk_does_not_poison_the_pair() {
    // ADRP X8, #0x1000 ; <junk> ; ADD X8, X8, #0x10
    // The junk word is skipped; the pair still fuses, and the pc of the
    // ADD is unaffected by the skip.
    let code = le(&[0xb000_0008, 0xdead_beef, 0x9100_4108]);
    let refs = cross_references(&code, 0);
    assert_eq!(refs.get(&8), Some(&0x1010));
  }

  #[test]
  fn branch_targets() {
    // B #+8 ; BL #+8 ; CBZ X0, #+8
    let code = le(&[0x1400_0002, 0x9400_0002, 0xb400_0040]);
    let refs = cross_references(&code, 0x1000);
    assert_eq!(refs.get(&0x1000), Some(&0x1008));
    assert_eq!(refs.get(&0x1004), Some(&0x100c));
    assert_eq!(refs.get(&0x1008), Some(&0x1010));
  }

  #[test]
  fn mov_movk_materialization() {
    // MOV X0, #0x1234 ; MOVK X0, #0x5, LSL #16
    let code = le(&[0xd282_4680, 0xf2a0_00a0]);
    let values = window_values(&code, 0x100, 0x0ff, 0x200);
    assert_eq!(values.size, Some(0x51234));
  }

  #[test]
  fn movk_requires_matching_mov() {
    // MOV X1, #0x1234 ; MOVK X0, #0x5, LSL #16: different registers, so
    // only the plain MOV value survives.
    let code = le(&[0xd282_4681, 0xf2a0_00a0]);
    let values = window_values(&code, 0x100, 0x0ff, 0x200);
    assert_eq!(values.size, Some(0x1234));
  }

  #[test]
  fn window_is_exclusive() {
    // MOV X0, #0x10 at 0x100, MOV X0, #0x20 at 0x104
    let code = le(&[0xd280_0200, 0xd280_0400]);
    // 0x104 is the window end, so only the first MOV is inside
    let values = window_values(&code, 0x100, 0x0fc, 0x104);
    assert_eq!(values.size, Some(0x10));
  }
}
