//! Fixed-width ARM64 instruction decoding.
//!
//! The search only ever needs the forms involved in materializing an
//! address or a size and branching to a failure block, so this decoder
//! accepts exactly those encodings and reports everything else as
//! undecodable. Words are 4 bytes, little-endian; PC-relative operands are
//! resolved to absolute addresses at decode time, which is what lets the
//! cross-reference scan treat `ADR`, `LDR` (literal) and branch targets
//! uniformly.
//!
//! Only the 64-bit (`sf = 1`) variants of `ADD`, `LDR`, `CBZ`, `MOV` and
//! `MOVK` are recognized: the values the analysis recovers are pointers and
//! sizes, which the kernel materializes in `X` registers.

use arrayvec::ArrayVec;
use std::fmt;

/// A general-purpose register, `x0`-`x30`, with `xzr` encoded as 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

impl fmt::Display for Reg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      31 => write!(f, "xzr"),
      30 => write!(f, "lr"),
      29 => write!(f, "fp"),
      n => write!(f, "x{n}"),
    }
  }
}

/// The operations the decoder recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  /// `ADD Xd, Xn, #imm{, LSL #12}`
  Add,
  /// `ADR Xd, label`
  Adr,
  /// `ADRP Xd, page`
  Adrp,
  /// `B label`
  B,
  /// `BL label`
  Bl,
  /// `CBZ Xt, label`
  Cbz,
  /// `LDR Xt, label` or `LDR Xt, [Xn, #off]`
  Ldr,
  /// `MOV Xd, #imm` (the `MOVZ` alias)
  Mov,
  /// `MOVK Xd, #imm{, LSL #s}`
  Movk,
}

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
  /// A register.
  Reg(Reg),
  /// A 64-bit immediate. PC-relative forms are already absolute.
  Imm64(u64),
  /// A 16-bit immediate together with its left shift (`MOVK`).
  Imm32 {
    /// The immediate value.
    value: u32,
    /// Left-shift amount in bits.
    lsl: u32,
  },
  /// A base register plus byte offset (`LDR Xt, [Xn, #off]`).
  Mem {
    /// Base register.
    base: Reg,
    /// Byte offset, already scaled.
    offset: u64,
  },
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
  /// Address of the instruction word.
  pub address: u64,
  /// The recognized operation.
  pub operation: Operation,
  /// Operands in assembly order.
  pub operands: ArrayVec<Operand, 3>,
}

/// An instruction word matching none of the recognized encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError(pub u32);

impl fmt::Display for DecodeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "undecodable instruction word {:#010x}", self.0)
  }
}

impl std::error::Error for DecodeError {}

/// Sign-extend the low `bits` bits of `value`.
fn sext(value: u64, bits: u32) -> i64 {
  let shift = 64 - bits;
  ((value << shift) as i64) >> shift
}

/// The absolute target of a `B`/`BL` word at `pc` (imm26, scaled by 4).
fn branch_target(pc: u64, word: u32) -> u64 {
  pc.wrapping_add((sext(u64::from(word) & 0x03ff_ffff, 26) << 2) as u64)
}

/// The absolute target of an imm19 branch or literal load at `pc`.
fn imm19_target(pc: u64, word: u32) -> u64 {
  pc.wrapping_add((sext(u64::from(word >> 5) & 0x7_ffff, 19) << 2) as u64)
}

/// The signed imm21 of an `ADR`/`ADRP` word, before page scaling.
fn adr_imm(word: u32) -> i64 {
  let immlo = u64::from((word >> 29) & 3);
  let immhi = u64::from((word >> 5) & 0x7_ffff);
  sext(immhi << 2 | immlo, 21)
}

/// Decode the 4-byte instruction word at `pc`.
pub fn decompose(pc: u64, word: u32) -> Result<Instruction, DecodeError> {
  let rd = Reg((word & 0x1f) as u8);
  let rn = Reg(((word >> 5) & 0x1f) as u8);
  let mut operands = ArrayVec::new();
  let operation = if word >> 26 == 0b00_0101 {
    operands.push(Operand::Imm64(branch_target(pc, word)));
    Operation::B
  } else if word >> 26 == 0b10_0101 {
    operands.push(Operand::Imm64(branch_target(pc, word)));
    Operation::Bl
  } else if word >> 24 == 0xb4 {
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm64(imm19_target(pc, word)));
    Operation::Cbz
  } else if word & 0x9f00_0000 == 0x1000_0000 {
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm64(pc.wrapping_add(adr_imm(word) as u64)));
    Operation::Adr
  } else if word & 0x9f00_0000 == 0x9000_0000 {
    let page = (adr_imm(word) << 12) as u64;
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm64((pc & !0xfff).wrapping_add(page)));
    Operation::Adrp
  } else if word & 0xff80_0000 == 0x9100_0000 {
    let sh = (word >> 22) & 1;
    let imm12 = u64::from((word >> 10) & 0xfff);
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Reg(rn));
    operands.push(Operand::Imm64(imm12 << (12 * sh)));
    Operation::Add
  } else if word & 0xff00_0000 == 0x5800_0000 {
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm64(imm19_target(pc, word)));
    Operation::Ldr
  } else if word & 0xffc0_0000 == 0xf940_0000 {
    let offset = u64::from((word >> 10) & 0xfff) << 3;
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Mem { base: rn, offset });
    Operation::Ldr
  } else if word & 0xff80_0000 == 0xd280_0000 {
    let hw = (word >> 21) & 3;
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm64(u64::from((word >> 5) & 0xffff) << (16 * hw)));
    Operation::Mov
  } else if word & 0xff80_0000 == 0xf280_0000 {
    let hw = (word >> 21) & 3;
    operands.push(Operand::Reg(rd));
    operands.push(Operand::Imm32 { value: (word >> 5) & 0xffff, lsl: 16 * hw });
    Operation::Movk
  } else {
    return Err(DecodeError(word));
  };
  Ok(Instruction { address: pc, operation, operands })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn op1(inst: &Instruction) -> Operand {
    inst.operands[1]
  }

  #[test]
  fn branches() {
    // B #+8
    let b = decompose(0x100, 0x1400_0002).unwrap();
    assert_eq!(b.operation, Operation::B);
    assert_eq!(b.operands[0], Operand::Imm64(0x108));

    // BL #+8
    let bl = decompose(0x100, 0x9400_0002).unwrap();
    assert_eq!(bl.operation, Operation::Bl);
    assert_eq!(bl.operands[0], Operand::Imm64(0x108));

    // backward branch: B #-4
    let back = decompose(0x100, 0x17ff_ffff).unwrap();
    assert_eq!(back.operands[0], Operand::Imm64(0xfc));

    // CBZ X2, #+16
    let cbz = decompose(0x100, 0xb400_0082).unwrap();
    assert_eq!(cbz.operation, Operation::Cbz);
    assert_eq!(cbz.operands[0], Operand::Reg(Reg(2)));
    assert_eq!(op1(&cbz), Operand::Imm64(0x110));
  }

  #[test]
  fn pc_relative_addresses() {
    // ADR X1, #+0x10
    let adr = decompose(0x100, 0x1000_0081).unwrap();
    assert_eq!(adr.operation, Operation::Adr);
    assert_eq!(op1(&adr), Operand::Imm64(0x110));

    // ADRP X8, #+0x1000: page of pc plus one page
    let adrp = decompose(0x104, 0xb000_0008).unwrap();
    assert_eq!(adrp.operation, Operation::Adrp);
    assert_eq!(adrp.operands[0], Operand::Reg(Reg(8)));
    assert_eq!(op1(&adrp), Operand::Imm64(0x1000));

    // LDR X2, #+8 (literal)
    let ldr = decompose(0x100, 0x5800_0042).unwrap();
    assert_eq!(ldr.operation, Operation::Ldr);
    assert_eq!(op1(&ldr), Operand::Imm64(0x108));
  }

  #[test]
  fn add_and_ldr_offsets() {
    // ADD X8, X8, #0x10
    let add = decompose(0, 0x9100_4108).unwrap();
    assert_eq!(add.operation, Operation::Add);
    assert_eq!(add.operands[0], Operand::Reg(Reg(8)));
    assert_eq!(op1(&add), Operand::Reg(Reg(8)));
    assert_eq!(add.operands[2], Operand::Imm64(0x10));

    // ADD X0, X0, #0x12, LSL #12
    let shifted = decompose(0, 0x9140_4800).unwrap();
    assert_eq!(shifted.operands[2], Operand::Imm64(0x12000));

    // LDR X1, [X8, #0x18]
    let ldr = decompose(0, 0xf940_0d01).unwrap();
    assert_eq!(ldr.operation, Operation::Ldr);
    assert_eq!(op1(&ldr), Operand::Mem { base: Reg(8), offset: 0x18 });
  }

  #[test]
  fn wide_immediates() {
    // MOV X0, #0x1234
    let mov = decompose(0, 0xd282_4680).unwrap();
    assert_eq!(mov.operation, Operation::Mov);
    assert_eq!(op1(&mov), Operand::Imm64(0x1234));

    // MOV X3, #0x5000000000000 (hw = 3)
    let hi = decompose(0, 0xd2e0_00a3).unwrap();
    assert_eq!(op1(&hi), Operand::Imm64(0x5_0000_0000_0000));

    // MOVK X0, #0x5, LSL #16
    let movk = decompose(0, 0xf2a0_00a0).unwrap();
    assert_eq!(movk.operation, Operation::Movk);
    assert_eq!(op1(&movk), Operand::Imm32 { value: 5, lsl: 16 });
  }

  #[test]
  fn rejects_everything_else() {
    for word in [0x0000_0000, 0xd65f_03c0 /* RET */, 0x5280_0020 /* MOV W0 */, 0xb940_0000 /* LDR W */] {
      assert!(decompose(0, word).is_err(), "{word:#010x} should not decode");
    }
  }
}
