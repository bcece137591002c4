//! Locator and decoder for the sandbox profile collection embedded in an
//! Apple XNU kernelcache.
//!
//! The `com.apple.security.sandbox` kext carries its compiled policy data as
//! an anonymous blob in constant memory. With symbols stripped, the blob is
//! reachable only through the failure path of the kext's initialization
//! code, which loads the blob's address and size and branches to a panic
//! block when setup fails. This crate walks that path statically:
//!
//! 1. [`get_sandbox_opts`] reads the operation-name table out of
//!    `__DATA_CONST,__const`.
//! 2. [`get_sandbox_profiles`] / [`get_sandbox_collections`] disassemble
//!    the sandbox kext's code, pivot on a known panic format string, and
//!    read back the raw collection bytes.
//! 3. [`parse_sandbox_collection`] decodes those bytes into a [`Sandbox`].
//!
//! Mach-O bookkeeping (section lookup, address translation, prelink kext
//! tables) is consumed through the [`MachImage`] trait; any kernelcache
//! reader that can satisfy it will do.

// rust lints we want
#![warn(
  bare_trait_objects,
  elided_lifetimes_in_paths,
  missing_copy_implementations,
  missing_debug_implementations,
  future_incompatible,
  rust_2018_idioms,
  trivial_numeric_casts,
  variant_size_differences,
  unreachable_pub,
  unused,
  missing_docs
)]
#![deny(unsafe_op_in_unsafe_fn)]
// all the clippy
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
// all the clippy::restriction lints we want
#![warn(
  clippy::else_if_without_else,
  clippy::float_arithmetic,
  clippy::get_unwrap,
  clippy::rest_pat_in_fully_bound_structs,
  clippy::string_add,
  clippy::undocumented_unsafe_blocks,
  clippy::unwrap_used
)]
// all the clippy lints we don't want
#![allow(
  clippy::cognitive_complexity,
  clippy::default_trait_access,
  clippy::inline_always,
  clippy::missing_const_for_fn,
  clippy::missing_errors_doc,
  clippy::missing_panics_doc,
  clippy::module_name_repetitions,
  clippy::multiple_crate_versions,
  clippy::option_if_let_else,
  clippy::redundant_pub_crate,
  clippy::semicolon_if_nothing_returned,
  clippy::too_many_lines,
  clippy::use_self
)]

mod analyze;
mod disasm;
mod locate;
mod macho;
mod opts;
mod parser;

use std::fmt;
use std::io;

pub use analyze::{cross_references, window_values, WindowValues};
pub use disasm::{decompose, DecodeError, Instruction, Operand, Operation, Reg};
pub use locate::{get_sandbox_collections, get_sandbox_profiles};
pub use macho::{KextInfo, MachImage, Section};
pub use opts::get_sandbox_opts;
pub use parser::{
  parse_sandbox_collection, CollectionHeader, Sandbox, SandboxOperation, SandboxProfile,
  HEADER_SIZE,
};

/// The canonical high half of an untagged kernel pointer.
pub const TAG_PTR_MASK: u64 = 0xffff << 48;

/// Tag marking a pointer-array entry that is directly followed by another
/// pointer.
pub const TAG_CHAIN: u16 = 0x17;

/// The tag carried in bits \[48:64) of a kernel pointer.
#[inline]
#[must_use]
pub fn tag(ptr: u64) -> u16 {
  (ptr >> 48) as u16
}

/// Strip the tag from a kernel pointer and restore the canonical high half.
#[inline]
#[must_use]
pub fn untag(ptr: u64) -> u64 {
  (ptr & ((1 << 48) - 1)) | TAG_PTR_MASK
}

/// An error while locating or decoding a profile collection.
#[derive(Debug)]
pub enum Error {
  /// A positioned read against the backing file failed.
  Io(io::Error),
  /// A section, string, or kext record needed for the search was absent
  /// from the image.
  Missing(&'static str),
  /// The static search for the collection blob could not complete.
  Locator {
    /// The search step that failed.
    step: LocateStep,
    /// What that step could not resolve.
    reason: &'static str,
  },
  /// A short read or malformed field while decoding the collection blob.
  Decode {
    /// The field being read.
    field: &'static str,
    /// Byte position of the failed read, relative to the blob start.
    position: usize,
  },
  /// The decoded collection contradicts the supplied operation list.
  Invariant(&'static str),
}

/// The step of the blob search that failed (see [`Error::Locator`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateStep {
  /// Bounding the sandbox kext's code region.
  KextBounds,
  /// Resolving the unique cross-reference to the panic string.
  PanicXref,
  /// Resolving the unique branch into the panic block.
  FailXref,
  /// Recovering the collection's virtual address from the setup window.
  BlobAddress,
  /// Recovering the collection's size from the setup window.
  BlobSize,
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Error::Io(e) => write!(f, "{e}"),
      Error::Missing(what) => write!(f, "{what} not found in kernelcache"),
      Error::Locator { step, reason } =>
        write!(f, "sandbox data search failed at {step:?}: {reason}"),
      Error::Decode { field, position } =>
        write!(f, "failed to read {field} at byte {position:#x} of the profile collection"),
      Error::Invariant(msg) => write!(f, "{msg}"),
    }
  }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
  fn from(e: io::Error) -> Self {
    Self::Io(e)
  }
}

#[inline]
pub(crate) fn u64_as_usize(n: u64) -> usize {
  n.try_into().expect("64-bit collection sizes require a 64-bit host")
}

#[cfg(test)]
mod tests {
  use super::{tag, untag, TAG_CHAIN};

  #[test]
  fn tag_discipline() {
    let p = 0x0017_ffff_fff0_0000_u64;
    assert_eq!(tag(p), TAG_CHAIN);
    assert_eq!(untag(p), 0xffff_ffff_fff0_0000);

    let q = 0x0010_ffff_fff0_0000_u64;
    assert_eq!(tag(q), 0x10);
    assert_eq!(untag(q), 0xffff_ffff_fff0_0000);

    // untag restores the canonical high half no matter the tag
    for t in [0_u64, 0x17, 0x8000, 0xffff] {
      let low48 = 0x0000_1234_5678_9abc_u64;
      assert_eq!(untag(t << 48 | low48), low48 | 0xffff_0000_0000_0000);
    }
  }
}
