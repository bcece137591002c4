//! The Mach-O lookups consumed by the search.
//!
//! Kernelcache bookkeeping (load commands, prelink info, chained fixups)
//! lives with the image reader, not here. The locator and the opcode-name
//! extractor only need the handful of queries below, so they are modeled as
//! a capability trait; tests satisfy it with a synthetic image.

use std::io;

/// A section's contents together with its load address.
#[derive(Debug, Clone)]
pub struct Section {
  /// Virtual address the section is mapped at.
  pub addr: u64,
  /// Section size in bytes.
  pub size: u64,
  /// The section's raw bytes.
  pub data: Vec<u8>,
}

/// A prelinked kext info record.
#[derive(Debug, Clone)]
pub struct KextInfo {
  /// The kext's bundle identifier, fixed-width and NUL-padded.
  pub name: Box<[u8]>,
}

impl KextInfo {
  /// Whether the bundle identifier contains `needle`.
  #[must_use]
  pub fn name_contains(&self, needle: &str) -> bool {
    String::from_utf8_lossy(&self.name).contains(needle)
  }
}

/// The kernelcache queries the search consumes.
///
/// All addresses are virtual addresses as loaded; implementations are
/// expected to resolve them against the image's segment table. Lookup
/// methods return `None` for "not present" — the callers decide which
/// misses are fatal.
pub trait MachImage {
  /// Look up a section by segment and section name.
  fn section(&self, segname: &str, sectname: &str) -> Option<Section>;

  /// Read the NUL-terminated string mapped at `vmaddr`.
  fn get_c_string(&self, vmaddr: u64) -> Option<String>;

  /// Translate a virtual address to an offset in the backing file.
  fn get_offset(&self, vmaddr: u64) -> Option<u64>;

  /// Fill `buf` with the bytes starting at `offset` in the backing file.
  fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

  /// Find the virtual address of an exact C-string literal.
  fn find_c_string(&self, literal: &str) -> Option<u64>;

  /// Load addresses of the prelinked kexts, in layout order. The entries
  /// may be tagged.
  fn kext_start_vmaddrs(&self) -> Option<Vec<u64>>;

  /// Info records of the prelinked kexts, parallel to
  /// [`kext_start_vmaddrs`](Self::kext_start_vmaddrs).
  fn kext_infos(&self) -> Option<Vec<KextInfo>>;
}
