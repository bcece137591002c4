//! Static search for the compiled profile collection.
//!
//! The collection blob has no symbol and no header magic; the only code
//! that names it is the sandbox kext's initialization routine, which loads
//! the blob's address and size into registers and branches to a block that
//! panics with a known format string when setup fails. The search pivots on
//! that string: find its address, find the unique code that references it,
//! find the unique branch into that block, and read the address and size
//! out of the caller's setup instructions just before the branch.

use crate::analyze::{cross_references, window_values};
use crate::macho::MachImage;
use crate::{u64_as_usize, untag, Error, LocateStep};
use log::{debug, info};
use std::collections::BTreeMap;

/// How far (in bytes) before the failure branch the setup instructions are
/// expected to sit.
const SETUP_WINDOW: u64 = 0x20;

/// Panic format string reached when the per-boot profile data is rejected.
/// The quotes are part of the literal as embedded in the binary.
const PROFILES_PANIC: &str = "\"failed to initialize platform sandbox\"";

/// Panic format string reached when the built-in collection is rejected.
const COLLECTIONS_PANIC: &str = "\"failed to initialize collection\"";

/// Locate and read the raw profile data of the platform sandbox.
pub fn get_sandbox_profiles(m: &impl MachImage) -> Result<Vec<u8>, Error> {
  info!("searching for sandbox profile data");
  sandbox_data(m, PROFILES_PANIC)
}

/// Locate and read the raw built-in profile collection.
pub fn get_sandbox_collections(m: &impl MachImage) -> Result<Vec<u8>, Error> {
  info!("searching for sandbox collection data");
  sandbox_data(m, COLLECTIONS_PANIC)
}

/// The single key in `refs` whose value is `target`.
fn unique_ref(refs: &BTreeMap<u64, u64>, target: u64, step: LocateStep) -> Result<u64, Error> {
  let mut candidates = refs.iter().filter(|&(_, &v)| v == target).map(|(&k, _)| k);
  match (candidates.next(), candidates.next()) {
    (Some(k), None) => Ok(k),
    (None, _) => Err(Error::Locator { step, reason: "no cross-reference matches" }),
    (Some(_), Some(_)) => Err(Error::Locator { step, reason: "multiple cross-references match" }),
  }
}

fn sandbox_data(m: &impl MachImage, panic_str: &str) -> Result<Vec<u8>, Error> {
  let panic_vmaddr = m.find_c_string(panic_str).ok_or(Error::Missing("sandbox panic string"))?;
  let panic_offset =
    m.get_offset(panic_vmaddr).ok_or(Error::Missing("panic string file offset"))?;
  debug!("found {panic_str} at vmaddr {panic_vmaddr:#x} (offset {panic_offset:#x})");

  let starts = m.kext_start_vmaddrs().ok_or(Error::Missing("kext start address table"))?;
  let infos = m.kext_infos().ok_or(Error::Missing("kext info table"))?;
  let idx = infos
    .iter()
    .position(|info| info.name_contains("sandbox"))
    .ok_or(Error::Missing("sandbox kext"))?;
  let (Some(&start), Some(&end)) = (starts.get(idx), starts.get(idx + 1)) else {
    return Err(Error::Locator {
      step: LocateStep::KextBounds,
      reason: "sandbox kext has no successor to bound its code",
    });
  };
  let (start, end) = (untag(start), untag(end));
  let len = end.checked_sub(start).ok_or(Error::Locator {
    step: LocateStep::KextBounds,
    reason: "kext start addresses are not ascending",
  })?;
  let start_offset = m.get_offset(start).ok_or(Error::Missing("sandbox kext file offset"))?;
  debug!("sandbox kext code spans {start:#x}..{end:#x} (offset {start_offset:#x})");

  let mut code = vec![0; u64_as_usize(len)];
  m.read_at(&mut code, start_offset)?;

  let refs = cross_references(&code, start);

  // The scan keys an ADRP pair by its second instruction; the block the
  // failure branch lands on starts at the ADRP itself, one word earlier.
  let panic_xref = unique_ref(&refs, panic_vmaddr, LocateStep::PanicXref)? - 4;
  debug!("panic string xref {panic_xref:#x} => {panic_vmaddr:#x}");

  let fail_xref = unique_ref(&refs, panic_xref, LocateStep::FailXref)?;
  debug!("failure path xref {fail_xref:#x} => {panic_xref:#x}");

  let values = window_values(&code, start, fail_xref.saturating_sub(SETUP_WINDOW), fail_xref);
  let blob_vmaddr = values.addr.ok_or(Error::Locator {
    step: LocateStep::BlobAddress,
    reason: "no address materialization before the failure branch",
  })?;
  let blob_size = values.size.ok_or(Error::Locator {
    step: LocateStep::BlobSize,
    reason: "no size materialization before the failure branch",
  })?;
  info!("located sandbox data at {blob_vmaddr:#x} ({blob_size:#x} bytes)");

  let blob_offset = m.get_offset(blob_vmaddr).ok_or(Error::Missing("collection data file offset"))?;
  let mut blob = vec![0; u64_as_usize(blob_size)];
  m.read_at(&mut blob, blob_offset)?;
  Ok(blob)
}
