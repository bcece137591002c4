//! Extraction of the sandbox operation-name table.
//!
//! The operation names sit behind a tagged-pointer array in
//! `__DATA_CONST,__const`. There is no count and no terminator; the array
//! is recognized by its first name, the literal `"default"`, and each entry
//! promises a successor by carrying the [`TAG_CHAIN`] tag. The `i`-th name
//! collected here is the operation at index `i` of every profile record.

use crate::macho::MachImage;
use crate::{tag, untag, Error, TAG_CHAIN};
use byteorder::LE;
use zerocopy::{LayoutVerified, U64};

/// Collect the ordered operation names out of the constant pointer array.
///
/// Zero entries are skipped. Unreadable pointers are tolerated until the
/// `"default"` sentinel has been seen; after that, the first unreadable
/// pointer ends the scan, as does any entry whose tag no longer promises a
/// following pointer (that entry's name is still included).
pub fn get_sandbox_opts(m: &impl MachImage) -> Result<Vec<String>, Error> {
  let sect =
    m.section("__DATA_CONST", "__const").ok_or(Error::Missing("__DATA_CONST.__const section"))?;
  // view the section as a dense u64 array, dropping any ragged tail
  let whole = sect.data.len() - sect.data.len() % 8;
  let ptrs = LayoutVerified::<_, [U64<LE>]>::new_slice(&sect.data[..whole])
    .ok_or(Error::Missing("__DATA_CONST.__const pointer array"))?;

  let mut opts = Vec::new();
  let mut found = false;
  for ptr in ptrs.into_slice() {
    let ptr = ptr.get();
    if ptr == 0 {
      continue;
    }
    match m.get_c_string(untag(ptr)) {
      Some(s) => {
        if s == "default" {
          found = true;
        }
        if found {
          opts.push(s);
          if tag(ptr) != TAG_CHAIN {
            break;
          }
        }
      }
      None if found => break,
      None => {}
    }
  }
  Ok(opts)
}
