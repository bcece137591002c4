//! Decoder for the compiled profile collection.
//!
//! The blob is packed little-endian. A fixed header gives the table
//! counts; three arrays of `u16` offsets (regexes, global variables,
//! messages) and the fixed-size profile records follow immediately. After
//! the records, an alignment-padded table of op-node offsets leads to the
//! op-node slots themselves, and everything named — profile names, global
//! strings, regex bytecodes — is reached by seeking to
//! `base_addr + 8 * offset`, where `base_addr` is the end of the op-node
//! slots. Named objects are a `u16` length followed by that many bytes.

use crate::Error;
use byteorder::{WriteBytesExt, LE};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use zerocopy::{LayoutVerified, U16};

/// Size of the serialized collection header in bytes.
pub const HEADER_SIZE: usize = 12;

/// The fixed header at the start of a collection blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionHeader {
  /// Format version.
  pub version: u16,
  /// Number of 8-byte op-node slots.
  pub op_node_size: u16,
  /// Operations per profile.
  pub op_count: u8,
  /// Number of global variable strings.
  pub global_var_count: u8,
  /// Number of profiles.
  pub profile_count: u16,
  /// Number of regex table entries.
  pub regex_item_count: u16,
  /// Number of message table entries.
  pub msg_item_count: u16,
}

impl CollectionHeader {
  fn parse(r: &mut Blob<'_>) -> Result<Self, Error> {
    Ok(CollectionHeader {
      version: r.read_u16("collection version")?,
      op_node_size: r.read_u16("op node size")?,
      op_count: r.read_u8("operation count")?,
      global_var_count: r.read_u8("global variable count")?,
      profile_count: r.read_u16("profile count")?,
      regex_item_count: r.read_u16("regex item count")?,
      msg_item_count: r.read_u16("message item count")?,
    })
  }

  /// Serialize the header back to its 12-byte wire form.
  pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
    w.write_u16::<LE>(self.version)?;
    w.write_u16::<LE>(self.op_node_size)?;
    w.write_u8(self.op_count)?;
    w.write_u8(self.global_var_count)?;
    w.write_u16::<LE>(self.profile_count)?;
    w.write_u16::<LE>(self.regex_item_count)?;
    w.write_u16::<LE>(self.msg_item_count)
  }
}

/// One named operation inside a profile.
#[derive(Debug, Clone)]
pub struct SandboxOperation {
  /// The operation name, from the external opcode list.
  pub name: String,
  /// Index into the op-node table.
  pub index: u16,
  /// The op-node value the index resolves to.
  pub value: u64,
}

/// A single profile of a collection.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
  /// Profile name, trailing NULs stripped.
  pub name: String,
  /// Profile format version.
  pub version: u16,
  /// One entry per operation, in opcode-list order.
  pub operations: Vec<SandboxOperation>,
}

impl fmt::Display for SandboxProfile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "[+] {}, version: {}", self.name, self.version)?;
    for o in &self.operations {
      writeln!(f, "  name: {}, index: {:#x}, value: {:#016x}", o.name, o.index, o.value)?;
    }
    Ok(())
  }
}

/// The decoded contents of a profile collection. Owns all of its strings
/// and bytes; the input blob can be dropped once parsing returns.
#[derive(Debug, Default)]
pub struct Sandbox {
  /// The collection header as read.
  pub header: CollectionHeader,
  /// Global variable strings, keyed by their scaled table offset.
  pub globals: HashMap<u16, String>,
  /// Regular-expression bytecodes, keyed by their scaled table offset.
  pub regexes: HashMap<u16, Vec<u8>>,
  /// Op-node values, keyed by their table offset.
  pub op_nodes: HashMap<u16, u64>,
  /// The profiles, in collection order.
  pub profiles: Vec<SandboxProfile>,
}

impl fmt::Display for Sandbox {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} profiles, {} op nodes, {} globals, {} regexes",
      self.profiles.len(),
      self.op_nodes.len(),
      self.globals.len(),
      self.regexes.len()
    )
  }
}

/// A bounds-checked little-endian cursor over the blob. Every read names
/// the field being decoded, so a short read surfaces as [`Error::Decode`]
/// with the position it happened at.
#[derive(Debug)]
struct Blob<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> Blob<'a> {
  fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  fn seek(&mut self, pos: usize) {
    self.pos = pos;
  }

  fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], Error> {
    let end = self
      .pos
      .checked_add(n)
      .filter(|&end| end <= self.data.len())
      .ok_or(Error::Decode { field, position: self.pos })?;
    let bytes = &self.data[self.pos..end];
    self.pos = end;
    Ok(bytes)
  }

  fn read_u8(&mut self, field: &'static str) -> Result<u8, Error> {
    Ok(self.take(1, field)?[0])
  }

  fn read_u16(&mut self, field: &'static str) -> Result<u16, Error> {
    let b = self.take(2, field)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
  }

  fn read_u64(&mut self, field: &'static str) -> Result<u64, Error> {
    let b = self.take(8, field)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
  }

  fn read_u16_slice(&mut self, n: usize, field: &'static str) -> Result<Vec<u16>, Error> {
    let position = self.pos;
    let bytes = self.take(2 * n, field)?;
    let vals = LayoutVerified::<_, [U16<LE>]>::new_slice(bytes)
      .ok_or(Error::Decode { field, position })?;
    Ok(vals.into_slice().iter().map(|v| v.get()).collect())
  }

  /// A length-prefixed string: `u16` length, then bytes, trailing NULs
  /// stripped.
  fn read_string(&mut self, field: &'static str) -> Result<String, Error> {
    let len = self.read_u16(field)?;
    let bytes = self.take(len.into(), field)?;
    Ok(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
  }
}

/// Alignment rule for the op-node table. The mask is `6`, not `7`: bit 0
/// of the position is ignored, so positions that are 2-aligned but odd are
/// left unpadded. This is a quirk of the format and must be preserved.
fn align_op_nodes(pos: usize) -> usize {
  let rem = pos & 6;
  if rem == 0 {
    pos
  } else {
    pos + (8 - rem)
  }
}

/// Decode a profile collection blob against the external opcode list.
///
/// `ops_list` names the operation at each profile index (see
/// [`get_sandbox_opts`](crate::get_sandbox_opts)); it must cover at least
/// the header's per-profile operation count.
pub fn parse_sandbox_collection(data: &[u8], ops_list: &[String]) -> Result<Sandbox, Error> {
  let mut r = Blob::new(data);
  let header = CollectionHeader::parse(&mut r)?;

  let regex_offsets = r.read_u16_slice(header.regex_item_count.into(), "regex offsets")?;
  let global_offsets = r.read_u16_slice(header.global_var_count.into(), "global variable offsets")?;
  // Read for position accounting; message strings are not materialized.
  let _msg_offsets = r.read_u16_slice(header.msg_item_count.into(), "message offsets")?;

  let op_count = usize::from(header.op_count);
  if ops_list.len() < op_count {
    return Err(Error::Invariant("operation list is shorter than the per-profile operation count"));
  }

  let profile_size = 2 * (op_count + 2);
  debug!("profile size: {profile_size}");

  let global_var_start = HEADER_SIZE + 2 * usize::from(header.regex_item_count);
  let global_var_end = global_var_start + 2 * usize::from(header.global_var_count);
  debug!("global var start: {global_var_start:#x}, end: {global_var_end:#x}");

  let op_node_start = align_op_nodes(
    global_var_end
      + 2 * usize::from(header.msg_item_count)
      + profile_size * usize::from(header.profile_count),
  );
  let base_addr = op_node_start + 8 * usize::from(header.op_node_size);
  debug!("op node start: {op_node_start:#x}, named object base: {base_addr:#x}");

  let mut profile_datas = Vec::with_capacity(usize::from(header.profile_count));
  for _ in 0..header.profile_count {
    profile_datas.push(r.take(profile_size, "profile record")?);
  }

  let mut profiles = Vec::with_capacity(profile_datas.len());
  for prof in profile_datas {
    let mut pr = Blob::new(prof);
    let name_offset = pr.read_u16("profile name offset")?;
    let version = pr.read_u16("profile version")?;
    let mut operations = Vec::with_capacity(op_count);
    for name in &ops_list[..op_count] {
      let index = pr.read_u16("operation node index")?;
      operations.push(SandboxOperation { name: name.clone(), index, value: 0 });
    }
    r.seek(base_addr + 8 * usize::from(name_offset));
    let name = r.read_string("profile name")?;
    profiles.push(SandboxProfile { name, version, operations });
  }

  r.seek(op_node_start);
  let op_node_count = usize::from(header.op_node_size);
  let op_node_offsets = r.read_u16_slice(op_node_count, "op node offsets")?;
  let mut op_nodes = HashMap::with_capacity(op_node_count);
  let mut positional = Vec::with_capacity(op_node_count);
  for off in op_node_offsets {
    r.seek(off.into());
    let value = r.read_u64("op node value")?;
    positional.push(value);
    op_nodes.insert(off, value);
  }

  for prof in &mut profiles {
    for op in &mut prof.operations {
      op.value = *positional
        .get(usize::from(op.index))
        .ok_or(Error::Invariant("operation references an op node outside the table"))?;
    }
  }

  let mut globals = HashMap::with_capacity(global_offsets.len());
  for goff in global_offsets {
    r.seek(base_addr + 8 * usize::from(goff));
    globals.insert(goff, r.read_string("global variable")?);
  }

  let mut regexes = HashMap::with_capacity(regex_offsets.len());
  for roff in regex_offsets {
    let location = base_addr + 8 * usize::from(roff);
    r.seek(location);
    let len = r.read_u16("regex length")?;
    let bytes = r.take(len.into(), "regex bytecode")?;
    debug!("regex at offset {roff:#x}, location {location:#x}, length {len:#x}");
    regexes.insert(roff, bytes.to_vec());
  }

  Ok(Sandbox { header, globals, regexes, op_nodes, profiles })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn op_node_alignment_mask_is_six() {
    // 0x18 & 6 == 0: already placed
    assert_eq!(align_op_nodes(0x18), 0x18);
    // 0x1a & 6 == 2: padded by 6
    assert_eq!(align_op_nodes(0x1a), 0x20);
    // bit 0 is ignored, so odd-but-2-aligned positions stay put
    assert_eq!(align_op_nodes(0x19), 0x19);
    for x in 0..64 {
      let a = align_op_nodes(x);
      assert_eq!(a & 6, 0, "align({x}) = {a} should clear bits 1-2");
      assert_eq!(a == x, x & 6 == 0);
      assert!(a >= x && a - x < 8);
    }
  }

  #[test]
  fn header_parse_and_write_round_trip() {
    let bytes =
      [0x01, 0x00, 0x04, 0x00, 0x02, 0x01, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00];
    let header = CollectionHeader::parse(&mut Blob::new(&bytes)).unwrap();
    assert_eq!(
      header,
      CollectionHeader {
        version: 1,
        op_node_size: 4,
        op_count: 2,
        global_var_count: 1,
        profile_count: 1,
        regex_item_count: 1,
        msg_item_count: 0,
      }
    );
    let mut out = Vec::new();
    header.write_to(&mut out).unwrap();
    assert_eq!(out, bytes);
  }

  #[test]
  fn short_header_reports_the_field() {
    let err = parse_sandbox_collection(&[0x01, 0x00, 0x04], &[]).unwrap_err();
    assert!(
      matches!(err, Error::Decode { field: "op node size", position: 2 }),
      "unexpected error {err:?}"
    );
  }
}
