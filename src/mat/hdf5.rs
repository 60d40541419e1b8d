//! HDF5-container reader for MATLAB v7.3 files.
//!
//! MATLAB v7.3 stores each top-level variable as one dataset in the root
//! group of an HDF5 file (the first 512 bytes are a userblock carrying the
//! usual MAT header text, so the HDF5 superblock starts at offset 512).
//! This module implements exactly the subset needed to read those files
//! one level deep:
//!
//! ```text
//! superblock v0 ─► root symbol-table entry
//!                    ├─ local heap        (link names)
//!                    └─ v1 B-tree ─► SNOD symbol nodes ─► object headers
//!                                                           ├─ dataspace
//!                                                           ├─ datatype
//!                                                           └─ layout (contiguous/compact)
//! ```
//!
//! HDF5 stores dimensions in the reverse of MATLAB's logical order, so the
//! raw file bytes are column-major with respect to the logical shape; every
//! dataset is transposed back to canonical order on load.
//!
//! Chunked layouts, non-numeric datatypes, and nested groups are decode
//! failures for the *whole file* — partial metadata is unsafe to hand to
//! the normalizer, and the dispatch in [`super::load_mat`] treats the
//! failure as "try the next format".
use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;

use super::{collapse_scalar, from_col_major, MatVar};

const SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', 0x0d, 0x0a, 0x1a, 0x0a];
const UNDEF: u64 = u64::MAX;

// Object-header message types.
const MSG_DATASPACE: u16 = 0x0001;
const MSG_DATATYPE: u16 = 0x0003;
const MSG_LAYOUT: u16 = 0x0008;
const MSG_CONTINUATION: u16 = 0x0010;
const MSG_SYMBOL_TABLE: u16 = 0x0011;

// ── Entry point ───────────────────────────────────────────────────────────

/// Decode an HDF5 container one level deep.
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, MatVar>> {
    let base = find_superblock(bytes)?;
    let file = H5 { bytes, base };

    let sb = file.superblock()?;
    let (btree, heap) = file.root_symbol_table(&sb)?;

    let mut vars = BTreeMap::new();
    let mut snods = Vec::new();
    file.collect_snods(btree, 0, &mut snods)?;
    for snod in snods {
        file.read_snod(snod, heap, &mut vars)?;
    }
    Ok(vars)
}

/// The superblock sits at offset 0 or at any power-of-two offset ≥ 512
/// (MATLAB leaves a 512-byte userblock).
fn find_superblock(bytes: &[u8]) -> Result<usize> {
    let mut off = 0usize;
    loop {
        if off + 8 > bytes.len() {
            bail!("no HDF5 signature found");
        }
        if bytes[off..off + 8] == SIGNATURE {
            return Ok(off);
        }
        off = if off == 0 { 512 } else { off * 2 };
    }
}

// ── File view ─────────────────────────────────────────────────────────────

struct Superblock {
    root_object_header: u64,
    /// Cached (btree, heap) from the root entry scratch space, if present.
    root_scratch: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Copy)]
struct Dtype {
    class: u8,
    size: u32,
    signed: bool,
}

#[derive(Debug, Clone)]
enum Layout {
    Contiguous { addr: u64, size: u64 },
    Compact { data: Vec<u8> },
}

#[derive(Debug, Default)]
struct ObjectHeader {
    dims: Option<Vec<u64>>,
    dtype: Option<Dtype>,
    layout: Option<Layout>,
    symbol_table: Option<(u64, u64)>,
}

struct H5<'a> {
    bytes: &'a [u8],
    base: usize,
}

impl<'a> H5<'a> {
    /// Cursor positioned at a file address (relative to the superblock).
    fn at(&self, addr: u64) -> Result<Cursor<&'a [u8]>> {
        ensure!(addr != UNDEF, "undefined address");
        let pos = (self.base as u64)
            .checked_add(addr)
            .context("address overflow")?;
        ensure!((pos as usize) < self.bytes.len(), "address {addr:#x} out of bounds");
        let mut cur = Cursor::new(self.bytes);
        cur.set_position(pos);
        Ok(cur)
    }

    fn slice(&self, addr: u64, len: usize) -> Result<&'a [u8]> {
        ensure!(addr != UNDEF, "undefined address");
        let start = self
            .base
            .checked_add(addr as usize)
            .context("address overflow")?;
        ensure!(
            start.checked_add(len).is_some_and(|end| end <= self.bytes.len()),
            "{len} bytes at {addr:#x} out of bounds"
        );
        Ok(&self.bytes[start..start + len])
    }

    fn superblock(&self) -> Result<Superblock> {
        let mut cur = self.at(8)?;
        let version = cur.read_u8()?;
        ensure!(version <= 1, "superblock version {version} unsupported");
        cur.read_u8()?; // free-space version
        cur.read_u8()?; // root group version
        cur.read_u8()?; // reserved
        cur.read_u8()?; // shared-header version
        let size_offsets = cur.read_u8()?;
        let size_lengths = cur.read_u8()?;
        ensure!(
            size_offsets == 8 && size_lengths == 8,
            "only 8-byte offsets/lengths supported (got {size_offsets}/{size_lengths})"
        );
        cur.read_u8()?; // reserved
        cur.read_u16::<LittleEndian>()?; // group leaf k
        cur.read_u16::<LittleEndian>()?; // group internal k
        cur.read_u32::<LittleEndian>()?; // consistency flags
        if version == 1 {
            cur.read_u16::<LittleEndian>()?; // indexed-storage k
            cur.read_u16::<LittleEndian>()?; // reserved
        }
        cur.read_u64::<LittleEndian>()?; // base address
        cur.read_u64::<LittleEndian>()?; // free-space address
        cur.read_u64::<LittleEndian>()?; // end-of-file address
        cur.read_u64::<LittleEndian>()?; // driver-info address

        // Root group symbol table entry.
        cur.read_u64::<LittleEndian>()?; // link name offset
        let root_object_header = cur.read_u64::<LittleEndian>()?;
        let cache_type = cur.read_u32::<LittleEndian>()?;
        cur.read_u32::<LittleEndian>()?; // reserved
        let scratch_btree = cur.read_u64::<LittleEndian>()?;
        let scratch_heap = cur.read_u64::<LittleEndian>()?;
        let root_scratch =
            (cache_type == 1).then_some((scratch_btree, scratch_heap));

        Ok(Superblock { root_object_header, root_scratch })
    }

    /// B-tree and heap addresses of the root group, from the cached entry
    /// scratch or from the root object header's symbol-table message.
    fn root_symbol_table(&self, sb: &Superblock) -> Result<(u64, u64)> {
        if let Some(pair) = sb.root_scratch {
            return Ok(pair);
        }
        let header = self.object_header(sb.root_object_header)?;
        header
            .symbol_table
            .context("root object header has no symbol-table message")
    }

    /// Walk a v1 B-tree, collecting leaf children (SNOD addresses).
    fn collect_snods(&self, addr: u64, depth: usize, out: &mut Vec<u64>) -> Result<()> {
        ensure!(depth < 16, "B-tree deeper than any sane group");
        let mut cur = self.at(addr)?;
        let mut sig = [0u8; 4];
        std::io::Read::read_exact(&mut cur, &mut sig)?;
        ensure!(&sig == b"TREE", "bad B-tree signature {sig:?}");
        let node_type = cur.read_u8()?;
        ensure!(node_type == 0, "not a group B-tree (type {node_type})");
        let level = cur.read_u8()?;
        let n = cur.read_u16::<LittleEndian>()? as usize;
        cur.read_u64::<LittleEndian>()?; // left sibling
        cur.read_u64::<LittleEndian>()?; // right sibling
        for _ in 0..n {
            cur.read_u64::<LittleEndian>()?; // key: heap offset
            let child = cur.read_u64::<LittleEndian>()?;
            if level == 0 {
                out.push(child);
            } else {
                self.collect_snods(child, depth + 1, out)?;
            }
        }
        Ok(())
    }

    fn read_snod(
        &self,
        addr: u64,
        heap: u64,
        vars: &mut BTreeMap<String, MatVar>,
    ) -> Result<()> {
        let mut cur = self.at(addr)?;
        let mut sig = [0u8; 4];
        std::io::Read::read_exact(&mut cur, &mut sig)?;
        ensure!(&sig == b"SNOD", "bad symbol-node signature {sig:?}");
        cur.read_u8()?; // version
        cur.read_u8()?; // reserved
        let n = cur.read_u16::<LittleEndian>()? as usize;
        for _ in 0..n {
            let name_offset = cur.read_u64::<LittleEndian>()?;
            let object_header = cur.read_u64::<LittleEndian>()?;
            cur.read_u32::<LittleEndian>()?; // cache type
            cur.read_u32::<LittleEndian>()?; // reserved
            cur.set_position(cur.position() + 16); // scratch

            let name = self.heap_string(heap, name_offset)?;
            // MATLAB bookkeeping groups ("#refs#", "#subsystem#").
            if name.starts_with('#') {
                debug!("skipping bookkeeping entry '{name}'");
                continue;
            }
            let var = self.read_dataset(&name, object_header)?;
            vars.insert(name, var);
        }
        Ok(())
    }

    /// Nul-terminated link name from the local heap.
    fn heap_string(&self, heap: u64, offset: u64) -> Result<String> {
        let mut cur = self.at(heap)?;
        let mut sig = [0u8; 4];
        std::io::Read::read_exact(&mut cur, &mut sig)?;
        ensure!(&sig == b"HEAP", "bad local-heap signature {sig:?}");
        cur.read_u8()?; // version
        cur.set_position(cur.position() + 3); // reserved
        cur.read_u64::<LittleEndian>()?; // data segment size
        cur.read_u64::<LittleEndian>()?; // free-list head
        let data = cur.read_u64::<LittleEndian>()?;

        let start = self.base + (data + offset) as usize;
        ensure!(start < self.bytes.len(), "heap offset {offset:#x} out of bounds");
        let tail = &self.bytes[start..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .context("unterminated heap string")?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    fn read_dataset(&self, name: &str, addr: u64) -> Result<MatVar> {
        let header = self
            .object_header(addr)
            .with_context(|| format!("object header of '{name}'"))?;
        if header.symbol_table.is_some() {
            bail!("'{name}' is a nested group; only one level is supported");
        }
        let dims = header.dims.with_context(|| format!("'{name}' has no dataspace"))?;
        let dtype = header.dtype.with_context(|| format!("'{name}' has no datatype"))?;
        let layout = header.layout.with_context(|| format!("'{name}' has no data layout"))?;

        let n: u64 = dims.iter().product::<u64>().max(1);
        let expect = n * dtype.size as u64;
        let raw: &[u8] = match &layout {
            Layout::Contiguous { addr, size } => {
                ensure!(*size >= expect, "'{name}' data truncated");
                self.slice(*addr, expect as usize)?
            }
            Layout::Compact { data } => {
                ensure!(data.len() as u64 >= expect, "'{name}' compact data truncated");
                &data[..expect as usize]
            }
        };
        let values = numeric_values(dtype, raw)
            .with_context(|| format!("dataset '{name}'"))?;

        // File dims are the reverse of the logical MATLAB shape, which
        // makes the raw byte order column-major for the logical dims.
        let logical: Vec<usize> = dims.iter().rev().map(|&d| d as usize).collect();
        let arr = from_col_major(&logical, values)?;
        Ok(collapse_scalar(arr))
    }

    /// Parse a version-1 object header, following continuation blocks.
    fn object_header(&self, addr: u64) -> Result<ObjectHeader> {
        let mut cur = self.at(addr)?;
        let version = cur.read_u8()?;
        ensure!(version == 1, "object header version {version} unsupported");
        cur.read_u8()?; // reserved
        let n_messages = cur.read_u16::<LittleEndian>()? as usize;
        cur.read_u32::<LittleEndian>()?; // reference count
        let first_size = cur.read_u32::<LittleEndian>()? as u64;
        // v1 prefix is padded to 16 bytes before the first message.
        let first_start = addr + 16;

        let mut header = ObjectHeader::default();
        let mut blocks = vec![(first_start, first_size)];
        let mut seen = 0usize;
        let mut block_idx = 0;

        while block_idx < blocks.len() {
            let (start, len) = blocks[block_idx];
            block_idx += 1;
            let mut pos = start;
            let end = start + len;
            while seen < n_messages && pos + 8 <= end {
                let mut mcur = self.at(pos)?;
                let mtype = mcur.read_u16::<LittleEndian>()?;
                let msize = mcur.read_u16::<LittleEndian>()? as u64;
                mcur.read_u8()?; // flags
                mcur.set_position(mcur.position() + 3); // reserved
                let body = pos + 8;
                seen += 1;

                match mtype {
                    MSG_DATASPACE => header.dims = Some(self.parse_dataspace(body)?),
                    MSG_DATATYPE => header.dtype = Some(self.parse_datatype(body)?),
                    MSG_LAYOUT => header.layout = Some(self.parse_layout(body, msize)?),
                    MSG_CONTINUATION => {
                        let mut ccur = self.at(body)?;
                        let caddr = ccur.read_u64::<LittleEndian>()?;
                        let clen = ccur.read_u64::<LittleEndian>()?;
                        blocks.push((caddr, clen));
                    }
                    MSG_SYMBOL_TABLE => {
                        let mut scur = self.at(body)?;
                        let btree = scur.read_u64::<LittleEndian>()?;
                        let heap = scur.read_u64::<LittleEndian>()?;
                        header.symbol_table = Some((btree, heap));
                    }
                    _ => {} // attributes, fill values, mod times, …
                }
                pos = body + msize;
            }
        }
        Ok(header)
    }

    fn parse_dataspace(&self, addr: u64) -> Result<Vec<u64>> {
        let mut cur = self.at(addr)?;
        let version = cur.read_u8()?;
        let rank = cur.read_u8()? as usize;
        match version {
            1 => cur.set_position(cur.position() + 6), // flags + 5 reserved
            2 => cur.set_position(cur.position() + 2), // flags + type
            v => bail!("dataspace version {v} unsupported"),
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(cur.read_u64::<LittleEndian>()?);
        }
        Ok(dims)
    }

    fn parse_datatype(&self, addr: u64) -> Result<Dtype> {
        let mut cur = self.at(addr)?;
        let class_and_version = cur.read_u8()?;
        let class = class_and_version & 0x0F;
        let bits0 = cur.read_u8()?;
        cur.read_u8()?;
        cur.read_u8()?;
        let size = cur.read_u32::<LittleEndian>()?;
        ensure!(bits0 & 0x01 == 0, "big-endian dataset unsupported");
        ensure!(class <= 1, "datatype class {class} unsupported (numeric only)");
        // For fixed-point types bit 3 of the first bit-field is the sign.
        let signed = class == 0 && bits0 & 0x08 != 0;
        Ok(Dtype { class, size, signed })
    }

    fn parse_layout(&self, addr: u64, msize: u64) -> Result<Layout> {
        let mut cur = self.at(addr)?;
        let version = cur.read_u8()?;
        ensure!(version == 3, "data-layout version {version} unsupported");
        let class = cur.read_u8()?;
        match class {
            0 => {
                let size = cur.read_u16::<LittleEndian>()? as usize;
                ensure!(4 + size as u64 <= msize, "compact data overruns message");
                let at = cur.position() as usize;
                ensure!(at + size <= self.bytes.len(), "compact data out of bounds");
                Ok(Layout::Compact { data: self.bytes[at..at + size].to_vec() })
            }
            1 => {
                let addr = cur.read_u64::<LittleEndian>()?;
                let size = cur.read_u64::<LittleEndian>()?;
                Ok(Layout::Contiguous { addr, size })
            }
            2 => bail!("chunked storage unsupported"),
            c => bail!("layout class {c} unsupported"),
        }
    }
}

fn numeric_values(dtype: Dtype, raw: &[u8]) -> Result<Vec<f64>> {
    macro_rules! widen {
        ($t:ty, $n:expr) => {
            raw.chunks_exact($n)
                .map(|c| <$t>::from_le_bytes(c.try_into().unwrap()) as f64)
                .collect()
        };
    }
    Ok(match (dtype.class, dtype.size, dtype.signed) {
        (1, 8, _) => widen!(f64, 8),
        (1, 4, _) => widen!(f32, 4),
        (0, 1, true) => widen!(i8, 1),
        (0, 1, false) => widen!(u8, 1),
        (0, 2, true) => widen!(i16, 2),
        (0, 2, false) => widen!(u16, 2),
        (0, 4, true) => widen!(i32, 4),
        (0, 4, false) => widen!(u32, 4),
        (0, 8, true) => widen!(i64, 8),
        (0, 8, false) => widen!(u64, 8),
        (c, s, _) => bail!("numeric type class {c} size {s} unsupported"),
    })
}
