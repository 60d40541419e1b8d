/// Shared fixture builders for the integration suites.
///
/// Every helper writes real on-disk files in one of the three supported
/// encodings so the tests exercise the exact code paths production data
/// takes.  The HDF5 builder emits the same minimal container layout
/// MATLAB v7.3 uses (superblock v0, root symbol table, contiguous f64
/// datasets) byte by byte.
use ndarray::{ArrayD, IxDyn};
use std::path::Path;

use spikeeg::MatVar;

#[allow(unused)]
pub fn arr(shape: &[usize], values: Vec<f64>) -> MatVar {
    MatVar::Array(ArrayD::from_shape_vec(IxDyn(shape), values).unwrap())
}

#[allow(unused)]
/// A positive-peaked spike-like clip, `(t, r)`, distinct per `phase`.
pub fn make_clip(t: usize, r: usize, phase: f64) -> ArrayD<f64> {
    ArrayD::from_shape_fn(IxDyn(&[t, r]), |ix| {
        let i = ix[0] as f64;
        let j = ix[1] as f64;
        ((i * 0.7 + j * 1.3 + phase).sin()).abs() + 0.1 + j * 0.05
    })
}

#[allow(unused)]
pub fn max_abs_diff(a: &ArrayD<f64>, b: &ArrayD<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0_f64, f64::max)
}

// ── Encoding writers ──────────────────────────────────────────────────────

#[allow(unused)]
pub fn write_v5(path: &Path, vars: &[(&str, MatVar)]) {
    spikeeg::write_mat5(path, vars).unwrap();
}

#[allow(unused)]
pub fn write_text(path: &Path, vars: &[(&str, MatVar)]) {
    std::fs::write(path, spikeeg::mat::text::encode(vars)).unwrap();
}

#[allow(unused)]
pub fn write_hdf5(path: &Path, vars: &[(&str, MatVar)]) {
    std::fs::write(path, encode_hdf5(vars)).unwrap();
}

// ── Minimal HDF5 container builder ────────────────────────────────────────
//
// Writes: superblock v0 at offset 0 → root symbol-table entry (cached
// B-tree/heap addresses) → one SNOD with every dataset → v1 object
// headers with dataspace/datatype/contiguous-layout messages → raw f64
// data.  Dimensions are stored reversed and values column-major relative
// to the logical shape, exactly as MATLAB v7.3 does.

#[allow(unused)]
const UNDEF: u64 = u64::MAX;

#[allow(unused)]
pub fn encode_hdf5(vars: &[(&str, MatVar)]) -> Vec<u8> {
    let mut sorted: Vec<(&str, &MatVar)> = vars.iter().map(|(n, v)| (*n, v)).collect();
    sorted.sort_by_key(|(n, _)| n.to_string());

    let mut out = Vec::new();

    // Superblock skeleton; B-tree/heap/object-header/EOF addresses are
    // patched in at the end.
    out.extend_from_slice(&[0x89, b'H', b'D', b'F', 0x0d, 0x0a, 0x1a, 0x0a]);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]); // versions + 8-byte sizes
    out.extend_from_slice(&4u16.to_le_bytes()); // group leaf k
    out.extend_from_slice(&16u16.to_le_bytes()); // group internal k
    out.extend_from_slice(&0u32.to_le_bytes()); // consistency flags
    out.extend_from_slice(&0u64.to_le_bytes()); // base address
    out.extend_from_slice(&UNDEF.to_le_bytes()); // free-space address
    out.extend_from_slice(&0u64.to_le_bytes()); // EOF (patched @ 40)
    out.extend_from_slice(&UNDEF.to_le_bytes()); // driver info
    out.extend_from_slice(&0u64.to_le_bytes()); // root link name offset
    out.extend_from_slice(&0u64.to_le_bytes()); // root OH address (patched @ 64)
    out.extend_from_slice(&1u32.to_le_bytes()); // cache type 1
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(&0u64.to_le_bytes()); // scratch: B-tree (patched @ 80)
    out.extend_from_slice(&0u64.to_le_bytes()); // scratch: heap (patched @ 88)
    assert_eq!(out.len(), 96);

    // Datasets: raw data first, then the object header pointing at it.
    let mut headers: Vec<(String, u64)> = Vec::new();
    for (name, var) in &sorted {
        let (dims, values): (Vec<usize>, Vec<f64>) = match var {
            MatVar::Scalar(v) => (vec![1, 1], vec![*v]),
            MatVar::Array(a) => {
                let rev: Vec<usize> = (0..a.ndim()).rev().collect();
                let flat: Vec<f64> = a.view().permuted_axes(rev).iter().copied().collect();
                (a.shape().to_vec(), flat)
            }
            MatVar::Text(_) => panic!("fixture builder only writes numeric variables"),
        };

        align8(&mut out);
        let data_addr = out.len() as u64;
        for v in &values {
            out.extend_from_slice(&v.to_le_bytes());
        }

        align8(&mut out);
        let oh_addr = out.len() as u64;
        let file_dims: Vec<u64> = dims.iter().rev().map(|&d| d as u64).collect();
        let messages = dataset_messages(&file_dims, data_addr, (values.len() * 8) as u64);
        write_object_header(&mut out, &messages);
        headers.push((name.to_string(), oh_addr));
    }

    // Local heap: an 8-byte empty slot, then nul-terminated names.
    align8(&mut out);
    let heap_addr = out.len() as u64;
    let mut blob = vec![0u8; 8];
    let mut name_offsets = Vec::new();
    for (name, _) in &headers {
        name_offsets.push(blob.len() as u64);
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
        while blob.len() % 8 != 0 {
            blob.push(0);
        }
    }
    out.extend_from_slice(b"HEAP");
    out.extend_from_slice(&[0, 0, 0, 0]); // version + reserved
    out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    out.extend_from_slice(&UNDEF.to_le_bytes()); // free list: empty
    out.extend_from_slice(&(heap_addr + 32).to_le_bytes()); // data address
    out.extend_from_slice(&blob);

    // One symbol node holding every entry, sorted by name.
    align8(&mut out);
    let snod_addr = out.len() as u64;
    out.extend_from_slice(b"SNOD");
    out.extend_from_slice(&[1, 0]); // version + reserved
    out.extend_from_slice(&(headers.len() as u16).to_le_bytes());
    for ((_, oh_addr), name_off) in headers.iter().zip(&name_offsets) {
        out.extend_from_slice(&name_off.to_le_bytes());
        out.extend_from_slice(&oh_addr.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // cache type
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.extend_from_slice(&[0u8; 16]); // scratch
    }

    // Single-leaf group B-tree over that node.
    align8(&mut out);
    let btree_addr = out.len() as u64;
    out.extend_from_slice(b"TREE");
    out.push(0); // node type: group
    out.push(0); // level: leaf
    out.extend_from_slice(&1u16.to_le_bytes()); // one child
    out.extend_from_slice(&UNDEF.to_le_bytes()); // left sibling
    out.extend_from_slice(&UNDEF.to_le_bytes()); // right sibling
    out.extend_from_slice(&0u64.to_le_bytes()); // key 0
    out.extend_from_slice(&snod_addr.to_le_bytes());
    out.extend_from_slice(&name_offsets.last().copied().unwrap_or(0).to_le_bytes());

    // Root object header (symbol-table message mirroring the scratch).
    align8(&mut out);
    let root_oh_addr = out.len() as u64;
    let mut symtab = Vec::new();
    symtab.extend_from_slice(&btree_addr.to_le_bytes());
    symtab.extend_from_slice(&heap_addr.to_le_bytes());
    write_object_header(&mut out, &[(0x0011, symtab)]);

    // Patch superblock addresses.
    let eof = out.len() as u64;
    out[40..48].copy_from_slice(&eof.to_le_bytes());
    out[64..72].copy_from_slice(&root_oh_addr.to_le_bytes());
    out[80..88].copy_from_slice(&btree_addr.to_le_bytes());
    out[88..96].copy_from_slice(&heap_addr.to_le_bytes());
    out
}

#[allow(unused)]
fn dataset_messages(file_dims: &[u64], data_addr: u64, data_size: u64) -> Vec<(u16, Vec<u8>)> {
    // Dataspace v1.
    let mut space = vec![1u8, file_dims.len() as u8, 0, 0, 0, 0, 0, 0];
    for d in file_dims {
        space.extend_from_slice(&d.to_le_bytes());
    }

    // Datatype: IEEE f64, little-endian.
    let mut dtype = vec![0x11, 0x20, 0x00, 0x00];
    dtype.extend_from_slice(&8u32.to_le_bytes()); // element size
    dtype.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    dtype.extend_from_slice(&64u16.to_le_bytes()); // bit precision
    dtype.extend_from_slice(&[52, 11, 0, 52]); // exponent/mantissa layout
    dtype.extend_from_slice(&1023u32.to_le_bytes()); // exponent bias

    // Data layout v3, contiguous.
    let mut layout = vec![3u8, 1u8];
    layout.extend_from_slice(&data_addr.to_le_bytes());
    layout.extend_from_slice(&data_size.to_le_bytes());

    vec![(0x0001, space), (0x0003, dtype), (0x0008, layout)]
}

/// v1 object header: 16-byte prefix, then 8-byte-aligned messages.
#[allow(unused)]
fn write_object_header(out: &mut Vec<u8>, messages: &[(u16, Vec<u8>)]) {
    let padded = |b: &Vec<u8>| (b.len() + 7) & !7;
    let total: usize = messages.iter().map(|(_, b)| 8 + padded(b)).sum();

    out.push(1); // version
    out.push(0); // reserved
    out.extend_from_slice(&(messages.len() as u16).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // reference count
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]); // prefix padding

    for (ty, body) in messages {
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&(padded(body) as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // flags + reserved
        out.extend_from_slice(body);
        out.extend(std::iter::repeat(0u8).take(padded(body) - body.len()));
    }
}

#[allow(unused)]
fn align8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}
