//! MAT level-5 binary format (MATLAB ≤ v7, Octave `-mat`, scipy `savemat`).
//!
//! On-disk layout:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ 116 B description text │ 8 B subsys │ u16 version │ "IM"   │  ← 128 B header
//! ├────────────────────────────────────────────────────────────┤
//! │ element: u32 type │ u32 size │ <size bytes, padded to 8>   │  repeated
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each top-level element is an `miMATRIX` (one named array, itself a list
//! of subelements: array flags, dimensions, name, data) or an
//! `miCOMPRESSED` wrapper holding a zlib-deflated element.  Elements whose
//! payload fits in 4 bytes use the *small data element* packing, where the
//! upper half of the type word carries the byte count.
//!
//! Numeric payloads are stored column-major; [`decode`] transposes them to
//! the canonical row-major logical order.  The writer emits uncompressed
//! `miDOUBLE`/`mxCHAR` elements readable by MATLAB, Octave, scipy, and this
//! module's own reader.
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use ndarray::ArrayD;
use tracing::debug;

use super::{collapse_scalar, from_col_major, MatVar};

// ── Data element types (mi*) ──────────────────────────────────────────────

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;
const MI_UTF8: u32 = 16;
const MI_UTF16: u32 = 17;

// ── Array classes (mx*) ───────────────────────────────────────────────────

const MX_CHAR: u32 = 4;
const MX_DOUBLE: u32 = 6;
const MX_UINT64: u32 = 15;

const HEADER_LEN: usize = 128;
const VERSION_V5: u16 = 0x0100;

// ── Decoder ───────────────────────────────────────────────────────────────

/// Decode a MAT level-5 byte buffer into named variables.
///
/// Fails fast on foreign magic: HDF5 containers (v7.3) carry version
/// `0x0200` in the same header slot and are rejected here so the dispatch
/// can hand them to the container decoder.
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, MatVar>> {
    ensure!(bytes.len() >= HEADER_LEN, "shorter than a MAT v5 header");
    // Level-4 files begin with a binary zero; level-5 headers are text.
    ensure!(bytes[0] != 0, "level-4 MAT file (or not a MAT file at all)");

    match &bytes[126..128] {
        b"IM" => {}
        b"MI" => bail!("big-endian MAT file; only little-endian is supported"),
        other => bail!("bad endian indicator {other:?}"),
    }
    let version = u16::from_le_bytes([bytes[124], bytes[125]]);
    ensure!(
        version == VERSION_V5,
        "MAT header version {version:#06x} is not level 5"
    );

    let mut vars = BTreeMap::new();
    decode_elements(&bytes[HEADER_LEN..], &mut vars)?;
    Ok(vars)
}

/// Walk a buffer of top-level elements, inflating `miCOMPRESSED` wrappers.
fn decode_elements(buf: &[u8], vars: &mut BTreeMap<String, MatVar>) -> Result<()> {
    let mut cur = Cursor::new(buf);
    while (cur.position() as usize) < buf.len() {
        let (ty, data) = read_element(&mut cur, buf)?;
        match ty {
            MI_MATRIX => {
                if let Some((name, var)) = parse_matrix(data)? {
                    vars.insert(name, var);
                }
            }
            MI_COMPRESSED => {
                let mut inflated = Vec::new();
                ZlibDecoder::new(data)
                    .read_to_end(&mut inflated)
                    .context("inflating miCOMPRESSED element")?;
                decode_elements(&inflated, vars)?;
            }
            other => {
                debug!("skipping top-level element of type {other}");
            }
        }
    }
    Ok(())
}

/// Read one tagged element, handling the small-data-element packing.
/// Returns the element type and its payload slice; leaves the cursor on
/// the next 8-byte boundary.
fn read_element<'a>(cur: &mut Cursor<&[u8]>, buf: &'a [u8]) -> Result<(u32, &'a [u8])> {
    let ty_raw = cur.read_u32::<LittleEndian>().context("element tag")?;
    if ty_raw >> 16 != 0 {
        // Small data element: type in the low half, size in the high half,
        // payload packed into the remaining 4 tag bytes.
        let ty = ty_raw & 0xFFFF;
        let size = (ty_raw >> 16) as usize;
        ensure!(size <= 4, "small element claims {size} bytes");
        let start = cur.position() as usize;
        ensure!(start + 4 <= buf.len(), "small element overruns buffer");
        cur.set_position((start + 4) as u64);
        return Ok((ty, &buf[start..start + size]));
    }
    let size = cur.read_u32::<LittleEndian>().context("element size")? as usize;
    let start = cur.position() as usize;
    ensure!(start + size <= buf.len(), "element of {size} bytes overruns buffer");
    let padded = (size + 7) & !7;
    cur.set_position((start + padded.min(buf.len() - start)) as u64);
    Ok((ty_raw, &buf[start..start + size]))
}

/// Parse one `miMATRIX` body into `(name, value)`.
///
/// Returns `None` for array classes this pipeline never uses (cell,
/// struct, object, sparse); those are skipped, not errors.
fn parse_matrix(body: &[u8]) -> Result<Option<(String, MatVar)>> {
    let mut cur = Cursor::new(body);

    let (ty, flags_data) = read_element(&mut cur, body)?;
    ensure!(ty == MI_UINT32 && flags_data.len() >= 8, "bad array-flags subelement");
    let flags = u32::from_le_bytes(flags_data[0..4].try_into().unwrap());
    let class = flags & 0xFF;
    let complex = flags & 0x0800 != 0;

    let (ty, dims_data) = read_element(&mut cur, body)?;
    ensure!(ty == MI_INT32, "bad dimensions subelement (type {ty})");
    let dims: Vec<usize> = dims_data
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .map(|d| usize::try_from(d).context("negative dimension"))
        .collect::<Result<_>>()?;
    ensure!(!dims.is_empty(), "empty dimension vector");

    let (ty, name_data) = read_element(&mut cur, body)?;
    ensure!(ty == MI_INT8, "bad name subelement (type {ty})");
    let name = String::from_utf8_lossy(name_data).into_owned();

    match class {
        MX_CHAR => {
            let (ty, data) = read_element(&mut cur, body)?;
            let text = decode_chars(ty, data)?;
            Ok(Some((name, MatVar::Text(text))))
        }
        MX_DOUBLE..=MX_UINT64 => {
            let (ty, data) = read_element(&mut cur, body)?;
            let values = numeric_values(ty, data)?;
            if complex {
                // Imaginary part follows; this pipeline is real-valued, so
                // it is left unread.
                debug!("array '{name}' is complex; keeping real part only");
            }
            let arr = from_col_major(&dims, values)
                .with_context(|| format!("array '{name}'"))?;
            Ok(Some((name, collapse_scalar(arr))))
        }
        other => {
            debug!("skipping array '{name}' of unsupported class {other}");
            Ok(None)
        }
    }
}

/// Widen any numeric payload to f64.  MATLAB freely narrows double arrays
/// to smaller integer types on disk when the values fit, so the storage
/// type is independent of the array class.
fn numeric_values(ty: u32, data: &[u8]) -> Result<Vec<f64>> {
    macro_rules! widen {
        ($t:ty, $n:expr) => {
            data.chunks_exact($n)
                .map(|c| <$t>::from_le_bytes(c.try_into().unwrap()) as f64)
                .collect()
        };
    }
    Ok(match ty {
        MI_DOUBLE => widen!(f64, 8),
        MI_SINGLE => widen!(f32, 4),
        MI_INT8 => widen!(i8, 1),
        MI_UINT8 => widen!(u8, 1),
        MI_INT16 => widen!(i16, 2),
        MI_UINT16 => widen!(u16, 2),
        MI_INT32 => widen!(i32, 4),
        MI_UINT32 => widen!(u32, 4),
        MI_INT64 => widen!(i64, 8),
        MI_UINT64 => widen!(u64, 8),
        other => bail!("unsupported numeric element type {other}"),
    })
}

fn decode_chars(ty: u32, data: &[u8]) -> Result<String> {
    let units: Vec<u32> = match ty {
        MI_UINT16 | MI_UTF16 => data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()) as u32)
            .collect(),
        MI_UINT8 | MI_INT8 | MI_UTF8 => data.iter().map(|&b| b as u32).collect(),
        other => bail!("unsupported char element type {other}"),
    };
    Ok(units
        .into_iter()
        .filter(|&u| u != 0)
        .map(|u| char::from_u32(u).unwrap_or('\u{FFFD}'))
        .collect())
}

// ── Writer ────────────────────────────────────────────────────────────────

/// Serialize variables to an uncompressed MAT level-5 file.
///
/// Arrays are written as `mxDOUBLE`, text as `mxCHAR`; scalars become 1×1
/// matrices, which is how every MAT writer represents them.
pub fn write_mat5<P: AsRef<Path>>(path: P, vars: &[(&str, MatVar)]) -> std::io::Result<()> {
    let mut out = Vec::new();
    write_header(&mut out);
    for (name, var) in vars {
        write_var(&mut out, name, var);
    }
    std::fs::write(path, out)
}

fn write_header(out: &mut Vec<u8>) {
    let text = b"MATLAB 5.0 MAT-file, written by spikeeg";
    let mut header = [b' '; 116];
    header[..text.len()].copy_from_slice(text);
    out.extend_from_slice(&header);
    out.extend_from_slice(&[0u8; 8]); // subsystem data offset: none
    out.write_u16::<LittleEndian>(VERSION_V5).unwrap();
    out.extend_from_slice(b"IM");
}

fn write_var(out: &mut Vec<u8>, name: &str, var: &MatVar) {
    let mut body = Vec::new();
    match var {
        MatVar::Scalar(v) => {
            write_numeric_subelements(&mut body, name, &[1, 1], &[*v]);
        }
        MatVar::Array(arr) => {
            write_numeric_subelements(&mut body, name, arr.shape(), &col_major_values(arr));
        }
        MatVar::Text(s) => {
            let units: Vec<u8> = s
                .chars()
                .flat_map(|c| (c as u32 as u16).to_le_bytes())
                .collect();
            write_flags_dims_name(&mut body, MX_CHAR, &[1, s.chars().count()], name);
            write_element(&mut body, MI_UINT16, &units);
        }
    }
    write_element(out, MI_MATRIX, &body);
}

fn write_numeric_subelements(body: &mut Vec<u8>, name: &str, dims: &[usize], values: &[f64]) {
    write_flags_dims_name(body, MX_DOUBLE, dims, name);
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    write_element(body, MI_DOUBLE, &bytes);
}

fn write_flags_dims_name(body: &mut Vec<u8>, class: u32, dims: &[usize], name: &str) {
    let mut flags = Vec::new();
    flags.write_u32::<LittleEndian>(class).unwrap();
    flags.write_u32::<LittleEndian>(0).unwrap();
    write_element(body, MI_UINT32, &flags);

    let mut dim_bytes = Vec::new();
    for &d in dims {
        dim_bytes.write_i32::<LittleEndian>(d as i32).unwrap();
    }
    write_element(body, MI_INT32, &dim_bytes);

    write_element(body, MI_INT8, name.as_bytes());
}

/// Write a full (non-small) tagged element with 8-byte payload padding.
fn write_element(out: &mut Vec<u8>, ty: u32, data: &[u8]) {
    out.write_u32::<LittleEndian>(ty).unwrap();
    out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
    out.extend_from_slice(data);
    let pad = (8 - data.len() % 8) % 8;
    out.extend(std::iter::repeat(0u8).take(pad));
}

/// Flatten an array in column-major order (the on-disk convention).
fn col_major_values(arr: &ArrayD<f64>) -> Vec<f64> {
    let rev: Vec<usize> = (0..arr.ndim()).rev().collect();
    arr.view().permuted_axes(rev).iter().copied().collect()
}
