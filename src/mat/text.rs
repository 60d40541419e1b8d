//! Octave plain-text format.
//!
//! The format is line-oriented and self-describing; a file is a sequence
//! of variable declarations scanned until end-of-file:
//!
//! ```text
//! # name: selected_region
//! # type: matrix
//! # rows: 2
//! # columns: 3
//!  1 3 5
//!  2 4 6
//! # name: snr
//! # type: scalar
//! 20
//! # name: cube
//! # type: matrix
//! # ndims: 3
//!  2 2 2
//!  0 1 2 3 4 5 6 7
//! ```
//!
//! Matrix values are a flat sequence read in column-major order (the
//! convention shared with the binary encodings) and transposed to
//! canonical order.  Any malformed declaration fails the whole file:
//! partially loaded metadata is worse than none.
use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context, Result};

use super::{collapse_scalar, from_col_major, MatVar};

// ── Parser ────────────────────────────────────────────────────────────────

/// Decode an Octave text buffer into named variables.
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, MatVar>> {
    let body = std::str::from_utf8(bytes).context("not valid UTF-8 text")?;
    let mut lines = body.lines().peekable();
    let mut vars = BTreeMap::new();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = comment_field(line, "name:") {
            let (name, var) = parse_variable(name, &mut lines)
                .with_context(|| format!("variable '{name}'"))?;
            vars.insert(name, var);
        } else if line.starts_with('#') {
            continue; // creator banner, trailing comments
        } else {
            bail!("unexpected content outside a declaration: {line:?}");
        }
    }
    ensure!(!vars.is_empty(), "no variable declarations found");
    Ok(vars)
}

/// Parse one declaration; the `# name:` line has already been consumed.
fn parse_variable<'a, I>(
    name: &str,
    lines: &mut std::iter::Peekable<I>,
) -> Result<(String, MatVar)>
where
    I: Iterator<Item = &'a str>,
{
    let type_line = lines.next().context("missing '# type:' line")?;
    let ty = comment_field(type_line.trim(), "type:").context("expected '# type:'")?;

    match ty {
        "scalar" => {
            let v = next_value_line(lines)?;
            let v: f64 = v.trim().parse().with_context(|| format!("bad scalar {v:?}"))?;
            Ok((name.to_string(), MatVar::Scalar(v)))
        }
        "matrix" => {
            let dims = parse_dims(lines)?;
            let want: usize = dims.iter().product();
            let mut values = Vec::with_capacity(want);
            while values.len() < want {
                let line = next_value_line(lines)?;
                for tok in line.split_whitespace() {
                    let v: f64 = tok
                        .parse()
                        .with_context(|| format!("bad matrix value {tok:?}"))?;
                    values.push(v);
                }
            }
            ensure!(
                values.len() == want,
                "expected {want} values for shape {dims:?}, got {}",
                values.len()
            );
            let arr = from_col_major(&dims, values)?;
            // 1×1 matrices collapse to scalars, matching the binary
            // decoders, so rank probing downstream sees one shape.
            Ok((name.to_string(), collapse_scalar(arr)))
        }
        other => bail!("unsupported type {other:?}"),
    }
}

/// Matrix shape: either `# rows:` + `# columns:`, or `# ndims:` followed
/// by one line holding the dimension vector.
fn parse_dims<'a, I>(lines: &mut std::iter::Peekable<I>) -> Result<Vec<usize>>
where
    I: Iterator<Item = &'a str>,
{
    let line = lines.next().context("missing shape header")?.trim();
    if let Some(rows) = comment_field(line, "rows:") {
        let rows: usize = rows.parse().context("bad row count")?;
        let cols_line = lines.next().context("missing '# columns:'")?.trim();
        let cols = comment_field(cols_line, "columns:").context("expected '# columns:'")?;
        let cols: usize = cols.parse().context("bad column count")?;
        Ok(vec![rows, cols])
    } else if let Some(ndims) = comment_field(line, "ndims:") {
        let ndims: usize = ndims.parse().context("bad ndims")?;
        let dim_line = next_value_line(lines)?;
        let dims: Vec<usize> = dim_line
            .split_whitespace()
            .map(|t| t.parse::<usize>().with_context(|| format!("bad dimension {t:?}")))
            .collect::<Result<_>>()?;
        ensure!(dims.len() == ndims, "ndims says {ndims}, dimension vector has {}", dims.len());
        Ok(dims)
    } else {
        bail!("expected '# rows:' or '# ndims:', got {line:?}")
    }
}

/// Next non-empty, non-comment line.
fn next_value_line<'a, I>(lines: &mut std::iter::Peekable<I>) -> Result<&'a str>
where
    I: Iterator<Item = &'a str>,
{
    loop {
        let line = lines.next().context("unexpected end of file")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            // A new declaration beginning here means the previous variable
            // was short on values.
            ensure!(
                comment_field(trimmed, "name:").is_none(),
                "declaration ends before its values do"
            );
            continue;
        }
        return Ok(line);
    }
}

/// `comment_field("# name: x", "name:")` → `Some("x")`.
fn comment_field<'s>(line: &'s str, key: &str) -> Option<&'s str> {
    let rest = line.strip_prefix('#')?.trim_start();
    rest.strip_prefix(key).map(str::trim)
}

// ── Writer (fixtures and diagnostics) ─────────────────────────────────────

/// Serialize variables in the same text layout the parser accepts.
///
/// Exists for test fixtures and for eyeballing small files; production
/// outputs use the binary writer in [`super::v5`].
pub fn encode(vars: &[(&str, MatVar)]) -> String {
    let mut out = String::from("# Created by spikeeg\n");
    for (name, var) in vars {
        out.push_str(&format!("# name: {name}\n"));
        match var {
            MatVar::Scalar(v) => {
                out.push_str("# type: scalar\n");
                out.push_str(&format!("{v}\n"));
            }
            MatVar::Array(arr) => {
                out.push_str("# type: matrix\n");
                let dims = arr.shape();
                let rev: Vec<usize> = (0..arr.ndim()).rev().collect();
                let flat: Vec<String> = arr
                    .view()
                    .permuted_axes(rev)
                    .iter()
                    .map(|v| format!("{v}"))
                    .collect();
                if dims.len() == 2 {
                    out.push_str(&format!("# rows: {}\n# columns: {}\n", dims[0], dims[1]));
                } else {
                    out.push_str(&format!("# ndims: {}\n", dims.len()));
                    let dim_line: Vec<String> =
                        dims.iter().map(|d| d.to_string()).collect();
                    out.push_str(&format!(" {}\n", dim_line.join(" ")));
                }
                out.push_str(&format!(" {}\n", flat.join(" ")));
            }
            MatVar::Text(s) => {
                // The text format has no char class; skip with a marker.
                out.push_str(&format!("# (text variable {s:?} omitted)\n"));
            }
        }
    }
    out
}
