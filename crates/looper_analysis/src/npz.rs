//! `.npy` / `.npz` codec for float arrays.
//!
//! Artifacts are written as NumPy archives so they stay readable by the
//! existing `np.load` tooling: a zip of `arr_N.npy` members, each a v1.0
//! `.npy` file holding little-endian `f64` data in C order.

use crate::error::NpzError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;

/// A dense float array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NpyArray {
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Row-major 2-D array. `data.len()` must equal `rows * cols`.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self {
            shape: vec![rows, cols],
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encode one array as a `.npy` byte buffer.
pub fn encode_npy(array: &NpyArray) -> Vec<u8> {
    let shape = match array.shape.as_slice() {
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape
    );
    // magic(6) + version(2) + header_len(2) + header + '\n' must be aligned
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + padding + array.data.len() * 8);
    out.extend_from_slice(NPY_MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in &array.data {
        // Writing into a Vec cannot fail
        let _ = out.write_f64::<LittleEndian>(*value);
    }
    out
}

/// Decode a `.npy` stream.
pub fn decode_npy<R: Read>(reader: &mut R) -> Result<NpyArray, NpzError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        return Err(NpzError::Header("bad magic".to_string()));
    }
    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        other => return Err(NpzError::Header(format!("unsupported version {}", other))),
    };
    let mut header = Vec::new();
    reader.by_ref().take(header_len as u64).read_to_end(&mut header)?;
    if header.len() != header_len {
        return Err(NpzError::Header("truncated header".to_string()));
    }
    let header = String::from_utf8_lossy(&header);

    let descr = header_value(&header, "descr")
        .and_then(|v| v.strip_prefix('\'').and_then(|v| v.split('\'').next()))
        .ok_or_else(|| NpzError::Header("missing descr".to_string()))?
        .to_string();
    let fortran = header_value(&header, "fortran_order")
        .map(|v| v.starts_with("True"))
        .unwrap_or(false);
    let shape = parse_shape(&header)?;
    if fortran && shape.len() > 1 {
        return Err(NpzError::Header("fortran-ordered arrays are not supported".to_string()));
    }

    let width = match descr.as_str() {
        "<f8" => 8,
        "<f4" => 4,
        other => return Err(NpzError::UnsupportedDtype(other.to_string())),
    };
    // Sized by the bytes actually present, not by the header alone
    let needed = shape
        .iter()
        .try_fold(width, |acc: usize, &dim| acc.checked_mul(dim))
        .ok_or_else(|| NpzError::Header(format!("shape {:?} is too large", shape)))?;
    let mut payload = Vec::new();
    reader.by_ref().take(needed as u64).read_to_end(&mut payload)?;
    if payload.len() != needed {
        return Err(NpzError::Header(format!(
            "shape {:?} needs {} data bytes, found {}",
            shape,
            needed,
            payload.len()
        )));
    }

    let mut cursor = payload.as_slice();
    let mut data = Vec::with_capacity(needed / width);
    while !cursor.is_empty() {
        let value = if width == 8 {
            cursor.read_f64::<LittleEndian>()?
        } else {
            cursor.read_f32::<LittleEndian>()? as f64
        };
        data.push(value);
    }

    Ok(NpyArray { shape, data })
}

fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    Some(header[start..].trim_start())
}

fn parse_shape(header: &str) -> Result<Vec<usize>, NpzError> {
    let value = header_value(header, "shape")
        .ok_or_else(|| NpzError::Header("missing shape".to_string()))?;
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.split(')').next())
        .ok_or_else(|| NpzError::Header(format!("malformed shape: {}", value)))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpzError::Header(format!("bad dimension '{}'", s)))
        })
        .collect()
}

/// Write arrays as `arr_0.npy`, `arr_1.npy`, ... into a `.npz` archive.
///
/// The archive is written to a temporary sibling and renamed into place, so
/// readers never observe a partial artifact.
pub fn write_npz(path: &Path, arrays: &[&NpyArray]) -> Result<(), NpzError> {
    let tmp_path = temp_sibling(path);
    let result = write_npz_inner(&tmp_path, arrays).and_then(|()| {
        fs::rename(&tmp_path, path)?;
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_npz_inner(path: &Path, arrays: &[&NpyArray]) -> Result<(), NpzError> {
    let file = File::create(path)?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    for (idx, array) in arrays.iter().enumerate() {
        let bytes = encode_npy(array);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(bytes.len() as u64 >= u32::MAX as u64);
        zip.start_file(format!("arr_{}.npy", idx), options)?;
        zip.write_all(&bytes)?;
    }
    let writer = zip.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| NpzError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Read every `arr_N.npy` member, in index order.
pub fn read_npz(path: &Path) -> Result<Vec<NpyArray>, NpzError> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let mut arrays = Vec::new();
    loop {
        let name = format!("arr_{}.npy", arrays.len());
        let mut member = match archive.by_name(&name) {
            Ok(member) => member,
            Err(zip::result::ZipError::FileNotFound) => break,
            Err(e) => return Err(e.into()),
        };
        arrays.push(decode_npy(&mut member)?);
    }
    if arrays.is_empty() {
        return Err(NpzError::MissingArray("arr_0".to_string()));
    }
    Ok(arrays)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}
