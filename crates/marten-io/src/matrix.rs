use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use marten_core::{Error, Float, Result, Shape, Tensor, MAX_ORDER};

// Matrix files — the binary tensor format
//
// A matrix file is a 4-byte magic number identifying the element type,
// followed by the dimension count, the per-dimension sizes — AT LEAST 3
// dimension fields are always written, padded with 1s for lower orders —
// and the raw element data in row-major order.
//
// Two historical numbering schemes coexist:
//
//   * the STANDARD scheme: little-endian throughout, one magic constant
//     per element type (files we write use this scheme);
//   * the "Pascal Vincent" scheme: big-endian, magic bytes
//     [0, 0, type, ndim] — the format MNIST ships in. Recognized on read.
//
// This is the one boundary in the library where errors are meant to be
// caught and recovered from: a missing file or an unknown magic is a
// normal runtime condition (try the next format), not a programming bug.

// Standard-scheme magic numbers, one per element type.
const MAGIC_F32: u32 = 0x1e3d4c51;
const MAGIC_F64: u32 = 0x1e3d4c53;
const MAGIC_I32: u32 = 0x1e3d4c54;
const MAGIC_U8: u32 = 0x1e3d4c55;
const MAGIC_I16: u32 = 0x1e3d4c56;

// Pascal Vincent scheme type bytes (third byte of the big-endian magic).
const PV_U8: u8 = 0x08;
const PV_I8: u8 = 0x09;
const PV_I16: u8 = 0x0b;
const PV_I32: u8 = 0x0c;
const PV_F32: u8 = 0x0d;
const PV_F64: u8 = 0x0e;

/// On-disk element type, decoded from either magic scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElemType {
    U8,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl ElemType {
    fn from_standard(magic: u32) -> Option<ElemType> {
        match magic {
            MAGIC_F32 => Some(ElemType::F32),
            MAGIC_F64 => Some(ElemType::F64),
            MAGIC_I32 => Some(ElemType::I32),
            MAGIC_U8 => Some(ElemType::U8),
            MAGIC_I16 => Some(ElemType::I16),
            _ => None,
        }
    }

    fn from_pascal_vincent(type_byte: u8) -> Option<ElemType> {
        match type_byte {
            PV_U8 => Some(ElemType::U8),
            PV_I8 => Some(ElemType::I8),
            PV_I16 => Some(ElemType::I16),
            PV_I32 => Some(ElemType::I32),
            PV_F32 => Some(ElemType::F32),
            PV_F64 => Some(ElemType::F64),
            _ => None,
        }
    }
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(Error::from)
}

fn read_u32_le(r: &mut impl Read) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_i32(r: &mut impl Read, big_endian: bool) -> Result<i32> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(if big_endian {
        i32::from_be_bytes(b)
    } else {
        i32::from_le_bytes(b)
    })
}

/// Read one element as f64, in the given endianness.
fn read_elem(r: &mut impl Read, ty: ElemType, big_endian: bool) -> Result<f64> {
    match ty {
        ElemType::U8 => {
            let mut b = [0u8; 1];
            read_exact(r, &mut b)?;
            Ok(b[0] as f64)
        }
        ElemType::I8 => {
            let mut b = [0u8; 1];
            read_exact(r, &mut b)?;
            Ok(b[0] as i8 as f64)
        }
        ElemType::I16 => {
            let mut b = [0u8; 2];
            read_exact(r, &mut b)?;
            let v = if big_endian {
                i16::from_be_bytes(b)
            } else {
                i16::from_le_bytes(b)
            };
            Ok(v as f64)
        }
        ElemType::I32 => {
            let v = read_i32(r, big_endian)?;
            Ok(v as f64)
        }
        ElemType::F32 => {
            let mut b = [0u8; 4];
            read_exact(r, &mut b)?;
            let v = if big_endian {
                f32::from_be_bytes(b)
            } else {
                f32::from_le_bytes(b)
            };
            Ok(v as f64)
        }
        ElemType::F64 => {
            let mut b = [0u8; 8];
            read_exact(r, &mut b)?;
            let v = if big_endian {
                f64::from_be_bytes(b)
            } else {
                f64::from_le_bytes(b)
            };
            Ok(v)
        }
    }
}

fn check_ndim(ndim: i32) -> Result<usize> {
    if ndim < 1 || ndim as usize > MAX_ORDER {
        return Err(Error::MalformedMatrix(format!(
            "dimension count {} outside 1..={}",
            ndim, MAX_ORDER
        )));
    }
    Ok(ndim as usize)
}

fn check_dim(dim: i32) -> Result<usize> {
    if dim < 1 {
        return Err(Error::MalformedMatrix(format!(
            "non-positive dimension size {}",
            dim
        )));
    }
    Ok(dim as usize)
}

/// Load a tensor from a matrix file, converting elements to `T` when the
/// on-disk type differs. Both magic schemes are recognized.
pub fn load_matrix<T: Float>(path: impl AsRef<Path>) -> Result<Tensor<T>> {
    let file = File::open(path.as_ref())?;
    let mut r = BufReader::new(file);

    let magic = read_u32_le(&mut r)?;
    let (ty, big_endian, pv_ndim) = match ElemType::from_standard(magic) {
        Some(ty) => (ty, false, None),
        None => {
            // Pascal Vincent files are big-endian: re-read the magic bytes
            // in big-endian order — [0, 0, type, ndim].
            let be = magic.to_le_bytes(); // the raw file bytes, in order
            if be[0] == 0 && be[1] == 0 {
                match ElemType::from_pascal_vincent(be[2]) {
                    Some(ty) => (ty, true, Some(be[3] as i32)),
                    None => return Err(Error::UnknownMagic { magic }),
                }
            } else {
                return Err(Error::UnknownMagic { magic });
            }
        }
    };

    // Dimension header. The standard scheme writes ndim, then
    // max(3, ndim) size fields (extra fields hold 1). Pascal Vincent
    // encodes ndim in the magic itself and writes exactly ndim sizes.
    let mut dims = Vec::new();
    match pv_ndim {
        Some(ndim) => {
            let ndim = check_ndim(ndim)?;
            for _ in 0..ndim {
                dims.push(check_dim(read_i32(&mut r, true)?)?);
            }
        }
        None => {
            let ndim = check_ndim(read_i32(&mut r, false)?)?;
            let fields = ndim.max(3);
            for i in 0..fields {
                let d = check_dim(read_i32(&mut r, false)?)?;
                if i < ndim {
                    dims.push(d);
                }
            }
        }
    }

    let shape = Shape::new(dims);
    let count = shape.elem_count();
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(T::from_f64(read_elem(&mut r, ty, big_endian)?));
    }
    Tensor::from_slice(&values, shape)
}

/// Write a tensor as a standard-scheme matrix file. At least 3 dimension
/// fields are written, padded with 1s for lower-order tensors.
pub fn save_matrix<T: Float>(tensor: &Tensor<T>, path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut w = BufWriter::new(file);

    // Element width decides the magic: f32 storage gets the float magic,
    // everything else is written as f64.
    let f32_elems = std::mem::size_of::<T>() == 4;
    let magic = if f32_elems { MAGIC_F32 } else { MAGIC_F64 };
    w.write_all(&magic.to_le_bytes())?;

    let ndim = tensor.order().max(1);
    w.write_all(&(ndim as i32).to_le_bytes())?;
    let fields = ndim.max(3);
    for i in 0..fields {
        let d = if i < tensor.order() {
            tensor.dims()[i]
        } else {
            1
        };
        w.write_all(&(d as i32).to_le_bytes())?;
    }

    for v in tensor.to_vec() {
        if f32_elems {
            w.write_all(&(v.to_f64() as f32).to_le_bytes())?;
        } else {
            w.write_all(&v.to_f64().to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Try to load a matrix; on failure hand the error to `fallback` — the
/// try-this-then-that pattern used at the I/O boundary ("try load as a
/// matrix file, else treat the path as something else").
pub fn load_matrix_or_else<T: Float>(
    path: impl AsRef<Path>,
    fallback: impl FnOnce(Error) -> Result<Tensor<T>>,
) -> Result<Tensor<T>> {
    match load_matrix(path) {
        Ok(t) => Ok(t),
        Err(e) => fallback(e),
    }
}
