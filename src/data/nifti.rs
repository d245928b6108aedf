// ============================================================
// Layer 4 — NIfTI-1 Reader / Writer
// ============================================================
// Loads `.nii` and `.nii.gz` volumes into `Volume` and writes
// predicted label maps back next to them.
//
// A NIfTI-1 file is a 348-byte header, a 4-byte extension flag,
// then raw voxels starting at `vox_offset`. Voxels are stored
// x-fastest; `Volume` keeps z fastest, so reading and writing
// both transpose.
//
// Header fields used (byte offsets):
//   0    sizeof_hdr  i32   (348, also tells us the endianness)
//   40   dim[8]      i16   (dim[0] = rank, dim[1..=3] = x, y, z)
//   70   datatype    i16
//   72   bitpix      i16
//   76   pixdim[8]   f32   (pixdim[1..=3] = voxel spacing)
//   108  vox_offset  f32
//   112  scl_slope   f32
//   116  scl_inter   f32
//   344  magic       "n+1\0"
//
// Everything else (qform/sform orientation included) is carried
// through untouched from the reference header when writing.
//
// Reference: NIfTI-1 data format, nifti1.h

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs,
    io::{Read, Write},
    path::Path,
};
use thiserror::Error;

use crate::domain::volume::Volume;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;

const DT_UINT8:   i16 = 2;
const DT_INT16:   i16 = 4;
const DT_INT32:   i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8:    i16 = 256;
const DT_UINT16:  i16 = 512;
const DT_UINT32:  i16 = 768;

#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("cannot access '{path}': {source}")]
    Io {
        path:   String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' is not a NIfTI-1 file (bad header size or magic)")]
    BadHeader(String),

    #[error("'{0}' is the header of a two-file .hdr/.img pair; only single-file .nii / .nii.gz is read")]
    PairedHeader(String),

    #[error("'{path}' uses unsupported datatype code {code}")]
    UnsupportedDatatype { path: String, code: i16 },

    #[error("'{path}' has {dims} dimensions; only 3D volumes are supported")]
    UnsupportedRank { path: String, dims: usize },

    #[error("'{path}' is truncated: expected {expected} bytes of voxel data, found {found}")]
    Truncated { path: String, expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

/// Voxel storage type used when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelKind {
    /// Label maps
    UInt8,
    /// Intensities
    Float32,
}

/// A parsed NIfTI-1 header. Keeps the raw bytes so unparsed
/// fields survive a read → write round trip.
#[derive(Debug, Clone)]
pub struct NiftiHeader {
    raw:        [u8; HEADER_SIZE],
    endian:     Endian,
    pub dim:    [i16; 8],
    pub datatype: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope:  f32,
    pub scl_inter:  f32,
}

impl NiftiHeader {
    /// A fresh little-endian header for a volume of `shape` voxels,
    /// with identity orientation.
    pub fn for_shape(shape: [usize; 3], spacing: [f32; 3]) -> Self {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
        raw[344..348].copy_from_slice(b"n+1\0");

        let mut pixdim = [1.0f32; 8];
        pixdim[1..4].copy_from_slice(&spacing);
        let mut header = Self {
            raw,
            endian: Endian::Little,
            dim: [3, shape[0] as i16, shape[1] as i16, shape[2] as i16, 1, 1, 1, 1],
            datatype: DT_FLOAT32,
            pixdim,
            vox_offset: DATA_OFFSET as f32,
            scl_slope:  1.0,
            scl_inter:  0.0,
        };
        header.sync_raw(VoxelKind::Float32);
        header
    }

    /// Voxel counts along x, y, z
    pub fn shape(&self) -> [usize; 3] {
        let d = |i: usize| if (self.dim[0] as usize) >= i { self.dim[i].max(1) as usize } else { 1 };
        [d(1), d(2), d(3)]
    }

    /// Voxel spacing along x, y, z (non-positive entries read as 1)
    pub fn spacing(&self) -> [f32; 3] {
        let p = |i: usize| if self.pixdim[i] > 0.0 { self.pixdim[i] } else { 1.0 };
        [p(1), p(2), p(3)]
    }

    fn parse(bytes: &[u8], path: &str) -> Result<Self, NiftiError> {
        if bytes.len() < HEADER_SIZE {
            return Err(NiftiError::BadHeader(path.to_string()));
        }
        let endian = if read_i32(Endian::Little, bytes) == HEADER_SIZE as i32 {
            Endian::Little
        } else if read_i32(Endian::Big, bytes) == HEADER_SIZE as i32 {
            Endian::Big
        } else {
            return Err(NiftiError::BadHeader(path.to_string()));
        };
        let magic = &bytes[344..348];
        if magic == b"ni1\0" {
            return Err(NiftiError::PairedHeader(path.to_string()));
        }
        if magic != b"n+1\0" {
            return Err(NiftiError::BadHeader(path.to_string()));
        }

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes[..HEADER_SIZE]);

        let mut dim    = [0i16; 8];
        let mut pixdim = [0f32; 8];
        for i in 0..8 {
            dim[i]    = read_i16(endian, &raw[40 + 2 * i..]);
            pixdim[i] = read_f32(endian, &raw[76 + 4 * i..]);
        }

        Ok(Self {
            raw,
            endian,
            dim,
            datatype:   read_i16(endian, &raw[70..]),
            pixdim,
            vox_offset: read_f32(endian, &raw[108..]),
            scl_slope:  read_f32(endian, &raw[112..]),
            scl_inter:  read_f32(endian, &raw[116..]),
        })
    }

    /// Rewrite the fields a writer changes, in the header's own byte order.
    fn sync_raw(&mut self, kind: VoxelKind) {
        let (datatype, bitpix) = match kind {
            VoxelKind::UInt8   => (DT_UINT8, 8),
            VoxelKind::Float32 => (DT_FLOAT32, 32),
        };
        self.datatype   = datatype;
        self.vox_offset = DATA_OFFSET as f32;
        self.scl_slope  = 1.0;
        self.scl_inter  = 0.0;

        let e = self.endian;
        for i in 0..8 {
            write_i16(e, &mut self.raw[40 + 2 * i..], self.dim[i]);
            write_f32(e, &mut self.raw[76 + 4 * i..], self.pixdim[i]);
        }
        write_i16(e, &mut self.raw[70..], datatype);
        write_i16(e, &mut self.raw[72..], bitpix);
        write_f32(e, &mut self.raw[108..], self.vox_offset);
        write_f32(e, &mut self.raw[112..], self.scl_slope);
        write_f32(e, &mut self.raw[116..], self.scl_inter);
        self.raw[344..348].copy_from_slice(b"n+1\0");
    }
}

/// Read only the header of a NIfTI file.
pub fn read_header(path: &Path) -> Result<NiftiHeader, NiftiError> {
    let bytes = read_bytes(path)?;
    NiftiHeader::parse(&bytes, &path.display().to_string())
}

/// Read a 3D NIfTI volume and its header.
pub fn read_volume(path: &Path) -> Result<(NiftiHeader, Volume), NiftiError> {
    let name   = path.display().to_string();
    let bytes  = read_bytes(path)?;
    let header = NiftiHeader::parse(&bytes, &name)?;

    let rank = header.dim[0].max(0) as usize;
    if rank < 1 || (rank > 3 && header.dim[4..=rank.min(7)].iter().any(|&d| d > 1)) {
        return Err(NiftiError::UnsupportedRank { path: name, dims: rank });
    }

    let shape = header.shape();
    let count = shape.iter().product::<usize>();
    let e     = header.endian;
    let (width, decode): (usize, Box<dyn Fn(&[u8]) -> f32>) = match header.datatype {
        DT_UINT8   => (1, Box::new(|b: &[u8]| b[0] as f32)),
        DT_INT8    => (1, Box::new(|b: &[u8]| b[0] as i8 as f32)),
        DT_INT16   => (2, Box::new(move |b: &[u8]| read_i16(e, b) as f32)),
        DT_UINT16  => (2, Box::new(move |b: &[u8]| read_u16(e, b) as f32)),
        DT_INT32   => (4, Box::new(move |b: &[u8]| read_i32(e, b) as f32)),
        DT_UINT32  => (4, Box::new(move |b: &[u8]| read_u32(e, b) as f32)),
        DT_FLOAT32 => (4, Box::new(move |b: &[u8]| read_f32(e, b))),
        DT_FLOAT64 => (8, Box::new(move |b: &[u8]| read_f64(e, b) as f32)),
        code => return Err(NiftiError::UnsupportedDatatype { path: name, code }),
    };

    let start    = (header.vox_offset as usize).max(DATA_OFFSET);
    let expected = count * width;
    let found    = bytes.len().saturating_sub(start);
    if found < expected {
        return Err(NiftiError::Truncated { path: name, expected, found });
    }

    let scale = header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0);
    let mut volume = Volume::zeros(shape, header.spacing());
    let voxels = &bytes[start..start + expected];

    // file order: x fastest, then y, then z
    let mut i = 0usize;
    for z in 0..shape[2] {
        for y in 0..shape[1] {
            for x in 0..shape[0] {
                let mut v = decode(&voxels[i * width..(i + 1) * width]);
                if scale {
                    v = v * header.scl_slope + header.scl_inter;
                }
                volume.set(x, y, z, v);
                i += 1;
            }
        }
    }

    tracing::debug!("Read '{}' shape={:?} spacing={:?}", name, shape, volume.spacing);
    Ok((header, volume))
}

/// Write `volume` using `reference` for every header field that is
/// not about voxel storage. Gzip-compressed when `path` ends in `.gz`.
pub fn write_volume(
    path:      &Path,
    reference: &NiftiHeader,
    volume:    &Volume,
    kind:      VoxelKind,
) -> Result<(), NiftiError> {
    let name = path.display().to_string();
    let mut header = reference.clone();
    let [sx, sy, sz] = volume.shape;
    header.dim = [3, sx as i16, sy as i16, sz as i16, 1, 1, 1, 1];
    header.pixdim[1..4].copy_from_slice(&volume.spacing);
    header.sync_raw(kind);

    let width = match kind { VoxelKind::UInt8 => 1, VoxelKind::Float32 => 4 };
    let mut bytes = Vec::with_capacity(DATA_OFFSET + volume.len() * width);
    bytes.extend_from_slice(&header.raw);
    bytes.extend_from_slice(&[0u8; DATA_OFFSET - HEADER_SIZE]);

    let mut buf = [0u8; 4];
    for z in 0..sz {
        for y in 0..sy {
            for x in 0..sx {
                let v = volume.get(x, y, z);
                match kind {
                    VoxelKind::UInt8 => bytes.push(v.round().clamp(0.0, 255.0) as u8),
                    VoxelKind::Float32 => {
                        write_f32(header.endian, &mut buf, v);
                        bytes.extend_from_slice(&buf);
                    }
                }
            }
        }
    }

    let io_err = |source| NiftiError::Io { path: name.clone(), source };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    if is_gzip(path) {
        let file = fs::File::create(path).map_err(io_err)?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&bytes).map_err(io_err)?;
        enc.finish().map_err(io_err)?;
    } else {
        fs::write(path, &bytes).map_err(io_err)?;
    }

    tracing::debug!("Wrote '{}' shape={:?}", name, volume.shape);
    Ok(())
}

/// File name without `.nii` / `.nii.gz`
pub fn nifti_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))?;
    Some(stem.to_string())
}

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, NiftiError> {
    let io_err = |source| NiftiError::Io { path: path.display().to_string(), source };
    let raw = fs::read(path).map_err(io_err)?;
    if !is_gzip(path) {
        return Ok(raw);
    }
    let mut out = Vec::with_capacity(raw.len() * 4);
    GzDecoder::new(raw.as_slice()).read_to_end(&mut out).map_err(io_err)?;
    Ok(out)
}

// ─── Endian-aware field access ────────────────────────────────────────────────
// `b` must hold at least size_of::<T>() bytes; callers slice from
// fixed header offsets or exact voxel chunks.
macro_rules! endian_read {
    ($name:ident, $t:ty) => {
        fn $name(e: Endian, b: &[u8]) -> $t {
            let mut arr = [0u8; std::mem::size_of::<$t>()];
            arr.copy_from_slice(&b[..std::mem::size_of::<$t>()]);
            match e {
                Endian::Little => <$t>::from_le_bytes(arr),
                Endian::Big    => <$t>::from_be_bytes(arr),
            }
        }
    };
}

macro_rules! endian_write {
    ($name:ident, $t:ty) => {
        fn $name(e: Endian, b: &mut [u8], v: $t) {
            let bytes = match e {
                Endian::Little => v.to_le_bytes(),
                Endian::Big    => v.to_be_bytes(),
            };
            b[..bytes.len()].copy_from_slice(&bytes);
        }
    };
}

endian_read!(read_i16, i16);
endian_read!(read_u16, u16);
endian_read!(read_i32, i32);
endian_read!(read_u32, u32);
endian_read!(read_f32, f32);
endian_read!(read_f64, f64);
endian_write!(write_i16, i16);
endian_write!(write_f32, f32);
