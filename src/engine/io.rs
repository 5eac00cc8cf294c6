// src/engine/io.rs
//
// I/O operations: SourceImage (in-memory or memory-mapped) and ICC profile extraction

use crate::engine::common::run_with_panic_policy;
use crate::error::CompressError;
use image::codecs::tiff::TiffDecoder;
use image::ImageDecoder;
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, ImageICC};
use memmap2::Mmap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum SourceData {
    /// In-memory upload body
    Memory(Arc<Vec<u8>>),
    /// Memory-mapped temp file (zero-copy access)
    Mapped(Arc<Mmap>),
}

/// Immutable input of one compression run.
///
/// Owned by the caller; the pipeline only ever reads the bytes. Cloning is
/// cheap (the payload is reference counted).
#[derive(Clone, Debug)]
pub struct SourceImage {
    data: SourceData,
    declared_name: String,
    mime_hint: Option<String>,
}

impl SourceImage {
    /// Wrap an in-memory upload body.
    pub fn from_bytes(
        bytes: impl Into<Vec<u8>>,
        declared_name: impl Into<String>,
        mime_hint: Option<&str>,
    ) -> Self {
        Self::from_shared(Arc::new(bytes.into()), declared_name, mime_hint)
    }

    /// Wrap an already shared buffer without copying it.
    pub fn from_shared(
        bytes: Arc<Vec<u8>>,
        declared_name: impl Into<String>,
        mime_hint: Option<&str>,
    ) -> Self {
        Self {
            data: SourceData::Memory(bytes),
            declared_name: declared_name.into(),
            mime_hint: normalize_hint(mime_hint),
        }
    }

    /// Memory-map a file from disk (e.g. a multipart temp file).
    /// The declared name is the file name component of `path`.
    pub fn from_path(path: impl AsRef<Path>, mime_hint: Option<&str>) -> Result<Self, CompressError> {
        use std::fs::File;

        let path = path.as_ref();
        let display = path.display().to_string();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompressError::file_not_found(display.clone())
            } else {
                CompressError::file_read_failed(display.clone(), e)
            }
        })?;
        let len = file
            .metadata()
            .map_err(|e| CompressError::file_read_failed(display.clone(), e))?
            .len();

        let declared_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Zero-length files cannot be mapped on every platform; they fail
        // probing anyway, so keep them in memory.
        if len == 0 {
            return Ok(Self::from_bytes(Vec::new(), declared_name, mime_hint));
        }

        // Safety: the file must not be modified while the run holds the map.
        // Upload temp files are owned by the request handler for its lifetime.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| CompressError::mmap_failed(display.clone(), e))?;

        Ok(Self {
            data: SourceData::Mapped(Arc::new(mmap)),
            declared_name,
            mime_hint: normalize_hint(mime_hint),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            SourceData::Memory(data) => data.as_slice(),
            SourceData::Mapped(mmap) => mmap.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn declared_name(&self) -> &str {
        &self.declared_name
    }

    pub fn mime_hint(&self) -> Option<&str> {
        self.mime_hint.as_deref()
    }

    /// Lowercase extension of the declared file name, if any.
    pub fn extension_hint(&self) -> Option<String> {
        Path::new(&self.declared_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }

    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.data, SourceData::Mapped(_))
    }
}

fn normalize_hint(hint: Option<&str>) -> Option<String> {
    hint.map(|h| h.trim().to_lowercase()).filter(|h| !h.is_empty())
}

/// Extract ICC profile from image data.
/// Supports JPEG (APP2 marker), PNG (iCCP chunk), WebP (ICCP chunk) and TIFF
/// (tag 34675, first IFD).
pub fn extract_icc_profile(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 12 {
        return None;
    }

    let icc_data = if data[0] == 0xFF && data[1] == 0xD8 {
        extract_icc_from_jpeg(data)?
    } else if data[..4] == [0x89, 0x50, 0x4E, 0x47] {
        extract_icc_from_png(data)?
    } else if &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        extract_icc_from_webp(data)?
    } else if data[..4] == *b"II*\0" || data[..4] == *b"MM\0*" {
        extract_icc_from_tiff(data)?
    } else {
        return None;
    };

    if validate_icc_profile(&icc_data) {
        Some(icc_data)
    } else {
        tracing::debug!(len = icc_data.len(), "dropping malformed ICC profile");
        None
    }
}

/// Validate ICC profile header.
/// ICC profiles start with a 128-byte header whose size field must match.
pub(crate) fn validate_icc_profile(icc_data: &[u8]) -> bool {
    if icc_data.len() < 128 {
        return false;
    }

    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }

    // Major version is 2, 4 or 5 in practice
    if icc_data[8] > 10 {
        return false;
    }

    // CMM type, profile class, data color space and PCS are ASCII signatures
    let printable = |range: std::ops::Range<usize>| {
        icc_data[range]
            .iter()
            .all(|&b| (32..=126).contains(&b) || b == 0)
    };
    printable(4..8) && printable(12..16) && printable(16..20) && printable(20..24)
}

pub(crate) fn extract_icc_from_jpeg(data: &[u8]) -> Option<Vec<u8>> {
    let jpeg = Jpeg::from_bytes(data.to_vec().into()).ok()?;
    jpeg.icc_profile().map(|icc| icc.to_vec())
}

pub(crate) fn extract_icc_from_png(data: &[u8]) -> Option<Vec<u8>> {
    let png = Png::from_bytes(data.to_vec().into()).ok()?;
    png.icc_profile().map(|icc| icc.to_vec())
}

pub(crate) fn extract_icc_from_webp(data: &[u8]) -> Option<Vec<u8>> {
    let webp = WebP::from_bytes(data.to_vec().into()).ok()?;
    webp.icc_profile().map(|icc| icc.to_vec())
}

// Reads only the first IFD's tags, never the strips
pub(crate) fn extract_icc_from_tiff(data: &[u8]) -> Option<Vec<u8>> {
    run_with_panic_policy("icc:tiff", || {
        let mut decoder = TiffDecoder::new(Cursor::new(data))
            .map_err(|e| CompressError::decode_failed(format!("tiff header: {e}")))?;
        decoder
            .icc_profile()
            .map_err(|e| CompressError::decode_failed(format!("tiff icc tag: {e}")))
    })
    .ok()
    .flatten()
}
