//! Face-coordinate metadata attached to detection outputs.
//!
//! JPEG outputs carry the record in an APP1 EXIF segment:
//! `ImageDescription` holds `"x,y,w,h; x,y,w,h"` and `ImageUniqueID` the source
//! digest. Every other format gets a JSON sidecar next to the image.
//!
//! Face coordinates always refer to the image as displayed, after any EXIF
//! orientation has been applied.

use crate::types::FaceRecord;
use exif::experimental::Writer;
use exif::{Field, In, Tag, Value};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use thiserror::Error;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;
const MARKER_APP2: u8 = 0xE2;
const MARKER_APP14: u8 = 0xEE;
const MARKER_APP15: u8 = 0xEF;
const MARKER_COM: u8 = 0xFE;
const MARKER_SOS: u8 = 0xDA;
const MARKER_EOI: u8 = 0xD9;
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
const ICC_HEADER: &[u8; 12] = b"ICC_PROFILE\0";
/// Largest payload a JPEG segment can hold (length field includes its own 2 bytes).
const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize - 2;

/// Suffix appended to an output file name for its sidecar.
pub const SIDECAR_SUFFIX: &str = ".faces.json";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("not a JPEG stream")]
    NotJpeg,
    #[error("JPEG stream truncated at byte {0}")]
    Truncated(usize),
    #[error("EXIF payload too large for one segment: {0} bytes")]
    SegmentTooLarge(usize),
    #[error("exif: {0}")]
    Exif(#[from] exif::Error),
    #[error("malformed face description: {0:?}")]
    Malformed(String),
    #[error("sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
}

/// Digest identifying the exact input bytes a record was produced from.
///
/// First 16 bytes of SHA-256, hex encoded (32 characters, the width of the
/// EXIF `ImageUniqueID` field).
pub fn source_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

/// Sidecar file name for an output file name.
pub fn sidecar_name(output_name: &str) -> String {
    format!("{output_name}{SIDECAR_SUFFIX}")
}

/// Return a copy of `jpeg` whose EXIF holds only `record` and the source
/// orientation.
///
/// Pre-existing EXIF, XMP, IPTC, comments and vendor segments are dropped, so
/// location and device data never reach the published file. JFIF, ICC profile
/// and Adobe colour segments are kept.
pub fn embed_exif(jpeg: &[u8], record: &FaceRecord) -> Result<Vec<u8>, MetadataError> {
    let segments = split_segments(jpeg)?;

    let tiff = encode_tiff(record, source_orientation(&segments.headers))?;
    let payload_len = EXIF_HEADER.len() + tiff.len();
    if payload_len > MAX_SEGMENT_PAYLOAD {
        return Err(MetadataError::SegmentTooLarge(payload_len));
    }

    let mut out = Vec::with_capacity(jpeg.len() + payload_len + 4);
    out.extend_from_slice(&JPEG_SOI);

    let mut inserted = false;
    for segment in &segments.headers {
        if !inserted && segment.marker != MARKER_APP0 {
            push_app1(&mut out, &tiff);
            inserted = true;
        }
        if segment.is_published() {
            out.extend_from_slice(segment.bytes);
        }
    }
    if !inserted {
        push_app1(&mut out, &tiff);
    }
    out.extend_from_slice(segments.rest);

    Ok(out)
}

/// Read a face record from a JPEG's EXIF. `Ok(None)` when no record is present.
pub fn read_exif(jpeg: &[u8]) -> Result<Option<FaceRecord>, MetadataError> {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(jpeg)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let ascii = |tag: Tag| -> Option<String> {
        let field = exif.get_field(tag, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(parts) => Some(
                parts
                    .first()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    };

    let Some(source_digest) = ascii(Tag::ImageUniqueID) else {
        return Ok(None);
    };
    let description = ascii(Tag::ImageDescription).unwrap_or_default();
    let faces = FaceRecord::parse_description(&description)
        .ok_or(MetadataError::Malformed(description))?;

    Ok(Some(FaceRecord {
        faces,
        source_digest,
    }))
}

/// Serialize a record as a sidecar document.
pub fn to_sidecar(record: &FaceRecord) -> Result<Vec<u8>, MetadataError> {
    Ok(serde_json::to_vec_pretty(record)?)
}

/// Parse a sidecar document.
pub fn from_sidecar(bytes: &[u8]) -> Result<FaceRecord, MetadataError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Orientation tag (1-8) of the first EXIF segment, if any.
fn source_orientation(headers: &[Segment<'_>]) -> Option<u16> {
    let tiff = headers.iter().find(|s| s.is_exif())?.payload().get(EXIF_HEADER.len()..)?;
    let exif = exif::Reader::new().read_raw(tiff.to_vec()).ok()?;
    let value = exif.get_field(Tag::Orientation, In::PRIMARY)?.value.get_uint(0)?;
    u16::try_from(value).ok().filter(|v| (1..=8).contains(v))
}

fn encode_tiff(record: &FaceRecord, orientation: Option<u16>) -> Result<Vec<u8>, MetadataError> {
    let description = Field {
        tag: Tag::ImageDescription,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![record.describe().into_bytes()]),
    };
    let unique_id = Field {
        tag: Tag::ImageUniqueID,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![record.source_digest.clone().into_bytes()]),
    };

    let orientation = orientation.map(|o| Field {
        tag: Tag::Orientation,
        ifd_num: In::PRIMARY,
        value: Value::Short(vec![o]),
    });

    let mut writer = Writer::new();
    writer.push_field(&description);
    writer.push_field(&unique_id);
    if let Some(orientation) = &orientation {
        writer.push_field(orientation);
    }

    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false)?;
    Ok(tiff.into_inner())
}

fn push_app1(out: &mut Vec<u8>, tiff: &[u8]) {
    // Length counts itself plus the payload.
    let len = (2 + EXIF_HEADER.len() + tiff.len()) as u16;
    out.extend_from_slice(&[0xFF, MARKER_APP1]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(tiff);
}

/// One marker segment before the scan data, including marker and length bytes.
struct Segment<'a> {
    marker: u8,
    bytes: &'a [u8],
}

impl Segment<'_> {
    /// Bytes after the marker and length.
    fn payload(&self) -> &[u8] {
        self.bytes.get(4..).unwrap_or_default()
    }

    fn is_exif(&self) -> bool {
        self.marker == MARKER_APP1 && self.payload().starts_with(EXIF_HEADER)
    }

    /// Decoding tables plus JFIF, ICC and Adobe segments; every other
    /// application segment and comment is withheld.
    fn is_published(&self) -> bool {
        match self.marker {
            MARKER_APP0 | MARKER_APP14 => true,
            MARKER_APP2 => self.payload().starts_with(ICC_HEADER),
            MARKER_APP1..=MARKER_APP15 | MARKER_COM => false,
            _ => true,
        }
    }
}

struct Segments<'a> {
    headers: Vec<Segment<'a>>,
    /// Everything from the start-of-scan marker to the end of the stream.
    rest: &'a [u8],
}

fn split_segments(jpeg: &[u8]) -> Result<Segments<'_>, MetadataError> {
    if jpeg.len() < 4 || jpeg[..2] != JPEG_SOI {
        return Err(MetadataError::NotJpeg);
    }

    let mut headers = Vec::new();
    let mut pos = 2;
    loop {
        if pos + 1 >= jpeg.len() {
            return Err(MetadataError::Truncated(pos));
        }
        if jpeg[pos] != 0xFF {
            return Err(MetadataError::NotJpeg);
        }
        let marker = jpeg[pos + 1];
        match marker {
            // Fill byte before a marker.
            0xFF => {
                pos += 1;
                continue;
            }
            MARKER_SOS | MARKER_EOI => {
                return Ok(Segments {
                    headers,
                    rest: &jpeg[pos..],
                });
            }
            _ => {}
        }

        if pos + 3 >= jpeg.len() {
            return Err(MetadataError::Truncated(pos));
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if len < 2 || end > jpeg.len() {
            return Err(MetadataError::Truncated(pos));
        }
        headers.push(Segment {
            marker,
            bytes: &jpeg[pos..end],
        });
        pos = end;
    }
}
