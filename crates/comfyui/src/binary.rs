//! Binary WebSocket frames.
//!
//! Every binary frame starts with a big-endian `u32` event type:
//!
//! | Type | Layout after the type word                                   |
//! |------|--------------------------------------------------------------|
//! | 1    | `u32` image format (1 = JPEG, 2 = PNG), image bytes          |
//! | 2    | unencoded preview, not handled                               |
//! | 3    | text payload, not handled                                    |
//! | 4    | `u32` metadata length, UTF-8 JSON metadata, image bytes      |
//!
//! Type 4 metadata carries `prompt_id`, `node_id` and `image_type` (a MIME
//! type), which lets a preview be attributed without relying on the
//! preceding control frame.

use serde::Deserialize;

use crate::client::StreamError;

const PREVIEW_IMAGE: u32 = 1;
const UNENCODED_PREVIEW_IMAGE: u32 = 2;
const TEXT: u32 = 3;
const PREVIEW_IMAGE_WITH_METADATA: u32 = 4;

/// Encoding of a preview image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
    Webp,
    Unknown,
}

impl PreviewFormat {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Jpeg,
            2 => Self::Png,
            _ => Self::Unknown,
        }
    }

    fn from_mime(mime: &str) -> Self {
        match mime {
            "image/jpeg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/webp" => Self::Webp,
            _ => Self::Unknown,
        }
    }
}

/// A transient low-fidelity image emitted during generation.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    pub format: PreviewFormat,
    pub data: Vec<u8>,
    /// Owning prompt, when the frame carried metadata.
    pub prompt_id: Option<String>,
    pub node_id: Option<String>,
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryFrame {
    Preview(PreviewFrame),
    /// A recognised frame type this client does not use.
    Ignored(u32),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PreviewMetadata {
    prompt_id: Option<String>,
    node_id: Option<String>,
    image_type: Option<String>,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, StreamError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| {
            StreamError::MalformedFrame(format!(
                "binary frame of {} bytes truncated at offset {offset}",
                bytes.len()
            ))
        })
}

/// Decode one binary frame.
pub fn decode_binary(bytes: &[u8]) -> Result<BinaryFrame, StreamError> {
    match read_u32(bytes, 0)? {
        PREVIEW_IMAGE => {
            let format = PreviewFormat::from_code(read_u32(bytes, 4)?);
            Ok(BinaryFrame::Preview(PreviewFrame {
                format,
                data: bytes[8..].to_vec(),
                prompt_id: None,
                node_id: None,
            }))
        }
        PREVIEW_IMAGE_WITH_METADATA => {
            let len = read_u32(bytes, 4)? as usize;
            let meta_end = 8usize.checked_add(len).filter(|end| *end <= bytes.len()).ok_or_else(|| {
                StreamError::MalformedFrame(format!(
                    "metadata length {len} exceeds frame of {} bytes",
                    bytes.len()
                ))
            })?;
            let metadata: PreviewMetadata = serde_json::from_slice(&bytes[8..meta_end])
                .map_err(|e| StreamError::MalformedFrame(format!("preview metadata: {e}")))?;
            Ok(BinaryFrame::Preview(PreviewFrame {
                format: metadata
                    .image_type
                    .as_deref()
                    .map_or(PreviewFormat::Unknown, PreviewFormat::from_mime),
                data: bytes[meta_end..].to_vec(),
                prompt_id: metadata.prompt_id,
                node_id: metadata.node_id,
            }))
        }
        kind @ (UNENCODED_PREVIEW_IMAGE | TEXT) => Ok(BinaryFrame::Ignored(kind)),
        other => Err(StreamError::MalformedFrame(format!(
            "unknown binary event type {other}"
        ))),
    }
}
