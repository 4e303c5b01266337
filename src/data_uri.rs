//! Inline `data:<mime>;base64,<payload>` image strings.

use crate::config::ImageFormat;
use crate::errors::{CaptureError, Result};
use base64::Engine;

/// Prefix every captured PNG figure carries
pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// First bytes of every PNG file
pub const PNG_MAGIC: &[u8] = b"\x89PNG";

/// Encode raw image bytes as a self-contained data URI
pub fn encode(format: ImageFormat, bytes: &[u8]) -> String {
    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", format.mime_type(), data)
}

/// Shorthand for [`encode`] with [`ImageFormat::Png`]
pub fn encode_png(bytes: &[u8]) -> String {
    encode(ImageFormat::Png, bytes)
}

/// A parsed base64 data URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri<'a> {
    mime: &'a str,
    payload: &'a str,
}

impl<'a> DataUri<'a> {
    pub fn parse(uri: &'a str) -> Result<Self> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| CaptureError::InvalidDataUri("missing 'data:' scheme".to_string()))?;
        let (mime, payload) = rest.split_once(";base64,").ok_or_else(|| {
            CaptureError::InvalidDataUri("missing ';base64,' separator".to_string())
        })?;
        if mime.is_empty() || !mime.contains('/') {
            return Err(CaptureError::InvalidDataUri(format!(
                "bad media type '{}'",
                mime
            )));
        }
        Ok(Self { mime, payload })
    }

    pub fn mime(&self) -> &'a str {
        self.mime
    }

    pub fn payload(&self) -> &'a str {
        self.payload
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(self.payload)?)
    }

    /// Whether the payload decodes to bytes carrying the PNG signature
    pub fn is_png(&self) -> bool {
        self.mime == ImageFormat::Png.mime_type()
            && self
                .decode()
                .map(|bytes| bytes.starts_with(PNG_MAGIC))
                .unwrap_or(false)
    }
}
