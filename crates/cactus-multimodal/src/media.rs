//! Media sources: local files and base64 data URIs.

use std::fs;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use cactus_engine::MediaKind;

use crate::{MultimodalError, MultimodalResult};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Standard alphabet, padding optional.
const DATA_URI_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Where a media attachment comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource<'a> {
    /// `data:image/...;base64,...` or `data:audio/...;base64,...`
    DataUri {
        kind: MediaKind,
        header: &'a str,
        payload: &'a str,
    },
    /// `http://` or `https://`, which are not fetched.
    Remote(&'a str),
    File(&'a str),
}

impl<'a> MediaSource<'a> {
    /// Classify a media reference.
    ///
    /// # Errors
    /// - `InvalidDataUri`: a data URI without a comma separator
    pub fn parse(source: &'a str) -> MultimodalResult<Self> {
        let kind = if source.starts_with("data:image/") {
            Some(MediaKind::Image)
        } else if source.starts_with("data:audio/") {
            Some(MediaKind::Audio)
        } else {
            None
        };

        if let Some(kind) = kind {
            let (header, payload) = source.split_once(',').ok_or_else(|| {
                MultimodalError::InvalidDataUri("missing comma separator".to_string())
            })?;
            return Ok(MediaSource::DataUri {
                kind,
                header,
                payload,
            });
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(MediaSource::Remote(source));
        }

        Ok(MediaSource::File(source))
    }

    /// Media kind declared by the source itself, if any.
    pub fn declared_kind(&self) -> Option<MediaKind> {
        match self {
            MediaSource::DataUri { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Fetch the raw bytes.
    ///
    /// # Errors
    /// - `InvalidDataUri`: the header lacks `base64` or the payload does not decode
    /// - `RemoteSource`: URLs are not fetched
    /// - `Io`: the file cannot be read
    pub fn read(&self) -> MultimodalResult<Vec<u8>> {
        match self {
            MediaSource::DataUri {
                header, payload, ..
            } => {
                if !header.contains("base64") {
                    return Err(MultimodalError::InvalidDataUri(
                        "media must be base64 encoded".to_string(),
                    ));
                }
                let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
                DATA_URI_BASE64
                    .decode(compact.as_bytes())
                    .map_err(|e| MultimodalError::InvalidDataUri(e.to_string()))
            }
            MediaSource::Remote(url) => Err(MultimodalError::RemoteSource(url.to_string())),
            MediaSource::File(path) => fs::read(path).map_err(|source| MultimodalError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Short form for log lines.
    pub fn describe(&self) -> String {
        match self {
            MediaSource::DataUri { kind, payload, .. } => {
                format!("{kind:?} data URI ({} base64 chars)", payload.len())
            }
            MediaSource::Remote(url) => url.to_string(),
            MediaSource::File(path) => path.to_string(),
        }
    }
}

/// 64-bit FNV-1a over `data`, rendered in decimal.
pub fn content_hash(data: &[u8]) -> String {
    data.iter()
        .fold(FNV_OFFSET_BASIS, |hash, &b| (hash ^ b as u64).wrapping_mul(FNV_PRIME))
        .to_string()
}
