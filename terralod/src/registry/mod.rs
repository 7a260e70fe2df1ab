//! Content-format dispatch.
//!
//! Tile payloads arrive as raw bytes in half a dozen binary formats. The
//! [`ContentRegistry`] maps a 4-byte magic prefix or a MIME content type to
//! a decode function and resolves which decoder applies to a payload.
//!
//! The registry is write-once-at-startup, read-heavy afterwards:
//! registration happens while the host configures the tileset, then the
//! registry is shared immutably behind `Arc` and lookups need no locking.

mod external;

pub use external::external_tileset_decoder;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use glam::DMat4;
use thiserror::Error;
use tracing::warn;

use crate::context::TileContext;
use crate::geometry::{BoundingVolume, TileId};
use crate::tile::{DecodedContent, Refine};

/// Synthetic content-type key for the JSON fallback decoder.
///
/// A payload whose first non-whitespace byte is `{` and that matched no
/// magic or content type is treated as a nested external tileset document
/// and dispatched to the decoder registered under this key.
pub const JSON_FALLBACK_KEY: &str = "json";

/// Everything a decoder may need about the tile whose payload it decodes.
pub struct DecodeInput {
    pub context: Arc<TileContext>,
    pub tile_id: TileId,
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    pub transform: DMat4,
    pub content_bounding_volume: Option<BoundingVolume>,
    pub refine: Refine,
    pub url: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Errors produced by content decoders.
///
/// Format-specific details never propagate past the decode boundary; they
/// are flattened into these variants.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload did not conform to its format.
    #[error("malformed {format} payload: {reason}")]
    Malformed { format: &'static str, reason: String },

    /// Any other decoder failure.
    #[error("{0}")]
    Other(String),
}

/// A decode function registered for one format.
pub type Decoder = Arc<dyn Fn(DecodeInput) -> Result<DecodedContent, DecodeError> + Send + Sync>;

/// Maps format identifiers to decoders.
#[derive(Default)]
pub struct ContentRegistry {
    by_magic: HashMap<[u8; 4], Decoder>,
    by_content_type: HashMap<String, Decoder>,
}

impl ContentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-crate decoders installed: the external
    /// tileset decoder under the [`JSON_FALLBACK_KEY`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_by_content_type(JSON_FALLBACK_KEY, external_tileset_decoder());
        registry
    }

    /// Registers a decoder for a 4-byte magic prefix. Re-registering a
    /// magic replaces the previous decoder.
    pub fn register_by_magic(&mut self, magic: [u8; 4], decoder: Decoder) {
        self.by_magic.insert(magic, decoder);
    }

    /// Registers a decoder for a MIME content type. Keys are normalized to
    /// lower case before storage; re-registering replaces.
    pub fn register_by_content_type(&mut self, content_type: &str, decoder: Decoder) {
        self.by_content_type
            .insert(content_type.to_ascii_lowercase(), decoder);
    }

    /// Decodes a payload by resolving its format.
    ///
    /// Resolution order:
    /// 1. exact match of the first four payload bytes against registered
    ///    magics (when the payload has at least four bytes);
    /// 2. the content type, with any `;`-delimited parameter suffix
    ///    stripped, looked up case-insensitively;
    /// 3. if nothing matched and the first non-whitespace byte is `{`, the
    ///    decoder registered under [`JSON_FALLBACK_KEY`];
    /// 4. otherwise `Ok(None)`, with a diagnostic naming both the content
    ///    type and the magic value that failed to resolve.
    pub fn create_content(&self, input: DecodeInput) -> Result<Option<DecodedContent>, DecodeError> {
        match self.resolve(&input.data, input.content_type.as_deref()) {
            Some(decoder) => decoder(input).map(Some),
            None => {
                warn!(
                    url = %input.url,
                    content_type = input.content_type.as_deref().unwrap_or("<none>"),
                    magic = %magic_for_display(&input.data),
                    "no decoder registered for tile content"
                );
                Ok(None)
            }
        }
    }

    fn resolve(&self, data: &[u8], content_type: Option<&str>) -> Option<&Decoder> {
        if data.len() >= 4 {
            let magic: [u8; 4] = data[..4].try_into().ok()?;
            if let Some(decoder) = self.by_magic.get(&magic) {
                return Some(decoder);
            }
        }

        if let Some(content_type) = content_type {
            let base = content_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if let Some(decoder) = self.by_content_type.get(&base) {
                return Some(decoder);
            }
        }

        let first_byte = data.iter().copied().find(|b| !b.is_ascii_whitespace());
        if first_byte == Some(b'{') {
            if let Some(decoder) = self.by_content_type.get(JSON_FALLBACK_KEY) {
                return Some(decoder);
            }
        }

        None
    }
}

fn magic_for_display(data: &[u8]) -> String {
    if data.len() >= 4 {
        data[..4]
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() {
                    (b as char).to_string()
                } else {
                    format!("\\x{:02x}", b)
                }
            })
            .collect()
    } else {
        "<short payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_decoder(tag: &'static str, hits: Arc<parking_lot::Mutex<Vec<&'static str>>>) -> Decoder {
        Arc::new(move |_input| {
            hits.lock().push(tag);
            Ok(DecodedContent::empty())
        })
    }

    fn input(data: &'static [u8], content_type: Option<&str>) -> DecodeInput {
        DecodeInput {
            context: Arc::new(TileContext::new("https://example.com/tileset.json")),
            tile_id: TileId::Url("https://example.com/tile".to_string()),
            bounding_volume: BoundingVolume::Sphere {
                center: glam::DVec3::ZERO,
                radius: 1.0,
            },
            geometric_error: 16.0,
            transform: DMat4::IDENTITY,
            content_bounding_volume: None,
            refine: Refine::Replace,
            url: "https://example.com/tile".to_string(),
            content_type: content_type.map(str::to_owned),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_magic_wins_over_content_type() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = ContentRegistry::new();
        registry.register_by_magic(*b"glTF", counting_decoder("gltf", hits.clone()));
        registry.register_by_content_type("application/octet-stream", counting_decoder("octet", hits.clone()));

        let result = registry
            .create_content(input(b"glTF\x02\x00\x00\x00", Some("application/octet-stream")))
            .unwrap();
        assert!(result.is_some());
        assert_eq!(*hits.lock(), vec!["gltf"]);
    }

    #[test]
    fn test_content_type_parameters_stripped_and_case_folded() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = ContentRegistry::new();
        registry.register_by_content_type(
            "application/vnd.quantized-mesh",
            counting_decoder("qmesh", hits.clone()),
        );

        let result = registry
            .create_content(input(
                b"\x01\x02",
                Some("Application/VND.Quantized-Mesh; charset=utf-8"),
            ))
            .unwrap();
        assert!(result.is_some());
        assert_eq!(*hits.lock(), vec!["qmesh"]);
    }

    #[test]
    fn test_json_fallback_on_leading_brace() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = ContentRegistry::new();
        registry.register_by_content_type(JSON_FALLBACK_KEY, counting_decoder("json", hits.clone()));

        let result = registry
            .create_content(input(b"  \n\t{\"asset\":{}}", Some("text/plain")))
            .unwrap();
        assert!(result.is_some());
        assert_eq!(*hits.lock(), vec!["json"]);
    }

    #[test]
    fn test_unresolved_returns_none() {
        let registry = ContentRegistry::new();
        let result = registry
            .create_content(input(b"\x00\x01\x02\x03", Some("application/x-unknown")))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_short_payload_skips_magic() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = ContentRegistry::new();
        registry.register_by_magic(*b"b3dm", counting_decoder("b3dm", hits.clone()));
        registry.register_by_content_type("application/octet-stream", counting_decoder("octet", hits.clone()));

        let result = registry
            .create_content(input(b"b3", Some("application/octet-stream")))
            .unwrap();
        assert!(result.is_some());
        assert_eq!(*hits.lock(), vec!["octet"]);
    }

    #[test]
    fn test_decoder_error_propagates() {
        let mut registry = ContentRegistry::new();
        registry.register_by_magic(
            *b"pnts",
            Arc::new(|_input| {
                Err(DecodeError::Malformed {
                    format: "pnts",
                    reason: "truncated feature table".to_string(),
                })
            }),
        );

        let result = registry.create_content(input(b"pnts\x01\x00", None));
        assert!(result.is_err());
    }

    #[test]
    fn test_reregistration_replaces() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = ContentRegistry::new();
        registry.register_by_content_type("application/json", counting_decoder("first", hits.clone()));
        registry.register_by_content_type("application/json", counting_decoder("second", hits.clone()));

        registry
            .create_content(input(b"[]", Some("application/json")))
            .unwrap();
        assert_eq!(*hits.lock(), vec!["second"]);
    }

    proptest::proptest! {
        #[test]
        fn prop_content_type_lookup_is_case_insensitive(case_mask in proptest::collection::vec(proptest::bool::ANY, 20)) {
            let key = "application/vnd.test";
            let mut registry = ContentRegistry::new();
            registry.register_by_content_type(key, Arc::new(|_| Ok(DecodedContent::empty())));

            let mutated: String = key
                .chars()
                .zip(case_mask.iter().cycle())
                .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c })
                .collect();

            let result = registry.create_content(input(b"\x00", Some(&mutated))).unwrap();
            proptest::prop_assert!(result.is_some());
        }
    }
}
