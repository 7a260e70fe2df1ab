//! External tileset content.
//!
//! A tile's content URI may point at another tileset document instead of a
//! binary payload. Decoding it means parsing the nested document, deriving
//! a new [`TileContext`] rooted at the document's URL, and building the
//! subtree it declares. The subtree is attached to the referring tile
//! during main-thread finalization.

use std::sync::Arc;

use crate::registry::{DecodeError, DecodeInput, Decoder};
use crate::tile::DecodedContent;
use crate::tileset::build_tile_from_json;

/// Returns the decoder for nested external tileset documents.
///
/// Registered under the synthetic `"json"` key by
/// `ContentRegistry::with_defaults`; hosts may additionally register it for
/// explicit content types such as `application/json`.
pub fn external_tileset_decoder() -> Decoder {
    Arc::new(decode_external_tileset)
}

fn decode_external_tileset(input: DecodeInput) -> Result<DecodedContent, DecodeError> {
    let document: serde_json::Value =
        serde_json::from_slice(&input.data).map_err(|e| DecodeError::Malformed {
            format: "external tileset",
            reason: e.to_string(),
        })?;

    let root_json = document.get("root").ok_or_else(|| DecodeError::Malformed {
        format: "external tileset",
        reason: "document has no root tile".to_string(),
    })?;

    let context = Arc::new(input.context.derive_for(input.url.clone()));

    // The external root inherits the referring tile's composed transform
    // and refinement, exactly as if it had been declared inline.
    let root = build_tile_from_json(root_json, &context, input.transform, input.refine)
        .ok_or_else(|| DecodeError::Malformed {
            format: "external tileset",
            reason: "root tile is missing required properties".to_string(),
        })?;

    Ok(DecodedContent {
        external_children: Some(vec![root]),
        new_context: Some(context),
        ..DecodedContent::empty()
    })
}
