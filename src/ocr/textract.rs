//! Textract-style block JSON.
//!
//! Three shapes are accepted: `{"Blocks": [...]}` with a 1-based `Page` key on
//! each block, `{"Pages": [{"Blocks": [...]}, ...]}` where the array position is
//! the page, and a bare array of blocks. Only `WORD` and `LINE` blocks that
//! carry text and a bounding box become tokens.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{BoundingBox, OcrToken, TokenKind};
use crate::error::{Result, ReviewError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Block {
    #[serde(default)]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Geometry {
    #[serde(default)]
    bounding_box: Option<TextractBox>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TextractBox {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TextractPage {
    #[serde(default)]
    blocks: Vec<Block>,
}

/// Convert a Textract payload into tokens.
pub fn parse_tokens(value: Value) -> Result<Vec<OcrToken>> {
    let schema_err = |e: serde_json::Error| ReviewError::Schema(format!("invalid Textract JSON: {}", e));

    let mut tokens = Vec::new();
    match value {
        Value::Object(mut obj) if obj.contains_key("Blocks") => {
            let blocks: Vec<Block> =
                serde_json::from_value(obj.remove("Blocks").unwrap_or_default()).map_err(schema_err)?;
            collect(blocks, None, &mut tokens);
        }
        Value::Object(mut obj) if obj.contains_key("Pages") => {
            let pages: Vec<TextractPage> =
                serde_json::from_value(obj.remove("Pages").unwrap_or_default()).map_err(schema_err)?;
            for (idx, page) in pages.into_iter().enumerate() {
                collect(page.blocks, Some(idx as u32), &mut tokens);
            }
        }
        Value::Array(_) => {
            let blocks: Vec<Block> = serde_json::from_value(value).map_err(schema_err)?;
            collect(blocks, None, &mut tokens);
        }
        _ => {
            return Err(ReviewError::Schema(
                "Textract JSON must have 'Blocks' or 'Pages'".into(),
            ))
        }
    }
    Ok(tokens)
}

fn collect(blocks: Vec<Block>, page_override: Option<u32>, out: &mut Vec<OcrToken>) {
    let mut skipped = 0usize;
    for block in blocks {
        let kind = match block.block_type.as_str() {
            "WORD" => TokenKind::Word,
            "LINE" => TokenKind::Line,
            _ => continue,
        };
        let (Some(text), Some(bbox)) = (block.text, block.geometry.and_then(|g| g.bounding_box))
        else {
            skipped += 1;
            continue;
        };
        let page = page_override.unwrap_or_else(|| block.page.unwrap_or(1).saturating_sub(1));
        out.push(OcrToken {
            text,
            bounding_box: BoundingBox {
                x: bbox.left,
                y: bbox.top,
                w: bbox.width,
                h: bbox.height,
            },
            page,
            confidence: block.confidence.unwrap_or(0.0),
            kind,
        });
    }
    if skipped > 0 {
        debug!("Skipped {} text blocks without text or geometry", skipped);
    }
}
