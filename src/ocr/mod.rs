//! OCR token model and upload parsing.
//!
//! OCR data arrives from an external text-recognition service. Two layouts are
//! understood: Textract-style block JSON (see [`textract`]) and this crate's
//! own flat token list. Either way the result is a list of immutable
//! [`OcrToken`]s with normalized (0..1) bounding boxes and 0-based pages.

pub mod textract;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Result, ReviewError};

/// Normalized box: fractions of page width/height from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Word,
    Line,
}

/// A recognized text span with its page position and confidence (0..100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "default_kind")]
    pub kind: TokenKind,
}

fn default_kind() -> TokenKind {
    TokenKind::Word
}

/// Which layout an OCR upload used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrFormat {
    Textract,
    Tokens,
}

impl OcrFormat {
    /// Guess the layout from the top-level JSON shape.
    pub fn detect(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) if obj.contains_key("Blocks") || obj.contains_key("Pages") => {
                Some(Self::Textract)
            }
            Value::Object(obj) if obj.contains_key("tokens") => Some(Self::Tokens),
            Value::Array(items) => match items.first() {
                None => Some(Self::Textract),
                Some(first) if first.get("BlockType").is_some() => Some(Self::Textract),
                Some(first) if first.get("bounding_box").is_some() => Some(Self::Tokens),
                Some(_) => None,
            },
            _ => None,
        }
    }
}

/// Parsed OCR upload.
#[derive(Debug, Clone)]
pub struct OcrDocument {
    pub filename: String,
    pub format: OcrFormat,
    pub tokens: Vec<OcrToken>,
}

impl OcrDocument {
    pub fn parse(filename: &str, data: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| ReviewError::file_format(filename, e))?;
        let format = OcrFormat::detect(&value).ok_or_else(|| {
            ReviewError::Schema(
                "OCR JSON must contain 'Blocks', 'Pages' or 'tokens', or be an array of blocks"
                    .into(),
            )
        })?;

        let tokens = match format {
            OcrFormat::Textract => textract::parse_tokens(value)?,
            OcrFormat::Tokens => {
                let list = match value {
                    Value::Object(mut obj) => obj.remove("tokens").unwrap_or(Value::Null),
                    other => other,
                };
                serde_json::from_value::<Vec<OcrToken>>(list)
                    .map_err(|e| ReviewError::Schema(format!("invalid token list: {}", e)))?
            }
        };

        info!(
            "Loaded OCR '{}' ({:?}): {} tokens across {} pages",
            filename,
            format,
            tokens.len(),
            page_count(&tokens)
        );
        Ok(Self {
            filename: filename.to_string(),
            format,
            tokens,
        })
    }

    /// Tokens on one page, in upload order.
    pub fn page_tokens(&self, page: u32) -> Vec<&OcrToken> {
        self.tokens.iter().filter(|t| t.page == page).collect()
    }

    pub fn page_count(&self) -> u32 {
        page_count(&self.tokens)
    }
}

fn page_count(tokens: &[OcrToken]) -> u32 {
    tokens.iter().map(|t| t.page + 1).max().unwrap_or(0)
}
