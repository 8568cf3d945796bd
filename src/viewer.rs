//! Page overlays for OCR tokens.
//!
//! Stateless: takes tokens for a page plus the page size and produces pixel
//! boxes, optionally rendered as a standalone SVG. Never touches session data.

use serde::{Deserialize, Serialize};

use crate::guidelines::escape_markup;
use crate::ocr::{OcrToken, TokenKind};

const PALETTE: [&str; 8] = [
    "#ff0000", "#00ff00", "#0000ff", "#ffff00", "#ff00ff", "#00ffff", "#ff8000", "#8000ff",
];

/// Which token granularity to draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindFilter {
    Word,
    Line,
    #[default]
    All,
}

impl KindFilter {
    pub fn accepts(self, kind: TokenKind) -> bool {
        match self {
            Self::All => true,
            Self::Word => kind == TokenKind::Word,
            Self::Line => kind == TokenKind::Line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayBox {
    pub text: String,
    pub confidence: f64,
    pub label: String,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub color: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageOverlay {
    pub page: u32,
    pub width: f64,
    pub height: f64,
    pub boxes: Vec<OverlayBox>,
}

/// Scale each token on `page` to pixel coordinates.
pub fn page_overlay<'a, I>(
    tokens: I,
    page: u32,
    width: f64,
    height: f64,
    filter: KindFilter,
) -> PageOverlay
where
    I: IntoIterator<Item = &'a OcrToken>,
{
    let boxes = tokens
        .into_iter()
        .filter(|t| t.page == page && filter.accepts(t.kind))
        .enumerate()
        .map(|(i, t)| {
            let bb = t.bounding_box;
            OverlayBox {
                text: t.text.clone(),
                confidence: t.confidence,
                label: format!("{} ({:.1}%)", t.text, t.confidence),
                left: bb.x * width,
                top: bb.y * height,
                width: bb.w * width,
                height: bb.h * height,
                color: PALETTE[i % PALETTE.len()],
            }
        })
        .collect();

    PageOverlay {
        page,
        width,
        height,
        boxes,
    }
}

/// Render an overlay as SVG. `background` is an image URL (e.g. a data URL)
/// drawn underneath the boxes.
pub fn render_svg(overlay: &PageOverlay, background: Option<&str>) -> String {
    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = overlay.width,
        h = overlay.height
    );
    svg.push('\n');
    if let Some(href) = background {
        svg.push_str(&format!(
            r#"  <image href="{}" x="0" y="0" width="{}" height="{}"/>"#,
            escape_markup(href),
            overlay.width,
            overlay.height
        ));
        svg.push('\n');
    }
    for b in &overlay.boxes {
        svg.push_str(&format!(
            r#"  <rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="none" stroke="{}" stroke-width="2"><title>{}</title></rect>"#,
            b.left,
            b.top,
            b.width,
            b.height,
            b.color,
            escape_markup(&b.label)
        ));
        svg.push('\n');
        svg.push_str(&format!(
            r#"  <text x="{:.2}" y="{:.2}" fill="{}" font-size="10">{}</text>"#,
            b.left,
            (b.top - 2.0).max(10.0),
            b.color,
            escape_markup(&b.label)
        ));
        svg.push('\n');
    }
    svg.push_str("</svg>\n");
    svg
}
