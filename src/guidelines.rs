//! Review guidelines: kept verbatim, rendered to HTML on request.

use pulldown_cmark::{html, Options, Parser};
use pulldown_cmark_escape::escape_html;
use tracing::info;

use crate::error::{Result, ReviewError};

#[derive(Debug, Clone)]
pub struct Guidelines {
    pub filename: String,
    pub source: String,
}

impl Guidelines {
    pub fn load(filename: &str, data: Vec<u8>) -> Result<Self> {
        let source = String::from_utf8(data)
            .map_err(|e| ReviewError::file_format(filename, format!("not UTF-8 text: {}", e)))?;
        info!("Loaded guidelines '{}' ({} chars)", filename, source.chars().count());
        Ok(Self {
            filename: filename.to_string(),
            source,
        })
    }

    pub fn is_markdown(&self) -> bool {
        let lower = self.filename.to_lowercase();
        lower.ends_with(".md") || lower.ends_with(".markdown")
    }

    /// Markdown becomes HTML; anything else is shown preformatted.
    pub fn render_html(&self) -> String {
        if self.is_markdown() {
            let parser = Parser::new_ext(
                &self.source,
                Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH,
            );
            let mut out = String::with_capacity(self.source.len() * 3 / 2);
            html::push_html(&mut out, parser);
            out
        } else {
            format!("<pre>{}</pre>", escape_markup(&self.source))
        }
    }
}

/// Escape text for HTML or SVG, quotes included so it is safe in attributes.
pub fn escape_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_html(&mut out, s).map(|()| out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_rendering() {
        let g = Guidelines::load(
            "review.md",
            b"# Invoices\n\n- Check **totals**\n\n| a | b |\n|---|---|\n| 1 | 2 |\n".to_vec(),
        )
        .unwrap();
        let html = g.render_html();
        assert!(html.contains("<h1>Invoices</h1>"));
        assert!(html.contains("<strong>totals</strong>"));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn test_plain_text_is_escaped() {
        let g = Guidelines::load("notes.txt", b"a < b & c".to_vec()).unwrap();
        assert_eq!(g.render_html(), "<pre>a &lt; b &amp; c</pre>");
        assert_eq!(g.source, "a < b & c");
    }

    #[test]
    fn test_escape_markup_covers_attributes() {
        assert_eq!(
            escape_markup(r#"<a href="x">Tom's & co</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom&#39;s &amp; co&lt;/a&gt;"
        );
    }

    #[test]
    fn test_binary_rejected() {
        let err = Guidelines::load("x.md", vec![0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ReviewError::FileFormat { .. }));
    }
}
