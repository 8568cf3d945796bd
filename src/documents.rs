//! Source document handling: kind detection, per-page text, page geometry.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lopdf::{Document, Object, ObjectId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use tracing::{debug, info, warn};

use crate::error::{Result, ReviewError};
use crate::xml;

/// Page size used when a document does not say how big its pages are.
pub const DEFAULT_PAGE_SIZE: (f64, f64) = (1000.0, 1000.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Image,
    Xml,
}

impl DocumentKind {
    /// Detect kind by file extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        match extension(filename).as_str() {
            "pdf" => Some(Self::Pdf),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

fn mime_type(filename: &str) -> &'static str {
    match extension(filename).as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}

/// One page of a loaded document.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub index: u32,
    pub width: f64,
    pub height: f64,
    #[serde(skip)]
    pub text: String,
}

/// An uploaded document held for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub filename: String,
    pub kind: DocumentKind,
    pub content_hash: String,
    pub pages: Vec<Page>,
    bytes: Vec<u8>,
}

/// What the viewer needs to display a document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub filename: String,
    pub kind: DocumentKind,
    pub mime: &'static str,
    pub content_hash: String,
    pub page_count: usize,
    pub pages: Vec<Page>,
    pub data_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl LoadedDocument {
    /// Parse an uploaded document. Unsupported or unreadable files are
    /// reported as [`ReviewError::FileFormat`].
    pub fn load(filename: &str, data: Vec<u8>) -> Result<Self> {
        let kind = DocumentKind::from_filename(filename).ok_or_else(|| {
            ReviewError::file_format(
                filename,
                format!(
                    "unsupported document type '.{}'; expected pdf, png, jpg, jpeg or xml",
                    extension(filename)
                ),
            )
        })?;
        if data.is_empty() {
            return Err(ReviewError::file_format(filename, "file is empty"));
        }

        let pages = match kind {
            DocumentKind::Pdf => pdf_pages(&data).map_err(|e| ReviewError::file_format(filename, e))?,
            DocumentKind::Image => {
                let (width, height) =
                    image_dimensions(&data).map_err(|e| ReviewError::file_format(filename, e))?;
                vec![Page {
                    index: 0,
                    width: f64::from(width),
                    height: f64::from(height),
                    text: String::new(),
                }]
            }
            DocumentKind::Xml => {
                let text = xml_text(&data).map_err(|e| ReviewError::file_format(filename, e))?;
                vec![Page {
                    index: 0,
                    width: DEFAULT_PAGE_SIZE.0,
                    height: DEFAULT_PAGE_SIZE.1,
                    text,
                }]
            }
        };

        let content_hash = format!("{:x}", Sha256::digest(&data));
        info!(
            "Loaded {:?} document '{}' ({} bytes, {} pages)",
            kind,
            filename,
            data.len(),
            pages.len()
        );

        Ok(Self {
            filename: filename.to_string(),
            kind,
            content_hash,
            pages,
            bytes: data,
        })
    }

    /// Reference written into provenance entries: filename plus short hash.
    pub fn reference(&self) -> String {
        format!("{}@sha256:{}", self.filename, &self.content_hash[..12])
    }

    pub fn page_texts(&self) -> Vec<&str> {
        self.pages.iter().map(|p| p.text.as_str()).collect()
    }

    pub fn page_size(&self, index: u32) -> Option<(f64, f64)> {
        self.pages
            .iter()
            .find(|p| p.index == index)
            .map(|p| (p.width, p.height))
    }

    pub fn mime(&self) -> &'static str {
        mime_type(&self.filename)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime(), BASE64.encode(&self.bytes))
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            filename: self.filename.clone(),
            kind: self.kind,
            mime: self.mime(),
            content_hash: self.content_hash.clone(),
            page_count: self.pages.len(),
            pages: self.pages.clone(),
            data_url: self.data_url(),
            text: (self.kind == DocumentKind::Xml).then(|| self.page_texts().join("\n")),
        }
    }
}

/// Extract text and MediaBox size for each page using lopdf.
fn pdf_pages(data: &[u8]) -> anyhow::Result<Vec<Page>> {
    let doc = Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let page_ids = doc.get_pages();
    if page_ids.is_empty() {
        anyhow::bail!("PDF has no pages");
    }

    let mut pages = Vec::with_capacity(page_ids.len());
    for (idx, (page_num, page_id)) in page_ids.into_iter().enumerate() {
        let text = match doc.extract_text(&[page_num]) {
            Ok(text) => text,
            Err(e) => {
                warn!("No text extracted from PDF page {}: {}", page_num, e);
                String::new()
            }
        };
        let (width, height) = media_box(&doc, page_id).unwrap_or(DEFAULT_PAGE_SIZE);
        pages.push(Page {
            index: idx as u32,
            width,
            height,
            text,
        });
    }
    debug!("PDF parsed: {} pages", pages.len());
    Ok(pages)
}

/// Page size from `MediaBox`, following `Parent` links for inherited boxes.
fn media_box(doc: &Document, page_id: ObjectId) -> Option<(f64, f64)> {
    let mut node = page_id;
    for _ in 0..16 {
        let dict = doc.get_dictionary(node).ok()?;
        if let Ok(obj) = dict.get(b"MediaBox") {
            let nums: Vec<f64> = obj
                .as_array()
                .ok()?
                .iter()
                .filter_map(pdf_number)
                .collect();
            if let [x0, y0, x1, y1] = nums[..] {
                return Some(((x1 - x0).abs(), (y1 - y0).abs()));
            }
            return None;
        }
        node = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

fn pdf_number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn image_dimensions(data: &[u8]) -> anyhow::Result<(u32, u32)> {
    let reader = image::io::Reader::new(Cursor::new(data)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

/// Well-formed XML, re-indented for display.
fn xml_text(data: &[u8]) -> anyhow::Result<String> {
    let text = std::str::from_utf8(data)
        .map_err(|e| anyhow::anyhow!("XML is not valid UTF-8: {}", e))?;
    xml::reformat(text).map_err(|e| anyhow::anyhow!("malformed XML: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_kind_detection() {
        assert_eq!(DocumentKind::from_filename("a.PDF"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_filename("scan.jpeg"), Some(DocumentKind::Image));
        assert_eq!(DocumentKind::from_filename("feed.xml"), Some(DocumentKind::Xml));
        assert_eq!(DocumentKind::from_filename("notes.txt"), None);
    }

    #[test]
    fn test_load_image() {
        let doc = LoadedDocument::load("scan.png", png_bytes(40, 30)).unwrap();
        assert_eq!(doc.kind, DocumentKind::Image);
        assert_eq!(doc.page_size(0), Some((40.0, 30.0)));
        assert!(doc.data_url().starts_with("data:image/png;base64,"));
        assert!(doc.reference().starts_with("scan.png@sha256:"));
    }

    #[test]
    fn test_load_xml() {
        let xml = b"<invoice>\n  <total>10</total>\n</invoice>".to_vec();
        let doc = LoadedDocument::load("feed.xml", xml).unwrap();
        assert_eq!(doc.pages.len(), 1);
        assert!(doc.page_texts()[0].contains("<total>10</total>"));
        assert!(doc.view().text.is_some());
    }

    #[test]
    fn test_xml_view_is_reindented() {
        let doc = LoadedDocument::load("feed.xml", b"<a><b>1</b></a>".to_vec()).unwrap();
        assert_eq!(doc.view().text.as_deref(), Some("<a>\n  <b>1</b>\n</a>"));
    }

    fn two_page_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for (word, media_box) in [("Hello", None), ("World", Some((300, 400)))] {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(word)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            };
            if let Some((w, h)) = media_box {
                page.set("MediaBox", vec![0.into(), 0.into(), w.into(), h.into()]);
            }
            kids.push(Object::from(doc.add_object(page)));
        }

        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => 2,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_load_pdf_pages() {
        let doc = LoadedDocument::load("invoice.pdf", two_page_pdf()).unwrap();
        assert_eq!(doc.kind, DocumentKind::Pdf);
        assert_eq!(doc.pages.len(), 2);
        // First page inherits the MediaBox from the page tree.
        assert_eq!(doc.page_size(0), Some((612.0, 792.0)));
        assert_eq!(doc.page_size(1), Some((300.0, 400.0)));
        assert!(doc.page_texts()[0].contains("Hello"));
        assert!(doc.page_texts()[1].contains("World"));
        assert!(doc.view().text.is_none());
    }

    #[test]
    fn test_media_box_fallbacks() {
        let mut doc = Document::with_version("1.5");
        let bare = doc.add_object(dictionary! { "Type" => "Page" });
        assert_eq!(media_box(&doc, bare), None);

        let real = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.5f32.into(), Object::Integer(792)],
        });
        assert_eq!(media_box(&doc, real), Some((612.5, 792.0)));

        let short = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into()],
        });
        assert_eq!(media_box(&doc, short), None);

        // A Parent cycle gives up instead of looping.
        let looped = doc.new_object_id();
        doc.objects.insert(
            looped,
            Object::Dictionary(dictionary! { "Type" => "Page", "Parent" => looped }),
        );
        assert_eq!(media_box(&doc, looped), None);
    }

    #[test]
    fn test_bad_uploads_are_file_format_errors() {
        for (name, data) in [
            ("feed.xml", b"just text".to_vec()),
            ("feed.xml", b"<a><b></a>".to_vec()),
            ("scan.png", b"not an image".to_vec()),
            ("doc.pdf", b"%PDF-garbage".to_vec()),
            ("notes.txt", b"hello".to_vec()),
            ("empty.pdf", Vec::new()),
        ] {
            let err = LoadedDocument::load(name, data).unwrap_err();
            assert!(matches!(err, ReviewError::FileFormat { .. }), "{}", name);
        }
    }
}
