//! Templated question answering over the loaded document and fields.
//!
//! No inference engine: questions are matched against field names, a
//! `find <term>` form that runs a search, and a handful of keyword templates.
//! Each answer depends only on the current question and session contents.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::documents::LoadedDocument;
use crate::ocr::{OcrDocument, TokenKind};
use crate::rules::validate_record;
use crate::schema::{value_to_plain_string, ExtractionRecord, Field};
use crate::search::{search_text, search_tokens, SearchMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// What the chat can see when answering.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatContext<'a> {
    pub document: Option<&'a LoadedDocument>,
    pub record: Option<&'a ExtractionRecord>,
    pub ocr: Option<&'a OcrDocument>,
    pub formula_tolerance: f64,
}

impl ChatContext<'_> {
    fn document_name(&self) -> &str {
        self.document
            .map(|d| d.filename.as_str())
            .unwrap_or("the document")
    }
}

fn find_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)^\s*(?:please\s+)?(?:find|search(?:\s+for)?|where\s+is)\s+["']?(.+?)["']?\s*\??\s*$"#)
            .expect("static regex")
    })
}

/// Answer one question.
pub fn respond(question: &str, ctx: &ChatContext<'_>) -> String {
    if let Some(answer) = answer_from_fields(question, ctx) {
        return answer;
    }
    if let Some(term) = find_pattern().captures(question).and_then(|c| c.get(1)) {
        return answer_from_search(term.as_str(), ctx);
    }

    let words = words(question);
    let has = |w: &str| words.contains(w);
    let doc = ctx.document_name();

    if has("hello") || has("hi") || has("hey") {
        format!(
            "Hello! I'm here to help you with document '{}'. What would you like to know?",
            doc
        )
    } else if has("what") && has("document") {
        match ctx.document {
            Some(d) => format!(
                "This is document '{}' ({} page{}). I can help you understand its contents or answer questions about it.",
                d.filename,
                d.pages.len(),
                if d.pages.len() == 1 { "" } else { "s" }
            ),
            None => "No document has been uploaded yet.".to_string(),
        }
    } else if has("search") || has("find") {
        "You can use the search tool to find specific information in the document, or ask me to \"find <term>\".".to_string()
    } else if has("json") || has("data") {
        match ctx.record {
            Some(r) => format!(
                "The extracted data has {} fields and {} recorded edit{}. You can modify values in the editor panel.",
                r.fields().len(),
                r.provenance().len(),
                if r.provenance().len() == 1 { "" } else { "s" }
            ),
            None => "No extracted data has been uploaded yet.".to_string(),
        }
    } else if has("ocr") {
        match ctx.ocr {
            Some(o) => format!(
                "OCR data is available for this document ({} tokens). You can see the text with bounding boxes in the OCR overlay.",
                o.tokens.len()
            ),
            None => "No OCR data has been provided for this document.".to_string(),
        }
    } else if has("help") {
        "I can help you understand the document, find information, or explain the extracted data. Ask about a field by name, or say \"find <term>\" to search.".to_string()
    } else {
        "I can only answer simple questions: ask about a field by name, say \"find <term>\" to search the document, or ask for help.".to_string()
    }
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Lowercase words joined by single spaces, with `_` treated as a separator.
fn phrase(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn answer_from_fields(question: &str, ctx: &ChatContext<'_>) -> Option<String> {
    let record = ctx.record?;
    let q = format!(" {} ", phrase(question));

    let field: &Field = record
        .fields()
        .iter()
        .filter(|f| {
            let name = phrase(&f.name);
            !name.is_empty() && q.contains(&format!(" {} ", name))
        })
        .max_by_key(|f| f.name.len())?;

    let mut answer = if value_to_plain_string(&field.value).trim().is_empty() {
        format!("`{}` has no extracted value yet.", field.name)
    } else {
        format!(
            "The extracted value of `{}` ({}) is {}.",
            field.name,
            field.declared_type,
            value_to_plain_string(&field.value)
        )
    };

    let warnings: Vec<String> = validate_record(record, ctx.formula_tolerance)
        .into_iter()
        .filter(|w| w.field == field.name)
        .map(|w| w.message)
        .collect();
    if !warnings.is_empty() {
        answer.push_str(&format!(" Note: {}.", warnings.join("; ")));
    }
    Some(answer)
}

fn answer_from_search(term: &str, ctx: &ChatContext<'_>) -> String {
    let matches = match (ctx.ocr, ctx.document) {
        (Some(ocr), _) => search_tokens(
            ocr.tokens.iter().filter(|t| t.kind == TokenKind::Word),
            term,
            SearchMode::Exact,
        ),
        (None, Some(doc)) => search_text(&doc.page_texts(), term, SearchMode::Exact),
        (None, None) => return "Upload a document first, then I can search it.".to_string(),
    };

    if matches.is_empty() {
        return format!("No matches for '{}' in {}.", term, ctx.document_name());
    }
    let pages: BTreeSet<u32> = matches.iter().map(|m| m.page + 1).collect();
    let pages: Vec<String> = pages.iter().map(u32::to_string).collect();
    format!(
        "Found {} match{} for '{}' on page{} {}.",
        matches.len(),
        if matches.len() == 1 { "" } else { "es" },
        term,
        if pages.len() == 1 { "" } else { "s" },
        pages.join(", ")
    )
}
