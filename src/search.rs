//! Exact and fuzzy lookup over page text or OCR tokens.
//!
//! Pure functions, nothing persisted: a query is compiled to a regex, run over
//! the given text, and every hit is reported with its page, character position
//! and surrounding context. Results come back in document order.

use regex::{Match, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ocr::{BoundingBox, OcrToken};

/// Characters of context kept on each side of a match.
pub const CONTEXT_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Case-insensitive substring.
    #[default]
    Exact,
    /// Query characters in order on a single line, case-insensitive,
    /// reported as the shortest span.
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    /// 0-based page index.
    pub page: u32,
    /// Character offset of the match within the page text or token text.
    pub position: usize,
    /// 1-based line number; only for page-text searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub text: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Compile a query for the given mode. Returns `None` for a blank query.
fn compile(query: &str, mode: SearchMode) -> Option<Regex> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    let body = match mode {
        SearchMode::Exact => regex::escape(query),
        SearchMode::Fuzzy => query
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| regex::escape(&c.to_string()))
            .collect::<Vec<_>>()
            .join(".*?"),
    };
    // `.` does not cross newlines, so fuzzy matches stay on one line.
    Regex::new(&format!("(?i){}", body)).ok()
}

/// Non-overlapping matches in `text`, left to right.
fn find_all<'t>(re: &Regex, text: &'t str, mode: SearchMode) -> Vec<Match<'t>> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(m) = re.find_at(text, pos) {
        if m.is_empty() {
            break;
        }
        let m = match mode {
            SearchMode::Exact => m,
            SearchMode::Fuzzy => tighten(re, text, m),
        };
        pos = m.end();
        found.push(m);
    }
    found
}

/// Move the start of `best` right while a match still ends no later, giving
/// the shortest span. `.*?` alone only minimizes the end.
fn tighten<'t>(re: &Regex, text: &'t str, mut best: Match<'t>) -> Match<'t> {
    loop {
        let step = text[best.start()..].chars().next().map_or(1, char::len_utf8);
        match re.find_at(text, best.start() + step) {
            Some(m) if m.end() <= best.end() => best = m,
            _ => return best,
        }
    }
}

/// Search the text of each page. `pages[i]` is page `i`.
pub fn search_text(pages: &[&str], query: &str, mode: SearchMode) -> Vec<SearchMatch> {
    let Some(re) = compile(query, mode) else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    for (page_idx, text) in pages.iter().enumerate() {
        for m in find_all(&re, text, mode) {
            let line = text[..m.start()].matches('\n').count() + 1;
            matches.push(SearchMatch {
                page: page_idx as u32,
                position: text[..m.start()].chars().count(),
                line: Some(line),
                text: m.as_str().to_string(),
                context: context(text, m.start(), m.end()),
                bounding_box: None,
                confidence: None,
            });
        }
    }
    debug!("Text search '{}' ({:?}): {} matches", query, mode, matches.len());
    matches
}

/// Search OCR tokens. At most one match per token, ordered by page then
/// upload order.
pub fn search_tokens<'a, I>(tokens: I, query: &str, mode: SearchMode) -> Vec<SearchMatch>
where
    I: IntoIterator<Item = &'a OcrToken>,
{
    let Some(re) = compile(query, mode) else {
        return Vec::new();
    };

    let mut matches: Vec<SearchMatch> = tokens
        .into_iter()
        .filter_map(|token| {
            let m = find_all(&re, &token.text, mode).into_iter().next()?;
            Some(SearchMatch {
                page: token.page,
                position: token.text[..m.start()].chars().count(),
                line: None,
                text: m.as_str().to_string(),
                context: token.text.clone(),
                bounding_box: Some(token.bounding_box),
                confidence: Some(token.confidence),
            })
        })
        .collect();
    matches.sort_by_key(|m| m.page);
    debug!("Token search '{}' ({:?}): {} matches", query, mode, matches.len());
    matches
}

/// Up to [`CONTEXT_CHARS`] characters either side of `[start, end)`, trimmed
/// to whole characters.
fn context(text: &str, start: usize, end: usize) -> String {
    let before: String = {
        let chars: Vec<char> = text[..start].chars().rev().take(CONTEXT_CHARS).collect();
        chars.into_iter().rev().collect()
    };
    let after: String = text[end..].chars().take(CONTEXT_CHARS).collect();
    format!("{}{}{}", before, &text[start..end], after)
        .replace('\n', " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::TokenKind;

    fn token(text: &str, page: u32, x: f64) -> OcrToken {
        OcrToken {
            text: text.to_string(),
            bounding_box: BoundingBox { x, y: 0.5, w: 0.1, h: 0.02 },
            page,
            confidence: 97.0,
            kind: TokenKind::Word,
        }
    }

    #[test]
    fn test_single_token_match() {
        let tokens = vec![
            token("Invoice", 0, 0.1),
            token("Subtotal", 0, 0.2),
            token("1,250.00", 1, 0.3),
        ];
        let matches = search_tokens(&tokens, "1,250", SearchMode::Exact);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].page, 1);
        assert_eq!(matches[0].bounding_box, Some(tokens[2].bounding_box));
        assert_eq!(matches[0].confidence, Some(97.0));
    }

    #[test]
    fn test_token_results_ordered_by_page() {
        let tokens = vec![token("total", 2, 0.1), token("Total", 0, 0.2)];
        let matches = search_tokens(&tokens, "TOTAL", SearchMode::Exact);
        let pages: Vec<u32> = matches.iter().map(|m| m.page).collect();
        assert_eq!(pages, vec![0, 2]);
    }

    #[test]
    fn test_text_search_positions() {
        let pages = ["Invoice 42\nTotal due: 10", "nothing", "total again"];
        let matches = search_text(&pages, "total", SearchMode::Exact);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].page, 0);
        assert_eq!(matches[0].position, 11);
        assert_eq!(matches[0].line, Some(2));
        assert_eq!(matches[0].text, "Total");
        assert_eq!(matches[1].page, 2);
        assert_eq!(matches[1].position, 0);
    }

    #[test]
    fn test_fuzzy_stays_on_one_line() {
        let pages = ["inv\noice", "in-vo-ice"];
        let matches = search_text(&pages, "invoice", SearchMode::Fuzzy);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].page, 1);
        assert_eq!(matches[0].text, "in-vo-ice");
    }

    #[test]
    fn test_fuzzy_reports_shortest_span() {
        let matches = search_text(&["a-a-b then ab"], "ab", SearchMode::Fuzzy);
        let spans: Vec<(usize, &str)> =
            matches.iter().map(|m| (m.position, m.text.as_str())).collect();
        assert_eq!(spans, vec![(2, "a-b"), (11, "ab")]);

        let tokens = vec![token("x-x-y", 0, 0.1)];
        let matches = search_tokens(&tokens, "xy", SearchMode::Fuzzy);
        assert_eq!(matches[0].text, "x-y");
        assert_eq!(matches[0].position, 2);
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pages = ["cost (net) $5.00", "cost net 5x00"];
        assert_eq!(search_text(&pages, "$5.00", SearchMode::Exact).len(), 1);
        assert_eq!(search_text(&pages, "(net)", SearchMode::Exact).len(), 1);
    }

    #[test]
    fn test_blank_query() {
        assert!(search_text(&["abc"], "  ", SearchMode::Exact).is_empty());
        assert!(search_tokens(&[token("abc", 0, 0.0)], "", SearchMode::Fuzzy).is_empty());
    }

    #[test]
    fn test_context_window_is_char_safe() {
        let text = format!("{}é match é{}", "x".repeat(80), "y".repeat(80));
        let matches = search_text(&[text.as_str()], "match", SearchMode::Exact);
        let ctx = &matches[0].context;
        assert_eq!(ctx.chars().count(), CONTEXT_CHARS * 2 + "match".len());
        assert!(ctx.contains("é match é"));
    }
}
