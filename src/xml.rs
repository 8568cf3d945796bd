//! XML well-formedness check and re-indentation for the document viewer.
//!
//! Only the structure is checked: tags must nest and close, there must be
//! exactly one root element, and no text may sit outside it. Entities and
//! namespaces are passed through as written.

use anyhow::{bail, Context, Result};

const INDENT: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    /// Declarations, processing instructions, doctypes and comments.
    Markup(&'a str),
    /// Character data, CDATA sections included.
    Text(&'a str),
    Start { name: &'a str, raw: &'a str },
    Empty { raw: &'a str },
    End { name: &'a str },
}

/// Check `src` is well formed and return it re-indented, one tag per line.
/// An element holding only text stays on one line.
pub fn reformat(src: &str) -> Result<String> {
    let tokens = tokenize(src.trim_start_matches('\u{feff}'))?;
    let mut open: Vec<&str> = Vec::new();
    let mut roots = 0;
    let mut out = String::new();

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            Token::Markup(raw) => push_line(&mut out, open.len(), raw),
            Token::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    if open.is_empty() {
                        bail!("text outside the root element: {:?}", truncate(text));
                    }
                    push_line(&mut out, open.len(), text);
                }
            }
            Token::Empty { raw } => {
                if open.is_empty() {
                    roots += 1;
                }
                push_line(&mut out, open.len(), raw);
            }
            Token::Start { name, raw } => {
                if open.is_empty() {
                    roots += 1;
                }
                if let (Some(Token::Text(text)), Some(Token::End { name: end })) =
                    (tokens.get(i + 1), tokens.get(i + 2))
                {
                    if *end == name {
                        let line = format!("{}{}</{}>", raw, text.trim(), name);
                        push_line(&mut out, open.len(), &line);
                        i += 3;
                        continue;
                    }
                }
                push_line(&mut out, open.len(), raw);
                open.push(name);
            }
            Token::End { name } => match open.pop() {
                Some(expected) if expected == name => {
                    push_line(&mut out, open.len(), &format!("</{}>", name));
                }
                Some(expected) => bail!("expected </{}>, found </{}>", expected, name),
                None => bail!("closing tag </{}> has no opening tag", name),
            },
        }
        i += 1;
    }

    if let Some(name) = open.last() {
        bail!("element <{}> is never closed", name);
    }
    match roots {
        0 => bail!("no root element"),
        1 => Ok(out),
        _ => bail!("more than one root element"),
    }
}

fn push_line(out: &mut String, depth: usize, line: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(line);
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(40) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn tokenize(src: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < src.len() {
        let rest = &src[pos..];
        let len = if rest.starts_with("<!--") {
            let len = closing(rest, "-->").context("unterminated comment")?;
            tokens.push(Token::Markup(&rest[..len]));
            len
        } else if rest.starts_with("<![CDATA[") {
            let len = closing(rest, "]]>").context("unterminated CDATA section")?;
            tokens.push(Token::Text(&rest[..len]));
            len
        } else if rest.starts_with("<?") {
            let len = closing(rest, "?>").context("unterminated processing instruction")?;
            tokens.push(Token::Markup(&rest[..len]));
            len
        } else if rest.starts_with("<!") {
            let len = doctype_end(rest).context("unterminated declaration")?;
            tokens.push(Token::Markup(&rest[..len]));
            len
        } else if rest.starts_with('<') {
            let len = tag_end(rest).with_context(|| format!("unterminated tag at byte {}", pos))?;
            tokens.push(tag(&rest[..len])?);
            len
        } else {
            let len = rest.find('<').unwrap_or(rest.len());
            tokens.push(Token::Text(&rest[..len]));
            len
        };
        pos += len;
    }
    Ok(tokens)
}

/// Length of `rest` up to and including the first `end`.
fn closing(rest: &str, end: &str) -> Option<usize> {
    rest.find(end).map(|idx| idx + end.len())
}

/// Length of a `<!...>` declaration, skipping a bracketed internal subset.
fn doctype_end(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return Some(idx + 1),
            _ => {}
        }
    }
    None
}

/// Length of a tag up to its `>`, ignoring any inside quoted attribute values.
fn tag_end(rest: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in rest.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '<') => return None,
            (None, '>') => return Some(idx + 1),
            _ => {}
        }
    }
    None
}

fn tag(raw: &str) -> Result<Token<'_>> {
    let inner = &raw[1..raw.len() - 1];
    if let Some(name) = inner.strip_prefix('/') {
        let name = name.trim_end();
        check_name(name)?;
        return Ok(Token::End { name });
    }
    let (body, empty) = match inner.strip_suffix('/') {
        Some(body) => (body, true),
        None => (inner, false),
    };
    let name = body.split(|c: char| c.is_whitespace()).next().unwrap_or("");
    check_name(name)?;
    Ok(if empty {
        Token::Empty { raw }
    } else {
        Token::Start { name, raw }
    })
}

fn check_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        bail!("invalid tag name {:?}", name);
    }
    Ok(())
}
