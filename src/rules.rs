//! Declarative field rules and record validation.
//!
//! Rules are written as short strings next to each field (`required`,
//! `format:<regex>`, `range:<min>..<max>`, `precision:<n>`, `formula:<expr>`,
//! `enum:a|b|c`). They are parsed once on load and evaluated read-only
//! against the current values. Violations are reported as
//! [`ValidationWarning`]s and never block an edit.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::schema::{value_as_f64, value_to_plain_string, ExtractionRecord, Field};

/// Default absolute tolerance when comparing a formula result to a field value.
pub const DEFAULT_FORMULA_TOLERANCE: f64 = 0.005;

/// A rule as written in the payload plus its parsed meaning.
///
/// The source text is what gets exported, so a rule always round-trips
/// byte-for-byte even when it is an unrecognized free-text note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Rule {
    source: String,
    kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Required,
    Pattern(Pattern),
    Range { min: Option<f64>, max: Option<f64> },
    Precision(u32),
    Formula(Expr),
    OneOf(Vec<String>),
    /// Free text with no machine meaning.
    Note,
    /// A recognized rule whose argument could not be parsed.
    Malformed(String),
}

impl Rule {
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        let kind = match trimmed.split_once(':') {
            None if trimmed.eq_ignore_ascii_case("required") => RuleKind::Required,
            None => RuleKind::Note,
            Some((key, arg)) => match key.trim().to_lowercase().as_str() {
                "format" | "pattern" | "regex" => match Pattern::new(arg) {
                    Ok(pattern) => RuleKind::Pattern(pattern),
                    Err(e) => RuleKind::Malformed(format!("invalid pattern: {}", e)),
                },
                "range" => parse_range(arg),
                "min" => match parse_bound(arg) {
                    Ok(min) => RuleKind::Range { min, max: None },
                    Err(reason) => RuleKind::Malformed(reason),
                },
                "max" => match parse_bound(arg) {
                    Ok(max) => RuleKind::Range { min: None, max },
                    Err(reason) => RuleKind::Malformed(reason),
                },
                "precision" => match arg.trim().parse::<u32>() {
                    Ok(places) => RuleKind::Precision(places),
                    Err(_) => RuleKind::Malformed(format!("invalid precision '{}'", arg.trim())),
                },
                "formula" => match Expr::parse(arg) {
                    Ok(expr) => RuleKind::Formula(expr),
                    Err(reason) => RuleKind::Malformed(format!("invalid formula: {}", reason)),
                },
                "enum" | "one_of" => RuleKind::OneOf(
                    arg.split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                ),
                _ => RuleKind::Note,
            },
        };

        if let RuleKind::Malformed(reason) = &kind {
            debug!("Rule '{}' kept but unusable: {}", source, reason);
        }

        Self {
            source: source.to_string(),
            kind,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn formula(&self) -> Option<&Expr> {
        match &self.kind {
            RuleKind::Formula(expr) => Some(expr),
            _ => None,
        }
    }

    /// Evaluate this rule for `field`. `None` means the rule is satisfied.
    pub fn check(
        &self,
        field: &Field,
        record: &ExtractionRecord,
        tolerance: f64,
    ) -> Option<ValidationWarning> {
        let empty = is_empty_value(&field.value);
        let message = match &self.kind {
            RuleKind::Required if empty => Some("value is required".to_string()),
            RuleKind::Required | RuleKind::Note => None,
            RuleKind::Malformed(reason) => Some(format!("rule cannot be evaluated: {}", reason)),
            _ if empty => None,
            RuleKind::Pattern(pattern) => {
                let text = value_to_plain_string(&field.value);
                (!pattern.is_match(&text)).then(|| {
                    format!("'{}' does not match format {}", text, pattern.as_str())
                })
            }
            RuleKind::Range { min, max } => match field.as_f64() {
                None => Some("value is not numeric".to_string()),
                Some(n) if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) => {
                    Some(format!("{} is outside {}", n, describe_range(*min, *max)))
                }
                Some(_) => None,
            },
            RuleKind::Precision(places) => {
                let text = value_to_plain_string(&field.value);
                if field.as_f64().is_none() {
                    Some("value is not numeric".to_string())
                } else {
                    let found = decimal_places(&field.value);
                    (found > *places as usize).then(|| {
                        format!("{} has {} decimal places, at most {} allowed", text, found, places)
                    })
                }
            }
            RuleKind::Formula(expr) => {
                let check = evaluate_formula(field, expr, record, tolerance);
                check.message
            }
            RuleKind::OneOf(options) => {
                let text = value_to_plain_string(&field.value);
                (!options.iter().any(|o| *o == text))
                    .then(|| format!("'{}' is not one of: {}", text, options.join(", ")))
            }
        }?;

        Some(ValidationWarning {
            field: field.name.clone(),
            rule: self.source.clone(),
            message,
        })
    }
}

impl From<String> for Rule {
    fn from(source: String) -> Self {
        Rule::parse(&source)
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.source
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A `format:` rule compiled once at parse time. Equality is by pattern text.
#[derive(Debug, Clone)]
pub struct Pattern {
    text: String,
    regex: Regex,
}

impl Pattern {
    fn new(text: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})$", text))?;
        Ok(Self {
            text: text.to_string(),
            regex,
        })
    }

    /// The pattern as written, without anchors.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the whole of `text` matches.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

fn parse_bound(raw: &str) -> Result<Option<f64>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid bound '{}'", raw))
}

fn parse_range(arg: &str) -> RuleKind {
    let Some((lo, hi)) = arg.split_once("..") else {
        return RuleKind::Malformed(format!("range '{}' must look like min..max", arg.trim()));
    };
    match (parse_bound(lo), parse_bound(hi)) {
        (Ok(min), Ok(max)) => RuleKind::Range { min, max },
        (Err(reason), _) | (_, Err(reason)) => RuleKind::Malformed(reason),
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{}, {}]", lo, hi),
        (Some(lo), None) => format!(">= {}", lo),
        (None, Some(hi)) => format!("<= {}", hi),
        (None, None) => "any value".to_string(),
    }
}

/// Decimal places as written for strings. JSON numbers count only
/// significant places, so a stored `1250.0` has none.
fn decimal_places(value: &serde_json::Value) -> usize {
    let text = value_to_plain_string(value);
    let mantissa = text.split(&['e', 'E'][..]).next().unwrap_or("");
    let frac = mantissa
        .split_once('.')
        .map(|(_, frac)| frac.trim())
        .unwrap_or("");
    match value {
        serde_json::Value::Number(_) => frac.trim_end_matches('0').len(),
        _ => frac.len(),
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// A rule violation. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub rule: String,
    pub message: String,
}

/// Result of evaluating one formula rule, for display next to the field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormulaCheck {
    pub field: String,
    pub formula: String,
    pub expected: Option<f64>,
    pub actual: Option<f64>,
    pub matches: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn evaluate_formula(
    field: &Field,
    expr: &Expr,
    record: &ExtractionRecord,
    tolerance: f64,
) -> FormulaCheck {
    let actual = field.as_f64();
    let lookup = |name: &str| record.field(name).and_then(Field::as_f64);
    let (expected, message) = match expr.eval(&lookup) {
        Ok(expected) => {
            let message = match actual {
                None => Some(format!(
                    "value is not numeric; formula {} gives {}",
                    expr,
                    round_for_display(expected)
                )),
                Some(a) if (a - expected).abs() > tolerance => Some(format!(
                    "expected {} from {}, found {}",
                    round_for_display(expected),
                    expr,
                    a
                )),
                Some(_) => None,
            };
            (Some(expected), message)
        }
        Err(e) => (None, Some(format!("formula {} cannot be evaluated: {}", expr, e))),
    };

    FormulaCheck {
        field: field.name.clone(),
        formula: expr.to_string(),
        expected,
        actual,
        matches: message.is_none(),
        message,
    }
}

fn round_for_display(n: f64) -> f64 {
    (n * 1e6).round() / 1e6
}

/// Evaluate every rule on every field.
pub fn validate_record(record: &ExtractionRecord, tolerance: f64) -> Vec<ValidationWarning> {
    record
        .fields()
        .iter()
        .flat_map(|field| {
            field
                .rules
                .iter()
                .filter_map(move |rule| rule.check(field, record, tolerance))
        })
        .collect()
}

/// Rules affected by an edit to `name`: the field's own rules plus every
/// formula on another field that reads it.
pub fn validate_after_edit(
    record: &ExtractionRecord,
    name: &str,
    tolerance: f64,
) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    for field in record.fields() {
        let own = field.name == name;
        for rule in &field.rules {
            let dependent = rule.formula().is_some_and(|expr| expr.references(name));
            if own || dependent {
                warnings.extend(rule.check(field, record, tolerance));
            }
        }
    }
    warnings
}

/// Formula results for every formula rule in the record. Display only; nothing
/// is written back.
pub fn check_formulas(record: &ExtractionRecord, tolerance: f64) -> Vec<FormulaCheck> {
    record
        .fields()
        .iter()
        .flat_map(|field| {
            field.rules.iter().filter_map(move |rule| {
                rule.formula()
                    .map(|expr| evaluate_formula(field, expr, record, tolerance))
            })
        })
        .collect()
}

// ============================================================================
// Formula expressions
// ============================================================================

/// Arithmetic over field values: `+ - * /`, unary minus, parentheses.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("field '{0}' has no numeric value")]
    MissingField(String),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinOp::Mul } else { BinOp::Div };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => Ok(Expr::Field(name)),
            Some(Token::Op('-')) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(tok) => Err(format!("unexpected {:?}", tok)),
            None => Err("unexpected end of formula".to_string()),
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, String> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err("empty formula".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(format!("unexpected {:?}", parser.tokens[parser.pos]));
        }
        Ok(expr)
    }

    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, EvalError> {
        match self {
            Self::Num(n) => Ok(*n),
            Self::Field(name) => lookup(name).ok_or_else(|| EvalError::MissingField(name.clone())),
            Self::Neg(inner) => Ok(-inner.eval(lookup)?),
            Self::Binary(lhs, op, rhs) => {
                let (a, b) = (lhs.eval(lookup)?, rhs.eval(lookup)?);
                match op {
                    BinOp::Add => Ok(a + b),
                    BinOp::Sub => Ok(a - b),
                    BinOp::Mul => Ok(a * b),
                    BinOp::Div if b == 0.0 => Err(EvalError::DivisionByZero),
                    BinOp::Div => Ok(a / b),
                }
            }
        }
    }

    /// Whether the expression reads the named field.
    pub fn references(&self, name: &str) -> bool {
        match self {
            Self::Num(_) => false,
            Self::Field(f) => f == name,
            Self::Neg(inner) => inner.references(name),
            Self::Binary(lhs, _, rhs) => lhs.references(name) || rhs.references(name),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", n),
            Self::Field(name) => f.write_str(name),
            Self::Neg(inner) => write!(f, "-{}", inner),
            Self::Binary(lhs, op, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}
