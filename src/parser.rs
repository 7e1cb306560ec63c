//! C3 — the static parser (spec.md §4.C3).
//!
//! Recognizes the `describe`/`context`/`it`/`fit`/`xit`/`skip` call-with-block
//! syntax and `#load "path"` directives directly in spec-file source text,
//! without ever handing the file to a script evaluator. This is what backs
//! `list` and `validate`: both need the tree shape and `#load` edges cheaply
//! and without side effects, even for files that wouldn't evaluate cleanly.

use std::path::PathBuf;

use crate::error::Kind;

const CONTEXT_KEYWORDS: &[&str] = &["describe", "context"];
const SPEC_KEYWORDS: &[(&str, SpecKind)] = &[
    ("it", SpecKind::Regular),
    ("fit", SpecKind::Focused),
    ("xit", SpecKind::Skipped),
    ("skip", SpecKind::Skipped),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Regular,
    Focused,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSpec {
    pub description: String,
    pub context_path: Vec<String>,
    pub line: u32,
    pub kind: SpecKind,
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticParseWarning {
    pub line: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDirective {
    pub line: u32,
    pub raw_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticParseResult {
    pub specs: Vec<StaticSpec>,
    pub warnings: Vec<StaticParseWarning>,
    pub loads: Vec<LoadDirective>,
    /// False as soon as any warning was recorded - downstream consumers know
    /// the tree shape is best-effort (spec.md §4.C3 "Completeness flag").
    pub complete: bool,
}

/// Parses `source` (the contents of `path`, used only for error messages).
/// Never executes anything; unrecoverable syntax (unterminated string or
/// brace) is a `ParseError` carrying file+line, everything else degrades to
/// a `StaticParseWarning` and a placeholder description.
pub fn parse(path: &PathBuf, source: &str) -> Result<StaticParseResult, Kind> {
    let mut scanner = Scanner::new(source);
    let mut result = StaticParseResult { complete: true, ..Default::default() };
    parse_block(&mut scanner, &mut Vec::new(), &mut result, true).map_err(|e| match e {
        Kind::ParseError(msg) => Kind::ParseError(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    Ok(result)
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self { chars: source.chars().collect(), pos: 0, line: 1 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    /// Skips whitespace, `//` line comments and `/* */` block comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        if self.eof() {
                            break;
                        }
                        if self.peek() == Some('*') && self.peek_at(1) == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Reads a `"..."` string literal, the cursor sitting on the opening
    /// quote. Returns its decoded contents, or `None` on an unterminated
    /// literal (caller turns that into a `ParseError`).
    fn read_string(&mut self) -> Option<String> {
        debug_assert_eq!(self.peek(), Some('"'));
        self.advance();
        let mut out = String::new();
        loop {
            match self.advance()? {
                '"' => return Some(out),
                '\\' => {
                    let escaped = self.advance()?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c => out.push(c),
            }
        }
    }

    /// Reads a bare identifier (ASCII alnum/underscore run).
    fn read_ident(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
                self.advance();
            } else {
                break;
            }
        }
        out
    }
}

/// Reads a `{ ... }` block, cursor positioned on the opening brace. Returns
/// the span of its contents (start, end exclusive of braces), respecting
/// nested braces and string literals, and leaves the cursor just past the
/// matching `}`.
fn read_block(s: &mut Scanner) -> Result<(usize, usize), Kind> {
    debug_assert_eq!(s.peek(), Some('{'));
    s.advance();
    let content_start = s.pos;
    let mut depth = 1u32;
    loop {
        match s.peek() {
            None => {
                return Err(Kind::ParseError(format!("unterminated block at line {}", s.line)))
            }
            Some('"') => {
                if s.read_string().is_none() {
                    return Err(Kind::ParseError(format!(
                        "unterminated string literal at line {}",
                        s.line
                    )));
                }
            }
            Some('{') => {
                depth += 1;
                s.advance();
            }
            Some('}') => {
                depth -= 1;
                let end = s.pos;
                s.advance();
                if depth == 0 {
                    return Ok((content_start, end));
                }
            }
            _ => {
                s.advance();
            }
        }
    }
}

/// Skips an arbitrary argument expression up to (not including) the next
/// top-level `,` or `)`, respecting nested parens/braces/strings. Used for
/// non-literal description arguments and trailing non-block arguments we
/// don't otherwise care about.
fn skip_expr(s: &mut Scanner) -> Result<(), Kind> {
    let mut depth = 0u32;
    loop {
        match s.peek() {
            None => {
                return Err(Kind::ParseError(format!(
                    "unterminated argument list at line {}",
                    s.line
                )))
            }
            Some(',') | Some(')') if depth == 0 => return Ok(()),
            Some('"') => {
                if s.read_string().is_none() {
                    return Err(Kind::ParseError(format!(
                        "unterminated string literal at line {}",
                        s.line
                    )));
                }
            }
            Some('(') | Some('{') => {
                depth += 1;
                s.advance();
            }
            Some(')') | Some('}') => {
                depth -= 1;
                s.advance();
            }
            Some(_) => {
                s.advance();
            }
        }
    }
}

/// Consumes a call's argument list, cursor positioned just after the
/// opening `(`. The dialect's shape is `name("description", { body })`: the
/// first argument is the description (a literal, ideally), the second - if
/// present and itself a literal block - is the body. Leaves the cursor just
/// past the matching `)`.
fn read_call_args(s: &mut Scanner) -> Result<(Option<String>, bool, Option<(usize, usize)>), Kind> {
    s.skip_trivia();
    let mut first_literal = None;
    let mut dynamic = false;

    if s.peek() == Some('"') {
        first_literal = s.read_string();
        if first_literal.is_none() {
            return Err(Kind::ParseError(format!("unterminated string literal at line {}", s.line)));
        }
    } else if s.peek() != Some(')') {
        dynamic = true;
        skip_expr(s)?;
    }

    s.skip_trivia();
    let mut body = None;
    if s.peek() == Some(',') {
        s.advance();
        s.skip_trivia();
        if s.peek() == Some('{') {
            body = Some(read_block(s)?);
        } else if s.peek() != Some(')') {
            skip_expr(s)?;
        }
    }

    s.skip_trivia();
    match s.peek() {
        Some(')') => {
            s.advance();
        }
        _ => return Err(Kind::ParseError(format!("malformed argument list at line {}", s.line))),
    }

    Ok((first_literal, dynamic, body))
}

fn parse_load_directive(s: &mut Scanner, result: &mut StaticParseResult) {
    let line = s.line;
    let ident = s.read_ident();
    if ident != "load" {
        return;
    }
    s.skip_trivia();
    if s.peek() == Some('"') {
        if let Some(path) = s.read_string() {
            result.loads.push(LoadDirective { line, raw_path: path });
            return;
        }
    }
    result.warnings.push(StaticParseWarning {
        line,
        reason: "#load directive missing a quoted path".to_owned(),
    });
    result.complete = false;
}

fn parse_block(
    s: &mut Scanner,
    context_path: &mut Vec<String>,
    result: &mut StaticParseResult,
    top_level: bool,
) -> Result<(), Kind> {
    loop {
        s.skip_trivia();
        if s.eof() {
            break;
        }
        if !top_level && s.peek() == Some('}') {
            break;
        }
        if s.peek() == Some('#') {
            s.advance();
            parse_load_directive(s, result);
            continue;
        }
        if !s.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            s.advance();
            continue;
        }

        let line = s.line;
        let ident = s.read_ident();
        s.skip_trivia();
        if s.peek() != Some('(') {
            continue;
        }
        s.advance();

        if CONTEXT_KEYWORDS.contains(&ident.as_str()) {
            let (description, dynamic, body) = read_call_args(s)?;
            if dynamic || description.is_none() {
                result.warnings.push(StaticParseWarning {
                    line,
                    reason: format!("{ident} description is not a literal string"),
                });
                result.complete = false;
            }
            let description = description.unwrap_or_else(|| "<dynamic>".to_owned());

            match body {
                Some((start, end)) => {
                    let inner: String = s.chars[start..end].iter().collect();
                    context_path.push(description);
                    let mut nested = Scanner::new(&inner);
                    parse_block(&mut nested, context_path, result, true)?;
                    context_path.pop();
                }
                None => {
                    result.warnings.push(StaticParseWarning {
                        line,
                        reason: format!("{ident} has no block body"),
                    });
                    result.complete = false;
                }
            }
            continue;
        }

        if let Some((_, kind)) = SPEC_KEYWORDS.iter().find(|pair| pair.0 == ident.as_str()) {
            let (description, dynamic, body) = read_call_args(s)?;
            if dynamic || description.is_none() {
                result.warnings.push(StaticParseWarning {
                    line,
                    reason: format!("{ident} description is not a literal string"),
                });
                result.complete = false;
            }
            let description = description.unwrap_or_else(|| "<dynamic>".to_owned());

            result.specs.push(StaticSpec {
                description,
                context_path: context_path.clone(),
                line,
                kind: *kind,
                pending: body.is_none(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(src: &str) -> StaticParseResult {
        parse(&PathBuf::from("fixture.spec"), src).unwrap()
    }

    #[test]
    fn flat_specs_in_declaration_order() {
        let result = parse_str(
            r#"
            describe("A", {
                it("x", {
                    assert(1 == 1);
                });
                it("y pending");
            });
            "#,
        );
        assert!(result.complete);
        assert_eq!(result.specs.len(), 2);
        assert_eq!(result.specs[0].description, "x");
        assert_eq!(result.specs[0].context_path, vec!["A".to_owned()]);
        assert!(!result.specs[0].pending);
        assert_eq!(result.specs[1].description, "y pending");
        assert!(result.specs[1].pending);
    }

    #[test]
    fn focused_and_skipped_kinds() {
        let result = parse_str(
            r#"
            describe("A", {
                it("x", {});
                fit("y", {});
                xit("z");
            });
            "#,
        );
        assert_eq!(result.specs[0].kind, SpecKind::Regular);
        assert_eq!(result.specs[1].kind, SpecKind::Focused);
        assert_eq!(result.specs[2].kind, SpecKind::Skipped);
        assert!(result.specs[2].pending);
    }

    #[test]
    fn nested_context_builds_path() {
        let result = parse_str(
            r#"
            describe("A", {
                context("B", {
                    it("deep", {});
                });
            });
            "#,
        );
        assert_eq!(result.specs[0].context_path, vec!["A".to_owned(), "B".to_owned()]);
    }

    #[test]
    fn dynamic_description_warns_but_still_emits() {
        let result = parse_str(
            r#"
            describe("A", {
                it(compute_name(), {});
            });
            "#,
        );
        assert!(!result.complete);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.specs[0].description, "<dynamic>");
    }

    #[test]
    fn load_directive_is_recorded() {
        let result = parse_str(
            r#"
            #load "helpers.csx"
            describe("A", { it("x", {}); });
            "#,
        );
        assert_eq!(result.loads.len(), 1);
        assert_eq!(result.loads[0].raw_path, "helpers.csx");
    }

    #[test]
    fn unterminated_string_is_parse_error() {
        let err = parse(&PathBuf::from("bad.spec"), r#"describe("A, { it("x", {}); });"#).unwrap_err();
        assert!(matches!(err, Kind::ParseError(_)));
    }
}
