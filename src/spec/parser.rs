//! Line-oriented parser for `.nap` and `.naplist` files.
//!
//! A request file is either a single `<METHOD> <URL>` line (optionally
//! followed by sections) or a sequence of `[section]` blocks holding
//! `key = value` lines. `#` starts a comment line everywhere except inside a
//! `"""` body block.

use std::collections::BTreeMap;

use regex::Regex;

use super::{Body, DEFAULT_BODY_CONTENT_TYPE, Meta, PlaylistSpec, RequestSpec, ScriptHooks, Step};
use crate::environment::{Variables, unquote};
use crate::error::ParseError;
use crate::http::HttpMethod;
use crate::testing::{Assertion, AssertionOperator, AssertionTarget, parse_duration_ms};

const BODY_DELIMITER: &str = "\"\"\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Meta,
    Vars,
    Request,
    RequestHeaders,
    RequestBody,
    Assert,
    Script,
    Steps,
}

impl Section {
    fn from_header(name: &str, line: usize) -> Result<Self, ParseError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "meta" => Ok(Section::Meta),
            "vars" => Ok(Section::Vars),
            "request" => Ok(Section::Request),
            "request.headers" => Ok(Section::RequestHeaders),
            "request.body" => Ok(Section::RequestBody),
            "assert" => Ok(Section::Assert),
            "script" => Ok(Section::Script),
            "steps" => Ok(Section::Steps),
            other => Err(ParseError::new(line, format!("unknown section `[{other}]`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Request,
    Playlist,
}

/// Everything a file can declare; narrowed into a request or playlist spec.
#[derive(Debug, Default)]
struct Document {
    meta: Meta,
    env: Option<String>,
    vars: Variables,
    method: Option<HttpMethod>,
    url: Option<String>,
    headers: BTreeMap<String, String>,
    body_content: Option<String>,
    body_content_type: Option<String>,
    assertions: Vec<Assertion>,
    script: ScriptHooks,
    steps: Vec<Step>,
}

struct Parser {
    kind: DocumentKind,
    section: Option<Section>,
    /// Open `"""` block: start line and collected lines.
    body_block: Option<(usize, Vec<String>)>,
    seen_content: bool,
    shorthand_error: Option<ParseError>,
    doc: Document,
}

impl Parser {
    fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            section: None,
            body_block: None,
            seen_content: false,
            shorthand_error: None,
            doc: Document::default(),
        }
    }

    fn parse(mut self, input: &str) -> Result<Document, ParseError> {
        for (index, raw_line) in input.lines().enumerate() {
            self.line(index + 1, raw_line)?;
        }

        if let Some((start, _)) = self.body_block {
            return Err(ParseError::new(start, "unterminated `\"\"\"` body block"));
        }
        if self.doc.url.is_none() {
            if let Some(err) = self.shorthand_error {
                return Err(err);
            }
        }
        Ok(self.doc)
    }

    fn line(&mut self, number: usize, raw_line: &str) -> Result<(), ParseError> {
        let trimmed = raw_line.trim();

        if self.body_block.is_some() {
            if trimmed == BODY_DELIMITER {
                if let Some((_, lines)) = self.body_block.take() {
                    self.doc.body_content = Some(lines.join("\n"));
                }
            } else if let Some((_, lines)) = &mut self.body_block {
                lines.push(raw_line.to_string());
            }
            return Ok(());
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(());
        }

        let first_content = !self.seen_content;
        self.seen_content = true;

        if let Some(header) = trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            self.section = Some(Section::from_header(header, number)?);
            return Ok(());
        }

        match self.section {
            None if first_content && self.kind == DocumentKind::Request => {
                self.shorthand(number, trimmed);
                Ok(())
            }
            None => Ok(()),
            Some(Section::Meta) => self.meta(number, trimmed),
            Some(Section::Vars) => {
                let (key, value) = key_value(number, trimmed)?;
                self.doc.vars.insert(key, value);
                Ok(())
            }
            Some(Section::Request) => self.request(number, trimmed),
            Some(Section::RequestHeaders) => {
                let (key, value) = key_value(number, trimmed)?;
                self.doc.headers.insert(key, value);
                Ok(())
            }
            Some(Section::RequestBody) => self.body(number, trimmed),
            Some(Section::Assert) => {
                let assertion = parse_assertion(trimmed).map_err(|message| ParseError::new(number, message))?;
                self.doc.assertions.push(assertion);
                Ok(())
            }
            Some(Section::Script) => {
                let (key, value) = key_value(number, trimmed)?;
                match key.as_str() {
                    "pre" => self.doc.script.pre = Some(value),
                    "post" => self.doc.script.post = Some(value),
                    _ => {}
                }
                Ok(())
            }
            Some(Section::Steps) => {
                self.doc.steps.push(Step::classify(unquote(trimmed)));
                Ok(())
            }
        }
    }

    /// A first line outside any section must be `<METHOD> <URL>`. The error
    /// is only reported if no section supplies the URL later on.
    fn shorthand(&mut self, number: usize, line: &str) {
        match method_line(line) {
            Some((method, url)) => {
                self.doc.method = Some(method);
                self.doc.url = Some(url);
            }
            None => {
                self.shorthand_error = Some(ParseError::new(
                    number,
                    format!("expected `<METHOD> <URL>` or a section header, found `{line}`"),
                ));
            }
        }
    }

    fn meta(&mut self, number: usize, line: &str) -> Result<(), ParseError> {
        let (key, value) = key_value(number, line)?;
        match key.as_str() {
            "name" => self.doc.meta.name = Some(value),
            "description" => self.doc.meta.description = Some(value),
            "tags" => self.doc.meta.tags = parse_tags(&value),
            "env" => self.doc.env = Some(value),
            _ => {}
        }
        Ok(())
    }

    fn request(&mut self, number: usize, line: &str) -> Result<(), ParseError> {
        if let Some((method, url)) = method_line(line) {
            self.doc.method = Some(method);
            self.doc.url = Some(url);
            return Ok(());
        }

        let (key, value) = key_value(number, line)?;
        match key.as_str() {
            "method" => {
                let method = value
                    .parse::<HttpMethod>()
                    .map_err(|message| ParseError::new(number, message))?;
                self.doc.method = Some(method);
            }
            "url" => self.doc.url = Some(value),
            _ => {}
        }
        Ok(())
    }

    fn body(&mut self, number: usize, line: &str) -> Result<(), ParseError> {
        if line == BODY_DELIMITER {
            self.body_block = Some((number, Vec::new()));
            return Ok(());
        }

        let (key, value) = key_value(number, line)?;
        match key.as_str() {
            "content" => self.doc.body_content = Some(value),
            "content-type" | "contentType" | "content_type" => self.doc.body_content_type = Some(value),
            _ => {}
        }
        Ok(())
    }
}

fn key_value(number: usize, line: &str) -> Result<(String, String), ParseError> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| ParseError::new(number, format!("expected `key = value`, found `{line}`")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ParseError::new(number, format!("missing key in `{line}`")));
    }
    Ok((key.to_string(), unquote(value.trim()).to_string()))
}

fn method_line(line: &str) -> Option<(HttpMethod, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.parse::<HttpMethod>().ok()?;
    let url = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((method, url.to_string()))
}

fn parse_tags(value: &str) -> Vec<String> {
    let inner = value
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(value);
    inner
        .split(',')
        .map(|tag| unquote(tag.trim()).to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Parse the text of one `.nap` file.
pub fn parse_request(input: &str) -> Result<RequestSpec, ParseError> {
    let doc = Parser::new(DocumentKind::Request).parse(input)?;

    let url = doc
        .url
        .ok_or_else(|| ParseError::new(1, "request has no URL"))?;

    let body = doc.body_content.map(|content| Body {
        content_type: doc
            .body_content_type
            .unwrap_or_else(|| DEFAULT_BODY_CONTENT_TYPE.to_string()),
        content,
    });

    Ok(RequestSpec {
        meta: doc.meta,
        vars: doc.vars,
        request: super::Request {
            method: doc.method.unwrap_or_default(),
            url,
            headers: doc.headers,
            body,
        },
        assertions: doc.assertions,
        script: doc.script,
    })
}

/// Parse the text of one `.naplist` file.
pub fn parse_playlist(input: &str) -> Result<PlaylistSpec, ParseError> {
    let doc = Parser::new(DocumentKind::Playlist).parse(input)?;
    Ok(PlaylistSpec {
        meta: doc.meta,
        env: doc.env,
        vars: doc.vars,
        steps: doc.steps,
    })
}

/// Parse one `[assert]` line.
pub fn parse_assertion(line: &str) -> Result<Assertion, String> {
    let line = line.trim();
    let split = line
        .find(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>'))
        .unwrap_or(line.len());
    let (target_text, rest) = line.split_at(split);
    let target = parse_target(target_text)?;
    let rest = rest.trim();

    let unknown = || format!("unrecognized assertion `{line}`");

    if let Some(value) = rest.strip_prefix('=') {
        if target == AssertionTarget::Duration {
            return Err(format!("`duration` only supports `<` and `>`: `{line}`"));
        }
        let value = value.strip_prefix('=').unwrap_or(value);
        return Ok(Assertion::new(target, AssertionOperator::Equals(unquote(value.trim()).to_string())));
    }

    if let Some(comparison) = rest.chars().next().filter(|c| matches!(c, '<' | '>')) {
        if target != AssertionTarget::Duration {
            return Err(format!("`{comparison}` is only supported for `duration`: `{line}`"));
        }
        let literal = unquote(rest[1..].trim()).to_string();
        if !literal.contains("{{") && parse_duration_ms(&literal).is_none() {
            return Err(format!("invalid duration `{literal}`, expected `<number>ms` or `<number>s`"));
        }
        let operator = if comparison == '<' {
            AssertionOperator::LessThan(literal)
        } else {
            AssertionOperator::GreaterThan(literal)
        };
        return Ok(Assertion::new(target, operator));
    }

    if target == AssertionTarget::Duration {
        return Err(unknown());
    }

    let (keyword, operand) = match rest.split_once(char::is_whitespace) {
        Some((keyword, operand)) => (keyword, unquote(operand.trim()).to_string()),
        None => (rest, String::new()),
    };
    let operator = match keyword {
        "exists" if operand.is_empty() => AssertionOperator::Exists,
        "contains" => AssertionOperator::Contains(operand),
        "matches" => {
            if !operand.contains("{{") {
                Regex::new(&operand).map_err(|err| format!("invalid pattern `{operand}`: {err}"))?;
            }
            AssertionOperator::Matches(operand)
        }
        _ => return Err(unknown()),
    };
    Ok(Assertion::new(target, operator))
}

fn parse_target(text: &str) -> Result<AssertionTarget, String> {
    match text {
        "status" => return Ok(AssertionTarget::Status),
        "body" => return Ok(AssertionTarget::Body),
        "duration" => return Ok(AssertionTarget::Duration),
        _ => {}
    }
    if let Some(path) = text.strip_prefix("body.").filter(|path| !path.is_empty()) {
        return Ok(AssertionTarget::BodyPath(path.to_string()));
    }
    if let Some(name) = text.strip_prefix("headers.").filter(|name| !name.is_empty()) {
        return Ok(AssertionTarget::Header(name.to_string()));
    }
    Err(format!("unknown assertion target `{text}`"))
}
