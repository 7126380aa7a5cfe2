//! Label selector used by metadata queries.
//!
//! Grammar: `{` [ matcher { `,` matcher } ] `}` where a matcher is
//! `name = "value"` or `name != "value"`. An empty string selects everything.

use crate::proto::BlockMeta;
use crate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    /// A missing label has the empty value, so `env!="dev"` matches blocks
    /// without an `env` label.
    fn matches(
        &self,
        block: &BlockMeta,
    ) -> bool {
        let value = block
            .labels
            .iter()
            .find(|l| l.name == self.name)
            .map(|l| l.value.as_str())
            .unwrap_or("");
        match self.op {
            MatchOp::Equal => value == self.value,
            MatchOp::NotEqual => value != self.value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub matchers: Vec<LabelMatcher>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }
        let body = input
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| invalid(input, "selector must be enclosed in braces"))?;

        let mut parser = Parser {
            input,
            chars: body.chars().collect(),
            pos: 0,
        };
        let mut matchers = Vec::new();
        parser.skip_ws();
        while !parser.eof() {
            matchers.push(parser.matcher()?);
            parser.skip_ws();
            if parser.eof() {
                break;
            }
            parser.expect(',')?;
            parser.skip_ws();
        }
        Ok(Self { matchers })
    }

    pub fn matches(
        &self,
        block: &BlockMeta,
    ) -> bool {
        self.matchers.iter().all(|m| m.matches(block))
    }
}

fn invalid(
    input: &str,
    reason: &str,
) -> ValidationError {
    ValidationError::InvalidQuery(format!("{}: {}", reason, input))
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(
        &mut self,
        c: char,
    ) -> Result<(), ValidationError> {
        if self.peek() != Some(c) {
            return Err(invalid(self.input, &format!("expected '{}' at {}", c, self.pos)));
        }
        self.pos += 1;
        Ok(())
    }

    fn matcher(&mut self) -> Result<LabelMatcher, ValidationError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(invalid(self.input, "expected label name"));
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        self.skip_ws();
        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                MatchOp::Equal
            }
            Some('!') => {
                self.pos += 1;
                self.expect('=')?;
                MatchOp::NotEqual
            }
            _ => return Err(invalid(self.input, "expected '=' or '!='")),
        };
        self.skip_ws();
        let value = self.quoted()?;
        Ok(LabelMatcher { name, op, value })
    }

    fn quoted(&mut self) -> Result<String, ValidationError> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(invalid(self.input, "unterminated string")),
                Some('"') => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self
                        .peek()
                        .ok_or_else(|| invalid(self.input, "unterminated escape"))?;
                    value.push(escaped);
                    self.pos += 1;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}
