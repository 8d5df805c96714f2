//! Path queries over untyped JSON documents.
//!
//! A query is a chain of navigation steps applied to a [`serde_json::Value`]:
//!
//! ```text
//! .users[*].name      every user's name
//! users[0].score      first user's score (leading '.' is optional)
//! .data["a key"][-1]  quoted keys and negative indices
//! .                   the input itself
//! ```
//!
//! `[]` is accepted as a synonym of `[*]`. A query without a wildcard
//! resolves to at most one value; a query with a wildcard fans out into one
//! branch per array element and always yields a sequence.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing a query expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryParseError {
    #[error("unexpected '{found}' at offset {offset} in query `{query}`")]
    Unexpected {
        query: String,
        offset: usize,
        found: char,
    },

    #[error("unterminated {what} in query `{query}`")]
    Unterminated { query: String, what: &'static str },

    #[error("invalid array index '{index}' in query `{query}`")]
    InvalidIndex { query: String, index: String },
}

/// A single navigation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Object member lookup.
    Key(String),
    /// Array element lookup; negative values count from the end.
    Index(i64),
    /// Expand every element of an array.
    Each,
}

/// Outcome of evaluating a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult<'v> {
    /// The path did not resolve.
    NotFound,
    /// A wildcard-free path resolved to exactly one value.
    Value(&'v Value),
    /// A wildcard path; branches that did not resolve are dropped.
    Sequence(Vec<&'v Value>),
}

impl QueryResult<'_> {
    /// Short description of the result shape, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryResult::NotFound => "nothing",
            QueryResult::Value(value) => value_kind(value),
            QueryResult::Sequence(_) => "sequence",
        }
    }
}

/// Name of a JSON value's variant.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A parsed, reusable query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    source: String,
    steps: Vec<Step>,
}

impl Query {
    /// Parse a query expression.
    ///
    /// # Example
    /// ```
    /// use json2prom_common::query::{Query, QueryResult};
    /// use serde_json::json;
    ///
    /// let doc = json!({"users": [{"name": "alice"}, {"name": "bob"}]});
    /// let query = Query::parse(".users[*].name").unwrap();
    ///
    /// match query.evaluate(&doc) {
    ///     QueryResult::Sequence(names) => assert_eq!(names.len(), 2),
    ///     other => panic!("unexpected result: {:?}", other),
    /// }
    /// ```
    pub fn parse(source: &str) -> Result<Self, QueryParseError> {
        let trimmed = source.trim();
        let steps = Parser::new(trimmed).parse_path()?;
        Ok(Self {
            source: trimmed.to_string(),
            steps,
        })
    }

    /// The query that returns its input unchanged.
    pub fn identity() -> Self {
        Self {
            source: ".".to_string(),
            steps: Vec::new(),
        }
    }

    /// The navigation steps of this query.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether this query returns its input unchanged.
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether this query fans out over array elements.
    pub fn has_wildcard(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Each))
    }

    /// Evaluate this query against a JSON value.
    ///
    /// Evaluation is pure: the same query and input always produce the same
    /// result, in document order.
    pub fn evaluate<'v>(&self, input: &'v Value) -> QueryResult<'v> {
        let mut found = Vec::new();
        walk(input, &self.steps, &mut found);

        if self.has_wildcard() {
            QueryResult::Sequence(found)
        } else {
            match found.pop() {
                Some(value) => QueryResult::Value(value),
                None => QueryResult::NotFound,
            }
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn walk<'v>(value: &'v Value, steps: &[Step], out: &mut Vec<&'v Value>) {
    let Some((step, rest)) = steps.split_first() else {
        out.push(value);
        return;
    };

    match step {
        Step::Key(key) => {
            if let Some(child) = value.as_object().and_then(|m| m.get(key)) {
                walk(child, rest, out);
            }
        }
        Step::Index(index) => {
            if let Some(child) = value.as_array().and_then(|a| element(a, *index)) {
                walk(child, rest, out);
            }
        }
        Step::Each => {
            if let Some(items) = value.as_array() {
                for child in items {
                    walk(child, rest, out);
                }
            }
        }
    }
}

fn element(items: &[Value], index: i64) -> Option<&Value> {
    let len = i64::try_from(items.len()).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        items.get(resolved as usize)
    } else {
        None
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '@' | '-')
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn unexpected(&self, found: char) -> QueryParseError {
        QueryParseError::Unexpected {
            query: self.src.to_string(),
            offset: self.pos,
            found,
        }
    }

    fn unterminated(&self, what: &'static str) -> QueryParseError {
        QueryParseError::Unterminated {
            query: self.src.to_string(),
            what,
        }
    }

    fn parse_path(&mut self) -> Result<Vec<Step>, QueryParseError> {
        let mut steps = Vec::new();

        // A bare key may open the path without a leading '.'
        if let Some(c) = self.peek()
            && is_key_char(c)
        {
            steps.push(Step::Key(self.parse_bare_key()));
        }

        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.bump();
                    match self.peek() {
                        None if self.pos == 1 => break,
                        None => return Err(self.unterminated("path step")),
                        Some('"') => steps.push(Step::Key(self.parse_quoted()?)),
                        Some('[') => {}
                        Some(c) if is_key_char(c) => steps.push(Step::Key(self.parse_bare_key())),
                        Some(c) => return Err(self.unexpected(c)),
                    }
                }
                '[' => {
                    self.bump();
                    steps.push(self.parse_bracket()?);
                }
                other => return Err(self.unexpected(other)),
            }
        }

        Ok(steps)
    }

    fn parse_bare_key(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !is_key_char(c) {
                break;
            }
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_quoted(&mut self) -> Result<String, QueryParseError> {
        // Opening quote
        self.bump();
        let mut key = String::new();
        loop {
            match self.bump() {
                None => return Err(self.unterminated("quoted key")),
                Some('"') => return Ok(key),
                Some('\\') => match self.bump() {
                    Some(escaped) => key.push(escaped),
                    None => return Err(self.unterminated("quoted key")),
                },
                Some(c) => key.push(c),
            }
        }
    }

    fn parse_bracket(&mut self) -> Result<Step, QueryParseError> {
        let step = match self.peek() {
            None => return Err(self.unterminated("bracket")),
            Some(']') => Step::Each,
            Some('*') => {
                self.bump();
                Step::Each
            }
            Some('"') => Step::Key(self.parse_quoted()?),
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let start = self.pos;
                self.bump();
                while let Some(c) = self.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    self.bump();
                }
                let digits = &self.src[start..self.pos];
                let index = digits
                    .parse::<i64>()
                    .map_err(|_| QueryParseError::InvalidIndex {
                        query: self.src.to_string(),
                        index: digits.to_string(),
                    })?;
                Step::Index(index)
            }
            Some(c) => return Err(self.unexpected(c)),
        };

        match self.bump() {
            Some(']') => Ok(step),
            Some(c) => {
                self.pos -= c.len_utf8();
                Err(self.unexpected(c))
            }
            None => Err(self.unterminated("bracket")),
        }
    }
}
