//! `link` response header parsing (RFC 8288).
//!
//! The list endpoints advertise their next page as
//! `<path?query>; rel="next"`. The query-string of that target becomes the
//! cursor of the following request.

use reqwest::Url;

use super::QueryParams;

/// Base used to resolve relative link targets
const RELATIVE_BASE: &str = "http://localhost/";

/// Errors raised while parsing a `link` header
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Expected '<' at offset {0}")]
    ExpectedTarget(usize),

    #[error("Unterminated link target starting at offset {0}")]
    UnterminatedTarget(usize),

    #[error("Unterminated quoted string starting at offset {0}")]
    UnterminatedQuote(usize),

    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Empty parameter name at offset {0}")]
    EmptyParameter(usize),

    #[error("Invalid link target '{0}': {1}")]
    InvalidTarget(String, String),
}

/// One entry of a `link` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// URI reference between the angle brackets
    pub target: String,
    /// Link parameters, names lowercased
    pub params: Vec<(String, String)>,
}

impl Link {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `rel` may hold several space separated relation types
    pub fn has_rel(&self, rel: &str) -> bool {
        self.param("rel")
            .map(|v| v.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case(rel)))
            .unwrap_or(false)
    }

    /// Query-string parameters of the target, repeated keys preserved
    pub fn query(&self) -> Result<QueryParams, LinkError> {
        let url = Url::parse(&self.target)
            .or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(&self.target)))
            .map_err(|e| LinkError::InvalidTarget(self.target.clone(), e.to_string()))?;

        let mut query = QueryParams::new();
        for (key, value) in url.query_pairs() {
            query.append(key.into_owned(), value);
        }
        Ok(query)
    }
}

/// Parse a full `link` header value into its entries
pub fn parse_link_header(value: &str) -> Result<Vec<Link>, LinkError> {
    let mut scanner = Scanner::new(value);
    let mut links = Vec::new();

    loop {
        scanner.skip_separators();
        if scanner.is_eof() {
            break;
        }

        let start = scanner.pos;
        if scanner.bump() != Some('<') {
            return Err(LinkError::ExpectedTarget(start));
        }
        let target = scanner
            .take_until('>')
            .ok_or(LinkError::UnterminatedTarget(start))?
            .trim()
            .to_string();

        let params = scanner.parameters()?;
        links.push(Link { target, params });
    }

    Ok(links)
}

/// Derive the next-page cursor from an optional `link` header.
///
/// `Ok(None)` means there is no next page.
pub fn next_cursor(header: Option<&str>) -> Result<Option<QueryParams>, LinkError> {
    let Some(header) = header else {
        return Ok(None);
    };

    match parse_link_header(header)?
        .into_iter()
        .find(|link| link.has_rel("next"))
    {
        Some(link) => link.query().map(Some),
        None => Ok(None),
    }
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace() || c == ',') {
            self.bump();
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if pred(c)) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    /// Consume up to and including `end`, returning the text before it
    fn take_until(&mut self, end: char) -> Option<&'a str> {
        let rest = &self.input[self.pos..];
        let offset = rest.find(end)?;
        let taken = &rest[..offset];
        self.pos += offset + end.len_utf8();
        Some(taken)
    }

    fn quoted(&mut self) -> Result<String, LinkError> {
        let start = self.pos;
        self.bump();

        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(LinkError::UnterminatedQuote(start)),
                },
                Some('"') => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(LinkError::UnterminatedQuote(start)),
            }
        }
    }

    fn parameters(&mut self) -> Result<Vec<(String, String)>, LinkError> {
        let mut params = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(';') => {
                    self.bump();
                }
                Some(',') | None => return Ok(params),
                Some(c) => return Err(LinkError::UnexpectedChar(c, self.pos)),
            }

            self.skip_whitespace();
            let name_at = self.pos;
            let name = self.take_while(|c| !matches!(c, '=' | ';' | ',') && !c.is_whitespace());
            if name.is_empty() {
                return Err(LinkError::EmptyParameter(name_at));
            }

            self.skip_whitespace();
            let value = if self.peek() == Some('=') {
                self.bump();
                self.skip_whitespace();
                if self.peek() == Some('"') {
                    self.quoted()?
                } else {
                    self.take_while(|c| !matches!(c, ';' | ',') && !c.is_whitespace())
                        .to_string()
                }
            } else {
                String::new()
            };

            params.push((name.to_ascii_lowercase(), value));
        }
    }
}
