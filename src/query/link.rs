//! `Link` header parsing (RFC 8288).
//!
//! REST pagination advertises neighbouring pages as
//! `<https://api.example.com/items?page=2>; rel="next", <...>; rel="last"`.
//! The header is read with a small recursive-descent parser over the RFC
//! grammar. Commas and semicolons inside `<...>` belong to the target:
//!
//! ```text
//! Link       = #link-value
//! link-value = "<" URI-Reference ">" *( OWS ";" OWS link-param )
//! link-param = token BWS [ "=" BWS ( token / quoted-string ) ]
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// Relation type (lower-cased) to target URL.
pub type LinkMap = BTreeMap<String, String>;

/// A `Link` header that does not follow the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed Link header at byte {position}: expected {expected}")]
pub struct LinkParseError {
    /// Byte offset where parsing stopped.
    pub position: usize,
    /// What the grammar required at that point.
    pub expected: &'static str,
}

/// Parses a `Link` header into a relation -> URL mapping.
///
/// A `rel` parameter may name several space-separated relations; each maps to
/// the same target. When a relation appears more than once the first target
/// wins. Link values without a `rel` parameter are ignored.
///
/// ```
/// use querier_core::query::parse_link_header;
///
/// let links = parse_link_header(
///     r#"<https://api.github.com/user/repos?page=3>; rel="next", <https://api.github.com/user/repos?page=50>; rel="last""#,
/// ).unwrap();
/// assert_eq!(links["next"], "https://api.github.com/user/repos?page=3");
/// assert_eq!(links["last"], "https://api.github.com/user/repos?page=50");
/// ```
///
/// # Errors
///
/// Returns [`LinkParseError`] when the header does not match the grammar.
pub fn parse_link_header(header: &str) -> Result<LinkMap, LinkParseError> {
    let mut parser = Parser::new(header);
    let mut links = LinkMap::new();

    loop {
        parser.skip_ows();
        if parser.at_end() {
            break;
        }
        // Empty list elements (",,") are permitted by the #rule.
        if parser.eat(',') {
            continue;
        }

        let (target, params) = parser.link_value()?;
        for (name, value) in params {
            if name == "rel" {
                for relation in value.split_ascii_whitespace() {
                    links
                        .entry(relation.to_ascii_lowercase())
                        .or_insert_with(|| target.clone());
                }
            }
        }

        parser.skip_ows();
        if parser.at_end() {
            break;
        }
        parser.expect(',', "',' between link values")?;
    }

    Ok(links)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char, what: &'static str) -> Result<(), LinkParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(what))
        }
    }

    fn error(&self, expected: &'static str) -> LinkParseError {
        LinkParseError {
            position: self.pos,
            expected,
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.pos += 1;
        }
    }

    fn link_value(&mut self) -> Result<(String, Vec<(String, String)>), LinkParseError> {
        self.expect('<', "'<' opening a link target")?;
        let Some(end) = self.rest().find('>') else {
            return Err(self.error("'>' closing the link target"));
        };
        let target = self.rest()[..end].trim().to_string();
        if target.is_empty() {
            return Err(self.error("a non-empty link target"));
        }
        self.pos += end + 1;

        let mut params = Vec::new();
        loop {
            self.skip_ows();
            if !self.eat(';') {
                break;
            }
            self.skip_ows();
            params.push(self.link_param()?);
        }
        Ok((target, params))
    }

    fn link_param(&mut self) -> Result<(String, String), LinkParseError> {
        let name = self.token().ok_or_else(|| self.error("a parameter name"))?;
        self.skip_ows();
        if !self.eat('=') {
            return Ok((name.to_ascii_lowercase(), String::new()));
        }
        self.skip_ows();
        let value = if self.peek() == Some('"') {
            self.quoted_string()?
        } else {
            self.token()
                .ok_or_else(|| self.error("a token or quoted-string parameter value"))?
                .to_string()
        };
        Ok((name.to_ascii_lowercase(), value))
    }

    fn token(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !is_tchar(*c))
            .map_or(rest.len(), |(i, _)| i);
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn quoted_string(&mut self) -> Result<String, LinkParseError> {
        self.expect('"', "'\"' opening a quoted-string")?;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("'\"' closing the quoted-string"));
            };
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(value),
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error("an escaped character"));
                    };
                    self.pos += escaped.len_utf8();
                    value.push(escaped);
                }
                other => value.push(other),
            }
        }
    }
}

/// RFC 9110 `tchar`.
fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}
