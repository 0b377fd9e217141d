//! RFC 7235 `WWW-Authenticate` challenge parsing.
//!
//! Registries answer unauthenticated requests with a challenge such as
//! `Bearer realm="https://auth.docker.io/token",service="...",scope="..."`.
//! The parser is scheme-agnostic; callers only consume `Bearer`.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A parsed authentication challenge. Fields not present in the header are
/// left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    pub service: String,
    pub scope: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    /// The header does not match the challenge grammar.
    #[error("malformed challenge at byte {position}: expected {expected}")]
    Malformed {
        position: usize,
        expected: &'static str,
    },
    /// A parameter name outside the recognized set.
    #[error("unknown field {0:?}")]
    UnknownField(String),
    /// The challenge itself reports an OAuth-style error.
    #[error("{code} ({description})")]
    Upstream {
        code: String,
        description: String,
        uri: String,
    },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a `WWW-Authenticate` header value.
///
/// Grammar: `challenge = Name (param ("," param)*)? ; param = Name "=" QuotedString`,
/// whitespace-insensitive, with `\"` escapes inside quoted strings.
pub fn parse(input: &str) -> Result<Challenge, ChallengeError> {
    let mut cursor = Cursor::new(input);

    cursor.skip_whitespace();
    let scheme = cursor.name()?;
    let mut challenge = Challenge {
        scheme: scheme.to_string(),
        ..Challenge::default()
    };
    let (mut code, mut description, mut uri) = (String::new(), String::new(), String::new());

    cursor.skip_whitespace();
    if !cursor.at_end() {
        loop {
            let field = cursor.name()?;
            cursor.skip_whitespace();
            cursor.expect(b'=', "'='")?;
            cursor.skip_whitespace();
            let value = cursor.quoted_string()?;
            match field {
                "realm" => challenge.realm = value,
                "service" => challenge.service = value,
                "scope" => challenge.scope = value,
                "error" => code = value,
                "error_description" => description = value,
                "error_uri" => uri = value,
                _ => return Err(ChallengeError::UnknownField(field.to_string())),
            }
            cursor.skip_whitespace();
            if cursor.at_end() {
                break;
            }
            cursor.expect(b',', "','")?;
            cursor.skip_whitespace();
        }
    }

    if !code.is_empty() {
        return Err(ChallengeError::Upstream {
            code,
            description,
            uri,
        });
    }
    Ok(challenge)
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), ChallengeError> {
        if self.rest().as_bytes().first() == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(expected))
        }
    }

    /// Token names: `[a-zA-Z0-9_*.-]+`.
    fn name(&mut self) -> Result<&'a str, ChallengeError> {
        let rest = self.rest();
        let len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'*' | b'.' | b'-'))
            .count();
        if len == 0 {
            return Err(self.fail("a name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn quoted_string(&mut self) -> Result<String, ChallengeError> {
        self.expect(b'"', "'\"'")?;
        let mut value = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                _ => value.push(c),
            }
        }
        self.pos = self.input.len();
        Err(self.fail("a closing '\"'"))
    }

    fn fail(&self, expected: &'static str) -> ChallengeError {
        ChallengeError::Malformed {
            position: self.pos,
            expected,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
