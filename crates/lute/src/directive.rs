// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Directive payload parsing.
//!
//! The payload of a `Directive` block follows the grammar
//! `NAME (KEY="VALUE")*`. Values are double-quoted with `\"` as the only
//! escape. Keys are case-insensitive; unknown keys are preserved but only
//! recognized keys affect semantics.

use crate::block::Block;
use crate::error::{Error, Result};

/// A parsed directive payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// The directive name, lowercased.
    pub name: String,
    /// Parameters in source order. Key comparison is case-insensitive.
    params: Vec<(String, String)>,
}

impl Directive {
    /// Looks up a parameter value by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Looks up a mandatory parameter, failing with a directive error
    /// tagged with the originating block.
    pub fn require(&self, key: &str, block: &Block) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::Directive {
            name: block.name.clone(),
            line: block.start_line,
            message: format!("'{}' directive requires a '{}' parameter", self.name, key),
        })
    }
}

/// Parses the payload of a directive block into a [`Directive`].
pub fn parse(block: &Block) -> Result<Directive> {
    let mut parser = PayloadParser {
        block,
        chars: block.text.chars().collect(),
        pos: 0,
    };
    parser.parse()
}

struct PayloadParser<'a> {
    block: &'a Block,
    chars: Vec<char>,
    pos: usize,
}

impl PayloadParser<'_> {
    fn parse(&mut self) -> Result<Directive> {
        self.skip_whitespace();
        let name = self.identifier()?.to_ascii_lowercase();

        let mut params = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek().is_none() {
                break;
            }
            let key = self.identifier()?;
            self.skip_whitespace();
            self.expect('=')?;
            self.skip_whitespace();
            let value = self.quoted_string()?;
            params.push((key, value));
        }

        Ok(Directive { name, params })
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Directive {
            name: self.block.name.clone(),
            line: self.block.start_line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let mut ident = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                ident.push(c);
                self.pos += 1;
            }
            Some(c) => return Err(self.error(format!("expected identifier, found '{c}'"))),
            None => return Err(self.error("missing directive name")),
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            ident.push(c);
            self.pos += 1;
        }
        Ok(ident)
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.advance() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of directive"))),
        }
    }

    fn quoted_string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(value),
                Some('\\') if self.peek() == Some('"') => {
                    value.push('"');
                    self.pos += 1;
                }
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated parameter string")),
            }
        }
    }
}
