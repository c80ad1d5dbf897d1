// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template block scanner.
//!
//! This module decomposes template source into an ordered sequence of typed
//! [`Block`]s. Block boundaries are T4-style delimiters:
//!
//! | Delimiter | Kind |
//! |---|---|
//! | `<#@ … #>` | [`BlockKind::Directive`] |
//! | `<#+ … #>` | [`BlockKind::Member`] |
//! | `<#= … #>` | [`BlockKind::Expression`] |
//! | `<# … #>` | [`BlockKind::Statement`] |
//! | anything else | [`BlockKind::Text`] |
//!
//! Delimiters do not nest; the scanner closes a block at the first `#>`
//! after its opening. Line numbers are 1-based and tolerate both `\n` and
//! `\r\n` endings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The lexical kind of a template block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Literal text emitted verbatim by `render`.
    Text,
    /// Host-language statement emitted verbatim into `render`.
    Statement,
    /// Host-language expression whose value is written to the output.
    Expression,
    /// Class-member region marker; see the code generator for the parity rule.
    Member,
    /// A structured command to the directive resolver.
    Directive,
}

/// A lexical fragment of a template.
///
/// Blocks are immutable once produced by the scanner. The `name` field holds
/// the owning template name and is propagated across include expansion so
/// diagnostics always point at the source that physically contains the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block kind.
    pub kind: BlockKind,
    /// The raw slice between the delimiters (or the literal text).
    pub text: String,
    /// Name of the owning template.
    pub name: String,
    /// 1-based line of the delimiter opening (first character for text).
    pub start_line: usize,
    /// Byte offset of the delimiter opening in the owning source. Uniquely
    /// identifies a block within its template across include splices.
    pub(crate) offset: usize,
}

/// Scans template source into an ordered block sequence.
///
/// Consecutive adjacent text fragments are merged and empty text fragments
/// are dropped. An unterminated delimiter is a fatal [`Error::Parse`]
/// carrying the line of the opening.
pub fn scan(name: &str, source: &str) -> Result<Vec<Block>> {
    let mut blocks: Vec<Block> = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0usize;
    let mut line = 1usize;
    let mut text_start = 0usize;
    let mut text_line = 1usize;

    while pos < bytes.len() {
        if bytes[pos] == b'<' && pos + 1 < bytes.len() && bytes[pos + 1] == b'#' {
            push_text(&mut blocks, name, &source[text_start..pos], text_line, text_start);

            let open_line = line;
            let mut body_start = pos + 2;
            let kind = match bytes.get(body_start) {
                Some(b'@') => {
                    body_start += 1;
                    BlockKind::Directive
                }
                Some(b'+') => {
                    body_start += 1;
                    BlockKind::Member
                }
                Some(b'=') => {
                    body_start += 1;
                    BlockKind::Expression
                }
                _ => BlockKind::Statement,
            };

            // No nesting: the first closing marker wins.
            let close = match source[body_start..].find("#>") {
                Some(offset) => body_start + offset,
                None => {
                    return Err(Error::Parse {
                        name: name.to_string(),
                        line: open_line,
                        message: "unterminated block delimiter".to_string(),
                    });
                }
            };

            line += newlines(&bytes[pos..close + 2]);
            blocks.push(Block {
                kind,
                text: source[body_start..close].to_string(),
                name: name.to_string(),
                start_line: open_line,
                offset: pos,
            });

            pos = close + 2;
            text_start = pos;
            text_line = line;
        } else {
            if bytes[pos] == b'\n' {
                line += 1;
            }
            pos += 1;
        }
    }

    push_text(&mut blocks, name, &source[text_start..], text_line, text_start);
    Ok(blocks)
}

fn newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

fn push_text(blocks: &mut Vec<Block>, name: &str, text: &str, start_line: usize, offset: usize) {
    if text.is_empty() {
        return;
    }
    if let Some(last) = blocks.last_mut() {
        if last.kind == BlockKind::Text && last.name == name {
            last.text.push_str(text);
            return;
        }
    }
    blocks.push(Block {
        kind: BlockKind::Text,
        text: text.to_string(),
        name: name.to_string(),
        start_line,
        offset,
    });
}
