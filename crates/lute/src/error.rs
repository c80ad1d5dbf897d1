// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Error types for the LUTE template engine.
//!
//! This module defines [`Error`], the flat error enum covering every
//! pipeline stage, and [`SourceContext`] for rich error reporting with
//! template source snippets.
//!
//! # Error Categories
//!
//! - **Argument/State errors**: Malformed public calls, lifecycle violations
//! - **Parse errors**: Unterminated delimiters and other lexer failures
//! - **Directive errors**: Unknown directives, missing parameters, duplicates
//! - **Cycle errors**: Cyclic include graphs
//! - **Type resolution errors**: Unresolvable `var` type references
//! - **Compilation errors**: Host compiler diagnostics with source context
//! - **Execution errors**: Failures inside a running template

use std::fmt;
use thiserror::Error;

/// Source context for enhanced error messages.
///
/// Captures a snippet of template source around an error location, enabling
/// error messages with line numbers and a visual indicator.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// All lines from the source.
    pub lines: Vec<String>,
    /// The line number where the error occurred (1-indexed).
    pub error_line: usize,
    /// First line number of the snippet (1-indexed).
    pub snippet_start: usize,
    /// Last line number of the snippet (1-indexed).
    pub snippet_end: usize,
}

impl SourceContext {
    /// Creates a source context from source code and an error line,
    /// capturing `radius` lines before and after it.
    pub fn from_source(source: &str, line: usize, radius: usize) -> Self {
        let lines: Vec<String> = source.lines().map(|l| l.to_string()).collect();
        let snippet_start = line.saturating_sub(radius).max(1);
        let snippet_end = (line + radius).min(lines.len().max(1));

        Self {
            lines,
            error_line: line,
            snippet_start,
            snippet_end,
        }
    }

    /// Formats the source snippet with line numbers and an error marker.
    pub fn format_snippet(&self) -> String {
        let mut result = String::new();

        for line_num in self.snippet_start..=self.snippet_end {
            if line_num > self.lines.len() {
                break;
            }

            let line = &self.lines[line_num - 1];
            let marker = if line_num == self.error_line { ">" } else { " " };
            result.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));
        }

        result
    }
}

impl fmt::Display for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_snippet())
    }
}

/// Helper struct for displaying optional source context.
pub struct OptContextDisplay<'a>(pub &'a Option<SourceContext>);

impl fmt::Display for OptContextDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ctx) => write!(f, "\n{}", ctx),
            None => Ok(()),
        }
    }
}

/// The main error type for LUTE operations.
///
/// All fallible LUTE functions return `Result<T, Error>`. Each variant is
/// distinguishable by the caller; the engine never advances its status when
/// one of these is raised.
#[derive(Error, Debug)]
pub enum Error {
    /// A public operation was called with malformed input.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// An operation was invoked in the wrong lifecycle phase.
    #[error("invalid engine state: {0}")]
    State(String),

    /// The lexer failed, e.g. on an unterminated block delimiter.
    #[error("parse error in '{name}' at line {line}: {message}")]
    Parse {
        /// The owning template name.
        name: String,
        /// Line number of the failure (1-indexed).
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// A directive was unknown, duplicated or missing a required parameter.
    #[error("directive error in '{name}' at line {line}: {message}")]
    Directive {
        /// Name of the template owning the directive block.
        name: String,
        /// Line of the directive block (1-indexed).
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// The include graph contains a cycle.
    #[error("include cycle detected: {}", names.join(" -> "))]
    Cycle {
        /// The cycle as a list of template names, cycle root first.
        names: Vec<String>,
    },

    /// A `var` type reference could not be resolved.
    #[error("cannot resolve type '{type_name}': {message}")]
    TypeResolution {
        /// The raw type string from the directive.
        type_name: String,
        /// Description of the failure.
        message: String,
    },

    /// The host compiler reported at least one error.
    #[error("compilation failed: {message}{}", OptContextDisplay(context))]
    Compilation {
        /// The first error reported by the host compiler.
        message: String,
        /// Template source context around the failing line, if located.
        context: Option<SourceContext>,
    },

    /// An instance was requested without a class name and the artifact has
    /// zero or more than one candidate class.
    #[error("ambiguous template class: {0}")]
    Ambiguity(String),

    /// A compiled template failed at render time.
    #[error("execution error in '{template}': {message}")]
    Execution {
        /// The template whose class raised the failure.
        template: String,
        /// Failure message, with line numbers mapped back to the template.
        message: String,
    },

    /// A source path could not be resolved or loaded.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A process-wide cache operation failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// File I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Host runtime error outside a template render.
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),
}

/// Convenience type alias for Results with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_context_snippet() {
        let src = "one\ntwo\nthree\nfour\nfive";
        let ctx = SourceContext::from_source(src, 3, 1);
        let snippet = ctx.format_snippet();
        assert!(snippet.contains("   2 | two"));
        assert!(snippet.contains(">    3 | three"));
        assert!(snippet.contains("   4 | four"));
        assert!(!snippet.contains("one"));
        assert!(!snippet.contains("five"));
    }

    #[test]
    fn test_cycle_display() {
        let err = Error::Cycle {
            names: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "include cycle detected: a -> b");
    }
}
