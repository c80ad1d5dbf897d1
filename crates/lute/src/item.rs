// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template items and class-name derivation.

use crate::block::Block;
use crate::types::TypeRef;
use serde::{Deserialize, Serialize};

/// One template in a bundle.
///
/// Items are created by [`Engine::add_template_item`](crate::Engine::add_template_item)
/// or by the include resolver, and live for the lifetime of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateItem {
    /// Logical identifier; may be a file path.
    pub name: String,
    /// Target class identifier derived from `name`, possibly overridden by
    /// a `template` directive.
    pub class_name: String,
    /// Base class override from `template inherits="…"`.
    pub base_class_name: Option<String>,
    /// The original template text.
    pub content: String,
    /// Ordered block sequence after parse and include expansion.
    pub blocks: Vec<Block>,
    /// Namespace imports, insertion order preserved for stable codegen.
    pub imports: Vec<String>,
    /// Declared variables as an ordered name → type mapping.
    pub vars: Vec<(String, TypeRef)>,
    /// True when this item exists only as an include target.
    pub included: bool,
    /// True once a `template` directive has been applied.
    pub processed: bool,
    /// Generated host-language source, set after codegen.
    pub source: Option<String>,

    /// Block sequence exactly as scanned, before any include expansion.
    /// Includes always splice from here so that an item expanded for its
    /// own compilation never leaks spliced blocks into its includers.
    #[serde(skip)]
    pub(crate) pristine: Option<Vec<Block>>,
    /// True once the directive resolver walked this item.
    #[serde(skip)]
    pub(crate) expanded: bool,
    /// Identity `(owner name, block offset)` of the applied `template`
    /// directive, so a spliced copy of the same block stays idempotent.
    #[serde(skip)]
    pub(crate) template_origin: Option<(String, usize)>,
}

impl TemplateItem {
    /// Creates a new item with a class name derived from `name`.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let class_name = derive_class_name(&name);
        Self {
            name,
            class_name,
            base_class_name: None,
            content: content.into(),
            blocks: Vec::new(),
            imports: Vec::new(),
            vars: Vec::new(),
            included: false,
            processed: false,
            source: None,
            pristine: None,
            expanded: false,
            template_origin: None,
        }
    }

    /// Replaces the item content, discarding all derived state.
    pub(crate) fn reset_content(&mut self, content: String) {
        self.content = content;
        self.blocks.clear();
        self.imports.clear();
        self.vars.clear();
        self.base_class_name = None;
        self.processed = false;
        self.source = None;
        self.pristine = None;
        self.expanded = false;
        self.template_origin = None;
        self.class_name = derive_class_name(&self.name);
    }
}

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Derives a class identifier from a raw item name: the directory portion
/// and extension are stripped, the remainder is sanitized into a valid
/// identifier.
pub fn derive_class_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };
    sanitize_identifier(stem)
}

/// Maps an arbitrary string onto a valid host identifier: every
/// non-identifier character becomes `_`, a leading non-identifier-start is
/// prefixed with `_`, and reserved words are prefixed with `_`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, c) in raw.chars().enumerate() {
        if c.is_ascii_alphabetic() || c == '_' || (i > 0 && c.is_ascii_digit()) {
            out.push(c);
        } else if i == 0 && c.is_ascii_digit() {
            out.push('_');
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    if LUA_KEYWORDS.contains(&out.as_str()) {
        out.insert(0, '_');
    }
    out
}

/// Whether `raw` already is a valid host identifier.
pub fn is_valid_identifier(raw: &str) -> bool {
    !raw.is_empty() && sanitize_identifier(raw) == raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_strips_directory_and_extension() {
        assert_eq!(derive_class_name("templates/mail/Welcome.tpl"), "Welcome");
        assert_eq!(derive_class_name("Welcome.tpl"), "Welcome");
        assert_eq!(derive_class_name("Welcome"), "Welcome");
        assert_eq!(derive_class_name(r"a\b\Report.t4"), "Report");
    }

    #[test]
    fn test_derive_sanitizes() {
        assert_eq!(derive_class_name("my-template"), "my_template");
        assert_eq!(derive_class_name("7days"), "_7days");
        assert_eq!(derive_class_name("end"), "_end");
        assert_eq!(derive_class_name(".hidden"), "_hidden");
    }

    #[test]
    fn test_sanitize_full_name() {
        assert_eq!(sanitize_identifier("a/b/c.tpl"), "a_b_c_tpl");
        assert_eq!(sanitize_identifier(""), "_");
    }

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("Greeter"));
        assert!(is_valid_identifier("_x9"));
        assert!(!is_valid_identifier("9x"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("end"));
    }
}
