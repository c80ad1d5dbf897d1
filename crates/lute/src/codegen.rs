// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Lua code generation.
//!
//! The generator turns an expanded [`TemplateItem`] into a [`ClassUnit`] —
//! the AST of one generated class — and the [`LuaEmitter`] renders that
//! unit into Lua source. One chunk is produced per item; all chunks of a
//! bundle share a namespace table so generated classes can call each other.
//!
//! # Generated chunk structure
//!
//! ```lua
//! local __rt, __ns = ...
//! local json = require("json")
//! local Greeter = __rt.class("Greeter", __rt.Template)
//! Greeter.vars = {
//!   { name = "n", kind = "integer", declared = "integer" },
//! }
//! __rt.register_vars(Greeter)
//! function Greeter:render()
//!   local _ENV = self:scope()
//!   self:write("Hi ")
//!   self:write(name)
//!   return self:result()
//! end
//! -- member-region snippets, verbatim
//! __ns["Greeter"] = Greeter
//! return Greeter
//! ```
//!
//! # Member regions
//!
//! `Member` blocks form a parity flip-flop, not a nesting: the first opens
//! a region, the next closes it. Blocks inside a region are emitted at
//! chunk scope (where the class local is visible) instead of into `render`,
//! with text and expressions wrapped as `self:write(…)` snippets.

use crate::error::Result;
use crate::block::BlockKind;
use crate::item::{sanitize_identifier, TemplateItem};
use crate::types::TypeRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source map from generated Lua lines back to template positions.
///
/// Only significant lines are recorded; lookups fall back to the closest
/// preceding mapping, mirroring how the host reports errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LuaSourceMap {
    mappings: BTreeMap<usize, (String, usize)>,
}

impl LuaSourceMap {
    /// Creates a new empty source map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping from a Lua output line to a template position.
    pub fn record(&mut self, lua_line: usize, template: &str, template_line: usize) {
        self.mappings
            .insert(lua_line, (template.to_string(), template_line));
    }

    /// Finds the most likely template position for a Lua line.
    pub fn lookup(&self, lua_line: usize) -> Option<(&str, usize)> {
        self.mappings
            .range(..=lua_line)
            .next_back()
            .map(|(_, (name, line))| (name.as_str(), *line))
    }

    /// Returns true if no mappings are recorded.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Rewrites `:LINE:` positions in a host error message to the mapped
    /// template position.
    pub fn translate_error(&self, error_msg: &str) -> String {
        let re = regex::Regex::new(r":(\d+):").unwrap();
        re.replace_all(error_msg, |caps: &regex::Captures| {
            if let Ok(lua_line) = caps[1].parse::<usize>() {
                if let Some((name, line)) = self.lookup(lua_line) {
                    return format!(" [{}:{}]:", name, line);
                }
            }
            caps[0].to_string()
        })
        .into_owned()
    }
}

/// One emitted operation of a generated class body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// How the text is emitted.
    pub kind: OpKind,
    /// Literal text, raw expression or verbatim statement code.
    pub text: String,
    /// Owning template name (differs from the unit's for spliced blocks).
    pub source: String,
    /// 1-based line in the owning template.
    pub line: usize,
}

/// The emission kind of an [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `self:write("<literal>")`
    WriteText,
    /// `self:write(<expression>)`
    WriteExpr,
    /// Verbatim statement code.
    Statement,
}

/// The AST of one generated host class.
#[derive(Debug, Clone)]
pub struct ClassUnit {
    /// Namespace the class is registered under.
    pub namespace: String,
    /// Class identifier; a valid host identifier by construction.
    pub class_name: String,
    /// Base class name; `None` means the runtime's `Template` base.
    pub base_class: Option<String>,
    /// The owning item name, used for chunk naming and line markers.
    pub template_name: String,
    /// Namespace imports in insertion order.
    pub imports: Vec<String>,
    /// Declared vars in declaration order.
    pub vars: Vec<(String, TypeRef)>,
    /// Body of the generated `render` method.
    pub render_ops: Vec<Op>,
    /// Snippets emitted at chunk scope.
    pub member_ops: Vec<Op>,
    /// True for include-only items.
    pub included: bool,
}

/// Builds the [`ClassUnit`] for an expanded item.
pub fn build_unit(item: &TemplateItem, namespace: &str, global_imports: &[String]) -> ClassUnit {
    let mut imports: Vec<String> = Vec::new();
    for import in global_imports.iter().chain(item.imports.iter()) {
        if !imports.iter().any(|i| i == import) {
            imports.push(import.clone());
        }
    }

    let mut render_ops = Vec::new();
    let mut member_ops = Vec::new();
    let mut in_member_region = false;

    for block in &item.blocks {
        let op = |kind: OpKind, text: String| Op {
            kind,
            text,
            source: block.name.clone(),
            line: block.start_line,
        };
        match block.kind {
            BlockKind::Directive => {}
            BlockKind::Member => {
                if !block.text.trim().is_empty() {
                    member_ops.push(op(OpKind::Statement, block.text.clone()));
                }
                in_member_region = !in_member_region;
            }
            BlockKind::Text => {
                let target = if in_member_region {
                    &mut member_ops
                } else {
                    &mut render_ops
                };
                target.push(op(OpKind::WriteText, block.text.clone()));
            }
            BlockKind::Expression => {
                let expr = block.text.trim().to_string();
                if expr.is_empty() {
                    continue;
                }
                let target = if in_member_region {
                    &mut member_ops
                } else {
                    &mut render_ops
                };
                target.push(op(OpKind::WriteExpr, expr));
            }
            BlockKind::Statement => {
                let target = if in_member_region {
                    &mut member_ops
                } else {
                    &mut render_ops
                };
                target.push(op(OpKind::Statement, block.text.clone()));
            }
        }
    }

    ClassUnit {
        namespace: namespace.to_string(),
        class_name: item.class_name.clone(),
        base_class: item.base_class_name.clone(),
        template_name: item.name.clone(),
        imports,
        vars: item.vars.clone(),
        render_ops,
        member_ops,
        included: item.included,
    }
}

/// A generated chunk: Lua source plus its source map.
#[derive(Debug, Clone)]
pub struct EmittedChunk {
    /// The generated Lua source.
    pub lua_code: String,
    /// Map from generated lines back to template positions.
    pub source_map: LuaSourceMap,
}

/// Trait for host-language emitters consuming [`ClassUnit`]s.
pub trait CodeEmitter: Send + std::fmt::Debug {
    /// Emits the source text of one generated class.
    fn emit(&self, unit: &ClassUnit) -> Result<EmittedChunk>;
}

/// The default Lua emitter.
#[derive(Debug, Clone, Default)]
pub struct LuaEmitter {
    /// Annotate every emitted statement with its template position so host
    /// diagnostics can be traced back by eye as well as by source map.
    pub debug_line_numbers: bool,
}

impl CodeEmitter for LuaEmitter {
    fn emit(&self, unit: &ClassUnit) -> Result<EmittedChunk> {
        let mut w = Writer::new(self.debug_line_numbers);

        w.line(&format!("-- Generated template class: {}.{}", unit.namespace, unit.class_name));
        w.line(&format!("-- source: {}", unit.template_name));
        w.line("local __rt, __ns = ...");

        for import in &unit.imports {
            let alias = import_alias(import);
            w.line(&format!("local {} = require({})", alias, lua_quote(import)));
        }

        let class = &unit.class_name;
        match &unit.base_class {
            Some(base) => w.line(&format!(
                "local {} = __rt.class({}, __rt.base(__ns, {}))",
                class,
                lua_quote(class),
                lua_quote(base)
            )),
            None => w.line(&format!(
                "local {} = __rt.class({}, __rt.Template)",
                class,
                lua_quote(class)
            )),
        }

        if !unit.vars.is_empty() {
            w.line(&format!("{}.vars = {{", class));
            for (name, ty) in &unit.vars {
                w.line(&format!(
                    "  {{ name = {}, kind = {}, declared = {} }},",
                    lua_quote(name),
                    lua_quote(ty.runtime_kind()),
                    lua_quote(&ty.to_string())
                ));
            }
            w.line("}");
        }
        w.line(&format!("__rt.register_vars({})", class));

        w.line(&format!("function {}:render()", class));
        w.line("  local _ENV = self:scope()");
        for op in &unit.render_ops {
            w.op(op, "  ");
        }
        w.line("  return self:result()");
        w.line("end");

        for op in &unit.member_ops {
            w.op(op, "");
        }

        w.line(&format!("__ns[{}] = {}", lua_quote(class), class));
        w.line(&format!("return {}", class));

        Ok(EmittedChunk {
            lua_code: w.output,
            source_map: w.source_map,
        })
    }
}

struct Writer {
    output: String,
    current_line: usize,
    source_map: LuaSourceMap,
    debug_line_numbers: bool,
}

impl Writer {
    fn new(debug_line_numbers: bool) -> Self {
        Self {
            output: String::new(),
            current_line: 1,
            source_map: LuaSourceMap::new(),
            debug_line_numbers,
        }
    }

    fn line(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
        // Raw expressions may span lines; keep the line counter honest.
        self.current_line += 1 + text.matches('\n').count();
    }

    fn op(&mut self, op: &Op, indent: &str) {
        if self.debug_line_numbers {
            let source = if op.source.is_empty() { "?" } else { &op.source };
            self.line(&format!("{}-- line {}:{}", indent, source, op.line));
        }
        self.source_map.record(self.current_line, &op.source, op.line);
        match op.kind {
            OpKind::WriteText => {
                self.line(&format!("{}self:write({})", indent, lua_quote(&op.text)));
            }
            OpKind::WriteExpr => {
                self.line(&format!("{}self:write({})", indent, op.text));
            }
            OpKind::Statement => {
                // Verbatim, unindented: the statement may contain long
                // strings that are whitespace-sensitive.
                for stmt_line in op.text.lines() {
                    self.line(stmt_line);
                }
            }
        }
    }
}

fn import_alias(import: &str) -> String {
    let last = import.rsplit('.').next().unwrap_or(import);
    sanitize_identifier(last)
}

/// Quotes a string as a Lua short-string literal.
pub(crate) fn lua_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\{}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockKind};

    fn item_with_blocks(blocks: Vec<(BlockKind, &str)>) -> TemplateItem {
        let mut item = TemplateItem::new("greeter.tpl", "");
        item.blocks = blocks
            .into_iter()
            .enumerate()
            .map(|(i, (kind, text))| Block {
                kind,
                text: text.to_string(),
                name: "greeter.tpl".to_string(),
                start_line: i + 1,
                offset: i,
            })
            .collect();
        item
    }

    #[test]
    fn test_member_region_parity() {
        let item = item_with_blocks(vec![
            (BlockKind::Text, "before"),
            (BlockKind::Member, "function Greeter:helper()"),
            (BlockKind::Text, "inside"),
            (BlockKind::Member, "end"),
            (BlockKind::Text, "after"),
            (BlockKind::Member, "local answer = 42"),
        ]);
        let unit = build_unit(&item, "Lute", &[]);

        let render_texts: Vec<&str> = unit.render_ops.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(render_texts, vec!["before", "after"]);

        let member_texts: Vec<&str> = unit.member_ops.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(
            member_texts,
            vec!["function Greeter:helper()", "inside", "end", "local answer = 42"]
        );
        assert_eq!(unit.member_ops[1].kind, OpKind::WriteText);
    }

    #[test]
    fn test_directives_are_skipped() {
        let item = item_with_blocks(vec![
            (BlockKind::Directive, " import namespace=\"math\" "),
            (BlockKind::Text, "x"),
        ]);
        let unit = build_unit(&item, "Lute", &[]);
        assert_eq!(unit.render_ops.len(), 1);
    }

    #[test]
    fn test_expression_trimmed_and_empty_dropped() {
        let item = item_with_blocks(vec![
            (BlockKind::Expression, "  name  "),
            (BlockKind::Expression, "   "),
        ]);
        let unit = build_unit(&item, "Lute", &[]);
        assert_eq!(unit.render_ops.len(), 1);
        assert_eq!(unit.render_ops[0].text, "name");
        assert_eq!(unit.render_ops[0].kind, OpKind::WriteExpr);
    }

    #[test]
    fn test_global_imports_precede_item_imports() {
        let mut item = item_with_blocks(vec![]);
        item.imports = vec!["json".to_string(), "math".to_string()];
        let unit = build_unit(&item, "Lute", &["math".to_string()]);
        assert_eq!(unit.imports, vec!["math".to_string(), "json".to_string()]);
    }

    #[test]
    fn test_emit_shape() {
        let mut item = item_with_blocks(vec![
            (BlockKind::Text, "Hi "),
            (BlockKind::Expression, " name "),
        ]);
        item.vars.push((
            "n".to_string(),
            crate::types::resolve("integer", &[], &[]).unwrap(),
        ));
        let unit = build_unit(&item, "Lute", &[]);
        let chunk = LuaEmitter::default().emit(&unit).unwrap();

        assert!(chunk.lua_code.contains("local greeter = __rt.class(\"greeter\", __rt.Template)"));
        assert!(chunk.lua_code.contains("self:write(\"Hi \")"));
        assert!(chunk.lua_code.contains("self:write(name)"));
        assert!(chunk.lua_code.contains("{ name = \"n\", kind = \"integer\", declared = \"integer\" },"));
        assert!(chunk.lua_code.contains("__ns[\"greeter\"] = greeter"));
        assert!(!chunk.source_map.is_empty());
    }

    #[test]
    fn test_emit_base_class() {
        let mut item = item_with_blocks(vec![]);
        item.base_class_name = Some("ReportBase".to_string());
        let unit = build_unit(&item, "Lute", &[]);
        let chunk = LuaEmitter::default().emit(&unit).unwrap();
        assert!(chunk
            .lua_code
            .contains("__rt.class(\"greeter\", __rt.base(__ns, \"ReportBase\"))"));
    }

    #[test]
    fn test_emit_debug_line_markers() {
        let item = item_with_blocks(vec![(BlockKind::Text, "x")]);
        let unit = build_unit(&item, "Lute", &[]);
        let chunk = LuaEmitter { debug_line_numbers: true }.emit(&unit).unwrap();
        assert!(chunk.lua_code.contains("-- line greeter.tpl:1"));
    }

    #[test]
    fn test_source_map_lookup_and_translation() {
        let mut map = LuaSourceMap::new();
        map.record(10, "main.tpl", 3);
        assert_eq!(map.lookup(10), Some(("main.tpl", 3)));
        assert_eq!(map.lookup(12), Some(("main.tpl", 3)));
        assert_eq!(map.lookup(9), None);

        let translated = map.translate_error("chunk:11: attempt to index a nil value");
        assert!(translated.contains("[main.tpl:3]"));
    }

    #[test]
    fn test_lua_quote() {
        assert_eq!(lua_quote("a\"b"), r#""a\"b""#);
        assert_eq!(lua_quote("a\nb"), r#""a\nb""#);
        assert_eq!(lua_quote("a\\b"), r#""a\\b""#);
        assert_eq!(lua_quote("tab\there"), r#""tab\there""#);
    }
}
