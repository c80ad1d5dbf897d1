// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Type references for `var` directives.
//!
//! A `var` directive declares a typed template parameter. Type strings are
//! resolved against the Lua type system:
//!
//! - builtin names: `boolean`, `number`, `integer`, `string`, `table`,
//!   `function`, `any`
//! - parameterized containers: `table<K, V>` (arguments resolved recursively)
//! - qualified names: `module.Type`, valid only when `module` is reachable
//!   through the item's imports or the bundle's assembly references
//!
//! Resolving a qualified or parameterized type registers each contributing
//! module as an implicit import and assembly reference. There is no global
//! auto-loading of unknown modules; a qualified name against an unknown
//! module is a fatal [`Error::TypeResolution`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const BUILTIN_TYPES: &[&str] = &[
    "any", "boolean", "function", "integer", "number", "string", "table",
];

/// A resolved type reference for a template variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    /// Owning module path for qualified types (`json` in `json.Value`).
    pub module: Option<String>,
    /// The unqualified type name.
    pub base: String,
    /// Type arguments of a parameterized type.
    pub args: Vec<TypeRef>,
}

impl TypeRef {
    /// The Lua type tag used for runtime checks on typed properties.
    ///
    /// Qualified types are realized as tables; `any` disables the check.
    pub fn runtime_kind(&self) -> &'static str {
        if self.module.is_some() {
            return "table";
        }
        match self.base.as_str() {
            "boolean" => "boolean",
            "function" => "function",
            "integer" => "integer",
            "number" => "number",
            "string" => "string",
            "table" => "table",
            _ => "any",
        }
    }

    /// Collects every module path contributed by this type, including the
    /// modules of nested type arguments.
    pub fn collect_modules(&self, out: &mut Vec<String>) {
        if let Some(module) = &self.module {
            if !out.iter().any(|m| m == module) {
                out.push(module.clone());
            }
        }
        for arg in &self.args {
            arg.collect_modules(out);
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            write!(f, "{}.", module)?;
        }
        write!(f, "{}", self.base)?;
        if !self.args.is_empty() {
            write!(f, "<")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

/// Resolves a raw type string against the reachable modules.
///
/// `imports` are the declaring item's namespace imports, `references` the
/// bundle's assembly references. See the module docs for the resolution
/// rules.
pub fn resolve(raw: &str, imports: &[String], references: &[String]) -> Result<TypeRef> {
    let mut parser = TypeParser {
        raw,
        chars: raw.chars().collect(),
        pos: 0,
    };
    let parsed = parser.parse_type()?;
    parser.skip_whitespace();
    if parser.pos != parser.chars.len() {
        return Err(parser.error("trailing characters after type"));
    }
    check_resolvable(raw, &parsed, imports, references)?;
    Ok(parsed)
}

fn check_resolvable(
    raw: &str,
    ty: &TypeRef,
    imports: &[String],
    references: &[String],
) -> Result<()> {
    match &ty.module {
        None => {
            if !BUILTIN_TYPES.contains(&ty.base.as_str()) {
                return Err(Error::TypeResolution {
                    type_name: raw.to_string(),
                    message: format!("'{}' is not a builtin type", ty.base),
                });
            }
            if !ty.args.is_empty() && ty.base != "table" {
                return Err(Error::TypeResolution {
                    type_name: raw.to_string(),
                    message: format!("'{}' does not take type arguments", ty.base),
                });
            }
        }
        Some(module) => {
            let known = imports.iter().any(|i| i == module)
                || references.iter().any(|r| reference_module(r) == *module || r == module);
            if !known {
                return Err(Error::TypeResolution {
                    type_name: raw.to_string(),
                    message: format!(
                        "module '{}' is not reachable; add an import or assembly directive for it",
                        module
                    ),
                });
            }
        }
    }
    for arg in &ty.args {
        check_resolvable(raw, arg, imports, references)?;
    }
    Ok(())
}

/// The logical module name of an assembly reference: the file stem for
/// path references, the reference itself otherwise.
pub(crate) fn reference_module(reference: &str) -> String {
    let stem = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference);
    stem.strip_suffix(".lua").unwrap_or(stem).to_string()
}

struct TypeParser<'a> {
    raw: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl TypeParser<'_> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::TypeResolution {
            type_name: self.raw.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn segment(&mut self) -> Result<String> {
        let mut seg = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                seg.push(c);
                self.pos += 1;
            }
            _ => return Err(self.error("expected type name")),
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            seg.push(c);
            self.pos += 1;
        }
        Ok(seg)
    }

    fn parse_type(&mut self) -> Result<TypeRef> {
        self.skip_whitespace();
        let mut segments = vec![self.segment()?];
        while self.peek() == Some('.') {
            self.pos += 1;
            segments.push(self.segment()?);
        }

        let base = segments.pop().unwrap_or_default();
        let module = if segments.is_empty() {
            None
        } else {
            Some(segments.join("."))
        };

        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some('<') {
            self.pos += 1;
            loop {
                args.push(self.parse_type()?);
                self.skip_whitespace();
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                    }
                    Some('>') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or '>' in type arguments")),
                }
            }
        }

        Ok(TypeRef { module, base, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_ctx() -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }

    #[test]
    fn test_resolve_builtin() {
        let (imports, refs) = no_ctx();
        let ty = resolve("integer", &imports, &refs).unwrap();
        assert_eq!(ty.base, "integer");
        assert_eq!(ty.runtime_kind(), "integer");
        assert_eq!(ty.to_string(), "integer");
    }

    #[test]
    fn test_resolve_parameterized() {
        let (imports, refs) = no_ctx();
        let ty = resolve("table<string, integer>", &imports, &refs).unwrap();
        assert_eq!(ty.base, "table");
        assert_eq!(ty.args.len(), 2);
        assert_eq!(ty.runtime_kind(), "table");
        assert_eq!(ty.to_string(), "table<string, integer>");
    }

    #[test]
    fn test_resolve_unknown_builtin_fails() {
        let (imports, refs) = no_ctx();
        assert!(matches!(
            resolve("gadget", &imports, &refs),
            Err(Error::TypeResolution { .. })
        ));
    }

    #[test]
    fn test_resolve_qualified_requires_module() {
        let refs = Vec::new();
        let err = resolve("json.Value", &[], &refs).unwrap_err();
        assert!(err.to_string().contains("module 'json' is not reachable"));

        let imports = vec!["json".to_string()];
        let ty = resolve("json.Value", &imports, &refs).unwrap();
        assert_eq!(ty.module.as_deref(), Some("json"));
        assert_eq!(ty.runtime_kind(), "table");
    }

    #[test]
    fn test_resolve_qualified_via_reference_path() {
        let refs = vec!["lib/json.lua".to_string()];
        let ty = resolve("json.Value", &[], &refs).unwrap();
        assert_eq!(ty.module.as_deref(), Some("json"));
    }

    #[test]
    fn test_resolve_nested_argument_module() {
        let imports = vec!["json".to_string()];
        let ty = resolve("table<string, json.Value>", &imports, &[]).unwrap();
        let mut modules = Vec::new();
        ty.collect_modules(&mut modules);
        assert_eq!(modules, vec!["json".to_string()]);
    }

    #[test]
    fn test_resolve_rejects_arguments_on_scalars() {
        assert!(resolve("string<integer>", &[], &[]).is_err());
    }

    #[test]
    fn test_resolve_rejects_trailing_garbage() {
        assert!(resolve("integer!", &[], &[]).is_err());
    }
}
