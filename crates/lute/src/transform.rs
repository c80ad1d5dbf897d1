// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Directive resolution and include expansion.
//!
//! This pass walks every item's block list in source order and applies each
//! directive:
//!
//! - `template` — class name / base class override, applied once per item
//! - `assembly` — bundle-level module reference
//! - `import` — item-level namespace import
//! - `var` — typed template parameter (see [`crate::types`])
//! - `include` — splices the target's blocks immediately after the
//!   directive, so spliced content is itself processed
//!
//! # Include expansion
//!
//! Includes splice the target's *pristine* block sequence — the blocks
//! exactly as scanned — so an item that was already expanded for its own
//! compilation never leaks spliced content into its includers. A stack of
//! currently-expanded template names detects cycles; the stack unwinds when
//! the walk crosses back into blocks owned by an outer template.

use crate::block::{self, Block, BlockKind};
use crate::directive::{self, Directive};
use crate::error::{Error, Result};
use crate::item::{is_valid_identifier, TemplateItem};
use crate::loader::SourceLoader;
use crate::types;

/// Runs the directive resolver over every item of the bundle.
///
/// New items created by include resolution are appended to `items` and
/// walked in turn, so every item — included or not — ends up expanded.
pub(crate) fn process_bundle<L: SourceLoader>(
    items: &mut Vec<TemplateItem>,
    references: &mut Vec<String>,
    global_imports: &[String],
    loader: &L,
) -> Result<()> {
    let mut idx = 0;
    while idx < items.len() {
        walk_item(items, references, global_imports, loader, idx)?;
        idx += 1;
    }
    Ok(())
}

fn find_item_ci(items: &[TemplateItem], name: &str) -> Option<usize> {
    items.iter().position(|i| i.name.eq_ignore_ascii_case(name))
}

fn ensure_parsed(items: &mut [TemplateItem], idx: usize) -> Result<()> {
    if items[idx].pristine.is_none() {
        let scanned = block::scan(&items[idx].name, &items[idx].content)?;
        items[idx].blocks = scanned.clone();
        items[idx].pristine = Some(scanned);
    }
    Ok(())
}

fn walk_item<L: SourceLoader>(
    items: &mut Vec<TemplateItem>,
    references: &mut Vec<String>,
    global_imports: &[String],
    loader: &L,
    idx: usize,
) -> Result<()> {
    if items[idx].expanded {
        return Ok(());
    }
    ensure_parsed(items, idx)?;
    tracing::debug!(template = %items[idx].name, "resolving directives");

    let mut stack: Vec<String> = vec![items[idx].name.clone()];
    let mut i = 0;
    while i < items[idx].blocks.len() {
        let owner = items[idx].blocks[i].name.clone();
        while stack.len() > 1 && !stack.last().is_some_and(|top| top.eq_ignore_ascii_case(&owner))
        {
            stack.pop();
        }

        if items[idx].blocks[i].kind == BlockKind::Directive {
            let block = items[idx].blocks[i].clone();
            let parsed = directive::parse(&block)?;
            match parsed.name.as_str() {
                "template" => apply_template(items, &block, &parsed)?,
                "assembly" => {
                    let name = parsed.require("name", &block)?;
                    push_unique(references, name);
                }
                "import" => {
                    let namespace = parsed.require("namespace", &block)?.to_string();
                    push_unique(&mut items[idx].imports, &namespace);
                }
                "var" => apply_var(items, references, global_imports, idx, &block, &parsed)?,
                "include" => {
                    apply_include(items, loader, idx, i, &block, &parsed, &mut stack)?;
                }
                other => {
                    return Err(Error::Directive {
                        name: block.name.clone(),
                        line: block.start_line,
                        message: format!("unknown directive '{}'", other),
                    });
                }
            }
        }
        i += 1;
    }

    items[idx].expanded = true;
    Ok(())
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn apply_template(items: &mut [TemplateItem], block: &Block, d: &Directive) -> Result<()> {
    let owner_idx = find_item_ci(items, &block.name).ok_or_else(|| Error::Directive {
        name: block.name.clone(),
        line: block.start_line,
        message: "directive block has no owning template".to_string(),
    })?;

    let origin = (block.name.to_lowercase(), block.offset);
    let owner = &mut items[owner_idx];
    if owner.processed {
        // The same physical directive re-encountered through an include
        // splice is a no-op; a second distinct one is fatal.
        if owner.template_origin.as_ref() == Some(&origin) {
            return Ok(());
        }
        return Err(Error::Directive {
            name: block.name.clone(),
            line: block.start_line,
            message: "duplicate 'template' directive".to_string(),
        });
    }

    if let Some(class_name) = d.get("name") {
        if !is_valid_identifier(class_name) {
            return Err(Error::Directive {
                name: block.name.clone(),
                line: block.start_line,
                message: format!("'{}' is not a valid class name", class_name),
            });
        }
        owner.class_name = class_name.to_string();
    }
    if let Some(base) = d.get("inherits") {
        owner.base_class_name = Some(base.to_string());
    }
    owner.processed = true;
    owner.template_origin = Some(origin);
    Ok(())
}

fn apply_var(
    items: &mut [TemplateItem],
    references: &mut Vec<String>,
    global_imports: &[String],
    idx: usize,
    block: &Block,
    d: &Directive,
) -> Result<()> {
    let var_name = d.require("name", block)?.to_string();
    let raw_type = d.require("type", block)?.to_string();
    if !is_valid_identifier(&var_name) {
        return Err(Error::Directive {
            name: block.name.clone(),
            line: block.start_line,
            message: format!("'{}' is not a valid variable name", var_name),
        });
    }

    let mut reachable_imports = items[idx].imports.clone();
    for import in global_imports {
        push_unique(&mut reachable_imports, import);
    }
    let ty = types::resolve(&raw_type, &reachable_imports, references)?;

    // A qualified type pulls its module in as both an import and an
    // assembly reference.
    let mut modules = Vec::new();
    ty.collect_modules(&mut modules);
    for module in &modules {
        push_unique(&mut items[idx].imports, module);
        push_unique(references, module);
    }

    let item = &mut items[idx];
    if let Some((_, existing)) = item.vars.iter().find(|(n, _)| n == &var_name) {
        // Identical re-declaration happens on diamond includes and is
        // harmless; a conflicting type is not.
        if *existing == ty {
            return Ok(());
        }
        return Err(Error::Directive {
            name: block.name.clone(),
            line: block.start_line,
            message: format!("duplicate 'var' directive for '{}'", var_name),
        });
    }
    item.vars.push((var_name, ty));
    Ok(())
}

fn apply_include<L: SourceLoader>(
    items: &mut Vec<TemplateItem>,
    loader: &L,
    idx: usize,
    at: usize,
    block: &Block,
    d: &Directive,
    stack: &mut Vec<String>,
) -> Result<()> {
    let target_raw = d.require("name", block)?.to_string();

    // (a) case-insensitive match against existing items, (b) path
    // resolution relative to the including item's directory.
    let target_idx = match find_item_ci(items, &target_raw) {
        Some(t) => t,
        None => {
            let path = loader.resolve(&block.name, &target_raw);
            match find_item_ci(items, &path) {
                Some(t) => t,
                None => {
                    if !loader.exists(&path) {
                        return Err(Error::Directive {
                            name: block.name.clone(),
                            line: block.start_line,
                            message: format!("include '{}' could not be resolved", target_raw),
                        });
                    }
                    let content = loader.read(&path)?;
                    tracing::debug!(target = %path, from = %block.name, "loaded include");
                    let mut item = TemplateItem::new(path, content);
                    item.included = true;
                    items.push(item);
                    items.len() - 1
                }
            }
        }
    };

    items[target_idx].included = true;
    let target_name = items[target_idx].name.clone();
    if let Some(pos) = stack
        .iter()
        .position(|n| n.eq_ignore_ascii_case(&target_name))
    {
        return Err(Error::Cycle {
            names: stack[pos..].to_vec(),
        });
    }

    ensure_parsed(items, target_idx)?;
    let spliced = items[target_idx].pristine.clone().unwrap_or_default();
    stack.push(target_name);
    items[idx].blocks.splice(at + 1..at + 1, spliced);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn bundle(templates: &[(&str, &str)]) -> Vec<TemplateItem> {
        templates
            .iter()
            .map(|(name, content)| TemplateItem::new(*name, *content))
            .collect()
    }

    fn process(items: &mut Vec<TemplateItem>, loader: &MemoryLoader) -> Result<Vec<String>> {
        let mut references = Vec::new();
        process_bundle(items, &mut references, &[], loader)?;
        Ok(references)
    }

    #[test]
    fn test_include_splices_in_place() {
        let mut items = bundle(&[("main", "[<#@ include name=\"tail\" #>]"), ("tail", "T")]);
        process(&mut items, &MemoryLoader::new()).unwrap();

        let main = &items[0];
        let texts: Vec<&str> = main
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Text)
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(texts, vec!["[", "T", "]"]);
        assert!(items[1].included);
        assert!(!items[0].included);
    }

    #[test]
    fn test_include_loads_via_loader() {
        let loader = MemoryLoader::new().with_source("mail/footer.tpl", "-- footer --");
        let mut items = bundle(&[("mail/welcome.tpl", "body<#@ include name=\"footer.tpl\" #>")]);
        process(&mut items, &loader).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[1].name, "mail/footer.tpl");
        assert!(items[1].included);
        assert!(items[0]
            .blocks
            .iter()
            .any(|b| b.kind == BlockKind::Text && b.text == "-- footer --"));
    }

    #[test]
    fn test_include_missing_is_directive_error() {
        let mut items = bundle(&[("main", "<#@ include name=\"ghost\" #>")]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(matches!(err, Error::Directive { .. }));
    }

    #[test]
    fn test_empty_include_contributes_no_blocks() {
        let mut items = bundle(&[("main", "a<#@ include name=\"empty\" #>b"), ("empty", "")]);
        process(&mut items, &MemoryLoader::new()).unwrap();
        let texts: Vec<&str> = items[0].blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts.len(), 3);
        assert!(items[1].included);
    }

    #[test]
    fn test_cycle_detection() {
        let mut items = bundle(&[
            ("a", "<#@ include name=\"b\" #>"),
            ("b", "<#@ include name=\"a\" #>"),
        ]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        match err {
            Error::Cycle { names } => assert_eq!(names, vec!["a".to_string(), "b".to_string()]),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_include_is_a_cycle() {
        let mut items = bundle(&[("a", "<#@ include name=\"a\" #>")]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }

    #[test]
    fn test_diamond_include_is_acyclic() {
        let mut items = bundle(&[
            (
                "root",
                "<#@ include name=\"left\" #><#@ include name=\"right\" #>",
            ),
            ("left", "<#@ include name=\"leaf\" #>"),
            ("right", "<#@ include name=\"leaf\" #>"),
            (
                "leaf",
                "<#@ template inherits=\"Base\" #><#@ var name=\"n\" type=\"integer\" #>L",
            ),
        ]);
        process(&mut items, &MemoryLoader::new()).unwrap();

        // The leaf's template directive applied once, to the leaf itself.
        let leaf = items.iter().find(|i| i.name == "leaf").unwrap();
        assert!(leaf.processed);
        assert_eq!(leaf.base_class_name.as_deref(), Some("Base"));
        // The root absorbed the leaf's var once despite two splices.
        let root = &items[0];
        assert_eq!(root.vars.len(), 1);
        assert!(!root.processed);
    }

    #[test]
    fn test_template_directive_applies_metadata() {
        let mut items = bundle(&[(
            "report.tpl",
            "<#@ template name=\"Monthly\" inherits=\"ReportBase\" #>x",
        )]);
        process(&mut items, &MemoryLoader::new()).unwrap();
        assert_eq!(items[0].class_name, "Monthly");
        assert_eq!(items[0].base_class_name.as_deref(), Some("ReportBase"));
        assert!(items[0].processed);
    }

    #[test]
    fn test_duplicate_template_directive_fails() {
        let mut items = bundle(&[("t", "<#@ template name=\"A\" #><#@ template name=\"B\" #>")]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate 'template' directive"));
    }

    #[test]
    fn test_missing_template_directive_is_fine() {
        let mut items = bundle(&[("plain", "just text")]);
        process(&mut items, &MemoryLoader::new()).unwrap();
        assert!(!items[0].processed);
    }

    #[test]
    fn test_assembly_and_import_accumulate_deduplicated() {
        let mut items = bundle(&[(
            "t",
            "<#@ assembly name=\"lib/json.lua\" #><#@ assembly name=\"lib/json.lua\" #>\
             <#@ import namespace=\"math\" #><#@ import namespace=\"math\" #>",
        )]);
        let refs = process(&mut items, &MemoryLoader::new()).unwrap();
        assert_eq!(refs, vec!["lib/json.lua".to_string()]);
        assert_eq!(items[0].imports, vec!["math".to_string()]);
    }

    #[test]
    fn test_var_registers_implicit_import_and_reference() {
        let mut items = bundle(&[(
            "t",
            "<#@ assembly name=\"lib/json.lua\" #><#@ var name=\"v\" type=\"json.Value\" #>",
        )]);
        let refs = process(&mut items, &MemoryLoader::new()).unwrap();
        assert_eq!(items[0].imports, vec!["json".to_string()]);
        assert!(refs.contains(&"json".to_string()));
        assert_eq!(items[0].vars.len(), 1);
    }

    #[test]
    fn test_conflicting_var_redeclaration_fails() {
        let mut items = bundle(&[(
            "t",
            "<#@ var name=\"n\" type=\"integer\" #><#@ var name=\"n\" type=\"string\" #>",
        )]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate 'var'"));
    }

    #[test]
    fn test_unknown_directive_fails() {
        let mut items = bundle(&[("t", "<#@ output extension=\".txt\" #>")]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(err.to_string().contains("unknown directive 'output'"));
    }

    #[test]
    fn test_unresolved_var_type_fails() {
        let mut items = bundle(&[("t", "<#@ var name=\"v\" type=\"json.Value\" #>")]);
        let err = process(&mut items, &MemoryLoader::new()).unwrap_err();
        assert!(matches!(err, Error::TypeResolution { .. }));
    }

    #[test]
    fn test_nested_include_block_counts() {
        // inner is spliced into mid, and mid's pristine blocks (still
        // containing the inner include directive) are spliced into outer.
        let mut items = bundle(&[
            ("outer", "1<#@ include name=\"mid\" #>4"),
            ("mid", "2<#@ include name=\"inner\" #>"),
            ("inner", "3"),
        ]);
        process(&mut items, &MemoryLoader::new()).unwrap();

        let outer_texts: Vec<&str> = items[0]
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Text)
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(outer_texts, vec!["1", "2", "3", "4"]);

        let mid_texts: Vec<&str> = items[1]
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Text)
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(mid_texts, vec!["2", "3"]);
    }
}
