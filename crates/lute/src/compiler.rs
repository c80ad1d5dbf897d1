// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Host compilation of generated chunks.
//!
//! The [`CodeCompiler`] trait is the seam to the host toolchain: generated
//! sources in, a loadable [`Artifact`] out. The default [`LuaCompiler`]
//! validates every chunk with a throwaway Lua state and dumps portable
//! bytecode, so the artifact is `Send + Sync` and can be shared through the
//! process-wide artifact cache and re-instantiated into any engine's Lua
//! state.
//!
//! Compile diagnostics are enriched best-effort: the failing Lua line is
//! mapped through the chunk's source map to the owning template block and
//! one line of surrounding template source is attached to the error.

use crate::codegen::LuaSourceMap;
use crate::error::{Error, Result, SourceContext};
use mlua::Lua;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One generated source handed to the host compiler.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    /// The generated class name.
    pub class_name: String,
    /// Chunk name used for host diagnostics (a scratch file path in debug
    /// mode, the template name otherwise).
    pub chunk_name: String,
    /// The owning template name.
    pub template_name: String,
    /// Original template text, for diagnostic enrichment.
    pub template_source: String,
    /// The generated Lua source.
    pub lua_code: String,
    /// Generated-line → template-position map.
    pub source_map: LuaSourceMap,
    /// True for include-only items.
    pub included: bool,
}

/// An external module reference declared with `assembly`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRef {
    /// The reference exactly as declared.
    pub name: String,
    /// The logical module name used by `require`.
    pub module: String,
    /// Resolved on-disk path, when the reference names a loadable file.
    pub path: Option<String>,
    /// Module source for preloading, read at compile time.
    pub source: Option<String>,
}

/// One compiled chunk of an artifact.
#[derive(Debug, Clone)]
pub struct CompiledChunk {
    /// The generated class name.
    pub class_name: String,
    /// The chunk name used for host diagnostics.
    pub chunk_name: String,
    /// The owning template name.
    pub template_name: String,
    /// The generated Lua source.
    pub lua_code: String,
    /// Bytecode dumped by the host compiler; the distributable payload of
    /// a persisted bundle. Engines instantiate from `lua_code`, which safe
    /// Lua states accept.
    pub bytecode: Vec<u8>,
    /// Generated-line → template-position map.
    pub source_map: LuaSourceMap,
    /// True for include-only items.
    pub included: bool,
}

/// The loadable module produced from a bundle's generated sources.
///
/// Identified by a content fingerprint over the generated sources of the
/// bundle's non-included items.
#[derive(Debug)]
pub struct Artifact {
    /// The cache key: SHA-256 over the generated sources.
    pub fingerprint: String,
    /// Compiled chunks in bundle order.
    pub chunks: Vec<CompiledChunk>,
    /// External module references to preload before the chunks run.
    pub references: Vec<AssemblyRef>,
}

impl Artifact {
    /// Class names of the non-included items, in bundle order.
    pub fn entry_classes(&self) -> Vec<&str> {
        self.chunks
            .iter()
            .filter(|c| !c.included)
            .map(|c| c.class_name.as_str())
            .collect()
    }

    /// Finds a chunk by class name, exact match first, then
    /// case-insensitive.
    pub fn find_chunk(&self, class_name: &str) -> Option<&CompiledChunk> {
        self.chunks
            .iter()
            .find(|c| c.class_name == class_name)
            .or_else(|| {
                self.chunks
                    .iter()
                    .find(|c| c.class_name.eq_ignore_ascii_case(class_name))
            })
    }

    /// Concatenates the generated sources into one annotated bundle.
    pub fn bundle_source(&self) -> String {
        let mut bundle = String::new();
        for chunk in &self.chunks {
            bundle.push_str(&format!("-- chunk: {}\n", chunk.chunk_name));
            bundle.push_str(&chunk.lua_code);
            if !chunk.lua_code.ends_with('\n') {
                bundle.push('\n');
            }
        }
        bundle
    }

    /// Writes the artifact next to `path`: the bundled source at `path`
    /// itself plus a `.meta.json` companion used to reload it.
    #[cfg(feature = "filesystem")]
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.bundle_source())?;

        let meta = PersistedArtifact {
            fingerprint: self.fingerprint.clone(),
            references: self.references.clone(),
            chunks: self
                .chunks
                .iter()
                .map(|c| PersistedChunk {
                    class_name: c.class_name.clone(),
                    chunk_name: c.chunk_name.clone(),
                    template_name: c.template_name.clone(),
                    lua_code: c.lua_code.clone(),
                    source_map: c.source_map.clone(),
                    included: c.included,
                })
                .collect(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| Error::Cache(format!("cannot serialize artifact metadata: {}", e)))?;
        std::fs::write(meta_path(path), meta_json)?;
        tracing::debug!(path = %path.display(), "persisted artifact");
        Ok(())
    }
}

#[cfg(feature = "filesystem")]
#[derive(Serialize, Deserialize)]
struct PersistedArtifact {
    fingerprint: String,
    references: Vec<AssemblyRef>,
    chunks: Vec<PersistedChunk>,
}

#[cfg(feature = "filesystem")]
#[derive(Serialize, Deserialize)]
struct PersistedChunk {
    class_name: String,
    chunk_name: String,
    template_name: String,
    lua_code: String,
    source_map: LuaSourceMap,
    included: bool,
}

#[cfg(feature = "filesystem")]
fn meta_path(path: &Path) -> std::path::PathBuf {
    path.with_extension("meta.json")
}

/// Reloads a persisted artifact, re-validating its chunks with the host.
///
/// Returns `Ok(None)` when the metadata is missing, unreadable or carries a
/// different fingerprint; a stale artifact silently falls back to a fresh
/// compile.
#[cfg(feature = "filesystem")]
pub fn load_persisted(path: &Path, expected_fingerprint: &str) -> Result<Option<Artifact>> {
    let meta_file = meta_path(path);
    if !meta_file.is_file() {
        return Ok(None);
    }
    let meta: PersistedArtifact = match std::fs::read_to_string(&meta_file)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
    {
        Some(meta) => meta,
        None => return Ok(None),
    };
    if meta.fingerprint != expected_fingerprint {
        tracing::debug!(path = %path.display(), "persisted artifact is stale");
        return Ok(None);
    }

    let units: Vec<CompileUnit> = meta
        .chunks
        .into_iter()
        .map(|c| CompileUnit {
            class_name: c.class_name,
            chunk_name: c.chunk_name,
            template_name: c.template_name,
            template_source: String::new(),
            lua_code: c.lua_code,
            source_map: c.source_map,
            included: c.included,
        })
        .collect();
    tracing::debug!(path = %path.display(), "loading persisted artifact");
    LuaCompiler
        .compile(&units, &meta.references, expected_fingerprint, None, false)
        .map(Some)
}

/// Locates a persisted artifact for an assembly name: (a) the path as
/// given when absolute, (b) under the process base directory, (c) under
/// `<base>/bin/`.
#[cfg(feature = "filesystem")]
pub fn find_persisted(assembly_name: &str) -> Option<std::path::PathBuf> {
    let file_name = if assembly_name.ends_with(".lua") {
        assembly_name.to_string()
    } else {
        format!("{}.lua", assembly_name)
    };
    let as_path = std::path::PathBuf::from(&file_name);

    let mut candidates = Vec::new();
    if as_path.is_absolute() {
        candidates.push(as_path.clone());
    } else if let Ok(base) = std::env::current_dir() {
        candidates.push(base.join(&as_path));
        candidates.push(base.join("bin").join(&as_path));
        candidates.push(base.join("Bin").join(&as_path));
    }
    candidates
        .into_iter()
        .find(|c| c.is_file() && meta_path(c).is_file())
}

/// Trait for the external host compiler.
///
/// `debug` requests full debug information in the produced module; the
/// default implementation keeps Lua local-variable and line info in the
/// dumped bytecode when set.
pub trait CodeCompiler: Send + Sync + std::fmt::Debug {
    /// Compiles generated sources plus references into an artifact,
    /// optionally persisting it at `output`.
    fn compile(
        &self,
        units: &[CompileUnit],
        references: &[AssemblyRef],
        fingerprint: &str,
        output: Option<&Path>,
        debug: bool,
    ) -> Result<Artifact>;
}

/// The default host compiler backed by `mlua`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaCompiler;

impl CodeCompiler for LuaCompiler {
    fn compile(
        &self,
        units: &[CompileUnit],
        references: &[AssemblyRef],
        fingerprint: &str,
        output: Option<&Path>,
        debug: bool,
    ) -> Result<Artifact> {
        let lua = Lua::new();

        for reference in references {
            if let Some(source) = &reference.source {
                let chunk_name = reference.path.as_deref().unwrap_or(&reference.module);
                lua.load(source.as_str())
                    .set_name(format!("@{}", chunk_name))
                    .into_function()
                    .map_err(|e| Error::Compilation {
                        message: format!("assembly reference '{}': {}", reference.name, e),
                        context: None,
                    })?;
            }
        }

        let mut chunks = Vec::with_capacity(units.len());
        for unit in units {
            let function = lua
                .load(unit.lua_code.as_str())
                .set_name(format!("@{}", unit.chunk_name))
                .into_function()
                .map_err(|e| enrich_compile_error(unit, e))?;
            chunks.push(CompiledChunk {
                class_name: unit.class_name.clone(),
                chunk_name: unit.chunk_name.clone(),
                template_name: unit.template_name.clone(),
                lua_code: unit.lua_code.clone(),
                bytecode: function.dump(!debug),
                source_map: unit.source_map.clone(),
                included: unit.included,
            });
        }

        let artifact = Artifact {
            fingerprint: fingerprint.to_string(),
            chunks,
            references: references.to_vec(),
        };

        #[cfg(feature = "filesystem")]
        if let Some(path) = output {
            artifact.persist(path)?;
        }
        #[cfg(not(feature = "filesystem"))]
        let _ = output;

        Ok(artifact)
    }
}

/// Maps a host compile error back to the failing template block and
/// attaches ±1 line of template source. Best-effort; enrichment itself
/// never fails.
fn enrich_compile_error(unit: &CompileUnit, error: mlua::Error) -> Error {
    let message = error.to_string();
    let re = regex::Regex::new(r":(\d+):").unwrap();
    let located = re
        .captures(&message)
        .and_then(|caps| caps[1].parse::<usize>().ok())
        .and_then(|lua_line| unit.source_map.lookup(lua_line));

    match located {
        Some((template, line)) if !unit.template_source.is_empty() => Error::Compilation {
            message: format!("{} (template {}:{})", message, template, line),
            context: Some(SourceContext::from_source(&unit.template_source, line, 1)),
        },
        Some((template, line)) => Error::Compilation {
            message: format!("{} (template {}:{})", message, template, line),
            context: None,
        },
        None => Error::Compilation {
            message,
            context: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(class: &str, lua_code: &str) -> CompileUnit {
        CompileUnit {
            class_name: class.to_string(),
            chunk_name: format!("{}.tpl", class),
            template_name: format!("{}.tpl", class),
            template_source: String::new(),
            lua_code: lua_code.to_string(),
            source_map: LuaSourceMap::new(),
            included: false,
        }
    }

    #[test]
    fn test_compile_produces_bytecode() {
        let artifact = LuaCompiler
            .compile(&[unit("A", "return 42")], &[], "fp", None, false)
            .unwrap();
        assert_eq!(artifact.chunks.len(), 1);
        assert!(!artifact.chunks[0].bytecode.is_empty());
        assert_eq!(artifact.entry_classes(), vec!["A"]);
    }

    #[test]
    fn test_compile_error_is_enriched() {
        let mut bad = unit("B", "this is not lua\nat all(");
        bad.template_source = "line one\nline two\nline three".to_string();
        bad.source_map.record(1, "B.tpl", 2);

        let err = LuaCompiler
            .compile(&[bad], &[], "fp", None, false)
            .unwrap_err();
        match err {
            Error::Compilation { message, context } => {
                assert!(message.contains("template B.tpl:2"), "message: {message}");
                let ctx = context.expect("context");
                assert_eq!(ctx.error_line, 2);
            }
            other => panic!("expected compilation error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_reference_fails_compile() {
        let reference = AssemblyRef {
            name: "lib/broken.lua".to_string(),
            module: "broken".to_string(),
            path: Some("lib/broken.lua".to_string()),
            source: Some("return {".to_string()),
        };
        let err = LuaCompiler
            .compile(&[unit("A", "return 1")], &[reference], "fp", None, false)
            .unwrap_err();
        assert!(err.to_string().contains("assembly reference 'lib/broken.lua'"));
    }

    #[test]
    fn test_find_chunk_case_insensitive() {
        let artifact = LuaCompiler
            .compile(
                &[unit("Greeter", "return 1"), unit("Tail", "return 2")],
                &[],
                "fp",
                None,
                false,
            )
            .unwrap();
        assert!(artifact.find_chunk("Greeter").is_some());
        assert!(artifact.find_chunk("greeter").is_some());
        assert!(artifact.find_chunk("missing").is_none());
    }

    #[cfg(feature = "filesystem")]
    #[test]
    fn test_persist_and_reload() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("bundle.lua");

        let artifact = LuaCompiler
            .compile(&[unit("A", "return 42")], &[], "fp-1", Some(&path), false)
            .unwrap();
        assert!(path.is_file());
        assert!(path.with_extension("meta.json").is_file());
        assert!(artifact.bundle_source().contains("-- chunk: A.tpl"));

        let reloaded = load_persisted(&path, "fp-1").unwrap().expect("artifact");
        assert_eq!(reloaded.fingerprint, "fp-1");
        assert_eq!(reloaded.entry_classes(), vec!["A"]);

        // A different fingerprint means the persisted artifact is stale.
        assert!(load_persisted(&path, "fp-2").unwrap().is_none());
    }
}
