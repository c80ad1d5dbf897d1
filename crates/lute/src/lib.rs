// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

// Warn on missing documentation for public items
#![warn(missing_docs)]

//! # LUTE
//!
//! Compiled text-template engine for Rust: T4-style templates compiled to
//! Lua classes.
//!
//! LUTE turns templates mixing literal text, embedded expressions,
//! embedded statements and class-member definitions into generated Lua
//! classes, compiles them into a fingerprint-cached artifact and renders
//! instances with bound parameters.
//!
//! ## Template syntax
//!
//! - `<#@ … #>` — directives (`template`, `assembly`, `import`, `include`,
//!   `var`)
//! - `<#= … #>` — expressions written to the output
//! - `<# … #>` — statements emitted verbatim
//! - `<#+ … #>` — class-member region markers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lute::Engine;
//!
//! let mut engine = Engine::in_memory()?;
//! engine.add_template_item("hello", "Hi <#= name #>!")?;
//! let out = engine.render(None, &serde_json::json!({ "name": "World" }))?;
//! assert_eq!(out, "Hi World!");
//! ```
//!
//! Multi-template bundles compose with `include` directives, share imports
//! and assembly references, and compile into one artifact whose classes can
//! call each other. For single templates the top-level
//! [`process_template`] / [`process_file`] conveniences reuse engines
//! through a process-wide cache.

/// Template block scanner.
pub mod block;
/// Directive payload parsing.
pub mod directive;
/// Template items and class-name derivation.
pub mod item;
/// Type references for `var` directives.
pub mod types;
/// Template source loading (filesystem, memory).
pub mod loader;
/// Directive resolution and include expansion.
pub mod transform;
/// Lua code generation.
pub mod codegen;
/// Template runtime contract.
pub mod runtime;
/// Host compilation of generated chunks.
pub mod compiler;
/// Process-wide artifact and engine caches.
pub mod cache;
/// The engine façade.
pub mod engine;
/// Error types and reporting.
pub mod error;

pub use block::{Block, BlockKind};
pub use cache::{fingerprint, ArtifactCache, EngineCache};
pub use codegen::{build_unit, ClassUnit, CodeEmitter, EmittedChunk, LuaEmitter, LuaSourceMap};
pub use compiler::{Artifact, AssemblyRef, CodeCompiler, CompileUnit, CompiledChunk, LuaCompiler};
pub use directive::Directive;
pub use engine::{process_template, Engine, EngineOptions, EngineStatus};
pub use error::{Error, Result, SourceContext};
pub use item::{derive_class_name, TemplateItem};
pub use loader::{MemoryLoader, SourceLoader};
pub use runtime::{TemplateInstance, RUNTIME_SOURCE};
pub use types::TypeRef;

#[cfg(feature = "filesystem")]
pub use engine::process_file;
#[cfg(feature = "filesystem")]
pub use loader::FileSystemLoader;
