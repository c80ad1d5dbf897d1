// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The template engine façade.
//!
//! An [`Engine`] owns one bundle of template items and drives the pipeline:
//!
//! 1. [`add_template_item`](Engine::add_template_item) collects raw sources
//! 2. [`process`](Engine::process) runs the lexer and directive resolver
//! 3. [`compile`](Engine::compile) generates and compiles the artifact
//! 4. [`create_instance`](Engine::create_instance) /
//!    [`render`](Engine::render) execute template classes
//!
//! The lifecycle status `Init → Processed → Compiled` only ever increases;
//! mutations are rejected once the bundle is processed. `process` and
//! `compile` are idempotent, and both later stages run the earlier ones
//! implicitly.
//!
//! # Thread safety
//!
//! Operations on one engine must be serialized by the caller until the
//! bundle is compiled; the compiled artifact itself is shared through the
//! process-wide [`ArtifactCache`]. The one-shot conveniences
//! [`process_file`] and [`process_template`] publish engines through the
//! single-flight [`EngineCache`](crate::cache::EngineCache).

use crate::cache::{self, ArtifactCache, EngineCache};
use crate::codegen::{build_unit, CodeEmitter, LuaEmitter};
use crate::compiler::{Artifact, AssemblyRef, CodeCompiler, CompileUnit, LuaCompiler};
use crate::error::{Error, Result};
use crate::item::{sanitize_identifier, TemplateItem};
use crate::loader::{MemoryLoader, SourceLoader};
use crate::runtime::{self, TemplateInstance};
use crate::transform;
use crate::types;
use mlua::{Function, Lua, Table};
use std::sync::Arc;

#[cfg(feature = "filesystem")]
use crate::loader::FileSystemLoader;
#[cfg(feature = "filesystem")]
use std::path::PathBuf;

/// Engine lifecycle phase; monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineStatus {
    /// Items may be added and bundle metadata mutated.
    Init,
    /// The directive resolver ran over every item.
    Processed,
    /// The artifact is available.
    Compiled,
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Namespace for generated classes. Defaults to a name derived from the
    /// assembly name when set, `"Lute"` otherwise.
    pub namespace: Option<String>,
    /// Annotate generated statements with template positions.
    pub debug_line_numbers: bool,
    /// Write originals and generated sources to a scratch directory and
    /// compile from there; the directory is removed after a successful
    /// compile and retained on failure.
    pub debug: bool,
}

/// The template engine.
///
/// Generic over the [`SourceLoader`] used to resolve include directives and
/// on-disk assembly references.
#[derive(Debug)]
pub struct Engine<L: SourceLoader> {
    loader: L,
    options: EngineOptions,
    templates: Vec<TemplateItem>,
    assembly_references: Vec<String>,
    global_imports: Vec<String>,
    assembly_name: Option<String>,
    default_assembly_name: Option<String>,
    status: EngineStatus,
    errors: Vec<String>,
    artifact: Option<Arc<Artifact>>,
    compiler: Box<dyn CodeCompiler>,
    emitter: Option<Box<dyn CodeEmitter>>,
    lua: Lua,
}

impl Engine<MemoryLoader> {
    /// Creates an engine with an empty in-memory loader.
    pub fn in_memory() -> Result<Self> {
        Self::new(MemoryLoader::new())
    }
}

#[cfg(feature = "filesystem")]
impl Engine<FileSystemLoader> {
    /// Creates an engine loading includes relative to `root_dir`.
    pub fn from_directory<P: AsRef<std::path::Path>>(root_dir: P) -> Result<Self> {
        Self::new(FileSystemLoader::new(root_dir))
    }
}

impl<L: SourceLoader> Engine<L> {
    /// Creates a new engine with default options.
    pub fn new(loader: L) -> Result<Self> {
        Self::with_options(loader, EngineOptions::default())
    }

    /// Creates a new engine with the given options.
    pub fn with_options(loader: L, options: EngineOptions) -> Result<Self> {
        Ok(Self {
            loader,
            options,
            templates: Vec::new(),
            assembly_references: Vec::new(),
            global_imports: Vec::new(),
            assembly_name: None,
            default_assembly_name: None,
            status: EngineStatus::Init,
            errors: Vec::new(),
            artifact: None,
            compiler: Box::new(LuaCompiler),
            emitter: None,
            lua: Lua::new(),
        })
    }

    /// The current lifecycle status.
    pub fn status(&self) -> EngineStatus {
        self.status
    }

    /// Compiler diagnostics accumulated so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Drops accumulated diagnostics.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// The bundle's template items.
    pub fn templates(&self) -> &[TemplateItem] {
        &self.templates
    }

    /// The bundle's external module references, in declaration order.
    pub fn assembly_references(&self) -> &[String] {
        &self.assembly_references
    }

    /// The compiled artifact, once [`compile`](Self::compile) succeeded.
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        self.artifact.as_ref()
    }

    /// The effective assembly name: the user-set one, or the default
    /// derived from the first item name with a directory component.
    pub fn assembly_name(&self) -> Option<&str> {
        self.assembly_name
            .as_deref()
            .or(self.default_assembly_name.as_deref())
    }

    /// Returns a reference to the source loader.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.status >= EngineStatus::Processed {
            return Err(Error::State(format!(
                "cannot {} once the bundle is processed",
                what
            )));
        }
        Ok(())
    }

    /// Replaces the host compiler. Intended for alternative toolchains and
    /// for instrumentation in tests.
    pub fn set_compiler(&mut self, compiler: Box<dyn CodeCompiler>) -> Result<()> {
        self.ensure_mutable("replace the compiler")?;
        self.compiler = compiler;
        Ok(())
    }

    /// Sets the assembly name; the artifact is persisted under it.
    pub fn set_assembly_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_mutable("set the assembly name")?;
        self.assembly_name = Some(name.into());
        Ok(())
    }

    /// Adds an external module reference, as an `assembly` directive would.
    pub fn add_assembly_reference(&mut self, reference: impl Into<String>) -> Result<()> {
        self.ensure_mutable("add assembly references")?;
        let reference = reference.into();
        if !self.assembly_references.contains(&reference) {
            self.assembly_references.push(reference);
        }
        Ok(())
    }

    /// Adds a namespace import applied to every item of the bundle.
    pub fn add_global_import(&mut self, import: impl Into<String>) -> Result<()> {
        self.ensure_mutable("add global imports")?;
        let import = import.into();
        if !self.global_imports.contains(&import) {
            self.global_imports.push(import);
        }
        Ok(())
    }

    /// Adds a template to the bundle, or replaces the content of the item
    /// with the same (case-insensitive) name.
    pub fn add_template_item(&mut self, name: &str, content: &str) -> Result<()> {
        if self.status >= EngineStatus::Processed {
            return Err(Error::State(
                "cannot add template items once the bundle is processed".to_string(),
            ));
        }
        if name.is_empty() && content.is_empty() {
            return Err(Error::Argument(
                "template name and content are both empty".to_string(),
            ));
        }
        let name = if name.is_empty() { "template" } else { name };

        if let Some(existing) = self
            .templates
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(name))
        {
            existing.reset_content(content.to_string());
        } else {
            let mut item = TemplateItem::new(name, content);
            if self.templates.iter().any(|t| t.class_name == item.class_name) {
                // Colliding derived names fall back to the full item name,
                // never to a silently invented one.
                item.class_name = sanitize_identifier(&item.name);
                if self.templates.iter().any(|t| t.class_name == item.class_name) {
                    return Err(Error::Argument(format!(
                        "template '{}' derives the already-used class name '{}'",
                        item.name, item.class_name
                    )));
                }
            }
            self.templates.push(item);
        }

        if self.default_assembly_name.is_none() {
            self.default_assembly_name = innermost_directory(name);
        }
        Ok(())
    }

    /// Runs the lexer and directive resolver over every item.
    ///
    /// Idempotent after the first success; a failure leaves the bundle
    /// untouched and retryable.
    pub fn process(&mut self) -> Result<()> {
        if self.status >= EngineStatus::Processed {
            return Ok(());
        }
        if self.templates.is_empty() {
            return Err(Error::Argument(
                "cannot process a bundle without template items".to_string(),
            ));
        }
        if self.emitter.is_none() {
            self.emitter = Some(Box::new(LuaEmitter {
                debug_line_numbers: self.options.debug_line_numbers,
            }));
        }

        // Work on a copy so a failed pass leaves the engine reusable.
        let mut items = self.templates.clone();
        let mut references = self.assembly_references.clone();
        transform::process_bundle(&mut items, &mut references, &self.global_imports, &self.loader)?;

        self.templates = items;
        self.assembly_references = references;
        self.status = EngineStatus::Processed;
        Ok(())
    }

    fn namespace(&self) -> String {
        if let Some(ns) = &self.options.namespace {
            return ns.clone();
        }
        if let Some(name) = &self.assembly_name {
            return crate::item::derive_class_name(name);
        }
        "Lute".to_string()
    }

    /// Generates, fingerprints and compiles the bundle.
    ///
    /// Runs [`process`](Self::process) implicitly. Idempotent: a second call
    /// returns the same artifact handle, and the process-wide cache
    /// guarantees the host compiler runs at most once per fingerprint.
    pub fn compile(&mut self) -> Result<()> {
        if self.artifact.is_some() {
            return Ok(());
        }
        self.process()?;

        let namespace = self.namespace();
        let emitter = self
            .emitter
            .as_ref()
            .ok_or_else(|| Error::State("code emitter was already released".to_string()))?;

        let mut units = Vec::with_capacity(self.templates.len());
        for item in &self.templates {
            let unit = build_unit(item, &namespace, &self.global_imports);
            let chunk = emitter.emit(&unit)?;
            units.push(CompileUnit {
                class_name: unit.class_name,
                chunk_name: item.name.clone(),
                template_name: item.name.clone(),
                template_source: item.content.clone(),
                lua_code: chunk.lua_code,
                source_map: chunk.source_map,
                included: item.included,
            });
        }
        for (item, unit) in self.templates.iter_mut().zip(units.iter()) {
            item.source = Some(unit.lua_code.clone());
        }

        let fingerprint = cache::fingerprint(
            units
                .iter()
                .filter(|u| !u.included)
                .map(|u| u.lua_code.as_str()),
        );
        let references = self.resolve_references()?;

        #[cfg(feature = "filesystem")]
        let scratch = if self.options.debug {
            Some(write_debug_scratch(&fingerprint, &mut units)?)
        } else {
            None
        };

        #[cfg(feature = "filesystem")]
        let output: Option<PathBuf> = self.assembly_name.as_ref().map(|n| artifact_path(n));
        #[cfg(not(feature = "filesystem"))]
        let output: Option<std::path::PathBuf> = None;

        let compiler = &self.compiler;
        let assembly_name = self.assembly_name.clone();
        let debug = self.options.debug;
        let result = ArtifactCache::global().get_or_compile(&fingerprint, || {
            #[cfg(feature = "filesystem")]
            if let Some(name) = &assembly_name {
                if let Some(found) = crate::compiler::find_persisted(name) {
                    if let Some(artifact) = crate::compiler::load_persisted(&found, &fingerprint)? {
                        return Ok(artifact);
                    }
                }
            }
            #[cfg(not(feature = "filesystem"))]
            let _ = &assembly_name;
            compiler.compile(&units, &references, &fingerprint, output.as_deref(), debug)
        });

        match result {
            Ok(artifact) => {
                #[cfg(feature = "filesystem")]
                if let Some(dir) = scratch {
                    let _ = std::fs::remove_dir_all(&dir);
                }
                self.artifact = Some(artifact);
                self.status = EngineStatus::Compiled;
                // The emitter is not needed past this point.
                self.emitter = None;
                Ok(())
            }
            Err(error) => {
                #[cfg(feature = "filesystem")]
                if let Some(dir) = scratch {
                    tracing::debug!(path = %dir.display(), "retaining scratch tree after failed compile");
                }
                if let Error::Compilation { message, .. } = &error {
                    self.errors.push(message.clone());
                }
                Err(error)
            }
        }
    }

    fn resolve_references(&self) -> Result<Vec<AssemblyRef>> {
        let mut references = Vec::with_capacity(self.assembly_references.len());
        for raw in &self.assembly_references {
            let module = types::reference_module(raw);
            let mut candidates = vec![raw.clone()];
            if !raw.ends_with(".lua") {
                candidates.push(format!("{}.lua", raw));
            }
            let found = candidates.into_iter().find(|c| self.loader.exists(c));
            let (path, source) = match found {
                Some(path) => {
                    let source = self.loader.read(&path)?;
                    (Some(path), Some(source))
                }
                // Logical reference; left for the host's require to find.
                None => (None, None),
            };
            references.push(AssemblyRef {
                name: raw.clone(),
                module,
                path,
                source,
            });
        }
        Ok(references)
    }

    /// Loads the compiled chunks into this engine's Lua state, preloading
    /// the on-disk assembly references first.
    fn load_artifact(&self) -> Result<Table> {
        let artifact = self
            .artifact
            .as_ref()
            .ok_or_else(|| Error::State("bundle is not compiled".to_string()))?;

        if let Ok(loaded) = self.lua.named_registry_value::<String>("lute.loaded") {
            if loaded == artifact.fingerprint {
                return Ok(self.lua.named_registry_value::<Table>("lute.ns")?);
            }
        }

        let rt = runtime::load_runtime(&self.lua)?;
        let ns = self.lua.create_table()?;

        let package: Table = self.lua.globals().get("package")?;
        let preload: Table = package.get("preload")?;
        for reference in &artifact.references {
            if let Some(source) = &reference.source {
                let chunk_name = reference.path.as_deref().unwrap_or(&reference.module);
                let loader_fn = self
                    .lua
                    .load(source.as_str())
                    .set_name(format!("@{}", chunk_name))
                    .into_function()?;
                preload.set(reference.module.as_str(), loader_fn)?;
            }
        }

        for chunk in &artifact.chunks {
            let function = self
                .lua
                .load(chunk.lua_code.as_str())
                .set_name(format!("@{}", chunk.chunk_name))
                .into_function()?;
            function
                .call::<mlua::Value>((rt.clone(), ns.clone()))
                .map_err(|e| Error::Execution {
                    template: chunk.template_name.clone(),
                    message: chunk.source_map.translate_error(&e.to_string()),
                })?;
        }

        self.lua.set_named_registry_value("lute.ns", ns.clone())?;
        self.lua
            .set_named_registry_value("lute.loaded", artifact.fingerprint.as_str())?;
        Ok(ns)
    }

    /// Constructs a fresh template instance.
    ///
    /// Compiles implicitly if needed. With an empty `class_name` the
    /// bundle's sole non-included class is used; zero or multiple
    /// candidates are an [`Error::Ambiguity`].
    pub fn create_instance(&mut self, class_name: Option<&str>) -> Result<TemplateInstance<'_>> {
        self.compile()?;
        let ns = self.load_artifact()?;

        let artifact = self
            .artifact
            .as_ref()
            .ok_or_else(|| Error::State("bundle is not compiled".to_string()))?;

        let chunk = match class_name {
            Some(name) if !name.is_empty() => {
                artifact.find_chunk(name).ok_or_else(|| {
                    Error::Argument(format!("no template class named '{}'", name))
                })?
            }
            _ => {
                let entries = artifact.entry_classes();
                if entries.len() != 1 {
                    return Err(Error::Ambiguity(format!(
                        "artifact contains {} template classes; pass a class name",
                        entries.len()
                    )));
                }
                artifact
                    .find_chunk(entries[0])
                    .ok_or_else(|| Error::Ambiguity("artifact has no chunks".to_string()))?
            }
        };

        let class: Table = ns.get(chunk.class_name.as_str())?;
        let rt = runtime::load_runtime(&self.lua)?;
        let new_fn: Function = rt.get("new")?;
        let instance: Table = new_fn.call(class)?;

        Ok(TemplateInstance::new(
            &self.lua,
            instance,
            chunk.class_name.clone(),
            chunk.template_name.clone(),
            Some(chunk.source_map.clone()),
        ))
    }

    /// Renders one template class with the given data.
    ///
    /// Binds `data` into the instance's parameter table, invokes the
    /// `initialize` hook and then the generated `render` override. Any
    /// runtime failure surfaces as [`Error::Execution`].
    pub fn render<T: serde::Serialize>(
        &mut self,
        class_name: Option<&str>,
        data: &T,
    ) -> Result<String> {
        let instance = self.create_instance(class_name)?;
        instance.bind(data)?;
        instance.initialize()?;
        instance.render()
    }

    /// Renders a one-off template source without touching this bundle.
    pub fn render_source<T: serde::Serialize>(&self, source: &str, data: &T) -> Result<String> {
        let mut engine = Engine::with_options(MemoryLoader::new(), self.options.clone())?;
        engine.add_template_item("source_template", source)?;
        engine.render(None, data)
    }

    /// The concatenated generated sources of the compiled bundle.
    pub fn bundle(&mut self) -> Result<String> {
        self.compile()?;
        let artifact = self
            .artifact
            .as_ref()
            .ok_or_else(|| Error::State("bundle is not compiled".to_string()))?;
        Ok(artifact.bundle_source())
    }
}

fn innermost_directory(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    let (dir, _file) = normalized.rsplit_once('/')?;
    dir.rsplit('/').find(|part| !part.is_empty()).map(String::from)
}

#[cfg(feature = "filesystem")]
fn artifact_path(assembly_name: &str) -> PathBuf {
    if assembly_name.ends_with(".lua") {
        PathBuf::from(assembly_name)
    } else {
        PathBuf::from(format!("{}.lua", assembly_name))
    }
}

#[cfg(feature = "filesystem")]
fn write_debug_scratch(fingerprint: &str, units: &mut [CompileUnit]) -> Result<PathBuf> {
    let short = &fingerprint[..fingerprint.len().min(12)];
    let dir = std::env::temp_dir().join(format!("lute-debug-{}", short));
    std::fs::create_dir_all(&dir)?;

    for unit in units.iter_mut() {
        let safe_name = unit
            .template_name
            .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        std::fs::write(dir.join(&safe_name), &unit.template_source)?;

        // The `_src` suffix keeps generated files clear of user file names.
        let generated = dir.join(format!("{}_src.lua", unit.class_name));
        std::fs::write(&generated, &unit.lua_code)?;
        unit.chunk_name = generated.to_string_lossy().to_string();
    }
    tracing::debug!(path = %dir.display(), "wrote debug scratch tree");
    Ok(dir)
}

/// Renders a single template file through the process-wide engine cache.
///
/// The cache key covers the file path and its current content, so an edited
/// file compiles a fresh engine while unchanged files reuse one.
#[cfg(feature = "filesystem")]
pub fn process_file<P: AsRef<std::path::Path>, T: serde::Serialize>(
    path: P,
    data: &T,
) -> Result<String> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let name = path.to_string_lossy();
    process_template(Some(&name), &content, data)
}

/// Renders a single template source through the process-wide engine cache.
///
/// Engines are keyed by a hash over `(name, content)`; the factory behind a
/// key runs at most once.
pub fn process_template<T: serde::Serialize>(
    name: Option<&str>,
    content: &str,
    data: &T,
) -> Result<String> {
    if name.is_none() && content.is_empty() {
        return Err(Error::Argument(
            "template name and content are both empty".to_string(),
        ));
    }
    let name = name.unwrap_or("template");
    let key = cache::fingerprint([name, content]);

    let engine = EngineCache::global().get_or_insert(&key, || {
        let mut engine = Engine::in_memory()?;
        engine.add_template_item(name, content)?;
        Ok(engine)
    })?;

    let mut engine = engine
        .lock()
        .map_err(|_| Error::Cache("cached engine lock poisoned".to_string()))?;
    engine.render(None, data)
}
