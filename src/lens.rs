//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The lens contract.
//!
//! Lenses are external collaborators: the engine only needs a pair of
//! bidirectional primitives from them. `get` parses file contents into a
//! tree, `put` serialises a (possibly mutated) tree back into the file's
//! surface syntax, preserving the formatting of untouched parts. Lenses
//! are grouped into named modules and referred to either by their
//! qualified name (`Module.lens`) or through a module's autoload lens
//! (`@Module`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};

/// Byte offsets reported by a lens for one parsed node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LensSpan {
    pub label: (u32, u32),
    pub value: (u32, u32),
    pub node: (u32, u32),
}

/// The neutral tree shape exchanged between the engine and a lens.
///
/// `get` returns a root whose children are the file's top-level entries;
/// the root's own label and value are ignored. `put` receives the same
/// shape, rebuilt from the engine tree.
#[derive(Clone, Debug, Default)]
pub struct LensNode {
    pub label: Option<String>,
    pub value: Option<String>,
    pub children: Vec<LensNode>,
    pub span: Option<LensSpan>,
}

impl LensNode {
    /// A node with neither label nor value, used as the forest root.
    pub fn root() -> LensNode {
        LensNode::default()
    }

    pub fn new(label: &str, value: Option<&str>) -> LensNode {
        LensNode {
            label: Some(label.to_owned()),
            value: value.map(str::to_owned),
            children: Vec::new(),
            span: None,
        }
    }
}

/// A failed `get` or `put`.
#[derive(Clone, Debug)]
pub struct LensError {
    pub message: String,
    /// Byte position in the input where a `get` failed.
    pub pos: Option<usize>,
    /// Path (relative to the subtree root) where a `put` failed.
    pub path: Option<String>,
    /// Provenance of the lens that failed.
    pub lens: Option<String>,
}

impl LensError {
    pub fn new(message: impl Into<String>) -> LensError {
        LensError {
            message: message.into(),
            pos: None,
            path: None,
            lens: None,
        }
    }

    pub fn at(message: impl Into<String>, pos: usize) -> LensError {
        LensError {
            message: message.into(),
            pos: Some(pos),
            path: None,
            lens: None,
        }
    }
}

/// A bidirectional transformation between file bytes and a tree.
pub trait Lens: Send + Sync {
    /// The qualified lens name, e.g. `Hosts.lns`.
    fn name(&self) -> &str;

    /// Provenance information recorded under `lens/info` for each file
    /// the lens loaded.
    fn info(&self) -> &str;

    /// Parse `text` into a tree. With `spans`, the lens reports byte
    /// offsets for every node it produces.
    fn get(
        &self,
        text: &str,
        spans: bool,
    ) -> std::result::Result<LensNode, LensError>;

    /// Serialise `tree` against the original `text`, preserving the
    /// formatting of unmodified content.
    fn put(
        &self,
        tree: &LensNode,
        text: &str,
    ) -> std::result::Result<String, LensError>;
}

/// Include/exclude globs a module asks to be loaded with.
#[derive(Clone, Debug, Default)]
pub struct Autoload {
    pub lens: String,
    pub incl: Vec<String>,
    pub excl: Vec<String>,
}

/// A named group of lenses, optionally with an autoload registration.
pub struct Module {
    name: String,
    lenses: HashMap<String, Arc<dyn Lens>>,
    autoload: Option<Autoload>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module {
            name: name.to_owned(),
            lenses: HashMap::new(),
            autoload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a lens under its short name within the module, e.g.
    /// `lns` for `Hosts.lns`.
    pub fn insert_lens(&mut self, short: &str, lens: Arc<dyn Lens>) {
        self.lenses.insert(short.to_owned(), lens);
    }

    /// Declare the lens and file filter to apply when the module is
    /// autoloaded.
    pub fn set_autoload(&mut self, autoload: Autoload) {
        self.autoload = Some(autoload);
    }

    pub fn autoload(&self) -> Option<&Autoload> {
        self.autoload.as_ref()
    }
}

/// All modules known to one engine handle.
#[derive(Default)]
pub(crate) struct Modules {
    modules: Vec<Module>,
}

impl Modules {
    pub fn new() -> Modules {
        Modules {
            modules: Vec::new(),
        }
    }

    pub fn insert(&mut self, module: Module) {
        self.modules.push(module);
    }

    fn find(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Resolve a lens name of the form `Module.lens` or `@Module`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Lens>> {
        if let Some(modname) = name.strip_prefix('@') {
            let module = self.find(modname).ok_or_else(|| {
                Error::new(
                    ErrorCode::NoLens,
                    Some(format!("Could not find module {}", modname)),
                )
            })?;
            let autoload = module.autoload().ok_or_else(|| {
                Error::new(
                    ErrorCode::NoLens,
                    Some(format!(
                        "No autoloaded lens in module {}",
                        modname
                    )),
                )
            })?;
            return self.resolve(&autoload.lens);
        }

        if let Some((modname, short)) = name.split_once('.') {
            if let Some(lens) =
                self.find(modname).and_then(|m| m.lenses.get(short))
            {
                return Ok(Arc::clone(lens));
            }
        }
        Err(Error::new(
            ErrorCode::NoLens,
            Some(format!("Can not find lens {}", name)),
        ))
    }
}
