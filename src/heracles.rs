//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The engine handle and its public operations.

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::lens::{Module, Modules};
use crate::pathx::{Pathx, PathxError, Symtab, Value};
use crate::tree::{NodeId, Tree};

/// The root for actual file contents.
pub(crate) const FILES_TREE: &str = "/files";
/// The engine reports state in this subtree.
pub(crate) const META_TREE: &str = "/heracles";
/// Per-file metadata and errors.
pub(crate) const META_FILES: &str = "/heracles/files";
/// Metadata about trees built from raw text.
pub(crate) const META_TEXT: &str = "/heracles/text";
/// The filesystem root directory, always ending in '/'.
pub(crate) const META_ROOT: &str = "/heracles/root";
/// How files are saved: backup, newfile, noop or overwrite.
pub(crate) const META_SAVE_MODE: &str = "/heracles/save";
/// When this node exists, a failed rename during save falls back to
/// copying file contents.
pub(crate) const COPY_IF_RENAME_FAILS: &str =
    "/heracles/save/copy_if_rename_fails";
/// Context prepended to all non-absolute paths.
pub(crate) const CONTEXT: &str = "/heracles/context";
/// Files actually written during the last save.
pub(crate) const EVENTS_SAVED: &str = "/heracles/events/saved";
/// Whether byte spans are tracked while parsing.
pub(crate) const SPAN_OPTION: &str = "/heracles/span";

const CONTEXT_DEFAULT: &str = "/files";
const ROOT_ENV: &str = "HERACLES_ROOT";
const LENS_ENV: &str = "HERACLES_LENS_LIB";
const LENS_DIR: &str = "/usr/share/heracles/lenses";
const LENS_DIST_DIR: &str = "/usr/share/heracles/lenses/dist";

const SAVE_BACKUP_TEXT: &str = "backup";
const SAVE_NEWFILE_TEXT: &str = "newfile";
const SAVE_NOOP_TEXT: &str = "noop";
const SAVE_OVERWRITE_TEXT: &str = "overwrite";
const ENABLE_TEXT: &str = "enable";
const DISABLE_TEXT: &str = "disable";

bitflags! {
    /// Flags to influence the behavior of the engine. Pass a bitmask of
    /// these flags to [`Heracles::init`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Flags: u32 {
        /// Keep the original file with a .herasave extension.
        const SAVE_BACKUP = 1 << 0;

        /// Save changes into a file with extension .heranew, and do not
        /// overwrite the original file. Takes precedence over
        /// SAVE_BACKUP.
        const SAVE_NEWFILE = 1 << 1;

        /// Typecheck lenses; since it can be very expensive it is not
        /// done by default.
        const TYPE_CHECK = 1 << 2;

        /// Do not use the builtin load path for modules.
        const NO_STDINC = 1 << 3;

        /// Make save a no-op process, just record what would have
        /// changed.
        const SAVE_NOOP = 1 << 4;

        /// Do not load the tree during [`Heracles::init`].
        const NO_LOAD = 1 << 5;

        /// Do not turn module autoload registrations into transforms.
        const NO_MODL_AUTOLOAD = 1 << 6;

        /// Track the span of nodes in the input.
        const ENABLE_SPAN = 1 << 7;

        /// Keep the handle around in an inspectable error state when
        /// [`Heracles::init`] fails, instead of closing it.
        const NO_ERR_CLOSE = 1 << 8;

        /// Trace module loading.
        const TRACE_MODULE_LOADING = 1 << 9;
    }
}

/// Byte offsets of one node into its source file, as reported by
/// [`Heracles::span`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpanInfo {
    pub filename: String,
    pub label_start: u32,
    pub label_end: u32,
    pub value_start: u32,
    pub value_end: u32,
    pub span_start: u32,
    pub span_end: u32,
}

/// The last-error slot carried by every handle.
#[derive(Clone, Debug, Default)]
struct ErrorRecord {
    code: Option<ErrorCode>,
    details: Option<String>,
    minor_details: Option<&'static str>,
}

/// An engine handle: one in-memory tree mirroring a set of configuration
/// files under a filesystem root.
///
/// All state is handle-scoped; independent handles are independent. A
/// handle is not safe for concurrent use.
pub struct Heracles {
    pub(crate) tree: Tree,
    /// Filesystem root for all files, always ends with '/'.
    pub(crate) root: String,
    pub(crate) flags: Flags,
    /// Search path for lens resources, from the caller and HERACLES_LENS_LIB.
    pub(crate) loadpath: Vec<String>,
    pub(crate) modules: Modules,
    pub(crate) symtab: Symtab,
    error: ErrorRecord,
    /// Number of entries through a public operation; 0 when called from
    /// outside.
    api_entries: u32,
    #[cfg(unix)]
    c_locale: libc::locale_t,
    #[cfg(unix)]
    user_locale: libc::locale_t,
}

// ===== impl Heracles =====

impl Heracles {
    /// Create a new handle.
    ///
    /// `root` is the filesystem prefix under which all managed files
    /// live; when `None`, the `HERACLES_ROOT` environment variable and
    /// finally `/` are used. `loadpath` is a colon-separated list of
    /// directories holding lens resources, extended from
    /// `HERACLES_LENS_LIB`.
    ///
    /// With [`Flags::NO_ERR_CLOSE`], a failed initialization returns the
    /// handle in an inspectable error state instead of an error.
    pub fn init(
        root: Option<&str>,
        loadpath: Option<&str>,
        flags: Flags,
    ) -> Result<Heracles> {
        Heracles::init_with_modules(root, loadpath, flags, Vec::new())
    }

    /// Like [`Heracles::init`], registering lens modules before the
    /// initial load.
    pub fn init_with_modules(
        root: Option<&str>,
        loadpath: Option<&str>,
        flags: Flags,
        modules: Vec<Module>,
    ) -> Result<Heracles> {
        let mut tree = Tree::new();
        let origin = tree.origin();
        tree.append(origin, Some("heracles".to_owned()), None);

        let mut hera = Heracles {
            tree,
            root: String::new(),
            flags,
            loadpath: Vec::new(),
            modules: Modules::new(),
            symtab: Symtab::new(),
            error: ErrorRecord::default(),
            api_entries: 0,
            #[cfg(unix)]
            c_locale: std::ptr::null_mut(),
            #[cfg(unix)]
            user_locale: std::ptr::null_mut(),
        };

        hera.api_entry();
        let r = hera.init_inner(root, loadpath, modules);
        hera.api_exit();

        match r {
            Ok(()) => Ok(hera),
            Err(_) if flags.contains(Flags::NO_ERR_CLOSE) => Ok(hera),
            Err(e) => Err(e),
        }
    }

    fn init_inner(
        &mut self,
        root: Option<&str>,
        loadpath: Option<&str>,
        modules: Vec<Module>,
    ) -> Result<()> {
        self.root = init_root(root);
        self.loadpath = init_loadpath(loadpath, self.flags);

        // The root dir is reported under /heracles/root, but only the
        // value stored on the handle is ever used, so a caller changing
        // the node cannot confuse the loader.
        let root = self.root.clone();
        self.set(META_ROOT, Some(&root))?;

        self.set(CONTEXT, Some(CONTEXT_DEFAULT))?;

        let version = env!("CARGO_PKG_VERSION");
        let static_nodes: &[(&str, Option<&str>)] = &[
            (FILES_TREE, None),
            ("/heracles/variables", None),
            ("/heracles/version", Some(version)),
            ("/heracles/version/save/mode[1]", Some(SAVE_BACKUP_TEXT)),
            ("/heracles/version/save/mode[2]", Some(SAVE_NEWFILE_TEXT)),
            ("/heracles/version/save/mode[3]", Some(SAVE_NOOP_TEXT)),
            ("/heracles/version/save/mode[4]", Some(SAVE_OVERWRITE_TEXT)),
            ("/heracles/version/defvar/expr", None),
            ("/heracles/version/pathx/functions/count", None),
            ("/heracles/version/pathx/functions/glob", None),
            ("/heracles/version/pathx/functions/label", None),
            ("/heracles/version/pathx/functions/last", None),
            ("/heracles/version/pathx/functions/position", None),
            ("/heracles/version/pathx/functions/regexp", None),
        ];
        for (path, value) in static_nodes {
            self.set(path, *value)?;
        }

        let mode = if self.flags.contains(Flags::SAVE_NEWFILE) {
            SAVE_NEWFILE_TEXT
        } else if self.flags.contains(Flags::SAVE_BACKUP) {
            SAVE_BACKUP_TEXT
        } else if self.flags.contains(Flags::SAVE_NOOP) {
            SAVE_NOOP_TEXT
        } else {
            SAVE_OVERWRITE_TEXT
        };
        self.set(META_SAVE_MODE, Some(mode))?;

        let span = if self.flags.contains(Flags::ENABLE_SPAN) {
            ENABLE_TEXT
        } else {
            DISABLE_TEXT
        };
        self.set(SPAN_OPTION, Some(span))?;

        for module in modules {
            self.register_module(module)?;
        }

        if !self.flags.contains(Flags::NO_LOAD) {
            self.load()?;
        }
        Ok(())
    }

    /// Register a lens module. Unless [`Flags::NO_MODL_AUTOLOAD`] is
    /// set, a module carrying an autoload registration is entered into
    /// the transform registry under `/heracles/load`.
    pub fn register_module(&mut self, module: Module) -> Result<()> {
        self.api_entry();
        let r = self.do_register_module(module);
        self.api_exit();
        r
    }

    fn do_register_module(&mut self, module: Module) -> Result<()> {
        if let Some(autoload) = module.autoload() {
            if !self.flags.contains(Flags::NO_MODL_AUTOLOAD) {
                let origin = self.tree.origin();
                let load = self
                    .tree
                    .path_create(origin, &["heracles", "load"]);
                let xfm = self.tree.append(
                    load,
                    Some(module.name().to_owned()),
                    None,
                );
                self.tree.append(
                    xfm,
                    Some("lens".to_owned()),
                    Some(format!("@{}", module.name())),
                );
                for incl in &autoload.incl {
                    self.tree.append(
                        xfm,
                        Some("incl".to_owned()),
                        Some(incl.clone()),
                    );
                }
                for excl in &autoload.excl {
                    self.tree.append(
                        xfm,
                        Some("excl".to_owned()),
                        Some(excl.clone()),
                    );
                }
            }
        }
        self.modules.insert(module);
        Ok(())
    }

    /// Lookup the value associated with `path`. Returns whether a node
    /// matched, and its value.
    pub fn get(&mut self, path: &str) -> Result<(bool, Option<String>)> {
        self.api_entry();
        let r = self.do_get(path);
        self.api_exit();
        r
    }

    fn do_get(&mut self, path: &str) -> Result<(bool, Option<String>)> {
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        if count > 1 {
            return Err(self.fail(
                ErrorCode::MMatch,
                format!("There are {} nodes matching {}", count, path),
            ));
        }
        let value =
            found.and_then(|id| self.tree.node(id).value.clone());
        Ok((count == 1, value))
    }

    /// Lookup the label associated with `path`.
    pub fn label(&mut self, path: &str) -> Result<(bool, Option<String>)> {
        self.api_entry();
        let r = self.do_label(path);
        self.api_exit();
        r
    }

    fn do_label(&mut self, path: &str) -> Result<(bool, Option<String>)> {
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        if count > 1 {
            return Err(self.fail(
                ErrorCode::MMatch,
                format!("There are {} nodes matching {}", count, path),
            ));
        }
        let label =
            found.and_then(|id| self.tree.node(id).label.clone());
        Ok((count == 1, label))
    }

    /// Set the value associated with `path`, creating the node and any
    /// missing ancestors.
    pub fn set(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        self.api_entry();
        let r = self.do_set(path, value);
        self.api_exit();
        r
    }

    fn do_set(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        // Get-out clause, in case the context is broken.
        let root_ctx = if path != CONTEXT {
            self.tree_root_ctx()?
        } else {
            None
        };
        let mut px = Pathx::parse(path, true, root_ctx)
            .map_err(|e| self.record_pathx(e))?;
        let origin = self.tree.origin();
        let id = px
            .expand_tree(&mut self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        self.tree.set_value(id, value);
        Ok(())
    }

    /// Set the value of multiple nodes in one operation: for every node
    /// matching `base`, set the value of the nodes matching the relative
    /// expression `sub` (or of the base node itself when `sub` is
    /// `None`). Returns the number of modified nodes.
    pub fn setm(
        &mut self,
        base: &str,
        sub: Option<&str>,
        value: Option<&str>,
    ) -> Result<usize> {
        self.api_entry();
        let r = self.do_setm(base, sub, value);
        self.api_exit();
        r
    }

    fn do_setm(
        &mut self,
        base: &str,
        sub: Option<&str>,
        value: Option<&str>,
    ) -> Result<usize> {
        let mut bx = self.parse_pathx(base, true)?;
        let origin = self.tree.origin();

        let sub = match sub {
            Some(".") => None,
            other => other,
        };

        let bases: Vec<NodeId> = bx
            .nodeset(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?
            .to_vec();

        let mut result = 0;
        for bt in bases {
            if !self.tree.contains(bt) {
                continue;
            }
            match sub {
                Some(sub) => {
                    // Handle subnodes of BT.
                    let mut sx = Pathx::parse(sub, true, Some(bt))
                        .map_err(|e| self.record_pathx(e))?;
                    let matches: Vec<NodeId> = sx
                        .nodeset(&self.tree, &self.symtab, bt)
                        .map_err(|e| self.record_pathx(e))?
                        .to_vec();
                    if !matches.is_empty() {
                        for st in matches {
                            self.tree.set_value(st, value);
                            result += 1;
                        }
                    } else {
                        let st = sx
                            .expand_tree(&mut self.tree, &self.symtab, bt)
                            .map_err(|e| self.record_pathx(e))?;
                        self.tree.set_value(st, value);
                        result += 1;
                    }
                }
                None => {
                    self.tree.set_value(bt, value);
                    result += 1;
                }
            }
        }
        Ok(result)
    }

    /// Create a new sibling of the node matching `path`, before or after
    /// it.
    pub fn insert(
        &mut self,
        path: &str,
        label: &str,
        before: bool,
    ) -> Result<()> {
        self.api_entry();
        let r = self.do_insert(path, label, before);
        self.api_exit();
        r
    }

    fn do_insert(
        &mut self,
        path: &str,
        label: &str,
        before: bool,
    ) -> Result<()> {
        if label.is_empty() || label.contains('/') {
            return Err(self.fail(
                ErrorCode::Label,
                format!("Label {} is invalid", label),
            ));
        }
        let mut px = self.parse_pathx(path, true)?;
        let id = self.find_one_node(&mut px, path)?;
        self.tree.insert_sibling(id, label, before);
        Ok(())
    }

    /// Remove all nodes matching `path`, with their subtrees. Returns
    /// the number of removed nodes.
    pub fn rm(&mut self, path: &str) -> Result<usize> {
        self.api_entry();
        let r = self.do_rm(path);
        self.api_exit();
        r
    }

    fn do_rm(&mut self, path: &str) -> Result<usize> {
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        let matches: Vec<NodeId> = px
            .nodeset(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?
            .iter()
            .copied()
            .filter(|id| self.tree.node(*id).label.is_some())
            .collect();
        let mut count = 0;
        for id in matches {
            if self.tree.contains(id) {
                self.symtab.remove_descendants(&self.tree, id);
                count += self.tree.unlink(id);
            }
        }
        Ok(count)
    }

    /// Move the node matching `src` to `dst`, overwriting whatever was
    /// there.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        self.api_entry();
        let r = self.do_mv(src, dst);
        self.api_exit();
        r
    }

    fn do_mv(&mut self, src: &str, dst: &str) -> Result<()> {
        let mut sx = self.parse_pathx(src, true)?;
        let ts = self.find_one_node(&mut sx, src)?;

        let mut dx = self.parse_pathx(dst, true)?;
        let origin = self.tree.origin();
        let td = dx
            .expand_tree(&mut self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;

        // Never move SRC into its own descendant.
        if self.tree.is_descendant(td, ts) {
            return Err(self.fail(
                ErrorCode::MvDesc,
                format!("destination {} is a descendant of {}", dst, src),
            ));
        }

        // Detach SRC before clearing DST, since SRC may sit inside DST's
        // subtree.
        let children = std::mem::take(&mut self.tree.node_mut(ts).children);
        let value = self.tree.node_mut(ts).value.take();
        self.symtab.remove_descendants(&self.tree, ts);
        self.tree.unlink(ts);

        for child in self.tree.node(td).children.clone() {
            self.symtab.remove_descendants(&self.tree, child);
        }
        self.tree.unlink_children(td);

        for child in &children {
            self.tree.node_mut(*child).parent = td;
        }
        let node = self.tree.node_mut(td);
        node.children = children;
        node.value = value;
        self.tree.mark_dirty(td);
        Ok(())
    }

    /// Relabel every node matching `src`. Returns the number of renamed
    /// nodes.
    pub fn rename(&mut self, src: &str, label: &str) -> Result<usize> {
        self.api_entry();
        let r = self.do_rename(src, label);
        self.api_exit();
        r
    }

    fn do_rename(&mut self, src: &str, label: &str) -> Result<usize> {
        // Validate up front so a bad label never renames anything.
        if label.contains('/') {
            return Err(self.fail(
                ErrorCode::Label,
                format!("Label {} contains a /", label),
            ));
        }
        let mut px = self.parse_pathx(src, true)?;
        let origin = self.tree.origin();
        let matches: Vec<NodeId> = px
            .nodeset(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?
            .to_vec();
        for id in &matches {
            self.tree.set_label(*id, label);
        }
        Ok(matches.len())
    }

    /// The absolute paths of all nodes matching `path`, in document
    /// order.
    pub fn matches(&mut self, path: &str) -> Result<Vec<String>> {
        self.api_entry();
        let r = self.do_matches(path);
        self.api_exit();
        r
    }

    fn do_matches(&mut self, path: &str) -> Result<Vec<String>> {
        let ids = self.match_ids(path)?;
        Ok(ids.iter().map(|id| self.tree.path_of(*id)).collect())
    }

    /// The number of nodes matching `path`.
    pub fn count(&mut self, path: &str) -> Result<usize> {
        self.api_entry();
        let r = self.match_ids(path).map(|ids| ids.len());
        self.api_exit();
        r
    }

    fn match_ids(&mut self, path: &str) -> Result<Vec<NodeId>> {
        let path = if path == "/" { "/*" } else { path };
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        let ids = px
            .nodeset(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?
            .iter()
            .copied()
            .filter(|id| self.tree.node(*id).label.is_some())
            .collect();
        Ok(ids)
    }

    /// The source-file byte offsets of the node matching `path`. Only
    /// available for nodes loaded while span tracking was enabled.
    pub fn span(&mut self, path: &str) -> Result<SpanInfo> {
        self.api_entry();
        let r = self.do_span(path);
        self.api_exit();
        r
    }

    fn do_span(&mut self, path: &str) -> Result<SpanInfo> {
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        let first = px
            .first(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        let id = match first {
            Some(id) => id,
            None => {
                return Err(self.fail(
                    ErrorCode::NoMatch,
                    format!("No node matching {}", path),
                ));
            }
        };
        let span = match &self.tree.node(id).span {
            Some(span) => span.clone(),
            None => {
                return Err(self.fail(
                    ErrorCode::NoSpan,
                    format!("No span info for {}", path),
                ));
            }
        };
        if px.next().is_some() {
            return Err(self.fail(
                ErrorCode::MMatch,
                format!("Multiple nodes match {}", path),
            ));
        }
        Ok(SpanInfo {
            filename: span.filename.to_string(),
            label_start: span.label_start,
            label_end: span.label_end,
            value_start: span.value_start,
            value_end: span.value_end,
            span_start: span.span_start,
            span_end: span.span_end,
        })
    }

    /// Define a variable whose value is the result of evaluating `expr`,
    /// or remove the variable when `expr` is `None`. Returns the number
    /// of nodes when the expression evaluates to a nodeset, 0 otherwise.
    pub fn defvar(
        &mut self,
        name: &str,
        expr: Option<&str>,
    ) -> Result<usize> {
        self.api_entry();
        let r = self.do_defvar(name, expr);
        self.api_exit();
        r
    }

    fn do_defvar(&mut self, name: &str, expr: Option<&str>) -> Result<usize> {
        match expr {
            None => {
                self.symtab.undefine(name);
                self.record_var_meta(name, None);
                Ok(0)
            }
            Some(expr) => {
                let px = self.parse_pathx(expr, false)?;
                let origin = self.tree.origin();
                let value = px
                    .eval_value(&self.tree, &self.symtab, origin)
                    .map_err(|e| self.record_pathx(e))?;
                self.symtab.define_expr(name, &px);
                self.record_var_meta(name, Some(expr));
                match value {
                    Value::Nodeset(ns) => Ok(ns.len()),
                    _ => Ok(0),
                }
            }
        }
    }

    /// Define a variable like [`Heracles::defvar`], creating the node
    /// (and binding the variable to it) when `expr` has no match.
    /// Returns the match count and whether a node was created.
    pub fn defnode(
        &mut self,
        name: &str,
        expr: &str,
        value: Option<&str>,
    ) -> Result<(usize, bool)> {
        self.api_entry();
        let r = self.do_defnode(name, expr, value);
        self.api_exit();
        r
    }

    fn do_defnode(
        &mut self,
        name: &str,
        expr: &str,
        value: Option<&str>,
    ) -> Result<(usize, bool)> {
        if expr.is_empty() {
            return Err(self.fail(
                ErrorCode::BadArg,
                "defnode: EXPR must not be empty".to_owned(),
            ));
        }
        let mut px = self.parse_pathx(expr, false)?;
        let origin = self.tree.origin();
        let first = px
            .first(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;

        if first.is_none() {
            let id = px
                .expand_tree(&mut self.tree, &self.symtab, origin)
                .map_err(|e| self.record_pathx(e))?;
            self.tree.set_value(id, value);
            self.symtab.define_node(name, id);
            let canonical = self.tree.path_of(id);
            self.record_var_meta(name, Some(&canonical));
            Ok((1, true))
        } else {
            let count = px
                .nodeset(&self.tree, &self.symtab, origin)
                .map_err(|e| self.record_pathx(e))?
                .len();
            self.symtab.define_expr(name, &px);
            self.record_var_meta(name, Some(expr));
            Ok((count, false))
        }
    }

    /// Record the definition of a variable under /heracles/variables.
    fn record_var_meta(&mut self, name: &str, expr: Option<&str>) {
        let origin = self.tree.origin();
        let vars = self
            .tree
            .path_create(origin, &["heracles", "variables"]);
        match expr {
            None => {
                if let Some(node) = self.tree.find_child(vars, name) {
                    self.tree.unlink(node);
                }
            }
            Some(expr) => {
                let node = self.tree.child_or_create(vars, name);
                self.tree.set_value(node, Some(expr));
            }
        }
    }

    /// Add a transform under `/heracles/load`: apply the named lens to
    /// the files matching the glob `file` (or exclude them with `excl`).
    pub fn transform(
        &mut self,
        lens: &str,
        file: &str,
        excl: bool,
    ) -> Result<()> {
        self.api_entry();
        let r = self.do_transform(lens, file, excl);
        self.api_exit();
        r
    }

    fn do_transform(
        &mut self,
        lens: &str,
        file: &str,
        excl: bool,
    ) -> Result<()> {
        if lens.is_empty() {
            return Err(self.fail(
                ErrorCode::BadArg,
                "transform: LENS must not be empty".to_owned(),
            ));
        }
        if file.is_empty() {
            return Err(self.fail(
                ErrorCode::BadArg,
                "transform: FILE must not be empty".to_owned(),
            ));
        }

        let (lensname, xfmname) = match lens.rfind('.') {
            Some(dot) => (lens.to_owned(), lens[..dot].to_owned()),
            None => (format!("{}.lns", lens), lens.to_owned()),
        };

        let origin = self.tree.origin();
        let load = self.tree.path_create(origin, &["heracles", "load"]);
        let xfm = self.tree.child_or_create(load, &xfmname);
        let lns = self.tree.child_or_create(xfm, "lens");
        self.tree.set_value(lns, Some(&lensname));

        let filter = if excl { "excl" } else { "incl" };
        let exists = self.tree.node(xfm).children.iter().any(|c| {
            let node = self.tree.node(*c);
            node.value.as_deref() == Some(file)
                && node.label.as_deref() == Some(filter)
        });
        if !exists {
            self.tree.append(
                xfm,
                Some(filter.to_owned()),
                Some(file.to_owned()),
            );
        }
        Ok(())
    }

    /// The filesystem root all managed files live under. Always ends
    /// with '/'.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The directories searched for lens resources.
    pub fn loadpath(&self) -> &[String] {
        &self.loadpath
    }

    /// Release the handle and all resources it owns.
    pub fn close(self) {}

    // ----- error reporting -----

    /// The code of the last error, or [`ErrorCode::NoError`].
    pub fn error(&self) -> ErrorCode {
        self.error.code.unwrap_or(ErrorCode::NoError)
    }

    /// The canonical message for the last error code.
    pub fn error_message(&self) -> &'static str {
        self.error().message()
    }

    /// A message elaborating on the last error code.
    pub fn error_minor_message(&self) -> Option<&str> {
        self.error.minor_details
    }

    /// Details about the last error, e.g. the offending substring and
    /// character offset of a failed path expression.
    pub fn error_details(&self) -> Option<&str> {
        self.error.details.as_deref()
    }

    // ----- façade plumbing -----

    /// Called at the beginning of every public operation. Since public
    /// operations call each other, the error slot is only reset and the
    /// locale only pinned on the outermost entry.
    pub(crate) fn api_entry(&mut self) {
        self.api_entries += 1;
        if self.api_entries > 1 {
            return;
        }
        self.error = ErrorRecord::default();
        self.save_locale();
    }

    /// Called at the end of every public operation. On the outermost
    /// exit, path-expression errors are published into the meta tree and
    /// the caller's locale is restored.
    pub(crate) fn api_exit(&mut self) {
        debug_assert!(self.api_entries > 0);
        self.api_entries -= 1;
        if self.api_entries == 0 {
            self.store_pathx_error();
            self.restore_locale();
        }
    }

    /// Report path expression errors in /heracles/pathx/error.
    fn store_pathx_error(&mut self) {
        if self.error.code != Some(ErrorCode::PathX) {
            return;
        }
        let minor = self.error.minor_details.map(str::to_owned);
        let details = self.error.details.clone();
        let origin = self.tree.origin();
        let node = self
            .tree
            .path_create(origin, &["heracles", "pathx", "error"]);
        self.tree.set_value(node, minor.as_deref());
        let pos = self.tree.child_or_create(node, "pos");
        self.tree.set_value(pos, details.as_deref());
    }

    pub(crate) fn record(&mut self, err: Error) -> Error {
        self.error.code = Some(err.code);
        self.error.details = err.details.clone();
        self.error.minor_details = err.minor_details;
        err
    }

    pub(crate) fn fail(
        &mut self,
        code: ErrorCode,
        details: String,
    ) -> Error {
        self.record(Error::new(code, Some(details)))
    }

    pub(crate) fn record_pathx(&mut self, e: PathxError) -> Error {
        self.record(Error::from(e))
    }

    /// Parse a path expression against the tree, rooted at the
    /// configured context for relative paths.
    pub(crate) fn parse_pathx(
        &mut self,
        path: &str,
        need_nodeset: bool,
    ) -> Result<Pathx> {
        let root_ctx = self.tree_root_ctx()?;
        Pathx::parse(path, need_nodeset, root_ctx)
            .map_err(|e| self.record_pathx(e))
    }

    fn find_one_node(
        &mut self,
        px: &mut Pathx,
        path: &str,
    ) -> Result<NodeId> {
        let origin = self.tree.origin();
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        match (count, found) {
            (1, Some(id)) => Ok(id),
            (0, _) => Err(self.fail(
                ErrorCode::NoMatch,
                format!("No node matching {}", path),
            )),
            _ => Err(self.fail(
                ErrorCode::MMatch,
                format!("There are {} nodes matching {}", count, path),
            )),
        }
    }

    /// The node relative paths are resolved against, from the value of
    /// /heracles/context. A missing or empty context yields `None`; the
    /// context path is created when it does not match anything yet.
    pub(crate) fn tree_root_ctx(&mut self) -> Result<Option<NodeId>> {
        let origin = self.tree.origin();
        let mut px = Pathx::parse(CONTEXT, true, None)
            .map_err(|e| self.record_pathx(e))?;
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        if count > 1 {
            return Err(self.fail(
                ErrorCode::MMatch,
                format!(
                    "There are {} nodes matching {}, expecting one",
                    count, CONTEXT
                ),
            ));
        }
        let ctx_path = match found
            .and_then(|id| self.tree.node(id).value.clone())
        {
            Some(value) if !value.is_empty() => cleanpath(&value),
            _ => return Ok(None),
        };

        let mut px = Pathx::parse(&ctx_path, true, None)
            .map_err(|e| self.record_pathx(e))?;
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))?;
        match count {
            0 => {
                let id = px
                    .expand_tree(&mut self.tree, &self.symtab, origin)
                    .map_err(|e| self.record_pathx(e))?;
                self.tree.set_value(id, None);
                Ok(Some(id))
            }
            1 => Ok(found),
            _ => Err(self.fail(
                ErrorCode::MMatch,
                format!(
                    "There are {} nodes matching the context {}, expecting one",
                    count, ctx_path
                ),
            )),
        }
    }

    /// Find the single node matching `path`, or `None`.
    pub(crate) fn find_tree(&mut self, path: &str) -> Option<NodeId> {
        let mut px = self.parse_pathx(path, true).ok()?;
        let origin = self.tree.origin();
        let (count, found) = px
            .find_one(&self.tree, &self.symtab, origin)
            .ok()?;
        if count == 1 {
            found
        } else {
            None
        }
    }

    /// Find the node matching `path`, expanding the tree to contain it
    /// when there is none.
    pub(crate) fn find_tree_cr(&mut self, path: &str) -> Result<NodeId> {
        let mut px = self.parse_pathx(path, true)?;
        let origin = self.tree.origin();
        px.expand_tree(&mut self.tree, &self.symtab, origin)
            .map_err(|e| self.record_pathx(e))
    }

    // ----- locale pinning -----

    // Public operations run under the C locale so number and string
    // formatting is stable no matter what the caller set; the caller's
    // locale is restored on every exit path.
    #[cfg(unix)]
    fn save_locale(&mut self) {
        if self.c_locale.is_null() {
            self.c_locale = unsafe {
                libc::newlocale(
                    libc::LC_ALL_MASK,
                    b"C\0".as_ptr() as *const libc::c_char,
                    std::ptr::null_mut(),
                )
            };
        }
        if !self.c_locale.is_null() {
            self.user_locale = unsafe { libc::uselocale(self.c_locale) };
        }
    }

    #[cfg(unix)]
    fn restore_locale(&mut self) {
        if !self.user_locale.is_null() {
            unsafe { libc::uselocale(self.user_locale) };
            self.user_locale = std::ptr::null_mut();
        }
    }

    #[cfg(unix)]
    fn free_locale(&mut self) {
        if !self.c_locale.is_null() {
            unsafe { libc::freelocale(self.c_locale) };
            self.c_locale = std::ptr::null_mut();
        }
    }

    #[cfg(not(unix))]
    fn save_locale(&mut self) {}

    #[cfg(not(unix))]
    fn restore_locale(&mut self) {}

    #[cfg(not(unix))]
    fn free_locale(&mut self) {}
}

impl Drop for Heracles {
    fn drop(&mut self) {
        self.restore_locale();
        self.free_locale();
    }
}

// ===== helper functions =====

fn init_root(root: Option<&str>) -> String {
    let mut root = match root {
        Some(root) if !root.is_empty() => root.to_owned(),
        _ => match std::env::var(ROOT_ENV) {
            Ok(env) if !env.is_empty() => env,
            _ => "/".to_owned(),
        },
    };
    if !root.ends_with('/') {
        root.push('/');
    }
    root
}

fn init_loadpath(loadpath: Option<&str>, flags: Flags) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut extend = |list: &str| {
        for dir in list.split(':').filter(|d| !d.is_empty()) {
            dirs.push(dir.trim_end_matches('/').to_owned());
        }
    };
    if let Some(loadpath) = loadpath {
        extend(loadpath);
    }
    if let Ok(env) = std::env::var(LENS_ENV) {
        extend(&env);
    }
    if !flags.contains(Flags::NO_STDINC) {
        dirs.push(LENS_DIR.to_owned());
        dirs.push(LENS_DIST_DIR.to_owned());
    }
    dirs
}

/// Clean a path from the user: strip whitespace and trailing slashes.
fn cleanpath(path: &str) -> String {
    let path = path.trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}
