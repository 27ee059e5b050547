//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Transforms: wiring lenses to the files they manage.
//!
//! A transform is a registration under `/heracles/load` pairing a lens
//! name with include/exclude globs. The loader expands the globs under
//! the filesystem root, applies the lens `get` direction to every file
//! whose on-disk state changed, and splices the resulting subtree into
//! `/files`. The saver walks dirty subtrees, applies the lens `put`
//! direction against the original file contents, and replaces files
//! atomically via a temp file and rename. Every failure along the way is
//! recorded under `/heracles/files/<path>/error` so applications can
//! query errors through the same API they use for data.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use glob::{MatchOptions, Pattern};
use log::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::heracles::{
    Flags, Heracles, COPY_IF_RENAME_FAILS, EVENTS_SAVED, FILES_TREE,
    META_FILES, META_SAVE_MODE, META_TEXT, META_TREE, SPAN_OPTION,
};
use crate::lens::{Lens, LensError, LensNode};
use crate::pathx::Pathx;
use crate::tree::{NodeId, Span};

/// Extension for newly created files.
const EXT_HERANEW: &str = ".heranew";
/// Extension for backup files.
const EXT_HERASAVE: &str = ".herasave";

/// Selector for nodes that correspond to a file and carry no error.
const FILE_NODES: &str = "descendant-or-self::*[path][count(error) = 0]";

const SAVE_NEWFILE_TEXT: &str = "newfile";
const SAVE_BACKUP_TEXT: &str = "backup";
const SAVE_NOOP_TEXT: &str = "noop";
const SAVE_OVERWRITE_TEXT: &str = "overwrite";
const ENABLE_TEXT: &str = "enable";

// Globs match like fnmatch(3) with FNM_PATHNAME.
fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// File modification time in nanoseconds since the epoch, as a string.
/// Unreadable files report the impossible mtime "0".
fn mtime_as_string(fname: Option<&Path>) -> String {
    fname
        .and_then(|f| std::fs::metadata(f).ok())
        .and_then(|md| md.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_else(|| "0".to_owned())
}

/// Lenses generally break if the file does not end with a newline.
fn append_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Line (1-based) and column (0-based) of byte position `pos` in `text`.
fn calc_line_ofs(text: &str, pos: usize) -> (usize, usize) {
    let pos = pos.min(text.len());
    let line = text[..pos].bytes().filter(|b| *b == b'\n').count() + 1;
    let ofs = match text[..pos].rfind('\n') {
        Some(nl) => pos - nl - 1,
        None => pos,
    };
    (line, ofs)
}

#[cfg(unix)]
fn is_bind_mount_error(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(),
        Some(code) if code == libc::EXDEV || code == libc::EBUSY)
}

#[cfg(not(unix))]
fn is_bind_mount_error(_: &std::io::Error) -> bool {
    false
}

/// Rename `from` to `to`. When rename fails with EXDEV or EBUSY (which we
/// assume means a bind-mounted file) and `copy_if_rename_fails` holds,
/// copy the contents over instead; with `unlink_first`, the destination
/// is unlinked before copying so we never write through an attacker's
/// file placed there.
fn clone_file(
    from: &Path,
    to: &Path,
    copy_if_rename_fails: bool,
    unlink_first: bool,
) -> std::result::Result<(), (&'static str, std::io::Error)> {
    match std::fs::rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) => {
            if !is_bind_mount_error(&e) || !copy_if_rename_fails {
                return Err(("rename", e));
            }
        }
    }

    if unlink_first {
        if let Err(e) = std::fs::remove_file(to) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(("clone_unlink_dst", e));
            }
        }
    }
    std::fs::copy(from, to).map_err(|e| ("clone_write", e))?;
    std::fs::OpenOptions::new()
        .append(true)
        .open(to)
        .and_then(|f| f.sync_all())
        .map_err(|e| ("clone_sync", e))?;
    let _ = std::fs::remove_file(from);
    Ok(())
}

/// Transfer owner, group and mode from one file to another.
#[cfg(unix)]
fn transfer_file_attrs(from: &Path, to: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let md = std::fs::metadata(from)?;
    std::os::unix::fs::chown(to, Some(md.uid()), Some(md.gid()))?;
    std::fs::set_permissions(to, md.permissions())?;
    Ok(())
}

#[cfg(not(unix))]
fn transfer_file_attrs(from: &Path, to: &Path) -> std::io::Result<()> {
    let md = std::fs::metadata(from)?;
    std::fs::set_permissions(to, md.permissions())?;
    Ok(())
}

/// Mode for newly created files: 0666 minus the process umask, read
/// under an acquire/restore pattern.
#[cfg(unix)]
fn new_file_mode() -> u32 {
    let umask = unsafe {
        let cur = libc::umask(0o022);
        libc::umask(cur);
        cur
    };
    0o666 & !(umask as u32)
}

// ===== loader and saver =====

impl Heracles {
    fn is_filter(&self, id: NodeId, kind: &str) -> bool {
        let node = self.tree.node(id);
        node.label.as_deref() == Some(kind) && node.value.is_some()
    }

    /// Turn the filesystem path of a managed file into the corresponding
    /// tree path under /files.
    fn file_name_path(&self, fname: &Path) -> String {
        let full = fname.to_string_lossy();
        format!("{}{}", FILES_TREE, &full[self.root.len() - 1..])
    }

    fn xfm_lens_name(&self, xfm: NodeId) -> String {
        match self.tree.find_child(xfm, "lens") {
            None => "(unknown)".to_owned(),
            Some(l) => match &self.tree.node(l).value {
                None => "(noname)".to_owned(),
                Some(v) => v.clone(),
            },
        }
    }

    fn xfm_lens(
        &mut self,
        xfm: NodeId,
    ) -> Result<(Arc<dyn Lens>, String)> {
        let name = self
            .tree
            .find_child(xfm, "lens")
            .and_then(|l| self.tree.node(l).value.clone());
        let name = match name {
            Some(name) => name,
            None => {
                return Err(self.record(Error::new(
                    ErrorCode::NoLens,
                    Some("transform has no lens".to_owned()),
                )));
            }
        };
        match self.modules.resolve(&name) {
            Ok(lens) => Ok((lens, name)),
            Err(e) => Err(self.record(e)),
        }
    }

    fn xfm_error(&mut self, xfm: NodeId, msg: &str) {
        self.tree.append(
            xfm,
            Some("error".to_owned()),
            Some(msg.to_owned()),
        );
    }

    /// Check a transform registration: normalize relative globs to
    /// absolute ones, drop stale error children, and verify the lens
    /// resolves. Failures are recorded as error children on the
    /// registration.
    pub(crate) fn transform_validate(
        &mut self,
        xfm: NodeId,
    ) -> Result<()> {
        let mut lens = None;
        for id in self.tree.node(xfm).children.clone() {
            let node = self.tree.node(id);
            let label = node.label.clone();
            let value = node.value.clone();
            match label.as_deref() {
                Some("lens") => lens = Some(id),
                Some("error") => {
                    self.tree.unlink(id);
                }
                _ => {
                    let normalize = self.is_filter(id, "incl")
                        || (self.is_filter(id, "excl")
                            && value
                                .as_deref()
                                .map_or(false, |v| v.contains('/')));
                    if normalize {
                        if let Some(v) = value {
                            if !v.starts_with('/') {
                                self.tree.node_mut(id).value =
                                    Some(format!("/{}", v));
                            }
                        }
                    }
                }
            }
        }

        let lens = match lens {
            Some(lens) => lens,
            None => {
                self.xfm_error(xfm, "missing a child with label 'lens'");
                return Err(Error::new(ErrorCode::NoLens, None));
            }
        };
        if self.tree.node(lens).value.is_none() {
            self.xfm_error(
                xfm,
                "the 'lens' node does not contain a lens name",
            );
            return Err(Error::new(ErrorCode::NoLens, None));
        }
        if let Err(e) = self.xfm_lens(xfm) {
            let msg = e
                .details
                .clone()
                .unwrap_or_else(|| e.code.message().to_owned());
            self.xfm_error(xfm, &msg);
            return Err(e);
        }
        Ok(())
    }

    /// Expand a transform's include globs under the root, drop excluded
    /// paths, and keep only regular files.
    fn filter_generate(&mut self, xfm: NodeId) -> Vec<PathBuf> {
        let root = self.root.clone();
        let children = self.tree.node(xfm).children.clone();

        let mut paths = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for f in &children {
            if !self.is_filter(*f, "incl") {
                continue;
            }
            let value = match &self.tree.node(*f).value {
                Some(v) => v.clone(),
                None => continue,
            };
            let pattern = format!("{}{}", &root[..root.len() - 1], value);
            let entries =
                match glob::glob_with(&pattern, match_options()) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("bad include glob {}: {}", pattern, e);
                        continue;
                    }
                };
            for path in entries.flatten() {
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths.retain(|path| {
            let full = path.to_string_lossy();
            if full.len() < root.len() {
                return false;
            }
            let rel = &full[root.len() - 1..];
            for e in &children {
                if !self.is_filter(*e, "excl") {
                    continue;
                }
                let value = match &self.tree.node(*e).value {
                    Some(v) => v.clone(),
                    None => continue,
                };
                // A pattern without a '/' matches the basename only.
                let candidate = if value.contains('/') {
                    rel
                } else {
                    rel.rsplit('/').next().unwrap_or(rel)
                };
                if let Ok(pattern) = Pattern::new(&value) {
                    if pattern.matches_with(candidate, match_options()) {
                        return false;
                    }
                }
            }
            std::fs::metadata(path)
                .map(|md| md.is_file())
                .unwrap_or(false)
        });

        paths
    }

    /// Does any include glob of this transform accept `path` (relative
    /// to the root, e.g. `/etc/hosts`), without an exclude rejecting it?
    fn filter_matches(&self, xfm: NodeId, path: &str) -> bool {
        let children = &self.tree.node(xfm).children;
        let matches = |id: &NodeId| -> bool {
            match &self.tree.node(*id).value {
                Some(v) => Pattern::new(v)
                    .map(|p| p.matches_with(path, match_options()))
                    .unwrap_or(false),
                None => false,
            }
        };
        if !children
            .iter()
            .any(|f| self.is_filter(*f, "incl") && matches(f))
        {
            return false;
        }
        !children
            .iter()
            .any(|f| self.is_filter(*f, "excl") && matches(f))
    }

    /// Is this transform responsible for the tree path `path` under
    /// /files?
    pub(crate) fn transform_applies(
        &self,
        xfm: NodeId,
        path: &str,
    ) -> bool {
        match path.strip_prefix(FILES_TREE) {
            Some(rel) if rel.starts_with('/') => {
                self.filter_matches(xfm, rel)
            }
            _ => false,
        }
    }

    /// Set up the metadata for one file under /heracles: its tree path,
    /// mtime, and the lens used to load it.
    fn add_file_info(
        &mut self,
        node_path: &str,
        lens_info: &str,
        lens_name: &str,
        filename: Option<&Path>,
        force_reload: bool,
    ) -> Result<()> {
        let meta_path = format!("{}{}", META_TREE, node_path);
        let file = self.find_tree_cr(&meta_path)?;

        let path = self.tree.child_or_create(file, "path");
        self.tree.set_value(path, Some(node_path));

        let mtime = if force_reload {
            "0".to_owned()
        } else {
            mtime_as_string(filename)
        };
        let node = self.tree.child_or_create(file, "mtime");
        self.tree.set_value(node, Some(&mtime));

        let lens = self.tree.child_or_create(file, "lens");
        let info = self.tree.child_or_create(lens, "info");
        self.tree.set_value(info, Some(lens_info));
        self.tree.set_value(lens, Some(lens_name));

        self.tree.clean(file);
        Ok(())
    }

    /// Record an error under /heracles/files/<file>/error (or
    /// /heracles/text/<path>/error for text operations). With no status,
    /// clear any previous error instead.
    fn store_error(
        &mut self,
        filename: Option<&str>,
        path: &str,
        status: Option<&str>,
        io_err: Option<&std::io::Error>,
        lens_err: Option<&LensError>,
        text: Option<&str>,
    ) {
        let fip = match filename {
            Some(filename) => format!(
                "{}/{}",
                META_FILES,
                filename.trim_start_matches('/')
            ),
            None => format!(
                "{}/{}",
                META_TEXT,
                path.trim_start_matches('/')
            ),
        };
        let finfo = match self.find_tree_cr(&fip) {
            Ok(finfo) => finfo,
            Err(_) => return,
        };

        match status {
            Some(status) => {
                let err_info = self.tree.child_or_create(finfo, "error");
                self.tree.set_value(err_info, Some(status));

                if let Some(err) = lens_err {
                    if let Some(pos) = err.pos {
                        let node =
                            self.tree.child_or_create(err_info, "pos");
                        self.tree.set_value(node, Some(&pos.to_string()));
                        if let Some(text) = text {
                            let (line, ofs) = calc_line_ofs(text, pos);
                            let node = self
                                .tree
                                .child_or_create(err_info, "line");
                            self.tree
                                .set_value(node, Some(&line.to_string()));
                            let node = self
                                .tree
                                .child_or_create(err_info, "char");
                            self.tree
                                .set_value(node, Some(&ofs.to_string()));
                        }
                    }
                    if let Some(epath) = &err.path {
                        let node =
                            self.tree.child_or_create(err_info, "path");
                        self.tree.set_value(
                            node,
                            Some(&format!("{}{}", path, epath)),
                        );
                    }
                    if let Some(lens) = &err.lens {
                        let node =
                            self.tree.child_or_create(err_info, "lens");
                        self.tree.set_value(node, Some(lens));
                    }
                    let node =
                        self.tree.child_or_create(err_info, "message");
                    self.tree.set_value(node, Some(&err.message));
                } else if let Some(io_err) = io_err {
                    let node =
                        self.tree.child_or_create(err_info, "message");
                    self.tree.set_value(node, Some(&io_err.to_string()));
                }
            }
            None => {
                // No error, nuke the error node if it exists.
                if let Some(err_info) =
                    self.tree.find_child(finfo, "error")
                {
                    self.symtab
                        .remove_descendants(&self.tree, err_info);
                    self.tree.unlink(err_info);
                }
            }
        }

        self.tree.clean(finfo);
    }

    /// Record an out-of-band error for one file, replacing whatever the
    /// error node held before.
    fn transform_file_error(
        &mut self,
        status: &str,
        filename: &str,
        msg: String,
    ) {
        let ep = format!(
            "{}/{}/error",
            META_FILES,
            filename.trim_start_matches('/')
        );
        let err = match self.find_tree_cr(&ep) {
            Ok(err) => err,
            Err(_) => return,
        };
        for child in self.tree.node(err).children.clone() {
            self.symtab.remove_descendants(&self.tree, child);
        }
        self.tree.unlink_children(err);
        self.tree.set_value(err, Some(status));
        let message = self.tree.child_or_create(err, "message");
        self.tree.set_value(message, Some(&msg));
    }

    /// Is the tree still up to date with this file on disk?
    fn file_current(
        &mut self,
        fname: &Path,
        finfo: Option<NodeId>,
    ) -> bool {
        let finfo = match finfo {
            Some(finfo) => finfo,
            None => return false,
        };
        let recorded = self
            .tree
            .find_child(finfo, "mtime")
            .and_then(|m| self.tree.node(m).value.clone());
        let recorded = match recorded {
            Some(recorded) => recorded,
            None => return false,
        };
        if recorded != mtime_as_string(Some(fname)) {
            return false;
        }
        let path = self
            .tree
            .find_child(finfo, "path")
            .and_then(|p| self.tree.node(p).value.clone());
        let path = match path {
            Some(path) => path,
            None => return false,
        };
        match self.find_tree(&path) {
            Some(file) => !self.tree.node(file).dirty,
            None => false,
        }
    }

    /// Splice a lens-produced subtree into the tree at `path`,
    /// replacing whatever was there.
    fn tree_replace(
        &mut self,
        path: &str,
        sub: &LensNode,
        filename: &Arc<str>,
    ) -> Result<NodeId> {
        self.rm(path)?;
        let parent = self.find_tree_cr(path)?;
        self.tree.set_value(parent, None);
        self.splice(parent, sub, filename);
        Ok(parent)
    }

    fn splice(
        &mut self,
        parent: NodeId,
        sub: &LensNode,
        filename: &Arc<str>,
    ) {
        for child in &sub.children {
            let id = self.tree.append(
                parent,
                child.label.clone(),
                child.value.clone(),
            );
            if let Some(span) = &child.span {
                self.tree.node_mut(id).span = Some(Span {
                    filename: Arc::clone(filename),
                    label_start: span.label.0,
                    label_end: span.label.1,
                    value_start: span.value.0,
                    value_end: span.value.1,
                    span_start: span.node.0,
                    span_end: span.node.1,
                });
            }
            self.splice(id, child, filename);
        }
    }

    /// Export the children of a tree node into the neutral shape handed
    /// to a lens `put`.
    fn export_subtree(&self, id: NodeId) -> LensNode {
        let mut root = LensNode::root();
        for child in &self.tree.node(id).children {
            root.children.push(self.export_node(*child));
        }
        root
    }

    fn export_node(&self, id: NodeId) -> LensNode {
        let node = self.tree.node(id);
        let mut out = LensNode {
            label: node.label.clone(),
            value: node.value.clone(),
            children: Vec::new(),
            span: None,
        };
        for child in &node.children {
            out.children.push(self.export_node(*child));
        }
        out
    }

    /// Load one file through a lens and splice the result under /files.
    fn load_file(
        &mut self,
        lens: &Arc<dyn Lens>,
        lens_name: &str,
        filename: &Path,
    ) {
        let path = self.file_name_path(filename);
        let rel = &path[FILES_TREE.len()..];
        let rel = rel.to_owned();

        if self
            .add_file_info(
                &path,
                lens.info(),
                lens_name,
                Some(filename),
                false,
            )
            .is_err()
        {
            return;
        }

        let text = match std::fs::read(filename) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                self.store_error(
                    Some(&rel),
                    &path,
                    Some("read_failed"),
                    Some(&e),
                    None,
                    None,
                );
                return;
            }
        };
        let text_len = text.len();
        let text = append_newline(text);

        let spans = self.flags.contains(Flags::ENABLE_SPAN);
        match lens.get(&text, spans) {
            Err(err) => {
                warn!("failed to parse {}: {}", filename.display(), err.message);
                self.store_error(
                    Some(&rel),
                    &path,
                    Some("parse_failed"),
                    None,
                    Some(&err),
                    Some(&text),
                );
            }
            Ok(sub) => {
                let fname: Arc<str> =
                    Arc::from(filename.to_string_lossy().as_ref());
                match self.tree_replace(&path, &sub, &fname) {
                    Err(_) => {}
                    Ok(parent) => {
                        if spans {
                            // The top level node spans the entire file.
                            let mut span = Span::new(fname);
                            span.span_end = text_len as u32;
                            self.tree.node_mut(parent).span = Some(span);
                        }
                        self.store_error(
                            Some(&rel),
                            &path,
                            None,
                            None,
                            None,
                            None,
                        );
                    }
                }
            }
        }
    }

    /// Run one transform: expand its globs and (re)load every matching
    /// file whose on-disk state changed.
    pub(crate) fn transform_load(&mut self, xfm: NodeId) -> Result<()> {
        let (lens, lens_name) = self.xfm_lens(xfm)?;
        let matches = self.filter_generate(xfm);
        for m in matches {
            let full = m.to_string_lossy().into_owned();
            let rel = full[self.root.len() - 1..].to_owned();
            let meta_path = format!("{}{}", META_FILES, rel);
            let finfo = self.find_tree(&meta_path);
            let claimed = finfo.filter(|f| {
                !self.tree.node(*f).dirty
                    && self.tree.find_child(*f, "lens").is_some()
            });
            if let Some(f) = claimed {
                // Two transforms claim this file; drop it from /files.
                let prior = self.xfm_lens_name(f);
                self.transform_file_error(
                    "mxfm_load",
                    &rel,
                    format!(
                        "Lenses {} and {} could be used to load this file",
                        prior, lens_name
                    ),
                );
                let fpath = format!("{}{}", FILES_TREE, rel);
                let _ = self.rm(&fpath);
            } else if !self.file_current(&m, finfo) {
                debug!("loading {}", full);
                self.load_file(&lens, &lens_name, &m);
            }
            if let Some(finfo) = self.find_tree(&meta_path) {
                self.tree.node_mut(finfo).dirty = false;
            }
        }
        Ok(())
    }

    // ----- load -----

    fn mark_files(&mut self, id: NodeId) {
        if self.tree.find_child(id, "path").is_some() {
            self.tree.mark_dirty(id);
        } else {
            for child in self.tree.node(id).children.clone() {
                self.mark_files(child);
            }
        }
    }

    fn rm_dirty_files(&mut self, id: NodeId) {
        if !self.tree.contains(id) || !self.tree.node(id).dirty {
            return;
        }
        if let Some(p) = self.tree.find_child(id, "path") {
            if let Some(path) = self.tree.node(p).value.clone() {
                let _ = self.rm(&path);
            }
            self.symtab.remove_descendants(&self.tree, id);
            self.tree.unlink(id);
        } else {
            for child in self.tree.node(id).children.clone() {
                self.rm_dirty_files(child);
            }
        }
    }

    fn rm_dirty_leaves(&mut self, id: NodeId, protect: NodeId) {
        if !self.tree.contains(id) || !self.tree.node(id).dirty {
            return;
        }
        for child in self.tree.node(id).children.clone() {
            self.rm_dirty_leaves(child, protect);
        }
        if id != protect && self.tree.node(id).children.is_empty() {
            self.symtab.remove_descendants(&self.tree, id);
            self.tree.unlink(id);
        }
    }

    /// Load (or reload) the files matched by the transforms registered
    /// under `/heracles/load`. Tree content for files that vanished or
    /// are no longer matched is removed; per-file failures are recorded
    /// in the meta tree rather than failing the whole load.
    pub fn load(&mut self) -> Result<()> {
        self.api_entry();
        let r = self.do_load();
        self.api_exit();
        r
    }

    fn do_load(&mut self) -> Result<()> {
        let origin = self.tree.origin();
        let meta = self.tree.child_or_create(origin, "heracles");
        let meta_files = self.tree.child_or_create(meta, "files");
        let files = self.tree.child_or_create(origin, "files");
        let load = self.tree.child_or_create(meta, "load");
        let vars = self.tree.child_or_create(meta, "variables");

        // To avoid unnecessary work, reloading happens in several steps:
        // (1) mark all file nodes under /heracles/files as dirty (and
        //     only those);
        // (2) process all transforms; a file whose mtime and tree are
        //     unchanged is skipped, everything else is reparsed. Either
        //     way the file node's dirty flag is cleared;
        // (3) remove all files from the tree that still have a dirty
        //     entry under /heracles/files - no transform feels
        //     responsible for them anymore;
        // (4) prune directory entries that lost all their files.

        if let (true, Some(option)) = self.get(SPAN_OPTION)? {
            if option == ENABLE_TEXT {
                self.flags.insert(Flags::ENABLE_SPAN);
            } else {
                self.flags.remove(Flags::ENABLE_SPAN);
            }
        }

        self.tree.clean(meta_files);
        self.mark_files(meta_files);

        for xfm in self.tree.node(load).children.clone() {
            if self.transform_validate(xfm).is_ok() {
                let _ = self.transform_load(xfm);
            }
        }

        // This makes it possible to spot 'directories' that are now
        // empty because their file contents were removed.
        self.tree.clean(files);

        self.rm_dirty_files(meta_files);
        self.rm_dirty_leaves(meta_files, meta_files);
        self.rm_dirty_leaves(files, files);

        self.tree.clean(origin);

        let vars: Vec<(String, Option<String>)> = self
            .tree
            .node(vars)
            .children
            .iter()
            .filter_map(|v| {
                let node = self.tree.node(*v);
                node.label
                    .clone()
                    .map(|label| (label, node.value.clone()))
            })
            .collect();
        for (name, expr) in vars {
            self.defvar(&name, expr.as_deref())?;
        }
        Ok(())
    }

    // ----- save -----

    /// Reset the save flags based on what is set in the tree.
    fn update_save_flags(&mut self) -> Result<()> {
        let (_, mode) = self.get(META_SAVE_MODE)?;
        let mode = match mode {
            Some(mode) => mode,
            None => {
                return Err(self.fail(
                    ErrorCode::Internal,
                    "save mode is not set".to_owned(),
                ));
            }
        };
        self.flags.remove(
            Flags::SAVE_BACKUP | Flags::SAVE_NEWFILE | Flags::SAVE_NOOP,
        );
        match mode.as_str() {
            SAVE_NEWFILE_TEXT => self.flags.insert(Flags::SAVE_NEWFILE),
            SAVE_BACKUP_TEXT => self.flags.insert(Flags::SAVE_BACKUP),
            SAVE_NOOP_TEXT => self.flags.insert(Flags::SAVE_NOOP),
            SAVE_OVERWRITE_TEXT => {}
            other => {
                return Err(self.fail(
                    ErrorCode::Internal,
                    format!("invalid save mode {}", other),
                ));
            }
        }
        Ok(())
    }

    /// Write every dirty file subtree back to disk. Files are only
    /// replaced atomically; per-file failures are recorded in the meta
    /// tree and reported as an error after all files were attempted.
    pub fn save(&mut self) -> Result<()> {
        self.api_entry();
        let r = self.do_save();
        self.api_exit();
        r
    }

    fn do_save(&mut self) -> Result<()> {
        self.update_save_flags()?;

        let origin = self.tree.origin();
        let meta = self.tree.child_or_create(origin, "heracles");
        let meta_files = self.tree.child_or_create(meta, "files");
        let files = self.tree.child_or_create(origin, "files");
        let load = self.tree.child_or_create(meta, "load");

        self.rm(EVENTS_SAVED)?;

        for xfm in self.tree.node(load).children.clone() {
            let _ = self.transform_validate(xfm);
        }

        let mut ok = true;
        if self.tree.node(files).dirty {
            let children = self.tree.node(files).children.clone();
            if !self.tree_save(children, FILES_TREE) {
                ok = false;
            }

            // Remove files whose entire subtree was removed.
            if !self.unlink_removed_files(files, meta_files) {
                ok = false;
            }
        }

        if !self.flags.contains(Flags::SAVE_NOOP) {
            self.tree.clean(origin);
        }

        if ok {
            Ok(())
        } else {
            let code = self.error();
            let code = if code == ErrorCode::NoError {
                ErrorCode::Internal
            } else {
                code
            };
            Err(Error {
                code,
                details: self.error_details().map(str::to_owned),
                minor_details: None,
            })
        }
    }

    /// Walk the dirty parts of /files, match subtrees to transforms,
    /// and save each file through its lens. Subtrees claimed by more
    /// than one transform raise an error but are still saved through
    /// the first one.
    fn tree_save(&mut self, ids: Vec<NodeId>, path: &str) -> bool {
        let mut ok = true;
        let origin = self.tree.origin();
        let load = self.tree.path_create(origin, &["heracles", "load"]);

        for t in ids {
            if !self.tree.contains(t) || !self.tree.node(t).dirty {
                continue;
            }
            let label = match &self.tree.node(t).label {
                Some(label) => label.clone(),
                None => continue,
            };
            let tpath = format!("{}/{}", path, label);

            let mut chosen: Option<NodeId> = None;
            for xfm in self.tree.node(load).children.clone() {
                if !self.transform_applies(xfm, &tpath) {
                    continue;
                }
                match chosen {
                    None => chosen = Some(xfm),
                    Some(c) if c == xfm => {}
                    Some(c) => {
                        let filename = &tpath[FILES_TREE.len() + 1..];
                        let filename = filename.to_owned();
                        let l1 = self.xfm_lens_name(c);
                        let l2 = self.xfm_lens_name(xfm);
                        self.transform_file_error(
                            "mxfm_save",
                            &filename,
                            format!(
                                "Lenses {} and {} could be used to save this file",
                                l1, l2
                            ),
                        );
                        self.fail(
                            ErrorCode::MXfm,
                            format!(
                                "Path {} transformable by lens {} and {}",
                                tpath, l1, l2
                            ),
                        );
                        ok = false;
                    }
                }
            }

            match chosen {
                Some(xfm) => {
                    if self.transform_save(xfm, &tpath, t).is_err() {
                        ok = false;
                    }
                }
                None => {
                    let children = self.tree.node(t).children.clone();
                    if !self.tree_save(children, &tpath) {
                        ok = false;
                    }
                }
            }
        }
        ok
    }

    /// Record that a file was (or, in noop mode, would have been)
    /// written.
    fn file_saved_event(&mut self, path: &str) {
        let origin = self.tree.origin();
        let events = self
            .tree
            .path_create(origin, &["heracles", "events"]);
        self.tree.append(
            events,
            Some("saved".to_owned()),
            Some(path.to_owned()),
        );
    }

    /// Save the children of `t` into the file for `path` using the lens
    /// from `xfm`.
    ///
    /// Writing happens into a temp file created next to the final
    /// destination; the temp file takes over the attributes of the
    /// original and replaces it via rename. In backup mode the original
    /// is cloned to `.herasave` first; in newfile mode the destination
    /// is `.heranew` next to the original, which itself stays untouched.
    fn transform_save(
        &mut self,
        xfm: NodeId,
        path: &str,
        t: NodeId,
    ) -> Result<()> {
        let rel = path[FILES_TREE.len() + 1..].to_owned();

        let (lens, lens_name) = match self.xfm_lens(xfm) {
            Ok(found) => found,
            Err(e) => {
                self.store_error(
                    Some(&rel),
                    path,
                    Some("lens_name"),
                    None,
                    None,
                    None,
                );
                return Err(e);
            }
        };

        let copy_if_rename_fails =
            matches!(self.get(COPY_IF_RENAME_FAILS)?, (true, _));

        let heraorig = PathBuf::from(format!("{}{}", self.root, rel));
        let (heraorig_canon, orig_exists) =
            match std::fs::canonicalize(&heraorig) {
                Ok(canon) => (canon, true),
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    (heraorig.clone(), false)
                }
                Err(e) => {
                    return Err(self.save_fail(
                        &rel,
                        path,
                        "canon_heraorig",
                        Some(e),
                    ));
                }
            };

        let text = if orig_exists {
            match std::fs::read(&heraorig_canon) {
                Ok(bytes) => {
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                Err(e) => {
                    return Err(self.save_fail(
                        &rel,
                        path,
                        "put_read",
                        Some(e),
                    ));
                }
            }
        } else {
            String::new()
        };
        let text = append_newline(text);

        // Figure out where to put the temp file: next to the original
        // in overwrite and backup mode, next to the .heranew file
        // otherwise.
        let heranew = PathBuf::from(format!(
            "{}{}",
            heraorig.display(),
            EXT_HERANEW
        ));
        let heradest = if self.flags.contains(Flags::SAVE_NEWFILE) {
            heranew
        } else {
            heraorig_canon.clone()
        };

        let dir = heradest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = heradest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "heracles".to_owned());
        let mut temp = match tempfile::Builder::new()
            .prefix(&format!("{}.", base))
            .tempfile_in(&dir)
        {
            Ok(temp) => temp,
            Err(e) => {
                return Err(self.save_fail(
                    &rel,
                    path,
                    "mk_heratemp",
                    Some(e),
                ));
            }
        };

        if orig_exists {
            if let Err(e) =
                transfer_file_attrs(&heraorig_canon, temp.path())
            {
                return Err(self.save_fail(
                    &rel,
                    path,
                    "xfer_attrs",
                    Some(e),
                ));
            }
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms =
                    std::fs::Permissions::from_mode(new_file_mode());
                if let Err(e) =
                    std::fs::set_permissions(temp.path(), perms)
                {
                    return Err(self.save_fail(
                        &rel,
                        path,
                        "create_chmod",
                        Some(e),
                    ));
                }
            }
        }

        let subtree = self.export_subtree(t);
        let output = match lens.put(&subtree, &text) {
            Ok(output) => output,
            Err(err) => {
                let status = if err.pos.is_some() {
                    "parse_skel_failed"
                } else {
                    "put_failed"
                };
                let _ = self.add_file_info(
                    path,
                    lens.info(),
                    &lens_name,
                    Some(&heraorig),
                    false,
                );
                self.store_error(
                    Some(&rel),
                    path,
                    Some(status),
                    None,
                    Some(&err),
                    Some(&text),
                );
                return Err(self.fail(
                    ErrorCode::Internal,
                    format!("put failed for {}: {}", path, err.message),
                ));
            }
        };

        let written = temp
            .as_file_mut()
            .write_all(output.as_bytes())
            .and_then(|_| temp.as_file_mut().flush())
            .and_then(|_| temp.as_file().sync_all());
        if let Err(e) = written {
            return Err(self.save_fail(
                &rel,
                path,
                "sync_heratemp",
                Some(e),
            ));
        }

        let force_reload = self.flags.contains(Flags::SAVE_NEWFILE);

        // Unchanged output means nothing to do.
        if output == text {
            let _ = self.add_file_info(
                path,
                lens.info(),
                &lens_name,
                Some(&heraorig),
                force_reload,
            );
            self.store_error(Some(&rel), path, None, None, None, None);
            return Ok(());
        }

        if self.flags.contains(Flags::SAVE_NOOP) {
            let _ = self.add_file_info(
                path,
                lens.info(),
                &lens_name,
                Some(&heraorig),
                force_reload,
            );
            self.file_saved_event(path);
            self.store_error(Some(&rel), path, None, None, None, None);
            return Ok(());
        }

        if !self.flags.contains(Flags::SAVE_NEWFILE)
            && orig_exists
            && self.flags.contains(Flags::SAVE_BACKUP)
        {
            let herasave = PathBuf::from(format!(
                "{}{}",
                heraorig.display(),
                EXT_HERASAVE
            ));
            if let Err((status, e)) =
                clone_file(&heraorig_canon, &herasave, true, true)
            {
                let status = format!("{}_herasave", status);
                return Err(self.save_fail_dyn(
                    &rel,
                    path,
                    status,
                    Some(e),
                ));
            }
        }

        let (temp_file, temp_path) = temp.into_parts();
        drop(temp_file);
        if let Err((status, e)) =
            clone_file(&temp_path, &heradest, copy_if_rename_fails, false)
        {
            let status = format!("{}_heratemp", status);
            return Err(self.save_fail_dyn(&rel, path, status, Some(e)));
        }
        // The rename consumed the temp file; disarm its cleanup.
        let _ = temp_path.keep();

        debug!("saved {} to {}", path, heradest.display());

        let r = self.add_file_info(
            path,
            lens.info(),
            &lens_name,
            Some(&heraorig),
            force_reload,
        );
        if r.is_err() {
            return Err(self.save_fail(&rel, path, "file_info", None));
        }
        self.file_saved_event(path);
        self.store_error(Some(&rel), path, None, None, None, None);
        Ok(())
    }

    fn save_fail(
        &mut self,
        rel: &str,
        path: &str,
        status: &str,
        io_err: Option<std::io::Error>,
    ) -> Error {
        self.store_error(
            Some(rel),
            path,
            Some(status),
            io_err.as_ref(),
            None,
            None,
        );
        self.fail(
            ErrorCode::Internal,
            match io_err {
                Some(e) => format!("{} failed for {}: {}", status, path, e),
                None => format!("{} failed for {}", status, path),
            },
        )
    }

    fn save_fail_dyn(
        &mut self,
        rel: &str,
        path: &str,
        status: String,
        io_err: Option<std::io::Error>,
    ) -> Error {
        self.save_fail(rel, path, &status, io_err)
    }

    /// Find all meta entries for files whose subtree under /files is
    /// gone, and delete (or back up) the files themselves.
    fn unlink_removed_files(
        &mut self,
        files: NodeId,
        meta: NodeId,
    ) -> bool {
        if !self.tree.node(files).dirty {
            return true;
        }
        let mut ok = true;
        for tm in self.tree.node(meta).children.clone() {
            if !self.tree.contains(tm) {
                continue;
            }
            let label = match &self.tree.node(tm).label {
                Some(label) => label.clone(),
                None => continue,
            };
            match self.tree.find_child(files, &label) {
                None => {
                    // Unlink all files below this meta entry.
                    let mut px =
                        match Pathx::parse(FILE_NODES, true, None) {
                            Ok(px) => px,
                            Err(_) => {
                                ok = false;
                                continue;
                            }
                        };
                    let ids = match px.nodeset(
                        &self.tree,
                        &self.symtab,
                        tm,
                    ) {
                        Ok(ids) => ids.to_vec(),
                        Err(_) => {
                            ok = false;
                            continue;
                        }
                    };
                    for t in ids {
                        if self.tree.contains(t)
                            && self.remove_file(t).is_err()
                        {
                            ok = false;
                        }
                    }
                }
                Some(tf) => {
                    if self.tree.node(tf).dirty
                        && self.tree.find_child(tm, "path").is_none()
                        && !self.unlink_removed_files(tf, tm)
                    {
                        ok = false;
                    }
                }
            }
        }
        ok
    }

    /// Delete (or, in backup mode, rename) the file corresponding to a
    /// meta entry whose tree content was removed.
    fn remove_file(&mut self, meta_node: NodeId) -> Result<()> {
        let path = self.tree.path_of(meta_node);
        let filename = path[META_FILES.len()..].to_owned();

        let heraorig =
            PathBuf::from(format!("{}{}", self.root, &filename[1..]));
        let heraorig_canon = match std::fs::canonicalize(&heraorig) {
            Ok(canon) => canon,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(e) => {
                return Err(self.save_fail(
                    &filename,
                    &path,
                    "canon_heraorig",
                    Some(e),
                ));
            }
        };

        self.file_saved_event(&path[META_TREE.len()..]);

        if self.flags.contains(Flags::SAVE_NOOP) {
            return Ok(());
        }

        if self.flags.contains(Flags::SAVE_BACKUP) {
            let herasave = PathBuf::from(format!(
                "{}{}",
                heraorig_canon.display(),
                EXT_HERASAVE
            ));
            if let Err((status, e)) =
                clone_file(&heraorig_canon, &herasave, true, true)
            {
                let status = format!("{}_herasave", status);
                return Err(self.save_fail_dyn(
                    &filename,
                    &path,
                    status,
                    Some(e),
                ));
            }
        } else if let Err(e) = std::fs::remove_file(&heraorig_canon) {
            return Err(self.save_fail(
                &filename,
                &path,
                "unlink_orig",
                Some(e),
            ));
        }

        self.symtab.remove_descendants(&self.tree, meta_node);
        self.tree.unlink(meta_node);
        Ok(())
    }

    // ----- text store and retrieve -----

    /// Parse the text stored as the value of `node` with a lens and put
    /// the resulting subtree at `path`.
    pub fn text_store(
        &mut self,
        lens: &str,
        node: &str,
        path: &str,
    ) -> Result<()> {
        self.api_entry();
        let r = self.do_text_store(lens, node, path);
        self.api_exit();
        r
    }

    fn do_text_store(
        &mut self,
        lens: &str,
        node: &str,
        path: &str,
    ) -> Result<()> {
        let text = match self.get(node)? {
            (true, Some(text)) => text,
            _ => {
                return Err(self.fail(
                    ErrorCode::BadArg,
                    format!("node {} does not contain text", node),
                ));
            }
        };
        let lens = match self.modules.resolve(lens) {
            Ok(lens) => lens,
            Err(e) => return Err(self.record(e)),
        };

        // Make sure the path is well-formed before running the lens.
        self.parse_pathx(path, true)?;

        match lens.get(&text, false) {
            Err(err) => {
                self.store_error(
                    None,
                    path,
                    Some("parse_failed"),
                    None,
                    Some(&err),
                    Some(&text),
                );
                Err(self.fail(
                    ErrorCode::Internal,
                    format!("parsing text for {} failed", path),
                ))
            }
            Ok(sub) => {
                let fname: Arc<str> = Arc::from("(text)");
                self.tree_replace(path, &sub, &fname)?;
                self.store_error(None, path, None, None, None, None);
                Ok(())
            }
        }
    }

    /// Serialise the subtree at `path` against the text stored at
    /// `node_in`, and store the output as the value of `node_out`.
    pub fn text_retrieve(
        &mut self,
        lens: &str,
        node_in: &str,
        path: &str,
        node_out: &str,
    ) -> Result<()> {
        self.api_entry();
        let r = self.do_text_retrieve(lens, node_in, path, node_out);
        self.api_exit();
        r
    }

    fn do_text_retrieve(
        &mut self,
        lens: &str,
        node_in: &str,
        path: &str,
        node_out: &str,
    ) -> Result<()> {
        let text = match self.get(node_in)? {
            (true, Some(text)) => text,
            _ => {
                return Err(self.fail(
                    ErrorCode::BadArg,
                    format!("node {} does not contain text", node_in),
                ));
            }
        };
        let lens = match self.modules.resolve(lens) {
            Ok(lens) => lens,
            Err(e) => return Err(self.record(e)),
        };

        let subtree = match self.find_tree(path) {
            Some(id) => self.export_subtree(id),
            None => LensNode::root(),
        };
        match lens.put(&subtree, &text) {
            Err(err) => {
                let status = if err.pos.is_some() {
                    "parse_skel_failed"
                } else {
                    "put_failed"
                };
                self.store_error(
                    None,
                    path,
                    Some(status),
                    None,
                    Some(&err),
                    Some(&text),
                );
                Err(self.fail(
                    ErrorCode::Internal,
                    format!("serialising {} failed", path),
                ))
            }
            Ok(output) => {
                self.store_error(None, path, None, None, None, None);
                self.set(node_out, Some(&output))?;
                Ok(())
            }
        }
    }
}
