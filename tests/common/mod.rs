//! Shared fixtures: a line-oriented hosts lens and scratch roots.

#![allow(dead_code)]

use std::sync::Arc;

use heracles::lens::{
    Autoload, Lens, LensError, LensNode, LensSpan, Module,
};
use heracles::{Flags, Heracles};

/// Contents of the hosts file every scratch root starts out with.
pub static HOSTS: &str = "127.0.0.1 localhost localhost.localdomain\n\
                          172.31.122.14 orange.example.com orange\n";

/// A hosts-style lens: one entry per line, fields separated by single
/// spaces, `#` starting a comment. Writing regenerates each line from
/// its fields, so files in this canonical form round-trip byte for
/// byte.
pub struct HostsLens;

impl HostsLens {
    fn parse_entry(
        &self,
        line: &str,
        line_start: usize,
        index: usize,
        spans: bool,
    ) -> Result<LensNode, LensError> {
        let mut entry = LensNode::new(&index.to_string(), None);
        let mut fields = Vec::new();
        let mut offset = 0;
        for field in line.split(' ') {
            if !field.is_empty() {
                fields.push((field, line_start + offset));
            }
            offset += field.len() + 1;
        }
        if fields.len() < 2 {
            return Err(LensError::at(
                "expected an address and a canonical name",
                line_start,
            ));
        }
        for (i, (field, start)) in fields.iter().enumerate() {
            let label = match i {
                0 => "ipaddr",
                1 => "canonical",
                _ => "alias",
            };
            let mut node = LensNode::new(label, Some(field));
            if spans {
                let range = (*start as u32, (*start + field.len()) as u32);
                node.span = Some(LensSpan {
                    label: (0, 0),
                    value: range,
                    node: range,
                });
            }
            entry.children.push(node);
        }
        if spans {
            let range =
                (line_start as u32, (line_start + line.len()) as u32);
            entry.span = Some(LensSpan {
                label: (0, 0),
                value: (0, 0),
                node: range,
            });
        }
        Ok(entry)
    }
}

impl Lens for HostsLens {
    fn name(&self) -> &str {
        "Hosts.lns"
    }

    fn info(&self) -> &str {
        "Hosts.lns (builtin hosts lens)"
    }

    fn get(
        &self,
        text: &str,
        spans: bool,
    ) -> Result<LensNode, LensError> {
        let mut root = LensNode::root();
        let mut index = 0;
        let mut offset = 0;
        for line in text.split('\n') {
            let line_start = offset;
            offset += line.len() + 1;
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                let mut node = LensNode::new("#comment", Some(comment));
                if spans {
                    let end = (line_start + line.len()) as u32;
                    node.span = Some(LensSpan {
                        label: (0, 0),
                        value: (line_start as u32 + 1, end),
                        node: (line_start as u32, end),
                    });
                }
                root.children.push(node);
                continue;
            }
            index += 1;
            root.children.push(self.parse_entry(
                line, line_start, index, spans,
            )?);
        }
        Ok(root)
    }

    fn put(
        &self,
        tree: &LensNode,
        _text: &str,
    ) -> Result<String, LensError> {
        let mut out = String::new();
        for entry in &tree.children {
            match entry.label.as_deref() {
                Some("#comment") => {
                    out.push('#');
                    out.push_str(entry.value.as_deref().unwrap_or(""));
                    out.push('\n');
                }
                Some(label) => {
                    let mut fields = Vec::new();
                    for field in &entry.children {
                        match &field.value {
                            Some(value) => fields.push(value.as_str()),
                            None => {
                                return Err(LensError {
                                    message: format!(
                                        "entry field {} has no value",
                                        field
                                            .label
                                            .as_deref()
                                            .unwrap_or("(none)")
                                    ),
                                    pos: None,
                                    path: Some(format!("/{}", label)),
                                    lens: Some(self.name().to_owned()),
                                });
                            }
                        }
                    }
                    if fields.len() < 2 {
                        return Err(LensError {
                            message: "entry needs an address and a \
                                      canonical name"
                                .to_owned(),
                            pos: None,
                            path: Some(format!("/{}", label)),
                            lens: Some(self.name().to_owned()),
                        });
                    }
                    out.push_str(&fields.join(" "));
                    out.push('\n');
                }
                None => {
                    return Err(LensError::new("entry without a label"));
                }
            }
        }
        Ok(out)
    }
}

/// The Hosts module, autoloaded for /etc/hosts.
pub fn hosts_module() -> Module {
    let mut module = Module::new("Hosts");
    module.insert_lens("lns", Arc::new(HostsLens));
    module.set_autoload(Autoload {
        lens: "Hosts.lns".to_owned(),
        incl: vec!["/etc/hosts".to_owned()],
        excl: Vec::new(),
    });
    module
}

/// A module holding a lens but no autoload registration.
pub fn util_module() -> Module {
    let mut module = Module::new("Util");
    module.insert_lens("lns", Arc::new(HostsLens));
    module
}

/// A scratch filesystem root holding etc/hosts.
pub fn test_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp root");
    let etc = dir.path().join("etc");
    std::fs::create_dir_all(&etc).expect("Failed to create etc");
    std::fs::write(etc.join("hosts"), HOSTS)
        .expect("Failed to write hosts fixture");
    dir
}

/// An engine over a fresh scratch root with the Hosts module
/// registered.
pub fn init_hosts(flags: Flags) -> (Heracles, tempfile::TempDir) {
    let dir = test_root();
    let root = dir.path().to_str().expect("non-utf8 temp dir");
    let hera = Heracles::init_with_modules(
        Some(root),
        None,
        flags | Flags::NO_STDINC,
        vec![hosts_module(), util_module()],
    )
    .expect("Failed to initialize engine");
    (hera, dir)
}

/// The on-disk hosts file of a scratch root.
pub fn hosts_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("etc").join("hosts")
}
