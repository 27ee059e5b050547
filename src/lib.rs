//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! A bidirectional configuration-file manager.
//!
//! The engine exposes a single in-memory tree of labelled key/value
//! nodes that mirrors the contents of a set of configuration files on
//! disk. Applications read and mutate the tree through a path-expression
//! API; the engine keeps tree and files consistent in both directions by
//! applying *lenses*, bidirectional transformations that parse a file
//! into a subtree and serialise a (possibly mutated) subtree back into
//! the original file's surface syntax, preserving untouched formatting.
//!
//! ## Design Goals
//! * Surface engine state (per-file metadata, transform registrations,
//!   errors) through the same tree and path API used for data
//! * Touch files on disk only through atomic replacement, so on-disk
//!   state is all-or-nothing per file
//! * Keep the lens language out of the core: lenses are plugged in
//!   through the narrow [`lens::Lens`] contract
//!
//! ## Example
//!
//! ```no_run
//! use heracles::{Flags, Heracles};
//!
//! let mut hera = Heracles::init(None, None, Flags::NO_LOAD)
//!     .expect("Failed to initialize engine");
//! hera.set("/files/etc/hosts/1/ipaddr", Some("127.0.0.1"))
//!     .expect("Failed to set value");
//! let (_, value) = hera.get("/files/etc/hosts/1/ipaddr")
//!     .expect("Failed to get value");
//! assert_eq!(value.as_deref(), Some("127.0.0.1"));
//! ```

mod error;
mod iter;
mod pathx;
mod transform;
mod tree;

pub mod heracles;
pub mod lens;

pub use crate::error::{Error, ErrorCode, Result};
pub use crate::heracles::{Flags, Heracles, SpanInfo};
