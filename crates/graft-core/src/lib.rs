//! graft-core - Forge core library
//!
//! This library provides the pieces of the graft forge that sit between the
//! network-facing daemon and the content-addressed object store: the binary
//! wire codec, the object-daemon client, and the recursive tree-mutation
//! engine, plus the shared domain model and configuration types.
//!
//! # Modules
//!
//! - [`wire`]: variable-length integer and byte-string codec used on the
//!   object-daemon socket
//! - [`objd`]: client for the out-of-process object daemon (one connection
//!   per concurrent logical caller) and the tree-mutation engine built on it
//! - [`models`]: user kinds and repository contribution policies
//! - [`config`]: `graft.toml` configuration loading

pub mod config;
pub mod models;
pub mod objd;
pub mod wire;
