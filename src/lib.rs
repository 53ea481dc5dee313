//! # wadpack
//!
//! A Rust library for inspecting God of War resource packages.
//!
//! ## Overview
//!
//! Game files live on one of several media: an unpacked directory, a disc
//! image, a PS3 PSARC archive, or pack spans indexed by `GODOFWAR.TOC`. The
//! [`vfs`] module puts all of them behind one `Directory`/`File` contract.
//! Resource containers (`.WAD`) are flat tag streams; [`wad`] parses them into
//! a node tree and decodes nodes on demand through an explicit registry of
//! per-release decoders.
//!
//! - Media drivers: plain directory, ISO 9660, PSARC (zlib), GODOFWAR.TOC
//! - Tag-stream parser with version-keyed dispatch and group nesting
//! - Single-flight instance cache shared by concurrent callers
//! - Parse check over a whole medium
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wadpack::config::{Config, GameVersion, MediaSource, Platform};
//! use wadpack::wad::dispatch::Registry;
//! use wadpack::Pack;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::new(
//!         GameVersion::Gow2,
//!         Platform::Ps2,
//!         MediaSource::Iso("GOW2.iso".into()),
//!     );
//!     let media = config.open()?;
//!     let pack = Pack::new(media.root.clone(), config.wad_options(Arc::new(Registry::new())));
//!
//!     for name in pack.file_names()? {
//!         println!("{}", name);
//!     }
//!
//!     let wad = pack.wad("R_PERM.WAD")?;
//!     println!("{} nodes", wad.nodes().count());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod error;
pub mod pack;
pub mod pack_utils;
pub mod utils;
pub mod vfs;
pub mod wad;

pub use check::{parse_check, CheckReport};
pub use config::{Config, GameVersion, MediaSource, Platform};
pub use error::{Error, ErrorKind, Result};
pub use pack::{Pack, PackInstance};
pub use utils::{create_glob_matcher, format_size, matches_filter};
pub use vfs::{Directory, Entry, File};
pub use wad::{Node, NodeId, NodeResource, Tag, TagId, Wad, WadOptions};
