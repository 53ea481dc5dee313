//! Browsing surface over the game's root directory

use std::sync::Arc;

use tracing::debug;

use crate::cache::SingleFlight;
use crate::error::{Error, Result};
use crate::vfs::{resolve_file, walk_files, Directory, File};
use crate::wad::{Wad, WadOptions};

/// What a pack file opens as
#[derive(Clone)]
pub enum PackInstance {
    Wad(Arc<Wad>),
    Raw(Arc<dyn File>),
}

impl std::fmt::Debug for PackInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackInstance::Wad(wad) => f.debug_tuple("Wad").field(wad).finish(),
            PackInstance::Raw(file) => f.debug_tuple("Raw").field(&file.name()).finish(),
        }
    }
}

pub fn is_wad(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".wad")
}

pub struct Pack {
    root: Arc<dyn Directory>,
    options: WadOptions,
    wads: SingleFlight<String, std::result::Result<Arc<Wad>, Arc<Error>>>,
}

impl Pack {
    pub fn new(root: Arc<dyn Directory>, options: WadOptions) -> Self {
        Pack {
            root,
            options,
            wads: SingleFlight::new(),
        }
    }

    pub fn root(&self) -> &Arc<dyn Directory> {
        &self.root
    }

    pub fn options(&self) -> &WadOptions {
        &self.options
    }

    /// Every file path in the pack, sorted
    pub fn file_names(&self) -> Result<Vec<String>> {
        let mut names = walk_files(self.root.as_ref())?;
        names.sort();
        Ok(names)
    }

    /// Resolve a `/`-separated path
    pub fn file(&self, path: &str) -> Result<Arc<dyn File>> {
        resolve_file(self.root.as_ref(), path)
    }

    /// Open a file: WADs are parsed once and shared, anything else is raw
    pub fn instance(&self, path: &str) -> Result<PackInstance> {
        let file = self.file(path)?;
        if !is_wad(path) {
            return Ok(PackInstance::Raw(file));
        }

        let key = path.trim_matches('/').to_ascii_lowercase();
        if let Some(cached) = self.wads.get(&key) {
            return cached.map(PackInstance::Wad).map_err(|e| e.duplicate());
        }

        // read errors are not cached, parse outcomes are
        let data = file.data()?;
        let wad = self
            .wads
            .get_or_init(&key, || {
                let wad = Wad::parse(file.name(), &data, &self.options)?;
                debug!("Loaded {} ({} bytes)", path, data.len());
                Ok(Arc::new(wad))
            })
            .map_err(|e| e.duplicate())?;
        Ok(PackInstance::Wad(wad))
    }

    /// Parsed WAD at `path`
    pub fn wad(&self, path: &str) -> Result<Arc<Wad>> {
        match self.instance(path)? {
            PackInstance::Wad(wad) => Ok(wad),
            PackInstance::Raw(_) => Err(Error::Format(format!("{} is not a WAD", path))),
        }
    }
}
