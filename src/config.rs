//! Explicit configuration passed into media and WAD construction
//!
//! Game version and platform are plain values carried by whoever opens the
//! media, so packs of different releases can be open side by side.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vfs::dir::DirectoryDriver;
use crate::vfs::handle::ArchiveHandle;
use crate::vfs::iso::IsoDriver;
use crate::vfs::psarc::PsarcDriver;
use crate::vfs::toc::TableOfContents;
use crate::vfs::Directory;
use crate::wad::dispatch::Registry;
use crate::wad::WadOptions;

/// Game release the resources belong to
///
/// Tag type numbers are only meaningful together with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GameVersion {
    #[default]
    Unknown,
    Gow1,
    Gow2,
    Gow3,
    GhostOfSparta,
    ChainsOfOlympus,
    Gow2018,
}

impl GameVersion {
    /// Parse the numeric form used on the command line (0-5, 2018)
    pub fn from_number(n: u32) -> Option<Self> {
        Some(match n {
            0 => GameVersion::Unknown,
            1 => GameVersion::Gow1,
            2 => GameVersion::Gow2,
            3 => GameVersion::Gow3,
            4 => GameVersion::GhostOfSparta,
            5 => GameVersion::ChainsOfOlympus,
            2018 => GameVersion::Gow2018,
            _ => return None,
        })
    }
}

/// Console the dump was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Platform {
    #[default]
    Ps2,
    Ps3,
    Ps4,
    PsVita,
    Pc,
}

impl Platform {
    /// PS3 data is stored big-endian, everything else little-endian
    pub fn is_big_endian(self) -> bool {
        matches!(self, Platform::Ps3)
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ps2" => Ok(Platform::Ps2),
            "ps3" => Ok(Platform::Ps3),
            "ps4" => Ok(Platform::Ps4),
            "psvita" => Ok(Platform::PsVita),
            "pc" => Ok(Platform::Pc),
            other => Err(Error::Format(format!(
                "unknown platform '{}' (use ps2, ps3, ps4, psvita or pc)",
                other
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Ps2 => "ps2",
            Platform::Ps3 => "ps3",
            Platform::Ps4 => "ps4",
            Platform::PsVita => "psvita",
            Platform::Pc => "pc",
        };
        f.write_str(s)
    }
}

/// Where the game files come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSource {
    /// Unpacked files on the host filesystem
    Directory(PathBuf),
    /// Disc image; the game directory is the TOC inside it
    Iso(PathBuf),
    /// PS3 PSARC archive
    Psarc(PathBuf),
    /// Host directory holding `GODOFWAR.TOC` and its pack files
    Toc(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub game_version: GameVersion,
    pub platform: Platform,
    pub source: MediaSource,
}

impl Config {
    pub fn new(game_version: GameVersion, platform: Platform, source: MediaSource) -> Self {
        Config {
            game_version,
            platform,
            source,
        }
    }

    /// Reject combinations the media drivers cannot serve
    ///
    /// `Unknown` is refused for every source: no release is detected from the
    /// media, and WAD parsing needs a concrete tag table.
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            MediaSource::Psarc(_)
                if !matches!(self.platform, Platform::Ps3 | Platform::PsVita) =>
            {
                Err(Error::Format(
                    "PSARC is only supported for PS3/PSVita".to_string(),
                ))
            }
            _ if self.game_version == GameVersion::Unknown => Err(Error::Format(
                "an explicit game version is required; tag numbers differ per release".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Open the configured media and build the driver chain
    pub fn open(&self) -> Result<Media> {
        self.validate()?;

        let media = match &self.source {
            MediaSource::Directory(path) => Media {
                root: Arc::new(DirectoryDriver::new(path)?),
                driver: None,
                handle: None,
            },
            MediaSource::Toc(path) => {
                let dir: Arc<dyn Directory> = Arc::new(DirectoryDriver::new(path)?);
                Media {
                    root: Arc::new(TableOfContents::new(dir)?),
                    driver: None,
                    handle: None,
                }
            }
            MediaSource::Iso(path) => {
                let handle = Arc::new(ArchiveHandle::new(File::open(path)?)?);
                let iso: Arc<dyn Directory> = Arc::new(IsoDriver::new(handle.clone())?);
                Media {
                    root: Arc::new(TableOfContents::new(iso.clone())?),
                    driver: Some(iso),
                    handle: Some(handle),
                }
            }
            MediaSource::Psarc(path) => {
                let handle = Arc::new(ArchiveHandle::new(File::open(path)?)?);
                Media {
                    root: Arc::new(PsarcDriver::new(handle.clone())?),
                    driver: None,
                    handle: Some(handle),
                }
            }
        };

        debug!("Opened {:?} for {:?}/{}", self.source, self.game_version, self.platform);
        Ok(media)
    }

    pub fn wad_options(&self, registry: Arc<Registry>) -> WadOptions {
        WadOptions {
            version: self.game_version,
            platform: self.platform,
            registry,
        }
    }
}

/// Opened media: the game directory plus the handle keeping it readable
pub struct Media {
    /// Directory the game files are resolved against
    pub root: Arc<dyn Directory>,
    /// Raw image contents underneath the TOC, when there is one
    pub driver: Option<Arc<dyn Directory>>,
    handle: Option<Arc<ArchiveHandle>>,
}

impl Media {
    /// Close the archive handle; outstanding files fail with [`Error::Closed`]
    pub fn close(&self) {
        if let Some(handle) = &self.handle {
            handle.close();
        }
    }
}
