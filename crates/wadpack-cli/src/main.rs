//! wadpack - browse God of War game media and WAD resource containers
//!
//! Usage:
//!   wadpack --iso <image> --gowversion 2 list [filter]    - List files on the media
//!   wadpack --toc <dir> --gowversion 1 tree <wad>         - Print the node tree of a WAD
//!   wadpack --dir <dir> --gowversion 2 dump <wad> <tag>
//!   wadpack --psarc <archive> --ps ps3 --gowversion 3 check
//!
//! The binary registers no instance decoders or subfile extractors, so `show`
//! reports every node as undecodable and `subfile` fails until a front end
//! built on the library registers them.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use wadpack::config::{Config, GameVersion, MediaSource, Platform};
use wadpack::pack_utils::{
    dump_tag, extract_files, extract_subfile, list_files, open_pack, print_tree, run_check,
    show_node,
};
use wadpack::wad::dispatch::Registry;

#[derive(Parser)]
#[command(name = "wadpack")]
#[command(version = "0.1.0")]
#[command(about = "Browse God of War game media and WAD containers", long_about = None)]
struct Cli {
    #[command(flatten)]
    media: MediaArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MediaArgs {
    /// Directory with unpacked game files
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Disc image (ISO 9660) holding GODOFWAR.TOC
    #[arg(long, global = true)]
    iso: Option<PathBuf>,
    /// PS3 PSARC archive
    #[arg(long, global = true)]
    psarc: Option<PathBuf>,
    /// Directory holding GODOFWAR.TOC and its PART*.PAK files
    #[arg(long, global = true)]
    toc: Option<PathBuf>,
    /// Platform: ps2, ps3, ps4, psvita, pc
    #[arg(long = "ps", global = true, default_value = "ps2")]
    platform: Platform,
    /// Game version (required): 1, 2, 3, 4 (Ghost of Sparta), 5 (Chains of Olympus), 2018
    #[arg(long, global = true)]
    gowversion: Option<u32>,
}

impl MediaArgs {
    fn config(&self) -> Result<Config> {
        let source = match (&self.dir, &self.iso, &self.psarc, &self.toc) {
            (Some(p), None, None, None) => MediaSource::Directory(p.clone()),
            (None, Some(p), None, None) => MediaSource::Iso(p.clone()),
            (None, None, Some(p), None) => MediaSource::Psarc(p.clone()),
            (None, None, None, Some(p)) => MediaSource::Toc(p.clone()),
            _ => bail!("exactly one of --dir, --iso, --psarc or --toc is required"),
        };
        let Some(number) = self.gowversion else {
            bail!("--gowversion is required: 1-5 or 2018");
        };
        let version = GameVersion::from_number(number)
            .with_context(|| format!("Unknown game version {}", number))?;
        let config = Config::new(version, self.platform, source);
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List files on the media
    List {
        /// Filter pattern (e.g., *.wad, LEVELS/*)
        filter: Option<String>,
    },
    /// Extract files from the media
    Extract {
        /// Filter pattern
        filter: Option<String>,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Print the node tree of a WAD
    Tree {
        /// Path of the WAD on the media
        wad: String,
    },
    /// Dump the payload of a tag
    Dump {
        /// Path of the WAD on the media
        wad: String,
        /// Tag id
        tag: u32,
        /// Write the payload here instead of printing a hex dump
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a node as JSON (this binary registers no decoders, so no instance is shown)
    Show {
        /// Path of the WAD on the media
        wad: String,
        /// Tag id of the node
        tag: u32,
    },
    /// Extract a named subfile of a node (needs an extractor registered by a library front end)
    Subfile {
        /// Path of the WAD on the media
        wad: String,
        /// Tag id of the node
        tag: u32,
        /// Subfile name
        name: String,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Read every file and verify every WAD
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.media.config()?;
    let pack = open_pack(&config, Arc::new(Registry::new()))?;

    match cli.command {
        Commands::List { filter } => list_files(&pack, filter.as_deref())?,
        Commands::Extract { filter, output } => extract_files(&pack, filter.as_deref(), &output)?,
        Commands::Tree { wad } => print_tree(&pack, &wad)?,
        Commands::Dump { wad, tag, output } => dump_tag(&pack, &wad, tag, output.as_deref())?,
        Commands::Show { wad, tag } => show_node(&pack, &wad, tag)?,
        Commands::Subfile {
            wad,
            tag,
            name,
            output,
        } => extract_subfile(&pack, &wad, tag, &name, &output)?,
        Commands::Check { json } => run_check(&pack, json)?,
    }

    Ok(())
}
