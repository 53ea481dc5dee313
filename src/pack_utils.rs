//! Pack utility functions
//!
//! This module backs the command-line front end: listing and extracting
//! media files, printing a WAD's node tree, dumping tag payloads, showing a
//! node as JSON and running the parse check.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::check::parse_check_with;
use crate::config::Config;
use crate::pack::Pack;
use crate::utils::{create_glob_matcher, format_size, hex_dump, matches_filter};
use crate::wad::dispatch::{self, Registry};
use crate::wad::{NodeId, TagId, Wad};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// Open the configured media as a pack
pub fn open_pack(config: &Config, registry: Arc<Registry>) -> Result<Pack> {
    let media = config
        .open()
        .with_context(|| format!("Failed to open {:?}", config.source))?;
    Ok(Pack::new(media.root.clone(), config.wad_options(registry)))
}

/// List files on the media with optional filtering
pub fn list_files(pack: &Pack, filter: Option<&str>) -> Result<()> {
    let matcher = filter.map(create_glob_matcher).transpose()?;

    let mut count = 0u64;
    let mut total_size = 0u64;

    for name in pack.file_names()? {
        if !matches_filter(&name, matcher.as_ref()) {
            continue;
        }
        match pack.file(&name) {
            Ok(file) => {
                println!("{:>10} {}", format_size(file.size()), name);
                count += 1;
                total_size += file.size();
            }
            Err(e) => println!("{:>10} {} ({})", "?", name, e),
        }
    }

    println!();
    println!("Total: {} files, {}", count, format_size(total_size));
    Ok(())
}

/// Extract files with optional filtering
pub fn extract_files(pack: &Pack, filter: Option<&str>, output: &Path) -> Result<()> {
    let matcher = filter.map(create_glob_matcher).transpose()?;
    let names: Vec<String> = pack
        .file_names()?
        .into_iter()
        .filter(|n| matches_filter(n, matcher.as_ref()))
        .collect();

    if names.is_empty() {
        println!("No files match the filter");
        return Ok(());
    }

    println!("Extracting {} files...", names.len());

    let pb = ProgressBar::new(names.len() as u64);
    pb.set_style(ProgressStyle::with_template(PROGRESS_TEMPLATE)?);

    let mut extracted = 0u64;
    let mut failed = 0u64;

    for name in &names {
        pb.set_message(name.clone());
        match extract_single_file(pack, name, output) {
            Ok(_) => extracted += 1,
            Err(e) => {
                pb.println(format!("Error extracting {}: {:#}", name, e));
                failed += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("Done");

    println!();
    println!("Extracted: {} files", extracted);
    if failed > 0 {
        println!("Failed: {} files", failed);
    }
    Ok(())
}

fn extract_single_file(pack: &Pack, name: &str, output: &Path) -> Result<()> {
    let output_path = output_path(output, name)?;
    let data = pack.file(name)?.data()?;
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&output_path, &data)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    Ok(())
}

/// `output/name`, refusing names that would leave `output`
fn output_path(output: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("Refusing to extract {}: path leaves the output directory", name);
    }
    Ok(output.join(relative))
}

fn load_wad(pack: &Pack, path: &str) -> Result<Arc<Wad>> {
    pack.wad(path)
        .with_context(|| format!("Failed to load {}", path))
}

/// Print the node tree of a WAD
pub fn print_tree(pack: &Pack, path: &str) -> Result<()> {
    let wad = load_wad(pack, path)?;
    println!("{} ({:?})", wad.name(), wad.version());
    print_children(&wad, NodeId::ROOT, 1)?;

    let unsupported = wad.unsupported_tags();
    if !unsupported.is_empty() {
        println!();
        println!("Unsupported tags: {}", unsupported.len());
        for id in unsupported {
            let tag = wad.tag(*id)?;
            println!(
                "  {:>6} type {:#06x} {:>10} '{}'",
                tag.id,
                tag.tag_type,
                format_size(tag.data.len() as u64),
                tag.name
            );
        }
    }
    Ok(())
}

fn print_children(wad: &Wad, id: NodeId, depth: usize) -> Result<()> {
    for child in &wad.node(id)?.children {
        let resource = wad.node_resource(TagId(child.0))?;
        let kind = dispatch::tag_kind(resource.tag.tag_type, wad.version())
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| format!("{:#06x}", resource.tag.tag_type));
        println!(
            "{}{:>6} {:<14} {:>10} '{}'",
            "  ".repeat(depth),
            child,
            kind,
            format_size(resource.data().len() as u64),
            resource.name()
        );
        print_children(wad, *child, depth + 1)?;
    }
    Ok(())
}

/// Dump a tag payload as hex, or write it to `output`
pub fn dump_tag(pack: &Pack, path: &str, tag: u32, output: Option<&Path>) -> Result<()> {
    let wad = load_wad(pack, path)?;
    let tag = wad.tag(TagId(tag))?;
    match output {
        Some(out) => {
            fs::write(out, &tag.data)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Wrote {} to {}", format_size(tag.data.len() as u64), out.display());
        }
        None => {
            println!(
                "Tag {} type {:#06x} '{}' at {:#x}, {} bytes",
                tag.id,
                tag.tag_type,
                tag.name,
                tag.debug_offset,
                tag.data.len()
            );
            print!("{}", hex_dump(&tag.data, 0));
        }
    }
    Ok(())
}

/// Print a node as JSON, with its decoded instance when one is available
pub fn show_node(pack: &Pack, path: &str, tag: u32) -> Result<()> {
    let wad = load_wad(pack, path)?;
    let resource = wad.node_resource(TagId(tag))?;

    let instance = match wad.instance_from_tag(TagId(tag)) {
        Ok((instance, server_id)) => json!({
            "server_id": server_id,
            "data": instance.marshal(&resource)?,
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    let subfiles = pack
        .options()
        .registry
        .subfile_names(resource.tag.tag_type, wad.version());

    let value = json!({
        "node": resource.marshal(),
        "parents": resource.parents(),
        "subfiles": subfiles,
        "instance": instance,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Write a named subfile of a node to `output`
pub fn extract_subfile(pack: &Pack, path: &str, tag: u32, name: &str, output: &Path) -> Result<()> {
    let wad = load_wad(pack, path)?;
    let data = wad.extract_subfile(TagId(tag), name)?;
    fs::write(output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {} to {}", format_size(data.len() as u64), output.display());
    Ok(())
}

/// Read every file and verify every WAD
pub fn run_check(pack: &Pack, as_json: bool) -> Result<()> {
    let total = pack.file_names()?.len();
    let pb = ProgressBar::new(total as u64);
    pb.set_style(ProgressStyle::with_template(PROGRESS_TEMPLATE)?);

    let report = parse_check_with(pack.root().as_ref(), pack.options(), &|_: &str| pb.inc(1));
    pb.finish_and_clear();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Files: {} ({} WADs)", report.files, report.wads);
        println!(
            "Nodes: {} ({} decoded, {} without decoder)",
            report.nodes, report.decoded_nodes, report.unsupported_nodes
        );
        println!("Unknown tags: {}", report.unsupported_tags);
        for failure in &report.directory_errors {
            println!("  dir  {}: {}", failure.path, failure.error);
        }
        for failure in &report.failed_files {
            println!("  file {}: {}", failure.path, failure.error);
        }
        for wad in &report.decode_failures {
            for failure in &wad.failures {
                println!("  node {}#{}: {}", wad.path, failure.node, failure.error);
            }
        }
        println!(
            "Success rate: {:.1}% in {} ms",
            report.success_rate() * 100.0,
            report.elapsed_ms
        );
    }

    if !report.is_clean() {
        bail!(
            "parse check failed: {} files, {} nodes",
            report.failed_files.len(),
            report.decode_failure_count()
        );
    }
    Ok(())
}
