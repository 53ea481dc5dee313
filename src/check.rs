//! Parse check: read every file of the media and verify every WAD

use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::pack::is_wad;
use crate::vfs::{resolve_file, Directory};
use crate::wad::{NodeFailure, Wad, WadOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WadFailures {
    pub path: String,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    /// Files read, WADs included
    pub files: usize,
    pub wads: usize,
    /// Directories that could not be listed or opened
    pub directory_errors: Vec<FileFailure>,
    /// Files that could not be read or parsed
    pub failed_files: Vec<FileFailure>,
    pub nodes: usize,
    pub decoded_nodes: usize,
    /// Nodes whose tag type has no decoder
    pub unsupported_nodes: usize,
    /// Tags the release's tag table does not know
    pub unsupported_tags: usize,
    pub decode_failures: Vec<WadFailures>,
    pub elapsed_ms: u64,
}

impl CheckReport {
    /// Share of files that were read (and parsed, for WADs) without error
    pub fn success_rate(&self) -> f64 {
        if self.files == 0 {
            return 1.0;
        }
        (self.files - self.failed_files.len()) as f64 / self.files as f64
    }

    pub fn decode_failure_count(&self) -> usize {
        self.decode_failures.iter().map(|w| w.failures.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.directory_errors.is_empty()
            && self.failed_files.is_empty()
            && self.decode_failures.is_empty()
    }
}

enum FileOutcome {
    Read,
    Wad(crate::wad::VerifyReport),
    Failed(String),
}

/// Check every file under `root`
pub fn parse_check(root: &dyn Directory, options: &WadOptions) -> CheckReport {
    parse_check_with(root, options, &|_: &str| {})
}

/// [`parse_check`] reporting each finished file to `progress`
pub fn parse_check_with(
    root: &dyn Directory,
    options: &WadOptions,
    progress: &(dyn Fn(&str) + Sync),
) -> CheckReport {
    let start = Instant::now();
    let mut report = CheckReport::default();

    let mut paths = Vec::new();
    collect(root, "", &mut paths, &mut report.directory_errors);

    let outcomes: Vec<(String, FileOutcome)> = paths
        .into_par_iter()
        .map(|path| {
            let outcome = check_file(root, &path, options);
            progress(&path);
            (path, outcome)
        })
        .collect();

    for (path, outcome) in outcomes {
        report.files += 1;
        match outcome {
            FileOutcome::Read => {}
            FileOutcome::Wad(verify) => {
                report.wads += 1;
                report.nodes += verify.nodes;
                report.decoded_nodes += verify.decoded;
                report.unsupported_nodes += verify.unsupported;
                report.unsupported_tags += verify.unsupported_tags;
                if !verify.failures.is_empty() {
                    report.decode_failures.push(WadFailures {
                        path,
                        failures: verify.failures,
                    });
                }
            }
            FileOutcome::Failed(error) => report.failed_files.push(FileFailure { path, error }),
        }
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        "Checked {} files ({} WADs) in {} ms: {} failed, {} decode failures, {:.1}% ok",
        report.files,
        report.wads,
        report.elapsed_ms,
        report.failed_files.len(),
        report.decode_failure_count(),
        report.success_rate() * 100.0
    );
    report
}

fn check_file(root: &dyn Directory, path: &str, options: &WadOptions) -> FileOutcome {
    read_and_verify(root, path, options).unwrap_or_else(|e| {
        warn!("{}: {}", path, e);
        FileOutcome::Failed(e.to_string())
    })
}

fn read_and_verify(root: &dyn Directory, path: &str, options: &WadOptions) -> Result<FileOutcome> {
    let file = resolve_file(root, path)?;
    let data = file.data()?;
    if !is_wad(path) {
        return Ok(FileOutcome::Read);
    }
    let wad = Wad::parse(file.name(), &data, options)?;
    Ok(FileOutcome::Wad(wad.verify()))
}

fn collect(dir: &dyn Directory, prefix: &str, out: &mut Vec<String>, errors: &mut Vec<FileFailure>) {
    let shown = if prefix.is_empty() { "/" } else { prefix };
    let entries = match dir.list() {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list {}: {}", shown, e);
            errors.push(FileFailure {
                path: shown.to_string(),
                error: e.to_string(),
            });
            return;
        }
    };
    for entry in entries {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        if entry.is_dir {
            match dir.get_directory(&entry.name) {
                Ok(sub) => {
                    collect(sub.as_ref(), &path, out, errors);
                }
                Err(e) => {
                    warn!("Cannot open {}: {}", path, e);
                    errors.push(FileFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        } else {
            out.push(path);
        }
    }
}
