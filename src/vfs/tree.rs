//! In-memory directory tree shared by the image and archive drivers

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{Directory, Entry, File};
use crate::error::{Error, Result};

enum Child {
    Dir(usize),
    File(Arc<dyn File>),
}

#[derive(Default)]
struct PendingDir {
    children: Vec<(String, Child)>,
    index: HashMap<String, usize>,
}

/// Mutable builder; directory 0 is the root
pub(crate) struct TreeBuilder {
    dirs: Vec<PendingDir>,
}

impl TreeBuilder {
    pub(crate) const ROOT: usize = 0;

    pub(crate) fn new() -> Self {
        TreeBuilder {
            dirs: vec![PendingDir::default()],
        }
    }

    /// Directory `name` under `parent`, created if missing
    ///
    /// `None` when a file already holds the name; the file keeps it.
    pub(crate) fn add_dir(&mut self, parent: usize, name: &str) -> Option<usize> {
        let key = name.to_ascii_lowercase();
        if let Some(&pos) = self.dirs[parent].index.get(&key) {
            return match self.dirs[parent].children[pos].1 {
                Child::Dir(id) => Some(id),
                Child::File(_) => {
                    warn!("Directory {} clashes with a file of the same name", name);
                    None
                }
            };
        }
        let id = self.dirs.len();
        self.dirs.push(PendingDir::default());
        let pending = &mut self.dirs[parent];
        pending.index.insert(key, pending.children.len());
        pending.children.push((name.to_string(), Child::Dir(id)));
        Some(id)
    }

    /// Add a file; a second file with the same name is ignored
    pub(crate) fn add_file(&mut self, parent: usize, name: &str, file: Arc<dyn File>) -> bool {
        let key = name.to_ascii_lowercase();
        let pending = &mut self.dirs[parent];
        if pending.index.contains_key(&key) {
            return false;
        }
        pending.index.insert(key, pending.children.len());
        pending.children.push((name.to_string(), Child::File(file)));
        true
    }

    /// Add a file at a `/`-separated path, creating intermediate directories
    ///
    /// Paths with `.` or `..` components are refused.
    pub(crate) fn insert_path(&mut self, path: &str, file: Arc<dyn File>) -> bool {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.iter().any(|p| *p == "." || *p == "..") {
            warn!("Skipping {}: relative path components", path);
            return false;
        }
        let Some(name) = parts.pop() else {
            return false;
        };
        let mut dir = Self::ROOT;
        for part in parts {
            match self.add_dir(dir, part) {
                Some(id) => dir = id,
                None => return false,
            }
        }
        self.add_file(dir, name, file)
    }

    pub(crate) fn build(self) -> Arc<TreeDirectory> {
        let mut slots: Vec<Option<PendingDir>> = self.dirs.into_iter().map(Some).collect();
        Self::freeze(&mut slots, Self::ROOT)
    }

    fn freeze(slots: &mut [Option<PendingDir>], id: usize) -> Arc<TreeDirectory> {
        let pending = slots[id].take().unwrap_or_default();
        let entries = pending
            .children
            .into_iter()
            .map(|(name, child)| {
                let node = match child {
                    Child::Dir(sub) => TreeNode::Dir(Self::freeze(slots, sub)),
                    Child::File(f) => TreeNode::File(f),
                };
                (name, node)
            })
            .collect();
        Arc::new(TreeDirectory {
            entries,
            index: pending.index,
        })
    }
}

enum TreeNode {
    Dir(Arc<TreeDirectory>),
    File(Arc<dyn File>),
}

/// Frozen directory; lookups go through a lower-cased name index
pub struct TreeDirectory {
    entries: Vec<(String, TreeNode)>,
    index: HashMap<String, usize>,
}

impl TreeDirectory {
    fn find(&self, name: &str) -> Result<&TreeNode> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.entries[i].1)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

impl Directory for TreeDirectory {
    fn list(&self) -> Result<Vec<Entry>> {
        Ok(self
            .entries
            .iter()
            .map(|(name, node)| match node {
                TreeNode::Dir(_) => Entry::dir(name.clone()),
                TreeNode::File(_) => Entry::file(name.clone()),
            })
            .collect())
    }

    fn get_directory(&self, name: &str) -> Result<Arc<dyn Directory>> {
        match self.find(name)? {
            TreeNode::Dir(d) => Ok(d.clone()),
            TreeNode::File(_) => Err(Error::NotADirectory(name.to_string())),
        }
    }

    fn get_file(&self, name: &str) -> Result<Arc<dyn File>> {
        match self.find(name)? {
            TreeNode::File(f) => Ok(f.clone()),
            TreeNode::Dir(_) => Err(Error::NotFound(format!("{} is a directory", name))),
        }
    }
}
