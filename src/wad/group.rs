//! Group nesting while a tag stream is parsed
//!
//! A group-start tag does not create a node. It arms the machine; the next
//! node-producing tag is attached under the current scope and then becomes
//! the new scope. A group-end seen while still armed closes an empty group
//! without touching the scope stack.
//!
//! ```text
//!            group-start
//!    Idle ----------------> Armed
//!     ^                       |
//!     |   node (push scope)   |
//!     +-----------------------+
//!     |   group-end (empty)   |
//!     +-----------------------+
//! ```

use super::NodeId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Armed,
}

/// Current parent scope plus the pending-group flag
#[derive(Debug)]
pub struct Scope {
    state: GroupState,
    stack: Vec<NodeId>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Scope {
            state: GroupState::Idle,
            stack: vec![NodeId::ROOT],
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Node that new nodes are attached under
    pub fn current(&self) -> NodeId {
        self.stack.last().copied().unwrap_or(NodeId::INVALID)
    }

    /// Number of open groups
    pub fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// Group start. Arming twice in a row is the same as arming once.
    pub fn arm(&mut self) {
        self.state = GroupState::Armed;
    }

    /// A tag produced node `id`; returns the parent it attaches to
    pub fn node_produced(&mut self, id: NodeId) -> NodeId {
        let parent = self.current();
        if self.state == GroupState::Armed {
            self.stack.push(id);
            self.state = GroupState::Idle;
        }
        parent
    }

    /// Group end
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            GroupState::Armed => {
                self.state = GroupState::Idle;
                Ok(())
            }
            GroupState::Idle if self.stack.len() > 1 => {
                self.stack.pop();
                Ok(())
            }
            GroupState::Idle => Err(Error::corrupt("group end without matching start")),
        }
    }

    /// End of stream: must be idle at the root
    pub fn finish(&self) -> Result<()> {
        match (self.state, self.depth()) {
            (GroupState::Idle, 0) => Ok(()),
            (GroupState::Armed, _) => Err(Error::corrupt("stream ended with a group start pending")),
            (_, depth) => Err(Error::Corrupt(format!(
                "stream ended with {} unclosed group(s)",
                depth
            ))),
        }
    }
}
