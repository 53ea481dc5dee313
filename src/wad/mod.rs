//! WAD resource containers
//!
//! A WAD is a flat stream of tag records. One forward pass turns it into a
//! tree of nodes: the tags that produce nodes hang under the current group
//! scope, and group tags move that scope (see [`group`]). After the pass the
//! tag and node maps are read-only; decoded instances are built on demand
//! and memoized per node.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wadpack::config::{GameVersion, Platform};
//! use wadpack::wad::{Wad, WadOptions};
//!
//! let bytes = std::fs::read("R_PERM.WAD")?;
//! let options = WadOptions::new(GameVersion::Gow2, Platform::Ps2);
//! let wad = Wad::parse("R_PERM.WAD", &bytes, &options)?;
//! for node in wad.nodes() {
//!     println!("{} -> {}", node.id, node.parent);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod dispatch;
pub mod group;
pub mod tag;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::SingleFlight;
use crate::config::{GameVersion, Platform};
use crate::error::{Error, Result};
use dispatch::{Instance, Registry, ScopeEffect, TagKind};
use group::Scope;
use tag::TagReader;
pub use tag::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The synthetic root of every WAD
    pub const ROOT: NodeId = NodeId(0xFFFF_FFFE);
    /// Parent of the root
    pub const INVALID: NodeId = NodeId(0xFFFF_FFFF);
}

impl From<TagId> for NodeId {
    fn from(id: TagId) -> Self {
        NodeId(id.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::ROOT => f.pad("root"),
            NodeId::INVALID => f.pad("invalid"),
            NodeId(id) => fmt::Display::fmt(&id, f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub tag: Option<TagId>,
    pub parent: NodeId,
    pub children: Vec<NodeId>,
}

/// Everything WAD parsing depends on
#[derive(Debug, Clone)]
pub struct WadOptions {
    pub version: GameVersion,
    pub platform: Platform,
    pub registry: Arc<Registry>,
}

impl WadOptions {
    /// Options with an empty decoder registry
    pub fn new(version: GameVersion, platform: Platform) -> Self {
        WadOptions {
            version,
            platform,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }
}

type InstanceResult = std::result::Result<Arc<dyn Instance>, Arc<Error>>;

pub struct Wad {
    name: String,
    options: WadOptions,
    tags: HashMap<TagId, Tag>,
    tag_order: Vec<TagId>,
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    names: HashMap<String, NodeId>,
    unsupported: Vec<TagId>,
    instances: SingleFlight<NodeId, InstanceResult>,
}

impl Wad {
    /// Parse a tag stream into its node tree
    pub fn parse(name: &str, data: &[u8], options: &WadOptions) -> Result<Wad> {
        if dispatch::tag_table(options.version).is_none() {
            return Err(Error::UnsupportedGame(options.version));
        }
        let wad = if options.platform.is_big_endian() {
            Self::parse_with::<BigEndian>(name, data, options)
        } else {
            Self::parse_with::<LittleEndian>(name, data, options)
        }?;
        debug!(
            "Parsed {}: {} tags, {} nodes, {} unsupported",
            name,
            wad.tags.len(),
            wad.nodes.len() - 1,
            wad.unsupported.len()
        );
        Ok(wad)
    }

    fn parse_with<B: ByteOrder>(name: &str, data: &[u8], options: &WadOptions) -> Result<Wad> {
        let mut wad = Wad {
            name: name.to_string(),
            options: options.clone(),
            tags: HashMap::new(),
            tag_order: Vec::new(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            names: HashMap::new(),
            unsupported: Vec::new(),
            instances: SingleFlight::new(),
        };
        wad.nodes.insert(
            NodeId::ROOT,
            Node {
                id: NodeId::ROOT,
                tag: None,
                parent: NodeId::INVALID,
                children: Vec::new(),
            },
        );

        let mut reader = TagReader::<B>::new(data);
        let mut scope = Scope::new();
        let mut last_id: Option<TagId> = None;

        while let Some(tag) = reader.next_tag()? {
            if NodeId::from(tag.id) >= NodeId::ROOT {
                return Err(Error::Corrupt(format!(
                    "{}: tag id {:#x} at {:#x} is reserved",
                    name, tag.id.0, tag.debug_offset
                )));
            }
            if let Some(prev) = last_id {
                if tag.id <= prev {
                    return Err(Error::Corrupt(format!(
                        "{}: tag id {} at {:#x} does not follow {}",
                        name, tag.id, tag.debug_offset, prev
                    )));
                }
            }
            last_id = Some(tag.id);

            match dispatch::behavior(tag.tag_type, options.version) {
                Some(behavior) => {
                    match behavior.scope {
                        ScopeEffect::Open => scope.arm(),
                        ScopeEffect::Close => scope.close().map_err(|e| {
                            Error::Corrupt(format!(
                                "{}: tag {} '{}' at {:#x}: {}",
                                name, tag.id, tag.name, tag.debug_offset, e
                            ))
                        })?,
                        ScopeEffect::None => {}
                    }
                    if behavior.produces_node {
                        let parent = scope.node_produced(NodeId::from(tag.id));
                        wad.add_node(&tag, parent, behavior.kind)?;
                    }
                }
                None => wad.unsupported.push(tag.id),
            }

            wad.tag_order.push(tag.id);
            wad.tags.insert(tag.id, tag);
        }

        scope
            .finish()
            .map_err(|e| Error::Corrupt(format!("{}: {}", name, e)))?;
        Ok(wad)
    }

    fn add_node(&mut self, tag: &Tag, parent: NodeId, kind: TagKind) -> Result<()> {
        let id = NodeId::from(tag.id);
        self.nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::Corrupt(format!("tag {}: parent {} missing", tag.id, parent)))?
            .children
            .push(id);
        self.nodes.insert(
            id,
            Node {
                id,
                tag: Some(tag.id),
                parent,
                children: Vec::new(),
            },
        );
        self.node_order.push(id);

        if kind == TagKind::ServerInstance && tag.is_named() {
            // a later instance with the same name replaces the earlier one
            if let Some(prev) = self.names.insert(tag.name.clone(), id) {
                debug!("{}: '{}' node {} replaces node {}", self.name, tag.name, id, prev);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> GameVersion {
        self.options.version
    }

    pub fn platform(&self) -> Platform {
        self.options.platform
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&NodeId::ROOT]
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("{}: node {}", self.name, id)))
    }

    pub fn tag(&self, id: TagId) -> Result<&Tag> {
        self.tags
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("{}: tag {}", self.name, id)))
    }

    /// Nodes in stream order, root excluded
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Tags in stream order
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tag_order.iter().filter_map(|id| self.tags.get(id))
    }

    /// Server instance node registered under `name`
    pub fn node_by_name(&self, name: &str) -> Result<&Node> {
        let id = self
            .names
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("{}: no node named '{}'", self.name, name)))?;
        self.node(*id)
    }

    /// Tags whose type the active release does not know
    pub fn unsupported_tags(&self) -> &[TagId] {
        &self.unsupported
    }

    /// Node context for the node produced by `tag_id`
    pub fn node_resource(&self, tag_id: TagId) -> Result<NodeResource<'_>> {
        let tag = self.tag(tag_id)?;
        let node = self.nodes.get(&NodeId::from(tag_id)).ok_or_else(|| {
            Error::NotFound(format!("{}: tag {} has no node", self.name, tag_id))
        })?;
        Ok(NodeResource {
            wad: self,
            node,
            tag,
        })
    }

    /// Decoded instance of a node plus its server id
    ///
    /// The decode runs once per node; concurrent callers share its result,
    /// including a failure.
    pub fn instance_from_node(&self, id: NodeId) -> Result<(Arc<dyn Instance>, u32)> {
        let node = self.node(id)?;
        let tag_id = node
            .tag
            .ok_or_else(|| Error::NotFound(format!("{}: node {} has no tag", self.name, id)))?;
        let resource = self.node_resource(tag_id)?;
        let tag_type = resource.tag.tag_type;
        let decoder = self
            .options
            .registry
            .decoder(tag_type, self.options.version)
            .ok_or(Error::UnsupportedVersion {
                tag_type,
                version: self.options.version,
            })?;

        let result = self
            .instances
            .get_or_init(&id, || decoder.decode(&resource).map_err(Arc::new));
        match result {
            Ok(instance) => Ok((instance, resource.server_id())),
            Err(source) => Err(Error::Decode { node: id.0, source }),
        }
    }

    pub fn instance_from_tag(&self, id: TagId) -> Result<(Arc<dyn Instance>, u32)> {
        self.instance_from_node(NodeId::from(id))
    }

    /// Run the subfile extractor registered as `name` for the tag's type
    pub fn extract_subfile(&self, tag_id: TagId, name: &str) -> Result<Vec<u8>> {
        let resource = self.node_resource(tag_id)?;
        let extractor = self
            .options
            .registry
            .subfile(resource.tag.tag_type, self.options.version, name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{}: no subfile '{}' for tag type {:#x}",
                    self.name, name, resource.tag.tag_type
                ))
            })?;
        let (instance, _) = self.instance_from_tag(tag_id)?;
        extractor.extract(instance.as_ref(), &resource)
    }

    /// Decode every node, collecting misses and failures instead of stopping
    pub fn verify(&self) -> VerifyReport {
        let mut report = VerifyReport {
            nodes: 0,
            decoded: 0,
            unsupported: 0,
            unsupported_tags: self.unsupported.len(),
            failures: Vec::new(),
        };
        for node in self.nodes() {
            report.nodes += 1;
            match self.instance_from_node(node.id) {
                Ok(_) => report.decoded += 1,
                Err(Error::UnsupportedVersion { .. }) => report.unsupported += 1,
                Err(e) => {
                    warn!("{}: node {}: {}", self.name, node.id, e);
                    report.failures.push(NodeFailure {
                        node: node.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

impl fmt::Debug for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wad")
            .field("name", &self.name)
            .field("version", &self.options.version)
            .field("tags", &self.tags.len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// A node together with its tag and the WAD it lives in
#[derive(Clone, Copy)]
pub struct NodeResource<'a> {
    pub wad: &'a Wad,
    pub node: &'a Node,
    pub tag: &'a Tag,
}

impl<'a> NodeResource<'a> {
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn name(&self) -> &'a str {
        &self.tag.name
    }

    pub fn data(&self) -> &'a [u8] {
        &self.tag.data
    }

    /// First u32 of the payload in platform byte order, 0 when too short
    pub fn server_id(&self) -> u32 {
        let data = &self.tag.data;
        if data.len() < 4 {
            return 0;
        }
        if self.wad.platform().is_big_endian() {
            BigEndian::read_u32(data)
        } else {
            LittleEndian::read_u32(data)
        }
    }

    /// Parent node resource, `None` directly under the root
    pub fn parent(&self) -> Option<NodeResource<'a>> {
        let tag = self.wad.node(self.node.parent).ok()?.tag?;
        self.wad.node_resource(tag).ok()
    }

    /// Ancestor ids from the direct parent up to the root
    pub fn parents(&self) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.node.parent;
        while current != NodeId::INVALID {
            chain.push(current);
            current = match self.wad.node(current) {
                Ok(node) => node.parent,
                Err(_) => break,
            };
        }
        chain
    }

    pub fn children(&self) -> impl Iterator<Item = NodeResource<'a>> + 'a {
        let wad = self.wad;
        let node = self.node;
        node.children.iter().filter_map(move |id| {
            let tag = wad.nodes.get(id)?.tag?;
            wad.node_resource(tag).ok()
        })
    }

    /// JSON summary of the node
    pub fn marshal(&self) -> serde_json::Value {
        json!({
            "id": self.node.id,
            "name": self.tag.name,
            "tag_type": self.tag.tag_type,
            "kind": dispatch::tag_kind(self.tag.tag_type, self.wad.version()),
            "server_id": self.server_id(),
            "size": self.tag.data.len(),
            "offset": self.tag.debug_offset,
            "parent": self.node.parent,
            "children": self.node.children,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node: NodeId,
    pub error: String,
}

/// Outcome of [`Wad::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub nodes: usize,
    pub decoded: usize,
    /// Nodes with no decoder for their tag type
    pub unsupported: usize,
    /// Tags the release's tag table does not know
    pub unsupported_tags: usize,
    pub failures: Vec<NodeFailure>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::tag::tests::StreamBuilder;
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    const ENTITY_COUNT: u16 = 0x18;
    const SERVER_INSTANCE: u16 = 0x1e;
    const GROUP_START: u16 = 0x28;
    const GROUP_END: u16 = 0x32;
    const HEADER_START: u16 = 0x70;
    const HEADER_POP: u16 = 0x71;

    type Stream = StreamBuilder<LittleEndian>;

    fn classic() -> WadOptions {
        WadOptions::new(GameVersion::Gow2, Platform::Ps2)
    }

    fn parse(data: &[u8]) -> Result<Wad> {
        Wad::parse("TEST.WAD", data, &classic())
    }

    fn level_stream() -> Vec<u8> {
        Stream::new()
            .tag(1, HEADER_START, "header", &[])
            .tag(2, ENTITY_COUNT, "", &[3, 0, 0, 0])
            .tag(3, GROUP_START, "", &[])
            .tag(4, SERVER_INSTANCE, "hero", &[0x0c, 0, 0, 0, 1])
            .tag(5, SERVER_INSTANCE, "sword", &[0x07, 0, 0, 0])
            .tag(6, GROUP_START, "", &[])
            .tag(7, SERVER_INSTANCE, "blade", &[0x08, 0, 0, 0])
            .tag(8, GROUP_END, "", &[])
            .tag(9, GROUP_END, "", &[])
            .tag(10, HEADER_POP, "", &[])
            .build()
    }

    #[test]
    fn test_parse_is_deterministic() {
        let data = level_stream();
        let a = parse(&data).unwrap();
        let b = parse(&data).unwrap();
        assert_eq!(a.nodes().collect::<Vec<_>>(), b.nodes().collect::<Vec<_>>());
        assert_eq!(a.tags().collect::<Vec<_>>(), b.tags().collect::<Vec<_>>());
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_balanced_groups() {
        let wad = parse(&level_stream()).unwrap();
        let root = wad.root();
        assert_eq!(root.parent, NodeId::INVALID);
        assert_eq!(root.tag, None);
        // header, hero (the group node) and the header pop
        assert_eq!(root.children, vec![NodeId(1), NodeId(4), NodeId(10)]);
        // the nested group node attaches under the enclosing group node
        assert_eq!(wad.node(NodeId(4)).unwrap().children, vec![NodeId(5), NodeId(7)]);
        assert!(wad.node(NodeId(5)).unwrap().children.is_empty());
        assert_eq!(wad.node(NodeId(7)).unwrap().parent, NodeId(4));
        // entity count and group tags produce no nodes in classic releases
        for id in [2, 3, 6, 8, 9] {
            assert!(matches!(wad.node(NodeId(id)), Err(Error::NotFound(_))));
            assert!(wad.tag(TagId(id)).is_ok());
        }
    }

    #[test]
    fn test_every_id_is_retrievable() {
        let wad = parse(&level_stream()).unwrap();
        for tag in wad.tags() {
            assert_eq!(wad.tag(tag.id).unwrap().id, tag.id);
        }
        for node in wad.nodes() {
            let found = wad.node(node.id).unwrap();
            assert_eq!(found.tag, Some(TagId(node.id.0)));
            assert!(wad.node_resource(TagId(node.id.0)).is_ok());
        }
        assert_eq!(wad.tags().count(), 10);
        assert_eq!(wad.nodes().count(), 5);
        assert!(matches!(wad.tag(TagId(11)), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_unmatched_group_end() {
        let data = Stream::new()
            .tag(1, SERVER_INSTANCE, "a", &[])
            .tag(2, GROUP_END, "", &[])
            .tag(3, SERVER_INSTANCE, "b", &[])
            .build();
        let err = parse(&data).unwrap_err();
        assert!(matches!(err, Error::Corrupt(ref msg) if msg.contains("without matching start")));
    }

    #[test]
    fn test_unclosed_group() {
        let data = Stream::new()
            .tag(1, GROUP_START, "", &[])
            .tag(2, SERVER_INSTANCE, "a", &[])
            .build();
        assert!(matches!(parse(&data), Err(Error::Corrupt(_))));

        let data = Stream::new().tag(1, GROUP_START, "", &[]).build();
        assert!(matches!(parse(&data), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_group_node_owns_nested_data() {
        let data = Stream::new()
            .tag(1, HEADER_START, "header", &[])
            .tag(2, GROUP_START, "", &[])
            .tag(3, SERVER_INSTANCE, "group", &[])
            .tag(4, GROUP_START, "", &[])
            .tag(5, SERVER_INSTANCE, "foo", &[])
            .tag(6, GROUP_END, "", &[])
            .tag(7, GROUP_END, "", &[])
            .build();
        let wad = parse(&data).unwrap();

        let foo = wad.node(NodeId(5)).unwrap();
        assert_eq!(wad.tag(TagId(5)).unwrap().name, "foo");
        assert_eq!(foo.parent, NodeId(3));
        assert_ne!(foo.parent, NodeId::ROOT);
        assert_eq!(wad.node(NodeId(3)).unwrap().children, vec![NodeId(5)]);
        assert_eq!(wad.root().children, vec![NodeId(1), NodeId(3)]);
        assert_eq!(
            wad.node_resource(TagId(5)).unwrap().parents(),
            vec![NodeId(3), NodeId::ROOT]
        );
    }

    #[test]
    fn test_first_grouped_node_becomes_the_scope() {
        // the armed group start makes its first node the scope itself
        let data = Stream::new()
            .tag(1, HEADER_START, "header", &[])
            .tag(2, GROUP_START, "", &[])
            .tag(5, SERVER_INSTANCE, "foo", &[])
            .tag(6, GROUP_END, "", &[])
            .build();
        let wad = parse(&data).unwrap();

        assert_eq!(wad.root().children, vec![NodeId(1), NodeId(5)]);
        let foo = wad.node(NodeId(5)).unwrap();
        assert_eq!(foo.parent, NodeId::ROOT);
        assert!(foo.children.is_empty());
        assert!(matches!(wad.node(NodeId(2)), Err(Error::NotFound(_))));
        assert!(matches!(wad.node(NodeId(6)), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_group() {
        let data = Stream::new()
            .tag(1, SERVER_INSTANCE, "a", &[])
            .tag(2, GROUP_START, "", &[])
            .tag(3, GROUP_END, "", &[])
            .tag(4, SERVER_INSTANCE, "b", &[])
            .build();
        let wad = parse(&data).unwrap();
        assert_eq!(wad.root().children, vec![NodeId(1), NodeId(4)]);
        assert!(wad.node(NodeId(1)).unwrap().children.is_empty());
    }

    #[test]
    fn test_gow3_group_end_node() {
        let options = WadOptions::new(GameVersion::Gow3, Platform::Ps3);
        let data = StreamBuilder::<BigEndian>::new()
            .tag(1, 19, "header", &[])
            .tag(2, 2, "", &[])
            .tag(3, 1, "group", &[0, 0, 0, 0x2a])
            .tag(4, 1, "child", &[])
            .tag(5, 3, "end", &[])
            // empty group: the end node lands under the scope before the start
            .tag(6, 2, "", &[])
            .tag(7, 3, "empty", &[])
            .tag(8, 22, "", &[])
            .build();
        let wad = Wad::parse("GOW3.WAD", &data, &options).unwrap();

        assert_eq!(wad.node(NodeId(4)).unwrap().parent, NodeId(3));
        assert_eq!(wad.node(NodeId(5)).unwrap().parent, NodeId::ROOT);
        assert_eq!(wad.node(NodeId(7)).unwrap().parent, NodeId::ROOT);
        assert_eq!(
            wad.root().children,
            vec![NodeId(1), NodeId(3), NodeId(5), NodeId(7)]
        );
        assert_eq!(wad.node_resource(TagId(3)).unwrap().server_id(), 0x2a);

        // header pop is a bare tag in GoW3
        assert!(matches!(wad.node(NodeId(8)), Err(Error::NotFound(_))));
        assert_eq!(wad.tag(TagId(8)).unwrap().tag_type, 22);
        assert!(wad.unsupported_tags().is_empty());
    }

    #[test]
    fn test_truncated_stream() {
        let data = level_stream();
        assert!(matches!(parse(&data[..data.len() - 2]), Err(Error::Corrupt(_))));
        assert_eq!(parse(&[]).unwrap().nodes().count(), 0);
    }

    #[test]
    fn test_ids_must_increase() {
        let data = Stream::new()
            .tag(2, SERVER_INSTANCE, "a", &[])
            .tag(2, SERVER_INSTANCE, "b", &[])
            .build();
        assert!(matches!(parse(&data), Err(Error::Corrupt(_))));

        let data = Stream::new()
            .tag(0xFFFF_FFFE, SERVER_INSTANCE, "a", &[])
            .build();
        assert!(matches!(parse(&data), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_unsupported_tags_are_kept() {
        let data = Stream::new()
            .tag(1, SERVER_INSTANCE, "a", &[])
            .tag(2, 0x99, "mystery", &[1, 2, 3])
            .build();
        let wad = parse(&data).unwrap();
        assert_eq!(wad.unsupported_tags(), &[TagId(2)]);
        assert_eq!(wad.tag(TagId(2)).unwrap().data, vec![1, 2, 3]);
        assert!(wad.node(NodeId(2)).is_err());
    }

    #[test]
    fn test_unsupported_game() {
        let options = WadOptions::new(GameVersion::Gow2018, Platform::Ps4);
        assert!(matches!(
            Wad::parse("X.WAD", &[], &options),
            Err(Error::UnsupportedGame(GameVersion::Gow2018))
        ));
    }

    #[test]
    fn test_later_name_overwrites() {
        let data = Stream::new()
            .tag(1, SERVER_INSTANCE, "hero", &[])
            .tag(2, SERVER_INSTANCE, " unnamed", &[])
            .tag(3, SERVER_INSTANCE, "hero", &[])
            .tag(4, HEADER_START, "header", &[])
            .build();
        let wad = parse(&data).unwrap();
        assert_eq!(wad.node_by_name("hero").unwrap().id, NodeId(3));
        assert!(wad.node_by_name(" unnamed").is_err());
        assert!(wad.node_by_name("header").is_err());
    }

    #[derive(Debug)]
    struct Payload(Vec<u8>);

    impl Instance for Payload {
        fn marshal(&self, resource: &NodeResource<'_>) -> Result<serde_json::Value> {
            Ok(json!({ "name": resource.name(), "len": self.0.len() }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountingDecoder(Arc<AtomicUsize>);

    impl dispatch::Decoder for CountingDecoder {
        fn decode(&self, resource: &NodeResource<'_>) -> Result<Arc<dyn Instance>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if resource.name() == "bad" {
                return Err(Error::corrupt("bad payload"));
            }
            Ok(Arc::new(Payload(resource.data().to_vec())))
        }
    }

    fn first_bytes(instance: &dyn Instance, _: &NodeResource<'_>) -> Result<Vec<u8>> {
        let payload = instance
            .as_any()
            .downcast_ref::<Payload>()
            .ok_or_else(|| Error::corrupt("not a payload"))?;
        Ok(payload.0.iter().take(2).copied().collect())
    }

    fn decoding_wad(calls: Arc<AtomicUsize>) -> Wad {
        let mut registry = Registry::new();
        registry
            .register_decoder(SERVER_INSTANCE, GameVersion::Gow2, CountingDecoder(calls))
            .register_subfile(SERVER_INSTANCE, GameVersion::Gow2, "head", first_bytes);
        let options = classic().with_registry(Arc::new(registry));
        let data = Stream::new()
            .tag(1, HEADER_START, "header", &[])
            .tag(2, SERVER_INSTANCE, "hero", &[9, 0, 0, 0, 5])
            .tag(3, SERVER_INSTANCE, "bad", &[])
            .tag(4, 0x99, "mystery", &[])
            .build();
        Wad::parse("TEST.WAD", &data, &options).unwrap()
    }

    #[test]
    fn test_concurrent_instance_decodes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wad = decoding_wad(calls.clone());
        let barrier = Barrier::new(8);

        let results: Vec<(Arc<dyn Instance>, u32)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        wad.instance_from_node(NodeId(2)).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (instance, server_id) in &results {
            assert!(Arc::ptr_eq(instance, &results[0].0));
            assert_eq!(*server_id, 9);
        }
    }

    #[test]
    fn test_instance_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wad = decoding_wad(calls.clone());

        assert!(matches!(
            wad.instance_from_node(NodeId(1)),
            Err(Error::UnsupportedVersion { tag_type: HEADER_START, .. })
        ));
        assert!(matches!(
            wad.instance_from_node(NodeId::ROOT),
            Err(Error::NotFound(_))
        ));

        // decode failures are cached like successes
        for _ in 0..2 {
            let err = wad.instance_from_tag(TagId(3)).unwrap_err();
            assert!(matches!(err, Error::Decode { node: 3, .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extract_subfile() {
        let wad = decoding_wad(Arc::new(AtomicUsize::new(0)));
        assert_eq!(wad.extract_subfile(TagId(2), "head").unwrap(), vec![9, 0]);
        assert!(matches!(
            wad.extract_subfile(TagId(2), "tail"),
            Err(Error::NotFound(_))
        ));

        let resource = wad.node_resource(TagId(2)).unwrap();
        let (instance, _) = wad.instance_from_tag(TagId(2)).unwrap();
        let json = instance.marshal(&resource).unwrap();
        assert_eq!(json["len"], 5);
        assert_eq!(resource.marshal()["server_id"], 9);
    }

    #[test]
    fn test_verify_report() {
        let wad = decoding_wad(Arc::new(AtomicUsize::new(0)));
        let report = wad.verify();
        assert_eq!(report.nodes, 3);
        assert_eq!(report.decoded, 1);
        assert_eq!(report.unsupported, 1);
        assert_eq!(report.unsupported_tags, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].node, NodeId(3));
        assert!(!report.is_clean());
    }
}
