//! Version dispatch
//!
//! Tag type numbers changed between releases, so every lookup is keyed on
//! the pair `(tag_type, GameVersion)`:
//!
//! | Kind | Classic (GoW1/2, Ghost of Sparta, Chains of Olympus) | GoW3 |
//! |------|------|------|
//! | entity count | `0x18` | `0` |
//! | server instance | `0x1e` | `1` |
//! | group start | `0x28` | `2` |
//! | group end | `0x32` | `3` |
//! | header start | `0x70` | `19` |
//! | header pop | `0x71` | `22` |
//!
//! Resource decoders and subfile extractors are registered explicitly in a
//! [`Registry`] under the same key.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::NodeResource;
use crate::config::GameVersion;
use crate::error::Result;

/// What a tag type means for a given release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TagKind {
    EntityCount,
    ServerInstance,
    GroupStart,
    GroupEnd,
    HeaderStart,
    HeaderPop,
}

/// Effect of a tag on group nesting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEffect {
    None,
    Open,
    Close,
}

/// How the parser treats one tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagBehavior {
    pub kind: TagKind,
    pub produces_node: bool,
    pub scope: ScopeEffect,
}

const CLASSIC_TAGS: &[(u16, TagKind)] = &[
    (0x18, TagKind::EntityCount),
    (0x1e, TagKind::ServerInstance),
    (0x28, TagKind::GroupStart),
    (0x32, TagKind::GroupEnd),
    (0x70, TagKind::HeaderStart),
    (0x71, TagKind::HeaderPop),
];

const GOW3_TAGS: &[(u16, TagKind)] = &[
    (0, TagKind::EntityCount),
    (1, TagKind::ServerInstance),
    (2, TagKind::GroupStart),
    (3, TagKind::GroupEnd),
    (19, TagKind::HeaderStart),
    (22, TagKind::HeaderPop),
];

/// Tag table of a release, `None` for releases without WAD support
pub fn tag_table(version: GameVersion) -> Option<&'static [(u16, TagKind)]> {
    match version {
        GameVersion::Gow1
        | GameVersion::Gow2
        | GameVersion::GhostOfSparta
        | GameVersion::ChainsOfOlympus => Some(CLASSIC_TAGS),
        GameVersion::Gow3 => Some(GOW3_TAGS),
        GameVersion::Unknown | GameVersion::Gow2018 => None,
    }
}

pub fn tag_kind(tag_type: u16, version: GameVersion) -> Option<TagKind> {
    tag_table(version)?
        .iter()
        .find(|(t, _)| *t == tag_type)
        .map(|(_, kind)| *kind)
}

/// Tag type number of `kind` in `version`
pub fn tag_type_of(kind: TagKind, version: GameVersion) -> Option<u16> {
    tag_table(version)?
        .iter()
        .find(|(_, k)| *k == kind)
        .map(|(t, _)| *t)
}

/// Parser behaviour of a tag type, `None` when the release does not know it
pub fn behavior(tag_type: u16, version: GameVersion) -> Option<TagBehavior> {
    let kind = tag_kind(tag_type, version)?;
    let (produces_node, scope) = match kind {
        TagKind::EntityCount => (false, ScopeEffect::None),
        TagKind::ServerInstance | TagKind::HeaderStart => (true, ScopeEffect::None),
        // GoW3 keeps the header pop as a bare tag
        TagKind::HeaderPop => (version != GameVersion::Gow3, ScopeEffect::None),
        TagKind::GroupStart => (false, ScopeEffect::Open),
        // GoW3 keeps a node for the group end, attached after the pop
        TagKind::GroupEnd => (version == GameVersion::Gow3, ScopeEffect::Close),
    };
    Some(TagBehavior {
        kind,
        produces_node,
        scope,
    })
}

/// A decoded resource
pub trait Instance: Any + Send + Sync + fmt::Debug {
    /// JSON form for browsing
    fn marshal(&self, resource: &NodeResource<'_>) -> Result<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;
}

/// Builds an [`Instance`] from a node's payload and context
pub trait Decoder: Send + Sync {
    fn decode(&self, resource: &NodeResource<'_>) -> Result<Arc<dyn Instance>>;
}

impl<F> Decoder for F
where
    F: Fn(&NodeResource<'_>) -> Result<Arc<dyn Instance>> + Send + Sync,
{
    fn decode(&self, resource: &NodeResource<'_>) -> Result<Arc<dyn Instance>> {
        self(resource)
    }
}

/// Named extraction of an embedded file from a decoded instance
pub trait SubfileExtractor: Send + Sync {
    fn extract(&self, instance: &dyn Instance, resource: &NodeResource<'_>) -> Result<Vec<u8>>;
}

impl<F> SubfileExtractor for F
where
    F: Fn(&dyn Instance, &NodeResource<'_>) -> Result<Vec<u8>> + Send + Sync,
{
    fn extract(&self, instance: &dyn Instance, resource: &NodeResource<'_>) -> Result<Vec<u8>> {
        self(instance, resource)
    }
}

type Key = (u16, GameVersion);

/// Decoders and subfile extractors keyed by `(tag_type, version)`
#[derive(Default)]
pub struct Registry {
    decoders: HashMap<Key, Arc<dyn Decoder>>,
    subfiles: HashMap<Key, Vec<(String, Arc<dyn SubfileExtractor>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for a tag type; replaces any earlier one
    pub fn register_decoder(
        &mut self,
        tag_type: u16,
        version: GameVersion,
        decoder: impl Decoder + 'static,
    ) -> &mut Self {
        self.decoders.insert((tag_type, version), Arc::new(decoder));
        self
    }

    /// Register a named subfile extractor for a tag type
    pub fn register_subfile(
        &mut self,
        tag_type: u16,
        version: GameVersion,
        name: impl Into<String>,
        extractor: impl SubfileExtractor + 'static,
    ) -> &mut Self {
        let name = name.into();
        let list = self.subfiles.entry((tag_type, version)).or_default();
        list.retain(|(n, _)| *n != name);
        list.push((name, Arc::new(extractor)));
        self
    }

    pub fn decoder(&self, tag_type: u16, version: GameVersion) -> Option<Arc<dyn Decoder>> {
        self.decoders.get(&(tag_type, version)).cloned()
    }

    pub fn subfile(
        &self,
        tag_type: u16,
        version: GameVersion,
        name: &str,
    ) -> Option<Arc<dyn SubfileExtractor>> {
        self.subfiles
            .get(&(tag_type, version))?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
    }

    /// Subfile names registered for a tag type, in registration order
    pub fn subfile_names(&self, tag_type: u16, version: GameVersion) -> Vec<&str> {
        self.subfiles
            .get(&(tag_type, version))
            .map(|list| list.iter().map(|(n, _)| n.as_str()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("subfiles", &self.subfiles.keys().collect::<Vec<_>>())
            .finish()
    }
}
