//! ISO 7816-4 file-system tree
//!
//! Files live in an arena indexed by [`NodeId`]; parent links are plain
//! indices, so the recursive structure needs no reference counting and
//! serializes cleanly. The tree tracks the currently selected file and
//! resolves every SELECT addressing mode.

mod node;
mod ops;

pub use node::{
    FileBody, FileHeader, FileNode, NodeId, Record, WriteCoding, FID_CURRENT, FID_MF,
    FID_RESERVED, LIFE_CYCLE_OPERATIONAL,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{CardResult, StructureError, SwError};
use crate::tlv::TlvBuilder;

/// Occurrence selector for DF-name selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    First,
    Last,
    Next,
    Previous,
}

impl Occurrence {
    /// Decode from the low bits of SELECT's P2.
    pub fn from_p2(p2: u8) -> Self {
        match p2 & 0x03 {
            0 => Occurrence::First,
            1 => Occurrence::Last,
            2 => Occurrence::Next,
            _ => Occurrence::Previous,
        }
    }
}

/// A file reference, as resolvable by SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// The master file.
    Mf,
    /// Immediate child by file identifier, searched from the current DF
    /// (falling back to the MF itself when its fid is named).
    ChildFid(u16),
    /// Immediate child DF by identifier.
    ChildDf(u16),
    /// Immediate child EF by identifier.
    ChildEf(u16),
    /// Parent of the current DF.
    Parent,
    /// DF by full or truncated application name.
    DfName { name: Vec<u8>, occurrence: Occurrence },
    /// Concatenated fids from the MF, without the leading 0x3F00.
    PathFromMf(Vec<u8>),
    /// Concatenated fids from the current DF.
    PathFromCurrent(Vec<u8>),
    /// Short file identifier within the current DF.
    ShortFid(u8),
}

/// FCI rendering mode, from SELECT's P2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FciMode {
    /// Control parameters and management data (tag 0x6F).
    Fci,
    /// Control parameters only (tag 0x62).
    Fcp,
    /// Management data only (tag 0x64).
    Fmd,
    /// No response data.
    None,
}

impl FciMode {
    pub fn from_p2(p2: u8) -> CardResult<Self> {
        match p2 & 0x0C {
            0x00 => Ok(FciMode::Fci),
            0x04 => Ok(FciMode::Fcp),
            0x08 => Ok(FciMode::Fmd),
            _ => Ok(FciMode::None),
        }
    }
}

/// The card's file tree, its arena, and the selection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTree {
    nodes: Vec<Option<FileNode>>,
    root: NodeId,
    current: NodeId,
}

impl FileTree {
    /// A fresh tree holding only the MF.
    pub fn new() -> Self {
        let mf = FileNode {
            header: FileHeader::new(FID_MF, 0x38),
            parent: None,
            body: FileBody::Dedicated {
                name: None,
                children: Vec::new(),
            },
        };
        Self {
            nodes: vec![Some(mf)],
            root: NodeId(0),
            current: NodeId(0),
        }
    }

    pub fn mf(&self) -> NodeId {
        self.root
    }

    pub fn current(&self) -> NodeId {
        self.current
    }

    pub(crate) fn node(&self, id: NodeId) -> CardResult<&FileNode> {
        self.nodes
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(SwError::file_not_found)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> CardResult<&mut FileNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(SwError::file_not_found)
    }

    /// The current DF: the selected file itself when it is a DF,
    /// otherwise its parent.
    pub fn current_df(&self) -> NodeId {
        match self.node(self.current) {
            Ok(node) if node.is_df() => self.current,
            Ok(node) => node.parent.unwrap_or(self.root),
            Err(_) => self.root,
        }
    }

    /// Attach a node under `parent` during personalization.
    pub fn plant(&mut self, parent: NodeId, node: FileNode) -> Result<NodeId, StructureError> {
        let fid = node.header.fid;
        self.attach(parent, node)
            .map_err(|_| StructureError::DuplicateFid(fid))
    }

    /// Attach a node under `parent`, enforcing sibling-unique and
    /// non-reserved fids.
    pub fn attach(&mut self, parent: NodeId, mut node: FileNode) -> CardResult<NodeId> {
        let fid = node.header.fid;
        if fid == FID_CURRENT || fid == FID_RESERVED || fid == FID_MF {
            return Err(SwError::incorrect_parameters());
        }
        let parent_node = self.node(parent)?;
        if !parent_node.is_df() {
            return Err(SwError::new(crate::apdu::SW::COMMAND_INCOMPATIBLE));
        }
        for &child in parent_node.children() {
            if self.node(child)?.header.fid == fid {
                return Err(SwError::file_exists());
            }
        }
        node.parent = Some(parent);
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        if let FileBody::Dedicated { children, .. } = &mut self.node_mut(parent)?.body {
            children.push(id);
        }
        debug!("attached file {fid:#06x} as node {}", id.0);
        Ok(id)
    }

    /// Detach a node from its parent and free its slot. The MF cannot
    /// be removed.
    pub fn detach(&mut self, id: NodeId) -> CardResult<FileNode> {
        if id == self.root {
            return Err(SwError::incorrect_parameters());
        }
        let parent = self
            .node(id)?
            .parent
            .ok_or_else(SwError::incorrect_parameters)?;
        if let FileBody::Dedicated { children, .. } = &mut self.node_mut(parent)?.body {
            children.retain(|&c| c != id);
        }
        let node = self.nodes[id.0].take().ok_or_else(SwError::file_not_found)?;
        if self.current == id || self.is_descendant(self.current, id) {
            self.current = parent;
        }
        debug!("detached file {:#06x}", node.header.fid);
        Ok(node)
    }

    fn is_descendant(&self, candidate: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = candidate;
        while let Ok(node) = self.node(cursor) {
            match node.parent {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
        false
    }

    /// Resolve a selector without changing the selection state.
    pub fn resolve(&self, selector: &Selector) -> CardResult<NodeId> {
        match selector {
            Selector::Mf => Ok(self.root),
            Selector::ChildFid(fid) => {
                if *fid == FID_MF {
                    return Ok(self.root);
                }
                self.child_by_fid(self.current_df(), *fid, None)
            }
            Selector::ChildDf(fid) => self.child_by_fid(self.current_df(), *fid, Some(true)),
            Selector::ChildEf(fid) => self.child_by_fid(self.current_df(), *fid, Some(false)),
            Selector::Parent => {
                let df = self.current_df();
                self.node(df)?
                    .parent
                    .ok_or_else(SwError::file_not_found)
            }
            Selector::DfName { name, occurrence } => self.df_by_name(name, *occurrence),
            Selector::PathFromMf(path) => self.walk_path(self.root, path),
            Selector::PathFromCurrent(path) => self.walk_path(self.current_df(), path),
            Selector::ShortFid(sfid) => self.child_by_short_fid(*sfid),
        }
    }

    /// Resolve a selector and make the result the current file.
    pub fn select(&mut self, selector: &Selector) -> CardResult<NodeId> {
        let id = self.resolve(selector)?;
        self.set_current(id);
        Ok(id)
    }

    pub(crate) fn set_current(&mut self, id: NodeId) {
        self.current = id;
        // The record pointer of a freshly selected file is undefined.
        if let Ok(node) = self.node_mut(id) {
            if let FileBody::Record { cursor, .. } = &mut node.body {
                *cursor = None;
            }
        }
    }

    fn child_by_fid(&self, df: NodeId, fid: u16, want_df: Option<bool>) -> CardResult<NodeId> {
        for &child in self.node(df)?.children() {
            let node = self.node(child)?;
            if node.header.fid == fid && want_df.map_or(true, |w| node.is_df() == w) {
                return Ok(child);
            }
        }
        Err(SwError::file_not_found())
    }

    fn child_by_short_fid(&self, sfid: u8) -> CardResult<NodeId> {
        if !(1..=30).contains(&sfid) {
            return Err(SwError::incorrect_parameters());
        }
        for &child in self.node(self.current_df())?.children() {
            if self.node(child)?.header.short_fid == Some(sfid) {
                return Ok(child);
            }
        }
        Err(SwError::file_not_found())
    }

    fn walk_path(&self, start: NodeId, path: &[u8]) -> CardResult<NodeId> {
        if path.is_empty() || path.len() % 2 != 0 {
            return Err(SwError::incorrect_parameters());
        }
        let mut cursor = start;
        for pair in path.chunks(2) {
            let fid = u16::from_be_bytes([pair[0], pair[1]]);
            // A leading 0x3F00 re-anchors at the MF.
            if fid == FID_MF && cursor == self.root {
                continue;
            }
            cursor = self.child_by_fid(cursor, fid, None)?;
        }
        Ok(cursor)
    }

    /// Every node in document order (depth-first from the MF).
    fn document_order(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Ok(node) = self.node(id) {
                out.push(id);
                // Push in reverse so children pop in document order.
                for &child in node.children().iter().rev() {
                    stack.push(child);
                }
            }
        }
        out
    }

    fn df_by_name(&self, name: &[u8], occurrence: Occurrence) -> CardResult<NodeId> {
        if name.is_empty() || name.len() > 16 {
            return Err(SwError::incorrect_parameters());
        }
        let order = self.document_order();
        let matches: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(_, &id)| {
                self.node(id)
                    .ok()
                    .and_then(|n| n.df_name())
                    .map_or(false, |n| n.starts_with(name))
            })
            .map(|(rank, _)| rank)
            .collect();
        if matches.is_empty() {
            return Err(SwError::file_not_found());
        }
        let current_rank = order
            .iter()
            .position(|&id| id == self.current)
            .unwrap_or(0);
        let rank = match occurrence {
            Occurrence::First => Some(matches[0]),
            Occurrence::Last => Some(matches[matches.len() - 1]),
            Occurrence::Next => matches.iter().copied().find(|&r| r > current_rank),
            Occurrence::Previous => {
                matches.iter().copied().rev().find(|&r| r < current_rank)
            }
        };
        rank.map(|r| order[r]).ok_or_else(SwError::file_not_found)
    }

    /// Render the FCI/FCP/FMD template for a file.
    pub fn format_fci(&self, id: NodeId, mode: FciMode) -> CardResult<Vec<u8>> {
        let node = self.node(id)?;
        if mode == FciMode::None {
            return Ok(Vec::new());
        }
        let mut builder = TlvBuilder::new();
        if matches!(mode, FciMode::Fci | FciMode::Fcp) {
            builder = match &node.body {
                FileBody::Transparent { data, .. } => {
                    builder.push(0x80, &(data.len() as u16).to_be_bytes())
                }
                _ => builder,
            };
            builder = match &node.body {
                FileBody::Record {
                    fixed_size: Some(size),
                    ..
                } => {
                    let mut descriptor = vec![node.header.descriptor, 0x21];
                    descriptor.extend_from_slice(&(*size as u16).to_be_bytes());
                    builder.push(0x82, &descriptor)
                }
                _ => builder.push(0x82, &[node.header.descriptor]),
            };
            builder = builder.push(0x83, &node.header.fid.to_be_bytes());
            builder = builder.push_opt(0x84, node.df_name());
            if let Some(sfid) = node.header.short_fid {
                builder = builder.push(0x88, &[sfid << 3]);
            }
            builder = builder.push(0x8A, &[node.header.life_cycle]);
        }
        if matches!(mode, FciMode::Fci | FciMode::Fmd) {
            builder = builder.push_raw(&node.header.extra_fci);
        }
        let template = match mode {
            FciMode::Fci => 0x6F,
            FciMode::Fcp => 0x62,
            FciMode::Fmd => 0x64,
            FciMode::None => unreachable!("handled above"),
        };
        Ok(builder.wrap(template).build())
    }
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        let df = tree
            .plant(
                mf,
                FileNode::dedicated(FileHeader::new(0x1000, 0x38), Some(b"appone".to_vec()))
                    .unwrap(),
            )
            .unwrap();
        tree.plant(
            df,
            FileNode::transparent(
                FileHeader::new(0x0101, 0x01).with_short_fid(1).unwrap(),
                vec![0u8; 10],
                None,
            ),
        )
        .unwrap();
        tree.plant(
            mf,
            FileNode::dedicated(FileHeader::new(0x2000, 0x38), Some(b"apptwo".to_vec()))
                .unwrap(),
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_duplicate_fid_rejected() {
        let mut tree = sample_tree();
        let mf = tree.mf();
        let dup = FileNode::transparent(FileHeader::new(0x1000, 0x01), vec![], None);
        assert!(matches!(
            tree.plant(mf, dup),
            Err(StructureError::DuplicateFid(0x1000))
        ));
    }

    #[test]
    fn test_reserved_fid_rejected() {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        for fid in [FID_MF, FID_CURRENT, FID_RESERVED] {
            let node = FileNode::transparent(FileHeader::new(fid, 0x01), vec![], None);
            assert!(tree.attach(mf, node).is_err());
        }
    }

    #[test]
    fn test_select_path_from_mf() {
        let mut tree = sample_tree();
        let id = tree
            .select(&Selector::PathFromMf(vec![0x10, 0x00, 0x01, 0x01]))
            .unwrap();
        assert_eq!(tree.node(id).unwrap().header.fid, 0x0101);
        assert_eq!(tree.current(), id);
    }

    #[test]
    fn test_select_child_and_parent() {
        let mut tree = sample_tree();
        tree.select(&Selector::ChildFid(0x1000)).unwrap();
        tree.select(&Selector::ChildFid(0x0101)).unwrap();
        // Selecting by fid searches the current DF, which for an EF is
        // its parent.
        let parent = tree.select(&Selector::Parent).unwrap();
        assert_eq!(tree.node(parent).unwrap().header.fid, FID_MF);
    }

    #[test]
    fn test_select_short_fid() {
        let mut tree = sample_tree();
        tree.select(&Selector::ChildFid(0x1000)).unwrap();
        let id = tree.select(&Selector::ShortFid(1)).unwrap();
        assert_eq!(tree.node(id).unwrap().header.fid, 0x0101);
        assert!(tree.select(&Selector::ShortFid(9)).is_err());
    }

    #[test]
    fn test_select_by_name_partial_and_ordering() {
        let mut tree = sample_tree();
        let first = tree
            .select(&Selector::DfName {
                name: b"app".to_vec(),
                occurrence: Occurrence::First,
            })
            .unwrap();
        assert_eq!(tree.node(first).unwrap().header.fid, 0x1000);
        let next = tree
            .select(&Selector::DfName {
                name: b"app".to_vec(),
                occurrence: Occurrence::Next,
            })
            .unwrap();
        assert_eq!(tree.node(next).unwrap().header.fid, 0x2000);
        assert!(tree
            .select(&Selector::DfName {
                name: b"app".to_vec(),
                occurrence: Occurrence::Next,
            })
            .is_err());
        let last = tree
            .select(&Selector::DfName {
                name: b"app".to_vec(),
                occurrence: Occurrence::Last,
            })
            .unwrap();
        assert_eq!(tree.node(last).unwrap().header.fid, 0x2000);
    }

    #[test]
    fn test_select_unknown_fid_fails() {
        let mut tree = sample_tree();
        let err = tree.select(&Selector::ChildFid(0x7777)).unwrap_err();
        assert_eq!(err.sw, crate::apdu::SW::FILE_NOT_FOUND);
    }

    #[test]
    fn test_detach_moves_selection_to_parent() {
        let mut tree = sample_tree();
        let df = tree.select(&Selector::ChildFid(0x1000)).unwrap();
        tree.select(&Selector::ChildFid(0x0101)).unwrap();
        let ef = tree.current();
        tree.detach(ef).unwrap();
        assert_eq!(tree.current(), df);
        assert!(tree.resolve(&Selector::ChildFid(0x0101)).is_err());
    }

    #[test]
    fn test_detach_mf_rejected() {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        assert!(tree.detach(mf).is_err());
    }

    #[test]
    fn test_fci_rendering() {
        let tree = sample_tree();
        let id = tree.resolve(&Selector::PathFromMf(vec![0x10, 0x00, 0x01, 0x01])).unwrap();
        let fci = tree.format_fci(id, FciMode::Fci).unwrap();
        let decoded = crate::tlv::decode(&fci).unwrap();
        assert_eq!(decoded[0].tag, 0x6F);
        let fid = decoded[0].child(0x83).unwrap();
        assert_eq!(fid.value, vec![0x01, 0x01]);
        let size = decoded[0].child(0x80).unwrap();
        assert_eq!(size.value, vec![0x00, 0x0A]);
        let sfid = decoded[0].child(0x88).unwrap();
        assert_eq!(sfid.value, vec![1 << 3]);
        assert!(tree.format_fci(id, FciMode::None).unwrap().is_empty());
    }
}
