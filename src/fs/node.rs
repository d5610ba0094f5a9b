//! File nodes
//!
//! The three ISO 7816-4 file kinds and the header fields they share.
//! Nodes live in the tree's arena and reference each other by
//! [`NodeId`], so a child can point back at its parent without an
//! ownership cycle.

use serde::{Deserialize, Serialize};

use crate::error::StructureError;

/// Arena index of a file node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub(crate) usize);

/// Identifier of the master file, the unique tree root.
pub const FID_MF: u16 = 0x3F00;
/// Path component meaning "current DF", never a real file identifier.
pub const FID_CURRENT: u16 = 0x3FFF;
/// Reserved by ISO 7816-4, never a real file identifier.
pub const FID_RESERVED: u16 = 0xFFFF;

/// Life cycle "operational, activated".
pub const LIFE_CYCLE_OPERATIONAL: u8 = 0x05;

/// How WRITE BINARY combines new data with the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteCoding {
    /// One-time write: plain store.
    #[default]
    OneTime,
    /// Proprietary coding: exclusive or.
    Xor,
    /// Logical or.
    Or,
    /// Logical and.
    And,
}

impl WriteCoding {
    /// Decode from the data-coding byte's write-behaviour bits.
    pub fn from_data_coding(byte: u8) -> Self {
        match (byte >> 5) & 0x03 {
            0 => WriteCoding::OneTime,
            1 => WriteCoding::Xor,
            2 => WriteCoding::Or,
            _ => WriteCoding::And,
        }
    }

    pub fn apply(self, stored: u8, incoming: u8) -> u8 {
        match self {
            WriteCoding::OneTime => incoming,
            WriteCoding::Xor => stored ^ incoming,
            WriteCoding::Or => stored | incoming,
            WriteCoding::And => stored & incoming,
        }
    }
}

/// One record of a record-structured file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier, 1..=0xFE. 0 marks "no identifier".
    pub identifier: u8,
    #[serde(with = "crate::bytes")]
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(identifier: u8, data: Vec<u8>) -> Result<Self, StructureError> {
        if identifier == 0x00 || identifier == 0xFF {
            return Err(StructureError::BadRecordIdentifier(identifier));
        }
        Ok(Self { identifier, data })
    }

    /// A record without an identifier, addressable by number only.
    pub fn unnumbered(data: Vec<u8>) -> Self {
        Self {
            identifier: 0,
            data,
        }
    }
}

/// Fields common to every file kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub fid: u16,
    /// Short file identifier, 1..=30.
    pub short_fid: Option<u8>,
    pub life_cycle: u8,
    /// File descriptor byte as reported in the FCP.
    pub descriptor: u8,
    /// Extra bytes appended verbatim to a rendered FCI.
    pub extra_fci: Vec<u8>,
    /// BER-TLV data objects, ordered, addressed by GET/PUT DATA.
    pub data_objects: Vec<(u32, Vec<u8>)>,
    /// SIMPLE-TLV data objects.
    pub simple_objects: Vec<(u8, Vec<u8>)>,
}

impl FileHeader {
    pub fn new(fid: u16, descriptor: u8) -> Self {
        Self {
            fid,
            short_fid: None,
            life_cycle: LIFE_CYCLE_OPERATIONAL,
            descriptor,
            extra_fci: Vec::new(),
            data_objects: Vec::new(),
            simple_objects: Vec::new(),
        }
    }

    pub fn with_short_fid(mut self, short_fid: u8) -> Result<Self, StructureError> {
        if !(1..=30).contains(&short_fid) {
            return Err(StructureError::BadShortFid(short_fid));
        }
        self.short_fid = Some(short_fid);
        Ok(self)
    }
}

/// The structure-specific part of a file. Fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileBody {
    /// A DF: ordered children, optional application name.
    Dedicated {
        name: Option<Vec<u8>>,
        children: Vec<NodeId>,
    },
    /// A transparent EF: flat byte buffer with an optional capacity.
    Transparent {
        #[serde(with = "crate::bytes")]
        data: Vec<u8>,
        capacity: Option<usize>,
        write_coding: WriteCoding,
    },
    /// A record EF.
    Record {
        records: Vec<Record>,
        /// All records share this size when set.
        fixed_size: Option<usize>,
        cyclic: bool,
        /// Index of the current record.
        cursor: Option<usize>,
    },
}

/// One node of the file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub header: FileHeader,
    /// Back-reference; `None` only on the MF.
    pub parent: Option<NodeId>,
    pub body: FileBody,
}

impl FileNode {
    /// A dedicated file. The name, when given, is 1..=16 bytes.
    pub fn dedicated(
        header: FileHeader,
        name: Option<Vec<u8>>,
    ) -> Result<Self, StructureError> {
        if let Some(name) = &name {
            if name.is_empty() || name.len() > 16 {
                return Err(StructureError::BadDfName(name.len()));
            }
        }
        Ok(Self {
            header,
            parent: None,
            body: FileBody::Dedicated {
                name,
                children: Vec::new(),
            },
        })
    }

    /// A transparent file preloaded with `data`.
    pub fn transparent(header: FileHeader, data: Vec<u8>, capacity: Option<usize>) -> Self {
        let write_coding = WriteCoding::default();
        Self {
            header,
            parent: None,
            body: FileBody::Transparent {
                data,
                capacity,
                write_coding,
            },
        }
    }

    /// A record file. `fixed_size` constrains every record when set.
    pub fn record(
        header: FileHeader,
        records: Vec<Record>,
        fixed_size: Option<usize>,
        cyclic: bool,
    ) -> Result<Self, StructureError> {
        if let Some(size) = fixed_size {
            if let Some(record) = records.iter().find(|r| r.data.len() != size) {
                return Err(StructureError::RecordSizeMismatch {
                    fixed: size,
                    got: record.data.len(),
                });
            }
        }
        Ok(Self {
            header,
            parent: None,
            body: FileBody::Record {
                records,
                fixed_size,
                cyclic,
                cursor: None,
            },
        })
    }

    pub fn is_df(&self) -> bool {
        matches!(self.body, FileBody::Dedicated { .. })
    }

    /// The application name of a DF.
    pub fn df_name(&self) -> Option<&[u8]> {
        match &self.body {
            FileBody::Dedicated { name, .. } => name.as_deref(),
            _ => None,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.body {
            FileBody::Dedicated { children, .. } => children,
            _ => &[],
        }
    }
}
