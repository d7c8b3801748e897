//! Flattened device tree reader
//!
//! Streams the structure block from media token by token and builds a small
//! node arena. The walk is bounded by [`ParseLimits`]: nesting depth, node
//! count, property count and name length are all capped, and every token
//! read is checked against the end of the structure block.
//!
//! Property values up to `max_inline_property` bytes are buffered; larger
//! ones (embedded payloads) are recorded only as a range on the medium so a
//! multi-megabyte kernel never has to fit in the loader's heap.

use alloc::string::String;
use alloc::vec::Vec;
use stageboot_api::MediaAccess;

use crate::boot_stage::boot_config::ParseLimits;
use crate::error::ParseError;
use crate::firmware::media_reader::WINDOW_SIZE;
use crate::firmware::MediaReader;
use crate::utils::cursor::{align_up, ByteCursor};

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_HEADER_SIZE: usize = 40;
pub const LAST_COMP_VERSION_OFFSET: usize = 24;
/// Newest layout a reader of this code can still understand
pub const FDT_LAST_COMP_VERSION: u32 = 17;
/// Oldest layout with the strings-block size field
pub const FDT_MIN_VERSION: u32 = 16;

/// Node names are read in pieces the reader can serve from its cache
const NAME_READ_SIZE: usize = WINDOW_SIZE / 2;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Device tree header (big-endian on media)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    pub fn read(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut c = ByteCursor::new(bytes);
        Ok(Self {
            magic: c.be_u32()?,
            totalsize: c.be_u32()?,
            off_dt_struct: c.be_u32()?,
            off_dt_strings: c.be_u32()?,
            off_mem_rsvmap: c.be_u32()?,
            version: c.be_u32()?,
            last_comp_version: c.be_u32()?,
            boot_cpuid_phys: c.be_u32()?,
            size_dt_strings: c.be_u32()?,
            size_dt_struct: c.be_u32()?,
        })
    }

    /// Check magic, version and that both blocks lie inside `totalsize`.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != FDT_MAGIC {
            return Err(ParseError::BadMagic);
        }
        if self.version < FDT_MIN_VERSION {
            return Err(ParseError::UnsupportedVersion(self.version));
        }
        if self.last_comp_version > FDT_LAST_COMP_VERSION {
            return Err(ParseError::UnsupportedVersion(self.last_comp_version));
        }
        let total = self.totalsize as u64;
        let struct_end = self.off_dt_struct as u64 + self.size_dt_struct as u64;
        let strings_end = self.off_dt_strings as u64 + self.size_dt_strings as u64;
        if (self.off_dt_struct as usize) < FDT_HEADER_SIZE
            || struct_end > total
            || strings_end > total
            || self.off_dt_struct % 4 != 0
        {
            return Err(ParseError::MalformedTree("block outside tree"));
        }
        Ok(())
    }

    /// Tree size rounded up to the 4-byte boundary external data starts at
    pub fn aligned_size(&self) -> u64 {
        (self.totalsize as u64 + 3) & !3
    }
}

/// Check an in-memory device tree blob before handing its address on.
pub fn check_blob(bytes: &[u8]) -> Result<FdtHeader, ParseError> {
    let header = FdtHeader::read(bytes)?;
    header.validate()?;
    if header.totalsize as usize > bytes.len() {
        return Err(ParseError::Truncated);
    }
    Ok(header)
}

/// Property value as found in the structure block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Inline(Vec<u8>),
    /// Too large to buffer; absolute offset/length on the medium
    Range { offset: u64, length: u64 },
}

impl PropValue {
    pub fn bytes(&self, name: &'static str) -> Result<&[u8], ParseError> {
        match self {
            PropValue::Inline(bytes) => Ok(bytes),
            PropValue::Range { .. } => Err(ParseError::MalformedProperty(name)),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            PropValue::Inline(bytes) => bytes.len() as u64,
            PropValue::Range { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_u32(&self, name: &'static str) -> Result<u32, ParseError> {
        match self.bytes(name)? {
            [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => Err(ParseError::MalformedProperty(name)),
        }
    }

    /// One- or two-cell address
    pub fn as_address(&self, name: &'static str) -> Result<u64, ParseError> {
        let bytes = self.bytes(name)?;
        match bytes.len() {
            4 => Ok(self.as_u32(name)? as u64),
            8 => {
                let mut c = ByteCursor::new(bytes);
                c.be_u64()
            }
            _ => Err(ParseError::MalformedProperty(name)),
        }
    }

    /// NUL-terminated string
    pub fn as_str(&self, name: &'static str) -> Result<&str, ParseError> {
        let bytes = self.bytes(name)?;
        let text = match bytes.split_last() {
            Some((0, text)) => text,
            _ => return Err(ParseError::MalformedProperty(name)),
        };
        if text.contains(&0) {
            return Err(ParseError::MalformedProperty(name));
        }
        core::str::from_utf8(text).map_err(|_| ParseError::MalformedProperty(name))
    }

    /// NUL-separated string list
    pub fn as_str_list(&self, name: &'static str) -> Result<Vec<&str>, ParseError> {
        let bytes = self.bytes(name)?;
        let body = match bytes.split_last() {
            Some((0, body)) => body,
            _ => return Err(ParseError::MalformedProperty(name)),
        };
        body.split(|&b| b == 0)
            .map(|s| core::str::from_utf8(s).map_err(|_| ParseError::MalformedProperty(name)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    /// Offset of the value on the medium
    pub offset: u64,
    pub value: PropValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<usize>,
}

/// Index of a node in a [`Tree`]
pub type NodeId = usize;

/// Parsed device tree; node 0 is the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub header: FdtHeader,
    nodes: Vec<Node>,
}

impl Tree {
    pub const ROOT: NodeId = 0;

    /// Walk the tree starting at offset 0 of `reader`.
    pub fn read<M: MediaAccess>(
        reader: &mut MediaReader<'_, M>,
        limits: &ParseLimits,
    ) -> Result<Self, ParseError> {
        if reader.len() < FDT_HEADER_SIZE as u64 {
            return Err(ParseError::Truncated);
        }
        let mut raw = [0u8; FDT_HEADER_SIZE];
        reader.read_exact(0, &mut raw)?;
        let header = FdtHeader::read(&raw)?;
        header.validate()?;
        if header.totalsize as u64 > reader.len() {
            return Err(ParseError::BeyondMedia {
                end: header.totalsize as u64,
                available: reader.len(),
            });
        }
        if header.size_dt_strings as usize > limits.max_strings_size {
            return Err(ParseError::TreeTooLarge);
        }
        let strings = reader.read_vec(
            header.off_dt_strings as u64,
            header.size_dt_strings as usize,
        )?;

        let mut walker = Walker {
            reader,
            limits,
            strings: &strings,
            pos: header.off_dt_struct as u64,
            end: header.off_dt_struct as u64 + header.size_dt_struct as u64,
            property_count: 0,
        };
        let nodes = walker.walk()?;
        Ok(Self { header, nodes })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id].children.iter().copied()
    }

    /// Direct child named exactly `name`
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id).find(|&c| self.nodes[c].name == name)
    }

    /// Node at an absolute path such as `/images/kernel-1`
    pub fn find(&self, path: &str) -> Option<NodeId> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(Self::ROOT, |node, part| self.child(node, part))
    }

    pub fn property(&self, id: NodeId, name: &str) -> Option<&Property> {
        self.nodes[id].properties.iter().find(|p| p.name == name)
    }

    pub fn prop(&self, id: NodeId, name: &str) -> Option<&PropValue> {
        self.property(id, name).map(|p| &p.value)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }
}

struct Walker<'r, 'a, 's, M: MediaAccess> {
    reader: &'r mut MediaReader<'a, M>,
    limits: &'s ParseLimits,
    strings: &'s [u8],
    pos: u64,
    end: u64,
    property_count: usize,
}

impl<'r, 'a, 's, M: MediaAccess> Walker<'r, 'a, 's, M> {
    fn token(&mut self) -> Result<u32, ParseError> {
        let mut word = [0u8; 4];
        self.read(&mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), ParseError> {
        let next = self.pos + buf.len() as u64;
        if next > self.end {
            return Err(ParseError::MalformedTree("structure block overrun"));
        }
        self.reader.read_cached(self.pos, buf)?;
        self.pos = next;
        Ok(())
    }

    fn align(&mut self) -> Result<(), ParseError> {
        self.pos = align_up(self.pos, 4).ok_or(ParseError::SizeOverflow)?;
        Ok(())
    }

    fn node_name(&mut self) -> Result<String, ParseError> {
        let limit = (self.limits.max_name_len as u64 + 1).min(self.end - self.pos) as usize;
        let mut buf: Vec<u8> = Vec::new();
        let mut piece = [0u8; NAME_READ_SIZE];
        let len = loop {
            let done = buf.len();
            if done == limit {
                return Err(ParseError::MalformedTree("unterminated node name"));
            }
            let n = (limit - done).min(NAME_READ_SIZE);
            self.reader.read_cached(self.pos + done as u64, &mut piece[..n])?;
            buf.extend_from_slice(&piece[..n]);
            if let Some(at) = piece[..n].iter().position(|&b| b == 0) {
                break done + at;
            }
        };
        let name = core::str::from_utf8(&buf[..len]).map_err(|_| ParseError::InvalidString)?;
        self.pos += len as u64 + 1;
        self.align()?;
        Ok(String::from(name))
    }

    fn string_at(&self, offset: u32) -> Result<String, ParseError> {
        let tail = self
            .strings
            .get(offset as usize..)
            .ok_or(ParseError::MalformedTree("property name offset"))?;
        let len = tail
            .iter()
            .take(self.limits.max_name_len + 1)
            .position(|&b| b == 0)
            .ok_or(ParseError::MalformedTree("unterminated property name"))?;
        let name = core::str::from_utf8(&tail[..len]).map_err(|_| ParseError::InvalidString)?;
        Ok(String::from(name))
    }

    fn property(&mut self) -> Result<Property, ParseError> {
        self.property_count += 1;
        if self.property_count > self.limits.max_properties {
            return Err(ParseError::TreeTooLarge);
        }
        let len = self.token()? as u64;
        let nameoff = self.token()?;
        let name = self.string_at(nameoff)?;

        let start = self.pos;
        let value_end = start.checked_add(len).ok_or(ParseError::SizeOverflow)?;
        if value_end > self.end {
            return Err(ParseError::MalformedTree("property overruns structure block"));
        }
        let value = if len as usize <= self.limits.max_inline_property {
            PropValue::Inline(self.reader.read_vec(start, len as usize)?)
        } else {
            PropValue::Range {
                offset: start,
                length: len,
            }
        };
        self.pos = value_end;
        self.align()?;
        Ok(Property {
            name,
            offset: start,
            value,
        })
    }

    fn walk(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            match self.token()? {
                FDT_BEGIN_NODE => {
                    if stack.is_empty() && !nodes.is_empty() {
                        return Err(ParseError::MalformedTree("second root node"));
                    }
                    if stack.len() >= self.limits.max_tree_depth {
                        return Err(ParseError::TreeTooDeep);
                    }
                    if nodes.len() >= self.limits.max_tree_nodes {
                        return Err(ParseError::TreeTooLarge);
                    }
                    let name = self.node_name()?;
                    let id = nodes.len();
                    nodes.push(Node {
                        name,
                        properties: Vec::new(),
                        children: Vec::new(),
                    });
                    if let Some(&parent) = stack.last() {
                        nodes[parent].children.push(id);
                    }
                    stack.push(id);
                }
                FDT_END_NODE => {
                    if stack.pop().is_none() {
                        return Err(ParseError::MalformedTree("unbalanced end node"));
                    }
                }
                FDT_PROP => {
                    let property = self.property()?;
                    let &current = stack
                        .last()
                        .ok_or(ParseError::MalformedTree("property outside node"))?;
                    nodes[current].properties.push(property);
                }
                FDT_NOP => {}
                FDT_END => {
                    if !stack.is_empty() || nodes.is_empty() {
                        return Err(ParseError::MalformedTree("unexpected end token"));
                    }
                    return Ok(nodes);
                }
                _ => return Err(ParseError::MalformedTree("unknown token")),
            }
        }
    }
}
