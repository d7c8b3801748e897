//! Component tree images
//!
//! A flattened device tree whose `/images` node holds the payload blobs and
//! whose `/configurations` node names which images make up a bootable set.
//! Payload data is either embedded in a `data` property or stored after the
//! tree (`data-offset`/`data-position` + `data-size`).
//!
//! Configuration selection: build-time override, else the `default`
//! property, else the first configuration node.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use hashbrown::HashMap;
use stageboot_api::{Architecture, CompressionKind, MediaAccess};

use super::fdt::{NodeId, PropValue, Tree, FDT_MAGIC};
use super::ParseContext;
use crate::error::ParseError;
use crate::firmware::MediaReader;
use crate::kernel_if::descriptor::{
    FormatHeader, ImageDescriptor, IntegrityKind, IntegrityRecord, PayloadEntry, PayloadRole,
    Segment, TreeHeader,
};
use crate::security::digest::HashAlgorithm;
use crate::security::signature::parse_signature_algo;

/// Configuration properties that reference images, in load order
const COMPONENT_REFS: [(&str, PayloadRole); 5] = [
    ("kernel", PayloadRole::Kernel),
    ("firmware", PayloadRole::Firmware),
    ("fdt", PayloadRole::DeviceTree),
    ("ramdisk", PayloadRole::Ramdisk),
    ("loadables", PayloadRole::Loadable),
];

pub fn parse<M: MediaAccess>(
    reader: &mut MediaReader<'_, M>,
    ctx: &ParseContext<'_>,
) -> Result<ImageDescriptor, ParseError> {
    let tree = Tree::read(reader, ctx.limits)?;
    let images = tree.find("/images").ok_or(ParseError::MissingNode("/images"))?;
    let configs = tree
        .find("/configurations")
        .ok_or(ParseError::MissingNode("/configurations"))?;
    let config = select_configuration(&tree, configs, ctx.configuration)?;

    // image name -> node, for the lookups below
    let by_name: HashMap<&str, NodeId> = tree
        .children(images)
        .map(|id| (tree.name(id), id))
        .collect();

    let mut refs: Vec<(&str, PayloadRole)> = Vec::new();
    for (prop, role) in COMPONENT_REFS {
        if let Some(value) = tree.prop(config, prop) {
            for name in value.as_str_list("configuration reference")? {
                if name.is_empty() || refs.iter().any(|(n, _)| *n == name) {
                    continue;
                }
                if refs.len() == ctx.limits.max_components {
                    return Err(ParseError::TooManyComponents);
                }
                refs.push((name, role));
            }
        }
    }

    let data_base = tree.header.aligned_size();
    let mut total_size = tree.header.totalsize as u64;
    let mut payloads = Vec::with_capacity(refs.len());
    let mut integrity = Vec::new();

    for (name, role) in refs {
        let node = *by_name.get(name).ok_or(ParseError::MissingComponent)?;
        let payload = image_payload(&tree, node, name, role, data_base, ctx.arch)?;
        let end = payload.end().ok_or(ParseError::SizeOverflow)?;
        total_size = total_size.max(end);
        image_records(&tree, node, name, &payload, &mut integrity)?;
        payloads.push(payload);
    }

    let description = tree
        .prop(Tree::ROOT, "description")
        .and_then(|v| v.as_str("description").ok())
        .map(String::from);

    Ok(ImageDescriptor {
        magic: FDT_MAGIC as u64,
        version: tree.header.version,
        total_size,
        payloads,
        integrity,
        header: FormatHeader::ComponentTree(TreeHeader {
            last_comp_version: tree.header.last_comp_version,
            configuration: tree.name(config).to_string(),
            description,
        }),
    })
}

fn select_configuration(
    tree: &Tree,
    configs: NodeId,
    wanted: Option<&str>,
) -> Result<NodeId, ParseError> {
    if let Some(name) = wanted {
        return tree
            .child(configs, name)
            .ok_or(ParseError::MissingNode("requested configuration"));
    }
    if let Some(default) = tree.prop(configs, "default") {
        let name = default.as_str("default")?;
        return tree
            .child(configs, name)
            .ok_or(ParseError::MissingNode("default configuration"));
    }
    tree.children(configs)
        .next()
        .ok_or(ParseError::MissingNode("configuration"))
}

fn image_payload(
    tree: &Tree,
    node: NodeId,
    name: &str,
    role: PayloadRole,
    data_base: u64,
    arch: Architecture,
) -> Result<PayloadEntry, ParseError> {
    let (offset, length) = data_range(tree, node, data_base)?;

    if let Some(value) = tree.prop(node, "arch") {
        let image_arch = Architecture::from_tree_name(value.as_str("arch")?);
        if image_arch != Some(arch) {
            return Err(ParseError::ArchitectureMismatch);
        }
    }

    let compression = match tree.prop(node, "compression") {
        Some(value) => CompressionKind::from_name(value.as_str("compression")?)
            .ok_or(ParseError::UnsupportedCompression)?,
        None => CompressionKind::None,
    };

    let image_type = match tree.prop(node, "type") {
        Some(value) => Some(value.as_str("type")?),
        None => None,
    };

    let mut payload = PayloadEntry::new(role, offset, length);
    payload.name = Some(String::from(name));
    payload.compression = compression;
    payload.entry_point = optional_address(tree, node, "entry")?;
    payload.load_address = if image_type == Some("kernel_noload") {
        None
    } else {
        optional_address(tree, node, "load")?
    };
    Ok(payload)
}

fn optional_address(
    tree: &Tree,
    node: NodeId,
    prop: &'static str,
) -> Result<Option<u64>, ParseError> {
    tree.prop(node, prop).map(|v| v.as_address(prop)).transpose()
}

/// Location of an image's data on the medium
fn data_range(tree: &Tree, node: NodeId, data_base: u64) -> Result<(u64, u64), ParseError> {
    if let Some(data) = tree.property(node, "data") {
        return Ok((data.offset, data.value.len()));
    }

    let size = tree
        .prop(node, "data-size")
        .ok_or(ParseError::MissingProperty("data"))?
        .as_u32("data-size")? as u64;
    let offset = if let Some(position) = tree.prop(node, "data-position") {
        position.as_u32("data-position")? as u64
    } else if let Some(relative) = tree.prop(node, "data-offset") {
        data_base
            .checked_add(relative.as_u32("data-offset")? as u64)
            .ok_or(ParseError::SizeOverflow)?
    } else {
        return Err(ParseError::MissingProperty("data-offset"));
    };
    offset.checked_add(size).ok_or(ParseError::SizeOverflow)?;
    Ok((offset, size))
}

/// Collect `hash-*` and `signature-*` records of one image.
fn image_records(
    tree: &Tree,
    node: NodeId,
    image: &str,
    payload: &PayloadEntry,
    out: &mut Vec<IntegrityRecord>,
) -> Result<(), ParseError> {
    for child in tree.children(node) {
        let child_name = tree.name(child);
        let record_name = alloc::format!("{}/{}", image, child_name);

        if child_name.starts_with("hash") {
            let algo = tree
                .prop(child, "algo")
                .ok_or(ParseError::MissingProperty("algo"))?
                .as_str("algo")?;
            let algorithm = HashAlgorithm::from_name(algo).ok_or(ParseError::UnsupportedAlgorithm)?;
            let expected = required_bytes(tree.prop(child, "value"), "value")?;
            if expected.len() != algorithm.digest_len() {
                return Err(ParseError::MalformedProperty("value"));
            }
            let kind = if algorithm == HashAlgorithm::Crc32 {
                IntegrityKind::Crc32
            } else {
                IntegrityKind::Hash
            };
            out.push(IntegrityRecord::over_range(
                record_name,
                kind,
                algorithm,
                expected,
                payload.offset,
                payload.length,
            ));
        } else if child_name.starts_with("signature") {
            let algo = tree
                .prop(child, "algo")
                .ok_or(ParseError::MissingProperty("algo"))?
                .as_str("algo")?;
            let (algorithm, signature_algorithm) =
                parse_signature_algo(algo).ok_or(ParseError::UnsupportedAlgorithm)?;
            let key_id = tree
                .prop(child, "key-name-hint")
                .ok_or(ParseError::MissingProperty("key-name-hint"))?
                .as_str("key-name-hint")?;
            let expected = required_bytes(tree.prop(child, "value"), "value")?;
            out.push(IntegrityRecord {
                name: record_name,
                kind: IntegrityKind::Signature,
                algorithm,
                signature_algorithm: Some(signature_algorithm),
                expected,
                segments: alloc::vec![Segment::Media {
                    offset: payload.offset,
                    length: payload.length,
                }],
                key_id: Some(String::from(key_id)),
            });
        }
    }
    Ok(())
}

fn required_bytes(value: Option<&PropValue>, name: &'static str) -> Result<Vec<u8>, ParseError> {
    Ok(value
        .ok_or(ParseError::MissingProperty(name))?
        .bytes(name)?
        .to_vec())
}
