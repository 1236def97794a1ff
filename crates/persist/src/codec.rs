//! Payload codec: snapshot document <-> compressed bytes.
//!
//! Layout of a payload before compression:
//! ```text
//! [tag: u8][encoded document]
//!   'C' CBOR     (dense binary)
//!   'J' JSON     (structured text)
//!   'Y' YAML     (structured text)
//!   'X' XML      (tag/attribute document)
//! ```
//! The whole buffer is zstd-compressed. Decoding reads the tag after
//! decompression, so the format never has to be stored alongside the payload.

use crate::error::CodecError;
use crate::xml;
use palimpsest_common::{Document, Node, Value};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// zstd level used for every payload.
const COMPRESSION_LEVEL: i32 = 3;

/// Encoding of the snapshot document inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Cbor,
    Json,
    Yaml,
    Xml,
}

impl Format {
    pub const ALL: [Format; 4] = [Format::Cbor, Format::Json, Format::Yaml, Format::Xml];

    pub fn tag(self) -> u8 {
        match self {
            Self::Cbor => b'C',
            Self::Json => b'J',
            Self::Yaml => b'Y',
            Self::Xml => b'X',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            b'C' => Ok(Self::Cbor),
            b'J' => Ok(Self::Json),
            b'Y' => Ok(Self::Yaml),
            b'X' => Ok(Self::Xml),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cbor => "cbor",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Xml => "xml",
        }
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown format {s:?} (expected cbor, json, yaml or xml)"))
    }
}

/// Encode and compress a document.
pub fn encode(doc: &Document, format: Format) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![format.tag()];
    match format {
        Format::Cbor => {
            ciborium::into_writer(doc, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?
        }
        Format::Json => {
            if let Some(field) = non_finite_field(doc) {
                return Err(CodecError::NonFiniteFloat(field));
            }
            serde_json::to_writer(&mut buf, doc)?
        }
        Format::Yaml => serde_yaml::to_writer(&mut buf, doc)?,
        Format::Xml => buf.extend(xml::to_xml(doc)?),
    }
    zstd_compress(&buf)
}

/// Path of the first NaN or infinite float in `doc`. JSON writes these as
/// `null`, which would no longer decode as a float.
fn non_finite_field(doc: &Document) -> Option<String> {
    doc.iter().find_map(|(name, node)| match node {
        Node::Value(Value::Float(x)) if !x.is_finite() => Some(name.clone()),
        Node::Record(child) => non_finite_field(child).map(|field| format!("{name}.{field}")),
        Node::Records(children) => children
            .iter()
            .enumerate()
            .find_map(|(i, child)| non_finite_field(child).map(|field| format!("{name}[{i}].{field}"))),
        _ => None,
    })
}

/// Decompress and decode a payload produced by [`encode`].
pub fn decode(payload: &[u8]) -> Result<Document, CodecError> {
    let raw = zstd_decompress(payload)?;
    let (&tag, body) = raw.split_first().ok_or(CodecError::Empty)?;
    match Format::from_tag(tag)? {
        Format::Cbor => ciborium::from_reader(body).map_err(|e| CodecError::CborDecode(e.to_string())),
        Format::Json => Ok(serde_json::from_slice(body)?),
        Format::Yaml => Ok(serde_yaml::from_slice(body)?),
        Format::Xml => xml::from_xml(body),
    }
}

/// The format a payload was encoded with.
pub fn detect(payload: &[u8]) -> Result<Format, CodecError> {
    let raw = zstd_decompress(payload)?;
    raw.first().map_or(Err(CodecError::Empty), |&tag| Format::from_tag(tag))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), COMPRESSION_LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}
