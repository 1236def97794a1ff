//! Tag/attribute encoding of a snapshot document.
//!
//! ```text
//! <revision>
//!   <f n="title" k="text">Hello</f>
//!   <f n="author" k="null"/>
//!   <f n="cover" k="record"><f n="url" k="text">a.png</f></f>
//!   <f n="comments" k="records"><doc>...</doc><doc>...</doc></f>
//!   <f n="tags" k="ids"><id><key k="int">3</key></id></f>
//! </revision>
//! ```
//! The writer emits no indentation. The reader tolerates whitespace between
//! elements but never trims leaf text.

use crate::error::CodecError;
use chrono::{DateTime, SecondsFormat, Utc};
use palimpsest_common::{Document, Key, Node, SubjectId, Value};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::fmt::Display;

const ROOT: &str = "revision";

fn xml_err(e: impl Display) -> CodecError {
    CodecError::Xml(e.to_string())
}

pub(crate) fn to_xml(doc: &Document) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    write_wrapped(&mut writer, BytesStart::new(ROOT), ROOT, doc)?;
    Ok(writer.into_inner())
}

fn write_wrapped(
    w: &mut Writer<Vec<u8>>,
    start: BytesStart<'_>,
    tag: &str,
    doc: &Document,
) -> Result<(), CodecError> {
    w.write_event(Event::Start(start)).map_err(xml_err)?;
    for (name, node) in doc.iter() {
        write_node(w, name, node)?;
    }
    w.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_err)?;
    Ok(())
}

fn write_leaf(w: &mut Writer<Vec<u8>>, start: BytesStart<'_>, tag: &str, text: &str) -> Result<(), CodecError> {
    w.write_event(Event::Start(start)).map_err(xml_err)?;
    if !text.is_empty() {
        w.write_event(Event::Text(BytesText::new(text))).map_err(xml_err)?;
    }
    w.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_err)?;
    Ok(())
}

fn kind_of(node: &Node) -> &'static str {
    match node {
        Node::Value(Value::Null) => "null",
        Node::Value(Value::Bool(_)) => "bool",
        Node::Value(Value::Int(_)) => "int",
        Node::Value(Value::Float(_)) => "float",
        Node::Value(Value::Text(_)) => "text",
        Node::Value(Value::Timestamp(_)) => "time",
        Node::Record(_) => "record",
        Node::Records(_) => "records",
        Node::Ids(_) => "ids",
    }
}

fn write_node(w: &mut Writer<Vec<u8>>, name: &str, node: &Node) -> Result<(), CodecError> {
    let start = BytesStart::new("f").with_attributes([("n", name), ("k", kind_of(node))]);
    match node {
        Node::Value(Value::Null) => w.write_event(Event::Empty(start)).map_err(xml_err),
        Node::Value(Value::Bool(b)) => write_leaf(w, start, "f", &b.to_string()),
        Node::Value(Value::Int(i)) => write_leaf(w, start, "f", &i.to_string()),
        Node::Value(Value::Float(x)) => write_leaf(w, start, "f", &x.to_string()),
        Node::Value(Value::Text(s)) => write_leaf(w, start, "f", s),
        Node::Value(Value::Timestamp(t)) => {
            write_leaf(w, start, "f", &t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        Node::Record(doc) => write_wrapped(w, start, "f", doc),
        Node::Records(docs) => {
            w.write_event(Event::Start(start)).map_err(xml_err)?;
            for doc in docs {
                write_wrapped(w, BytesStart::new("doc"), "doc", doc)?;
            }
            w.write_event(Event::End(BytesEnd::new("f"))).map_err(xml_err)
        }
        Node::Ids(ids) => {
            w.write_event(Event::Start(start)).map_err(xml_err)?;
            for id in ids {
                w.write_event(Event::Start(BytesStart::new("id"))).map_err(xml_err)?;
                for key in id.components() {
                    let (kind, text) = match key {
                        Key::Int(i) => ("int", i.to_string()),
                        Key::Text(s) => ("text", s.clone()),
                    };
                    let start = BytesStart::new("key").with_attributes([("k", kind)]);
                    write_leaf(w, start, "key", &text)?;
                }
                w.write_event(Event::End(BytesEnd::new("id"))).map_err(xml_err)?;
            }
            w.write_event(Event::End(BytesEnd::new("f"))).map_err(xml_err)
        }
    }
}

pub(crate) fn from_xml(bytes: &[u8]) -> Result<Document, CodecError> {
    let mut parser = Parser {
        reader: Reader::from_reader(bytes),
    };
    match parser.next_tag()? {
        Tag::Open(e) if e.name().as_ref() == ROOT.as_bytes() => parser.fields(),
        Tag::Empty(e) if e.name().as_ref() == ROOT.as_bytes() => Ok(Document::new()),
        _ => Err(CodecError::Xml(format!("expected <{ROOT}> root element"))),
    }
}

enum Tag<'a> {
    Open(BytesStart<'a>),
    Empty(BytesStart<'a>),
    Close,
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    /// Next structural event, skipping declarations, comments and
    /// whitespace between elements.
    fn next_tag(&mut self) -> Result<Tag<'a>, CodecError> {
        loop {
            match self.reader.read_event().map_err(xml_err)? {
                Event::Start(e) => return Ok(Tag::Open(e)),
                Event::Empty(e) => return Ok(Tag::Empty(e)),
                Event::End(_) => return Ok(Tag::Close),
                Event::Text(t) if t.iter().all(u8::is_ascii_whitespace) => continue,
                Event::Text(_) | Event::CData(_) => {
                    return Err(CodecError::Xml("unexpected text between elements".into()));
                }
                Event::Eof => return Err(CodecError::Xml("unexpected end of document".into())),
                _ => continue,
            }
        }
    }

    /// Leaf text up to and including the closing tag.
    fn text(&mut self) -> Result<String, CodecError> {
        let mut out = String::new();
        loop {
            match self.reader.read_event().map_err(xml_err)? {
                Event::Text(t) => out.push_str(&t.unescape().map_err(xml_err)?),
                Event::CData(c) => out.push_str(std::str::from_utf8(&c).map_err(xml_err)?),
                Event::End(_) => return Ok(out),
                Event::Start(_) | Event::Empty(_) => {
                    return Err(CodecError::Xml("unexpected element inside a scalar field".into()));
                }
                Event::Eof => return Err(CodecError::Xml("unexpected end of document".into())),
                _ => continue,
            }
        }
    }

    /// `<f>` children up to and including the parent's closing tag.
    fn fields(&mut self) -> Result<Document, CodecError> {
        let mut doc = Document::new();
        loop {
            let (start, open) = match self.next_tag()? {
                Tag::Close => return Ok(doc),
                Tag::Open(e) => (e, true),
                Tag::Empty(e) => (e, false),
            };
            expect_name(&start, "f")?;
            let name = attribute(&start, "n")?;
            let kind = attribute(&start, "k")?;
            let node = if open { self.node(&kind)? } else { empty_node(&kind)? };
            doc.insert(name, node);
        }
    }

    fn node(&mut self, kind: &str) -> Result<Node, CodecError> {
        let value = match kind {
            "null" => {
                self.text()?;
                Value::Null
            }
            "bool" => Value::Bool(self.text()?.parse().map_err(xml_err)?),
            "int" => Value::Int(self.text()?.parse().map_err(xml_err)?),
            "float" => Value::Float(self.text()?.parse().map_err(xml_err)?),
            "text" => Value::Text(self.text()?),
            "time" => {
                let text = self.text()?;
                let parsed = DateTime::parse_from_rfc3339(&text).map_err(xml_err)?;
                Value::Timestamp(parsed.with_timezone(&Utc))
            }
            "record" => return Ok(Node::Record(self.fields()?)),
            "records" => {
                let mut docs = Vec::new();
                loop {
                    match self.next_tag()? {
                        Tag::Close => return Ok(Node::Records(docs)),
                        Tag::Open(e) => {
                            expect_name(&e, "doc")?;
                            docs.push(self.fields()?);
                        }
                        Tag::Empty(e) => {
                            expect_name(&e, "doc")?;
                            docs.push(Document::new());
                        }
                    }
                }
            }
            "ids" => {
                let mut ids = Vec::new();
                loop {
                    match self.next_tag()? {
                        Tag::Close => return Ok(Node::Ids(ids)),
                        Tag::Open(e) => {
                            expect_name(&e, "id")?;
                            ids.push(self.id()?);
                        }
                        Tag::Empty(e) => {
                            expect_name(&e, "id")?;
                            ids.push(SubjectId(Vec::new()));
                        }
                    }
                }
            }
            other => return Err(CodecError::Xml(format!("unknown field kind {other:?}"))),
        };
        Ok(Node::Value(value))
    }

    fn id(&mut self) -> Result<SubjectId, CodecError> {
        let mut keys = Vec::new();
        loop {
            let (start, open) = match self.next_tag()? {
                Tag::Close => return Ok(SubjectId(keys)),
                Tag::Open(e) => (e, true),
                Tag::Empty(e) => (e, false),
            };
            expect_name(&start, "key")?;
            let text = if open { self.text()? } else { String::new() };
            keys.push(match attribute(&start, "k")?.as_str() {
                "int" => Key::Int(text.parse().map_err(xml_err)?),
                "text" => Key::Text(text),
                other => return Err(CodecError::Xml(format!("unknown key kind {other:?}"))),
            });
        }
    }
}

fn empty_node(kind: &str) -> Result<Node, CodecError> {
    Ok(match kind {
        "null" => Node::Value(Value::Null),
        "text" => Node::Value(Value::Text(String::new())),
        "record" => Node::Record(Document::new()),
        "records" => Node::Records(Vec::new()),
        "ids" => Node::Ids(Vec::new()),
        other => return Err(CodecError::Xml(format!("empty {other} field"))),
    })
}

fn expect_name(e: &BytesStart<'_>, name: &str) -> Result<(), CodecError> {
    if e.name().as_ref() == name.as_bytes() {
        Ok(())
    } else {
        Err(CodecError::Xml(format!(
            "expected <{name}>, found <{}>",
            String::from_utf8_lossy(e.name().as_ref())
        )))
    }
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<String, CodecError> {
    let attr = e
        .try_get_attribute(key)
        .map_err(xml_err)?
        .ok_or_else(|| {
            CodecError::Xml(format!(
                "<{}> is missing attribute {key:?}",
                String::from_utf8_lossy(e.name().as_ref())
            ))
        })?;
    Ok(attr.unescape_value().map_err(xml_err)?.into_owned())
}
