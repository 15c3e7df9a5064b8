//! Small owned XML tree on top of quick-xml.
//!
//! Feed entries are kept as whole elements so they can be written back into the
//! channel cache untouched, including fields this tool never reads.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Element {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Parse a whole document and return its root element.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    return Err(Error::Xml(format!(
                        "at byte {}: {}",
                        reader.error_position(),
                        e
                    )));
                }
            };
            match event {
                XmlEvent::Start(e) => stack.push(start_element(&e)?),
                XmlEvent::Empty(e) => {
                    let element = start_element(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                XmlEvent::End(_) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced closing tag".into()))?;
                    drop_layout_text(&mut element);
                    attach(&mut stack, &mut root, element)?;
                }
                XmlEvent::Text(e) => {
                    push_text(&mut stack, &decode_entities(&String::from_utf8_lossy(&e)));
                }
                XmlEvent::CData(e) => push_text(&mut stack, &String::from_utf8_lossy(&e)),
                XmlEvent::GeneralRef(e) => {
                    let reference = format!("&{};", String::from_utf8_lossy(&e));
                    push_text(&mut stack, &decode_entities(&reference));
                }
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::Xml(format!("unclosed element <{}>", stack[stack.len() - 1].name)));
        }
        root.ok_or_else(|| Error::Xml("document has no root element".into()))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Follows a slash separated list of child names, e.g. `head/meta`.
    pub fn path(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |current, segment| current.child(segment))
    }

    /// Every element below this one, depth first, not including itself.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut found = Vec::new();
        for child in self.elements() {
            found.push(child);
            found.extend(child.descendants());
        }
        found
    }

    /// Direct text of this element, trimmed.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                text.push_str(t);
            }
        }
        text.trim().to_string()
    }

    /// All attribute values and text found in this subtree, space separated.
    pub fn text_content(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        collect_text(self, &mut parts);
        parts.join(" ")
    }

    pub fn write_into<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            writer
                .write_event(XmlEvent::Empty(start))
                .map_err(|e| Error::Xml(e.to_string()))?;
            return Ok(());
        }

        writer
            .write_event(XmlEvent::Start(start))
            .map_err(|e| Error::Xml(e.to_string()))?;
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_into(writer)?,
                Node::Text(t) => writer
                    .write_event(XmlEvent::Text(BytesText::new(t)))
                    .map_err(|e| Error::Xml(e.to_string()))?,
            }
        }
        writer
            .write_event(XmlEvent::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| Error::Xml(e.to_string()))?;
        Ok(())
    }

    /// Serializes this element as a standalone document with an xml declaration.
    pub fn to_document(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| Error::Xml(e.to_string()))?;
        self.write_into(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| Error::Xml(e.to_string()))
    }
}

fn collect_text<'a>(element: &'a Element, parts: &mut Vec<&'a str>) {
    for (_, value) in &element.attributes {
        parts.push(value);
    }
    for node in &element.children {
        match node {
            Node::Element(e) => collect_text(e, parts),
            Node::Text(t) => parts.push(t.trim()),
        }
    }
}

fn start_element(e: &BytesStart) -> Result<Element> {
    let mut element = Element::new(&String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = decode_entities(&String::from_utf8_lossy(&attr.value));
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::Xml("more than one root element".into())),
    }
    Ok(())
}

// references arrive as separate events, so a lone space may sit between two of them
fn push_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        if let Some(Node::Text(existing)) = parent.children.last_mut() {
            existing.push_str(text);
        } else {
            parent.children.push(Node::Text(text.to_string()));
        }
    }
}

/// Whitespace-only runs left once the element is complete sit between child
/// elements and are layout, not content.
fn drop_layout_text(element: &mut Element) {
    element
        .children
        .retain(|node| !matches!(node, Node::Text(t) if t.trim().is_empty()));
}

/// Decodes the predefined entities and numeric character references.
pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}
