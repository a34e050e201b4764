//! Namespace-aware element tree used for every LoST document.
//!
//! The parser resolves namespace prefixes through a binding stack so that
//! documents arriving with arbitrary prefixes compare equal to the trees we
//! build ourselves. The serializer emits the LoST namespace as the default
//! namespace and the GML namespace under the `gml` prefix; the prefix is
//! fixed because `ST_AsGML` output embedded in service boundaries is
//! re-parsed against it.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::errors::LostError;
use crate::{GML_NAMESPACE, LOST_NAMESPACE, XML_NAMESPACE};

const WRITE: &str = "writing to an in-memory buffer cannot fail";

/// A single XML element with its namespace resolved to a URI.
///
/// Text content and child elements are kept separately; LoST documents never
/// interleave the two. `xmlns` declarations are consumed at parse time and
/// re-created at serialization time, so they never appear in `attrs`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub ns: Option<String>,
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(ns: &str, name: &str) -> Self {
        Element {
            ns: Some(ns.to_string()),
            name: name.to_string(),
            ..Element::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn is(&self, ns: &str, name: &str) -> bool {
        self.ns.as_deref() == Some(ns) && self.name == name
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn find(&self, ns: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(ns, name))
    }

    pub fn find_all<'a>(
        &'a self,
        ns: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.is(ns, name))
    }

    /// Serialize with an XML declaration, suitable for an HTTP body.
    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 4);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect(WRITE);
        self.write_into(&mut writer, true);
        let bytes = writer.into_inner().into_inner();
        String::from_utf8(bytes).expect("serializer emits UTF-8")
    }

    /// Serialize without an XML declaration, namespaces declared on this
    /// element. Used for geometry fragments handed to `ST_GeomFromGML`.
    pub fn to_fragment(&self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.write_into(&mut writer, true);
        let bytes = writer.into_inner().into_inner();
        String::from_utf8(bytes).expect("serializer emits UTF-8")
    }

    fn qualified_name(&self) -> String {
        match self.ns.as_deref() {
            Some(GML_NAMESPACE) => format!("gml:{}", self.name),
            Some(XML_NAMESPACE) => format!("xml:{}", self.name),
            _ => self.name.clone(),
        }
    }

    fn write_into(&self, writer: &mut Writer<Cursor<Vec<u8>>>, declare: bool) {
        let name = self.qualified_name();
        let mut start = BytesStart::new(name.as_str());
        if declare {
            match self.ns.as_deref() {
                Some(LOST_NAMESPACE) => {
                    start.push_attribute(("xmlns", LOST_NAMESPACE));
                    start.push_attribute(("xmlns:gml", GML_NAMESPACE));
                }
                Some(GML_NAMESPACE) => {
                    start.push_attribute(("xmlns:gml", GML_NAMESPACE));
                }
                _ => {}
            }
        }
        for (key, value) in &self.attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            writer.write_event(Event::Empty(start)).expect(WRITE);
            return;
        }

        writer.write_event(Event::Start(start)).expect(WRITE);
        if !self.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&self.text)))
                .expect(WRITE);
        }
        for child in &self.children {
            child.write_into(writer, false);
        }
        writer
            .write_event(Event::End(BytesEnd::new(name.as_str())))
            .expect(WRITE);
    }
}

fn syntax_error(e: impl std::fmt::Display) -> LostError {
    LostError::BadRequest(format!("XML syntax error: {}", e))
}

/// Collect attributes and namespace bindings of an opening tag and resolve
/// its name. Pushes the tag's binding scope; the caller pops it when the
/// element closes.
fn open_element(
    start: &BytesStart<'_>,
    scopes: &mut Vec<Vec<(String, String)>>,
) -> Result<Element, LostError> {
    let mut bindings: Vec<(String, String)> = Vec::new();
    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(syntax_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(syntax_error)?.into_owned();
        if key == "xmlns" {
            bindings.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            bindings.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }
    scopes.push(bindings);

    let raw = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let (prefix, local) = match raw.split_once(':') {
        Some((p, l)) => (p.to_string(), l.to_string()),
        None => (String::new(), raw),
    };
    Ok(Element {
        ns: resolve_ns(scopes, &prefix),
        name: local,
        attrs,
        text: String::new(),
        children: Vec::new(),
    })
}

fn resolve_ns(scopes: &[Vec<(String, String)>], prefix: &str) -> Option<String> {
    for scope in scopes.iter().rev() {
        if let Some((_, uri)) = scope.iter().rev().find(|(p, _)| p == prefix) {
            if uri.is_empty() {
                return None;
            }
            return Some(uri.clone());
        }
    }
    None
}

/// Parse a document into an [`Element`] tree.
///
/// Malformed input is reported as `badRequest`; the caller decides whether
/// that maps to a protocol error or a `serverError` (client side).
pub fn parse(input: &str) -> Result<Element, LostError> {
    let mut reader = Reader::from_str(input);

    let mut scopes: Vec<Vec<(String, String)>> =
        vec![vec![("xml".to_string(), XML_NAMESPACE.to_string())]];
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(syntax_error)? {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(syntax_error("content after document root"));
                }
                let element = open_element(&start, &mut scopes)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(syntax_error("content after document root"));
                }
                let element = open_element(&start, &mut scopes)?;
                scopes.pop();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::End(_) => {
                scopes.pop();
                let element = stack
                    .pop()
                    .ok_or_else(|| syntax_error("unexpected closing tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(syntax_error)?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(element) = stack.last_mut() {
                        element.text.push_str(trimmed);
                    }
                }
            }
            Event::CData(data) => {
                if let Some(element) = stack.last_mut() {
                    element
                        .text
                        .push_str(String::from_utf8_lossy(&data).trim());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(syntax_error("unexpected end of document"));
    }
    root.ok_or_else(|| syntax_error("empty document"))
}
