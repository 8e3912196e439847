//! Minimal owned XML element tree for SOAP and WebDAV responses.
//!
//! Both protocols return small documents that are easier to query as a tree
//! than as an event stream. Namespace prefixes are dropped; elements and
//! attributes are matched by local name.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Raised when a response body is not well-formed XML.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("malformed XML: {0}")]
pub struct XmlError(pub String);

/// One parsed element with its attributes, text, and children.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    /// Local name of the element.
    pub name: String,
    /// Attributes as `(local name, unescaped value)` pairs.
    pub attributes: Vec<(String, String)>,
    /// Concatenated, unescaped text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Parses `xml` and returns a synthetic document node whose children are
    /// the top-level elements.
    ///
    /// # Errors
    ///
    /// Returns [`XmlError`] when the document is malformed or unbalanced.
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack = vec![Self::default()];
        loop {
            match reader.read_event().map_err(|err| XmlError(err.to_string()))? {
                Event::Start(start) => stack.push(Self::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    attach(&mut stack, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError(String::from("unexpected closing tag")))?;
                    attach(&mut stack, element)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(|err| XmlError(err.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&value);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(document), true) => Ok(document),
            _ => Err(XmlError(String::from("unclosed element at end of document"))),
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut attributes = Vec::new();
        for parsed in start.attributes() {
            let attribute = parsed.map_err(|err| XmlError(err.to_string()))?;
            let value = attribute
                .unescape_value()
                .map_err(|err| XmlError(err.to_string()))?;
            attributes.push((
                String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned(),
                value.into_owned(),
            ));
        }

        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            text: String::new(),
            children: Vec::new(),
        })
    }

    /// Returns the first direct child named `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Returns every direct child named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Returns the first element named `name` in depth-first order, including
    /// `self`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Self> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Returns the value of the attribute named `name`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the trimmed text content.
    #[must_use]
    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

fn attach(stack: &mut [Element], element: Element) -> Result<(), XmlError> {
    stack
        .last_mut()
        .ok_or_else(|| XmlError(String::from("unexpected closing tag")))?
        .children
        .push(element);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let doc = Element::parse(
            r#"<a:root xmlns:a="urn:x"><a:item type="Folder">group-d1</a:item><a:item/></a:root>"#,
        )
        .expect("document should parse");

        let root = doc.child("root").expect("root element");
        let items: Vec<_> = root.children_named("item").collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items.first().and_then(|item| item.attribute("type")), Some("Folder"));
        assert_eq!(items.first().map(|item| item.text()), Some("group-d1"));
    }

    #[test]
    fn unescapes_text() {
        let doc = Element::parse("<m>a &amp; b</m>").expect("document should parse");
        assert_eq!(doc.find("m").map(Element::text), Some("a & b"));
    }

    #[test]
    fn rejects_unbalanced_documents() {
        assert!(Element::parse("<a><b></a>").is_err());
    }
}
