//! Minimal element tree over `quick-xml`, enough to read SOAP responses.
//!
//! Namespace prefixes are dropped: elements are matched by local name.

use std::borrow::Cow;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{FiscalError, FiscalResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn named(name: &[u8]) -> Self {
        Element {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Default::default()
        }
    }

    /// Parses a document and returns its root element.
    pub fn parse(xml: &str) -> FiscalResult<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        // Synthetic document node at the bottom of the stack.
        let mut stack = vec![Element::default()];

        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(Element::named(e.local_name().as_ref())),
                Event::Empty(e) => {
                    let element = Element::named(e.local_name().as_ref());
                    top(&mut stack)?.children.push(element);
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(unbalanced)?;
                    top(&mut stack)?.children.push(element);
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    top(&mut stack)?.text.push_str(&text);
                }
                Event::CData(c) => {
                    let raw = c.into_inner();
                    top(&mut stack)?.text.push_str(&String::from_utf8_lossy(&raw));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(unbalanced());
        }
        stack
            .pop()
            .and_then(|document| document.children.into_iter().next())
            .ok_or_else(|| FiscalError::transport("parse response", "empty XML document"))
    }

    /// Trimmed text content of this element.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text)
    }

    /// First descendant (depth-first, self included) with the given name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Follows a chain of direct children.
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |el, name| el.child(name))
    }

    /// The SOAP fault carried by this envelope, if any.
    pub fn fault(&self) -> Option<SoapFault> {
        let fault = self.find("Fault")?;
        Some(SoapFault {
            code: fault.child_text("faultcode").unwrap_or_default().to_string(),
            message: fault.child_text("faultstring").unwrap_or_default().to_string(),
        })
    }
}

fn top(stack: &mut [Element]) -> FiscalResult<&mut Element> {
    stack.last_mut().ok_or_else(unbalanced)
}

fn unbalanced() -> FiscalError {
    FiscalError::transport("parse response", "unbalanced XML document")
}

/// A SOAP 1.1 fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Escapes text for inclusion in an element body.
pub fn escape(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}
