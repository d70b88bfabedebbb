//! Request body parsing for the known content types.
//!
//! # Responsibilities
//! - Classify the body by its `Content-Type`
//! - Parse url-encoded forms, JSON and XML
//! - Tag unknown or broken bodies instead of failing the exchange
//!
//! # Design Decisions
//! - Parsing never fails the request; handlers inspect the outcome
//! - Only UTF-8 text bodies are parsed
//! - XML is reduced to a small element tree, not a DOM

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::http::values::ValuesMap;

/// Outcome of body parsing, keyed by content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// No `Content-Type` header.
    None,
    /// A known content type with an empty body.
    Empty,
    Form(ValuesMap),
    Json(serde_json::Value),
    Xml(XmlElement),
    /// A content type outside the known set; the raw bytes stay on the context.
    Unknown(String),
    /// A known content type that failed to parse.
    Malformed { media_type: String, error: String },
}

enum Known {
    Form,
    Json,
    Xml,
}

impl ParsedBody {
    /// Parse `body` according to `content_type`.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Self {
        let Some(content_type) = content_type else {
            return ParsedBody::None;
        };

        let media: mime::Mime = match content_type.parse() {
            Ok(m) => m,
            Err(_) => return ParsedBody::Unknown(content_type.to_string()),
        };

        let (top, sub, suffix) = (media.type_(), media.subtype(), media.suffix());
        let known = if top == mime::APPLICATION && sub == mime::WWW_FORM_URLENCODED {
            Known::Form
        } else if top == mime::APPLICATION && (sub == mime::JSON || suffix == Some(mime::JSON)) {
            Known::Json
        } else if (top == mime::TEXT || top == mime::APPLICATION) && sub == mime::XML
            || suffix == Some(mime::XML)
        {
            Known::Xml
        } else {
            return ParsedBody::Unknown(media.essence_str().to_string());
        };

        if body.is_empty() {
            return ParsedBody::Empty;
        }

        let malformed = |error: String| ParsedBody::Malformed {
            media_type: media.essence_str().to_string(),
            error,
        };

        let text = match std::str::from_utf8(body) {
            Ok(t) => t,
            Err(e) => return malformed(e.to_string()),
        };

        match known {
            Known::Form => ParsedBody::Form(ValuesMap::parse(text)),
            Known::Json => match serde_json::from_str(text) {
                Ok(v) => ParsedBody::Json(v),
                Err(e) => malformed(e.to_string()),
            },
            Known::Xml => match XmlElement::parse(text) {
                Ok(root) => ParsedBody::Xml(root),
                Err(e) => malformed(e),
            },
        }
    }

    pub fn as_form(&self) -> Option<&ValuesMap> {
        match self {
            ParsedBody::Form(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ParsedBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_xml(&self) -> Option<&XmlElement> {
        match self {
            ParsedBody::Xml(v) => Some(v),
            _ => None,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            ParsedBody::None => "none",
            ParsedBody::Empty => "empty",
            ParsedBody::Form(_) => "form",
            ParsedBody::Json(_) => "json",
            ParsedBody::Xml(_) => "xml",
            ParsedBody::Unknown(_) => "unknown",
            ParsedBody::Malformed { .. } => "malformed",
        }
    }
}

impl fmt::Display for ParsedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedBody::None | ParsedBody::Empty => f.write_str("-"),
            ParsedBody::Form(v) => {
                let pairs: Vec<String> = v.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            ParsedBody::Json(v) => write!(f, "{}", v),
            ParsedBody::Xml(v) => write!(f, "<{}>", v.name),
            ParsedBody::Unknown(t) => write!(f, "<{} body>", t),
            ParsedBody::Malformed { media_type, error } => write!(f, "<malformed {}: {}>", media_type, error),
        }
    }
}

/// A parsed XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Parse a document and return its root element.
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(start) => stack.push(Self::open(&start)?),
                Event::Empty(start) => {
                    let element = Self::open(&start)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or("unbalanced closing tag")?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text.unescape().map_err(|e| e.to_string())?);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err("unclosed element".to_string());
        }
        root.ok_or_else(|| "document has no root element".to_string())
    }

    fn open(start: &BytesStart<'_>) -> Result<Self, String> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Result<(), String> {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
            Ok(())
        } else if root.is_none() {
            *root = Some(element);
            Ok(())
        } else {
            Err("multiple root elements".to_string())
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }
}
