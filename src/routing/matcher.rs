//! Route template compilation and structural matching.
//!
//! # Responsibilities
//! - Compile a path template into an anchored regex
//! - Record the typed placeholders in template order
//! - Compute the specificity score used for tie-breaking
//! - Bind captured segments into typed parameters
//!
//! # Design Decisions
//! - Literal text is escaped; each placeholder captures exactly one path segment
//! - Scores: literal 100, wildcard 50, minus 10 when any placeholder is present
//! - Structural matching and conversion are separate steps so that conversion
//!   only runs for the winning candidate

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::OnceLock;

use axum::http::Method;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::routing::params::{ParamError, ParamType, RouteParams};
use crate::routing::registry::RouteError;

/// Template that matches every path at the lowest priority.
pub const WILDCARD: &str = "*";

const LITERAL_SCORE: i32 = 100;
const WILDCARD_SCORE: i32 = 50;
const PLACEHOLDER_PENALTY: i32 = 10;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"<(?P<type>[^:<>/]+):(?P<name>[^<>/]+)>").expect("placeholder pattern is valid")
    })
}

fn is_valid_param_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// A typed placeholder declared in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub param_type: ParamType,
}

/// A compiled route template. Immutable once built.
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    pattern: String,
    regex: Option<Regex>,
    placeholders: Vec<Placeholder>,
    score: i32,
    methods: HashSet<Method>,
}

/// Raw captures of a successful structural match, in placeholder order.
#[derive(Debug)]
pub struct RawMatch<'p> {
    segments: Vec<&'p str>,
}

impl RouteTemplate {
    /// Compile a template for the given method set.
    pub fn compile(pattern: &str, methods: &[Method]) -> Result<Self, RouteError> {
        let methods: HashSet<Method> = methods.iter().cloned().collect();
        if methods.is_empty() {
            return Err(RouteError::NoMethods(pattern.to_string()));
        }

        if pattern == WILDCARD {
            return Ok(Self {
                pattern: pattern.to_string(),
                regex: None,
                placeholders: Vec::new(),
                score: WILDCARD_SCORE,
                methods,
            });
        }

        if !pattern.starts_with('/') {
            return Err(RouteError::InvalidTemplate {
                template: pattern.to_string(),
                reason: "must start with '/' or be the wildcard '*'".to_string(),
            });
        }

        let mut placeholders = Vec::new();
        let mut source = String::from("^");
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(pattern) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let tag = &caps["type"];
            let name = &caps["name"];

            let param_type = ParamType::from_tag(tag).ok_or_else(|| RouteError::UnknownType {
                template: pattern.to_string(),
                type_tag: tag.to_string(),
            })?;

            if !is_valid_param_name(name) {
                return Err(RouteError::InvalidTemplate {
                    template: pattern.to_string(),
                    reason: format!("invalid parameter name '{}'", name),
                });
            }
            if placeholders.iter().any(|p: &Placeholder| p.name == name) {
                return Err(RouteError::DuplicateParam {
                    template: pattern.to_string(),
                    name: name.to_string(),
                });
            }

            source.push_str(&regex::escape(&pattern[last..whole.start]));
            source.push_str("([^/]+)");
            last = whole.end;

            placeholders.push(Placeholder {
                name: name.to_string(),
                param_type,
            });
        }

        source.push_str(&regex::escape(&pattern[last..]));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| RouteError::InvalidTemplate {
            template: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let score = if placeholders.is_empty() {
            LITERAL_SCORE
        } else {
            LITERAL_SCORE - PLACEHOLDER_PENALTY
        };

        Ok(Self {
            pattern: pattern.to_string(),
            regex: Some(regex),
            placeholders,
            score,
            methods,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn is_wildcard(&self) -> bool {
        self.regex.is_none()
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }

    /// Structural match only; no conversion happens here.
    pub fn match_path<'p>(&self, path: &'p str) -> Option<RawMatch<'p>> {
        let Some(regex) = &self.regex else {
            return Some(RawMatch { segments: Vec::new() });
        };

        let caps = regex.captures(path)?;
        let segments = caps
            .iter()
            .skip(1)
            .map(|m| m.map_or("", |m| m.as_str()))
            .collect();
        Some(RawMatch { segments })
    }

    /// Convert every captured segment. All-or-nothing: the first failure is returned.
    pub fn bind(&self, raw: &RawMatch<'_>) -> Result<RouteParams, ParamError> {
        let mut params = RouteParams::new();

        for (placeholder, segment) in self.placeholders.iter().zip(raw.segments.iter()) {
            let invalid = || ParamError {
                name: placeholder.name.clone(),
                param_type: placeholder.param_type,
                raw: segment.to_string(),
            };

            let decoded: Cow<'_, str> = percent_decode_str(segment)
                .decode_utf8()
                .map_err(|_| invalid())?;

            let value = placeholder
                .param_type
                .convert(&decoded)
                .ok_or_else(|| ParamError {
                    raw: decoded.to_string(),
                    ..invalid()
                })?;

            params.insert(placeholder.name.clone(), value);
        }

        Ok(params)
    }
}
