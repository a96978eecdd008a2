//! Capability pattern parsing and matching.
//!
//! A capability string is parsed once, at grant time, into a
//! [`CapabilityPattern`]: an optional category/permission qualifier plus a
//! [`ResourcePattern`] variant. Matching never touches the filesystem and
//! never canonicalizes; callers pass canonical resources.
//!
//! Accepted shapes:
//!
//! ```text
//! file.read                          category + permission, any resource
//! file.read:/data/*                  one path segment under /data
//! file.read:/data/**                 recursive under /data
//! file.write:**/cache/*.json         any depth, filename pattern
//! network.https:*.example.com        one subdomain label
//! system:time:read                   system resource + permission
//! /logs/app[0-9].log                 bare resource pattern
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::InvalidPatternError;
use super::Category;

/// Path separator: `*` never crosses it, `**` does.
const SEPARATOR: char = '/';

/// Stateless entry point for "does this resource satisfy this pattern?".
pub struct PatternMatcher;

impl PatternMatcher {
    /// Total, side-effect-free match. A pattern that does not parse matches
    /// nothing.
    pub fn matches(pattern: &str, resource: &str) -> bool {
        match CapabilityPattern::parse(pattern) {
            Ok(parsed) => parsed.matches_resource(resource),
            Err(_) => false,
        }
    }

    /// Like [`matches`](Self::matches), reading an unqualified pattern as
    /// belonging to `category` (so `*.example.com` is one label for network).
    pub fn matches_for(pattern: &str, category: Category, resource: &str) -> bool {
        match CapabilityPattern::parse_for(pattern, category) {
            Ok(parsed) => parsed.matches_resource(resource),
            Err(_) => false,
        }
    }
}

/// One element of a general glob.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GlobToken {
    Literal(char),
    Class(CharClass),
    /// `*`: any run of characters except the separator.
    Star,
    /// `**`: any run of characters, separators included.
    DoubleStar,
    /// Leading `*.` on a host: exactly one non-empty DNS label.
    Label,
}

/// `[abc]` / `[0-9a-f]`: exactly one character from the set.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CharClass {
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, c: char) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi)
    }
}

/// Shape of the resource part of a pattern, decided at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePattern {
    /// `*` alone.
    Any,
    /// No wildcard at all.
    Exact(String),
    /// Trailing single `*`: the prefix plus one segment.
    Prefix(String),
    /// Trailing `**`: everything under the prefix.
    Recursive(String),
    /// Anything else (char classes, inner wildcards, subdomain labels).
    Glob(GlobPattern),
}

/// Opaque tokenized glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    tokens: Vec<GlobToken>,
}

impl ResourcePattern {
    pub fn matches(&self, resource: &str) -> bool {
        match self {
            ResourcePattern::Any => true,
            ResourcePattern::Exact(exact) => exact == resource,
            ResourcePattern::Prefix(prefix) => resource
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| !rest.contains(SEPARATOR)),
            ResourcePattern::Recursive(prefix) => resource.starts_with(prefix.as_str()),
            ResourcePattern::Glob(glob) => {
                let input: Vec<char> = resource.chars().collect();
                glob_match(&glob.tokens, &input)
            }
        }
    }

    fn parse(
        source: &str,
        resource: &str,
        category: Option<Category>,
    ) -> Result<Self, InvalidPatternError> {
        if resource.is_empty() {
            return Err(InvalidPatternError::new(source, "empty resource pattern"));
        }
        if let Some(c) = resource
            .chars()
            .find(|c| c.is_control() || c.is_whitespace())
        {
            return Err(InvalidPatternError::new(
                source,
                format!("control or whitespace character {c:?} in pattern"),
            ));
        }
        if resource.contains("***") {
            return Err(InvalidPatternError::new(
                source,
                "more than two consecutive '*'",
            ));
        }
        if resource == "*" {
            return Ok(ResourcePattern::Any);
        }

        let stars = resource.matches('*').count();
        let has_class = resource.contains('[');

        if stars == 0 && !has_class {
            return Ok(ResourcePattern::Exact(resource.to_string()));
        }
        if !has_class {
            if stars == 2 {
                if let Some(prefix) = resource.strip_suffix("**") {
                    return Ok(ResourcePattern::Recursive(prefix.to_string()));
                }
            }
            if stars == 1 {
                if let Some(prefix) = resource.strip_suffix('*') {
                    return Ok(ResourcePattern::Prefix(prefix.to_string()));
                }
            }
        }

        let tokens = tokenize(source, resource, category)?;
        Ok(ResourcePattern::Glob(GlobPattern { tokens }))
    }
}

fn tokenize(
    source: &str,
    resource: &str,
    category: Option<Category>,
) -> Result<Vec<GlobToken>, InvalidPatternError> {
    let chars: Vec<char> = resource.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(GlobToken::DoubleStar);
                i += 2;
            }
            '*' => {
                let at_host_start = i == 0 || ends_with_scheme(&tokens);
                let label = category == Some(Category::Network)
                    && at_host_start
                    && chars.get(i + 1) == Some(&'.');
                tokens.push(if label { GlobToken::Label } else { GlobToken::Star });
                i += 1;
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| i + 1 + offset)
                    .ok_or_else(|| InvalidPatternError::new(source, "unterminated '['"))?;
                let class = parse_class(source, &chars[i + 1..close])?;
                tokens.push(GlobToken::Class(class));
                i = close + 1;
            }
            c => {
                tokens.push(GlobToken::Literal(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// True if the literal tokens so far end in `://`.
fn ends_with_scheme(tokens: &[GlobToken]) -> bool {
    let tail: Vec<char> = tokens
        .iter()
        .rev()
        .take(3)
        .filter_map(|t| match t {
            GlobToken::Literal(c) => Some(*c),
            _ => None,
        })
        .collect();
    tail == [SEPARATOR, SEPARATOR, ':']
}

fn parse_class(source: &str, body: &[char]) -> Result<CharClass, InvalidPatternError> {
    if body.is_empty() {
        return Err(InvalidPatternError::new(source, "empty character class '[]'"));
    }

    let mut ranges = Vec::new();
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == '-' {
            let (lo, hi) = (body[i], body[i + 2]);
            if lo > hi {
                return Err(InvalidPatternError::new(
                    source,
                    format!("reversed range '{lo}-{hi}'"),
                ));
            }
            ranges.push((lo, hi));
            i += 3;
        } else {
            ranges.push((body[i], body[i]));
            i += 1;
        }
    }

    Ok(CharClass { ranges })
}

fn glob_match(tokens: &[GlobToken], input: &[char]) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return input.is_empty();
    };

    match token {
        GlobToken::Literal(c) => input.first() == Some(c) && glob_match(rest, &input[1..]),
        GlobToken::Class(class) => {
            input.first().is_some_and(|c| class.contains(*c)) && glob_match(rest, &input[1..])
        }
        GlobToken::Star => {
            for i in 0..=input.len() {
                if glob_match(rest, &input[i..]) {
                    return true;
                }
                if i < input.len() && input[i] == SEPARATOR {
                    break;
                }
            }
            false
        }
        GlobToken::DoubleStar => (0..=input.len()).any(|i| glob_match(rest, &input[i..])),
        GlobToken::Label => {
            for i in 1..=input.len() {
                if matches!(input[i - 1], '.' | SEPARATOR) {
                    break;
                }
                if glob_match(rest, &input[i..]) {
                    return true;
                }
            }
            false
        }
    }
}

/// A parsed capability string.
///
/// Serializes as its source text; deserializing re-parses and rejects
/// malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityPattern {
    source: String,
    category: Option<Category>,
    permission: Option<String>,
    resource: ResourcePattern,
}

impl CapabilityPattern {
    pub fn parse(pattern: &str) -> Result<Self, InvalidPatternError> {
        Self::parse_scoped(pattern, None)
    }

    /// Parses a pattern granted for `category`. A qualifier in the pattern
    /// still wins; `category` only decides how an unqualified resource is
    /// tokenized.
    pub fn parse_for(pattern: &str, category: Category) -> Result<Self, InvalidPatternError> {
        Self::parse_scoped(pattern, Some(category))
    }

    fn parse_scoped(
        pattern: &str,
        scope: Option<Category>,
    ) -> Result<Self, InvalidPatternError> {
        if pattern.is_empty() {
            return Err(InvalidPatternError::new(pattern, "empty pattern"));
        }

        let (category, permission, resource) = split_qualifier(pattern)?;
        let resource = ResourcePattern::parse(pattern, resource, category.or(scope))?;

        Ok(Self {
            source: pattern.to_string(),
            category,
            permission,
            resource,
        })
    }

    /// The text this pattern was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Category from the qualifier, if the pattern carried one.
    pub fn category(&self) -> Option<Category> {
        self.category
    }

    /// Permission from the qualifier, if the pattern carried one.
    pub fn permission(&self) -> Option<&str> {
        self.permission.as_deref()
    }

    pub fn resource(&self) -> &ResourcePattern {
        &self.resource
    }

    pub fn matches_resource(&self, resource: &str) -> bool {
        self.resource.matches(resource)
    }
}

impl TryFrom<String> for CapabilityPattern {
    type Error = InvalidPatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CapabilityPattern> for String {
    fn from(pattern: CapabilityPattern) -> Self {
        pattern.source
    }
}

impl fmt::Display for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

pub(crate) fn is_permission_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Splits `category.permission[:resource]` / `system:resource:permission`.
/// Anything without a known category prefix is a bare resource pattern.
fn split_qualifier(
    pattern: &str,
) -> Result<(Option<Category>, Option<String>, &str), InvalidPatternError> {
    if let Some(rest) = pattern.strip_prefix("system:") {
        let (resource, permission) = rest.rsplit_once(':').ok_or_else(|| {
            InvalidPatternError::new(pattern, "expected 'system:<resource>:<permission>'")
        })?;
        if !is_permission_name(permission) {
            return Err(InvalidPatternError::new(
                pattern,
                format!("invalid permission '{permission}'"),
            ));
        }
        return Ok((Some(Category::System), Some(permission.to_string()), resource));
    }

    let (head, resource) = match pattern.split_once(':') {
        Some((head, resource)) => (head, Some(resource)),
        None => (pattern, None),
    };

    let Some((category, permission)) = head.split_once('.') else {
        return Ok((None, None, pattern));
    };
    let Some(category) = Category::parse(category) else {
        return Ok((None, None, pattern));
    };
    if !is_permission_name(permission) {
        return Err(InvalidPatternError::new(
            pattern,
            format!("invalid permission '{permission}' in qualifier"),
        ));
    }

    Ok((
        Some(category),
        Some(permission.to_string()),
        resource.unwrap_or("*"),
    ))
}
