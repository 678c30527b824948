//! Media query, container query, and root margin parsing.
//!
//! Queries are parsed once at registration so that syntax errors surface as
//! `ConfigurationError`s. Evaluation against a concrete environment is
//! side-effect free; hosts call it from their own primitives.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::host::ContainerInfo;

const AND_PATTERN: &str = r"(?i)\s+and\s+";
const FEATURE_PATTERN: &str = r"^\(\s*([A-Za-z-]+)\s*(?::\s*([^()]*?))?\s*\)$";
const LENGTH_PATTERN: &str = r"^(\d+(?:\.\d+)?)(px|em|rem)?$";
const MARGIN_PATTERN: &str = r"^(-?\d+(?:\.\d+)?)(px|%)?$";
const CONTAINER_HEAD_PATTERN: &str =
    r"^(?i:@container\s+)?(?:([A-Za-z_][A-Za-z0-9_-]*)\s*)?(\(.*)$";

static REGEX_CACHE: OnceLock<RwLock<HashMap<&'static str, Regex>>> = OnceLock::new();

/// Compiles `pattern` on first use and hands out cheap clones afterwards.
fn cached_regex(pattern: &'static str) -> Result<Regex, String> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| "regex cache lock poisoned".to_string())?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
    let mut guard = cache
        .write()
        .map_err(|_| "regex cache lock poisoned".to_string())?;
    guard.insert(pattern, compiled.clone());
    Ok(compiled)
}

/// CSS reference pixel size of `1em`/`1rem` used for length conversion.
const EM_PX: f64 = 16.0;

/// Which box dimension a size condition constrains.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Width,
    Height,
}

/// Comparison applied by a size condition.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Min,
    Max,
    Exact,
}

/// `(min-width: 768px)` and friends.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeCondition {
    pub dimension: Dimension,
    pub bound: Bound,
    pub px: f64,
}

impl SizeCondition {
    fn from_feature(name: &str, value: &str) -> Option<Result<Self, String>> {
        let (bound, dimension) = match name {
            "min-width" => (Bound::Min, Dimension::Width),
            "max-width" => (Bound::Max, Dimension::Width),
            "width" => (Bound::Exact, Dimension::Width),
            "min-height" => (Bound::Min, Dimension::Height),
            "max-height" => (Bound::Max, Dimension::Height),
            "height" => (Bound::Exact, Dimension::Height),
            _ => return None,
        };
        Some(parse_length(value).map(|px| Self { dimension, bound, px }))
    }

    /// Evaluates the condition against a box size.
    #[must_use]
    pub fn evaluate(&self, width: f64, height: f64) -> bool {
        let actual = match self.dimension {
            Dimension::Width => width,
            Dimension::Height => height,
        };
        match self.bound {
            Bound::Min => actual >= self.px,
            Bound::Max => actual <= self.px,
            Bound::Exact => (actual - self.px).abs() < f64::EPSILON,
        }
    }
}

fn parse_length(value: &str) -> Result<f64, String> {
    let caps = cached_regex(LENGTH_PATTERN)?
        .captures(value.trim())
        .ok_or_else(|| format!("invalid length '{value}'"))?;
    let number: f64 = caps[1]
        .parse()
        .map_err(|_| format!("invalid length '{value}'"))?;
    match caps.get(2).map(|m| m.as_str()) {
        Some("px") => Ok(number),
        Some(_) => Ok(number * EM_PX),
        None if number == 0.0 => Ok(0.0),
        None => Err(format!("length '{value}' requires a unit")),
    }
}

/// Media type of a query or an environment.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    All,
    Screen,
    Print,
}

/// Viewport orientation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

/// Preferred color scheme.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
}

/// The media environment a query is evaluated against.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFeatures {
    pub media_type: MediaType,
    pub width: f64,
    pub height: f64,
    pub color_scheme: ColorScheme,
    pub reduced_motion: bool,
}

impl Default for MediaFeatures {
    fn default() -> Self {
        Self {
            media_type: MediaType::Screen,
            width: 1024.0,
            height: 768.0,
            color_scheme: ColorScheme::Light,
            reduced_motion: false,
        }
    }
}

impl MediaFeatures {
    /// Orientation derived from the viewport size.
    #[must_use]
    pub fn orientation(&self) -> Orientation {
        if self.height >= self.width {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum MediaFeature {
    Size(SizeCondition),
    Orientation(Orientation),
    ColorScheme(ColorScheme),
    ReducedMotion(bool),
}

impl MediaFeature {
    fn parse(segment: &str) -> Result<Self, String> {
        let caps = cached_regex(FEATURE_PATTERN)?
            .captures(segment)
            .ok_or_else(|| format!("malformed feature '{segment}'"))?;
        let name = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .map(|m| m.as_str().trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("feature '{name}' requires a value"))?;

        if let Some(size) = SizeCondition::from_feature(&name, &value) {
            return size.map(Self::Size);
        }
        match (name.as_str(), value.as_str()) {
            ("orientation", "portrait") => Ok(Self::Orientation(Orientation::Portrait)),
            ("orientation", "landscape") => Ok(Self::Orientation(Orientation::Landscape)),
            ("prefers-color-scheme", "light") => Ok(Self::ColorScheme(ColorScheme::Light)),
            ("prefers-color-scheme", "dark") => Ok(Self::ColorScheme(ColorScheme::Dark)),
            ("prefers-reduced-motion", "reduce") => Ok(Self::ReducedMotion(true)),
            ("prefers-reduced-motion", "no-preference") => Ok(Self::ReducedMotion(false)),
            ("orientation" | "prefers-color-scheme" | "prefers-reduced-motion", v) => {
                Err(format!("invalid value '{v}' for '{name}'"))
            }
            _ => Err(format!("unknown media feature '{name}'")),
        }
    }

    fn evaluate(&self, env: &MediaFeatures) -> bool {
        match self {
            Self::Size(c) => c.evaluate(env.width, env.height),
            Self::Orientation(o) => env.orientation() == *o,
            Self::ColorScheme(s) => env.color_scheme == *s,
            Self::ReducedMotion(r) => env.reduced_motion == *r,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MediaQuery {
    negated: bool,
    media_type: MediaType,
    features: Vec<MediaFeature>,
}

impl MediaQuery {
    fn parse(source: &str) -> Result<Self, String> {
        let source = source.trim();
        if source.is_empty() {
            return Err("empty query in list".to_string());
        }

        let mut query = Self {
            negated: false,
            media_type: MediaType::All,
            features: Vec::new(),
        };

        let and = cached_regex(AND_PATTERN)?;
        for (i, segment) in and.split(source).enumerate() {
            let mut segment = segment.trim();
            if i == 0 && !segment.starts_with('(') {
                let lower = segment.to_ascii_lowercase();
                if let Some(rest) = lower.strip_prefix("not ") {
                    query.negated = true;
                    segment = &segment[segment.len() - rest.len()..];
                } else if let Some(rest) = lower.strip_prefix("only ") {
                    segment = &segment[segment.len() - rest.len()..];
                }
                let segment = segment.trim();
                if !segment.starts_with('(') {
                    query.media_type = match segment.to_ascii_lowercase().as_str() {
                        "all" => MediaType::All,
                        "screen" => MediaType::Screen,
                        "print" => MediaType::Print,
                        other => return Err(format!("unknown media type '{other}'")),
                    };
                    continue;
                }
                query.features.push(MediaFeature::parse(segment)?);
                continue;
            }
            query.features.push(MediaFeature::parse(segment)?);
        }
        Ok(query)
    }

    fn evaluate(&self, env: &MediaFeatures) -> bool {
        let type_ok = self.media_type == MediaType::All || self.media_type == env.media_type;
        let matched = type_ok && self.features.iter().all(|f| f.evaluate(env));
        matched != self.negated
    }
}

/// A parsed, comma-separated media query list.
///
/// # Examples
///
/// ```
/// use lazymatch::{MediaFeatures, MediaQueryList};
///
/// let q = MediaQueryList::parse("screen and (min-width: 768px)").unwrap();
/// assert!(q.evaluate(&MediaFeatures::default()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MediaQueryList {
    source: String,
    queries: Vec<MediaQuery>,
}

impl MediaQueryList {
    /// Parses a media query list.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidMediaQuery` for unknown media types,
    /// unknown features, or malformed syntax.
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidMediaQuery {
            query: source.to_string(),
            reason,
        };
        if source.trim().is_empty() {
            return Err(invalid("media query is empty".to_string()));
        }
        let queries = source
            .split(',')
            .map(MediaQuery::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        Ok(Self {
            source: source.to_string(),
            queries,
        })
    }

    /// The query text as supplied.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True if any query in the list matches.
    #[must_use]
    pub fn evaluate(&self, env: &MediaFeatures) -> bool {
        self.queries.iter().any(|q| q.evaluate(env))
    }
}

impl fmt::Display for MediaQueryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A parsed container query: optional container name plus size conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerQuery {
    source: String,
    name: Option<String>,
    conditions: Vec<SizeCondition>,
}

impl ContainerQuery {
    /// Parses `[@container] [name] (feature) [and (feature)]*`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidContainerQuery` when the query is
    /// malformed or uses a non-size feature.
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidContainerQuery {
            query: source.to_string(),
            reason,
        };

        let caps = cached_regex(CONTAINER_HEAD_PATTERN)
            .map_err(&invalid)?
            .captures(source.trim())
            .ok_or_else(|| invalid("expected a parenthesized size condition".to_string()))?;
        let name = caps.get(1).map(|m| m.as_str().to_string());
        if name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case("and")) {
            return Err(invalid("missing container name or condition".to_string()));
        }

        let and = cached_regex(AND_PATTERN).map_err(&invalid)?;
        let feature_re = cached_regex(FEATURE_PATTERN).map_err(&invalid)?;
        let mut conditions = Vec::new();
        for segment in and.split(&caps[2]) {
            let segment = segment.trim();
            let feature = feature_re
                .captures(segment)
                .ok_or_else(|| invalid(format!("malformed condition '{segment}'")))?;
            let feature_name = feature[1].to_ascii_lowercase();
            let value = feature
                .get(2)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_default();
            let condition = SizeCondition::from_feature(&feature_name, &value)
                .ok_or_else(|| invalid(format!("unsupported container feature '{feature_name}'")))?
                .map_err(&invalid)?;
            conditions.push(condition);
        }

        Ok(Self {
            source: source.to_string(),
            name,
            conditions,
        })
    }

    /// The query text as supplied.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Required container name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true if `container` qualifies for this query by name.
    #[must_use]
    pub fn accepts(&self, container: &ContainerInfo) -> bool {
        match &self.name {
            None => true,
            Some(want) => container.name.as_deref() == Some(want.as_str()),
        }
    }

    /// Evaluates the size conditions against a qualifying container.
    #[must_use]
    pub fn evaluate(&self, container: &ContainerInfo) -> bool {
        self.conditions
            .iter()
            .all(|c| c.evaluate(container.width, container.height))
    }
}

/// One side of an intersection root margin.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum MarginLength {
    Px(f64),
    Percent(f64),
}

/// Parsed `rootMargin` (top, right, bottom, left).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootMargin {
    pub top: MarginLength,
    pub right: MarginLength,
    pub bottom: MarginLength,
    pub left: MarginLength,
}

impl Default for RootMargin {
    fn default() -> Self {
        let zero = MarginLength::Px(0.0);
        Self {
            top: zero,
            right: zero,
            bottom: zero,
            left: zero,
        }
    }
}

impl RootMargin {
    /// Parses 1 to 4 `px`/`%` lengths using CSS margin shorthand rules.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidRootMargin` on bad tokens or arity.
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidRootMargin {
            margin: source.to_string(),
            reason,
        };

        let lengths = source
            .split_whitespace()
            .map(|token| {
                let caps = cached_regex(MARGIN_PATTERN)?
                    .captures(token)
                    .ok_or_else(|| format!("invalid length '{token}'"))?;
                let n: f64 = caps[1]
                    .parse()
                    .map_err(|_| format!("invalid length '{token}'"))?;
                match caps.get(2).map(|m| m.as_str()) {
                    Some("%") => Ok(MarginLength::Percent(n)),
                    Some(_) => Ok(MarginLength::Px(n)),
                    None if n == 0.0 => Ok(MarginLength::Px(0.0)),
                    None => Err(format!("length '{token}' must be in px or %")),
                }
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(&invalid)?;

        match lengths.as_slice() {
            [all] => Ok(Self { top: *all, right: *all, bottom: *all, left: *all }),
            [v, h] => Ok(Self { top: *v, right: *h, bottom: *v, left: *h }),
            [t, h, b] => Ok(Self { top: *t, right: *h, bottom: *b, left: *h }),
            [t, r, b, l] => Ok(Self { top: *t, right: *r, bottom: *b, left: *l }),
            _ => Err(invalid(format!("expected 1 to 4 lengths, got {}", lengths.len()))),
        }
    }
}
