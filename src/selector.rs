//! CSS selector parsing and matching.
//!
//! Supports the subset needed to bind modules to markup: selector lists,
//! descendant and child combinators, type/universal selectors, `#id`,
//! `.class`, and attribute selectors (`[a]`, `=`, `~=`, `^=`, `$=`, `*=`).
//! Pseudo-classes and sibling combinators are rejected at parse time rather
//! than silently ignored.

use std::fmt;

use crate::error::ConfigurationError;
use crate::host::{DocumentHost, ElementSnapshot, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Equals,
    Includes,
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrSelector {
    name: String,
    test: Option<(AttrOp, String)>,
}

impl AttrSelector {
    fn matches(&self, el: &ElementSnapshot) -> bool {
        let Some(actual) = el.attribute(&self.name) else {
            return false;
        };
        match &self.test {
            None => true,
            Some((AttrOp::Equals, v)) => actual == v,
            Some((AttrOp::Includes, v)) => actual.split_whitespace().any(|w| w == v),
            Some((AttrOp::Prefix, v)) => !v.is_empty() && actual.starts_with(v.as_str()),
            Some((AttrOp::Suffix, v)) => !v.is_empty() && actual.ends_with(v.as_str()),
            Some((AttrOp::Substring, v)) => !v.is_empty() && actual.contains(v.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrSelector>,
}

impl Compound {
    fn matches(&self, el: &ElementSnapshot) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != el.tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.id() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| el.classes().any(|have| have == c)) {
            return false;
        }
        self.attrs.iter().all(|a| a.matches(el))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

/// Compounds left-to-right; `combinators[i]` sits between `compounds[i]` and `compounds[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    compounds: Vec<Compound>,
    combinators: Vec<Combinator>,
}

impl Complex {
    fn matches(&self, doc: &dyn DocumentHost, node: NodeId, scope: NodeId) -> bool {
        self.match_at(self.compounds.len() - 1, doc, node, scope)
    }

    fn match_at(&self, idx: usize, doc: &dyn DocumentHost, node: NodeId, scope: NodeId) -> bool {
        let Some(el) = doc.element(node) else {
            return false;
        };
        if !self.compounds[idx].matches(&el) {
            return false;
        }
        if idx == 0 {
            return true;
        }

        // Combinators resolve within the scope; the scope root itself never matches.
        let parent_in_scope = |n: NodeId| doc.parent(n).filter(|p| *p != scope);
        match self.combinators[idx - 1] {
            Combinator::Child => {
                parent_in_scope(node).is_some_and(|p| self.match_at(idx - 1, doc, p, scope))
            }
            Combinator::Descendant => {
                let mut cursor = parent_in_scope(node);
                while let Some(ancestor) = cursor {
                    if self.match_at(idx - 1, doc, ancestor, scope) {
                        return true;
                    }
                    cursor = parent_in_scope(ancestor);
                }
                false
            }
        }
    }
}

/// A parsed selector list.
///
/// # Examples
///
/// ```
/// use lazymatch::Selector;
///
/// let sel = Selector::parse("main > .lazy-card, [data-widget]").unwrap();
/// assert_eq!(sel.source(), "main > .lazy-card, [data-widget]");
/// assert!(Selector::parse("a:hover").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

impl Selector {
    /// Parses a selector list.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSelector` on any syntax outside the
    /// supported grammar.
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidSelector {
            selector: source.to_string(),
            reason,
        };

        if source.trim().is_empty() {
            return Err(invalid("selector is empty".to_string()));
        }

        let mut alternatives = Vec::new();
        for part in split_top_level(source).map_err(&invalid)? {
            if part.trim().is_empty() {
                return Err(invalid("empty selector in list".to_string()));
            }
            alternatives.push(Parser::new(part).complex().map_err(&invalid)?);
        }

        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    /// The selector text as supplied.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if `node` matches any selector in the list.
    #[must_use]
    pub fn matches(&self, doc: &dyn DocumentHost, node: NodeId, scope: NodeId) -> bool {
        self.alternatives.iter().any(|c| c.matches(doc, node, scope))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_top_level(source: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string".to_string());
    }
    parts.push(&source[start..]);
    Ok(parts)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.trim().chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn complex(&mut self) -> Result<Complex, String> {
        let mut compounds = vec![self.compound()?];
        let mut combinators = Vec::new();

        loop {
            let saw_ws = self.skip_ws();
            let Some(c) = self.peek() else { break };
            let combinator = match c {
                '>' => {
                    self.pos += 1;
                    self.skip_ws();
                    Combinator::Child
                }
                '+' | '~' => return Err(format!("unsupported combinator '{c}'")),
                _ if saw_ws => Combinator::Descendant,
                _ => return Err(format!("unexpected character '{c}'")),
            };
            if self.peek().is_none() {
                return Err("dangling combinator".to_string());
            }
            combinators.push(combinator);
            compounds.push(self.compound()?);
        }

        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn compound(&mut self) -> Result<Compound, String> {
        let start = self.pos;
        let mut out = Compound::default();

        match self.peek() {
            Some('*') => self.pos += 1,
            Some(c) if is_ident_start(c) => out.tag = Some(self.ident()?.to_ascii_lowercase()),
            _ => {}
        }

        while let Some(c) = self.peek() {
            match c {
                '#' => {
                    self.pos += 1;
                    out.id = Some(self.ident()?);
                }
                '.' => {
                    self.pos += 1;
                    out.classes.push(self.ident()?);
                }
                '[' => {
                    self.pos += 1;
                    out.attrs.push(self.attribute()?);
                }
                ':' => return Err("pseudo-classes are not supported".to_string()),
                _ => break,
            }
        }

        if self.pos == start {
            return match self.peek() {
                Some(c) => Err(format!("unexpected character '{c}'")),
                None => Err("expected a selector".to_string()),
            };
        }
        Ok(out)
    }

    fn attribute(&mut self) -> Result<AttrSelector, String> {
        self.skip_ws();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_ws();

        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some(']'), _) => {
                self.pos += 1;
                return Ok(AttrSelector { name, test: None });
            }
            (Some('='), _) => {
                self.pos += 1;
                AttrOp::Equals
            }
            (Some(c), Some('=')) => {
                let op = match c {
                    '~' => AttrOp::Includes,
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    '*' => AttrOp::Substring,
                    _ => return Err(format!("unknown attribute operator '{c}='")),
                };
                self.pos += 2;
                op
            }
            (Some(c), _) => return Err(format!("unexpected character '{c}' in attribute selector")),
            (None, _) => return Err("unterminated attribute selector".to_string()),
        };

        self.skip_ws();
        let value = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let begin = self.pos;
                while self.peek().is_some_and(|c| c != q) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err("unterminated string".to_string());
                }
                let v: String = self.chars[begin..self.pos].iter().collect();
                self.pos += 1;
                v
            }
            _ => self.ident()?,
        };
        self.skip_ws();

        if self.peek() != Some(']') {
            return Err("unterminated attribute selector".to_string());
        }
        self.pos += 1;

        Ok(AttrSelector {
            name,
            test: Some((op, value)),
        })
    }

    fn ident(&mut self) -> Result<String, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        match self.peek() {
            Some(c) if is_ident_start(c) && c != '-' => self.pos += 1,
            Some(c) => return Err(format!("expected identifier, found '{c}'")),
            None => return Err("expected identifier".to_string()),
        }
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '-'
}
