//! Match rules: the immutable configuration binding a selector in a scope to
//! a deferred module import.
//!
//! Rules are created through [`ModuleMatchInit`], which validates every query
//! up front. Selector and scope never change after creation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::host::{IntersectionEntry, NodeId};
use crate::import::PendingModule;
use crate::query::{ContainerQuery, MediaQueryList, RootMargin};
use crate::selector::Selector;
use crate::tracker::MatchedElement;

/// Unique identifier for a registered rule.
///
/// Import single-flight is keyed by this identity, never by selector text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Create a new random rule id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When the module import may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingMode {
    /// Honor the activation policy.
    #[default]
    Lazy,
    /// Import at registration and activate every match immediately.
    Eager,
}

/// Whether an element can activate more than once.
///
/// Callbacks fire at most once per (rule, element) pair either way; this only
/// controls whether repeated `Activated` events are emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationRepeat {
    /// First activation only.
    #[default]
    Once,
    /// Every time the condition becomes true again.
    EveryEntry,
}

/// Raw intersection observer options as supplied by the caller.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IntersectionObserverInit {
    pub root: Option<NodeId>,
    pub root_margin: Option<String>,
    pub threshold: Vec<f64>,
}

/// Validated intersection options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionOptions {
    /// Element whose box is the viewport for visibility; `None` is the host viewport.
    pub root: Option<NodeId>,
    /// Margin grown around the root before computing intersection.
    pub root_margin: RootMargin,
    /// Visibility ratios that count as a crossing, ascending.
    pub thresholds: Vec<f64>,
}

impl Default for IntersectionOptions {
    fn default() -> Self {
        Self {
            root: None,
            root_margin: RootMargin::default(),
            thresholds: vec![0.0],
        }
    }
}

impl IntersectionOptions {
    /// Validates raw options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidThreshold` for ratios outside `[0, 1]` and
    /// `InvalidRootMargin` for malformed margins.
    pub fn from_init(init: &IntersectionObserverInit) -> Result<Self, ConfigurationError> {
        let root_margin = match &init.root_margin {
            Some(m) => RootMargin::parse(m)?,
            None => RootMargin::default(),
        };

        let mut thresholds = init.threshold.clone();
        if let Some(bad) = thresholds
            .iter()
            .copied()
            .find(|t| !(0.0..=1.0).contains(t))
        {
            return Err(ConfigurationError::InvalidThreshold { value: bad });
        }
        if thresholds.is_empty() {
            thresholds.push(0.0);
        }
        thresholds.sort_by(f64::total_cmp);
        thresholds.dedup();

        Ok(Self {
            root: init.root,
            root_margin,
            thresholds,
        })
    }

    /// Returns true if `entry` crosses the lowest configured threshold.
    #[must_use]
    pub fn is_satisfied(&self, entry: &IntersectionEntry) -> bool {
        let min = self.thresholds.first().copied().unwrap_or(0.0);
        entry.is_intersecting && entry.ratio >= min
    }
}

/// Conditions an element must satisfy before it activates.
///
/// Every configured condition must hold at the same time. A policy with no
/// conditions is immediate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationPolicy {
    /// Visibility condition.
    pub intersection: Option<IntersectionOptions>,
    /// Environment condition.
    pub media: Option<MediaQueryList>,
    /// Nearest-container condition.
    pub container: Option<ContainerQuery>,
}

impl ActivationPolicy {
    /// True when no condition is configured.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.intersection.is_none() && self.media.is_none() && self.container.is_none()
    }
}

/// Error type callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a rule callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Produces the module. Invoked at most once per rule.
pub type ImportProducer<M> = Box<dyn FnOnce() -> PendingModule<M>>;

/// Optional activation predicate (`doCallbackIf`).
pub type Predicate<M> = Box<dyn Fn(&M, &MatchedElement) -> bool>;

/// Optional callback (`callBack`).
pub type Callback<M> = Box<dyn Fn(&M, &MatchedElement) -> CallbackResult>;

/// A validated, immutable match rule.
pub struct MatchRule<M> {
    id: RuleId,
    selector: Selector,
    scope: NodeId,
    policy: ActivationPolicy,
    loading: LoadingMode,
    repeat: ActivationRepeat,
    link_id: Option<String>,
    predicate: Option<Predicate<M>>,
    callback: Option<Callback<M>>,
}

impl<M> MatchRule<M> {
    /// Creates a new rule builder.
    #[must_use]
    pub fn builder() -> ModuleMatchInit<M> {
        ModuleMatchInit::new()
    }

    /// Rule identity.
    #[must_use]
    pub const fn id(&self) -> RuleId {
        self.id
    }

    /// Parsed selector.
    #[must_use]
    pub const fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Scope root.
    #[must_use]
    pub const fn scope(&self) -> NodeId {
        self.scope
    }

    /// Activation conditions.
    #[must_use]
    pub const fn policy(&self) -> &ActivationPolicy {
        &self.policy
    }

    /// Loading mode.
    #[must_use]
    pub const fn loading(&self) -> LoadingMode {
        self.loading
    }

    /// Re-activation policy.
    #[must_use]
    pub const fn repeat(&self) -> ActivationRepeat {
        self.repeat
    }

    /// Correlation identifier shared with related rules.
    #[must_use]
    pub fn link_id(&self) -> Option<&str> {
        self.link_id.as_deref()
    }

    pub(crate) fn predicate(&self) -> Option<&Predicate<M>> {
        self.predicate.as_ref()
    }

    pub(crate) fn callback(&self) -> Option<&Callback<M>> {
        self.callback.as_ref()
    }
}

impl<M> fmt::Debug for MatchRule<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRule")
            .field("id", &self.id)
            .field("selector", &self.selector.source())
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .field("loading", &self.loading)
            .field("repeat", &self.repeat)
            .field("link_id", &self.link_id)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Builder for match rules, mirroring the registration surface.
///
/// ```
/// use lazymatch::{InMemoryHost, MatchRule, PendingModule};
///
/// let host = InMemoryHost::new();
/// let (rule, _producer) = MatchRule::<&str>::builder()
///     .selector(".lazy-card")
///     .root_node(host.root())
///     .import(|| PendingModule::resolved("card module"))
///     .media_matches("(min-width: 768px)")
///     .build()
///     .unwrap();
/// assert_eq!(rule.selector().source(), ".lazy-card");
/// ```
pub struct ModuleMatchInit<M> {
    selector: Option<String>,
    root_node: Option<NodeId>,
    import: Option<ImportProducer<M>>,
    intersection: Option<IntersectionObserverInit>,
    media_matches: Option<String>,
    container_query: Option<String>,
    loading: LoadingMode,
    repeat: ActivationRepeat,
    predicate: Option<Predicate<M>>,
    callback: Option<Callback<M>>,
    link_id: Option<String>,
}

impl<M> Default for ModuleMatchInit<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ModuleMatchInit<M> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            selector: None,
            root_node: None,
            import: None,
            intersection: None,
            media_matches: None,
            container_query: None,
            loading: LoadingMode::Lazy,
            repeat: ActivationRepeat::Once,
            predicate: None,
            callback: None,
            link_id: None,
        }
    }

    /// CSS selector to match (`match`).
    #[must_use]
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Subtree root the selector is evaluated within (`rootNode`).
    #[must_use]
    pub fn root_node(mut self, node: NodeId) -> Self {
        self.root_node = Some(node);
        self
    }

    /// Module producer (`import`).
    #[must_use]
    pub fn import(mut self, producer: impl FnOnce() -> PendingModule<M> + 'static) -> Self {
        self.import = Some(Box::new(producer));
        self
    }

    /// Intersection activation (`intersectionObserverInit`).
    #[must_use]
    pub fn intersection_observer_init(mut self, init: IntersectionObserverInit) -> Self {
        self.intersection = Some(init);
        self
    }

    /// Media activation (`mediaMatches`).
    #[must_use]
    pub fn media_matches(mut self, query: impl Into<String>) -> Self {
        self.media_matches = Some(query.into());
        self
    }

    /// Container activation (`containerQuery`).
    #[must_use]
    pub fn container_query(mut self, query: impl Into<String>) -> Self {
        self.container_query = Some(query.into());
        self
    }

    /// Loading mode (`loading`).
    #[must_use]
    pub fn loading(mut self, loading: LoadingMode) -> Self {
        self.loading = loading;
        self
    }

    /// Re-activation policy.
    #[must_use]
    pub fn repeat(mut self, repeat: ActivationRepeat) -> Self {
        self.repeat = repeat;
        self
    }

    /// Predicate gating the callback (`doCallbackIf`).
    #[must_use]
    pub fn do_callback_if(mut self, predicate: impl Fn(&M, &MatchedElement) -> bool + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Callback invoked once per activated element (`callBack`).
    #[must_use]
    pub fn call_back(mut self, callback: impl Fn(&M, &MatchedElement) -> CallbackResult + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Correlation identifier (`linkID`).
    #[must_use]
    pub fn link_id(mut self, link_id: impl Into<String>) -> Self {
        self.link_id = Some(link_id.into());
        self
    }

    /// Validates the configuration and splits off the import producer, which
    /// the import gate owns from then on.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for missing required fields or invalid
    /// selector, query, margin, or threshold syntax.
    pub fn build(self) -> Result<(MatchRule<M>, ImportProducer<M>), ConfigurationError> {
        let missing = |field: &str| ConfigurationError::MissingField {
            field: field.to_string(),
        };

        let selector = Selector::parse(&self.selector.ok_or_else(|| missing("match"))?)?;
        let scope = self.root_node.ok_or_else(|| missing("rootNode"))?;
        let producer = self.import.ok_or_else(|| missing("import"))?;

        let policy = ActivationPolicy {
            intersection: self
                .intersection
                .as_ref()
                .map(IntersectionOptions::from_init)
                .transpose()?,
            media: self
                .media_matches
                .as_deref()
                .map(MediaQueryList::parse)
                .transpose()?,
            container: self
                .container_query
                .as_deref()
                .map(ContainerQuery::parse)
                .transpose()?,
        };

        let rule = MatchRule {
            id: RuleId::new(),
            selector,
            scope,
            policy,
            loading: self.loading,
            repeat: self.repeat,
            link_id: self.link_id,
            predicate: self.predicate,
            callback: self.callback,
        };
        Ok((rule, producer))
    }
}
