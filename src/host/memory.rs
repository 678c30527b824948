//! In-memory host backend.
//!
//! This module provides a thread-safe in-memory implementation of every host
//! collaborator trait. It is intended for embedded usage, tests, and as a
//! reference implementation: visibility, viewport, and container sizes are set
//! directly instead of being computed from layout.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ObservationError;
use crate::host::traits::{
    ContainerHost, ContainerInfo, DocumentHost, ElementSnapshot, IntersectionEntry,
    IntersectionHost, MediaHost, MutationKind, MutationRecord, NodeId, ObserverId,
};
use crate::query::{MediaFeatures, MediaQueryList};
use crate::rule::IntersectionOptions;

const FRAGMENT_TAG: &str = "#document-fragment";

#[derive(Debug)]
struct Node {
    element: ElementSnapshot,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    container: Option<ContainerInfo>,
    ratio: f64,
}

#[derive(Debug)]
struct MutationObserver {
    scope: NodeId,
    records: Vec<MutationRecord>,
}

#[derive(Debug, Default)]
struct VisibilityObserver {
    nodes: Vec<NodeId>,
    entries: Vec<IntersectionEntry>,
}

#[derive(Debug)]
struct HostState {
    next_id: u64,
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
    mutation_observers: HashMap<ObserverId, MutationObserver>,
    visibility_observers: HashMap<ObserverId, VisibilityObserver>,
    media: MediaFeatures,
    media_revision: u64,
    intersection_available: bool,
}

impl HostState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Returns true if `ancestor` is `node` or one of its ancestors.
    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            if n == ancestor {
                return true;
            }
            cursor = self.nodes.get(&n).and_then(|x| x.parent);
        }
        false
    }

    fn record(&mut self, target: NodeId, kind: &MutationKind) {
        let scopes: Vec<(ObserverId, NodeId)> = self
            .mutation_observers
            .iter()
            .map(|(id, obs)| (*id, obs.scope))
            .collect();
        for (id, scope) in scopes {
            if self.is_inclusive_ancestor(scope, target) {
                if let Some(obs) = self.mutation_observers.get_mut(&id) {
                    obs.records.push(MutationRecord {
                        target,
                        kind: kind.clone(),
                    });
                }
            }
        }
    }

    fn detach(&mut self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get_mut(&node)?.parent.take()?;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != node);
        }
        Some(parent)
    }

    fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            out.push(n);
            if let Some(x) = self.nodes.get(&n) {
                stack.extend(x.children.iter().rev().copied());
            }
        }
        out
    }

    fn visibility_entry(&self, node: NodeId) -> IntersectionEntry {
        let ratio = self.nodes.get(&node).map_or(0.0, |n| n.ratio);
        IntersectionEntry {
            node,
            ratio,
            is_intersecting: ratio > 0.0,
        }
    }
}

/// Thread-safe in-memory host: a node tree plus simulated observation primitives.
#[derive(Debug)]
pub struct InMemoryHost {
    state: Mutex<HostState>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHost {
    /// Creates a host with an empty document fragment as its root.
    #[must_use]
    pub fn new() -> Self {
        let root = NodeId::from_raw(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                element: ElementSnapshot::new(FRAGMENT_TAG),
                parent: None,
                children: Vec::new(),
                container: None,
                ratio: 0.0,
            },
        );
        Self {
            state: Mutex::new(HostState {
                next_id: 1,
                root,
                nodes,
                mutation_observers: HashMap::new(),
                visibility_observers: HashMap::new(),
                media: MediaFeatures::default(),
                media_revision: 0,
                intersection_available: true,
            }),
        }
    }

    // The state is plain data; a panic mid-update leaves it usable.
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The root document fragment.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.lock().root
    }

    /// Creates a detached element.
    pub fn create_element(&self, tag: &str, attributes: &[(&str, &str)]) -> NodeId {
        let mut state = self.lock();
        let id = NodeId::from_raw(state.allocate());
        let mut element = ElementSnapshot::new(tag);
        element.attributes = attributes
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>();
        state.nodes.insert(
            id,
            Node {
                element,
                parent: None,
                children: Vec::new(),
                container: None,
                ratio: 0.0,
            },
        );
        id
    }

    /// Appends `child` to `parent`, moving it if already attached elsewhere.
    ///
    /// Returns false if either node is unknown or the move would create a cycle.
    pub fn append_child(&self, parent: NodeId, child: NodeId) -> bool {
        let mut state = self.lock();
        if !state.nodes.contains_key(&parent)
            || !state.nodes.contains_key(&child)
            || state.is_inclusive_ancestor(child, parent)
        {
            return false;
        }
        if let Some(old_parent) = state.detach(child) {
            state.record(old_parent, &MutationKind::ChildList);
        }
        if let Some(p) = state.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = state.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
        state.record(parent, &MutationKind::ChildList);
        true
    }

    /// Creates an element and appends it to `parent`.
    pub fn append_element(&self, parent: NodeId, tag: &str, attributes: &[(&str, &str)]) -> NodeId {
        let id = self.create_element(tag, attributes);
        self.append_child(parent, id);
        id
    }

    /// Detaches `node` from its parent. The node stays known to the host.
    pub fn remove(&self, node: NodeId) {
        let mut state = self.lock();
        if let Some(parent) = state.detach(node) {
            state.record(parent, &MutationKind::ChildList);
        }
    }

    /// Detaches `node` and forgets its whole subtree, as if reclaimed.
    pub fn drop_node(&self, node: NodeId) {
        let mut state = self.lock();
        if node == state.root {
            return;
        }
        let parent = state.detach(node);
        for n in state.subtree(node) {
            state.nodes.remove(&n);
        }
        if let Some(parent) = parent {
            state.record(parent, &MutationKind::ChildList);
        }
    }

    /// Sets (or replaces) an attribute.
    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let mut state = self.lock();
        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        n.element.attributes.insert(name.clone(), value.to_string());
        state.record(node, &MutationKind::Attributes { name });
    }

    /// Removes an attribute if present.
    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        let name = name.to_ascii_lowercase();
        let mut state = self.lock();
        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        if n.element.attributes.remove(&name).is_some() {
            state.record(node, &MutationKind::Attributes { name });
        }
    }

    /// Sets the visible ratio of `node` and queues entries for its observers.
    pub fn set_visibility(&self, node: NodeId, ratio: f64) {
        let mut state = self.lock();
        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        n.ratio = ratio.clamp(0.0, 1.0);
        let entry = state.visibility_entry(node);
        for obs in state.visibility_observers.values_mut() {
            if obs.nodes.contains(&node) {
                obs.entries.push(entry);
            }
        }
    }

    /// Replaces the media environment and bumps the media revision.
    pub fn set_media(&self, media: MediaFeatures) {
        let mut state = self.lock();
        state.media = media;
        state.media_revision += 1;
    }

    /// Resizes the viewport.
    pub fn set_viewport(&self, width: f64, height: f64) {
        let mut media = self.lock().media.clone();
        media.width = width;
        media.height = height;
        self.set_media(media);
    }

    /// Makes `node` a size container, or clears it with `None`.
    pub fn set_container(&self, node: NodeId, container: Option<ContainerInfo>) {
        let mut state = self.lock();
        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        n.container = container;
    }

    /// Simulates a host without intersection observation support.
    pub fn set_intersection_available(&self, available: bool) {
        self.lock().intersection_available = available;
    }

    /// Number of live intersection observers.
    #[must_use]
    pub fn visibility_observer_count(&self) -> usize {
        self.lock().visibility_observers.len()
    }

    /// Number of live mutation observers.
    #[must_use]
    pub fn mutation_observer_count(&self) -> usize {
        self.lock().mutation_observers.len()
    }
}

impl DocumentHost for InMemoryHost {
    fn contains(&self, node: NodeId) -> bool {
        self.lock().nodes.contains_key(&node)
    }

    fn scan(&self, scope: NodeId) -> Vec<NodeId> {
        let state = self.lock();
        if !state.nodes.contains_key(&scope) {
            return Vec::new();
        }
        state.subtree(scope).into_iter().skip(1).collect()
    }

    fn element(&self, node: NodeId) -> Option<ElementSnapshot> {
        self.lock().nodes.get(&node).map(|n| n.element.clone())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.lock().nodes.get(&node).and_then(|n| n.parent)
    }

    fn is_connected(&self, node: NodeId, scope: NodeId) -> bool {
        let state = self.lock();
        node != scope && state.nodes.contains_key(&node) && state.is_inclusive_ancestor(scope, node)
    }

    fn observe(&self, scope: NodeId) -> ObserverId {
        let mut state = self.lock();
        let id = ObserverId::from_raw(state.allocate());
        state.mutation_observers.insert(
            id,
            MutationObserver {
                scope,
                records: Vec::new(),
            },
        );
        id
    }

    fn take_records(&self, observer: ObserverId) -> Vec<MutationRecord> {
        self.lock()
            .mutation_observers
            .get_mut(&observer)
            .map(|o| std::mem::take(&mut o.records))
            .unwrap_or_default()
    }

    fn disconnect(&self, observer: ObserverId) {
        self.lock().mutation_observers.remove(&observer);
    }
}

impl IntersectionHost for InMemoryHost {
    fn create_observer(&self, _options: &IntersectionOptions) -> Result<ObserverId, ObservationError> {
        let mut state = self.lock();
        if !state.intersection_available {
            return Err(ObservationError::Unavailable {
                primitive: "intersection".to_string(),
            });
        }
        let id = ObserverId::from_raw(state.allocate());
        state
            .visibility_observers
            .insert(id, VisibilityObserver::default());
        Ok(id)
    }

    fn observe(&self, observer: ObserverId, node: NodeId) {
        let mut state = self.lock();
        let entry = state.visibility_entry(node);
        if let Some(obs) = state.visibility_observers.get_mut(&observer) {
            if !obs.nodes.contains(&node) {
                obs.nodes.push(node);
                obs.entries.push(entry);
            }
        }
    }

    fn unobserve(&self, observer: ObserverId, node: NodeId) {
        if let Some(obs) = self.lock().visibility_observers.get_mut(&observer) {
            obs.nodes.retain(|n| *n != node);
            obs.entries.retain(|e| e.node != node);
        }
    }

    fn take_entries(&self, observer: ObserverId) -> Vec<IntersectionEntry> {
        self.lock()
            .visibility_observers
            .get_mut(&observer)
            .map(|o| std::mem::take(&mut o.entries))
            .unwrap_or_default()
    }

    fn disconnect(&self, observer: ObserverId) {
        self.lock().visibility_observers.remove(&observer);
    }
}

impl MediaHost for InMemoryHost {
    fn evaluate(&self, query: &MediaQueryList) -> bool {
        query.evaluate(&self.lock().media)
    }

    fn revision(&self) -> u64 {
        self.lock().media_revision
    }
}

impl ContainerHost for InMemoryHost {
    fn container(&self, node: NodeId) -> Option<ContainerInfo> {
        self.lock().nodes.get(&node).and_then(|n| n.container.clone())
    }
}
