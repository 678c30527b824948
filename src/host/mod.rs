//! Host environment abstraction.
//!
//! The engine never touches a real document. It consumes the collaborators
//! declared in [`traits`]; [`memory`] provides a thread-safe reference host
//! used by tests and embedders that drive the engine from their own model.

use std::sync::Arc;

/// In-memory reference host.
pub mod memory;
/// Host collaborator traits.
pub mod traits;

pub use memory::InMemoryHost;
pub use traits::{
    ContainerHost, ContainerInfo, DocumentHost, ElementSnapshot, IntersectionEntry,
    IntersectionHost, MediaHost, MutationKind, MutationRecord, NodeId, ObserverId,
};

/// The set of host collaborators an engine runs against.
///
/// Only the document is required; each missing observation primitive makes
/// rules that depend on it fall back to immediate activation.
#[derive(Clone)]
pub struct Hosts {
    /// Document structure and mutation records.
    pub document: Arc<dyn DocumentHost>,
    /// Visibility observation.
    pub intersection: Option<Arc<dyn IntersectionHost>>,
    /// Media environment.
    pub media: Option<Arc<dyn MediaHost>>,
    /// Size containers.
    pub container: Option<Arc<dyn ContainerHost>>,
}

impl Hosts {
    /// Document-only host set.
    #[must_use]
    pub fn new(document: Arc<dyn DocumentHost>) -> Self {
        Self {
            document,
            intersection: None,
            media: None,
            container: None,
        }
    }

    /// Every collaborator backed by one in-memory host.
    #[must_use]
    pub fn in_memory(host: &Arc<InMemoryHost>) -> Self {
        Self {
            document: Arc::clone(host) as Arc<dyn DocumentHost>,
            intersection: Some(Arc::clone(host) as Arc<dyn IntersectionHost>),
            media: Some(Arc::clone(host) as Arc<dyn MediaHost>),
            container: Some(Arc::clone(host) as Arc<dyn ContainerHost>),
        }
    }

    /// Adds an intersection primitive.
    #[must_use]
    pub fn with_intersection(mut self, host: Arc<dyn IntersectionHost>) -> Self {
        self.intersection = Some(host);
        self
    }

    /// Adds a media primitive.
    #[must_use]
    pub fn with_media(mut self, host: Arc<dyn MediaHost>) -> Self {
        self.media = Some(host);
        self
    }

    /// Adds a container primitive.
    #[must_use]
    pub fn with_container(mut self, host: Arc<dyn ContainerHost>) -> Self {
        self.container = Some(host);
        self
    }
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("intersection", &self.intersection.is_some())
            .field("media", &self.media.is_some())
            .field("container", &self.container.is_some())
            .finish_non_exhaustive()
    }
}
