//! # lazymatch - Lazy module binding for matched elements
//!
//! lazymatch associates a CSS selector, scoped to a document fragment, with a
//! deferred module import. The import runs at most once per rule, and only
//! when a matching element qualifies: it becomes visible, a media query
//! matches, its nearest container satisfies a container query, or activation
//! is immediate. Each qualifying element is then handed to an optional
//! callback together with the loaded module.
//!
//! ## Core Concepts
//!
//! - **MatchRule**: selector + scope + activation policy + import producer
//! - **SelectorTracker**: the live, ordered set of matching elements
//! - **ActivationEvaluator**: edge-triggered activation per element
//! - **ImportGate**: single-flight import, shared by every waiter
//! - **CallbackDispatcher**: at-most-once callback per (rule, element)
//! - **MatchRegistry**: matched elements and the lifecycle event channel
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use lazymatch::{Hosts, InMemoryHost, IntersectionObserverInit, ModuleMatchInit, ModuleMatches, PendingModule};
//!
//! let host = Arc::new(InMemoryHost::new());
//! let card = host.append_element(host.root(), "section", &[("class", "lazy-card")]);
//!
//! let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
//! let rule = engine
//!     .register(
//!         ModuleMatchInit::new()
//!             .selector(".lazy-card")
//!             .root_node(host.root())
//!             .import(|| PendingModule::resolved("card renderer"))
//!             .intersection_observer_init(IntersectionObserverInit {
//!                 threshold: vec![0.5],
//!                 ..IntersectionObserverInit::default()
//!             })
//!             .call_back(|module, element| {
//!                 println!("{module} for {}", element.node);
//!                 Ok(())
//!             }),
//!     )
//!     .unwrap();
//! assert!(engine.module(rule).is_none());
//!
//! host.set_visibility(card, 0.8);
//! engine.run_until_idle();
//! assert!(engine.module(rule).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activation;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod host;
pub mod import;
pub mod query;
pub mod registry;
pub mod rule;
pub mod selector;
pub mod tracker;

// Re-export primary types at crate root for convenience
pub use activation::{ActivationEvaluator, ActivationEvent, ActivationTrigger};
pub use config::ModuleMatchesConfig;
pub use dispatch::{CallbackDispatcher, DispatchOutcome, SkipReason};
pub use engine::ModuleMatches;
pub use error::{
    ConfigurationError, DispatchError, ImportError, MatchError, MatchResult, ObservationError,
};
pub use host::{
    ContainerHost, ContainerInfo, DocumentHost, ElementSnapshot, Hosts, InMemoryHost,
    IntersectionEntry, IntersectionHost, MediaHost, NodeId,
};
pub use import::{ImportGate, ImportState, ModuleResolver, PendingModule};
pub use query::{ContainerQuery, MediaFeatures, MediaQueryList, RootMargin};
pub use registry::{EventKind, EventStream, ListenerId, MatchEvent, MatchEventPayload, MatchRegistry};
pub use rule::{
    ActivationPolicy, ActivationRepeat, CallbackResult, IntersectionObserverInit,
    IntersectionOptions, LoadingMode, MatchRule, ModuleMatchInit, RuleId,
};
pub use selector::Selector;
pub use tracker::{MatchedElement, SelectorTracker};
