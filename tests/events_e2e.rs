use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use lazymatch::{
    ActivationRepeat, ActivationTrigger, ContainerHost, DispatchError, DocumentHost, EventKind,
    Hosts, ImportError, ImportState, InMemoryHost, IntersectionHost, IntersectionObserverInit,
    MatchEvent, MatchEventPayload, ModuleMatchInit, ModuleMatches, ModuleMatchesConfig,
    ObservationError, PendingModule, SkipReason,
};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .without_time()
        .try_init();
}

fn kinds(events: &[MatchEvent]) -> Vec<EventKind> {
    events.iter().map(MatchEvent::kind).collect()
}

fn visible_at(threshold: f64) -> IntersectionObserverInit {
    IntersectionObserverInit {
        threshold: vec![threshold],
        ..IntersectionObserverInit::default()
    }
}

#[test]
fn lifecycle_events_arrive_in_order() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[("class", "lazy")]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let stream = engine.subscribe(&[]);

    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".lazy")
                .root_node(root)
                .link_id("gallery")
                .intersection_observer_init(visible_at(0.25))
                .import(|| PendingModule::resolved(1_u8))
                .call_back(|_, _| Ok(())),
        )
        .unwrap();
    assert_eq!(kinds(&stream.drain()), vec![EventKind::Matched]);

    host.set_visibility(a, 0.5);
    engine.run_until_idle();
    let events = stream.drain();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Activated,
            EventKind::ImportStarted,
            EventKind::ModuleLoaded,
            EventKind::CallbackDispatched,
        ]
    );
    assert!(events.iter().all(|e| e.rule_id == rule));
    assert!(events.iter().all(|e| e.link_id.as_deref() == Some("gallery")));
    let MatchEventPayload::Activated { element, trigger } = &events[0].payload else {
        panic!("expected Activated");
    };
    assert_eq!(element.node, a);
    assert_eq!(*trigger, ActivationTrigger::Intersection { ratio: 0.5 });

    host.remove(a);
    engine.run_until_idle();
    let events = stream.drain();
    assert_eq!(kinds(&events), vec![EventKind::Unmatched]);
    assert!(engine.matches(rule).unwrap().is_empty());
}

#[test]
fn import_failure_is_reported_at_settlement_and_per_element() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::<u8>::new(Hosts::in_memory(&host));
    let failures = engine.subscribe(&[EventKind::ModuleLoadFailed]);

    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(|| PendingModule::rejected(ImportError::rejected("404")))
                .call_back(|_, _| Ok(())),
        )
        .unwrap();

    let b = host.append_element(root, "div", &[]);
    engine.run_until_idle();

    let elements: Vec<_> = failures
        .drain()
        .into_iter()
        .map(|e| {
            let MatchEventPayload::ModuleLoadFailed { element, error } = e.payload else {
                panic!("expected ModuleLoadFailed");
            };
            assert_eq!(error, ImportError::rejected("404"));
            element.map(|el| el.node)
        })
        .collect();
    assert_eq!(elements, vec![None, Some(a), Some(b)]);
}

#[test]
fn panicking_import_producer_fails_the_rule_and_is_reported() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::<u8>::new(Hosts::in_memory(&host));
    let failures = engine.subscribe(&[EventKind::ModuleLoadFailed]);
    let callbacks = Rc::new(Cell::new(0));
    let invoked = Rc::clone(&callbacks);

    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(|| -> PendingModule<u8> { panic!("producer threw") })
                .call_back(move |_, _| {
                    invoked.set(invoked.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();
    assert_eq!(engine.rule_ids(), vec![rule]);

    let b = host.append_element(root, "div", &[]);
    engine.run_until_idle();

    let Some(ImportState::Failed(ImportError::Panicked { message })) = engine.import_state(rule)
    else {
        panic!("expected a panicked import");
    };
    assert_eq!(message, "producer threw");
    assert_eq!(callbacks.get(), 0);

    let elements: Vec<_> = failures
        .drain()
        .into_iter()
        .map(|e| {
            let MatchEventPayload::ModuleLoadFailed { element, error } = e.payload else {
                panic!("expected ModuleLoadFailed");
            };
            assert!(matches!(error, ImportError::Panicked { .. }));
            element.map(|el| el.node)
        })
        .collect();
    assert_eq!(elements, vec![None, Some(a), Some(b)]);
}

#[test]
fn predicate_panic_is_reported_and_isolated() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let bad = host.append_element(root, "div", &[("data-bad", "")]);
    let good = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let stream = engine.subscribe(&[EventKind::DispatchFailed, EventKind::CallbackDispatched]);

    let doc = Arc::clone(&host);
    let dispatched = Rc::new(Cell::new(0));
    let counter = Rc::clone(&dispatched);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(|| PendingModule::resolved(2_u8))
                .do_callback_if(move |_, el| {
                    let snap = el.upgrade(doc.as_ref()).unwrap();
                    assert!(snap.attribute("data-bad").is_none(), "predicate blew up");
                    true
                })
                .call_back(move |_, _| {
                    counter.set(counter.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();

    assert_eq!(dispatched.get(), 1);
    let events = stream.drain();
    assert_eq!(events.len(), 2);
    let MatchEventPayload::DispatchFailed { element, error } = &events[0].payload else {
        panic!("expected DispatchFailed first");
    };
    assert_eq!(element.node, bad);
    let DispatchError::PredicateFailed { reason } = error else {
        panic!("expected PredicateFailed, got {error:?}");
    };
    assert!(reason.contains("predicate blew up"));
    let MatchEventPayload::CallbackDispatched { element } = &events[1].payload else {
        panic!("expected CallbackDispatched second");
    };
    assert_eq!(element.node, good);
}

#[test]
fn dispatch_outcomes_are_reported() {
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let skip = host.append_element(root, "div", &[("data-skip", "")]);
    let fail = host.append_element(root, "div", &[("data-fail", "")]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let stream = engine.subscribe(&[EventKind::CallbackSkipped, EventKind::DispatchFailed]);

    let doc = Arc::clone(&host);
    let doc2 = Arc::clone(&host);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(|| PendingModule::resolved("m"))
                .do_callback_if(move |_, el| {
                    el.upgrade(doc.as_ref())
                        .is_some_and(|s| s.attribute("data-skip").is_none())
                })
                .call_back(move |_, el| {
                    if doc2.element(el.node).is_some_and(|s| s.attribute("data-fail").is_some()) {
                        return Err("render failed".into());
                    }
                    Ok(())
                }),
        )
        .unwrap();

    let events = stream.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0].payload,
        MatchEventPayload::CallbackSkipped {
            element: events[0].payload.element().cloned().unwrap(),
            reason: SkipReason::PredicateRejected,
        }
    );
    assert_eq!(events[0].payload.element().map(|e| e.node), Some(skip));
    let MatchEventPayload::DispatchFailed { element, error } = &events[1].payload else {
        panic!("expected DispatchFailed");
    };
    assert_eq!(element.node, fail);
    assert_eq!(
        *error,
        DispatchError::CallbackFailed {
            reason: "render failed".to_string()
        }
    );
}

#[test]
fn detached_element_is_skipped_when_module_arrives() {
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let skipped = engine.subscribe(&[EventKind::CallbackSkipped]);

    let (resolver, pending) = PendingModule::channel();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(move || pending)
                .call_back(move |_, _| {
                    counter.set(counter.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();

    host.drop_node(a);
    resolver.resolve(3_u16);
    engine.wait_for_imports(Duration::from_secs(1)).unwrap();

    assert_eq!(calls.get(), 0);
    let events = skipped.drain();
    let [event] = events.as_slice() else {
        panic!("expected one skip event");
    };
    let MatchEventPayload::CallbackSkipped { element, reason } = &event.payload else {
        panic!("expected CallbackSkipped");
    };
    assert_eq!(element.node, a);
    assert_eq!(*reason, SkipReason::ElementDetached);
}

#[test]
fn missing_primitives_fall_back_to_immediate_activation() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    host.set_intersection_available(false);
    let root = host.root();
    host.append_element(root, "video", &[]);

    let hosts = Hosts::new(Arc::clone(&host) as Arc<dyn DocumentHost>);
    let mut engine = ModuleMatches::new(hosts);
    let stream = engine.subscribe(&[EventKind::ObservationFallback, EventKind::Activated]);

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("video")
                .root_node(root)
                .intersection_observer_init(visible_at(1.0))
                .media_matches("(prefers-reduced-motion: no-preference)")
                .import(|| PendingModule::resolved(0_u8))
                .call_back(move |_, _| {
                    flag.set(true);
                    Ok(())
                }),
        )
        .unwrap();

    assert!(fired.get());
    let events = stream.drain();
    let fallbacks: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            MatchEventPayload::ObservationFallback {
                error: ObservationError::Unavailable { primitive },
            } => Some(primitive.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(fallbacks, vec!["intersection", "media"]);
    let Some(MatchEventPayload::Activated { trigger, .. }) = events.last().map(|e| &e.payload) else {
        panic!("expected Activated");
    };
    assert_eq!(*trigger, ActivationTrigger::Immediate);
}

#[test]
fn rejected_intersection_observer_falls_back() {
    let host = Arc::new(InMemoryHost::new());
    host.set_intersection_available(false);
    host.append_element(host.root(), "div", &[]);
    let hosts = Hosts::new(Arc::clone(&host) as Arc<dyn DocumentHost>)
        .with_intersection(Arc::clone(&host) as Arc<dyn IntersectionHost>)
        .with_container(Arc::clone(&host) as Arc<dyn ContainerHost>);
    let mut engine = ModuleMatches::new(hosts);
    let stream = engine.subscribe(&[EventKind::ObservationFallback, EventKind::CallbackDispatched]);

    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(host.root())
                .intersection_observer_init(visible_at(0.5))
                .import(|| PendingModule::resolved(()))
                .call_back(|_, _| Ok(())),
        )
        .unwrap();

    assert_eq!(
        kinds(&stream.drain()),
        vec![EventKind::ObservationFallback, EventKind::CallbackDispatched]
    );
}

#[test]
fn repeat_policy_controls_activation_events() {
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));

    let mk = |repeat| {
        ModuleMatchInit::new()
            .selector("div")
            .root_node(root)
            .intersection_observer_init(visible_at(0.0))
            .repeat(repeat)
            .import(|| PendingModule::resolved(1_u32))
    };
    let once = engine.register(mk(ActivationRepeat::Once)).unwrap();
    let every = engine.register(mk(ActivationRepeat::EveryEntry)).unwrap();
    let stream = engine.subscribe(&[EventKind::Activated]);

    for ratio in [1.0, 0.0, 1.0] {
        host.set_visibility(a, ratio);
        engine.run_until_idle();
    }

    let events = stream.drain();
    assert_eq!(events.iter().filter(|e| e.rule_id == once).count(), 1);
    assert_eq!(events.iter().filter(|e| e.rule_id == every).count(), 2);
}

#[test]
fn rematched_element_activates_once() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[("class", "lazy")]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let activations = engine.subscribe(&[EventKind::Activated]);
    let matched = engine.subscribe(&[EventKind::Matched, EventKind::Unmatched]);

    engine
        .register(
            ModuleMatchInit::new()
                .selector(".lazy")
                .root_node(root)
                .intersection_observer_init(visible_at(0.0))
                .import(|| PendingModule::resolved(1_u8))
                .call_back(|_, _| Ok(())),
        )
        .unwrap();

    host.set_visibility(a, 1.0);
    engine.run_until_idle();
    host.remove_attribute(a, "class");
    engine.run_until_idle();
    host.set_attribute(a, "class", "lazy");
    engine.run_until_idle();
    host.set_visibility(a, 0.0);
    engine.run_until_idle();
    host.set_visibility(a, 1.0);
    engine.run_until_idle();

    assert_eq!(
        kinds(&matched.drain()),
        vec![EventKind::Matched, EventKind::Unmatched, EventKind::Matched]
    );
    assert_eq!(activations.drain().len(), 1);
}

#[test]
fn stop_emits_stopped_then_nothing() {
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    let a = host.append_element(root, "div", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let stream = engine.subscribe(&[]);

    let (resolver, pending) = PendingModule::channel();
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(root)
                .import(move || pending)
                .call_back(|_, _| Ok(())),
        )
        .unwrap();
    let _ = stream.drain();

    engine.stop(rule).unwrap();
    assert_eq!(kinds(&stream.drain()), vec![EventKind::Stopped]);

    host.append_element(root, "div", &[]);
    host.remove(a);
    resolver.resolve(9_i64);
    engine.wait_for_imports(Duration::from_secs(1)).unwrap();
    engine.stop(rule).unwrap();

    assert!(stream.drain().is_empty());
    assert!(engine.registry().is_muted(rule));
}

#[test]
fn listener_panics_are_isolated() {
    init_logging();
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    host.append_element(root, "p", &[]);
    host.append_element(root, "p", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));

    let matched = Rc::new(Cell::new(0));
    let counter = Rc::clone(&matched);
    engine.add_listener(EventKind::Matched, |_| panic!("observer bug"));
    let listener = engine.add_listener(EventKind::Matched, move |_| counter.set(counter.get() + 1));

    let calls = Rc::new(Cell::new(0));
    let callback_counter = Rc::clone(&calls);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("p")
                .root_node(root)
                .import(|| PendingModule::resolved("text"))
                .call_back(move |_, _| {
                    callback_counter.set(callback_counter.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();

    assert_eq!(matched.get(), 2);
    assert_eq!(calls.get(), 2);
    assert_eq!(engine.registry().stats().listener_failures, 2);

    assert!(engine.remove_listener(listener));
    host.append_element(root, "p", &[]);
    engine.run_until_idle();
    assert_eq!(matched.get(), 2);
}

#[test]
fn small_streams_drop_and_count_overflow() {
    let host = Arc::new(InMemoryHost::new());
    let root = host.root();
    for _ in 0..4 {
        host.append_element(root, "li", &[]);
    }
    let config = ModuleMatchesConfig::from_json(r#"{"stream_capacity": 2}"#).unwrap();
    let mut engine = ModuleMatches::with_config(Hosts::in_memory(&host), config);
    let stream = engine.subscribe(&[EventKind::Matched]);

    engine
        .register(
            ModuleMatchInit::new()
                .selector("li")
                .root_node(root)
                .import(|| PendingModule::resolved(0_u8)),
        )
        .unwrap();

    assert_eq!(stream.drain().len(), 2);
    assert_eq!(engine.registry().stats().dropped_events, 2);

    drop(stream);
    host.append_element(root, "li", &[]);
    engine.run_until_idle();
    assert_eq!(engine.registry().stream_count(), 0);
}

#[test]
fn events_serialize_to_json() {
    let host = Arc::new(InMemoryHost::new());
    host.append_element(host.root(), "div", &[]);
    let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
    let stream = engine.subscribe(&[EventKind::Matched]);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(host.root())
                .link_id("hero")
                .import(|| PendingModule::resolved(0_u8)),
        )
        .unwrap();

    let event = stream.recv_timeout(Duration::from_millis(100)).unwrap();
    let json = serde_json::to_string(&event).unwrap();
    let back: MatchEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, event);
    assert!(json.contains(r#""type":"matched""#));
    assert!(json.contains(r#""link_id":"hero""#));

    assert!(stream.recv_timeout(Duration::from_millis(10)).unwrap_err().is_timeout());
}
