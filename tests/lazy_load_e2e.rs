use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazymatch::{
    ActivationRepeat, ContainerInfo, Hosts, ImportError, ImportState, InMemoryHost,
    IntersectionObserverInit, LoadingMode, MatchError, ModuleMatchInit, ModuleMatches, NodeId,
    PendingModule,
};

fn engine<M>() -> (Arc<InMemoryHost>, ModuleMatches<M>) {
    let host = Arc::new(InMemoryHost::new());
    let engine = ModuleMatches::new(Hosts::in_memory(&host));
    (host, engine)
}

fn threshold(t: f64) -> IntersectionObserverInit {
    IntersectionObserverInit {
        threshold: vec![t],
        ..IntersectionObserverInit::default()
    }
}

/// Producer that counts invocations and resolves from a helper thread.
fn delayed_import(
    calls: &Rc<Cell<u32>>,
    module: &'static str,
    delay: Duration,
) -> impl FnOnce() -> PendingModule<String> {
    let calls = Rc::clone(calls);
    move || {
        calls.set(calls.get() + 1);
        let (resolver, pending) = PendingModule::channel();
        thread::spawn(move || {
            thread::sleep(delay);
            resolver.resolve(module.to_string());
        });
        pending
    }
}

#[test]
fn visible_cards_share_one_import_and_each_get_one_callback() {
    let (host, mut engine) = engine::<String>();
    let root = host.root();
    let a = host.append_element(root, "section", &[("class", "lazy-card")]);
    let b = host.append_element(root, "section", &[("class", "lazy-card featured")]);
    host.append_element(root, "section", &[("class", "card")]);

    let calls = Rc::new(Cell::new(0));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);

    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".lazy-card")
                .root_node(root)
                .import(delayed_import(&calls, "card", Duration::from_millis(50)))
                .intersection_observer_init(threshold(0.5))
                .call_back(move |module: &String, element| {
                    sink.borrow_mut()
                        .push((element.node, std::ptr::from_ref(module) as usize));
                    Ok(())
                }),
        )
        .unwrap();

    assert_eq!(engine.matches(rule).unwrap().len(), 2);
    assert_eq!(calls.get(), 0);

    host.set_visibility(a, 0.6);
    host.set_visibility(b, 0.3);
    engine.run_until_idle();
    assert_eq!(calls.get(), 1);
    assert!(matches!(engine.import_state(rule), Some(ImportState::Pending)));

    host.set_visibility(b, 0.9);
    engine.run_until_idle();
    assert_eq!(calls.get(), 1);
    assert!(seen.borrow().is_empty());

    engine.wait_for_imports(Duration::from_secs(5)).unwrap();

    let seen = seen.borrow();
    assert_eq!(calls.get(), 1);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, a);
    assert_eq!(seen[1].0, b);
    assert_eq!(seen[0].1, seen[1].1);
    assert_eq!(engine.module(rule).as_deref().map(String::as_str), Some("card"));
}

#[test]
fn visibility_toggling_never_repeats_the_callback() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    let a = host.append_element(root, "img", &[("data-src", "hero.png")]);

    let callbacks = Rc::new(Cell::new(0));
    let counter = Rc::clone(&callbacks);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("img[data-src]")
                .root_node(root)
                .import(|| PendingModule::resolved(1))
                .intersection_observer_init(threshold(0.0))
                .repeat(ActivationRepeat::EveryEntry)
                .call_back(move |_, _| {
                    counter.set(counter.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();

    for ratio in [1.0, 0.0, 1.0, 0.0, 1.0] {
        host.set_visibility(a, ratio);
        engine.run_until_idle();
    }
    assert_eq!(callbacks.get(), 1);
}

#[test]
fn eager_loading_imports_at_registration() {
    let (host, mut engine) = engine::<u32>();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);

    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".later")
                .root_node(host.root())
                .loading(LoadingMode::Eager)
                .intersection_observer_init(threshold(1.0))
                .import(move || {
                    counter.set(counter.get() + 1);
                    PendingModule::resolved(11)
                }),
        )
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(engine.module(rule).as_deref(), Some(&11));

    // Eager rules activate new matches without waiting for visibility.
    let hits = Rc::new(Cell::new(0));
    let hit_counter = Rc::clone(&hits);
    let second = engine
        .register(
            ModuleMatchInit::new()
                .selector(".later")
                .root_node(host.root())
                .loading(LoadingMode::Eager)
                .intersection_observer_init(threshold(1.0))
                .import(|| PendingModule::resolved(12))
                .call_back(move |_, _| {
                    hit_counter.set(hit_counter.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();
    host.append_element(host.root(), "div", &[("class", "later")]);
    engine.run_until_idle();
    assert_eq!(hits.get(), 1);
    assert_eq!(engine.module(second).as_deref(), Some(&12));
    assert_eq!(calls.get(), 1);
}

#[test]
fn media_query_true_at_registration_activates_immediately() {
    let (host, mut engine) = engine::<&'static str>();
    let root = host.root();
    host.append_element(root, "nav", &[("class", "wide-nav")]);

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    engine
        .register(
            ModuleMatchInit::new()
                .selector(".wide-nav")
                .root_node(root)
                .media_matches("(min-width: 768px)")
                .import(|| PendingModule::resolved("nav"))
                .call_back(move |_, _| {
                    flag.set(true);
                    Ok(())
                }),
        )
        .unwrap();

    assert!(fired.get());
}

#[test]
fn media_query_activates_when_viewport_grows() {
    let (host, mut engine) = engine::<&'static str>();
    let root = host.root();
    host.append_element(root, "aside", &[]);
    host.set_viewport(500.0, 800.0);

    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector("aside")
                .root_node(root)
                .media_matches("screen and (min-width: 768px)")
                .import(move || {
                    counter.set(counter.get() + 1);
                    PendingModule::resolved("sidebar")
                }),
        )
        .unwrap();
    assert_eq!(calls.get(), 0);
    assert!(engine.import_state(rule).is_none());

    host.set_viewport(1280.0, 800.0);
    engine.run_until_idle();
    assert_eq!(calls.get(), 1);
    assert!(engine.module(rule).is_some());
}

#[test]
fn container_query_uses_nearest_named_container() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    let shell = host.append_element(root, "div", &[]);
    let panel = host.append_element(shell, "div", &[]);
    let widget = host.append_element(panel, "div", &[("class", "chart")]);
    host.set_container(
        shell,
        Some(ContainerInfo {
            name: Some("card".to_string()),
            width: 300.0,
            height: 200.0,
        }),
    );
    // An unnamed container in between does not qualify for a named query.
    host.set_container(
        panel,
        Some(ContainerInfo {
            name: None,
            width: 900.0,
            height: 200.0,
        }),
    );

    let activated = Rc::new(RefCell::new(Vec::<NodeId>::new()));
    let sink = Rc::clone(&activated);
    engine
        .register(
            ModuleMatchInit::new()
                .selector(".chart")
                .root_node(root)
                .container_query("@container card (min-width: 400px)")
                .import(|| PendingModule::resolved(1))
                .call_back(move |_, el| {
                    sink.borrow_mut().push(el.node);
                    Ok(())
                }),
        )
        .unwrap();
    assert!(activated.borrow().is_empty());

    host.set_container(
        shell,
        Some(ContainerInfo {
            name: Some("card".to_string()),
            width: 480.0,
            height: 200.0,
        }),
    );
    engine.run_until_idle();
    assert_eq!(*activated.borrow(), vec![widget]);
}

#[test]
fn rejected_import_is_shared_by_every_waiter() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    host.append_element(root, "div", &[("class", "x")]);

    let calls = Rc::new(Cell::new(0));
    let callbacks = Rc::new(Cell::new(0));
    let (produced, invoked) = (Rc::clone(&calls), Rc::clone(&callbacks));
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".x")
                .root_node(root)
                .import(move || {
                    produced.set(produced.get() + 1);
                    PendingModule::rejected(ImportError::rejected("offline"))
                })
                .call_back(move |_, _| {
                    invoked.set(invoked.get() + 1);
                    Ok(())
                }),
        )
        .unwrap();

    let Some(ImportState::Failed(err)) = engine.import_state(rule) else {
        panic!("expected failed import");
    };
    assert_eq!(err, ImportError::rejected("offline"));

    host.append_element(root, "div", &[("class", "x")]);
    engine.run_until_idle();

    assert_eq!(calls.get(), 1);
    assert_eq!(callbacks.get(), 0);
    assert!(engine.module(rule).is_none());
}

#[test]
fn dropped_resolver_fails_the_import() {
    let (host, mut engine) = engine::<u32>();
    host.append_element(host.root(), "div", &[]);
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector("div")
                .root_node(host.root())
                .import(|| {
                    let (_resolver, pending) = PendingModule::channel();
                    pending
                }),
        )
        .unwrap();

    engine.wait_for_imports(Duration::from_secs(1)).unwrap();
    let Some(ImportState::Failed(ImportError::ProducerDropped)) = engine.import_state(rule) else {
        panic!("expected ProducerDropped");
    };
}

#[test]
fn predicate_gates_the_callback() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    let keep = host.append_element(root, "li", &[("data-kind", "video")]);
    host.append_element(root, "li", &[("data-kind", "text")]);

    let doc = Arc::clone(&host);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    engine
        .register(
            ModuleMatchInit::new()
                .selector("li[data-kind]")
                .root_node(root)
                .import(|| PendingModule::resolved(1))
                .do_callback_if(move |_, el| {
                    el.upgrade(doc.as_ref())
                        .is_some_and(|snap| snap.attribute("data-kind") == Some("video"))
                })
                .call_back(move |_, el| {
                    sink.borrow_mut().push(el.node);
                    Ok(())
                }),
        )
        .unwrap();

    assert_eq!(*seen.borrow(), vec![keep]);
}

#[test]
fn callback_failure_is_isolated_per_element() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    let bad = host.append_element(root, "div", &[("class", "w")]);
    let good = host.append_element(root, "div", &[("class", "w")]);

    let ok = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&ok);
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".w")
                .root_node(root)
                .import(|| PendingModule::resolved(1))
                .call_back(move |_, el| {
                    if el.node == bad {
                        panic!("widget init failed");
                    }
                    sink.borrow_mut().push(el.node);
                    Ok(())
                }),
        )
        .unwrap();

    assert_eq!(*ok.borrow(), vec![good]);
    assert!(matches!(engine.import_state(rule), Some(ImportState::Succeeded(_))));
}

#[test]
fn stop_lets_queued_callbacks_finish() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    let a = host.append_element(root, "div", &[("class", "lazy")]);

    let (resolver, pending) = PendingModule::channel();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let rule = engine
        .register(
            ModuleMatchInit::new()
                .selector(".lazy")
                .root_node(root)
                .import(move || pending)
                .intersection_observer_init(threshold(0.0))
                .call_back(move |_, el| {
                    sink.borrow_mut().push(el.node);
                    Ok(())
                }),
        )
        .unwrap();

    host.set_visibility(a, 1.0);
    engine.run_until_idle();
    engine.stop(rule).unwrap();
    assert_eq!(host.visibility_observer_count(), 0);
    assert_eq!(host.mutation_observer_count(), 0);
    assert!(engine.matches(rule).unwrap().is_empty());

    // New matches after stop are ignored.
    let b = host.append_element(root, "div", &[("class", "lazy")]);
    host.set_visibility(b, 1.0);

    resolver.resolve(7);
    engine.wait_for_imports(Duration::from_secs(1)).unwrap();
    assert_eq!(*seen.borrow(), vec![a]);
    assert_eq!(engine.module(rule).as_deref(), Some(&7));
}

#[test]
fn unregister_discards_queued_callbacks() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();
    host.append_element(root, "div", &[]);

    let (resolver, pending) = PendingModule::channel();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let rule = engine
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

    engine.unregister(rule).unwrap();
    resolver.resolve(1);
    engine.wait_for_imports(Duration::from_millis(50)).unwrap();
    engine.run_until_idle();

    assert_eq!(calls.get(), 0);
    assert!(engine.rule(rule).is_none());
    assert!(engine.import_state(rule).is_none());
}

#[test]
fn invalid_configuration_fails_registration() {
    let (host, mut engine) = engine::<u32>();
    let root = host.root();

    let err = engine
        .register(
            ModuleMatchInit::new()
                .selector("a:hover")
                .root_node(root)
                .import(|| PendingModule::resolved(1)),
        )
        .unwrap_err();
    assert!(err.is_configuration());

    let err = engine
        .register(
            ModuleMatchInit::new()
                .selector("a")
                .root_node(root)
                .media_matches("(min-width: huge)")
                .import(|| PendingModule::resolved(1)),
        )
        .unwrap_err();
    assert!(matches!(err, MatchError::Configuration(_)));

    let err = engine
        .register(ModuleMatchInit::new().selector("a").root_node(root))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(engine.rule_ids().is_empty());
}
