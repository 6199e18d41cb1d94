use super::*;

fn recorder() -> (Rc<RefCell<Vec<String>>>, BusHandler) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handler: BusHandler = Rc::new(move |event: &str, args: &[GlobalValue]| {
        let first = args.first().and_then(GlobalValue::as_str).unwrap_or("-");
        sink.borrow_mut().push(format!("{event}:{first}"));
        Ok(())
    });
    (seen, handler)
}

#[test]
fn emit_reaches_every_bus_id_and_all_event_handlers() -> Result<()> {
    let trace = TraceState::shared();
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let host = EventBus::attach("__host__", registry.clone(), trace.clone());
    let guest = EventBus::create("guest", registry.clone(), trace.clone());

    let (seen, handler) = recorder();
    host.on_handler("ping", handler.clone());
    guest.on_handler("ping", handler.clone());
    host.on_handler(ALL_EVENT, handler);

    guest.emit("ping", &[GlobalValue::Str("x".into())]);
    assert_eq!(*seen.borrow(), vec!["ping:x", "ping:x", "ping:x"]);
    assert_eq!(registry.borrow().handler_count("__host__"), 2);
    assert_eq!(registry.borrow().handler_count("guest"), 1);
    Ok(())
}

#[test]
fn registering_the_same_handler_twice_keeps_one_entry() {
    let trace = TraceState::shared();
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let bus = EventBus::attach("a", registry, trace);
    let (seen, handler) = recorder();
    let first = bus.on_handler("tick", handler.clone());
    let second = bus.on_handler("tick", handler);
    assert_eq!(first, second);
    assert_eq!(bus.handler_count(), 1);
    bus.emit("tick", &[]);
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn once_handlers_fire_a_single_time() {
    let trace = TraceState::shared();
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let bus = EventBus::attach("a", registry, trace);
    let count = Rc::new(RefCell::new(0));
    let sink = count.clone();
    bus.once("ready", move |_, _| {
        *sink.borrow_mut() += 1;
        Ok(())
    });
    bus.emit("ready", &[]);
    bus.emit("ready", &[]);
    assert_eq!(*count.borrow(), 1);
    assert_eq!(bus.handler_count(), 0);
}

#[test]
fn off_removes_one_handler_and_warns_for_unknown_events() {
    let trace = TraceState::shared();
    trace.borrow_mut().to_stderr = false;
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let bus = EventBus::attach("a", registry, trace.clone());
    let id = bus.on("change", |_, _| Ok(()));
    assert!(bus.off("change", id));
    assert!(!bus.off("missing", id));
    bus.emit("change", &[]);
    let warnings = trace.borrow().warnings();
    assert_eq!(
        warnings,
        vec![
            format!("missing {WARN_NO_SUBJECT}"),
            format!("change {WARN_NO_SUBJECT}"),
        ]
    );
}

#[test]
fn failing_handlers_are_logged_and_do_not_stop_delivery() {
    let trace = TraceState::shared();
    trace.borrow_mut().to_stderr = false;
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let bus = EventBus::attach("a", registry, trace.clone());
    let (seen, handler) = recorder();
    bus.on("go", |_, _| Err(Error::ScriptRuntime("boom".into())));
    bus.on_handler("go", handler);
    bus.emit("go", &[]);
    assert_eq!(*seen.borrow(), vec!["go:-"]);
    let logs = trace.borrow_mut().take();
    assert!(
        logs.iter()
            .any(|line| line.starts_with("[error] bus handler for go failed")),
        "{logs:?}"
    );
}

#[test]
fn create_drops_handlers_left_by_an_earlier_instance() {
    let trace = TraceState::shared();
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let first = EventBus::create("app", registry.clone(), trace.clone());
    first.on("x", |_, _| Ok(()));
    first.on_all(|_, _| Ok(()));
    assert_eq!(first.handler_count(), 2);

    let second = EventBus::create("app", registry.clone(), trace);
    assert_eq!(second.handler_count(), 0);
    assert_eq!(registry.borrow().handler_count("app"), 0);
}

#[test]
fn released_bus_frees_its_registry_slot() {
    let trace = TraceState::shared();
    let registry = Rc::new(RefCell::new(BusRegistry::default()));
    let host = EventBus::attach("__host__", registry.clone(), trace.clone());
    for _ in 0..3 {
        let guest = EventBus::create("guest", registry.clone(), trace.clone());
        let (_, handler) = recorder();
        guest.on_handler("ping", handler);
        assert_eq!(registry.borrow().bus_count(), 2);
        guest.release();
    }
    assert_eq!(registry.borrow().bus_count(), 1);
    assert_eq!(registry.borrow().handler_count("guest"), 0);
    assert_eq!(host.handler_count(), 0);
}
