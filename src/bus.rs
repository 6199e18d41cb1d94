use super::*;

/// Bus subscriber. Receives the emitted event name and the emitted arguments.
pub type BusHandler = Rc<dyn Fn(&str, &[GlobalValue]) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Subscription {
    id: HandlerId,
    handler: BusHandler,
    once: bool,
}

type EventMap = BTreeMap<String, Vec<Subscription>>;

/// Process-wide `bus id -> event -> handlers` registry shared by every bus handle of a
/// host page. Ids are kept in registration order.
#[derive(Default)]
pub(crate) struct BusRegistry {
    apps: Vec<(String, EventMap)>,
    next_id: u64,
}

impl BusRegistry {
    fn events_mut(&mut self, bus_id: &str) -> &mut EventMap {
        let position = match self.apps.iter().position(|(id, _)| id == bus_id) {
            Some(position) => position,
            None => {
                self.apps.push((bus_id.to_string(), EventMap::new()));
                self.apps.len() - 1
            }
        };
        &mut self.apps[position].1
    }

    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub(crate) fn bus_count(&self) -> usize {
        self.apps.len()
    }

    pub(crate) fn handler_count(&self, bus_id: &str) -> usize {
        self.apps
            .iter()
            .filter(|(id, _)| id == bus_id)
            .flat_map(|(_, events)| events.values())
            .map(Vec::len)
            .sum()
    }
}

/// Handle on the event bus of one id. Emitting reaches subscribers of every id.
#[derive(Clone)]
pub struct EventBus {
    id: String,
    registry: Rc<RefCell<BusRegistry>>,
    trace: SharedTrace,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("id", &self.id).finish()
    }
}

impl EventBus {
    /// Fresh bus for `id`: handlers left over from an earlier instance are dropped.
    pub(crate) fn create(id: &str, registry: Rc<RefCell<BusRegistry>>, trace: SharedTrace) -> Self {
        let bus = Self::attach(id, registry, trace);
        bus.clear();
        bus
    }

    /// Handle on the existing bus of `id`.
    pub(crate) fn attach(id: &str, registry: Rc<RefCell<BusRegistry>>, trace: SharedTrace) -> Self {
        registry.borrow_mut().events_mut(id);
        Self {
            id: id.to_string(),
            registry,
            trace,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, event: &str, handler: BusHandler, once: bool) -> HandlerId {
        let mut registry = self.registry.borrow_mut();
        let existing = registry
            .events_mut(&self.id)
            .get(event)
            .and_then(|subs| subs.iter().find(|sub| Rc::ptr_eq(&sub.handler, &handler)))
            .map(|sub| sub.id);
        if let Some(id) = existing {
            return id;
        }
        let id = registry.allocate();
        registry
            .events_mut(&self.id)
            .entry(event.to_string())
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }

    /// Registers `handler`; registering the same handler twice keeps one entry.
    pub fn on_handler(&self, event: &str, handler: BusHandler) -> HandlerId {
        self.subscribe(event, handler, false)
    }

    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&str, &[GlobalValue]) -> Result<()> + 'static,
    ) -> HandlerId {
        self.on_handler(event, Rc::new(handler))
    }

    /// Receives every emission with the event name first.
    pub fn on_all(
        &self,
        handler: impl Fn(&str, &[GlobalValue]) -> Result<()> + 'static,
    ) -> HandlerId {
        self.on_handler(ALL_EVENT, Rc::new(handler))
    }

    /// Fires at most once; the subscription is removed before the handler runs.
    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(&str, &[GlobalValue]) -> Result<()> + 'static,
    ) -> HandlerId {
        self.subscribe(event, Rc::new(handler), true)
    }

    pub fn off(&self, event: &str, handler: HandlerId) -> bool {
        let removed = {
            let mut registry = self.registry.borrow_mut();
            match registry.events_mut(&self.id).get_mut(event) {
                Some(subs) if !subs.is_empty() => {
                    let pos = subs.iter().rposition(|sub| sub.id == handler);
                    Some(pos.map(|pos| subs.remove(pos)).is_some())
                }
                _ => None,
            }
        };
        removed.unwrap_or_else(|| {
            self.trace
                .borrow_mut()
                .warn(format!("{event} {WARN_NO_SUBJECT}"));
            false
        })
    }

    pub fn off_all(&self, handler: HandlerId) -> bool {
        self.off(ALL_EVENT, handler)
    }

    /// Delivers to the handlers of `event` on every bus id, then to every all-events
    /// handler. Handler errors are logged.
    pub fn emit(&self, event: &str, args: &[GlobalValue]) {
        let (direct, all) = {
            let mut registry = self.registry.borrow_mut();
            let mut direct = Vec::new();
            let mut all = Vec::new();
            for (_, events) in registry.apps.iter_mut() {
                if let Some(subs) = events.get_mut(event) {
                    direct.extend(subs.iter().cloned());
                    subs.retain(|sub| !sub.once);
                }
                if let Some(subs) = events.get_mut(ALL_EVENT) {
                    all.extend(subs.iter().cloned());
                    subs.retain(|sub| !sub.once);
                }
            }
            (direct, all)
        };

        if event.is_empty() || (direct.is_empty() && all.is_empty()) {
            self.trace
                .borrow_mut()
                .warn(format!("{event} {WARN_NO_SUBJECT}"));
            return;
        }
        self.trace.borrow_mut().line(
            TraceCategory::Bus,
            format!(
                "emit id={} event={event} handlers={}",
                self.id,
                direct.len() + all.len()
            ),
        );
        for sub in direct.iter().chain(all.iter()) {
            if let Err(err) = (sub.handler)(event, args) {
                self.trace
                    .borrow_mut()
                    .error(format!("bus handler for {event} failed: {err}"));
            }
        }
    }

    /// Removes every handler registered under this id.
    pub fn clear(&self) {
        self.registry.borrow_mut().events_mut(&self.id).clear();
    }

    /// Drops the registry slot of this id along with its handlers.
    pub(crate) fn release(&self) {
        self.registry
            .borrow_mut()
            .apps
            .retain(|(id, _)| *id != self.id);
    }

    pub fn handler_count(&self) -> usize {
        self.registry.borrow().handler_count(&self.id)
    }
}
