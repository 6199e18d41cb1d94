use super::*;

/// Lifecycle hook receiving the app name.
pub type LifecycleHook = Rc<dyn Fn(&str)>;
/// Load-error hook receiving the failing url and the error.
pub type LoadErrorHook = Rc<dyn Fn(&str, &Error)>;

#[derive(Clone, Default)]
pub struct Lifecycles {
    pub before_load: Option<LifecycleHook>,
    pub before_mount: Option<LifecycleHook>,
    pub after_mount: Option<LifecycleHook>,
    pub before_unmount: Option<LifecycleHook>,
    pub after_unmount: Option<LifecycleHook>,
    pub activated: Option<LifecycleHook>,
    pub deactivated: Option<LifecycleHook>,
    pub load_error: Option<LoadErrorHook>,
}

impl Lifecycles {
    fn merged(&self, cached: Option<&Lifecycles>) -> Self {
        let pick = |own: &Option<LifecycleHook>, other: Option<&Option<LifecycleHook>>| {
            own.clone().or_else(|| other.cloned().flatten())
        };
        Self {
            before_load: pick(&self.before_load, cached.map(|c| &c.before_load)),
            before_mount: pick(&self.before_mount, cached.map(|c| &c.before_mount)),
            after_mount: pick(&self.after_mount, cached.map(|c| &c.after_mount)),
            before_unmount: pick(&self.before_unmount, cached.map(|c| &c.before_unmount)),
            after_unmount: pick(&self.after_unmount, cached.map(|c| &c.after_unmount)),
            activated: pick(&self.activated, cached.map(|c| &c.activated)),
            deactivated: pick(&self.deactivated, cached.map(|c| &c.deactivated)),
            load_error: self
                .load_error
                .clone()
                .or_else(|| cached.and_then(|c| c.load_error.clone())),
        }
    }
}

impl fmt::Debug for Lifecycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycles")
            .field("before_load", &self.before_load.is_some())
            .field("before_mount", &self.before_mount.is_some())
            .field("after_mount", &self.after_mount.is_some())
            .field("before_unmount", &self.before_unmount.is_some())
            .field("after_unmount", &self.after_unmount.is_some())
            .field("activated", &self.activated.is_some())
            .field("deactivated", &self.deactivated.is_some())
            .field("load_error", &self.load_error.is_some())
            .finish()
    }
}

/// Where a guest is mounted in the host page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountTarget {
    Selector(String),
    Node(NodeId),
}

impl From<&str> for MountTarget {
    fn from(value: &str) -> Self {
        Self::Selector(value.to_string())
    }
}

impl From<NodeId> for MountTarget {
    fn from(value: NodeId) -> Self {
        Self::Node(value)
    }
}

/// Options of one guest app. Unset fields fall back to an earlier `setup_app` call and
/// then to defaults.
#[derive(Clone, Default)]
pub struct AppOptions {
    pub name: String,
    pub url: Option<String>,
    pub html: Option<String>,
    pub el: Option<MountTarget>,
    pub loading: Option<String>,
    pub replace: Option<HtmlTransform>,
    pub fetch: Option<Rc<dyn Fetcher>>,
    pub props: Option<BTreeMap<String, GlobalValue>>,
    pub attrs: Option<BTreeMap<String, String>>,
    pub degrade_attrs: Option<BTreeMap<String, String>>,
    pub fiber: Option<bool>,
    pub alive: Option<bool>,
    pub degrade: Option<bool>,
    pub sync: Option<bool>,
    pub exec: Option<bool>,
    pub prefix: Option<BTreeMap<String, String>>,
    pub plugins: Option<Vec<Plugin>>,
    pub iframe_add_event_listeners: Option<Vec<String>>,
    pub iframe_on_events: Option<Vec<String>>,
    pub lifecycles: Lifecycles,
}

impl fmt::Debug for AppOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppOptions")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("el", &self.el)
            .field("fiber", &self.fiber)
            .field("alive", &self.alive)
            .field("degrade", &self.degrade)
            .field("sync", &self.sync)
            .field("exec", &self.exec)
            .field("prefix", &self.prefix)
            .field("plugins", &self.plugins.as_ref().map(Vec::len))
            .field("lifecycles", &self.lifecycles)
            .finish_non_exhaustive()
    }
}

impl AppOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn el(mut self, target: impl Into<MountTarget>) -> Self {
        self.el = Some(target.into());
        self
    }

    pub fn loading(mut self, markup: impl Into<String>) -> Self {
        self.loading = Some(markup.into());
        self
    }

    pub fn replace(mut self, transform: impl Fn(&str) -> String + 'static) -> Self {
        self.replace = Some(Rc::new(transform));
        self
    }

    pub fn fetch(mut self, fetcher: Rc<dyn Fetcher>) -> Self {
        self.fetch = Some(fetcher);
        self
    }

    pub fn prop(mut self, key: &str, value: impl Into<GlobalValue>) -> Self {
        self.props
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.attrs
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn degrade_attr(mut self, key: &str, value: &str) -> Self {
        self.degrade_attrs
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn fiber(mut self, fiber: bool) -> Self {
        self.fiber = Some(fiber);
        self
    }

    pub fn alive(mut self, alive: bool) -> Self {
        self.alive = Some(alive);
        self
    }

    pub fn degrade(mut self, degrade: bool) -> Self {
        self.degrade = Some(degrade);
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn exec(mut self, exec: bool) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn prefix(mut self, short: &str, path: &str) -> Self {
        self.prefix
            .get_or_insert_with(BTreeMap::new)
            .insert(short.to_string(), path.to_string());
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.get_or_insert_with(Vec::new).push(plugin);
        self
    }

    pub fn iframe_add_event_listener(mut self, event: &str) -> Self {
        self.iframe_add_event_listeners
            .get_or_insert_with(Vec::new)
            .push(event.to_string());
        self
    }

    pub fn iframe_on_event(mut self, event: &str) -> Self {
        self.iframe_on_events
            .get_or_insert_with(Vec::new)
            .push(event.to_string());
        self
    }

    pub fn lifecycles(mut self, lifecycles: Lifecycles) -> Self {
        self.lifecycles = lifecycles;
        self
    }

    pub fn before_load(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.before_load = Some(Rc::new(hook));
        self
    }

    pub fn before_mount(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.before_mount = Some(Rc::new(hook));
        self
    }

    pub fn after_mount(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.after_mount = Some(Rc::new(hook));
        self
    }

    pub fn before_unmount(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.before_unmount = Some(Rc::new(hook));
        self
    }

    pub fn after_unmount(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.after_unmount = Some(Rc::new(hook));
        self
    }

    pub fn activated(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.activated = Some(Rc::new(hook));
        self
    }

    pub fn deactivated(mut self, hook: impl Fn(&str) + 'static) -> Self {
        self.lifecycles.deactivated = Some(Rc::new(hook));
        self
    }

    pub fn load_error(mut self, hook: impl Fn(&str, &Error) + 'static) -> Self {
        self.lifecycles.load_error = Some(Rc::new(hook));
        self
    }

    pub fn is_fiber(&self) -> bool {
        self.fiber.unwrap_or(true)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.unwrap_or(false)
    }

    pub fn is_degrade(&self) -> bool {
        self.degrade.unwrap_or(false)
    }

    pub fn is_sync(&self) -> bool {
        self.sync.unwrap_or(false)
    }

    pub fn is_exec(&self) -> bool {
        self.exec.unwrap_or(false)
    }
}

/// Field-by-field merge where `start` wins over `cached`. Lists and maps default to
/// empty, `fiber` defaults to on.
pub fn merge_options(start: &AppOptions, cached: Option<&AppOptions>) -> AppOptions {
    let prefer = |own: &Option<bool>, other: Option<bool>, default: bool| {
        Some(own.or(other).unwrap_or(default))
    };
    AppOptions {
        name: start.name.clone(),
        url: start.url.clone().or_else(|| cached.and_then(|c| c.url.clone())),
        html: start.html.clone().or_else(|| cached.and_then(|c| c.html.clone())),
        el: start.el.clone().or_else(|| cached.and_then(|c| c.el.clone())),
        loading: start
            .loading
            .clone()
            .or_else(|| cached.and_then(|c| c.loading.clone())),
        replace: start
            .replace
            .clone()
            .or_else(|| cached.and_then(|c| c.replace.clone())),
        fetch: start.fetch.clone().or_else(|| cached.and_then(|c| c.fetch.clone())),
        props: start
            .props
            .clone()
            .or_else(|| cached.and_then(|c| c.props.clone())),
        attrs: Some(
            start
                .attrs
                .clone()
                .or_else(|| cached.and_then(|c| c.attrs.clone()))
                .unwrap_or_default(),
        ),
        degrade_attrs: Some(
            start
                .degrade_attrs
                .clone()
                .or_else(|| cached.and_then(|c| c.degrade_attrs.clone()))
                .unwrap_or_default(),
        ),
        fiber: prefer(&start.fiber, cached.and_then(|c| c.fiber), true),
        alive: prefer(&start.alive, cached.and_then(|c| c.alive), false),
        degrade: prefer(&start.degrade, cached.and_then(|c| c.degrade), false),
        sync: prefer(&start.sync, cached.and_then(|c| c.sync), false),
        exec: prefer(&start.exec, cached.and_then(|c| c.exec), false),
        prefix: start
            .prefix
            .clone()
            .or_else(|| cached.and_then(|c| c.prefix.clone())),
        plugins: start
            .plugins
            .clone()
            .or_else(|| cached.and_then(|c| c.plugins.clone())),
        iframe_add_event_listeners: Some(
            start
                .iframe_add_event_listeners
                .clone()
                .or_else(|| cached.and_then(|c| c.iframe_add_event_listeners.clone()))
                .unwrap_or_default(),
        ),
        iframe_on_events: Some(
            start
                .iframe_on_events
                .clone()
                .or_else(|| cached.and_then(|c| c.iframe_on_events.clone()))
                .unwrap_or_default(),
        ),
        lifecycles: start.lifecycles.merged(cached.map(|c| &c.lifecycles)),
    }
}

/// What the modeled platform supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    /// Live property interception. Without it every guest runs in degrade mode.
    pub proxy: bool,
    /// Custom elements. Without it every guest runs in degrade mode.
    pub custom_elements: bool,
    /// Network fetch. Required.
    pub fetch: bool,
    /// Object urls for the blank execution context page.
    pub object_url: bool,
    /// Whether an execution context started on an object url navigates to the host
    /// origin once its document is rewritten.
    pub object_url_navigation: bool,
    /// Delay before a new execution context has a usable document; `None` never does.
    pub context_ready_after_ms: Option<i64>,
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self {
            proxy: true,
            custom_elements: true,
            fetch: true,
            object_url: true,
            object_url_navigation: true,
            context_ready_after_ms: Some(0),
        }
    }
}

impl PlatformProfile {
    pub fn supports_virtualization(&self) -> bool {
        self.proxy && self.custom_elements
    }
}

/// Small persisted key/value store standing in for local storage. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CapabilityStore {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn is_empty_page_url_disabled(&self) -> bool {
        self.get(DISABLE_EMPTY_PAGE_URL_KEY).as_deref() == Some("true")
    }
}
