use super::*;

/// Bus id of the host page's own handle.
const HOST_BUS_ID: &str = "__host__";

/// Construction settings of a [`HostPage`].
#[derive(Clone)]
pub struct HostConfig {
    url: String,
    html: String,
    profile: PlatformProfile,
    capabilities: CapabilityStore,
    engine: Option<Rc<dyn ScriptEngine>>,
    fetcher: Option<Rc<dyn Fetcher>>,
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("url", &self.url)
            .field("profile", &self.profile)
            .field("engine", &self.engine.is_some())
            .field("fetcher", &self.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new("http://localhost/")
    }
}

impl HostConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: String::new(),
            profile: PlatformProfile::default(),
            capabilities: CapabilityStore::new(),
            engine: None,
            fetcher: None,
        }
    }

    /// Initial markup of the host document.
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn profile(mut self, profile: PlatformProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Persisted store; pass the same store to a second page to model a reload.
    pub fn capabilities(mut self, capabilities: CapabilityStore) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn engine(mut self, engine: Rc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn fetcher(mut self, fetcher: Rc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> Result<HostPage> {
        HostPage::with_config(self)
    }
}

/// The modeled host page: its document, url and history, the shared content cache and
/// event loop, and every sandbox started on it.
pub struct HostPage {
    pub(crate) dom: Dom,
    pub(crate) document: NodeId,
    pub(crate) location: LocationParts,
    pub(crate) history: HostHistory,
    pub(crate) profile: PlatformProfile,
    pub(crate) capabilities: CapabilityStore,
    pub(crate) functions: FunctionTable,
    pub(crate) event_loop: EventLoop,
    pub(crate) trace: SharedTrace,
    pub(crate) cache: ContentCache,
    pub(crate) registry: BTreeMap<String, SandboxEntry>,
    pub(crate) style_jobs: Vec<StyleJob>,
    pub(crate) private_html: HashMap<u64, Option<FetchOutcome>>,
    pub(crate) dynamic_chain: VecDeque<DynamicJob>,
    pub(crate) pumping: bool,
    pub(crate) next_token: u64,
    pub(crate) next_script_tag: u64,
    pub(crate) next_serial: u64,
    pub(crate) host_window_listeners: Vec<WindowListener>,
    pub(crate) host_globals: BTreeMap<String, PropertySlot>,
    pub(crate) host_document_props: BTreeMap<String, GlobalValue>,
    pub(crate) host_document_methods: BTreeMap<String, FnId>,
    pub(crate) noop: FnId,
    pub(crate) engine: Rc<dyn ScriptEngine>,
    pub(crate) fetcher: Rc<dyn Fetcher>,
    pub(crate) buses: Rc<RefCell<BusRegistry>>,
    /// Activation failures not yet returned to the caller.
    pub(crate) failures: Vec<Error>,
}

impl fmt::Debug for HostPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPage")
            .field("href", &self.location.href())
            .field("now_ms", &self.event_loop.now_ms)
            .field("apps", &self.registry.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn host_document_method(name: &'static str) -> NativeFn {
    Rc::new(move |_scope, _args| {
        Ok(match name {
            "hasFocus" => GlobalValue::Bool(true),
            "execCommand" => GlobalValue::Bool(false),
            _ => GlobalValue::Undefined,
        })
    })
}

impl HostPage {
    pub fn from_html(html: &str) -> Result<Self> {
        HostConfig::default().html(html).build()
    }

    pub fn from_html_with_url(url: &str, html: &str) -> Result<Self> {
        HostConfig::new(url).html(html).build()
    }

    pub fn with_config(config: HostConfig) -> Result<Self> {
        if !config.profile.fetch {
            return Err(Error::EnvironmentUnsupported(
                "the platform has no network fetch".into(),
            ));
        }
        let location = LocationParts::parse(&config.url)
            .ok_or_else(|| Error::Configuration(format!("invalid host url {}", config.url)))?;
        let href = location.href();

        let mut dom = Dom::new();
        let document = dom.create_html_document(&href)?;
        if !config.html.is_empty() {
            let html = dom
                .first_element_child(document)
                .ok_or_else(|| Error::DomOperation("host document has no html element".into()))?;
            for child in dom.children(html) {
                dom.detach(child)?;
            }
            let holder = dom.create_element(document, "template");
            parse_into(&mut dom, holder, document, &config.html)?;
            fill_html_element(&mut dom, html, holder)?;
        }

        let mut functions = FunctionTable::default();
        let mut host_globals = BTreeMap::new();
        seed_window_globals(
            &mut functions,
            &mut host_globals,
            &[
                ("innerWidth", 1280.0),
                ("innerHeight", 720.0),
                ("outerWidth", 1280.0),
                ("screenX", 0.0),
                ("screenY", 0.0),
                ("scrollX", 0.0),
                ("scrollY", 0.0),
            ],
        );
        let noop = functions.define("noop", Rc::new(|_, _| Ok(GlobalValue::Undefined)), false);
        let host_document_methods = HOST_DOCUMENT_METHODS
            .iter()
            .map(|&name| {
                let id = functions.define(name, host_document_method(name), false);
                (name.to_string(), id)
            })
            .collect();
        let host_document_props = [
            ("characterSet", GlobalValue::from("UTF-8")),
            ("compatMode", GlobalValue::from("CSS1Compat")),
            ("contentType", GlobalValue::from("text/html")),
            ("designMode", GlobalValue::from("off")),
            ("dir", GlobalValue::from("")),
            ("fullscreenEnabled", GlobalValue::Bool(true)),
            ("hidden", GlobalValue::Bool(false)),
            ("lastModified", GlobalValue::from("")),
            ("pictureInPictureEnabled", GlobalValue::Bool(false)),
            ("readyState", GlobalValue::from("complete")),
            ("referrer", GlobalValue::from("")),
            ("visibilityState", GlobalValue::from("visible")),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let trace = TraceState::shared();
        Ok(Self {
            dom,
            document,
            history: HostHistory::new(&href),
            location,
            profile: config.profile,
            capabilities: config.capabilities,
            functions,
            event_loop: EventLoop::default(),
            cache: ContentCache::default(),
            registry: BTreeMap::new(),
            style_jobs: Vec::new(),
            private_html: HashMap::new(),
            dynamic_chain: VecDeque::new(),
            pumping: false,
            next_token: 0,
            next_script_tag: 0,
            next_serial: 0,
            host_window_listeners: Vec::new(),
            host_globals,
            host_document_props,
            host_document_methods,
            noop,
            engine: config
                .engine
                .unwrap_or_else(|| Rc::new(BundleEngine::new())),
            fetcher: config
                .fetcher
                .unwrap_or_else(|| Rc::new(MockNetwork::new())),
            buses: Rc::new(RefCell::new(BusRegistry::default())),
            failures: Vec::new(),
            trace,
        })
    }

    pub(crate) fn host_body(&self) -> Result<NodeId> {
        self.dom
            .first_element_child(self.document)
            .and_then(|html| self.dom.child_by_tag(html, "body"))
            .ok_or_else(|| Error::DomOperation("host document has no body".into()))
    }

    pub(crate) fn trace_line(&self, category: TraceCategory, message: impl AsRef<str>) {
        self.trace.borrow_mut().line(category, message);
    }

    /// Returns the oldest activation failure recorded since the last driving call.
    pub(crate) fn surface_failures(&mut self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let first = self.failures.remove(0);
        self.failures.clear();
        Err(first)
    }

    /// Caches options for `options.name`; a later start or preload only needs the name.
    pub fn setup_app(&mut self, options: AppOptions) -> Result<()> {
        if options.name.is_empty() {
            return Err(Error::Configuration("app name is required".into()));
        }
        let name = options.name.clone();
        self.registry.entry(name.clone()).or_default().options = Some(options);
        self.trace_line(TraceCategory::Lifecycle, format!("setup app={name}"));
        Ok(())
    }

    /// Starts `options.name`, or re-enters it when it already exists. Work that does
    /// not wait on the clock runs before this returns; run the event loop for the rest.
    pub fn start_app(&mut self, options: AppOptions) -> Result<AppHandle> {
        let name = options.name.clone();
        self.start_sandbox(options)?;
        self.pump()?;
        self.surface_failures()?;
        let serial = self.sandbox_serial(&name)?;
        Ok(AppHandle { name, serial })
    }

    /// Loads `options.name` in the background one tick from now, without showing it.
    pub fn preload_app(&mut self, options: AppOptions) -> Result<()> {
        if options.name.is_empty() {
            return Err(Error::Configuration("app name is required".into()));
        }
        self.trace_line(
            TraceCategory::Lifecycle,
            format!("preload scheduled app={}", options.name),
        );
        self.event_loop.schedule(1, Task::Preload { options });
        Ok(())
    }

    /// Destroys the sandbox of `name`. Unknown names are ignored.
    pub fn destroy_app(&mut self, name: &str) -> Result<()> {
        self.destroy_sandbox(name)?;
        self.pump()?;
        self.surface_failures()
    }

    pub fn app_state(&self, name: &str) -> Option<SandboxState> {
        self.sandbox(name).map(|sandbox| sandbox.state)
    }

    pub fn has_app(&self, name: &str) -> bool {
        self.sandbox(name).is_some()
    }

    pub fn is_degraded(&self, name: &str) -> Option<bool> {
        self.sandbox(name).map(|sandbox| sandbox.degrade)
    }

    /// The `sandbox-app` element (or degrade iframe) of `name`.
    pub fn container_host(&self, name: &str) -> Option<NodeId> {
        self.sandbox(name).and_then(|sandbox| sandbox.container.host)
    }

    /// Shadow root, or the degrade document, of `name`.
    pub fn rendering_root(&self, name: &str) -> Option<NodeId> {
        self.sandbox(name).and_then(|sandbox| sandbox.container.root)
    }

    /// Guest-visible href of `name`.
    pub fn app_href(&self, name: &str) -> Option<String> {
        self.sandbox(name).map(virtual_href)
    }

    /// Handle on the host's own bus; it reaches every app bus.
    pub fn bus(&self) -> EventBus {
        EventBus::attach(HOST_BUS_ID, self.buses.clone(), self.trace.clone())
    }

    /// Number of handlers registered under the bus id of `name`.
    pub fn bus_handler_count(&self, name: &str) -> usize {
        self.buses.borrow().handler_count(name)
    }

    pub fn capabilities(&self) -> &CapabilityStore {
        &self.capabilities
    }

    pub fn document(&self) -> NodeId {
        self.document
    }

    pub fn body(&self) -> Result<NodeId> {
        self.host_body()
    }

    pub fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        self.dom.query_selector_from(self.document, selector)
    }

    /// Matches inside `root`, e.g. a shadow root the host selector cannot see into.
    pub fn query_selector_in(&self, root: NodeId, selector: &str) -> Result<Option<NodeId>> {
        self.dom.query_selector_from(root, selector)
    }

    pub fn query_selector_all_in(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        self.dom.query_selector_all_from(root, selector)
    }

    pub fn outer_html(&self, node: NodeId) -> String {
        self.dom.outer_html(node)
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        self.dom.inner_html(node)
    }

    pub fn text_content(&self, node: NodeId) -> String {
        self.dom.text_content(node)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.dom.attr(node, name)
    }

    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.dom.parent(node)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.dom.children(node)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.dom.is_connected(node)
    }

    pub fn host_global(&self, name: &str) -> GlobalValue {
        self.host_globals
            .get(name)
            .map(|slot| slot.value.clone())
            .unwrap_or_default()
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace.borrow_mut().enabled = enabled;
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace.borrow_mut().to_stderr = enabled;
    }

    pub fn set_trace_log_limit(&mut self, max_entries: usize) -> Result<()> {
        self.trace.borrow_mut().set_log_limit(max_entries)
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        self.trace.borrow_mut().take()
    }

    /// Warnings logged so far, oldest first.
    pub fn warnings(&self) -> Vec<String> {
        self.trace.borrow().warnings()
    }
}

/// The result of a start. Destroying through a handle whose sandbox has since been
/// replaced does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppHandle {
    name: String,
    serial: u64,
}

impl AppHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self, host: &HostPage) -> bool {
        host.sandbox_is_live(&self.name, self.serial)
    }

    pub fn destroy(&self, host: &mut HostPage) -> Result<()> {
        if !self.is_current(host) {
            return Ok(());
        }
        host.destroy_app(&self.name)
    }
}
