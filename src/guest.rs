use super::*;

/// One script handed to the engine of an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub src: Option<String>,
    pub code: String,
    pub module: bool,
    /// Wrapped scripts see the virtual window as `window`/`self` and the virtual location
    /// as `location`; unwrapped ones see the raw context window.
    pub wrapped: bool,
}

/// Executes guest code inside an execution context.
pub trait ScriptEngine {
    fn evaluate(&self, scope: &mut GuestScope<'_>, source: &ScriptSource) -> Result<()>;
}

/// A guest bundle written in Rust. Runs with the scope of the evaluating context.
pub type GuestBundle = Rc<dyn Fn(&mut GuestScope<'_>) -> Result<()>>;

const BUNDLE_DIRECTIVE: &str = r"@bundle\s+([A-Za-z0-9_./:@-]+)";

/// Engine that maps `@bundle <name>` directives found in script text to registered
/// bundles. Directives run in order; text without a directive evaluates to nothing.
#[derive(Default)]
pub struct BundleEngine {
    bundles: RefCell<BTreeMap<String, GuestBundle>>,
}

impl fmt::Debug for BundleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleEngine")
            .field("bundles", &self.bundles.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BundleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, bundle: impl Fn(&mut GuestScope<'_>) -> Result<()> + 'static) {
        self.bundles
            .borrow_mut()
            .insert(name.to_string(), Rc::new(bundle));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.bundles.borrow().contains_key(name)
    }

    /// Names referenced by `code`, in order of appearance.
    pub fn directives(code: &str) -> Result<Vec<String>> {
        let pattern = Pattern::new(BUNDLE_DIRECTIVE)?;
        Ok(pattern
            .find_all(code)
            .iter()
            .filter_map(|matched| matched.group(1).map(ToOwned::to_owned))
            .collect())
    }
}

impl ScriptEngine for BundleEngine {
    fn evaluate(&self, scope: &mut GuestScope<'_>, source: &ScriptSource) -> Result<()> {
        for name in Self::directives(&source.code)? {
            let bundle = self.bundles.borrow().get(&name).cloned();
            let Some(bundle) = bundle else {
                return Err(Error::ScriptRuntime(format!("unknown bundle {name}")));
            };
            bundle(scope)?;
        }
        Ok(())
    }
}

/// Everything guest code can reach. A scope belongs to one app: reads and writes go
/// through that app's virtual window, document and location.
pub struct GuestScope<'a> {
    host: &'a mut HostPage,
    app: String,
    global: ObjectRef,
    this: Option<ObjectRef>,
}

impl<'a> GuestScope<'a> {
    pub(crate) fn new(host: &'a mut HostPage, app: &str) -> Self {
        let global = host.default_global(app);
        Self {
            host,
            app: app.to_string(),
            global,
            this: None,
        }
    }

    pub(crate) fn with_this(host: &'a mut HostPage, app: &str, this: Option<ObjectRef>) -> Self {
        let mut scope = Self::new(host, app);
        scope.this = this;
        scope
    }

    pub(crate) fn with_global(host: &'a mut HostPage, app: &str, global: ObjectRef) -> Self {
        Self {
            host,
            app: app.to_string(),
            global: global.clone(),
            this: Some(global),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub(crate) fn host(&mut self) -> &mut HostPage {
        &mut *self.host
    }

    /// Receiver the running function was bound to.
    pub fn this(&self) -> Option<ObjectRef> {
        self.this.clone()
    }

    /// The object guest code sees as `window`.
    pub fn global(&self) -> ObjectRef {
        self.global.clone()
    }

    pub fn now_ms(&self) -> i64 {
        self.host.event_loop.now_ms
    }

    pub fn window_get(&mut self, name: &str) -> Result<GlobalValue> {
        let global = self.global.clone();
        self.host.object_get(&global, name)
    }

    pub fn window_set(&mut self, name: &str, value: impl Into<GlobalValue>) -> Result<()> {
        let global = self.global.clone();
        self.host.object_set(&self.app, &global, name, value.into())
    }

    pub fn document_get(&mut self, name: &str) -> Result<GlobalValue> {
        self.host.document_get(&self.app, name)
    }

    pub fn document_set(&mut self, name: &str, value: impl Into<GlobalValue>) -> Result<()> {
        self.host.document_set(&self.app, name, value.into())
    }

    pub fn location_get(&mut self, name: &str) -> Result<GlobalValue> {
        self.host.location_get(&self.app, name)
    }

    pub fn location_set(&mut self, name: &str, value: &str) -> Result<()> {
        self.host.location_set(&self.app, name, value)
    }

    pub fn get(&mut self, object: &ObjectRef, name: &str) -> Result<GlobalValue> {
        self.host.object_get(object, name)
    }

    pub fn set(&mut self, object: &ObjectRef, name: &str, value: impl Into<GlobalValue>) -> Result<()> {
        self.host.object_set(&self.app, object, name, value.into())
    }

    pub fn call(&mut self, callee: &GlobalValue, args: &[GlobalValue]) -> Result<GlobalValue> {
        match callee {
            GlobalValue::Function(id) => self.host.call_function(&self.app, *id, args),
            other => Err(Error::ScriptRuntime(format!(
                "{} is not a function",
                other.as_text()
            ))),
        }
    }

    pub fn call_method(
        &mut self,
        object: &ObjectRef,
        name: &str,
        args: &[GlobalValue],
    ) -> Result<GlobalValue> {
        let callee = self.get(object, name)?;
        self.call(&callee, args)
    }

    /// Reads the function's own property, e.g. a marker a bundle attached to it.
    pub fn function_prop(&self, id: FnId, name: &str) -> GlobalValue {
        self.host.functions.prop(id, name)
    }

    pub fn set_function_prop(&mut self, id: FnId, name: &str, value: impl Into<GlobalValue>) -> Result<()> {
        self.host.functions.set_prop(id, name, value.into())
    }

    pub fn function_info(&self, id: FnId) -> Option<FunctionInfo> {
        self.host.functions.info(id)
    }

    pub fn define_function(
        &mut self,
        name: &str,
        body: impl Fn(&mut GuestScope<'_>, &[GlobalValue]) -> Result<GlobalValue> + 'static,
    ) -> FnId {
        self.host
            .functions
            .define_owned(name, Rc::new(body), false, Some(&self.app))
    }

    pub fn define_constructor(
        &mut self,
        name: &str,
        body: impl Fn(&mut GuestScope<'_>, &[GlobalValue]) -> Result<GlobalValue> + 'static,
    ) -> FnId {
        self.host
            .functions
            .define_owned(name, Rc::new(body), true, Some(&self.app))
    }

    pub fn create_element(&mut self, tag: &str) -> Result<NodeId> {
        let create = self.document_get("createElement")?;
        self.call(&create, &[GlobalValue::from(tag)])?
            .as_node()
            .ok_or_else(|| Error::ScriptRuntime("createElement returned no node".into()))
    }

    pub fn create_text(&mut self, text: &str) -> Result<NodeId> {
        let create = self.document_get("createTextNode")?;
        self.call(&create, &[GlobalValue::from(text)])?
            .as_node()
            .ok_or_else(|| Error::ScriptRuntime("createTextNode returned no node".into()))
    }

    pub fn query_selector(&mut self, selector: &str) -> Result<Option<NodeId>> {
        let query = self.document_get("querySelector")?;
        Ok(self.call(&query, &[GlobalValue::from(selector)])?.as_node())
    }

    pub fn query_selector_all(&mut self, selector: &str) -> Result<Vec<NodeId>> {
        let query = self.document_get("querySelectorAll")?;
        match self.call(&query, &[GlobalValue::from(selector)])? {
            GlobalValue::Nodes(nodes) => Ok(nodes),
            _ => Ok(Vec::new()),
        }
    }

    pub fn get_element_by_id(&mut self, id: &str) -> Result<Option<NodeId>> {
        let query = self.document_get("getElementById")?;
        Ok(self.call(&query, &[GlobalValue::from(id)])?.as_node())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<NodeId> {
        self.host.guest_insert(&self.app, parent, child, None)
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId> {
        self.host.guest_insert(&self.app, parent, child, reference)
    }

    /// Removes `child`. A script the sandbox moved into the execution context is looked
    /// up there; `None` when it is gone.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<Option<NodeId>> {
        self.host.guest_remove_child(&self.app, parent, child)
    }

    pub fn contains(&mut self, node: NodeId, other: NodeId) -> bool {
        self.host.guest_contains(&self.app, node, other)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        self.host.guest_set_attribute(&self.app, node, name, value)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.host.dom.attr(node, name)
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<()> {
        self.host.dom.remove_attr(node, name)
    }

    pub fn text(&self, node: NodeId) -> String {
        self.host.dom.text_content(node)
    }

    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<()> {
        self.host.guest_set_text(&self.app, node, text)
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        self.host.dom.inner_html(node)
    }

    pub fn set_inner_html(&mut self, node: NodeId, html: &str) -> Result<()> {
        self.host.guest_set_inner_html(&self.app, node, html)
    }

    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        self.host.dom.tag_name(node).map(ToOwned::to_owned)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.host.dom.parent(node)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.host.dom.children(node)
    }

    pub fn owner_document(&mut self, node: NodeId) -> GlobalValue {
        self.host.guest_owner_document(node)
    }

    pub fn root_node(&mut self, node: NodeId) -> GlobalValue {
        self.host.guest_root_node(node)
    }

    pub fn base_uri(&mut self, node: NodeId) -> String {
        self.host.guest_base_uri(node)
    }

    pub fn add_window_listener(&mut self, event_type: &str, handler: FnId) -> Result<()> {
        self.host.add_window_listener(&self.app, event_type, handler)
    }

    pub fn remove_window_listener(&mut self, event_type: &str, handler: FnId) -> Result<()> {
        self.host.remove_window_listener(&self.app, event_type, handler)
    }

    pub fn add_document_listener(&mut self, event_type: &str, handler: FnId) -> Result<()> {
        self.host.add_document_listener(&self.app, event_type, handler)
    }

    pub fn remove_document_listener(&mut self, event_type: &str, handler: FnId) -> Result<()> {
        self.host.remove_document_listener(&self.app, event_type, handler)
    }

    pub fn add_listener(&mut self, node: NodeId, event_type: &str, handler: FnId) -> Result<()> {
        self.host.add_node_listener(&self.app, node, event_type, handler)
    }

    pub fn remove_listener(&mut self, node: NodeId, event_type: &str, handler: FnId) -> Result<()> {
        self.host.remove_node_listener(&self.app, node, event_type, handler)
    }

    pub fn history_push(&mut self, url: &str) -> Result<()> {
        self.host.context_history_push(&self.app, url)
    }

    pub fn history_replace(&mut self, url: &str) -> Result<()> {
        self.host.context_history_replace(&self.app, url)
    }

    pub fn set_timeout(&mut self, callback: FnId, delay_ms: i64) -> Result<i64> {
        let serial = self.host.sandbox_serial(&self.app)?;
        Ok(self.host.event_loop.schedule(
            delay_ms,
            Task::GuestTimer {
                app: self.app.clone(),
                serial,
                callback,
            },
        ))
    }

    pub fn set_interval(&mut self, callback: FnId, interval_ms: i64) -> Result<i64> {
        let serial = self.host.sandbox_serial(&self.app)?;
        Ok(self.host.event_loop.schedule_repeating(
            interval_ms,
            Some(interval_ms),
            Task::GuestTimer {
                app: self.app.clone(),
                serial,
                callback,
            },
        ))
    }

    pub fn clear_timer(&mut self, id: i64) -> bool {
        self.host.event_loop.cancel(id)
    }

    pub fn bus(&self) -> Result<EventBus> {
        Ok(self.host.try_sandbox(&self.app)?.bus.clone())
    }

    pub fn props(&self) -> BTreeMap<String, GlobalValue> {
        self.host
            .sandbox(&self.app)
            .map(|sandbox| sandbox.props.clone())
            .unwrap_or_default()
    }

    pub fn prop(&self, name: &str) -> GlobalValue {
        self.host
            .sandbox(&self.app)
            .and_then(|sandbox| sandbox.props.get(name).cloned())
            .unwrap_or_default()
    }

    /// Mounts the app now. For guests whose bootstrap finishes after their entry script
    /// returned.
    pub fn mount_ready(&mut self) -> Result<()> {
        self.host.mount(&self.app, false)
    }

    /// Writes a line to the page trace, the way a guest console would.
    pub fn log(&mut self, message: &str) {
        self.host
            .trace_line(TraceCategory::Lifecycle, format!("[{}] {message}", self.app));
    }
}

impl HostPage {
    /// Window that code of `app` sees outside of a wrapped script.
    pub(crate) fn default_global(&self, app: &str) -> ObjectRef {
        match self.sandbox(app) {
            Some(sandbox) if sandbox.degrade => ObjectRef::ContextWindow(app.to_string()),
            _ => ObjectRef::VirtualWindow(app.to_string()),
        }
    }

    /// Calls `id` with its bound receiver. Functions defined by an app run in that app's
    /// scope; others run in the scope of `app`.
    pub(crate) fn call_function(
        &mut self,
        app: &str,
        id: FnId,
        args: &[GlobalValue],
    ) -> Result<GlobalValue> {
        let def = self.functions.get(id)?.clone();
        let owner = def.owner.clone().unwrap_or_else(|| app.to_string());
        let mut scope = GuestScope::with_this(self, &owner, def.bound_this.clone());
        (def.body)(&mut scope, args)
    }

    /// Guest callback invoked by the page itself. Errors are logged like uncaught
    /// exceptions.
    pub(crate) fn call_guest_function(
        &mut self,
        app: &str,
        id: FnId,
        args: &[GlobalValue],
    ) -> GlobalValue {
        match self.call_function(app, id, args) {
            Ok(value) => value,
            Err(err) => {
                self.trace
                    .borrow_mut()
                    .error(format!("uncaught error in {app}: {err}"));
                GlobalValue::Undefined
            }
        }
    }

    pub(crate) fn evaluate_script(&mut self, app: &str, source: &ScriptSource) -> Result<()> {
        let degrade = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox
                .context
                .executed
                .push(source.src.clone().unwrap_or_else(|| "inline".to_string()));
            sandbox.degrade
        };
        let global = if source.wrapped && !degrade && !source.module {
            ObjectRef::VirtualWindow(app.to_string())
        } else {
            ObjectRef::ContextWindow(app.to_string())
        };
        self.trace_line(
            TraceCategory::Lifecycle,
            format!(
                "evaluate app={app} src={} wrapped={}",
                source.src.as_deref().unwrap_or("inline"),
                matches!(global, ObjectRef::VirtualWindow(_))
            ),
        );
        let engine = self.engine.clone();
        let mut scope = GuestScope::with_global(self, app, global);
        engine.evaluate(&mut scope, source)
    }

    /// Runs `f` with the guest scope of `app`, then lets the page catch up on whatever
    /// the guest queued.
    pub fn with_guest<R>(
        &mut self,
        app: &str,
        f: impl FnOnce(&mut GuestScope<'_>) -> Result<R>,
    ) -> Result<R> {
        self.try_sandbox(app)?;
        let result = {
            let mut scope = GuestScope::new(self, app);
            f(&mut scope)?
        };
        self.pump()?;
        self.surface_failures()?;
        Ok(result)
    }

    /// Registers a host-side function, e.g. a host global a guest may read.
    pub fn define_function(
        &mut self,
        name: &str,
        body: impl Fn(&mut GuestScope<'_>, &[GlobalValue]) -> Result<GlobalValue> + 'static,
    ) -> FnId {
        self.functions.define(name, Rc::new(body), false)
    }

    pub fn function_info(&self, id: FnId) -> Option<FunctionInfo> {
        self.functions.info(id)
    }
}
