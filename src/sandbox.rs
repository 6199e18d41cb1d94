use super::*;

/// Observable phase of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    /// Resources are being fetched or the execution context is not ready yet.
    Loading,
    /// Rendered, scripts running or done, no mount entry point called yet.
    Active,
    Mounted,
    /// Kept alive and hidden.
    Deactivated,
    Unmounted,
    /// The last start failed; the next start rebuilds the sandbox.
    Failed,
}

/// Registry slot of one app name: the options cached by setup or start, and the live
/// sandbox if one exists.
#[derive(Default)]
pub(crate) struct SandboxEntry {
    pub(crate) options: Option<AppOptions>,
    pub(crate) sandbox: Option<Sandbox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineKind {
    Start,
    Preload { exec: bool },
    /// Re-entry of a kept-alive app that never executed.
    Resume,
}

#[derive(Debug, Clone)]
pub(crate) enum PipelineStage {
    AwaitHtml(HtmlSource),
    AwaitStyles(ParsedTemplate),
    AwaitContext {
        parsed: ParsedTemplate,
        template: String,
    },
    AwaitScripts(ParsedTemplate),
    /// The scheduler owns the rest of the run.
    Running,
}

/// An activation in flight. `advance_pipelines` moves it forward whenever the
/// resource it waits on settles.
#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    pub(crate) kind: PipelineKind,
    pub(crate) stage: PipelineStage,
    pub(crate) options: AppOptions,
}

pub(crate) struct Sandbox {
    pub(crate) name: String,
    /// Distinguishes this sandbox from earlier ones of the same name; queued work
    /// carrying an older serial is dropped.
    pub(crate) serial: u64,
    pub(crate) url: String,
    pub(crate) url_parts: LocationParts,
    pub(crate) app_host_path: String,
    pub(crate) app_route_path: String,
    pub(crate) main_host_path: String,
    pub(crate) degrade: bool,
    pub(crate) alive: bool,
    pub(crate) sync: bool,
    pub(crate) fiber: bool,
    pub(crate) exec_flag: bool,
    pub(crate) mount_flag: bool,
    pub(crate) active_flag: bool,
    /// Set while the app view is replaced by a `location.href` jump.
    pub(crate) href_flag: bool,
    pub(crate) prefix: BTreeMap<String, String>,
    pub(crate) replace: Option<HtmlTransform>,
    pub(crate) props: BTreeMap<String, GlobalValue>,
    pub(crate) plugins: PluginChain,
    pub(crate) lifecycles: Lifecycles,
    pub(crate) fetcher: Option<Rc<dyn Fetcher>>,
    pub(crate) degrade_attrs: BTreeMap<String, String>,
    pub(crate) iframe_on_events: Vec<String>,
    pub(crate) iframe_add_event_listeners: Vec<String>,
    pub(crate) context: ExecutionContext,
    pub(crate) container: RenderingContainer,
    pub(crate) backend: Backend,
    /// Styles the guest added at runtime, restored on remount.
    pub(crate) style_sheets: Vec<NodeId>,
    pub(crate) patched_styles: HashSet<NodeId>,
    pub(crate) pending_style_patches: HashSet<NodeId>,
    pub(crate) bus: EventBus,
    pub(crate) template: String,
    pub(crate) exec_queue: ExecQueue,
    pub(crate) async_jobs: Vec<ScriptJob>,
    pub(crate) idle_work: HashMap<u64, IdleWork>,
    pub(crate) outline_scripts: HashMap<NodeId, ScriptJob>,
    pub(crate) pipeline: Option<Pipeline>,
    /// A start requested while a pipeline was running; replayed when it finishes.
    pub(crate) pending_start: Option<AppOptions>,
    pub(crate) state: SandboxState,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("url", &self.url)
            .field("degrade", &self.degrade)
            .field("alive", &self.alive)
            .field("exec_flag", &self.exec_flag)
            .field("mount_flag", &self.mount_flag)
            .field("active_flag", &self.active_flag)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Guest url of the current route, without query and hash.
    pub(crate) fn current_url(&self) -> String {
        let pathname = if self.context.is_ready() {
            &self.context.location.pathname
        } else {
            &self.url_parts.pathname
        };
        format!("{}{}", self.app_host_path, pathname)
    }
}

fn parse_app_url(url: &str, base: &str) -> Result<(String, LocationParts)> {
    let absolute = resolve_url(url, base)
        .ok_or_else(|| Error::Configuration(format!("invalid app url {url}")))?;
    let parts = LocationParts::parse(&absolute)
        .ok_or_else(|| Error::Configuration(format!("invalid app url {url}")))?;
    Ok((absolute, parts))
}

impl HostPage {
    pub(crate) fn sandbox(&self, app: &str) -> Option<&Sandbox> {
        self.registry.get(app).and_then(|entry| entry.sandbox.as_ref())
    }

    pub(crate) fn sandbox_mut(&mut self, app: &str) -> Option<&mut Sandbox> {
        self.registry
            .get_mut(app)
            .and_then(|entry| entry.sandbox.as_mut())
    }

    pub(crate) fn try_sandbox(&self, app: &str) -> Result<&Sandbox> {
        self.sandbox(app)
            .ok_or_else(|| Error::NotFound(format!("sandbox {app}")))
    }

    pub(crate) fn try_sandbox_mut(&mut self, app: &str) -> Result<&mut Sandbox> {
        self.sandbox_mut(app)
            .ok_or_else(|| Error::NotFound(format!("sandbox {app}")))
    }

    pub(crate) fn sandbox_is_live(&self, app: &str, serial: u64) -> bool {
        self.sandbox(app).is_some_and(|sandbox| sandbox.serial == serial)
    }

    pub(crate) fn sandbox_serial(&self, app: &str) -> Result<u64> {
        Ok(self.try_sandbox(app)?.serial)
    }

    /// Calls the hook `pick` selects from the lifecycles of `app`, if any.
    pub(crate) fn run_lifecycle(
        &self,
        app: &str,
        pick: impl Fn(&Lifecycles) -> Option<&LifecycleHook>,
    ) {
        let hook = self
            .sandbox(app)
            .and_then(|sandbox| pick(&sandbox.lifecycles).cloned());
        if let Some(hook) = hook {
            hook(app);
        }
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Builds the sandbox of `options.name` with its execution context and registers
    /// it. The context becomes usable only after its probe ran.
    pub(crate) fn create_sandbox(&mut self, options: &AppOptions) -> Result<()> {
        let name = options.name.clone();
        let url = options
            .url
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("{name}: {WARN_NO_URL}")))?;
        let (url, url_parts) = parse_app_url(url, &self.location.href())?;

        let supported = self.profile.supports_virtualization();
        if !supported {
            self.trace.borrow_mut().warn(WARN_NOT_SUPPORTED);
        }
        let degrade = options.is_degrade() || !supported;
        let serial = self.next_serial();
        let main_host_path = self.location.host_path();
        let attrs = options.attrs.clone().unwrap_or_default();
        let context = self.create_execution_context(&name, serial, &attrs, &main_host_path)?;
        let backend = if degrade {
            Backend::Static(StaticTable::build(&url_parts))
        } else {
            Backend::Live
        };

        let sandbox = Sandbox {
            name: name.clone(),
            serial,
            app_host_path: url_parts.host_path(),
            app_route_path: url_parts.route_path(),
            url,
            url_parts,
            main_host_path,
            degrade,
            alive: options.is_alive(),
            sync: options.is_sync(),
            fiber: options.is_fiber(),
            exec_flag: false,
            mount_flag: false,
            active_flag: false,
            href_flag: false,
            prefix: options.prefix.clone().unwrap_or_default(),
            replace: options.replace.clone(),
            props: options.props.clone().unwrap_or_default(),
            plugins: PluginChain::new(options.plugins.as_deref().unwrap_or_default()),
            lifecycles: options.lifecycles.clone(),
            fetcher: options.fetch.clone(),
            degrade_attrs: options.degrade_attrs.clone().unwrap_or_default(),
            iframe_on_events: options.iframe_on_events.clone().unwrap_or_default(),
            iframe_add_event_listeners: options
                .iframe_add_event_listeners
                .clone()
                .unwrap_or_default(),
            context,
            container: RenderingContainer::default(),
            backend,
            style_sheets: Vec::new(),
            patched_styles: HashSet::new(),
            pending_style_patches: HashSet::new(),
            bus: EventBus::create(&name, self.buses.clone(), self.trace.clone()),
            template: String::new(),
            exec_queue: ExecQueue::default(),
            async_jobs: Vec::new(),
            idle_work: HashMap::new(),
            outline_scripts: HashMap::new(),
            pipeline: None,
            pending_start: None,
            state: SandboxState::Created,
        };
        self.registry.entry(name.clone()).or_default().sandbox = Some(sandbox);
        self.trace_line(
            TraceCategory::Lifecycle,
            format!("sandbox created app={name} serial={serial} degrade={degrade}"),
        );
        Ok(())
    }

    /// Shows `app` with the given options: refreshes its configuration, syncs urls and
    /// renders the template into a shadow root or, in degrade mode, a nested document.
    pub(crate) fn activate(
        &mut self,
        app: &str,
        options: &AppOptions,
        template: Option<String>,
    ) -> Result<()> {
        let el = self.resolve_mount_target(options.el.as_ref())?;
        let base = self.location.href();
        {
            let sandbox = self.try_sandbox_mut(app)?;
            if let Some(url) = options.url.as_deref() {
                let (url, url_parts) = parse_app_url(url, &base)?;
                sandbox.url = url;
                sandbox.url_parts = url_parts;
            }
            sandbox.sync = options.is_sync();
            sandbox.alive = options.is_alive();
            sandbox.href_flag = false;
            if let Some(prefix) = &options.prefix {
                sandbox.prefix = prefix.clone();
            }
            if let Some(replace) = &options.replace {
                sandbox.replace = Some(replace.clone());
            }
            if let Some(props) = &options.props {
                sandbox.props = props.clone();
            }
            if let Some(fetch) = &options.fetch {
                sandbox.fetcher = Some(fetch.clone());
            }
            if let Some(template) = template {
                sandbox.template = template;
            }
            sandbox.active_flag = true;
            if matches!(sandbox.state, SandboxState::Deactivated | SandboxState::Unmounted) {
                sandbox.state = SandboxState::Active;
            }
        }
        self.refresh_static_table(app)?;

        let (exec_flag, alive) = {
            let sandbox = self.try_sandbox(app)?;
            (sandbox.exec_flag, sandbox.alive)
        };
        if !(exec_flag && alive) {
            self.sync_url_to_iframe(app)?;
        }
        self.sync_url_to_window(app)?;

        let (degrade, template, degrade_attrs, container) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.degrade,
                sandbox.template.clone(),
                sandbox.degrade_attrs.clone(),
                sandbox.container.clone(),
            )
        };
        let context_body = self.context_body(app)?;
        let parent = el.unwrap_or(context_body);

        if degrade {
            if let Some(old_frame) = container.host {
                if let Some(old_parent) = self.dom.parent(old_frame) {
                    self.dom.remove_child(old_parent, old_frame)?;
                }
            }
            let (iframe, document) =
                self.init_render_iframe_and_container(app, parent, &degrade_attrs)?;
            if el.is_some() {
                self.clear_child(context_body)?;
            }
            let old_html = container
                .root
                .and_then(|root| self.dom.first_element_child(root));
            match old_html {
                Some(old_html) if alive => {
                    for child in self.dom.children(document) {
                        self.dom.detach(child)?;
                    }
                    self.dom.append_child(document, old_html)?;
                }
                Some(old_html) => {
                    self.render_template_to_iframe(app, document, &template)?;
                    if let Some(new_html) = self.dom.first_element_child(document) {
                        self.recover_document_listeners(old_html, new_html)?;
                    }
                }
                None => self.render_template_to_iframe(app, document, &template)?,
            }
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.container.host = Some(iframe);
            sandbox.container.root = Some(document);
            sandbox.container.el = Some(parent);
            self.trace_line(TraceCategory::Render, format!("activated app={app} degrade"));
            return Ok(());
        }

        match (container.host, container.root) {
            (Some(host), Some(_)) => {
                self.render_element_to_container(host, parent)?;
                self.try_sandbox_mut(app)?.container.el = Some(parent);
                if alive {
                    self.trace_line(TraceCategory::Render, format!("re-shown app={app}"));
                    return Ok(());
                }
            }
            _ => {
                let host = self.create_container_host(app)?;
                self.render_element_to_container(host, parent)?;
                let root = self.dom.attach_shadow(host)?;
                let container = &mut self.try_sandbox_mut(app)?.container;
                container.host = Some(host);
                container.root = Some(root);
                container.el = Some(parent);
            }
        }
        self.render_template_to_shadow_root(app, &template)?;
        self.patch_css_rules(app)?;
        self.trace_line(TraceCategory::Render, format!("activated app={app}"));
        Ok(())
    }

    /// Hides `app`. A kept-alive app only deactivates; otherwise the guest unmount
    /// entry point runs and the rendered document is cleared.
    pub(crate) fn unmount(&mut self, app: &str) -> Result<()> {
        let Some(sandbox) = self.sandbox_mut(app) else {
            return Ok(());
        };
        sandbox.active_flag = false;
        let alive = sandbox.alive;
        self.clear_inactive_app_url()?;
        if alive {
            self.run_lifecycle(app, |hooks| hooks.deactivated.as_ref());
            self.try_sandbox_mut(app)?.state = SandboxState::Deactivated;
        }

        let (mount_flag, href_flag, degrade, unmount_fn) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.mount_flag,
                sandbox.href_flag,
                sandbox.degrade,
                sandbox.context.global(UNMOUNT_GLOBAL).as_function(),
            )
        };
        if !mount_flag {
            return Ok(());
        }
        let Some(unmount_fn) = unmount_fn.filter(|_| !alive && !href_flag) else {
            return Ok(());
        };

        self.run_lifecycle(app, |hooks| hooks.before_unmount.as_ref());
        self.call_guest_function(app, unmount_fn, &[]);
        self.run_lifecycle(app, |hooks| hooks.after_unmount.as_ref());
        let (root, head, body, listeners) = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.mount_flag = false;
            sandbox.state = SandboxState::Unmounted;
            sandbox.bus.clear();
            (
                sandbox.container.root,
                sandbox.container.head,
                sandbox.container.body,
                std::mem::take(&mut sandbox.container.listener_cache),
            )
        };
        if !degrade {
            if let Some(root) = root {
                self.clear_child(root)?;
            }
            for (node, listener) in listeners {
                self.dom
                    .remove_listener(node, &listener.event_type, listener.handler)?;
            }
        }
        for node in [head, body].into_iter().flatten() {
            self.clear_child(node)?;
        }
        self.trace_line(TraceCategory::Lifecycle, format!("unmounted app={app}"));
        Ok(())
    }

    /// Unmounts `app` and drops everything it owns. The options cached for the name
    /// survive, so a later start only needs the name.
    pub(crate) fn destroy_sandbox(&mut self, app: &str) -> Result<()> {
        if self.sandbox(app).is_none() {
            return Ok(());
        }
        self.unmount(app)?;
        let Some(sandbox) = self
            .registry
            .get_mut(app)
            .and_then(|entry| entry.sandbox.take())
        else {
            return Ok(());
        };
        sandbox.bus.release();
        self.host_window_listeners
            .retain(|listener| listener.app != app);
        if let Some(PipelineStage::AwaitHtml(HtmlSource::Private { token, .. })) =
            sandbox.pipeline.as_ref().map(|pipeline| &pipeline.stage)
        {
            self.private_html.remove(token);
        }
        if let Some(el) = sandbox.container.el.filter(|el| self.dom.is_valid(*el)) {
            self.clear_child(el)?;
        }
        let iframe = sandbox.context.iframe;
        if let Some(parent) = self.dom.parent(iframe) {
            self.dom.remove_child(parent, iframe)?;
        }
        self.dom.content_documents.remove(&iframe);
        for target in [
            ObjectRef::VirtualWindow(app.to_string()),
            ObjectRef::VirtualDocument(app.to_string()),
            ObjectRef::VirtualLocation(app.to_string()),
            ObjectRef::ContextWindow(app.to_string()),
            ObjectRef::ContextDocument(app.to_string()),
        ] {
            self.functions.clear_target(&target);
        }
        let mut keep: HashSet<FnId> = self
            .host_globals
            .values()
            .filter_map(|slot| slot.value.as_function())
            .collect();
        keep.extend(
            self.dom
                .nodes
                .iter()
                .flat_map(|node| node.listeners.iter().map(|listener| listener.handler)),
        );
        self.functions.release_owner(app, &keep);
        if self
            .registry
            .get(app)
            .is_some_and(|entry| entry.options.is_none())
        {
            self.registry.remove(app);
        }
        self.trace_line(
            TraceCategory::Lifecycle,
            format!("destroyed app={app} serial={}", sandbox.serial),
        );
        Ok(())
    }

    /// Starts or re-enters `options.name`. Returns once the work that does not wait on
    /// the clock is done; the rest continues as the event loop runs.
    pub(crate) fn start_sandbox(&mut self, options: AppOptions) -> Result<()> {
        let name = options.name.clone();
        if name.is_empty() {
            return Err(Error::Configuration("app name is required".into()));
        }
        let cached = self.registry.get(&name).and_then(|entry| entry.options.clone());
        let options = merge_options(&options, cached.as_ref());
        if options.url.is_none() {
            self.trace.borrow_mut().warn(WARN_NO_URL);
            return Err(Error::Configuration(format!("{name}: {WARN_NO_URL}")));
        }

        if let Some(state) = self.sandbox(&name).map(|sandbox| sandbox.state) {
            if state == SandboxState::Failed {
                self.destroy_sandbox(&name)?;
            } else {
                let sandbox = self.try_sandbox_mut(&name)?;
                sandbox.plugins = PluginChain::new(options.plugins.as_deref().unwrap_or_default());
                sandbox.lifecycles = options.lifecycles.clone();
                if sandbox.pipeline.is_some() {
                    sandbox.pending_start = Some(options);
                    self.trace_line(
                        TraceCategory::Lifecycle,
                        format!("start of {name} deferred until its pipeline finishes"),
                    );
                    return Ok(());
                }
                if self.reenter_sandbox(&name, &options)? {
                    return Ok(());
                }
            }
        }

        if let Some(el) = self.resolve_mount_target(options.el.as_ref())? {
            self.add_loading(el, options.loading.as_deref())?;
        }
        self.create_sandbox(&options)?;
        self.run_lifecycle(&name, |hooks| hooks.before_load.as_ref());
        let source = self.request_html(&name, &options)?;
        let sandbox = self.try_sandbox_mut(&name)?;
        sandbox.state = SandboxState::Loading;
        sandbox.pipeline = Some(Pipeline {
            kind: PipelineKind::Start,
            stage: PipelineStage::AwaitHtml(source),
            options,
        });
        Ok(())
    }

    /// Re-entry of an existing sandbox. Returns false when it had to be destroyed and
    /// the caller should build a fresh one.
    fn reenter_sandbox(&mut self, name: &str, options: &AppOptions) -> Result<bool> {
        let (exec_flag, mount_fn) = {
            let sandbox = self.try_sandbox(name)?;
            (
                sandbox.exec_flag,
                sandbox.context.global(MOUNT_GLOBAL).as_function(),
            )
        };

        if options.is_alive() {
            self.activate(name, options, None)?;
            if exec_flag {
                self.run_lifecycle(name, |hooks| hooks.activated.as_ref());
                return Ok(true);
            }
            self.run_lifecycle(name, |hooks| hooks.before_load.as_ref());
            let source = self.request_html(name, options)?;
            self.try_sandbox_mut(name)?.pipeline = Some(Pipeline {
                kind: PipelineKind::Resume,
                stage: PipelineStage::AwaitHtml(source),
                options: options.clone(),
            });
            return Ok(true);
        }

        if let Some(mount_fn) = mount_fn {
            self.unmount(name)?;
            self.activate(name, options, None)?;
            self.rebuild_style_sheets(name)?;
            self.remove_loading(name)?;
            self.run_lifecycle(name, |hooks| hooks.before_mount.as_ref());
            self.call_guest_function(name, mount_fn, &[]);
            self.run_lifecycle(name, |hooks| hooks.after_mount.as_ref());
            let sandbox = self.try_sandbox_mut(name)?;
            sandbox.mount_flag = true;
            sandbox.state = SandboxState::Mounted;
            self.trace_line(TraceCategory::Lifecycle, format!("remounted app={name}"));
            return Ok(true);
        }

        self.destroy_sandbox(name)?;
        Ok(false)
    }

    /// Runs a scheduled preload unless the app already exists or the host url carries
    /// its route, in which case a start is expected to follow.
    pub(crate) fn run_preload(&mut self, options: AppOptions) -> Result<()> {
        let name = options.name.clone();
        if self.sandbox(&name).is_some() || self.sync_query_has(&name) {
            self.trace_line(TraceCategory::Lifecycle, format!("preload of {name} skipped"));
            return Ok(());
        }
        let cached = self.registry.get(&name).and_then(|entry| entry.options.clone());
        let options = merge_options(&options, cached.as_ref());
        if options.url.is_none() {
            self.trace.borrow_mut().warn(WARN_NO_URL);
            self.failures
                .push(Error::Configuration(format!("{name}: {WARN_NO_URL}")));
            return Ok(());
        }
        self.create_sandbox(&options)?;
        self.run_lifecycle(&name, |hooks| hooks.before_load.as_ref());
        let source = match self.request_html(&name, &options) {
            Ok(source) => source,
            Err(err) => {
                self.fail_sandbox(&name, err);
                return Ok(());
            }
        };
        let sandbox = self.try_sandbox_mut(&name)?;
        sandbox.state = SandboxState::Loading;
        sandbox.pipeline = Some(Pipeline {
            kind: PipelineKind::Preload {
                exec: options.is_exec(),
            },
            stage: PipelineStage::AwaitHtml(source),
            options,
        });
        Ok(())
    }

    fn fail_sandbox(&mut self, app: &str, err: Error) {
        if let Some(sandbox) = self.sandbox_mut(app) {
            sandbox.state = SandboxState::Failed;
            sandbox.pipeline = None;
            sandbox.pending_start = None;
        }
        self.trace
            .borrow_mut()
            .error(format!("activation of {app} failed: {err}"));
        self.failures.push(err);
    }

    fn put_pipeline(&mut self, app: &str, pipeline: Pipeline) -> Result<()> {
        self.try_sandbox_mut(app)?.pipeline = Some(pipeline);
        Ok(())
    }

    /// Moves every pipeline whose awaited resource settled. A failing step marks its
    /// sandbox failed and is reported by the next driving call.
    pub(crate) fn advance_pipelines(&mut self) -> Result<bool> {
        let mut progressed = false;
        for app in self.live_apps() {
            let Some(pipeline) = self.sandbox_mut(&app).and_then(|sandbox| sandbox.pipeline.take())
            else {
                continue;
            };
            if matches!(pipeline.stage, PipelineStage::Running) {
                self.put_pipeline(&app, pipeline)?;
                continue;
            }
            match self.step_pipeline(&app, pipeline) {
                Ok(step) => progressed |= step,
                Err(err) => {
                    self.fail_sandbox(&app, err);
                    progressed = true;
                }
            }
        }
        Ok(progressed)
    }

    fn step_pipeline(&mut self, app: &str, pipeline: Pipeline) -> Result<bool> {
        let Pipeline {
            kind,
            stage,
            options,
        } = pipeline;
        let next = match stage {
            PipelineStage::AwaitHtml(source) => {
                let Some(html) = self.take_html(app, &source) else {
                    self.put_pipeline(
                        app,
                        Pipeline {
                            kind,
                            stage: PipelineStage::AwaitHtml(source),
                            options,
                        },
                    )?;
                    return Ok(false);
                };
                let parsed = self.prepare_template(app, &html?)?;
                if kind == PipelineKind::Resume {
                    self.run_pipeline(app, kind, options, &parsed)?;
                    return Ok(true);
                }
                self.request_styles(app, &parsed)?;
                PipelineStage::AwaitStyles(parsed)
            }
            PipelineStage::AwaitStyles(parsed) => {
                if !self.styles_settled(app, &parsed) {
                    self.put_pipeline(
                        app,
                        Pipeline {
                            kind,
                            stage: PipelineStage::AwaitStyles(parsed),
                            options,
                        },
                    )?;
                    return Ok(false);
                }
                let template = self.embed_styles(app, &parsed)?;
                PipelineStage::AwaitContext { parsed, template }
            }
            PipelineStage::AwaitContext { parsed, template } => {
                if !self.try_sandbox(app)?.context.is_ready() {
                    self.put_pipeline(
                        app,
                        Pipeline {
                            kind,
                            stage: PipelineStage::AwaitContext { parsed, template },
                            options,
                        },
                    )?;
                    return Ok(false);
                }
                match kind {
                    PipelineKind::Preload { exec: false } => {
                        self.activate(app, &preload_view(&options), Some(template))?;
                        self.request_scripts(app, &parsed);
                        PipelineStage::AwaitScripts(parsed)
                    }
                    PipelineKind::Preload { exec: true } => {
                        self.activate(app, &preload_view(&options), Some(template))?;
                        self.run_pipeline(app, kind, options, &parsed)?;
                        return Ok(true);
                    }
                    PipelineKind::Start | PipelineKind::Resume => {
                        self.activate(app, &options, Some(template))?;
                        self.run_pipeline(app, kind, options, &parsed)?;
                        return Ok(true);
                    }
                }
            }
            PipelineStage::AwaitScripts(parsed) => {
                if !self.scripts_settled(&parsed) {
                    self.put_pipeline(
                        app,
                        Pipeline {
                            kind,
                            stage: PipelineStage::AwaitScripts(parsed),
                            options,
                        },
                    )?;
                    return Ok(false);
                }
                self.put_pipeline(
                    app,
                    Pipeline {
                        kind,
                        stage: PipelineStage::Running,
                        options,
                    },
                )?;
                self.finish_pipeline(app)?;
                return Ok(true);
            }
            PipelineStage::Running => PipelineStage::Running,
        };
        self.put_pipeline(
            app,
            Pipeline {
                kind,
                stage: next,
                options,
            },
        )?;
        Ok(true)
    }

    /// Hands the rest of the activation to the scheduler. The pipeline stays in place
    /// as `Running` until the queue resolves.
    fn run_pipeline(
        &mut self,
        app: &str,
        kind: PipelineKind,
        options: AppOptions,
        parsed: &ParsedTemplate,
    ) -> Result<()> {
        self.put_pipeline(
            app,
            Pipeline {
                kind,
                stage: PipelineStage::Running,
                options,
            },
        )?;
        self.begin_start(app, parsed)
    }

    /// End of an activation: settles the state and replays a start that arrived while
    /// it ran.
    pub(crate) fn finish_pipeline(&mut self, app: &str) -> Result<()> {
        let (kind, pending) = {
            let Some(sandbox) = self.sandbox_mut(app) else {
                return Ok(());
            };
            let Some(pipeline) = sandbox.pipeline.take() else {
                return Ok(());
            };
            if matches!(sandbox.state, SandboxState::Created | SandboxState::Loading) {
                sandbox.state = SandboxState::Active;
            }
            (pipeline.kind, sandbox.pending_start.take())
        };
        if !matches!(kind, PipelineKind::Preload { exec: false }) {
            self.remove_loading(app)?;
        }
        self.trace_line(
            TraceCategory::Lifecycle,
            format!("activation of {app} finished ({kind:?})"),
        );
        if let Some(options) = pending {
            self.start_sandbox(options)?;
        }
        Ok(())
    }
}

/// Preloads render detached and never touch the host url.
fn preload_view(options: &AppOptions) -> AppOptions {
    let mut view = options.clone();
    view.el = None;
    view.sync = Some(false);
    view
}
