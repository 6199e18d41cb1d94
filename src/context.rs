use super::*;

const DOCUMENT_PROBE_DEADLINE_MS: i64 = 5_000;
const NAVIGATION_PROBE_DEADLINE_MS: i64 = 1_000;
const EMPTY_PAGE_URL: &str = "blob:sandbox-empty-page";

/// Window properties replaced by the host's own value once the context is ready.
const WINDOW_PROXY_PROPERTIES: [&str; 4] =
    ["getComputedStyle", "visualViewport", "matchMedia", "DOMParser"];
const WINDOW_HOST_PATTERNS: [(&str, bool); 6] = [
    ("animationFrame$", true),
    ("resizeObserver$|mutationObserver$|intersectionObserver$", true),
    ("height$|width$|left$", true),
    ("^screen", true),
    ("CSSStyleSheet$", true),
    ("X$|Y$", false),
];

const WINDOW_FUNCTIONS: [&str; 9] = [
    "alert",
    "fetch",
    "getComputedStyle",
    "matchMedia",
    "requestAnimationFrame",
    "cancelAnimationFrame",
    "scrollTo",
    "postMessage",
    "getSelection",
];
const WINDOW_CONSTRUCTORS: [&str; 7] = [
    "Promise",
    "Event",
    "DOMParser",
    "ResizeObserver",
    "MutationObserver",
    "IntersectionObserver",
    "CSSStyleSheet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeStage {
    Document { use_object_url: bool },
    Navigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextReadiness {
    Loading,
    Ready,
}

/// Hidden nested browsing context hosting one guest's real globals and script elements.
pub(crate) struct ExecutionContext {
    pub(crate) iframe: NodeId,
    pub(crate) document: NodeId,
    pub(crate) location: LocationParts,
    pub(crate) globals: BTreeMap<String, PropertySlot>,
    pub(crate) document_props: BTreeMap<String, GlobalValue>,
    pub(crate) document_methods: BTreeMap<String, FnId>,
    /// `replace`/`assign` of the virtual location.
    pub(crate) location_methods: BTreeMap<String, FnId>,
    pub(crate) window_listeners: Vec<Listener>,
    pub(crate) readiness: ContextReadiness,
    pub(crate) patched: bool,
    pub(crate) executed: Vec<String>,
    pub(crate) base: Option<NodeId>,
}

impl ExecutionContext {
    pub(crate) fn is_ready(&self) -> bool {
        self.readiness == ContextReadiness::Ready
    }

    pub(crate) fn head(&self, dom: &Dom) -> Option<NodeId> {
        let html = dom.first_element_child(self.document)?;
        dom.child_by_tag(html, "head")
    }

    pub(crate) fn body(&self, dom: &Dom) -> Option<NodeId> {
        let html = dom.first_element_child(self.document)?;
        dom.child_by_tag(html, "body")
    }

    pub(crate) fn document_element(&self, dom: &Dom) -> Option<NodeId> {
        dom.first_element_child(self.document)
    }

    pub(crate) fn global(&self, name: &str) -> GlobalValue {
        self.globals
            .get(name)
            .map(|slot| slot.value.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_global(&mut self, name: &str, value: GlobalValue) {
        match self.globals.get_mut(name) {
            Some(slot) if !slot.writable => {}
            Some(slot) => slot.value = value,
            None => {
                self.globals
                    .insert(name.to_string(), PropertySlot::plain(value));
            }
        }
    }
}

fn receiver(scope: &mut GuestScope<'_>, _args: &[GlobalValue]) -> Result<GlobalValue> {
    Ok(scope
        .this()
        .map(GlobalValue::Object)
        .unwrap_or(GlobalValue::Undefined))
}

pub(crate) fn seed_window_globals(
    functions: &mut FunctionTable,
    globals: &mut BTreeMap<String, PropertySlot>,
    metrics: &[(&str, f64)],
) {
    globals.insert("undefined".into(), PropertySlot::frozen(GlobalValue::Undefined));
    globals.insert("NaN".into(), PropertySlot::frozen(GlobalValue::Number(f64::NAN)));
    globals.insert(
        "Infinity".into(),
        PropertySlot::frozen(GlobalValue::Number(f64::INFINITY)),
    );
    for name in WINDOW_FUNCTIONS {
        let id = functions.define(name, Rc::new(receiver), false);
        globals.insert(name.into(), PropertySlot::plain(GlobalValue::Function(id)));
    }
    for name in WINDOW_CONSTRUCTORS {
        let id = functions.define(name, Rc::new(receiver), true);
        globals.insert(name.into(), PropertySlot::plain(GlobalValue::Function(id)));
    }
    for (name, value) in metrics {
        globals.insert(
            (*name).to_string(),
            PropertySlot::plain(GlobalValue::Number(*value)),
        );
    }
}

fn is_host_proxied(name: &str) -> bool {
    if WINDOW_PROXY_PROPERTIES.contains(&name) {
        return true;
    }
    WINDOW_HOST_PATTERNS.iter().any(|(pattern, insensitive)| {
        let built = if *insensitive {
            Pattern::case_insensitive(pattern)
        } else {
            Pattern::new(pattern)
        };
        built.is_ok_and(|pattern| pattern.is_match(name))
    })
}

impl HostPage {
    /// Creates the hidden iframe of `app` and starts probing for its document.
    pub(crate) fn create_execution_context(
        &mut self,
        app: &str,
        serial: u64,
        attrs: &BTreeMap<String, String>,
        main_host_path: &str,
    ) -> Result<ExecutionContext> {
        let (src, use_object_url) = match attrs.get("src") {
            Some(src) => (src.clone(), false),
            None if self.profile.object_url && !self.capabilities.is_empty_page_url_disabled() => {
                (EMPTY_PAGE_URL.to_string(), true)
            }
            None => (main_host_path.to_string(), false),
        };

        let host_body = self.host_body()?;
        let iframe = self.dom.create_element(self.document, "iframe");
        self.dom.set_attr(iframe, "style", "display: none")?;
        for (key, value) in attrs {
            self.dom.set_attr(iframe, key, value)?;
        }
        self.dom.set_attr(iframe, "src", &src)?;
        self.dom.set_attr(iframe, "name", app)?;
        self.dom.set_attr(iframe, DATA_FLAG_ATTR, "")?;
        self.dom.append_child(host_body, iframe)?;

        let document = self.dom.create_html_document(&src)?;
        self.dom.content_documents.insert(iframe, document);

        let mut globals = BTreeMap::new();
        seed_window_globals(
            &mut self.functions,
            &mut globals,
            &[
                ("innerWidth", 0.0),
                ("innerHeight", 0.0),
                ("outerWidth", 0.0),
                ("screenX", 0.0),
                ("screenY", 0.0),
                ("scrollX", 0.0),
                ("scrollY", 0.0),
            ],
        );
        globals.insert("name".into(), PropertySlot::plain(GlobalValue::from(app)));

        let mut document_props = BTreeMap::new();
        document_props.insert("readyState".to_string(), GlobalValue::from("loading"));
        document_props.insert("title".to_string(), GlobalValue::from(""));
        document_props.insert("onreadystatechange".to_string(), GlobalValue::Null);
        document_props.insert("characterSet".to_string(), GlobalValue::from("windows-1252"));

        let location = LocationParts::parse(&src)
            .or_else(|| LocationParts::parse(main_host_path))
            .ok_or_else(|| Error::Configuration(format!("invalid context url {src}")))?;

        let delay = self.document_probe_delay();
        self.event_loop.schedule(
            delay,
            Task::ContextProbe {
                app: app.to_string(),
                serial,
                stage: ProbeStage::Document { use_object_url },
            },
        );
        self.trace_line(
            TraceCategory::Lifecycle,
            format!("context created app={app} src={src} probe_in={delay}"),
        );

        Ok(ExecutionContext {
            iframe,
            document,
            location,
            globals,
            document_props,
            document_methods: BTreeMap::new(),
            location_methods: BTreeMap::new(),
            window_listeners: Vec::new(),
            readiness: ContextReadiness::Loading,
            patched: false,
            executed: Vec::new(),
            base: None,
        })
    }

    /// Time until the 1 ms document loop sees a new document or gives up.
    fn document_probe_delay(&self) -> i64 {
        self.profile
            .context_ready_after_ms
            .unwrap_or(DOCUMENT_PROBE_DEADLINE_MS)
            .clamp(1, DOCUMENT_PROBE_DEADLINE_MS)
    }

    pub(crate) fn probe_context(&mut self, app: &str, stage: ProbeStage) -> Result<()> {
        match stage {
            ProbeStage::Document {
                use_object_url: true,
            } => {
                if self.profile.object_url_navigation {
                    let href = self.location.href();
                    self.set_context_url(app, &href)?;
                    return self.finish_context_ready(app);
                }
                let serial = self.sandbox_serial(app)?;
                self.event_loop.schedule(
                    NAVIGATION_PROBE_DEADLINE_MS + 1,
                    Task::ContextProbe {
                        app: app.to_string(),
                        serial,
                        stage: ProbeStage::Navigation,
                    },
                );
                Ok(())
            }
            ProbeStage::Document {
                use_object_url: false,
            } => self.finish_context_ready(app),
            ProbeStage::Navigation => {
                self.capabilities.set(DISABLE_EMPTY_PAGE_URL_KEY, "true");
                let (serial, iframe, main_host_path) = {
                    let sandbox = self.try_sandbox(app)?;
                    (
                        sandbox.serial,
                        sandbox.context.iframe,
                        sandbox.main_host_path.clone(),
                    )
                };
                self.dom.set_attr(iframe, "src", &main_host_path)?;
                self.set_context_url(app, &main_host_path)?;
                let delay = self.document_probe_delay();
                self.event_loop.schedule(
                    delay,
                    Task::ContextProbe {
                        app: app.to_string(),
                        serial,
                        stage: ProbeStage::Document {
                            use_object_url: false,
                        },
                    },
                );
                self.trace_line(
                    TraceCategory::Lifecycle,
                    format!("context fell back to host path app={app}"),
                );
                Ok(())
            }
        }
    }

    pub(crate) fn set_context_url(&mut self, app: &str, url: &str) -> Result<()> {
        let parts = LocationParts::parse(url)
            .ok_or_else(|| Error::Configuration(format!("invalid context url {url}")))?;
        let document = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.context.location = parts;
            sandbox.context.document
        };
        self.dom.set_document_url(document, url)
    }

    /// Rebuilds the context document and applies the context patches.
    fn finish_context_ready(&mut self, app: &str) -> Result<()> {
        let (document, url, main_host_path, app_route_path) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.context.document,
                sandbox.url.clone(),
                sandbox.main_host_path.clone(),
                sandbox.app_route_path.clone(),
            )
        };

        self.inject_context_variables(app)?;

        let html = self.dom.create_element(document, "html");
        let head = self.dom.create_element(document, "head");
        let body = self.dom.create_element(document, "body");
        self.dom.append_child(html, head)?;
        self.dom.append_child(html, body)?;
        for child in self.dom.children(document) {
            self.dom.detach(child)?;
        }
        self.dom.append_child(document, html)?;

        let context_path = self.try_sandbox(app)?.context.location.pathname.clone();
        let app_parts = LocationParts::parse(&url)
            .ok_or_else(|| Error::Configuration(format!("invalid app url {url}")))?;
        let base = self.dom.create_element(document, "base");
        self.dom.set_attr(
            base,
            "href",
            &format!("{}//{}{}", app_parts.protocol(), app_parts.host(), context_path),
        )?;
        self.dom.append_child(head, base)?;

        self.define_context_document_methods(app)?;
        {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.context.base = Some(base);
            sandbox.context.readiness = ContextReadiness::Ready;
        }
        self.patch_context(app)?;

        if !self.sync_query_has(app) {
            self.context_history_replace(app, &format!("{main_host_path}{app_route_path}"))?;
        }
        self.trace_line(TraceCategory::Lifecycle, format!("context ready app={app}"));
        Ok(())
    }

    /// Injects the sandbox marker, public path and `provide` object.
    pub(crate) fn inject_context_variables(&mut self, app: &str) -> Result<()> {
        let public_path = {
            let sandbox = self.try_sandbox(app)?;
            default_public_path(&sandbox.url, &self.location.href())
        };
        let sandbox = self.try_sandbox_mut(app)?;
        let context = &mut sandbox.context;
        context.set_global(
            SANDBOX_GLOBAL,
            GlobalValue::Object(ObjectRef::SandboxMarker(app.to_string())),
        );
        context.set_global(PUBLIC_PATH_GLOBAL, GlobalValue::Str(public_path));
        context.set_global(
            PROVIDE_GLOBAL,
            GlobalValue::Object(ObjectRef::Provide(app.to_string())),
        );
        Ok(())
    }

    /// Replaces whitelisted context window properties with the host's values. Host
    /// functions are bound to the host window.
    pub(crate) fn patch_window_effect(&mut self, app: &str) -> Result<()> {
        let names: Vec<String> = self.try_sandbox(app)?.context.globals.keys().cloned().collect();
        for name in names {
            if !is_host_proxied(&name) {
                continue;
            }
            let Some(host_value) = self.host_globals.get(&name).map(|slot| slot.value.clone())
            else {
                continue;
            };
            let value = match host_value {
                GlobalValue::Function(id) if !self.functions.is_constructable(id) => {
                    GlobalValue::Function(self.functions.bound_for(&ObjectRef::HostWindow, id)?)
                }
                other => other,
            };
            self.try_sandbox_mut(app)?.context.set_global(&name, value);
        }
        Ok(())
    }

    /// Context history entry that keeps the url in the host's origin.
    pub(crate) fn context_history_push(&mut self, app: &str, url: &str) -> Result<()> {
        let main_url = self.context_main_url(app, url)?;
        self.set_context_url(app, &main_url)?;
        self.history_push_context(app, &main_url);
        self.update_base(app)?;
        self.sync_url_to_window(app)
    }

    pub(crate) fn context_history_replace(&mut self, app: &str, url: &str) -> Result<()> {
        let main_url = self.context_main_url(app, url)?;
        self.set_context_url(app, &main_url)?;
        self.history_replace_context(app, &main_url);
        self.update_base(app)?;
        self.sync_url_to_window(app)
    }

    fn context_main_url(&self, app: &str, url: &str) -> Result<String> {
        let sandbox = self.try_sandbox(app)?;
        let current = &sandbox.context.location;
        let base = format!(
            "{}{}{}{}",
            sandbox.main_host_path, current.pathname, current.search, current.hash
        );
        Ok(absolute_path(
            &url.replacen(&sandbox.app_host_path, "", 1),
            &base,
            false,
        ))
    }

    pub(crate) fn update_base(&mut self, app: &str) -> Result<()> {
        let (base, href) = {
            let sandbox = self.try_sandbox(app)?;
            let Some(base) = sandbox.context.base else {
                return Ok(());
            };
            (
                base,
                format!("{}{}", sandbox.app_host_path, sandbox.context.location.pathname),
            )
        };
        self.dom.set_attr(base, "href", &href)
    }

    /// Runs `code` inside the context the way a stray `<script>` would. Code reaching a
    /// context that has not been handed to its guest yet is stopped.
    pub fn evaluate_in_context(&mut self, app: &str, code: &str) -> Result<()> {
        let powered = self
            .try_sandbox(app)?
            .context
            .global(POWERED_BY_FLAG)
            .truthy();
        if !powered {
            self.trace.borrow_mut().warn(WARN_STOP_APP_RUN);
            return Err(Error::GuestInterrupted(WARN_STOP_APP_RUN.into()));
        }
        let source = ScriptSource {
            src: None,
            code: code.to_string(),
            module: false,
            wrapped: true,
        };
        self.evaluate_script(app, &source)
    }

    /// Scripts the context has evaluated, in order. Inline scripts are listed as
    /// `inline`.
    pub fn executed_scripts(&self, app: &str) -> Vec<String> {
        self.sandbox(app)
            .map(|sandbox| sandbox.context.executed.clone())
            .unwrap_or_default()
    }

    pub fn context_document(&self, app: &str) -> Option<NodeId> {
        self.sandbox(app).map(|sandbox| sandbox.context.document)
    }

    pub fn context_head(&self, app: &str) -> Option<NodeId> {
        self.sandbox(app)
            .and_then(|sandbox| sandbox.context.head(&self.dom))
    }

    pub fn context_href(&self, app: &str) -> Option<String> {
        self.sandbox(app)
            .map(|sandbox| sandbox.context.location.href())
    }

    pub fn is_context_ready(&self, app: &str) -> bool {
        self.sandbox(app)
            .is_some_and(|sandbox| sandbox.context.is_ready())
    }

    /// Raw context global, bypassing the virtual window.
    pub fn context_global(&self, app: &str, name: &str) -> GlobalValue {
        self.sandbox(app)
            .map(|sandbox| sandbox.context.global(name))
            .unwrap_or_default()
    }

    pub fn set_context_global(&mut self, app: &str, name: &str, value: GlobalValue) -> Result<()> {
        self.try_sandbox_mut(app)?.context.set_global(name, value);
        Ok(())
    }
}
