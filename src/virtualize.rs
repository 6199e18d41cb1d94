use super::*;

const LOCAL_PROPERTIES: [&str; 5] = [
    "createElement",
    "createTextNode",
    "documentURI",
    "URL",
    "onreadystatechange",
];

const CONTAINER_QUERY_PROPERTIES: [&str; 18] = [
    "getElementsByTagName",
    "getElementsByClassName",
    "getElementsByName",
    "getElementById",
    "querySelector",
    "querySelectorAll",
    "documentElement",
    "scrollingElement",
    "forms",
    "images",
    "links",
    "append",
    "contains",
    "getSelection",
    "elementFromPoint",
    "elementsFromPoint",
    "getAnimations",
    "replaceChildren",
];

const CONTAINER_STRUCTURE_PROPERTIES: [&str; 12] = [
    "head",
    "body",
    "activeElement",
    "childElementCount",
    "children",
    "firstElementChild",
    "firstChild",
    "fullscreenElement",
    "lastElementChild",
    "pictureInPictureElement",
    "pointerLockElement",
    "styleSheets",
];

pub(crate) const HOST_DOCUMENT_PROPERTIES: [&str; 17] = [
    "characterSet",
    "compatMode",
    "contentType",
    "designMode",
    "dir",
    "doctype",
    "embeds",
    "fullscreenEnabled",
    "hidden",
    "implementation",
    "lastModified",
    "pictureInPictureEnabled",
    "plugins",
    "readyState",
    "referrer",
    "visibilityState",
    "fonts",
];

pub(crate) const HOST_DOCUMENT_METHODS: [&str; 8] = [
    "execCommand",
    "caretPositionFromPoint",
    "createRange",
    "exitFullscreen",
    "exitPictureInPicture",
    "getElementsByTagNameNS",
    "hasFocus",
    "prepend",
];

pub(crate) const HOST_DOCUMENT_EVENTS: [&str; 12] = [
    "onpointerlockchange",
    "onpointerlockerror",
    "onbeforecopy",
    "onbeforecut",
    "onbeforepaste",
    "onfreeze",
    "onresume",
    "onsearch",
    "onfullscreenchange",
    "onfullscreenerror",
    "onsecuritypolicyviolation",
    "onvisibilitychange",
];

/// Window `on*` handlers that stay on the execution context window.
const CONTEXT_WINDOW_ON_EVENTS: [&str; 5] = [
    "onload",
    "onbeforeunload",
    "onunload",
    "onerror",
    "onunhandledrejection",
];

const LOCATION_CONSTANTS: [&str; 5] = ["host", "hostname", "protocol", "port", "origin"];

/// Where a document property of a guest resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentCategory {
    /// The execution context's own document, with creation methods patched.
    Local,
    /// Child and selection queries answered from the rendering container root.
    ContainerQuery,
    /// Structural nodes (`head`, `body`, children) of the rendering container.
    ContainerStructure,
    /// Platform facts of the real host document.
    Host,
    /// Element event handler properties, stored on the rendering container.
    ContainerEvent,
}

/// Total classification of document property names. Names outside the fixed lists
/// resolve locally.
pub fn classify_document_property(name: &str) -> DocumentCategory {
    if LOCAL_PROPERTIES.contains(&name) {
        DocumentCategory::Local
    } else if CONTAINER_QUERY_PROPERTIES.contains(&name) {
        DocumentCategory::ContainerQuery
    } else if CONTAINER_STRUCTURE_PROPERTIES.contains(&name) {
        DocumentCategory::ContainerStructure
    } else if HOST_DOCUMENT_PROPERTIES.contains(&name)
        || HOST_DOCUMENT_METHODS.contains(&name)
        || HOST_DOCUMENT_EVENTS.contains(&name)
    {
        DocumentCategory::Host
    } else if name.len() > 2 && name.starts_with("on") {
        DocumentCategory::ContainerEvent
    } else {
        DocumentCategory::Local
    }
}

/// Fixed property table of the fallback backend, rebuilt on every activation.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticTable {
    document: BTreeMap<String, DocumentCategory>,
    location: BTreeMap<String, String>,
}

impl StaticTable {
    pub(crate) fn build(url: &LocationParts) -> Self {
        let document = LOCAL_PROPERTIES
            .iter()
            .chain(CONTAINER_QUERY_PROPERTIES.iter())
            .chain(CONTAINER_STRUCTURE_PROPERTIES.iter())
            .chain(HOST_DOCUMENT_PROPERTIES.iter())
            .chain(HOST_DOCUMENT_METHODS.iter())
            .chain(HOST_DOCUMENT_EVENTS.iter())
            .map(|name| (name.to_string(), classify_document_property(name)))
            .collect();
        let location = LOCATION_CONSTANTS
            .iter()
            .map(|name| (name.to_string(), location_constant(url, name)))
            .collect();
        Self { document, location }
    }
}

/// How the virtual objects of one sandbox are realized.
#[derive(Debug, Clone)]
pub(crate) enum Backend {
    /// Every access is intercepted and classified on the fly.
    Live,
    /// Property definitions computed ahead of time; the guest sees the raw context
    /// window.
    Static(StaticTable),
}

impl Backend {
    fn document_category(&self, name: &str) -> DocumentCategory {
        match self {
            Self::Live => classify_document_property(name),
            Self::Static(table) => table.document.get(name).copied().unwrap_or_else(|| {
                if name.len() > 2 && name.starts_with("on") {
                    DocumentCategory::ContainerEvent
                } else {
                    DocumentCategory::Local
                }
            }),
        }
    }

    fn location_constant(&self, url: &LocationParts, name: &str) -> Option<String> {
        match self {
            Self::Live => LOCATION_CONSTANTS
                .contains(&name)
                .then(|| location_constant(url, name)),
            Self::Static(table) => table.location.get(name).cloned(),
        }
    }
}

fn location_constant(url: &LocationParts, name: &str) -> String {
    match name {
        "host" => url.host(),
        "hostname" => url.hostname.clone(),
        "protocol" => url.protocol(),
        "port" => url.port.clone(),
        "origin" => url.origin(),
        _ => String::new(),
    }
}

impl HostPage {
    pub(crate) fn object_get(&mut self, object: &ObjectRef, name: &str) -> Result<GlobalValue> {
        match object {
            ObjectRef::VirtualWindow(owner) => self.window_get(owner, name),
            ObjectRef::VirtualDocument(owner) => self.document_get(owner, name),
            ObjectRef::VirtualLocation(owner) => self.location_get(owner, name),
            ObjectRef::ContextWindow(owner) => self.context_window_get(owner, name),
            ObjectRef::ContextDocument(owner) => Ok(self
                .try_sandbox(owner)?
                .context
                .document_props
                .get(name)
                .cloned()
                .unwrap_or_default()),
            ObjectRef::Provide(owner) => self.provide_get(owner, name),
            ObjectRef::Props(owner) => Ok(self
                .try_sandbox(owner)?
                .props
                .get(name)
                .cloned()
                .unwrap_or_default()),
            ObjectRef::Bus(_) => Ok(GlobalValue::Undefined),
            ObjectRef::SandboxMarker(owner) => Ok(match name {
                "id" => GlobalValue::from(owner.as_str()),
                "degrade" => GlobalValue::Bool(self.try_sandbox(owner)?.degrade),
                "location" => GlobalValue::Object(ObjectRef::VirtualLocation(owner.clone())),
                _ => GlobalValue::Undefined,
            }),
            ObjectRef::HostWindow => Ok(self
                .host_globals
                .get(name)
                .map(|slot| slot.value.clone())
                .unwrap_or_default()),
            ObjectRef::HostDocument => self.host_document_get(name),
        }
    }

    pub(crate) fn object_set(
        &mut self,
        app: &str,
        object: &ObjectRef,
        name: &str,
        value: GlobalValue,
    ) -> Result<()> {
        match object {
            ObjectRef::VirtualWindow(owner) => self.window_set(owner, name, value),
            ObjectRef::VirtualDocument(owner) => self.document_set(owner, name, value),
            ObjectRef::VirtualLocation(owner) => self.location_set(owner, name, &value.as_text()),
            ObjectRef::ContextWindow(owner) => self.context_window_set(owner, name, value),
            ObjectRef::ContextDocument(owner) => {
                self.try_sandbox_mut(owner)?
                    .context
                    .document_props
                    .insert(name.to_string(), value);
                Ok(())
            }
            ObjectRef::Props(owner) => {
                self.try_sandbox_mut(owner)?
                    .props
                    .insert(name.to_string(), value);
                Ok(())
            }
            ObjectRef::HostWindow => {
                self.set_host_global(name, value);
                Ok(())
            }
            ObjectRef::HostDocument => {
                self.host_document_props.insert(name.to_string(), value);
                Ok(())
            }
            ObjectRef::Provide(_) | ObjectRef::Bus(_) | ObjectRef::SandboxMarker(_) => {
                Err(Error::ScriptRuntime(format!(
                    "cannot assign {name} on a read-only sandbox object of {app}"
                )))
            }
        }
    }

    /// Read through the virtual window.
    pub(crate) fn window_get(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        match name {
            "location" => return Ok(GlobalValue::Object(ObjectRef::VirtualLocation(app.into()))),
            "self" | "window" => {
                return Ok(GlobalValue::Object(ObjectRef::VirtualWindow(app.into())));
            }
            "document" => return Ok(GlobalValue::Object(ObjectRef::VirtualDocument(app.into()))),
            _ => {}
        }
        if self.is_host_window_handler(app, name)? {
            return self.object_get(&ObjectRef::HostWindow, name);
        }
        let slot = self.try_sandbox(app)?.context.globals.get(name).cloned();
        let Some(slot) = slot else {
            return Ok(GlobalValue::Undefined);
        };
        if !slot.configurable && !slot.writable {
            return Ok(slot.value);
        }
        self.target_value(&ObjectRef::ContextWindow(app.to_string()), slot.value)
    }

    /// Write through the virtual window; the value lands on the context window.
    pub(crate) fn window_set(&mut self, app: &str, name: &str, value: GlobalValue) -> Result<()> {
        if name == "location" {
            return self.location_href_set(app, &value.as_text());
        }
        if self.is_host_window_handler(app, name)? {
            self.set_host_global(name, value);
            return Ok(());
        }
        self.track_function(&ObjectRef::ContextWindow(app.to_string()), &value);
        self.try_sandbox_mut(app)?.context.set_global(name, value);
        Ok(())
    }

    /// Raw context window as seen by unwrapped code. The document and location still
    /// come back virtualized because their properties are patched on the context.
    fn context_window_get(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        match name {
            "location" => Ok(GlobalValue::Object(ObjectRef::VirtualLocation(app.into()))),
            "document" => Ok(GlobalValue::Object(ObjectRef::VirtualDocument(app.into()))),
            "self" | "window" => Ok(GlobalValue::Object(ObjectRef::ContextWindow(app.into()))),
            _ if self.is_host_window_handler(app, name)? => {
                self.object_get(&ObjectRef::HostWindow, name)
            }
            _ => Ok(self.try_sandbox(app)?.context.global(name)),
        }
    }

    fn context_window_set(&mut self, app: &str, name: &str, value: GlobalValue) -> Result<()> {
        if name == "location" {
            return self.location_href_set(app, &value.as_text());
        }
        if self.is_host_window_handler(app, name)? {
            self.set_host_global(name, value);
            return Ok(());
        }
        self.try_sandbox_mut(app)?.context.set_global(name, value);
        Ok(())
    }

    /// `window.onresize` and friends live on the host window unless listed as context
    /// events.
    fn is_host_window_handler(&self, app: &str, name: &str) -> Result<bool> {
        if name.len() <= 2 || !name.starts_with("on") || CONTEXT_WINDOW_ON_EVENTS.contains(&name) {
            return Ok(false);
        }
        let sandbox = self.try_sandbox(app)?;
        Ok(!sandbox.iframe_on_events.iter().any(|event| event == name))
    }

    /// Rebinds an unbound, non-constructable function to `target`, once per pair.
    fn target_value(&mut self, target: &ObjectRef, value: GlobalValue) -> Result<GlobalValue> {
        let GlobalValue::Function(id) = value else {
            return Ok(value);
        };
        if let Some(cached) = self.functions.cached(target, id) {
            return Ok(GlobalValue::Function(cached));
        }
        if !self.functions.is_bound(id) && !self.functions.is_constructable(id) {
            return Ok(GlobalValue::Function(self.functions.bound_for(target, id)?));
        }
        Ok(GlobalValue::Function(id))
    }

    fn track_function(&mut self, target: &ObjectRef, value: &GlobalValue) {
        if let GlobalValue::Function(id) = value {
            if !self.functions.is_bound(*id) && !self.functions.is_constructable(*id) {
                self.functions.track(target, *id);
            }
        }
    }

    pub(crate) fn document_get(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        let (category, root, degrade) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.backend.document_category(name),
                sandbox.container.root,
                sandbox.degrade,
            )
        };
        let Some(root) = root else {
            if degrade {
                return Ok(GlobalValue::Undefined);
            }
            self.trace.borrow_mut().warn(WARN_STOP_APP_RUN);
            return Err(Error::GuestInterrupted(WARN_STOP_APP_RUN.into()));
        };
        match category {
            DocumentCategory::Local => match name {
                "documentURI" | "URL" => self.location_get(app, "href"),
                "createElement" | "createTextNode" => self.context_method(app, name),
                _ => Ok(self
                    .try_sandbox(app)?
                    .context
                    .document_props
                    .get(name)
                    .cloned()
                    .unwrap_or_default()),
            },
            DocumentCategory::ContainerQuery => {
                let html = self.dom.first_element_child(root);
                match name {
                    "documentElement" | "scrollingElement" => {
                        Ok(html.map(GlobalValue::Node).unwrap_or(GlobalValue::Null))
                    }
                    "forms" => Ok(GlobalValue::Nodes(self.dom.descendants_by_tag(root, "form"))),
                    "images" => Ok(GlobalValue::Nodes(self.dom.descendants_by_tag(root, "img"))),
                    "links" => Ok(GlobalValue::Nodes(
                        self.dom.query_selector_all_from(root, "a[href], area[href]")?,
                    )),
                    _ => self.context_method(app, name),
                }
            }
            DocumentCategory::ContainerStructure => {
                let (head, body) = {
                    let container = &self.try_sandbox(app)?.container;
                    (container.head, container.body)
                };
                let node = |node: Option<NodeId>| node.map(GlobalValue::Node).unwrap_or(GlobalValue::Null);
                Ok(match name {
                    "head" => node(head),
                    "body" | "activeElement" => node(body),
                    "childElementCount" => {
                        GlobalValue::Number(self.dom.element_children(root).len() as f64)
                    }
                    "children" => GlobalValue::Nodes(self.dom.element_children(root)),
                    "firstElementChild" => node(self.dom.first_element_child(root)),
                    "lastElementChild" => node(self.dom.element_children(root).last().copied()),
                    "firstChild" => node(self.dom.children(root).first().copied()),
                    "styleSheets" => GlobalValue::Nodes(self.dom.descendants_by_tag(root, "style")),
                    _ => GlobalValue::Null,
                })
            }
            DocumentCategory::Host => self.host_document_get(name),
            DocumentCategory::ContainerEvent => Ok(self
                .try_sandbox(app)?
                .container
                .event_props
                .get(name)
                .cloned()
                .unwrap_or(GlobalValue::Null)),
        }
    }

    pub(crate) fn document_set(&mut self, app: &str, name: &str, value: GlobalValue) -> Result<()> {
        let category = self.try_sandbox(app)?.backend.document_category(name);
        match category {
            DocumentCategory::ContainerEvent => {
                self.try_sandbox_mut(app)?
                    .container
                    .event_props
                    .insert(name.to_string(), value);
            }
            DocumentCategory::Local if !matches!(name, "documentURI" | "URL") => {
                self.track_function(&ObjectRef::ContextDocument(app.to_string()), &value);
                self.try_sandbox_mut(app)?
                    .context
                    .document_props
                    .insert(name.to_string(), value);
            }
            DocumentCategory::Host if HOST_DOCUMENT_EVENTS.contains(&name) => {
                self.host_document_props.insert(name.to_string(), value);
            }
            _ => {}
        }
        Ok(())
    }

    fn context_method(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        Ok(self
            .try_sandbox(app)?
            .context
            .document_methods
            .get(name)
            .copied()
            .map(GlobalValue::Function)
            .unwrap_or_default())
    }

    fn host_document_get(&mut self, name: &str) -> Result<GlobalValue> {
        if let Some(id) = self.host_document_methods.get(name).copied() {
            return Ok(GlobalValue::Function(
                self.functions.bound_for(&ObjectRef::HostDocument, id)?,
            ));
        }
        Ok(self
            .host_document_props
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) fn location_get(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        let sandbox = self.try_sandbox(app)?;
        if let Some(value) = sandbox.backend.location_constant(&sandbox.url_parts, name) {
            return Ok(GlobalValue::Str(value));
        }
        let context = &sandbox.context.location;
        Ok(match name {
            "href" => GlobalValue::Str(virtual_href(sandbox)),
            "pathname" => GlobalValue::Str(context.pathname.clone()),
            "search" => GlobalValue::Str(context.search.clone()),
            "hash" => GlobalValue::Str(context.hash.clone()),
            "reload" => {
                self.trace.borrow_mut().warn(WARN_RELOAD_DISABLED);
                GlobalValue::Function(self.noop)
            }
            "replace" | "assign" => {
                let method = self.try_sandbox(app)?.context.location_methods.get(name).copied();
                method.map(GlobalValue::Function).unwrap_or_default()
            }
            _ => GlobalValue::Undefined,
        })
    }

    pub(crate) fn location_set(&mut self, app: &str, name: &str, value: &str) -> Result<()> {
        match name {
            "href" => self.location_href_set(app, value),
            "pathname" | "search" | "hash" => {
                let next = {
                    let sandbox = self.try_sandbox(app)?;
                    let mut parts = sandbox.context.location.clone();
                    match name {
                        "pathname" => {
                            parts.pathname = if value.starts_with('/') {
                                value.to_string()
                            } else {
                                format!("/{value}")
                            }
                        }
                        "search" if value.is_empty() || value.starts_with('?') => {
                            parts.search = value.to_string()
                        }
                        "search" => parts.search = format!("?{value}"),
                        _ if value.is_empty() || value.starts_with('#') => {
                            parts.hash = value.to_string()
                        }
                        _ => parts.hash = format!("#{value}"),
                    }
                    parts.route_path()
                };
                self.context_history_push(app, &next)?;
                if name == "hash" {
                    self.fire_context_window_event(app, "hashchange")?;
                }
                Ok(())
            }
            _ => Err(Error::ScriptRuntime(format!(
                "location.{name} cannot be assigned inside the sandbox"
            ))),
        }
    }

    /// Writing `location.href` renders the new address in place of the app and records
    /// it in the host url.
    pub(crate) fn location_href_set(&mut self, app: &str, value: &str) -> Result<()> {
        let (url, degrade, host, preserved_source, degrade_attrs) = {
            let sandbox = self.try_sandbox(app)?;
            let url = if value.starts_with("http") {
                value.to_string()
            } else {
                let resolved = self.location.resolve(value);
                let parts = LocationParts::parse(&resolved)
                    .ok_or_else(|| Error::Configuration(format!("invalid location {value}")))?;
                format!(
                    "{}{}{}{}",
                    sandbox.app_host_path, parts.pathname, parts.search, parts.hash
                )
            };
            (
                url,
                sandbox.degrade,
                sandbox.container.host,
                sandbox.container.root,
                sandbox.degrade_attrs.clone(),
            )
        };
        self.try_sandbox_mut(app)?.href_flag = true;
        self.trace_line(TraceCategory::Sync, format!("href jump app={app} url={url}"));

        let Some(host) = host else {
            return self.push_url_to_window(app, &url);
        };
        if degrade {
            if let Some(document) = preserved_source {
                let context_body = self.context_body(app)?;
                if let Some(html) = self.dom.first_element_child(document) {
                    self.dom.append_child(context_body, html)?;
                    self.try_sandbox_mut(app)?.container.preserved_html = Some(html);
                }
            }
        }
        if let Some(parent) = self.dom.parent(host) {
            self.render_iframe_replace_app(&url, parent, &degrade_attrs)?;
        }
        self.push_url_to_window(app, &url)
    }

    fn provide_get(&mut self, app: &str, name: &str) -> Result<GlobalValue> {
        let sandbox = self.try_sandbox(app)?;
        Ok(match name {
            "bus" => GlobalValue::Object(ObjectRef::Bus(app.to_string())),
            "props" => GlobalValue::Object(ObjectRef::Props(app.to_string())),
            "location" => GlobalValue::Object(ObjectRef::VirtualLocation(app.to_string())),
            "shadowRoot" if !sandbox.degrade => sandbox
                .container
                .root
                .map(GlobalValue::Node)
                .unwrap_or(GlobalValue::Null),
            _ => GlobalValue::Undefined,
        })
    }

    /// Rebuilds the fallback property table from the current guest url.
    pub(crate) fn refresh_static_table(&mut self, app: &str) -> Result<()> {
        let sandbox = self.try_sandbox_mut(app)?;
        if let Backend::Static(table) = &mut sandbox.backend {
            *table = StaticTable::build(&sandbox.url_parts);
        }
        Ok(())
    }

    /// Category a document property of `app` resolves to under its backend.
    pub fn document_category(&self, app: &str, name: &str) -> Result<DocumentCategory> {
        Ok(self.try_sandbox(app)?.backend.document_category(name))
    }
}

/// Context href with the host origin swapped for the guest's.
pub(crate) fn virtual_href(sandbox: &Sandbox) -> String {
    sandbox
        .context
        .location
        .href()
        .replacen(&sandbox.main_host_path, &sandbox.app_host_path, 1)
}
