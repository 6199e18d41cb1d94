use super::*;

/// Delay of the throttled `:root`/`@font-face` patch of a guest style element.
const STYLE_PATCH_DELAY_MS: i64 = 50;

/// Window events that stay on the execution context window.
const CONTEXT_WINDOW_EVENTS: [&str; 9] = [
    "hashchange",
    "popstate",
    "DOMContentLoaded",
    "load",
    "beforeunload",
    "unload",
    "message",
    "error",
    "unhandledrejection",
];

/// Document events that stay on the execution context document.
const CONTEXT_DOCUMENT_EVENTS: [&str; 2] = ["DOMContentLoaded", "readystatechange"];

/// Document events only the real host document produces.
const HOST_DOCUMENT_LISTENER_EVENTS: [&str; 8] = [
    "fullscreenchange",
    "fullscreenerror",
    "selectionchange",
    "visibilitychange",
    "wheel",
    "keydown",
    "keypress",
    "keyup",
];

/// Document events registered on both the host document and the rendering root.
const SHARED_DOCUMENT_EVENTS: [&str; 2] = ["gotpointercapture", "lostpointercapture"];

const RELATIVE_URL_ATTRS: [(&str, &str); 7] = [
    ("img", "src"),
    ("source", "src"),
    ("script", "src"),
    ("audio", "src"),
    ("video", "src"),
    ("a", "href"),
    ("link", "href"),
];

/// A listener a guest placed on the real host window; removed when the guest is
/// destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WindowListener {
    pub(crate) app: String,
    pub(crate) event_type: String,
    pub(crate) handler: FnId,
}

fn window_property_override(plugin: &Plugin) -> Option<&PropertyOverride> {
    plugin.window_property_override.as_ref()
}

fn document_property_override(plugin: &Plugin) -> Option<&PropertyOverride> {
    plugin.document_property_override.as_ref()
}

pub(crate) fn append_or_insert_hook(plugin: &Plugin) -> Option<&ElementHook> {
    plugin.append_or_insert_element_hook.as_ref()
}

fn patch_element_hook(plugin: &Plugin) -> Option<&ElementHook> {
    plugin.patch_element_hook.as_ref()
}

fn window_add_hook(plugin: &Plugin) -> Option<&ListenerHook> {
    plugin.window_add_event_listener_hook.as_ref()
}

fn window_remove_hook(plugin: &Plugin) -> Option<&ListenerHook> {
    plugin.window_remove_event_listener_hook.as_ref()
}

fn document_add_hook(plugin: &Plugin) -> Option<&ListenerHook> {
    plugin.document_add_event_listener_hook.as_ref()
}

fn document_remove_hook(plugin: &Plugin) -> Option<&ListenerHook> {
    plugin.document_remove_event_listener_hook.as_ref()
}

fn is_stylesheet_link(dom: &Dom, node: NodeId) -> bool {
    dom.attr(node, "rel").as_deref() == Some("stylesheet")
        || dom.attr(node, "type").as_deref() == Some("text/css")
        || dom
            .attr(node, "href")
            .is_some_and(|href| href.ends_with(".css"))
}

fn empty_nodes() -> GlobalValue {
    GlobalValue::Nodes(Vec::new())
}

/// Where a document listener of a guest ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentListenerTarget {
    Context,
    Root,
    Host,
    HostAndRoot,
}

fn document_listener_target(event_type: &str, degrade: bool) -> DocumentListenerTarget {
    if CONTEXT_DOCUMENT_EVENTS.contains(&event_type) {
        DocumentListenerTarget::Context
    } else if degrade {
        DocumentListenerTarget::Root
    } else if HOST_DOCUMENT_LISTENER_EVENTS.contains(&event_type) {
        DocumentListenerTarget::Host
    } else if SHARED_DOCUMENT_EVENTS.contains(&event_type) {
        DocumentListenerTarget::HostAndRoot
    } else {
        DocumentListenerTarget::Root
    }
}

impl HostPage {
    /// Applies the context-level patches once per execution context: host window
    /// values, virtual location methods and the plugin property overrides.
    pub(crate) fn patch_context(&mut self, app: &str) -> Result<()> {
        if self.try_sandbox(app)?.context.patched {
            return Ok(());
        }
        self.patch_window_effect(app)?;
        self.define_location_methods(app)?;
        self.try_sandbox_mut(app)?.context.patched = true;
        self.run_property_overrides(app, window_property_override);
        self.run_property_overrides(app, document_property_override);
        self.trace_line(TraceCategory::Patch, format!("context patched app={app}"));
        Ok(())
    }

    fn define_location_methods(&mut self, app: &str) -> Result<()> {
        let replace = self.functions.define_owned(
            "replace",
            Rc::new(|scope, args| {
                let url = arg_text(args, 0);
                let app = scope.app().to_string();
                scope.host().location_navigate(&app, &url, false)?;
                Ok(GlobalValue::Undefined)
            }),
            false,
            Some(app),
        );
        let assign = self.functions.define_owned(
            "assign",
            Rc::new(|scope, args| {
                let url = arg_text(args, 0);
                let app = scope.app().to_string();
                scope.host().location_navigate(&app, &url, true)?;
                Ok(GlobalValue::Undefined)
            }),
            false,
            Some(app),
        );
        let methods = &mut self.try_sandbox_mut(app)?.context.location_methods;
        methods.insert("replace".to_string(), replace);
        methods.insert("assign".to_string(), assign);
        Ok(())
    }

    /// `location.replace`/`assign`: the guest origin is swapped for the host's before
    /// the context navigates.
    fn location_navigate(&mut self, app: &str, url: &str, push: bool) -> Result<()> {
        let url = {
            let sandbox = self.try_sandbox(app)?;
            url.replacen(&sandbox.app_host_path, &sandbox.main_host_path, 1)
        };
        if push {
            self.context_history_push(app, &url)
        } else {
            self.context_history_replace(app, &url)
        }
    }

    /// Document methods the virtual document answers from the context document or the
    /// rendering root.
    pub(crate) fn define_context_document_methods(&mut self, app: &str) -> Result<()> {
        let mut methods: BTreeMap<String, FnId> = BTreeMap::new();
        let mut define = |host: &mut HostPage, name: &str, body: NativeFn| {
            let id = host.functions.define_owned(name, body, false, Some(app));
            methods.insert(name.to_string(), id);
        };

        define(
            self,
            "createElement",
            Rc::new(|scope, args| {
                let tag = arg_text(args, 0);
                let app = scope.app().to_string();
                let node = scope.host().create_context_node(&app, Some(&tag), "")?;
                Ok(GlobalValue::Node(node))
            }),
        );
        define(
            self,
            "createTextNode",
            Rc::new(|scope, args| {
                let text = arg_text(args, 0);
                let app = scope.app().to_string();
                let node = scope.host().create_context_node(&app, None, &text)?;
                Ok(GlobalValue::Node(node))
            }),
        );
        define(
            self,
            "getElementsByTagName",
            Rc::new(|scope, args| {
                let tag = arg_text(args, 0);
                let app = scope.app().to_string();
                let host = scope.host();
                if tag.eq_ignore_ascii_case("script") {
                    let document = host.try_sandbox(&app)?.context.document;
                    return Ok(GlobalValue::Nodes(host.dom.descendants_by_tag(document, "script")));
                }
                let root = host.rendering_root_of(&app)?;
                Ok(GlobalValue::Nodes(host.dom.query_selector_all_from(root, &tag)?))
            }),
        );
        define(
            self,
            "getElementsByClassName",
            Rc::new(|scope, args| {
                let selector = format!(".{}", arg_text(args, 0));
                let app = scope.app().to_string();
                let host = scope.host();
                let root = host.rendering_root_of(&app)?;
                Ok(host
                    .dom
                    .query_selector_all_from(root, &selector)
                    .map(GlobalValue::Nodes)
                    .unwrap_or_else(|_| empty_nodes()))
            }),
        );
        define(
            self,
            "getElementsByName",
            Rc::new(|scope, args| {
                let selector = format!("[name=\"{}\"]", arg_text(args, 0));
                let app = scope.app().to_string();
                let host = scope.host();
                let root = host.rendering_root_of(&app)?;
                Ok(host
                    .dom
                    .query_selector_all_from(root, &selector)
                    .map(GlobalValue::Nodes)
                    .unwrap_or_else(|_| empty_nodes()))
            }),
        );
        define(
            self,
            "getElementById",
            Rc::new(|scope, args| {
                let id = arg_text(args, 0);
                let app = scope.app().to_string();
                scope.host().context_element_by_id(&app, &id)
            }),
        );
        define(
            self,
            "querySelector",
            Rc::new(|scope, args| {
                let selector = arg_text(args, 0);
                let app = scope.app().to_string();
                let nodes = scope.host().context_query(&app, &selector, true)?;
                Ok(nodes
                    .first()
                    .copied()
                    .map(GlobalValue::Node)
                    .unwrap_or(GlobalValue::Null))
            }),
        );
        define(
            self,
            "querySelectorAll",
            Rc::new(|scope, args| {
                let selector = arg_text(args, 0);
                let app = scope.app().to_string();
                let nodes = scope.host().context_query(&app, &selector, false)?;
                Ok(GlobalValue::Nodes(nodes))
            }),
        );
        define(
            self,
            "contains",
            Rc::new(|scope, args| {
                let Some(node) = args.first().and_then(GlobalValue::as_node) else {
                    return Ok(GlobalValue::Bool(false));
                };
                let app = scope.app().to_string();
                let host = scope.host();
                let root = host.rendering_root_of(&app)?;
                Ok(GlobalValue::Bool(host.guest_contains(&app, root, node)))
            }),
        );
        define(
            self,
            "append",
            Rc::new(|scope, args| {
                let app = scope.app().to_string();
                let host = scope.host();
                let root = host.rendering_root_of(&app)?;
                for value in args {
                    let node = match value {
                        GlobalValue::Node(node) => *node,
                        other => host.create_context_node(&app, None, &other.as_text())?,
                    };
                    host.guest_insert(&app, root, node, None)?;
                }
                Ok(GlobalValue::Undefined)
            }),
        );
        define(
            self,
            "replaceChildren",
            Rc::new(|scope, args| {
                let app = scope.app().to_string();
                let host = scope.host();
                let root = host.rendering_root_of(&app)?;
                host.dom.clear_children(root)?;
                for node in args.iter().filter_map(GlobalValue::as_node) {
                    host.guest_insert(&app, root, node, None)?;
                }
                Ok(GlobalValue::Undefined)
            }),
        );
        define(self, "getSelection", Rc::new(|_, _| Ok(GlobalValue::Null)));
        define(self, "elementFromPoint", Rc::new(|_, _| Ok(GlobalValue::Null)));
        define(self, "elementsFromPoint", Rc::new(|_, _| Ok(empty_nodes())));
        define(self, "getAnimations", Rc::new(|_, _| Ok(empty_nodes())));

        self.try_sandbox_mut(app)?.context.document_methods = methods;
        Ok(())
    }

    fn rendering_root_of(&self, app: &str) -> Result<NodeId> {
        self.try_sandbox(app)?
            .container
            .root
            .ok_or_else(|| Error::DomOperation(format!("{app} has no rendering container")))
    }

    fn create_context_node(&mut self, app: &str, tag: Option<&str>, text: &str) -> Result<NodeId> {
        let document = self.try_sandbox(app)?.context.document;
        let node = match tag {
            Some(tag) => self.dom.create_element(document, tag),
            None => self.dom.create_text(document, text),
        };
        if tag.is_some() {
            self.patch_element_effect(app, node)?;
        }
        Ok(node)
    }

    fn context_element_by_id(&mut self, app: &str, id: &str) -> Result<GlobalValue> {
        let root = self.rendering_root_of(app)?;
        let (document, head, degrade) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.context.document,
                sandbox.context.head(&self.dom),
                sandbox.degrade,
            )
        };
        let selector = format!("[id=\"{id}\"]");
        let fallback_root = if degrade { head.unwrap_or(document) } else { document };
        let found = self
            .dom
            .query_selector_from(root, &selector)
            .and_then(|found| match found {
                Some(node) => Ok(Some(node)),
                None => self.dom.query_selector_from(fallback_root, &selector),
            });
        match found {
            Ok(node) => Ok(node.map(GlobalValue::Node).unwrap_or(GlobalValue::Null)),
            Err(_) => {
                self.trace.borrow_mut().warn(WARN_GET_ELEMENT_BY_ID);
                Ok(GlobalValue::Null)
            }
        }
    }

    /// Rendering root first; the context document answers what the root does not have,
    /// except for `base`.
    fn context_query(&mut self, app: &str, selector: &str, first_only: bool) -> Result<Vec<NodeId>> {
        let root = self.rendering_root_of(app)?;
        let document = self.try_sandbox(app)?.context.document;
        let found = if first_only {
            self.dom.query_selector_from(root, selector)?.into_iter().collect()
        } else {
            self.dom.query_selector_all_from(root, selector)?
        };
        if !found.is_empty() || selector.trim() == "base" {
            return Ok(found);
        }
        if first_only {
            Ok(self
                .dom
                .query_selector_from(document, selector)?
                .into_iter()
                .collect())
        } else {
            self.dom.query_selector_all_from(document, selector)
        }
    }

    /// Marks `node` as belonging to `app`. Runs the patch hooks once per node.
    pub(crate) fn patch_element_effect(&mut self, app: &str, node: NodeId) -> Result<()> {
        if self.dom.element(node).is_none() || self.dom.patch(node).is_some() {
            return Ok(());
        }
        self.dom.set_patch(
            node,
            ElementPatch {
                app: app.to_string(),
            },
        )?;
        self.run_element_hooks(app, patch_element_hook, node);
        Ok(())
    }

    fn is_container_head_or_body(&self, app: &str, node: NodeId) -> Result<bool> {
        let container = &self.try_sandbox(app)?.container;
        Ok(container.head == Some(node) || container.body == Some(node))
    }

    /// `appendChild`/`insertBefore` of guest code. Scripts, stylesheets, styles and
    /// sandbox iframes placed into the container head or body are taken over by the
    /// sandbox; everything else is inserted as is.
    pub(crate) fn guest_insert(
        &mut self,
        app: &str,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId> {
        let tag = self.dom.tag_name(child).map(str::to_ascii_lowercase);
        if !self.is_container_head_or_body(app, parent)? {
            self.dom.insert_before(parent, child, reference)?;
            self.patch_element_effect(app, child)?;
            return Ok(child);
        }
        match tag.as_deref() {
            Some("link") if is_stylesheet_link(&self.dom, child) => {
                self.insert_dynamic_link(app, parent, child, reference)
            }
            Some("style") => self.insert_dynamic_style(app, parent, child, reference),
            Some("script") => self.insert_dynamic_script(app, parent, child, reference),
            Some("iframe") if self.dom.attr(child, DATA_FLAG_ATTR).as_deref() == Some("") => {
                let html = {
                    let sandbox = self.try_sandbox(app)?;
                    sandbox.context.document_element(&self.dom)
                }
                .ok_or_else(|| Error::DomOperation("execution context has no root".into()))?;
                self.dom.append_child(html, child)?;
                Ok(child)
            }
            _ => {
                self.dom.insert_before(parent, child, reference)?;
                self.patch_element_effect(app, child)?;
                self.run_element_hooks(app, append_or_insert_hook, child);
                Ok(child)
            }
        }
    }

    fn insert_placeholder(
        &mut self,
        parent: NodeId,
        reference: Option<NodeId>,
        text: &str,
    ) -> Result<NodeId> {
        let owner = self.dom.owner_document(parent).unwrap_or(self.document);
        let comment = self.dom.create_comment(owner, text);
        self.dom.insert_before(parent, comment, reference)?;
        Ok(comment)
    }

    fn insert_dynamic_link(
        &mut self,
        app: &str,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId> {
        let href = self.dom.attr(child, "href").unwrap_or_default();
        let comment = self.insert_placeholder(
            parent,
            reference,
            &format!("dynamic link {href} replaced by sandbox"),
        )?;
        if href.is_empty() {
            return Ok(comment);
        }
        let (serial, url, excluded, ignore) = {
            let sandbox = self.try_sandbox(app)?;
            let url = absolute_path(&href, &virtual_href(sandbox), false);
            (
                sandbox.serial,
                url.clone(),
                sandbox.plugins.css_excluded(&href) || sandbox.plugins.css_excluded(&url),
                sandbox.plugins.css_ignored(&href) || sandbox.plugins.css_ignored(&url),
            )
        };
        if excluded {
            return Ok(comment);
        }
        if !ignore {
            self.request_asset(app, ResourceKind::Style, &url);
        }
        self.style_jobs.push(StyleJob {
            app: app.to_string(),
            serial,
            url,
            raw: child,
            parent,
            anchor: comment,
            ignore,
        });
        Ok(comment)
    }

    fn insert_dynamic_style(
        &mut self,
        app: &str,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId> {
        let content = self.dom.text_content(child);
        if !content.is_empty() {
            let transformed = self.transform_style_text(app, &content, "")?;
            self.dom.set_text_content(child, &transformed)?;
        }
        self.dom.insert_before(parent, child, reference)?;
        {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.style_sheets.push(child);
            sandbox.patched_styles.insert(child);
        }
        self.schedule_style_patch(app, child)?;
        self.run_element_hooks(app, append_or_insert_hook, child);
        Ok(child)
    }

    fn insert_dynamic_script(
        &mut self,
        app: &str,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId> {
        let tag = self.next_script_tag();
        self.dom.set_attr(child, SCRIPT_ID_ATTR, &tag)?;
        let src = self.dom.attr(child, "src").filter(|src| !src.is_empty());
        let comment = self.insert_placeholder(
            parent,
            reference,
            &match &src {
                Some(src) => format!("dynamic script {src} replaced by sandbox"),
                None => "dynamic inline script replaced by sandbox".to_string(),
            },
        )?;

        let script_type = self.dom.attr(child, "type").unwrap_or_default();
        let module = script_type == "module";
        let attrs = self.dom.attrs(child);
        let crossorigin = self.dom.attr(child, "crossorigin");
        match src {
            Some(src) => {
                let (serial, url, excluded, ignore) = {
                    let sandbox = self.try_sandbox(app)?;
                    let url = absolute_path(&src, &virtual_href(sandbox), false);
                    (
                        sandbox.serial,
                        url.clone(),
                        sandbox.plugins.js_excluded(&src) || sandbox.plugins.js_excluded(&url),
                        sandbox.plugins.js_ignored(&src) || sandbox.plugins.js_ignored(&url),
                    )
                };
                if excluded {
                    return Ok(comment);
                }
                let descriptor = ScriptDescriptor {
                    src: Some(url),
                    content: None,
                    is_async: false,
                    defer: false,
                    module,
                    ignore,
                    crossorigin: crossorigin.is_some(),
                    crossorigin_type: crossorigin.unwrap_or_default(),
                    attrs,
                };
                let mut job = self.script_job(app, &descriptor);
                job.raw_element = Some(child);
                job.notify = true;
                self.dynamic_chain.push_back(DynamicJob {
                    app: app.to_string(),
                    serial,
                    job,
                });
            }
            None => {
                let code = self.dom.text_content(child);
                if code.trim().is_empty() {
                    return Ok(comment);
                }
                let descriptor = ScriptDescriptor {
                    src: None,
                    content: Some(code),
                    is_async: false,
                    defer: false,
                    module,
                    ignore: false,
                    crossorigin: crossorigin.is_some(),
                    crossorigin_type: crossorigin.unwrap_or_default(),
                    attrs,
                };
                let mut job = self.script_job(app, &descriptor);
                job.raw_element = Some(child);
                self.enqueue(app, QueueEntry::Script(job))?;
            }
        }
        Ok(comment)
    }

    pub(crate) fn next_script_tag(&mut self) -> String {
        self.next_script_tag += 1;
        self.next_script_tag.to_string()
    }

    /// `removeChild` of guest code. Scripts the sandbox moved into the context are
    /// removed from the context head.
    pub(crate) fn guest_remove_child(
        &mut self,
        app: &str,
        parent: NodeId,
        child: NodeId,
    ) -> Result<Option<NodeId>> {
        let head = self.try_sandbox(app)?.container.head;
        if Some(parent) == head && self.dom.is_tag(child, "script") && !self.dom.contains(parent, child)
        {
            let Some(found) = self.context_script_for(app, child)? else {
                self.trace.borrow_mut().warn(WARN_NO_SCRIPT);
                return Ok(None);
            };
            if let Some(context_head) = self.dom.parent(found) {
                self.dom.remove_child(context_head, found)?;
            }
            return Ok(Some(found));
        }
        if self.dom.parent(child) == Some(parent) {
            self.dom.remove_child(parent, child)?;
            return Ok(Some(child));
        }
        match self.dom.parent(child) {
            Some(real_parent) => {
                self.trace.borrow_mut().warn(format!(
                    "removeChild target is not a direct child, removed from its own parent in {app}"
                ));
                self.dom.remove_child(real_parent, child)?;
                Ok(Some(child))
            }
            None => Err(Error::DomOperation(
                "removeChild target is not a direct child".into(),
            )),
        }
    }

    fn context_script_for(&self, app: &str, script: NodeId) -> Result<Option<NodeId>> {
        let Some(tag) = self.dom.attr(script, SCRIPT_ID_ATTR) else {
            return Ok(None);
        };
        let Some(context_head) = self.try_sandbox(app)?.context.head(&self.dom) else {
            return Ok(None);
        };
        self.dom
            .query_selector_from(context_head, &format!("script[{SCRIPT_ID_ATTR}=\"{tag}\"]"))
    }

    /// `contains` of the container head or root also finds scripts moved into the
    /// context.
    pub(crate) fn guest_contains(&self, app: &str, node: NodeId, other: NodeId) -> bool {
        if self.dom.contains(node, other) {
            return true;
        }
        let Some(sandbox) = self.sandbox(app) else {
            return false;
        };
        let container = &sandbox.container;
        if (container.head == Some(node) || container.root == Some(node))
            && self.dom.is_tag(other, "script")
        {
            return self.context_script_for(app, other).ok().flatten().is_some();
        }
        false
    }

    /// `setAttribute` of guest code. Relative resource urls become absolute against the
    /// guest's location.
    pub(crate) fn guest_set_attribute(
        &mut self,
        app: &str,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let tag = self.dom.tag_name(node).map(str::to_ascii_lowercase);
        let rewrites = tag
            .as_deref()
            .is_some_and(|tag| RELATIVE_URL_ATTRS.contains(&(tag, name.as_str())));
        if rewrites && !value.is_empty() {
            let base = self.element_base(app)?;
            let absolute = absolute_path(value, &base, true);
            return self.dom.set_attr(node, &name, &absolute);
        }
        self.dom.set_attr(node, &name, value)
    }

    /// `protocol//host` of the guest plus the context pathname.
    pub(crate) fn element_base(&self, app: &str) -> Result<String> {
        let sandbox = self.try_sandbox(app)?;
        Ok(format!(
            "{}{}",
            sandbox.app_host_path, sandbox.context.location.pathname
        ))
    }

    pub(crate) fn guest_set_text(&mut self, app: &str, node: NodeId, text: &str) -> Result<()> {
        if self.is_patched_style(app, node) {
            let transformed = self.transform_style_text(app, text, "")?;
            self.dom.set_text_content(node, &transformed)?;
            return self.schedule_style_patch(app, node);
        }
        self.dom.set_text_content(node, text)
    }

    pub(crate) fn guest_set_inner_html(&mut self, app: &str, node: NodeId, html: &str) -> Result<()> {
        if self.is_patched_style(app, node) {
            return self.guest_set_text(app, node, html);
        }
        self.dom.clear_children(node)?;
        let owner = self.dom.owner_document(node).unwrap_or(self.document);
        parse_into(&mut self.dom, node, owner, html)?;
        let mut inserted = Vec::new();
        self.dom.collect_elements(node, &mut inserted);
        for element in inserted.into_iter().filter(|element| *element != node) {
            self.patch_element_effect(app, element)?;
        }
        Ok(())
    }

    fn is_patched_style(&self, app: &str, node: NodeId) -> bool {
        self.sandbox(app)
            .is_some_and(|sandbox| sandbox.patched_styles.contains(&node))
    }

    pub(crate) fn transform_style_text(&self, app: &str, css: &str, src: &str) -> Result<String> {
        let sandbox = self.try_sandbox(app)?;
        let base = virtual_href(sandbox);
        Ok(sandbox
            .plugins
            .css_transform(css, src, &base, sandbox.replace.as_ref()))
    }

    /// Schedules the `:root`/`@font-face` patch of a guest style. A style with a patch
    /// already pending is left alone.
    pub(crate) fn schedule_style_patch(&mut self, app: &str, node: NodeId) -> Result<()> {
        let serial = {
            let sandbox = self.try_sandbox_mut(app)?;
            if sandbox.degrade || !sandbox.pending_style_patches.insert(node) {
                return Ok(());
            }
            sandbox.serial
        };
        self.event_loop.schedule(
            STYLE_PATCH_DELAY_MS,
            Task::StylePatch {
                app: app.to_string(),
                serial,
                node,
            },
        );
        Ok(())
    }

    pub(crate) fn run_style_patch(&mut self, app: &str, node: NodeId) -> Result<()> {
        let (head, host) = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.pending_style_patches.remove(&node);
            (sandbox.container.head, sandbox.container.host)
        };
        let css = self.dom.text_content(node);
        let patch = patch_style_rules(&css);
        if let (Some(rules), Some(head)) = (patch.host, head) {
            let style = self.create_style_element(head, &rules)?;
            self.dom.append_child(head, style)?;
        }
        if let (Some(rules), Some(host)) = (patch.font, host) {
            let style = self.create_style_element(host, &rules)?;
            self.dom.append_child(host, style)?;
        }
        Ok(())
    }

    pub(crate) fn create_style_element(&mut self, near: NodeId, css: &str) -> Result<NodeId> {
        let owner = self.dom.owner_document(near).unwrap_or(self.document);
        let style = self.dom.create_element(owner, "style");
        self.dom.set_text_content(style, css)?;
        Ok(style)
    }

    /// `ownerDocument`: patched elements report the guest's virtual document.
    pub(crate) fn guest_owner_document(&self, node: NodeId) -> GlobalValue {
        if let Some(patch) = self.dom.patch(node) {
            return GlobalValue::Object(ObjectRef::VirtualDocument(patch.app.clone()));
        }
        self.dom
            .owner_document(node)
            .map(GlobalValue::Node)
            .unwrap_or(GlobalValue::Null)
    }

    /// `getRootNode`: a guest shadow root reads as the guest's virtual document.
    pub(crate) fn guest_root_node(&self, node: NodeId) -> GlobalValue {
        let root = self.dom.root_of(node);
        let owner = self.registry.iter().find_map(|(name, entry)| {
            entry
                .sandbox
                .as_ref()
                .filter(|sandbox| !sandbox.degrade && sandbox.container.root == Some(root))
                .map(|_| name.clone())
        });
        match owner {
            Some(app) => GlobalValue::Object(ObjectRef::VirtualDocument(app)),
            None => GlobalValue::Node(root),
        }
    }

    pub(crate) fn guest_base_uri(&self, node: NodeId) -> String {
        if let Some(base) = self
            .dom
            .patch(node)
            .and_then(|patch| self.element_base(&patch.app).ok())
        {
            return base;
        }
        self.dom
            .owner_document(node)
            .and_then(|document| self.dom.document_url(document))
            .map(ToOwned::to_owned)
            .unwrap_or_default()
    }

    /// Context events stay on the context window; anything else is registered on the
    /// host window and remembered for teardown.
    pub(crate) fn add_window_listener(&mut self, app: &str, event_type: &str, handler: FnId) -> Result<()> {
        self.run_listener_hooks(app, window_add_hook, event_type, handler);
        if self.is_context_window_event(app, event_type)? {
            let listener = Listener {
                event_type: event_type.to_string(),
                handler,
                capture: false,
            };
            let listeners = &mut self.try_sandbox_mut(app)?.context.window_listeners;
            if !listeners.contains(&listener) {
                listeners.push(listener);
            }
            return Ok(());
        }
        let listener = WindowListener {
            app: app.to_string(),
            event_type: event_type.to_string(),
            handler,
        };
        if !self.host_window_listeners.contains(&listener) {
            self.host_window_listeners.push(listener);
        }
        Ok(())
    }

    pub(crate) fn remove_window_listener(&mut self, app: &str, event_type: &str, handler: FnId) -> Result<()> {
        self.run_listener_hooks(app, window_remove_hook, event_type, handler);
        if self.is_context_window_event(app, event_type)? {
            self.try_sandbox_mut(app)?
                .context
                .window_listeners
                .retain(|listener| !(listener.event_type == event_type && listener.handler == handler));
            return Ok(());
        }
        self.host_window_listeners.retain(|listener| {
            !(listener.app == app && listener.event_type == event_type && listener.handler == handler)
        });
        Ok(())
    }

    fn is_context_window_event(&self, app: &str, event_type: &str) -> Result<bool> {
        let sandbox = self.try_sandbox(app)?;
        Ok(CONTEXT_WINDOW_EVENTS.contains(&event_type)
            || sandbox
                .iframe_add_event_listeners
                .iter()
                .any(|event| event == event_type))
    }

    fn document_listener_nodes(&self, app: &str, event_type: &str) -> Result<Vec<NodeId>> {
        let sandbox = self.try_sandbox(app)?;
        let context = sandbox.context.document;
        let root = sandbox.container.root.unwrap_or(context);
        Ok(match document_listener_target(event_type, sandbox.degrade) {
            DocumentListenerTarget::Context => vec![context],
            DocumentListenerTarget::Root => vec![root],
            DocumentListenerTarget::Host => vec![self.document],
            DocumentListenerTarget::HostAndRoot => vec![self.document, root],
        })
    }

    /// Handlers run with the guest's virtual document as `this`.
    fn document_handler(&mut self, app: &str, handler: FnId) -> Result<FnId> {
        if self.functions.is_bound(handler) {
            return Ok(handler);
        }
        self.functions
            .bound_for(&ObjectRef::VirtualDocument(app.to_string()), handler)
    }

    pub(crate) fn add_document_listener(&mut self, app: &str, event_type: &str, handler: FnId) -> Result<()> {
        self.run_listener_hooks(app, document_add_hook, event_type, handler);
        let bound = self.document_handler(app, handler)?;
        for node in self.document_listener_nodes(app, event_type)? {
            self.dom.add_listener(
                node,
                Listener {
                    event_type: event_type.to_string(),
                    handler: bound,
                    capture: false,
                },
            )?;
        }
        Ok(())
    }

    pub(crate) fn remove_document_listener(&mut self, app: &str, event_type: &str, handler: FnId) -> Result<()> {
        self.run_listener_hooks(app, document_remove_hook, event_type, handler);
        let bound = self.document_handler(app, handler)?;
        for node in self.document_listener_nodes(app, event_type)? {
            self.dom.remove_listener(node, event_type, bound)?;
        }
        Ok(())
    }

    /// Listeners on the container head or body are cached so an unmount can take them
    /// off again.
    pub(crate) fn add_node_listener(
        &mut self,
        app: &str,
        node: NodeId,
        event_type: &str,
        handler: FnId,
    ) -> Result<()> {
        let listener = Listener {
            event_type: event_type.to_string(),
            handler,
            capture: false,
        };
        self.dom.add_listener(node, listener.clone())?;
        if self.is_container_head_or_body(app, node)? {
            let cache = &mut self.try_sandbox_mut(app)?.container.listener_cache;
            if !cache.contains(&(node, listener.clone())) {
                cache.push((node, listener));
            }
        }
        Ok(())
    }

    pub(crate) fn remove_node_listener(
        &mut self,
        app: &str,
        node: NodeId,
        event_type: &str,
        handler: FnId,
    ) -> Result<()> {
        self.dom.remove_listener(node, event_type, handler)?;
        if let Some(sandbox) = self.sandbox_mut(app) {
            sandbox.container.listener_cache.retain(|(cached, listener)| {
                !(*cached == node && listener.event_type == event_type && listener.handler == handler)
            });
        }
        Ok(())
    }

    pub(crate) fn set_host_global(&mut self, name: &str, value: GlobalValue) {
        match self.host_globals.get_mut(name) {
            Some(slot) if !slot.writable => {}
            Some(slot) => slot.value = value,
            None => {
                self.host_globals
                    .insert(name.to_string(), PropertySlot::plain(value));
            }
        }
    }

    /// Fires `event_type` on the context window: listeners first, then the `on*`
    /// handler. Route changes are mirrored into the host url.
    pub(crate) fn fire_context_window_event(&mut self, app: &str, event_type: &str) -> Result<()> {
        let (handlers, on_handler) = {
            let context = &self.try_sandbox(app)?.context;
            let handlers: Vec<FnId> = context
                .window_listeners
                .iter()
                .filter(|listener| listener.event_type == event_type)
                .map(|listener| listener.handler)
                .collect();
            (handlers, context.global(&format!("on{event_type}")).as_function())
        };
        let event = GlobalValue::from(event_type);
        for handler in handlers.into_iter().chain(on_handler) {
            self.call_guest_function(app, handler, std::slice::from_ref(&event));
        }
        if matches!(event_type, "hashchange" | "popstate") {
            self.sync_url_to_window(app)?;
        }
        Ok(())
    }

    pub(crate) fn fire_context_document_event(&mut self, app: &str, event_type: &str) -> Result<()> {
        let (document, on_handler) = {
            let context = &self.try_sandbox(app)?.context;
            (
                context.document,
                context
                    .document_props
                    .get(&format!("on{event_type}"))
                    .and_then(GlobalValue::as_function),
            )
        };
        let event = GlobalValue::from(event_type);
        for handler in self.dom.listeners(document, event_type).into_iter().chain(on_handler) {
            self.call_guest_function(app, handler, std::slice::from_ref(&event));
        }
        Ok(())
    }

    /// Host window listeners of `event_type`, each run in the app that registered it.
    pub(crate) fn fire_host_window_event(&mut self, event_type: &str) {
        let listeners: Vec<WindowListener> = self
            .host_window_listeners
            .iter()
            .filter(|listener| listener.event_type == event_type)
            .cloned()
            .collect();
        let event = GlobalValue::from(event_type);
        for listener in listeners {
            self.call_guest_function(&listener.app, listener.handler, std::slice::from_ref(&event));
        }
    }

    /// Fires `event_type` at `target` and bubbles it up, crossing shadow boundaries.
    pub(crate) fn fire_node_event(&mut self, target: NodeId, event_type: &str) {
        let app = self
            .dom
            .patch(target)
            .map(|patch| patch.app.clone())
            .unwrap_or_default();
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node).or_else(|| self.dom.shadow_host(node));
        }
        let args = [GlobalValue::from(event_type), GlobalValue::Node(target)];
        for node in path {
            for handler in self.dom.listeners(node, event_type) {
                self.call_guest_function(&app, handler, &args);
            }
        }
    }

    /// Dispatches a host window event, e.g. a resize the embedding page observed.
    pub fn dispatch_window_event(&mut self, event_type: &str) -> Result<()> {
        self.fire_host_window_event(event_type);
        self.pump()?;
        self.surface_failures()
    }

    /// Dispatches an event on the host document.
    pub fn dispatch_document_event(&mut self, event_type: &str) -> Result<()> {
        let document = self.document;
        self.fire_node_event(document, event_type);
        self.pump()?;
        self.surface_failures()
    }

    /// Dispatches `event_type` at `node`, bubbling to its ancestors.
    pub fn dispatch_event(&mut self, node: NodeId, event_type: &str) -> Result<()> {
        if !self.dom.is_valid(node) {
            return Err(Error::NotFound(format!("node {}", node.index())));
        }
        self.fire_node_event(node, event_type);
        self.pump()?;
        self.surface_failures()
    }
}
