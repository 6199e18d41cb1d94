use super::*;

/// Marks the loading indicator inside a mount element.
pub(crate) const LOADING_DATA_FLAG: &str = "data-loading-flag";
/// Original `position` of a mount element the loading indicator changed.
pub(crate) const CONTAINER_POSITION_DATA_FLAG: &str = "data-container-position-flag";
/// Original `overflow` of a mount element the loading indicator changed.
pub(crate) const CONTAINER_OVERFLOW_DATA_FLAG: &str = "data-container-overflow-flag";

const LOADING_STYLE: &str = "position:absolute;width:100%;height:100%;z-index:9999;display:flex;justify-content:center;align-items:center;flex-direction:column;top:0;left:0;";
const SHADE_STYLE: &str = "position: fixed; z-index: 2147483647; visibility: hidden; inset: 0px; backface-visibility: hidden;";
const FRAME_STYLE: &str = "height:100%;width:100%";

/// Attributes rewritten to absolute urls when a template is rendered.
const TEMPLATE_URL_ATTRS: [(&str, &str); 3] = [("img", "src"), ("a", "href"), ("source", "src")];

/// Where a guest's document is visible: a shadow subtree under a `sandbox-app` host, or
/// a nested document in degrade mode.
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderingContainer {
    /// The `sandbox-app` element, or the degrade iframe.
    pub(crate) host: Option<NodeId>,
    /// Shadow root, or the degrade document.
    pub(crate) root: Option<NodeId>,
    pub(crate) head: Option<NodeId>,
    pub(crate) body: Option<NodeId>,
    /// Mount element the host was rendered into.
    pub(crate) el: Option<NodeId>,
    /// Degrade document element parked in the context while a url jump is shown.
    pub(crate) preserved_html: Option<NodeId>,
    pub(crate) event_props: BTreeMap<String, GlobalValue>,
    pub(crate) listener_cache: Vec<(NodeId, Listener)>,
}

/// Rules of a stylesheet that cannot apply inside a shadow tree as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PatchedRules {
    /// `:root` rules rewritten for `:host`.
    pub(crate) host: Option<String>,
    /// `@font-face` rules, which only load from the light tree.
    pub(crate) font: Option<String>,
}

/// Splits `css` into its top-level rules. Comments and block-less at-rules are dropped.
fn top_level_rules(css: &str) -> Vec<String> {
    let mut rules = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = css.chars().peekable();
    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            current.push(ch);
            if ch == '\\' {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut last = '\0';
                for next in chars.by_ref() {
                    if last == '*' && next == '/' {
                        break;
                    }
                    last = next;
                }
            }
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                current.push(ch);
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    rules.push(current.trim().to_string());
                    current.clear();
                }
            }
            ';' if depth == 0 => current.clear(),
            _ => current.push(ch),
        }
    }
    rules
}

pub(crate) fn patch_style_rules(css: &str) -> PatchedRules {
    let mut host = String::new();
    let mut font = String::new();
    for rule in top_level_rules(css) {
        if rule.contains(":root") {
            host.push_str(&rule.replace(":root", ":host"));
        }
        if rule.starts_with("@font-face") {
            font.push_str(&rule);
        }
    }
    PatchedRules {
        host: (!host.is_empty()).then_some(host),
        font: (!font.is_empty()).then_some(font),
    }
}

fn style_declarations(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn write_declarations(declarations: &[(String, String)]) -> String {
    declarations
        .iter()
        .map(|(name, value)| format!("{name}: {value};"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn style_property(style: &str, name: &str) -> Option<String> {
    style_declarations(style)
        .into_iter()
        .rev()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

fn set_style_property(style: &str, name: &str, value: &str) -> String {
    let mut declarations = style_declarations(style);
    declarations.retain(|(key, _)| key != name);
    declarations.push((name.to_string(), value.to_string()));
    write_declarations(&declarations)
}

fn remove_style_property(style: &str, name: &str) -> String {
    let mut declarations = style_declarations(style);
    declarations.retain(|(key, _)| key != name);
    write_declarations(&declarations)
}

fn frame_style(attrs: &BTreeMap<String, String>) -> String {
    format!(
        "{FRAME_STYLE};{}",
        attrs.get("style").map(String::as_str).unwrap_or_default()
    )
}

impl HostPage {
    pub(crate) fn resolve_mount_target(&self, target: Option<&MountTarget>) -> Result<Option<NodeId>> {
        match target {
            None => Ok(None),
            Some(MountTarget::Node(node)) if self.dom.is_valid(*node) => Ok(Some(*node)),
            Some(MountTarget::Node(node)) => {
                Err(Error::NotFound(format!("mount node {}", node.index())))
            }
            Some(MountTarget::Selector(selector)) => self
                .dom
                .query_selector_from(self.document, selector)?
                .map(Some)
                .ok_or_else(|| Error::NotFound(format!("mount element {selector}"))),
        }
    }

    pub(crate) fn context_body(&self, app: &str) -> Result<NodeId> {
        self.try_sandbox(app)?
            .context
            .body(&self.dom)
            .ok_or_else(|| Error::DomOperation(format!("execution context of {app} has no body")))
    }

    /// Puts `element` into `container` unless it is already there. The container is
    /// emptied first, except while it shows a loading indicator.
    pub(crate) fn render_element_to_container(&mut self, element: NodeId, container: NodeId) -> Result<NodeId> {
        if self.dom.contains(container, element) {
            return Ok(container);
        }
        let loading = self
            .dom
            .query_selector_from(container, &format!("div[{LOADING_DATA_FLAG}]"))?;
        if loading.is_none() {
            self.clear_child(container)?;
        }
        self.dom.append_child(container, element)?;
        Ok(container)
    }

    /// Removes every child of `node`. A guest whose rendering container leaves the page
    /// this way is unmounted.
    pub(crate) fn clear_child(&mut self, node: NodeId) -> Result<()> {
        let mut hosts = Vec::new();
        for child in self.dom.children(node) {
            let mut elements = Vec::new();
            self.dom.collect_elements(child, &mut elements);
            hosts.extend(
                elements
                    .into_iter()
                    .filter(|element| self.dom.has_attr(*element, APP_ID_ATTR)),
            );
        }
        let apps: Vec<String> = hosts
            .into_iter()
            .filter_map(|element| {
                let app = self.dom.attr(element, APP_ID_ATTR)?;
                self.sandbox(&app)
                    .filter(|sandbox| sandbox.container.host == Some(element))
                    .map(|_| app)
            })
            .collect();
        self.dom.clear_children(node)?;
        for app in apps {
            self.trace_line(
                TraceCategory::Render,
                format!("container of {app} left the page"),
            );
            self.unmount(&app)?;
        }
        Ok(())
    }

    /// Shows `loading` (or an empty placeholder) inside the mount element. A static
    /// element is made relative for the duration.
    pub(crate) fn add_loading(&mut self, el: NodeId, loading: Option<&str>) -> Result<()> {
        self.clear_child(el)?;
        let style = self.dom.attr(el, "style").unwrap_or_default();
        let position = style_property(&style, "position").unwrap_or_else(|| "static".into());
        let overflow = style_property(&style, "overflow").unwrap_or_else(|| "visible".into());
        let overflow_flag = if overflow == "visible" { "" } else { overflow.as_str() };
        if position == "static" {
            self.dom.set_attr(el, CONTAINER_POSITION_DATA_FLAG, &position)?;
            self.dom.set_attr(el, CONTAINER_OVERFLOW_DATA_FLAG, overflow_flag)?;
            let style = set_style_property(&style, "position", "relative");
            let style = set_style_property(&style, "overflow", "hidden");
            self.dom.set_attr(el, "style", &style)?;
        } else if matches!(position.as_str(), "relative" | "sticky") {
            self.dom.set_attr(el, CONTAINER_OVERFLOW_DATA_FLAG, overflow_flag)?;
            let style = set_style_property(&style, "overflow", "hidden");
            self.dom.set_attr(el, "style", &style)?;
        }

        let owner = self.dom.owner_document(el).unwrap_or(self.document);
        let wrapper = self.dom.create_element(owner, "div");
        self.dom.set_attr(wrapper, LOADING_DATA_FLAG, "")?;
        self.dom.set_attr(wrapper, "style", LOADING_STYLE)?;
        match loading {
            Some(markup) => parse_into(&mut self.dom, wrapper, owner, markup)?,
            None => {
                let placeholder = self.dom.create_element(owner, "div");
                self.dom.append_child(wrapper, placeholder)?;
            }
        }
        self.dom.append_child(el, wrapper)
    }

    /// Takes the loading indicator out of the mount element of `app` and restores the
    /// element's `position`/`overflow`.
    pub(crate) fn remove_loading(&mut self, app: &str) -> Result<()> {
        let Some(el) = self.try_sandbox(app)?.container.el else {
            return Ok(());
        };
        let position_flag = self.dom.attr(el, CONTAINER_POSITION_DATA_FLAG);
        let overflow_flag = self.dom.attr(el, CONTAINER_OVERFLOW_DATA_FLAG);
        let mut style = self.dom.attr(el, "style").unwrap_or_default();
        if position_flag.as_deref().is_some_and(|flag| !flag.is_empty()) {
            style = remove_style_property(&style, "position");
        }
        match overflow_flag.as_deref() {
            Some("") => style = remove_style_property(&style, "overflow"),
            Some(overflow) => style = set_style_property(&style, "overflow", overflow),
            None => {}
        }
        if position_flag.is_some() || overflow_flag.is_some() {
            self.dom.set_attr(el, "style", &style)?;
        }
        self.dom.remove_attr(el, CONTAINER_POSITION_DATA_FLAG)?;
        self.dom.remove_attr(el, CONTAINER_OVERFLOW_DATA_FLAG)?;
        if let Some(loading) = self
            .dom
            .query_selector_from(el, &format!("div[{LOADING_DATA_FLAG}]"))?
        {
            if let Some(parent) = self.dom.parent(loading) {
                self.dom.remove_child(parent, loading)?;
            }
        }
        Ok(())
    }

    /// Creates the `sandbox-app` host of `app`.
    pub(crate) fn create_container_host(&mut self, app: &str) -> Result<NodeId> {
        let host = self.dom.create_element(self.document, CONTAINER_TAG);
        self.dom.set_attr(host, APP_ID_ATTR, app)?;
        Ok(host)
    }

    /// Degrade mode: a visible iframe in `parent` whose document becomes the rendering
    /// root. Returns the iframe and its fresh document.
    pub(crate) fn init_render_iframe_and_container(
        &mut self,
        app: &str,
        parent: NodeId,
        degrade_attrs: &BTreeMap<String, String>,
    ) -> Result<(NodeId, NodeId)> {
        let iframe = self.dom.create_element(self.document, "iframe");
        for (key, value) in degrade_attrs.iter().filter(|(key, _)| *key != "style") {
            self.dom.set_attr(iframe, key, value)?;
        }
        self.dom.set_attr(iframe, "style", &frame_style(degrade_attrs))?;
        self.dom.set_attr(iframe, APP_ID_ATTR, app)?;
        self.render_element_to_container(iframe, parent)?;
        let document = self.dom.create_html_document("about:blank")?;
        self.dom.content_documents.insert(iframe, document);
        Ok((iframe, document))
    }

    /// Shows `src` in a plain iframe in place of the app, e.g. after a `location.href`
    /// jump to another origin.
    pub(crate) fn render_iframe_replace_app(
        &mut self,
        src: &str,
        parent: NodeId,
        degrade_attrs: &BTreeMap<String, String>,
    ) -> Result<()> {
        let iframe = self.dom.create_element(self.document, "iframe");
        for (key, value) in degrade_attrs.iter().filter(|(key, _)| *key != "style") {
            self.dom.set_attr(iframe, key, value)?;
        }
        self.dom.set_attr(iframe, "src", src)?;
        self.dom.set_attr(iframe, "style", &frame_style(degrade_attrs))?;
        self.render_element_to_container(iframe, parent)?;
        self.trace_line(TraceCategory::Render, format!("replaced app view with {src}"));
        Ok(())
    }

    /// Builds the `html` element of the guest template. An app that already ran and is
    /// not kept alive gets its previous head and body back, refilled.
    pub(crate) fn render_template_to_html(&mut self, app: &str, template: &str, owner: NodeId) -> Result<NodeId> {
        let (alive, exec_flag, old_head, old_body) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.alive,
                sandbox.exec_flag,
                sandbox.container.head,
                sandbox.container.body,
            )
        };
        let html = self.dom.create_element(owner, "html");
        let holder = self.dom.create_element(owner, "template");
        parse_into(&mut self.dom, holder, owner, template)?;
        fill_html_element(&mut self.dom, html, holder)?;

        if !alive && exec_flag {
            for (tag, old) in [("head", old_head), ("body", old_body)] {
                let (Some(old), Some(fresh)) = (old, self.dom.child_by_tag(html, tag)) else {
                    continue;
                };
                for child in self.dom.children(fresh) {
                    self.dom.append_child(old, child)?;
                }
                self.dom.insert_before(html, old, Some(fresh))?;
                self.dom.remove_child(html, fresh)?;
            }
        }

        let base = self.element_base(app)?;
        let mut elements = Vec::new();
        self.dom.collect_elements(html, &mut elements);
        for element in elements {
            self.patch_element_effect(app, element)?;
            let Some(tag) = self.dom.tag_name(element).map(str::to_ascii_lowercase) else {
                continue;
            };
            let Some((_, name)) = TEMPLATE_URL_ATTRS.iter().find(|(known, _)| *known == tag) else {
                continue;
            };
            if let Some(value) = self.dom.attr(element, name).filter(|value| !value.is_empty()) {
                self.dom
                    .set_attr(element, name, &absolute_path(&value, &base, true))?;
            }
        }
        Ok(html)
    }

    /// Inserts the plugin preset styles: before-stage ones ahead of `head`, after-stage
    /// ones at the end of the document.
    pub(crate) fn process_css_loader_for_template(&mut self, app: &str, html: NodeId) -> Result<NodeId> {
        let (before, after) = {
            let plugins = &self.try_sandbox(app)?.plugins;
            (
                plugins.preset_styles(LoaderStage::Before),
                plugins.preset_styles(LoaderStage::After),
            )
        };
        for spec in before {
            let Some(style) = self.preset_style_element(app, html, &spec)? else {
                continue;
            };
            let head = self
                .dom
                .child_by_tag(html, "head")
                .or_else(|| self.dom.first_element_child(html));
            self.dom.insert_before(html, style, head)?;
        }
        for spec in after {
            if let Some(style) = self.preset_style_element(app, html, &spec)? {
                self.dom.append_child(html, style)?;
            }
        }
        Ok(html)
    }

    fn preset_style_element(
        &mut self,
        app: &str,
        near: NodeId,
        spec: &StyleLoaderSpec,
    ) -> Result<Option<NodeId>> {
        let content = match (&spec.content, &spec.src) {
            (Some(content), _) => content.clone(),
            (None, Some(src)) => match self.cache.state(ResourceKind::Style, src) {
                Some(EntryState::Ready(content)) => content.clone(),
                _ => String::new(),
            },
            (None, None) => String::new(),
        };
        if content.is_empty() {
            return Ok(None);
        }
        let css = self.transform_style_text(app, &content, spec.src.as_deref().unwrap_or(""))?;
        let style = self.create_style_element(near, &css)?;
        self.dom.set_attr(style, "type", "text/css")?;
        Ok(Some(style))
    }

    /// Degrade mode: replaces the document element of `document` with the rendered
    /// template.
    pub(crate) fn render_template_to_iframe(&mut self, app: &str, document: NodeId, template: &str) -> Result<()> {
        let html = self.render_template_to_html(app, template, document)?;
        let html = self.process_css_loader_for_template(app, html)?;
        for child in self.dom.children(document) {
            self.dom.detach(child)?;
        }
        self.dom.append_child(document, html)?;
        let head = self.dom.child_by_tag(html, "head");
        let body = self.dom.child_by_tag(html, "body");
        let container = &mut self.try_sandbox_mut(app)?.container;
        container.head = head;
        container.body = body;
        Ok(())
    }

    /// Renders the template into the shadow root of `app` with the invisible shade
    /// element first, so fixed-position popups have a positioned ancestor.
    pub(crate) fn render_template_to_shadow_root(&mut self, app: &str, template: &str) -> Result<()> {
        let root = self
            .try_sandbox(app)?
            .container
            .root
            .ok_or_else(|| Error::DomOperation(format!("{app} has no shadow root")))?;
        let owner = self.dom.owner_document(root).unwrap_or(self.document);
        let html = self.render_template_to_html(app, template, owner)?;
        let html = self.process_css_loader_for_template(app, html)?;
        self.dom.append_child(root, html)?;
        let shade = self.dom.create_element(owner, "div");
        self.dom.set_attr(shade, "style", SHADE_STYLE)?;
        self.dom.prepend_child(html, shade)?;
        let head = self.dom.child_by_tag(html, "head");
        let body = self.dom.child_by_tag(html, "body");
        let container = &mut self.try_sandbox_mut(app)?.container;
        container.head = head;
        container.body = body;
        Ok(())
    }

    /// Collects the `:root` and `@font-face` rules of the rendered styles into extra
    /// styles under the shadow head and the host. Once per container.
    pub(crate) fn patch_css_rules(&mut self, app: &str) -> Result<()> {
        let (degrade, host, root, head) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.degrade,
                sandbox.container.host,
                sandbox.container.root,
                sandbox.container.head,
            )
        };
        let (Some(host), Some(root), Some(head)) = (host, root, head) else {
            return Ok(());
        };
        if degrade || self.dom.has_attr(host, ATTACH_CSS_FLAG_ATTR) {
            return Ok(());
        }
        let css: String = self
            .dom
            .descendants_by_tag(root, "style")
            .into_iter()
            .map(|style| self.dom.text_content(style))
            .collect();
        let patch = patch_style_rules(&css);
        if let Some(rules) = &patch.host {
            let style = self.create_style_element(head, rules)?;
            self.dom.append_child(head, style)?;
            self.try_sandbox_mut(app)?.style_sheets.push(style);
        }
        if let Some(rules) = &patch.font {
            let style = self.create_style_element(host, rules)?;
            self.dom.append_child(host, style)?;
        }
        if patch.host.is_some() || patch.font.is_some() {
            self.dom.set_attr(host, ATTACH_CSS_FLAG_ATTR, "")?;
        }
        Ok(())
    }

    /// Puts the styles the guest added at runtime back after a remount.
    pub(crate) fn rebuild_style_sheets(&mut self, app: &str) -> Result<()> {
        let (head, styles) = {
            let sandbox = self.try_sandbox(app)?;
            (sandbox.container.head, sandbox.style_sheets.clone())
        };
        if let Some(head) = head {
            for style in styles {
                self.dom.append_child(head, style)?;
            }
        }
        self.patch_css_rules(app)
    }

    /// Moves the document-level listeners of `from` onto `to`.
    pub(crate) fn recover_document_listeners(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        for listener in self.dom.all_listeners(from) {
            self.dom.add_listener(to, listener)?;
        }
        Ok(())
    }
}
