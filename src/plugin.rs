use super::*;

/// `(code, source_url, base_url) -> code`.
pub type Transform = Rc<dyn Fn(&str, &str, &str) -> String>;
/// Whole-document transform applied to fetched guest HTML.
pub type HtmlTransform = Rc<dyn Fn(&str) -> String>;
/// Called with each element the sandbox inserts or patches.
pub type ElementHook = Rc<dyn Fn(&mut GuestScope<'_>, NodeId) -> Result<()>>;
/// Called with `(event_type, handler)` whenever a guest registers or removes a listener.
pub type ListenerHook = Rc<dyn Fn(&mut GuestScope<'_>, &str, FnId) -> Result<()>>;
/// Runs once the virtual objects of a guest exist.
pub type PropertyOverride = Rc<dyn Fn(&mut GuestScope<'_>) -> Result<()>>;

const CSS_URL_PATTERN: &str = r#"url\((['"]?)((?:[^()]+|\((?:[^()]+|\([^()]*\))*\))*)(\1)\)"#;
const VIEW_TRANSITION_RESET: &str = "html {view-transition-name: none;}";

/// Url rule used by exclude and ignore lists: an exact url or a pattern.
#[derive(Debug, Clone)]
pub struct UrlMatcher(MatcherKind);

#[derive(Debug, Clone)]
enum MatcherKind {
    Exact(String),
    Pattern(Pattern),
}

impl UrlMatcher {
    pub fn exact(url: impl Into<String>) -> Self {
        Self(MatcherKind::Exact(url.into()))
    }

    pub fn pattern(source: &str) -> Result<Self> {
        Ok(Self(MatcherKind::Pattern(Pattern::new(source)?)))
    }

    pub fn matches(&self, url: &str) -> bool {
        match &self.0 {
            MatcherKind::Exact(exact) => exact == url,
            MatcherKind::Pattern(pattern) => pattern.is_match(url),
        }
    }
}

/// A synthetic script injected before or after the page's own scripts.
#[derive(Clone, Default)]
pub struct ScriptLoaderSpec {
    pub src: Option<String>,
    pub content: Option<String>,
    pub module: bool,
    pub attrs: Vec<(String, String)>,
    /// Runs right after the script has been inserted.
    pub callback: Option<PropertyOverride>,
}

impl ScriptLoaderSpec {
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn external(src: impl Into<String>) -> Self {
        Self {
            src: Some(src.into()),
            ..Self::default()
        }
    }
}

/// A synthetic stylesheet injected around the template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleLoaderSpec {
    pub src: Option<String>,
    pub content: Option<String>,
}

impl StyleLoaderSpec {
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            src: None,
            content: Some(content.into()),
        }
    }

    pub fn external(src: impl Into<String>) -> Self {
        Self {
            src: Some(src.into()),
            content: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Plugin {
    pub html_loader: Option<HtmlTransform>,
    pub js_loader: Option<Transform>,
    pub css_loader: Option<Transform>,
    pub js_excludes: Vec<UrlMatcher>,
    pub css_excludes: Vec<UrlMatcher>,
    pub js_ignores: Vec<UrlMatcher>,
    pub css_ignores: Vec<UrlMatcher>,
    pub js_before_loaders: Vec<ScriptLoaderSpec>,
    pub js_after_loaders: Vec<ScriptLoaderSpec>,
    pub css_before_loaders: Vec<StyleLoaderSpec>,
    pub css_after_loaders: Vec<StyleLoaderSpec>,
    pub window_add_event_listener_hook: Option<ListenerHook>,
    pub window_remove_event_listener_hook: Option<ListenerHook>,
    pub document_add_event_listener_hook: Option<ListenerHook>,
    pub document_remove_event_listener_hook: Option<ListenerHook>,
    pub append_or_insert_element_hook: Option<ElementHook>,
    pub patch_element_hook: Option<ElementHook>,
    pub window_property_override: Option<PropertyOverride>,
    pub document_property_override: Option<PropertyOverride>,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_html_loader(mut self, loader: impl Fn(&str) -> String + 'static) -> Self {
        self.html_loader = Some(Rc::new(loader));
        self
    }

    pub fn with_js_loader(mut self, loader: impl Fn(&str, &str, &str) -> String + 'static) -> Self {
        self.js_loader = Some(Rc::new(loader));
        self
    }

    pub fn with_css_loader(
        mut self,
        loader: impl Fn(&str, &str, &str) -> String + 'static,
    ) -> Self {
        self.css_loader = Some(Rc::new(loader));
        self
    }

    pub fn exclude_js(mut self, matcher: UrlMatcher) -> Self {
        self.js_excludes.push(matcher);
        self
    }

    pub fn exclude_css(mut self, matcher: UrlMatcher) -> Self {
        self.css_excludes.push(matcher);
        self
    }

    pub fn ignore_js(mut self, matcher: UrlMatcher) -> Self {
        self.js_ignores.push(matcher);
        self
    }

    pub fn ignore_css(mut self, matcher: UrlMatcher) -> Self {
        self.css_ignores.push(matcher);
        self
    }

    pub fn with_js_before_loader(mut self, loader: ScriptLoaderSpec) -> Self {
        self.js_before_loaders.push(loader);
        self
    }

    pub fn with_js_after_loader(mut self, loader: ScriptLoaderSpec) -> Self {
        self.js_after_loaders.push(loader);
        self
    }

    pub fn with_css_before_loader(mut self, loader: StyleLoaderSpec) -> Self {
        self.css_before_loaders.push(loader);
        self
    }

    pub fn with_css_after_loader(mut self, loader: StyleLoaderSpec) -> Self {
        self.css_after_loaders.push(loader);
        self
    }

    pub fn with_patch_element_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, NodeId) -> Result<()> + 'static,
    ) -> Self {
        self.patch_element_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_append_or_insert_element_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, NodeId) -> Result<()> + 'static,
    ) -> Self {
        self.append_or_insert_element_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_window_add_event_listener_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, &str, FnId) -> Result<()> + 'static,
    ) -> Self {
        self.window_add_event_listener_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_window_remove_event_listener_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, &str, FnId) -> Result<()> + 'static,
    ) -> Self {
        self.window_remove_event_listener_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_document_add_event_listener_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, &str, FnId) -> Result<()> + 'static,
    ) -> Self {
        self.document_add_event_listener_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_document_remove_event_listener_hook(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>, &str, FnId) -> Result<()> + 'static,
    ) -> Self {
        self.document_remove_event_listener_hook = Some(Rc::new(hook));
        self
    }

    pub fn with_window_property_override(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>) -> Result<()> + 'static,
    ) -> Self {
        self.window_property_override = Some(Rc::new(hook));
        self
    }

    pub fn with_document_property_override(
        mut self,
        hook: impl Fn(&mut GuestScope<'_>) -> Result<()> + 'static,
    ) -> Self {
        self.document_property_override = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("html_loader", &self.html_loader.is_some())
            .field("js_loader", &self.js_loader.is_some())
            .field("css_loader", &self.css_loader.is_some())
            .field("js_excludes", &self.js_excludes.len())
            .field("css_excludes", &self.css_excludes.len())
            .field("js_ignores", &self.js_ignores.len())
            .field("css_ignores", &self.css_ignores.len())
            .finish_non_exhaustive()
    }
}

/// Rewrites relative `url(...)` references against the stylesheet's own url.
pub(crate) fn css_relative_path_resolve(code: &str, src: &str, base: &str) -> String {
    let base_url = if src.is_empty() {
        base.to_string()
    } else {
        absolute_path(src, base, false)
    };
    let Ok(pattern) = Pattern::new(CSS_URL_PATTERN) else {
        return code.to_string();
    };
    pattern.replace_all_with(code, |matched| {
        let quote = matched.group(1).unwrap_or_default();
        let url = matched.group(2).unwrap_or_default();
        if url.starts_with("data:") {
            return matched.text.clone();
        }
        format!("url({quote}{}{quote})", absolute_path(url, &base_url, false))
    })
}

fn default_plugin() -> Plugin {
    Plugin {
        css_loader: Some(Rc::new(css_relative_path_resolve)),
        css_before_loaders: vec![StyleLoaderSpec::inline(VIEW_TRANSITION_RESET)],
        ..Plugin::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoaderStage {
    Before,
    After,
}

/// The plugin list of one sandbox, with the built-in plugin in front.
#[derive(Clone, Default)]
pub(crate) struct PluginChain {
    plugins: Vec<Plugin>,
}

impl PluginChain {
    pub(crate) fn new(plugins: &[Plugin]) -> Self {
        let mut all = vec![default_plugin()];
        all.extend(plugins.iter().cloned());
        Self { plugins: all }
    }

    pub(crate) fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub(crate) fn has_html_loader(&self) -> bool {
        self.plugins.iter().any(|plugin| plugin.html_loader.is_some())
    }

    pub(crate) fn html_transform(&self, html: &str) -> String {
        self.plugins
            .iter()
            .filter_map(|plugin| plugin.html_loader.as_ref())
            .fold(html.to_string(), |code, loader| loader(&code))
    }

    fn compose(
        &self,
        pick: impl Fn(&Plugin) -> Option<&Transform>,
        code: &str,
        src: &str,
        base: &str,
        replace: Option<&HtmlTransform>,
    ) -> String {
        let code = match replace {
            Some(replace) => replace(code),
            None => code.to_string(),
        };
        self.plugins
            .iter()
            .filter_map(|plugin| pick(plugin))
            .fold(code, |code, loader| loader(&code, src, base))
    }

    pub(crate) fn js_transform(
        &self,
        code: &str,
        src: &str,
        base: &str,
        replace: Option<&HtmlTransform>,
    ) -> String {
        self.compose(|plugin| plugin.js_loader.as_ref(), code, src, base, replace)
    }

    pub(crate) fn css_transform(
        &self,
        code: &str,
        src: &str,
        base: &str,
        replace: Option<&HtmlTransform>,
    ) -> String {
        self.compose(|plugin| plugin.css_loader.as_ref(), code, src, base, replace)
    }

    pub(crate) fn preset_scripts(&self, stage: LoaderStage) -> Vec<ScriptLoaderSpec> {
        self.plugins
            .iter()
            .flat_map(|plugin| match stage {
                LoaderStage::Before => plugin.js_before_loaders.iter(),
                LoaderStage::After => plugin.js_after_loaders.iter(),
            })
            .cloned()
            .collect()
    }

    /// Before-stage styles come out in reverse registration order.
    pub(crate) fn preset_styles(&self, stage: LoaderStage) -> Vec<StyleLoaderSpec> {
        let mut styles: Vec<StyleLoaderSpec> = self
            .plugins
            .iter()
            .flat_map(|plugin| match stage {
                LoaderStage::Before => plugin.css_before_loaders.iter(),
                LoaderStage::After => plugin.css_after_loaders.iter(),
            })
            .cloned()
            .collect();
        if stage == LoaderStage::Before {
            styles.reverse();
        }
        styles
    }

    pub(crate) fn js_excluded(&self, url: &str) -> bool {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.js_excludes.iter())
            .any(|matcher| matcher.matches(url))
    }

    pub(crate) fn css_excluded(&self, url: &str) -> bool {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.css_excludes.iter())
            .any(|matcher| matcher.matches(url))
    }

    pub(crate) fn js_ignored(&self, url: &str) -> bool {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.js_ignores.iter())
            .any(|matcher| matcher.matches(url))
    }

    pub(crate) fn css_ignored(&self, url: &str) -> bool {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.css_ignores.iter())
            .any(|matcher| matcher.matches(url))
    }

    pub(crate) fn element_hooks(&self, pick: fn(&Plugin) -> Option<&ElementHook>) -> Vec<ElementHook> {
        self.plugins.iter().filter_map(pick).cloned().collect()
    }

    pub(crate) fn listener_hooks(
        &self,
        pick: fn(&Plugin) -> Option<&ListenerHook>,
    ) -> Vec<ListenerHook> {
        self.plugins.iter().filter_map(pick).cloned().collect()
    }

    pub(crate) fn property_overrides(
        &self,
        pick: fn(&Plugin) -> Option<&PropertyOverride>,
    ) -> Vec<PropertyOverride> {
        self.plugins.iter().filter_map(pick).cloned().collect()
    }
}

impl HostPage {
    pub(crate) fn run_element_hooks(
        &mut self,
        app: &str,
        pick: fn(&Plugin) -> Option<&ElementHook>,
        node: NodeId,
    ) {
        let hooks = match self.sandbox(app) {
            Some(sandbox) => sandbox.plugins.element_hooks(pick),
            None => return,
        };
        for hook in hooks {
            let outcome = {
                let mut scope = GuestScope::new(self, app);
                hook(&mut scope, node)
            };
            if let Err(err) = outcome {
                self.trace.borrow_mut().error(format!("plugin hook failed: {err}"));
            }
        }
    }

    pub(crate) fn run_listener_hooks(
        &mut self,
        app: &str,
        pick: fn(&Plugin) -> Option<&ListenerHook>,
        event_type: &str,
        handler: FnId,
    ) {
        let hooks = match self.sandbox(app) {
            Some(sandbox) => sandbox.plugins.listener_hooks(pick),
            None => return,
        };
        for hook in hooks {
            let outcome = {
                let mut scope = GuestScope::new(self, app);
                hook(&mut scope, event_type, handler)
            };
            if let Err(err) = outcome {
                self.trace.borrow_mut().error(format!("plugin hook failed: {err}"));
            }
        }
    }

    pub(crate) fn run_property_overrides(
        &mut self,
        app: &str,
        pick: fn(&Plugin) -> Option<&PropertyOverride>,
    ) {
        let hooks = match self.sandbox(app) {
            Some(sandbox) => sandbox.plugins.property_overrides(pick),
            None => return,
        };
        for hook in hooks {
            let outcome = {
                let mut scope = GuestScope::new(self, app);
                hook(&mut scope)
            };
            if let Err(err) = outcome {
                self.trace.borrow_mut().error(format!("plugin hook failed: {err}"));
            }
        }
    }
}
