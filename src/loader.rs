use super::*;

/// Where the code of a script job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContentRef {
    Inline(String),
    /// Shared script cache entry of this url.
    Cached(String),
    /// Left for the execution context to load itself by `src`.
    Outline,
}

/// Where the guest HTML of a pipeline comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HtmlSource {
    Inline(String),
    /// Shared html cache entry of this url.
    Shared(String),
    /// A fetch outside the cache; used when a plugin rewrites the HTML.
    Private { token: u64, url: String },
}

/// A `<link rel="stylesheet">` a guest inserted, waiting for its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StyleJob {
    pub(crate) app: String,
    pub(crate) serial: u64,
    pub(crate) url: String,
    /// The link element the guest created; it never enters the page.
    pub(crate) raw: NodeId,
    pub(crate) parent: NodeId,
    /// Placeholder comment marking the insertion point.
    pub(crate) anchor: NodeId,
    pub(crate) ignore: bool,
}

fn outcome_to_result(url: &str, outcome: FetchOutcome) -> Result<String> {
    match outcome {
        Ok(response) if response.status < 400 => Ok(response.body),
        Ok(response) => Err(Error::ResourceFetch {
            url: url.to_string(),
            kind: ResourceKind::Html,
            reason: format!("status {}", response.status),
        }),
        Err(failure) => Err(Error::ResourceFetch {
            url: url.to_string(),
            kind: ResourceKind::Html,
            reason: failure.reason,
        }),
    }
}

impl HostPage {
    /// Starts loading the guest HTML: inline markup, a private fetch when a plugin
    /// rewrites HTML, or the shared cache.
    pub(crate) fn request_html(&mut self, app: &str, options: &AppOptions) -> Result<HtmlSource> {
        if let Some(html) = &options.html {
            return Ok(HtmlSource::Inline(html.clone()));
        }
        let (url, private) = {
            let sandbox = self.try_sandbox(app)?;
            (sandbox.url.clone(), sandbox.plugins.has_html_loader())
        };
        if !private {
            self.request_asset(app, ResourceKind::Html, &url);
            return Ok(HtmlSource::Shared(url));
        }
        let token = self.next_token();
        let outcome = self.fetch_for(app, &url);
        let latency = match &outcome {
            Ok(response) => response.latency_ms,
            Err(failure) => failure.latency_ms,
        };
        self.private_html.insert(token, None);
        self.event_loop
            .schedule(latency, Task::PrivateHtmlSettled { token, outcome });
        self.trace_line(
            TraceCategory::Fetch,
            format!("request kind=html url={url} app={app} private=true"),
        );
        Ok(HtmlSource::Private { token, url })
    }

    pub(crate) fn settle_private_html(&mut self, token: u64, outcome: FetchOutcome) {
        if let Some(slot) = self.private_html.get_mut(&token) {
            *slot = Some(outcome);
        }
    }

    /// The HTML once it has arrived. Private fetch failures are reported here; shared
    /// ones were reported when the cache settled.
    pub(crate) fn take_html(&mut self, app: &str, source: &HtmlSource) -> Option<Result<String>> {
        match source {
            HtmlSource::Inline(html) => Some(Ok(html.clone())),
            HtmlSource::Shared(url) => match self.cache.state(ResourceKind::Html, url)? {
                EntryState::Pending => None,
                EntryState::Ready(html) => Some(Ok(html.clone())),
                EntryState::Failed(err) => Some(Err(err.clone())),
            },
            HtmlSource::Private { token, url } => {
                let outcome = self.private_html.get_mut(token)?.take()?;
                self.private_html.remove(token);
                let result = outcome_to_result(url, outcome);
                if let Err(err) = &result {
                    self.report_load_error(app, ResourceKind::Html, url, err);
                }
                Some(result)
            }
        }
    }

    /// Runs the HTML plugins and splits the page. Excluded assets are dropped; ignored
    /// ones are flagged.
    pub(crate) fn prepare_template(&mut self, app: &str, html: &str) -> Result<ParsedTemplate> {
        let sandbox = self.try_sandbox(app)?;
        let public_path = default_public_path(&sandbox.url, &self.location.href());
        let transformed = sandbox.plugins.html_transform(html);
        let mut parsed = process_template(&transformed, &public_path)?;
        let plugins = &sandbox.plugins;
        parsed.scripts.retain(|script| {
            script
                .src
                .as_deref()
                .is_none_or(|src| !plugins.js_excluded(src))
        });
        for script in &mut parsed.scripts {
            if let Some(src) = &script.src {
                script.ignore = script.ignore || plugins.js_ignored(src);
            }
        }
        parsed.styles.retain(|style| {
            style
                .src
                .as_deref()
                .is_none_or(|src| !plugins.css_excluded(src))
        });
        for style in &mut parsed.styles {
            if let Some(src) = &style.src {
                style.ignore = style.ignore || plugins.css_ignored(src);
            }
        }
        self.trace_line(
            TraceCategory::Lifecycle,
            format!(
                "template parsed app={app} scripts={} styles={}",
                parsed.scripts.len(),
                parsed.styles.len()
            ),
        );
        Ok(parsed)
    }

    /// Fetches the external template styles and the url-only preset styles.
    pub(crate) fn request_styles(&mut self, app: &str, parsed: &ParsedTemplate) -> Result<()> {
        let mut urls: Vec<String> = parsed
            .styles
            .iter()
            .filter(|style| !style.ignore)
            .filter_map(|style| style.src.clone())
            .collect();
        let plugins = self.try_sandbox(app)?.plugins.clone();
        for stage in [LoaderStage::Before, LoaderStage::After] {
            urls.extend(
                plugins
                    .preset_styles(stage)
                    .into_iter()
                    .filter(|spec| spec.content.is_none())
                    .filter_map(|spec| spec.src),
            );
        }
        for url in urls {
            self.request_asset(app, ResourceKind::Style, &url);
        }
        Ok(())
    }

    fn style_settled(&self, url: &str) -> bool {
        !matches!(
            self.cache.state(ResourceKind::Style, url),
            None | Some(EntryState::Pending)
        )
    }

    pub(crate) fn styles_settled(&self, app: &str, parsed: &ParsedTemplate) -> bool {
        let template_ready = parsed
            .styles
            .iter()
            .filter(|style| !style.ignore)
            .filter_map(|style| style.src.as_deref())
            .all(|url| self.style_settled(url));
        let presets_ready = self.sandbox(app).is_none_or(|sandbox| {
            [LoaderStage::Before, LoaderStage::After]
                .into_iter()
                .flat_map(|stage| sandbox.plugins.preset_styles(stage))
                .filter(|spec| spec.content.is_none())
                .filter_map(|spec| spec.src)
                .all(|url| self.style_settled(&url))
        });
        template_ready && presets_ready
    }

    /// Replaces the style placeholders of the template with the transformed CSS, then
    /// applies the app's `replace` transform to the whole page. Failed styles embed
    /// empty.
    pub(crate) fn embed_styles(&self, app: &str, parsed: &ParsedTemplate) -> Result<String> {
        let sandbox = self.try_sandbox(app)?;
        let cur_url = sandbox.current_url();
        let mut html = parsed.template.clone();
        for style in &parsed.styles {
            match (&style.src, style.inline_index) {
                (Some(src), _) => {
                    let placeholder = as_comment(&link_placeholder(src, false));
                    let replacement = if style.ignore {
                        format!(r#"<link href="{src}" rel="stylesheet" type="text/css">"#)
                    } else {
                        let content = match self.cache.state(ResourceKind::Style, src) {
                            Some(EntryState::Ready(content)) => content.as_str(),
                            _ => "",
                        };
                        let css = sandbox.plugins.css_transform(content, src, &cur_url, None);
                        format!("<style>/* {src} */{css}</style>")
                    };
                    html = html.replacen(&placeholder, &replacement, 1);
                }
                (None, Some(index)) => {
                    let placeholder = as_comment(&inline_style_placeholder(index));
                    let content = style.content.as_deref().unwrap_or_default();
                    let css = sandbox.plugins.css_transform(content, "", &cur_url, None);
                    html = html.replacen(
                        &placeholder,
                        &format!("<style>/* inline-style-{index} */{css}</style>"),
                        1,
                    );
                }
                (None, None) => {}
            }
        }
        Ok(match &sandbox.replace {
            Some(replace) => replace(&html),
            None => html,
        })
    }

    /// Job for a page script. Code with a `src` comes from the shared cache, except
    /// module and ignored scripts, which the context loads itself.
    pub(crate) fn script_job(&mut self, app: &str, descriptor: &ScriptDescriptor) -> ScriptJob {
        let content = match &descriptor.src {
            Some(_) if descriptor.module || descriptor.ignore => ContentRef::Outline,
            Some(src) => {
                self.request_asset(app, ResourceKind::Script, src);
                ContentRef::Cached(src.clone())
            }
            None => ContentRef::Inline(descriptor.content.clone().unwrap_or_default()),
        };
        ScriptJob {
            src: descriptor.src.clone(),
            content,
            is_async: descriptor.is_async,
            defer: descriptor.defer || (descriptor.module && !descriptor.is_async),
            module: descriptor.module,
            crossorigin: descriptor.crossorigin,
            crossorigin_type: descriptor.crossorigin_type.clone(),
            attrs: descriptor.attrs.clone(),
            callback: None,
            raw_element: None,
            notify: false,
        }
    }

    pub(crate) fn preset_script_job(spec: &ScriptLoaderSpec) -> ScriptJob {
        let content = match (&spec.content, &spec.src) {
            (Some(content), _) => ContentRef::Inline(content.clone()),
            (None, Some(_)) => ContentRef::Outline,
            (None, None) => ContentRef::Inline(String::new()),
        };
        ScriptJob {
            src: spec.src.clone(),
            content,
            is_async: false,
            defer: false,
            module: spec.module,
            crossorigin: false,
            crossorigin_type: String::new(),
            attrs: spec.attrs.clone(),
            callback: spec.callback.clone(),
            raw_element: None,
            notify: false,
        }
    }

    /// Preload without execution: only warms the script cache.
    pub(crate) fn request_scripts(&mut self, app: &str, parsed: &ParsedTemplate) {
        for script in &parsed.scripts {
            if let Some(src) = script.src.as_deref().filter(|_| !script.module && !script.ignore) {
                self.request_asset(app, ResourceKind::Script, src);
            }
        }
    }

    /// Whether every script a preload warms has settled, successfully or not.
    pub(crate) fn scripts_settled(&self, parsed: &ParsedTemplate) -> bool {
        parsed
            .scripts
            .iter()
            .filter(|script| !script.module && !script.ignore)
            .filter_map(|script| script.src.as_deref())
            .all(|src| {
                matches!(
                    self.cache.state(ResourceKind::Script, src),
                    Some(EntryState::Ready(_) | EntryState::Failed(_))
                )
            })
    }

    /// Turns settled dynamic stylesheet links into styles. A failed fetch still yields an
    /// (empty) style and a `load` event.
    pub(crate) fn settle_style_jobs(&mut self) -> Result<bool> {
        let mut progressed = false;
        let mut index = 0;
        while index < self.style_jobs.len() {
            let job = &self.style_jobs[index];
            if !self.sandbox_is_live(&job.app, job.serial) {
                self.style_jobs.remove(index);
                progressed = true;
                continue;
            }
            let content = if job.ignore {
                Some(None)
            } else {
                match self.cache.state(ResourceKind::Style, &job.url) {
                    Some(EntryState::Ready(content)) => Some(Some(content.clone())),
                    Some(EntryState::Failed(_)) => Some(Some(String::new())),
                    _ => None,
                }
            };
            let Some(content) = content else {
                index += 1;
                continue;
            };
            let job = self.style_jobs.remove(index);
            self.finish_style_job(job, content)?;
            progressed = true;
        }
        Ok(progressed)
    }

    fn finish_style_job(&mut self, job: StyleJob, content: Option<String>) -> Result<()> {
        let siblings = self.dom.children(job.parent);
        let reference = siblings
            .iter()
            .position(|node| *node == job.anchor)
            .and_then(|position| siblings.get(position + 1).copied());
        let Some(content) = content else {
            self.dom.insert_before(job.parent, job.raw, reference)?;
            return Ok(());
        };
        let css = self.transform_style_text(&job.app, &content, &job.url)?;
        let style = self.create_style_element(job.parent, &css)?;
        for (key, value) in self.dom.attrs(job.raw) {
            if !matches!(key.as_str(), "href" | "rel" | "type") {
                self.dom.set_attr(style, &key, &value)?;
            }
        }
        self.dom.insert_before(job.parent, style, reference)?;
        {
            let sandbox = self.try_sandbox_mut(&job.app)?;
            sandbox.style_sheets.push(style);
            sandbox.patched_styles.insert(style);
        }
        self.patch_element_effect(&job.app, style)?;
        self.schedule_style_patch(&job.app, style)?;
        self.fire_node_event(job.raw, "load");
        self.trace_line(
            TraceCategory::Patch,
            format!("dynamic style ready app={} url={}", job.app, job.url),
        );
        Ok(())
    }
}
