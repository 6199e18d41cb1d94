use super::*;

/// Keys of a job that are never copied onto the context script element as attributes.
const JOB_KEYS: [&str; 7] = ["src", "async", "defer", "crossorigin", "ignore", "module", "content"];

/// One script on its way into an execution context.
#[derive(Clone)]
pub(crate) struct ScriptJob {
    pub(crate) src: Option<String>,
    pub(crate) content: ContentRef,
    pub(crate) is_async: bool,
    pub(crate) defer: bool,
    pub(crate) module: bool,
    pub(crate) crossorigin: bool,
    pub(crate) crossorigin_type: String,
    pub(crate) attrs: Vec<(String, String)>,
    pub(crate) callback: Option<PropertyOverride>,
    /// Element the guest inserted, for dynamic scripts.
    pub(crate) raw_element: Option<NodeId>,
    /// Fire `load`/`error` on `raw_element` once the script settled.
    pub(crate) notify: bool,
}

impl fmt::Debug for ScriptJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptJob")
            .field("src", &self.src)
            .field("content", &self.content)
            .field("is_async", &self.is_async)
            .field("defer", &self.defer)
            .field("module", &self.module)
            .field("raw_element", &self.raw_element)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum QueueEntry {
    Script(ScriptJob),
    Mount,
    DomContentLoaded,
    Load,
    /// End of the start sequence.
    Resolve,
}

/// Work parked until an idle slot in fiber mode.
#[derive(Debug, Clone)]
pub(crate) enum IdleWork {
    Exec(ScriptJob),
    Mount,
    DomContentLoaded,
    Load,
}

/// The execution timeline of one sandbox. An entry is taken off the front only when
/// the previous one called forward.
#[derive(Debug, Default)]
pub(crate) struct ExecQueue {
    pub(crate) pending: VecDeque<QueueEntry>,
    pub(crate) running: bool,
    /// Front script waiting for its shared cache entry.
    pub(crate) awaiting: Option<ScriptJob>,
}

/// A dynamically inserted external script waiting its turn in the page-wide chain.
#[derive(Debug, Clone)]
pub(crate) struct DynamicJob {
    pub(crate) app: String,
    pub(crate) serial: u64,
    pub(crate) job: ScriptJob,
}

enum JobContent {
    Pending,
    Ready(ContentRef),
    Failed,
}

fn starts_with_doctype(code: &str) -> bool {
    code.get(..14)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("<!DOCTYPE html"))
}

impl HostPage {
    fn job_content(&self, content: &ContentRef) -> JobContent {
        match content {
            ContentRef::Cached(url) => match self.cache.state(ResourceKind::Script, url) {
                None | Some(EntryState::Pending) => JobContent::Pending,
                Some(EntryState::Ready(code)) => JobContent::Ready(ContentRef::Inline(code.clone())),
                Some(EntryState::Failed(_)) => JobContent::Failed,
            },
            other => JobContent::Ready(other.clone()),
        }
    }

    /// Queues the start sequence of `app`: before-loaders, sync and deferred scripts,
    /// mount, DOMContentLoaded, after-loaders, load. Async scripts run on their own as
    /// soon as their content exists.
    pub(crate) fn begin_start(&mut self, app: &str, parsed: &ParsedTemplate) -> Result<()> {
        let plugins = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.exec_flag = true;
            sandbox
                .context
                .set_global(POWERED_BY_FLAG, GlobalValue::Bool(true));
            sandbox.plugins.clone()
        };

        // Sync and deferred scripts share one queue in document order.
        let mut ordered = Vec::new();
        let mut async_jobs = Vec::new();
        for descriptor in &parsed.scripts {
            let job = self.script_job(app, descriptor);
            if job.is_async {
                async_jobs.push(job);
            } else {
                ordered.push(job);
            }
        }

        let mut entries: Vec<QueueEntry> = plugins
            .preset_scripts(LoaderStage::Before)
            .iter()
            .map(|spec| QueueEntry::Script(Self::preset_script_job(spec)))
            .collect();
        entries.extend(ordered.into_iter().map(QueueEntry::Script));
        entries.push(QueueEntry::Mount);
        entries.push(QueueEntry::DomContentLoaded);
        entries.extend(
            plugins
                .preset_scripts(LoaderStage::After)
                .iter()
                .map(|spec| QueueEntry::Script(Self::preset_script_job(spec))),
        );
        entries.push(QueueEntry::Load);
        entries.push(QueueEntry::Resolve);

        let (alive, has_unmount, running) = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.async_jobs.extend(async_jobs);
            sandbox.exec_queue.pending.extend(entries);
            (
                sandbox.alive,
                sandbox.context.global(UNMOUNT_GLOBAL).as_function().is_some(),
                sandbox.exec_queue.running,
            )
        };
        self.trace_line(
            TraceCategory::Scheduler,
            format!("start queued app={app} scripts={}", parsed.scripts.len()),
        );
        if alive || !has_unmount {
            self.remove_loading(app)?;
        }
        if !running {
            self.advance_queue(app)?;
        }
        Ok(())
    }

    /// Adds `entry` to the queue of `app` and starts it when nothing is in flight.
    pub(crate) fn enqueue(&mut self, app: &str, entry: QueueEntry) -> Result<()> {
        let running = {
            let queue = &mut self.try_sandbox_mut(app)?.exec_queue;
            queue.pending.push_back(entry);
            queue.running
        };
        if running {
            return Ok(());
        }
        self.advance_queue(app)
    }

    /// Takes the next entry off the queue of `app` and runs it.
    pub(crate) fn advance_queue(&mut self, app: &str) -> Result<()> {
        let entry = {
            let Some(sandbox) = self.sandbox_mut(app) else {
                return Ok(());
            };
            let entry = sandbox.exec_queue.pending.pop_front();
            sandbox.exec_queue.running = entry.is_some();
            entry
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        match entry {
            QueueEntry::Script(job) => self.run_queued_script(app, job),
            QueueEntry::Mount => self.schedule_or_run(app, IdleWork::Mount),
            QueueEntry::DomContentLoaded => self.schedule_or_run(app, IdleWork::DomContentLoaded),
            QueueEntry::Load => self.schedule_or_run(app, IdleWork::Load),
            QueueEntry::Resolve => {
                self.finish_pipeline(app)?;
                self.advance_queue(app)
            }
        }
    }

    fn run_queued_script(&mut self, app: &str, mut job: ScriptJob) -> Result<()> {
        match self.job_content(&job.content) {
            JobContent::Pending => {
                self.try_sandbox_mut(app)?.exec_queue.awaiting = Some(job);
                Ok(())
            }
            JobContent::Ready(content) => {
                job.content = content;
                self.schedule_or_run(app, IdleWork::Exec(job))
            }
            JobContent::Failed => {
                if let (true, Some(raw)) = (job.notify, job.raw_element) {
                    self.fire_node_event(raw, "error");
                }
                self.trace_line(
                    TraceCategory::Scheduler,
                    format!(
                        "skipped failed script app={app} src={}",
                        job.src.as_deref().unwrap_or("inline")
                    ),
                );
                self.advance_queue(app)
            }
        }
    }

    /// Runs `work` now, or after an idle slot in fiber mode.
    fn schedule_or_run(&mut self, app: &str, work: IdleWork) -> Result<()> {
        let (fiber, serial) = {
            let sandbox = self.try_sandbox(app)?;
            (sandbox.fiber, sandbox.serial)
        };
        if !fiber {
            return self.run_work(app, work);
        }
        let token = self.request_idle(app, serial);
        self.try_sandbox_mut(app)?.idle_work.insert(token, work);
        Ok(())
    }

    pub(crate) fn run_idle_work(&mut self, app: &str, token: u64) -> Result<()> {
        let Some(work) = self.try_sandbox_mut(app)?.idle_work.remove(&token) else {
            return Ok(());
        };
        self.run_work(app, work)
    }

    fn run_work(&mut self, app: &str, work: IdleWork) -> Result<()> {
        match work {
            IdleWork::Exec(job) => self.insert_script_to_context(app, job),
            IdleWork::Mount => self.mount(app, true),
            IdleWork::DomContentLoaded => {
                self.fire_context_document_event(app, "DOMContentLoaded")?;
                self.fire_context_window_event(app, "DOMContentLoaded")?;
                self.advance_queue(app)
            }
            IdleWork::Load => {
                self.try_sandbox_mut(app)?
                    .context
                    .document_props
                    .insert("readyState".to_string(), GlobalValue::from("complete"));
                self.fire_context_document_event(app, "readystatechange")?;
                self.fire_context_window_event(app, "load")?;
                self.advance_queue(app)
            }
        }
    }

    /// Creates the script element in the context head and runs it. Inline code runs
    /// right away; code with only a `src` is loaded by the context itself.
    pub(crate) fn insert_script_to_context(&mut self, app: &str, job: ScriptJob) -> Result<()> {
        let base = self.element_base(app)?;
        let (code, document, head, degrade) = {
            let sandbox = self.try_sandbox(app)?;
            let raw = match &job.content {
                ContentRef::Inline(code) => code.as_str(),
                _ => "",
            };
            let code = sandbox.plugins.js_transform(
                raw,
                job.src.as_deref().unwrap_or(""),
                &base,
                sandbox.replace.as_ref(),
            );
            let head = sandbox.context.head(&self.dom).ok_or_else(|| {
                Error::DomOperation(format!("execution context of {app} has no head"))
            })?;
            (code, sandbox.context.document, head, sandbox.degrade)
        };

        let script = self.dom.create_element(document, "script");
        for (key, value) in &job.attrs {
            if !JOB_KEYS.contains(&key.as_str()) {
                self.dom.set_attr(script, key, value)?;
            }
        }
        let inline = matches!(job.content, ContentRef::Inline(_));
        let importmap = self.dom.attr(script, "type").as_deref() == Some("importmap");
        if !inline {
            if let Some(src) = &job.src {
                self.dom.set_attr(script, "src", src)?;
            }
            if job.crossorigin {
                self.dom
                    .set_attr(script, "crossorigin", &job.crossorigin_type)?;
            }
        }
        if job.module {
            self.dom.set_attr(script, "type", "module")?;
        }
        if inline {
            self.dom.set_text_content(script, &code)?;
        }

        if starts_with_doctype(&code) {
            self.trace.borrow_mut().error(format!(
                "{WARN_SCRIPT_ERROR_REQUESTED}: {} returned an html page",
                job.src.as_deref().unwrap_or("inline script")
            ));
            if !job.is_async {
                return self.advance_queue(app);
            }
            return Ok(());
        }

        if let Some(tag) = job
            .raw_element
            .and_then(|raw| self.dom.attr(raw, SCRIPT_ID_ATTR))
        {
            self.dom.set_attr(script, SCRIPT_ID_ATTR, &tag)?;
        }
        self.dom.append_child(head, script)?;

        if let Some(callback) = job.callback.clone() {
            let outcome = {
                let mut scope = GuestScope::new(self, app);
                callback(&mut scope)
            };
            if let Err(err) = outcome {
                self.trace
                    .borrow_mut()
                    .error(format!("script loader callback failed: {err}"));
            }
        }
        self.run_element_hooks(app, append_or_insert_hook, script);

        if inline {
            let source = ScriptSource {
                src: job.src.clone(),
                code,
                module: job.module,
                wrapped: !degrade && !job.module && !importmap,
            };
            if let Err(err) = self.evaluate_script(app, &source) {
                self.trace
                    .borrow_mut()
                    .error(format!("uncaught error in {app}: {err}"));
            }
            return self.after_exec(app, &job);
        }

        let Some(src) = job.src.clone() else {
            return self.after_exec(app, &job);
        };
        let outcome = self.fetch_for(app, &src);
        let latency = match &outcome {
            Ok(response) => response.latency_ms,
            Err(failure) => failure.latency_ms,
        };
        let serial = {
            let sandbox = self.try_sandbox_mut(app)?;
            sandbox.outline_scripts.insert(script, job);
            sandbox.serial
        };
        self.trace_line(
            TraceCategory::Scheduler,
            format!("context loads script app={app} src={src} latency_ms={latency}"),
        );
        self.event_loop.schedule(
            latency,
            Task::OutlineScript {
                app: app.to_string(),
                serial,
                node: script,
                outcome,
            },
        );
        Ok(())
    }

    /// `onload`/`onerror` of a script the context loaded itself.
    pub(crate) fn finish_outline_script(
        &mut self,
        app: &str,
        node: NodeId,
        outcome: FetchOutcome,
    ) -> Result<()> {
        let Some(job) = self.try_sandbox_mut(app)?.outline_scripts.remove(&node) else {
            return Ok(());
        };
        let src = job.src.clone().unwrap_or_default();
        match outcome {
            Ok(response) if response.status < 400 => {
                let source = ScriptSource {
                    src: job.src.clone(),
                    code: response.body,
                    module: job.module,
                    wrapped: false,
                };
                if let Err(err) = self.evaluate_script(app, &source) {
                    self.trace
                        .borrow_mut()
                        .error(format!("uncaught error in {app}: {err}"));
                }
            }
            Ok(response) => self.trace.borrow_mut().error(format!(
                "{WARN_SCRIPT_ERROR_REQUESTED}: {src} (status {})",
                response.status
            )),
            Err(failure) => self
                .trace
                .borrow_mut()
                .error(format!("{WARN_SCRIPT_ERROR_REQUESTED}: {src} ({})", failure.reason)),
        }
        self.after_exec(app, &job)
    }

    fn after_exec(&mut self, app: &str, job: &ScriptJob) -> Result<()> {
        if let (true, Some(raw)) = (job.notify, job.raw_element) {
            self.fire_node_event(raw, "load");
        }
        if job.is_async {
            return Ok(());
        }
        self.advance_queue(app)
    }

    /// Calls the guest's mount entry point once, then moves the queue on when asked.
    pub(crate) fn mount(&mut self, app: &str, advance: bool) -> Result<()> {
        let (mounted, mount_fn, alive) = {
            let sandbox = self.try_sandbox(app)?;
            (
                sandbox.mount_flag,
                sandbox.context.global(MOUNT_GLOBAL).as_function(),
                sandbox.alive,
            )
        };
        if !mounted {
            if let Some(mount_fn) = mount_fn {
                self.remove_loading(app)?;
                self.run_lifecycle(app, |hooks| hooks.before_mount.as_ref());
                self.call_guest_function(app, mount_fn, &[]);
                self.run_lifecycle(app, |hooks| hooks.after_mount.as_ref());
                let sandbox = self.try_sandbox_mut(app)?;
                sandbox.mount_flag = true;
                sandbox.state = SandboxState::Mounted;
                self.trace_line(TraceCategory::Lifecycle, format!("mounted app={app}"));
            }
            if alive {
                self.run_lifecycle(app, |hooks| hooks.activated.as_ref());
            }
        }
        if advance {
            self.advance_queue(app)?;
        }
        Ok(())
    }

    /// Runs queued work that became possible: the event loop calls this after every
    /// task, and the public driving calls after every guest interaction.
    pub(crate) fn pump(&mut self) -> Result<()> {
        if self.pumping {
            return Ok(());
        }
        self.pumping = true;
        let outcome = self.pump_rounds();
        self.pumping = false;
        outcome
    }

    fn pump_rounds(&mut self) -> Result<()> {
        loop {
            let mut progressed = self.advance_pipelines()?;
            progressed |= self.resume_awaiting_scripts()?;
            progressed |= self.run_ready_async_scripts()?;
            progressed |= self.advance_dynamic_chain()?;
            progressed |= self.settle_style_jobs()?;
            if !progressed {
                return Ok(());
            }
        }
    }

    pub(crate) fn live_apps(&self) -> Vec<String> {
        self.registry
            .iter()
            .filter(|(_, entry)| entry.sandbox.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn resume_awaiting_scripts(&mut self) -> Result<bool> {
        let mut progressed = false;
        for app in self.live_apps() {
            let ready = match self.sandbox(&app).and_then(|s| s.exec_queue.awaiting.as_ref()) {
                Some(job) => !matches!(self.job_content(&job.content), JobContent::Pending),
                None => false,
            };
            if !ready {
                continue;
            }
            let Some(job) = self.try_sandbox_mut(&app)?.exec_queue.awaiting.take() else {
                continue;
            };
            self.run_queued_script(&app, job)?;
            progressed = true;
        }
        Ok(progressed)
    }

    fn run_ready_async_scripts(&mut self) -> Result<bool> {
        let mut progressed = false;
        for app in self.live_apps() {
            let jobs = std::mem::take(&mut self.try_sandbox_mut(&app)?.async_jobs);
            let mut waiting = Vec::new();
            for mut job in jobs {
                match self.job_content(&job.content) {
                    JobContent::Pending => waiting.push(job),
                    JobContent::Ready(content) => {
                        job.content = content;
                        self.schedule_or_run(&app, IdleWork::Exec(job))?;
                        progressed = true;
                    }
                    JobContent::Failed => progressed = true,
                }
            }
            if let Some(sandbox) = self.sandbox_mut(&app) {
                waiting.append(&mut sandbox.async_jobs);
                sandbox.async_jobs = waiting;
            }
        }
        Ok(progressed)
    }

    /// Moves dynamic external scripts into their sandbox queues strictly in insertion
    /// order, page-wide.
    fn advance_dynamic_chain(&mut self) -> Result<bool> {
        let mut progressed = false;
        while let Some(front) = self.dynamic_chain.front() {
            if !self.sandbox_is_live(&front.app, front.serial) {
                self.trace.borrow_mut().warn(WARN_REPEAT_RENDER);
                self.dynamic_chain.pop_front();
                progressed = true;
                continue;
            }
            let content = self.job_content(&front.job.content);
            if matches!(content, JobContent::Pending) {
                break;
            }
            let Some(DynamicJob { app, mut job, .. }) = self.dynamic_chain.pop_front() else {
                break;
            };
            progressed = true;
            match content {
                JobContent::Ready(content) => {
                    job.content = content;
                    self.enqueue(&app, QueueEntry::Script(job))?;
                }
                JobContent::Failed => {
                    if let Some(raw) = job.raw_element {
                        self.fire_node_event(raw, "error");
                    }
                }
                JobContent::Pending => {}
            }
        }
        Ok(progressed)
    }
}
