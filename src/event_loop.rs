use super::*;

/// Work the virtual clock can run. Every variant that belongs to a sandbox carries the
/// sandbox serial; a task whose sandbox is gone (or was recreated) is dropped silently.
#[derive(Debug, Clone)]
pub(crate) enum Task {
    FetchSettled {
        kind: ResourceKind,
        url: String,
        outcome: FetchOutcome,
    },
    PrivateHtmlSettled {
        token: u64,
        outcome: FetchOutcome,
    },
    OutlineScript {
        app: String,
        serial: u64,
        node: NodeId,
        outcome: FetchOutcome,
    },
    IdleSlot {
        app: String,
        serial: u64,
        token: u64,
    },
    ContextProbe {
        app: String,
        serial: u64,
        stage: ProbeStage,
    },
    StylePatch {
        app: String,
        serial: u64,
        node: NodeId,
    },
    Preload {
        options: AppOptions,
    },
    GuestTimer {
        app: String,
        serial: u64,
        callback: FnId,
    },
}

impl Task {
    fn label(&self) -> &'static str {
        match self {
            Self::FetchSettled { .. } => "fetch",
            Self::PrivateHtmlSettled { .. } => "private-html",
            Self::OutlineScript { .. } => "outline-script",
            Self::IdleSlot { .. } => "idle",
            Self::ContextProbe { .. } => "context-probe",
            Self::StylePatch { .. } => "style-patch",
            Self::Preload { .. } => "preload",
            Self::GuestTimer { .. } => "guest-timer",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScheduledTask {
    pub(crate) id: i64,
    pub(crate) due_at: i64,
    pub(crate) order: i64,
    pub(crate) interval_ms: Option<i64>,
    pub(crate) task: Task,
}

#[derive(Debug)]
pub(crate) struct EventLoop {
    pub(crate) now_ms: i64,
    pub(crate) task_queue: Vec<ScheduledTask>,
    pub(crate) step_limit: usize,
    pub(crate) running_task_id: Option<i64>,
    pub(crate) running_canceled: bool,
    next_id: i64,
    next_order: i64,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self {
            now_ms: 0,
            task_queue: Vec::new(),
            step_limit: 10_000,
            running_task_id: None,
            running_canceled: false,
            next_id: 1,
            next_order: 0,
        }
    }
}

impl EventLoop {
    fn allocate_order(&mut self) -> i64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    pub(crate) fn schedule(&mut self, delay_ms: i64, task: Task) -> i64 {
        self.schedule_repeating(delay_ms, None, task)
    }

    pub(crate) fn schedule_repeating(
        &mut self,
        delay_ms: i64,
        interval_ms: Option<i64>,
        task: Task,
    ) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        let order = self.allocate_order();
        self.task_queue.push(ScheduledTask {
            id,
            due_at: self.now_ms.saturating_add(delay_ms.max(0)),
            order,
            interval_ms,
            task,
        });
        id
    }

    pub(crate) fn cancel(&mut self, id: i64) -> bool {
        if self.running_task_id == Some(id) {
            self.running_canceled = true;
        }
        let before = self.task_queue.len();
        self.task_queue.retain(|task| task.id != id);
        before != self.task_queue.len()
    }

    pub(crate) fn next_task_index(&self, due_limit: Option<i64>) -> Option<usize> {
        self.task_queue
            .iter()
            .enumerate()
            .filter(|(_, task)| due_limit.is_none_or(|limit| task.due_at <= limit))
            .min_by_key(|(_, task)| (task.due_at, task.order))
            .map(|(idx, _)| idx)
    }
}

impl HostPage {
    pub fn now_ms(&self) -> i64 {
        self.event_loop.now_ms
    }

    pub fn pending_task_count(&self) -> usize {
        self.event_loop.task_queue.len()
    }

    pub fn set_task_step_limit(&mut self, max_steps: usize) -> Result<()> {
        if max_steps == 0 {
            return Err(Error::Configuration(
                "set_task_step_limit requires at least 1 step".into(),
            ));
        }
        self.event_loop.step_limit = max_steps;
        Ok(())
    }

    pub fn advance_time(&mut self, delta_ms: i64) -> Result<()> {
        if delta_ms < 0 {
            return Err(Error::Configuration(
                "advance_time requires non-negative milliseconds".into(),
            ));
        }
        let from = self.event_loop.now_ms;
        self.event_loop.now_ms = self.event_loop.now_ms.saturating_add(delta_ms);
        let ran = self.run_timer_queue(Some(self.event_loop.now_ms), false)?;
        self.trace_line(
            TraceCategory::Timer,
            format!(
                "advance delta_ms={delta_ms} from={from} to={} ran_due={ran}",
                self.event_loop.now_ms
            ),
        );
        self.surface_failures()
    }

    pub fn advance_time_to(&mut self, target_ms: i64) -> Result<()> {
        if target_ms < self.event_loop.now_ms {
            return Err(Error::Configuration(format!(
                "advance_time_to requires target >= now_ms (target={target_ms}, now_ms={})",
                self.event_loop.now_ms
            )));
        }
        let from = self.event_loop.now_ms;
        self.event_loop.now_ms = target_ms;
        let ran = self.run_timer_queue(Some(target_ms), false)?;
        self.trace_line(
            TraceCategory::Timer,
            format!("advance_to from={from} to={target_ms} ran_due={ran}"),
        );
        self.surface_failures()
    }

    /// Runs every pending task, moving the clock forward as needed.
    pub fn flush(&mut self) -> Result<()> {
        let from = self.event_loop.now_ms;
        let ran = self.run_timer_queue(None, true)?;
        self.trace_line(
            TraceCategory::Timer,
            format!("flush from={from} to={} ran={ran}", self.event_loop.now_ms),
        );
        self.surface_failures()
    }

    pub fn run_next_timer(&mut self) -> Result<bool> {
        let Some(next_idx) = self.event_loop.next_task_index(None) else {
            self.trace_line(TraceCategory::Timer, "run_next none");
            return Ok(false);
        };
        let task = self.event_loop.task_queue.remove(next_idx);
        if task.due_at > self.event_loop.now_ms {
            self.event_loop.now_ms = task.due_at;
        }
        self.execute_task(task)?;
        self.surface_failures()?;
        Ok(true)
    }

    pub fn run_due_timers(&mut self) -> Result<usize> {
        let ran = self.run_timer_queue(Some(self.event_loop.now_ms), false)?;
        self.trace_line(
            TraceCategory::Timer,
            format!("run_due now_ms={} ran={ran}", self.event_loop.now_ms),
        );
        self.surface_failures()?;
        Ok(ran)
    }

    pub(crate) fn run_timer_queue(
        &mut self,
        due_limit: Option<i64>,
        advance_clock: bool,
    ) -> Result<usize> {
        let mut steps = 0usize;
        while let Some(next_idx) = self.event_loop.next_task_index(due_limit) {
            steps += 1;
            if steps > self.event_loop.step_limit {
                return Err(Error::TimerStepLimit {
                    limit: self.event_loop.step_limit,
                    now_ms: self.event_loop.now_ms,
                    due_limit,
                    pending: self.event_loop.task_queue.len(),
                });
            }
            let task = self.event_loop.task_queue.remove(next_idx);
            if advance_clock && task.due_at > self.event_loop.now_ms {
                self.event_loop.now_ms = task.due_at;
            }
            self.execute_task(task)?;
        }
        Ok(steps)
    }

    pub(crate) fn execute_task(&mut self, task: ScheduledTask) -> Result<()> {
        stacker::grow(32 * 1024 * 1024, || self.execute_task_impl(task))
    }

    fn execute_task_impl(&mut self, task: ScheduledTask) -> Result<()> {
        self.trace_line(
            TraceCategory::Timer,
            format!(
                "run id={} kind={} due_at={} now_ms={}",
                task.id,
                task.task.label(),
                task.due_at,
                self.event_loop.now_ms
            ),
        );
        self.event_loop.running_task_id = Some(task.id);
        self.event_loop.running_canceled = false;
        let outcome = self.dispatch_task(task.task.clone());
        let canceled = self.event_loop.running_canceled;
        self.event_loop.running_task_id = None;
        self.event_loop.running_canceled = false;
        outcome?;

        if let Some(interval_ms) = task.interval_ms {
            if !canceled && self.task_owner_alive(&task.task) {
                let delay_ms = interval_ms.max(0);
                let order = self.event_loop.allocate_order();
                self.event_loop.task_queue.push(ScheduledTask {
                    id: task.id,
                    due_at: task.due_at.saturating_add(delay_ms),
                    order,
                    interval_ms: Some(delay_ms),
                    task: task.task,
                });
            }
        }
        self.pump()
    }

    fn task_owner_alive(&self, task: &Task) -> bool {
        match task {
            Task::GuestTimer { app, serial, .. } => self.sandbox_is_live(app, *serial),
            _ => true,
        }
    }

    fn dispatch_task(&mut self, task: Task) -> Result<()> {
        match task {
            Task::FetchSettled { kind, url, outcome } => self.settle_fetch(kind, &url, outcome),
            Task::PrivateHtmlSettled { token, outcome } => {
                self.settle_private_html(token, outcome);
                Ok(())
            }
            Task::OutlineScript {
                app,
                serial,
                node,
                outcome,
            } => {
                if !self.sandbox_is_live(&app, serial) {
                    return Ok(());
                }
                self.finish_outline_script(&app, node, outcome)
            }
            Task::IdleSlot { app, serial, token } => {
                if !self.sandbox_is_live(&app, serial) {
                    return Ok(());
                }
                self.run_idle_work(&app, token)
            }
            Task::ContextProbe { app, serial, stage } => {
                if !self.sandbox_is_live(&app, serial) {
                    return Ok(());
                }
                self.probe_context(&app, stage)
            }
            Task::StylePatch { app, serial, node } => {
                if !self.sandbox_is_live(&app, serial) {
                    return Ok(());
                }
                self.run_style_patch(&app, node)
            }
            Task::Preload { options } => self.run_preload(options),
            Task::GuestTimer {
                app,
                serial,
                callback,
            } => {
                if !self.sandbox_is_live(&app, serial) {
                    return Ok(());
                }
                self.call_guest_function(&app, callback, &[]);
                Ok(())
            }
        }
    }

    /// Requests an idle slot. Platforms without an idle callback fall back to a 1 ms
    /// timer, which is what the modeled page always does.
    pub(crate) fn request_idle(&mut self, app: &str, serial: u64) -> u64 {
        let token = self.next_token();
        self.event_loop.schedule(
            1,
            Task::IdleSlot {
                app: app.to_string(),
                serial,
                token,
            },
        );
        token
    }

    pub(crate) fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}
