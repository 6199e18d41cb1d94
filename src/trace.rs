use super::*;

pub(crate) const WARN_NO_URL: &str = "url is required to start or preload an app";
pub(crate) const WARN_RELOAD_DISABLED: &str =
    "location.reload is disabled inside the sandbox";
pub(crate) const WARN_STOP_APP_RUN: &str =
    "host bundle detected inside a guest execution context, execution stopped";
pub(crate) const WARN_NO_SUBJECT: &str = "event has no subscribers";
pub(crate) const WARN_NOT_SUPPORTED: &str =
    "the platform cannot intercept properties, falling back to degrade mode";
pub(crate) const WARN_SCRIPT_ERROR_REQUESTED: &str = "script request error";
pub(crate) const WARN_CSS_ERROR_REQUESTED: &str = "css request error";
pub(crate) const WARN_HTML_ERROR_REQUESTED: &str = "html request error";
pub(crate) const WARN_REPEAT_RENDER: &str =
    "app was destroyed before its dynamic script finished loading";
pub(crate) const WARN_NO_SCRIPT: &str = "no script element found in the execution context";
pub(crate) const WARN_GET_ELEMENT_BY_ID: &str =
    "getElementById received an id with unsupported characters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCategory {
    Warn,
    Error,
    Timer,
    Fetch,
    Lifecycle,
    Bus,
    Sync,
    Patch,
    Render,
    Scheduler,
}

impl TraceCategory {
    fn tag(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Timer => "timer",
            Self::Fetch => "fetch",
            Self::Lifecycle => "lifecycle",
            Self::Bus => "bus",
            Self::Sync => "sync",
            Self::Patch => "patch",
            Self::Render => "render",
            Self::Scheduler => "scheduler",
        }
    }

    fn always_recorded(self) -> bool {
        matches!(self, Self::Warn | Self::Error)
    }
}

pub(crate) type SharedTrace = Rc<RefCell<TraceState>>;

#[derive(Debug)]
pub(crate) struct TraceState {
    pub(crate) enabled: bool,
    pub(crate) logs: VecDeque<String>,
    pub(crate) log_limit: usize,
    pub(crate) to_stderr: bool,
}

impl Default for TraceState {
    fn default() -> Self {
        Self {
            enabled: false,
            logs: VecDeque::new(),
            log_limit: 10_000,
            to_stderr: true,
        }
    }
}

impl TraceState {
    pub(crate) fn shared() -> SharedTrace {
        Rc::new(RefCell::new(Self::default()))
    }

    pub(crate) fn line(&mut self, category: TraceCategory, message: impl AsRef<str>) {
        if !self.enabled && !category.always_recorded() {
            return;
        }
        let line = format!("[{}] {}", category.tag(), message.as_ref());
        if self.to_stderr {
            eprintln!("{line}");
        }
        while self.logs.len() >= self.log_limit {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub(crate) fn warn(&mut self, message: impl AsRef<str>) {
        self.line(TraceCategory::Warn, message);
    }

    pub(crate) fn error(&mut self, message: impl AsRef<str>) {
        self.line(TraceCategory::Error, message);
    }

    pub(crate) fn set_log_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::Configuration(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.log_limit = max_entries;
        while self.logs.len() > self.log_limit {
            self.logs.pop_front();
        }
        Ok(())
    }

    pub(crate) fn take(&mut self) -> Vec<String> {
        self.logs.drain(..).collect()
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.logs
            .iter()
            .filter_map(|line| line.strip_prefix("[warn] "))
            .map(ToOwned::to_owned)
            .collect()
    }
}
