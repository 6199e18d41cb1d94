use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub latency_ms: i64,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            latency_ms: 0,
        }
    }
}

/// A request that never produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFailure {
    pub reason: String,
    pub latency_ms: i64,
}

pub(crate) type FetchOutcome = std::result::Result<FetchResponse, NetworkFailure>;

/// Network access used by the resource pipeline. A response is delivered to the page
/// `latency_ms` after the request.
pub trait Fetcher {
    fn fetch(&self, url: &str) -> std::result::Result<FetchResponse, NetworkFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub url: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone)]
enum Route {
    Respond(FetchResponse),
    Fail(NetworkFailure),
}

#[derive(Debug, Default)]
struct MockNetworkState {
    routes: HashMap<String, Route>,
    requests: Vec<RequestRecord>,
    default_latency_ms: i64,
}

/// Routed in-memory network. Clones share routes and the request log, so a test can keep
/// one handle while the page owns another.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Rc<RefCell<MockNetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency_ms: i64) -> Self {
        self.state.borrow_mut().default_latency_ms = latency_ms.max(0);
        self
    }

    pub fn route(&self, url: &str, body: &str) {
        let latency_ms = self.state.borrow().default_latency_ms;
        self.route_with(url, 200, body, latency_ms);
    }

    pub fn route_with(&self, url: &str, status: u16, body: &str, latency_ms: i64) {
        self.state.borrow_mut().routes.insert(
            url.to_string(),
            Route::Respond(FetchResponse {
                status,
                body: body.to_string(),
                latency_ms: latency_ms.max(0),
            }),
        );
    }

    pub fn fail(&self, url: &str, reason: &str) {
        let latency_ms = self.state.borrow().default_latency_ms;
        self.state.borrow_mut().routes.insert(
            url.to_string(),
            Route::Fail(NetworkFailure {
                reason: reason.to_string(),
                latency_ms,
            }),
        );
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.borrow().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|record| record.url == url)
            .count()
    }
}

impl Fetcher for MockNetwork {
    fn fetch(&self, url: &str) -> std::result::Result<FetchResponse, NetworkFailure> {
        let mut state = self.state.borrow_mut();
        let route = state.routes.get(url).cloned();
        let default_latency_ms = state.default_latency_ms;
        let outcome = match route {
            Some(Route::Respond(response)) => Ok(response),
            Some(Route::Fail(failure)) => Err(failure),
            None => Ok(FetchResponse {
                status: 404,
                body: String::new(),
                latency_ms: default_latency_ms,
            }),
        };
        state.requests.push(RequestRecord {
            url: url.to_string(),
            status: outcome.as_ref().ok().map(|response| response.status),
        });
        outcome
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryState {
    Pending,
    Ready(String),
    Failed(Error),
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) state: EntryState,
    /// Apps that asked for this entry while it was pending.
    pub(crate) requesters: Vec<String>,
}

/// Process-scoped content caches, one per resource kind, keyed by absolute url. Each key
/// is written once; failures stay cached.
#[derive(Debug, Default)]
pub(crate) struct ContentCache {
    html: HashMap<String, CacheEntry>,
    script: HashMap<String, CacheEntry>,
    style: HashMap<String, CacheEntry>,
}

impl ContentCache {
    fn table(&self, kind: ResourceKind) -> &HashMap<String, CacheEntry> {
        match kind {
            ResourceKind::Html => &self.html,
            ResourceKind::Script => &self.script,
            ResourceKind::Style => &self.style,
        }
    }

    fn table_mut(&mut self, kind: ResourceKind) -> &mut HashMap<String, CacheEntry> {
        match kind {
            ResourceKind::Html => &mut self.html,
            ResourceKind::Script => &mut self.script,
            ResourceKind::Style => &mut self.style,
        }
    }

    pub(crate) fn state(&self, kind: ResourceKind, url: &str) -> Option<&EntryState> {
        self.table(kind).get(url).map(|entry| &entry.state)
    }

    pub(crate) fn insert_pending(&mut self, kind: ResourceKind, url: &str, app: &str) {
        self.table_mut(kind).insert(
            url.to_string(),
            CacheEntry {
                state: EntryState::Pending,
                requesters: vec![app.to_string()],
            },
        );
    }

    pub(crate) fn add_requester(&mut self, kind: ResourceKind, url: &str, app: &str) {
        if let Some(entry) = self.table_mut(kind).get_mut(url) {
            if !entry.requesters.iter().any(|known| known == app) {
                entry.requesters.push(app.to_string());
            }
        }
    }

    /// Stores the final state and returns who was waiting for it.
    pub(crate) fn settle(&mut self, kind: ResourceKind, url: &str, state: EntryState) -> Vec<String> {
        let entry = self
            .table_mut(kind)
            .entry(url.to_string())
            .or_insert_with(|| CacheEntry {
                state: EntryState::Pending,
                requesters: Vec::new(),
            });
        entry.state = state;
        std::mem::take(&mut entry.requesters)
    }
}

impl HostPage {
    /// Content of `url` from the shared cache, starting a fetch on first use. A failed
    /// entry is reported to the new requester right away instead of being retried.
    pub(crate) fn request_asset(&mut self, app: &str, kind: ResourceKind, url: &str) {
        match self.cache.state(kind, url).cloned() {
            Some(EntryState::Pending) => self.cache.add_requester(kind, url, app),
            Some(EntryState::Ready(_)) => {}
            Some(EntryState::Failed(err)) => self.report_load_error(app, kind, url, &err),
            None => {
                self.cache.insert_pending(kind, url, app);
                let outcome = self.fetch_for(app, url);
                let latency = match &outcome {
                    Ok(response) => response.latency_ms,
                    Err(failure) => failure.latency_ms,
                };
                self.trace_line(
                    TraceCategory::Fetch,
                    format!("request kind={kind} url={url} app={app} latency_ms={latency}"),
                );
                self.event_loop.schedule(
                    latency,
                    Task::FetchSettled {
                        kind,
                        url: url.to_string(),
                        outcome,
                    },
                );
            }
        }
    }

    /// Uses the app's fetch override when one is configured.
    pub(crate) fn fetch_for(&self, app: &str, url: &str) -> FetchOutcome {
        let fetcher = self
            .sandbox(app)
            .and_then(|sandbox| sandbox.fetcher.clone())
            .or_else(|| {
                self.registry
                    .get(app)
                    .and_then(|entry| entry.options.as_ref())
                    .and_then(|options| options.fetch.clone())
            })
            .unwrap_or_else(|| self.fetcher.clone());
        fetcher.fetch(url)
    }

    pub(crate) fn settle_fetch(
        &mut self,
        kind: ResourceKind,
        url: &str,
        outcome: FetchOutcome,
    ) -> Result<()> {
        let state = match outcome {
            Ok(response) if response.status < 400 => EntryState::Ready(response.body),
            Ok(response) => EntryState::Failed(Error::ResourceFetch {
                url: url.to_string(),
                kind,
                reason: format!("status {}", response.status),
            }),
            Err(failure) => EntryState::Failed(Error::ResourceFetch {
                url: url.to_string(),
                kind,
                reason: failure.reason,
            }),
        };
        self.trace_line(
            TraceCategory::Fetch,
            format!(
                "settled kind={kind} url={url} ok={}",
                matches!(state, EntryState::Ready(_))
            ),
        );
        let failure = match &state {
            EntryState::Failed(err) => Some(err.clone()),
            _ => None,
        };
        let requesters = self.cache.settle(kind, url, state);
        if let Some(err) = failure {
            for app in requesters {
                self.report_load_error(&app, kind, url, &err);
            }
        }
        Ok(())
    }

    pub(crate) fn report_load_error(&mut self, app: &str, kind: ResourceKind, url: &str, err: &Error) {
        let warning = match kind {
            ResourceKind::Html => WARN_HTML_ERROR_REQUESTED,
            ResourceKind::Script => WARN_SCRIPT_ERROR_REQUESTED,
            ResourceKind::Style => WARN_CSS_ERROR_REQUESTED,
        };
        self.trace.borrow_mut().error(format!("{warning}: {url} ({err})"));
        let hook = self
            .sandbox(app)
            .and_then(|sandbox| sandbox.lifecycles.load_error.clone());
        if let Some(hook) = hook {
            hook(url, err);
        }
    }
}
