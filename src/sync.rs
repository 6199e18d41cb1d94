use super::*;

const SHORT_PATH_PATTERN: &str = r"^\{([^}]*)\}";

/// One entry of the joint session history: the host url and the context url of every
/// guest that navigated up to this point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HistoryEntry {
    pub(crate) href: String,
    pub(crate) contexts: BTreeMap<String, String>,
}

/// Session history shared by the host page and every execution context in it.
#[derive(Debug, Clone)]
pub(crate) struct HostHistory {
    pub(crate) entries: Vec<HistoryEntry>,
    pub(crate) index: usize,
}

impl HostHistory {
    pub(crate) fn new(href: &str) -> Self {
        Self {
            entries: vec![HistoryEntry {
                href: href.to_string(),
                contexts: BTreeMap::new(),
            }],
            index: 0,
        }
    }

    fn current(&self) -> HistoryEntry {
        self.entries
            .get(self.index)
            .cloned()
            .unwrap_or_else(|| HistoryEntry {
                href: String::new(),
                contexts: BTreeMap::new(),
            })
    }

    fn current_mut(&mut self) -> Option<&mut HistoryEntry> {
        self.entries.get_mut(self.index)
    }

    /// Adds `entry` after the current one, dropping the forward entries.
    fn push(&mut self, entry: HistoryEntry) {
        self.entries.truncate(self.index + 1);
        self.entries.push(entry);
        self.index = self.entries.len() - 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Raw `id -> value` pairs of a search string in first-seen order. Pairs with an empty
/// key or value are skipped; values stay encoded.
fn query_map(search: &str) -> Vec<(String, String)> {
    let mut map: Vec<(String, String)> = Vec::new();
    for part in search.trim_start_matches('?').split('&') {
        let mut pieces = part.split('=');
        let key = pieces.next().unwrap_or_default();
        let value = pieces.next().unwrap_or_default();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        set_query(&mut map, key, value.to_string());
    }
    map
}

fn set_query(map: &mut Vec<(String, String)>, key: &str, value: String) {
    match map.iter_mut().find(|(known, _)| known == key) {
        Some(entry) => entry.1 = value,
        None => map.push((key.to_string(), value)),
    }
}

fn query_value<'a>(map: &'a [(String, String)], key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(known, _)| known == key)
        .map(|(_, value)| value.as_str())
}

fn query_string(map: &[(String, String)]) -> String {
    if map.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = map.iter().map(|(key, value)| format!("{key}={value}")).collect();
    format!("?{}", pairs.join("&"))
}

/// Short key of the longest prefix path `path` starts with.
fn longest_prefix<'a>(path: &str, prefix: &'a BTreeMap<String, String>) -> Option<(&'a str, &'a str)> {
    prefix
        .iter()
        .filter(|(_, long)| path.starts_with(long.as_str()))
        .max_by_key(|(_, long)| long.len())
        .map(|(short, long)| (short.as_str(), long.as_str()))
}

/// Query value carrying a guest path: the longest matching prefix becomes `{short}`,
/// then the whole path is URI-encoded.
pub fn encode_sync_path(path: &str, prefix: &BTreeMap<String, String>) -> String {
    let shortened = match longest_prefix(path, prefix) {
        Some((short, long)) => path.replacen(long, &format!("{{{short}}}"), 1),
        None => path.to_string(),
    };
    encode_uri_component(&shortened)
}

/// Inverse of [`encode_sync_path`]. A leading `{short}` with a known key expands to its
/// long path; unknown keys are left as written.
pub fn decode_sync_path(value: &str, prefix: &BTreeMap<String, String>) -> Result<String> {
    let decoded = decode_uri_component(value)?;
    let short = Pattern::new(SHORT_PATH_PATTERN)?.first_group(&decoded, 1);
    Ok(match short.and_then(|short| prefix.get(&short).map(|long| (short, long))) {
        Some((short, long)) => decoded.replacen(&format!("{{{short}}}"), long, 1),
        None => decoded,
    })
}

impl HostPage {
    fn set_host_href(&mut self, href: &str) -> Result<()> {
        self.location = LocationParts::parse(href)
            .ok_or_else(|| Error::Configuration(format!("invalid host url {href}")))?;
        Ok(())
    }

    fn host_replace_state(&mut self, href: &str) -> Result<()> {
        self.set_host_href(href)?;
        if let Some(entry) = self.history.current_mut() {
            entry.href = href.to_string();
        }
        self.trace_line(TraceCategory::Sync, format!("host replaceState {href}"));
        Ok(())
    }

    fn host_push_state(&mut self, href: &str) -> Result<()> {
        self.set_host_href(href)?;
        let mut entry = self.history.current();
        entry.href = href.to_string();
        self.history.push(entry);
        self.trace_line(TraceCategory::Sync, format!("host pushState {href}"));
        Ok(())
    }

    fn host_href_with_query(&self, map: &[(String, String)]) -> String {
        let mut next = self.location.clone();
        next.search = query_string(map);
        next.href()
    }

    pub(crate) fn history_push_context(&mut self, app: &str, main_url: &str) {
        let mut entry = self.history.current();
        entry.href = self.location.href();
        entry.contexts.insert(app.to_string(), main_url.to_string());
        self.history.push(entry);
    }

    pub(crate) fn history_replace_context(&mut self, app: &str, main_url: &str) {
        if let Some(entry) = self.history.current_mut() {
            entry.contexts.insert(app.to_string(), main_url.to_string());
        }
    }

    pub(crate) fn sync_query_has(&self, app: &str) -> bool {
        query_value(&query_map(&self.location.search), app).is_some()
    }

    /// Writes the context route of `app` into the host query, shortened by the prefix
    /// table. A non-syncing app only has its stale entry removed.
    pub(crate) fn sync_url_to_window(&mut self, app: &str) -> Result<()> {
        let mut map = query_map(&self.location.search);
        let (sync, current, prefix) = {
            let sandbox = self.try_sandbox(app)?;
            if !sandbox.context.is_ready() {
                return Ok(());
            }
            let location = &sandbox.context.location;
            (
                sandbox.sync,
                format!("{}{}{}", location.pathname, location.search, location.hash),
                sandbox.prefix.clone(),
            )
        };
        if !sync && query_value(&map, app).is_none() {
            return Ok(());
        }
        if sync {
            set_query(&mut map, app, encode_sync_path(&current, &prefix));
        } else {
            map.retain(|(key, _)| key != app);
        }
        let href = self.host_href_with_query(&map);
        if href != self.location.href() {
            self.host_replace_state(&href)?;
        }
        Ok(())
    }

    /// Guest path recorded for `app` in the host query, with its prefix expanded.
    fn sync_url(&self, app: &str, prefix: &BTreeMap<String, String>) -> String {
        let map = query_map(&self.location.search);
        query_value(&map, app)
            .and_then(|value| decode_sync_path(value, prefix).ok())
            .unwrap_or_default()
    }

    /// Replays the route the host url carries for `app` into its context. Only a first
    /// run reads the host query; later activations use the configured url.
    pub(crate) fn sync_url_to_iframe(&mut self, app: &str) -> Result<()> {
        let (id_url, url, current, main_host_path) = {
            let sandbox = self.try_sandbox(app)?;
            let id_url = if sandbox.sync && !sandbox.exec_flag {
                self.sync_url(app, &sandbox.prefix)
            } else {
                sandbox.url.clone()
            };
            (
                id_url,
                sandbox.url.clone(),
                sandbox.context.location.route_path(),
                sandbox.main_host_path.clone(),
            )
        };
        let sync_url = if id_url.is_empty() || id_url.starts_with("http") {
            url
        } else {
            id_url
        };
        let host_href = self.location.href();
        let Some(route) = resolve_url(&sync_url, &host_href)
            .and_then(|href| LocationParts::parse(&href))
            .map(|parts| parts.route_path())
        else {
            return Ok(());
        };
        if route != current {
            self.context_history_replace(app, &format!("{main_host_path}{route}"))?;
        }
        Ok(())
    }

    /// Drops the query entries of synced apps that ran, are inactive and are not in the
    /// middle of a url jump.
    pub(crate) fn clear_inactive_app_url(&mut self) -> Result<()> {
        let map: Vec<(String, String)> = query_map(&self.location.search)
            .into_iter()
            .filter(|(id, _)| {
                self.sandbox(id).is_none_or(|sandbox| {
                    !(sandbox.exec_flag && sandbox.sync && !sandbox.href_flag && !sandbox.active_flag)
                })
            })
            .collect();
        let href = self.host_href_with_query(&map);
        if href != self.location.href() {
            self.host_replace_state(&href)?;
        }
        Ok(())
    }

    /// Records `url` for `app` in a new host history entry.
    pub(crate) fn push_url_to_window(&mut self, app: &str, url: &str) -> Result<()> {
        let mut map = query_map(&self.location.search);
        set_query(&mut map, app, encode_uri_component(url));
        let href = self.host_href_with_query(&map);
        self.host_push_state(&href)
    }

    /// Host side of a url jump: a query value holding a full url shows that url in place
    /// of the app; going back from it brings the app view back.
    fn process_href_jump(&mut self) -> Result<()> {
        for (app, value) in query_map(&self.location.search) {
            let Some(sandbox) = self.sandbox(&app) else {
                continue;
            };
            let (degrade, href_flag, host, el, root, preserved, attrs) = (
                sandbox.degrade,
                sandbox.href_flag,
                sandbox.container.host,
                sandbox.container.el,
                sandbox.container.root,
                sandbox.container.preserved_html,
                sandbox.degrade_attrs.clone(),
            );
            if value.contains("http") {
                let url = decode_uri_component(&value)?;
                self.try_sandbox_mut(&app)?.href_flag = true;
                if degrade {
                    if let Some(html) = root.and_then(|document| self.dom.first_element_child(document)) {
                        let context_body = self.context_body(&app)?;
                        self.render_element_to_container(html, context_body)?;
                        self.try_sandbox_mut(&app)?.container.preserved_html = Some(html);
                    }
                }
                if let Some(parent) = host.and_then(|host| self.dom.parent(host)) {
                    self.render_iframe_replace_app(&url, parent, &attrs)?;
                }
            } else if href_flag {
                let Some(el) = el else {
                    continue;
                };
                if degrade {
                    let (iframe, document) = self.init_render_iframe_and_container(&app, el, &attrs)?;
                    if let Some(html) = preserved {
                        for child in self.dom.children(document) {
                            self.dom.detach(child)?;
                        }
                        self.dom.append_child(document, html)?;
                    }
                    let container = &mut self.try_sandbox_mut(&app)?.container;
                    container.host = Some(iframe);
                    container.root = Some(document);
                    container.preserved_html = None;
                } else if let Some(host) = host {
                    self.render_element_to_container(host, el)?;
                }
                self.try_sandbox_mut(&app)?.href_flag = false;
                self.trace_line(TraceCategory::Sync, format!("app view restored app={app}"));
            }
        }
        Ok(())
    }

    /// Moves through the joint session history like the browser back/forward buttons.
    /// Contexts whose url differs in the target entry receive `popstate`.
    pub fn history_go(&mut self, delta: i64) -> Result<()> {
        let target = self.history.index as i64 + delta;
        if delta == 0 || target < 0 || target >= self.history.len() as i64 {
            return Ok(());
        }
        self.history.index = target as usize;
        let entry = self.history.current();
        self.set_host_href(&entry.href)?;
        self.trace_line(
            TraceCategory::Sync,
            format!("history go delta={delta} href={}", entry.href),
        );
        for (app, url) in &entry.contexts {
            let changed = self
                .sandbox(app)
                .is_some_and(|sandbox| sandbox.context.location.href() != *url);
            if !changed {
                continue;
            }
            self.set_context_url(app, url)?;
            self.update_base(app)?;
            self.fire_context_window_event(app, "popstate")?;
        }
        self.process_href_jump()?;
        self.fire_host_window_event("popstate");
        self.pump()?;
        self.surface_failures()
    }

    pub fn history_back(&mut self) -> Result<()> {
        self.history_go(-1)
    }

    pub fn history_forward(&mut self) -> Result<()> {
        self.history_go(1)
    }

    pub fn history_length(&self) -> usize {
        self.history.len()
    }

    /// Host-initiated navigation that keeps the page, e.g. a host router push.
    pub fn push_host_url(&mut self, url: &str) -> Result<()> {
        let href = self.location.resolve(url);
        self.host_push_state(&href)
    }

    pub fn host_href(&self) -> String {
        self.location.href()
    }

    /// Path recorded for `app` in the host query, decoded with the app's prefix table.
    pub fn synced_path(&self, app: &str) -> Option<String> {
        let map = query_map(&self.location.search);
        let value = query_value(&map, app)?;
        let prefix = self
            .sandbox(app)
            .map(|sandbox| sandbox.prefix.clone())
            .unwrap_or_default();
        decode_sync_path(value, &prefix).ok()
    }
}
