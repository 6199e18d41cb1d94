//! Application-level sandbox for running several independently built front-end
//! applications inside one modeled host page.
//!
//! Each guest gets a hidden execution context, a rendering container (an isolated
//! shadow subtree or, in degrade mode, a nested document), and virtual
//! `window`/`document`/`location` views that route every access to guest-local state,
//! the rendering container, or the host platform. Guest resources are parsed, fetched
//! through a process-scoped cache, transformed by plugins, and executed by a scheduler
//! that reproduces sync/defer/async ordering on a deterministic event loop.
//!
//! The host page is driven like a test harness: start applications, then advance the
//! virtual clock with [`HostPage::flush`] or [`HostPage::advance_time`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

mod bus;
mod context;
mod dom;
mod event_loop;
mod guest;
mod host;
mod html;
mod loader;
mod network;
mod options;
mod patcher;
mod pattern;
mod plugin;
mod render;
mod sandbox;
mod scheduler;
mod selector;
mod sync;
mod template;
mod trace;
mod url;
mod value;
mod virtualize;

pub use bus::{BusHandler, EventBus, HandlerId};
pub use dom::{NodeId, NodeKind};
pub use guest::{BundleEngine, GuestBundle, GuestScope, ScriptEngine, ScriptSource};
pub use host::{AppHandle, HostConfig, HostPage};
pub use network::{FetchResponse, Fetcher, MockNetwork, NetworkFailure, RequestRecord};
pub use options::{
    AppOptions, CapabilityStore, LifecycleHook, Lifecycles, LoadErrorHook, MountTarget,
    PlatformProfile, merge_options,
};
pub use plugin::{
    ElementHook, HtmlTransform, ListenerHook, Plugin, PropertyOverride, ScriptLoaderSpec,
    StyleLoaderSpec, Transform, UrlMatcher,
};
pub use sandbox::SandboxState;
pub use sync::{decode_sync_path, encode_sync_path};
pub use trace::TraceCategory;
pub use url::{decode_uri_component, encode_uri_component};
pub use value::{FnId, FunctionInfo, GlobalValue, NativeFn, ObjectRef};
pub use virtualize::{DocumentCategory, classify_document_property};

use bus::BusRegistry;
use context::{ExecutionContext, ProbeStage, seed_window_globals};
use dom::{Dom, ElementPatch, Listener, is_raw_text_tag, is_void_tag};
use event_loop::{EventLoop, Task};
use html::{fill_html_element, parse_document, parse_into};
use loader::{ContentRef, HtmlSource, StyleJob};
use network::{ContentCache, EntryState, FetchOutcome};
use patcher::{WindowListener, append_or_insert_hook};
use pattern::Pattern;
use plugin::{LoaderStage, PluginChain};
use render::{RenderingContainer, patch_style_rules};
use sandbox::{Sandbox, SandboxEntry};
use scheduler::{DynamicJob, ExecQueue, IdleWork, QueueEntry, ScriptJob};
use selector::{matches_selector, parse_selector_groups};
use sync::HostHistory;
use template::{
    ParsedTemplate, ScriptDescriptor, as_comment, inline_style_placeholder, link_placeholder,
    process_template,
};
use trace::{
    SharedTrace, TraceState, WARN_CSS_ERROR_REQUESTED, WARN_GET_ELEMENT_BY_ID,
    WARN_HTML_ERROR_REQUESTED, WARN_NO_SCRIPT, WARN_NO_SUBJECT, WARN_NO_URL,
    WARN_NOT_SUPPORTED, WARN_RELOAD_DISABLED, WARN_REPEAT_RENDER, WARN_SCRIPT_ERROR_REQUESTED,
    WARN_STOP_APP_RUN,
};
use url::{LocationParts, absolute_path, default_public_path, resolve_url};
use value::{FunctionTable, PropertySlot, arg_text};
use virtualize::{Backend, HOST_DOCUMENT_METHODS, StaticTable, virtual_href};

pub type Result<T> = std::result::Result<T, Error>;

/// Attribute carrying the guest id on rendering containers and context elements.
pub const APP_ID_ATTR: &str = "data-sandbox-id";
/// Attribute tagging every script inserted into an execution context.
pub const SCRIPT_ID_ATTR: &str = "data-sandbox-script-id";
/// Marks iframes created by the sandbox itself.
pub const DATA_FLAG_ATTR: &str = "data-sandbox-flag";
/// Set on a container once its `:root`/`@font-face` patch has been attached.
pub const ATTACH_CSS_FLAG_ATTR: &str = "data-sandbox-attach-css-flag";
/// Tag name of the custom element hosting a guest shadow subtree.
pub const CONTAINER_TAG: &str = "sandbox-app";
/// Reserved bus event name receiving every emission.
pub const ALL_EVENT: &str = "_sandbox_all_event";
/// Global injected into every execution context to identify sandboxed execution.
pub const POWERED_BY_FLAG: &str = "__POWERED_BY_SANDBOX__";
/// Global holding the guest's public path.
pub const PUBLIC_PATH_GLOBAL: &str = "__SANDBOX_PUBLIC_PATH__";
/// Global a guest installs as its mount entry point.
pub const MOUNT_GLOBAL: &str = "__SANDBOX_MOUNT";
/// Global a guest installs as its unmount entry point.
pub const UNMOUNT_GLOBAL: &str = "__SANDBOX_UNMOUNT";
/// Global holding the sandbox marker object.
pub const SANDBOX_GLOBAL: &str = "__SANDBOX";
/// Global holding the `provide` object.
pub const PROVIDE_GLOBAL: &str = "$sandbox";
/// Storage key of the persisted capability flag.
pub const DISABLE_EMPTY_PAGE_URL_KEY: &str = "sandbox:disableSandboxEmptyPageURL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Html,
    Script,
    Style,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Html => f.write_str("html"),
            Self::Script => f.write_str("script"),
            Self::Style => f.write_str("style"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network failure or a status of 400 and above for a guest resource.
    ResourceFetch {
        url: String,
        kind: ResourceKind,
        reason: String,
    },
    /// Missing url, duplicate entry script, missing mount target or a bad option value.
    Configuration(String),
    /// The platform profile lacks a capability the sandbox cannot do without.
    EnvironmentUnsupported(String),
    /// Guest code ran in a context that is not activated yet. Safe to ignore.
    GuestInterrupted(String),
    HtmlParse(String),
    UnsupportedSelector(String),
    DomOperation(String),
    /// Raised by guest code through the script engine.
    ScriptRuntime(String),
    /// The event loop ran more tasks than its step limit allows.
    TimerStepLimit {
        limit: usize,
        now_ms: i64,
        due_limit: Option<i64>,
        pending: usize,
    },
    /// A host API lookup named an unknown app, node or function.
    NotFound(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceFetch { url, kind, reason } => {
                write!(f, "{kind} request error for {url}: {reason}")
            }
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::EnvironmentUnsupported(msg) => write!(f, "environment unsupported: {msg}"),
            Self::GuestInterrupted(msg) => write!(
                f,
                "guest execution interrupted: {msg} (this error can be safely ignored)"
            ),
            Self::HtmlParse(msg) => write!(f, "html parse error: {msg}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::DomOperation(msg) => write!(f, "dom operation error: {msg}"),
            Self::ScriptRuntime(msg) => write!(f, "script runtime error: {msg}"),
            Self::TimerStepLimit {
                limit,
                now_ms,
                due_limit,
                pending,
            } => {
                let due = due_limit
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "none".to_string());
                write!(
                    f,
                    "flush exceeded max task steps (possible uncleared interval): limit={limit}, now_ms={now_ms}, due_limit={due}, pending_tasks={pending}"
                )
            }
            Self::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests;
