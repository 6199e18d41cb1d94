use std::cell::RefCell;
use std::rc::Rc;

use frame_sandbox::{
    AppOptions, BundleEngine, Error, GlobalValue, HostConfig, HostPage, MOUNT_GLOBAL,
    MockNetwork, PlatformProfile, ResourceKind, Result, SandboxState, UNMOUNT_GLOBAL,
};

type Log = Rc<RefCell<Vec<String>>>;

struct Page {
    host: HostPage,
    engine: Rc<BundleEngine>,
    network: MockNetwork,
    log: Log,
}

fn page(host_html: &str) -> Result<Page> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new().with_latency(5);
    let mut host = HostConfig::new("http://host.test/")
        .html(host_html)
        .engine(engine.clone())
        .fetcher(Rc::new(network.clone()))
        .build()?;
    host.set_trace_stderr(false);
    Ok(Page {
        host,
        engine,
        network,
        log: Rc::default(),
    })
}

fn record(page: &Page, bundle: &str) {
    let log = page.log.clone();
    let label = bundle.to_string();
    page.engine.register(bundle, move |_scope| {
        log.borrow_mut().push(label.clone());
        Ok(())
    });
}

/// Bundle that installs mount and unmount entry points writing to the page log.
fn register_entry(page: &Page, bundle: &str) {
    let log = page.log.clone();
    let label = bundle.to_string();
    page.engine.register(bundle, move |scope| {
        log.borrow_mut().push(label.clone());
        let mount_log = log.clone();
        let mount = scope.define_function("mount", move |_, _| {
            mount_log.borrow_mut().push("mount".into());
            Ok(GlobalValue::Undefined)
        });
        let unmount_log = log.clone();
        let unmount = scope.define_function("unmount", move |_, _| {
            unmount_log.borrow_mut().push("unmount".into());
            Ok(GlobalValue::Undefined)
        });
        scope.window_set(MOUNT_GLOBAL, GlobalValue::Function(mount))?;
        scope.window_set(UNMOUNT_GLOBAL, GlobalValue::Function(unmount))?;
        Ok(())
    });
}

fn hook(log: &Log, label: &'static str) -> impl Fn(&str) + 'static {
    let log = log.clone();
    move |_app| log.borrow_mut().push(label.to_string())
}

fn entries(log: &Log, label: &str) -> usize {
    log.borrow().iter().filter(|entry| *entry == label).count()
}

fn node(host: &HostPage, selector: &str) -> Result<frame_sandbox::NodeId> {
    host.query_selector(selector)?
        .ok_or_else(|| Error::NotFound(selector.to_string()))
}

const SCRIPTED_PAGE: &str = r#"<html><head>
<script src="http://app.test/main.js"></script>
</head><body><div id="root"></div>
<script defer src="http://app.test/late.js"></script>
<script async src="http://app.test/side.js"></script>
<script>/* @bundle inline */</script>
</body></html>"#;

#[test]
fn scripts_run_in_document_order_before_mount() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    page.network.route("http://app.test/", SCRIPTED_PAGE);
    page.network.route("http://app.test/main.js", "/* @bundle main */");
    page.network.route("http://app.test/late.js", "/* @bundle late */");
    page.network.route("http://app.test/side.js", "/* @bundle side */");
    register_entry(&page, "main");
    record(&page, "inline");
    record(&page, "late");
    record(&page, "side");

    let handle = page.host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .el("#app")
            .before_load(hook(&page.log, "beforeLoad"))
            .before_mount(hook(&page.log, "beforeMount"))
            .after_mount(hook(&page.log, "afterMount")),
    )?;
    assert_eq!(handle.name(), "a");
    page.host.flush()?;

    let ordered: Vec<String> = page
        .log
        .borrow()
        .iter()
        .filter(|entry| *entry != "side")
        .cloned()
        .collect();
    assert_eq!(
        ordered,
        vec![
            "beforeLoad",
            "main",
            "late",
            "inline",
            "beforeMount",
            "mount",
            "afterMount"
        ]
    );
    assert_eq!(entries(&page.log, "side"), 1);
    assert_eq!(page.host.app_state("a"), Some(SandboxState::Mounted));

    let executed = page.host.executed_scripts("a");
    assert_eq!(executed.len(), 4);
    let queued: Vec<&str> = executed
        .iter()
        .map(String::as_str)
        .filter(|src| *src != "http://app.test/side.js")
        .collect();
    assert_eq!(
        queued,
        ["http://app.test/main.js", "http://app.test/late.js", "inline"]
    );
    assert!(executed.contains(&"http://app.test/side.js".to_string()));
    Ok(())
}

#[test]
fn deferred_scripts_keep_their_place_among_sync_scripts() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    page.network.route(
        "http://app.test/",
        r#"<script src="a.js"></script>
<script defer src="b.js"></script>
<script async src="c.js"></script>
<script>/* @bundle d */</script>"#,
    );
    for name in ["a", "b", "c"] {
        page.network
            .route(&format!("http://app.test/{name}.js"), &format!("/* @bundle {name} */"));
    }
    for name in ["a", "b", "c", "d"] {
        record(&page, name);
    }

    page.host
        .start_app(AppOptions::new("order").url("http://app.test/").el("#app"))?;
    page.host.flush()?;

    let without_async: Vec<String> = page
        .log
        .borrow()
        .iter()
        .filter(|entry| *entry != "c")
        .cloned()
        .collect();
    assert_eq!(without_async, vec!["a", "b", "d"]);
    assert_eq!(entries(&page.log, "c"), 1);
    Ok(())
}

#[test]
fn guest_markup_renders_into_an_isolated_shadow_subtree() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    page.network.route("http://app.test/", SCRIPTED_PAGE);
    page.host.start_app(AppOptions::new("a").url("http://app.test/").el("#app"))?;
    page.host.flush()?;

    let el = node(&page.host, "#app")?;
    let container = page
        .host
        .container_host("a")
        .ok_or_else(|| Error::NotFound("container".into()))?;
    assert_eq!(page.host.children(el), vec![container]);
    assert_eq!(page.host.attribute(container, "data-sandbox-id").as_deref(), Some("a"));
    assert_eq!(page.host.is_degraded("a"), Some(false));

    let root = page
        .host
        .rendering_root("a")
        .ok_or_else(|| Error::NotFound("root".into()))?;
    assert!(page.host.query_selector_in(root, "#root")?.is_some());
    assert!(page.host.query_selector_in(root, "script")?.is_none());
    assert!(page.host.query_selector("#root")?.is_none());
    Ok(())
}

#[test]
fn html_request_failure_marks_the_app_failed() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    page.network.route_with("http://app.test/", 500, "", 0);
    let failed_urls: Log = Rc::default();
    let sink = failed_urls.clone();
    let options = AppOptions::new("a")
        .url("http://app.test/")
        .el("#app")
        .load_error(move |url, _err| sink.borrow_mut().push(url.to_string()));

    page.host.start_app(options.clone())?;
    match page.host.flush() {
        Err(Error::ResourceFetch { url, kind, reason }) => {
            assert_eq!(url, "http://app.test/");
            assert_eq!(kind, ResourceKind::Html);
            assert_eq!(reason, "status 500");
        }
        other => panic!("expected an html fetch failure, got {other:?}"),
    }
    assert_eq!(page.host.app_state("a"), Some(SandboxState::Failed));
    assert_eq!(*failed_urls.borrow(), vec!["http://app.test/"]);

    // the failure is cached, so a second start fails without another request
    match page.host.start_app(options) {
        Err(Error::ResourceFetch { kind: ResourceKind::Html, .. }) => {}
        other => panic!("expected the cached failure, got {other:?}"),
    }
    assert_eq!(page.network.request_count("http://app.test/"), 1);
    assert_eq!(failed_urls.borrow().len(), 2);
    Ok(())
}

#[test]
fn start_without_url_is_a_configuration_error() -> Result<()> {
    let mut page = page("")?;
    match page.host.start_app(AppOptions::new("nameless")) {
        Err(Error::Configuration(message)) => assert!(message.contains("url is required")),
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert!(
        page.host
            .warnings()
            .iter()
            .any(|warning| warning.contains("url is required"))
    );
    assert!(!page.host.has_app("nameless"));
    Ok(())
}

#[test]
fn kept_alive_app_moves_between_mount_points_without_rerunning() -> Result<()> {
    let mut page = page("<div id=\"one\"></div><div id=\"two\"></div>")?;
    register_entry(&page, "entry");
    page.host.setup_app(
        AppOptions::new("k")
            .url("http://app.test/")
            .html("<div id=\"view\">kept</div><script>/* @bundle entry */</script>")
            .alive(true)
            .activated(hook(&page.log, "activated"))
            .deactivated(hook(&page.log, "deactivated")),
    )?;

    page.host.start_app(AppOptions::new("k").el("#one"))?;
    page.host.flush()?;
    assert_eq!(*page.log.borrow(), vec!["entry", "mount", "activated"]);

    page.host.start_app(AppOptions::new("k").el("#two"))?;
    page.host.flush()?;
    assert_eq!(entries(&page.log, "entry"), 1);
    assert_eq!(entries(&page.log, "mount"), 1);
    assert_eq!(entries(&page.log, "activated"), 2);
    let two = node(&page.host, "#two")?;
    let container = page
        .host
        .container_host("k")
        .ok_or_else(|| Error::NotFound("container".into()))?;
    assert_eq!(page.host.parent_node(container), Some(two));
    assert_eq!(page.host.executed_scripts("k"), vec!["inline"]);

    // another app taking over the mount element hides the kept-alive one
    page.host.start_app(
        AppOptions::new("other")
            .url("http://other.test/")
            .html("<p>other</p>")
            .el("#two"),
    )?;
    page.host.flush()?;
    assert_eq!(page.host.app_state("k"), Some(SandboxState::Deactivated));
    assert_eq!(entries(&page.log, "deactivated"), 1);
    assert_eq!(entries(&page.log, "unmount"), 0);
    Ok(())
}

#[test]
fn restarting_a_mounted_app_remounts_in_the_same_context() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    register_entry(&page, "entry");
    page.host.setup_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html("<div id=\"view\"></div><script>/* @bundle entry */</script>")
            .before_unmount(hook(&page.log, "beforeUnmount"))
            .after_unmount(hook(&page.log, "afterUnmount")),
    )?;
    page.host.start_app(AppOptions::new("a").el("#app"))?;
    page.host.flush()?;
    assert_eq!(*page.log.borrow(), vec!["entry", "mount"]);

    page.host.start_app(AppOptions::new("a").el("#app"))?;
    page.host.flush()?;
    assert_eq!(
        *page.log.borrow(),
        vec!["entry", "mount", "beforeUnmount", "unmount", "afterUnmount", "mount"]
    );
    assert_eq!(page.host.app_state("a"), Some(SandboxState::Mounted));
    assert_eq!(page.host.executed_scripts("a").len(), 1);
    let root = page
        .host
        .rendering_root("a")
        .ok_or_else(|| Error::NotFound("root".into()))?;
    assert!(page.host.query_selector_in(root, "#view")?.is_some());
    Ok(())
}

#[test]
fn destroy_removes_the_app_and_keeps_its_setup() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    register_entry(&page, "entry");
    page.host.setup_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html("<div id=\"view\"></div><script>/* @bundle entry */</script>")
            .el("#app"),
    )?;
    let first = page.host.start_app(AppOptions::new("a"))?;
    page.host.flush()?;
    assert!(page.host.query_selector("iframe")?.is_some());

    let log = page.log.clone();
    page.host.with_guest("a", move |scope| {
        let tick = scope.define_function("tick", move |_, _| {
            log.borrow_mut().push("tick".into());
            Ok(GlobalValue::Undefined)
        });
        scope.set_timeout(tick, 50)?;
        Ok(())
    })?;

    first.destroy(&mut page.host)?;
    assert!(!page.host.has_app("a"));
    assert!(!first.is_current(&page.host));
    assert!(page.host.query_selector("iframe")?.is_none());
    let el = node(&page.host, "#app")?;
    assert_eq!(page.host.inner_html(el), "");
    assert_eq!(entries(&page.log, "unmount"), 1);

    page.host.flush()?;
    assert_eq!(entries(&page.log, "tick"), 0);

    let second = page.host.start_app(AppOptions::new("a"))?;
    page.host.flush()?;
    assert!(second.is_current(&page.host));
    assert_ne!(first, second);
    assert_eq!(page.host.app_state("a"), Some(SandboxState::Mounted));
    first.destroy(&mut page.host)?;
    assert!(page.host.has_app("a"));
    Ok(())
}

#[test]
fn degrade_mode_renders_into_a_nested_document() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    page.host.start_app(
        AppOptions::new("d")
            .url("http://app.test/")
            .html("<div id=\"view\">flat</div>")
            .degrade(true)
            .el("#app"),
    )?;
    page.host.flush()?;

    assert_eq!(page.host.is_degraded("d"), Some(true));
    let container = page
        .host
        .container_host("d")
        .ok_or_else(|| Error::NotFound("container".into()))?;
    assert!(page.host.outer_html(container).starts_with("<iframe"));
    assert_eq!(page.host.parent_node(container), Some(node(&page.host, "#app")?));
    let document = page
        .host
        .rendering_root("d")
        .ok_or_else(|| Error::NotFound("root".into()))?;
    let view = page
        .host
        .query_selector_in(document, "#view")?
        .ok_or_else(|| Error::NotFound("#view".into()))?;
    assert_eq!(page.host.text_content(view), "flat");
    assert_eq!(page.host.app_state("d"), Some(SandboxState::Active));
    Ok(())
}

#[test]
fn platform_without_interception_falls_back_to_degrade() -> Result<()> {
    let mut host = HostConfig::new("http://host.test/")
        .html("<div id=\"app\"></div>")
        .profile(PlatformProfile {
            proxy: false,
            ..PlatformProfile::default()
        })
        .build()?;
    host.set_trace_stderr(false);
    host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html("<p>x</p>")
            .el("#app"),
    )?;
    host.flush()?;
    assert_eq!(host.is_degraded("a"), Some(true));
    assert!(
        host.warnings()
            .iter()
            .any(|warning| warning.contains("falling back to degrade mode"))
    );
    Ok(())
}

#[test]
fn platform_without_fetch_is_rejected() {
    let built = HostConfig::new("http://host.test/")
        .profile(PlatformProfile {
            fetch: false,
            ..PlatformProfile::default()
        })
        .build();
    assert!(matches!(built, Err(Error::EnvironmentUnsupported(_))));
}

#[test]
fn context_code_is_stopped_until_the_guest_takes_over() -> Result<()> {
    let mut page = page("<div id=\"app\"></div>")?;
    record(&page, "probe");
    page.host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html("<p>x</p>")
            .el("#app"),
    )?;

    match page.host.evaluate_in_context("a", "/* @bundle probe */") {
        Err(err @ Error::GuestInterrupted(_)) => {
            assert!(err.to_string().contains("can be safely ignored"), "{err}");
        }
        other => panic!("expected interruption, got {other:?}"),
    }
    assert!(
        page.host
            .warnings()
            .iter()
            .any(|warning| warning.contains("execution stopped"))
    );
    assert!(page.log.borrow().is_empty());

    page.host.flush()?;
    assert!(page.host.is_context_ready("a"));
    page.host.evaluate_in_context("a", "/* @bundle probe */")?;
    assert_eq!(*page.log.borrow(), vec!["probe"]);
    assert_eq!(page.host.executed_scripts("a").last().map(String::as_str), Some("inline"));
    Ok(())
}

#[test]
fn guest_globals_stay_inside_their_own_context() -> Result<()> {
    let mut page = page("<div id=\"a\"></div><div id=\"b\"></div>")?;
    for app in ["a", "b"] {
        let value = format!("from {app}");
        page.engine.register(&format!("write-{app}"), move |scope| {
            scope.window_set("shared", GlobalValue::Str(value.clone()))
        });
        page.host.start_app(
            AppOptions::new(app)
                .url(format!("http://{app}.test/"))
                .html(format!("<script>/* @bundle write-{app} */</script>"))
                .el(format!("#{app}").as_str()),
        )?;
    }
    page.host.flush()?;

    assert_eq!(page.host.context_global("a", "shared"), GlobalValue::from("from a"));
    assert_eq!(page.host.context_global("b", "shared"), GlobalValue::from("from b"));
    assert!(page.host.host_global("shared").is_undefined());

    let seen = page.host.with_guest("b", |scope| scope.window_get("shared"))?;
    assert_eq!(seen.as_str(), Some("from b"));
    Ok(())
}
