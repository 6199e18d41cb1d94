use std::cell::RefCell;
use std::rc::Rc;

use frame_sandbox::{
    ATTACH_CSS_FLAG_ATTR, AppOptions, BundleEngine, Error, GlobalValue, HostConfig, HostPage,
    MockNetwork, Plugin, Result, SandboxState, ScriptLoaderSpec, UrlMatcher,
};

type Log = Rc<RefCell<Vec<String>>>;

fn host_with(engine: &Rc<BundleEngine>, network: &MockNetwork, html: &str) -> Result<HostPage> {
    let mut host = HostConfig::new("http://host.test/")
        .html(html)
        .engine(engine.clone())
        .fetcher(Rc::new(network.clone()))
        .build()?;
    host.set_trace_stderr(false);
    Ok(host)
}

fn record(engine: &BundleEngine, log: &Log, bundle: &str) {
    let log = log.clone();
    let label = bundle.to_string();
    engine.register(bundle, move |_scope| {
        log.borrow_mut().push(label.clone());
        Ok(())
    });
}

#[test]
fn apps_share_one_request_per_script_url() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new().with_latency(10);
    network.route("http://cdn.test/shared.js", "/* @bundle shared */");
    let log: Log = Rc::default();
    let sink = log.clone();
    engine.register("shared", move |scope| {
        sink.borrow_mut().push(scope.app().to_string());
        Ok(())
    });

    let mut host = host_with(&engine, &network, "<div id=\"a\"></div><div id=\"b\"></div>")?;
    for app in ["a", "b"] {
        host.start_app(
            AppOptions::new(app)
                .url(format!("http://{app}.test/"))
                .html("<script src=\"http://cdn.test/shared.js\"></script>")
                .el(format!("#{app}").as_str()),
        )?;
    }
    host.flush()?;

    let mut ran = log.borrow().clone();
    ran.sort();
    assert_eq!(ran, vec!["a", "b"]);
    assert_eq!(network.request_count("http://cdn.test/shared.js"), 1);
    Ok(())
}

#[test]
fn preload_warms_the_cache_without_running_scripts() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new().with_latency(3);
    network.route("http://app.test/index.html", "<p>hi</p><script src=\"http://app.test/boot.js\"></script>");
    network.route("http://app.test/boot.js", "/* @bundle boot */");
    let log: Log = Rc::default();
    record(&engine, &log, "boot");

    let mut host = host_with(&engine, &network, "<div id=\"app\"></div>")?;
    host.setup_app(AppOptions::new("p").url("http://app.test/index.html"))?;
    host.preload_app(AppOptions::new("p"))?;
    assert!(!host.has_app("p"));
    host.flush()?;

    assert_eq!(host.app_state("p"), Some(SandboxState::Active));
    assert!(host.executed_scripts("p").is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(network.request_count("http://app.test/boot.js"), 1);
    assert_eq!(host.host_href(), "http://host.test/");

    host.start_app(AppOptions::new("p").el("#app"))?;
    host.flush()?;
    assert_eq!(*log.borrow(), vec!["boot"]);
    assert_eq!(host.executed_scripts("p"), vec!["http://app.test/boot.js"]);
    assert_eq!(network.request_count("http://app.test/boot.js"), 1);
    assert_eq!(network.request_count("http://app.test/index.html"), 1);
    Ok(())
}

#[test]
fn preload_without_url_surfaces_a_configuration_error() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new();
    let mut host = host_with(&engine, &network, "")?;
    host.preload_app(AppOptions::new("ghost"))?;
    assert!(matches!(host.flush(), Err(Error::Configuration(_))));
    assert!(!host.has_app("ghost"));
    Ok(())
}

#[test]
fn plugin_loaders_wrap_the_page_scripts() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new().with_latency(2);
    network.route("http://app.test/main.js", "/* @bundle original */");
    network.route("http://app.test/skip.js", "/* @bundle skipped */");
    let log: Log = Rc::default();
    for bundle in ["before", "after", "original", "patched", "skipped"] {
        record(&engine, &log, bundle);
    }

    let plugin = Plugin::new()
        .with_js_loader(|code, _url, _base| code.replace("@bundle original", "@bundle patched"))
        .with_js_before_loader(ScriptLoaderSpec::inline("/* @bundle before */"))
        .with_js_after_loader(ScriptLoaderSpec::inline("/* @bundle after */"))
        .exclude_js(UrlMatcher::exact("http://app.test/skip.js"));

    let mut host = host_with(&engine, &network, "<div id=\"app\"></div>")?;
    host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html(
                "<script src=\"http://app.test/main.js\"></script>\
                 <script src=\"http://app.test/skip.js\"></script>",
            )
            .el("#app")
            .plugin(plugin),
    )?;
    host.flush()?;

    assert_eq!(*log.borrow(), vec!["before", "patched", "after"]);
    assert_eq!(network.request_count("http://app.test/skip.js"), 0);
    Ok(())
}

#[test]
fn stylesheets_are_embedded_and_root_rules_reach_the_host() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new().with_latency(4);
    network.route("http://app.test/theme.css", "p { color: red; }");
    let plugin = Plugin::new().with_css_loader(|code, url, _base| {
        if url.is_empty() {
            code.to_string()
        } else {
            format!("{code}/* seen */")
        }
    });

    let mut host = host_with(&engine, &network, "<div id=\"app\"></div>")?;
    host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html(
                "<head><link rel=\"stylesheet\" href=\"theme.css\">\
                 <style>:root { --brand: blue; }</style></head><body><p>x</p></body>",
            )
            .el("#app")
            .plugin(plugin),
    )?;
    host.flush()?;

    let root = host
        .rendering_root("a")
        .ok_or_else(|| Error::NotFound("root".into()))?;
    let css: String = host
        .query_selector_all_in(root, "style")?
        .into_iter()
        .map(|style| host.text_content(style))
        .collect();
    assert!(css.contains("p { color: red; }/* seen */"), "{css}");
    assert!(css.contains(":host { --brand: blue; }"), "{css}");
    assert!(!css.contains("--brand: blue; }/* seen */"), "{css}");

    let container = host
        .container_host("a")
        .ok_or_else(|| Error::NotFound("container".into()))?;
    assert_eq!(host.attribute(container, ATTACH_CSS_FLAG_ATTR).as_deref(), Some(""));
    assert_eq!(network.request_count("http://app.test/theme.css"), 1);
    Ok(())
}

#[test]
fn bus_connects_the_host_and_its_guests() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let network = MockNetwork::new();
    let log: Log = Rc::default();
    let guest_log = log.clone();
    engine.register("listener", move |scope| {
        let inbox = guest_log.clone();
        let bus = scope.bus()?;
        bus.on("greet", move |_event, args| {
            let text = args.first().map(GlobalValue::as_text).unwrap_or_default();
            inbox.borrow_mut().push(format!("guest got {text}"));
            Ok(())
        });
        bus.emit("ready", &[GlobalValue::from(scope.app())]);
        Ok(())
    });

    let mut host = host_with(&engine, &network, "<div id=\"app\"></div>")?;
    let host_log = log.clone();
    host.bus().on("ready", move |_event, args| {
        let text = args.first().map(GlobalValue::as_text).unwrap_or_default();
        host_log.borrow_mut().push(format!("host got {text}"));
        Ok(())
    });
    host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .html("<script>/* @bundle listener */</script>")
            .el("#app"),
    )?;
    host.flush()?;
    assert_eq!(host.bus_handler_count("a"), 1);

    host.bus().emit("greet", &[GlobalValue::from("hello")]);
    assert_eq!(*log.borrow(), vec!["host got a", "guest got hello"]);

    host.destroy_app("a")?;
    assert_eq!(host.bus_handler_count("a"), 0);
    host.bus().emit("greet", &[GlobalValue::from("again")]);
    assert_eq!(log.borrow().len(), 2);
    Ok(())
}

#[test]
fn fetch_override_replaces_the_page_fetcher_for_one_app() -> Result<()> {
    let engine = Rc::new(BundleEngine::new());
    let shared = MockNetwork::new();
    let private = MockNetwork::new();
    private.route("http://app.test/", "<p id=\"own\">private</p>");

    let mut host = host_with(&engine, &shared, "<div id=\"app\"></div>")?;
    host.start_app(
        AppOptions::new("a")
            .url("http://app.test/")
            .el("#app")
            .fetch(Rc::new(private.clone())),
    )?;
    host.flush()?;

    assert_eq!(private.request_count("http://app.test/"), 1);
    assert!(shared.requests().is_empty());
    let root = host
        .rendering_root("a")
        .ok_or_else(|| Error::NotFound("root".into()))?;
    assert!(host.query_selector_in(root, "#own")?.is_some());
    Ok(())
}
