use frame_sandbox::{AppOptions, HostConfig, HostPage, Result};

fn host(url: &str) -> Result<HostPage> {
    let mut host = HostConfig::new(url)
        .html("<div id=\"app\"></div>")
        .build()?;
    host.set_trace_stderr(false);
    Ok(host)
}

fn docs_app() -> AppOptions {
    AppOptions::new("a")
        .url("http://app.test/docs/")
        .html("<div id=\"view\"></div>")
        .el("#app")
        .sync(true)
        .prefix("d", "/docs")
}

#[test]
fn started_app_writes_its_route_into_the_host_query() -> Result<()> {
    let mut host = host("http://host.test/")?;
    host.start_app(docs_app())?;
    host.flush()?;

    assert_eq!(host.host_href(), "http://host.test/?a=%7Bd%7D%2F");
    assert_eq!(host.synced_path("a").as_deref(), Some("/docs/"));
    assert_eq!(host.context_href("a").as_deref(), Some("http://host.test/docs/"));
    assert_eq!(host.app_href("a").as_deref(), Some("http://app.test/docs/"));
    assert_eq!(host.history_length(), 1);
    Ok(())
}

#[test]
fn apps_without_sync_leave_the_host_url_alone() -> Result<()> {
    let mut host = host("http://host.test/home")?;
    host.start_app(docs_app().sync(false))?;
    host.flush()?;
    assert_eq!(host.host_href(), "http://host.test/home");
    assert_eq!(host.synced_path("a"), None);
    Ok(())
}

#[test]
fn guest_navigation_is_mirrored_and_replayed_by_history() -> Result<()> {
    let mut host = host("http://host.test/")?;
    host.start_app(docs_app())?;
    host.flush()?;

    host.with_guest("a", |scope| scope.history_push("/docs/guide?x=1"))?;
    assert_eq!(host.history_length(), 2);
    assert_eq!(host.synced_path("a").as_deref(), Some("/docs/guide?x=1"));
    assert_eq!(
        host.context_href("a").as_deref(),
        Some("http://host.test/docs/guide?x=1")
    );
    assert_eq!(
        host.app_href("a").as_deref(),
        Some("http://app.test/docs/guide?x=1")
    );

    host.history_back()?;
    assert_eq!(host.context_href("a").as_deref(), Some("http://host.test/docs/"));
    assert_eq!(host.synced_path("a").as_deref(), Some("/docs/"));
    assert_eq!(host.history_length(), 2);

    host.history_forward()?;
    assert_eq!(
        host.context_href("a").as_deref(),
        Some("http://host.test/docs/guide?x=1")
    );
    assert_eq!(host.synced_path("a").as_deref(), Some("/docs/guide?x=1"));
    Ok(())
}

#[test]
fn absolute_guest_urls_are_rebased_onto_the_host_origin() -> Result<()> {
    let mut host = host("http://host.test/")?;
    host.start_app(docs_app())?;
    host.flush()?;

    host.with_guest("a", |scope| scope.history_replace("http://app.test/docs/api"))?;
    assert_eq!(host.history_length(), 1);
    assert_eq!(host.context_href("a").as_deref(), Some("http://host.test/docs/api"));
    assert_eq!(host.host_href(), "http://host.test/?a=%7Bd%7D%2Fapi");
    Ok(())
}

#[test]
fn host_query_route_is_restored_into_a_fresh_app() -> Result<()> {
    let mut host = host("http://host.test/?a=%2Fdocs%2Fintro")?;
    host.start_app(docs_app())?;
    host.flush()?;

    assert_eq!(host.context_href("a").as_deref(), Some("http://host.test/docs/intro"));
    assert_eq!(host.app_href("a").as_deref(), Some("http://app.test/docs/intro"));
    assert_eq!(host.synced_path("a").as_deref(), Some("/docs/intro"));
    Ok(())
}

#[test]
fn destroying_a_synced_app_drops_its_query_entry() -> Result<()> {
    let mut host = host("http://host.test/?keep=1")?;
    host.start_app(docs_app())?;
    host.flush()?;
    assert_eq!(host.host_href(), "http://host.test/?keep=1&a=%7Bd%7D%2F");

    host.destroy_app("a")?;
    assert_eq!(host.host_href(), "http://host.test/?keep=1");
    Ok(())
}

#[test]
fn sweeping_one_app_keeps_other_routes_encoded() -> Result<()> {
    let mut host = HostConfig::new("http://host.test/")
        .html("<div id=\"one\"></div><div id=\"two\"></div>")
        .build()?;
    host.set_trace_stderr(false);
    for (name, el) in [("a", "#one"), ("b", "#two")] {
        host.start_app(
            AppOptions::new(name)
                .url(format!("http://{name}.test/"))
                .html("<p></p>")
                .el(el)
                .sync(true),
        )?;
    }
    host.flush()?;

    host.with_guest("b", |scope| scope.history_push("/a/b?x=1"))?;
    assert!(
        host.host_href().contains("b=%2Fa%2Fb%3Fx%3D1"),
        "{}",
        host.host_href()
    );

    host.destroy_app("a")?;
    assert_eq!(host.host_href(), "http://host.test/?b=%2Fa%2Fb%3Fx%3D1");
    assert_eq!(host.synced_path("b").as_deref(), Some("/a/b?x=1"));
    Ok(())
}
