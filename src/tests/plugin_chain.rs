use super::*;

#[test]
fn css_urls_resolve_against_the_stylesheet() {
    let css = r#"a{background:url(img/x.png)} b{background:url('data:abc')} c{src:url("/f.woff")}"#;
    let out = plugin::css_relative_path_resolve(css, "http://cdn.test/css/site.css", "http://app.test/");
    assert_eq!(
        out,
        r#"a{background:url(http://cdn.test/css/img/x.png)} b{background:url('data:abc')} c{src:url("http://cdn.test/f.woff")}"#
    );
}

#[test]
fn inline_css_resolves_against_the_page_base() {
    let out = plugin::css_relative_path_resolve("a{b:url(x.png)}", "", "http://app.test/sub/");
    assert_eq!(out, "a{b:url(http://app.test/sub/x.png)}");
}

#[test]
fn loaders_run_after_the_built_in_plugin_in_registration_order() {
    let first = Plugin::new().with_css_loader(|code, _, _| format!("{code}/*1*/"));
    let second = Plugin::new().with_css_loader(|code, _, _| format!("{code}/*2*/"));
    let chain = PluginChain::new(&[first, second]);
    assert_eq!(chain.plugins().len(), 3);
    assert_eq!(
        chain.css_transform("a{b:url(x.png)}", "", "http://app.test/", None),
        "a{b:url(http://app.test/x.png)}/*1*//*2*/"
    );
}

#[test]
fn replace_runs_before_js_loaders() {
    let chain = PluginChain::new(&[
        Plugin::new().with_js_loader(|code, src, _| format!("{code};// {src}"))
    ]);
    let replace: HtmlTransform = Rc::new(|code: &str| code.replace("old", "new"));
    assert_eq!(
        chain.js_transform("old()", "http://app.test/a.js", "", Some(&replace)),
        "new();// http://app.test/a.js"
    );
}

#[test]
fn html_loaders_compose() {
    let chain = PluginChain::new(&[
        Plugin::new().with_html_loader(|html| html.replace("a", "b")),
        Plugin::new().with_html_loader(|html| format!("{html}!")),
    ]);
    assert!(chain.has_html_loader());
    assert_eq!(chain.html_transform("aa"), "bb!");
    assert!(!PluginChain::new(&[]).has_html_loader());
}

#[test]
fn before_styles_come_out_reversed() {
    let chain = PluginChain::new(&[Plugin::new()
        .with_css_before_loader(StyleLoaderSpec::inline("a1"))
        .with_css_before_loader(StyleLoaderSpec::inline("a2"))
        .with_css_after_loader(StyleLoaderSpec::inline("z1"))
        .with_css_after_loader(StyleLoaderSpec::external("http://cdn.test/z2.css"))]);

    let before: Vec<_> = chain
        .preset_styles(LoaderStage::Before)
        .into_iter()
        .filter_map(|style| style.content)
        .collect();
    assert_eq!(before, vec!["a2", "a1", "html {view-transition-name: none;}"]);

    let after = chain.preset_styles(LoaderStage::After);
    assert_eq!(
        after,
        vec![
            StyleLoaderSpec::inline("z1"),
            StyleLoaderSpec::external("http://cdn.test/z2.css"),
        ]
    );
}

#[test]
fn preset_scripts_keep_registration_order() {
    let chain = PluginChain::new(&[
        Plugin::new().with_js_before_loader(ScriptLoaderSpec::inline("one")),
        Plugin::new()
            .with_js_before_loader(ScriptLoaderSpec::external("http://cdn.test/two.js"))
            .with_js_after_loader(ScriptLoaderSpec::inline("three")),
    ]);
    let before: Vec<_> = chain
        .preset_scripts(LoaderStage::Before)
        .into_iter()
        .map(|script| script.src.or(script.content).unwrap_or_default())
        .collect();
    assert_eq!(before, vec!["one", "http://cdn.test/two.js"]);
    assert_eq!(chain.preset_scripts(LoaderStage::After).len(), 1);
}

#[test]
fn exclude_and_ignore_lists_match_exact_urls_or_patterns() -> Result<()> {
    let chain = PluginChain::new(&[Plugin::new()
        .exclude_js(UrlMatcher::exact("http://cdn.test/analytics.js"))
        .ignore_js(UrlMatcher::pattern(r"\.map\.js$")?)
        .exclude_css(UrlMatcher::pattern(r"^https?://fonts\.")?)
        .ignore_css(UrlMatcher::exact("http://app.test/print.css"))]);

    assert!(chain.js_excluded("http://cdn.test/analytics.js"));
    assert!(!chain.js_excluded("http://cdn.test/analytics.js?v=2"));
    assert!(chain.js_ignored("http://app.test/app.map.js"));
    assert!(!chain.js_ignored("http://app.test/app.js"));
    assert!(chain.css_excluded("https://fonts.test/a.css"));
    assert!(chain.css_ignored("http://app.test/print.css"));
    assert!(!chain.css_ignored("http://app.test/screen.css"));
    Ok(())
}

#[test]
fn invalid_matcher_patterns_are_configuration_errors() {
    assert!(matches!(
        UrlMatcher::pattern("(unclosed"),
        Err(Error::Configuration(_))
    ));
}

mod composition {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            failure_persistence: None,
            .. ProptestConfig::default()
        })]

        #[test]
        fn js_loaders_apply_in_registration_order(markers in vec("[a-z]{1,4}", 0..6)) {
            let plugins: Vec<Plugin> = markers
                .iter()
                .cloned()
                .map(|marker| {
                    Plugin::new().with_js_loader(move |code, _, _| format!("{code}[{marker}]"))
                })
                .collect();
            let chain = PluginChain::new(&plugins);
            let expected: String = markers.iter().map(|marker| format!("[{marker}]")).collect();
            prop_assert_eq!(
                chain.js_transform("x", "http://app.test/a.js", "", None),
                format!("x{expected}")
            );
        }
    }
}
