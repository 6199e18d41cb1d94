use super::*;

const BASE: &str = "http://app.test/sub/index.html";

const PAGE: &str = r#"<html lang="en"><head>
<link rel="stylesheet" href="css/a.css">
<link rel="preload" href="f.js" as="script">
<link rel="preload" href="font.woff" as="font">
<style>:root{--x:1}</style>
<!-- gone -->
</head><body><div id="app"></div>
<script src="vendor.js"></script>
<script src="main.js" defer></script>
<script async src="//cdn.test/a.js"></script>
<script>// only comments</script>
<script>boot()</script>
<script type="text/template"><b>t</b></script>
<script src="skip.js" ignore></script>
<script nomodule src="legacy.js"></script>
</body></html>"#;

#[test]
fn scripts_are_collected_in_document_order() -> Result<()> {
    let parsed = process_template(PAGE, BASE)?;
    let sources: Vec<_> = parsed
        .scripts
        .iter()
        .map(|script| {
            script
                .src
                .clone()
                .or_else(|| script.content.clone())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(
        sources,
        vec![
            "http://app.test/sub/vendor.js",
            "http://app.test/sub/main.js",
            "//cdn.test/a.js",
            "boot()",
        ]
    );
    assert!(parsed.scripts[1].defer);
    assert!(parsed.scripts[2].is_async);
    assert!(!parsed.scripts[0].defer && !parsed.scripts[0].is_async);
    Ok(())
}

#[test]
fn loaded_assets_become_placeholder_comments() -> Result<()> {
    let parsed = process_template(PAGE, BASE)?;
    let template = &parsed.template;
    assert!(template.starts_with(r#"<html lang="en"><head>"#), "{template}");
    assert!(template.contains(&as_comment(&link_placeholder(
        "http://app.test/sub/css/a.css",
        false
    ))));
    assert!(template.contains(&as_comment(&link_placeholder("f.js", true))));
    assert!(template.contains(r#"<link rel="preload" href="font.woff" as="font">"#));
    assert!(template.contains(&as_comment(&inline_style_placeholder(0))));
    assert!(template.contains("<!-- ignore asset http://app.test/sub/skip.js replaced by sandbox -->"));
    assert!(template.contains("<!-- nomodule script http://app.test/sub/legacy.js ignored by sandbox -->"));
    assert!(template.contains(r#"<script type="text/template"><b>t</b></script>"#));
    assert!(!template.contains("gone"));
    assert!(!template.contains("boot()"));
    Ok(())
}

#[test]
fn styles_keep_their_inline_index_and_absolute_href() -> Result<()> {
    let parsed = process_template(PAGE, BASE)?;
    assert_eq!(parsed.styles.len(), 2);
    assert_eq!(
        parsed.styles[0].src.as_deref(),
        Some("http://app.test/sub/css/a.css")
    );
    assert_eq!(parsed.styles[1].content.as_deref(), Some(":root{--x:1}"));
    assert_eq!(parsed.styles[1].inline_index, Some(0));
    Ok(())
}

#[test]
fn entry_defaults_to_the_last_external_script() -> Result<()> {
    let parsed = process_template(
        r#"<script src="a.js"></script><script src="b.js"></script>"#,
        BASE,
    )?;
    assert_eq!(parsed.entry.as_deref(), Some("http://app.test/sub/b.js"));

    let marked = process_template(
        r#"<script src="a.js" entry></script><script src="b.js"></script>"#,
        BASE,
    )?;
    assert_eq!(marked.entry.as_deref(), Some("http://app.test/sub/a.js"));
    Ok(())
}

#[test]
fn a_second_entry_script_is_rejected() {
    let result = process_template(
        r#"<script src="a.js" entry></script><script src="b.js" entry></script>"#,
        BASE,
    );
    assert_eq!(
        result,
        Err(Error::Configuration(
            "more than one entry script is declared".into()
        ))
    );
}

#[test]
fn crossorigin_and_module_flags_are_recorded() -> Result<()> {
    let parsed = process_template(
        r#"<script type="module" src="m.js" crossorigin="use-credentials"></script><script src="c.js" crossorigin></script>"#,
        BASE,
    )?;
    let module = &parsed.scripts[0];
    assert!(module.module && module.crossorigin);
    assert_eq!(module.crossorigin_type, "use-credentials");
    assert_eq!(
        module.attrs,
        vec![
            ("type".to_string(), "module".to_string()),
            ("src".to_string(), "m.js".to_string()),
            ("crossorigin".to_string(), "use-credentials".to_string()),
        ]
    );
    let plain = &parsed.scripts[1];
    assert!(plain.crossorigin && !plain.module);
    assert_eq!(plain.crossorigin_type, "");
    Ok(())
}
