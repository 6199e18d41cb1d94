use std::collections::BTreeMap;
use std::rc::Rc;

use frame_sandbox::{
    AppOptions, BundleEngine, Error, HostConfig, decode_sync_path, decode_uri_component,
    encode_sync_path, encode_uri_component,
};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::{FileFailurePersistence, TestCaseResult};

const SYNC_PROPTEST_REGRESSION_FILE: &str = "tests/proptest-regressions/sync_property_fuzz_test.txt";
const DEFAULT_SYNC_PROPTEST_CASES: u32 = 256;
const DEFAULT_TEMPLATE_PROPTEST_CASES: u32 = 64;

fn env_proptest_cases(var_name: &str, default_cases: u32) -> u32 {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_cases)
}

fn sync_proptest_cases() -> u32 {
    env_proptest_cases("FRAME_SANDBOX_PROPTEST_CASES", DEFAULT_SYNC_PROPTEST_CASES)
}

fn template_proptest_cases() -> u32 {
    std::env::var("FRAME_SANDBOX_TEMPLATE_PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or_else(|| {
            env_proptest_cases(
                "FRAME_SANDBOX_PROPTEST_CASES",
                DEFAULT_TEMPLATE_PROPTEST_CASES,
            )
        })
}

fn prefix_table() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("d".to_string(), "/docs".to_string()),
        ("dg".to_string(), "/docs/guide".to_string()),
        ("api".to_string(), "/api/v2".to_string()),
    ])
}

fn segment_strategy() -> BoxedStrategy<String> {
    prop_oneof![
        Just("docs".to_string()),
        Just("guide".to_string()),
        Just("api".to_string()),
        Just("v2".to_string()),
        Just("日本".to_string()),
        "[a-z0-9._~-]{1,8}",
        "[ %&=+#]{1,3}",
    ]
    .boxed()
}

fn guest_path_strategy() -> BoxedStrategy<String> {
    (
        vec(segment_strategy(), 0..=5),
        proptest::option::of("[a-z]{1,4}=[a-z0-9]{0,4}"),
    )
        .prop_map(|(segments, query)| {
            let mut path = format!("/{}", segments.join("/"));
            if let Some(query) = query {
                path.push('?');
                path.push_str(&query);
            }
            path
        })
        .boxed()
}

fn template_token_strategy() -> BoxedStrategy<String> {
    prop_oneof![
        Just("<div>".to_string()),
        Just("</div>".to_string()),
        Just("<p id='x'>".to_string()),
        Just("</p>".to_string()),
        Just("<br>".to_string()),
        Just("<!-- note -->".to_string()),
        Just("<style>a { color: red; }</style>".to_string()),
        Just("<style>:root { --x: 1; }</style>".to_string()),
        Just("<script>/* @bundle noop */</script>".to_string()),
        Just("<script src='lib.js'></script>".to_string()),
        Just("<script async src='side.js'></script>".to_string()),
        Just("<link rel='stylesheet' href='a.css'>".to_string()),
        Just("&amp;".to_string()),
        Just("<".to_string()),
        Just("text".to_string()),
        Just("<span title=\"q\">".to_string()),
    ]
    .boxed()
}

fn assert_template_start_is_stable(tokens: &[String]) -> TestCaseResult {
    let html: String = tokens.concat();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let engine = Rc::new(BundleEngine::new());
        engine.register("noop", |_scope| Ok(()));
        let mut host = HostConfig::new("http://host.test/")
            .html("<div id=\"app\"></div>")
            .engine(engine)
            .build()?;
        host.set_trace_stderr(false);
        host.start_app(
            AppOptions::new("fuzz")
                .url("http://app.test/")
                .html(html.clone())
                .el("#app"),
        )?;
        host.flush()
    }));

    match outcome {
        Err(_) => prop_assert!(false, "starting panicked for html={html:?}"),
        Ok(Ok(())) | Ok(Err(Error::HtmlParse(_))) => {}
        Ok(Err(other)) => prop_assert!(false, "unexpected error {other:?} for html={html:?}"),
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: sync_proptest_cases(),
        failure_persistence: Some(Box::new(
            FileFailurePersistence::Direct(SYNC_PROPTEST_REGRESSION_FILE),
        )),
        .. ProptestConfig::default()
    })]

    #[test]
    fn sync_paths_round_trip_through_the_prefix_table(path in guest_path_strategy()) {
        let prefix = prefix_table();
        let encoded = encode_sync_path(&path, &prefix);
        prop_assert!(!encoded.contains('/'), "encoded={encoded}");
        prop_assert_eq!(decode_sync_path(&encoded, &prefix).ok(), Some(path));
    }

    #[test]
    fn uri_component_output_uses_only_unreserved_characters(input in "\\PC{0,24}") {
        let encoded = encode_uri_component(&input);
        prop_assert!(
            encoded
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || "-_.!~*'()%".contains(ch)),
            "encoded={encoded}"
        );
        prop_assert_eq!(decode_uri_component(&encoded).ok(), Some(input));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: template_proptest_cases(),
        failure_persistence: Some(Box::new(
            FileFailurePersistence::Direct(SYNC_PROPTEST_REGRESSION_FILE),
        )),
        .. ProptestConfig::default()
    })]

    #[test]
    fn arbitrary_templates_start_or_report_parse_errors(tokens in vec(template_token_strategy(), 0..=16)) {
        assert_template_start_is_stable(&tokens)?;
    }
}
