use super::*;

#[test]
fn parse_normalizes_scheme_host_port_and_path() -> Result<()> {
    let parts = LocationParts::parse("HTTPS://User:pw@Example.COM:443/a/./b/../c?x=1#top")
        .ok_or_else(|| Error::Configuration("unparsed".into()))?;
    assert_eq!(parts.scheme, "https");
    assert_eq!(parts.username, "User");
    assert_eq!(parts.password, "pw");
    assert_eq!(parts.hostname, "example.com");
    assert_eq!(parts.port, "");
    assert_eq!(parts.pathname, "/a/c");
    assert_eq!(parts.search, "?x=1");
    assert_eq!(parts.hash, "#top");
    assert_eq!(parts.href(), "https://User:pw@example.com/a/c?x=1#top");
    assert_eq!(parts.origin(), "https://example.com");
    assert_eq!(parts.host_path(), "https://example.com");
    assert_eq!(parts.route_path(), "/a/c?x=1#top");
    Ok(())
}

#[test]
fn parse_keeps_bracketed_ipv6_host_and_explicit_port() -> Result<()> {
    let parts = LocationParts::parse("http://[::1]:8080/x")
        .ok_or_else(|| Error::Configuration("unparsed".into()))?;
    assert_eq!(parts.hostname, "[::1]");
    assert_eq!(parts.port, "8080");
    assert_eq!(parts.host(), "[::1]:8080");
    assert_eq!(parts.href(), "http://[::1]:8080/x");
    Ok(())
}

#[test]
fn opaque_urls_have_null_origin_and_slash_route() -> Result<()> {
    let parts = LocationParts::parse("blob:sandbox-empty-page")
        .ok_or_else(|| Error::Configuration("unparsed".into()))?;
    assert!(!parts.has_authority);
    assert_eq!(parts.href(), "blob:sandbox-empty-page");
    assert_eq!(parts.origin(), "null");
    assert_eq!(parts.route_path(), "/sandbox-empty-page");
    Ok(())
}

#[test]
fn invalid_schemes_do_not_parse() {
    assert!(LocationParts::parse("::bad").is_none());
    assert!(LocationParts::parse("1http://x/").is_none());
    assert!(LocationParts::parse("no scheme here").is_none());
}

#[test]
fn resolve_handles_relative_fragment_query_and_scheme_relative_input() -> Result<()> {
    let base = LocationParts::parse("http://host.test/app/page?q=1#h")
        .ok_or_else(|| Error::Configuration("unparsed".into()))?;
    assert_eq!(base.resolve("../other/x.js"), "http://host.test/other/x.js");
    assert_eq!(base.resolve("sibling"), "http://host.test/app/sibling");
    assert_eq!(base.resolve("#next"), "http://host.test/app/page?q=1#next");
    assert_eq!(base.resolve("?z=2"), "http://host.test/app/page?z=2");
    assert_eq!(base.resolve("//cdn.test/lib.js"), "http://cdn.test/lib.js");
    assert_eq!(base.resolve("/abs/"), "http://host.test/abs/");
    assert_eq!(base.resolve(""), "http://host.test/app/page?q=1#h");
    Ok(())
}

#[test]
fn public_path_is_the_entry_directory() {
    assert_eq!(
        default_public_path("http://app.test/sub/index.html", "http://host.test/"),
        "http://app.test/sub/"
    );
    assert_eq!(
        default_public_path("http://app.test", "http://host.test/"),
        "http://app.test/"
    );
    assert_eq!(
        default_public_path("/guest/", "http://host.test/home"),
        "http://host.test/guest/"
    );
    assert_eq!(default_public_path("::bad", "not a url"), "");
}

#[test]
fn absolute_path_keeps_fragments_on_request() {
    let base = "http://app.test/a/b";
    assert_eq!(absolute_path("", base, false), "");
    assert_eq!(absolute_path("#top", base, true), "#top");
    assert_eq!(absolute_path("#top", base, false), "http://app.test/a/b#top");
    assert_eq!(absolute_path("img.png", base, false), "http://app.test/a/img.png");
}

#[test]
fn uri_component_escapes_reserved_and_multibyte_characters() -> Result<()> {
    assert_eq!(encode_uri_component("a b/ü?&="), "a%20b%2F%C3%BC%3F%26%3D");
    assert_eq!(encode_uri_component("-_.!~*'()"), "-_.!~*'()");
    assert_eq!(decode_uri_component("a%20b%2F%C3%BC%3F%26%3D")?, "a b/ü?&=");
    assert_eq!(decode_uri_component("%7bx%7D")?, "{x}");
    Ok(())
}

#[test]
fn malformed_uri_sequences_are_configuration_errors() {
    for input in ["%", "%A", "%zz", "%+1", "%C3"] {
        match decode_uri_component(input) {
            Err(Error::Configuration(message)) => {
                assert!(message.contains("malformed URI sequence"), "{message}");
            }
            other => panic!("expected malformed error for {input:?}, got {other:?}"),
        }
    }
}

#[test]
fn sync_path_uses_the_longest_prefix() -> Result<()> {
    let prefix = BTreeMap::from([
        ("d".to_string(), "/docs".to_string()),
        ("g".to_string(), "/docs/guide".to_string()),
    ]);
    let encoded = encode_sync_path("/docs/guide/intro?x=1", &prefix);
    assert_eq!(encoded, "%7Bg%7D%2Fintro%3Fx%3D1");
    assert_eq!(decode_sync_path(&encoded, &prefix)?, "/docs/guide/intro?x=1");
    assert_eq!(encode_sync_path("/docs/api", &prefix), "%7Bd%7D%2Fapi");
    Ok(())
}

#[test]
fn unknown_short_keys_decode_verbatim() -> Result<()> {
    let prefix = BTreeMap::from([("d".to_string(), "/docs".to_string())]);
    assert_eq!(decode_sync_path("%7Bzz%7D%2Fa", &prefix)?, "{zz}/a");
    assert_eq!(decode_sync_path("%2Fplain", &BTreeMap::new())?, "/plain");
    Ok(())
}
