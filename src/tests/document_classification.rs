use super::*;

#[test]
fn queries_resolve_against_the_rendering_container() {
    for name in ["querySelector", "querySelectorAll", "getElementById", "documentElement"] {
        assert_eq!(
            classify_document_property(name),
            DocumentCategory::ContainerQuery,
            "{name}"
        );
    }
}

#[test]
fn structural_nodes_come_from_the_container() {
    for name in ["head", "body", "activeElement", "firstElementChild"] {
        assert_eq!(
            classify_document_property(name),
            DocumentCategory::ContainerStructure,
            "{name}"
        );
    }
}

#[test]
fn platform_facts_come_from_the_host_document() {
    for name in ["hasFocus", "readyState", "visibilityState", "onvisibilitychange"] {
        assert_eq!(classify_document_property(name), DocumentCategory::Host, "{name}");
    }
    assert!(HOST_DOCUMENT_METHODS.contains(&"createRange"));
}

#[test]
fn event_handler_properties_land_on_the_container() {
    assert_eq!(
        classify_document_property("onclick"),
        DocumentCategory::ContainerEvent
    );
    assert_eq!(classify_document_property("on"), DocumentCategory::Local);
    assert_eq!(
        classify_document_property("onreadystatechange"),
        DocumentCategory::Local
    );
}

#[test]
fn everything_else_stays_local() {
    for name in ["createElement", "createTextNode", "URL", "cookie", "title"] {
        assert_eq!(classify_document_property(name), DocumentCategory::Local, "{name}");
    }
}
