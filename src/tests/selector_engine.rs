use super::*;

const PAGE: &str = r#"<div id="root" class="app main">
<ul class="list"><li id="a" class="item">a</li><li id="b" class="item on" data-k="v w">b</li><li id="c">c</li></ul>
<p id="p1">x</p><span id="s1"></span><p id="p2">y</p>
</div>"#;

fn ids(selector: &str) -> Result<Vec<String>> {
    let mut dom = Dom::new();
    let document = parse_document(&mut dom, "http://app.test/", PAGE)?;
    Ok(dom
        .query_selector_all_from(document, selector)?
        .into_iter()
        .filter_map(|node| dom.attr(node, "id"))
        .collect())
}

#[test]
fn simple_steps_combine_tag_id_class_and_attributes() -> Result<()> {
    assert_eq!(ids("li.item")?, vec!["a", "b"]);
    assert_eq!(ids(".item.on")?, vec!["b"]);
    assert_eq!(ids("#root")?, vec!["root"]);
    assert_eq!(ids("div.main")?, vec!["root"]);
    assert_eq!(ids("[data-k]")?, vec!["b"]);
    assert_eq!(ids(r#"[data-k="v w"]"#)?, vec!["b"]);
    assert_eq!(ids("[data-k=v]")?, Vec::<String>::new());
    assert_eq!(ids("LI#c")?, vec!["c"]);
    Ok(())
}

#[test]
fn combinators_walk_ancestors_and_siblings() -> Result<()> {
    assert_eq!(ids("#root li")?, vec!["a", "b", "c"]);
    assert_eq!(ids("#root > li")?, Vec::<String>::new());
    assert_eq!(ids("ul > li.item + li")?, vec!["b", "c"]);
    assert_eq!(ids("#p1 ~ p")?, vec!["p2"]);
    assert_eq!(ids("#p1 + p")?, Vec::<String>::new());
    assert_eq!(ids("#p1+span")?, vec!["s1"]);
    Ok(())
}

#[test]
fn pseudo_classes_and_groups() -> Result<()> {
    assert_eq!(ids("li:first-child")?, vec!["a"]);
    assert_eq!(ids("li:last-child")?, vec!["c"]);
    assert_eq!(ids("li:not(.item)")?, vec!["c"]);
    assert_eq!(ids("li:not(#a, #c)")?, vec!["b"]);
    assert_eq!(ids("#p2, #a, #p2")?, vec!["a", "p2"]);
    Ok(())
}

#[test]
fn malformed_selectors_are_rejected() {
    for selector in ["", "a,", "> a", "a >", "a > > b", "[x", "li:hover", "#", "a#b#c", "*div"] {
        let mut dom = Dom::new();
        let outcome = parse_document(&mut dom, "http://app.test/", "<a></a>")
            .and_then(|document| dom.query_selector_from(document, selector));
        assert!(
            matches!(outcome, Err(Error::UnsupportedSelector(_))),
            "{selector:?} gave {outcome:?}"
        );
    }
}
