use super::*;

fn parse(html: &str) -> Result<(Dom, NodeId)> {
    let mut dom = Dom::new();
    let document = parse_document(&mut dom, "http://app.test/", html)?;
    Ok((dom, document))
}

fn first(dom: &Dom, document: NodeId, selector: &str) -> Result<NodeId> {
    dom.query_selector_from(document, selector)?
        .ok_or_else(|| Error::NotFound(selector.to_string()))
}

#[test]
fn document_always_gets_head_and_body() -> Result<()> {
    let (dom, document) = parse("<title>a &amp; b</title><p>one<p>two")?;
    let html = dom
        .first_element_child(document)
        .ok_or_else(|| Error::NotFound("html".into()))?;
    let tags: Vec<_> = dom
        .element_children(html)
        .into_iter()
        .filter_map(|node| dom.tag_name(node).map(ToOwned::to_owned))
        .collect();
    assert_eq!(tags, vec!["head", "body"]);

    let title = first(&dom, document, "head > title")?;
    assert_eq!(dom.text_content(title), "a & b");
    assert_eq!(dom.query_selector_all_from(document, "body > p")?.len(), 2);
    Ok(())
}

#[test]
fn script_bodies_are_raw_text() -> Result<()> {
    let (dom, document) = parse(
        "<script>if (a < b) { x = '</div>'; }</SCRIPT ><div id='after'>&lt;ok&gt;</div>",
    )?;
    let script = first(&dom, document, "script")?;
    assert_eq!(dom.text_content(script), "if (a < b) { x = '</div>'; }");
    let after = first(&dom, document, "#after")?;
    assert_eq!(dom.text_content(after), "<ok>");
    assert_eq!(dom.outer_html(script), "<script>if (a < b) { x = '</div>'; }</script>");
    Ok(())
}

#[test]
fn serialization_preserves_attribute_order_and_void_tags() -> Result<()> {
    let (dom, document) =
        parse("<div class='a' data-x=\"1\" hidden><br/><img src=x.png><span>t &amp; u</span></div>")?;
    let div = first(&dom, document, "div")?;
    assert_eq!(
        dom.outer_html(div),
        r#"<div class="a" data-x="1" hidden=""><br><img src="x.png"><span>t &amp; u</span></div>"#
    );
    Ok(())
}

#[test]
fn character_references_decode_in_text_and_attributes() -> Result<()> {
    let (dom, document) = parse("<p id='e' title='&quot;q&quot;'>&lt;tag&gt; &#65;&#x42; &bogus; &amp</p>")?;
    let p = first(&dom, document, "#e")?;
    assert_eq!(dom.text_content(p), "<tag> AB &bogus; &amp");
    assert_eq!(dom.attr(p, "title").as_deref(), Some("\"q\""));
    Ok(())
}

#[test]
fn comments_survive_and_declarations_are_dropped() -> Result<()> {
    let (dom, document) = parse("<!DOCTYPE html><body><!-- keep --><?xml skip?><i>x</i></body>")?;
    let body = first(&dom, document, "body")?;
    assert_eq!(dom.inner_html(body), "<!-- keep --><i>x</i>");
    Ok(())
}

#[test]
fn malformed_markup_reports_parse_errors() {
    for html in ["<!-- open", "<div", "<p title='x>", "<script>never closed", "</div"] {
        let mut dom = Dom::new();
        match parse_document(&mut dom, "http://app.test/", html) {
            Err(Error::HtmlParse(_)) => {}
            other => panic!("expected parse error for {html:?}, got {other:?}"),
        }
    }
}

#[test]
fn stray_end_tags_do_not_close_unrelated_elements() -> Result<()> {
    let (dom, document) = parse("<section><em>a</b>b</em></section>")?;
    let em = first(&dom, document, "section > em")?;
    assert_eq!(dom.text_content(em), "ab");
    Ok(())
}
