use super::*;

const SCRIPT_TYPES: [&str; 6] = [
    "text/javascript",
    "module",
    "application/javascript",
    "text/ecmascript",
    "application/ecmascript",
    "importmap",
];

/// One `<script>` found in a guest page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ScriptDescriptor {
    pub(crate) src: Option<String>,
    pub(crate) content: Option<String>,
    pub(crate) is_async: bool,
    pub(crate) defer: bool,
    pub(crate) module: bool,
    pub(crate) ignore: bool,
    pub(crate) crossorigin: bool,
    pub(crate) crossorigin_type: String,
    pub(crate) attrs: Vec<(String, String)>,
}

/// One stylesheet found in a guest page: an external link or an inline `<style>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StyleDescriptor {
    pub(crate) src: Option<String>,
    pub(crate) content: Option<String>,
    pub(crate) ignore: bool,
    /// Position among the page's inline styles, used to find the placeholder again.
    pub(crate) inline_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedTemplate {
    pub(crate) template: String,
    pub(crate) scripts: Vec<ScriptDescriptor>,
    pub(crate) styles: Vec<StyleDescriptor>,
    pub(crate) entry: Option<String>,
}

pub(crate) fn link_placeholder(href: &str, preload: bool) -> String {
    let prefix = if preload {
        "prefetch/preload/modulepreload"
    } else {
        ""
    };
    format!(" {prefix} link {href} replaced by sandbox ")
}

pub(crate) fn inline_style_placeholder(index: usize) -> String {
    format!(" inline-style-{index} replaced by sandbox ")
}

pub(crate) fn script_placeholder(src: &str, mode: &str) -> String {
    format!(" {mode} script {src} replaced by sandbox ")
}

pub(crate) const INLINE_SCRIPT_PLACEHOLDER: &str = " inline scripts replaced by sandbox ";

pub(crate) fn ignore_asset_placeholder(url: &str) -> String {
    let url = if url.is_empty() { "file" } else { url };
    format!(" ignore asset {url} replaced by sandbox ")
}

pub(crate) fn module_script_placeholder(src: &str) -> String {
    format!(" nomodule script {src} ignored by sandbox ")
}

/// Comment markup for a placeholder produced by the helpers above.
pub(crate) fn as_comment(text: &str) -> String {
    format!("<!--{text}-->")
}

fn is_valid_script_type(script_type: Option<&str>) -> bool {
    match script_type {
        None => true,
        Some(value) => value.is_empty() || SCRIPT_TYPES.contains(&value),
    }
}

fn has_protocol(url: &str) -> bool {
    url.starts_with("//") || url.starts_with("http://") || url.starts_with("https://")
}

fn entire_path(path: &str, base: &str) -> String {
    if has_protocol(path) {
        return path.to_string();
    }
    resolve_url(path, base).unwrap_or_else(|| path.to_string())
}

fn is_pure_comment_block(code: &str) -> bool {
    code.split(['\r', '\n']).all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("//")
    })
}

/// Splits a guest page into its template and the script/style manifest. Every script
/// and stylesheet the sandbox will load itself is replaced by a placeholder comment.
pub(crate) fn process_template(html: &str, base: &str) -> Result<ParsedTemplate> {
    let mut dom = Dom::new();
    let document = parse_document(&mut dom, base, html)?;
    let root = dom
        .first_element_child(document)
        .ok_or_else(|| Error::HtmlParse("template has no root element".into()))?;

    let mut all = Vec::new();
    collect_nodes(&dom, root, &mut all);
    for node in &all {
        if dom.kind(*node) == Some(NodeKind::Comment) {
            dom.detach(*node)?;
        }
    }

    let mut scripts = Vec::new();
    let mut styles: Vec<StyleDescriptor> = Vec::new();
    let mut entry: Option<String> = None;
    let mut inline_styles = 0usize;

    let mut elements = Vec::new();
    dom.collect_elements(root, &mut elements);
    for node in elements {
        if dom.parent(node).is_none() {
            continue;
        }
        let Some(tag) = dom.tag_name(node).map(ToOwned::to_owned) else {
            continue;
        };
        let replacement = match tag.as_str() {
            "link" => process_link(&dom, node, base, &mut styles),
            "style" => {
                if dom.has_attr(node, "ignore") {
                    Some(ignore_asset_placeholder("style file"))
                } else {
                    let index = inline_styles;
                    inline_styles += 1;
                    styles.push(StyleDescriptor {
                        src: None,
                        content: Some(dom.text_content(node)),
                        ignore: false,
                        inline_index: Some(index),
                    });
                    Some(inline_style_placeholder(index))
                }
            }
            "script" => process_script(&dom, node, base, &mut scripts, &mut entry)?,
            _ => None,
        };
        if let Some(text) = replacement {
            let comment = dom.create_comment(document, &text);
            let parent = dom
                .parent(node)
                .ok_or_else(|| Error::HtmlParse("detached template element".into()))?;
            dom.insert_before(parent, comment, Some(node))?;
            dom.detach(node)?;
        }
    }

    let entry = entry.or_else(|| {
        scripts
            .last()
            .and_then(|script: &ScriptDescriptor| script.src.clone())
    });
    Ok(ParsedTemplate {
        template: dom.outer_html(root),
        scripts,
        styles,
        entry,
    })
}

fn collect_nodes(dom: &Dom, root: NodeId, out: &mut Vec<NodeId>) {
    for child in dom.children(root) {
        out.push(child);
        collect_nodes(dom, child, out);
    }
}

fn process_link(
    dom: &Dom,
    node: NodeId,
    base: &str,
    styles: &mut Vec<StyleDescriptor>,
) -> Option<String> {
    let rel = dom.attr(node, "rel").unwrap_or_default().to_ascii_lowercase();
    let href = dom.attr(node, "href").filter(|href| !href.is_empty());
    if rel == "stylesheet" {
        if let Some(href) = href.as_deref() {
            let href = entire_path(href, base);
            if dom.has_attr(node, "ignore") {
                return Some(ignore_asset_placeholder(&href));
            }
            styles.push(StyleDescriptor {
                src: Some(href.clone()),
                content: None,
                ignore: false,
                inline_index: None,
            });
            return Some(link_placeholder(&href, false));
        }
    }
    let preload = matches!(rel.as_str(), "preload" | "prefetch" | "modulepreload");
    let font = dom
        .attr(node, "as")
        .is_some_and(|value| value.eq_ignore_ascii_case("font"));
    match href {
        Some(href) if preload && !font => Some(link_placeholder(&href, true)),
        _ => None,
    }
}

fn process_script(
    dom: &Dom,
    node: NodeId,
    base: &str,
    scripts: &mut Vec<ScriptDescriptor>,
    entry: &mut Option<String>,
) -> Result<Option<String>> {
    let script_type = dom.attr(node, "type");
    if !is_valid_script_type(script_type.as_deref()) {
        return Ok(None);
    }
    let ignore = dom.has_attr(node, "ignore");
    let module = script_type.as_deref() == Some("module");
    let nomodule = dom.has_attr(node, "nomodule");
    let crossorigin_type = dom.attr(node, "crossorigin");
    let crossorigin = crossorigin_type.is_some();
    let crossorigin_type = crossorigin_type
        .filter(|value| value == "anonymous" || value == "use-credentials")
        .unwrap_or_default();
    let attrs = dom.attrs(node);

    if let Some(src) = dom.attr(node, "src").filter(|src| !src.is_empty()) {
        let is_entry = dom.has_attr(node, "entry");
        if entry.is_some() && is_entry {
            return Err(Error::Configuration(
                "more than one entry script is declared".into(),
            ));
        }
        let src = entire_path(&src, base);
        if is_entry {
            *entry = Some(src.clone());
        }
        if ignore {
            return Ok(Some(ignore_asset_placeholder(&src)));
        }
        if nomodule {
            return Ok(Some(module_script_placeholder(&src)));
        }
        let is_async = dom.has_attr(node, "async");
        let defer = dom.has_attr(node, "defer");
        let mode = if is_async {
            "async"
        } else if defer {
            "defer"
        } else {
            ""
        };
        scripts.push(ScriptDescriptor {
            src: Some(src.clone()),
            content: None,
            is_async,
            defer,
            module,
            ignore: false,
            crossorigin,
            crossorigin_type,
            attrs,
        });
        return Ok(Some(script_placeholder(&src, mode)));
    }

    if ignore {
        return Ok(Some(ignore_asset_placeholder("js file")));
    }
    if nomodule {
        return Ok(Some(module_script_placeholder("js file")));
    }
    let code = dom.text_content(node);
    if !code.is_empty() && !is_pure_comment_block(&code) {
        scripts.push(ScriptDescriptor {
            src: None,
            content: Some(code),
            is_async: false,
            defer: false,
            module,
            ignore: false,
            crossorigin,
            crossorigin_type,
            attrs,
        });
    }
    Ok(Some(INLINE_SCRIPT_PLACEHOLDER.to_string()))
}
