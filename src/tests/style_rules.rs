use super::*;

#[test]
fn root_rules_are_rewritten_for_the_shadow_host() {
    let css = "/* :root { --gone: 1 } */ @import 'a.css'; :root { --c: red; } body { margin: 0 } \
               @media (x) { :root { --d: 1 } }";
    let patched = patch_style_rules(css);
    assert_eq!(
        patched.host.as_deref(),
        Some(":host { --c: red; }@media (x) { :host { --d: 1 } }")
    );
    assert_eq!(patched.font, None);
}

#[test]
fn font_faces_are_extracted_verbatim() {
    let css = "@font-face { font-family: F; src: url('f.woff') } p { content: '}' }";
    let patched = patch_style_rules(css);
    assert_eq!(
        patched.font.as_deref(),
        Some("@font-face { font-family: F; src: url('f.woff') }")
    );
    assert_eq!(patched.host, None);
}

#[test]
fn plain_stylesheets_need_no_patch() {
    assert_eq!(patch_style_rules("a{color:red} .b{}"), render::PatchedRules::default());
    assert_eq!(patch_style_rules(""), render::PatchedRules::default());
}
