use super::*;

/// Parses `html` and appends the resulting nodes to `parent`. Nodes are owned by
/// `owner`. Comments are preserved; `<!DOCTYPE>` and other declarations are dropped.
pub(crate) fn parse_into(dom: &mut Dom, parent: NodeId, owner: NodeId, html: &str) -> Result<()> {
    let mut stack = vec![parent];
    let mut i = 0usize;
    while let Some(rest) = html.get(i..).filter(|rest| !rest.is_empty()) {
        let second = rest.as_bytes().get(1).copied();
        if let Some(body) = rest.strip_prefix("<!--") {
            let end = body
                .find("-->")
                .ok_or_else(|| Error::HtmlParse("unclosed HTML comment".into()))?;
            let comment = dom.create_comment(owner, &body[..end]);
            dom.append_child(current(&stack)?, comment)?;
            i += "<!--".len() + end + "-->".len();
        } else if rest.starts_with("</") {
            let (tag, next) = parse_end_tag(html, i)?;
            close_element(dom, &mut stack, &tag);
            i = next;
        } else if rest.starts_with('<') && matches!(second, Some(b'!' | b'?')) {
            i = skip_declaration(html, i)?;
        } else if rest.starts_with('<') && second.is_some_and(|b| b.is_ascii_alphabetic()) {
            i = open_element(dom, &mut stack, owner, html, i)?;
        } else {
            let len = rest
                .char_indices()
                .skip(1)
                .find(|(_, ch)| *ch == '<')
                .map_or(rest.len(), |(at, _)| at);
            let decoded = decode_html_character_references(&rest[..len]);
            if !decoded.is_empty() {
                let text = dom.create_text(owner, &decoded);
                dom.append_child(current(&stack)?, text)?;
            }
            i += len;
        }
    }
    Ok(())
}

/// Pops the innermost open `tag`. The fragment root itself is never popped.
fn close_element(dom: &Dom, stack: &mut Vec<NodeId>, tag: &str) {
    let open = stack
        .iter()
        .rposition(|node| dom.tag_name(*node).is_some_and(|name| name == tag));
    if let Some(pos) = open.filter(|pos| *pos > 0) {
        stack.truncate(pos);
    }
}

/// Creates the element starting at `at` and returns where parsing continues. Raw text
/// elements swallow everything up to their end tag.
fn open_element(
    dom: &mut Dom,
    stack: &mut Vec<NodeId>,
    owner: NodeId,
    html: &str,
    at: usize,
) -> Result<usize> {
    let StartTag {
        name,
        attrs,
        self_closing,
        end,
    } = parse_start_tag(html, at)?;
    close_optional_start_tag(dom, stack, &name);
    let node = dom.create_element_with_attrs(owner, &name, attrs);
    dom.append_child(current(stack)?, node)?;

    if is_raw_text_tag(&name) && !self_closing {
        let close = raw_text_end(html, end, &name)
            .ok_or_else(|| Error::HtmlParse(format!("unclosed <{name}>")))?;
        let body = html.get(end..close).unwrap_or_default();
        if !body.is_empty() {
            let text = if matches!(name.as_str(), "title" | "textarea") {
                decode_html_character_references(body)
            } else {
                body.to_string()
            };
            let text = dom.create_text(owner, &text);
            dom.append_child(node, text)?;
        }
        return parse_end_tag(html, close).map(|(_, next)| next);
    }
    if !self_closing && !is_void_tag(&name) {
        stack.push(node);
    }
    Ok(end)
}

/// Parses a full page into a new document, guaranteeing an `html` element with exactly
/// one `head` and one `body`.
pub(crate) fn parse_document(dom: &mut Dom, url: &str, html: &str) -> Result<NodeId> {
    let document = dom.create_document(url);
    let holder = dom.create_element(document, "template");
    parse_into(dom, holder, document, html)?;
    let root = dom.create_element(document, "html");
    dom.append_child(document, root)?;
    fill_html_element(dom, root, holder)?;
    Ok(document)
}

/// Moves parsed nodes from `holder` into `html`, unwrapping a parsed `<html>` element and
/// placing stray nodes into `body`.
pub(crate) fn fill_html_element(dom: &mut Dom, html: NodeId, holder: NodeId) -> Result<()> {
    let mut top = Vec::new();
    for node in dom.children(holder) {
        if dom.is_tag(node, "html") {
            for (key, value) in dom.attrs(node) {
                dom.set_attr(html, &key, &value)?;
            }
            top.extend(dom.children(node));
        } else {
            top.push(node);
        }
    }

    let mut head = None;
    let mut body = None;
    let mut stray = Vec::new();
    for node in top {
        if dom.is_tag(node, "head") && head.is_none() {
            head = Some(node);
        } else if dom.is_tag(node, "body") && body.is_none() {
            body = Some(node);
        } else if dom.text(node).is_some_and(|t| t.trim().is_empty())
            && dom.kind(node) == Some(NodeKind::Text)
        {
            dom.detach(node)?;
        } else {
            stray.push(node);
        }
    }

    let owner = dom.owner_document(html).unwrap_or(html);
    let head = match head {
        Some(head) => head,
        None => dom.create_element(owner, "head"),
    };
    let body = match body {
        Some(body) => body,
        None => dom.create_element(owner, "body"),
    };
    dom.append_child(html, head)?;
    dom.append_child(html, body)?;
    for node in stray {
        let before_body = dom.kind(node) == Some(NodeKind::Element)
            && dom
                .tag_name(node)
                .is_some_and(|tag| matches!(tag, "meta" | "title" | "base"));
        if before_body {
            dom.append_child(head, node)?;
        } else {
            dom.append_child(body, node)?;
        }
    }
    Ok(())
}

fn current(stack: &[NodeId]) -> Result<NodeId> {
    stack
        .last()
        .copied()
        .ok_or_else(|| Error::HtmlParse("missing parent element".into()))
}

fn close_optional_start_tag(dom: &Dom, stack: &mut Vec<NodeId>, tag: &str) {
    let closes: &[&str] = match tag {
        "li" => &["li"],
        "dt" | "dd" => &["dt", "dd"],
        "option" => &["option"],
        _ if is_optional_paragraph_terminator_tag(tag) => &["p"],
        _ => return,
    };
    let barrier: &[&str] = match tag {
        "li" => &["ul", "ol"],
        "dt" | "dd" => &["dl"],
        "option" => &["select", "datalist"],
        _ => &[],
    };
    for index in (1..stack.len()).rev() {
        let Some(open_tag) = dom.tag_name(stack[index]) else {
            continue;
        };
        if closes.contains(&open_tag) {
            stack.truncate(index);
            return;
        }
        if barrier.contains(&open_tag) {
            return;
        }
    }
}

fn is_optional_paragraph_terminator_tag(tag: &str) -> bool {
    matches!(
        tag,
        "address"
            | "article"
            | "aside"
            | "blockquote"
            | "details"
            | "div"
            | "dl"
            | "fieldset"
            | "figure"
            | "footer"
            | "form"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "header"
            | "hr"
            | "main"
            | "nav"
            | "ol"
            | "p"
            | "pre"
            | "section"
            | "table"
            | "ul"
    )
}

/// Byte cursor over markup. Every stop condition is an ASCII byte, so positions stay on
/// char boundaries.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str, pos: usize) -> Self {
        Self { src, pos }
    }

    fn peek(&self) -> Option<u8> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn at_self_close(&self) -> bool {
        self.peek() == Some(b'/') && self.peek_at(1) == Some(b'>')
    }

    fn skip_while(&mut self, keep: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&keep) {
            self.pos += 1;
        }
        self.src.get(start..self.pos).unwrap_or_default()
    }

    fn skip_ws(&mut self) {
        self.skip_while(|b| b.is_ascii_whitespace());
    }

    /// Up to whitespace, `>` or `/>`.
    fn skip_unquoted(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() || byte == b'>' || self.at_self_close() {
                break;
            }
            self.pos += 1;
        }
        self.src.get(start..self.pos).unwrap_or_default()
    }

    fn attr_value(&mut self) -> Result<String> {
        let raw = match self.peek() {
            None => return Err(Error::HtmlParse("missing attribute value".into())),
            Some(quote @ (b'"' | b'\'')) => {
                self.pos += 1;
                let value = self.skip_while(|b| b != quote);
                if self.at_end() {
                    return Err(Error::HtmlParse("unclosed quoted attribute value".into()));
                }
                self.pos += 1;
                value
            }
            Some(_) => self.skip_unquoted(),
        };
        Ok(decode_html_character_references(raw))
    }
}

struct StartTag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
    /// Offset just past the closing `>`.
    end: usize,
}

fn parse_start_tag(html: &str, at: usize) -> Result<StartTag> {
    let mut cursor = Cursor::new(html, at + 1);
    let name = cursor.skip_while(is_tag_char).to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::HtmlParse("empty tag name".into()));
    }
    let mut attrs: Vec<(String, String)> = Vec::new();
    loop {
        cursor.skip_ws();
        let self_closing = match cursor.peek() {
            None => return Err(Error::HtmlParse("unclosed start tag".into())),
            Some(b'>') => Some(false),
            _ if cursor.at_self_close() => Some(true),
            _ => None,
        };
        if let Some(self_closing) = self_closing {
            cursor.pos += if self_closing { 2 } else { 1 };
            return Ok(StartTag {
                name,
                attrs,
                self_closing,
                end: cursor.pos,
            });
        }
        if !cursor.peek().is_some_and(is_attr_name_char) {
            // Junk inside a tag is dropped up to the next separator.
            cursor.pos += 1;
            cursor.skip_unquoted();
            continue;
        }
        let key = cursor.skip_while(is_attr_name_char).to_ascii_lowercase();
        cursor.skip_ws();
        let value = if cursor.peek() == Some(b'=') {
            cursor.pos += 1;
            cursor.skip_ws();
            cursor.attr_value()?
        } else {
            String::new()
        };
        if !attrs.iter().any(|(known, _)| *known == key) {
            attrs.push((key, value));
        }
    }
}

/// Skips `<!...>` or `<?...>`, honoring quotes and `[...]` sections.
fn skip_declaration(html: &str, at: usize) -> Result<usize> {
    let mut quote = None;
    let mut brackets = 0usize;
    for (offset, byte) in html.bytes().enumerate().skip(at + 2) {
        match (quote, byte) {
            (Some(open), _) => {
                if byte == open {
                    quote = None;
                }
            }
            (None, b'\'' | b'"') => quote = Some(byte),
            (None, b'[') => brackets += 1,
            (None, b']') if brackets > 0 => brackets -= 1,
            (None, b'>') if brackets == 0 => return Ok(offset + 1),
            _ => {}
        }
    }
    Err(Error::HtmlParse("unclosed declaration tag".into()))
}

/// `</name ...>` at `at`; returns the lowercased name and the offset past `>`.
fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize)> {
    let mut cursor = Cursor::new(html, at + 2);
    cursor.skip_ws();
    let name = cursor.skip_while(is_tag_char).to_ascii_lowercase();
    cursor.skip_while(|b| b != b'>');
    if cursor.at_end() {
        return Err(Error::HtmlParse("unclosed end tag".into()));
    }
    Ok((name, cursor.pos + 1))
}

/// Offset of the `</tag` closing a raw text element, matched case-insensitively.
fn raw_text_end(html: &str, from: usize, tag: &str) -> Option<usize> {
    let bytes = html.as_bytes();
    let mut search = from;
    while let Some(offset) = html.get(search..)?.find("</") {
        let at = search + offset;
        let mut cursor = Cursor::new(html, at + 2);
        cursor.skip_ws();
        let name_end = cursor.pos + tag.len();
        let closes = bytes
            .get(cursor.pos..name_end)
            .is_some_and(|name| name.eq_ignore_ascii_case(tag.as_bytes()))
            && !bytes.get(name_end).is_some_and(u8::is_ascii_alphanumeric);
        if closes {
            return Some(at);
        }
        search = at + 2;
    }
    None
}

pub(crate) fn decode_html_character_references(src: &str) -> String {
    if !src.contains('&') {
        return src.to_string();
    }

    fn decode_numeric(value: &str) -> Option<char> {
        let codepoint =
            if let Some(hex) = value.strip_prefix('x').or_else(|| value.strip_prefix('X')) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                value.parse::<u32>().ok()?
            };
        char::from_u32(codepoint)
    }

    fn decode_named(value: &str) -> Option<char> {
        match value {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{00A0}'),
            "copy" => Some('©'),
            "reg" => Some('®'),
            "hellip" => Some('…'),
            _ => None,
        }
    }

    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let decoded = tail.find(';').and_then(|end| {
            let raw = &tail[..end];
            if raw.is_empty() || raw.len() > 10 || raw.contains('&') {
                return None;
            }
            let ch = match raw.strip_prefix('#') {
                Some(numeric) => decode_numeric(numeric),
                None => decode_named(raw),
            }?;
            Some((ch, end + 1))
        });
        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_tag_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn is_attr_name_char(b: u8) -> bool {
    !b.is_ascii_whitespace() && !matches!(b, b'>' | b'/' | b'=' | b'"' | b'\'' | b'<')
}
