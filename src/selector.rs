use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorAttrCondition {
    Exists { key: String },
    Eq { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorPseudoClass {
    FirstChild,
    LastChild,
    Not(Vec<Vec<SelectorPart>>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SelectorStep {
    pub(crate) tag: Option<String>,
    pub(crate) universal: bool,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<SelectorAttrCondition>,
    pub(crate) pseudo_classes: Vec<SelectorPseudoClass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorCombinator {
    Descendant,
    Child,
    AdjacentSibling,
    GeneralSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectorPart {
    pub(crate) step: SelectorStep,
    // Relation to the previous (left) part.
    pub(crate) combinator: Option<SelectorCombinator>,
}

pub(crate) fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let groups = split_selector_groups(selector)?;
    let mut parsed = Vec::with_capacity(groups.len());
    for group in groups {
        parsed.push(parse_selector_chain(&group)?);
    }
    Ok(parsed)
}

pub(crate) fn matches_selector(dom: &Dom, node: NodeId, groups: &[Vec<SelectorPart>]) -> bool {
    groups.iter().any(|steps| matches_chain(dom, node, steps))
}

fn parse_selector_chain(selector: &str) -> Result<Vec<SelectorPart>> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    let tokens = tokenize_selector(selector)?;
    let mut steps = Vec::new();
    let mut pending: Option<SelectorCombinator> = None;

    for token in tokens {
        let combinator = match token.as_str() {
            ">" => Some(SelectorCombinator::Child),
            "+" => Some(SelectorCombinator::AdjacentSibling),
            "~" => Some(SelectorCombinator::GeneralSibling),
            _ => None,
        };
        if let Some(combinator) = combinator {
            if pending.is_some() || steps.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            pending = Some(combinator);
            continue;
        }

        let step = parse_selector_step(&token)?;
        let combinator = if steps.is_empty() {
            None
        } else {
            Some(pending.take().unwrap_or(SelectorCombinator::Descendant))
        };
        steps.push(SelectorPart { step, combinator });
    }

    if steps.is_empty() || pending.is_some() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    Ok(steps)
}

/// Splits on top-level `,` while tracking brackets and parentheses.
fn split_selector_groups(selector: &str) -> Result<Vec<String>> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for ch in selector.chars() {
        depth.track(ch, selector)?;
        if ch == ',' && depth.is_top() {
            let trimmed = current.trim();
            if trimmed.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            groups.push(trimmed.to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    depth.finish(selector)?;

    let trimmed = current.trim();
    if trimmed.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    groups.push(trimmed.to_string());
    Ok(groups)
}

fn tokenize_selector(selector: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for ch in selector.chars() {
        depth.track(ch, selector)?;
        match ch {
            '>' | '+' | '~' if depth.is_top() => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current.clear();
                tokens.push(ch.to_string());
            }
            ch if ch.is_ascii_whitespace() && depth.is_top() => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    depth.finish(selector)?;

    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }
    Ok(tokens)
}

#[derive(Default)]
struct Depth {
    bracket: usize,
    paren: usize,
    quote: Option<char>,
}

impl Depth {
    fn track(&mut self, ch: char, selector: &str) -> Result<()> {
        if let Some(quote) = self.quote {
            if ch == quote {
                self.quote = None;
            }
            return Ok(());
        }
        match ch {
            '"' | '\'' if self.bracket > 0 => self.quote = Some(ch),
            '[' => self.bracket += 1,
            ']' => {
                self.bracket = self
                    .bracket
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnsupportedSelector(selector.into()))?;
            }
            '(' => self.paren += 1,
            ')' => {
                self.paren = self
                    .paren
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnsupportedSelector(selector.into()))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn is_top(&self) -> bool {
        self.bracket == 0 && self.paren == 0 && self.quote.is_none()
    }

    fn finish(&self, selector: &str) -> Result<()> {
        if self.is_top() {
            Ok(())
        } else {
            Err(Error::UnsupportedSelector(selector.into()))
        }
    }
}

fn parse_selector_step(part: &str) -> Result<SelectorStep> {
    let part = part.trim();
    if part.is_empty() {
        return Err(Error::UnsupportedSelector(part.into()));
    }

    let bytes = part.as_bytes();
    let mut i = 0usize;
    let mut step = SelectorStep::default();

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if step.universal {
                    return Err(Error::UnsupportedSelector(part.into()));
                }
                step.universal = true;
                i += 1;
            }
            b'#' => {
                let Some((id, next)) = parse_selector_ident(part, i + 1) else {
                    return Err(Error::UnsupportedSelector(part.into()));
                };
                if step.id.replace(id).is_some() {
                    return Err(Error::UnsupportedSelector(part.into()));
                }
                i = next;
            }
            b'.' => {
                let Some((class_name, next)) = parse_selector_ident(part, i + 1) else {
                    return Err(Error::UnsupportedSelector(part.into()));
                };
                step.classes.push(class_name);
                i = next;
            }
            b'[' => {
                let (attr, next) = parse_selector_attr_condition(part, i)?;
                step.attrs.push(attr);
                i = next;
            }
            b':' => {
                let (pseudo, next) = parse_selector_pseudo(part, i)?;
                step.pseudo_classes.push(pseudo);
                i = next;
            }
            _ => {
                if step.tag.is_some()
                    || step.id.is_some()
                    || !step.classes.is_empty()
                    || step.universal
                {
                    return Err(Error::UnsupportedSelector(part.into()));
                }
                let Some((tag, next)) = parse_selector_ident(part, i) else {
                    return Err(Error::UnsupportedSelector(part.into()));
                };
                step.tag = Some(tag);
                i = next;
            }
        }
    }
    Ok(step)
}

fn parse_selector_pseudo(part: &str, start: usize) -> Result<(SelectorPseudoClass, usize)> {
    let tail = part
        .get(start + 1..)
        .ok_or_else(|| Error::UnsupportedSelector(part.into()))?;
    if tail.starts_with("first-child") {
        return Ok((SelectorPseudoClass::FirstChild, start + 1 + "first-child".len()));
    }
    if tail.starts_with("last-child") {
        return Ok((SelectorPseudoClass::LastChild, start + 1 + "last-child".len()));
    }
    if let Some(body) = tail.strip_prefix("not(") {
        let mut depth = 1usize;
        for (offset, ch) in body.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = parse_selector_groups(&body[..offset])?;
                        let end = start + 1 + "not(".len() + offset + 1;
                        return Ok((SelectorPseudoClass::Not(inner), end));
                    }
                }
                _ => {}
            }
        }
    }
    Err(Error::UnsupportedSelector(part.into()))
}

fn parse_selector_ident(src: &str, start: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    if start >= bytes.len() || !is_selector_ident_char(bytes[start]) {
        return None;
    }
    let mut end = start + 1;
    while end < bytes.len() && is_selector_ident_char(bytes[end]) {
        end += 1;
    }
    Some((src.get(start..end)?.to_string(), end))
}

fn is_selector_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// `[key]` or `[key=value]` starting at `open_bracket`; quoted values may contain `]`.
fn parse_selector_attr_condition(
    src: &str,
    open_bracket: usize,
) -> Result<(SelectorAttrCondition, usize)> {
    let unsupported = || Error::UnsupportedSelector(src.into());
    let inner = src.get(open_bracket + 1..).ok_or_else(unsupported)?;
    let mut quote = None;
    let close = inner
        .char_indices()
        .find(|&(_, ch)| match quote {
            Some(open) => {
                if ch == open {
                    quote = None;
                }
                false
            }
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                false
            }
            None => ch == ']',
        })
        .map(|(offset, _)| offset)
        .ok_or_else(unsupported)?;
    let body = inner[..close].trim();
    if body.is_empty() {
        return Err(unsupported());
    }
    let condition = match body.split_once('=') {
        Some((key, value)) => {
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(unsupported());
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| value.strip_prefix(*q).and_then(|rest| rest.strip_suffix(*q)))
                .unwrap_or(value);
            SelectorAttrCondition::Eq {
                key,
                value: unquoted.to_string(),
            }
        }
        None => SelectorAttrCondition::Exists {
            key: body.to_ascii_lowercase(),
        },
    };
    Ok((condition, open_bracket + 1 + close + 1))
}

/// Right-to-left match: each part to the left must be reachable from the node matched
/// so far through that part's combinator.
fn matches_chain(dom: &Dom, node: NodeId, steps: &[SelectorPart]) -> bool {
    let Some((last, rest)) = steps.split_last() else {
        return false;
    };
    if !matches_step(dom, node, &last.step) {
        return false;
    }
    let mut current = node;
    let mut combinator = last.combinator;
    for part in rest.iter().rev() {
        let wanted = &part.step;
        let found = match combinator.unwrap_or(SelectorCombinator::Descendant) {
            SelectorCombinator::Child => dom.parent(current).filter(|n| matches_step(dom, *n, wanted)),
            SelectorCombinator::AdjacentSibling => {
                previous_element_sibling(dom, current).filter(|n| matches_step(dom, *n, wanted))
            }
            SelectorCombinator::Descendant => {
                std::iter::successors(dom.parent(current), |n| dom.parent(*n))
                    .find(|n| matches_step(dom, *n, wanted))
            }
            SelectorCombinator::GeneralSibling => {
                std::iter::successors(previous_element_sibling(dom, current), |n| {
                    previous_element_sibling(dom, *n)
                })
                .find(|n| matches_step(dom, *n, wanted))
            }
        };
        let Some(found) = found else {
            return false;
        };
        current = found;
        combinator = part.combinator;
    }
    true
}

fn matches_step(dom: &Dom, node: NodeId, step: &SelectorStep) -> bool {
    let Some(element) = dom.element(node) else {
        return false;
    };

    if let Some(tag) = &step.tag {
        if !element.tag_name.eq_ignore_ascii_case(tag) {
            return false;
        }
    }

    if let Some(id) = &step.id {
        if element.attr("id") != Some(id.as_str()) {
            return false;
        }
    }

    let classes = element.attr("class").unwrap_or_default();
    if step
        .classes
        .iter()
        .any(|class_name| !classes.split_whitespace().any(|c| c == class_name))
    {
        return false;
    }

    for cond in &step.attrs {
        let matched = match cond {
            SelectorAttrCondition::Exists { key } => element.attr(key).is_some(),
            SelectorAttrCondition::Eq { key, value } => element.attr(key) == Some(value.as_str()),
        };
        if !matched {
            return false;
        }
    }

    step.pseudo_classes.iter().all(|pseudo| match pseudo {
        SelectorPseudoClass::FirstChild => previous_element_sibling(dom, node).is_none(),
        SelectorPseudoClass::LastChild => next_element_sibling(dom, node).is_none(),
        SelectorPseudoClass::Not(inner) => !matches_selector(dom, node, inner),
    })
}

fn sibling_elements(dom: &Dom, node: NodeId) -> Vec<NodeId> {
    dom.parent(node)
        .map(|parent| dom.element_children(parent))
        .unwrap_or_default()
}

fn previous_element_sibling(dom: &Dom, node: NodeId) -> Option<NodeId> {
    let siblings = sibling_elements(dom, node);
    let pos = siblings.iter().position(|id| *id == node)?;
    pos.checked_sub(1).map(|idx| siblings[idx])
}

fn next_element_sibling(dom: &Dom, node: NodeId) -> Option<NodeId> {
    let siblings = sibling_elements(dom, node);
    let pos = siblings.iter().position(|id| *id == node)?;
    siblings.get(pos + 1).copied()
}
