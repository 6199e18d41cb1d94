use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Public summary of what a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    ShadowRoot,
    Element,
    Text,
    Comment,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeType {
    Document { url: String },
    ShadowRoot { host: NodeId },
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub(crate) tag_name: String,
    pub(crate) attrs: Vec<(String, String)>,
}

impl Element {
    pub(crate) fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Listener {
    pub(crate) event_type: String,
    pub(crate) handler: FnId,
    pub(crate) capture: bool,
}

/// Element effect recorded by the patcher: the node reports the guest's virtual document
/// as its owner and the guest location as its base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElementPatch {
    pub(crate) app: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) node_type: NodeType,
    pub(crate) owner: Option<NodeId>,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) patch: Option<ElementPatch>,
}

/// One node arena for every document the host page knows: the host document, each
/// execution context document, each degrade document and each shadow subtree.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dom {
    pub(crate) nodes: Vec<Node>,
    /// iframe element -> its content document.
    pub(crate) content_documents: HashMap<NodeId, NodeId>,
}

impl Dom {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn create_node(&mut self, node_type: NodeType, owner: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            node_type,
            owner,
            listeners: Vec::new(),
            patch: None,
        });
        id
    }

    pub(crate) fn is_valid(&self, node: NodeId) -> bool {
        node.0 < self.nodes.len()
    }

    fn node(&self, node: NodeId) -> Result<&Node> {
        self.nodes
            .get(node.0)
            .ok_or_else(|| Error::DomOperation(format!("unknown node {}", node.0)))
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(node.0)
            .ok_or_else(|| Error::DomOperation(format!("unknown node {}", node.0)))
    }

    /// Creates an empty document node with no children.
    pub(crate) fn create_document(&mut self, url: &str) -> NodeId {
        self.create_node(
            NodeType::Document {
                url: url.to_string(),
            },
            None,
        )
    }

    /// Creates `<html><head></head><body></body></html>` under a fresh document.
    pub(crate) fn create_html_document(&mut self, url: &str) -> Result<NodeId> {
        let document = self.create_document(url);
        let html = self.create_element(document, "html");
        let head = self.create_element(document, "head");
        let body = self.create_element(document, "body");
        self.append_child(html, head)?;
        self.append_child(html, body)?;
        self.append_child(document, html)?;
        Ok(document)
    }

    pub(crate) fn create_element(&mut self, owner: NodeId, tag_name: &str) -> NodeId {
        self.create_node(
            NodeType::Element(Element {
                tag_name: tag_name.to_ascii_lowercase(),
                attrs: Vec::new(),
            }),
            Some(owner),
        )
    }

    pub(crate) fn create_element_with_attrs(
        &mut self,
        owner: NodeId,
        tag_name: &str,
        attrs: Vec<(String, String)>,
    ) -> NodeId {
        self.create_node(
            NodeType::Element(Element {
                tag_name: tag_name.to_ascii_lowercase(),
                attrs,
            }),
            Some(owner),
        )
    }

    pub(crate) fn create_text(&mut self, owner: NodeId, text: &str) -> NodeId {
        self.create_node(NodeType::Text(text.to_string()), Some(owner))
    }

    pub(crate) fn create_comment(&mut self, owner: NodeId, text: &str) -> NodeId {
        self.create_node(NodeType::Comment(text.to_string()), Some(owner))
    }

    pub(crate) fn attach_shadow(&mut self, host: NodeId) -> Result<NodeId> {
        if self.element(host).is_none() {
            return Err(Error::DomOperation("attachShadow target is not an element".into()));
        }
        let owner = self.owner_document(host);
        let shadow = self.create_node(NodeType::ShadowRoot { host }, owner);
        Ok(shadow)
    }

    pub(crate) fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(node.0).map(|n| match n.node_type {
            NodeType::Document { .. } => NodeKind::Document,
            NodeType::ShadowRoot { .. } => NodeKind::ShadowRoot,
            NodeType::Element(_) => NodeKind::Element,
            NodeType::Text(_) => NodeKind::Text,
            NodeType::Comment(_) => NodeKind::Comment,
        })
    }

    pub(crate) fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes.get(node.0)?.node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(node.0)?.node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|e| e.tag_name.as_str())
    }

    pub(crate) fn is_tag(&self, node: NodeId, tag: &str) -> bool {
        self.tag_name(node)
            .is_some_and(|name| name.eq_ignore_ascii_case(tag))
    }

    pub(crate) fn attr(&self, node: NodeId, name: &str) -> Option<String> {
        self.element(node)
            .and_then(|element| element.attr(name))
            .map(ToOwned::to_owned)
    }

    pub(crate) fn has_attr(&self, node: NodeId, name: &str) -> bool {
        self.element(node)
            .is_some_and(|element| element.attr(name).is_some())
    }

    pub(crate) fn set_attr(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let element = self
            .element_mut(node)
            .ok_or_else(|| Error::DomOperation("setAttribute target is not an element".into()))?;
        let name = name.to_ascii_lowercase();
        if let Some(entry) = element.attrs.iter_mut().find(|(key, _)| *key == name) {
            entry.1 = value.to_string();
        } else {
            element.attrs.push((name, value.to_string()));
        }
        Ok(())
    }

    pub(crate) fn remove_attr(&mut self, node: NodeId, name: &str) -> Result<()> {
        let element = self.element_mut(node).ok_or_else(|| {
            Error::DomOperation("removeAttribute target is not an element".into())
        })?;
        element.attrs.retain(|(key, _)| key != name);
        Ok(())
    }

    pub(crate) fn attrs(&self, node: NodeId) -> Vec<(String, String)> {
        self.element(node)
            .map(|element| element.attrs.clone())
            .unwrap_or_default()
    }

    pub(crate) fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0)?.parent
    }

    pub(crate) fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node.0)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub(crate) fn element_children(&self, node: NodeId) -> Vec<NodeId> {
        self.children(node)
            .into_iter()
            .filter(|child| self.element(*child).is_some())
            .collect()
    }

    pub(crate) fn first_element_child(&self, node: NodeId) -> Option<NodeId> {
        self.element_children(node).into_iter().next()
    }

    pub(crate) fn child_by_tag(&self, node: NodeId, tag: &str) -> Option<NodeId> {
        self.element_children(node)
            .into_iter()
            .find(|child| self.is_tag(*child, tag))
    }

    pub(crate) fn text(&self, node: NodeId) -> Option<&str> {
        match &self.nodes.get(node.0)?.node_type {
            NodeType::Text(text) | NodeType::Comment(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub(crate) fn text_content(&self, node: NodeId) -> String {
        let Some(entry) = self.nodes.get(node.0) else {
            return String::new();
        };
        match &entry.node_type {
            NodeType::Text(text) => text.clone(),
            NodeType::Comment(_) => String::new(),
            _ => stacker::maybe_grow(64 * 1024, 1024 * 1024, || {
                entry
                    .children
                    .iter()
                    .map(|child| self.text_content(*child))
                    .collect()
            }),
        }
    }

    pub(crate) fn set_text_content(&mut self, node: NodeId, value: &str) -> Result<()> {
        if let Some(NodeType::Text(text)) = self.nodes.get_mut(node.0).map(|n| &mut n.node_type)
        {
            *text = value.to_string();
            return Ok(());
        }
        if self.element(node).is_none() {
            return Err(Error::DomOperation(
                "textContent target is not an element".into(),
            ));
        }
        self.clear_children(node)?;
        if !value.is_empty() {
            let owner = self.owner_document(node).unwrap_or(node);
            let text = self.create_text(owner, value);
            self.append_child(node, text)?;
        }
        Ok(())
    }

    fn can_have_children(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(node.0).map(|n| &n.node_type),
            Some(NodeType::Document { .. } | NodeType::ShadowRoot { .. } | NodeType::Element(_))
        )
    }

    /// Detaches `child` from its current parent, if any.
    pub(crate) fn detach(&mut self, child: NodeId) -> Result<()> {
        if let Some(old_parent) = self.parent(child) {
            self.node_mut(old_parent)?.children.retain(|id| *id != child);
            self.node_mut(child)?.parent = None;
        }
        Ok(())
    }

    fn check_insertion(&self, parent: NodeId, child: NodeId, op: &str) -> Result<()> {
        if !self.can_have_children(parent) {
            return Err(Error::DomOperation(format!(
                "{op} target cannot have children"
            )));
        }
        if !self.is_valid(child) || child == parent {
            return Err(Error::DomOperation(format!("invalid {op} node")));
        }
        if matches!(
            self.node(child)?.node_type,
            NodeType::Document { .. } | NodeType::ShadowRoot { .. }
        ) {
            return Err(Error::DomOperation(format!("{op} cannot move a root node")));
        }
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(Error::DomOperation(format!("{op} would create a cycle")));
            }
            cursor = self.parent(node);
        }
        Ok(())
    }

    pub(crate) fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_insertion(parent, child, "appendChild")?;
        self.detach(child)?;
        self.node_mut(child)?.parent = Some(parent);
        self.node_mut(parent)?.children.push(child);
        self.adopt(child, parent);
        Ok(())
    }

    /// `insertBefore`; a missing reference appends.
    pub(crate) fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<()> {
        let Some(reference) = reference else {
            return self.append_child(parent, child);
        };
        self.check_insertion(parent, child, "insertBefore")?;
        if self.parent(reference) != Some(parent) {
            return Err(Error::DomOperation(
                "insertBefore reference is not a direct child".into(),
            ));
        }
        if child == reference {
            return Ok(());
        }
        self.detach(child)?;
        let index = self
            .node(parent)?
            .children
            .iter()
            .position(|id| *id == reference)
            .ok_or_else(|| Error::DomOperation("insertBefore reference is missing".into()))?;
        self.node_mut(child)?.parent = Some(parent);
        self.node_mut(parent)?.children.insert(index, child);
        self.adopt(child, parent);
        Ok(())
    }

    pub(crate) fn prepend_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let first = self.node(parent)?.children.first().copied();
        self.insert_before(parent, child, first)
    }

    pub(crate) fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if self.parent(child) != Some(parent) {
            return Err(Error::DomOperation(
                "removeChild target is not a direct child".into(),
            ));
        }
        self.detach(child)
    }

    pub(crate) fn clear_children(&mut self, node: NodeId) -> Result<()> {
        let children = std::mem::take(&mut self.node_mut(node)?.children);
        for child in children {
            self.node_mut(child)?.parent = None;
        }
        Ok(())
    }

    /// Updates the owner document of a freshly inserted subtree.
    fn adopt(&mut self, child: NodeId, parent: NodeId) {
        let Some(owner) = self.owner_document(parent) else {
            return;
        };
        let mut stack = vec![child];
        while let Some(node) = stack.pop() {
            if let Some(entry) = self.nodes.get_mut(node.0) {
                entry.owner = Some(owner);
                stack.extend(entry.children.iter().copied());
            }
        }
    }

    /// The platform owner document: the document itself for a document node, otherwise
    /// the document that created or last adopted the node.
    pub(crate) fn owner_document(&self, node: NodeId) -> Option<NodeId> {
        let entry = self.nodes.get(node.0)?;
        match entry.node_type {
            NodeType::Document { .. } => Some(node),
            _ => entry.owner,
        }
    }

    pub(crate) fn document_url(&self, document: NodeId) -> Option<&str> {
        match &self.nodes.get(document.0)?.node_type {
            NodeType::Document { url } => Some(url.as_str()),
            _ => None,
        }
    }

    pub(crate) fn set_document_url(&mut self, document: NodeId, next: &str) -> Result<()> {
        match &mut self.node_mut(document)?.node_type {
            NodeType::Document { url } => {
                *url = next.to_string();
                Ok(())
            }
            _ => Err(Error::DomOperation("target is not a document".into())),
        }
    }

    /// Walks parents up to the topmost ancestor (a document, a shadow root, or the root
    /// of a detached subtree).
    pub(crate) fn root_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    pub(crate) fn shadow_host(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes.get(node.0)?.node_type {
            NodeType::ShadowRoot { host } => Some(host),
            _ => None,
        }
    }

    /// Inclusive containment.
    pub(crate) fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    /// Connected to a document, crossing shadow boundaries through their hosts.
    pub(crate) fn is_connected(&self, node: NodeId) -> bool {
        let mut current = node;
        loop {
            let root = self.root_of(current);
            match self.nodes.get(root.0).map(|n| &n.node_type) {
                Some(NodeType::Document { .. }) => return true,
                Some(NodeType::ShadowRoot { host }) => current = *host,
                _ => return false,
            }
        }
    }

    pub(crate) fn collect_elements(&self, root: NodeId, out: &mut Vec<NodeId>) {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || {
            for child in self.children(root) {
                if self.element(child).is_some() {
                    out.push(child);
                }
                self.collect_elements(child, out);
            }
        });
    }

    pub(crate) fn descendants_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let mut all = Vec::new();
        self.collect_elements(root, &mut all);
        all.into_iter().filter(|node| self.is_tag(*node, tag)).collect()
    }

    pub(crate) fn query_selector_all_from(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;
        let mut all = Vec::new();
        self.collect_elements(root, &mut all);
        let mut seen = HashSet::new();
        Ok(all
            .into_iter()
            .filter(|node| matches_selector(self, *node, &groups) && seen.insert(*node))
            .collect())
    }

    pub(crate) fn query_selector_from(&self, root: NodeId, selector: &str) -> Result<Option<NodeId>> {
        Ok(self.query_selector_all_from(root, selector)?.into_iter().next())
    }

    pub(crate) fn add_listener(&mut self, node: NodeId, listener: Listener) -> Result<()> {
        let entry = self.node_mut(node)?;
        if !entry.listeners.contains(&listener) {
            entry.listeners.push(listener);
        }
        Ok(())
    }

    pub(crate) fn remove_listener(&mut self, node: NodeId, event_type: &str, handler: FnId) -> Result<()> {
        self.node_mut(node)?
            .listeners
            .retain(|listener| !(listener.event_type == event_type && listener.handler == handler));
        Ok(())
    }

    pub(crate) fn all_listeners(&self, node: NodeId) -> Vec<Listener> {
        self.nodes
            .get(node.0)
            .map(|n| n.listeners.clone())
            .unwrap_or_default()
    }

    pub(crate) fn listeners(&self, node: NodeId, event_type: &str) -> Vec<FnId> {
        self.nodes
            .get(node.0)
            .map(|n| {
                n.listeners
                    .iter()
                    .filter(|listener| listener.event_type == event_type)
                    .map(|listener| listener.handler)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn set_patch(&mut self, node: NodeId, patch: ElementPatch) -> Result<()> {
        self.node_mut(node)?.patch = Some(patch);
        Ok(())
    }

    pub(crate) fn patch(&self, node: NodeId) -> Option<&ElementPatch> {
        self.nodes.get(node.0)?.patch.as_ref()
    }

    pub(crate) fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_node(node, &mut out);
        out
    }

    pub(crate) fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(node) {
            self.write_node(child, &mut out);
        }
        out
    }

    fn write_node(&self, node: NodeId, out: &mut String) {
        let Some(entry) = self.nodes.get(node.0) else {
            return;
        };
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || match &entry.node_type {
            NodeType::Document { .. } | NodeType::ShadowRoot { .. } => {
                for child in &entry.children {
                    self.write_node(*child, out);
                }
            }
            NodeType::Text(text) => {
                let raw_parent = entry
                    .parent
                    .and_then(|parent| self.tag_name(parent))
                    .is_some_and(is_raw_text_tag);
                if raw_parent {
                    out.push_str(text);
                } else {
                    out.push_str(&escape_text(text));
                }
            }
            NodeType::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeType::Element(element) => {
                out.push('<');
                out.push_str(&element.tag_name);
                for (key, value) in &element.attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if is_void_tag(&element.tag_name) {
                    return;
                }
                for child in &entry.children {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
            }
        });
    }
}

pub(crate) fn is_raw_text_tag(tag: &str) -> bool {
    matches!(tag, "script" | "style" | "textarea" | "title" | "noscript")
}

pub(crate) fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag,
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
