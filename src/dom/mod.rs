//! In-memory document tree and the adapter seam the pipeline works
//! against. The pipeline never touches tree internals directly: selection
//! reads through [`TreeAdapter`], and all mutation goes through
//! [`TreeAdapter::replace_text`] / [`TreeAdapter::clear_annotations`].

pub mod apply;
pub mod sanitize;
pub mod select;

use std::collections::HashMap;

pub type NodeId = usize;

/// Attribute marking a replaced position so later selector passes skip it.
pub const PROCESSED_ATTR: &str = "data-rm-proc";

/// Stable reference to one text node. Any edit to the node bumps its
/// revision, so a handle taken before a mutation no longer validates and
/// the replace step degrades to a silent no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub id: NodeId,
    pub revision: u64,
}

#[derive(Clone, Debug, Default)]
pub struct StyleFlags {
    pub hidden: bool,
    pub display_none: bool,
    pub visibility_hidden: bool,
    pub opacity_zero: bool,
    pub zero_area: bool,
}

impl StyleFlags {
    pub fn hides(&self) -> bool {
        self.hidden || self.display_none || self.visibility_hidden || self.opacity_zero || self.zero_area
    }
}

#[derive(Clone, Debug)]
pub struct ElementData {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub style: StyleFlags,
    pub editable: bool,
}

impl ElementData {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            style: StyleFlags::default(),
            editable: false,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|v| v.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn is_processed(&self) -> bool {
        self.attr(PROCESSED_ATTR).is_some()
    }
}

/// Sanitized markup ready for insertion. Produced only by the sanitizer;
/// the tree accepts nothing else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkupNode {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<MarkupNode>,
    },
    Text(String),
}

impl MarkupNode {
    /// Concatenated text content, disregarding markup.
    pub fn text_content(nodes: &[MarkupNode]) -> String {
        let mut out = String::new();
        fn walk(node: &MarkupNode, out: &mut String) {
            match node {
                MarkupNode::Text(t) => out.push_str(t),
                MarkupNode::Element { children, .. } => {
                    for c in children {
                        walk(c, out);
                    }
                }
            }
        }
        for n in nodes {
            walk(n, &mut out);
        }
        out
    }
}

/// The capabilities the pipeline needs from a document tree: enumerate,
/// test visibility-relevant structure, replace, mark processed, restore.
pub trait TreeAdapter: Send + 'static {
    fn root(&self) -> NodeId;
    fn children(&self, id: NodeId) -> &[NodeId];
    fn element(&self, id: NodeId) -> Option<&ElementData>;
    fn text(&self, id: NodeId) -> Option<&str>;

    /// Handle for a currently attached text node.
    fn handle(&self, id: NodeId) -> Option<NodeHandle>;
    fn is_current(&self, handle: NodeHandle) -> bool;

    /// Swap the text node behind `handle` for a processed container holding
    /// `markup`, retaining the original text for later restoration. Returns
    /// false (and changes nothing) if the handle went stale.
    fn replace_text(&mut self, handle: NodeHandle, markup: &[MarkupNode]) -> bool;

    /// Original text retained for a processed container node.
    fn original_text(&self, id: NodeId) -> Option<&str>;

    /// Undo every replacement, restoring retained original text.
    fn clear_annotations(&mut self);
}

#[derive(Debug)]
enum NodeKind {
    Element(ElementData),
    Text(String),
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
    attached: bool,
    revision: u64,
}

/// Arena-backed tree used by the CLI and as the test double.
pub struct MemTree {
    nodes: Vec<Node>,
    root: NodeId,
    originals: HashMap<NodeId, String>,
}

impl MemTree {
    pub fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Element(ElementData::new("body")),
            attached: true,
            revision: 0,
        };
        Self {
            nodes: vec![root],
            root: 0,
            originals: HashMap::new(),
        }
    }

    /// One `<p>` per blank-line-separated block, one text node per line.
    pub fn from_plain_text(text: &str) -> Self {
        let mut tree = Self::new();
        let root = tree.root;
        for block in text.split("\n\n") {
            if block.trim().is_empty() {
                continue;
            }
            let p = tree.append_element(root, ElementData::new("p"));
            for line in block.lines() {
                tree.append_text(p, line);
            }
        }
        tree
    }

    fn push_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind,
            attached: true,
            revision: 0,
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn append_element(&mut self, parent: NodeId, data: ElementData) -> NodeId {
        self.push_node(parent, NodeKind::Element(data))
    }

    pub fn append_text(&mut self, parent: NodeId, text: impl Into<String>) -> NodeId {
        self.push_node(parent, NodeKind::Text(text.into()))
    }

    /// Edit a text node in place, invalidating outstanding handles.
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        if let NodeKind::Text(t) = &mut self.nodes[id].kind {
            *t = text.into();
            self.nodes[id].revision += 1;
        }
    }

    pub fn set_style(&mut self, id: NodeId, style: StyleFlags) {
        if let NodeKind::Element(el) = &mut self.nodes[id].kind {
            el.style = style;
        }
    }

    /// Detach a subtree, as a concurrent script removing content would.
    pub fn remove(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            self.nodes[parent].children.retain(|&c| c != id);
        }
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n].attached = false;
            self.nodes[n].revision += 1;
            stack.extend(self.nodes[n].children.iter().copied());
        }
    }

    fn insert_markup(&mut self, parent: NodeId, markup: &[MarkupNode]) {
        for node in markup {
            match node {
                MarkupNode::Text(t) => {
                    self.append_text(parent, t.clone());
                }
                MarkupNode::Element {
                    tag,
                    attrs,
                    children,
                } => {
                    let el = self.append_element(
                        parent,
                        ElementData {
                            tag: tag.clone(),
                            attrs: attrs.clone(),
                            style: StyleFlags::default(),
                            editable: false,
                        },
                    );
                    self.insert_markup(el, children);
                }
            }
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_node(self.root, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => escape_text_into(out, t),
            NodeKind::Element(el) => {
                out.push('<');
                out.push_str(&el.tag);
                for (k, v) in &el.attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    escape_attr_into(out, v);
                    out.push('"');
                }
                out.push('>');
                for &c in &self.nodes[id].children {
                    self.write_node(c, out);
                }
                out.push_str("</");
                out.push_str(&el.tag);
                out.push('>');
            }
        }
    }
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeAdapter for MemTree {
    fn root(&self) -> NodeId {
        self.root
    }

    fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            NodeKind::Text(_) => None,
        }
    }

    fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => Some(t.as_str()),
            NodeKind::Element(_) => None,
        }
    }

    fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        let node = self.nodes.get(id)?;
        if !node.attached || !matches!(node.kind, NodeKind::Text(_)) {
            return None;
        }
        Some(NodeHandle {
            id,
            revision: node.revision,
        })
    }

    fn is_current(&self, handle: NodeHandle) -> bool {
        self.nodes
            .get(handle.id)
            .map(|n| n.attached && n.revision == handle.revision)
            .unwrap_or(false)
    }

    fn replace_text(&mut self, handle: NodeHandle, markup: &[MarkupNode]) -> bool {
        if !self.is_current(handle) {
            return false;
        }
        let original = match &self.nodes[handle.id].kind {
            NodeKind::Text(t) => t.clone(),
            NodeKind::Element(_) => return false,
        };
        let Some(parent) = self.nodes[handle.id].parent else {
            return false;
        };

        let wrapper_id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Element(ElementData {
                tag: "span".to_string(),
                attrs: vec![(PROCESSED_ATTR.to_string(), "1".to_string())],
                style: StyleFlags::default(),
                editable: false,
            }),
            attached: true,
            revision: 0,
        });
        self.insert_markup(wrapper_id, markup);

        // Wrapper takes the text node's slot; the old node detaches.
        if let Some(slot) = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == handle.id)
        {
            self.nodes[parent].children[slot] = wrapper_id;
        } else {
            return false;
        }
        self.nodes[handle.id].attached = false;
        self.nodes[handle.id].revision += 1;
        self.originals.insert(wrapper_id, original);
        true
    }

    fn original_text(&self, id: NodeId) -> Option<&str> {
        self.originals.get(&id).map(|s| s.as_str())
    }

    fn clear_annotations(&mut self) {
        let wrappers: Vec<NodeId> = self.originals.keys().copied().collect();
        for wrapper in wrappers {
            if !self.nodes[wrapper].attached {
                self.originals.remove(&wrapper);
                continue;
            }
            let Some(parent) = self.nodes[wrapper].parent else {
                continue;
            };
            let original = self.originals.remove(&wrapper).unwrap_or_default();
            let restored = self.nodes.len();
            self.nodes.push(Node {
                parent: Some(parent),
                children: Vec::new(),
                kind: NodeKind::Text(original),
                attached: true,
                revision: 0,
            });
            if let Some(slot) = self.nodes[parent]
                .children
                .iter()
                .position(|&c| c == wrapper)
            {
                self.nodes[parent].children[slot] = restored;
            }
            let mut stack = vec![wrapper];
            while let Some(n) = stack.pop() {
                self.nodes[n].attached = false;
                self.nodes[n].revision += 1;
                stack.extend(self.nodes[n].children.iter().copied());
            }
        }
    }
}

fn escape_text_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attr_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruby(word: &str, reading: &str) -> MarkupNode {
        MarkupNode::Element {
            tag: "ruby".to_string(),
            attrs: vec![],
            children: vec![
                MarkupNode::Text(word.to_string()),
                MarkupNode::Element {
                    tag: "rt".to_string(),
                    attrs: vec![],
                    children: vec![MarkupNode::Text(reading.to_string())],
                },
            ],
        }
    }

    #[test]
    fn replace_swaps_slot_and_marks_processed() {
        let mut tree = MemTree::new();
        let root = tree.root();
        let p = tree.append_element(root, ElementData::new("p"));
        let before = tree.append_text(p, "前");
        let target = tree.append_text(p, "猫");
        let after = tree.append_text(p, "後");

        let handle = tree.handle(target).unwrap();
        assert!(tree.replace_text(handle, &[ruby("猫", "ねこ")]));

        let kids = tree.children(p).to_vec();
        assert_eq!(kids.len(), 3);
        assert_eq!(kids[0], before);
        assert_eq!(kids[2], after);
        let wrapper = tree.element(kids[1]).unwrap();
        assert!(wrapper.is_processed());
        assert_eq!(tree.original_text(kids[1]), Some("猫"));
        // Siblings untouched.
        assert_eq!(tree.text(before), Some("前"));
        assert_eq!(tree.text(after), Some("後"));
    }

    #[test]
    fn stale_handle_replace_is_silent_noop() {
        let mut tree = MemTree::new();
        let root = tree.root();
        let target = tree.append_text(root, "猫");
        let handle = tree.handle(target).unwrap();

        tree.set_text(target, "別の内容");
        assert!(!tree.replace_text(handle, &[ruby("猫", "ねこ")]));
        assert_eq!(tree.text(target), Some("別の内容"));

        let target2 = tree.append_text(root, "犬");
        let handle2 = tree.handle(target2).unwrap();
        tree.remove(target2);
        assert!(!tree.replace_text(handle2, &[ruby("犬", "いぬ")]));
    }

    #[test]
    fn clear_restores_original_text() {
        let mut tree = MemTree::new();
        let root = tree.root();
        let target = tree.append_text(root, "  鳥だ ");
        let handle = tree.handle(target).unwrap();
        assert!(tree.replace_text(handle, &[ruby("鳥", "とり")]));
        assert!(tree.to_html().contains("<rt>"));

        tree.clear_annotations();
        let html = tree.to_html();
        assert!(!html.contains("<rt>"));
        assert!(html.contains("  鳥だ "));
    }

    #[test]
    fn html_serializer_escapes_text_and_attrs() {
        let mut tree = MemTree::new();
        let root = tree.root();
        let mut el = ElementData::new("span");
        el.attrs.push(("class".to_string(), "a\"b".to_string()));
        let s = tree.append_element(root, el);
        tree.append_text(s, "1 < 2 & 3");
        assert_eq!(
            tree.to_html(),
            "<body><span class=\"a&quot;b\">1 &lt; 2 &amp; 3</span></body>"
        );
    }
}
