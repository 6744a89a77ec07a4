//! Fragment selection: a lazy, restartable walk over the tree yielding the
//! text runs worth annotating, with every rejection visible as a typed skip.

use std::collections::HashSet;

use crate::dom::{ElementData, NodeHandle, NodeId, TreeAdapter};
use crate::textutil;

#[derive(Clone, Debug)]
pub struct Fragment {
    pub handle: NodeHandle,
    pub text: String,
}

/// Filter outcomes. These are not errors; they exist so tests and stats can
/// see why a node was passed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Denylisted,
    Editable,
    AlreadyProcessed,
    SiteExcluded,
    Hidden,
    NotEligible,
}

#[derive(Clone, Debug)]
pub enum Selected {
    Fragment(Fragment),
    Skip(NodeId, SkipReason),
}

/// Site-specific region exclusion: every populated field must match.
#[derive(Clone, Debug, Default)]
pub struct SiteRule {
    pub tag: Option<String>,
    pub class: Option<String>,
    pub attr: Option<String>,
}

impl SiteRule {
    fn matches(&self, el: &ElementData) -> bool {
        if self.tag.is_none() && self.class.is_none() && self.attr.is_none() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !el.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(class) = &self.class {
            if !el.has_class(class) {
                return false;
            }
        }
        if let Some(attr) = &self.attr {
            if el.attr(attr).is_none() {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug)]
pub struct ExclusionPolicy {
    pub tag_denylist: HashSet<String>,
    pub skip_editable: bool,
    pub require_visible: bool,
    pub site_rules: Vec<SiteRule>,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        let tag_denylist = [
            "script", "style", "noscript", "iframe", "svg", "textarea", "input", "select",
            "ruby", "rt",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self {
            tag_denylist,
            skip_editable: true,
            require_visible: true,
            site_rules: Vec::new(),
        }
    }
}

impl ExclusionPolicy {
    fn element_skip(&self, el: &ElementData) -> Option<SkipReason> {
        if el.is_processed() {
            return Some(SkipReason::AlreadyProcessed);
        }
        if self.tag_denylist.contains(&el.tag.to_ascii_lowercase()) {
            return Some(SkipReason::Denylisted);
        }
        if self.skip_editable && el.editable {
            return Some(SkipReason::Editable);
        }
        if self.site_rules.iter().any(|r| r.matches(el)) {
            return Some(SkipReason::SiteExcluded);
        }
        if self.require_visible && el.style.hides() {
            return Some(SkipReason::Hidden);
        }
        None
    }
}

/// Depth-first, document-order walk. An excluded element yields one skip and
/// is not descended into, so a hidden or denylisted ancestor silences its
/// whole subtree.
pub struct FragmentIter<'a, A: TreeAdapter> {
    tree: &'a A,
    policy: &'a ExclusionPolicy,
    stack: Vec<NodeId>,
}

impl<'a, A: TreeAdapter> Iterator for FragmentIter<'a, A> {
    type Item = Selected;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if let Some(el) = self.tree.element(id) {
                if let Some(reason) = self.policy.element_skip(el) {
                    return Some(Selected::Skip(id, reason));
                }
                for &child in self.tree.children(id).iter().rev() {
                    self.stack.push(child);
                }
                continue;
            }
            let Some(text) = self.tree.text(id) else {
                continue;
            };
            if !textutil::is_eligible_text(text) {
                return Some(Selected::Skip(id, SkipReason::NotEligible));
            }
            // An unreachable handle (node already detached) yields nothing.
            let Some(handle) = self.tree.handle(id) else {
                continue;
            };
            return Some(Selected::Fragment(Fragment {
                handle,
                text: text.to_string(),
            }));
        }
        None
    }
}

pub fn select<'a, A: TreeAdapter>(
    tree: &'a A,
    policy: &'a ExclusionPolicy,
    root: NodeId,
) -> FragmentIter<'a, A> {
    FragmentIter {
        tree,
        policy,
        stack: vec![root],
    }
}

/// Only the fragments, skips dropped.
pub fn eligible<'a, A: TreeAdapter>(
    tree: &'a A,
    policy: &'a ExclusionPolicy,
    root: NodeId,
) -> impl Iterator<Item = Fragment> + 'a {
    select(tree, policy, root).filter_map(|s| match s {
        Selected::Fragment(f) => Some(f),
        Selected::Skip(..) => None,
    })
}
