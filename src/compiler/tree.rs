//! Detection option trees.
//!
//! Every pattern state in a search engine owns a tree describing the
//! residual checks of all rules that inserted that pattern. Rules
//! agreeing on a prefix of options share the prefix nodes; the leaves
//! carry rule identities. After every rule is inserted, trees are
//! finalized into a snapshot-wide table that hash-conses structurally
//! equal subtrees into a single canonical node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{CompileError, Result};
use crate::mpse::MpseKind;
use crate::rules::options::{DetectionOption, EvalFn, OptionId, RuleOptionKind};
use crate::rules::pattern::Pmx;
use crate::rules::{RuleId, RuleSet, SigId};

/// Index of a canonical node in the snapshot's [`DotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DotNodeId(u32);

impl DotNodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub enum NodeData {
    /// Inner node: the interned option to evaluate.
    Option(Arc<DetectionOption>),
    /// Leaf node: the rule this path proves.
    Rule(RuleId),
}

/// Mutable tree node used while rules are being inserted.
pub struct BuildNode {
    pub kind: RuleOptionKind,
    pub data: NodeData,
    pub eval: Option<EvalFn>,
    pub is_relative: bool,
    pub children: Vec<BuildNode>,
    pub relative_children: u32,
}

impl std::fmt::Debug for BuildNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildNode")
            .field("kind", &self.kind)
            .field("data", &self.data)
            .field("is_relative", &self.is_relative)
            .field("children", &self.children)
            .field("relative_children", &self.relative_children)
            .finish()
    }
}

impl BuildNode {
    fn from_option(opt: &Arc<DetectionOption>) -> Self {
        Self {
            kind: opt.kind,
            data: NodeData::Option(opt.clone()),
            eval: Some(opt.evaluator()),
            is_relative: opt.is_relative,
            children: Vec::new(),
            relative_children: 0,
        }
    }

    fn leaf(rule: RuleId) -> Self {
        Self {
            kind: RuleOptionKind::Leaf,
            data: NodeData::Rule(rule),
            eval: None,
            is_relative: false,
            children: Vec::new(),
            relative_children: 0,
        }
    }

    /// Same option identity; leaves never match an option.
    fn matches(&self, opt: &DetectionOption) -> bool {
        match &self.data {
            NodeData::Option(o) => o.id == opt.id,
            NodeData::Rule(_) => false,
        }
    }
}

/// Tree under construction for one pattern state.
#[derive(Debug)]
pub struct BuildRoot {
    /// Primary signature this tree was rooted for.
    pub rule: RuleId,
    pub children: Vec<BuildNode>,
}

impl BuildRoot {
    pub fn new(rule: RuleId) -> Self {
        Self {
            rule,
            children: Vec::new(),
        }
    }
}

/// True when no existing leaf sibling already proves this signature.
fn new_sig(children: &[BuildNode], sig: SigId, rules: &RuleSet) -> bool {
    !children.iter().any(|c| match c.data {
        NodeData::Rule(r) => c.kind == RuleOptionKind::Leaf && rules.get(r).sig == sig,
        _ => false,
    })
}

/// Merge one rule's residual option sequence into a tree.
///
/// Walks the rule's options in order, descending into a matching child
/// where one exists and appending a new child otherwise. A leaf is
/// appended when the walk created any node, or when no leaf sibling
/// carries the same `(gid, sid, rev)`.
pub fn insert_rule(root: &mut BuildRoot, rules: &RuleSet, rule_id: RuleId, kind: MpseKind) {
    let rule = rules.get(rule_id);
    let fp_only = rule.fp_only(kind);
    let sig = rule.sig;

    let opts: Vec<&Arc<DetectionOption>> = rule
        .options
        .iter()
        .filter(|o| o.kind != RuleOptionKind::Leaf)
        .filter(|o| fp_only != Some(o.id))
        .collect();

    let mut iter = opts.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => {
            // No residual options: the leaf hangs directly off the root.
            if root.children.is_empty() || new_sig(&root.children, sig, rules) {
                root.children.push(BuildNode::leaf(rule_id));
            }
            return;
        }
    };

    let mut need_leaf = false;

    let idx = match root.children.iter().position(|c| c.matches(first)) {
        Some(i) => i,
        None => {
            root.children.push(BuildNode::from_option(first));
            need_leaf = true;
            root.children.len() - 1
        }
    };
    let mut node = &mut root.children[idx];

    for opt in iter {
        let idx = match node.children.iter().position(|c| c.matches(opt)) {
            Some(i) => i,
            None => {
                let child = BuildNode::from_option(opt);
                if child.is_relative {
                    node.relative_children += 1;
                }
                node.children.push(child);
                need_leaf = true;
                node.children.len() - 1
            }
        };
        let parent = node;
        node = &mut parent.children[idx];
    }

    if !need_leaf {
        need_leaf = new_sig(&node.children, sig, rules);
    }
    if need_leaf {
        node.children.push(BuildNode::leaf(rule_id));
    }
}

/// Canonical, finalized tree node.
pub struct DotNode {
    pub kind: RuleOptionKind,
    pub option: Option<Arc<DetectionOption>>,
    pub rule: Option<RuleId>,
    pub eval: Option<EvalFn>,
    pub is_relative: bool,
    pub children: Vec<DotNodeId>,
    pub relative_children: u32,
    /// Short-circuit target: the unique leaf rule of an unbranched
    /// subtree, filled in by [`DotTable::fixup`].
    pub otn: Option<RuleId>,
}

impl std::fmt::Debug for DotNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotNode")
            .field("kind", &self.kind)
            .field("option", &self.option.as_ref().map(|o| o.id))
            .field("rule", &self.rule)
            .field("is_relative", &self.is_relative)
            .field("children", &self.children)
            .field("relative_children", &self.relative_children)
            .field("otn", &self.otn)
            .finish()
    }
}

/// Finalized tree for one pattern state or one no-fast-pattern list.
#[derive(Debug, Clone)]
pub struct DotRoot {
    pub rule: RuleId,
    pub children: Vec<DotNodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyData {
    Option(OptionId),
    Rule(RuleId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    data: KeyData,
    is_relative: bool,
    children: Vec<DotNodeId>,
}

/// Snapshot-scoped node arena and structural hash-cons index.
#[derive(Debug, Default)]
pub struct DotTable {
    nodes: Vec<DotNode>,
    index: HashMap<NodeKey, DotNodeId>,
    top: HashSet<DotNodeId>,
}

impl DotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: DotNodeId) -> &DotNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Intern a subtree bottom-up. Structurally equal subtrees collapse
    /// into the canonical node already in the table.
    fn intern(&mut self, node: BuildNode) -> DotNodeId {
        let BuildNode {
            kind,
            data,
            eval,
            is_relative,
            children,
            relative_children,
        } = node;

        let child_ids: Vec<DotNodeId> = children.into_iter().map(|c| self.intern(c)).collect();

        let key = NodeKey {
            data: match &data {
                NodeData::Option(o) => KeyData::Option(o.id),
                NodeData::Rule(r) => KeyData::Rule(*r),
            },
            is_relative,
            children: child_ids.clone(),
        };

        if let Some(&id) = self.index.get(&key) {
            return id;
        }

        let (option, rule) = match data {
            NodeData::Option(o) => (Some(o), None),
            NodeData::Rule(r) => (None, Some(r)),
        };

        let id = DotNodeId(self.nodes.len() as u32);
        self.nodes.push(DotNode {
            kind,
            option,
            rule,
            eval,
            is_relative,
            children: child_ids,
            relative_children,
            otn: None,
        });
        self.index.insert(key, id);
        id
    }

    /// Finalize a built tree: every direct child is de-duplicated
    /// against the table and registered as a fixup entry point.
    pub fn finalize_root(&mut self, root: BuildRoot) -> DotRoot {
        let children: Vec<DotNodeId> = root
            .children
            .into_iter()
            .map(|c| {
                let id = self.intern(c);
                self.top.insert(id);
                self.trace_tree(id, 0);
                id
            })
            .collect();

        DotRoot {
            rule: root.rule,
            children,
        }
    }

    /// Promote single-content chain leaves into the `otn` back-pointer
    /// of their deepest branching ancestor.
    pub fn fixup(&mut self) {
        let tops: Vec<DotNodeId> = self.top.iter().copied().collect();
        for id in tops {
            self.fixup_node(id, true, 0);
        }
    }

    fn fixup_node(&mut self, id: DotNodeId, branched: bool, contents: u32) -> Option<RuleId> {
        let (num_children, kind, rule) = {
            let n = self.node(id);
            (n.children.len(), n.kind, n.rule)
        };

        if num_children == 0 {
            if !branched && contents > 0 {
                return rule;
            }
            self.nodes[id.index()].otn = rule;
            return None;
        }

        if num_children == 1 {
            let contents = contents + (kind == RuleOptionKind::Content) as u32;
            let child = self.node(id).children[0];
            let otn = self.fixup_node(child, false, contents);

            if !branched && contents > 1 {
                return otn;
            }
            self.nodes[id.index()].otn = otn;
            return None;
        }

        let children = self.node(id).children.clone();
        for child in children {
            self.fixup_node(child, true, 0);
        }
        None
    }

    /// All leaf rules reachable from a root, in walk order.
    pub fn leaf_rules(&self, root: &DotRoot) -> Vec<RuleId> {
        let mut out = Vec::new();
        for &child in &root.children {
            self.collect_leaves(child, &mut out);
        }
        out
    }

    fn collect_leaves(&self, id: DotNodeId, out: &mut Vec<RuleId>) {
        let node = self.node(id);
        if let Some(rule) = node.rule {
            if node.kind == RuleOptionKind::Leaf {
                out.push(rule);
            }
        }
        for &child in &node.children {
            self.collect_leaves(child, out);
        }
    }

    fn trace_tree(&self, id: DotNodeId, depth: usize) {
        let node = self.node(id);
        let pad = "  ".repeat(depth);
        match (&node.option, node.rule) {
            (Some(opt), _) => trace!(
                "{}{} opt={} rel={} rc={}",
                pad,
                node.kind,
                opt.id.0,
                node.is_relative,
                node.relative_children
            ),
            (None, Some(rule)) => trace!("{}leaf rule={}", pad, rule),
            (None, None) => {}
        }
        for &child in &node.children {
            self.trace_tree(child, depth + 1);
        }
    }
}

/// Tree slot attached to an engine pattern state: growing during
/// pattern insertion callbacks, canonical after the finalize call.
#[derive(Debug)]
pub enum TreeSlot {
    Building(BuildRoot),
    Ready(DotRoot),
}

impl TreeSlot {
    pub fn ready(&self) -> Option<&DotRoot> {
        match self {
            TreeSlot::Ready(root) => Some(root),
            TreeSlot::Building(_) => None,
        }
    }
}

/// Capability set the builder hands to each engine for its compile
/// pass. The engine calls [`MpseAgent::create_tree`] once per PMX per
/// pattern state and once with `None` to finalize that state's tree.
pub struct MpseAgent<'a> {
    rules: &'a RuleSet,
    dedup: &'a Mutex<DotTable>,
    kind: MpseKind,
}

impl<'a> MpseAgent<'a> {
    pub fn new(rules: &'a RuleSet, dedup: &'a Mutex<DotTable>, kind: MpseKind) -> Self {
        Self { rules, dedup, kind }
    }

    pub fn kind(&self) -> MpseKind {
        self.kind
    }

    pub fn create_tree(&self, pmx: Option<&Pmx>, slot: &mut Option<TreeSlot>) -> Result<()> {
        match pmx {
            Some(pmx) => {
                let slot =
                    slot.get_or_insert_with(|| TreeSlot::Building(BuildRoot::new(pmx.rule)));
                match slot {
                    TreeSlot::Building(root) => {
                        insert_rule(root, self.rules, pmx.rule, self.kind);
                        Ok(())
                    }
                    TreeSlot::Ready(_) => Err(CompileError::Engine(
                        "pattern tree already finalized".into(),
                    )),
                }
            }
            None => match slot.take() {
                None => Err(CompileError::Engine(
                    "finalize called on an empty tree slot".into(),
                )),
                Some(TreeSlot::Building(root)) => {
                    let final_root = self.dedup.lock().finalize_root(root);
                    *slot = Some(TreeSlot::Ready(final_root));
                    Ok(())
                }
                Some(ready) => {
                    *slot = Some(ready);
                    Ok(())
                }
            },
        }
    }
}
