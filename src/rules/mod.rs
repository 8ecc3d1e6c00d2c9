//! Rule corpus model consumed by the fast-pattern compiler.
//!
//! Rules arrive here already parsed. The compiler never touches rule
//! text; it reads the ordered option list, the port specs, and the
//! service metadata, and writes back per-rule compile state such as the
//! longest inserted pattern.

pub mod options;
pub mod pattern;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use options::{DetectionOption, OptionId, RuleOptionKind};
use pattern::PatternMatchData;

/// Dense index of a rule within its `RuleSet`. This is the identity the
/// tree builder shares leaves by.
pub type RuleId = u32;

/// Globally unique signature identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigId {
    pub gid: u32,
    pub sid: u32,
    pub rev: u32,
}

impl SigId {
    pub fn new(gid: u32, sid: u32, rev: u32) -> Self {
        Self { gid, sid, rev }
    }
}

impl std::fmt::Display for SigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.gid, self.sid, self.rev)
    }
}

/// Network protocol a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ip,
    Icmp,
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Ip => "ip",
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}", s)
    }
}

/// Traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    ToServer,
    ToClient,
    Both,
}

/// Port specification from the rule header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PortSpec {
    #[default]
    Any,
    Single(u16),
    Range(u16, u16),
    List(Vec<PortSpec>),
}

impl PortSpec {
    pub fn is_any(&self) -> bool {
        matches!(self, PortSpec::Any)
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSpec::Any => write!(f, "any"),
            PortSpec::Single(p) => write!(f, "{}", p),
            PortSpec::Range(lo, hi) => write!(f, "{}:{}", lo, hi),
            PortSpec::List(list) => {
                write!(f, "[")?;
                for (i, spec) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", spec)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One parsed rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub sig: SigId,
    pub protocol: Protocol,
    /// Builtin (decoder/preprocessor) rules never join pattern groups.
    pub builtin: bool,
    /// Enabled in at least one policy.
    pub enabled: bool,
    pub msg: String,
    /// Service names from rule metadata.
    pub services: Vec<String>,
    pub direction: Direction,
    pub src_port: PortSpec,
    pub dst_port: PortSpec,
    /// Ordered detection options.
    pub options: Vec<Arc<DetectionOption>>,

    // Compile-time state written by the builder.
    pub(crate) longest_pattern_len: usize,
    pub(crate) normal_fp_only: Option<OptionId>,
    pub(crate) offload_fp_only: Option<OptionId>,
    pub(crate) warned_fp: bool,
}

impl Rule {
    pub fn new(sig: SigId, protocol: Protocol) -> Self {
        Self {
            sig,
            protocol,
            builtin: false,
            enabled: true,
            msg: String::new(),
            services: Vec::new(),
            direction: Direction::ToServer,
            src_port: PortSpec::Any,
            dst_port: PortSpec::Any,
            options: Vec::new(),
            longest_pattern_len: 0,
            normal_fp_only: None,
            offload_fp_only: None,
            warned_fp: false,
        }
    }

    /// All content options with their payloads, in rule order.
    pub fn contents(&self) -> impl Iterator<Item = (&Arc<DetectionOption>, &Arc<PatternMatchData>)> {
        self.options
            .iter()
            .filter_map(|opt| opt.payload.as_content().map(|pmd| (opt, pmd)))
    }

    pub fn content_count(&self) -> usize {
        self.contents().count()
    }

    pub fn has_content(&self) -> bool {
        self.options
            .iter()
            .any(|opt| opt.kind == RuleOptionKind::Content)
    }

    pub fn longest_pattern_len(&self) -> usize {
        self.longest_pattern_len
    }

    /// Option recorded as usable purely through the fast pattern
    /// matcher for the given engine type; tree building skips it.
    pub(crate) fn fp_only(&self, kind: crate::mpse::MpseKind) -> Option<OptionId> {
        match kind {
            crate::mpse::MpseKind::Normal => self.normal_fp_only,
            crate::mpse::MpseKind::Offload => self.offload_fp_only,
        }
    }
}

/// Owning arena of rules addressed by `RuleId`.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: Rule) -> RuleId {
        let id = self.rules.len() as RuleId;
        self.rules.push(rule);
        id
    }

    pub fn get(&self, id: RuleId) -> &Rule {
        &self.rules[id as usize]
    }

    pub fn get_mut(&mut self, id: RuleId) -> &mut Rule {
        &mut self.rules[id as usize]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, r)| (i as RuleId, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::options::OptionInterner;

    #[test]
    fn test_rule_defaults() {
        let rule = Rule::new(SigId::new(1, 1000, 1), Protocol::Tcp);
        assert!(rule.enabled);
        assert!(!rule.builtin);
        assert!(!rule.has_content());
    }

    #[test]
    fn test_rule_contents() {
        let mut interner = OptionInterner::new();
        let mut rule = Rule::new(SigId::new(1, 1000, 1), Protocol::Tcp);
        rule.options
            .push(interner.content(PatternMatchData::literal(b"abc")));
        rule.options
            .push(interner.flowbits(options::FlowbitsOp::IsSet("x".into())));

        assert_eq!(rule.content_count(), 1);
        assert!(rule.has_content());
    }

    #[test]
    fn test_ruleset_ids_are_dense() {
        let mut rules = RuleSet::new();
        let a = rules.add(Rule::new(SigId::new(1, 1, 1), Protocol::Tcp));
        let b = rules.add(Rule::new(SigId::new(1, 2, 1), Protocol::Udp));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(rules.get(b).protocol, Protocol::Udp);
    }
}
