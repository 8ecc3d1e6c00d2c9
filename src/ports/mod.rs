//! Port objects and tables.
//!
//! A port object is a canonicalized set of port numbers shared by every
//! rule that names the same set. The compiler turns each referenced
//! object into one `PortGroup` and later maps every port number in the
//! object back to that group.

use std::collections::HashMap;

use crate::compiler::groups::PortGroup;
use crate::rules::{Direction, PortSpec, Protocol, RuleId, RuleSet};

/// Canonical sorted, merged set of port ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PortSet {
    ranges: Vec<(u16, u16)>,
}

impl PortSet {
    /// Canonicalize a port spec. `None` means "any port".
    pub fn from_spec(spec: &PortSpec) -> Option<PortSet> {
        let mut ranges = Vec::new();
        if !collect_ranges(spec, &mut ranges) {
            return None;
        }
        ranges.sort_unstable();

        let mut merged: Vec<(u16, u16)> = Vec::with_capacity(ranges.len());
        for (lo, hi) in ranges {
            match merged.last_mut() {
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        Some(PortSet { ranges: merged })
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|&(lo, hi)| port >= lo && port <= hi)
    }

    pub fn count(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Returns false when the spec resolves to "any".
fn collect_ranges(spec: &PortSpec, out: &mut Vec<(u16, u16)>) -> bool {
    match spec {
        PortSpec::Any => false,
        PortSpec::Single(p) => {
            out.push((*p, *p));
            true
        }
        PortSpec::Range(lo, hi) => {
            let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
            out.push((lo, hi));
            true
        }
        PortSpec::List(list) => {
            for inner in list {
                if !collect_ranges(inner, out) {
                    return false;
                }
            }
            true
        }
    }
}

/// A port set plus the rules indexed under it. The compiled group is
/// attached during the build and consumed by rule-map assembly.
#[derive(Debug, Default)]
pub struct PortObject {
    pub ports: PortSet,
    pub rules: Vec<RuleId>,
    pub group: Option<PortGroup>,
}

impl PortObject {
    fn keyed(ports: PortSet) -> Self {
        Self {
            ports,
            rules: Vec::new(),
            group: None,
        }
    }
}

/// Hash table of port objects keyed by their canonical port set.
#[derive(Debug, Default)]
pub struct PortTable {
    objects: Vec<PortObject>,
    index: HashMap<PortSet, usize>,
}

impl PortTable {
    fn add_rule(&mut self, ports: PortSet, rule: RuleId) {
        let idx = match self.index.get(&ports) {
            Some(&i) => i,
            None => {
                let i = self.objects.len();
                self.index.insert(ports.clone(), i);
                self.objects.push(PortObject::keyed(ports));
                i
            }
        };
        self.objects[idx].rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortObject> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PortObject> {
        self.objects.iter_mut()
    }
}

/// Directional tables plus the any-any object for one protocol.
#[derive(Debug, Default)]
pub struct ProtoTables {
    pub src: PortTable,
    pub dst: PortTable,
    pub any: PortObject,
}

/// All port tables for the four network protocols.
#[derive(Debug, Default)]
pub struct RulePortTables {
    pub ip: ProtoTables,
    pub icmp: ProtoTables,
    pub tcp: ProtoTables,
    pub udp: ProtoTables,
}

impl RulePortTables {
    /// Index every enabled, non-builtin rule into its protocol's tables.
    ///
    /// Destination ports take precedence; rules with an any destination
    /// but concrete source ports land in the src table; any-any rules go
    /// to the shared any object. Bidirectional rules are indexed in both
    /// directional tables.
    pub fn from_rules(rules: &RuleSet) -> Self {
        let mut tables = RulePortTables::default();

        for (id, rule) in rules.iter() {
            if rule.builtin || !rule.enabled {
                continue;
            }

            let proto = tables.proto_mut(rule.protocol);
            let dst = PortSet::from_spec(&rule.dst_port);
            let src = PortSet::from_spec(&rule.src_port);

            if rule.direction == Direction::Both {
                let mut placed = false;
                if let Some(ports) = dst.clone() {
                    proto.dst.add_rule(ports, id);
                    placed = true;
                }
                if let Some(ports) = src.clone() {
                    proto.src.add_rule(ports, id);
                    placed = true;
                }
                if !placed {
                    proto.any.rules.push(id);
                }
                continue;
            }

            match (dst, src) {
                (Some(ports), _) => proto.dst.add_rule(ports, id),
                (None, Some(ports)) => proto.src.add_rule(ports, id),
                (None, None) => proto.any.rules.push(id),
            }
        }

        tables
    }

    pub fn proto(&self, protocol: Protocol) -> &ProtoTables {
        match protocol {
            Protocol::Ip => &self.ip,
            Protocol::Icmp => &self.icmp,
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    pub fn proto_mut(&mut self, protocol: Protocol) -> &mut ProtoTables {
        match protocol {
            Protocol::Ip => &mut self.ip,
            Protocol::Icmp => &mut self.icmp,
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }

    /// Every port object across all protocols and directions, the
    /// any-any objects included. Used to walk engines at compile time.
    pub fn objects_mut(&mut self) -> Vec<&mut PortObject> {
        let mut out = Vec::new();
        let protos = [&mut self.ip, &mut self.icmp, &mut self.tcp, &mut self.udp];
        for t in protos {
            out.extend(t.src.iter_mut());
            out.extend(t.dst.iter_mut());
            out.push(&mut t.any);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, SigId};

    #[test]
    fn test_port_set_merge() {
        let spec = PortSpec::List(vec![
            PortSpec::Single(80),
            PortSpec::Range(81, 90),
            PortSpec::Single(443),
        ]);
        let set = PortSet::from_spec(&spec).unwrap();
        assert_eq!(set.count(), 12);
        assert!(set.contains(85));
        assert!(set.contains(443));
        assert!(!set.contains(444));
    }

    #[test]
    fn test_port_set_any() {
        assert!(PortSet::from_spec(&PortSpec::Any).is_none());
        let nested = PortSpec::List(vec![PortSpec::Single(80), PortSpec::Any]);
        assert!(PortSet::from_spec(&nested).is_none());
    }

    #[test]
    fn test_from_rules_placement() {
        let mut rules = RuleSet::new();

        let mut dst_rule = Rule::new(SigId::new(1, 1, 1), Protocol::Tcp);
        dst_rule.dst_port = PortSpec::Single(80);
        rules.add(dst_rule);

        let mut src_rule = Rule::new(SigId::new(1, 2, 1), Protocol::Tcp);
        src_rule.src_port = PortSpec::Single(1024);
        rules.add(src_rule);

        let any_rule = Rule::new(SigId::new(1, 3, 1), Protocol::Tcp);
        rules.add(any_rule);

        let tables = RulePortTables::from_rules(&rules);
        assert_eq!(tables.tcp.dst.len(), 1);
        assert_eq!(tables.tcp.src.len(), 1);
        assert_eq!(tables.tcp.any.rules.len(), 1);
    }

    #[test]
    fn test_from_rules_shares_objects() {
        let mut rules = RuleSet::new();
        for sid in 1..=3 {
            let mut rule = Rule::new(SigId::new(1, sid, 1), Protocol::Tcp);
            rule.dst_port = PortSpec::Single(80);
            rules.add(rule);
        }

        let tables = RulePortTables::from_rules(&rules);
        assert_eq!(tables.tcp.dst.len(), 1);
        let object = tables.tcp.dst.iter().next().unwrap();
        assert_eq!(object.rules.len(), 3);
    }
}
