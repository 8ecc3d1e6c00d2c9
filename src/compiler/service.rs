//! Service-keyed rule groups.
//!
//! Rules naming a service in their metadata are grouped per
//! `(direction, service)` and compiled exactly like port groups; a
//! protocol-ordinal-indexed vector gives the runtime O(1) lookup from a
//! flow's identified service to its group.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::groups::{add_rule_to_group, finish_group, PortGroup};
use super::BuildState;
use crate::error::{CompileError, Result};
use crate::rules::{Direction, RuleId, RuleSet};

/// Service name to protocol ordinal registry.
#[derive(Debug, Default, Clone)]
pub struct ProtoRef {
    names: Vec<String>,
    index: HashMap<String, u16>,
}

impl ProtoRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, returning its ordinal. Idempotent.
    pub fn add(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u16;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn find(&self, name: &str) -> Option<u16> {
        self.index.get(name).copied()
    }

    pub fn name(&self, ordinal: u16) -> Option<&str> {
        self.names.get(ordinal as usize).map(|s| s.as_str())
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }

    pub fn names_sorted(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Per-direction map from service name to the rules that apply.
#[derive(Debug, Default)]
pub(crate) struct ServiceRuleMap {
    pub to_srv: HashMap<String, Vec<RuleId>>,
    pub to_cli: HashMap<String, Vec<RuleId>>,
}

impl ServiceRuleMap {
    pub fn from_rules(rules: &RuleSet) -> Self {
        let mut map = ServiceRuleMap::default();

        for (id, rule) in rules.iter() {
            if rule.builtin || !rule.enabled {
                continue;
            }
            for service in &rule.services {
                match rule.direction {
                    Direction::ToServer => {
                        map.to_srv.entry(service.clone()).or_default().push(id);
                    }
                    Direction::ToClient => {
                        map.to_cli.entry(service.clone()).or_default().push(id);
                    }
                    Direction::Both => {
                        map.to_srv.entry(service.clone()).or_default().push(id);
                        map.to_cli.entry(service.clone()).or_default().push(id);
                    }
                }
            }
        }

        map
    }
}

/// Service groups under construction, still mutable for engine
/// compilation.
#[derive(Debug, Default)]
pub(crate) struct ServiceGroupBuild {
    pub to_srv: HashMap<String, PortGroup>,
    pub to_cli: HashMap<String, PortGroup>,
}

/// Finished service groups keyed by name.
#[derive(Debug, Default)]
pub struct ServiceGroupMap {
    pub to_srv: HashMap<String, Arc<PortGroup>>,
    pub to_cli: HashMap<String, Arc<PortGroup>>,
}

/// Protocol-ordinal-indexed group vectors for packet-time lookup.
#[derive(Debug, Default)]
pub struct ServiceOrdinalMap {
    to_srv: Vec<Option<Arc<PortGroup>>>,
    to_cli: Vec<Option<Arc<PortGroup>>>,
}

impl ServiceOrdinalMap {
    pub fn new(count: usize) -> Self {
        Self {
            to_srv: vec![None; count],
            to_cli: vec![None; count],
        }
    }

    pub fn srv_group(&self, ordinal: u16) -> Option<&Arc<PortGroup>> {
        self.to_srv.get(ordinal as usize).and_then(|g| g.as_ref())
    }

    pub fn cli_group(&self, ordinal: u16) -> Option<&Arc<PortGroup>> {
        self.to_cli.get(ordinal as usize).and_then(|g| g.as_ref())
    }

    fn set_srv(&mut self, ordinal: u16, group: Arc<PortGroup>) {
        if let Some(slot) = self.to_srv.get_mut(ordinal as usize) {
            *slot = Some(group);
        }
    }

    fn set_cli(&mut self, ordinal: u16, group: Arc<PortGroup>) {
        if let Some(slot) = self.to_cli.get_mut(ordinal as usize) {
            *slot = Some(group);
        }
    }
}

/// Build one direction's service groups from its rule lists. Every
/// service must resolve to a protocol ordinal.
fn build_direction(
    st: &mut BuildState<'_>,
    srm: &HashMap<String, Vec<RuleId>>,
    proto_ref: &ProtoRef,
) -> Result<HashMap<String, PortGroup>> {
    let mut out = HashMap::new();

    let mut services: Vec<&String> = srm.keys().collect();
    services.sort_unstable();

    for service in services {
        if proto_ref.find(service).is_none() {
            return Err(CompileError::UnknownService(service.clone()));
        }

        st.group_label = service.clone();
        let mut pg = PortGroup::new();
        for &rule in &srm[service] {
            add_rule_to_group(st, &mut pg, rule, true);
        }

        if let Some(pg) = finish_group(st, pg) {
            out.insert(service.clone(), pg);
        }
    }

    Ok(out)
}

pub(crate) fn build_service_groups(
    st: &mut BuildState<'_>,
    srm: &ServiceRuleMap,
    proto_ref: &ProtoRef,
) -> Result<ServiceGroupBuild> {
    Ok(ServiceGroupBuild {
        to_srv: build_direction(st, &srm.to_srv, proto_ref)?,
        to_cli: build_direction(st, &srm.to_cli, proto_ref)?,
    })
}

/// Freeze built groups into shared form and populate the ordinal
/// vectors.
pub(crate) fn freeze(
    build: ServiceGroupBuild,
    proto_ref: &ProtoRef,
) -> (ServiceGroupMap, ServiceOrdinalMap) {
    let mut map = ServiceGroupMap::default();
    let mut ordinals = ServiceOrdinalMap::new(proto_ref.count());

    for (service, pg) in build.to_srv {
        let group = Arc::new(pg);
        if let Some(ordinal) = proto_ref.find(&service) {
            ordinals.set_srv(ordinal, group.clone());
        }
        map.to_srv.insert(service, group);
    }
    for (service, pg) in build.to_cli {
        let group = Arc::new(pg);
        if let Some(ordinal) = proto_ref.find(&service) {
            ordinals.set_cli(ordinal, group.clone());
        }
        map.to_cli.insert(service, group);
    }

    (map, ordinals)
}

/// Summary table of rule counts per service and direction.
pub(crate) fn print_service_rule_counts(proto_ref: &ProtoRef, srm: &ServiceRuleMap) {
    if srm.to_srv.is_empty() && srm.to_cli.is_empty() {
        return;
    }

    info!("service rule counts          to-srv  to-cli");

    let mut total_srv = 0usize;
    let mut total_cli = 0usize;

    for service in proto_ref.names_sorted() {
        let ns = srm.to_srv.get(service).map_or(0, |l| l.len());
        let nc = srm.to_cli.get(service).map_or(0, |l| l.len());
        if ns == 0 && nc == 0 {
            continue;
        }
        info!("{:>25}: {:8}{:8}", service, ns, nc);
        total_srv += ns;
        total_cli += nc;
    }

    if total_srv > 0 || total_cli > 0 {
        info!("{:>25}: {:8}{:8}", "total", total_srv, total_cli);
    }
}

/// Detailed per-service rule listing used while tracing group builds.
pub(crate) fn print_service_rule_maps(rules: &RuleSet, srm: &ServiceRuleMap) {
    for (dir, map) in [("to server", &srm.to_srv), ("to client", &srm.to_cli)] {
        if map.is_empty() {
            continue;
        }
        debug!("service rule counts - {}", dir);
        let mut services: Vec<&String> = map.keys().collect();
        services.sort_unstable();
        for service in services {
            debug!("{}: {}", service, map[service].len());
            for &id in &map[service] {
                debug!("|   {}", rules.get(id).sig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use crate::config::FastPatternConfig;
    use crate::mpse::ac::AcApi;
    use crate::rules::options::OptionInterner;
    use crate::rules::pattern::PatternMatchData;
    use crate::rules::{Protocol, Rule, SigId};

    fn http_rule(rules: &mut RuleSet, interner: &mut OptionInterner, sid: u32) -> RuleId {
        let mut rule = Rule::new(SigId::new(1, sid, 1), Protocol::Tcp);
        rule.services.push("http".to_string());
        rule.options
            .push(interner.content(PatternMatchData::literal(b"GET")));
        rules.add(rule)
    }

    #[test]
    fn test_proto_ref() {
        let mut pr = ProtoRef::new();
        let http = pr.add("http");
        let dns = pr.add("dns");
        assert_eq!(pr.add("http"), http);
        assert_ne!(http, dns);
        assert_eq!(pr.find("dns"), Some(dns));
        assert_eq!(pr.name(http), Some("http"));
        assert_eq!(pr.count(), 2);
    }

    #[test]
    fn test_service_rule_map_directions() {
        let mut rules = RuleSet::new();
        let mut interner = OptionInterner::new();

        let a = http_rule(&mut rules, &mut interner, 1);

        let mut both = Rule::new(SigId::new(1, 2, 1), Protocol::Tcp);
        both.services.push("http".to_string());
        both.direction = Direction::Both;
        let b = rules.add(both);

        let srm = ServiceRuleMap::from_rules(&rules);
        assert_eq!(srm.to_srv["http"], vec![a, b]);
        assert_eq!(srm.to_cli["http"], vec![b]);
    }

    #[test]
    fn test_unknown_service_is_fatal() {
        let fp = FastPatternConfig::new(StdArc::new(AcApi));
        let mut rules = RuleSet::new();
        let mut interner = OptionInterner::new();
        http_rule(&mut rules, &mut interner, 1);

        let srm = ServiceRuleMap::from_rules(&rules);
        let proto_ref = ProtoRef::new();

        let mut st = BuildState::new(&fp, &mut rules);
        let err = build_service_groups(&mut st, &srm, &proto_ref);
        assert!(matches!(err, Err(CompileError::UnknownService(s)) if s == "http"));
    }

    #[test]
    fn test_service_groups_and_ordinals() {
        let fp = FastPatternConfig::new(StdArc::new(AcApi));
        let mut rules = RuleSet::new();
        let mut interner = OptionInterner::new();
        http_rule(&mut rules, &mut interner, 1);

        let mut proto_ref = ProtoRef::new();
        let http_ord = proto_ref.add("http");

        let srm = ServiceRuleMap::from_rules(&rules);
        let mut st = BuildState::new(&fp, &mut rules);
        let build = build_service_groups(&mut st, &srm, &proto_ref).unwrap();
        assert!(build.to_srv.contains_key("http"));

        let (map, ordinals) = freeze(build, &proto_ref);
        assert!(map.to_srv.contains_key("http"));
        let by_ordinal = ordinals.srv_group(http_ord).unwrap();
        assert!(StdArc::ptr_eq(by_ordinal, &map.to_srv["http"]));
    }
}
