//! Fast-pattern detection compiler.
//!
//! Turns a rule corpus and its port tables into the structures the
//! packet path consults: per-group multi-pattern engines, detection
//! option trees rooted at each inserted pattern, and port / service
//! indexed maps selecting the groups to run.

pub mod groups;
pub mod rule_map;
pub mod select;
pub mod service;
pub mod tree;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::FastPatternConfig;
use crate::error::{CompileError, Result};
use crate::mpse::{Mpse, MpseKind};
use crate::ports::{PortTable, RulePortTables};
use crate::rules::pattern::PmType;
use crate::rules::{Protocol, RuleId, RuleSet};

use groups::{add_rule_to_group, finish_group, print_group_rule_counts, PortGroup};
use rule_map::PortRuleMap;
use service::{
    build_service_groups, print_service_rule_counts, print_service_rule_maps, ProtoRef,
    ServiceGroupBuild, ServiceGroupMap, ServiceOrdinalMap, ServiceRuleMap,
};
use tree::{DotTable, MpseAgent};

/// Builder state threaded through group construction.
pub(crate) struct BuildState<'a> {
    pub(crate) fp: &'a FastPatternConfig,
    pub(crate) rules: &'a mut RuleSet,
    pub(crate) dedup: DotTable,
    pub(crate) mpse_count: u32,
    pub(crate) offload_mpse_count: u32,
    pub(crate) errors: Vec<CompileError>,
    /// Label for fast-pattern info lines: "port" or the service name.
    pub(crate) group_label: String,
}

impl<'a> BuildState<'a> {
    pub(crate) fn new(fp: &'a FastPatternConfig, rules: &'a mut RuleSet) -> Self {
        Self {
            fp,
            rules,
            dedup: DotTable::new(),
            mpse_count: 0,
            offload_mpse_count: 0,
            errors: Vec::new(),
            group_label: "port".to_string(),
        }
    }
}

/// Counters returned from a successful build.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CompileCounts {
    pub mpse_count: u32,
    pub offload_mpse_count: u32,
    pub patterns_truncated: u32,
    pub rules: usize,
}

/// Everything compiled for one configuration snapshot. Dropping the
/// snapshot releases the tree table first, then the rule maps, then the
/// groups and their engines.
pub struct DetectionSnapshot {
    pub dot: DotTable,
    pub prm_ip: PortRuleMap,
    pub prm_icmp: PortRuleMap,
    pub prm_tcp: PortRuleMap,
    pub prm_udp: PortRuleMap,
    pub service_groups: ServiceGroupMap,
    pub service_ordinals: ServiceOrdinalMap,
    pub rules: RuleSet,
    pub counts: CompileCounts,
}

impl DetectionSnapshot {
    pub fn prm(&self, protocol: Protocol) -> &PortRuleMap {
        match protocol {
            Protocol::Ip => &self.prm_ip,
            Protocol::Icmp => &self.prm_icmp,
            Protocol::Tcp => &self.prm_tcp,
            Protocol::Udp => &self.prm_udp,
        }
    }

    fn empty(proto_ref: &ProtoRef, rules: RuleSet) -> Self {
        Self {
            dot: DotTable::new(),
            prm_ip: PortRuleMap::new(),
            prm_icmp: PortRuleMap::new(),
            prm_tcp: PortRuleMap::new(),
            prm_udp: PortRuleMap::new(),
            service_groups: ServiceGroupMap::default(),
            service_ordinals: ServiceOrdinalMap::new(proto_ref.count()),
            rules,
            counts: CompileCounts::default(),
        }
    }
}

/// Compile the fast-pattern structures for a configuration snapshot.
pub fn build(
    fp: &FastPatternConfig,
    proto_ref: &ProtoRef,
    mut rules: RuleSet,
    mut tables: RulePortTables,
) -> Result<DetectionSnapshot> {
    if rules.is_empty() {
        return Ok(DetectionSnapshot::empty(proto_ref, rules));
    }

    let detail = fp.options.debug_print_rule_group_build_details;
    fp.search_api().start_search_engine();

    let mut st = BuildState::new(fp, &mut rules);

    if detail {
        debug!("creating port groups");
    }
    create_port_groups(&mut st, &mut tables);

    if detail {
        debug!("port groups done, creating service rule maps");
    }
    let srm = ServiceRuleMap::from_rules(st.rules);
    print_service_rule_counts(proto_ref, &srm);
    if detail {
        print_service_rule_maps(st.rules, &srm);
    }

    let mut service_build = build_service_groups(&mut st, &srm, proto_ref)?;
    if detail {
        debug!("service groups done");
    }

    if !fp.options.test_mode || fp.options.mem_check {
        let expected = st.mpse_count + st.offload_mpse_count;
        let dedup = Mutex::new(std::mem::take(&mut st.dedup));
        let compiled = compile_mpses(
            st.rules,
            &dedup,
            &mut tables,
            &mut service_build,
            can_build_mt(fp),
            &mut st.errors,
        );
        st.dedup = dedup.into_inner();

        if compiled != expected {
            return Err(CompileError::MpseCompileShortfall(
                (expected - compiled) as usize,
            ));
        }
        st.dedup.fixup();
    }

    print_port_group_summary(&tables);
    print_service_group_summary(&service_build);

    if st.mpse_count > 0 {
        info!("search engine: {}", fp.search_api().name());
        fp.search_api().print_summary();
    }
    if st.offload_mpse_count > 0 {
        if let Some(api) = fp.offload_search_api() {
            info!("offload search engine: {}", api.name());
            api.print_summary();
        }
    }
    if fp.num_patterns_truncated() > 0 {
        info!("truncated patterns: {}", fp.num_patterns_truncated());
    }

    fp.search_api().setup_search_engine();

    let counts = CompileCounts {
        mpse_count: st.mpse_count,
        offload_mpse_count: st.offload_mpse_count,
        patterns_truncated: fp.num_patterns_truncated(),
        rules: st.rules.len(),
    };
    let errors = std::mem::take(&mut st.errors);
    let dot = std::mem::take(&mut st.dedup);
    drop(st);

    if !errors.is_empty() {
        return Err(CompileError::Failed(errors));
    }

    let prm_ip = PortRuleMap::build(&mut tables.ip);
    let prm_icmp = PortRuleMap::build(&mut tables.icmp);
    let prm_tcp = PortRuleMap::build(&mut tables.tcp);
    let prm_udp = PortRuleMap::build(&mut tables.udp);
    let (service_groups, service_ordinals) = service::freeze(service_build, proto_ref);

    Ok(DetectionSnapshot {
        dot,
        prm_ip,
        prm_icmp,
        prm_tcp,
        prm_udp,
        service_groups,
        service_ordinals,
        rules,
        counts,
    })
}

/// Build one group per referenced port object, folding any-any rules
/// into the directional groups unless `split_any_any` keeps them apart.
fn create_port_groups(st: &mut BuildState<'_>, tables: &mut RulePortTables) {
    let split = st.fp.options.split_any_any;
    let detail = st.fp.options.debug_print_rule_group_build_details;

    for protocol in [Protocol::Ip, Protocol::Icmp, Protocol::Tcp, Protocol::Udp] {
        let t = tables.proto_mut(protocol);
        let any_rules: Vec<RuleId> = if split { Vec::new() } else { t.any.rules.clone() };

        st.group_label = "port".to_string();

        if detail {
            debug!("{} src port groups", protocol);
        }
        build_table_groups(st, &mut t.src, &any_rules, detail);

        if detail {
            debug!("{} dst port groups", protocol);
        }
        build_table_groups(st, &mut t.dst, &any_rules, detail);

        if detail {
            debug!("{} any port group", protocol);
        }
        if !t.any.rules.is_empty() {
            let mut pg = PortGroup::new();
            let any_list = t.any.rules.clone();
            for &rule in &any_list {
                add_rule_to_group(st, &mut pg, rule, false);
            }
            if detail {
                print_group_rule_counts(&pg, "any");
            }
            t.any.group = finish_group(st, pg);
        }
    }
}

fn build_table_groups(
    st: &mut BuildState<'_>,
    table: &mut PortTable,
    any_rules: &[RuleId],
    detail: bool,
) {
    for po in table.iter_mut() {
        if po.rules.is_empty() {
            continue;
        }

        let mut pg = PortGroup::new();
        let rule_list = po.rules.clone();
        for &rule in &rule_list {
            add_rule_to_group(st, &mut pg, rule, false);
        }
        for &rule in any_rules {
            add_rule_to_group(st, &mut pg, rule, false);
        }

        if detail {
            print_group_rule_counts(&pg, "ports");
        }
        po.group = finish_group(st, pg);
    }
}

/// The compile thread pool is allowed only outside hot reloads and only
/// when every selected engine advertises parallel compilation.
fn can_build_mt(fp: &FastPatternConfig) -> bool {
    if fp.options.hot_reload {
        return false;
    }
    if !fp.search_api().parallel_compiles() {
        return false;
    }
    fp.offload_search_api()
        .map_or(true, |api| api.parallel_compiles())
}

/// Compile every engine across port and service groups, building each
/// pattern's option tree through the agent callback. Returns how many
/// engines compiled cleanly.
fn compile_mpses(
    rules: &RuleSet,
    dedup: &Mutex<DotTable>,
    tables: &mut RulePortTables,
    services: &mut ServiceGroupBuild,
    parallel: bool,
    errors: &mut Vec<CompileError>,
) -> u32 {
    let mut work: Vec<(MpseKind, &mut Box<dyn Mpse>)> = Vec::new();

    for po in tables.objects_mut() {
        if let Some(pg) = po.group.as_mut() {
            work.extend(pg.engines_mut());
        }
    }
    for pg in services
        .to_srv
        .values_mut()
        .chain(services.to_cli.values_mut())
    {
        work.extend(pg.engines_mut());
    }

    let results: Vec<Result<()>> = if parallel {
        work.into_par_iter()
            .map(|(kind, mpse)| mpse.compile(&MpseAgent::new(rules, dedup, kind)))
            .collect()
    } else {
        work.into_iter()
            .map(|(kind, mpse)| mpse.compile(&MpseAgent::new(rules, dedup, kind)))
            .collect()
    };

    let mut compiled = 0;
    for result in results {
        match result {
            Ok(()) => compiled += 1,
            Err(e) => {
                error!("search engine compile failed: {}", e);
                errors.push(e);
            }
        }
    }
    compiled
}

fn sum_group(pg: &PortGroup, counts: &mut [u32; PmType::COUNT]) {
    for pm_type in PmType::ALL {
        if let Some(group) = pg.mpse_group(pm_type) {
            if group
                .normal
                .as_ref()
                .map_or(false, |m| m.pattern_count() > 0)
            {
                counts[pm_type.index()] += 1;
            }
        }
    }
}

fn print_port_group_summary(tables: &RulePortTables) {
    let mut src = [0u32; PmType::COUNT];
    let mut dst = [0u32; PmType::COUNT];
    let mut any = [0u32; PmType::COUNT];

    for t in [&tables.ip, &tables.icmp, &tables.tcp, &tables.udp] {
        for po in t.src.iter() {
            if let Some(pg) = &po.group {
                sum_group(pg, &mut src);
            }
        }
        for po in t.dst.iter() {
            if let Some(pg) = &po.group {
                sum_group(pg, &mut dst);
            }
        }
        if let Some(pg) = &t.any.group {
            sum_group(pg, &mut any);
        }
    }

    let mut label = true;
    for pm_type in PmType::ALL {
        let i = pm_type.index();
        if src[i] == 0 && dst[i] == 0 && any[i] == 0 {
            continue;
        }
        if label {
            info!("fast pattern port groups        src     dst     any");
            label = false;
        }
        info!(
            "{:>25}: {:8}{:8}{:8}",
            pm_type.to_string(),
            src[i],
            dst[i],
            any[i]
        );
    }
}

fn print_service_group_summary(services: &ServiceGroupBuild) {
    let mut to_srv = [0u32; PmType::COUNT];
    let mut to_cli = [0u32; PmType::COUNT];

    for pg in services.to_srv.values() {
        sum_group(pg, &mut to_srv);
    }
    for pg in services.to_cli.values() {
        sum_group(pg, &mut to_cli);
    }

    let mut label = true;
    for pm_type in PmType::ALL {
        let i = pm_type.index();
        if to_srv[i] == 0 && to_cli[i] == 0 {
            continue;
        }
        if label {
            info!("fast pattern service groups  to-srv  to-cli");
            label = false;
        }
        info!(
            "{:>25}: {:8}{:8}",
            pm_type.to_string(),
            to_srv[i],
            to_cli[i]
        );
    }
}
