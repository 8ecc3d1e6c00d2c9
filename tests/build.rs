//! End-to-end compilation scenarios over a miniature rule corpus.

use std::sync::Arc;

use fpdetect::compiler::tree::TreeSlot;
use fpdetect::mpse::ac::AcApi;
use fpdetect::mpse::rex::RexApi;
use fpdetect::mpse::{Mpse, MpseApi, PatternState};
use fpdetect::rules::options::OptionInterner;
use fpdetect::rules::pattern::{PatternMatchData, PmType};
use fpdetect::{
    build, DetectionSnapshot, FastPatternConfig, PortGroup, ProtoRef, PortSpec, Protocol, Rule,
    RulePortTables, RuleId, RuleSet, SigId,
};

fn content_rule(
    rules: &mut RuleSet,
    interner: &mut OptionInterner,
    sid: u32,
    dst_port: Option<u16>,
    patterns: &[&[u8]],
) -> RuleId {
    let mut rule = Rule::new(SigId::new(1, sid, 1), Protocol::Tcp);
    if let Some(port) = dst_port {
        rule.dst_port = PortSpec::Single(port);
    }
    for pattern in patterns {
        rule.options
            .push(interner.content(PatternMatchData::literal(pattern)));
    }
    rules.add(rule)
}

fn pkt_mpse(group: &PortGroup) -> &dyn Mpse {
    group
        .mpse_group(PmType::Pkt)
        .expect("no packet engine slot")
        .normal
        .as_deref()
        .expect("no normal engine")
}

fn state_for<'a>(mpse: &'a dyn Mpse, bytes: &[u8]) -> &'a PatternState {
    mpse.states()
        .iter()
        .find(|s| s.bytes == bytes)
        .expect("pattern state missing")
}

fn leaves(snapshot: &DetectionSnapshot, state: &PatternState) -> Vec<RuleId> {
    let root = match state.tree.as_ref() {
        Some(TreeSlot::Ready(root)) => root,
        _ => panic!("tree not finalized"),
    };
    let mut out = snapshot.dot.leaf_rules(root);
    out.sort_unstable();
    out
}

#[test]
fn prefix_sharing_across_rules() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let proto_ref = ProtoRef::new();
    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    let a = content_rule(&mut rules, &mut interner, 1, Some(80), &[b"aaa", b"bbb"]);
    let b = content_rule(&mut rules, &mut interner, 2, Some(80), &[b"aaa", b"ccc"]);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    let group = snapshot.prm_tcp.dst_group(80).unwrap();
    let mpse = pkt_mpse(group);

    // Both rules share the "aaa" pattern state and its tree.
    let shared = state_for(mpse, b"aaa");
    assert_eq!(shared.pmxs.len(), 2);
    assert_eq!(leaves(&snapshot, shared), vec![a, b]);

    // One shared inner node diverging into two branches.
    let root = shared.tree.as_ref().unwrap().ready().unwrap();
    assert_eq!(root.children.len(), 1);
    let inner = snapshot.dot.node(root.children[0]);
    assert_eq!(inner.children.len(), 2);
    assert_eq!(inner.relative_children, 0);
}

#[test]
fn explicit_fast_pattern_and_alternates() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let proto_ref = ProtoRef::new();
    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    let mut rule = Rule::new(SigId::new(1, 10, 1), Protocol::Tcp);
    rule.dst_port = PortSpec::Single(80);
    rule.options
        .push(interner.content(PatternMatchData::literal(b"ab")));
    let mut marked = PatternMatchData::literal(b"abcdef");
    marked.is_fast_pattern = true;
    rule.options.push(interner.content(marked));
    rules.add(rule);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    let group = snapshot.prm_tcp.dst_group(80).unwrap();
    let mpse = pkt_mpse(group);

    // The marked content is the entry point; the other content rides
    // along as an alternate entry point for the same rule.
    assert_eq!(mpse.pattern_count(), 2);
    state_for(mpse, b"abcdef");
    state_for(mpse, b"ab");
}

#[test]
fn negated_only_rule_scanned_unconditionally() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let proto_ref = ProtoRef::new();
    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    let mut pmd = PatternMatchData::literal(b"XYZ");
    pmd.is_negated = true;
    let mut rule = Rule::new(SigId::new(1, 20, 1), Protocol::Tcp);
    rule.dst_port = PortSpec::Single(25);
    rule.options.push(interner.content(pmd));
    let id = rules.add(rule);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    let group = snapshot.prm_tcp.dst_group(25).unwrap();
    let mpse = pkt_mpse(group);

    // Inserted verbatim, no slicing or truncation.
    let state = state_for(mpse, b"XYZ");
    assert!(state.desc.negated);
    assert_eq!(mpse.neg_list().len(), 1);

    // And the rule is also on the unconditional list.
    assert_eq!(group.nfp_rules, vec![id]);
    assert!(group.nfp_tree.is_some());
}

#[test]
fn service_rule_lands_in_service_and_port_groups() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let mut proto_ref = ProtoRef::new();
    let http = proto_ref.add("http");

    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    let mut rule = Rule::new(SigId::new(1, 30, 1), Protocol::Tcp);
    rule.services.push("http".to_string());
    rule.options
        .push(interner.content(PatternMatchData::literal(b"GET")));
    let id = rules.add(rule);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    // Service group, reachable by name and by ordinal.
    let svc_group = &snapshot.service_groups.to_srv["http"];
    let state = state_for(pkt_mpse(svc_group), b"GET");
    assert_eq!(leaves(&snapshot, state), vec![id]);
    assert!(Arc::ptr_eq(
        snapshot.service_ordinals.srv_group(http).unwrap(),
        svc_group
    ));

    // And the tcp any-any port group.
    let any_group = snapshot.prm_tcp.any_group().unwrap();
    let state = state_for(pkt_mpse(any_group), b"GET");
    assert_eq!(leaves(&snapshot, state), vec![id]);
}

#[test]
fn offload_engine_gets_own_patterns() {
    let ac: Arc<dyn MpseApi> = Arc::new(AcApi);
    let rex: Arc<dyn MpseApi> = Arc::new(RexApi);
    let fp = FastPatternConfig::new(ac).with_offload(rex);

    let proto_ref = ProtoRef::new();
    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();
    content_rule(&mut rules, &mut interner, 40, Some(443), &[b"handshake"]);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    assert_eq!(snapshot.counts.mpse_count, 1);
    assert_eq!(snapshot.counts.offload_mpse_count, 1);

    let group = snapshot.prm_tcp.dst_group(443).unwrap();
    let slot = group.mpse_group(PmType::Pkt).unwrap();
    assert_eq!(slot.normal.as_ref().unwrap().pattern_count(), 1);
    assert_eq!(slot.offload.as_ref().unwrap().pattern_count(), 1);

    // Both trees finalized.
    for mpse in [slot.normal.as_deref().unwrap(), slot.offload.as_deref().unwrap()] {
        assert!(mpse.states()[0].tree.as_ref().unwrap().ready().is_some());
    }
}

#[test]
fn single_content_chain_short_circuits() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let proto_ref = ProtoRef::new();
    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    let id = content_rule(&mut rules, &mut interner, 50, Some(8080), &[b"alpha", b"betas"]);

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    let group = snapshot.prm_tcp.dst_group(8080).unwrap();
    let state = state_for(pkt_mpse(group), b"alpha");
    let root = state.tree.as_ref().unwrap().ready().unwrap();

    // content -> content -> leaf promotes the rule into the chain head.
    let head = snapshot.dot.node(root.children[0]);
    assert_eq!(head.otn, Some(id));
}

#[test]
fn every_rule_reachable_or_unconditional() {
    let fp = FastPatternConfig::new(Arc::new(AcApi));
    let mut proto_ref = ProtoRef::new();
    proto_ref.add("http");
    proto_ref.add("smtp");

    let mut rules = RuleSet::new();
    let mut interner = OptionInterner::new();

    content_rule(&mut rules, &mut interner, 1, Some(80), &[b"one"]);
    content_rule(&mut rules, &mut interner, 2, Some(80), &[b"two", b"three"]);
    content_rule(&mut rules, &mut interner, 3, None, &[b"four"]);

    // Content-less rule: no fast pattern anywhere.
    let bare = Rule::new(SigId::new(1, 4, 1), Protocol::Udp);
    rules.add(bare);

    // Negated-only rule.
    let mut neg = PatternMatchData::literal(b"no-thanks");
    neg.is_negated = true;
    let mut rule = Rule::new(SigId::new(1, 5, 1), Protocol::Tcp);
    rule.dst_port = PortSpec::Single(25);
    rule.options.push(interner.content(neg));
    rules.add(rule);

    // Service rule.
    let mut svc = Rule::new(SigId::new(1, 6, 1), Protocol::Tcp);
    svc.services.push("smtp".to_string());
    svc.options
        .push(interner.content(PatternMatchData::literal(b"EHLO")));
    rules.add(svc);

    // Disabled and builtin rules are out of scope for the invariant.
    let mut off = Rule::new(SigId::new(1, 7, 1), Protocol::Tcp);
    off.enabled = false;
    rules.add(off);
    let mut builtin = Rule::new(SigId::new(116, 8, 1), Protocol::Tcp);
    builtin.builtin = true;
    rules.add(builtin);

    let expected: Vec<RuleId> = rules
        .iter()
        .filter(|(_, r)| r.enabled && !r.builtin)
        .map(|(id, _)| id)
        .collect();

    let tables = RulePortTables::from_rules(&rules);
    let snapshot = build(&fp, &proto_ref, rules, tables).unwrap();

    let mut seen: Vec<RuleId> = Vec::new();
    let mut visit = |group: &PortGroup| {
        seen.extend(&group.nfp_rules);
        for pm_type in PmType::ALL {
            if let Some(slot) = group.mpse_group(pm_type) {
                for mpse in [slot.normal.as_deref(), slot.offload.as_deref()]
                    .into_iter()
                    .flatten()
                {
                    for state in mpse.states() {
                        if let Some(TreeSlot::Ready(root)) = state.tree.as_ref() {
                            seen.extend(snapshot.dot.leaf_rules(root));
                        }
                    }
                }
            }
        }
    };

    for protocol in [Protocol::Ip, Protocol::Icmp, Protocol::Tcp, Protocol::Udp] {
        let prm = snapshot.prm(protocol);
        let mut groups: Vec<&Arc<PortGroup>> = Vec::new();
        for port in 0..=u16::MAX {
            for g in [prm.src_group(port), prm.dst_group(port)].into_iter().flatten() {
                if !groups.iter().any(|existing| Arc::ptr_eq(existing, g)) {
                    groups.push(g);
                }
            }
        }
        if let Some(g) = prm.any_group() {
            groups.push(g);
        }
        for g in groups {
            visit(g);
        }
    }
    for g in snapshot
        .service_groups
        .to_srv
        .values()
        .chain(snapshot.service_groups.to_cli.values())
    {
        visit(g);
    }

    seen.sort_unstable();
    seen.dedup();
    for id in expected {
        assert!(seen.contains(&id), "rule {} unreachable", id);
    }
}
