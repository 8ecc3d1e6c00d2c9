//! Port groups: the engine + tree bundle compiled for one port object
//! or one service.

use tracing::{debug, info, warn};

use super::select::{final_pattern, get_fp_content, make_fast_pattern_only, FpCandidate};
use super::tree::{insert_rule, BuildRoot, DotRoot};
use super::BuildState;
use crate::error::CompileError;
use crate::mpse::{Mpse, MpseKind, PatternDescriptor};
use crate::rules::pattern::{PatternMatchData, PmType, Pmx};
use crate::rules::{Rule, RuleId};

/// Normal and offload engine pair for one pattern match category.
#[derive(Default)]
pub struct MpseGroup {
    pub normal: Option<Box<dyn Mpse>>,
    pub offload: Option<Box<dyn Mpse>>,
}

impl std::fmt::Debug for MpseGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpseGroup")
            .field(
                "normal",
                &self.normal.as_ref().map(|m| m.pattern_count()),
            )
            .field(
                "offload",
                &self.offload.as_ref().map(|m| m.pattern_count()),
            )
            .finish()
    }
}

/// Compiled bundle for one port object or service: per-category search
/// engines, the rules that could not seed them, and that list's tree.
#[derive(Debug, Default)]
pub struct PortGroup {
    mpse: [Option<MpseGroup>; PmType::COUNT],
    pub nfp_rules: Vec<RuleId>,
    pub nfp_tree: Option<DotRoot>,
    pub rule_count: u32,
    pub nfp_rule_count: u32,
}

impl PortGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mpse_group(&self, pm_type: PmType) -> Option<&MpseGroup> {
        self.mpse[pm_type.index()].as_ref()
    }

    pub fn add_nfp_rule(&mut self, rule: RuleId) {
        self.nfp_rules.push(rule);
        self.nfp_rule_count += 1;
    }

    /// Every engine in the group, tagged with its slot kind.
    pub(crate) fn engines_mut(&mut self) -> Vec<(MpseKind, &mut Box<dyn Mpse>)> {
        let mut out = Vec::new();
        for slot in self.mpse.iter_mut().flatten() {
            if let Some(m) = slot.normal.as_mut() {
                out.push((MpseKind::Normal, m));
            }
            if let Some(m) = slot.offload.as_mut() {
                out.push((MpseKind::Offload, m));
            }
        }
        out
    }
}

/// Add one rule to a group: select its fast pattern, create the engine
/// slot on demand, insert the pattern bytes and alternates, and fall
/// back to the no-fast-pattern list where selection came up empty.
pub(crate) fn add_rule_to_group(
    st: &mut BuildState<'_>,
    pg: &mut PortGroup,
    rule_id: RuleId,
    is_service_group: bool,
) {
    {
        let rule = st.rules.get(rule_id);
        if rule.builtin || !rule.enabled {
            return;
        }
    }

    let search = st.fp.search_api().clone();
    let only_literal = !search.regex_capable();
    let sel = get_fp_content(st.rules.get(rule_id), is_service_group, only_literal);
    let exclude = sel.exclude;
    let mut pmv = sel.pmv;

    if !pmv.is_empty() {
        let offload_api = st.fp.distinct_offload_api().cloned();
        let mut pmv_ol: Vec<FpCandidate> = Vec::new();
        let mut add_to_offload = false;
        let mut cont = true;

        if let Some(ol) = &offload_api {
            let ol_sel = get_fp_content(st.rules.get(rule_id), is_service_group, !ol.regex_capable());
            if !ol_sel.pmv.is_empty() {
                pmv_ol = ol_sel.pmv;
                add_to_offload = true;
            } else {
                // The offload engine cannot take this rule, so neither
                // engine gets it: both must agree on the entry points.
                cont = false;
            }
        }

        if cont {
            let main = match pmv.pop() {
                Some(main) => main,
                None => return,
            };
            let pm_type = main.pmd.pm_type;
            let slot = pg.mpse[pm_type.index()].get_or_insert_with(MpseGroup::default);

            if slot.normal.is_none() {
                match search.create() {
                    Ok(mut mpse) => {
                        if st.fp.options.search_opt {
                            mpse.set_opt(true);
                        }
                        slot.normal = Some(mpse);
                        st.mpse_count += 1;
                    }
                    Err(e) => {
                        st.errors.push(e);
                        st.errors.push(CompileError::MpseCreate {
                            kind: "normal",
                            pm_type,
                        });
                        return;
                    }
                }
            }

            let mut ol_main = None;
            if add_to_offload {
                ol_main = pmv_ol.pop();
                if slot.offload.is_none() {
                    if let Some(ol_api) = &offload_api {
                        match ol_api.create() {
                            Ok(mut mpse) => {
                                if st.fp.options.search_opt {
                                    mpse.set_opt(true);
                                }
                                slot.offload = Some(mpse);
                                st.offload_mpse_count += 1;
                            }
                            Err(e) => {
                                st.errors.push(e);
                                st.errors.push(CompileError::MpseCreate {
                                    kind: "offload",
                                    pm_type,
                                });
                                return;
                            }
                        }
                    }
                }
            }

            let mut added = false;
            let mut add_nfp = false;

            if let Some(mpse) = slot.normal.as_deref_mut() {
                added = true;
                if main.pmd.is_negated {
                    add_nfp = true;
                }

                finish_rule(st, mpse, rule_id, &main, true);
                {
                    let rule = st.rules.get_mut(rule_id);
                    if main.pmd.pattern.len() > rule.longest_pattern_len {
                        rule.longest_pattern_len = main.pmd.pattern.len();
                    }
                }
                if make_fast_pattern_only(st.rules.get(rule_id), &main) {
                    st.rules.get_mut(rule_id).normal_fp_only = Some(main.option.id);
                }
                for alt in &pmv {
                    finish_rule(st, mpse, rule_id, alt, false);
                }
            }

            if let (Some(ol_cand), Some(mpse)) = (&ol_main, slot.offload.as_deref_mut()) {
                added = true;
                if ol_cand.pmd.is_negated {
                    add_nfp = true;
                }

                finish_rule(st, mpse, rule_id, ol_cand, true);
                {
                    let rule = st.rules.get_mut(rule_id);
                    if ol_cand.pmd.pattern.len() > rule.longest_pattern_len {
                        rule.longest_pattern_len = ol_cand.pmd.pattern.len();
                    }
                }
                if make_fast_pattern_only(st.rules.get(rule_id), ol_cand) {
                    st.rules.get_mut(rule_id).offload_fp_only = Some(ol_cand.option.id);
                }
                for alt in &pmv_ol {
                    finish_rule(st, mpse, rule_id, alt, false);
                }
            }

            if added {
                if !add_nfp {
                    pg.rule_count += 1;
                } else {
                    pg.add_nfp_rule(rule_id);
                    print_nfp_info(&st.group_label, st.rules.get_mut(rule_id));
                }
            }
            return;
        }
    }

    if exclude {
        return;
    }

    pg.add_nfp_rule(rule_id);
    print_nfp_info(&st.group_label, st.rules.get_mut(rule_id));
}

/// Insert one chosen or alternate pattern into an engine, wrapped in
/// its PMX cookie. Only the chosen pattern goes through the final byte
/// transform; alternates are inserted verbatim.
fn finish_rule(
    st: &BuildState<'_>,
    mpse: &mut dyn Mpse,
    rule_id: RuleId,
    cand: &FpCandidate,
    transform: bool,
) {
    let bytes: &[u8] = if transform {
        final_pattern(st.fp, &cand.pmd)
    } else {
        &cand.pmd.pattern
    };

    if st.fp.options.debug_print_fast_patterns {
        print_fp_info(&st.group_label, st.rules.get(rule_id), &cand.pmd, bytes);
    }

    let desc = PatternDescriptor {
        no_case: cand.pmd.is_no_case,
        negated: cand.pmd.is_negated,
        literal: cand.pmd.is_literal,
        flags: cand.pmd.mpse_flags,
    };
    let pmx = Pmx::new(rule_id, cand.option.clone(), cand.pmd.clone());
    mpse.add_pattern(bytes, desc, pmx);
}

/// Finish a group: drop engines that received no patterns, build the
/// no-fast-pattern tree, and drop the group entirely when nothing in it
/// survived.
pub(crate) fn finish_group(st: &mut BuildState<'_>, mut pg: PortGroup) -> Option<PortGroup> {
    let mut has_rules = false;

    for slot in pg.mpse.iter_mut() {
        if let Some(group) = slot {
            if group
                .normal
                .as_ref()
                .map_or(false, |m| m.pattern_count() == 0)
            {
                group.normal = None;
            }
            if let Some(m) = &group.normal {
                if st.fp.options.debug_mode {
                    m.print_info();
                }
                has_rules = true;
            }

            if group
                .offload
                .as_ref()
                .map_or(false, |m| m.pattern_count() == 0)
            {
                group.offload = None;
            }
            if let Some(m) = &group.offload {
                if st.fp.options.debug_mode {
                    m.print_info();
                }
                has_rules = true;
            }

            if group.normal.is_none() && group.offload.is_none() {
                *slot = None;
            }
        }
    }

    if !pg.nfp_rules.is_empty() {
        let mut root = BuildRoot::new(pg.nfp_rules[0]);
        for &rule in &pg.nfp_rules {
            insert_rule(&mut root, st.rules, rule, MpseKind::Normal);
        }
        pg.nfp_tree = Some(st.dedup.finalize_root(root));
        has_rules = true;
        // nfp_rules stays on the group: the runtime walks it for every
        // packet reaching this group.
    }

    if !has_rules {
        return None;
    }
    Some(pg)
}

fn print_nfp_info(group: &str, rule: &mut Rule) {
    if rule.warned_fp {
        return;
    }
    let kind = if rule.longest_pattern_len > 0 {
        "negated"
    } else {
        "no"
    };
    warn!("{} rule {} has {} fast pattern", group, rule.sig, kind);
    rule.warned_fp = true;
}

fn pattern_info(pmd: &PatternMatchData, bytes: &[u8]) -> (String, String, String) {
    let mut hex = String::with_capacity(bytes.len() * 3);
    let mut txt = String::with_capacity(bytes.len());

    for &b in bytes {
        hex.push_str(&format!("{:02X} ", b));
        txt.push(if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '.'
        });
    }

    let mut opts = String::from("(");
    if pmd.is_fast_pattern {
        opts.push_str(" user");
    }
    if pmd.is_negated {
        opts.push_str(" negated");
    }
    opts.push_str(" )");

    (hex, txt, opts)
}

fn print_fp_info(group: &str, rule: &Rule, pmd: &PatternMatchData, bytes: &[u8]) {
    let (hex, txt, opts) = pattern_info(pmd, bytes);
    info!(
        "FP {} {} {}[{}] = '{}' |{}| {}",
        group,
        rule.sig,
        pmd.pm_type,
        bytes.len(),
        txt,
        hex.trim_end(),
        opts
    );
}

/// Per-group rule count trace used while building groups.
pub(crate) fn print_group_rule_counts(pg: &PortGroup, what: &str) {
    debug!("PortGroup rule summary ({}):", what);
    for pm_type in PmType::ALL {
        if let Some(group) = pg.mpse_group(pm_type) {
            let normal = group.normal.as_ref().map_or(0, |m| m.pattern_count());
            let offload = group.offload.as_ref().map_or(0, |m| m.pattern_count());
            if normal > 0 {
                debug!("  normal pattern matcher {}: {}", pm_type, normal);
            }
            if offload > 0 {
                debug!("  offload pattern matcher {}: {}", pm_type, offload);
            }
        }
    }
    if pg.nfp_rule_count > 0 {
        debug!("  no fast pattern: {}", pg.nfp_rule_count);
    }
}
