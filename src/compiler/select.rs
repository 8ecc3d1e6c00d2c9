//! Fast pattern selection and the final byte transform.
//!
//! For each rule the selector picks at most one content option whose
//! bytes seed the multi-pattern engines; everything else the rule
//! checks stays in its option tree.

use std::sync::Arc;

use crate::config::FastPatternConfig;
use crate::rules::options::DetectionOption;
use crate::rules::pattern::PatternMatchData;
use crate::rules::Rule;

/// A content option picked for engine insertion.
#[derive(Debug, Clone)]
pub struct FpCandidate {
    pub option: Arc<DetectionOption>,
    pub pmd: Arc<PatternMatchData>,
}

/// Selector output. `pmv` holds alternates first and the chosen fast
/// pattern last; `exclude` marks rules that must not contribute to
/// fast-pattern matching at all.
#[derive(Debug, Default)]
pub struct FpSelection {
    pub pmv: Vec<FpCandidate>,
    pub exclude: bool,
}

/// Choose a rule's fast pattern for an engine with the given literal
/// capability.
///
/// An explicitly marked `fast_pattern` content wins outright, first
/// listed on ties. Otherwise the longest eligible content wins. Non-raw
/// buffers are eligible only in service groups, and a literal-only
/// engine rejects expression contents. A rule whose every content fails
/// only the literal test is excluded: it cannot seed this engine, and
/// scanning it unconditionally would not help the engine that can.
pub fn get_fp_content(rule: &Rule, is_service_group: bool, only_literal: bool) -> FpSelection {
    let mut eligible: Vec<FpCandidate> = Vec::new();
    let mut content_total = 0usize;
    let mut literal_rejections = 0usize;

    for (option, pmd) in rule.contents() {
        content_total += 1;

        if !is_service_group && !pmd.pm_type.is_raw() {
            continue;
        }
        if only_literal && !pmd.is_literal {
            literal_rejections += 1;
            continue;
        }

        eligible.push(FpCandidate {
            option: option.clone(),
            pmd: pmd.clone(),
        });
    }

    let mut best: Option<usize> = None;
    for (i, cand) in eligible.iter().enumerate() {
        best = match best {
            None => Some(i),
            Some(b) => {
                let incumbent = &eligible[b].pmd;
                let challenger = &cand.pmd;

                if incumbent.is_fast_pattern {
                    Some(b)
                } else if challenger.is_fast_pattern {
                    Some(i)
                } else if challenger.pattern.len() > incumbent.pattern.len() {
                    Some(i)
                } else {
                    Some(b)
                }
            }
        };
    }

    let best = match best {
        Some(b) => b,
        None => {
            return FpSelection {
                pmv: Vec::new(),
                exclude: content_total > 0 && literal_rejections == content_total,
            }
        }
    };

    // Alternates share the main pattern's buffer so every entry point
    // scans the same bytes.
    let main_pm_type = eligible[best].pmd.pm_type;
    let mut pmv: Vec<FpCandidate> = Vec::with_capacity(eligible.len());
    let mut main = None;
    for (i, cand) in eligible.into_iter().enumerate() {
        if i == best {
            main = Some(cand);
        } else if cand.pmd.pm_type == main_pm_type {
            pmv.push(cand);
        }
    }
    if let Some(main) = main {
        pmv.push(main);
    }

    FpSelection {
        pmv,
        exclude: false,
    }
}

/// Compute the exact bytes inserted into an engine for a chosen pattern.
///
/// Negated and non-literal patterns go in verbatim: shortening them
/// could suppress a hit the rule depends on or break the expression.
/// Fast patterns with a user slice take `pattern[fp_offset..]` capped by
/// `fp_length`, then the configured maximum length applies.
pub fn final_pattern<'a>(fp: &FastPatternConfig, pmd: &'a PatternMatchData) -> &'a [u8] {
    if pmd.is_negated || !pmd.is_literal {
        return &pmd.pattern;
    }

    let mut pattern: &[u8] = &pmd.pattern;

    if pmd.is_fast_pattern && (pmd.fp_offset > 0 || pmd.fp_length > 0) {
        // offset + length beyond the pattern is rejected at parse time
        debug_assert!(pmd.fp_offset + pmd.fp_length <= pmd.pattern.len());

        let start = pmd.fp_offset.min(pmd.pattern.len());
        let len = if pmd.fp_length > 0 {
            pmd.fp_length
        } else {
            pmd.pattern.len() - start
        };
        let end = (start + len).min(pmd.pattern.len());
        pattern = &pmd.pattern[start..end];
    }

    let capped = fp.set_max(pattern.len());
    &pattern[..capped]
}

/// True when a chosen pattern needs no tree-time re-evaluation: the
/// rule's single content, inserted whole, with nothing to re-check.
pub fn make_fast_pattern_only(rule: &Rule, cand: &FpCandidate) -> bool {
    let pmd = &cand.pmd;

    if pmd.fp_offset > 0 || pmd.fp_length > 0 {
        return false;
    }
    if pmd.is_negated || !pmd.is_literal {
        return false;
    }
    if pmd.has_constraints() {
        return false;
    }

    rule.content_count() == 1
        && rule
            .contents()
            .next()
            .map(|(opt, _)| opt.id == cand.option.id)
            .unwrap_or(false)
}
