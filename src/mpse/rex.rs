//! Regex-set search engine.
//!
//! Regex-capable: accepts both literal contents and regex-shaped
//! patterns, so rules whose only candidates are expressions still get a
//! fast pattern here. Literals are escaped byte-by-byte into the set.

use regex::bytes::RegexSet;
use tracing::debug;

use super::{Mpse, MpseApi, PatternDescriptor, PatternState, PatternStore};
use crate::compiler::tree::MpseAgent;
use crate::error::{CompileError, Result};
use crate::rules::pattern::Pmx;

/// Factory for [`RexMpse`] instances.
pub struct RexApi;

impl MpseApi for RexApi {
    fn name(&self) -> &'static str {
        "rex"
    }

    fn regex_capable(&self) -> bool {
        true
    }

    fn parallel_compiles(&self) -> bool {
        true
    }

    fn create(&self) -> Result<Box<dyn Mpse>> {
        Ok(Box::new(RexMpse::default()))
    }

    fn print_summary(&self) {
        debug!("rex: lazy DFA regex set, literal and expression patterns");
    }
}

#[derive(Default)]
pub struct RexMpse {
    store: PatternStore,
    set: Option<RegexSet>,
    opt: bool,
}

/// Render pattern bytes as a regex expression. Literal bytes are
/// escaped; expression patterns pass through as written.
fn pattern_to_expr(bytes: &[u8], desc: &PatternDescriptor) -> String {
    let mut expr = String::new();
    if desc.no_case {
        expr.push_str("(?i)");
    }

    if !desc.literal {
        expr.push_str(&String::from_utf8_lossy(bytes));
        return expr;
    }

    for byte in bytes {
        match *byte {
            b'.' | b'^' | b'$' | b'*' | b'+' | b'?' | b'{' | b'}' | b'[' | b']' | b'\\'
            | b'|' | b'(' | b')' => {
                expr.push('\\');
                expr.push(*byte as char);
            }
            0x20..=0x7e => expr.push(*byte as char),
            _ => expr.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    expr
}

impl RexMpse {
    /// State indices whose pattern occurs in `haystack`.
    pub fn find_candidates(&self, haystack: &[u8]) -> Vec<usize> {
        match &self.set {
            Some(set) => set.matches(haystack).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

impl Mpse for RexMpse {
    fn add_pattern(&mut self, bytes: &[u8], desc: PatternDescriptor, pmx: Pmx) {
        self.store.add(bytes, desc, pmx);
    }

    fn pattern_count(&self) -> usize {
        self.store.len()
    }

    fn set_opt(&mut self, enable: bool) {
        self.opt = enable;
    }

    fn print_info(&self) {
        debug!(
            "rex mpse: {} patterns, opt={}",
            self.store.len(),
            self.opt
        );
    }

    fn compile(&mut self, agent: &MpseAgent) -> Result<()> {
        let exprs: Vec<String> = self
            .store
            .states()
            .iter()
            .map(|s| pattern_to_expr(&s.bytes, &s.desc))
            .collect();

        let set = RegexSet::new(&exprs).map_err(|e| CompileError::Engine(e.to_string()))?;
        self.set = Some(set);

        self.store.build_trees(agent)
    }

    fn states(&self) -> &[PatternState] {
        self.store.states()
    }

    fn neg_list(&self) -> &[Pmx] {
        self.store.neg_list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rex_capabilities() {
        let api = RexApi;
        assert!(api.regex_capable());
        assert!(api.parallel_compiles());
    }

    #[test]
    fn test_literal_escaping() {
        let desc = PatternDescriptor {
            literal: true,
            ..Default::default()
        };
        let expr = pattern_to_expr(b"a.b(c)\x01", &desc);
        assert_eq!(expr, "a\\.b\\(c\\)\\x01");
    }

    #[test]
    fn test_expression_passthrough() {
        let desc = PatternDescriptor {
            literal: false,
            no_case: true,
            ..Default::default()
        };
        let expr = pattern_to_expr(b"GET\\s+/admin", &desc);
        assert_eq!(expr, "(?i)GET\\s+/admin");
    }
}
