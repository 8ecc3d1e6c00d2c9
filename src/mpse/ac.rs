//! Aho-Corasick search engine.
//!
//! Literal-only: the selector will never hand this engine a non-literal
//! fast pattern. Case folding is applied automaton-wide; a hit is a
//! prefilter event and the option tree re-verifies exact bytes.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use tracing::debug;

use super::{Mpse, MpseApi, PatternDescriptor, PatternState, PatternStore};
use crate::compiler::tree::MpseAgent;
use crate::error::{CompileError, Result};
use crate::rules::pattern::Pmx;

/// Factory for [`AcMpse`] instances.
pub struct AcApi;

impl MpseApi for AcApi {
    fn name(&self) -> &'static str {
        "ac"
    }

    fn regex_capable(&self) -> bool {
        false
    }

    fn parallel_compiles(&self) -> bool {
        true
    }

    fn create(&self) -> Result<Box<dyn Mpse>> {
        Ok(Box::new(AcMpse::default()))
    }

    fn print_summary(&self) {
        debug!("ac: byte-class Aho-Corasick automaton, literal patterns only");
    }
}

#[derive(Default)]
pub struct AcMpse {
    store: PatternStore,
    automaton: Option<AhoCorasick>,
    opt: bool,
}

impl AcMpse {
    /// State indices whose pattern occurs in `haystack`.
    pub fn find_candidates(&self, haystack: &[u8]) -> Vec<usize> {
        let automaton = match &self.automaton {
            Some(a) => a,
            None => return Vec::new(),
        };

        let mut hits: Vec<usize> = automaton
            .find_overlapping_iter(haystack)
            .map(|m| m.pattern().as_usize())
            .collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

impl Mpse for AcMpse {
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
            "ac mpse: {} patterns, opt={}",
            self.store.len(),
            self.opt
        );
    }

    fn compile(&mut self, agent: &MpseAgent) -> Result<()> {
        let patterns: Vec<&[u8]> = self
            .store
            .states()
            .iter()
            .map(|s| s.bytes.as_slice())
            .collect();

        let automaton = AhoCorasickBuilder::new()
            .match_kind(MatchKind::Standard)
            .ascii_case_insensitive(true)
            .build(&patterns)
            .map_err(|e| CompileError::Engine(e.to_string()))?;
        self.automaton = Some(automaton);

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
    use crate::rules::options::OptionInterner;
    use crate::rules::pattern::PatternMatchData;

    fn pmx(rule: u32, interner: &mut OptionInterner, pattern: &[u8]) -> Pmx {
        let opt = interner.content(PatternMatchData::literal(pattern));
        let pmd = opt.payload.as_content().unwrap().clone();
        Pmx::new(rule, opt, pmd)
    }

    fn literal_desc() -> PatternDescriptor {
        PatternDescriptor {
            literal: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_ac_capabilities() {
        let api = AcApi;
        assert!(!api.regex_capable());
        assert!(api.parallel_compiles());
    }

    #[test]
    fn test_ac_candidates() {
        let mut interner = OptionInterner::new();
        let mut mpse = AcMpse::default();
        mpse.add_pattern(b"malware", literal_desc(), pmx(0, &mut interner, b"malware"));
        mpse.add_pattern(b"exploit", literal_desc(), pmx(1, &mut interner, b"exploit"));
        assert_eq!(mpse.pattern_count(), 2);

        // Build the automaton without trees: empty-agent path is covered
        // by the compiler tests, here we only exercise the search.
        let patterns: Vec<&[u8]> = mpse.store.states().iter().map(|s| s.bytes.as_slice()).collect();
        mpse.automaton = Some(
            AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .ascii_case_insensitive(true)
                .build(&patterns)
                .unwrap(),
        );

        let hits = mpse.find_candidates(b"GET /exploit.php");
        assert_eq!(hits, vec![1]);

        let hits = mpse.find_candidates(b"MALWARE drop");
        assert_eq!(hits, vec![0]);
    }
}
