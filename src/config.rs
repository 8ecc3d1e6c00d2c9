//! Fast pattern compiler configuration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mpse::MpseApi;

/// Plain option flags, loadable from configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPatternOptions {
    /// Keep any-any rules in their own group instead of folding them
    /// into every directional group.
    pub split_any_any: bool,

    /// Pass the optimization hint to newly created engines.
    pub search_opt: bool,

    /// Cap inserted pattern length (0 = unlimited).
    pub max_pattern_len: usize,

    /// Print engine info while finishing groups.
    pub debug_mode: bool,

    /// Print one line per inserted fast pattern.
    pub debug_print_fast_patterns: bool,

    /// Trace group construction.
    pub debug_print_rule_group_build_details: bool,

    /// Configuration is being checked, not deployed.
    pub test_mode: bool,

    /// Compile engines even in test mode to measure memory.
    pub mem_check: bool,

    /// This build replaces a live configuration; disables the compile
    /// thread pool.
    pub hot_reload: bool,
}

impl Default for FastPatternOptions {
    fn default() -> Self {
        Self {
            split_any_any: false,
            search_opt: false,
            max_pattern_len: 0,
            debug_mode: false,
            debug_print_fast_patterns: false,
            debug_print_rule_group_build_details: false,
            test_mode: false,
            mem_check: false,
            hot_reload: false,
        }
    }
}

/// Options plus the selected search engine APIs.
pub struct FastPatternConfig {
    pub options: FastPatternOptions,
    search: Arc<dyn MpseApi>,
    offload_search: Option<Arc<dyn MpseApi>>,
    truncated: AtomicU32,
}

impl FastPatternConfig {
    pub fn new(search: Arc<dyn MpseApi>) -> Self {
        Self {
            options: FastPatternOptions::default(),
            search,
            offload_search: None,
            truncated: AtomicU32::new(0),
        }
    }

    pub fn with_options(mut self, options: FastPatternOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_offload(mut self, offload: Arc<dyn MpseApi>) -> Self {
        self.offload_search = Some(offload);
        self
    }

    pub fn search_api(&self) -> &Arc<dyn MpseApi> {
        &self.search
    }

    pub fn offload_search_api(&self) -> Option<&Arc<dyn MpseApi>> {
        self.offload_search.as_ref()
    }

    /// The offload engine only matters when it differs from the normal
    /// engine.
    pub fn distinct_offload_api(&self) -> Option<&Arc<dyn MpseApi>> {
        self.offload_search
            .as_ref()
            .filter(|ol| !Arc::ptr_eq(ol, &self.search))
    }

    /// Cap a pattern length at the configured maximum, counting every
    /// pattern the cap actually shortens.
    pub fn set_max(&self, bytes: usize) -> usize {
        let max = self.options.max_pattern_len;
        if max > 0 && bytes > max {
            self.truncated.fetch_add(1, Ordering::Relaxed);
            max
        } else {
            bytes
        }
    }

    pub fn num_patterns_truncated(&self) -> u32 {
        self.truncated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FastPatternConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastPatternConfig")
            .field("options", &self.options)
            .field("search", &self.search.name())
            .field(
                "offload_search",
                &self.offload_search.as_ref().map(|a| a.name()),
            )
            .field("truncated", &self.num_patterns_truncated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpse::ac::AcApi;

    #[test]
    fn test_set_max() {
        let mut fp = FastPatternConfig::new(Arc::new(AcApi));
        fp.options.max_pattern_len = 4;

        assert_eq!(fp.set_max(3), 3);
        assert_eq!(fp.num_patterns_truncated(), 0);

        assert_eq!(fp.set_max(10), 4);
        assert_eq!(fp.num_patterns_truncated(), 1);
    }

    #[test]
    fn test_unlimited_by_default() {
        let fp = FastPatternConfig::new(Arc::new(AcApi));
        assert_eq!(fp.set_max(4096), 4096);
        assert_eq!(fp.num_patterns_truncated(), 0);
    }

    #[test]
    fn test_distinct_offload() {
        let ac: Arc<dyn MpseApi> = Arc::new(AcApi);
        let same = FastPatternConfig::new(ac.clone()).with_offload(ac.clone());
        assert!(same.distinct_offload_api().is_none());

        let other: Arc<dyn MpseApi> = Arc::new(crate::mpse::rex::RexApi);
        let distinct = FastPatternConfig::new(ac).with_offload(other);
        assert!(distinct.distinct_offload_api().is_some());
    }
}
