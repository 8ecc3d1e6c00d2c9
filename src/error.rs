use thiserror::Error;

use crate::rules::pattern::PmType;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to create {kind} pattern matcher for {pm_type}")]
    MpseCreate { kind: &'static str, pm_type: PmType },

    #[error("failed to compile {0} search engines")]
    MpseCompileShortfall(usize),

    #[error("no protocol ordinal registered for service '{0}'")]
    UnknownService(String),

    #[error("search engine error: {0}")]
    Engine(String),

    #[error("fast pattern compilation failed with {} errors", .0.len())]
    Failed(Vec<CompileError>),
}

pub type Result<T> = std::result::Result<T, CompileError>;
