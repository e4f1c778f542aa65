//! Legal research domain: result records, agent prompts, and model-output parsing.

pub(crate) mod parse;
pub(crate) mod prompts;
pub(crate) mod records;

pub use records::{Citation, ComposedResponse, ResultRecord, SearchTerms, SourceKind};
