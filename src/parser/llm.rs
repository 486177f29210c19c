use crate::error::ParseError;
use crate::model::{ParseHints, ParsedFundReport};

/// Last-resort extractor seam. No implementation ships in v1; the facade
/// keeps the fallback slot so one can be installed without touching the
/// routing. The facade always runs on a blocking worker, so
/// implementations may issue blocking network calls.
pub trait LlmExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, content: &str, hints: &ParseHints) -> Result<ParsedFundReport, ParseError>;
}
