use crate::error::{StoreError, StoreResult};
use regex::Regex;

/// Compiles repository name globs into one anchored, case-insensitive regex.
/// `*` matches any run of characters, everything else is literal.
pub fn compile_patterns(patterns: &[String]) -> StoreResult<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternatives: Vec<String> = patterns
        .iter()
        .map(|pattern| {
            pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*")
        })
        .collect();
    let source = format!("(?i)^(?:{})$", alternatives.join("|"));
    Regex::new(&source)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(format!("invalid repository pattern: {}", e)))
}
