//! Compiled target patterns.
//!
//! Brace alternation is expanded before compilation: `src/*.{ts,tsx}`
//! becomes the union of `src/*.ts` and `src/*.tsx`, each matched as an
//! ordinary glob against the same target.

use globset::{Glob, GlobMatcher};

use crate::error::PolicyError;

#[derive(Debug, Clone)]
pub struct TargetPattern {
    raw: String,
    matchers: Vec<GlobMatcher>,
}

impl TargetPattern {
    pub fn compile(rule_name: &str, pattern: &str) -> Result<Self, PolicyError> {
        let mut matchers = Vec::new();
        for alternative in expand_braces(pattern) {
            let glob = Glob::new(&alternative).map_err(|e| PolicyError::InvalidPattern {
                name: rule_name.to_string(),
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            matchers.push(glob.compile_matcher());
        }
        Ok(Self {
            raw: pattern.to_string(),
            matchers,
        })
    }

    pub fn matches(&self, target: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(target))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Expand single-level `{a,b,c}` alternation into one pattern per
/// alternative. Patterns without a complete brace pair pass through
/// unchanged (and stand or fall with the glob compiler).
fn expand_braces(pattern: &str) -> Vec<String> {
    let (Some(start), Some(end)) = (pattern.find('{'), pattern.find('}')) else {
        return vec![pattern.to_string()];
    };
    if end < start {
        return vec![pattern.to_string()];
    }

    let prefix = &pattern[..start];
    let suffix = &pattern[end + 1..];
    pattern[start + 1..end]
        .split(',')
        .map(|alt| format!("{prefix}{}{suffix}", alt.trim()))
        .collect()
}
