//! Exclusion patterns for replication and snapshots

use crate::error::{Error, Result};
use glob::Pattern;

/// Set of glob patterns; a path is excluded when any of its components,
/// or the whole path, matches a pattern
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<Pattern>,
}

impl ExclusionSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    Error::InvalidConfig(format!("Bad exclusion pattern {:?}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExclusionSet { patterns })
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern.matches(path) || path.split('/').any(|component| pattern.matches(component))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_style_exclusions() {
        let set = ExclusionSet::new(&[".git", "__pycache__", "*.pyc"]).unwrap();

        assert!(set.is_excluded(".git/HEAD"));
        assert!(set.is_excluded("src/__pycache__/mod.cpython-311.pyc"));
        assert!(set.is_excluded("train.pyc"));
        assert!(!set.is_excluded("checkpoints/epoch-3.pt"));
        assert!(!set.is_excluded("my.git.notes"));
    }

    #[test]
    fn test_empty_set_excludes_nothing() {
        assert!(!ExclusionSet::default().is_excluded(".git/config"));
    }
}
