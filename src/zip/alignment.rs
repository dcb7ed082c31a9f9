//! Alignment rules: which entries must have their data start on a boundary.

use globset::{Glob, GlobMatcher};

use crate::error::Result;

/// No alignment constraint
pub const NO_ALIGNMENT: u64 = 1;

#[derive(Debug, Clone)]
enum NamePattern {
    Any,
    Suffix(String),
    Glob(GlobMatcher),
}

impl NamePattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Any => true,
            NamePattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
            NamePattern::Glob(matcher) => matcher.is_match(name),
        }
    }
}

/// Ordered list of name pattern to alignment rules.
///
/// The first rule whose pattern matches a name decides its alignment;
/// names matching no rule are not aligned.
///
/// ```
/// use rezip::AlignmentRules;
///
/// let rules = AlignmentRules::new()
///     .with_suffix(".so", 4096)
///     .with_pattern("assets/**", 4)
///     .unwrap();
/// assert_eq!(rules.alignment("lib/arm64/libfoo.so"), 4096);
/// assert_eq!(rules.alignment("assets/img.png"), 4);
/// assert_eq!(rules.alignment("classes.dex"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct AlignmentRules {
    rules: Vec<(NamePattern, u64)>,
}

impl AlignmentRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align every entry to `alignment`
    pub fn constant(alignment: u64) -> Self {
        Self::new().with_all(alignment)
    }

    /// Align entries whose name ends with `suffix` to `alignment`
    pub fn constant_for_suffix(suffix: &str, alignment: u64) -> Self {
        Self::new().with_suffix(suffix, alignment)
    }

    pub fn with_all(mut self, alignment: u64) -> Self {
        self.rules.push((NamePattern::Any, alignment));
        self
    }

    pub fn with_suffix(mut self, suffix: &str, alignment: u64) -> Self {
        self.rules
            .push((NamePattern::Suffix(suffix.to_string()), alignment));
        self
    }

    /// Add a glob rule such as `*.so` or `lib/**`.
    pub fn with_pattern(mut self, pattern: &str, alignment: u64) -> Result<Self> {
        let matcher = Glob::new(pattern)?.compile_matcher();
        self.rules.push((NamePattern::Glob(matcher), alignment));
        Ok(self)
    }

    /// Required alignment of the data of entry `name`.
    pub fn alignment(&self, name: &str) -> u64 {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(name))
            .map(|(_, alignment)| (*alignment).max(NO_ALIGNMENT))
            .unwrap_or(NO_ALIGNMENT)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rules_means_no_alignment() {
        let rules = AlignmentRules::new();
        assert!(rules.is_empty());
        assert_eq!(rules.alignment("anything"), NO_ALIGNMENT);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = AlignmentRules::new()
            .with_pattern("*.so", 4096)
            .unwrap()
            .with_suffix(".so", 16)
            .with_all(4);

        assert_eq!(rules.alignment("lib/x86/libm.so"), 4096);
        assert_eq!(rules.alignment("res/raw/a.bin"), 4);
    }

    #[test]
    fn test_constant_forms() {
        assert_eq!(AlignmentRules::constant(8).alignment("x"), 8);

        let txt = AlignmentRules::constant_for_suffix(".txt", 1024);
        assert_eq!(txt.alignment("test.txt"), 1024);
        assert_eq!(txt.alignment("test.txt.bak"), 1);
    }

    #[test]
    fn test_zero_alignment_is_treated_as_one() {
        assert_eq!(AlignmentRules::constant(0).alignment("x"), 1);
    }

    #[test]
    fn test_invalid_glob_is_an_error() {
        assert!(AlignmentRules::new().with_pattern("a[", 4).is_err());
    }
}
