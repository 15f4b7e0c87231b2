//! Regular-expression gates over symbols and modules.

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// What a filter's expression is matched against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterMode {
    /// Demangled function signatures.
    Symbol,
    /// Absolute module paths.
    Module,
}

/// A filter expression failed to compile.
#[derive(Debug, Error)]
#[error("failed to compile filter '{pattern}': {err}")]
pub struct CompileError {
    pattern: String,
    #[source]
    err: regex::Error,
}

/// A compiled, immutable filter.
///
/// A filter owns its compiled state and is deliberately move-only; [Filter::try_clone]
/// recompiles an equivalent filter from the source pattern.
#[derive(Debug)]
pub struct Filter {
    expr: Regex,
    pattern: String,
    icase: bool,
    mode: FilterMode,
}

impl Filter {
    pub fn new(pattern: &str, icase: bool, mode: FilterMode) -> Result<Self, CompileError> {
        let expr = RegexBuilder::new(pattern)
            .case_insensitive(icase)
            .build()
            .map_err(|err| CompileError {
                pattern: pattern.to_owned(),
                err,
            })?;
        Ok(Self {
            expr,
            pattern: pattern.to_owned(),
            icase,
            mode,
        })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.icase
    }

    /// Apply the filter. A pure function of the pattern, the case flag and the text.
    pub fn matches(&self, text: &str) -> bool {
        self.expr.is_match(text)
    }

    /// Recompile an identical filter from the source pattern.
    pub fn try_clone(&self) -> Result<Self, CompileError> {
        Self::new(&self.pattern, self.icase, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::{Filter, FilterMode};

    #[test]
    fn symbol_filter_matches_std_prefix() {
        let f = Filter::new("^std::", false, FilterMode::Symbol).unwrap();
        assert!(f.matches("std::vector<int>::push_back"));
        assert!(!f.matches("MyClass::foo"));
        assert!(f.matches("std::__cxx::something"));
    }

    #[test]
    fn case_insensitive() {
        let f = Filter::new("^LIBFOO", true, FilterMode::Module).unwrap();
        assert!(f.matches("libfoo.so.3"));
        assert!(f.matches("LibFoo.so"));
        let strict = Filter::new("^LIBFOO", false, FilterMode::Module).unwrap();
        assert!(!strict.matches("libfoo.so.3"));
    }

    #[test]
    fn bad_pattern_is_a_compile_error() {
        let err = Filter::new("(unterminated", false, FilterMode::Symbol).unwrap_err();
        assert!(err.to_string().contains("(unterminated"));
    }

    #[test]
    fn try_clone_recompiles() {
        let f = Filter::new("ab+c", true, FilterMode::Symbol).unwrap();
        let g = f.try_clone().unwrap();
        assert_eq!(g.pattern(), "ab+c");
        assert_eq!(g.mode(), FilterMode::Symbol);
        assert!(g.is_case_insensitive());
        assert!(g.matches("xABBC!"));
    }

    #[test]
    fn matching_is_pure() {
        let f = Filter::new("^a.c$", false, FilterMode::Symbol).unwrap();
        for _ in 0..3 {
            assert!(f.matches("abc"));
            assert!(!f.matches("abcd"));
        }
    }
}
