//! Filter construction
//!
//! Turns declarative prefix and pattern specs into an ordered chain of
//! typed filters. Each filter carries the number of leading bytes it needs
//! visible before it is evaluated.

use regex::bytes::{Regex, RegexBuilder};

/// Bytes a pattern filter may inspect when `maxRead` is unset or zero
pub const DEFAULT_MAX_READ: u32 = 4096;

/// Declarative pattern spec as it appears in configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternSpec {
    pub pattern: String,
    pub max_read: u32,
}

impl PatternSpec {
    pub fn new(pattern: &str, max_read: u32) -> Self {
        Self {
            pattern: pattern.to_string(),
            max_read,
        }
    }

    /// Bytes this spec is allowed to inspect
    pub fn effective_max_read(&self) -> usize {
        if self.max_read == 0 {
            DEFAULT_MAX_READ as usize
        } else {
            self.max_read as usize
        }
    }
}

/// What a filter tests the collected bytes against
#[derive(Clone, Debug)]
pub enum FilterKind {
    /// Exact byte-prefix equality
    Prefix(Vec<u8>),
    /// Regex match anywhere in the collected bytes
    Pattern(Regex),
}

/// A single signature filter
#[derive(Clone, Debug)]
pub struct Filter {
    threshold: usize,
    kind: FilterKind,
}

impl Filter {
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            threshold: prefix.len(),
            kind: FilterKind::Prefix(prefix.to_vec()),
        }
    }

    pub fn pattern(regex: Regex, threshold: usize) -> Self {
        Self {
            threshold,
            kind: FilterKind::Pattern(regex),
        }
    }

    /// Total bytes from stream start this filter wants before evaluation
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn kind(&self) -> &FilterKind {
        &self.kind
    }

    /// Short name of the filter kind
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            FilterKind::Prefix(_) => "prefix",
            FilterKind::Pattern(_) => "pattern",
        }
    }

    /// Evaluate against whatever has been collected so far
    pub fn is_match(&self, collected: &[u8]) -> bool {
        match &self.kind {
            FilterKind::Prefix(prefix) => collected.starts_with(prefix),
            FilterKind::Pattern(regex) => regex.is_match(collected),
        }
    }

    /// Human-readable label for logs and telemetry
    pub fn describe(&self) -> String {
        match self.kind() {
            FilterKind::Prefix(prefix) => {
                format!("{}:{}", self.kind_name(), String::from_utf8_lossy(prefix))
            }
            FilterKind::Pattern(regex) => format!("{}:{}", self.kind_name(), regex.as_str()),
        }
    }
}

/// Compile a signature for raw connection bytes.
///
/// Unicode mode is off: `.` and negated classes match any single byte
/// (except `\n` for `.`), so binary protocols can be described.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).unicode(false).build()
}

/// Ordered filter sequence, immutable once built
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Build the chain: prefix filters first, then pattern filters, each
    /// group in the order given. Empty entries produce no filter.
    pub fn build(prefixes: &[String], patterns: &[PatternSpec]) -> Result<Self, BuildError> {
        let mut filters = Vec::with_capacity(prefixes.len() + patterns.len());

        for prefix in prefixes {
            if prefix.is_empty() {
                continue;
            }
            filters.push(Filter::prefix(prefix.as_bytes()));
        }

        for (index, spec) in patterns.iter().enumerate() {
            if spec.pattern.is_empty() {
                continue;
            }
            let regex = compile_pattern(&spec.pattern).map_err(|e| BuildError::InvalidPattern {
                index,
                pattern: spec.pattern.clone(),
                reason: e.to_string(),
            })?;
            filters.push(Filter::pattern(regex, spec.effective_max_read()));
        }

        Ok(Self { filters })
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Largest threshold in the chain (0 when empty)
    pub fn max_threshold(&self) -> usize {
        self.filters.iter().map(Filter::threshold).max().unwrap_or(0)
    }
}

/// Filter construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    InvalidPattern {
        index: usize,
        pattern: String,
        reason: String,
    },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidPattern {
                index,
                pattern,
                reason,
            } => write!(
                f,
                "Invalid prefix pattern #{} '{}': {}",
                index, pattern, reason
            ),
        }
    }
}

impl std::error::Error for BuildError {}
