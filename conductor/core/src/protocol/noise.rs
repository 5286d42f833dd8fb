//! Noise Classifier
//!
//! Decides whether a diagnostic line is zero-information boilerplate. The
//! agent's Python runtime and browser framework write a lot of chatter to
//! stderr; only what survives this filter reaches the surfaces.
//!
//! Rules are data: an ordered table of `(MatchKind, pattern)` pairs, all
//! matched case-insensitively against the trimmed line. A line is noise if
//! ANY rule matches. Keep rules conservative: a false positive hides
//! information the operator needs, so never match step narration.

use std::borrow::Cow;

/// How a rule's pattern is compared to a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// The whole trimmed line equals the pattern
    Exact,
    /// The trimmed line starts with the pattern
    Prefix,
    /// The pattern occurs anywhere in the line
    Contains,
}

/// One noise rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoiseRule {
    /// Comparison mode
    pub kind: MatchKind,
    /// Pattern, compared case-insensitively
    pub pattern: Cow<'static, str>,
}

impl NoiseRule {
    /// A rule over a static pattern
    #[must_use]
    pub const fn fixed(kind: MatchKind, pattern: &'static str) -> Self {
        Self {
            kind,
            pattern: Cow::Borrowed(pattern),
        }
    }

    /// A substring rule over an owned pattern (used for configured extras)
    pub fn contains(pattern: impl Into<String>) -> Self {
        Self {
            kind: MatchKind::Contains,
            pattern: Cow::Owned(pattern.into()),
        }
    }

    /// Check the rule against an already trimmed, lower-cased line
    fn matches(&self, lowered: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        match self.kind {
            MatchKind::Exact => lowered == pattern,
            MatchKind::Prefix => lowered.starts_with(&pattern),
            MatchKind::Contains => lowered.contains(&pattern),
        }
    }
}

/// Built-in rules
///
/// Bare log-level tokens, then known runtime/framework chatter.
pub static DEFAULT_NOISE_RULES: &[NoiseRule] = &[
    NoiseRule::fixed(MatchKind::Exact, "info"),
    NoiseRule::fixed(MatchKind::Exact, "debug"),
    NoiseRule::fixed(MatchKind::Exact, "warning"),
    NoiseRule::fixed(MatchKind::Exact, "warn"),
    NoiseRule::fixed(MatchKind::Exact, "trace"),
    NoiseRule::fixed(MatchKind::Contains, "anonymized telemetry enabled"),
    NoiseRule::fixed(MatchKind::Contains, "docs.browser-use.com/development/telemetry"),
    NoiseRule::fixed(MatchKind::Prefix, "[telemetry]"),
    NoiseRule::fixed(MatchKind::Prefix, "warnings.warn("),
    NoiseRule::fixed(MatchKind::Contains, "deprecationwarning"),
    NoiseRule::fixed(MatchKind::Prefix, "httpx - info - http request:"),
    NoiseRule::fixed(MatchKind::Contains, "[httpx] http request:"),
    NoiseRule::fixed(MatchKind::Contains, "[cdp_use.client]"),
    NoiseRule::fixed(MatchKind::Contains, "[bubus]"),
];

/// Ordered set of noise rules
#[derive(Clone, Debug)]
pub struct NoiseFilter {
    rules: Vec<NoiseRule>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseFilter {
    /// Filter with the built-in rules
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: DEFAULT_NOISE_RULES.to_vec(),
        }
    }

    /// Filter with the built-in rules plus configured substring patterns
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = Self::new();
        filter.rules.extend(
            extra
                .into_iter()
                .map(Into::into)
                .filter(|p| !p.trim().is_empty())
                .map(NoiseRule::contains),
        );
        filter
    }

    /// Append a rule (checked after the existing ones)
    pub fn push(&mut self, rule: NoiseRule) {
        self.rules.push(rule);
    }

    /// The rules, in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[NoiseRule] {
        &self.rules
    }

    /// Whether `line` is boilerplate to suppress
    ///
    /// Blank lines are noise.
    #[must_use]
    pub fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return true;
        }
        let lowered = trimmed.to_lowercase();
        self.rules.iter().any(|rule| rule.matches(&lowered))
    }
}

/// Check a line against the built-in rules
#[must_use]
pub fn is_noise(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    DEFAULT_NOISE_RULES.iter().any(|rule| rule.matches(&lowered))
}
