//! Stderr classification
//!
//! Stderr is plain diagnostic text: it never carries the completion marker
//! or tags. Each line is trimmed, noise is dropped, and what remains is an
//! error if it looks like one (case-insensitive keyword match), otherwise
//! agent output.

use crate::events::AgentEvent;

use super::noise::NoiseFilter;

/// Default keywords that mark a stderr line as an error
pub const DEFAULT_ERROR_KEYWORDS: &[&str] = &["error", "exception", "traceback"];

/// Classifier for stderr lines
#[derive(Clone, Debug)]
pub struct StderrClassifier {
    noise: NoiseFilter,
    /// Lower-cased error keywords
    error_keywords: Vec<String>,
}

impl Default for StderrClassifier {
    fn default() -> Self {
        Self::new(NoiseFilter::new(), DEFAULT_ERROR_KEYWORDS.iter().copied())
    }
}

impl StderrClassifier {
    /// Create a classifier from a noise filter and error keywords
    pub fn new<I, S>(noise: NoiseFilter, error_keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            noise,
            error_keywords: error_keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// The noise filter in use
    #[must_use]
    pub fn noise(&self) -> &NoiseFilter {
        &self.noise
    }

    /// Whether a (trimmed) line matches the error heuristic
    #[must_use]
    pub fn looks_like_error(&self, line: &str) -> bool {
        let lowered = line.to_lowercase();
        self.error_keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    /// Classify a single line; `None` means it was noise
    #[must_use]
    pub fn classify_line(&self, line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if self.noise.is_noise(trimmed) {
            return None;
        }
        if self.looks_like_error(trimmed) {
            Some(AgentEvent::ErrorMessage(trimmed.to_string()))
        } else {
            Some(AgentEvent::AgentOutput(trimmed.to_string()))
        }
    }

    /// Split a block of stderr text on `\n` and classify every line
    #[must_use]
    pub fn classify(&self, text: &str) -> Vec<AgentEvent> {
        text.split('\n')
            .filter_map(|line| self.classify_line(line))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_noise_is_dropped() {
        let classifier = StderrClassifier::default();
        assert_eq!(classifier.classify_line("   INFO  "), None);
        assert_eq!(classifier.classify_line(""), None);
    }

    #[test]
    fn test_traceback_is_error() {
        let classifier = StderrClassifier::default();
        assert_eq!(
            classifier.classify_line("Traceback (most recent call last):"),
            Some(AgentEvent::error("Traceback (most recent call last):"))
        );
        assert_eq!(
            classifier.classify_line("  ValueError: bad model name "),
            Some(AgentEvent::error("ValueError: bad model name"))
        );
    }

    #[test]
    fn test_other_lines_are_output() {
        let classifier = StderrClassifier::default();
        assert_eq!(
            classifier.classify_line("INFO     [agent] 📍 Step 2: clicking search"),
            Some(AgentEvent::output("INFO     [agent] 📍 Step 2: clicking search"))
        );
    }

    #[test]
    fn test_classify_block() {
        let classifier = StderrClassifier::default();
        let events = classifier.classify("INFO\nloading page\r\n  File \"x.py\", line 3\nKeyError: 'url'\n");
        assert_eq!(
            events,
            vec![
                AgentEvent::output("loading page"),
                AgentEvent::output("File \"x.py\", line 3"),
                AgentEvent::error("KeyError: 'url'"),
            ]
        );
    }

    #[test]
    fn test_custom_keywords() {
        let classifier = StderrClassifier::new(NoiseFilter::new(), ["FATAL", " "]);
        assert!(classifier.looks_like_error("fatal: out of memory"));
        assert!(!classifier.looks_like_error("Traceback (most recent call last):"));
    }
}
