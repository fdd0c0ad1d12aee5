//! Lightweight tag inference over experience content.
//!
//! Tags are hints for retrieval and summaries only; nothing security-relevant
//! depends on them.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static TAG_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "error",
            r"(?i)\b(error|exception|panic|traceback|stack\s*trace|failed\s+with)\b",
        ),
        (
            "testing",
            r"(?i)\b(tests?|assert(ion)?s?|pytest|cargo\s+test|unit\s+test|coverage)\b",
        ),
        (
            "security",
            r"(?i)\b(security|vulnerab\w*|injection|xss|csrf|auth(entication|orization)?|exploit|sanitiz\w*)\b",
        ),
        (
            "performance",
            r"(?i)\b(performance|latency|slow|throughput|benchmark|optimi[sz]\w*|memory\s+leak)\b",
        ),
        (
            "database",
            r"(?i)\b(sql|sqlite|postgres(ql)?|mysql|database|query|queries|schema|migration)\b",
        ),
        (
            "file-reference",
            r"(?:^|\s)(?:\.{0,2}/)?[\w.-]+(?:/[\w.-]+)*\.(?:rs|py|ts|js|go|java|rb|toml|json|ya?ml|md)\b",
        ),
        (
            "success",
            r"(?i)\b(succeeded|success(ful(ly)?)?|passed|resolved|fixed|works?\s+now)\b",
        ),
        (
            "failure",
            r"(?i)\b(fail(ed|ure|ing)?|broken|regression|did\s+not\s+work|crash(ed)?)\b",
        ),
        (
            "dependency",
            r"(?i)\b(dependenc(y|ies)|package|crate|npm|pip|upgrade[ds]?|version\s+bump)\b",
        ),
        (
            "configuration",
            r"(?i)\b(config(uration)?|settings?|env(ironment)?\s+var(iable)?s?|\.env|flags?)\b",
        ),
    ]
    .into_iter()
    .map(|(tag, pattern)| (tag, Regex::new(pattern).expect("invalid regex")))
    .collect()
});

/// Infer tags from free-text content.
pub fn infer_tags(content: &str) -> BTreeSet<String> {
    TAG_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(content))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

/// Collect caller-supplied tags verbatim, dropping blank ones.
pub fn collect_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().to_string())
        .filter(|t| !t.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infers_security_and_database() {
        let tags = infer_tags("String concat in SQL queries allowed injection");
        assert!(tags.contains("security"));
        assert!(tags.contains("database"));
        assert!(!tags.contains("performance"));
    }

    #[test]
    fn test_infers_file_reference() {
        let tags = infer_tags("Edited src/auth/login.rs to validate tokens");
        assert!(tags.contains("file-reference"));
    }

    #[test]
    fn test_infers_outcomes() {
        assert!(infer_tags("All tests passed").contains("success"));
        assert!(infer_tags("Build failed with exit code 101").contains("failure"));
    }

    #[test]
    fn test_plain_text_has_no_tags() {
        assert!(infer_tags("Looked around the repository").is_empty());
    }

    #[test]
    fn test_caller_tags_kept_verbatim() {
        let tags = collect_tags(["Manual", " padded ", "", "   ", "Manual"]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec![" padded ", "Manual"]);
    }
}
