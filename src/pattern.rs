use super::*;

/// Thin wrapper over `fancy_regex` so lookaround patterns can be used for plugin url
/// matchers and stylesheet rewriting, with errors folded into the crate error type.
#[derive(Debug, Clone)]
pub(crate) struct Pattern {
    backend: fancy_regex::Regex,
}

impl Pattern {
    pub(crate) fn new(pattern: &str) -> Result<Self> {
        Self::build(pattern, false)
    }

    pub(crate) fn case_insensitive(pattern: &str) -> Result<Self> {
        Self::build(pattern, true)
    }

    fn build(pattern: &str, case_insensitive: bool) -> Result<Self> {
        let mut builder = fancy_regex::RegexBuilder::new(pattern);
        builder.case_insensitive(case_insensitive);
        let backend = builder
            .build()
            .map_err(|err| Error::Configuration(format!("invalid pattern {pattern}: {err}")))?;
        Ok(Self { backend })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.backend.as_str()
    }

    /// Backtracking failures count as "no match".
    pub(crate) fn is_match(&self, input: &str) -> bool {
        self.backend.is_match(input).unwrap_or(false)
    }

    pub(crate) fn first_group(&self, input: &str, group: usize) -> Option<String> {
        let captures = self.backend.captures(input).ok()??;
        captures.get(group).map(|m| m.as_str().to_string())
    }

    /// All matched spans as `(start, end, groups)`.
    pub(crate) fn find_all(&self, input: &str) -> Vec<PatternMatch> {
        let mut out = Vec::new();
        for captures in self.backend.captures_iter(input) {
            let Ok(captures) = captures else {
                break;
            };
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let groups = (1..captures.len())
                .map(|idx| captures.get(idx).map(|m| m.as_str().to_string()))
                .collect();
            out.push(PatternMatch {
                start: whole.start(),
                end: whole.end(),
                text: whole.as_str().to_string(),
                groups,
            });
        }
        out
    }

    /// Replaces every match with the closure's output.
    pub(crate) fn replace_all_with(
        &self,
        input: &str,
        mut replacer: impl FnMut(&PatternMatch) -> String,
    ) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0usize;
        for matched in self.find_all(input) {
            out.push_str(&input[last..matched.start]);
            out.push_str(&replacer(&matched));
            last = matched.end;
        }
        out.push_str(&input[last..]);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PatternMatch {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) text: String,
    pub(crate) groups: Vec<Option<String>>,
}

impl PatternMatch {
    pub(crate) fn group(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return Some(self.text.as_str());
        }
        self.groups.get(index - 1).and_then(|g| g.as_deref())
    }
}
