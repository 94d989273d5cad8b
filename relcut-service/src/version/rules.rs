// Version Rules
// Compiles (glob, match, replace) rules for one old -> new version pair

use crate::error::ConfigError;
use crate::parser::models::VersionRule;
use crate::utils::PathGlob;

use regex::bytes::{NoExpand, Regex};
use std::borrow::Cow;
use std::ops::Range;
use std::path::Path;

const OLD: &str = "{old}";
const NEW: &str = "{new}";

/// A rule ready to run against file contents
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Position in the rule list (0-based)
    pub index: usize,
    glob: PathGlob,
    matcher: Regex,
    replacement: String,
    /// Regex rules may reference capture groups in the replacement
    expand: bool,
}

impl CompiledRule {
    pub fn compile(
        index: usize,
        rule: &VersionRule,
        old: &str,
        new: &str,
    ) -> Result<Self, ConfigError> {
        let glob = PathGlob::new(&rule.file_glob).map_err(|e| ConfigError::InvalidGlob {
            pattern: rule.file_glob.clone(),
            message: e.to_string(),
        })?;

        if !rule.match_pattern.contains(OLD) && !rule.match_pattern.contains(old) {
            return Err(ConfigError::UnanchoredRule {
                glob: rule.file_glob.clone(),
                pattern: rule.match_pattern.clone(),
            });
        }

        let source = if rule.regex {
            rule.match_pattern.replace(OLD, &regex::escape(old))
        } else {
            regex::escape(&rule.match_pattern.replace(OLD, old))
        };
        let matcher = Regex::new(&source).map_err(|e| ConfigError::InvalidPattern {
            pattern: rule.match_pattern.clone(),
            message: e.to_string(),
        })?;

        let replacement = rule
            .replacement_template
            .replace(NEW, new)
            .replace(OLD, old);
        if !replacement.contains(new) {
            return Err(ConfigError::MissingNewVersion {
                glob: rule.file_glob.clone(),
                replacement: rule.replacement_template.clone(),
            });
        }

        let compiled = Self {
            index,
            glob,
            matcher,
            replacement,
            expand: rule.regex,
        };

        if compiled.matcher.is_match(compiled.literal_replacement().as_bytes()) {
            return Err(compiled.non_idempotent());
        }

        Ok(compiled)
    }

    pub fn glob(&self) -> &str {
        self.glob.as_str()
    }

    /// Whether the rule applies to a path relative to the tree root
    pub fn applies_to(&self, relative: &Path) -> bool {
        self.glob.matches(relative)
    }

    pub fn is_match(&self, contents: &[u8]) -> bool {
        self.matcher.is_match(contents)
    }

    /// Byte ranges the rule would rewrite
    pub fn ranges(&self, contents: &[u8]) -> Vec<Range<usize>> {
        self.matcher.find_iter(contents).map(|m| m.range()).collect()
    }

    /// Rewrite every match; returns the new contents and the number of replacements
    pub fn apply<'a>(&self, contents: &'a [u8]) -> (Cow<'a, [u8]>, usize) {
        let count = self.matcher.find_iter(contents).count();
        if count == 0 {
            return (Cow::Borrowed(contents), 0);
        }

        let rewritten = if self.expand {
            self.matcher
                .replace_all(contents, self.replacement.as_bytes())
        } else {
            self.matcher
                .replace_all(contents, NoExpand(self.replacement.as_bytes()))
        };
        (rewritten, count)
    }

    pub(crate) fn non_idempotent(&self) -> ConfigError {
        ConfigError::NonIdempotentRule {
            glob: self.glob.as_str().to_string(),
            replacement: self.replacement.clone(),
        }
    }

    /// Replacement with capture group references removed
    fn literal_replacement(&self) -> Cow<'_, str> {
        if !self.expand {
            return Cow::Borrowed(&self.replacement);
        }
        match regex::Regex::new(r"\$(\{[^}]*\}|[A-Za-z0-9_]+)") {
            Ok(group_ref) => group_ref.replace_all(&self.replacement, ""),
            Err(_) => Cow::Borrowed(&self.replacement),
        }
    }
}

/// Validate the version pair and compile every rule, failing on the first bad one
pub fn compile_rules(
    rules: &[VersionRule],
    old: &str,
    new: &str,
) -> Result<Vec<CompiledRule>, ConfigError> {
    if old.is_empty() || new.is_empty() {
        return Err(ConfigError::EmptyVersion);
    }
    if old == new {
        return Err(ConfigError::SameVersion(old.to_string()));
    }

    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| CompiledRule::compile(i, rule, old, new))
        .collect()
}

/// First pair of overlapping ranges from different rules, as (first, second) rule indices
pub fn find_overlap(ranges: &[(usize, Vec<Range<usize>>)]) -> Option<(usize, usize)> {
    for (i, (first, a)) in ranges.iter().enumerate() {
        for (second, b) in &ranges[i + 1..] {
            if first == second {
                continue;
            }
            let overlaps = a
                .iter()
                .any(|x| b.iter().any(|y| x.start < y.end && y.start < x.end));
            if overlaps {
                return Some((*first, *second));
            }
        }
    }
    None
}
