//! Ordered progress rules.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a rule recognizes a line.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Any of the keywords, case-insensitive substring match.
    Keywords(Vec<String>),
    /// Case-insensitive regular expression.
    Pattern(Regex),
}

impl Matcher {
    pub fn keywords<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Keywords(
            words
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
        )
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Self::Pattern)
            .map_err(|e| Error::config(format!("invalid classifier pattern `{pattern}`: {e}")))
    }

    /// `lowered` must be the lowercase form of `line`.
    fn matches(&self, line: &str, lowered: &str) -> bool {
        match self {
            Self::Keywords(words) => words.iter().any(|w| lowered.contains(w.as_str())),
            Self::Pattern(re) => re.is_match(line),
        }
    }
}

/// Step label and progress floor inferred from a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHint {
    pub step: String,
    pub floor: u8,
}

#[derive(Debug, Clone)]
pub struct ProgressRule {
    pub matcher: Matcher,
    pub step: String,
    pub floor: u8,
}

impl ProgressRule {
    pub fn new(matcher: Matcher, step: impl Into<String>, floor: u8) -> Self {
        Self {
            matcher,
            step: step.into(),
            floor: floor.min(100),
        }
    }
}

/// Rule as written in the configuration file.
///
/// Exactly one of `keywords` or `pattern` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    pub step: String,
    pub floor: u8,
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<ProgressRule> {
        let matcher = match (&self.pattern, self.keywords.is_empty()) {
            (Some(pattern), true) => Matcher::pattern(pattern)?,
            (None, false) => Matcher::keywords(&self.keywords),
            (Some(_), false) => {
                return Err(Error::config(format!(
                    "classifier rule `{}` sets both keywords and pattern",
                    self.step
                )));
            }
            (None, true) => {
                return Err(Error::config(format!(
                    "classifier rule `{}` has no keywords or pattern",
                    self.step
                )));
            }
        };
        Ok(ProgressRule::new(matcher, &self.step, self.floor))
    }
}

/// Ordered rule table; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<ProgressRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::defaults()
    }
}

impl RuleSet {
    pub fn new(rules: Vec<ProgressRule>) -> Self {
        Self { rules }
    }

    /// Built-in table for the content workers.
    ///
    /// More specific phases come first: a line like "merging downloaded
    /// scenes" reports the merge, not the download.
    pub fn defaults() -> Self {
        Self::new(vec![
            ProgressRule::new(
                Matcher::keywords(["merging", "merge", "concat"]),
                "final merge",
                85,
            ),
            ProgressRule::new(Matcher::keywords(["publishing"]), "publishing", 80),
            ProgressRule::new(Matcher::keywords(["scene"]), "scene rendering", 70),
            ProgressRule::new(Matcher::keywords(["tts"]), "voice synthesis", 60),
            ProgressRule::new(Matcher::keywords(["uploading"]), "uploading", 50),
            ProgressRule::new(Matcher::keywords(["downloading"]), "media download", 45),
            ProgressRule::new(Matcher::keywords(["crawling"]), "image crawl", 30),
        ])
    }

    /// Build from configuration; an empty list keeps the defaults.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        if rules.is_empty() {
            return Ok(Self::defaults());
        }
        rules
            .iter()
            .map(RuleConfig::to_rule)
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn hint_for(&self, line: &str) -> Option<ProgressHint> {
        let lowered = line.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(line, &lowered))
            .map(|rule| ProgressHint {
                step: rule.step.clone(),
                floor: rule.floor,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_worker_phases() {
        let rules = RuleSet::defaults();
        let hint = rules.hint_for("Downloading media 3/7").unwrap();
        assert_eq!(hint.step, "media download");
        assert_eq!(hint.floor, 45);

        assert_eq!(rules.hint_for("TTS: chunk 2").unwrap().floor, 60);
        assert_eq!(rules.hint_for("rendering scene 4").unwrap().floor, 70);
        assert_eq!(rules.hint_for("Merging clips").unwrap().step, "final merge");
        assert_eq!(rules.hint_for("crawling page 2").unwrap().floor, 30);
        assert!(rules.hint_for("hello world").is_none());
    }

    #[test]
    fn first_match_wins() {
        let rules = RuleSet::defaults();
        let hint = rules.hint_for("merging downloaded scene files").unwrap();
        assert_eq!(hint.step, "final merge");
    }

    #[test]
    fn config_rules_replace_defaults() {
        let rules = RuleSet::from_config(&[
            RuleConfig {
                keywords: vec![],
                pattern: Some(r"^step (\d+)/\d+".to_string()),
                step: "custom step".to_string(),
                floor: 20,
            },
            RuleConfig {
                keywords: vec!["Thumbnail".to_string()],
                pattern: None,
                step: "thumbnail".to_string(),
                floor: 75,
            },
        ])
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules.hint_for("STEP 3/9 done").unwrap().floor, 20);
        assert_eq!(rules.hint_for("writing thumbnail").unwrap().floor, 75);
        assert!(rules.hint_for("downloading").is_none());
    }

    #[test]
    fn invalid_config_rules_are_rejected() {
        let both = RuleConfig {
            keywords: vec!["a".to_string()],
            pattern: Some("a".to_string()),
            step: "x".to_string(),
            floor: 1,
        };
        assert!(matches!(both.to_rule(), Err(Error::Configuration(_))));

        let bad_regex = RuleConfig {
            keywords: vec![],
            pattern: Some("(".to_string()),
            step: "x".to_string(),
            floor: 1,
        };
        assert!(bad_regex.to_rule().is_err());
        assert_eq!(RuleSet::from_config(&[]).unwrap().len(), 7);
    }
}
