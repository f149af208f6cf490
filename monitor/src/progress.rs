//! Progress estimation from free-text step descriptions.
//!
//! The backend does not report numeric progress; it streams human-readable
//! step text, in English or Chinese. [`ProgressHeuristic`] maps that text to a
//! percentage through an ordered rule table. The first matching rule proposes
//! a candidate, and the result never drops below the previous value.
//!
//! The wording is backend-specific, so the table is a plain value that can be
//! replaced with [`ProgressHeuristic::with_rules`].

use std::sync::OnceLock;

use regex::Regex;

/// Progress used when no rule matches.
const DEFAULT_FLOOR: u8 = 30;

/// Upper bound of any estimate.
const MAX_PROGRESS: u8 = 100;

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s*%").expect("percent pattern is valid"))
}

/// Extracts the first `<n>%` marker from `text`.
#[must_use]
pub fn extract_percent(text: &str) -> Option<u32> {
    percent_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A predicate over lowercased step text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Text contains at least one of the phrases.
    ContainsAny(Vec<String>),
    /// Text carries an extractable `<n>%` marker.
    HasPercentNumber,
    /// Text contains a `%` sign.
    ContainsPercentSign,
}

impl Condition {
    /// Builds a case-insensitive phrase condition.
    #[must_use]
    pub fn contains_any(phrases: &[&str]) -> Self {
        Self::ContainsAny(phrases.iter().map(|p| p.to_lowercase()).collect())
    }

    fn matches(&self, lowered: &str) -> bool {
        match self {
            Self::ContainsAny(phrases) => phrases.iter().any(|p| lowered.contains(p.as_str())),
            Self::HasPercentNumber => extract_percent(lowered).is_some(),
            Self::ContainsPercentSign => lowered.contains('%'),
        }
    }
}

/// What a matching rule proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimate {
    Fixed(u8),
    /// The extracted percentage plus `offset`, capped at `cap`.
    PercentPlus { offset: u32, cap: u8 },
}

/// One row of the rule table. All conditions must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRule {
    conditions: Vec<Condition>,
    estimate: Estimate,
}

impl ProgressRule {
    /// Creates a rule proposing `estimate`; add conditions with [`when`](Self::when).
    #[must_use]
    pub fn new(estimate: Estimate) -> Self {
        Self {
            conditions: Vec::new(),
            estimate,
        }
    }

    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn candidate(&self, lowered: &str) -> Option<u8> {
        if !self.conditions.iter().all(|c| c.matches(lowered)) {
            return None;
        }
        match self.estimate {
            Estimate::Fixed(value) => Some(value),
            Estimate::PercentPlus { offset, cap } => {
                let percent = extract_percent(lowered)?;
                let raised = percent.saturating_add(offset).min(u32::from(cap));
                u8::try_from(raised).ok()
            }
        }
    }
}

fn analyzing() -> Condition {
    Condition::contains_any(&["analyzing", "正在分析"])
}

/// The rule table matching the backend's current wording.
#[must_use]
pub fn default_rules() -> Vec<ProgressRule> {
    vec![
        ProgressRule::new(Estimate::Fixed(10))
            .when(Condition::contains_any(&["analysis started", "开始页面分析", "开始分析"])),
        ProgressRule::new(Estimate::Fixed(20))
            .when(analyzing())
            .when(Condition::contains_any(&["0%"])),
        ProgressRule::new(Estimate::Fixed(40)).when(Condition::contains_any(&[
            "analyzing elements",
            "analyzing page elements",
            "正在分析页面元素",
            "分析页面元素",
        ])),
        ProgressRule::new(Estimate::PercentPlus { offset: 20, cap: 90 })
            .when(analyzing())
            .when(Condition::HasPercentNumber),
        ProgressRule::new(Estimate::Fixed(60))
            .when(analyzing())
            .when(Condition::ContainsPercentSign),
        ProgressRule::new(Estimate::Fixed(80)).when(Condition::contains_any(&[
            "saving result",
            "saving to knowledge base",
            "保存分析结果",
            "保存到知识库",
        ])),
        ProgressRule::new(Estimate::Fixed(95)).when(Condition::contains_any(&[
            "storage complete",
            "result saved",
            "✅",
            "存储完成",
            "分析结果已保存",
        ])),
        ProgressRule::new(Estimate::Fixed(100)).when(Condition::contains_any(&[
            "analysis complete",
            "save complete",
            "分析完成",
            "保存完成",
        ])),
    ]
}

/// Ordered rule table mapping step text to a progress estimate.
#[derive(Debug, Clone)]
pub struct ProgressHeuristic {
    rules: Vec<ProgressRule>,
    floor: u8,
}

impl Default for ProgressHeuristic {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            floor: DEFAULT_FLOOR,
        }
    }
}

impl ProgressHeuristic {
    /// Replaces the rule table, keeping the floor.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<ProgressRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the value used when no rule matches.
    #[must_use]
    pub fn with_floor(mut self, floor: u8) -> Self {
        self.floor = floor.min(MAX_PROGRESS);
        self
    }

    /// Returns the first matching rule's candidate, if any.
    #[must_use]
    pub fn classify(&self, step: &str) -> Option<u8> {
        let lowered = step.to_lowercase();
        self.rules.iter().find_map(|rule| rule.candidate(&lowered))
    }

    /// Returns the new progress after `step`. Never below `previous`.
    #[must_use]
    pub fn estimate(&self, previous: u8, step: &str) -> u8 {
        let candidate = self.classify(step).unwrap_or(self.floor);
        candidate.max(previous).min(MAX_PROGRESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(previous: u8, step: &str) -> u8 {
        ProgressHeuristic::default().estimate(previous, step)
    }

    #[test]
    fn analysis_started_is_ten() {
        assert_eq!(estimate(0, "Analysis started for login page"), 10);
        assert_eq!(estimate(0, "🚀 开始页面分析..."), 10);
    }

    #[test]
    fn analyzing_zero_percent_is_twenty() {
        assert_eq!(estimate(10, "analyzing元素 0%"), 20);
        assert_eq!(estimate(10, "正在分析... 0%"), 20);
    }

    #[test]
    fn zero_percent_rule_matches_any_round_ten() {
        // Plain substring match: "10%" and "50%" both contain "0%".
        assert_eq!(estimate(10, "Analyzing 10%"), 20);
        assert_eq!(estimate(10, "正在分析 50%"), 20);
        assert_eq!(estimate(10, "analyzing 35%"), 55);
    }

    #[test]
    fn analyzing_elements_is_forty() {
        assert_eq!(estimate(20, "Analyzing elements"), 40);
        assert_eq!(estimate(20, "🔍 正在分析页面元素"), 40);
    }

    #[test]
    fn explicit_percent_adds_twenty_capped() {
        assert_eq!(estimate(0, "analyzing 35%"), 55);
        assert_eq!(estimate(0, "正在分析 50 %"), 70);
        assert_eq!(estimate(0, "analyzing 85%"), 90);
        assert_eq!(estimate(0, "analyzing 99999999999999%"), 60);
    }

    #[test]
    fn percent_sign_without_number_is_sixty() {
        assert_eq!(estimate(0, "ANALYZING... %"), 60);
    }

    #[test]
    fn saving_storing_and_complete_stages() {
        assert_eq!(estimate(40, "Saving result"), 80);
        assert_eq!(estimate(40, "💾 保存到知识库"), 80);
        assert_eq!(estimate(80, "Result saved"), 95);
        assert_eq!(estimate(80, "✅ done"), 95);
        assert_eq!(estimate(80, "页面分析结果存储完成"), 95);
        assert_eq!(estimate(95, "Analysis complete"), 100);
        assert_eq!(estimate(95, "分析完成"), 100);
    }

    #[test]
    fn unmatched_text_uses_floor() {
        assert_eq!(estimate(0, "warming up the model"), 30);
        assert_eq!(estimate(55, "warming up the model"), 55);
    }

    #[test]
    fn progress_never_decreases() {
        let heuristic = ProgressHeuristic::default();
        let steps = [
            "Analysis started",
            "Saving result",
            "analyzing 0%",
            "Analyzing elements",
            "unrelated",
            "Analysis complete",
            "Analysis started",
        ];

        let mut progress = 0;
        for step in steps {
            let next = heuristic.estimate(progress, step);
            assert!(next >= progress, "{step}: {next} < {progress}");
            assert!(next <= 100);
            progress = next;
        }
        assert_eq!(progress, 100);
    }

    #[test]
    fn custom_rules_replace_table() {
        let heuristic = ProgressHeuristic::default()
            .with_rules(vec![ProgressRule::new(Estimate::Fixed(50))
                .when(Condition::contains_any(&["Halfway"]))])
            .with_floor(5);

        assert_eq!(heuristic.estimate(0, "we are HALFWAY there"), 50);
        assert_eq!(heuristic.estimate(0, "Analysis complete"), 5);
        assert_eq!(heuristic.classify("Analysis complete"), None);
    }

    #[test]
    fn extract_percent_reads_first_marker() {
        assert_eq!(extract_percent("step 3 of 4: 75% then 80%"), Some(75));
        assert_eq!(extract_percent("no marker"), None);
    }
}
