//! Validation report — per-check outcomes plus one aggregate verdict

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of a single named check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckOutcome {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
    /// Advisory checks never block the verdict
    pub required: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, outcome: CheckOutcome, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            required: true,
            detail: detail.into(),
            items: Vec::new(),
        }
    }

    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckOutcome::Pass, detail)
    }

    pub fn warn(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckOutcome::Warn, detail)
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckOutcome::Fail, detail)
    }

    pub fn advisory(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    /// A required check that failed
    pub fn is_blocking(&self) -> bool {
        self.required && self.outcome == CheckOutcome::Fail
    }
}

/// Which validator produced the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Preflight,
    Premerge,
}

impl ValidationKind {
    /// Decision point name used for the lock file
    pub fn decision_point(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Premerge => "premerge",
        }
    }
}

/// Aggregate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Verdict {
    Go,
    ConditionalGo,
    NoGo,
    Approved,
    Rejected,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Go | Self::ConditionalGo | Self::Approved)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Go => "GO",
            Self::ConditionalGo => "CONDITIONAL-GO",
            Self::NoGo => "NO-GO",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Full validator output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub kind: ValidationKind,
    pub wave: u32,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    pub verdict: Verdict,
    /// Names of required checks that failed
    pub failing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<PathBuf>,
    pub dry_run: bool,
}

impl ValidationReport {
    pub fn new(kind: ValidationKind, wave: u32) -> Self {
        let verdict = match kind {
            ValidationKind::Preflight => Verdict::NoGo,
            ValidationKind::Premerge => Verdict::Rejected,
        };
        Self {
            kind,
            wave,
            timestamp: Utc::now(),
            checks: Vec::new(),
            verdict,
            failing: Vec::new(),
            input_hash: None,
            lock: None,
            dry_run: false,
        }
    }

    pub fn add(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Compute the verdict from every recorded check
    pub fn finalize(&mut self) {
        self.failing = self
            .checks
            .iter()
            .filter(|c| c.is_blocking())
            .map(|c| c.name.clone())
            .collect();
        let softened = self
            .checks
            .iter()
            .any(|c| c.outcome != CheckOutcome::Pass && !c.is_blocking());

        self.verdict = match (self.kind, self.failing.is_empty(), softened) {
            (ValidationKind::Preflight, false, _) => Verdict::NoGo,
            (ValidationKind::Preflight, true, true) => Verdict::ConditionalGo,
            (ValidationKind::Preflight, true, false) => Verdict::Go,
            (ValidationKind::Premerge, false, _) => Verdict::Rejected,
            (ValidationKind::Premerge, true, _) => Verdict::Approved,
        };
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn summary(&self) -> String {
        let passed = self
            .checks
            .iter()
            .filter(|c| c.outcome == CheckOutcome::Pass)
            .count();
        format!(
            "[{}] wave {} {}: {}/{} checks passed, {} blocking",
            self.verdict,
            self.wave,
            self.kind.decision_point(),
            passed,
            self.checks.len(),
            self.failing.len()
        )
    }

    /// Human-readable table
    pub fn render_human(&self) -> String {
        let width = self
            .checks
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        out.push_str(&format!(
            "{} validation, wave {}\n\n",
            self.kind.decision_point(),
            self.wave
        ));
        for check in &self.checks {
            let tag = if check.required { "" } else { " (advisory)" };
            out.push_str(&format!(
                "  {:<4}  {:<width$}  {}{}\n",
                check.outcome.to_string(),
                check.name,
                check.detail,
                tag,
                width = width
            ));
            for item in &check.items {
                out.push_str(&format!("        {:<width$}  - {}\n", "", item, width = width));
            }
        }
        out.push('\n');
        if self.failing.is_empty() {
            out.push_str(&format!("Verdict: {}\n", self.verdict));
        } else {
            out.push_str(&format!(
                "Verdict: {} ({} failing: {})\n",
                self.verdict,
                self.failing.len(),
                self.failing.join(", ")
            ));
        }
        if let Some(lock) = &self.lock {
            out.push_str(&format!("Decision lock: {}\n", lock.display()));
        }
        if self.dry_run {
            out.push_str("(dry run: no signals or locks written)\n");
        }
        out
    }
}
