// SPDX-License-Identifier: MIT

//! Weighted pattern rules for progress inference
//!
//! Rules are evaluated in order against the accumulated output. For each
//! rule only its last match counts, and a later rule that matches overrides
//! an earlier one. Weights are only meaningful relative to each other.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::{ProgressParser, ProgressState, ProgressUpdate};

/// One ordered progress rule
#[derive(Debug, Clone)]
pub struct ProgressPattern {
    matcher: Regex,
    weight: f64,
    /// Extra range covered by a `(?P<percent>..)` capture
    span: f64,
    message: Option<String>,
}

impl ProgressPattern {
    pub fn new(pattern: &str, weight: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            matcher: Regex::new(pattern)?,
            weight,
            span: 0.0,
            message: None,
        })
    }

    /// Message template, expanded with the match's captures (`$1`, `${name}`)
    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message = Some(template.into());
        self
    }

    /// Interpolate `weight..weight + span` using a named `percent` capture
    pub fn with_span(mut self, span: f64) -> Self {
        self.span = span;
        self
    }

    fn evaluate(&self, caps: &Captures<'_>) -> ProgressUpdate {
        let percent = caps
            .name("percent")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|p| p.clamp(0.0, 100.0));

        let value = match percent {
            Some(p) => self.weight + self.span * p / 100.0,
            None => self.weight,
        };

        let message = match &self.message {
            Some(template) => {
                let mut out = String::new();
                caps.expand(template, &mut out);
                out
            }
            None => caps
                .get(0)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        };

        ProgressUpdate {
            value,
            message: (!message.is_empty()).then_some(message),
        }
    }
}

/// Serializable form of a `ProgressPattern`, used in configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProgressPatternDef {
    pub pattern: String,
    pub weight: f64,
    #[serde(default)]
    pub span: f64,
    pub message: Option<String>,
}

impl TryFrom<&ProgressPatternDef> for ProgressPattern {
    type Error = regex::Error;

    fn try_from(def: &ProgressPatternDef) -> Result<Self, Self::Error> {
        let mut pattern = ProgressPattern::new(&def.pattern, def.weight)?.with_span(def.span);
        if let Some(message) = &def.message {
            pattern = pattern.with_message(message.clone());
        }
        Ok(pattern)
    }
}

/// Ordered list of weighted rules
#[derive(Debug, Clone)]
pub struct PatternProgressParser {
    patterns: Vec<ProgressPattern>,
}

impl PatternProgressParser {
    pub fn new(patterns: Vec<ProgressPattern>) -> Self {
        Self { patterns }
    }

    pub fn from_defs(defs: &[ProgressPatternDef]) -> Result<Self, regex::Error> {
        let patterns = defs
            .iter()
            .map(ProgressPattern::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl ProgressParser for PatternProgressParser {
    fn parse(&self, output: &str, state: &ProgressState) -> Option<ProgressUpdate> {
        let mut found = None;
        for pattern in &self.patterns {
            if let Some(caps) = pattern.matcher.captures_iter(output).last() {
                found = Some(pattern.evaluate(&caps));
            }
        }

        // Monotonic floor
        found.map(|update| {
            if update.value < state.current {
                ProgressUpdate {
                    value: state.current,
                    message: state.last_message.clone(),
                }
            } else {
                update
            }
        })
    }
}

static BUILD_PATTERNS: Lazy<Vec<ProgressPattern>> = Lazy::new(|| {
    let rules: [(&str, f64, f64, &str); 9] = [
        (
            r"(?m)^\s*(?:Resolving|Fetching|Downloading|Updating)\b.*$",
            5.0,
            0.0,
            "Resolving dependencies",
        ),
        (r"(?m)^\s*Compiling (\S+)", 20.0, 0.0, "Compiling $1"),
        (
            r"(?m)^(?:CompileSwift|CompileC|SwiftCompile)\b.*?(\S+\.(?:swift|m|c))\b",
            30.0,
            0.0,
            "Compiling $1",
        ),
        (r"(?m)^> Task :(\S+)", 30.0, 0.0, "Running task $1"),
        (
            r"(?m)^\s*(?P<percent>\d{1,3})% EXECUTING",
            30.0,
            40.0,
            "Building (${percent}%)",
        ),
        (r"(?m)^(?:Ld|Linking)\b.*$", 75.0, 0.0, "Linking"),
        (r"(?m)^(?:CodeSign|Signing)\b.*$", 85.0, 0.0, "Signing"),
        (
            r"(?m)^(?:ProcessProductPackaging|Packaging|Bundling)\b.*$",
            90.0,
            0.0,
            "Packaging",
        ),
        (
            r"(?m)(?:\*\* BUILD SUCCEEDED \*\*|BUILD SUCCESSFUL|^\s*Finished\b.*)",
            100.0,
            0.0,
            "Build finished",
        ),
    ];

    rules
        .iter()
        .filter_map(|(pattern, weight, span, message)| {
            ProgressPattern::new(pattern, *weight)
                .ok()
                .map(|p| p.with_span(*span).with_message(*message))
        })
        .collect()
});

/// Parser preset for common build tools (cargo, xcodebuild, gradle)
pub fn build_progress_parser() -> PatternProgressParser {
    PatternProgressParser::new(BUILD_PATTERNS.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::progress::ProgressTracker;

    fn parse(parser: &PatternProgressParser, output: &str) -> Option<ProgressUpdate> {
        parser.parse(output, &ProgressState::default())
    }

    #[test]
    fn test_no_match_yields_none() {
        let parser = build_progress_parser();
        assert_eq!(parse(&parser, "hello world\n"), None);
    }

    #[test]
    fn test_last_match_of_a_rule_wins() {
        let parser = build_progress_parser();
        let output = "   Compiling serde v1.0\n   Compiling tokio v1.36\n";
        let update = parse(&parser, output).unwrap();
        assert_eq!(update.value, 20.0);
        assert_eq!(update.message.as_deref(), Some("Compiling tokio"));
    }

    #[test]
    fn test_later_rule_overrides_earlier() {
        let parser = build_progress_parser();
        let output = "   Compiling app v0.1.0\n    Finished release [optimized] target(s)\n";
        let update = parse(&parser, output).unwrap();
        assert_eq!(update.value, 100.0);
        assert_eq!(update.message.as_deref(), Some("Build finished"));
    }

    #[test]
    fn test_rule_order_beats_output_order() {
        // "Compiling" appears after "Linking" in the text, but the linking
        // rule comes later in the list and still wins.
        let parser = build_progress_parser();
        let output = "Ld build/App normal\n   Compiling late v1\n";
        let update = parse(&parser, output).unwrap();
        assert_eq!(update.value, 75.0);
    }

    #[test]
    fn test_percent_capture_interpolates() {
        let parser = build_progress_parser();
        let update = parse(&parser, "> Task :app:compileKotlin\n 50% EXECUTING [3s]\n").unwrap();
        assert_eq!(update.value, 50.0);
        assert_eq!(update.message.as_deref(), Some("Building (50%)"));
    }

    #[test]
    fn test_floor_at_current_progress() {
        let parser = build_progress_parser();
        let state = ProgressState {
            current: 80.0,
            total: 100.0,
            last_message: Some("Signing".to_string()),
        };
        let update = parser.parse("   Compiling again v1\n", &state).unwrap();
        assert_eq!(update.value, 80.0);
        assert_eq!(update.message.as_deref(), Some("Signing"));
    }

    #[test]
    fn test_cumulative_output_is_monotonic() {
        let parser = build_progress_parser();
        let chunks = [
            "    Updating crates.io index\n",
            "   Compiling libc v0.2\n",
            "Linking app\n",
            "   Compiling stray v0.1\n",
            "    Finished dev target(s) in 3.2s\n",
        ];
        let mut tracker = ProgressTracker::new(100.0);
        let mut output = String::new();
        let mut previous = 0.0;
        for chunk in chunks {
            output.push_str(chunk);
            tracker.observe(&parser, &output);
            assert!(tracker.state().current >= previous);
            previous = tracker.state().current;
        }
        assert_eq!(previous, 100.0);
    }

    #[test]
    fn test_every_build_pattern_compiles() {
        assert_eq!(build_progress_parser().len(), 9);
    }

    #[test]
    fn test_from_defs() {
        let defs: Vec<ProgressPatternDef> = serde_yaml::from_str(
            r#"
            - pattern: "step (\\d+)"
              weight: 10
              message: "Step $1"
            - pattern: "deployed"
              weight: 100
            "#,
        )
        .unwrap();
        let parser = PatternProgressParser::from_defs(&defs).unwrap();
        assert_eq!(parser.len(), 2);

        let update = parse(&parser, "step 1\nstep 2\n").unwrap();
        assert_eq!(update.message.as_deref(), Some("Step 2"));
        assert_eq!(parse(&parser, "step 2\ndeployed\n").unwrap().value, 100.0);
    }

    #[test]
    fn test_invalid_def_is_rejected() {
        let defs = vec![ProgressPatternDef {
            pattern: "(unclosed".to_string(),
            weight: 1.0,
            span: 0.0,
            message: None,
        }];
        assert!(PatternProgressParser::from_defs(&defs).is_err());
    }
}
