//! Wake gate -- trigger-word detection over a timestamped token stream.
//!
//! An ASR stream yields tokens with start/end times. The gate fires when
//! a trigger phrase is followed by a pause of at least the configured
//! gap and the trailing text is long enough to be a command. Matching is
//! exact or fuzzy (Levenshtein within a length-scaled threshold); ties
//! prefer the latest trigger so the freshest utterance wins. A text-only
//! fallback covers transcripts without timing.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One timestamped token from the recognizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeToken {
    /// Token text as recognized.
    pub text: String,
    /// Start time in seconds from stream origin.
    pub start: f64,
    /// End time in seconds from stream origin.
    pub end: f64,
}

/// Wake gate tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    /// Trigger phrases, matched per token.
    pub triggers: Vec<String>,
    /// Minimum silence after the trigger, in seconds.
    pub min_post_trigger_gap: f64,
    /// Minimum command length in characters (after trimming).
    pub min_command_length: usize,
    /// Whether fuzzy (edit-distance) matching is enabled.
    pub fuzzy: bool,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            triggers: vec!["turing".to_owned()],
            min_post_trigger_gap: 0.35,
            min_command_length: 3,
            fuzzy: true,
        }
    }
}

/// A fired wake detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeDetection {
    /// The trigger that matched (configured form).
    pub trigger_word: String,
    /// End time of the trigger token, seconds.
    pub trigger_end_time: f64,
    /// Silence between trigger and command, seconds.
    pub post_gap: f64,
    /// The command text after the trigger.
    pub command: String,
}

/// Strip everything but alphanumerics and lowercase the rest.
fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Edit-distance threshold for a pair of lengths: one edit per three
/// characters, at least one.
fn fuzzy_threshold(max_len: usize) -> usize {
    max_len.saturating_add(1).div_ceil(3).max(1)
}

/// Whether a normalized token matches a normalized trigger.
fn token_matches(token: &str, trigger: &str, fuzzy: bool) -> bool {
    if token == trigger {
        return true;
    }
    // Fuzzy matching on very short tokens produces junk matches.
    if !fuzzy || token.chars().count() < 3 {
        return false;
    }
    let max_len = token.chars().count().max(trigger.chars().count());
    strsim::levenshtein(token, trigger) <= fuzzy_threshold(max_len)
}

/// Trigger-plus-pause detector over token streams.
#[derive(Debug, Clone)]
pub struct WakeGate {
    config: WakeConfig,
    normalized_triggers: Vec<(String, String)>,
}

impl WakeGate {
    /// Create a gate; trigger phrases are normalized once here.
    pub fn new(config: WakeConfig) -> Self {
        let normalized_triggers = config
            .triggers
            .iter()
            .map(|t| (t.clone(), normalize(t)))
            .collect();
        Self {
            config,
            normalized_triggers,
        }
    }

    /// Find the latest trigger token; returns (token index, configured
    /// trigger form).
    fn latest_trigger<'a>(&'a self, tokens: &[WakeToken]) -> Option<(usize, &'a str)> {
        let mut found: Option<(usize, &str)> = None;
        for (index, token) in tokens.iter().enumerate() {
            let normalized = normalize(&token.text);
            if normalized.is_empty() {
                continue;
            }
            for (original, trigger) in &self.normalized_triggers {
                if token_matches(&normalized, trigger, self.config.fuzzy) {
                    // Later matches overwrite earlier ones.
                    found = Some((index, original.as_str()));
                }
            }
        }
        found
    }

    /// Detect a wake in a timed token stream.
    ///
    /// Fires only when the latest trigger is followed by a pause of at
    /// least `min_post_trigger_gap` seconds and the text after the pause
    /// is at least `min_command_length` characters.
    pub fn detect(&self, tokens: &[WakeToken]) -> Option<WakeDetection> {
        let (trigger_index, trigger_word) = self.latest_trigger(tokens)?;
        let trigger = &tokens[trigger_index];
        let rest = &tokens[trigger_index.saturating_add(1)..];
        let next = rest.first()?;

        let post_gap = next.start - trigger.end;
        if post_gap < self.config.min_post_trigger_gap {
            debug!(
                trigger_word,
                post_gap, "wake rejected: pause after trigger too short"
            );
            return None;
        }

        let command = rest
            .iter()
            .map(|t| t.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if command.chars().count() < self.config.min_command_length {
            debug!(trigger_word, command, "wake rejected: command too short");
            return None;
        }

        debug!(trigger_word, post_gap, command, "wake detected");
        Some(WakeDetection {
            trigger_word: trigger_word.to_owned(),
            trigger_end_time: trigger.end,
            post_gap,
            command,
        })
    }

    /// Text-only fallback for transcripts without timing.
    ///
    /// The transcript must start with a trigger (exact or fuzzy on the
    /// first word); the remainder is the command and the post-pause
    /// requirement is waived.
    pub fn detect_text(&self, transcript: &str) -> Option<WakeDetection> {
        let trimmed = transcript.trim();
        let first_word = trimmed.split_whitespace().next()?;
        let normalized_first = normalize(first_word);

        let trigger_word = self.normalized_triggers.iter().find_map(|(original, trigger)| {
            token_matches(&normalized_first, trigger, self.config.fuzzy).then_some(original.clone())
        })?;

        let command = trimmed
            .split_whitespace()
            .skip(1)
            .collect::<Vec<_>>()
            .join(" ");
        if command.chars().count() < self.config.min_command_length {
            return None;
        }

        Some(WakeDetection {
            trigger_word,
            trigger_end_time: 0.0,
            post_gap: 0.0,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, start: f64, end: f64) -> WakeToken {
        WakeToken {
            text: text.to_owned(),
            start,
            end,
        }
    }

    fn gate() -> WakeGate {
        WakeGate::new(WakeConfig::default())
    }

    // ── Timed detection ──

    #[test]
    fn test_trigger_then_pause_then_command() {
        let tokens = vec![
            token("turing", 0.0, 0.4),
            token("open", 0.9, 1.1),
            token("the", 1.1, 1.2),
            token("logs", 1.2, 1.5),
        ];
        let detection = gate().detect(&tokens).expect("should fire");
        assert_eq!(detection.trigger_word, "turing");
        assert!((detection.trigger_end_time - 0.4).abs() < f64::EPSILON);
        assert!((detection.post_gap - 0.5).abs() < 1e-9);
        assert_eq!(detection.command, "open the logs");
    }

    #[test]
    fn test_short_pause_rejected() {
        let tokens = vec![
            token("turing", 0.0, 0.4),
            token("open", 0.5, 0.7), // only 100ms gap
            token("logs", 0.7, 1.0),
        ];
        assert!(gate().detect(&tokens).is_none());
    }

    #[test]
    fn test_short_command_rejected() {
        let tokens = vec![token("turing", 0.0, 0.4), token("ok", 1.0, 1.2)];
        assert!(gate().detect(&tokens).is_none());
    }

    #[test]
    fn test_no_trigger_no_fire() {
        let tokens = vec![token("hello", 0.0, 0.4), token("world", 1.0, 1.4)];
        assert!(gate().detect(&tokens).is_none());
    }

    #[test]
    fn test_trigger_as_last_token_no_fire() {
        let tokens = vec![token("hey", 0.0, 0.2), token("turing", 0.3, 0.7)];
        assert!(gate().detect(&tokens).is_none(), "nothing after the trigger");
    }

    #[test]
    fn test_latest_trigger_preferred() {
        // Two triggers; only the second has a valid pause + command.
        let tokens = vec![
            token("turing", 0.0, 0.3),
            token("wait", 0.35, 0.6), // too close to count as a pause
            token("turing", 1.0, 1.3),
            token("show", 2.0, 2.2),
            token("status", 2.2, 2.6),
        ];
        let detection = gate().detect(&tokens).expect("should fire on the later trigger");
        assert!((detection.trigger_end_time - 1.3).abs() < f64::EPSILON);
        assert_eq!(detection.command, "show status");
    }

    // ── Fuzzy matching ──

    #[test]
    fn test_fuzzy_match_within_threshold() {
        // "turin" is one edit from "turing"; threshold for len 6 is 3.
        let tokens = vec![token("turin", 0.0, 0.4), token("open logs", 1.0, 1.6)];
        let detection = gate().detect(&tokens).expect("fuzzy match should fire");
        assert_eq!(detection.trigger_word, "turing");
    }

    #[test]
    fn test_fuzzy_disabled_below_three_chars() {
        let gate = WakeGate::new(WakeConfig {
            triggers: vec!["tu".to_owned()],
            ..WakeConfig::default()
        });
        // "to" is one edit from "tu" but both are short: exact only.
        let tokens = vec![token("to", 0.0, 0.4), token("open logs", 1.0, 1.6)];
        assert!(gate.detect(&tokens).is_none());

        let exact = vec![token("tu", 0.0, 0.4), token("open logs", 1.0, 1.6)];
        assert!(gate.detect(&exact).is_some(), "exact short match still fires");
    }

    #[test]
    fn test_fuzzy_off_requires_exact() {
        let gate = WakeGate::new(WakeConfig {
            fuzzy: false,
            ..WakeConfig::default()
        });
        let tokens = vec![token("turin", 0.0, 0.4), token("open logs", 1.0, 1.6)];
        assert!(gate.detect(&tokens).is_none());
    }

    #[test]
    fn test_threshold_scales_with_length() {
        assert_eq!(fuzzy_threshold(3), 2);
        assert_eq!(fuzzy_threshold(6), 3);
        assert_eq!(fuzzy_threshold(11), 4);
        assert_eq!(fuzzy_threshold(0), 1, "floor of one edit");
    }

    #[test]
    fn test_normalization_strips_punctuation() {
        let tokens = vec![token("Turing!", 0.0, 0.4), token("open the logs", 1.0, 1.8)];
        assert!(gate().detect(&tokens).is_some());
    }

    // ── Text-only fallback ──

    #[test]
    fn test_text_only_detection() {
        let detection = gate()
            .detect_text("turing what is on my calendar today")
            .expect("should fire");
        assert_eq!(detection.trigger_word, "turing");
        assert_eq!(detection.command, "what is on my calendar today");
        assert!((detection.post_gap - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_text_only_requires_leading_trigger() {
        assert!(gate()
            .detect_text("hey could you ask turing something")
            .is_none());
    }

    #[test]
    fn test_text_only_short_command_rejected() {
        assert!(gate().detect_text("turing hm").is_none());
    }
}
