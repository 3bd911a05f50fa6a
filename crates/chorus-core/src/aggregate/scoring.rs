//! Heuristic reply scoring.
//!
//! `score = 0.4 * length + 0.35 * novelty + 0.25 * structure`, each part in
//! `[0, 1]`. Pure and deterministic; used by best-of selection and to report
//! stage quality.

use std::collections::HashSet;

const LENGTH_WEIGHT: f64 = 0.4;
const NOVELTY_WEIGHT: f64 = 0.35;
const STRUCTURE_WEIGHT: f64 = 0.25;

/// 1.0 inside `[max_chars / 4, max_chars]`, decaying linearly outside.
pub fn length_score(chars: usize, max_chars: usize) -> f64 {
    if max_chars == 0 {
        return 1.0;
    }
    let low = (max_chars / 4).max(1);
    if chars < low {
        chars as f64 / low as f64
    } else if chars <= max_chars {
        1.0
    } else {
        let over = (chars - max_chars) as f64 / max_chars as f64;
        (1.0 - over).max(0.0)
    }
}

fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// 1 minus the share of `content`'s character trigrams also found in `prior`.
pub fn novelty_score(content: &str, prior: Option<&str>) -> f64 {
    let Some(prior) = prior else {
        return 1.0;
    };
    let ours = trigrams(content);
    if ours.is_empty() {
        return 1.0;
    }
    let theirs = trigrams(prior);
    let shared = ours.intersection(&theirs).count();
    1.0 - shared as f64 / ours.len() as f64
}

/// Fraction of required markers present; 1.0 when none are required.
pub fn structure_score(content: &str, required_markers: &[String]) -> f64 {
    if required_markers.is_empty() {
        return 1.0;
    }
    let present = required_markers
        .iter()
        .filter(|m| content.contains(m.as_str()))
        .count();
    present as f64 / required_markers.len() as f64
}

pub fn score(content: &str, max_chars: usize, prior: Option<&str>, required_markers: &[String]) -> f64 {
    let total = LENGTH_WEIGHT * length_score(content.chars().count(), max_chars)
        + NOVELTY_WEIGHT * novelty_score(content, prior)
        + STRUCTURE_WEIGHT * structure_score(content, required_markers);
    total.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_band_and_decay() {
        assert_eq!(length_score(100, 300), 1.0);
        assert_eq!(length_score(75, 300), 1.0);
        assert_eq!(length_score(300, 300), 1.0);
        assert!((length_score(30, 300) - 0.4).abs() < 1e-9);
        assert!((length_score(450, 300) - 0.5).abs() < 1e-9);
        assert_eq!(length_score(900, 300), 0.0);
    }

    #[test]
    fn novelty_against_prior() {
        assert_eq!(novelty_score("anything", None), 1.0);
        assert_eq!(novelty_score("abcdef", Some("abcdef")), 0.0);
        assert_eq!(novelty_score("abcdef", Some("xyz")), 1.0);
        let partial = novelty_score("abcxyz", Some("abc"));
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn structure_counts_markers() {
        let markers = vec!["1.".to_string(), "2.".to_string()];
        assert_eq!(structure_score("1. first", &markers), 0.5);
        assert_eq!(structure_score("no list", &[]), 1.0);
    }

    #[test]
    fn perfect_reply_scores_one() {
        let reply = "a fresh and helpful reply of decent length";
        assert!((score(reply, 60, None, &[]) - 1.0).abs() < 1e-9);
    }
}
