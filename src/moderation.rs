//! Content moderation: sanitization, spam scoring, and profanity
//! classification.
//!
//! Everything here is a pure function over the message text; the router
//! decides what to do with the verdicts.  Pattern membership is a policy
//! choice, not a contract: the tables below can be tuned freely as long as
//! classification stays consistent with the tests.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum message length in characters after sanitization.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Spam score at or above which a message is refused.
pub const SPAM_THRESHOLD: u32 = 3;

/// Classification severity for a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Clean,
    Warning,
    Blocked,
}

/// Outcome of [`check`].
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub severity: Severity,
    pub reason: Option<&'static str>,
}

impl Verdict {
    fn clean() -> Self {
        Verdict {
            severity: Severity::Clean,
            reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

/// Blocked patterns, evaluated in order; the first hit decides the reason.
/// Leetspeak character classes double as obfuscation tolerance.
static BLOCKED_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(f[u*@v]ck(er|ing|ed)?|motherf[u*@v]cker|c[u*]nt|c[o0]ck|d[i1!]ck(head)?|pu[s$]{2}y|a[s$]{2}h[o0]le|b[i1!]tch)\b").unwrap(),
            "explicit language",
        ),
        (
            Regex::new(r"(?i)\b(n[i1!]gg[e3a]r?|f[a@4]gg?[o0]t|r[e3]t[a@4]rd(ed)?)\b").unwrap(),
            "hate speech",
        ),
        (
            Regex::new(r"(?i)\b(kill\s+(yourself|urself)|kys|go\s+die)\b").unwrap(),
            "violent threat",
        ),
        (
            Regex::new(r"(?i)\bi\s+(will|am\s+going\s+to|'?m\s+gonna)\s+(kill|hurt|stab|shoot|find)\s+you\b").unwrap(),
            "violent threat",
        ),
        (
            Regex::new(r"(?i)\bsh[i1!]t(ty|head)?\b").unwrap(),
            "explicit language",
        ),
    ]
});

/// Mildly pejorative terms; relayed after masking.
static WARNING_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![(
        Regex::new(r"(?i)\b(idiot|stupid|dumb(ass)?|loser|moron|jerk|pathetic|trash)\b").unwrap(),
        "insult",
    )]
});

static PUNCT_BURST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[!?]{3,}").unwrap());

static SPAM_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(free|win|winner|prize|claim|limited|urgent)\b").unwrap()
});

/// Number of URLs at which a message is treated as link flooding.
const URL_FLOOD_COUNT: usize = 3;

/// Length of a repeated-character run treated as flooding by `check`.
const RUN_BLOCK_LEN: usize = 10;

/// Length of a repeated-character run that contributes to the spam score.
const RUN_SPAM_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// HTML-escape `<`, `>`, `"`, `'`, trim surrounding whitespace, and clamp to
/// [`MAX_MESSAGE_CHARS`] characters.  Idempotent: `&` is deliberately not
/// escaped, so already-sanitized text passes through unchanged.
pub fn sanitize(text: &str) -> String {
    let trimmed = text.trim();
    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    if out.chars().count() > MAX_MESSAGE_CHARS {
        out = out.chars().take(MAX_MESSAGE_CHARS).collect();
        out.truncate(out.trim_end().len());
    }
    out
}

// ---------------------------------------------------------------------------
// Spam scoring
// ---------------------------------------------------------------------------

fn longest_char_run(text: &str) -> usize {
    let mut best = 0usize;
    let mut current = 0usize;
    let mut previous = None;
    for c in text.chars() {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        best = best.max(current);
    }
    best
}

fn count_urls(text: &str) -> usize {
    let lower = text.to_lowercase();
    lower.matches("http://").count() + lower.matches("https://").count()
}

/// Heuristic spam score.  Individual signals are weak; the threshold is what
/// separates an excited message from a flood.
pub fn spam_score(text: &str) -> u32 {
    let mut score = 0u32;

    if text.chars().count() > 10 {
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        if letters > 0 {
            let upper = text.chars().filter(|c| c.is_uppercase()).count();
            if upper as f64 / letters as f64 > 0.7 {
                score += 2;
            }
        }
    }

    if longest_char_run(text) >= RUN_SPAM_LEN {
        score += 2;
    }

    if PUNCT_BURST.is_match(text) {
        score += 1;
    }

    let urls = count_urls(text);
    if urls > 2 {
        score += urls as u32;
    }

    if SPAM_WORDS.is_match(text) {
        score += 1;
    }

    score
}

/// Whether the text scores at or above [`SPAM_THRESHOLD`].
pub fn is_spam(text: &str) -> bool {
    spam_score(text) >= SPAM_THRESHOLD
}

// ---------------------------------------------------------------------------
// Profanity classification
// ---------------------------------------------------------------------------

/// Classify text as clean, warning, or blocked.
pub fn check(text: &str) -> Verdict {
    for (pattern, reason) in BLOCKED_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Verdict {
                severity: Severity::Blocked,
                reason: Some(reason),
            };
        }
    }

    if count_urls(text) >= URL_FLOOD_COUNT {
        return Verdict {
            severity: Severity::Blocked,
            reason: Some("link flooding"),
        };
    }

    if longest_char_run(text) >= RUN_BLOCK_LEN {
        return Verdict {
            severity: Severity::Blocked,
            reason: Some("character flooding"),
        };
    }

    for (pattern, reason) in WARNING_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Verdict {
                severity: Severity::Warning,
                reason: Some(reason),
            };
        }
    }

    Verdict::clean()
}

/// Replace every pattern match (blocked and warning tables) with `*` of the
/// matched span's character length.  Text outside matches is untouched, so
/// `mask` preserves overall character length.
pub fn mask(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, _) in BLOCKED_PATTERNS.iter().chain(WARNING_PATTERNS.iter()) {
        out = pattern
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                "*".repeat(caps[0].chars().count())
            })
            .to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- sanitize --

    #[test]
    fn test_sanitize_escapes_html() {
        assert_eq!(sanitize("<b>hi</b>"), "&lt;b&gt;hi&lt;/b&gt;");
        assert_eq!(sanitize(r#"say "hi"?"#), "say &quot;hi&quot;?");
        assert_eq!(sanitize("it's"), "it&#39;s");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for input in ["<script>", "  padded  ", "plain", "&lt;already&gt;", "a'b\"c"] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_sanitize_clamps_length() {
        let long = "x".repeat(2001);
        let out = sanitize(&long);
        assert_eq!(out.chars().count(), 2000);

        let exact = "y".repeat(2000);
        assert_eq!(sanitize(&exact).chars().count(), 2000);

        // Clamp must not leave trailing whitespace that a re-sanitize would trim
        let mut spaced = "z".repeat(1999);
        spaced.push(' ');
        spaced.push_str("tail");
        let once = sanitize(&spaced);
        assert_eq!(sanitize(&once), once);
    }

    // -- spam --

    #[test]
    fn test_spam_shouting_with_keywords() {
        assert!(is_spam("FREE MONEY WIN NOW!!!"));
    }

    #[test]
    fn test_spam_url_flood() {
        assert!(is_spam("http://a.com http://b.com http://c.com"));
    }

    #[test]
    fn test_spam_single_signal_is_not_spam() {
        // One long run scores 2, under the threshold
        assert!(!is_spam("okaaaaay"));
        // A single link is fine
        assert!(!is_spam("look at https://example.com"));
        assert!(!is_spam("hello, how are you?"));
    }

    #[test]
    fn test_spam_score_components() {
        assert_eq!(spam_score("hi"), 0);
        // run of 5 => 2
        assert_eq!(spam_score("aaaaa"), 2);
        // punctuation burst => 1
        assert_eq!(spam_score("what?!?"), 1);
    }

    // -- check --

    #[test]
    fn test_check_blocked_examples() {
        let v = check("you fucking idiot");
        assert_eq!(v.severity, Severity::Blocked);
        assert_eq!(v.reason, Some("explicit language"));

        assert_eq!(check("f*ck off").severity, Severity::Blocked);
        assert_eq!(check("kys").severity, Severity::Blocked);
        assert_eq!(check("i will find you").severity, Severity::Blocked);
        assert_eq!(
            check("wow http://a http://b http://c").severity,
            Severity::Blocked
        );
        assert_eq!(check("zzzzzzzzzzzz").severity, Severity::Blocked);
    }

    #[test]
    fn test_check_warning_examples() {
        let v = check("you idiot");
        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.reason, Some("insult"));
        assert_eq!(check("that was stupid").severity, Severity::Warning);
    }

    #[test]
    fn test_check_clean_examples() {
        assert_eq!(check("hello there, where are you from?").severity, Severity::Clean);
        // Word boundaries: embedded fragments don't match
        assert_eq!(check("scunthorpe classics").severity, Severity::Clean);
        assert_eq!(check("winning a chess game").severity, Severity::Clean);
    }

    // -- mask --

    #[test]
    fn test_mask_preserves_length() {
        for input in ["you idiot", "fuck this", "clean text stays", "dumbass move"] {
            let masked = mask(input);
            assert_eq!(
                masked.chars().count(),
                input.chars().count(),
                "length changed for {input:?}"
            );
        }
    }

    #[test]
    fn test_mask_stars_matched_spans() {
        assert_eq!(mask("you idiot"), "you *****");
        assert_eq!(mask("no match here"), "no match here");
    }
}
