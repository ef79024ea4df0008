//! Pure text transforms for EAM detection.
//!
//! Everything here is deterministic string-in/string-out: cleanup of
//! recognizer artifacts, phonetic normalization, NATO decode, indicator
//! extraction, and the confidence estimate.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static ISO_TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?").unwrap()
});
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}\s*/\s*\d{1,2}\s*/\s*\d{2,4}\b").unwrap());
static BRACKET_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d{1,2}:\d{2}(?::\d{2})?\]").unwrap());
static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b\d+m\d+s\b|\b\d+\s*(?:sec(?:ond)?s?|s)\b|\b\d+\s*min(?:ute)?s?\b")
        .unwrap()
});
static UNKNOWN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[unknown\]").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Common recognizer mishearings of NATO words, applied after cleanup.
static PHONETIC_FIXES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bFORCE\b", "FOXTROT"),
        (r"\bSTRONG\b", "SIERRA"),
        (r"\bHILO\b", "HOTEL"),
        (r"\bOSKAR\b", "OSCAR"),
        (r"\bCHARLEY\b", "CHARLIE"),
        (r"\bPAPPA\b", "PAPA"),
        (r"\bX-RAY\b", "XRAY"),
        (r"\bJULIETTE\b", "JULIET"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Filler phrases the recognizer injects around real traffic.
static FILLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:i think|you know|uh|um|er)\b").unwrap());

static STAND_BY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"STAND\s*BY").unwrap());
static MESSAGE_FOLLOWS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"MESSAGE\s+FOLLOWS").unwrap());
static I_SAY_AGAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"I\s+SAY\s+AGAIN").unwrap());
static MESSAGE_LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:MESSAGE\s+OF\s+)?\b\d+\s+CHARACTERS?\b").unwrap());
static AUTHENTICATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bAUTHENTICATION\b").unwrap());
static SKYKING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSKYKING\b").unwrap());

const NATO_WORDS: &[(&str, char)] = &[
    ("ALPHA", 'A'),
    ("ALFA", 'A'),
    ("BRAVO", 'B'),
    ("CHARLIE", 'C'),
    ("DELTA", 'D'),
    ("ECHO", 'E'),
    ("FOXTROT", 'F'),
    ("GOLF", 'G'),
    ("HOTEL", 'H'),
    ("INDIA", 'I'),
    ("JULIET", 'J'),
    ("KILO", 'K'),
    ("LIMA", 'L'),
    ("MIKE", 'M'),
    ("NOVEMBER", 'N'),
    ("OSCAR", 'O'),
    ("PAPA", 'P'),
    ("QUEBEC", 'Q'),
    ("ROMEO", 'R'),
    ("SIERRA", 'S'),
    ("TANGO", 'T'),
    ("UNIFORM", 'U'),
    ("VICTOR", 'V'),
    ("WHISKEY", 'W'),
    ("XRAY", 'X'),
    ("YANKEE", 'Y'),
    ("ZULU", 'Z'),
];

const DIGIT_WORDS: &[(&str, char)] = &[
    ("ZERO", '0'),
    ("ONE", '1'),
    ("TWO", '2'),
    ("THREE", '3'),
    ("FOUR", '4'),
    ("FIVE", '5'),
    ("SIX", '6'),
    ("SEVEN", '7'),
    ("EIGHT", '8'),
    ("NINE", '9'),
    ("NINER", '9'),
];

/// Strip recognizer artifacts: dates, timestamps, bracketed times, duration
/// markers, `[Unknown]` tags; collapse whitespace and uppercase. Idempotent.
pub fn clean_transcription(input: &str) -> String {
    let mut text = ISO_TIMESTAMP_RE.replace_all(input, " ").into_owned();
    text = DATE_RE.replace_all(&text, " ").into_owned();
    text = BRACKET_TIME_RE.replace_all(&text, " ").into_owned();
    text = DURATION_RE.replace_all(&text, " ").into_owned();
    text = UNKNOWN_RE.replace_all(&text, " ").into_owned();
    let collapsed = WHITESPACE_RE.replace_all(&text, " ");
    collapsed.trim().to_uppercase()
}

/// Substitute known NATO mishearings and drop filler. Expects cleaned
/// (uppercased) input.
pub fn normalize_phonetics(input: &str) -> String {
    let mut text = FILLER_RE.replace_all(input, " ").into_owned();
    for (pattern, replacement) in PHONETIC_FIXES.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneticSequence {
    pub original: String,
    /// First letters of recognized NATO words plus digits.
    pub decoded: String,
    pub phonetic_count: usize,
}

/// Decode the NATO phonetic content of a transcription.
pub fn extract_phonetic_sequence(input: &str) -> PhoneticSequence {
    let mut decoded = String::new();
    let mut phonetic_count = 0usize;

    for raw_token in input.split_whitespace() {
        let token: String = raw_token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        if token.is_empty() {
            continue;
        }

        if let Some((_, letter)) = NATO_WORDS.iter().find(|(w, _)| *w == token) {
            decoded.push(*letter);
            phonetic_count += 1;
        } else if let Some((_, digit)) = DIGIT_WORDS.iter().find(|(w, _)| *w == token) {
            decoded.push(*digit);
            phonetic_count += 1;
        } else if token.chars().all(|c| c.is_ascii_digit()) {
            decoded.push_str(&token);
        }
    }

    PhoneticSequence {
        original: input.to_string(),
        decoded,
        phonetic_count,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EamIndicators {
    pub has_stand_by: bool,
    pub has_message_follows: bool,
    pub has_i_say_again: bool,
    pub has_message_length: bool,
    pub has_authentication: bool,
    pub has_skyking: bool,
    pub has_repeated_patterns: bool,
}

impl EamIndicators {
    pub fn any(&self) -> bool {
        self.has_stand_by
            || self.has_message_follows
            || self.has_i_say_again
            || self.has_message_length
            || self.has_authentication
            || self.has_skyking
            || self.has_repeated_patterns
    }
}

/// Scan for the procedural markers of an EAM broadcast. Expects cleaned
/// (uppercased) input.
pub fn detect_eam_indicators(input: &str) -> EamIndicators {
    EamIndicators {
        has_stand_by: STAND_BY_RE.is_match(input),
        has_message_follows: MESSAGE_FOLLOWS_RE.is_match(input),
        has_i_say_again: I_SAY_AGAIN_RE.is_match(input),
        has_message_length: MESSAGE_LENGTH_RE.is_match(input),
        has_authentication: AUTHENTICATION_RE.is_match(input),
        has_skyking: SKYKING_RE.is_match(input),
        has_repeated_patterns: has_repeated_trigram(input),
    }
}

/// True when any three-word sequence occurs more than once; EAM bodies are
/// routinely read twice.
fn has_repeated_trigram(input: &str) -> bool {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.len() < 6 {
        return false;
    }
    let mut seen: HashMap<[&str; 3], usize> = HashMap::new();
    for window in tokens.windows(3) {
        let key = [window[0], window[1], window[2]];
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        if *count > 1 {
            return true;
        }
    }
    false
}

/// Indicator-weighted confidence score, 0..100.
///
/// Points: stand-by 10, message-follows 15, I-say-again 15, message-length
/// 10, repeated-patterns 10, authentication 15, skyking 25, plus up to 30
/// from phonetic density.
pub fn estimate_confidence(indicators: &EamIndicators, phonetic_count: usize) -> u8 {
    let mut score = 0u32;
    if indicators.has_stand_by {
        score += 10;
    }
    if indicators.has_message_follows {
        score += 15;
    }
    if indicators.has_i_say_again {
        score += 15;
    }
    if indicators.has_message_length {
        score += 10;
    }
    if indicators.has_repeated_patterns {
        score += 10;
    }
    if indicators.has_authentication {
        score += 15;
    }
    if indicators.has_skyking {
        score += 25;
    }
    score += (phonetic_count as u32 * 2).min(30);
    score.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_removes_dates_times_and_markers() {
        let input = "12/05/2024 [12:34:56] STAND BY 2026-01-15T08:00:00Z for traffic 30s [Unknown] 2m30s";
        let cleaned = clean_transcription(input);
        assert_eq!(cleaned, "STAND BY FOR TRAFFIC");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let inputs = [
            "12/05/2024 ALPHA [02:11] BRAVO 45sec",
            "plain lowercase text",
            "  spaced   out\ttext ",
        ];
        for input in inputs {
            let once = clean_transcription(input);
            assert_eq!(clean_transcription(&once), once);
        }
    }

    #[test]
    fn test_normalize_fixes_recognizer_errors() {
        let cleaned = clean_transcription("Force Strong Hilo I think Bravo uh Charley");
        let normalized = normalize_phonetics(&cleaned);
        assert_eq!(normalized, "FOXTROT SIERRA HOTEL BRAVO CHARLIE");
    }

    #[test]
    fn test_extract_phonetic_sequence_decodes_letters_and_digits() {
        let seq = extract_phonetic_sequence("ALPHA BRAVO CHARLIE SEVEN ZERO static 42");
        assert_eq!(seq.decoded, "ABC7042");
        assert_eq!(seq.phonetic_count, 5);
    }

    #[test]
    fn test_extract_ignores_punctuation() {
        let seq = extract_phonetic_sequence("ALPHA, BRAVO. CHARLIE!");
        assert_eq!(seq.decoded, "ABC");
        assert_eq!(seq.phonetic_count, 3);
    }

    #[test]
    fn test_indicator_detection() {
        let text = clean_transcription(
            "SKYKING SKYKING do not answer STAND BY MESSAGE FOLLOWS \
             message of 30 characters AUTHENTICATION TANGO UNIFORM I SAY AGAIN",
        );
        let flags = detect_eam_indicators(&text);
        assert!(flags.has_skyking);
        assert!(flags.has_stand_by);
        assert!(flags.has_message_follows);
        assert!(flags.has_message_length);
        assert!(flags.has_authentication);
        assert!(flags.has_i_say_again);
        assert!(flags.any());

        let none = detect_eam_indicators("ROUTINE POSITION REPORT");
        assert!(!none.any());
    }

    #[test]
    fn test_repeated_trigram_detection() {
        let text = "ALPHA BRAVO CHARLIE DELTA ALPHA BRAVO CHARLIE ECHO";
        assert!(has_repeated_trigram(text));
        assert!(!has_repeated_trigram("ALPHA BRAVO CHARLIE DELTA ECHO"));
    }

    #[test]
    fn test_confidence_point_table() {
        let mut flags = EamIndicators::default();
        assert_eq!(estimate_confidence(&flags, 0), 0);

        flags.has_skyking = true;
        assert_eq!(estimate_confidence(&flags, 0), 25);

        flags.has_stand_by = true;
        flags.has_message_follows = true;
        assert_eq!(estimate_confidence(&flags, 0), 50);

        // Phonetic density contributes two points per word, capped at 30.
        assert_eq!(estimate_confidence(&flags, 5), 60);
        assert_eq!(estimate_confidence(&flags, 40), 80);

        flags.has_i_say_again = true;
        flags.has_message_length = true;
        flags.has_authentication = true;
        flags.has_repeated_patterns = true;
        assert_eq!(estimate_confidence(&flags, 40), 100);
    }

    #[test]
    fn test_multi_segment_transcript_scores_high() {
        let combined = "STAND BY MESSAGE FOLLOWS ALPHA BRAVO CHARLIE \
                        DELTA ECHO FOXTROT GOLF HOTEL INDIA \
                        JULIET KILO I SAY AGAIN ALPHA BRAVO CHARLIE";
        let cleaned = clean_transcription(combined);
        let normalized = normalize_phonetics(&cleaned);
        let seq = extract_phonetic_sequence(&normalized);
        let flags = detect_eam_indicators(&normalized);
        let confidence = estimate_confidence(&flags, seq.phonetic_count);

        assert!(seq.decoded.starts_with("ABCDEFGHIJK"));
        assert!(confidence >= 70, "confidence was {confidence}");
    }
}
