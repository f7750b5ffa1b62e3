//! Deterministic text compression used when an item overflows the context.
//!
//! Three passes, always applied in the same order so the same input yields
//! the same output: stock phrases are abbreviated, filler words are removed,
//! then whitespace is collapsed.

use regex::Regex;

const FILLER_WORDS: &[&str] = &[
    "actually",
    "basically",
    "certainly",
    "definitely",
    "essentially",
    "just",
    "literally",
    "quite",
    "really",
    "simply",
    "somewhat",
    "totally",
    "very",
];

const PHRASE_ABBREVIATIONS: &[(&str, &str)] = &[
    ("as soon as possible", "ASAP"),
    ("at this point in time", "now"),
    ("for example", "e.g."),
    ("in order to", "to"),
    ("due to the fact that", "because"),
    ("in the event that", "if"),
    ("with regard to", "re"),
    ("that is to say", "i.e."),
    ("and so on", "etc."),
];

/// Compiled compression rules. A rule whose pattern fails to compile is
/// skipped.
#[derive(Debug, Clone)]
pub struct Compressor {
    phrases: Vec<(Regex, &'static str)>,
    fillers: Option<Regex>,
    whitespace: Option<Regex>,
    space_before_punct: Option<Regex>,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    pub fn new() -> Self {
        let phrases = PHRASE_ABBREVIATIONS
            .iter()
            .filter_map(|(phrase, short)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(phrase));
                Regex::new(&pattern).ok().map(|re| (re, *short))
            })
            .collect();

        Self {
            phrases,
            fillers: Regex::new(&format!(r"(?i)\b(?:{})\b", FILLER_WORDS.join("|"))).ok(),
            whitespace: Regex::new(r"\s+").ok(),
            space_before_punct: Regex::new(r" ([,.;:!?])").ok(),
        }
    }

    /// Compress `text`. The result is never longer than the input.
    pub fn compress(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, short) in &self.phrases {
            out = pattern.replace_all(&out, *short).into_owned();
        }
        let passes = [
            (&self.fillers, ""),
            (&self.whitespace, " "),
            (&self.space_before_punct, "$1"),
        ];
        for (pattern, replacement) in passes {
            if let Some(re) = pattern {
                out = re.replace_all(&out, replacement).into_owned();
            }
        }
        let out = out.trim().to_string();

        if out.len() > text.len() {
            text.to_string()
        } else {
            out
        }
    }
}
