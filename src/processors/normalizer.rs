//! Text normalization and quality scoring.
//!
//! Everything in this module is a pure function of its input: no
//! network, no clock, no global state. The same bytes always produce
//! the same canonical text and the same score.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

/// Canonical text plus the signals that scored it.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub text: String,
    pub signals: QualitySignals,
    pub quality_score: f64,
}

/// Signals feeding the quality score.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySignals {
    pub length: usize,
    pub printable_ratio: f64,
    pub distinct_token_ratio: f64,
    /// Largest fraction of the document covered by repetitions of any
    /// single 100-character substring.
    pub repetition_ratio: f64,
    pub language: &'static str,
}

/// Normalize decoded text and score it.
pub fn normalize(text: &str) -> NormalizedText {
    let repaired = fix_mojibake(text);
    let canonical = canonicalize(&repaired);
    let signals = analyze(&canonical);
    let quality_score = quality_score(&signals);
    NormalizedText {
        text: canonical,
        signals,
        quality_score,
    }
}

/// Decode raw bytes: BOM, then `<meta charset>`, then strict UTF-8,
/// then windows-1252 as the lossless last resort.
pub fn decode_bytes(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(&bytes[bom_len..]);
        return text.into_owned();
    }

    if let Some(encoding) = sniff_meta_charset(bytes) {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Look for a charset declaration in the first kilobyte.
fn sniff_meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_lowercase();
    let idx = head.find("charset=")?;
    let rest = &head[idx + 8..];
    let label: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let encoding = Encoding::for_label(label.as_bytes())?;
    if encoding == UTF_8 {
        None // UTF-8 is the strict default path anyway
    } else {
        Some(encoding)
    }
}

/// Repair the two common mojibake shapes: UTF-8 bytes mis-decoded as
/// Latin-1, and the same applied twice. Repair is only kept when it
/// strictly reduces the tell-tale marker count.
pub fn fix_mojibake(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..2 {
        let markers = mojibake_markers(&current);
        if markers == 0 {
            break;
        }
        match reinterpret_latin1(&current) {
            Some(candidate) if mojibake_markers(&candidate) < markers => current = candidate,
            _ => break,
        }
    }
    current
}

/// Count characters that almost never occur legitimately but are the
/// leading bytes of UTF-8 sequences read as Latin-1.
fn mojibake_markers(text: &str) -> usize {
    text.chars()
        .filter(|c| matches!(*c, 'Ã' | 'Â' | 'â' | 'ð' | 'Ð' | 'å'))
        .count()
}

/// Encode as Latin-1 and re-decode as UTF-8, if both directions work.
fn reinterpret_latin1(text: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code > 0xFF {
            return None;
        }
        bytes.push(code as u8);
    }
    String::from_utf8(bytes).ok()
}

/// NFKC, control/zero-width stripping, CJK spacing, whitespace
/// collapse, trim.
fn canonicalize(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();

    let mut cleaned = String::with_capacity(nfkc.len());
    for c in nfkc.chars() {
        match c {
            '\u{200B}'..='\u{200F}' | '\u{FEFF}' | '\u{2060}' => {}
            '\n' | '\t' => cleaned.push(c),
            c if c.is_control() => {}
            c => cleaned.push(c),
        }
    }

    let spaced = cjk_latin_spacing(&cleaned);

    // Collapse runs of spaces per line, keep paragraph structure.
    let mut lines: Vec<String> = Vec::new();
    for line in spaced.lines() {
        lines.push(line.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    let mut out = String::new();
    let mut blank_run = 0usize;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&line);
    }
    out.trim().to_string()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK unified
        | 0x3400..=0x4DBF    // extension A
        | 0x3040..=0x30FF    // hiragana, katakana
        | 0xAC00..=0xD7AF    // hangul
    )
}

/// Insert a single space at CJK/Latin boundaries.
fn cjk_latin_spacing(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if let Some(p) = prev {
            let boundary = (is_cjk(p) && c.is_ascii_alphanumeric())
                || (p.is_ascii_alphanumeric() && is_cjk(c));
            if boundary {
                out.push(' ');
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Compute the quality signals for canonical text.
pub fn analyze(text: &str) -> QualitySignals {
    let chars: Vec<char> = text.chars().collect();
    let length = chars.len();

    let printable = chars
        .iter()
        .filter(|c| !c.is_control() || **c == '\n' || **c == '\t')
        .filter(|c| !c.is_whitespace() || **c == ' ' || **c == '\n' || **c == '\t')
        .count();
    let printable_ratio = if length == 0 {
        0.0
    } else {
        printable as f64 / length as f64
    };

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let distinct: std::collections::HashSet<&str> = tokens.iter().copied().collect();
    let distinct_token_ratio = if tokens.is_empty() {
        0.0
    } else {
        distinct.len() as f64 / tokens.len() as f64
    };

    QualitySignals {
        length,
        printable_ratio,
        distinct_token_ratio,
        repetition_ratio: repetition_ratio(&chars),
        language: guess_language(&chars),
    }
}

/// Fraction of the document covered by the most repeated 100-character
/// substring, probed at 100-character strides.
fn repetition_ratio(chars: &[char]) -> f64 {
    const WINDOW: usize = 100;
    if chars.len() < 2 * WINDOW {
        return 0.0;
    }
    let text: String = chars.iter().collect();
    let mut max_ratio: f64 = 0.0;
    let mut start = 0;
    while start + WINDOW <= chars.len() {
        let probe: String = chars[start..start + WINDOW].iter().collect();
        let count = text.matches(&probe).count();
        let ratio = (count * WINDOW) as f64 / chars.len() as f64;
        max_ratio = max_ratio.max(ratio);
        start += WINDOW;
    }
    max_ratio.min(1.0)
}

/// Script-based language guess; deliberately coarse.
fn guess_language(chars: &[char]) -> &'static str {
    if chars.is_empty() {
        return "unknown";
    }
    let mut han = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;
    let mut cyrillic = 0usize;
    let mut latin = 0usize;
    for c in chars {
        match *c as u32 {
            0x4E00..=0x9FFF | 0x3400..=0x4DBF => han += 1,
            0x3040..=0x30FF => kana += 1,
            0xAC00..=0xD7AF => hangul += 1,
            0x0400..=0x04FF => cyrillic += 1,
            _ if c.is_ascii_alphabetic() => latin += 1,
            _ => {}
        }
    }
    let letters = han + kana + hangul + cyrillic + latin;
    if letters == 0 {
        return "unknown";
    }
    if kana * 10 > letters {
        "ja"
    } else if hangul * 2 > letters {
        "ko"
    } else if han * 2 > letters {
        "zh"
    } else if cyrillic * 2 > letters {
        "ru"
    } else if latin * 2 > letters {
        "en"
    } else {
        "unknown"
    }
}

/// Weighted combination of the signals into [0, 100].
pub fn quality_score(signals: &QualitySignals) -> f64 {
    // Length contributes up to 30 points, saturating at 2000 chars.
    let length_score = (signals.length as f64 / 2000.0).min(1.0) * 30.0;
    let printable_score = signals.printable_ratio * 25.0;
    let distinct_score = signals.distinct_token_ratio * 25.0;
    let repetition_score = (1.0 - signals.repetition_ratio) * 20.0;
    (length_score + printable_score + distinct_score + repetition_score).clamp(0.0, 100.0)
}
