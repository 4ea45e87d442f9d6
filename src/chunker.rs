//! Text chunker with sentence, paragraph, and token splitting.
//!
//! Splits document text into overlapping units sized in characters
//! (token mode approximates 5 characters per token). Sentence boundaries
//! are punctuation-aware: `. ! ? 。 ！ ？` end a sentence only when followed
//! by whitespace, end of text, an uppercase letter, another terminator, or
//! a CJK/non-CJK transition — CJK runs do not require whitespace between
//! sentences.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Approximate chars-per-token ratio for token-mode sizing.
const CHARS_PER_TOKEN: usize = 5;

/// How to split text into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMethod {
    /// Split on sentence boundaries, pack sentences up to the size limit.
    Sentence,
    /// Split on blank-line runs first, sentence-split oversized paragraphs.
    Paragraph,
    /// Fixed-width character windows sized in approximate tokens.
    Token,
}

impl FromStr for ChunkMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sentence" => Ok(Self::Sentence),
            "paragraph" => Ok(Self::Paragraph),
            "token" => Ok(Self::Token),
            other => Err(Error::invalid_arg(format!(
                "unknown chunk method: '{other}'. Use sentence, paragraph, or token."
            ))),
        }
    }
}

/// Chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Maximum chunk size: characters for sentence/paragraph mode,
    /// approximate tokens for token mode.
    pub size: usize,
    /// Overlap carried from the previous chunk, same unit as `size`.
    pub overlap: usize,
    pub method: ChunkMethod,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            size: 500,
            overlap: 50,
            method: ChunkMethod::Sentence,
        }
    }
}

impl ChunkOptions {
    fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::invalid_arg("chunk size must be > 0"));
        }
        if self.overlap >= self.size {
            return Err(Error::invalid_arg(format!(
                "chunk overlap ({}) must be smaller than size ({})",
                self.overlap, self.size
            )));
        }
        Ok(())
    }
}

/// Split text into chunks according to the options.
///
/// Empty or whitespace-only input yields an empty vector. Each returned
/// chunk's character length is at most `size + overlap` (in character
/// terms; token mode scales by the chars-per-token ratio).
pub fn split(text: &str, opts: &ChunkOptions) -> Result<Vec<String>> {
    opts.validate()?;

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    match opts.method {
        ChunkMethod::Sentence => Ok(pack_units(
            &split_sentences(text),
            " ",
            opts.size,
            opts.overlap,
        )),
        ChunkMethod::Paragraph => Ok(split_paragraph_mode(text, opts)),
        ChunkMethod::Token => Ok(split_token_windows(
            text,
            opts.size * CHARS_PER_TOKEN,
            opts.overlap * CHARS_PER_TOKEN,
        )),
    }
}

// ============ Sentence splitting ============

/// Characters that can terminate a sentence.
fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}

/// CJK ranges that form sentence runs without whitespace.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'        // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}'      // CJK extension A
        | '\u{3040}'..='\u{30FF}'      // hiragana + katakana
        | '\u{AC00}'..='\u{D7AF}'      // hangul syllables
        | '\u{3000}'..='\u{303F}'      // CJK symbols and punctuation
        | '\u{FF00}'..='\u{FFEF}')     // fullwidth forms
}

/// True when a terminator at this position actually ends a sentence.
///
/// Abbreviations and decimals ("3.14", "e.g. x") stay intact because the
/// following character is neither whitespace, uppercase, a terminator,
/// nor a CJK transition.
fn boundary_after(terminator: char, next: Option<char>) -> bool {
    // Fullwidth terminators always end a sentence inside CJK runs.
    if matches!(terminator, '。' | '！' | '？') {
        return true;
    }
    match next {
        None => true,
        Some(c) if c.is_whitespace() => true,
        Some(c) if c.is_uppercase() => true,
        Some(c) if is_terminator(c) => true,
        Some(c) if is_cjk(c) => true,
        Some(_) => false,
    }
}

/// Split text into sentences, keeping terminators attached.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);

        if is_terminator(c) {
            // Consume any trailing terminator run ("?!", "...").
            while i + 1 < chars.len() && is_terminator(chars[i + 1]) {
                i += 1;
                current.push(chars[i]);
            }
            let next = chars.get(i + 1).copied();
            if boundary_after(c, next) {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
        i += 1;
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

// ============ Packing ============

/// Character length of a string (not byte length).
fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of a string, on a char boundary.
fn char_suffix(s: &str, n: usize) -> String {
    let total = char_len(s);
    if n == 0 || total == 0 {
        return String::new();
    }
    s.chars().skip(total.saturating_sub(n)).collect()
}

/// Pack units (sentences or paragraphs) into chunks of at most `size`
/// characters, seeding each new chunk with the last `overlap` characters
/// of the previous one. Units longer than `size` are hard-split first.
fn pack_units(units: &[String], sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for unit in units {
        if char_len(unit) > size {
            normalized.extend(hard_split(unit, size));
        } else {
            normalized.push(unit.clone());
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Length of the overlap seed at the head of `current`; it does not
    // count against the size budget, which keeps each chunk within
    // size + overlap characters.
    let mut seed_len = 0usize;

    for unit in &normalized {
        let unit_len = char_len(unit);
        let body_len = char_len(&current).saturating_sub(seed_len);

        if !current.is_empty() && body_len > 0 && body_len + sep.len() + unit_len > size {
            chunks.push(current.clone());
            let seed = char_suffix(&current, overlap);
            seed_len = char_len(&seed);
            current = seed;
        }

        if !current.is_empty() {
            current.push_str(sep);
        }
        current.push_str(unit);
    }

    if char_len(&current) > seed_len {
        chunks.push(current);
    }
    chunks
}

/// Hard-split an oversized unit at `size`-character boundaries, preferring
/// a whitespace break near the end of each window.
fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let mut split_at = end;
        if end < chars.len() {
            // Scan back for a space so words survive intact.
            if let Some(pos) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if pos > 0 {
                    split_at = start + pos + 1;
                }
            }
        }
        let piece: String = chars[start..split_at].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        start = split_at;
    }
    pieces
}

// ============ Paragraph mode ============

fn split_paragraph_mode(text: &str, opts: &ChunkOptions) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    // Oversized paragraphs are sentence-split so the packer never has to
    // hard-split mid-sentence.
    let mut units: Vec<String> = Vec::new();
    for para in paragraphs {
        if char_len(&para) > opts.size {
            units.extend(split_sentences(&para));
        } else {
            units.push(para);
        }
    }

    pack_units(&units, "\n\n", opts.size, opts.overlap)
}

// ============ Token mode ============

/// Sliding character windows with fixed overlap.
fn split_token_windows(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let step = max_chars - overlap_chars;
    let mut start = 0;

    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            chunks.push(piece);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize, method: ChunkMethod) -> ChunkOptions {
        ChunkOptions {
            size,
            overlap,
            method,
        }
    }

    #[test]
    fn test_empty_input() {
        let chunks = split("", &ChunkOptions::default()).unwrap();
        assert!(chunks.is_empty());
        let chunks = split("   \n  ", &ChunkOptions::default()).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_unknown_method_string() {
        assert!("gibberish".parse::<ChunkMethod>().is_err());
        assert_eq!(
            "sentence".parse::<ChunkMethod>().unwrap(),
            ChunkMethod::Sentence
        );
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let result = split("some text", &opts(10, 10, ChunkMethod::Sentence));
        assert!(result.is_err());
        let result = split("some text", &opts(10, 12, ChunkMethod::Sentence));
        assert!(result.is_err());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split("Hello, world!", &ChunkOptions::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "Hello, world!");
    }

    #[test]
    fn test_sentence_splitting_basic() {
        let sentences = split_sentences("First sentence. Second sentence! Third?");
        assert_eq!(
            sentences,
            vec!["First sentence.", "Second sentence!", "Third?"]
        );
    }

    #[test]
    fn test_decimal_not_a_boundary() {
        let sentences = split_sentences("Pi is 3.14159 roughly. Euler is 2.71828.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("3.14159"));
    }

    #[test]
    fn test_cjk_sentences_without_whitespace() {
        let sentences = split_sentences("これはテストです。次の文です。");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "これはテストです。");
    }

    #[test]
    fn test_terminator_run_stays_together() {
        let sentences = split_sentences("Really?! Yes.");
        assert_eq!(sentences, vec!["Really?!", "Yes."]);
    }

    #[test]
    fn test_chunk_length_bound() {
        let text = (0..40)
            .map(|i| format!("Sentence number {i} with a bit of padding text."))
            .collect::<Vec<_>>()
            .join(" ");
        let options = opts(100, 20, ChunkMethod::Sentence);
        let chunks = split(&text, &options).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.chars().count() <= options.size + options.overlap,
                "chunk too long: {} chars",
                chunk.chars().count()
            );
        }
    }

    #[test]
    fn test_coverage_no_content_loss() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu.";
        let chunks = split(text, &opts(30, 5, ChunkMethod::Sentence)).unwrap();
        let joined = chunks.join(" ");
        for word in ["Alpha", "zeta", "iota", "mu"] {
            assert!(joined.contains(word), "lost word: {word}");
        }
    }

    #[test]
    fn test_overlap_carried_between_chunks() {
        let text = "One two three four. Five six seven eight. Nine ten eleven twelve.";
        let chunks = split(text, &opts(25, 8, ChunkMethod::Sentence)).unwrap();
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            let tail: String = char_suffix(&pair[0], 8);
            assert!(
                pair[1].starts_with(tail.as_str()),
                "chunk {:?} does not start with overlap {:?}",
                pair[1],
                tail
            );
        }
    }

    #[test]
    fn test_paragraph_mode_groups_blank_lines() {
        let text = "First paragraph line one.\nLine two.\n\n\nSecond paragraph.\n\nThird.";
        let chunks = split(text, &opts(500, 0, ChunkMethod::Paragraph)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("First paragraph"));
        assert!(chunks[0].contains("Third."));
    }

    #[test]
    fn test_paragraph_mode_splits_when_over_size() {
        let text = "Paragraph one is here.\n\nParagraph two is here.\n\nParagraph three is here.";
        let chunks = split(text, &opts(30, 0, ChunkMethod::Paragraph)).unwrap();
        assert!(chunks.len() > 1);
    }

    #[test]
    fn test_token_mode_windows() {
        // size 4 tokens => 20 chars, overlap 1 token => 5 chars, step 15
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let chunks = split(text, &opts(4, 1, ChunkMethod::Token)).unwrap();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].chars().count(), 20);
        // Second window starts at char 15, repeating the 5-char overlap.
        assert!(chunks[1].starts_with("pqrst"));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha. Beta. Gamma. Delta. Epsilon. Zeta.";
        let a = split(text, &opts(20, 5, ChunkMethod::Sentence)).unwrap();
        let b = split(text, &opts(20, 5, ChunkMethod::Sentence)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_sentence_hard_split() {
        let text = "a".repeat(120);
        let chunks = split(&text, &opts(50, 0, ChunkMethod::Sentence)).unwrap();
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50);
        }
    }
}
