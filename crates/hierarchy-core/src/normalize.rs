//! Name normalization for matching and display.
//!
//! - [`format_name`]: display form: whitespace collapsed, each word
//!   capitalised (`"from  sub"` → `"From Sub"`, `"c-h-u"` → `"C-h-u"`).
//! - [`fold`]: comparison form: NFKD, combining marks removed, lowercase,
//!   whitespace collapsed. Two values are "the same" when their folds match.
//! - [`fuzz_key`]: lookup form used by fuzzy resolution: the fold with
//!   punctuation removed and configured generic words stripped.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub fn format_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fold(raw: &str) -> String {
    let stripped: String = raw
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key a raw (exact) lookup uses.
pub fn raw_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn fuzz_key(raw: &str, strip_words: &[String]) -> String {
    let cleaned: String = fold(raw)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut key = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    for word in strip_words {
        let word = fuzz_clean(word);
        if word.is_empty() {
            continue;
        }
        if let Some(rest) = key.strip_suffix(word.as_str()) {
            if rest.ends_with(' ') {
                key = rest.trim_end().to_string();
            }
        }
        if let Some(rest) = key.strip_prefix(word.as_str()) {
            if rest.starts_with(' ') {
                key = rest.trim_start().to_string();
            }
        }
    }
    key
}

fn fuzz_clean(raw: &str) -> String {
    fuzz_key(raw, &[])
}
