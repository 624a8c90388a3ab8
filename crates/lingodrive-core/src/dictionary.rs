//! Dictionary lookup over `translations.json`
//!
//! The document maps a language code to `{ key: phrase }`, every language
//! sharing one key set:
//!
//! ```json
//! { "en": { "hello": "hello", "good_morning": "good morning" },
//!   "es": { "hello": "hola",  "good_morning": "buenos días" } }
//! ```
//!
//! Reverse lookup (phrase to key) takes the first key in document order.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{DriveError, DriveResult};

/// Name of the dictionary document inside a drive or fallback directory
pub const TRANSLATIONS_FILE: &str = "translations.json";

#[derive(Debug, Clone, Default)]
struct Language {
    /// (key, phrase) in document order
    phrases: Vec<(String, String)>,
    by_key: HashMap<String, usize>,
}

impl Language {
    fn from_object(code: &str, object: &Map<String, Value>) -> DriveResult<Self> {
        let mut language = Language::default();
        for (key, value) in object {
            let phrase = value.as_str().ok_or_else(|| {
                DriveError::Serialization(format!("{}.{}: expected a string", code, key))
            })?;
            language.by_key.insert(key.clone(), language.phrases.len());
            language.phrases.push((key.clone(), phrase.to_string()));
        }
        Ok(language)
    }

    fn phrase(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(|&i| self.phrases[i].1.as_str())
    }

    /// First key whose phrase equals `text` (compared lowercase), else the
    /// key named `text` itself.
    fn key_for<'a>(&'a self, text: &'a str) -> Option<&'a str> {
        self.phrases
            .iter()
            .find(|(_, phrase)| phrase.to_lowercase() == text)
            .map(|(key, _)| key.as_str())
            .or_else(|| self.by_key.contains_key(text).then_some(text))
    }
}

/// A loaded `translations.json`
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    languages: HashMap<String, Language>,
}

impl Dictionary {
    /// Parse a `translations.json` document.
    pub fn from_json(data: &[u8]) -> DriveResult<Self> {
        let root: Map<String, Value> = serde_json::from_slice(data)
            .map_err(|e| DriveError::Serialization(format!("translations: {}", e)))?;

        let mut languages = HashMap::with_capacity(root.len());
        for (code, table) in &root {
            let object = table.as_object().ok_or_else(|| {
                DriveError::Serialization(format!("{}: expected an object", code))
            })?;
            languages.insert(code.clone(), Language::from_object(code, object)?);
        }

        let dictionary = Self { languages };
        dictionary.check_key_sets();
        Ok(dictionary)
    }

    fn check_key_sets(&self) {
        let mut tables = self.languages.iter();
        let Some((first_code, first)) = tables.next() else {
            return;
        };
        for (code, language) in tables {
            let same = language.by_key.len() == first.by_key.len()
                && language.by_key.keys().all(|k| first.by_key.contains_key(k));
            if !same {
                warn!(first = %first_code, other = %code, "Dictionary languages have different key sets");
            }
        }
    }

    /// Known language codes, sorted
    pub fn languages(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    pub fn has_language(&self, code: &str) -> bool {
        self.languages.contains_key(code)
    }

    /// Translate `text` from `from` to `to`.
    ///
    /// The whole phrase is tried first, then each word on its own. Words with
    /// no entry pass through as written. Unknown languages return the input.
    pub fn translate(&self, text: &str, from: &str, to: &str) -> String {
        let (Some(source), Some(target)) = (self.languages.get(from), self.languages.get(to)) else {
            debug!(from, to, "Unknown language, passing text through");
            return text.to_string();
        };

        let trimmed = text.trim();
        if let Some(phrase) = Self::lookup(source, target, &trimmed.to_lowercase()) {
            return phrase.to_string();
        }

        trimmed
            .split_whitespace()
            .map(|word| Self::lookup(source, target, &word.to_lowercase()).unwrap_or(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn lookup<'a>(source: &Language, target: &'a Language, text: &str) -> Option<&'a str> {
        if text.is_empty() {
            return None;
        }
        source.key_for(text).and_then(|key| target.phrase(key))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const DOC: &str = r#"{
        "en": { "hello": "hello", "world": "world", "good_morning": "good morning", "hi": "hello" },
        "es": { "hello": "hola", "world": "mundo", "good_morning": "buenos días", "hi": "qué tal" }
    }"#;

    fn dictionary() -> Dictionary {
        Dictionary::from_json(DOC.as_bytes()).unwrap()
    }

    #[test]
    fn test_mixed_case_single_word() {
        let dict = Dictionary::from_json(br#"{"en": {"hello": "hello"}, "es": {"hello": "hola"}}"#)
            .unwrap();
        assert_eq!(dict.translate("Hello", "en", "es"), "hola");
    }

    #[test]
    fn test_unknown_word_passes_through() {
        assert_eq!(dictionary().translate("xyzzy", "en", "es"), "xyzzy");
    }

    #[test]
    fn test_phrase_before_words() {
        assert_eq!(dictionary().translate("Good Morning", "en", "es"), "buenos días");
    }

    #[test]
    fn test_word_by_word_keeps_unknown_original_form() {
        assert_eq!(
            dictionary().translate("  Hello   big WORLD ", "en", "es"),
            "hola big mundo"
        );
    }

    #[test]
    fn test_reverse_lookup_takes_first_match_in_order() {
        // "hello" is the phrase of both "hello" and "hi"; "hello" comes first.
        assert_eq!(dictionary().translate("hello", "en", "es"), "hola");
    }

    #[test]
    fn test_key_matches_when_no_phrase_does() {
        assert_eq!(dictionary().translate("good_morning", "en", "es"), "buenos días");
    }

    #[test]
    fn test_reverse_direction() {
        assert_eq!(dictionary().translate("Hola mundo", "es", "en"), "hello world");
    }

    #[test]
    fn test_unknown_language_returns_input() {
        assert_eq!(dictionary().translate("Hello", "en", "fr"), "Hello");
        assert_eq!(dictionary().translate("Hello", "xx", "es"), "Hello");
    }

    #[test]
    fn test_rejects_non_string_phrase() {
        assert!(Dictionary::from_json(br#"{"en": {"a": 1}}"#).is_err());
        assert!(Dictionary::from_json(br#"{"en": "nope"}"#).is_err());
        assert!(Dictionary::from_json(b"not json").is_err());
    }

    #[test]
    fn test_languages() {
        assert_eq!(dictionary().languages(), vec!["en", "es"]);
        assert!(dictionary().has_language("es"));
    }

    proptest! {
        #[test]
        fn prop_unknown_language_is_identity(text in ".{0,40}") {
            prop_assert_eq!(dictionary().translate(&text, "en", "zz"), text);
        }

        #[test]
        fn prop_unknown_words_pass_through(words in proptest::collection::vec("[q-z]{3,8}", 1..6)) {
            // No dictionary entry is made only of the letters q..z.
            let text = words.join(" ");
            prop_assert_eq!(dictionary().translate(&text, "en", "es"), text);
        }
    }
}
