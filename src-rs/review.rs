use crate::config::DEFAULT_KEYWORDS;
use unicode_segmentation::UnicodeSegmentation;

/// Lowercased, trimmed sentences of a review.
///
/// Boundaries are found on the original casing: UAX #29 does not break
/// before a lowercase letter, so lowercasing first would glue sentences.
pub fn segment_review(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .unicode_sentences()
        .map(normalize)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn normalize(sentence: &str) -> String {
    sentence.trim().to_lowercase().replace('\u{2019}', "'")
}

/// Picks the sentence that most likely carries the functional complaint.
pub trait SnippetSelector: Send + Sync {
    fn name(&self) -> &str;

    /// Empty input selects the empty string.
    fn select(&self, sentences: &[String]) -> String;
}

/// First sentence containing a complaint keyword, else the first sentence.
#[derive(Debug, Clone)]
pub struct KeywordSelector {
    keywords: Vec<String>,
}

impl KeywordSelector {
    pub fn new(keywords: Vec<String>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|kw| kw.trim().to_lowercase())
            .filter(|kw| !kw.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn matches(&self, sentence: &str) -> bool {
        self.keywords.iter().any(|kw| sentence.contains(kw.as_str()))
    }
}

impl Default for KeywordSelector {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().map(ToString::to_string).collect())
    }
}

impl SnippetSelector for KeywordSelector {
    fn name(&self) -> &str {
        "keyword"
    }

    fn select(&self, sentences: &[String]) -> String {
        sentences
            .iter()
            .find(|sentence| self.matches(sentence))
            .or_else(|| sentences.first())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(text: &str) -> String {
        KeywordSelector::default().select(&segment_review(text))
    }

    #[test]
    fn splits_and_lowercases_sentences() {
        assert_eq!(
            segment_review("  The app crashed. I love the colors.  "),
            vec!["the app crashed.".to_string(), "i love the colors.".to_string()]
        );
    }

    #[test]
    fn empty_review_has_no_sentences() {
        assert!(segment_review("   ").is_empty());
        assert_eq!(select(""), "");
    }

    #[test]
    fn keyword_sentence_wins_over_first_sentence() {
        assert_eq!(
            select("I love the colors. But the app crashed on launch."),
            "but the app crashed on launch."
        );
        assert_eq!(select("The app crashed. I love the colors."), "the app crashed.");
    }

    #[test]
    fn falls_back_to_first_sentence() {
        assert_eq!(select("Great app, love it!"), "great app, love it!");
        assert_eq!(select("Nice design. Good colors."), "nice design.");
    }

    #[test]
    fn multi_word_and_curly_apostrophe_keywords_match() {
        assert_eq!(
            select("Looks fine. The sync is not working at all."),
            "the sync is not working at all."
        );
        assert_eq!(select("Hello there. I can\u{2019}t log in."), "i can't log in.");
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let selector = KeywordSelector::new(vec![" FREEZE ".to_string(), String::new()]);
        assert_eq!(selector.keywords(), &["freeze".to_string()]);
        let sentences = segment_review("It crashed. Then the screen would freeze.");
        assert_eq!(selector.select(&sentences), "then the screen would freeze.");
    }
}
