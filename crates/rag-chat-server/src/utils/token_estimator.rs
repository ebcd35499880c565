//! Prompt-size estimation for the memory window and the debug event's
//! token figure. Deliberately a heuristic: the real tokenizer lives behind
//! the LLM API, and the context block is already char-bounded separately,
//! so all the window needs is a stable, slightly pessimistic estimate.

use unicode_segmentation::UnicodeSegmentation;

/// Tokens per word for prose on BPE-style vocabularies, rounded up so the
/// memory window trims a turn too early rather than too late.
const TOKENS_PER_WORD: f64 = 1.4;

/// Flat allowance per text for role markers and message framing.
const FRAMING_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    let words = text.unicode_words().count();
    if words == 0 {
        return 0;
    }
    (words as f64 * TOKENS_PER_WORD).ceil() as usize + FRAMING_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_words_costs_nothing() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t "), 0);
    }

    #[test]
    fn test_estimate_overshoots_word_count() {
        // The estimate must stay pessimistic: always above the raw word
        // count, by the per-word ratio plus framing
        let turn = "when is the scholarship deadline for this year";
        let words = 8;
        let estimate = estimate_tokens(turn);
        assert!(estimate > words);
        assert_eq!(estimate, (words as f64 * TOKENS_PER_WORD).ceil() as usize + FRAMING_OVERHEAD);
    }

    #[test]
    fn test_estimate_grows_with_transcript_length() {
        let one_turn = "the deadline is in march";
        let many_turns = format!("{} ", one_turn).repeat(30);

        let small = estimate_tokens(one_turn);
        let large = estimate_tokens(&many_turns);
        assert!(large > small * 15);
    }
}
