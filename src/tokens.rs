//! Approximate token counting and context fitting.
//!
//! Counts are estimates: words and punctuation are split the same way a BPE
//! pre-tokenizer would, and long words are charged per chunk of characters.
//! They feed request logging and the optional outbound context cap.

use crate::{Role, Turn};

/// Split text into word, whitespace and punctuation pieces.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current_token = String::new();

    for ch in text.chars() {
        if ch.is_whitespace() || ch.is_ascii_punctuation() {
            if !current_token.is_empty() {
                tokens.push(current_token.clone());
                current_token.clear();
            }
            tokens.push(ch.to_string());
        } else {
            current_token.push(ch);
        }
    }

    if !current_token.is_empty() {
        tokens.push(current_token);
    }

    tokens
}

/// Characters a single vocabulary entry typically covers for `model`.
fn chars_per_token(model: &str) -> usize {
    // o200k-vocabulary models pack slightly longer pieces.
    if model.starts_with("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") {
        5
    } else {
        4
    }
}

/// Estimate how many tokens `text` costs for `model`.
pub fn count_tokens(text: &str, model: &str) -> usize {
    let per = chars_per_token(model);
    tokenize(text)
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.chars().count().div_ceil(per).max(1))
        .sum()
}

/// Per-message overhead charged by chat formats (role markers, separators).
const TURN_OVERHEAD: usize = 4;

/// Estimate the cost of a whole outbound turn list.
pub fn count_turns(turns: &[Turn], model: &str) -> usize {
    turns
        .iter()
        .map(|t| count_tokens(&t.content, model) + TURN_OVERHEAD)
        .sum()
}

/// Drop the oldest turns until the list fits in `max_tokens`.
///
/// The final turn (the question being asked) is always kept, and a leading
/// assistant turn left behind by trimming is dropped too so the list still
/// opens with a user turn.
pub fn fit_context(mut turns: Vec<Turn>, model: &str, max_tokens: usize) -> Vec<Turn> {
    while turns.len() > 1 && count_turns(&turns, model) > max_tokens {
        turns.remove(0);
        while turns.len() > 1 && turns[0].role == Role::Assistant {
            turns.remove(0);
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_words_and_punctuation() {
        assert_eq!(tokenize("Hi, you"), vec!["Hi", ",", " ", "you"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_count_tokens_empty_is_zero() {
        assert_eq!(count_tokens("", "gpt-4o-mini"), 0);
        assert_eq!(count_tokens("   ", "gpt-4o-mini"), 0);
    }

    #[test]
    fn test_count_tokens_short_words_cost_one() {
        assert_eq!(count_tokens("Who are you?", "gpt-4o-mini"), 4);
    }

    #[test]
    fn test_count_tokens_long_word_charged_per_chunk() {
        // 16 chars: 4 chunks of 4, or 4 chunks of 5 (rounded up)
        assert_eq!(count_tokens("internationalism", "gemini-1.5-flash"), 4);
        assert_eq!(count_tokens("internationalism", "gpt-4o-mini"), 4);
        assert_eq!(count_tokens("abcdefghij", "gpt-4o"), 2);
        assert_eq!(count_tokens("abcdefghij", "gpt-3.5-turbo"), 3);
    }

    #[test]
    fn test_fit_context_keeps_everything_under_budget() {
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        assert_eq!(fit_context(turns.clone(), "gpt-4o-mini", 1_000), turns);
    }

    #[test]
    fn test_fit_context_drops_oldest_pair_first() {
        let turns = vec![
            Turn::user("old question here"),
            Turn::assistant("old answer here"),
            Turn::user("new"),
        ];
        let fitted = fit_context(turns, "gpt-4o-mini", 6);
        assert_eq!(fitted, vec![Turn::user("new")]);
    }

    #[test]
    fn test_fit_context_never_drops_last_turn() {
        let turns = vec![Turn::user("a very long question that blows the budget")];
        let fitted = fit_context(turns.clone(), "gpt-4o-mini", 1);
        assert_eq!(fitted, turns);
    }

    #[test]
    fn test_fit_context_result_starts_with_user() {
        let turns = vec![
            Turn::user("q1 q1 q1 q1"),
            Turn::assistant("a1"),
            Turn::user("q2"),
            Turn::assistant("a2"),
            Turn::user("q3"),
        ];
        let budget = count_turns(&turns[2..], "gpt-4o-mini");
        let fitted = fit_context(turns, "gpt-4o-mini", budget);
        assert_eq!(fitted.len(), 3);
        assert_eq!(fitted[0], Turn::user("q2"));
    }
}
