//! The generation capability seam and the canned-response mock.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::{Role, Turn};

/// A lazy, finite sequence of text fragments that may fail at any point.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Something that turns a conversation into streamed text.
///
/// Implementations must observe `cancel` and stop producing fragments soon
/// after it fires. Dropping the returned stream must release any network
/// resources behind it.
pub trait Generator: Send + Sync {
    /// Model identifier, used for token accounting.
    fn model(&self) -> &str;

    fn generate(&self, turns: Vec<Turn>, cancel: CancellationToken) -> FragmentStream;
}

/// Content of the most recent user turn.
pub fn last_question(turns: &[Turn]) -> &str {
    turns
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .map(|t| t.content.as_str())
        .unwrap_or("")
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

/// Answer given to any question without a canned response.
pub const DEFAULT_ANSWER: &str = "I'm sorry, I don't have an answer for that. However, I'm constantly learning and evolving. If you have a different question or if there's a specific topic you'd like to explore, please feel free to ask!";

static CANNED_ANSWERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "Who are you?",
            "I am an **AI-powered virtual assistant** designed to help you navigate through your questions and provide information across a wide range of topics. My primary goal is to assist you in finding the answers you seek while ensuring a pleasant interaction experience.",
        ),
        (
            "What is AI?",
            "**Artificial Intelligence (AI)** refers to the simulation of human intelligence in machines that are programmed to think and learn like humans. This field encompasses various subfields, including:\n- **Machine Learning**: Algorithms that enable computers to learn from data.\n- **Natural Language Processing**: Understanding and generating human language.\n- **Computer Vision**: Enabling machines to interpret visual information.\n- **Robotics**: Designing intelligent machines capable of performing tasks.\n\nAI can analyze vast amounts of data, recognize patterns, and make decisions with minimal human intervention, revolutionizing industries such as **healthcare**, **finance**, and **transportation**.",
        ),
        (
            "What is Node.js?",
            "**Node.js** is an open-source, cross-platform JavaScript runtime environment that executes JavaScript code outside of a web browser. Key features include:\n- Built on **Google Chrome's V8 JavaScript engine**.\n- Ideal for creating **scalable network applications**.\n- Uses a **non-blocking, event-driven architecture** for efficient request handling.\n\nThis makes Node.js particularly suitable for building **real-time applications** like chat systems and online gaming.",
        ),
        (
            "Tell me a joke",
            "Why did the scarecrow win an award? Because he was **outstanding in his field**!\nThis joke is a pun that plays on the double meaning of \"outstanding\": being excellent, and literally standing out in a field.",
        ),
        (
            "What are the applications of AI in daily life?",
            "AI is integrated into many aspects of our daily lives, often in ways we may not realize. Examples include:\n- **Virtual Assistants**: Siri and Alexa managing our schedules.\n- **Smart Home Devices**: Automating daily tasks.\n- **Recommendation Algorithms**: Streaming services suggesting products based on our preferences.\n\nIn **healthcare**, AI systems assist in diagnosing diseases by analyzing medical images, while in **finance**, they help in fraud detection and algorithmic trading.",
        ),
        (
            "What is the future of technology?",
            "The future of technology promises significant advancements in areas such as:\n- **AI**: Increased automation across industries.\n- **Quantum Computing**: Solving complex problems beyond current capabilities.\n- **Biotechnology**: Improvements in personalized medicine driven by genetic insights.\n\nAs we advance, **ethical considerations** around privacy, security, and employment will be crucial.",
        ),
        (
            "How does machine learning work?",
            "**Machine learning** is a subset of AI that focuses on algorithms that learn from data and make predictions. The process typically involves:\n- Feeding large datasets into a model.\n- Identifying patterns and relationships.\n\nThis can be:\n- **Supervised Learning**: Training on labeled data.\n- **Unsupervised Learning**: Discovering patterns without explicit instructions.\n\nOver time, the model improves its accuracy by adjusting based on new data.",
        ),
    ])
});

/// Canned answer for `question`, or [`DEFAULT_ANSWER`].
pub fn canned_answer(question: &str) -> &'static str {
    CANNED_ANSWERS
        .get(question.trim())
        .copied()
        .unwrap_or(DEFAULT_ANSWER)
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Streams a canned answer word by word, pausing `word_delay` before each.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    pub word_delay: Duration,
}

impl MockGenerator {
    pub fn new(word_delay: Duration) -> Self {
        Self { word_delay }
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Generator for MockGenerator {
    fn model(&self) -> &str {
        "mock"
    }

    fn generate(&self, turns: Vec<Turn>, cancel: CancellationToken) -> FragmentStream {
        // Keep the separators attached so the fragments concatenate back to
        // the exact answer.
        let words: Vec<String> = canned_answer(last_question(&turns))
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.word_delay;

        stream::unfold(
            (words.into_iter(), cancel),
            move |(mut words, cancel)| async move {
                let word = words.next()?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some((Ok(word), (words, cancel))),
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Who are you?", "I am an **AI-powered")]
    #[case("  Tell me a joke  ", "Why did the scarecrow")]
    #[case("What is AI?", "**Artificial Intelligence (AI)**")]
    #[case("What is Node.js?", "**Node.js** is an open-source")]
    #[case("Something unexpected", "I'm sorry, I don't have an answer")]
    fn test_canned_answer_lookup(#[case] question: &str, #[case] prefix: &str) {
        assert!(canned_answer(question).starts_with(prefix));
    }

    #[test]
    fn test_last_question_picks_latest_user_turn() {
        let turns = vec![Turn::user("first"), Turn::assistant("a"), Turn::user("second")];
        assert_eq!(last_question(&turns), "second");
        assert_eq!(last_question(&[]), "");
    }

    #[tokio::test]
    async fn test_mock_fragments_concatenate_to_answer() {
        let gen = MockGenerator::new(Duration::ZERO);
        let fragments: Vec<String> = gen
            .generate(vec![Turn::user("Who are you?")], CancellationToken::new())
            .map(|r| r.expect("mock never fails"))
            .collect()
            .await;
        assert!(fragments.len() > 10);
        assert_eq!(fragments.concat(), canned_answer("Who are you?"));
    }

    #[tokio::test]
    async fn test_mock_stops_when_cancelled() {
        let gen = MockGenerator::new(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let mut stream = gen.generate(vec![Turn::user("What is AI?")], cancel.clone());
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_precancelled_yields_nothing() {
        let gen = MockGenerator::new(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = gen.generate(vec![Turn::user("What is AI?")], cancel);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_mock_model_name() {
        assert_eq!(MockGenerator::default().model(), "mock");
    }
}
