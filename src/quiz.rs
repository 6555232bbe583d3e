//! Quiz content
//!
//! Questions come from an external generator whose output is a JSON
//! document of ordered questions plus the sources it used. The host
//! instruction embeds every question in order.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuizSet {
    #[serde(default)]
    pub topic: String,
    pub questions: Vec<Question>,
    /// Where the questions came from (URLs or titles).
    #[serde(default)]
    pub sources: Vec<String>,
}

impl QuizSet {
    pub fn from_json(text: &str) -> Result<Self, QuizError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuizError {
    #[error("failed to read questions: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse questions: {0}")]
    Parse(#[from] serde_json::Error),
}

impl QuizError {
    pub fn user_message(&self) -> String {
        "Could not load the quiz questions.".to_string()
    }
}

/// Produces an ordered question set for a topic.
pub trait QuestionSource {
    fn generate(&self, topic: &str) -> impl Future<Output = Result<QuizSet, QuizError>> + Send;
}

/// Questions read from a JSON file written by the generator.
#[derive(Debug, Clone)]
pub struct JsonFileQuestions {
    path: PathBuf,
}

impl JsonFileQuestions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl QuestionSource for JsonFileQuestions {
    fn generate(&self, topic: &str) -> impl Future<Output = Result<QuizSet, QuizError>> + Send {
        let path = self.path.clone();
        let topic = topic.to_string();
        async move {
            let text = tokio::fs::read_to_string(&path).await?;
            let mut set = QuizSet::from_json(&text)?;
            if set.topic.is_empty() {
                set.topic = topic;
            }
            info!(
                "Loaded {} questions on '{}' from {}",
                set.questions.len(),
                set.topic,
                path.display()
            );
            Ok(set)
        }
    }
}

/// Host instructions embedding the full, ordered question set.
pub fn build_instruction(topic: &str, questions: &[Question]) -> String {
    let mut text = String::new();
    text.push_str("You are the host of a live spoken trivia game");
    if !topic.is_empty() {
        text.push_str(&format!(" about {}", topic));
    }
    text.push_str(".\n\n");
    text.push_str(
        "Greet the player briefly, then ask the questions below one at a time, \
         in exactly this order. Do not skip, reorder or invent questions. \
         After each spoken answer, say whether it was right, give the correct \
         answer if it was not, and share the context in one or two sentences \
         before moving on. Keep a running score and announce the final score \
         after the last question.\n\n",
    );
    for (i, q) in questions.iter().enumerate() {
        text.push_str(&format!("Question {}: {}\n", i + 1, q.question));
        text.push_str(&format!("Answer: {}\n", q.answer));
        if !q.context.is_empty() {
            text.push_str(&format!("Context: {}\n", q.context));
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(n: usize) -> Question {
        Question {
            question: format!("Q{}", n),
            answer: format!("A{}", n),
            context: format!("C{}", n),
        }
    }

    #[test]
    fn test_instruction_keeps_order() {
        let questions: Vec<_> = (1..=3).map(question).collect();
        let text = build_instruction("rivers", &questions);
        assert!(text.contains("about rivers"));

        let positions: Vec<usize> = ["Question 1: Q1", "Question 2: Q2", "Question 3: Q3"]
            .iter()
            .map(|needle| text.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("Answer: A2"));
        assert!(text.contains("Context: C3"));
    }

    #[test]
    fn test_parse_generator_output() {
        let set = QuizSet::from_json(
            r#"{"questions": [{"question": "Q", "answer": "A", "context": "C"}],
                "sources": ["https://example.org"]}"#,
        )
        .unwrap();
        assert_eq!(set.questions, vec![Question {
            question: "Q".to_string(),
            answer: "A".to_string(),
            context: "C".to_string(),
        }]);
        assert_eq!(set.sources.len(), 1);
        assert!(set.topic.is_empty());

        assert!(matches!(QuizSet::from_json("{}"), Err(QuizError::Parse(_))));
    }

    #[tokio::test]
    async fn test_json_file_source() {
        let path = std::env::temp_dir().join(format!("quizlive-questions-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"{"questions": [{"question": "Q", "answer": "A"}]}"#,
        )
        .await
        .unwrap();

        let set = JsonFileQuestions::new(&path).generate("history").await.unwrap();
        assert_eq!(set.topic, "history");
        assert_eq!(set.questions.len(), 1);
        assert!(set.questions[0].context.is_empty());

        tokio::fs::remove_file(&path).await.unwrap();

        let missing = JsonFileQuestions::new(&path).generate("history").await;
        assert!(matches!(missing, Err(QuizError::Io(_))));
    }
}
