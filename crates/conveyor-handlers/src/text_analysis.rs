//! `text-analysis`: word and character statistics.

use conveyor_jobs::{ArgType, Handler, HandlerError, JobArguments, KindDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const KIND: &str = "text-analysis";

/// Built-in deadline.
pub const DEADLINE: Duration = Duration::from_secs(30);

/// Only analysis type currently supported.
pub const FULL: &str = "full";

/// Statistics returned as the job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStats {
    pub word_count: usize,
    /// Characters (Unicode scalar values) in the raw text.
    pub char_count: usize,
    /// Mean word length, rounded to two decimals; 0 without words.
    pub avg_word_length: f64,
}

#[derive(Debug, Clone)]
pub struct TextAnalysis {
    words: Regex,
}

impl TextAnalysis {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            words: Regex::new(r"\b\w+\b")?,
        })
    }

    pub fn definition(self, deadline: Duration) -> KindDefinition {
        KindDefinition::new(KIND, self)
            .deadline(deadline)
            .param("text", ArgType::String)
            .param("analysis_type", ArgType::String)
    }

    pub fn analyze(&self, text: &str) -> TextStats {
        let lengths: Vec<usize> = self
            .words
            .find_iter(text)
            .map(|m| m.as_str().chars().count())
            .collect();

        let word_count = lengths.len();
        let avg_word_length = if word_count == 0 {
            0.0
        } else {
            let mean = lengths.iter().sum::<usize>() as f64 / word_count as f64;
            (mean * 100.0).round() / 100.0
        };

        TextStats {
            word_count,
            char_count: text.chars().count(),
            avg_word_length,
        }
    }
}

impl Handler for TextAnalysis {
    fn call(&self, args: &JobArguments) -> Result<Value, HandlerError> {
        let text = args.require_str("text")?;
        let analysis_type = args.require_str("analysis_type")?;

        if text.trim().is_empty() {
            return Err(HandlerError::new("Empty text provided"));
        }
        if analysis_type != FULL {
            return Err(HandlerError::new(format!(
                "unsupported analysis_type '{}': only '{}' is accepted",
                analysis_type, FULL
            ))
            .with_detail(serde_json::json!({ "analysis_type": analysis_type })));
        }

        serde_json::to_value(self.analyze(text)).map_err(|e| HandlerError::new(e.to_string()))
    }
}
