//! Evaluator (spec §4.7): rule-based result scoring, retry decision, optional
//! LLM-assisted scoring, and synthesis-quality checks.
//!
//! Grounded on `original_source/app/api/agents/evaluator.py`'s weighted-deduction
//! scoring model; there is no teacher analog, so the scoring structure (clamp,
//! pass/fail threshold, transient-error retry heuristic) is carried over directly
//! from that source rather than adapted from `CloudLLM-ai-cloudllm`.

use std::collections::HashMap;
use std::sync::Arc;

use super::client::ChatLlm;
use super::types::{AgentResult, EvaluationCriteria, EvaluationResult};

const FAILURE_PENALTY: f64 = 0.5;
const SHORT_ANSWER_PENALTY: f64 = 0.2;
const SENTINEL_PHRASE_PENALTY: f64 = 0.15;
const LOW_RELEVANCE_PENALTY: f64 = 0.2;
const MISSING_SOURCES_PENALTY: f64 = 0.15;
const OVER_TIME_PENALTY: f64 = 0.1;
const RELEVANCE_OVERLAP_FLOOR: f64 = 0.3;
/// Window below `min_confidence` in which a retry is recommended (spec §4.7).
const RETRY_WINDOW: f64 = 0.2;

const SENTINEL_PHRASES: &[&str] = &[
    "i don't know",
    "i do not know",
    "no information",
    "an error occurred",
    "잘 모르겠",
    "정보가 없",
    "오류가 발생",
    "わかりません",
    "情報がありません",
    "エラーが発生",
];

const TRANSIENT_ERROR_PATTERNS: &[&str] =
    &["timeout", "connection", "temporarily", "rate limit", "503", "502", "504", "overloaded"];

fn word_tokens(text: &str, min_len: usize) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > min_len)
        .collect()
}

fn overlap_ratio(keywords: &[String], answer: &str) -> f64 {
    if keywords.is_empty() {
        return 1.0;
    }
    let answer_lower = answer.to_lowercase();
    let hits = keywords.iter().filter(|kw| answer_lower.contains(kw.as_str())).count();
    hits as f64 / keywords.len() as f64
}

fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    TRANSIENT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Rule + optional-LLM result scoring (spec §4.7).
pub struct Evaluator {
    llm: Option<Arc<dyn ChatLlm>>,
}

impl Evaluator {
    pub fn new(llm: Option<Arc<dyn ChatLlm>>) -> Self {
        Self { llm }
    }

    /// Deterministic rule-based score for a result against `task_text` and `criteria`.
    /// Idempotent: calling this twice on the same inputs yields a bitwise-equal result
    /// (spec §8 invariant 5) since nothing here reads wall-clock time or randomness.
    pub fn evaluate_rules(&self, task_text: &str, result: &AgentResult, criteria: &EvaluationCriteria) -> EvaluationResult {
        let mut score = 1.0;
        let mut issues = Vec::new();

        if !result.success {
            score -= FAILURE_PENALTY;
            issues.push("execution failed".to_string());
        }

        if result.answer.chars().count() < criteria.min_answer_length {
            score -= SHORT_ANSWER_PENALTY;
            issues.push("answer shorter than minimum length".to_string());
        }

        let answer_lower = result.answer.to_lowercase();
        let sentinel_hits = SENTINEL_PHRASES.iter().filter(|p| answer_lower.contains(*p)).count();
        if sentinel_hits > 0 {
            score -= SENTINEL_PHRASE_PENALTY * sentinel_hits as f64;
            issues.push(format!("answer contains {sentinel_hits} sentinel 'no information' phrase(s)"));
        }

        let keywords = word_tokens(task_text, 3);
        if overlap_ratio(&keywords, &result.answer) < RELEVANCE_OVERLAP_FLOOR {
            score -= LOW_RELEVANCE_PENALTY;
            issues.push("low keyword overlap between task and answer".to_string());
        }

        if criteria.require_sources && result.sources.is_empty() {
            score -= MISSING_SOURCES_PENALTY;
            issues.push("sources required but none were returned".to_string());
        }

        if let Some(cap) = criteria.max_execution_time_ms {
            if result.execution_time_ms > cap {
                score -= OVER_TIME_PENALTY;
                issues.push("execution time exceeded the configured cap".to_string());
            }
        }

        let score = score.clamp(0.0, 1.0);
        let passed = score >= criteria.min_confidence && result.success;

        let (retry_recommended, retry_reason) = if passed {
            (false, None)
        } else if score >= criteria.min_confidence - RETRY_WINDOW && score < criteria.min_confidence {
            (true, Some("score is within the retry window below the confidence threshold".to_string()))
        } else if result.error.as_deref().is_some_and(is_transient_error) {
            (true, Some("error looks transient".to_string()))
        } else {
            (false, None)
        };

        EvaluationResult { passed, score, issues, retry_recommended, retry_reason }
    }

    /// Evaluate `result`, consulting the LLM tier if configured and falling back to the
    /// rule evaluator on any parse failure (spec §4.7).
    pub async fn evaluate(&self, task_text: &str, result: &AgentResult, criteria: &EvaluationCriteria) -> EvaluationResult {
        if let Some(llm) = &self.llm {
            if let Some(evaluation) = self.evaluate_with_llm(llm.as_ref(), task_text, result).await {
                return evaluation;
            }
        }
        self.evaluate_rules(task_text, result, criteria)
    }

    async fn evaluate_with_llm(&self, llm: &dyn ChatLlm, task_text: &str, result: &AgentResult) -> Option<EvaluationResult> {
        let prompt = format!(
            "Evaluate this answer to the task below. Respond in exactly this format:\n\
             SCORE: <a number between 0 and 1>\nISSUES: <comma-separated list, or \"none\">\nRETRY: <yes or no>\n\n\
             Task: {task_text}\nAnswer: {}",
            result.answer
        );
        let messages = [super::client::Message::user(prompt)];
        let response = llm.generate(&messages, None, Some(0.0)).await.ok()?;
        parse_llm_evaluation(&response.content)
    }

    /// Evaluate a synthesized multi-task answer against its per-task sub-results
    /// (spec §4.7).
    pub fn evaluate_synthesis(&self, synthesis: &str, sub_results: &HashMap<String, AgentResult>) -> EvaluationResult {
        let mut score: f64 = 1.0;
        let mut issues = Vec::new();

        if synthesis.trim().is_empty() {
            score = 0.0;
            issues.push("synthesis is empty".to_string());
        } else if synthesis.trim().chars().count() < 20 {
            score -= 0.4;
            issues.push("synthesis is too short".to_string());
        }

        let synthesis_lower = synthesis.to_lowercase();
        let covered = sub_results
            .values()
            .filter(|r| {
                let words = word_tokens(&r.answer, 5);
                if words.is_empty() {
                    return true;
                }
                let hits = words.iter().filter(|w| synthesis_lower.contains(w.as_str())).count();
                hits as f64 / words.len() as f64 >= 0.2
            })
            .count();
        let coverage = if sub_results.is_empty() { 1.0 } else { covered as f64 / sub_results.len() as f64 };
        if coverage < 0.5 {
            score -= 0.3;
            issues.push("synthesis covers less than half of the sub-results".to_string());
        }

        if synthesis.contains("..") {
            score -= 0.1;
            issues.push("synthesis contains a double period".to_string());
        }
        if has_repeated_conjunctions(&synthesis_lower) {
            score -= 0.1;
            issues.push("synthesis repeats conjunctions".to_string());
        }
        if has_triple_word_repeats(&synthesis_lower) {
            score -= 0.1;
            issues.push("synthesis repeats the same word three times in a row".to_string());
        }

        let score = score.clamp(0.0, 1.0);
        EvaluationResult { passed: score >= 0.6, score, issues, retry_recommended: false, retry_reason: None }
    }
}

fn has_repeated_conjunctions(text_lower: &str) -> bool {
    const CONJUNCTIONS: &[&str] = &["and", "but", "so", "or"];
    let words: Vec<&str> = text_lower.split_whitespace().collect();
    words.windows(2).any(|pair| CONJUNCTIONS.contains(&pair[0]) && pair[0] == pair[1])
}

fn has_triple_word_repeats(text_lower: &str) -> bool {
    let words: Vec<&str> = text_lower.split_whitespace().collect();
    words.windows(3).any(|triple| triple[0] == triple[1] && triple[1] == triple[2])
}

fn parse_llm_evaluation(content: &str) -> Option<EvaluationResult> {
    let mut score = None;
    let mut issues = Vec::new();
    let mut retry = None;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SCORE:") {
            score = rest.trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("ISSUES:") {
            let rest = rest.trim();
            if !rest.eq_ignore_ascii_case("none") && !rest.is_empty() {
                issues = rest.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
        } else if let Some(rest) = line.strip_prefix("RETRY:") {
            retry = Some(rest.trim().eq_ignore_ascii_case("yes"));
        }
    }

    let score = score?.clamp(0.0, 1.0);
    let retry_recommended = retry?;
    Some(EvaluationResult {
        passed: score >= 0.6 && !retry_recommended,
        score,
        issues,
        retry_recommended,
        retry_reason: if retry_recommended { Some("LLM-assisted evaluation recommended a retry".to_string()) } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::types::AgentKind;

    fn ok_result(answer: &str) -> AgentResult {
        AgentResult {
            answer: answer.to_string(),
            agent_kind: AgentKind::Rag,
            steps: 1,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            sources: Vec::new(),
            execution_time_ms: 100,
            success: true,
            error: None,
        }
    }

    #[test]
    fn failed_execution_is_scored_below_the_default_confidence_floor() {
        let evaluator = Evaluator::new(None);
        let mut result = ok_result("Python is a programming language created in 1991.");
        result.success = false;
        result.error = Some("connection timeout".to_string());
        let criteria = EvaluationCriteria::default();
        let evaluation = evaluator.evaluate_rules("What is Python?", &result, &criteria);
        assert!(!evaluation.passed);
        assert!(evaluation.retry_recommended);
    }

    #[test]
    fn sentinel_phrase_lowers_the_score() {
        let evaluator = Evaluator::new(None);
        let result = ok_result("I don't know the answer to that question.");
        let criteria = EvaluationCriteria::default();
        let evaluation = evaluator.evaluate_rules("What is Python?", &result, &criteria);
        assert!(evaluation.issues.iter().any(|i| i.contains("sentinel")));
    }

    #[test]
    fn good_answer_with_relevant_keywords_passes() {
        let evaluator = Evaluator::new(None);
        let result = ok_result("Python is a high-level programming language known for readability.");
        let criteria = EvaluationCriteria::default();
        let evaluation = evaluator.evaluate_rules("Tell me about the Python language", &result, &criteria);
        assert!(evaluation.passed);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let evaluator = Evaluator::new(None);
        let result = ok_result("Python is a high-level programming language known for readability.");
        let criteria = EvaluationCriteria::default();
        let first = evaluator.evaluate_rules("Tell me about the Python language", &result, &criteria);
        let second = evaluator.evaluate_rules("Tell me about the Python language", &result, &criteria);
        assert_eq!(first.score, second.score);
        assert_eq!(first.passed, second.passed);
    }

    #[test]
    fn llm_evaluation_format_parses_cleanly() {
        let parsed = parse_llm_evaluation("SCORE: 0.42\nISSUES: missing citation, too brief\nRETRY: yes").unwrap();
        assert_eq!(parsed.score, 0.42);
        assert!(parsed.retry_recommended);
        assert_eq!(parsed.issues.len(), 2);
    }

    #[test]
    fn malformed_llm_evaluation_fails_to_parse() {
        assert!(parse_llm_evaluation("not in the expected format").is_none());
    }

    #[test]
    fn synthesis_with_good_coverage_passes() {
        let evaluator = Evaluator::new(None);
        let mut sub_results = HashMap::new();
        sub_results.insert("t1".to_string(), ok_result("Python emphasizes readability and simplicity."));
        sub_results.insert("t2".to_string(), ok_result("Go emphasizes concurrency and simplicity."));
        let synthesis = "Python emphasizes readability while Go emphasizes concurrency; both value simplicity.";
        let evaluation = evaluator.evaluate_synthesis(synthesis, &sub_results);
        assert!(evaluation.passed);
    }

    #[test]
    fn empty_synthesis_fails() {
        let evaluator = Evaluator::new(None);
        let sub_results = HashMap::new();
        let evaluation = evaluator.evaluate_synthesis("", &sub_results);
        assert!(!evaluation.passed);
    }
}
