//! Intent Classifier (spec §4.3).
//!
//! A two-tier classifier: a multilingual (English/Korean/Japanese) keyword-voting rule
//! tier, falling back to an LLM classification prompt when the rule tier is unconfident.
//! Grounded on `original_source/app/api/agents/intent.py`'s `INTENT_KEYWORDS`
//! positive/negative voting scheme; `regex` + `lazy_static` build the per-language
//! pattern tables once, the idiom already used by `clients/common.rs`'s shared HTTP
//! client `static ref`.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::client::ChatLlm;
use super::types::AgentKind;

/// The closed set of task intents this classifier recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentLabel {
    Search,
    ListAll,
    Detail,
    Analyze,
    Create,
    Update,
    Delete,
    Unknown,
}

impl IntentLabel {
    fn all() -> [IntentLabel; 7] {
        [
            IntentLabel::Search,
            IntentLabel::ListAll,
            IntentLabel::Detail,
            IntentLabel::Analyze,
            IntentLabel::Create,
            IntentLabel::Update,
            IntentLabel::Delete,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Search => "search",
            IntentLabel::ListAll => "list_all",
            IntentLabel::Detail => "detail",
            IntentLabel::Analyze => "analyze",
            IntentLabel::Create => "create",
            IntentLabel::Update => "update",
            IntentLabel::Delete => "delete",
            IntentLabel::Unknown => "unknown",
        }
    }
}

/// How the attached [`IntentResult`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationMethod {
    Rules,
    Llm,
    RulesFallback,
}

/// Parameters extracted alongside the intent label.
#[derive(Debug, Clone, Default)]
pub struct ExtractedParams {
    pub keyword: Option<String>,
    pub issue_id: Option<String>,
    pub user_specific: bool,
}

/// The attached classification outcome (spec §4.3), carried on [`super::types::AgentContext`].
#[derive(Debug, Clone)]
pub struct IntentResult {
    pub label: IntentLabel,
    pub confidence: f64,
    pub extracted_params: ExtractedParams,
    pub method: ClassificationMethod,
}

struct PatternSet {
    positive: Vec<Regex>,
    negative: Vec<Regex>,
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
}

lazy_static! {
    static ref ISSUE_ID_RE: Regex = Regex::new(r"\b\d{5,8}\b").unwrap();

    static ref KEYWORD_PATTERNS: HashMap<IntentLabel, PatternSet> = {
        let mut map = HashMap::new();
        map.insert(IntentLabel::Search, PatternSet {
            positive: compile_all(&["search", "find", "look for", "검색", "찾아", "探して", "検索"]),
            negative: compile_all(&["list all", "모두 보여", "すべて"]),
        });
        map.insert(IntentLabel::ListAll, PatternSet {
            positive: compile_all(&["list all", "show all", "모든 .*보여", "すべて.*表示"]),
            negative: compile_all(&["search for", "찾아줘"]),
        });
        map.insert(IntentLabel::Detail, PatternSet {
            positive: compile_all(&["details? (about|on|for)", "자세히", "詳細"]),
            negative: Vec::new(),
        });
        map.insert(IntentLabel::Analyze, PatternSet {
            positive: compile_all(&["analyz", "compare", "분석", "比較", "分析"]),
            negative: Vec::new(),
        });
        map.insert(IntentLabel::Create, PatternSet {
            positive: compile_all(&["\\bcreate\\b", "\\badd\\b", "생성", "추가", "作成", "追加"]),
            negative: Vec::new(),
        });
        map.insert(IntentLabel::Update, PatternSet {
            positive: compile_all(&["\\bupdate\\b", "\\bedit\\b", "수정", "변경", "更新", "編集"]),
            negative: Vec::new(),
        });
        map.insert(IntentLabel::Delete, PatternSet {
            positive: compile_all(&["\\bdelete\\b", "\\bremove\\b", "삭제", "削除"]),
            negative: Vec::new(),
        });
        map
    };

    static ref USER_SPECIFIC_RE: Regex = Regex::new(
        r"(?i)\bmy\b|\bme\b|내 것|제 .*요청|私の|自分の"
    ).unwrap();
}

/// Confidence threshold below which the LLM tier is consulted (spec §4.3).
const LLM_FALLBACK_THRESHOLD: f64 = 0.6;

pub struct IntentClassifier {
    llm: Option<Arc<dyn ChatLlm>>,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn ChatLlm>>) -> Self {
        Self { llm }
    }

    /// The rule tier: score every label, normalize to a distribution over candidates
    /// with at least one positive hit, and return the winner plus its normalized score.
    fn rule_tier(&self, text: &str) -> (IntentLabel, f64) {
        let mut scores: HashMap<IntentLabel, f64> = HashMap::new();
        for label in IntentLabel::all() {
            let Some(patterns) = KEYWORD_PATTERNS.get(&label) else { continue };
            let positive_hits = patterns.positive.iter().filter(|re| re.is_match(text)).count() as f64;
            let negative_hits = patterns.negative.iter().filter(|re| re.is_match(text)).count() as f64;
            let score = positive_hits - 2.0 * negative_hits;
            if score > 0.0 {
                scores.insert(label, score);
            }
        }
        let total: f64 = scores.values().sum();
        if total <= 0.0 {
            return (IntentLabel::Unknown, 0.0);
        }
        let (label, score) = scores
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .expect("scores is non-empty");
        (label, score / total)
    }

    fn extract_params(&self, text: &str) -> ExtractedParams {
        let issue_id = ISSUE_ID_RE.find(text).map(|m| m.as_str().to_string());
        let user_specific = USER_SPECIFIC_RE.is_match(text);
        let keyword = text
            .split_whitespace()
            .find(|w| w.len() > 3)
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty());
        ExtractedParams { keyword, issue_id, user_specific }
    }

    /// Classify `text`, consulting the LLM tier when the rule tier is unconfident and
    /// an LLM is available; otherwise fall back per spec §4.3's default rule.
    pub async fn classify(&self, text: &str, agent_kind_hint: Option<AgentKind>) -> IntentResult {
        let extracted_params = self.extract_params(text);
        let (label, confidence) = self.rule_tier(text);

        if confidence >= LLM_FALLBACK_THRESHOLD {
            return IntentResult { label, confidence, extracted_params, method: ClassificationMethod::Rules };
        }

        if let Some(llm) = &self.llm {
            if let Some(result) = self.llm_tier(llm.as_ref(), text, extracted_params.clone()).await {
                return result;
            }
        }

        // A weak-but-nonzero rule score is still a real label (some pattern actually
        // fired); the hardcoded default only applies when nothing fired at all.
        if confidence > 0.0 {
            debug!("intent classifier: rule tier scored below the LLM-fallback threshold and no LLM result was available, keeping its weak label");
            return IntentResult { label, confidence, extracted_params, method: ClassificationMethod::RulesFallback };
        }

        debug!("intent classifier: no rule fired and no LLM available, applying fallback default");
        let fallback_label = if agent_kind_hint == Some(AgentKind::Ims) { IntentLabel::Search } else { IntentLabel::Unknown };
        IntentResult {
            label: fallback_label,
            confidence: 0.0,
            extracted_params,
            method: ClassificationMethod::RulesFallback,
        }
    }

    async fn llm_tier(&self, llm: &dyn ChatLlm, text: &str, extracted_params: ExtractedParams) -> Option<IntentResult> {
        let prompt = format!(
            "Classify the following task into exactly one of: search, list_all, detail, analyze, create, update, delete, unknown.\nRespond with only the label.\n\nTask: {text}"
        );
        let messages = [super::client::Message::user(prompt)];
        let response = llm.generate(&messages, None, Some(0.0)).await.ok()?;
        let label = match response.content.trim().to_lowercase().as_str() {
            "search" => IntentLabel::Search,
            "list_all" => IntentLabel::ListAll,
            "detail" => IntentLabel::Detail,
            "analyze" => IntentLabel::Analyze,
            "create" => IntentLabel::Create,
            "update" => IntentLabel::Update,
            "delete" => IntentLabel::Delete,
            _ => IntentLabel::Unknown,
        };
        Some(IntentResult { label, confidence: 0.8, extracted_params, method: ClassificationMethod::Llm })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confident_rule_hit_skips_the_llm_tier() {
        let classifier = IntentClassifier::new(None);
        let result = classifier.classify("Please search for the onboarding guide", None).await;
        assert_eq!(result.label, IntentLabel::Search);
        assert_eq!(result.method, ClassificationMethod::Rules);
    }

    #[tokio::test]
    async fn no_rule_fires_and_no_llm_falls_back_to_ims_search() {
        let classifier = IntentClassifier::new(None);
        let result = classifier.classify("asdkjf qwoeiru", Some(AgentKind::Ims)).await;
        assert_eq!(result.label, IntentLabel::Search);
        assert_eq!(result.method, ClassificationMethod::RulesFallback);
    }

    #[tokio::test]
    async fn no_rule_fires_and_no_llm_defaults_to_unknown_otherwise() {
        let classifier = IntentClassifier::new(None);
        let result = classifier.classify("asdkjf qwoeiru", None).await;
        assert_eq!(result.label, IntentLabel::Unknown);
    }

    #[tokio::test]
    async fn weak_but_nonzero_rule_confidence_keeps_its_own_label_when_no_llm_is_available() {
        let classifier = IntentClassifier::new(None);
        let result = classifier.classify("create and update the record", None).await;
        assert!(matches!(result.label, IntentLabel::Create | IntentLabel::Update));
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.method, ClassificationMethod::RulesFallback);
    }

    #[test]
    fn issue_id_is_extracted_when_present() {
        let classifier = IntentClassifier::new(None);
        let params = classifier.extract_params("please check ticket 123456 status");
        assert_eq!(params.issue_id.as_deref(), Some("123456"));
    }

    #[test]
    fn korean_and_japanese_patterns_are_registered() {
        assert!(KEYWORD_PATTERNS.get(&IntentLabel::Search).unwrap().positive.iter().any(|re| re.is_match("검색해줘")));
        assert!(KEYWORD_PATTERNS.get(&IntentLabel::Search).unwrap().positive.iter().any(|re| re.is_match("検索して")));
    }
}
