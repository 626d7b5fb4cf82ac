use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use policy_rag_core::strip_tags;
use policy_rag_llm::{LlmClient, LlmRequest, CONTEXT_HEADING, QUESTION_HEADING};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::filter::filter_results;
use crate::keywords::{expand_query, strip_think, KeywordExtractor};
use crate::localize::EvidenceLocalizer;
use crate::retriever::{HybridRetriever, SearchResult};

const NO_KEYWORDS: &str = "❌ 无法解析问题，请尝试更具体的提问。";
const NO_RESULTS: &str = "❌ 未能找到相关政策，请尝试更具体的问题。";

static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"《(.*?)》").expect("valid regex"));
static HIGHLIGHT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_highlighted\.jpg$").expect("valid regex"));

/// Everything one question produced, including the intermediate rankings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyAnswer {
    pub raw_question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_query: Option<String>,
    #[serde(default)]
    pub sorted_results: Vec<SearchResult>,
    #[serde(default)]
    pub filtered_results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Context block handed to the model: one header per document, one
/// `(score) text` line per span. Position tags are left out.
pub fn format_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|result| {
            let mut block = format!(
                "📄 文件: {} (相关性: {:.3})",
                result.document_name, result.hybrid_score
            );
            for span in &result.relevant_spans {
                block.push_str(&format!("\n({:.2}) {}", span.score, strip_tags(&span.text).trim()));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn answer_request(question: &str, formatted: &str) -> LlmRequest {
    let system = format!(
        "你是一个专业的学校政策咨询助手，请严格根据提供的上下文信息回答问题。\n\n\
上下文内容：\n{CONTEXT_HEADING}\n{formatted}\n\n{QUESTION_HEADING}\n{question}\n\n\
回答要求：\n\
1. 使用中文回答\n\
2. 用简洁，专业，确切的语句回答问题。\n\
3. 一定要用《》给出引用的政策文件名\n\
4. 并用【】给出引用的具体政策原文\n\
5. 如没有政策符合提问，则输出“并未查询到相关政策，无法作答”\n"
    );
    LlmRequest::user(question).with_system(system)
}

/// Tags the n-th `《…》` citation with the page index of the n-th highlight.
pub fn annotate_references(answer: &str, images: &[PathBuf]) -> String {
    let page_ids: Vec<String> = images
        .iter()
        .filter_map(|path| path.file_name()?.to_str())
        .filter_map(|name| HIGHLIGHT_NAME_RE.captures(name))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    let mut citation = 0usize;
    CITATION_RE
        .replace_all(answer, |caps: &regex::Captures<'_>| {
            let whole = &caps[0];
            let annotated = match page_ids.get(citation) {
                Some(id) => format!("{whole}[🖼️{id}]"),
                None => whole.to_string(),
            };
            citation += 1;
            annotated
        })
        .into_owned()
}

/// Question in, cited answer with highlighted evidence out.
pub struct PolicyQa {
    retriever: HybridRetriever,
    keywords: KeywordExtractor,
    llm: LlmClient,
    localizer: EvidenceLocalizer,
    output_dir: PathBuf,
}

impl PolicyQa {
    pub fn new(
        retriever: HybridRetriever,
        keywords: KeywordExtractor,
        llm: LlmClient,
        localizer: EvidenceLocalizer,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            retriever,
            keywords,
            llm,
            localizer,
            output_dir: output_dir.into(),
        }
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn answer(&self, question: &str) -> PolicyAnswer {
        let mut answer = PolicyAnswer {
            raw_question: question.to_string(),
            ..Default::default()
        };

        let keywords = self.keywords.extract(question);
        if keywords.is_empty() {
            answer.error = Some(NO_KEYWORDS.to_string());
            return answer;
        }
        let query = expand_query(&keywords);
        info!(question, query = %query, "expanded search query");
        answer.optimized_query = Some(query.clone());

        let config = self.retriever.config();
        let results = self.retriever.search(&query, config.top_k);
        if results.is_empty() {
            answer.error = Some(NO_RESULTS.to_string());
            return answer;
        }
        let filtered = filter_results(results.clone(), config.score_threshold);
        answer.sorted_results = results;

        let request = answer_request(question, &format_results(&filtered));
        let raw = match self.llm.generate_blocking(&request) {
            Ok(response) => response.content,
            Err(err) => {
                warn!("answer generation failed: {err:#}");
                answer.filtered_results = filtered;
                answer.error = Some(format!("❌ 回答生成失败: {err}"));
                return answer;
            }
        };
        let cleaned = strip_think(&raw);
        let lines: Vec<&str> = cleaned.split('\n').collect();
        let images = self.localizer.localize(&lines, &filtered, &self.output_dir);

        answer.filtered_results = filtered;
        answer.llm_thinking = Some(raw);
        answer.final_answer = Some(cleaned);
        answer.reference_images = images;
        answer
    }
}
