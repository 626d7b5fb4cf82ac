use std::collections::HashSet;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use policy_rag_core::Tokenizer;
use policy_rag_llm::{LlmClient, LlmRequest};
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::KeywordConfig;

static THINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// Drops `<think>…</think>` reasoning blocks from model output.
pub fn strip_think(text: &str) -> String {
    THINK_RE.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keywords {
    pub keywords: Vec<String>,
    /// Keyword → synonyms, in the order the model listed them.
    pub synonyms: IndexMap<String, Vec<String>>,
}

impl Keywords {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// Keywords plus every synonym, first occurrence wins, space-joined.
pub fn expand_query(keywords: &Keywords) -> String {
    let mut seen = HashSet::new();
    keywords
        .keywords
        .iter()
        .chain(keywords.synonyms.values().flatten())
        .filter(|term| seen.insert(term.as_str()))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokenizer output as keywords, no synonyms.
pub fn local_keywords(tokenizer: &dyn Tokenizer, question: &str) -> Keywords {
    let mut seen = HashSet::new();
    let keywords = tokenizer
        .tokens(question)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    Keywords {
        keywords,
        synonyms: IndexMap::new(),
    }
}

/// Something that can pull search keywords out of a question.
pub trait KeywordSource: Send + Sync {
    fn extract(&self, question: &str) -> Result<Keywords>;
}

pub struct LlmKeywordSource {
    client: LlmClient,
}

impl LlmKeywordSource {
    /// The client makes one request per call; `RetryPolicy` owns the retries.
    pub fn new(client: LlmClient) -> Self {
        Self {
            client: client.with_max_retries(0),
        }
    }
}

impl KeywordSource for LlmKeywordSource {
    fn extract(&self, question: &str) -> Result<Keywords> {
        let response = self.client.generate_blocking(&LlmRequest::user(keyword_prompt(question)))?;
        parse_keyword_response(&response.content)
    }
}

fn keyword_prompt(question: &str) -> String {
    format!(
        "用户正在进行学校政策文件提问，请从以下问题中提取最重要的关键词（2-3字，只有专有名词可为4字以上），用于后续文档检索。\n\
同时，为每个关键词提供 1-2 个近义词。关键词应避免单字，常见词汇无需提取。近义词若没有，可以不提供。\n\n\
示例：\n\
- 输入：\"推免的年级排名应为多少？\"\n\
- 关键词提取：\"推免 年级 排名\"\n\
- 近义词扩展：\"推免|保研 年级|年段 排名|排名要求\"\n\n\
请严格按照以下格式返回：\n\
关键词：关键词1 关键词2 关键词3\n\
近义词：关键词1|近义词A 关键词2|近义词B 关键词3|近义词C\n\n\
请处理以下用户问题：\n问题：{question}\n"
    )
}

/// Reads the `关键词：` and `近义词：` lines. No keywords is an error.
pub fn parse_keyword_response(raw: &str) -> Result<Keywords> {
    let cleaned = strip_think(raw);
    let field = |label: &str| -> Vec<String> {
        cleaned
            .lines()
            .find_map(|line| {
                line.trim()
                    .strip_prefix(label)
                    .map(|rest| rest.trim_start_matches([':', '：']))
            })
            .map(|rest| rest.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    };

    let keywords = field("关键词");
    if keywords.is_empty() {
        return Err(anyhow!("model response has no keyword line"));
    }
    let mut synonyms: IndexMap<String, Vec<String>> = IndexMap::new();
    for pair in field("近义词") {
        if let Some((word, synonym)) = pair.split_once('|') {
            if !synonym.contains('|') {
                synonyms
                    .entry(word.to_string())
                    .or_default()
                    .push(synonym.to_string());
            }
        }
    }
    Ok(Keywords { keywords, synonyms })
}

/// Bounded attempts with exponential backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Runs `op` until it succeeds or attempts run out; returns the last error.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Result<T>,
    {
        let mut rng = thread_rng();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    warn!(attempt, "attempt failed, retrying: {err}");
                    let jitter = rng.gen_range(0..=self.base_delay_ms);
                    sleep(self.delay_for_attempt(attempt) + Duration::from_millis(jitter));
                }
            }
        }
    }
}

impl From<&KeywordConfig> for RetryPolicy {
    fn from(config: &KeywordConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }
}

/// Keyword extraction that always produces an answer: the model first,
/// the tokenizer once the model has used up its attempts.
pub struct KeywordExtractor {
    source: Option<Box<dyn KeywordSource>>,
    tokenizer: Arc<dyn Tokenizer>,
    retry: RetryPolicy,
}

impl KeywordExtractor {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, retry: RetryPolicy) -> Self {
        Self {
            source: None,
            tokenizer,
            retry,
        }
    }

    pub fn with_source<S: KeywordSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn extract(&self, question: &str) -> Keywords {
        if let Some(source) = &self.source {
            match self.retry.run(|_| source.extract(question)) {
                Ok(keywords) => return keywords,
                Err(err) => warn!(
                    attempts = self.retry.max_attempts,
                    "keyword extraction failed, falling back to tokenizer: {err}"
                ),
            }
        }
        let keywords = local_keywords(self.tokenizer.as_ref(), question);
        info!(keywords = keywords.keywords.len(), "keywords from tokenizer");
        keywords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_rag_core::DictionaryTokenizer;
    use policy_rag_llm::LlmProvider;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Flaky {
        calls: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    impl KeywordSource for Flaky {
        fn extract(&self, _question: &str) -> Result<Keywords> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                parse_keyword_response("关键词：保研 英语\n近义词：保研|推免\n")
            } else {
                Err(anyhow!("connection refused"))
            }
        }
    }

    fn tokenizer() -> Arc<dyn Tokenizer> {
        Arc::new(DictionaryTokenizer::with_vocabulary(["推免", "资格", "条件"]))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(0))
    }

    #[test]
    fn parses_keywords_and_synonyms_after_thinking() {
        let raw = "<think>先想想\n关键词：错误</think>\n---\n关键词：推免 年级 排名\n近义词：推免|保研 年级|年段 排名|排名要求 坏|对|的\n---";
        let parsed = parse_keyword_response(raw).unwrap();
        assert_eq!(parsed.keywords, vec!["推免", "年级", "排名"]);
        assert_eq!(parsed.synonyms["推免"], vec!["保研"]);
        assert_eq!(parsed.synonyms.len(), 3);
        assert_eq!(expand_query(&parsed), "推免 年级 排名 保研 年段 排名要求");
    }

    #[test]
    fn missing_keyword_line_is_an_error() {
        assert!(parse_keyword_response("我不知道").is_err());
        assert!(parse_keyword_response("关键词：\n").is_err());
    }

    #[test]
    fn retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = KeywordExtractor::new(tokenizer(), fast_retry()).with_source(Flaky {
            calls: Arc::clone(&calls),
            succeed_on: 2,
        });
        let keywords = extractor.extract("保研英语要求");
        assert_eq!(keywords.keywords, vec!["保研", "英语"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn falls_back_to_tokenizer_after_bounded_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = KeywordExtractor::new(tokenizer(), fast_retry()).with_source(Flaky {
            calls: Arc::clone(&calls),
            succeed_on: usize::MAX,
        });
        let keywords = extractor.extract("推免资格条件？");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(keywords.keywords, vec!["推免", "资格", "条件"]);
        assert!(keywords.synonyms.is_empty());
    }

    /// Answers every request with 503 and counts how many arrive.
    fn busy_ollama(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                read_request(&mut stream);
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                );
            }
        });
        format!("http://{addr}")
    }

    fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return;
            }
        }
    }

    #[test]
    fn llm_source_makes_one_request_per_attempt() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = busy_ollama(Arc::clone(&hits));
        let client = LlmClient::with_base_url(LlmProvider::Ollama, "m", base_url).unwrap();
        let extractor = KeywordExtractor::new(tokenizer(), fast_retry())
            .with_source(LlmKeywordSource::new(client));

        let keywords = extractor.extract("推免资格条件？");
        assert_eq!(keywords.keywords, vec!["推免", "资格", "条件"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn expansion_deduplicates_in_order() {
        let mut synonyms = IndexMap::new();
        synonyms.insert("保研".to_string(), vec!["推免".to_string(), "免试".to_string()]);
        let keywords = Keywords {
            keywords: vec!["推免".to_string(), "保研".to_string()],
            synonyms,
        };
        assert_eq!(expand_query(&keywords), "推免 保研 免试");
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
