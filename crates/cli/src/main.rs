use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use policy_rag::{
    annotate_references, filter_results, EvidenceLocalizer, HighlightConfig, HybridRetriever,
    KeywordConfig, KeywordExtractor, LlmClient, LlmKeywordSource, LlmProvider, PolicyAnswer,
    PolicyQa, RetrievalConfig, RetryPolicy, SearchResult,
};
use policy_rag_core::{
    ChunkConfig, ChunkStore, Chunker, DictionaryTokenizer, DocumentEntry, ParserRegistry,
    Snapshot, TermCounter, TermTables, TermWeighter, TermWeighterConfig, Tokenizer,
};
use policy_rag_index::JsonlWriter;
use policy_rag_llm::DEFAULT_CHAT_MODEL;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_CONFIG: &str = "policy-rag.toml";

const DEFAULT_TERM_FREQ: &str = "res/term.freq";

#[derive(Parser, Debug)]
#[command(name = "policy-rag", version = VERSION, about = "Policy document retrieval and evidence highlighting")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v', global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk tagged-text documents into the corpus snapshot.
    Ingest {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Record documents under this extension instead of their own, e.g. `pdf`
        /// when the inputs were extracted from PDFs of the same name.
        #[arg(long = "as-ext")]
        as_ext: Option<String>,
        #[arg(long = "chunk-size")]
        chunk_size: Option<usize>,
    },
    /// Count terms over the snapshot and write the term frequency table.
    Vocab {
        #[arg(long = "min-freq", default_value_t = 2)]
        min_freq: u64,
        /// Also count Han n-grams up to this length; 0 counts tokenizer words only.
        #[arg(long = "max-ngram", default_value_t = 0)]
        max_ngram: usize,
        /// Defaults to the configured term frequency path.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Rank chunks for a query and print the matching spans.
    Search {
        query: String,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
        /// Apply the relative score filter before printing.
        #[arg(long, action = ArgAction::SetTrue)]
        filter: bool,
        /// One JSON record per result on stdout.
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Answer a question from the corpus and highlight the evidence.
    Ask {
        question: String,
        /// Skip the model for keyword extraction.
        #[arg(long = "no-llm-keywords", action = ArgAction::SetTrue)]
        no_llm_keywords: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Highlight the evidence for an existing answer.
    Highlight {
        /// Query used to retrieve the candidate spans.
        #[arg(long)]
        query: String,
        /// File holding the answer text.
        #[arg(long = "answer-file")]
        answer_file: PathBuf,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = load_config(&config_path)?;
    config.apply_env(|key| env::var(key).ok());

    match cli.command {
        Commands::Ingest {
            inputs,
            as_ext,
            chunk_size,
        } => {
            let mut chunking = config.chunking;
            if let Some(size) = chunk_size {
                chunking.chunk_size = size;
            }
            let added = ingest(&inputs, as_ext.as_deref(), chunking, &config.paths.snapshot)?;
            println!("added {added} document(s) to {}", config.paths.snapshot.display());
        }
        Commands::Vocab {
            min_freq,
            max_ngram,
            out,
        } => {
            let out = out
                .or_else(|| config.paths.term_freq.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TERM_FREQ));
            let written = build_vocab(&config, min_freq, max_ngram, &out)?;
            println!("wrote {written} term(s) to {}", out.display());
        }
        Commands::Search {
            query,
            top_k,
            filter,
            json,
        } => {
            let (retriever, _) = build_retriever(&config);
            let top_k = top_k.unwrap_or(config.retrieval.top_k);
            let mut results = retriever.search(&query, top_k);
            if filter {
                results = filter_results(results, config.retrieval.score_threshold);
            }
            if json {
                let stdout = io::stdout();
                let mut writer = JsonlWriter::new(stdout.lock());
                writer.write_all(&results)?;
            } else {
                print_results(&results);
            }
        }
        Commands::Ask {
            question,
            no_llm_keywords,
            json,
        } => {
            if no_llm_keywords {
                config.llm.use_llm_keywords = false;
            }
            let qa = build_qa(&config)?;
            let answer = qa.answer(&question);
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
        }
        Commands::Highlight {
            query,
            answer_file,
            top_k,
        } => {
            let answer = fs::read_to_string(&answer_file)
                .with_context(|| format!("failed to read answer {}", answer_file.display()))?;
            let (retriever, _) = build_retriever(&config);
            let top_k = top_k.unwrap_or(config.retrieval.top_k);
            let results = filter_results(
                retriever.search(&query, top_k),
                config.retrieval.score_threshold,
            );
            let lines: Vec<&str> = answer.split('\n').collect();
            let localizer = build_localizer(&config);
            let images = localizer.localize(&lines, &results, &config.paths.output_dir);
            if images.is_empty() {
                println!("no evidence highlighted");
            }
            for image in images {
                println!("{}", image.display());
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn ingest(
    inputs: &[PathBuf],
    as_ext: Option<&str>,
    chunking: ChunkConfig,
    snapshot_path: &Path,
) -> Result<usize> {
    let registry = ParserRegistry::with_defaults();
    let chunker = Chunker::new(chunking);
    let mut store = ChunkStore::load(snapshot_path);
    let mut incoming = Snapshot::new();

    for path in collect_inputs(inputs)? {
        if !registry.supports(&path) {
            warn!(path = %path.display(), "unsupported input skipped");
            continue;
        }
        let name = document_name(&path, as_ext)?;
        if store.contains(&name) || incoming.contains_key(&name) {
            info!(document = %name, "already ingested");
            continue;
        }
        let parsed = match registry.parse(&path) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "failed to parse: {err}");
                continue;
            }
        };
        let entry = DocumentEntry::from_lines(&name, &parsed.lines, parsed.tables, &chunker);
        info!(document = %name, chunks = entry.text_chunks.len(), "document chunked");
        incoming.insert(name, entry);
    }

    let added = store.merge(incoming);
    if added > 0 {
        store.save(snapshot_path)?;
    }
    Ok(added)
}

/// Term counts come from the snapshot alone; an existing `term.freq` is not
/// fed back into the tokenizer.
fn build_vocab(config: &AppConfig, min_freq: u64, max_ngram: usize, out: &Path) -> Result<usize> {
    let snapshot = &config.paths.snapshot;
    let store = ChunkStore::try_load(snapshot)
        .with_context(|| format!("failed to load snapshot {}", snapshot.display()))?;
    let tables = TermTables::load(None, config.paths.ner.as_deref());
    let tokenizer = build_tokenizer(config, &tables);
    let mut counter = TermCounter::new(tokenizer).with_ngrams(max_ngram);
    let chunks = counter.add_store(&store);
    let written = counter.write(out, min_freq)?;
    info!(chunks, terms = written, min_freq, "vocabulary built");
    Ok(written)
}

fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let meta = fs::metadata(input)
            .with_context(|| format!("failed to inspect {}", input.display()))?;
        if meta.is_dir() {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                files.push(entry.path().to_path_buf());
            }
        } else if meta.is_file() {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn document_name(path: &Path, as_ext: Option<&str>) -> Result<String> {
    let renamed = match as_ext {
        Some(ext) => path.with_extension(ext.trim_start_matches('.')),
        None => path.to_path_buf(),
    };
    renamed
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("input {} has no file name", path.display()))
}

fn build_tokenizer(config: &AppConfig, tables: &TermTables) -> Arc<dyn Tokenizer> {
    let mut tokenizer = DictionaryTokenizer::with_vocabulary(tables.vocabulary());
    if let Some(dictionary) = &config.paths.dictionary {
        tokenizer.load_dictionary(dictionary);
    }
    Arc::new(tokenizer)
}

fn build_retriever(config: &AppConfig) -> (HybridRetriever, Arc<dyn Tokenizer>) {
    let tables = TermTables::load(
        config.paths.term_freq.as_deref(),
        config.paths.ner.as_deref(),
    );
    let tokenizer = build_tokenizer(config, &tables);
    let weighter = TermWeighter::new(Arc::clone(&tokenizer), tables, TermWeighterConfig::default());
    let store = ChunkStore::load(&config.paths.snapshot);
    let retriever = HybridRetriever::new(store, Arc::clone(&tokenizer), weighter, config.retrieval);
    (retriever, tokenizer)
}

fn build_localizer(config: &AppConfig) -> EvidenceLocalizer {
    EvidenceLocalizer::new(&config.paths.policy_dir, config.highlight.clone())
}

fn build_llm(config: &AppConfig) -> Result<LlmClient> {
    let provider = LlmProvider::from_str(&config.llm.provider)
        .ok_or_else(|| anyhow!("unknown llm provider `{}`", config.llm.provider))?;
    match &config.llm.base_url {
        Some(url) => LlmClient::with_base_url(provider, &config.llm.model, url),
        None => LlmClient::new(provider, &config.llm.model),
    }
}

fn build_qa(config: &AppConfig) -> Result<PolicyQa> {
    let (retriever, tokenizer) = build_retriever(config);
    let llm = build_llm(config)?;
    let keyword_config = config.llm.keyword_config();
    let mut keywords = KeywordExtractor::new(tokenizer, RetryPolicy::from(&keyword_config));
    if keyword_config.use_llm {
        keywords = keywords.with_source(LlmKeywordSource::new(llm.clone()));
    }
    Ok(PolicyQa::new(
        retriever,
        keywords,
        llm,
        build_localizer(config),
        &config.paths.output_dir,
    ))
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("no matching chunks");
        return;
    }
    for result in results {
        println!(
            "{} #{}  score={:.4}",
            result.document_name, result.chunk_index, result.hybrid_score
        );
        for span in &result.relevant_spans {
            println!("  ({:.2}) {}", span.score, policy_rag_core::strip_tags(&span.text).trim());
        }
    }
}

fn print_answer(answer: &PolicyAnswer) {
    if let Some(error) = &answer.error {
        println!("{error}");
        return;
    }
    if let Some(query) = &answer.optimized_query {
        println!("query: {query}");
    }
    let text = answer.final_answer.as_deref().unwrap_or_default();
    println!("{}", annotate_references(text, &answer.reference_images));
    if !answer.reference_images.is_empty() {
        let images: Vec<String> = answer
            .reference_images
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        println!("{}", json!({ "reference_images": images }));
    }
    let _ = io::stdout().flush();
}

fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).map_err(|e| anyhow!("invalid config: {e}"))
}

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    #[serde(default)]
    paths: PathsConfig,
    #[serde(default)]
    retrieval: RetrievalConfig,
    #[serde(default)]
    chunking: ChunkConfig,
    #[serde(default)]
    llm: LlmSection,
    #[serde(default)]
    highlight: HighlightConfig,
}

impl AppConfig {
    /// Environment wins over the file. `lookup` is `env::var` outside tests.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = set("POLICY_RAG_SNAPSHOT") {
            self.paths.snapshot = PathBuf::from(v);
        }
        if let Some(v) = set("POLICY_RAG_POLICY_DIR") {
            self.paths.policy_dir = PathBuf::from(v);
        }
        if let Some(v) = set("POLICY_RAG_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(v);
        }
        if let Some(v) = set("OLLAMA_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = set("POLICY_RAG_MODEL") {
            self.llm.model = v;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PathsConfig {
    snapshot: PathBuf,
    term_freq: Option<PathBuf>,
    ner: Option<PathBuf>,
    dictionary: Option<PathBuf>,
    policy_dir: PathBuf,
    output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from("res/processed_policies.json"),
            term_freq: Some(PathBuf::from("res/term.freq")),
            ner: Some(PathBuf::from("res/ner.json")),
            dictionary: None,
            policy_dir: PathBuf::from("data/policy"),
            output_dir: PathBuf::from("ocr_results"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LlmSection {
    provider: String,
    model: String,
    base_url: Option<String>,
    use_llm_keywords: bool,
    keyword_attempts: usize,
    keyword_retry_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        let keywords = KeywordConfig::default();
        Self {
            provider: "ollama".to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            base_url: None,
            use_llm_keywords: keywords.use_llm,
            keyword_attempts: keywords.max_attempts,
            keyword_retry_delay_ms: keywords.base_delay_ms,
        }
    }
}

impl LlmSection {
    fn keyword_config(&self) -> KeywordConfig {
        KeywordConfig {
            use_llm: self.use_llm_keywords,
            max_attempts: self.keyword_attempts,
            base_delay_ms: self.keyword_retry_delay_ms,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.chunking.chunk_size, 128);
        assert_eq!(config.llm.provider, "ollama");
        assert!(config.llm.use_llm_keywords);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy-rag.toml");
        fs::write(
            &path,
            r#"
[paths]
policy_dir = "docs"

[retrieval]
top_k = 8

[retrieval.weights]
keyword = 0.4

[llm]
provider = "local"
keyword_attempts = 1
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.paths.policy_dir, PathBuf::from("docs"));
        assert_eq!(config.paths.snapshot, PathBuf::from("res/processed_policies.json"));
        assert_eq!(config.retrieval.top_k, 8);
        assert!((config.retrieval.weights.keyword - 0.4).abs() < 1e-12);
        assert!((config.retrieval.weights.lexical - 0.5).abs() < 1e-12);
        assert_eq!(config.llm.keyword_config().max_attempts, 1);
        assert_eq!(config.llm.model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[retrieval]\ntop_k = \"many\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().starts_with("invalid config"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("POLICY_RAG_SNAPSHOT", "/tmp/snap.json"),
            ("POLICY_RAG_OUTPUT_DIR", "out"),
            ("OLLAMA_BASE_URL", "http://10.0.0.2:11434"),
            ("POLICY_RAG_MODEL", "qwen2:7b"),
            ("POLICY_RAG_POLICY_DIR", "  "),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.paths.snapshot, PathBuf::from("/tmp/snap.json"));
        assert_eq!(config.paths.output_dir, PathBuf::from("out"));
        assert_eq!(config.paths.policy_dir, PathBuf::from("data/policy"));
        assert_eq!(config.llm.base_url.as_deref(), Some("http://10.0.0.2:11434"));
        assert_eq!(config.llm.model, "qwen2:7b");
    }

    #[test]
    fn document_names_can_take_source_extension() {
        let path = Path::new("extracted/奖学金评定办法.txt");
        assert_eq!(document_name(path, None).unwrap(), "奖学金评定办法.txt");
        assert_eq!(document_name(path, Some(".pdf")).unwrap(), "奖学金评定办法.pdf");
    }

    #[test]
    fn ingest_walks_directories_and_skips_known_documents() {
        let dir = tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        fs::create_dir_all(inputs.join("nested")).unwrap();
        fs::write(
            inputs.join("a.txt"),
            "第一条 学生须修满学分。@@1\t10.0\t20.0\t200.0\t32.0##\n",
        )
        .unwrap();
        fs::write(inputs.join("nested").join("b.txt"), "第二条 申请条件。\n").unwrap();
        fs::write(inputs.join("notes.docx"), "ignored").unwrap();
        let snapshot = dir.path().join("res").join("processed_policies.json");

        let added = ingest(&[inputs.clone()], Some("pdf"), ChunkConfig::default(), &snapshot).unwrap();
        assert_eq!(added, 2);
        let store = ChunkStore::load(&snapshot);
        assert!(store.contains("a.pdf"));
        assert!(store.contains("b.pdf"));
        assert!(store.all_chunks()[0].text.contains("@@1"));

        let again = ingest(&[inputs], Some("pdf"), ChunkConfig::default(), &snapshot).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn vocab_counts_snapshot_terms_for_the_tokenizer() {
        let dir = tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();
        fs::write(
            inputs.join("a.txt"),
            "推免资格审查。@@1\t10.0\t20.0\t200.0\t32.0##\n推免名额分配。\n",
        )
        .unwrap();
        let dictionary = dir.path().join("dict.txt");
        fs::write(&dictionary, "推免 10\n资格 5\n名额 3\n").unwrap();

        let mut config = AppConfig::default();
        config.paths.snapshot = dir.path().join("res").join("processed_policies.json");
        config.paths.ner = None;
        config.paths.dictionary = Some(dictionary);
        ingest(&[inputs], None, ChunkConfig::default(), &config.paths.snapshot).unwrap();

        let out = dir.path().join("res").join("term.freq");
        let written = build_vocab(&config, 2, 0, &out).unwrap();
        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "推免\t2\n");

        let tables = TermTables::load(Some(&out), None);
        let tokenizer = DictionaryTokenizer::with_vocabulary(tables.vocabulary());
        assert_eq!(tokenizer.tokens("推免资格"), vec!["推免", "资", "格"]);
    }

    #[test]
    fn vocab_needs_a_snapshot() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.snapshot = dir.path().join("missing.json");
        assert!(build_vocab(&config, 2, 0, &dir.path().join("term.freq")).is_err());
    }
}
