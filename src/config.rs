use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SUMMARY_COLLECTION: &str = "my-doc-summaries";
const DEFAULT_PASSAGE_COLLECTION: &str = "my-doc-chunks";
const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the board question-answering service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Qdrant instance holding both indexes.
    pub qdrant_url: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Collection holding one summary per source document.
    pub summary_collection: String,
    /// Collection holding the passages of every source document.
    pub passage_collection: String,
    /// Payload field carrying the source document identifier.
    pub document_id_field: String,
    /// Payload field carrying the searchable text.
    pub content_field: String,
    /// Embedding provider used to vectorize questions.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Provider used for streamed answer generation.
    pub generation_provider: GenerationProvider,
    /// Generation model identifier passed to the provider.
    pub generation_model: String,
    /// Base URL of the Ollama runtime.
    pub ollama_url: String,
    /// API key for OpenAI, required only when a provider is `openai`.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API.
    pub openai_base_url: String,
    /// Number of summaries retrieved per question.
    pub summary_top_k: usize,
    /// Number of passages retrieved per candidate document.
    pub passage_top_k: usize,
    /// Maximum number of passage queries in flight for one request.
    pub passage_concurrency: usize,
    /// How a failing per-document passage query affects the request.
    pub passage_failure_policy: FailurePolicy,
    /// Connect and read-idle timeout applied to every outbound HTTP request.
    pub http_timeout: Duration,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
}

/// Supported streaming generation backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI chat completions API.
    OpenAI,
}

/// Handling of a failed per-document passage query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first failing document query fails the whole retrieval.
    #[default]
    FailFast,
    /// Failing documents are logged and skipped; the remaining passages are kept.
    Isolate,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let embedding_provider: EmbeddingProvider =
            vars.required("EMBEDDING_PROVIDER")?.parse().map_err(|()| {
                ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string())
            })?;
        let generation_provider = match vars.optional("GENERATION_PROVIDER") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("GENERATION_PROVIDER".to_string()))?,
            None => GenerationProvider::from(embedding_provider),
        };

        let openai_api_key = vars.optional("OPENAI_API_KEY");
        let needs_openai = embedding_provider == EmbeddingProvider::OpenAI
            || generation_provider == GenerationProvider::OpenAI;
        if needs_openai && openai_api_key.is_none() {
            return Err(ConfigError::MissingVariable("OPENAI_API_KEY".to_string()));
        }

        let embedding_dimension: usize = vars.parsed("EMBEDDING_DIMENSION")?.ok_or_else(|| {
            ConfigError::MissingVariable("EMBEDDING_DIMENSION".to_string())
        })?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()));
        }

        let passage_failure_policy = match vars.optional("PASSAGE_FAILURE_POLICY") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("PASSAGE_FAILURE_POLICY".to_string()))?,
            None => FailurePolicy::default(),
        };

        Ok(Self {
            qdrant_url: vars.required("QDRANT_URL")?,
            qdrant_api_key: vars.optional("QDRANT_API_KEY"),
            summary_collection: vars.or_default("SUMMARY_COLLECTION", DEFAULT_SUMMARY_COLLECTION),
            passage_collection: vars.or_default("PASSAGE_COLLECTION", DEFAULT_PASSAGE_COLLECTION),
            document_id_field: vars.or_default("DOCUMENT_ID_FIELD", "id"),
            content_field: vars.or_default("CONTENT_FIELD", "text"),
            embedding_provider,
            embedding_model: vars.required("EMBEDDING_MODEL")?,
            embedding_dimension,
            generation_provider,
            generation_model: vars.required("GENERATION_MODEL")?,
            ollama_url: vars.or_default("OLLAMA_URL", DEFAULT_OLLAMA_URL),
            openai_api_key,
            openai_base_url: vars.or_default("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
            summary_top_k: vars.positive("SUMMARY_TOP_K", 15)?,
            passage_top_k: vars.positive("PASSAGE_TOP_K", 10)?,
            passage_concurrency: vars.positive("PASSAGE_CONCURRENCY", 1)?,
            passage_failure_policy,
            http_timeout: Duration::from_secs(vars.positive("HTTP_TIMEOUT_SECS", 60)? as u64),
            server_port: vars.parsed("SERVER_PORT")?,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.optional(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string()))
            })
            .transpose()
    }

    fn positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parsed::<usize>(key)? {
            Some(0) => Err(ConfigError::InvalidValue(key.to_string())),
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for GenerationProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "isolate" => Ok(Self::Isolate),
            _ => Err(()),
        }
    }
}

impl From<EmbeddingProvider> for GenerationProvider {
    fn from(provider: EmbeddingProvider) -> Self {
        match provider {
            EmbeddingProvider::Ollama => Self::Ollama,
            EmbeddingProvider::OpenAI => Self::OpenAI,
        }
    }
}

/// Global configuration cache populated by the host binaries during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = %config.qdrant_url,
        summaries = %config.summary_collection,
        passages = %config.passage_collection,
        embedding_provider = ?config.embedding_provider,
        generation_provider = ?config.generation_provider,
        generation_model = %config.generation_model,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
