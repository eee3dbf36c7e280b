//! Endpoint resolution for the bundled OpenAI-compatible adapter.
//!
//! Local inference servers all speak the same protocol on different ports.
//! [`Endpoint`] names the well-known ones; [`ProviderSettings`] resolves the
//! final connection settings, letting the environment override whatever the
//! code picked:
//!
//! - `AGENTLOOP_ENDPOINT`: endpoint preset name (`"ollama"`, `"lm-studio"`, ...)
//! - `AGENTLOOP_BASE_URL`: full base URL; wins over any preset
//! - `AGENTLOOP_MODEL`: model identifier
//! - `AGENTLOOP_API_KEY`: API key for hosted endpoints
//!
//! [`OpenAiProvider::for_endpoint`](crate::OpenAiProvider::for_endpoint) and
//! [`OpenAiProvider::from_env`](crate::OpenAiProvider::from_env) build on
//! this module, so the usual construction path is:
//!
//! ```rust,no_run
//! use agentloop::OpenAiProvider;
//! use agentloop::config::Endpoint;
//!
//! # fn example() -> Result<(), agentloop::Error> {
//! let provider = OpenAiProvider::for_endpoint(Endpoint::Ollama)?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::env;
use std::str::FromStr;

/// Well-known local OpenAI-compatible servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// LM Studio's built-in server.
    LmStudio,
    /// Ollama's OpenAI-compatible endpoint.
    Ollama,
    /// llama.cpp in server mode.
    LlamaCpp,
    /// A vLLM server.
    Vllm,
}

impl Endpoint {
    /// The port the server listens on out of the box.
    fn default_port(&self) -> u16 {
        match self {
            Endpoint::LmStudio => 1234,
            Endpoint::Ollama => 11434,
            Endpoint::LlamaCpp => 8080,
            Endpoint::Vllm => 8000,
        }
    }

    /// The localhost base URL for a default installation, `/v1` included.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}/v1", self.default_port())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses an endpoint name, ignoring case and `-`/`_`/`.` separators, so
    /// `"LM-Studio"`, `"lm_studio"`, and `"llama.cpp"` all resolve.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | '.'))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "lmstudio" => Ok(Endpoint::LmStudio),
            "ollama" => Ok(Endpoint::Ollama),
            "llamacpp" => Ok(Endpoint::LlamaCpp),
            "vllm" => Ok(Endpoint::Vllm),
            _ => Err(Error::config(format!("unknown endpoint '{s}'"))),
        }
    }
}

/// Resolved connection settings for the adapter.
///
/// Built either from an [`Endpoint`] preset or from the environment via
/// [`from_env`](ProviderSettings::from_env), then handed to
/// [`OpenAiProvider::from_settings`](crate::OpenAiProvider::from_settings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Chat-completions base URL, `/v1` included.
    pub base_url: String,
    /// Model identifier, when one was configured.
    pub model: Option<String>,
    /// API key, when one was configured.
    pub api_key: Option<String>,
}

impl ProviderSettings {
    /// Settings for a default local installation of `endpoint`.
    pub fn for_endpoint(endpoint: Endpoint) -> Self {
        Self {
            base_url: endpoint.base_url(),
            model: None,
            api_key: None,
        }
    }

    /// Settings resolved from the environment on top of an optional preset.
    ///
    /// The base URL comes from `AGENTLOOP_BASE_URL` when set, else the
    /// endpoint named by `AGENTLOOP_ENDPOINT`, else `fallback`, else LM
    /// Studio's default. Model and API key come from `AGENTLOOP_MODEL` /
    /// `AGENTLOOP_API_KEY` when set.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `AGENTLOOP_ENDPOINT` names an unknown
    /// endpoint.
    pub fn from_env(fallback: Option<Endpoint>) -> Result<Self> {
        let endpoint = match env::var("AGENTLOOP_ENDPOINT") {
            Ok(name) => Some(name.parse::<Endpoint>()?),
            Err(_) => fallback,
        };
        let base_url = env::var("AGENTLOOP_BASE_URL")
            .unwrap_or_else(|_| endpoint.unwrap_or(Endpoint::LmStudio).base_url());

        Ok(Self {
            base_url,
            model: env::var("AGENTLOOP_MODEL").ok(),
            api_key: env::var("AGENTLOOP_API_KEY").ok(),
        })
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The resolved model, or `default` when none was configured.
    pub fn model_or(&self, default: &str) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}
