//! LLM integration for the hub.
//!
//! Supports:
//! - **Gemini**: `generateContent`, with SSE streaming
//! - **Anthropic-compatible**: Messages API gateways such as MiniMax
//!   (single-shot only)
//!
//! Both talk to the provider over reqwest directly so the raw finish and
//! block reasons are available to the safety check.

pub mod anthropic;
pub mod gemini;
pub mod provider;

pub use anthropic::AnthropicCompatibleProvider;
pub use gemini::GeminiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Gemini,
    AnthropicCompatible,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(LlmBackend::Gemini),
            "minimax" | "anthropic" | "anthropic-compatible" => Ok(LlmBackend::AnthropicCompatible),
            other => Err(format!("unknown LLM provider '{other}' (expected gemini or minimax)")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Endpoint override; required for Anthropic-compatible gateways.
    pub base_url: Option<String>,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Gemini => {
            let mut provider = GeminiProvider::new(config.api_key.clone(), &config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using Gemini (model: {})", config.model);
            Ok(Arc::new(provider))
        }
        LlmBackend::AnthropicCompatible => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| LlmError::RequestFailed {
                    provider: "anthropic-compatible".to_string(),
                    reason: "no base URL configured".to_string(),
                })?;
            tracing::info!(
                "Using Anthropic-compatible endpoint {} (model: {})",
                base_url,
                config.model
            );
            Ok(Arc::new(AnthropicCompatibleProvider::new(
                config.api_key.clone(),
                base_url,
                &config.model,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_gemini_provider() {
        let config = LlmConfig {
            backend: LlmBackend::Gemini,
            api_key: secrecy::SecretString::from("test-key"),
            model: "gemini-2.5-flash".to_string(),
            base_url: None,
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "gemini-2.5-flash");
    }

    #[test]
    fn anthropic_compatible_needs_base_url() {
        let mut config = LlmConfig {
            backend: LlmBackend::AnthropicCompatible,
            api_key: secrecy::SecretString::from("tok"),
            model: "claude-3-haiku-20240307".to_string(),
            base_url: None,
        };
        assert!(create_provider(&config).is_err());

        config.base_url = Some("https://api.minimax.io/anthropic".to_string());
        assert_eq!(
            create_provider(&config).unwrap().model_name(),
            "claude-3-haiku-20240307"
        );
    }

    #[test]
    fn backend_parses_provider_switch() {
        assert_eq!("Gemini".parse::<LlmBackend>().unwrap(), LlmBackend::Gemini);
        assert_eq!(
            "minimax".parse::<LlmBackend>().unwrap(),
            LlmBackend::AnthropicCompatible
        );
        assert!("openai".parse::<LlmBackend>().is_err());
    }
}
