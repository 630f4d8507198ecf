//! LLM naming subsystem (§4.F). Tagged-variant provider dispatch, fixed prompt template,
//! retry-with-jitter for the `internal` provider only.
//!
//! Grounded on `original_source/.../llm_namer.py`'s three provider handlers and prompt text;
//! the 503 backoff-with-jitter loop follows this codebase's `broker.rs` retry idiom.

use crate::error::NamingError;
use crate::model::{LlmConfig, LlmProvider};
use rand::Rng;
use std::time::Duration;

const INTERNAL_TIMEOUT: Duration = Duration::from_secs(30);
const INTERNAL_MAX_ATTEMPTS: u32 = 5;

fn build_prompt(samples: &[String]) -> String {
    format!(
        "These are representative texts from a document cluster:\n\n\
         {}\n\n\
         Provide a short, concise topic name (2-4 words) that captures the main theme. \
         Respond with ONLY the topic name, nothing else.",
        samples.join("\n")
    )
}

/// Generate a topic label for one cluster's sample texts. `texts` is truncated to
/// `samples_per_cluster` before prompting.
pub async fn generate_topic_name(
    http: &reqwest::Client,
    llm_inference_api_url: &str,
    config: &LlmConfig,
    texts: &[String],
) -> Result<String, NamingError> {
    let provider = config
        .provider_tag()
        .map_err(|e| NamingError::ProviderCall { provider: config.provider.clone(), message: e })?;
    let knobs = config.naming_knobs();
    let samples: Vec<String> = texts
        .iter()
        .take(knobs.samples_per_cluster.max(1) as usize)
        .cloned()
        .collect();
    let prompt = build_prompt(&samples);

    match provider {
        LlmProvider::Cohere => generate_cohere(http, config, &prompt, &knobs).await,
        LlmProvider::Openai => generate_openai(http, config, &prompt, &knobs).await,
        LlmProvider::Internal => {
            generate_internal(http, llm_inference_api_url, config, &prompt, &knobs).await
        }
    }
}

async fn generate_cohere(
    http: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
    knobs: &crate::model::LlmNamingKnobs,
) -> Result<String, NamingError> {
    #[derive(serde::Serialize)]
    struct Message<'a> {
        role: &'a str,
        content: &'a str,
    }
    #[derive(serde::Serialize)]
    struct Request<'a> {
        model: &'a str,
        messages: [Message<'a>; 1],
        max_tokens: u32,
        temperature: f64,
    }
    #[derive(serde::Deserialize)]
    struct ContentItem {
        text: String,
    }
    #[derive(serde::Deserialize)]
    struct ResponseMessage {
        content: Vec<ContentItem>,
    }
    #[derive(serde::Deserialize)]
    struct Response {
        message: ResponseMessage,
    }

    let model = if config.model.is_empty() { "command-r-plus" } else { &config.model };
    let body = Request {
        model,
        messages: [Message { role: "user", content: prompt }],
        max_tokens: knobs.max_tokens,
        temperature: knobs.temperature,
    };

    let resp = http
        .post("https://api.cohere.com/v2/chat")
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| NamingError::ProviderCall { provider: "cohere".into(), message: e.to_string() })?;

    if !resp.status().is_success() {
        return Err(NamingError::ProviderCall {
            provider: "cohere".into(),
            message: format!("http {}", resp.status()),
        });
    }

    let parsed: Response = resp
        .json()
        .await
        .map_err(|e| NamingError::ProviderCall { provider: "cohere".into(), message: e.to_string() })?;
    parsed
        .message
        .content
        .into_iter()
        .next()
        .map(|c| c.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(NamingError::EmptyResponse)
}

async fn generate_openai(
    http: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
    knobs: &crate::model::LlmNamingKnobs,
) -> Result<String, NamingError> {
    #[derive(serde::Serialize)]
    struct Message<'a> {
        role: &'a str,
        content: &'a str,
    }
    #[derive(serde::Serialize)]
    struct Request<'a> {
        model: &'a str,
        messages: [Message<'a>; 1],
        max_tokens: u32,
        temperature: f64,
    }
    #[derive(serde::Deserialize)]
    struct Choice {
        message: ChoiceMessage,
    }
    #[derive(serde::Deserialize)]
    struct ChoiceMessage {
        content: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct Response {
        choices: Vec<Choice>,
    }

    let model = if config.model.is_empty() { "gpt-4" } else { &config.model };
    let body = Request {
        model,
        messages: [Message { role: "user", content: prompt }],
        max_tokens: knobs.max_tokens,
        temperature: knobs.temperature,
    };

    let resp = http
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| NamingError::ProviderCall { provider: "openai".into(), message: e.to_string() })?;

    if !resp.status().is_success() {
        return Err(NamingError::ProviderCall {
            provider: "openai".into(),
            message: format!("http {}", resp.status()),
        });
    }

    let parsed: Response = resp
        .json()
        .await
        .map_err(|e| NamingError::ProviderCall { provider: "openai".into(), message: e.to_string() })?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(NamingError::EmptyResponse)
}

async fn generate_internal(
    http: &reqwest::Client,
    base_url: &str,
    config: &LlmConfig,
    prompt: &str,
    knobs: &crate::model::LlmNamingKnobs,
) -> Result<String, NamingError> {
    #[derive(serde::Serialize)]
    struct Message<'a> {
        role: &'a str,
        content: &'a str,
    }
    #[derive(serde::Serialize)]
    struct Request<'a> {
        model: &'a str,
        messages: [Message<'a>; 1],
        max_tokens: u32,
        temperature: f64,
    }
    #[derive(serde::Deserialize)]
    struct ResponseMessage {
        content: String,
    }
    #[derive(serde::Deserialize)]
    struct Response {
        message: ResponseMessage,
    }

    let model = if config.model.is_empty() {
        "mistralai/Mistral-7B-Instruct-v0.2"
    } else {
        &config.model
    };
    let url = format!("{}/api/chat", base_url.trim_end_matches('/'));

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let body = Request {
            model,
            messages: [Message { role: "user", content: prompt }],
            max_tokens: knobs.max_tokens,
            temperature: knobs.temperature,
        };

        let result = http
            .post(&url)
            .timeout(INTERNAL_TIMEOUT)
            .json(&body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                return Err(NamingError::ProviderCall {
                    provider: "internal".into(),
                    message: e.to_string(),
                })
            }
        };

        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE && attempt < INTERNAL_MAX_ATTEMPTS {
            let delay = backoff_with_jitter(attempt);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "internal LLM provider returned 503, retrying");
            tokio::time::sleep(delay).await;
            continue;
        }

        if !resp.status().is_success() {
            return Err(NamingError::ProviderCall {
                provider: "internal".into(),
                message: format!("http {}", resp.status()),
            });
        }

        let parsed: Response = resp
            .json()
            .await
            .map_err(|e| NamingError::ProviderCall { provider: "internal".into(), message: e.to_string() })?;
        let text = parsed.message.content.trim().to_string();
        if text.is_empty() {
            return Err(NamingError::EmptyResponse);
        }
        return Ok(text);
    }
}

/// `2^attempt` seconds, jittered by ±10%.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(-0.10..=0.10);
    let secs = (base * (1.0 + jitter)).max(0.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_matches_documented_template() {
        let prompt = build_prompt(&["alpha".to_string(), "beta".to_string()]);
        assert!(prompt.starts_with("These are representative texts from a document cluster:\n\n"));
        assert!(prompt.contains("alpha\nbeta"));
        assert!(prompt.ends_with("Respond with ONLY the topic name, nothing else."));
    }

    #[test]
    fn backoff_grows_and_stays_near_base() {
        for attempt in 1..5 {
            let d = backoff_with_jitter(attempt);
            let base = 2f64.powi(attempt as i32);
            assert!(d.as_secs_f64() >= base * 0.89);
            assert!(d.as_secs_f64() <= base * 1.11);
        }
    }
}
