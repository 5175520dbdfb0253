//! Prompt rewriting through an OpenAI-compatible chat-completion endpoint.
//!
//! Enhancement never fails the caller: every outcome other than
//! [`EnhanceOutcome::Rewritten`] resolves to the original prompt unchanged.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EnhanceConfig;

const SYSTEM_PROMPT: &str = r#"You are part of a team of bots that creates videos. You work with an assistant bot that will draw anything you say in square brackets.

For example , outputting " a beautiful morning in the woods with the sun peaking through the trees " will trigger your partner bot to output an video of a forest morning , as described. You will be prompted by people looking to create detailed , amazing videos. The way to accomplish this is to take their short prompts and make them extremely detailed and descriptive.
There are a few rules to follow:

You will only ever output a single video description per user request.

When modifications are requested , you should not simply make the description longer . You should refactor the entire description to integrate the suggestions.
Other times the user will not want modifications , but instead want a new image . In this case , you should ignore your previous conversation with the user.

Video descriptions must have the same num of words as examples below. Extra words will be ignored.
"#;

/// Few-shot exchanges: (user input, expected caption).
const EXAMPLES: [(&str, &str); 3] = [
    (
        "a girl is on the beach",
        "A radiant woman stands on a deserted beach, arms outstretched, wearing a beige trench coat, white blouse, light blue jeans, and chic boots, against a backdrop of soft sky and sea. Moments later, she is seen mid-twirl, arms exuberant, with the lighting suggesting dawn or dusk. Then, she runs along the beach, her attire complemented by an off-white scarf and black ankle boots, the tranquil sea behind her. Finally, she holds a paper airplane, her pose reflecting joy and freedom, with the ocean's gentle waves and the sky's soft pastel hues enhancing the serene ambiance.",
    ),
    (
        "A man jogging on a football field",
        "A determined man in athletic attire, including a blue long-sleeve shirt, black shorts, and blue socks, jogs around a snow-covered soccer field, showcasing his solitary exercise in a quiet, overcast setting. His long dreadlocks, focused expression, and the serene winter backdrop highlight his dedication to fitness. As he moves, his attire, consisting of a blue sports sweatshirt, black athletic pants, gloves, and sneakers, grips the snowy ground. He is seen running past a chain-link fence enclosing the playground area, with a basketball hoop and children's slide, suggesting a moment of solitary exercise amidst the empty field.",
    ),
    (
        " A woman is dancing, HD footage, close-up",
        "A young woman with her hair in an updo and wearing a teal hoodie stands against a light backdrop, initially looking over her shoulder with a contemplative expression. She then confidently makes a subtle dance move, suggesting rhythm and movement. Next, she appears poised and focused, looking directly at the camera. Her expression shifts to one of introspection as she gazes downward slightly. Finally, she dances with confidence, her left hand over her heart, symbolizing a poignant moment, all while dressed in the same teal hoodie against a plain, light-colored background.",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Linear: `backoff * attempt` after the given failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EnhanceOutcome {
    /// No API key configured.
    Disabled,
    Rewritten(String),
    /// The service answered but the caption was blank.
    Empty,
    Exhausted { attempts: u32, last_error: String },
}

impl EnhanceOutcome {
    /// The prompt to use downstream.
    pub fn resolve(&self, original: &str) -> String {
        match self {
            Self::Rewritten(text) => text.clone(),
            _ => original.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Rewritten(_) => "rewritten",
            Self::Empty => "empty",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: std::borrow::Cow<'a, str>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

fn caption_request(input: &str) -> String {
    format!(
        "Create an imaginative video descriptive caption or modify an earlier caption for the user input : \"{input}\""
    )
}

fn build_messages(text: &str) -> Vec<ChatMessage<'_>> {
    let mut messages = vec![ChatMessage {
        role: "system",
        content: SYSTEM_PROMPT.into(),
    }];
    for (input, caption) in EXAMPLES {
        messages.push(ChatMessage {
            role: "user",
            content: caption_request(input).into(),
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: caption.into(),
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: format!(
            "Create an imaginative video descriptive caption or modify an earlier caption in ENGLISH for the user input: \"{text}\""
        )
        .into(),
    });
    messages
}

struct AttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl AttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

pub struct PromptEnhancer {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    policy: RetryPolicy,
}

impl PromptEnhancer {
    pub fn new(config: &EnhanceConfig) -> Result<Self> {
        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            config.base_url.trim().trim_end_matches('/')
        ))
        .with_context(|| format!("invalid enhance base_url: {}", config.base_url))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            api_key: if config.has_api_key() {
                config.api_key.clone()
            } else {
                None
            },
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            policy: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff: config.backoff(),
            },
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn enhance(&self, prompt: &str) -> EnhanceOutcome {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("No API key configured, prompt enhancement disabled");
            return EnhanceOutcome::Disabled;
        };

        let text = prompt.trim();
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.attempt(api_key, text).await {
                Ok(caption) if caption.trim().is_empty() => {
                    info!(attempt, "Prompt enhancement returned a blank caption");
                    return EnhanceOutcome::Empty;
                }
                Ok(caption) => {
                    info!(
                        attempt,
                        original_len = prompt.len(),
                        enhanced_len = caption.len(),
                        "Prompt enhanced"
                    );
                    return EnhanceOutcome::Rewritten(caption.trim().to_string());
                }
                Err(AttemptError { retryable, error }) => {
                    last_error = format!("{error:#}");
                    if !retryable {
                        warn!(attempt, error = %last_error, "Prompt enhancement failed");
                        return EnhanceOutcome::Exhausted {
                            attempts: attempt,
                            last_error,
                        };
                    }
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.delay_after(attempt);
                        warn!(
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "Prompt enhancement attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            attempts = self.policy.max_attempts,
            error = %last_error,
            "Prompt enhancement gave up, keeping the original prompt"
        );
        EnhanceOutcome::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        }
    }

    async fn attempt(&self, api_key: &str, text: &str) -> Result<String, AttemptError> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(text),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let retryable = is_retryable_transport(&err);
                let error = anyhow!("chat completion request failed: {err}");
                if retryable {
                    AttemptError::retryable(error)
                } else {
                    AttemptError::fatal(error)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error = anyhow!("chat completion returned HTTP {status}");
            return Err(if is_retryable_status(status) {
                AttemptError::retryable(error)
            } else {
                AttemptError::fatal(error)
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|err| {
            AttemptError::fatal(anyhow!("malformed chat completion response: {err}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| AttemptError::retryable(anyhow!("chat completion returned no choices")))
    }
}
