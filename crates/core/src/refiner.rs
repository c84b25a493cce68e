use crate::synthesizer::InstructionContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: String,
}

// The `Refiner` trait is the seam between the instruction synthesizer and
// whatever turns a grounded context into natural speech. The synthesizer
// validates every answer and falls back to a template on any error, so an
// implementation is free to fail.
//
// `automock` is listed before `async_trait` so the generated mock exposes
// plain return values in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Refiner: Send + Sync {
    /// Rephrases the context as one spoken sentence.
    async fn refine(&self, context: &InstructionContext) -> Result<String>;
}

/// Refiner backed by an OpenAI-compatible chat-completions endpoint.
pub struct RefinerClient {
    client: Client,
    api_key: SecretString,
    model: String,
    api_base: String,
}

impl RefinerClient {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self::with_api_base(api_key, model, DEFAULT_API_BASE.to_string())
    }

    pub fn with_api_base(api_key: SecretString, model: String, api_base: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Refiner for RefinerClient {
    async fn refine(&self, context: &InstructionContext) -> Result<String> {
        let prompt = build_prompt(context);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.1,
            "max_tokens": 50
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()
            .context("chat completion returned an error status")?
            .json::<LlmResponse>()
            .await
            .context("chat completion response was not valid JSON")?;

        let answer = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
            .message
            .content;

        Ok(answer.trim().trim_matches('"').trim().to_string())
    }
}

/// Refiner for deployments without a language model.
///
/// It always declines, so every instruction is the deterministic template.
pub struct OfflineRefiner;

#[async_trait]
impl Refiner for OfflineRefiner {
    async fn refine(&self, _context: &InstructionContext) -> Result<String> {
        Err(anyhow::anyhow!("refinement is disabled"))
    }
}

/// Prompt for a single grounded walking instruction.
pub fn build_prompt(context: &InstructionContext) -> String {
    let vision_line = if context.hazards.is_empty() {
        "path clear".to_string()
    } else {
        let heading = context
            .heading
            .map(|h| format!(", suggested move: {}", h.avoidance_phrase().to_lowercase()))
            .unwrap_or_default();
        format!("obstacles: {}{heading}", context.hazards.join(", "))
    };

    let sign_line = context
        .sign_text
        .as_deref()
        .map(|s| format!("Sign: {s}\n"))
        .unwrap_or_default();

    format!(
        r#"You are a navigation assistant for a BLIND pedestrian WALKING.
Create ONE natural, conversational sentence for audio guidance.
Next maneuver: {maneuver}
Vision: {vision_line}
{sign_line}Distance: {meters} meters, {steps} steps

CRITICAL RULES:
- Include the distance as "{meters} meters" or "{steps} steps"
- IF OBSTACLES DETECTED: name the obstacle and how to move around it FIRST, then the distance and maneuver
- IF NO OBSTACLES: start with the distance
- NEVER use: watch, see, look
- Maximum 15 words
- Use pedestrian terms (walk, turn, cross)

CORRECT with obstacle: 'Obstacle ahead: chair, move slightly left, then walk 120 steps straight.'
CORRECT without obstacle: 'Walk 120 steps straight ahead for 84 meters.'

Your sentence:"#,
        maneuver = context.maneuver,
        meters = context.distance_m,
        steps = context.steps,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::Heading;
    use std::env;

    fn context(hazards: &[&str]) -> InstructionContext {
        InstructionContext {
            step_index: 2,
            maneuver: "Turn left onto Elm Street".to_string(),
            distance_m: 84,
            steps: 120,
            hazards: hazards.iter().map(|h| h.to_string()).collect(),
            heading: Some(Heading::SlightRight),
            sign_text: None,
            route_complete: false,
            location_known: true,
        }
    }

    #[test]
    fn test_prompt_carries_grounding_figures() {
        let prompt = build_prompt(&context(&[]));
        assert!(prompt.contains("Distance: 84 meters, 120 steps"));
        assert!(prompt.contains("Next maneuver: Turn left onto Elm Street"));
        assert!(prompt.contains("Vision: path clear"));
        assert!(!prompt.contains("Sign:"));
    }

    #[test]
    fn test_prompt_lists_hazards_and_heading() {
        let mut ctx = context(&["scooter", "bin"]);
        ctx.sign_text = Some("Exit B".to_string());
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("obstacles: scooter, bin, suggested move: move slightly right"));
        assert!(prompt.contains("Sign: Exit B\n"));
    }

    #[tokio::test]
    async fn test_offline_refiner_declines() {
        let result = OfflineRefiner.refine(&context(&[])).await;
        assert!(result.is_err());
    }

    // Makes a live call to the chat-completions API. Run with
    // `cargo test -- --ignored` and OPENAI_API_KEY set.
    #[tokio::test]
    #[ignore]
    async fn test_refine_live() {
        dotenvy::dotenv_override().ok();
        let api_key = env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
        let refiner = RefinerClient::new(SecretString::from(api_key), "gpt-4o".to_string());

        let sentence = refiner.refine(&context(&["bicycle"])).await.unwrap();
        println!("Refined: {sentence}");
        assert!(!sentence.is_empty());
    }
}
