//! Post-processing of finalized user text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chuzzi_core::error::{ChuzziError, Result};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Rewrites a finalized piece of user text before it enters the conversation log.
#[async_trait]
pub trait TextTransform: Send + Sync {
    async fn transform(&self, text: &str) -> Result<String>;
}

/// Converts user speech transcriptions to Roman Urdu (Urdu in Latin letters)
/// with a one-shot Gemini `generateContent` call.
pub struct RomanScriptTransform {
    pub base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl RomanScriptTransform {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn conversion_prompt(text: &str) -> String {
    format!(
        "Rewrite the following text in Roman Urdu (Urdu written with English letters).\n\
         Keep the exact Urdu meaning, tone and emotion. Do not translate to English; \
         only change the script. If the text is English, give its natural Roman Urdu form.\n\n\
         Examples:\n\
         'میں ٹھیک ہوں' -> 'main theek hoon'\n\
         'کیا کر رہے ہو' -> 'kia kr rahe ho'\n\
         'I am fine' -> 'main theek hoon'\n\n\
         Reply with the converted text only.\n\n\
         Text: \"{text}\""
    )
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Trimmed text of the first candidate, or `None` when there is none.
fn first_candidate_text(response: &GenerateResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[async_trait]
impl TextTransform for RomanScriptTransform {
    async fn transform(&self, text: &str) -> Result<String> {
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: conversion_prompt(text),
                }],
            }],
        };
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        debug!(model = %self.model, chars = text.chars().count(), "Converting user text");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChuzziError::Transform(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChuzziError::Transform(format!("Gemini API error {status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ChuzziError::Transform(format!("invalid response: {e}")))?;

        first_candidate_text(&parsed)
            .ok_or_else(|| ChuzziError::Transform("empty conversion result".into()))
    }
}
