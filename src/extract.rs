use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::TrackerResult;
use crate::models::{optional, Profile, ProfileFields};

/// Texts shorter than this are not worth sending anywhere.
pub const MIN_SOURCE_CHARS: usize = 50;
/// Upper bound on how much of a CV is sent.
pub const MAX_SOURCE_CHARS: usize = 8000;

const EXTRACTION_MAX_TOKENS: u32 = 2000;

// --- Provider trait ---

pub trait AiProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// Pick a provider by name, or the first one with an API key configured.
pub fn resolve_provider(name: Option<&str>) -> Result<Box<dyn AiProvider>> {
    match name.map(|n| n.trim().to_lowercase()).as_deref() {
        Some("gemini") => Ok(Box::new(GeminiProvider::new(GEMINI_DEFAULT_MODEL.to_string())?)),
        Some("anthropic") | Some("claude") => {
            Ok(Box::new(AnthropicProvider::new(ANTHROPIC_DEFAULT_MODEL.to_string())?))
        }
        Some(other) => Err(anyhow!("Unknown provider '{}'. Available: gemini, anthropic", other)),
        None => {
            if env::var("GEMINI_API_KEY").is_ok() {
                resolve_provider(Some("gemini"))
            } else if env::var("ANTHROPIC_API_KEY").is_ok() {
                resolve_provider(Some("anthropic"))
            } else {
                Err(anyhow!(
                    "No extraction provider configured. Set GEMINI_API_KEY or ANTHROPIC_API_KEY"
                ))
            }
        }
    }
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl GeminiProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not set. Set it with: export GEMINI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AiProvider for GeminiProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.1,
                max_output_tokens: max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/{}:generateContent", GEMINI_API_BASE, self.model_id))
            .query(&[("key", &self.api_key)])
            .json(&request)
            .send()
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Gemini API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: GeminiResponse = response
            .json()
            .context("Failed to parse Gemini API response")?;

        api_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|part| part.text.clone())
            .ok_or_else(|| anyhow!("No content in Gemini API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AiProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Profile extraction ---

/// Whatever the extractor managed to read; every field may be missing.
pub type ProfileDraft = ProfileFields;

fn extraction_prompt(cv_text: &str) -> String {
    format!(
        "Extract professional profile information from this CV/resume. Return ONLY valid JSON, no explanations.\n\n\
        Fields (use \"\" or [] when not present, never invent values):\n\
        - name: full name\n\
        - age: age in years, if stated\n\
        - bio: 2-4 line professional summary\n\
        - qualifications: degrees and certifications\n\
        - experience: work history summary\n\
        - projects: notable projects\n\
        - skills: array of skills\n\
        - achievements: awards and achievements\n\
        - portfolio_links: array of URLs (GitHub, portfolio, LinkedIn)\n\
        - looking_for: target role\n\n\
        CV Text:\n{}",
        cv_text
    )
}

pub fn extract_profile(provider: &dyn AiProvider, cv_text: &str) -> Result<ProfileDraft> {
    let trimmed = cv_text.trim();
    if trimmed.chars().count() < MIN_SOURCE_CHARS {
        debug!("CV text too short to extract from");
        return Ok(ProfileDraft::default());
    }
    let limited: String = trimmed.chars().take(MAX_SOURCE_CHARS).collect();

    let response = provider.complete(&extraction_prompt(&limited), EXTRACTION_MAX_TOKENS)?;
    let object = parse_json_object(&response)?;
    Ok(draft_from_object(&object))
}

fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Models like to wrap JSON in fences or prose; take the first complete
/// object in the response and ignore whatever follows it.
fn parse_json_object(response: &str) -> Result<Map<String, Value>> {
    let body = strip_code_fences(response);
    if let Ok(Value::Object(map)) = serde_json::from_str(body) {
        return Ok(map);
    }

    for (start, _) in body.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&body[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Ok(map);
        }
    }
    Err(anyhow!("No JSON object in extraction response"))
}

fn flatten(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => optional(Some(s.as_str())),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter(|item| !item.is_array() && !item.is_object())
                .filter_map(flatten)
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        Value::Null | Value::Object(_) => None,
    }
}

fn draft_from_object(object: &Map<String, Value>) -> ProfileDraft {
    let text = |keys: &[&str]| keys.iter().find_map(|k| object.get(*k).and_then(flatten));
    let age = object.get("age").and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    ProfileDraft {
        name: text(&["name"]),
        age,
        bio: text(&["bio"]),
        qualifications: text(&["qualifications", "qualification"]),
        experience: text(&["experience", "experience_summary"]),
        projects: text(&["projects"]),
        skills: text(&["skills"]),
        achievements: text(&["achievements"]),
        portfolio_links: text(&["portfolio_links"]),
        looking_for: text(&["looking_for"]),
    }
}

/// Outcome of an import: the saved profile and whether anything was extracted.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub profile: Profile,
    pub extracted: bool,
}

impl Database {
    /// Non-empty extracted fields overwrite stored ones. Extraction failures
    /// are logged and the profile is saved as it was.
    pub fn import_profile(
        &mut self,
        account_id: i64,
        cv_text: &str,
        provider: Option<&dyn AiProvider>,
    ) -> TrackerResult<ImportOutcome> {
        self.get_account(account_id)?;
        let mut fields = self
            .get_profile(account_id)?
            .map(|p| p.fields)
            .unwrap_or_default();

        let mut extracted = false;
        match provider {
            Some(provider) => match extract_profile(provider, cv_text) {
                Ok(draft) => {
                    extracted = draft != ProfileDraft::default();
                    fields.merge_from(&draft);
                }
                Err(e) => warn!(account_id, model = provider.model_name(), "Profile extraction failed: {:#}", e),
            },
            None => warn!(account_id, "No extraction provider available; profile left unchanged"),
        }

        let profile = self.save_profile(account_id, &fields)?;
        Ok(ImportOutcome { profile, extracted })
    }
}
