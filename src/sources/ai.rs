// src/sources/ai.rs
//! AI extractor: Gemini text generation behind the limiter, plus the
//! product-extraction prompt built on top of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AI_EXTRACTOR;
use crate::error::{ExtractError, ExtractResult};
use crate::limiter::{Priority, RateLimiterService};
use crate::resolver::{html, price, ProductDraft};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Largest cleaned HTML snippet sent in a prompt.
pub const MAX_SNIPPET_CHARS: usize = 15_000;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const CACHE_CAPACITY: usize = 500;

/// Low-level text generation. Does one real remote call, no retries.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> ExtractResult<String>;
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
}

/// Google Gemini `generateContent`. Requires `GEMINI_API_KEY`.
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn from_env() -> Self {
        let model = super::env_key("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self::new(super::env_key("GEMINI_API_KEY"), model)
    }

    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: super::http_client(),
            api_key,
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}
#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}
#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}
#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}
#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}
#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}
#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}
#[derive(Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

fn response_text(resp: GenerateResponse) -> ExtractResult<String> {
    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ExtractError::InvalidResponse(format!("prompt blocked: {reason}")));
    }
    let text: String = resp
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ExtractError::InvalidResponse("empty candidate text".into()));
    }
    Ok(text)
}

#[async_trait]
impl TextGenerator for GeminiProvider {
    async fn generate(&self, prompt: &str) -> ExtractResult<String> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(ExtractError::MissingCredentials {
                provider: "gemini".into(),
            });
        };
        let req = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                max_output_tokens: 1024,
            },
        };
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(&req)
            .send()
            .await
            .map_err(|e| ExtractError::from_reqwest("gemini", &e))?;
        let resp = super::ensure_success("gemini", resp).await?;
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::InvalidResponse(format!("gemini: {e}")))?;
        response_text(body)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Prompt-keyed response cache so a repeated page does not pay twice.
#[derive(Debug)]
struct ResponseCache {
    entries: HashMap<String, (Instant, String)>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<String> {
        let (stored, value) = self.entries.get(key)?;
        if now.saturating_duration_since(*stored) >= self.ttl {
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    fn insert(&mut self, key: String, value: String, now: Instant) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let ttl = self.ttl;
            self.entries
                .retain(|_, (at, _)| now.saturating_duration_since(*at) < ttl);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, (at, _))| *at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    self.entries.remove(&k);
                }
            }
        }
        self.entries.insert(key, (now, value));
    }
}

fn cache_key(prompt: &str) -> String {
    format!("{:x}", Sha256::digest(prompt.as_bytes()))
}

/// The `ai-extractor` source as the rest of the pipeline sees it.
pub struct AiExtractor {
    limiter: RateLimiterService,
    provider: Arc<dyn TextGenerator>,
    fallback: Option<String>,
    cache: Mutex<ResponseCache>,
}

impl AiExtractor {
    pub fn new(limiter: RateLimiterService, provider: Arc<dyn TextGenerator>) -> Self {
        Self {
            limiter,
            provider,
            fallback: None,
            cache: Mutex::new(ResponseCache::new(CACHE_TTL, CACHE_CAPACITY)),
        }
    }

    pub fn from_env(limiter: RateLimiterService) -> Self {
        Self::new(limiter, Arc::new(GeminiProvider::from_env()))
    }

    /// Text returned by `generate` when a call fails for a transient reason.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn generate(&self, prompt: &str) -> ExtractResult<String> {
        match self
            .run(prompt, Priority::Normal, |text| Ok(text.to_string()))
            .await
        {
            Ok(text) => Ok(text),
            Err(e) if !e.is_fatal() => match &self.fallback {
                Some(fb) => {
                    warn!(provider = self.provider.name(), error = %e, "ai generation failed, using fallback");
                    Ok(fb.clone())
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Ask the model for product fields over a cleaned snippet of `page_html`.
    pub async fn extract_product(&self, url: &str, page_html: &str) -> ExtractResult<ProductDraft> {
        let snippet = html::clean_for_ai(page_html, MAX_SNIPPET_CHARS);
        if snippet.is_empty() {
            return Err(ExtractError::InvalidResponse("page has no readable text".into()));
        }
        let prompt = product_prompt(url, &snippet);
        self.run(&prompt, Priority::Normal, parse_product_reply).await
    }

    /// Cache lookup, then one limited call whose reply must pass `parse`.
    /// A reply that fails `parse` counts as `InvalidResponse` for the retry loop.
    async fn run<T, P>(&self, prompt: &str, priority: Priority, parse: P) -> ExtractResult<T>
    where
        P: Fn(&str) -> ExtractResult<T> + Sync,
        T: Send,
    {
        if !self.provider.is_available() {
            return Err(ExtractError::MissingCredentials {
                provider: AI_EXTRACTOR.into(),
            });
        }

        let key = cache_key(prompt);
        let cached = self.cache.lock().get(&key, Instant::now());
        if let Some(text) = cached {
            if let Ok(value) = parse(&text) {
                debug!(provider = self.provider.name(), "ai cache hit");
                return Ok(value);
            }
        }

        let parse = &parse;
        let provider = &self.provider;
        let (text, value) = self
            .limiter
            .execute(AI_EXTRACTOR, priority, || async move {
                let text = provider.generate(prompt).await?;
                let value = parse(&text)?;
                Ok::<_, ExtractError>((text, value))
            })
            .await?;

        self.cache.lock().insert(key, text, Instant::now());
        Ok(value)
    }
}

fn product_prompt(url: &str, snippet: &str) -> String {
    format!(
        "You extract product data from an online store page.\n\
         Page URL: {url}\n\
         Reply with ONE JSON object and nothing else, using exactly these keys:\n\
         \"name\" (string), \"price\" (number, current price), \"originalPrice\" (number or null, \
         list price before discount), \"imageUrl\" (absolute URL or null), \"description\" \
         (string up to 300 chars or null), \"category\" (string or null), \"brand\" (string or null).\n\
         Use null for anything not present on the page. Do not invent values.\n\
         Page content:\n{snippet}"
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiProductReply {
    name: Option<String>,
    price: Option<Value>,
    original_price: Option<Value>,
    image_url: Option<String>,
    description: Option<String>,
    category: Option<String>,
    brand: Option<String>,
}

/// Parse the model's JSON reply (tolerating ``` fences and chatter around it).
pub fn parse_product_reply(text: &str) -> ExtractResult<ProductDraft> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(ExtractError::InvalidResponse(
                "no JSON object in ai reply".into(),
            ))
        }
    };
    let reply: AiProductReply = serde_json::from_str(json)
        .map_err(|e| ExtractError::InvalidResponse(format!("ai reply is not product JSON: {e}")))?;

    Ok(ProductDraft {
        name: non_empty(reply.name),
        price: reply.price.as_ref().and_then(price::price_from_json),
        original_price: reply.original_price.as_ref().and_then(price::price_from_json),
        image_url: non_empty(reply.image_url).filter(|u| u.starts_with("http")),
        description: non_empty(reply.description),
        category: non_empty(reply.category),
        brand: non_empty(reply.brand),
    })
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::PipelineConfig;

    struct Canned {
        reply: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, _prompt: &str) -> ExtractResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
        fn name(&self) -> &'static str {
            "canned"
        }
        fn is_available(&self) -> bool {
            true
        }
    }

    #[test]
    fn fenced_reply_is_parsed() {
        let reply = "```json\n{\"name\": \" Cafeteira Expresso \", \"price\": \"R$ 1.299,90\", \"originalPrice\": null, \"imageUrl\": \"/rel.png\", \"brand\": \"Oster\"}\n```";
        let d = parse_product_reply(reply).unwrap();
        assert_eq!(d.name.as_deref(), Some("Cafeteira Expresso"));
        assert_eq!(d.price, Some(1299.90));
        assert_eq!(d.original_price, None);
        assert_eq!(d.image_url, None);
        assert_eq!(d.brand.as_deref(), Some("Oster"));
    }

    #[test]
    fn garbage_reply_is_invalid_response() {
        assert!(matches!(
            parse_product_reply("sorry, I cannot help"),
            Err(ExtractError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn missing_key_fails_without_touching_limiter() {
        let limiter = RateLimiterService::new(PipelineConfig::default());
        let ai = AiExtractor::new(limiter.clone(), Arc::new(GeminiProvider::new(None, DEFAULT_MODEL)))
            .with_fallback("n/a");
        assert!(!ai.is_available());
        let err = ai.generate("hi").await.unwrap_err();
        assert!(matches!(err, ExtractError::MissingCredentials { .. }));
        assert_eq!(limiter.stats(AI_EXTRACTOR).unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn repeated_prompt_is_served_from_cache() {
        let limiter = RateLimiterService::new(PipelineConfig::default());
        let gen = Arc::new(Canned {
            reply: "{\"name\": \"Mochila\", \"price\": 199.9}".into(),
            calls: AtomicU32::new(0),
        });
        let ai = AiExtractor::new(limiter.clone(), gen.clone());
        let html = "<html><body><h1>Mochila</h1><p>R$ 199,90</p></body></html>";
        let a = ai.extract_product("https://loja.test/mochila", html).await.unwrap();
        let b = ai.extract_product("https://loja.test/mochila", html).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.stats(AI_EXTRACTOR).unwrap().successful_requests, 1);
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let mut c = ResponseCache::new(CACHE_TTL, 2);
        let t0 = Instant::now();
        c.insert("a".into(), "1".into(), t0);
        c.insert("b".into(), "2".into(), t0 + Duration::from_secs(1));
        c.insert("c".into(), "3".into(), t0 + Duration::from_secs(2));
        assert!(c.get("a", t0 + Duration::from_secs(3)).is_none());
        assert_eq!(c.get("c", t0 + Duration::from_secs(3)).as_deref(), Some("3"));
        assert!(c.get("b", t0 + CACHE_TTL + Duration::from_secs(2)).is_none());
    }
}
