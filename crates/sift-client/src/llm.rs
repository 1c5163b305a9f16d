use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use sift_core::error::AppError;
use sift_core::models::HydrationRequest;
use sift_core::traits::Hydrator;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You reconcile raw web extraction data into one product record. \
The truth sheet comes from machine-readable page data and is authoritative for prices, currency, \
identifiers and images. Use the page content to fill fields the truth sheet lacks and to verify \
features and descriptions. Pick image_urls from the image candidates, best first, and include only \
product photos. If a value appears in neither source, return null (or an empty list). \
Do not invent values. Respond ONLY with JSON matching the requested schema.";

/// OpenAI-compatible LLM client for record hydration.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - OpenRouter (`https://openrouter.ai/api/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiHydrator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    system_prompt: String,
}

impl OpenAiHydrator {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let system_prompt = self.system_prompt;
        let hydrator = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(hydrator.with_system_prompt(system_prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn chat_request(&self, request: &HydrationRequest) -> Result<ChatRequest, AppError> {
        Ok(ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt(request)?,
                },
            ],
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: Some(JsonSchemaWrapper {
                    name: "record".to_string(),
                    strict: true,
                    schema: request.schema.clone(),
                }),
            }),
        })
    }
}

fn user_prompt(request: &HydrationRequest) -> Result<String, AppError> {
    let unit = &request.unit;
    let content = if unit.distilled.is_empty() {
        "(no readable content)"
    } else {
        unit.distilled.as_str()
    };
    let images = if unit.images.is_empty() {
        "(none)".to_string()
    } else {
        unit.images
            .iter()
            .map(|c| format!("- {}", c.url))
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(format!(
        "<truth_sheet>\n{}\n</truth_sheet>\n\n<product_context>\n{}\n</product_context>\n\n<image_candidates>\n{}\n</image_candidates>",
        serde_json::to_string_pretty(&unit.truth_sheet)?,
        content,
        images
    ))
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn status_error(status_code: u16, body: &str) -> AppError {
    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }

    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

    AppError::HydrationError {
        message,
        status_code,
        retryable: status_code >= 500,
    }
}

fn log_usage(response: &ChatResponse) {
    let Some(usage) = &response.usage else {
        tracing::warn!("No usage data in LLM response");
        return;
    };
    let reasoning_tokens = usage
        .completion_tokens_details
        .as_ref()
        .map_or(0, |d| d.reasoning_tokens);
    tracing::info!(
        model = response.model.as_deref().unwrap_or("unknown"),
        input_tokens = usage.prompt_tokens,
        output_tokens = usage.completion_tokens,
        reasoning_tokens,
        "LLM token usage"
    );
}

fn parse_completion(response: ChatResponse) -> Result<serde_json::Value, AppError> {
    let message = response.choices.into_iter().next().map(|c| c.message);

    if let Some(refusal) = message.as_ref().and_then(|m| m.refusal.as_deref()) {
        return Err(AppError::HydrationError {
            message: format!("LLM refused: {refusal}"),
            status_code: 200,
            retryable: false,
        });
    }

    let content = message
        .and_then(|m| m.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::HydrationError {
            message: "Empty response from LLM".into(),
            status_code: 200,
            retryable: false,
        })?;

    serde_json::from_str(&content).map_err(|e| {
        AppError::MalformedResponse(format!("LLM returned invalid JSON: {}. Raw: {}", e, content))
    })
}

impl Hydrator for OpenAiHydrator {
    async fn hydrate(&self, request: &HydrationRequest) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.chat_request(request)?;

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::MalformedResponse(format!("Failed to parse LLM response: {}", e)))?;

        log_usage(&chat_response);
        parse_completion(chat_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_core::images::{ImagePolicy, ImageSource, RawImage, select_candidates};
    use sift_core::models::{DistilledContent, DocumentId, ExtractionUnit};
    use sift_core::truth_sheet::{Field, FieldWrite, Provenance, TruthSheet};

    fn request() -> HydrationRequest {
        let mut sheet = TruthSheet::builder();
        sheet.apply(
            Provenance::LinkedData,
            FieldWrite::number(Field::Price, 19.99).unwrap(),
        );
        let images = select_candidates(
            &[RawImage::new("https://shop.com/products/mug.jpg", ImageSource::Img)],
            &ImagePolicy::default(),
        );
        HydrationRequest {
            unit: ExtractionUnit {
                document_id: DocumentId::new("mug"),
                truth_sheet: sheet.build(),
                distilled: DistilledContent::new("# Ceramic Mug\nHolds 350 ml."),
                images: images.candidates,
                image_starved: images.starved,
            },
            schema: serde_json::json!({"type": "object"}),
        }
    }

    fn completion(body: serde_json::Value) -> ChatResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_chat_request_shape() {
        let hydrator = OpenAiHydrator::with_base_url("key", "gpt-4o-mini", "http://localhost:1/v1/").unwrap();
        assert_eq!(hydrator.base_url, "http://localhost:1/v1");

        let body = serde_json::to_value(hydrator.chat_request(&request()).unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            body["response_format"]["json_schema"]["schema"],
            serde_json::json!({"type": "object"})
        );

        let prompt = body["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("19.99"));
        assert!(prompt.contains("Holds 350 ml."));
        assert!(prompt.contains("- https://shop.com/products/mug.jpg"));
    }

    #[test]
    fn test_prompt_marks_missing_inputs() {
        let mut req = request();
        req.unit.distilled = DistilledContent::empty();
        req.unit.images.clear();
        let prompt = user_prompt(&req).unwrap();
        assert!(prompt.contains("(no readable content)"));
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn test_parse_completion_json() {
        let response = completion(serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"content": "{\"name\": \"Mug\"}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }));
        let record = parse_completion(response).unwrap();
        assert_eq!(record["name"], "Mug");
    }

    #[test]
    fn test_parse_completion_errors() {
        let empty = completion(serde_json::json!({"choices": []}));
        assert!(matches!(
            parse_completion(empty),
            Err(AppError::HydrationError { .. })
        ));

        let garbage = completion(serde_json::json!({
            "choices": [{"message": {"content": "Sure! Here is the product"}}]
        }));
        assert!(matches!(
            parse_completion(garbage),
            Err(AppError::MalformedResponse(_))
        ));

        let refused = completion(serde_json::json!({
            "choices": [{"message": {"content": null, "refusal": "no"}}]
        }));
        let err = parse_completion(refused).unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_status_errors() {
        assert!(matches!(status_error(429, ""), AppError::RateLimitExceeded));

        let err = status_error(503, r#"{"error": {"message": "overloaded"}}"#);
        match err {
            AppError::HydrationError {
                message,
                status_code,
                retryable,
            } => {
                assert_eq!(message, "overloaded");
                assert_eq!(status_code, 503);
                assert!(retryable);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(!status_error(400, "bad request").is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_hydration_error() {
        let hydrator = OpenAiHydrator::with_base_url("key", "m", "http://127.0.0.1:9/v1").unwrap();
        let err = hydrator.hydrate(&request()).await.unwrap_err();
        assert_eq!(
            err.failure_reason(),
            sift_core::models::FailureReason::HydrationFailure
        );
    }
}
