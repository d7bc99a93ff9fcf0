use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use super::upstream_error;
use crate::entities::quote::ProjectAnalysis;
use crate::errors::ServiceError;
use crate::tracing::observe_outbound;

/// What the analyzer is told about a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub description: String,
    pub project_type: String,
    pub features: Vec<String>,
    pub technologies: Vec<String>,
}

/// Reads a free-text project description and sizes it up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProjectAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ProjectAnalysis, ServiceError>;
}

const SYSTEM_PROMPT: &str = "You are a software project estimator. Reply with a JSON object \
with keys summary (string, at most three sentences), suggested_features (array of short \
strings) and risk_level (one of low, medium, high).";

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiAnalyzer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ProjectAnalyzer for OpenAiAnalyzer {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ProjectAnalysis, ServiceError> {
        let prompt = format!(
            "Project type: {}\nFeatures: {}\nTechnologies: {}\nDescription:\n{}",
            request.project_type,
            request.features.join(", "),
            request.technologies.join(", "),
            request.description
        );
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = observe_outbound("analyzer", || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
        })
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("Analyzer request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(upstream_error("Analyzer", response).await);
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("Invalid analyzer response: {}", e)))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::UpstreamError("Analyzer returned no content".into()))?;

        serde_json::from_str::<ProjectAnalysis>(&content).map_err(|e| {
            ServiceError::UpstreamError(format!("Analyzer content is not an analysis: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            description: "Marketplace for local farmers".into(),
            project_type: "Web Application".into(),
            features: vec!["Payments".into()],
            technologies: vec![],
        }
    }

    #[tokio::test]
    async fn parses_json_content_of_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "model": "gpt-4o-mini" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content":
                    "{\"summary\":\"Two-sided marketplace\",\"suggested_features\":[\"Reviews\"],\"risk_level\":\"medium\"}"
                } }]
            })))
            .mount(&server)
            .await;

        let analyzer = OpenAiAnalyzer::new(
            reqwest::Client::new(),
            &format!("{}/v1/", server.uri()),
            "key".into(),
            "gpt-4o-mini".into(),
        );
        let analysis = analyzer.analyze(&request()).await.unwrap();
        assert_eq!(analysis.risk_level, "medium");
        assert_eq!(analysis.suggested_features, vec!["Reviews".to_string()]);
    }

    #[tokio::test]
    async fn prose_content_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "Sounds like a fun project!" } }]
            })))
            .mount(&server)
            .await;

        let analyzer =
            OpenAiAnalyzer::new(reqwest::Client::new(), &server.uri(), "k".into(), "m".into());
        assert!(matches!(
            analyzer.analyze(&request()).await,
            Err(ServiceError::UpstreamError(_))
        ));
    }
}
