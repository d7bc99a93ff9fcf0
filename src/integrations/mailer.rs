use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use tracing::{info, instrument};

use super::upstream_error;
use crate::errors::ServiceError;
use crate::tracing::observe_outbound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub attachments: Vec<EmailAttachment>,
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
            text: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn attach(mut self, attachment: EmailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Transactional email delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError>;
}

#[derive(Serialize)]
struct OutboundAttachment<'a> {
    filename: &'a str,
    content_type: &'a str,
    content: String,
}

#[derive(Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<OutboundAttachment<'a>>,
}

/// Posts messages to a JSON email API (`POST {api_url}` with a bearer key),
/// attachments base64 encoded.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(client: reqwest::Client, api_url: String, api_key: String, from: String) -> Self {
        Self {
            client,
            api_url,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    #[instrument(skip(self, message), fields(to = %message.to, subject = %message.subject))]
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError> {
        let body = OutboundEmail {
            from: &self.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.html,
            text: message.text.as_deref(),
            attachments: message
                .attachments
                .iter()
                .map(|a| OutboundAttachment {
                    filename: &a.filename,
                    content_type: &a.content_type,
                    content: BASE64.encode(&a.content),
                })
                .collect(),
        };

        let response = observe_outbound("email", || {
            self.client
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
        })
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("Email request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(upstream_error("Email API", response).await);
        }
        Ok(())
    }
}

/// Logs messages instead of sending them; used when no email API is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            attachments = message.attachments.len(),
            "Email delivery disabled, message logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_mailer_base64_encodes_attachments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(json!({
                "from": "quotes@vaif.tech",
                "to": ["client@example.com"],
                "attachments": [{ "filename": "Q-24-06-0001.pdf", "content": "JVBERg==" }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mailer = HttpMailer::new(
            reqwest::Client::new(),
            format!("{}/emails", server.uri()),
            "key".into(),
            "quotes@vaif.tech".into(),
        );
        let message = EmailMessage::new("client@example.com", "Your quote", "<p>hi</p>").attach(
            EmailAttachment {
                filename: "Q-24-06-0001.pdf".into(),
                content_type: "application/pdf".into(),
                content: b"%PDF".to_vec(),
            },
        );

        mailer.send(&message).await.unwrap();
    }

    #[tokio::test]
    async fn http_mailer_surfaces_vendor_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mailer = HttpMailer::new(
            reqwest::Client::new(),
            server.uri(),
            "key".into(),
            "quotes@vaif.tech".into(),
        );
        let err = mailer
            .send(&EmailMessage::new("a@b.co", "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamError(_)));
    }
}
