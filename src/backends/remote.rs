use super::{AnalysisError, RawResponse};
use crate::camera_toolkit::EncodedImage;
use crate::llm_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, ErrorEnvelope,
    ImageUrl, MessageContent,
};
use crate::keyring::{CredentialError, CredentialStore};
use crate::settings::AppSettings;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;

const SYSTEM_INSTRUCTION: &str = r#"You are an experienced math teacher grading a student's worksheet from a photo.
Find every math problem in the image, decide whether the student's answer is correct, and give short, specific, encouraging feedback for each one.
Respond with a single JSON object and nothing else, using exactly these fields:
{
  "totalQuestions": integer,
  "correctAnswers": integer,
  "incorrectAnswers": integer,
  "grade": one of "A+", "A", "B+", "B", "C+", "C", "D+", "D", "F",
  "percentage": integer from 0 to 100,
  "feedback": string with overall feedback,
  "questionAnalysis": [
    { "questionNumber": integer starting at 1, "isCorrect": boolean, "feedback": string }
  ]
}
correctAnswers plus incorrectAnswers must equal totalQuestions, and questionAnalysis must have one entry per question.
If no math problems are visible in the image, say so in "feedback"."#;

const USER_INSTRUCTION: &str = "Grade this math worksheet. Check each problem for correctness and give feedback on every answer.";

const REJECTED_FALLBACK_MESSAGE: &str = "Failed to analyze image";

/// Sends worksheet images to an OpenAI-compatible vision model.
pub struct RemoteScoringBackend {
    credential: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteScoringBackend {
    pub fn from_settings(credential: Option<String>, settings: &AppSettings) -> Self {
        Self {
            credential: credential.filter(|key| !key.trim().is_empty()),
            base_url: settings.effective_base_url(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }

    fn api_key(&self) -> Result<&str, AnalysisError> {
        self.credential
            .as_deref()
            .ok_or(AnalysisError::Unauthenticated)
    }

    fn create_client(&self, api_key: &str) -> Result<reqwest::Client, AnalysisError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("Mathgrade/0.1"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| {
            warn!("API key cannot be sent as a header: {}", e);
            AnalysisError::Unauthenticated
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| AnalysisError::NetworkFailure(format!("Failed to build HTTP client: {}", e)))
    }

    pub fn build_request(&self, image: &EncodedImage) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: MessageContent::Text(SYSTEM_INSTRUCTION.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: USER_INSTRUCTION.to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: image.to_data_url(),
                            },
                        },
                    ]),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub async fn analyze(&self, image: &EncodedImage) -> Result<RawResponse, AnalysisError> {
        // Missing credential fails before any network I/O.
        let api_key = self.api_key()?;
        let client = self.create_client(api_key)?;
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            "Sending {} image ({} bytes) to {} with model {}",
            image.mime_type(),
            image.len(),
            url,
            self.model
        );

        let response = client
            .post(&url)
            .json(&self.build_request(image))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send analysis request: {}", e);
                transport_error(e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read analysis response: {}", e);
            transport_error(e)
        })?;

        if !status.is_success() {
            error!("Analysis request failed with status {}: {}", status, body);
            let message = ErrorEnvelope::message_from(&body).unwrap_or_else(|| {
                format!("{} (status {})", REJECTED_FALLBACK_MESSAGE, status)
            });
            return Err(AnalysisError::BackendRejected(message));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            AnalysisError::BackendRejected(format!("Failed to parse API response: {}", e))
        })?;

        let choice = completion.choices.into_iter().next();
        if let Some(reason) = choice.as_ref().and_then(|c| c.finish_reason.as_deref()) {
            if reason == "length" {
                warn!("Analysis response hit the token limit; JSON may be truncated");
            }
        }

        let content = choice
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                AnalysisError::BackendRejected("No response from the analysis service".to_string())
            })?;

        debug!("Analysis response: {} chars", content.len());
        Ok(content)
    }

    /// Lightweight credential check against `GET /models`. Advisory only.
    pub async fn probe(&self) -> bool {
        let Ok(api_key) = self.api_key() else {
            return false;
        };
        let Ok(client) = self.create_client(api_key) else {
            return false;
        };

        let url = format!("{}/models", self.base_url);
        debug!("Probing credential against: {}", url);

        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("API key accepted by {}", self.base_url);
                true
            }
            Ok(response) => {
                warn!("API key rejected with status {}", response.status());
                false
            }
            Err(e) => {
                warn!("Credential probe failed: {}", e);
                false
            }
        }
    }
}

/// Stores `key` only after the service at the configured base URL accepts it.
/// A rejected or unreachable check leaves the store untouched.
pub async fn store_verified_key<S: CredentialStore + ?Sized>(
    store: &S,
    key: &str,
    settings: &AppSettings,
) -> Result<(), CredentialError> {
    let backend = RemoteScoringBackend::from_settings(Some(key.to_string()), settings);
    if !backend.probe().await {
        return Err(CredentialError::Rejected(settings.effective_base_url()));
    }
    store.set(key)
}

fn transport_error(e: reqwest::Error) -> AnalysisError {
    let detail = if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("could not connect: {}", e)
    } else {
        e.to_string()
    };
    AnalysisError::NetworkFailure(detail)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera_toolkit::ImageSource;
    use crate::keyring::MemoryCredentialStore;
    use crate::settings::get_default_settings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn image() -> EncodedImage {
        EncodedImage::new(vec![0xFF, 0xD8, 0xFF], "image/jpeg", ImageSource::Camera)
    }

    fn backend(credential: Option<&str>, base_url: &str) -> RemoteScoringBackend {
        let mut settings = get_default_settings();
        settings.base_url = base_url.to_string();
        settings.request_timeout_secs = 5;
        RemoteScoringBackend::from_settings(credential.map(str::to_string), &settings)
    }

    /// Serves exactly one canned HTTP response and hands back the raw request.
    pub(crate) async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let (base_url, server) = serve_sequence(vec![(status_line, body)]).await;
        let server = tokio::spawn(async move {
            server.await.unwrap().into_iter().next().unwrap_or_default()
        });
        (base_url, server)
    }

    /// Answers one connection per canned response, in order, and hands back
    /// the raw requests.
    pub(crate) async fn serve_sequence(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status_line, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let read = socket.read(&mut chunk).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..read]);
                    if request_complete(&request) {
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
                requests.push(String::from_utf8_lossy(&request).to_string());
            }
            requests
        });

        (base_url, server)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[tokio::test]
    async fn missing_credential_fails_before_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let result = backend(None, &base_url).analyze(&image()).await;
        assert_eq!(result, Err(AnalysisError::Unauthenticated));

        let attempted =
            tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(attempted.is_err(), "no connection should have been made");
    }

    #[tokio::test]
    async fn success_returns_message_content() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Here you go: {\"totalQuestions\":0}"},"finish_reason":"stop"}]}"#,
        )
        .await;

        let raw = backend(Some("sk-test"), &base_url)
            .analyze(&image())
            .await
            .unwrap();
        assert_eq!(raw, r#"Here you go: {"totalQuestions":0}"#);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains("\"image_url\""));
        assert!(request.contains("data:image/jpeg;base64,"));
        assert!(request.contains("\"max_tokens\":2000"));
        assert!(request.contains("\"temperature\":0.1"));
    }

    #[tokio::test]
    async fn http_error_surfaces_remote_message() {
        let (base_url, _server) = serve_once(
            "401 Unauthorized",
            r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#,
        )
        .await;

        let result = backend(Some("sk-bad"), &base_url).analyze(&image()).await;
        assert_eq!(
            result,
            Err(AnalysisError::BackendRejected(
                "Incorrect API key provided".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn http_error_without_message_uses_fallback() {
        let (base_url, _server) = serve_once("502 Bad Gateway", "upstream down").await;

        match backend(Some("sk-test"), &base_url).analyze(&image()).await {
            Err(AnalysisError::BackendRejected(message)) => {
                assert!(message.starts_with(REJECTED_FALLBACK_MESSAGE));
                assert!(message.contains("502"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let (base_url, _server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":null},"finish_reason":"stop"}]}"#,
        )
        .await;

        assert!(matches!(
            backend(Some("sk-test"), &base_url).analyze(&image()).await,
            Err(AnalysisError::BackendRejected(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        assert!(matches!(
            backend(Some("sk-test"), &base_url).analyze(&image()).await,
            Err(AnalysisError::NetworkFailure(_))
        ));
    }

    #[tokio::test]
    async fn probe_reports_acceptance() {
        let (base_url, server) = serve_once("200 OK", r#"{"data":[]}"#).await;
        assert!(backend(Some("sk-test"), &base_url).probe().await);
        assert!(server.await.unwrap().starts_with("GET /models"));

        let (base_url, _server) = serve_once("401 Unauthorized", "{}").await;
        assert!(!backend(Some("sk-test"), &base_url).probe().await);

        assert!(!backend(None, "http://127.0.0.1:9").probe().await);
    }

    #[tokio::test]
    async fn rejected_key_is_not_stored() {
        let (base_url, server) = serve_once(
            "401 Unauthorized",
            r#"{"error":{"message":"Incorrect API key provided"}}"#,
        )
        .await;
        let mut settings = get_default_settings();
        settings.base_url = base_url;
        let store = MemoryCredentialStore::new();

        let err = store_verified_key(&store, "sk-typo", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Rejected(_)));
        assert!(!store.is_present());
        assert!(server.await.unwrap().starts_with("GET /models"));
    }

    #[tokio::test]
    async fn unreachable_service_does_not_store_key() {
        let mut settings = get_default_settings();
        settings.base_url = "http://127.0.0.1:9".to_string();
        settings.request_timeout_secs = 2;
        let store = MemoryCredentialStore::with_value("sk-old");

        assert!(store_verified_key(&store, "sk-new", &settings).await.is_err());
        assert_eq!(store.get().as_deref(), Some("sk-old"));
    }

    #[tokio::test]
    async fn accepted_key_is_stored() {
        let (base_url, server) = serve_once("200 OK", r#"{"data":[]}"#).await;
        let mut settings = get_default_settings();
        settings.base_url = base_url;
        let store = MemoryCredentialStore::new();

        store_verified_key(&store, "sk-good-5678", &settings)
            .await
            .unwrap();
        assert_eq!(store.get().as_deref(), Some("sk-good-5678"));
        assert!(server
            .await
            .unwrap()
            .to_lowercase()
            .contains("authorization: bearer sk-good-5678"));
    }

    #[test]
    fn request_carries_persona_and_schema() {
        let request = backend(Some("k"), "http://localhost").build_request(&image());
        let value = serde_json::to_value(&request).unwrap();
        let system = value["messages"][0]["content"].as_str().unwrap();
        for field in [
            "totalQuestions",
            "correctAnswers",
            "incorrectAnswers",
            "grade",
            "percentage",
            "feedback",
            "questionAnalysis",
            "questionNumber",
            "isCorrect",
        ] {
            assert!(system.contains(field), "missing {}", field);
        }
        assert!(system.contains("math teacher"));
        assert_eq!(value["messages"][1]["role"], "user");
    }
}
