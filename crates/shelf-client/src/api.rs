//! External processing API: the trait the poller drives and its HTTP/JSON
//! implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use shelf_proto::config::ApiConfig;
use shelf_proto::protocol::{
    GenerationOption, GenerationRequest, SubmitReply, Submission, TaskKind, TaskStatusReport,
};

use crate::error::{Error, ErrorResponse, Result};

/// Default timeout for requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The three backend operations the tracking core consumes.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Submit a generation; the backend answers with a result or a task id.
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<Submission>;

    /// Current state of a queued task.
    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusReport>;

    /// Options (voices) and whether an artifact already exists for them.
    async fn list_generation_options(
        &self,
        context_id: Option<i64>,
    ) -> Result<Vec<GenerationOption>>;
}

/// HTTP implementation of [`GenerationApi`].
#[derive(Clone)]
pub struct HttpApi {
    inner: Arc<HttpApiInner>,
}

struct HttpApiInner {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

/// `GET tts/voices` answers with either a bare list or `{voices: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OptionsReply {
    List(Vec<GenerationOption>),
    Wrapped { voices: Vec<GenerationOption> },
}

impl HttpApi {
    pub fn builder() -> HttpApiBuilder {
        HttpApiBuilder::new()
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .base_url(config.base_url.clone())
            .timeout(config.timeout());
        if let Some(token) = &config.auth_token {
            builder = builder.auth_token(token.clone());
        }
        builder.build()
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.inner
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidUrl(e.to_string()))
    }

    /// Route and JSON body for a submission of `request.kind`.
    fn submit_route(request: &GenerationRequest) -> (&'static str, serde_json::Value) {
        match request.kind {
            TaskKind::SpeechSynthesis => (
                "tts/speak",
                json!({
                    "text": request.text,
                    "voiceName": request.option,
                    "chapterId": request.context_id,
                }),
            ),
            TaskKind::Translation => (
                "translation",
                json!({
                    "text": request.text,
                    "chapterId": request.context_id,
                    "targetLanguage": request.option,
                }),
            ),
            TaskKind::Summary => (
                "summary",
                json!({
                    "text": request.text,
                    "chapterId": request.context_id,
                }),
            ),
            TaskKind::ImageGeneration => (
                "comic/generate",
                json!({ "chapterId": request.context_id }),
            ),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            let bytes = response.bytes().await?;
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    async fn extract_error(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();

        match response.json::<ErrorResponse>().await {
            Ok(err) => {
                if status == 404 {
                    Error::NotFound(err.into_message())
                } else {
                    Error::Api {
                        status,
                        message: err.into_message(),
                    }
                }
            }
            Err(_) => Error::Api {
                status,
                message: format!("HTTP {}", status),
            },
        }
    }
}

#[async_trait]
impl GenerationApi for HttpApi {
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<Submission> {
        if request.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let (route, body) = Self::submit_route(request);
        let url = self.url(route)?;
        debug!("POST {} ({:?})", url, request.kind);
        let response = self
            .inner
            .http
            .post(url)
            .json(&body)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        let reply: SubmitReply = self.handle_response(response).await?;
        Ok(reply.into_submission())
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusReport> {
        let url = self.url(&format!("tasks/{}", task_id))?;
        let response = self
            .inner
            .http
            .get(url)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn list_generation_options(
        &self,
        context_id: Option<i64>,
    ) -> Result<Vec<GenerationOption>> {
        let url = self.url("tts/voices")?;
        let mut req = self.inner.http.get(url).timeout(self.inner.timeout);
        if let Some(id) = context_id {
            req = req.query(&[("chapterId", id)]);
        }
        let response = req.send().await?;
        let reply: OptionsReply = self.handle_response(response).await?;
        Ok(match reply {
            OptionsReply::List(options) => options,
            OptionsReply::Wrapped { voices } => voices,
        })
    }
}

/// Builder for [`HttpApi`].
#[derive(Debug)]
pub struct HttpApiBuilder {
    base_url: Option<String>,
    auth_token: Option<String>,
    timeout: Duration,
    user_agent: Option<String>,
}

impl HttpApiBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn build(self) -> Result<HttpApi> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::Config("base_url is required".to_string()))?;

        // Url::join drops the last path segment unless it ends with '/'
        let mut base_url = Url::parse(&base_url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| Error::Config("Invalid auth token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("shelf-client/{}", env!("CARGO_PKG_VERSION")));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .build()?;

        Ok(HttpApi {
            inner: Arc::new(HttpApiInner {
                http,
                base_url,
                timeout: self.timeout,
            }),
        })
    }
}

impl Default for HttpApiBuilder {
    fn default() -> Self {
        Self::new()
    }
}
