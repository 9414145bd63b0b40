use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use castline_types::api::{
    ApprovedMatchesResponse, FetchMessagesResponse, SendMessageRequest, SendMessageResponse,
};
use castline_types::{ChatSummary, ConversationId, MessageKind, WireMessage};

use crate::error::{ChatError, Result};

/// A conversation log as returned by the backend, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedLog {
    pub title: Option<String>,
    pub messages: Vec<WireMessage>,
}

/// Request/response boundary to the chat backend.
///
/// Implementations never retry: a failed fetch is retried by the next poll
/// tick, a failed send goes back to the caller.
pub trait ChatTransport: Send + Sync + 'static {
    fn fetch_log(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<FetchedLog>> + Send;

    /// Returns the server-assigned message id.
    fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    fn list_conversations(&self) -> impl Future<Output = Result<Vec<ChatSummary>>> + Send;
}

/// [`ChatTransport`] over the backend's JSON REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    credential: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, credential: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ChatError::Transport(format!("invalid base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Transport(format!("base URL '{}' cannot carry a path", base_url)));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            credential: credential.filter(|c| !c.is_empty()),
        })
    }

    /// Picks `primary` if it answers `GET /ping`, otherwise `fallback` when
    /// one is configured.
    pub async fn connect(
        primary: &str,
        fallback: Option<&str>,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let transport = Self::new(primary, credential.clone(), timeout)?;
        let Some(fallback) = fallback else {
            return Ok(transport);
        };

        match transport.ping().await {
            Ok(()) => Ok(transport),
            Err(e) => {
                warn!("Backend {} not available ({}), using mock API at {}", primary, e, fallback);
                Self::new(fallback, credential, timeout)
            }
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub async fn ping(&self) -> Result<()> {
        let res = self.client.get(self.endpoint(&["ping"])?).send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(ChatError::Transport(format!("ping returned HTTP {}", res.status())))
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Transport(format!("base URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn messages_endpoint(&self, conversation: &ConversationId) -> Result<Url> {
        self.endpoint(&["conversations", conversation.as_str(), "messages"])
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl ChatTransport for HttpTransport {
    async fn fetch_log(&self, conversation: &ConversationId) -> Result<FetchedLog> {
        let url = self.messages_endpoint(conversation)?;
        let res = self.authorized(self.client.get(url)).send().await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ChatError::Transport(format!("fetch returned HTTP {}", status)));
        }

        let body: FetchMessagesResponse = read_json(res).await?;
        match body.messages {
            Some(messages) if body.success => {
                debug!("Fetched {} messages for {}", messages.len(), conversation);
                Ok(FetchedLog {
                    title: body.title,
                    messages,
                })
            }
            _ => Err(ChatError::MalformedResponse(
                "expected success=true with a messages array".into(),
            )),
        }
    }

    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<String> {
        let url = self.messages_endpoint(conversation)?;
        let req = SendMessageRequest {
            text: text.to_string(),
            kind: MessageKind::Text,
        };
        let res = self.authorized(self.client.post(url)).json(&req).send().await?;

        let status = res.status();
        if !is_json(&res) {
            let body = res.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!("Send to {} got non-JSON response ({}): {}", conversation, status, snippet);
            return Err(if status.is_success() {
                ChatError::MalformedResponse("send response is not JSON".into())
            } else {
                ChatError::Transport(format!("send returned HTTP {}", status))
            });
        }

        let body: SendMessageResponse = res.json().await?;
        if !body.ok || !status.is_success() {
            return Err(ChatError::SendRejected(format!("HTTP {}", status)));
        }

        match body.message_id {
            Some(id) if !id.is_empty() => {
                info!("Message {} accepted in {}", id, conversation);
                Ok(id)
            }
            _ => Err(ChatError::MalformedResponse("send response has no messageId".into())),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<ChatSummary>> {
        let url = self.endpoint(&["agency", "approved-matches"])?;
        let res = self.authorized(self.client.get(url)).send().await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ChatError::Transport(format!("approved-matches returned HTTP {}", status)));
        }

        let body: ApprovedMatchesResponse = read_json(res).await?;
        if !body.success {
            return Err(ChatError::MalformedResponse("approved-matches reported success=false".into()));
        }
        Ok(body.campaigns.into_iter().map(ChatSummary::from).collect())
    }
}

fn is_json(res: &Response) -> bool {
    res.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"))
}

async fn read_json<T: DeserializeOwned>(res: Response) -> Result<T> {
    if !is_json(&res) {
        return Err(ChatError::MalformedResponse("response is not JSON".into()));
    }
    let bytes = res.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
