//! REST client for the chat endpoints
//!
//! All requests carry the bearer credential. Server failures come back as
//! `{"message": string | string[]}` and are turned into [`ChatError::Api`]
//! carrying the first reason.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::models::{
    Conversation, CreateConversationRequest, Credential, Message, SendMessageRequest,
};

/// Page of a message history request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Request/response side of the chat backend
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /chat/conversations`, newest activity first
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// `GET /chat/conversations/{id}`
    async fn get_conversation(&self, id: &str) -> Result<Conversation>;

    /// `POST /chat/conversations`
    async fn create_conversation(&self, request: &CreateConversationRequest)
        -> Result<Conversation>;

    /// `GET /chat/conversations/{id}/messages`, newest first
    async fn list_messages(&self, conversation_id: &str, page: Page) -> Result<Vec<Message>>;

    /// `POST /chat/messages`, returns the canonical stored message
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message>;

    /// `POST /chat/conversations/{id}/read`
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct ErrorBody {
    message: ErrorMessage,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorMessage {
    One(String),
    Many(Vec<String>),
}

impl ErrorMessage {
    fn into_reason(self) -> Option<String> {
        match self {
            ErrorMessage::One(message) => Some(message),
            ErrorMessage::Many(messages) => messages.into_iter().next(),
        }
    }
}

const GENERIC_REASON: &str = "Connection error";

/// Extract the human readable reason from an error response body
pub fn error_reason(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.into_reason())
        .unwrap_or_else(|| GENERIC_REASON.to_string())
}

/// [`ChatApi`] over HTTP
pub struct HttpChatApi {
    client: Client,
    base: Url,
    credential: Credential,
}

impl HttpChatApi {
    pub fn new(config: &ChatConfig, credential: Credential) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base: config.api_base()?,
            credential,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        Ok(self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, self.credential.bearer()))
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<String> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::Unauthorized(error_reason(&body)));
        }
        if !status.is_success() {
            return Err(ChatError::Api {
                status: status.as_u16(),
                message: error_reason(&body),
            });
        }
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let body = self.execute(builder).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    #[instrument(skip(self))]
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.fetch(self.request(Method::GET, "chat/conversations")?)
            .await
    }

    #[instrument(skip(self))]
    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.fetch(self.request(Method::GET, &format!("chat/conversations/{}", id))?)
            .await
    }

    #[instrument(skip(self))]
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<Conversation> {
        self.fetch(self.request(Method::POST, "chat/conversations")?.json(request))
            .await
    }

    #[instrument(skip(self))]
    async fn list_messages(&self, conversation_id: &str, page: Page) -> Result<Vec<Message>> {
        let builder = self
            .request(
                Method::GET,
                &format!("chat/conversations/{}/messages", conversation_id),
            )?
            .query(&[("limit", page.limit), ("offset", page.offset)]);
        let messages: Vec<Message> = self.fetch(builder).await?;
        debug!("Fetched {} messages for {}", messages.len(), conversation_id);
        Ok(messages)
    }

    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id))]
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        self.fetch(self.request(Method::POST, "chat/messages")?.json(request))
            .await
    }

    #[instrument(skip(self))]
    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        // Empty or 204 bodies are fine here
        self.execute(self.request(
            Method::POST,
            &format!("chat/conversations/{}/read", conversation_id),
        )?)
        .await?;
        Ok(())
    }
}
