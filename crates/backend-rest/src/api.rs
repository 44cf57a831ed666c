use std::sync::RwLock;

use async_trait::async_trait;
use backend_core::{
    AccessToken, BackendError, BackendErrorCategory, ConversationRecord, DeleteScope, Message,
    MessagePage, OutgoingMessage, PageRequest, PasswordChange, ProfileUpdate, RegistrationForm,
    UserProfile, UserSearchItem,
};
use reqwest::{Client, Method, RequestBuilder, Response, multipart};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

/// Attachment body as served by the download endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBody {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    /// Filename from `Content-Disposition`, when present.
    pub filename: Option<String>,
}

/// REST surface of the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Set or drop the bearer token used by later requests.
    fn set_access_token(&self, token: Option<String>);

    async fn login(&self, login: &str, password: &str) -> Result<AccessToken, BackendError>;
    async fn register(&self, form: &RegistrationForm) -> Result<(), BackendError>;
    async fn current_user(&self) -> Result<UserProfile, BackendError>;
    async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, BackendError>;
    async fn change_password(&self, change: &PasswordChange) -> Result<(), BackendError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, BackendError>;
    async fn start_conversation(&self, peer_id: i64) -> Result<i64, BackendError>;
    async fn hide_conversation(&self, conversation_id: i64) -> Result<(), BackendError>;
    async fn clear_conversation(&self, conversation_id: i64) -> Result<(), BackendError>;
    async fn mark_read(
        &self,
        conversation_id: i64,
        up_to_message_id: Option<i64>,
    ) -> Result<(), BackendError>;
    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchItem>, BackendError>;

    async fn message_page(&self, request: PageRequest) -> Result<MessagePage, BackendError>;
    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, BackendError>;
    async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), BackendError>;
    async fn delete_message(&self, message_id: i64, scope: DeleteScope)
    -> Result<(), BackendError>;
    async fn delete_attachment(
        &self,
        attachment_id: i64,
        scope: DeleteScope,
    ) -> Result<(), BackendError>;
    async fn download_attachment(&self, attachment_id: i64) -> Result<AttachmentBody, BackendError>;
}

/// `reqwest`-backed [`ChatApi`].
pub struct RestApi {
    client: Client,
    base: Url,
    token: RwLock<Option<String>>,
}

impl RestApi {
    pub fn new(api_base: &str) -> Result<Self, BackendError> {
        let client = Client::builder()
            .user_agent(concat!("duochat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                BackendError::new(
                    BackendErrorCategory::Internal,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;
        Ok(Self {
            client,
            base: parse_api_base(api_base)?,
            token: RwLock::new(None),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base.join(path).map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Internal,
                "invalid_endpoint",
                format!("cannot build endpoint '{path}': {err}"),
            )
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, BackendError> {
        let url = self.endpoint(path)?;
        let mut builder = self.client.request(method, url);
        let token = self
            .token
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response
            .text()
            .await
            .ok()
            .map(|body| error_detail(&body))
            .unwrap_or_default();
        warn!(status = status.as_u16(), %detail, "request rejected");
        Err(BackendError::from_status(status.as_u16(), detail))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.execute(builder).await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Serialization,
                "invalid_response",
                err.to_string(),
            )
        })
    }

    async fn execute_empty(&self, builder: RequestBuilder) -> Result<(), BackendError> {
        self.execute(builder).await.map(|_| ())
    }
}

#[async_trait]
impl ChatApi for RestApi {
    fn set_access_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    async fn login(&self, login: &str, password: &str) -> Result<AccessToken, BackendError> {
        let builder = self
            .request(Method::POST, "auth/login")?
            .json(&json!({ "login": login, "password": password }));
        self.execute_json(builder).await
    }

    async fn register(&self, form: &RegistrationForm) -> Result<(), BackendError> {
        let builder = self.request(Method::POST, "auth/register")?.json(form);
        self.execute_empty(builder).await
    }

    async fn current_user(&self) -> Result<UserProfile, BackendError> {
        self.execute_json(self.request(Method::GET, "users/me")?)
            .await
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, BackendError> {
        let builder = self.request(Method::PATCH, "users/me")?.json(update);
        self.execute_json(builder).await
    }

    async fn change_password(&self, change: &PasswordChange) -> Result<(), BackendError> {
        let builder = self
            .request(Method::POST, "users/me/change-password")?
            .json(change);
        self.execute_empty(builder).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, BackendError> {
        let raw: Vec<Value> = self
            .execute_json(self.request(Method::GET, "conversations")?)
            .await?;
        Ok(parse_conversation_records(raw))
    }

    async fn start_conversation(&self, peer_id: i64) -> Result<i64, BackendError> {
        #[derive(Deserialize)]
        struct Started {
            conversation_id: i64,
        }

        let builder = self
            .request(Method::POST, "conversations/start")?
            .json(&json!({ "peer_id": peer_id }));
        let started: Started = self.execute_json(builder).await?;
        Ok(started.conversation_id)
    }

    async fn hide_conversation(&self, conversation_id: i64) -> Result<(), BackendError> {
        let path = format!("conversations/{conversation_id}/hide");
        self.execute_empty(self.request(Method::POST, &path)?).await
    }

    async fn clear_conversation(&self, conversation_id: i64) -> Result<(), BackendError> {
        let path = format!("conversations/{conversation_id}/clear");
        let builder = self
            .request(Method::POST, &path)?
            .query(&[("scope", DeleteScope::Me.as_str())]);
        self.execute_empty(builder).await
    }

    async fn mark_read(
        &self,
        conversation_id: i64,
        up_to_message_id: Option<i64>,
    ) -> Result<(), BackendError> {
        let path = format!("conversations/{conversation_id}/read");
        let body = match up_to_message_id {
            Some(id) => json!({ "up_to_message_id": id }),
            None => json!({}),
        };
        self.execute_empty(self.request(Method::POST, &path)?.json(&body))
            .await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchItem>, BackendError> {
        let builder = self
            .request(Method::GET, "conversations/search-users")?
            .query(&[("q", query)]);
        self.execute_json(builder).await
    }

    async fn message_page(&self, request: PageRequest) -> Result<MessagePage, BackendError> {
        let mut builder = self.request(Method::GET, "messages/page")?.query(&[
            ("conversation_id", request.conversation_id.to_string()),
            ("limit", request.limit.to_string()),
        ]);
        if let Some(before_id) = request.before_id {
            builder = builder.query(&[("before_id", before_id.to_string())]);
        }
        debug!(
            conversation_id = request.conversation_id,
            limit = request.limit,
            before_id = ?request.before_id,
            "fetching message page"
        );
        self.execute_json(builder).await
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, BackendError> {
        let mut form = multipart::Form::new()
            .text("conversation_id", message.conversation_id.to_string())
            .text("content", message.content);
        for file in message.files {
            let mut part = multipart::Part::bytes(file.data).file_name(file.filename);
            if let Some(content_type) = file.content_type {
                part = part.mime_str(&content_type).map_err(|err| {
                    BackendError::validation(
                        "invalid_content_type",
                        format!("invalid content type '{content_type}': {err}"),
                    )
                })?;
            }
            form = form.part("files", part);
        }

        let builder = self.request(Method::POST, "messages/send")?.multipart(form);
        self.execute_json(builder).await
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), BackendError> {
        let path = format!("messages/{message_id}");
        let builder = self
            .request(Method::PATCH, &path)?
            .json(&json!({ "content": content }));
        self.execute_empty(builder).await
    }

    async fn delete_message(
        &self,
        message_id: i64,
        scope: DeleteScope,
    ) -> Result<(), BackendError> {
        let path = format!("messages/{message_id}");
        let builder = self
            .request(Method::DELETE, &path)?
            .query(&[("scope", scope.as_str())]);
        self.execute_empty(builder).await
    }

    async fn delete_attachment(
        &self,
        attachment_id: i64,
        scope: DeleteScope,
    ) -> Result<(), BackendError> {
        let path = format!("messages/attachments/{attachment_id}");
        let builder = self
            .request(Method::DELETE, &path)?
            .query(&[("scope", scope.as_str())]);
        self.execute_empty(builder).await
    }

    async fn download_attachment(
        &self,
        attachment_id: i64,
    ) -> Result<AttachmentBody, BackendError> {
        let path = format!("messages/attachments/{attachment_id}");
        let response = self.execute(self.request(Method::GET, &path)?).await?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let filename = header(reqwest::header::CONTENT_DISPOSITION)
            .as_deref()
            .and_then(filename_from_disposition);

        let data = response.bytes().await.map_err(map_transport_error)?.to_vec();
        Ok(AttachmentBody {
            data,
            content_type,
            filename,
        })
    }
}

/// Normalize the API base so relative joins keep its path.
pub fn parse_api_base(raw: &str) -> Result<Url, BackendError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).map_err(|err| {
        BackendError::validation("invalid_api_base", format!("invalid API base '{raw}': {err}"))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BackendError::validation(
            "invalid_api_base",
            format!("API base must use http or https, got '{other}'"),
        )),
    }
}

/// Keep only well-formed conversation records; malformed rows are skipped.
pub fn parse_conversation_records(raw: Vec<Value>) -> Vec<ConversationRecord> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<ConversationRecord>(value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, "skipping malformed conversation record");
                None
            }
        })
        .collect()
}

/// `detail` of a JSON error body, else the raw body.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body.trim().to_owned(),
        },
        _ => body.trim().to_owned(),
    }
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_owned())
        .filter(|name| !name.is_empty())
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    let code = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect_failed"
    } else if err.is_decode() {
        "invalid_response"
    } else {
        "network"
    };
    warn!(error = %err, code, "request failed");
    BackendError::new(BackendErrorCategory::Network, code, err.to_string())
}
