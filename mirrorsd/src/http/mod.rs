//! Functionality for making http requests to Discord's API.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use log::warn;
use reqwest::{Client, Method, StatusCode};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::http::rate_limit::{BucketKey, RateLimiter};
use crate::http::routes::Route;
use crate::model::{DiscordError, Gateway};
use crate::serde_utils;
use crate::serde_utils::NiceResponseJson;

mod rate_limit;
pub(crate) mod routes;

pub mod channel;
pub mod webhook;

/// An error that happened while making a request to Discord's API.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("error making request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("status code `{0}` at {1:?}")]
    Http(reqwest::StatusCode, Route),
    #[error("bad json: {0}")]
    Json(#[from] serde_utils::Error),
    #[error("Discord error: {0:?}")]
    Discord(#[from] DiscordError),
}

impl ClientError {
    /// 401 anywhere on the REST surface means the token is dead.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Http(status, _) => *status == StatusCode::UNAUTHORIZED,
            Self::Request(e) => e.status() == Some(StatusCode::UNAUTHORIZED),
            Self::Discord(_) | Self::Json(_) => false,
        }
    }

    /// The Discord JSON error code, when the response carried one.
    pub fn discord_code(&self) -> Option<u32> {
        match self {
            Self::Discord(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Result where the error type is [`ClientError`].
pub type ClientResult<T> = Result<T, ClientError>;

/// Which credential scheme a session runs under. Collectors hold user
/// tokens (sent bare); the republisher holds a bot token.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthKind {
    User,
    Bot,
}

/// Handles performing requests to Discord's api, managing the session token
/// and Discord's rate limits.
///
/// Wraps [Reqwest's Client](https://docs.rs/reqwest/*/reqwest/struct.Client.html).
#[derive(Debug)]
pub struct DiscordClient {
    token: String,
    kind: AuthKind,
    client: Client,
    rate_limit: Arc<Mutex<RateLimiter>>,
}

impl DiscordClient {
    pub fn new(token: String, kind: AuthKind) -> Self {
        let mut headers = HeaderMap::new();
        let authorization = match kind {
            AuthKind::Bot => format!("Bot {}", token),
            AuthKind::User => token.clone(),
        };
        headers.insert(AUTHORIZATION, authorization.parse().expect("Unable to parse token!"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Unable to build client!");

        Self { token, kind, client, rate_limit: Arc::default() }
    }

    pub fn bot(token: String) -> Self {
        Self::new(token, AuthKind::Bot)
    }

    pub fn user(token: String) -> Self {
        Self::new(token, AuthKind::User)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    async fn request<J, T>(&self, method: Method, route: Route, body: Option<&J>) -> ClientResult<T>
        where J: Serialize + Send + Sync,
              T: DeserializeOwned,
    {
        let key = BucketKey::from(&route);
        let async_operation = || async {
            let mut builder = self.client.request(method.clone(), route.url());
            if let Some(json) = body {
                builder = builder.json(json);
            }
            let sleep = self.rate_limit.lock().await.get_rate_limit(&key);
            if let Some(sleep) = sleep {
                sleep.await;
            }
            let response = builder.send().await.map_err(ClientError::Request)?;
            self.rate_limit.lock().await.update(key, response.headers());
            if response.status().is_client_error() || response.status().is_server_error() {
                let status = response.status();
                let err = if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    backoff::Error::Transient { err: ClientError::Http(status, route.clone()), retry_after: None }
                } else {
                    let permanent = if let Ok(error) = response.nice_json().await {
                        ClientError::Discord(error)
                    } else {
                        ClientError::Http(status, route.clone())
                    };
                    backoff::Error::Permanent(permanent)
                };
                Err(err)
            } else {
                response.nice_json().await.map_err(backoff::Error::Permanent)
            }
        };
        backoff::future::retry_notify(
            ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_secs(10)),
                ..Default::default()
            },
            async_operation,
            |e: ClientError, dur| warn!("Error in request after {:?}: {}", dur, e),
        ).await
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, route: Route) -> ClientResult<T> {
        self.request::<(), T>(Method::GET, route, None).await
    }

    pub(crate) async fn post<T, J>(&self, route: Route, json: &J) -> ClientResult<T>
        where T: DeserializeOwned,
              J: Serialize + Send + Sync,
    {
        self.request(Method::POST, route, Some(json)).await
    }

    pub(crate) async fn patch<T, J>(&self, route: Route, json: &J) -> ClientResult<T>
        where T: DeserializeOwned,
              J: Serialize + Send + Sync,
    {
        self.request(Method::PATCH, route, Some(json)).await
    }

    pub(crate) async fn put_unit<J: Serialize + Send + Sync>(&self, route: Route, json: &J) -> ClientResult<()> {
        self.request::<J, Option<()>>(Method::PUT, route, Some(json)).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, route: Route) -> ClientResult<()> {
        self.request::<(), Option<()>>(Method::DELETE, route, None).await?;
        Ok(())
    }
}

/// general functions
impl DiscordClient {
    /// Gets information about how to connect to this session's websocket.
    /// User sessions use `/gateway`, bot sessions `/gateway/bot`.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Gateway`
    pub async fn gateway(&self) -> ClientResult<Gateway> {
        match self.kind {
            AuthKind::User => self.get(Route::GetGateway).await,
            AuthKind::Bot => self.get(Route::GetGatewayBot).await,
        }
    }
}

impl AsRef<Self> for DiscordClient {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl Display for DiscordClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DiscordClient({:?})", self.kind)
    }
}
