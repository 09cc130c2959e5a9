use std::{sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dto::{
        health::HealthResponse,
        matches::{
            CreateMatchRequest, FinishRequest, GoalSubmission, MatchDetail, StreakAdjustment,
            SubstitutionRequest, TieBreakRequest,
        },
    },
    state::match_session::StatEvent,
};

#[derive(Debug, Clone, Error)]
/// Failure talking to the authoritative server.
pub enum ApiError {
    /// The request never produced a response.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The server answered with an error status.
    #[error("server answered {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// `message` of the error body, or the raw body.
        message: String,
    },
    /// The response body did not match the expected payload.
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// The server refused the write for good (authorization or closed match). Retrying is
    /// pointless.
    pub fn is_definitive_rejection(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: 401 | 403,
                ..
            }
        )
    }

    /// Worth retrying later: nothing reached the server, or it was momentarily unable to
    /// answer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::Decode(_) => false,
        }
    }

    /// HTTP status, when the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Operations the client core needs from the server.
pub trait MatchApi: Send + Sync {
    /// Create and kick off a match.
    fn create_match(
        &self,
        request: CreateMatchRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>>;

    /// Current detail of a match.
    fn fetch_match(&self, match_id: Uuid) -> BoxFuture<'static, Result<MatchDetail, ApiError>>;

    /// Authoritative event log, ordered by minute.
    fn fetch_stats(&self, match_id: Uuid) -> BoxFuture<'static, Result<Vec<StatEvent>, ApiError>>;

    /// Submit a goal; replays with the same key return the stored event.
    fn submit_goal(
        &self,
        match_id: Uuid,
        goal: GoalSubmission,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>>;

    /// Swap a fielded player with a bench player.
    fn submit_substitution(
        &self,
        match_id: Uuid,
        request: SubstitutionRequest,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>>;

    /// Overwrite the streak counters.
    fn adjust_streak(
        &self,
        match_id: Uuid,
        request: StreakAdjustment,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>>;

    /// Close the match and settle the streak counters.
    fn finish_match(
        &self,
        match_id: Uuid,
        request: FinishRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>>;

    /// Record the tie-break winner of a drawn match.
    fn submit_tie_break(
        &self,
        match_id: Uuid,
        request: TieBreakRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>>;

    /// Cheap reachability check.
    fn health(&self) -> BoxFuture<'static, Result<(), ApiError>>;
}

/// Shared trait object used by every client component.
pub type SharedMatchApi = Arc<dyn MatchApi>;

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// [`MatchApi`] over HTTP.
#[derive(Clone)]
pub struct HttpMatchApi {
    client: Client,
    base_url: String,
}

impl HttpMatchApi {
    /// Client with its own connection pool and request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get<T>(&self, path: String) -> BoxFuture<'static, Result<T, ApiError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        execute(self.client.get(self.url(&path)))
    }

    fn post<B, T>(&self, path: String, body: B) -> BoxFuture<'static, Result<T, ApiError>>
    where
        B: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        execute(self.client.post(self.url(&path)).json(&body))
    }
}

fn execute<T>(request: RequestBuilder) -> BoxFuture<'static, Result<T, ApiError>>
where
    T: DeserializeOwned + Send + 'static,
{
    async move {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
    .boxed()
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> ApiError {
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

impl MatchApi for HttpMatchApi {
    fn create_match(
        &self,
        request: CreateMatchRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        self.post("/matches".into(), request)
    }

    fn fetch_match(&self, match_id: Uuid) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        self.get(format!("/matches/{match_id}"))
    }

    fn fetch_stats(&self, match_id: Uuid) -> BoxFuture<'static, Result<Vec<StatEvent>, ApiError>> {
        self.get(format!("/matches/{match_id}/stats"))
    }

    fn submit_goal(
        &self,
        match_id: Uuid,
        goal: GoalSubmission,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>> {
        self.post(format!("/matches/{match_id}/goals"), goal)
    }

    fn submit_substitution(
        &self,
        match_id: Uuid,
        request: SubstitutionRequest,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>> {
        self.post(format!("/matches/{match_id}/substitutions"), request)
    }

    fn adjust_streak(
        &self,
        match_id: Uuid,
        request: StreakAdjustment,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        self.post(format!("/matches/{match_id}/streak"), request)
    }

    fn finish_match(
        &self,
        match_id: Uuid,
        request: FinishRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        self.post(format!("/matches/{match_id}/finish"), request)
    }

    fn submit_tie_break(
        &self,
        match_id: Uuid,
        request: TieBreakRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        self.post(format!("/matches/{match_id}/tie-break"), request)
    }

    fn health(&self) -> BoxFuture<'static, Result<(), ApiError>> {
        let fut = self.get::<HealthResponse>("/healthcheck".into());
        async move { fut.await.map(|_| ()) }.boxed()
    }
}
