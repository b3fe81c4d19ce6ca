use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        CouncilMember, MemberVote, Politician, Poll, PollDetail, RegisterTownRequest, Season, Town,
    },
    error::ApiErrorBody,
    protocol::{DataSourceSummary, LastRunSummary, StatusSnapshot, SyncLog, TriggerResponse},
};
use tracing::debug;
use url::Url;

use crate::{error::ClientError, sse::decode_event_stream, EventStream, SyncBackend};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the council backend rooted at one API base URL.
///
/// One-shot calls carry a per-request timeout. The event stream request does
/// not, since it is expected to stay open indefinitely.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| ClientError::transport(base_url, source))?;
        Ok(Self {
            http,
            base_url: parse_base_url(base_url)?,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn fetch_towns(&self) -> Result<Vec<Town>, ClientError> {
        self.get_json(&["cities"]).await
    }

    pub async fn register_town(&self, reference: &str, name: &str) -> Result<Town, ClientError> {
        let url = self.endpoint(&["cities"])?;
        let request = self.http.post(url.clone()).json(&RegisterTownRequest {
            reference: reference.to_string(),
            name: name.to_string(),
        });
        self.send_json(request, &url).await
    }

    pub async fn fetch_seasons(
        &self,
        city: &str,
        institution: &str,
    ) -> Result<Vec<Season>, ClientError> {
        self.get_json(&[city, institution, "seasons"]).await
    }

    pub async fn fetch_polls(
        &self,
        city: &str,
        institution: &str,
        season: &str,
    ) -> Result<Vec<Poll>, ClientError> {
        self.get_json(&[city, institution, season, "polls"]).await
    }

    pub async fn fetch_poll(&self, reference: &str) -> Result<PollDetail, ClientError> {
        self.get_json(&["polls", reference]).await
    }

    pub async fn fetch_members(
        &self,
        city: &str,
        institution: &str,
        season: &str,
    ) -> Result<Vec<CouncilMember>, ClientError> {
        self.get_json(&[city, institution, season, "members"]).await
    }

    pub async fn fetch_member(&self, reference: &str) -> Result<CouncilMember, ClientError> {
        self.get_json(&["members", reference]).await
    }

    pub async fn fetch_member_votes(&self, reference: &str) -> Result<Vec<MemberVote>, ClientError> {
        self.get_json(&["members", reference, "votes"]).await
    }

    pub async fn fetch_party_switchers(&self, city: &str) -> Result<Vec<Politician>, ClientError> {
        self.get_json(&["politicians", city, "party-switchers"]).await
    }

    pub async fn fetch_club_switchers(&self, city: &str) -> Result<Vec<Politician>, ClientError> {
        self.get_json(&["politicians", city, "club-switchers"]).await
    }

    pub async fn fetch_sync_logs(&self, town: Option<&str>) -> Result<Vec<SyncLog>, ClientError> {
        let mut url = self.endpoint(&["sync", "logs"])?;
        if let Some(town) = town {
            url.query_pairs_mut().append_pair("town", town);
        }
        let request = self.http.get(url.clone());
        self.send_json(request, &url).await
    }

    pub async fn fetch_data_sources(&self) -> Result<DataSourceSummary, ClientError> {
        self.get_json(&["sync", "data-sources"]).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                reason: "cannot be a base".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ClientError> {
        let url = self.endpoint(segments)?;
        let request = self.http.get(url.clone());
        self.send_json(request, &url).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &Url,
    ) -> Result<T, ClientError> {
        debug!(%url, "api request");
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| ClientError::transport(url.as_str(), source))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ClientError::transport(url.as_str(), source))?;

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
                message: error_message(&body),
            });
        }
        serde_json::from_str(&body).map_err(|source| ClientError::Decode {
            context: format!("response from {url}"),
            source,
        })
    }
}

#[async_trait]
impl SyncBackend for ApiClient {
    async fn fetch_status(&self) -> Result<StatusSnapshot, ClientError> {
        let snapshot: StatusSnapshot = self.get_json(&["sync", "status"]).await?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    async fn fetch_last_run(&self) -> Result<LastRunSummary, ClientError> {
        self.get_json(&["sync", "last-run"]).await
    }

    async fn trigger_sync(&self, town: Option<&str>) -> Result<TriggerResponse, ClientError> {
        let url = match town {
            Some(town) => self.endpoint(&["sync", "trigger", town])?,
            None => self.endpoint(&["sync", "trigger"])?,
        };
        let response = self
            .http
            .post(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| ClientError::transport(url.as_str(), source))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ClientError::transport(url.as_str(), source))?;

        if !status.is_success() {
            let message = serde_json::from_str::<TriggerResponse>(&body)
                .ok()
                .map(|rejection| rejection.message)
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| error_message(&body));
            return Err(ClientError::TriggerRejected { status, message });
        }
        serde_json::from_str(&body).map_err(|source| ClientError::Decode {
            context: format!("trigger response from {url}"),
            source,
        })
    }

    async fn open_event_stream(&self) -> Result<EventStream, ClientError> {
        let url = self.endpoint(&["sync", "events"])?;
        let response = self
            .http
            .get(url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| ClientError::transport(url.as_str(), source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
                message: error_message(&body),
            });
        }
        Ok(decode_event_stream(response.bytes_stream(), url.to_string()))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https".into()));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("cannot be a base".into()));
    }
    Ok(url)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.describe().map(str::to_owned))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no response body".to_owned()
            } else {
                trimmed.to_owned()
            }
        })
}
