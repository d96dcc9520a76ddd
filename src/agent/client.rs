use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::time::Duration;

use super::error::{AgentError, AgentResult};
use crate::protocol::{
    AuthRequest, AuthResponse, CommandAck, ErrorBody, HeartbeatReport, PendingCommand,
    ResolvedPlaylist,
};

/// Chunks of an artifact body as they arrive.
pub type ByteStream = BoxStream<'static, AgentResult<Vec<u8>>>;

/// A device token and who it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub device_id: String,
    pub organization_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn from_auth(auth: AuthResponse, now: DateTime<Utc>) -> Self {
        Session {
            expires_at: now + ChronoDuration::seconds(auth.expires_in),
            access_token: auth.access_token,
            device_id: auth.device_id,
            organization_id: auth.organization_id,
        }
    }

    /// Treat tokens within a minute of expiry as already gone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(60) >= self.expires_at
    }
}

/// Everything the agent asks of the fleet server. The HTTP implementation is
/// below; tests drive the agent with an in-process one.
pub trait DeviceApi: Send + Sync + 'static {
    fn authenticate(
        &self,
        hardware_id: &str,
        device_secret: &str,
    ) -> impl Future<Output = AgentResult<AuthResponse>> + Send;

    fn heartbeat(
        &self,
        session: &Session,
        report: &HeartbeatReport,
    ) -> impl Future<Output = AgentResult<()>> + Send;

    /// `None` when nothing is scheduled right now.
    fn playlist(
        &self,
        session: &Session,
    ) -> impl Future<Output = AgentResult<Option<ResolvedPlaylist>>> + Send;

    fn poll_commands(
        &self,
        session: &Session,
    ) -> impl Future<Output = AgentResult<Vec<PendingCommand>>> + Send;

    fn ack_command(
        &self,
        session: &Session,
        command_id: &str,
        ack: &CommandAck,
    ) -> impl Future<Output = AgentResult<()>> + Send;

    /// Artifact URLs point at object storage; no device token is attached.
    fn fetch_artifact(&self, url: &str) -> impl Future<Output = AgentResult<ByteStream>> + Send;
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpDeviceApi {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpDeviceApi {
    pub fn new(base_url: &str, timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("holohub-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpDeviceApi {
            base_url: format!("{}/api/v1", base_url.trim_end_matches('/')),
            client,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder, session: &Session) -> RequestBuilder {
        req.bearer_auth(&session.access_token).timeout(self.timeout)
    }
}

impl DeviceApi for HttpDeviceApi {
    async fn authenticate(&self, hardware_id: &str, device_secret: &str) -> AgentResult<AuthResponse> {
        let body = AuthRequest {
            hardware_id: hardware_id.to_string(),
            device_secret: device_secret.to_string(),
        };
        let resp = self
            .client
            .post(self.url("/devices/auth"))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn heartbeat(&self, session: &Session, report: &HeartbeatReport) -> AgentResult<()> {
        let path = format!("/devices/{}/heartbeat", session.device_id);
        let req = self.client.post(self.url(&path)).json(report);
        check(self.authed(req, session).send().await?).await?;
        Ok(())
    }

    async fn playlist(&self, session: &Session) -> AgentResult<Option<ResolvedPlaylist>> {
        let path = format!("/devices/{}/playlists", session.device_id);
        let req = self.client.get(self.url(&path));
        let resp = check(self.authed(req, session).send().await?).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }

    async fn poll_commands(&self, session: &Session) -> AgentResult<Vec<PendingCommand>> {
        let path = format!("/devices/{}/commands", session.device_id);
        let req = self.client.get(self.url(&path));
        Ok(check(self.authed(req, session).send().await?).await?.json().await?)
    }

    async fn ack_command(&self, session: &Session, command_id: &str, ack: &CommandAck) -> AgentResult<()> {
        let path = format!("/devices/{}/commands/{}/ack", session.device_id, command_id);
        let req = self.client.post(self.url(&path)).json(ack);
        check(self.authed(req, session).send().await?).await?;
        Ok(())
    }

    async fn fetch_artifact(&self, url: &str) -> AgentResult<ByteStream> {
        // No overall timeout: large quilts take a while. Stalls are caught by
        // the per-chunk read timeout below.
        let resp = check(self.client.get(url).send().await?).await?;
        let read_timeout = self.timeout;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(AgentError::from));
        Ok(Box::pin(with_read_timeout(Box::pin(stream), read_timeout)))
    }
}

fn with_read_timeout<S>(stream: S, limit: Duration) -> impl futures::Stream<Item = AgentResult<Vec<u8>>> + Send
where
    S: futures::Stream<Item = AgentResult<Vec<u8>>> + Send + Unpin + 'static,
{
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((
                Err(AgentError::Transient("artifact download stalled".into())),
                None,
            )),
        }
    })
}

async fn check(resp: Response) -> AgentResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.json::<ErrorBody>().await.ok();
    Err(classify(status, body))
}

/// Maps a failed response onto the error the state machine acts on.
pub fn classify(status: StatusCode, body: Option<ErrorBody>) -> AgentError {
    let code = body.as_ref().map(|b| b.code.as_str()).unwrap_or("");
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED if code == "invalid_credentials" => AgentError::InvalidCredentials,
        StatusCode::UNAUTHORIZED => AgentError::Unauthenticated,
        StatusCode::FORBIDDEN if code == "device_decommissioned" => AgentError::DeviceDecommissioned,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => AgentError::Transient(message),
        s if s.is_server_error() => AgentError::Transient(message),
        _ => AgentError::Protocol(format!("{status}: {message}")),
    }
}
