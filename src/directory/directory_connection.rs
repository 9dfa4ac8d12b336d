use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::identity::PublicKey;
use crate::model::{MessageTarget, User, UserData, UserId};


pub const CLIENT_ID_HEADER: &str = "X-Client-ID";

/// A logical connection to one replica of the directory service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectoryConnection: Send + Sync + 'static {
    /// Looks up users by id. Ids the replica does not know are absent from the result.
    async fn query_users(&self, ids: &[UserId]) -> anyhow::Result<FxHashMap<UserId, UserData>>;

    /// Tells the directory that this node holds messages for the given targets
    async fn notify_of_pending_messages(&self, targets: &[MessageTarget]) -> anyhow::Result<()>;

    /// All message targets that some node claims to hold a pending message for
    async fn get_pending_messages(&self) -> anyhow::Result<Vec<MessageTarget>>;
}


#[derive(Serialize, Deserialize)]
struct MessageTargetDto {
    target_id: String,
    message_id: String,
}
impl From<&MessageTarget> for MessageTargetDto {
    fn from(value: &MessageTarget) -> Self {
        MessageTargetDto {
            target_id: value.target.0.clone(),
            message_id: value.id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MessageTargetsDto {
    message_targets: Vec<MessageTargetDto>,
}

#[derive(Serialize)]
struct NotifyRequest<'a> {
    message_targets: Vec<MessageTargetDto>,
    cacher_id: &'a str,
}

#[derive(Serialize)]
struct QueryUsersRequest<'a> {
    ids: &'a [UserId],
}

#[derive(Deserialize)]
struct UserDataDto {
    #[serde(alias = "username")]
    name: String,
    public_key: String,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Deserialize)]
struct StatusDto {
    status: String,
}


/// Talks to a directory replica over HTTP / JSON
pub struct HttpDirectoryConnection {
    client: reqwest::Client,
    base_url: String,
    own_id: UserId,
}

impl Debug for HttpDirectoryConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HttpDirectoryConnection{{{}}}", self.base_url)
    }
}

impl HttpDirectoryConnection {
    /// Establishes a logical connection, i.e. checks that the replica reports itself healthy
    pub async fn connect(addr: SocketAddr, own_id: UserId, request_timeout: Duration) -> anyhow::Result<HttpDirectoryConnection> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let base_url = format!("http://{}", addr);

        let response = client.get(format!("{}/status", base_url))
            .send().await
            .map_err(|e| anyhow!("directory replica {} failed health check: {}", addr, e))?;
        if !response.status().is_success() {
            bail!("directory replica {} failed health check: status {}", addr, response.status());
        }
        let status: StatusDto = response.json().await
            .map_err(|e| anyhow!("directory replica {} failed health check: {}", addr, e))?;
        if status.status != "ok" {
            bail!("directory replica {} failed health check: unexpected status {:?}", addr, status.status);
        }

        debug!(%addr, "connected to directory replica");
        Ok(HttpDirectoryConnection {
            client,
            base_url,
            own_id,
        })
    }
}

#[async_trait]
impl DirectoryConnection for HttpDirectoryConnection {
    async fn query_users(&self, ids: &[UserId]) -> anyhow::Result<FxHashMap<UserId, UserData>> {
        let response = self.client.get(format!("{}/users", self.base_url))
            .header(CLIENT_ID_HEADER, self.own_id.as_str())
            .json(&QueryUsersRequest { ids })
            .send().await?;
        if !response.status().is_success() {
            bail!("failed to query users: {}", response.status());
        }

        let raw: FxHashMap<String, UserDataDto> = response.json().await?;

        let mut result = FxHashMap::default();
        for (id, dto) in raw {
            let public_key = match BASE64.decode(dto.public_key.as_bytes()).map_err(|e| e.to_string())
                .and_then(|bytes| PublicKey::from_bytes(&bytes).map_err(|e| e.to_string()))
            {
                Ok(key) => key,
                Err(e) => {
                    warn!(user = %id, "invalid public key reported by directory - skipping: {}", e);
                    continue;
                }
            };

            let ip = dto.ip
                .filter(|ip| !ip.is_empty())
                .and_then(|ip| ip.parse::<IpAddr>().ok());

            let id = UserId::new(id);
            result.insert(id.clone(), UserData {
                user: User {
                    id,
                    name: dto.name,
                    public_key,
                },
                ip,
            });
        }
        Ok(result)
    }

    async fn notify_of_pending_messages(&self, targets: &[MessageTarget]) -> anyhow::Result<()> {
        let request = NotifyRequest {
            message_targets: targets.iter().map(MessageTargetDto::from).collect(),
            cacher_id: self.own_id.as_str(),
        };

        let response = self.client.post(format!("{}/pending-messages", self.base_url))
            .header(CLIENT_ID_HEADER, self.own_id.as_str())
            .json(&request)
            .send().await?;
        if !response.status().is_success() {
            bail!("failed to notify of pending messages: {}", response.status());
        }
        Ok(())
    }

    async fn get_pending_messages(&self) -> anyhow::Result<Vec<MessageTarget>> {
        let response = self.client.get(format!("{}/pending-messages", self.base_url))
            .header(CLIENT_ID_HEADER, self.own_id.as_str())
            .send().await?;
        if !response.status().is_success() {
            bail!("failed to get pending messages: {}", response.status());
        }

        let dto: MessageTargetsDto = response.json().await?;
        Ok(dto.message_targets.into_iter()
            .map(|t| MessageTarget::new(t.message_id, UserId::new(t.target_id)))
            .collect())
    }
}
