//! ICE server configuration: short-lived credentials from an HTTP endpoint,
//! falling back to public STUN servers.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::IceConfig;
use crate::error::Result;

pub const FALLBACK_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct IceServerEntry {
    urls: Urls,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsResponse {
    ice_servers: Vec<IceServerEntry>,
}

pub fn fallback_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: FALLBACK_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }]
}

impl CredentialsResponse {
    fn into_ice_servers(self) -> Vec<RTCIceServer> {
        self.ice_servers
            .into_iter()
            .map(|entry| RTCIceServer {
                urls: match entry.urls {
                    Urls::One(url) => vec![url],
                    Urls::Many(urls) => urls,
                },
                username: entry.username.unwrap_or_default(),
                credential: entry.credential.unwrap_or_default(),
                ..Default::default()
            })
            .filter(|server| !server.urls.is_empty())
            .collect()
    }
}

pub fn parse_credentials(body: &str) -> Result<Vec<RTCIceServer>> {
    let response: CredentialsResponse = serde_json::from_str(body)?;
    Ok(response.into_ice_servers())
}

async fn fetch_credentials(url: &str, timeout: Duration) -> Result<Vec<RTCIceServer>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response: CredentialsResponse = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.into_ice_servers())
}

/// Never fails: any problem with the credentials endpoint is logged and the
/// public STUN list is used instead.
pub async fn resolve_ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let Some(url) = config.credentials_url.as_deref() else {
        return fallback_ice_servers();
    };
    match fetch_credentials(url, Duration::from_millis(config.fetch_timeout_ms)).await {
        Ok(servers) if !servers.is_empty() => {
            info!(count = servers.len(), "fetched ICE credentials");
            servers
        }
        Ok(_) => {
            warn!(url, "credentials endpoint returned no ICE servers, using public STUN");
            fallback_ice_servers()
        }
        Err(e) => {
            warn!(url, "failed to fetch ICE credentials, using public STUN: {}", e);
            fallback_ice_servers()
        }
    }
}
