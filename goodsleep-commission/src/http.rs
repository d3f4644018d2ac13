//! HTTP liveness endpoint
//!
//! `GET {base}/device/{address}/status` answering
//! `{"status": <id>, "updated_at": <unix seconds>}`.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;

use crate::error::LivenessError;
use crate::identity::ResolvedAddress;
use crate::liveness::{LivenessEndpoint, LivenessReport};

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: u8,
    #[serde(default)]
    updated_at: u64,
}

pub struct HttpLivenessEndpoint {
    base_url: String,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpLivenessEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    fn status_uri(&self, address: &ResolvedAddress) -> Result<hyper::Uri, LivenessError> {
        format!("{}/device/{}/status", self.base_url, address)
            .parse()
            .map_err(|e| LivenessError::Malformed(format!("bad status url: {e}")))
    }
}

#[async_trait::async_trait]
impl LivenessEndpoint for HttpLivenessEndpoint {
    async fn query(&self, address: &ResolvedAddress) -> Result<LivenessReport, LivenessError> {
        let uri = self.status_uri(address)?;
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| LivenessError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LivenessError::Transport(format!("status service answered {status}")));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| LivenessError::Transport(e.to_string()))?
            .to_bytes();
        let parsed: StatusBody =
            serde_json::from_slice(&body).map_err(|e| LivenessError::Malformed(e.to_string()))?;

        Ok(LivenessReport {
            status_id: parsed.status,
            last_update: parsed.updated_at,
        })
    }
}
