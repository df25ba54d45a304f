//! Daemon liveness probes over HTTP, gRPC-Web and gRPC.

use std::time::Duration;

use prost::Message;

use crate::daemon::{DaemonClient, HealthCheckRequest, HealthCheckResponse, ServingStatus, HEALTH_CHECK};
use crate::rpc::transport_security;
use crate::{Result, SdkError};

const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";
const TRAILER_FLAG: u8 = 0x80;
const FRAME_HEADER_LEN: usize = 5;

/// `flags ∥ u32 BE length ∥ body` with no flags set.
pub fn grpc_web_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.push(0);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// First data frame of a gRPC-Web response body. Trailer frames are skipped.
pub fn first_data_frame(mut bytes: &[u8]) -> Result<Option<&[u8]>> {
    while !bytes.is_empty() {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(SdkError::Transport("truncated gRPC-Web frame header".to_string()));
        }
        let flags = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let rest = &bytes[FRAME_HEADER_LEN..];
        if rest.len() < len {
            return Err(SdkError::Transport(format!(
                "gRPC-Web frame declares {len} bytes, {} available",
                rest.len()
            )));
        }
        let (body, tail) = rest.split_at(len);
        if flags & TRAILER_FLAG == 0 {
            return Ok(Some(body));
        }
        bytes = tail;
    }
    Ok(None)
}

/// Health probes against one daemon endpoint.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    daemon: Option<DaemonClient>,
}

impl HealthProbe {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let (_, base_url) = transport_security(endpoint);
        Self {
            http: reqwest::Client::new(),
            base_url,
            timeout,
            daemon: None,
        }
    }

    /// Use an existing daemon connection for [`HealthProbe::grpc`].
    pub fn with_daemon(mut self, daemon: DaemonClient) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// `GET {endpoint}/heartbeat`; the daemon's JSON heartbeat document.
    pub async fn http(&self) -> Result<serde_json::Value> {
        let url = format!("{}/heartbeat", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SdkError::Transport(format!("heartbeat request failed: {e}")))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(SdkError::Transport(format!(
                "heartbeat returned HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| SdkError::Marshal(format!("invalid heartbeat body: {e}")))
    }

    /// `grpc.health.v1.Health/Check` over gRPC-Web.
    pub async fn grpc_web(&self) -> Result<ServingStatus> {
        let url = format!("{}{}", self.base_url, HEALTH_CHECK);
        let body = grpc_web_frame(&HealthCheckRequest::default().encode_to_vec());
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .header("X-Grpc-Web", "1")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| SdkError::Transport(format!("gRPC-Web health check failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(SdkError::Transport(format!(
                "gRPC-Web health check returned HTTP {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SdkError::Transport(format!("reading health response failed: {e}")))?;
        let frame = first_data_frame(&bytes)?
            .ok_or_else(|| SdkError::Transport("health response has no data frame".to_string()))?;
        let reply = HealthCheckResponse::decode(frame)
            .map_err(|e| SdkError::Marshal(format!("invalid health response: {e}")))?;
        Ok(ServingStatus::try_from(reply.status).unwrap_or(ServingStatus::Unknown))
    }

    /// `grpc.health.v1.Health/Check` over the daemon's gRPC transport.
    pub async fn grpc(&self) -> Result<ServingStatus> {
        let daemon = self
            .daemon
            .as_ref()
            .ok_or_else(|| SdkError::Transport("no gRPC connection for health check".to_string()))?;
        daemon.health("").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = grpc_web_frame(b"abc");
        assert_eq!(frame, vec![0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_trailer_frames_are_skipped() {
        let mut bytes = vec![TRAILER_FLAG, 0, 0, 0, 2, b'x', b'y'];
        bytes.extend(grpc_web_frame(&[0x08, 0x01]));
        let data = first_data_frame(&bytes).unwrap().unwrap();
        let reply = HealthCheckResponse::decode(data).unwrap();
        assert_eq!(reply.status, ServingStatus::Serving as i32);
    }

    #[test]
    fn test_only_trailers() {
        let bytes = vec![TRAILER_FLAG, 0, 0, 0, 0];
        assert!(first_data_frame(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame() {
        assert!(first_data_frame(&[0, 0, 0, 0, 9, 1]).is_err());
        assert!(first_data_frame(&[0, 0]).is_err());
    }

    #[test]
    fn test_base_url_from_bare_host() {
        let probe = HealthProbe::new("daemon.example:7000", Duration::from_secs(1));
        assert_eq!(probe.base_url, "http://daemon.example:7000");
    }
}
