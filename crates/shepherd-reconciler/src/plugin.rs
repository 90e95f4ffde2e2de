//! Unix-socket storage plugin protocol: `POST /VolumeDriver.<Action>` with a
//! JSON `{"Name": ...}` payload against `<sock-dir>/<driver>.sock`.
//!
//! 2xx is success, 4xx means the driver does not support the action and is
//! ignored, anything else (including an unreachable socket) is fatal.

use std::fmt;
use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tracing::info;

use shepherd_common::Volume;

use crate::ReconcileError;

/// Drivers served by a local plugin socket rather than the engine volume API.
pub const NATIVE_DRIVERS: &[&str] =
    &["shepherd-ebs", "shepherd-efs", "shepherd-nfs", "shepherd-longhorn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    Create,
    Attach,
    Remove,
}

impl fmt::Display for PluginAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginAction::Create => "Create",
            PluginAction::Attach => "Attach",
            PluginAction::Remove => "Remove",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOutcome {
    Done,
    /// The driver answered 4xx: the action is unsupported and ignored.
    Unsupported,
}

#[derive(Serialize)]
struct PluginRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Deserialize, Default)]
struct PluginResponse {
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Clone)]
pub struct PluginClient {
    sock_dir: PathBuf,
}

impl PluginClient {
    pub fn new(sock_dir: PathBuf) -> Self {
        Self { sock_dir }
    }

    pub fn socket_path(&self, driver: &str) -> PathBuf {
        self.sock_dir.join(format!("{driver}.sock"))
    }

    /// A driver is plugin-served when it is one of ours and its socket file
    /// is present.
    pub fn serves(&self, volume: &Volume) -> bool {
        NATIVE_DRIVERS.contains(&volume.driver.as_str())
            && self.socket_path(&volume.driver).exists()
    }

    pub async fn call(
        &self,
        volume: &Volume,
        action: PluginAction,
    ) -> Result<PluginOutcome, ReconcileError> {
        let driver = volume.driver.as_str();
        let path = self.socket_path(driver);
        let (status, body) = self
            .post(&path, action, &volume.name)
            .await
            .map_err(|err| {
                ReconcileError::Plugin(format!(
                    "/VolumeDriver.{action} '{}' (driver '{driver}'): {err}",
                    volume.name
                ))
            })?;

        let parsed: PluginResponse = serde_json::from_slice(&body).unwrap_or_default();
        if !parsed.err.is_empty() {
            return Err(ReconcileError::Plugin(format!(
                "failed to {action} volume {} (driver {driver}, status {status}): {}",
                volume.name, parsed.err
            )));
        }
        if status.is_success() {
            info!(%action, volume = %volume.name, driver, "storage plugin call succeeded");
            return Ok(PluginOutcome::Done);
        }
        if status.is_client_error() {
            info!(%action, volume = %volume.name, driver, "action not supported by driver");
            return Ok(PluginOutcome::Unsupported);
        }
        Err(ReconcileError::Plugin(format!(
            "failed to {action} volume {} (driver {driver}): status {status}",
            volume.name
        )))
    }

    async fn post(
        &self,
        path: &Path,
        action: PluginAction,
        name: &str,
    ) -> Result<(hyper::StatusCode, bytes::Bytes), Box<dyn std::error::Error + Send + Sync>> {
        let stream = UnixStream::connect(path).await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let payload = serde_json::to_vec(&PluginRequest { name })?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/VolumeDriver.{action}"))
            .header(header::HOST, "volume-plugin")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(bytes::Bytes::from(payload)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn volume(driver: &str, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            driver: driver.to_string(),
            ..Default::default()
        }
    }

    /// One-shot plugin server speaking just enough HTTP/1.1.
    async fn serve_once(listener: UnixListener, status_line: &'static str, body: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    async fn run_call(
        status_line: &'static str,
        body: &'static str,
    ) -> Result<PluginOutcome, ReconcileError> {
        let dir = tempfile::tempdir().unwrap();
        let client = PluginClient::new(dir.path().to_path_buf());
        let vol = volume("shepherd-nfs", "vol-1");
        let listener = UnixListener::bind(client.socket_path(&vol.driver)).unwrap();
        let server = tokio::spawn(serve_once(listener, status_line, body));
        let result = client.call(&vol, PluginAction::Create).await;
        server.await.unwrap();
        result
    }

    #[tokio::test]
    async fn success_response_is_done() {
        let outcome = run_call("200 OK", "{}").await.unwrap();
        assert_eq!(outcome, PluginOutcome::Done);
    }

    #[tokio::test]
    async fn client_error_means_unsupported() {
        let outcome = run_call("400 Bad Request", "{}").await.unwrap();
        assert_eq!(outcome, PluginOutcome::Unsupported);
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let result = run_call("500 Internal Server Error", "{}").await;
        assert!(matches!(result, Err(ReconcileError::Plugin(_))));
    }

    #[tokio::test]
    async fn driver_reported_error_is_fatal_even_on_200() {
        let result = run_call("200 OK", r#"{"Err": "no such pool"}"#).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("no such pool"));
    }

    #[tokio::test]
    async fn unreachable_socket_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = PluginClient::new(dir.path().to_path_buf());
        let result = client
            .call(&volume("shepherd-nfs", "vol-1"), PluginAction::Create)
            .await;
        assert!(matches!(result, Err(ReconcileError::Plugin(_))));
    }

    #[test]
    fn serves_requires_known_driver_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = PluginClient::new(dir.path().to_path_buf());
        let vol = volume("shepherd-nfs", "vol-1");
        assert!(!client.serves(&vol));
        std::fs::write(client.socket_path(&vol.driver), b"").unwrap();
        assert!(client.serves(&vol));
        assert!(!client.serves(&volume("local", "vol-2")));
    }
}
