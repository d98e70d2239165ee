//! HTTP client for the container runtime inside the VM.
//!
//! Process output and exit status arrive on one long-lived response as
//! newline-delimited JSON payloads:
//!
//! ```text
//! {"process_id":"42"}
//! {"process_id":"42","source":1,"data":"Deploying...\n"}
//! {"process_id":"42","exit_status":0}
//! ```

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::deploy::runtime::{
    Container, ContainerRuntime, ContainerSpec, Process, ProcessIo, ProcessSpec, RuntimeError,
};

/// `source` of a stderr payload; anything else is stdout.
const STDERR: u8 = 2;

/// Reported when the process stream ends without an exit status.
pub const CONNECTION_LOST: &str = "connection to garden lost";

#[derive(Clone)]
pub struct GardenClient {
    client: Client,
    base: Url,
}

impl GardenClient {
    /// `address` is `host:port` of the runtime's HTTP listener.
    pub fn new(address: &str) -> anyhow::Result<Self> {
        let base = Url::parse(&format!("http://{address}/"))?;
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url, RuntimeError> {
        self.base
            .join(path)
            .map_err(|e| RuntimeError::Other(format!("invalid runtime path {path}: {e}")))
    }
}

/// Turn a non-2xx response into `RuntimeError::Status`.
async fn check(resp: Response) -> Result<Response, RuntimeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default().trim().to_string();
    Err(RuntimeError::Status {
        status: status.as_u16(),
        message,
    })
}

#[derive(Deserialize)]
struct Created {
    handle: String,
}

#[async_trait]
impl ContainerRuntime for GardenClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let resp = self
            .client
            .get(self.url("ping")?)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<Box<dyn Container>, RuntimeError> {
        let resp = self.client.post(self.url("containers")?).json(&spec).send().await?;
        let created: Created = check(resp).await?.json().await?;
        debug!(handle = %created.handle, "container created");
        Ok(Box::new(GardenContainer {
            garden: self.clone(),
            handle: created.handle,
        }))
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        let resp = self
            .client
            .delete(self.url(&format!("containers/{handle}"))?)
            .send()
            .await?;
        check(resp).await?;
        debug!(handle, "container destroyed");
        Ok(())
    }
}

struct GardenContainer {
    garden: GardenClient,
    handle: String,
}

#[async_trait]
impl Container for GardenContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, RuntimeError> {
        let url = self.garden.url(&format!("containers/{}/processes", self.handle))?;
        let resp = self.garden.client.post(url).json(&spec).send().await?;
        Ok(Box::new(GardenProcess {
            stream: PayloadStream::new(check(resp).await?),
            io,
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProcessPayload {
    #[serde(default)]
    process_id: Option<String>,
    #[serde(default)]
    source: Option<u8>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    exit_status: Option<i32>,
    #[serde(default)]
    error: Option<String>,
}

/// Splits a chunked response body into lines.
struct PayloadStream {
    resp: Response,
    pending: Vec<u8>,
    eof: bool,
}

impl PayloadStream {
    fn new(resp: Response) -> Self {
        Self {
            resp,
            pending: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, RuntimeError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(line));
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            match self.resp.chunk().await? {
                Some(bytes) => self.pending.extend_from_slice(&bytes),
                None => self.eof = true,
            }
        }
    }
}

struct GardenProcess {
    stream: PayloadStream,
    io: ProcessIo,
}

/// Apply one payload to `io`; `Some` once the process has finished.
fn apply(io: &mut ProcessIo, payload: ProcessPayload) -> Option<Result<i32, RuntimeError>> {
    if let Some(id) = &payload.process_id {
        debug!(process_id = %id, "process payload");
    }
    if let Some(data) = &payload.data {
        let sink: &mut dyn Write = if payload.source == Some(STDERR) {
            &mut *io.stderr
        } else {
            &mut *io.stdout
        };
        if let Err(e) = sink.write_all(data.as_bytes()) {
            return Some(Err(e.into()));
        }
    }
    if let Some(error) = payload.error {
        return Some(Err(RuntimeError::Other(error)));
    }
    payload.exit_status.map(Ok)
}

#[async_trait]
impl Process for GardenProcess {
    async fn wait(&mut self) -> Result<i32, RuntimeError> {
        while let Some(line) = self.stream.next_line().await? {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let payload: ProcessPayload = serde_json::from_str(text)?;
            if let Some(done) = apply(&mut self.io, payload) {
                let _ = self.io.stdout.flush();
                let _ = self.io.stderr.flush();
                return done;
            }
        }
        Err(RuntimeError::Other(CONNECTION_LOST.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::runtime::SharedBuffer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn io(stdout: &SharedBuffer, stderr: &SharedBuffer) -> ProcessIo {
        ProcessIo {
            stdout: Box::new(stdout.clone()),
            stderr: Box::new(stderr.clone()),
        }
    }

    fn feed(io: &mut ProcessIo, line: &str) -> Option<Result<i32, RuntimeError>> {
        apply(io, serde_json::from_str(line).unwrap())
    }

    /// Answer one HTTP request with `body` and close the connection.
    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";
            conn.write_all(head.as_bytes()).await.unwrap();
            conn.write_all(body.as_bytes()).await.unwrap();
            conn.shutdown().await.unwrap();
        });
        address
    }

    #[test]
    fn output_is_routed_by_source() {
        let (out, err) = (SharedBuffer::default(), SharedBuffer::default());
        let mut io = io(&out, &err);
        assert!(feed(&mut io, r#"{"process_id":"1"}"#).is_none());
        assert!(feed(&mut io, r#"{"process_id":"1","source":1,"data":"hello "}"#).is_none());
        assert!(feed(&mut io, r#"{"process_id":"1","source":2,"data":"warn"}"#).is_none());
        assert!(feed(&mut io, r#"{"process_id":"1","source":1,"data":"world"}"#).is_none());
        assert_eq!(out.contents(), b"hello world");
        assert_eq!(err.contents(), b"warn");
    }

    #[test]
    fn runtime_error_payload_is_verbatim() {
        let (out, err) = (SharedBuffer::default(), SharedBuffer::default());
        match feed(&mut io(&out, &err), r#"{"error":"container not found"}"#) {
            Some(Err(e)) => assert_eq!(e.to_string(), "container not found"),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn urls_join_onto_the_runtime_address() {
        let garden = GardenClient::new("127.0.0.1:8888").unwrap();
        assert_eq!(
            garden.url("containers/deploy-bosh/processes").unwrap().as_str(),
            "http://127.0.0.1:8888/containers/deploy-bosh/processes"
        );
    }

    #[tokio::test]
    async fn streamed_process_reports_exit_status() {
        let address = serve_once(concat!(
            "{\"process_id\":\"7\"}\n",
            "{\"process_id\":\"7\",\"source\":1,\"data\":\"deployed\\n\"}\n",
            "{\"process_id\":\"7\",\"exit_status\":23}\n",
        ))
        .await;
        let garden = GardenClient::new(&address).unwrap();
        let container = GardenContainer {
            garden,
            handle: "deploy-bosh".into(),
        };

        let out = SharedBuffer::default();
        let mut process = container
            .run(ProcessSpec::default(), io(&out, &SharedBuffer::default()))
            .await
            .unwrap();
        assert_eq!(process.wait().await.unwrap(), 23);
        assert_eq!(out.contents(), b"deployed\n");
    }

    #[tokio::test]
    async fn stream_without_exit_status_is_a_lost_connection() {
        let address = serve_once("{\"process_id\":\"7\"}\n").await;
        let container = GardenContainer {
            garden: GardenClient::new(&address).unwrap(),
            handle: "deploy-bosh".into(),
        };

        let mut process = container
            .run(ProcessSpec::default(), ProcessIo::discard())
            .await
            .unwrap();
        let err = process.wait().await.unwrap_err();
        assert_eq!(err.to_string(), CONNECTION_LOST);
    }
}
