//! Minimal BOSH director API client, enough to report deployment progress.
//!
//! VM details are produced by an asynchronous director task:
//! `GET /deployments/:name/vms?format=full` answers with a redirect to
//! `/tasks/:id`, which is polled until `done`, then the result is read as one
//! JSON object per line.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::{Certificate, Client, redirect};
use serde::Deserialize;
use tokio::time::Instant;
use url::Url;

use crate::deploy::credentials::RuntimeCredentials;
use crate::deploy::progress::{ClusterState, HostInfo};

pub const DIRECTOR_PORT: u16 = 25555;

const TASK_POLL: Duration = Duration::from_millis(500);
const TASK_TIMEOUT: Duration = Duration::from_secs(120);

pub struct DirectorClient {
    client: Client,
    base: Url,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct Task {
    state: String,
    #[serde(default)]
    result: Option<String>,
}

impl DirectorClient {
    pub fn new(creds: &RuntimeCredentials) -> Result<Self> {
        let ca = Certificate::from_pem(creds.ca_certificate.as_bytes())
            .context("director CA certificate is not valid PEM")?;
        let client = Client::builder()
            .add_root_certificate(ca)
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build director client")?;
        let base = Url::parse(&format!("https://{}:{DIRECTOR_PORT}/", creds.director_address))?;
        Ok(Self {
            client,
            base,
            username: creds.admin_username.clone(),
            password: creds.admin_password.clone(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.base.join(path)?;
        self.client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("director request {url} failed"))
    }

    /// Start the VM-details task and return its id.
    async fn start_vms_task(&self, deployment: &str) -> Result<String> {
        let resp = self.get(&format!("deployments/{deployment}/vms?format=full")).await?;
        if !resp.status().is_redirection() {
            bail!("director answered {} for deployment {deployment}", resp.status());
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("director redirect carried no Location")?;
        task_id(location)
    }

    async fn wait_for_task(&self, id: &str) -> Result<()> {
        let deadline = Instant::now() + TASK_TIMEOUT;
        loop {
            let task: Task = self.get(&format!("tasks/{id}")).await?.json().await?;
            match task.state.as_str() {
                "done" => return Ok(()),
                "queued" | "processing" => {}
                other => bail!(
                    "director task {id} ended {other}: {}",
                    task.result.unwrap_or_default()
                ),
            }
            if Instant::now() >= deadline {
                bail!("director task {id} did not finish within {}s", TASK_TIMEOUT.as_secs());
            }
            tokio::time::sleep(TASK_POLL).await;
        }
    }
}

/// `/tasks/123` → `123`.
fn task_id(location: &str) -> Result<String> {
    let path = location.split('?').next().unwrap_or_default();
    match path.rsplit_once("/tasks/") {
        Some((_, id)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
            Ok(id.to_string())
        }
        _ => bail!("unexpected director task location: {location}"),
    }
}

fn parse_hosts(body: &str) -> Result<Vec<HostInfo>> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("malformed VM info"))
        .collect()
}

#[async_trait]
impl ClusterState for DirectorClient {
    async fn hosts(&self, deployment: &str) -> Result<Vec<HostInfo>> {
        let id = self.start_vms_task(deployment).await?;
        self.wait_for_task(&id).await?;
        let body = self
            .get(&format!("tasks/{id}/output?type=result"))
            .await?
            .text()
            .await?;
        parse_hosts(&body)
    }

    async fn releases(&self) -> Result<usize> {
        let releases: Vec<serde_json::Value> = self
            .get("releases")
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed release list")?;
        Ok(releases.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_from_location() {
        assert_eq!(task_id("/tasks/42").unwrap(), "42");
        assert_eq!(task_id("https://10.245.0.2:25555/tasks/7?x=1").unwrap(), "7");
        assert!(task_id("/deployments/cf").is_err());
        assert!(task_id("/tasks/").is_err());
    }

    #[test]
    fn result_lines_become_hosts() {
        let body = concat!(
            r#"{"job_name":"router","process_state":"running","processes":[{"name":"gorouter"}]}"#,
            "\n",
            r#"{"job_name":"api","process_state":"starting","processes":[]}"#,
            "\n\n",
        );
        let hosts = parse_hosts(body).unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(hosts[0].is_up());
        assert!(!hosts[1].is_up());
    }
}
