//! Deployment pipeline driven end to end against an in-memory container
//! runtime.
//!
//! Tested in this file:
//! - stage ordering and container cleanup on the happy path
//! - a failing stage aborts the run and leaves its container in place
//! - a lost runtime connection surfaces verbatim
//! - the compatibility gate and the already-running short circuit
//! - services run in catalog order and stop at the first failure
//! - registries reach the platform stage's environment
//! - the credentials container is destroyed whatever the fetch outcome
//! - progress is relayed once per converging deployment

use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use localfoundry::deploy::progress::{ClusterState, HostInfo, Progress};
use localfoundry::deploy::runtime::{
    Container, ContainerRuntime, ContainerSpec, Process, ProcessIo, ProcessSpec, RuntimeError,
};
use localfoundry::deploy::{
    ClusterConnector, DeployOutcome, Environment, Pipeline, PipelineError, PipelineOptions,
    RuntimeCredentials, Ui, parse_registries,
};

const CREDS_YML: &str = "\
admin_password: s3cret
director_ssl:
  ca: CA
jumpbox_ssh:
  private_key: KEY
";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Outcome {
    Exit(i32),
    ConnectionLost,
}

#[derive(Default)]
struct FakeRuntime {
    journal: Arc<Mutex<Vec<String>>>,
    specs: Mutex<Vec<ContainerSpec>>,
    outcomes: HashMap<String, Outcome>,
    outputs: HashMap<String, String>,
    /// How long every process takes to finish.
    wait_delay: Duration,
    pings_before_ready: AtomicUsize,
    never_ready: bool,
}

impl FakeRuntime {
    fn with_outcome(mut self, handle: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(handle.to_string(), outcome);
        self
    }

    fn with_output(mut self, handle: &str, output: &str) -> Self {
        self.outputs.insert(handle.to_string(), output.to_string());
        self
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn spec(&self, handle: &str) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().iter().find(|s| s.handle == handle).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.never_ready {
            return Err(RuntimeError::Other("connection refused".into()));
        }
        let left = self.pings_before_ready.load(Ordering::SeqCst);
        if left > 0 {
            self.pings_before_ready.store(left - 1, Ordering::SeqCst);
            return Err(RuntimeError::Other("connection refused".into()));
        }
        Ok(())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<Box<dyn Container>, RuntimeError> {
        self.journal.lock().unwrap().push(format!("create {}", spec.handle));
        self.specs.lock().unwrap().push(spec.clone());
        let outcome = self.outcomes.get(&spec.handle).copied().unwrap_or(Outcome::Exit(0));
        let output = self
            .outputs
            .get(&spec.handle)
            .cloned()
            .or_else(|| (spec.handle == "fetch-bosh-config").then(|| CREDS_YML.to_string()));
        Ok(Box::new(FakeContainer {
            handle: spec.handle,
            outcome,
            output,
            wait_delay: self.wait_delay,
        }))
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        self.journal.lock().unwrap().push(format!("destroy {handle}"));
        Ok(())
    }
}

struct FakeContainer {
    handle: String,
    outcome: Outcome,
    output: Option<String>,
    wait_delay: Duration,
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(
        &self,
        _spec: ProcessSpec,
        mut io: ProcessIo,
    ) -> Result<Box<dyn Process>, RuntimeError> {
        if let Some(output) = &self.output {
            io.stdout.write_all(output.as_bytes())?;
        }
        Ok(Box::new(FakeProcess(self.outcome, self.wait_delay)))
    }
}

struct FakeProcess(Outcome, Duration);

#[async_trait]
impl Process for FakeProcess {
    async fn wait(&mut self) -> Result<i32, RuntimeError> {
        tokio::time::sleep(self.1).await;
        match self.0 {
            Outcome::Exit(code) => Ok(code),
            Outcome::ConnectionLost => Err(RuntimeError::Other("connection to garden lost".into())),
        }
    }
}

#[derive(Default)]
struct FakeEnvironment {
    running: bool,
    brought_up: AtomicBool,
}

#[async_trait]
impl Environment for FakeEnvironment {
    async fn is_running(&self) -> anyhow::Result<bool> {
        Ok(self.running)
    }

    async fn bring_up(&self) -> anyhow::Result<()> {
        self.brought_up.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Director unreachable: the pipeline carries on without progress.
struct NoDirector;

impl ClusterConnector for NoDirector {
    fn connect(&self, _creds: &RuntimeCredentials) -> anyhow::Result<Arc<dyn ClusterState>> {
        Err(anyhow!("director unreachable"))
    }
}

/// Every deployment reports two healthy hosts on the first poll.
#[derive(Default)]
struct ConvergedCluster {
    polled: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterState for ConvergedCluster {
    async fn hosts(&self, deployment: &str) -> anyhow::Result<Vec<HostInfo>> {
        self.polled.lock().unwrap().push(deployment.to_string());
        let host = HostInfo {
            job_name: "router".into(),
            process_state: "running".into(),
            processes: vec![serde_json::json!({"name": "gorouter"})],
        };
        Ok(vec![host.clone(), host])
    }

    async fn releases(&self) -> anyhow::Result<usize> {
        Ok(0)
    }
}

struct Connected(Arc<ConvergedCluster>);

impl ClusterConnector for Connected {
    fn connect(&self, creds: &RuntimeCredentials) -> anyhow::Result<Arc<dyn ClusterState>> {
        assert_eq!(creds.admin_password, "s3cret");
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingUi {
    said: Mutex<Vec<String>>,
    progress: Mutex<Vec<Progress>>,
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.said.lock().unwrap().push(message.to_string());
    }

    fn progress(&self, progress: &Progress) {
        self.progress.lock().unwrap().push(*progress);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn image_dir(root: &Path, metadata: &str) -> PathBuf {
    let dir = root.join("foundry-deps");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("metadata.yml"), metadata).unwrap();
    dir
}

fn compatible_image(root: &Path) -> PathBuf {
    image_dir(
        root,
        "compatibility_version: v1\n\
         splash_message: welcome aboard\n\
         services:\n\
         - {name: MySQL, handle: deploy-mysql, script: deploy-mysql, deployment: cf-mysql}\n\
         - {name: RabbitMQ, handle: deploy-rabbitmq, script: deploy-rabbitmq, deployment: cf-rabbitmq}\n",
    )
}

fn options(image: PathBuf) -> PipelineOptions {
    let mut options = PipelineOptions::new(image, Ipv4Addr::new(10, 245, 0, 2));
    options.readiness_timeout = Duration::from_millis(200);
    options.readiness_interval = Duration::from_millis(5);
    options.progress_interval = Duration::from_millis(5);
    options
}

fn pipeline(
    runtime: &Arc<FakeRuntime>,
    environment: &Arc<FakeEnvironment>,
    options: PipelineOptions,
) -> Pipeline {
    Pipeline::new(
        runtime.clone(),
        environment.clone(),
        Arc::new(NoDirector),
        Arc::new(RecordingUi::default()),
        options,
    )
}

fn created(journal: &[String]) -> usize {
    journal.iter().filter(|e| e.starts_with("create ")).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_runs_every_stage_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        pings_before_ready: AtomicUsize::new(3),
        ..Default::default()
    });
    let environment = Arc::new(FakeEnvironment::default());

    let outcome = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .expect("deploy succeeds");

    assert_eq!(
        outcome,
        DeployOutcome::Deployed {
            splash_message: Some("welcome aboard".into())
        }
    );
    assert!(environment.brought_up.load(Ordering::SeqCst));
    assert_eq!(
        runtime.journal(),
        [
            "create deploy-bosh",
            "destroy deploy-bosh",
            "create fetch-bosh-config",
            "destroy fetch-bosh-config",
            "create deploy-cf",
            "destroy deploy-cf",
            "create deploy-mysql",
            "destroy deploy-mysql",
            "create deploy-rabbitmq",
            "destroy deploy-rabbitmq",
        ]
    );
}

#[tokio::test]
async fn failing_director_aborts_and_keeps_its_container() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default().with_outcome("deploy-bosh", Outcome::Exit(23)));
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Stage { .. }));
    assert_eq!(
        err.to_string(),
        "failed to deploy BOSH Director: process exited with status 23"
    );
    assert_eq!(runtime.journal(), ["create deploy-bosh"]);
}

#[tokio::test]
async fn lost_runtime_connection_is_reported_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime =
        Arc::new(FakeRuntime::default().with_outcome("deploy-bosh", Outcome::ConnectionLost));
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "failed to deploy BOSH Director: connection to garden lost"
    );
    assert!(!runtime.journal().iter().any(|e| e.starts_with("destroy")));
}

#[tokio::test]
async fn already_running_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment {
        running: true,
        ..Default::default()
    });

    let outcome = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap();

    assert_eq!(outcome, DeployOutcome::AlreadyRunning);
    assert!(!environment.brought_up.load(Ordering::SeqCst));
    assert_eq!(created(&runtime.journal()), 0);
}

#[tokio::test]
async fn incompatible_image_is_rejected_before_bring_up() {
    let tmp = tempfile::tempdir().unwrap();
    let image = image_dir(tmp.path(), "compatibility_version: v2\n");
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(image))
        .deploy()
        .await
        .unwrap_err();

    match &err {
        PipelineError::Incompatible { image, source } => {
            assert_eq!(image, "foundry-deps");
            assert!(source.is_none());
        }
        other => panic!("expected Incompatible, got {other:?}"),
    }
    assert_eq!(
        err.to_string(),
        "foundry-deps is not compatible with localfoundry. Please use a compatible file"
    );
    assert!(!environment.brought_up.load(Ordering::SeqCst));
    assert_eq!(created(&runtime.journal()), 0);
}

#[tokio::test]
async fn image_without_metadata_is_incompatible() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("empty");
    std::fs::create_dir_all(&image).unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(image))
        .deploy()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Incompatible { .. }), "got: {err}");
}

#[tokio::test]
async fn unreadable_metadata_is_incompatible_and_names_the_image() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("my-deps");
    std::fs::create_dir_all(&image).unwrap();
    std::fs::write(image.join("metadata.yml"), "compatibility_version: [v1\n").unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(image))
        .deploy()
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "my-deps is not compatible with localfoundry. Please use a compatible file"
    );
    let cause = std::error::Error::source(&err).expect("parse failure kept as the cause");
    assert!(cause.to_string().starts_with("invalid metadata.yml"), "got: {cause}");
    assert!(!environment.brought_up.load(Ordering::SeqCst));
    assert_eq!(created(&runtime.journal()), 0);
}

#[tokio::test]
async fn missing_image_names_the_path() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("nowhere.iso");
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(image.clone()))
        .deploy()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Metadata(_)));
    assert!(err.to_string().contains(&image.display().to_string()), "got: {err}");
}

#[tokio::test]
async fn failing_service_stops_the_remaining_ones() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default().with_outcome("deploy-mysql", Outcome::Exit(1)));
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "failed to deploy MySQL: process exited with status 1");
    let journal = runtime.journal();
    assert_eq!(journal.last().map(String::as_str), Some("create deploy-mysql"));
    assert!(!journal.iter().any(|e| e.contains("rabbitmq")));
}

#[tokio::test]
async fn unreachable_runtime_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        never_ready: true,
        ..Default::default()
    });
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Connectivity { .. }), "got: {err}");
    assert_eq!(created(&runtime.journal()), 0);
}

#[tokio::test]
async fn no_provision_stops_once_the_runtime_answers() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());
    let mut options = options(compatible_image(tmp.path()));
    options.provision = false;

    let outcome = pipeline(&runtime, &environment, options).deploy().await.unwrap();

    assert_eq!(outcome, DeployOutcome::ProvisionSkipped);
    assert!(environment.brought_up.load(Ordering::SeqCst));
    assert_eq!(created(&runtime.journal()), 0);
}

#[tokio::test]
async fn registries_reach_the_platform_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());
    let mut options = options(compatible_image(tmp.path()));
    options.registries = parse_registries("registry.local:5000,10.0.0.1:443").unwrap();

    pipeline(&runtime, &environment, options).deploy().await.unwrap();

    let platform = runtime.spec("deploy-cf").expect("platform container created");
    let registries = platform
        .env
        .iter()
        .find_map(|e| e.strip_prefix("DOCKER_REGISTRIES="))
        .expect("DOCKER_REGISTRIES set");
    let parsed: Vec<String> = serde_yaml::from_str(registries).unwrap();
    assert_eq!(parsed, ["registry.local:5000", "10.0.0.1:443"]);
    assert!(runtime.spec("deploy-bosh").unwrap().env.is_empty());
}

#[test]
fn malformed_registry_flag_names_the_entry() {
    let err = parse_registries("registry.local:5000,registry.local").unwrap_err();
    assert_eq!(err.to_string(), "'registry.local' - missing port");
}

#[tokio::test]
async fn stage_output_is_logged_per_handle() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let environment = Arc::new(FakeEnvironment::default());
    let mut options = options(compatible_image(tmp.path()));
    options.log_dir = Some(logs.clone());

    pipeline(&runtime, &environment, options).deploy().await.unwrap();

    assert!(logs.join("deploy-bosh.log").exists());
    assert!(logs.join("deploy-cf.log").exists());
    assert!(logs.join("deploy-mysql.log").exists());
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

async fn fetch_failure(runtime: FakeRuntime) -> (PipelineError, Vec<String>) {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(runtime);
    let environment = Arc::new(FakeEnvironment::default());

    let err = pipeline(&runtime, &environment, options(compatible_image(tmp.path())))
        .deploy()
        .await
        .unwrap_err();
    (err, runtime.journal())
}

fn assert_fetch_cleaned_up(journal: &[String]) {
    assert!(journal.iter().any(|e| e == "destroy fetch-bosh-config"), "{journal:?}");
    assert!(!journal.iter().any(|e| e == "create deploy-cf"), "{journal:?}");
}

#[tokio::test]
async fn failed_credentials_read_still_destroys_its_container() {
    let (err, journal) =
        fetch_failure(FakeRuntime::default().with_outcome("fetch-bosh-config", Outcome::Exit(1)))
            .await;

    assert!(matches!(err, PipelineError::Credentials(_)), "got: {err}");
    assert_eq!(
        err.to_string(),
        "failed to fetch bosh configuration: process exited with status 1"
    );
    assert_fetch_cleaned_up(&journal);
}

#[tokio::test]
async fn lost_connection_during_credentials_read_still_destroys_its_container() {
    let (err, journal) = fetch_failure(
        FakeRuntime::default().with_outcome("fetch-bosh-config", Outcome::ConnectionLost),
    )
    .await;

    assert_eq!(
        err.to_string(),
        "failed to fetch bosh configuration: connection to garden lost"
    );
    assert_fetch_cleaned_up(&journal);
}

#[tokio::test]
async fn empty_admin_password_stops_before_the_platform() {
    let (err, journal) = fetch_failure(FakeRuntime::default().with_output(
        "fetch-bosh-config",
        "admin_password: ''\ndirector_ssl: {ca: CA}\njumpbox_ssh: {private_key: KEY}\n",
    ))
    .await;

    assert_eq!(
        err.to_string(),
        "failed to fetch bosh configuration: admin password was not returned"
    );
    assert_fetch_cleaned_up(&journal);
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_relayed_for_each_converging_deployment() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        wait_delay: Duration::from_millis(60),
        ..Default::default()
    });
    let environment = Arc::new(FakeEnvironment::default());
    let cluster = Arc::new(ConvergedCluster::default());
    let ui = Arc::new(RecordingUi::default());

    let outcome = Pipeline::new(
        runtime.clone(),
        environment,
        Arc::new(Connected(cluster.clone())),
        ui.clone(),
        options(compatible_image(tmp.path())),
    )
    .deploy()
    .await
    .expect("stages finish after their progress streams end");

    assert!(matches!(outcome, DeployOutcome::Deployed { .. }));
    assert_eq!(*cluster.polled.lock().unwrap(), ["cf", "cf-mysql", "cf-rabbitmq"]);

    let progress = ui.progress.lock().unwrap();
    assert_eq!(progress.len(), 3);
    assert!(progress.iter().all(|p| p.done == 2 && p.total == 2 && p.is_complete()));
    assert!(progress.iter().all(|p| p.releases == 0));
    assert_eq!(created(&runtime.journal()), 5);
}
