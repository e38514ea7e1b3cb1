//! Shared harness for controller and HTTP tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use portrait_verify::app_state::AppState;
use portrait_verify::models::format::FormatRegistry;
use portrait_verify::models::job::{AuthContext, Job, JobId};
use portrait_verify::models::status::JobStatus;
use portrait_verify::routes;
use portrait_verify::services::controller::{Controller, ControllerConfig, ControllerDeps};
use portrait_verify::services::mock::{RecordingAuditSink, StaticSampler};
use portrait_verify::services::pipeline::{Collaborators, PipelineConfig};
use portrait_verify::services::resources::{CapacityThresholds, ResourceMonitor};
use portrait_verify::services::security::{AllowAll, AuthorizationCheck, SecuritySigner, UnsignedSigner};

use crate::fixtures::{self, PortraitFixture};

/// Upper bound for any single wait in these tests.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(10);

/// Controller settings tuned for fast tests.
pub fn fast_config(max_concurrent_jobs: usize) -> ControllerConfig {
    ControllerConfig {
        max_concurrent_jobs,
        poll_interval: Duration::from_millis(20),
        admission_retry_delay: Duration::from_millis(10),
        ..ControllerConfig::default()
    }
}

pub struct HarnessBuilder {
    config: ControllerConfig,
    pipeline: PipelineConfig,
    stages: Collaborators,
    authorizer: Arc<dyn AuthorizationCheck>,
    signer: Arc<dyn SecuritySigner>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn stages(mut self, stages: Collaborators) -> Self {
        self.stages = stages;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn AuthorizationCheck>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn SecuritySigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let sampler = Arc::new(StaticSampler::idle());
        let audit = Arc::new(RecordingAuditSink::new());
        let deps = ControllerDeps {
            stages: self.stages,
            pipeline: self.pipeline,
            monitor: ResourceMonitor::new(sampler.clone(), CapacityThresholds::default()),
            formats: FormatRegistry::default(),
            authorizer: self.authorizer,
            signer: self.signer,
            audit: audit.clone(),
        };
        Harness {
            controller: Controller::new(self.config, deps),
            sampler,
            audit,
            dir,
        }
    }
}

/// A controller wired to in-memory collaborators plus a scratch directory.
pub struct Harness {
    pub controller: Controller,
    pub sampler: Arc<StaticSampler>,
    pub audit: Arc<RecordingAuditSink>,
    pub dir: TempDir,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: fast_config(2),
            pipeline: PipelineConfig::default(),
            stages: Collaborators::converging(),
            authorizer: Arc::new(AllowAll),
            signer: Arc::new(UnsignedSigner),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        self.controller.start()
    }

    pub fn input(&self, fixture: &PortraitFixture) -> PathBuf {
        fixtures::write(self.dir.path(), fixture)
    }

    /// A job over `fixture` with a fresh output path.
    pub fn job(&self, fixture: &PortraitFixture, priority: u8) -> Job {
        let input = self.input(fixture);
        let output = self.dir.path().join("out").join(format!("{}.png", JobId::new()));
        Job::new(input, output, "icao", AuthContext::new("tester")).with_priority(priority)
    }

    pub async fn submit(&self, fixture: &PortraitFixture, priority: u8) -> JobId {
        self.controller
            .submit_job(self.job(fixture, priority))
            .await
            .expect("job should be admitted")
    }

    pub async fn wait_terminal(&self, job_id: JobId) -> JobStatus {
        wait_terminal(&self.controller, job_id).await
    }
}

pub fn is_terminal(status: &JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
    )
}

/// Poll until the job leaves the queue and the worker pool.
pub async fn wait_terminal(controller: &Controller, job_id: JobId) -> JobStatus {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let status = controller.get_processing_status(job_id);
        if is_terminal(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "job {job_id} still {} after {WAIT_LIMIT:?}", status.label());
        sleep(POLL).await;
    }
}

/// Poll `condition` until it holds; panics after [`WAIT_LIMIT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(POLL).await;
    }
}

/// Serve the HTTP API on an ephemeral port and return its base URL.
pub async fn spawn_server(state: AppState) -> String {
    let metrics = Arc::new(PrometheusBuilder::new().build_recorder().handle());
    let app = routes::router(state, metrics);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });
    format!("http://{addr}")
}
