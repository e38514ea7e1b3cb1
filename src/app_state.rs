use std::sync::Arc;

use crate::config::AppConfig;
use crate::models::format::FormatRegistry;
use crate::services::{
    background::BorderSegmenter,
    controller::{Controller, ControllerDeps},
    detector::{DetectorError, RemoteFaceDetector},
    enhancement::ImageEnhancer,
    pipeline::Collaborators,
    quality::ImageQualityAnalyzer,
    resources::{ProcfsSampler, ResourceMonitor},
    security::{
        AllowAll, AuthorizationCheck, GcmSigner, JwtAuthorizer, SecuritySigner, SignError, TracingAuditSink,
        UnsignedSigner,
    },
    validator::RuleValidator,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    /// Checks bearer tokens on routes that do not go through the controller.
    pub authorizer: Arc<dyn AuthorizationCheck>,
}

impl AppState {
    pub fn new(controller: Controller, authorizer: Arc<dyn AuthorizationCheck>) -> Self {
        Self { controller, authorizer }
    }
}

pub fn authorizer(config: &AppConfig) -> Arc<dyn AuthorizationCheck> {
    match &config.jwt_secret {
        Some(secret) => Arc::new(JwtAuthorizer::new(secret)),
        None => {
            tracing::warn!("JWT_SECRET not set, every caller is authorized");
            Arc::new(AllowAll)
        }
    }
}

pub fn signer(config: &AppConfig) -> Result<Arc<dyn SecuritySigner>, SignError> {
    Ok(match &config.signing_key {
        Some(key) => Arc::new(GcmSigner::new(key)?),
        None => {
            tracing::warn!("SIGNING_KEY not set, reports will be unsigned");
            Arc::new(UnsignedSigner)
        }
    })
}

/// Production stage collaborators. Must be called inside a tokio runtime.
pub fn production_stages(config: &AppConfig) -> Result<Collaborators, DetectorError> {
    let background = Arc::new(BorderSegmenter::new());
    Ok(Collaborators {
        detector: Arc::new(RemoteFaceDetector::new(
            config.face_detector_url.clone(),
            config.face_detector_token.clone(),
        )?),
        background: background.clone(),
        quality: Arc::new(ImageQualityAnalyzer::default()),
        enhancer: Arc::new(ImageEnhancer::new(background)),
        validator: Arc::new(RuleValidator::new()),
    })
}

/// Wire a controller from configuration and a set of stage collaborators.
pub fn build_controller(
    config: &AppConfig,
    stages: Collaborators,
    authorizer: Arc<dyn AuthorizationCheck>,
) -> Result<Controller, StartupError> {
    let monitor = ResourceMonitor::new(Arc::new(ProcfsSampler::new(&config.disk_path)), config.thresholds());
    let deps = ControllerDeps {
        stages,
        pipeline: config.pipeline(),
        monitor,
        formats: FormatRegistry::default(),
        authorizer,
        signer: signer(config)?,
        audit: Arc::new(TracingAuditSink),
    };
    Ok(Controller::new(config.controller(), deps))
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Signer setup failed: {0}")]
    Signer(#[from] SignError),

    #[error("Face detector setup failed: {0}")]
    Detector(#[from] DetectorError),
}
