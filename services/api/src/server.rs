use crate::cli::ServeArgs;
use crate::infra::{AppState, InMemoryLoanRepository};
use crate::routes::with_origination_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use loan_origination::config::AppConfig;
use loan_origination::error::AppError;
use loan_origination::telemetry;
use loan_origination::workflows::origination::{
    HttpEligibilityEvaluator, HttpInstitutionMatcher, LoanTracker, OriginationState,
    WorkflowSessions, WorkflowSettings,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let evaluators = &config.evaluators;
    let evaluator = HttpEligibilityEvaluator::new(evaluators, evaluators.require_eligibility_url()?)?;
    let matcher = HttpInstitutionMatcher::new(evaluators, evaluators.require_matching_url()?)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let loans = Arc::new(InMemoryLoanRepository::default());
    let settings = WorkflowSettings {
        call_timeout: evaluators.timeout,
        ..WorkflowSettings::default()
    };
    let origination = OriginationState {
        sessions: Arc::new(WorkflowSessions::new(
            Arc::new(evaluator),
            Arc::new(matcher),
            loans.clone(),
            settings,
        )),
        tracker: Arc::new(LoanTracker::new(loans)),
        institution_key: config.institutions.api_key.as_deref().map(Arc::from),
    };
    if origination.institution_key.is_none() {
        warn!("APP_INSTITUTION_API_KEY is not set; lender loan updates will be refused");
    }

    let app = with_origination_routes(origination)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        timeout_secs = evaluators.timeout.as_secs(),
        "loan origination service ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
