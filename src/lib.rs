mod config;
mod error;
mod future;
mod init_metrics;
mod init_tracing;
mod operations;
mod pipeline;
mod probe;
mod recorder;
mod repo;
mod schedule;
mod store;
mod sync;
mod time_key;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use actix_web::{web, App, HttpResponse, HttpServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_actix_web::TracingLogger;

use self::{
    config::Configuration,
    error::{Error, ServiceError},
    init_tracing::init_tracing,
    operations::{CompletionReport, CompletionResults, OperationsManager, OperationsState},
    pipeline::PipelineHandle,
    recorder::Recorder,
    repo::{ArcRepo, FullRepo, LogRepo},
    schedule::ProbePlan,
    store::Endpoints,
};

/// Origin codes are the first three characters of the caller's reported
/// location, uppercased.
fn normalize_origin(raw: &str) -> Result<String, Error> {
    let code = raw.trim();

    if code.len() < 3 || !code.is_ascii() {
        return Err(ServiceError::InvalidOrigin.into());
    }

    Ok(code[..3].to_uppercase())
}

fn error_event(subsystem: &'static str, origin: &str, context: &str, detail: String) {
    let detail: String = detail.chars().take(256).collect();

    tracing::error!("{subsystem} failure for {origin} ({context}): {detail}");

    metrics::counter!(
        init_metrics::ERROR_EVENTS,
        "subsystem" => subsystem,
        "origin" => origin.to_string(),
        "context" => context.to_string(),
        "detail" => detail
    )
    .increment(1);
}

fn latency_point(storage: &'static str, endpoint: &str, origin: &str, operation: &str, bytes: u64, latency: u64) {
    metrics::histogram!(
        init_metrics::LATENCY_POINTS,
        "storage" => storage,
        "endpoint" => endpoint.to_string(),
        "origin" => origin.to_string(),
        "operation" => operation.to_string(),
        "bytes" => bytes.to_string()
    )
    .record(latency as f64);
}

/// Probes every endpoint of the scheduled group, then records the minute
/// sample. Failed endpoints are surfaced to the error sink and left out of
/// the sample; the next minute's cycle retries.
async fn fleet_probe(
    endpoints: Endpoints,
    recorder: Recorder,
    origin: String,
    plan: ProbePlan,
    minute_key: String,
    timeout: Duration,
) {
    let key = schedule::fleet_object_key(plan.bytes, &origin);
    let mut latencies = BTreeMap::new();

    for label in plan.endpoints {
        let Some(store) = endpoints.get(label) else {
            tracing::warn!("No endpoint configured for {label}");
            continue;
        };

        match probe::timed_probe(store, plan.operation, plan.bytes, &key, timeout).await {
            Ok(latency) => {
                latency_point("fleet", label, &origin, plan.operation.as_str(), plan.bytes, latency);
                latencies.insert((*label).to_string(), latency);
            }
            Err(e) => error_event(
                "probe",
                &origin,
                &format!("{}:{}:{label}", plan.operation, plan.bytes),
                e.to_string(),
            ),
        }
    }

    if latencies.is_empty() {
        return;
    }

    if let Err(e) = recorder
        .record(&minute_key, &origin, plan.operation, plan.bytes, latencies)
        .await
    {
        // the bucket is abandoned; the next minute supersedes it
        error_event("recorder", &origin, "record-sample", e.to_string());
    }
}

/// Runs the prescribed operation against each anchor region and reports
/// the outcome back to the state machine.
async fn anchor_probe(
    endpoints: Endpoints,
    manager: OperationsManager,
    origin: String,
    state: OperationsState,
    timeout: Duration,
) {
    let mut results = CompletionResults::new();

    for (region, operation) in &state {
        let Some(store) = endpoints.get(region) else {
            tracing::warn!("No endpoint configured for anchor region {region}");
            continue;
        };

        let success = match probe::timed_probe(
            store,
            operation.kind,
            operation.bytes,
            &operation.object_key,
            timeout,
        )
        .await
        {
            Ok(latency) => {
                latency_point(
                    "anchor",
                    region,
                    &origin,
                    operation.kind.as_str(),
                    operation.bytes,
                    latency,
                );
                true
            }
            Err(e) => {
                error_event(
                    "probe",
                    &origin,
                    &format!("{}:{}:{region}", operation.kind, operation.bytes),
                    e.to_string(),
                );
                false
            }
        };

        results.insert(
            region.clone(),
            CompletionReport {
                success,
                operation: operation.kind,
                bytes: operation.bytes,
                object_key: operation.object_key.clone(),
            },
        );
    }

    if let Err(e) = manager.report_completion(&origin, &results).await {
        error_event("operations", &origin, "report-completion", e.to_string());
    }
}

#[derive(Debug, serde::Deserialize)]
struct OriginQuery {
    origin: String,
}

/// Fast-ack probe trigger: picks this minute's slot, skips when the bucket
/// is already recorded, otherwise queues the fleet and anchor probes as
/// background work and returns immediately.
#[tracing::instrument(skip(endpoints, manager, recorder, config))]
async fn probe_trigger(
    query: web::Query<OriginQuery>,
    endpoints: web::Data<Endpoints>,
    manager: web::Data<OperationsManager>,
    recorder: web::Data<Recorder>,
    config: web::Data<Configuration>,
) -> Result<HttpResponse, Error> {
    let origin = normalize_origin(&query.origin)?;
    let now_ms = time_key::now_ms();

    let plan = schedule::select(now_ms, &origin);
    let minute_key = time_key::minute_key(now_ms);

    if recorder
        .already_recorded(&minute_key, &origin, plan.operation, plan.bytes)
        .await?
    {
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "skipped": "already tracked"
        })));
    }

    let state = manager.current_state(&origin).await?;
    let timeout = Duration::from_secs(config.probes.timeout_seconds);

    sync::spawn(
        "fleet-probe",
        fleet_probe(
            endpoints.get_ref().clone(),
            recorder.get_ref().clone(),
            origin.clone(),
            plan.clone(),
            minute_key,
            timeout,
        ),
    );

    sync::spawn(
        "anchor-probe",
        anchor_probe(
            endpoints.get_ref().clone(),
            manager.get_ref().clone(),
            origin,
            state.clone(),
            timeout,
        ),
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "queued": true,
        "state": state,
        "plan": plan
    })))
}

async fn operations_state(
    query: web::Query<OriginQuery>,
    manager: web::Data<OperationsManager>,
) -> Result<HttpResponse, Error> {
    let origin = normalize_origin(&query.origin)?;

    let state = manager.current_state(&origin).await?;

    Ok(HttpResponse::Ok().json(state))
}

async fn operations_complete(
    query: web::Query<OriginQuery>,
    results: web::Json<CompletionResults>,
    manager: web::Data<OperationsManager>,
) -> Result<HttpResponse, Error> {
    let origin = normalize_origin(&query.origin)?;

    let state = manager.report_completion(&origin, &results).await?;

    Ok(HttpResponse::Ok().json(state))
}

#[derive(Debug, serde::Deserialize)]
struct HourlyQuery {
    scheduled_ms: Option<i64>,
}

async fn aggregation_hourly(
    query: web::Query<HourlyQuery>,
    pipeline: web::Data<PipelineHandle>,
) -> Result<HttpResponse, Error> {
    let scheduled_ms = query.scheduled_ms.unwrap_or_else(time_key::now_ms);

    let summary = pipeline.run_hourly(scheduled_ms).await?;

    Ok(HttpResponse::Ok().json(summary))
}

async fn aggregation_status(
    pipeline: web::Data<PipelineHandle>,
) -> Result<HttpResponse, Error> {
    let status = pipeline.status().await?;

    Ok(HttpResponse::Ok().json(status))
}

#[derive(Debug, serde::Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn recent_logs(
    query: web::Query<LogQuery>,
    repo: web::Data<ArcRepo>,
) -> Result<HttpResponse, Error> {
    let entries = repo.recent_logs(query.limit.unwrap_or(50)).await?;

    Ok(HttpResponse::Ok().json(entries))
}

async fn healthz(
    repo: web::Data<ArcRepo>,
    endpoints: web::Data<Endpoints>,
) -> Result<HttpResponse, Error> {
    repo.health_check().await?;
    endpoints.health_check().await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "msg": "ok" })))
}

fn configure_endpoints(sc: &mut web::ServiceConfig) {
    sc.service(web::resource("/probe").route(web::get().to(probe_trigger)))
        .service(web::resource("/operations").route(web::get().to(operations_state)))
        .service(web::resource("/operations/complete").route(web::post().to(operations_complete)))
        .service(web::resource("/aggregation/hourly").route(web::post().to(aggregation_hourly)))
        .service(web::resource("/aggregation/status").route(web::get().to(aggregation_status)))
        .service(web::resource("/log").route(web::get().to(recent_logs)))
        .service(web::resource("/healthz").route(web::get().to(healthz)));
}

pub struct StorewatchConfiguration {
    config: Configuration,
}

impl StorewatchConfiguration {
    /// Build the storewatch configuration from commandline arguments,
    /// environment and the optional configuration file.
    pub fn build_default() -> color_eyre::Result<Self> {
        Ok(StorewatchConfiguration {
            config: config::configure()?,
        })
    }

    pub fn install_tracing(self) -> color_eyre::Result<Self> {
        init_tracing(&self.config.tracing)?;

        Ok(self)
    }

    pub fn install_metrics(self) -> color_eyre::Result<Self> {
        if let Some(address) = self.config.metrics.prometheus_address {
            PrometheusBuilder::new()
                .with_http_listener(address)
                .install()?;
        }

        init_metrics::init_metrics();

        Ok(self)
    }

    /// Run the storewatch application.
    pub async fn run(self) -> color_eyre::Result<()> {
        let StorewatchConfiguration { config } = self;

        let repo: ArcRepo = Arc::new(repo::sled::SledRepo::build(
            config.repo.path.clone(),
            config.repo.cache_capacity,
        )?);

        let endpoints = Endpoints::open(&config.endpoints).await?;

        for anchor in &config.probes.anchor_regions {
            if endpoints.get(anchor).is_none() {
                tracing::warn!("Anchor region {anchor} has no configured endpoint");
            }
        }

        let manager =
            OperationsManager::new(repo.clone(), config.probes.anchor_regions.clone());
        let recorder = Recorder::new(repo.clone());

        let (pipeline, pipeline_task) = pipeline::spawn(repo.clone());

        let address = config.server.address;

        tracing::info!(
            "Launching storewatch on {address} with {} endpoints",
            endpoints.labels().count()
        );

        HttpServer::new(move || {
            App::new()
                .wrap(TracingLogger::default())
                .app_data(web::Data::new(repo.clone()))
                .app_data(web::Data::new(endpoints.clone()))
                .app_data(web::Data::new(manager.clone()))
                .app_data(web::Data::new(recorder.clone()))
                .app_data(web::Data::new(pipeline.clone()))
                .app_data(web::Data::new(config.clone()))
                .configure(configure_endpoints)
        })
        .bind(address)?
        .run()
        .await?;

        pipeline_task.abort();

        Ok(())
    }
}
