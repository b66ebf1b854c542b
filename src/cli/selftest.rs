// ABOUTME: CLI selftest command - drives every engine operation over an in-process loopback bus
//
// Wires an InMemoryBus to:
// - a project host answering getProjectRequest / getResourceRequest
// - a worker farm that announces workers when scaled and confirms binds
// then runs a correlated listing request, a project download and a pool
// acquire/release cycle, and reports the outcome.

use super::{OutputFormat, SelftestArgs};
use anyhow::{bail, Context, Result};
use busline::bus::{HandlerRegistration, InMemoryBus, Message, MessageBus, Payload};
use busline::config::Config;
use busline::download::{FsWorkspace, ProjectDownload};
use busline::pool::{InstanceCountProvisioner, PoolStats, ProvisionError, ServicePool};
use busline::protocol::{
    self, CallbackId, GetProjectResponse, GetResourceRequest, GetResourceResponse, ResourceEntry,
    ServiceReady, StartServiceRequest, StartServiceResponse, GET_PROJECT_REQUEST,
    GET_PROJECT_RESPONSE, GET_RESOURCE_REQUEST, GET_RESOURCE_RESPONSE, SERVICE, SERVICE_READY,
    START_SERVICE_REQUEST, START_SERVICE_RESPONSE, USERNAME,
};
use busline::request::{decode, CorrelatedRequest, CorrelationKey};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROJECT: &str = "selftest-project";

/// Outcome of a selftest run
#[derive(Debug, Serialize)]
pub struct SelftestReport {
    /// Entries in the listing returned by the correlated request
    pub listed_files: usize,
    /// Files written by the download
    pub downloaded_files: usize,
    /// Folders written by the download, the project root included
    pub downloaded_folders: usize,
    /// Temporary workspace the download wrote into
    pub workspace: PathBuf,
    /// Worker bound by the pool round-trip
    pub socket: String,
    /// Whether releasing the worker found its binding
    pub released: bool,
    /// Pool state after dispose
    pub pool: PoolStats,
    /// Wall time of the whole run
    pub elapsed_ms: u64,
}

/// Execute the selftest command
pub async fn execute(args: SelftestArgs, config: Config, format: OutputFormat) -> Result<()> {
    let started = Instant::now();
    let bus = Arc::new(InMemoryBus::new());
    let dyn_bus: Arc<dyn MessageBus> = bus.clone();
    let _host = project_host(&bus, args.files);

    // 1. Correlated request
    let key = CorrelationKey::for_user(&args.user).with_callback_id(CallbackId::next());
    let mut request = Payload::new();
    request.insert("project".to_string(), PROJECT.into());
    let listing: GetProjectResponse =
        CorrelatedRequest::new(Arc::clone(&dyn_bus), GET_PROJECT_RESPONSE, key, decode::<GetProjectResponse>)
            .with_timeout(config.request.timeout)
            .request(GET_PROJECT_REQUEST, request)
            .await
            .context("Correlated listing request failed")?;

    // 2. Project download
    let temp_dir = match args.workspace {
        Some(_) => None,
        None => Some(tempfile::TempDir::new().context("Failed to create temporary workspace")?),
    };
    let workspace = args
        .workspace
        .clone()
        .or_else(|| temp_dir.as_ref().map(|dir| dir.path().to_path_buf()))
        .unwrap_or_else(|| config.download.workspace_root());

    let outcome = ProjectDownload::new(
        Arc::clone(&dyn_bus),
        Arc::new(FsWorkspace::new(&workspace)),
        PROJECT,
        args.user.as_str(),
    )
    .with_timeout(config.download.timeout)
    .run()
    .await
    .context("Project download failed")?;

    if outcome.files != args.files {
        bail!(
            "Downloaded {} files but the host listed {}",
            outcome.files,
            args.files
        );
    }

    // 3. Pool round-trip; nothing is in flight at dispose, so skip the drain
    let mut pool_config = config.pool.clone();
    pool_config.drain_window = Duration::ZERO;
    let (provisioner, _binder) = worker_farm(&bus, &pool_config.service_id);
    let pool = ServicePool::new(Arc::clone(&dyn_bus), Arc::new(provisioner), pool_config)?;
    pool.start();
    let socket = pool
        .acquire(&args.user)
        .await
        .context("Worker acquisition failed")?;
    let released = pool.release(&args.user);
    pool.dispose().await;

    let report = SelftestReport {
        listed_files: listing
            .files
            .iter()
            .filter(|entry| entry.kind == "file")
            .count(),
        downloaded_files: outcome.files,
        downloaded_folders: outcome.folders,
        workspace,
        socket,
        released,
        pool: pool.stats(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(elapsed_ms = report.elapsed_ms, "Selftest passed");

    match format {
        OutputFormat::Text => print_text(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn print_text(report: &SelftestReport) {
    println!(
        "✅ Correlated request: '{}' lists {} files",
        PROJECT, report.listed_files
    );
    println!(
        "✅ Download: {} files, {} folders into {}",
        report.downloaded_files,
        report.downloaded_folders,
        report.workspace.display()
    );
    println!(
        "✅ Pool '{}': bound {}, released: {}",
        report.pool.service_id, report.socket, report.released
    );
    println!(
        "   acquisitions={} bound={} failed={} workers_announced={} shut_down={}",
        report.pool.metrics.acquisitions,
        report.pool.metrics.acquisitions_bound,
        report.pool.metrics.acquisitions_failed,
        report.pool.metrics.workers_announced,
        report.pool.metrics.workers_shut_down
    );
    println!("Completed in {} ms", report.elapsed_ms);
}

// === Loopback Project Host ===

/// Answer manifest and resource requests for one synthetic project
fn project_host(bus: &Arc<InMemoryBus>, files: usize) -> Vec<HandlerRegistration> {
    let now = chrono::Utc::now().timestamp_millis();
    let contents: Arc<HashMap<String, String>> = Arc::new(
        (0..files)
            .map(|i| (format!("src/file-{i}.txt"), format!("line {i}\n")))
            .collect(),
    );

    let mut manifest = vec![ResourceEntry::folder("", now), ResourceEntry::folder("src", now)];
    manifest.extend(contents.keys().map(|path| ResourceEntry::file(path.clone(), now)));

    let reply_bus = Arc::clone(bus);
    let manifest_host = HandlerRegistration::register(
        bus.clone(),
        GET_PROJECT_REQUEST,
        |_| true,
        move |message| {
            let reply = GetProjectResponse {
                callback_id: CallbackId::of(message),
                username: message.str_field(USERNAME).unwrap_or_default().to_string(),
                project: PROJECT.to_string(),
                files: manifest.clone(),
            };
            reply_to(&reply_bus, GET_PROJECT_RESPONSE, &reply);
        },
    );

    let reply_bus = Arc::clone(bus);
    let resource_host = HandlerRegistration::register(
        bus.clone(),
        GET_RESOURCE_REQUEST,
        |_| true,
        move |message| {
            let Some(request) = parse::<GetResourceRequest>(message) else {
                return;
            };
            let Some(content) = contents.get(&request.resource) else {
                warn!(resource = %request.resource, "Loopback host has no such resource");
                return;
            };
            let reply = GetResourceResponse {
                callback_id: Some(request.callback_id),
                username: request.username,
                resource: request.resource,
                timestamp: now,
                content: content.clone(),
            };
            reply_to(&reply_bus, GET_RESOURCE_RESPONSE, &reply);
        },
    );

    vec![manifest_host, resource_host]
}

// === Loopback Worker Farm ===

type ScaleFn = Box<dyn Fn(u32) -> Result<(), ProvisionError> + Send + Sync>;

/// Provisioner that announces one worker per new instance, plus a
/// responder confirming every bind request for `service`
fn worker_farm(
    bus: &Arc<InMemoryBus>,
    service: &str,
) -> (InstanceCountProvisioner<ScaleFn>, HandlerRegistration) {
    let announced = AtomicU32::new(0);
    let announce_bus = Arc::clone(bus);
    let announce_service = service.to_string();
    let scale: ScaleFn = Box::new(move |count| {
        let previous = announced.fetch_max(count, Ordering::SeqCst);
        for _ in previous..count {
            let ready = ServiceReady {
                service: announce_service.clone(),
                socket_id: format!("worker-{}", uuid::Uuid::new_v4()),
            };
            let payload = protocol::to_payload(&ready)
                .map_err(|e| ProvisionError::Backend(e.to_string()))?;
            announce_bus
                .publish(SERVICE_READY, payload)
                .map_err(|e| ProvisionError::Backend(e.to_string()))?;
        }
        Ok(())
    });

    let reply_bus = Arc::clone(bus);
    let bind_service = service.to_string();
    let binder = HandlerRegistration::register(
        bus.clone(),
        START_SERVICE_REQUEST,
        move |message| message.field_equals(SERVICE, &bind_service),
        move |message| {
            let Some(request) = parse::<StartServiceRequest>(message) else {
                return;
            };
            let reply = StartServiceResponse {
                service: request.service,
                username: request.username,
                socket_id: request.socket_id,
                callback_id: request.callback_id,
            };
            reply_to(&reply_bus, START_SERVICE_RESPONSE, &reply);
        },
    );

    (InstanceCountProvisioner::new(scale), binder)
}

fn parse<T: serde::de::DeserializeOwned>(message: &Message) -> Option<T> {
    match protocol::from_payload(&message.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(message_type = %message.kind, error = %e, "Loopback peer got a malformed request");
            None
        }
    }
}

fn reply_to<T: Serialize>(bus: &InMemoryBus, kind: &str, reply: &T) {
    let published = protocol::to_payload(reply)
        .map_err(anyhow::Error::from)
        .and_then(|payload| bus.publish(kind, payload).map_err(anyhow::Error::from));
    if let Err(e) = published {
        warn!(message_type = %kind, error = %e, "Loopback reply failed");
    }
}
