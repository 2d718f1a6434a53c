use chrono::Utc;
use serde_json::json;
use sim_core::{AnalyzerBinding, Location, Settings, SimulationStatus};
use sim_runner::{
    analyze_experiments, monitor_for, ExperimentManager, NewExperiment, Overseer, Services, Sweep,
    ANALYSIS_DIR, REPORT_FILE,
};
use std::fs;
use std::path::PathBuf;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Response, Server};

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "simtools_remote_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

/// Cluster API double: commission assigns `r-<seq>` ids; the first status
/// poll reports Running, the second fails with 503, later ones are final.
/// The directory listing knows none of the jobs.
fn start_cluster() -> (String, Arc<Mutex<Vec<String>>>) {
    let server = Server::http("127.0.0.1:0").expect("bind");
    let addr = server.server_addr().to_ip().expect("ip listener");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let polls = AtomicUsize::new(0);
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let method = request.method().to_string();
            let url = request.url().to_string();
            log.lock().expect("log").push(format!("{} {}", method, url));
            let parts = url.trim_start_matches("/api/").split('/').collect::<Vec<_>>();
            let (code, body) = match (method.as_str(), parts.as_slice()) {
                ("POST", ["experiments", exp, "commission"]) => (
                    200,
                    json!({"simulations": {format!("{}.1", exp): "r-1", format!("{}.2", exp): "r-2"}}),
                ),
                ("GET", ["experiments", _, "simulations"]) => {
                    match polls.fetch_add(1, Ordering::SeqCst) {
                        0 => (
                            200,
                            json!({"simulations": [
                                {"id": "r-1", "state": "Running", "message": "10 100"},
                                {"id": "r-2", "state": "Waiting"},
                            ]}),
                        ),
                        1 => (503, json!({"error": "maintenance"})),
                        _ => (
                            200,
                            json!({"simulations": [
                                {"id": "r-1", "state": "Succeeded"},
                                {"id": "r-2", "state": "Failed", "message": "node crashed"},
                                {"id": "r-9", "state": "Succeeded"},
                            ]}),
                        ),
                    }
                }
                ("GET", ["experiments", _, "directories"]) => (200, json!({"r-9": "/cluster/r-9"})),
                _ => (404, json!({"error": "not found"})),
            };
            let header =
                Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("header");
            let _ = request.respond(
                Response::from_string(body.to_string())
                    .with_status_code(code)
                    .with_header(header),
            );
        }
    });
    (format!("http://{}", addr), seen)
}

/// Submitted jobs per experiment, local id -> cluster id.
type Ledger = Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>;

/// Cluster double that remembers what it was sent. A second commission of
/// the same experiment answers 409 with the ids it already assigned; with
/// `lose_first_reply` the first commission is recorded but answered 504.
fn start_stateful_cluster(lose_first_reply: bool) -> (String, Ledger, Arc<Mutex<Vec<String>>>) {
    let server = Server::http("127.0.0.1:0").expect("bind");
    let addr = server.server_addr().to_ip().expect("ip listener");
    let ledger: Ledger = Arc::new(Mutex::new(BTreeMap::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (jobs, log) = (Arc::clone(&ledger), Arc::clone(&seen));
    let lose_reply = AtomicBool::new(lose_first_reply);
    thread::spawn(move || {
        let mut next_id = 0;
        for mut request in server.incoming_requests() {
            let mut raw = String::new();
            let _ = request.as_reader().read_to_string(&mut raw);
            let method = request.method().to_string();
            let url = request.url().to_string();
            log.lock().expect("log").push(format!("{} {}", method, url));
            let submitted = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|body| body["simulations"].as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(|job| job["id"].as_str().map(str::to_string))
                .collect::<Vec<_>>();
            let parts = url.trim_start_matches("/api/").split('/').collect::<Vec<_>>();
            let mut jobs = jobs.lock().expect("ledger");
            let mut register = |exp: &str, jobs: &mut BTreeMap<String, BTreeMap<String, String>>| {
                let entry = jobs.entry(exp.to_string()).or_default();
                let mut assigned = BTreeMap::new();
                for local in &submitted {
                    next_id += 1;
                    let remote = format!("r-{}", next_id);
                    entry.insert(local.clone(), remote.clone());
                    assigned.insert(local.clone(), remote);
                }
                assigned
            };
            let (code, body) = match (method.as_str(), parts.as_slice()) {
                ("POST", ["experiments", exp, "commission"]) => {
                    let known = jobs.get(*exp).cloned();
                    if let Some(known) = known {
                        (409, json!({"simulations": known}))
                    } else {
                        let assigned = register(exp, &mut jobs);
                        if lose_reply.swap(false, Ordering::SeqCst) {
                            (504, json!({"error": "gateway timeout"}))
                        } else {
                            (200, json!({"simulations": assigned}))
                        }
                    }
                }
                ("POST", ["experiments", exp, "simulations"]) => {
                    (200, json!({"simulations": register(exp, &mut jobs)}))
                }
                ("GET", ["experiments", exp, "simulations"]) => {
                    let states = jobs
                        .get(*exp)
                        .map(|m| {
                            m.values()
                                .map(|id| json!({"id": id, "state": "Succeeded"}))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    (200, json!({"simulations": states}))
                }
                _ => (404, json!({"error": "not found"})),
            };
            drop(jobs);
            let header =
                Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("header");
            let _ = request.respond(
                Response::from_string(body.to_string())
                    .with_status_code(code)
                    .with_header(header),
            );
        }
    });
    (format!("http://{}", addr), ledger, seen)
}

fn tick_until_finished(overseer: &mut Overseer, exp_id: &str) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let summary = overseer.tick().expect("tick");
        if summary.finished.iter().any(|id| id == exp_id) {
            return;
        }
        assert!(Instant::now() < deadline, "remote experiment never finished");
        thread::sleep(Duration::from_millis(100));
    }
}

fn remote_services(root: &std::path::Path, endpoint: &str) -> Services {
    remote_services_with(root, endpoint, |_| {})
}

fn remote_services_with(
    root: &std::path::Path,
    endpoint: &str,
    adjust: impl FnOnce(&mut Settings),
) -> Services {
    let mut settings = Settings::local(root);
    settings.block = "HPC".to_string();
    settings.location = Location::Remote;
    settings.endpoint = Some(endpoint.to_string());
    settings.request_timeout = Duration::from_secs(5);
    adjust(&mut settings);
    Services::open(settings).expect("services")
}

#[test]
fn remote_experiment_is_rekeyed_and_survives_an_outage() {
    let root = temp_root("outage");
    let (endpoint, seen) = start_cluster();
    let services = remote_services(&root, &endpoint);

    let mut manager = ExperimentManager::create(
        &services,
        NewExperiment {
            name: "remote".to_string(),
            command_line: "Eradication --config {config}".to_string(),
            ..NewExperiment::default()
        },
    )
    .expect("create");
    assert_eq!(manager.experiment().location, Location::Remote);
    let exp = manager.experiment().clone();
    assert_eq!(
        manager
            .create_and_commission(&Sweep::run_numbers(json!({}), 2))
            .expect("commission"),
        2
    );
    let ids = services
        .store
        .simulations(&exp.id)
        .expect("sims")
        .into_iter()
        .map(|s| (s.id, s.status))
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            ("r-1".to_string(), SimulationStatus::CommissionRequested),
            ("r-2".to_string(), SimulationStatus::CommissionRequested),
        ]
    );

    let mut overseer = Overseer::new(services.clone());
    overseer.tick().expect("first tick");
    let r1 = services.store.get_simulation("r-1").expect("get").expect("r-1");
    assert_eq!(r1.status, SimulationStatus::Running);
    assert_eq!(r1.message, "10 100");
    let r2 = services.store.get_simulation("r-2").expect("get").expect("r-2");
    assert_eq!(r2.status, SimulationStatus::CommissionRequested);

    // The 503 is "no update": nothing regresses and the tick itself succeeds.
    overseer.tick().expect("outage tick");
    assert_eq!(
        services.store.get_simulation("r-1").expect("get").expect("r-1").status,
        SimulationStatus::Running
    );

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let summary = overseer.tick().expect("tick");
        if summary.finished.contains(&exp.id) {
            break;
        }
        assert!(Instant::now() < deadline, "remote experiment never finished");
        thread::sleep(Duration::from_millis(200));
    }
    let r2 = services.store.get_simulation("r-2").expect("get").expect("r-2");
    assert_eq!(r2.status, SimulationStatus::Failed);
    assert_eq!(r2.message, "node crashed");
    assert!(services.store.get_simulation("r-9").expect("get").is_none());

    let polls = seen
        .lock()
        .expect("seen")
        .iter()
        .filter(|l| l.ends_with("/simulations"))
        .count();
    assert_eq!(polls, 3);

    let mut monitor = monitor_for(&services, exp.clone()).expect("monitor");
    let snap = monitor.query().expect("query");
    assert!(snap.is_done());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn failed_and_unlocated_simulations_are_reported_as_excluded() {
    let root = temp_root("excluded");
    let (endpoint, _seen) = start_cluster();
    let services = remote_services(&root, &endpoint);

    let mut manager = ExperimentManager::create(
        &services,
        NewExperiment {
            name: "excluded".to_string(),
            command_line: "Eradication --config {config}".to_string(),
            ..NewExperiment::default()
        },
    )
    .expect("create");
    let exp = manager.experiment().clone();
    manager
        .create_and_commission(&Sweep::run_numbers(json!({}), 2))
        .expect("commission");
    let mut overseer = Overseer::new(services.clone());
    tick_until_finished(&mut overseer, &exp.id);

    let report = analyze_experiments(
        &services,
        std::slice::from_ref(&exp),
        Some(&[AnalyzerBinding::new("stdout", 1, json!({}))]),
    )
    .expect("analysis");
    let excluded = report
        .excluded
        .iter()
        .map(|x| (x.sim_id.as_str(), x.reason.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        excluded,
        vec![
            ("r-2", "status Failed: node crashed"),
            ("r-1", "no output location"),
        ]
    );
    assert!(report.analyzers[0].contributing.is_empty());
    assert_eq!(report.failure_count(), 0);
    let warnings = report.warnings();
    assert!(warnings.iter().any(|w| w.contains("r-1") && w.contains("no output location")));
    assert!(warnings.iter().any(|w| w.contains("r-2") && w.contains("node crashed")));

    let saved: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(exp.exp_dir().join(ANALYSIS_DIR).join(REPORT_FILE)).expect("report"),
    )
    .expect("report json");
    assert_eq!(saved["report"]["excluded"].as_array().map(Vec::len), Some(2));
    assert_eq!(saved["report"]["excluded"][1]["sim_id"], json!("r-1"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn small_batches_are_added_to_the_submitted_experiment() {
    let root = temp_root("batches");
    let (endpoint, ledger, seen) = start_stateful_cluster(false);
    let services = remote_services_with(&root, &endpoint, |s| s.sims_per_batch = 1);

    let mut manager = ExperimentManager::create(
        &services,
        NewExperiment {
            name: "batched".to_string(),
            command_line: "Eradication --config {config}".to_string(),
            ..NewExperiment::default()
        },
    )
    .expect("create");
    let exp = manager.experiment().clone();
    assert_eq!(
        manager
            .create_and_commission(&Sweep::run_numbers(json!({}), 3))
            .expect("commission"),
        3
    );
    let rows = services
        .store
        .simulations(&exp.id)
        .expect("sims")
        .into_iter()
        .map(|s| (s.id, s.status))
        .collect::<Vec<_>>();
    assert_eq!(
        rows,
        vec![
            ("r-1".to_string(), SimulationStatus::CommissionRequested),
            ("r-2".to_string(), SimulationStatus::CommissionRequested),
            ("r-3".to_string(), SimulationStatus::CommissionRequested),
        ]
    );
    assert_eq!(
        *seen.lock().expect("seen"),
        vec![
            format!("POST /api/experiments/{}/commission", exp.id),
            format!("POST /api/experiments/{}/simulations", exp.id),
            format!("POST /api/experiments/{}/simulations", exp.id),
        ]
    );

    let mut overseer = Overseer::new(services.clone());
    tick_until_finished(&mut overseer, &exp.id);
    assert!(services.store.is_done(&exp.id).expect("done"));
    assert_eq!(ledger.lock().expect("ledger")[&exp.id].len(), 3);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn lost_commission_reply_is_recovered_from_the_conflict() {
    let root = temp_root("lost_reply");
    let (endpoint, ledger, seen) = start_stateful_cluster(true);
    let services = remote_services(&root, &endpoint);

    let mut manager = ExperimentManager::create(
        &services,
        NewExperiment {
            name: "retried".to_string(),
            command_line: "Eradication --config {config}".to_string(),
            ..NewExperiment::default()
        },
    )
    .expect("create");
    let exp = manager.experiment().clone();
    // The cluster accepts the jobs but the reply is lost.
    manager
        .create_and_commission(&Sweep::run_numbers(json!({}), 2))
        .expect("transient failure is not fatal");
    assert_eq!(
        services.store.pending_simulations(&exp.id).expect("pending").len(),
        2
    );

    let mut overseer = Overseer::new(services.clone());
    tick_until_finished(&mut overseer, &exp.id);
    let ids = services
        .store
        .simulations(&exp.id)
        .expect("sims")
        .into_iter()
        .map(|s| (s.id, s.status))
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            ("r-1".to_string(), SimulationStatus::Succeeded),
            ("r-2".to_string(), SimulationStatus::Succeeded),
        ]
    );
    // Nothing was submitted twice.
    assert_eq!(ledger.lock().expect("ledger")[&exp.id].len(), 2);
    assert!(!seen
        .lock()
        .expect("seen")
        .iter()
        .any(|l| l.ends_with(&format!("{}/simulations", exp.id)) && l.starts_with("POST")));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn local_only_settings_cannot_manage_remote_experiments() {
    let root = temp_root("config");
    let services = Services::open(Settings::local(&root)).expect("services");
    let exp = sim_core::Experiment {
        id: "e-remote".to_string(),
        name: "remote".to_string(),
        location: Location::Remote,
        block: "HPC".to_string(),
        working_directory: root.clone(),
        sim_root: root.join("simulations"),
        revision: None,
        command_line: "run".to_string(),
        suite_id: None,
        created_at: Utc::now(),
        analyzers: Vec::new(),
    };
    let err = ExperimentManager::new(&services, exp).err().expect("config error");
    let typed = err.downcast_ref::<sim_core::Error>().expect("typed error");
    assert_eq!(typed.exit_code(), 5);
    let _ = fs::remove_dir_all(root);
}
