use crate::{CancelTarget, CommissionReport, ExecutionBackend};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sim_core::{
    Backoff, Error, Experiment, Location, Result, Settings, Simulation, SimulationStatus,
    StatusUpdate,
};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const LOCATION: &str = "remote";

#[derive(Debug, Default, Deserialize)]
struct CommissionResponse {
    #[serde(default)]
    simulations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RemoteSimulation {
    id: String,
    state: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimulationList {
    #[serde(default)]
    simulations: Vec<RemoteSimulation>,
}

/// Submits experiments to a cluster REST API and polls job states.
///
/// Every request is bounded by the client timeout. A transient failure arms
/// the backoff window; until it elapses, status and commission calls report
/// nothing without touching the network.
pub struct RemoteBackend {
    client: Client,
    endpoint: String,
    token: Option<String>,
    environment: Option<String>,
    backoff: Backoff,
    directories: Option<BTreeMap<String, PathBuf>>,
    submitted: HashSet<String>,
}

impl RemoteBackend {
    pub fn new(settings: &Settings, client: Client) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("remote block '{}' requires an endpoint", settings.block))
            })?
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            endpoint,
            token: settings.token(),
            environment: settings.environment.clone(),
            backoff: Backoff::default(),
            directories: None,
            submitted: HashSet::new(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.endpoint, path)
    }

    /// Sends one request. `tolerated` statuses are returned to the caller
    /// instead of being turned into errors.
    fn send(&mut self, req: RequestBuilder, what: &str, tolerated: &[StatusCode]) -> Result<Response> {
        let req = match self.token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        match req.send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || tolerated.contains(&status) {
                    self.backoff.succeed();
                    return Ok(resp);
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    let delay = self.backoff.fail();
                    warn!(what, %status, ?delay, "cluster API unavailable, backing off");
                    Err(Error::transient(LOCATION, format!("{}: HTTP {}", what, status)))
                } else {
                    Err(Error::backend(LOCATION, format!("{}: HTTP {}", what, status)))
                }
            }
            Err(e) => {
                let delay = self.backoff.fail();
                warn!(what, error = %e, ?delay, "cluster API request failed, backing off");
                Err(Error::transient(LOCATION, format!("{}: {}", what, e)))
            }
        }
    }

    fn read_json<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
        resp.json::<T>()
            .map_err(|e| Error::backend(LOCATION, format!("{}: malformed response: {}", what, e)))
    }

    fn job_payload(batch: &[&Simulation]) -> Vec<serde_json::Value> {
        batch
            .iter()
            .map(|s| json!({"id": s.id, "tags": s.tags, "config": s.config}))
            .collect()
    }

    /// Submits the batch and returns local id -> backend id.
    ///
    /// The first batch creates the experiment on the cluster. A 409 means the
    /// cluster already holds it (a retried submission, or a batch from an
    /// earlier process): ids it reports for this batch are taken as-is and
    /// the rest are added to the existing experiment.
    fn submit(&mut self, exp: &Experiment, batch: &[&Simulation]) -> Result<BTreeMap<String, String>> {
        if self.submitted.contains(&exp.id) {
            return self.add_simulations(exp, batch);
        }
        let body = json!({
            "name": exp.name,
            "suite_id": exp.suite_id,
            "command_line": exp.command_line,
            "working_directory": exp.exp_dir(),
            "environment": self.environment,
            "simulations": Self::job_payload(batch),
        });
        let req = self
            .client
            .post(self.url(&format!("experiments/{}/commission", exp.id)))
            .json(&body);
        let resp = self.send(req, "commission", &[StatusCode::CONFLICT])?;
        let conflict = resp.status() == StatusCode::CONFLICT;
        let mut assigned = if conflict {
            // The body may be empty; only the mapping matters.
            resp.json::<CommissionResponse>().unwrap_or_default().simulations
        } else {
            Self::read_json::<CommissionResponse>(resp, "commission")?.simulations
        };
        self.submitted.insert(exp.id.clone());
        if !conflict {
            return Ok(assigned);
        }
        let missing = batch
            .iter()
            .filter(|s| !assigned.contains_key(&s.id))
            .copied()
            .collect::<Vec<_>>();
        info!(
            experiment = %exp.id,
            known = batch.len() - missing.len(),
            added = missing.len(),
            "experiment already on cluster"
        );
        if !missing.is_empty() {
            assigned.extend(self.add_simulations(exp, &missing)?);
        }
        Ok(assigned)
    }

    fn add_simulations(&mut self, exp: &Experiment, batch: &[&Simulation]) -> Result<BTreeMap<String, String>> {
        let req = self
            .client
            .post(self.url(&format!("experiments/{}/simulations", exp.id)))
            .json(&json!({"simulations": Self::job_payload(batch)}));
        let resp = self.send(req, "add simulations", &[])?;
        Ok(Self::read_json::<CommissionResponse>(resp, "add simulations")?.simulations)
    }

    fn fetch_directories(&mut self, exp: &Experiment) -> Result<BTreeMap<String, PathBuf>> {
        let req = self
            .client
            .get(self.url(&format!("experiments/{}/directories", exp.id)));
        let resp = self.send(req, "directories", &[])?;
        let raw: BTreeMap<String, String> = Self::read_json(resp, "directories")?;
        Ok(raw.into_iter().map(|(id, p)| (id, PathBuf::from(p))).collect())
    }
}

impl ExecutionBackend for RemoteBackend {
    fn location(&self) -> Location {
        Location::Remote
    }

    fn commission(&mut self, exp: &Experiment, pending: &[Simulation]) -> Result<CommissionReport> {
        let batch = pending
            .iter()
            .filter(|s| s.status.is_pending())
            .collect::<Vec<_>>();
        if batch.is_empty() {
            return Ok(CommissionReport::default());
        }
        if self.backoff.is_waiting() {
            debug!(experiment = %exp.id, "commission deferred during backoff");
            return Ok(CommissionReport::default());
        }
        let assigned = self.submit(exp, &batch)?;
        let mut report = CommissionReport::default();
        for sim in &batch {
            let remote_id = assigned.get(&sim.id).cloned().unwrap_or_else(|| sim.id.clone());
            if remote_id != sim.id {
                report.assigned_ids.insert(sim.id.clone(), remote_id.clone());
            }
            report.updates.push(StatusUpdate::new(
                remote_id,
                SimulationStatus::CommissionRequested,
                "",
            ));
        }
        report.started = batch.len();
        info!(experiment = %exp.id, count = report.started, "simulations submitted to cluster");
        Ok(report)
    }

    fn status(&mut self, exp: &Experiment, sims: &[Simulation]) -> Result<Option<Vec<StatusUpdate>>> {
        if self.backoff.is_waiting() {
            return Ok(None);
        }
        let path = match exp.suite_id.as_deref() {
            Some(suite) => format!("suites/{}/simulations", suite),
            None => format!("experiments/{}/simulations", exp.id),
        };
        let req = self.client.get(self.url(&path));
        let resp = self.send(req, "status", &[])?;
        let list: SimulationList = Self::read_json(resp, "status")?;
        let known = sims.iter().map(|s| s.id.as_str()).collect::<HashSet<_>>();
        let mut updates = Vec::new();
        for remote in list.simulations {
            if !known.contains(remote.id.as_str()) {
                continue;
            }
            match SimulationStatus::parse_wire(&remote.state) {
                Some(status) => updates.push(StatusUpdate::new(
                    remote.id,
                    status,
                    remote.message.unwrap_or_default(),
                )),
                None => warn!(sim = %remote.id, state = %remote.state, "unknown remote state skipped"),
            }
        }
        Ok(Some(updates))
    }

    fn cancel(&mut self, exp: &Experiment, sims: &[Simulation], target: &CancelTarget) -> Result<()> {
        match target {
            CancelTarget::All => {
                let req = self
                    .client
                    .post(self.url(&format!("experiments/{}/cancel", exp.id)));
                self.send(req, "cancel experiment", &[])?;
            }
            CancelTarget::Ids(ids) => {
                let mut failed = Vec::new();
                let mut transient = true;
                for sim in sims.iter().filter(|s| ids.contains(&s.id)) {
                    if sim.status.is_terminal() {
                        continue;
                    }
                    let req = self
                        .client
                        .post(self.url(&format!("simulations/{}/cancel", sim.id)));
                    if let Err(e) = self.send(req, "cancel simulation", &[]) {
                        transient &= e.is_transient();
                        failed.push(format!("{} ({})", sim.id, e));
                    }
                }
                if !failed.is_empty() {
                    let message = format!("cancel failed for {}", failed.join(", "));
                    return Err(if transient {
                        Error::transient(LOCATION, message)
                    } else {
                        Error::backend(LOCATION, message)
                    });
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, exp: &Experiment, hard: bool) -> Result<()> {
        if !hard {
            return Ok(());
        }
        let req = self.client.delete(self.url(&format!("experiments/{}", exp.id)));
        let resp = self.send(req, "delete", &[StatusCode::NOT_FOUND])?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(experiment = %exp.id, "experiment already absent on cluster");
        } else {
            info!(experiment = %exp.id, "experiment deleted on cluster");
        }
        Ok(())
    }

    fn output_locations(
        &mut self,
        exp: &Experiment,
        sims: &[Simulation],
    ) -> Result<BTreeMap<String, PathBuf>> {
        let directories = match self.directories.take() {
            Some(dirs) => dirs,
            None => self.fetch_directories(exp)?,
        };
        let out = sims
            .iter()
            .filter_map(|s| directories.get(&s.id).map(|p| (s.id.clone(), p.clone())))
            .collect();
        self.directories = Some(directories);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sim_core::Tags;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tiny_http::{Header, Response as HttpResponse, Server};

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        url: String,
        auth: Option<String>,
        body: String,
    }

    type Handler = Box<dyn Fn(&str, &str) -> (u16, String) + Send>;

    fn mock_cluster(handler: Handler) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let server = Server::http("127.0.0.1:0").expect("bind mock cluster");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let method = request.method().to_string();
                let url = request.url().to_string();
                let auth = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.to_string());
                log.lock().expect("log").push(Seen {
                    method: method.clone(),
                    url: url.clone(),
                    auth,
                    body,
                });
                let (code, payload) = handler(&method, &url);
                let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                    .expect("header");
                let _ = request.respond(
                    HttpResponse::from_string(payload)
                        .with_status_code(code)
                        .with_header(header),
                );
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn backend(endpoint: &str, token_env: Option<&str>) -> RemoteBackend {
        let mut settings = Settings::local(&std::env::temp_dir());
        settings.location = Location::Remote;
        settings.endpoint = Some(endpoint.to_string());
        settings.token_env = token_env.map(str::to_string);
        settings.environment = Some("Belegost".to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");
        RemoteBackend::new(&settings, client).expect("remote backend")
    }

    fn experiment(suite: Option<&str>) -> Experiment {
        Experiment {
            id: "e1".into(),
            name: "remote".into(),
            location: Location::Remote,
            block: "HPC".into(),
            working_directory: PathBuf::from("/work"),
            sim_root: PathBuf::from("/cluster/sims"),
            revision: None,
            command_line: "Eradication -C {config}".into(),
            suite_id: suite.map(str::to_string),
            created_at: Utc::now(),
            analyzers: vec![],
        }
    }

    fn sim(id: &str, status: SimulationStatus) -> Simulation {
        Simulation {
            id: id.into(),
            experiment_id: "e1".into(),
            seq: 1,
            status,
            message: String::new(),
            tags: Tags::new(),
            config: serde_json::json!({}),
            pid: None,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn commission_submits_pending_and_maps_backend_ids() {
        std::env::set_var("SIMTOOLS_TEST_TOKEN_COMMISSION", "s3cret");
        let (endpoint, seen) = mock_cluster(Box::new(|_, _| {
            (200, r#"{"simulations":{"e1.1":"r-1","e1.2":"r-2"}}"#.to_string())
        }));
        let mut remote = backend(&endpoint, Some("SIMTOOLS_TEST_TOKEN_COMMISSION"));
        let exp = experiment(None);
        let pending = vec![
            sim("e1.1", SimulationStatus::Created),
            sim("e1.2", SimulationStatus::Created),
            sim("e1.3", SimulationStatus::Running),
        ];
        let report = remote.commission(&exp, &pending).expect("commission");
        assert_eq!(report.started, 2);
        assert_eq!(report.assigned_ids.get("e1.1").map(String::as_str), Some("r-1"));
        assert_eq!(report.updates[1].sim_id, "r-2");
        assert_eq!(report.updates[1].status, SimulationStatus::CommissionRequested);

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "/api/experiments/e1/commission");
        assert_eq!(seen[0].auth.as_deref(), Some("Bearer s3cret"));
        let body: serde_json::Value = serde_json::from_str(&seen[0].body).expect("json body");
        assert_eq!(body["environment"], "Belegost");
        assert_eq!(body["simulations"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn conflict_keeps_known_ids_and_adds_the_rest() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, url| {
            if url.ends_with("/commission") {
                (409, r#"{"simulations":{"e1.1":"r-1"}}"#.to_string())
            } else {
                (200, r#"{"simulations":{"e1.2":"r-2"}}"#.to_string())
            }
        }));
        let mut remote = backend(&endpoint, None);
        let report = remote
            .commission(
                &experiment(None),
                &[sim("e1.1", SimulationStatus::Created), sim("e1.2", SimulationStatus::Created)],
            )
            .expect("conflict is not an error");
        assert_eq!(report.started, 2);
        assert_eq!(report.assigned_ids.get("e1.1").map(String::as_str), Some("r-1"));
        assert_eq!(report.assigned_ids.get("e1.2").map(String::as_str), Some("r-2"));

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].url, "/api/experiments/e1/simulations");
        let body: serde_json::Value = serde_json::from_str(&seen[1].body).expect("json body");
        assert_eq!(body["simulations"][0]["id"], "e1.2");
        assert_eq!(body["simulations"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn later_batches_are_added_to_the_submitted_experiment() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, url| {
            if url.ends_with("/commission") {
                (200, r#"{"simulations":{"e1.1":"r-1"}}"#.to_string())
            } else {
                (200, r#"{"simulations":{"e1.2":"r-2"}}"#.to_string())
            }
        }));
        let mut remote = backend(&endpoint, None);
        let exp = experiment(None);
        remote
            .commission(&exp, &[sim("e1.1", SimulationStatus::Created)])
            .expect("first batch");
        let second = remote
            .commission(&exp, &[sim("e1.2", SimulationStatus::Created)])
            .expect("second batch");
        assert_eq!(second.assigned_ids.get("e1.2").map(String::as_str), Some("r-2"));
        let urls = seen
            .lock()
            .expect("seen")
            .iter()
            .map(|s| s.url.clone())
            .collect::<Vec<_>>();
        assert_eq!(urls, vec!["/api/experiments/e1/commission", "/api/experiments/e1/simulations"]);
    }

    #[test]
    fn status_maps_vocabulary_and_skips_unknown_states() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, _| {
            (
                200,
                r#"{"simulations":[
                    {"id":"r-1","state":"Running","message":"10 100"},
                    {"id":"r-2","state":"Waiting"},
                    {"id":"r-3","state":"Exploded"},
                    {"id":"other-suite-sim","state":"Failed"}
                ]}"#
                .to_string(),
            )
        }));
        let mut remote = backend(&endpoint, None);
        let sims = vec![
            sim("r-1", SimulationStatus::Commissioned),
            sim("r-2", SimulationStatus::CommissionRequested),
            sim("r-3", SimulationStatus::Running),
        ];
        let updates = remote
            .status(&experiment(Some("suite-9")), &sims)
            .expect("status")
            .expect("updates");
        assert_eq!(
            updates,
            vec![
                StatusUpdate::new("r-1", SimulationStatus::Running, "10 100"),
                StatusUpdate::new("r-2", SimulationStatus::Created, ""),
            ]
        );
        assert_eq!(seen.lock().expect("seen")[0].url, "/api/suites/suite-9/simulations");
    }

    #[test]
    fn transient_failure_arms_backoff_and_suppresses_requests() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, _| (503, "{}".to_string())));
        let mut remote = backend(&endpoint, None).with_backoff(Backoff::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let exp = experiment(None);
        let sims = vec![sim("e1.1", SimulationStatus::Running)];
        let err = remote.status(&exp, &sims).expect_err("503");
        assert!(err.is_transient());
        assert!(remote.status(&exp, &sims).expect("suppressed").is_none());
        let report = remote
            .commission(&exp, &[sim("e1.2", SimulationStatus::Created)])
            .expect("deferred");
        assert_eq!(report.started, 0);
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[test]
    fn unreachable_cluster_is_transient() {
        let mut remote = backend("http://127.0.0.1:9", None);
        let err = remote
            .status(&experiment(None), &[sim("e1.1", SimulationStatus::Running)])
            .expect_err("connection refused");
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let (endpoint, _) = mock_cluster(Box::new(|_, _| (401, "{}".to_string())));
        let mut remote = backend(&endpoint, None);
        let err = remote
            .status(&experiment(None), &[sim("e1.1", SimulationStatus::Running)])
            .expect_err("401");
        assert!(!err.is_transient());
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn cancel_and_delete_hit_their_endpoints() {
        let (endpoint, seen) = mock_cluster(Box::new(|method, _| {
            if method == "DELETE" {
                (404, "{}".to_string())
            } else {
                (200, "{}".to_string())
            }
        }));
        let mut remote = backend(&endpoint, None);
        let exp = experiment(None);
        let sims = vec![
            sim("r-1", SimulationStatus::Running),
            sim("r-2", SimulationStatus::Succeeded),
        ];
        remote
            .cancel(&exp, &sims, &CancelTarget::Ids(vec!["r-1".into(), "r-2".into()]))
            .expect("cancel ids");
        remote.cancel(&exp, &sims, &CancelTarget::All).expect("cancel all");
        remote.delete(&exp, false).expect("soft delete is local only");
        remote.delete(&exp, true).expect("404 on delete is fine");
        let urls = seen
            .lock()
            .expect("seen")
            .iter()
            .map(|s| format!("{} {}", s.method, s.url))
            .collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                "POST /api/simulations/r-1/cancel",
                "POST /api/experiments/e1/cancel",
                "DELETE /api/experiments/e1",
            ]
        );
    }

    #[test]
    fn cancel_attempts_every_id_before_reporting() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, url| {
            if url.contains("r-1") {
                (500, "{}".to_string())
            } else {
                (200, "{}".to_string())
            }
        }));
        let mut remote = backend(&endpoint, None);
        let sims = vec![
            sim("r-1", SimulationStatus::Running),
            sim("r-2", SimulationStatus::Running),
        ];
        let err = remote
            .cancel(
                &experiment(None),
                &sims,
                &CancelTarget::Ids(vec!["r-1".into(), "r-2".into()]),
            )
            .expect_err("r-1 failed");
        assert!(err.is_transient());
        assert!(err.to_string().contains("r-1"));
        assert_eq!(seen.lock().expect("seen").len(), 2);
    }

    #[test]
    fn directory_map_is_fetched_once() {
        let (endpoint, seen) = mock_cluster(Box::new(|_, _| {
            (200, r#"{"r-1":"/cluster/out/r-1","r-2":"/cluster/out/r-2"}"#.to_string())
        }));
        let mut remote = backend(&endpoint, None);
        let exp = experiment(None);
        let sims = vec![
            sim("r-1", SimulationStatus::Succeeded),
            sim("r-9", SimulationStatus::Succeeded),
        ];
        let first = remote.output_locations(&exp, &sims).expect("locations");
        let second = remote.output_locations(&exp, &sims).expect("cached");
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first["r-1"], PathBuf::from("/cluster/out/r-1"));
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }
}
