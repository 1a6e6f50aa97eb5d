use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const COORDINATOR_PORT: u16 = 12246;
pub const BACKUP_PORT: u16 = 12243;
pub const OLD_MASTER_PORT: u16 = 12242;
pub const NEW_MASTER_PORT: u16 = 12247;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to invoke `{command}` on {host}: {source}")]
    Spawn {
        host: String,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` on {host} exited with status {status}")]
    NonZero {
        host: String,
        command: String,
        status: i32,
    },
}

#[derive(Debug, Error)]
pub enum TrialError {
    #[error("invalid trial configuration: {0}")]
    Configuration(String),
    #[error("{name} exited unexpectedly with status {status}")]
    FleetProcess {
        name: String,
        status: i32,
        output: String,
    },
    #[error("readiness barrier failed waiting for {expected} registrants: {reason}")]
    Barrier { expected: usize, reason: String },
    #[error("recovery did not finish within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("could not read recovery metrics: {0}")]
    Metrics(String),
    #[error("process launch failed: {0}")]
    Launch(#[from] ExecError),
    #[error("run artifact I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TrialError {
    /// Transient errors spoil one attempt but leave the next one likely to
    /// succeed; the retry driver restarts on these and propagates the rest.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrialError::FleetProcess { .. }
                | TrialError::Barrier { .. }
                | TrialError::Timeout { .. }
                | TrialError::Metrics(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct HostPool {
    hosts: Vec<HostRecord>,
}

impl HostPool {
    pub fn new(hosts: Vec<HostRecord>) -> Result<Self, TrialError> {
        if hosts.is_empty() {
            return Err(TrialError::Configuration(
                "host pool must contain at least one host".to_string(),
            ));
        }
        Ok(HostPool { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Backup,
    OldMaster,
    NewMaster,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Backup => "backup",
            Role::OldMaster => "old-master",
            Role::NewMaster => "new-master",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn locator(address: &str, port: u16) -> String {
    format!("infrc:host={},port={}", address, port)
}

#[derive(Debug, Clone)]
pub struct RoleAssignment {
    pub coordinator: HostRecord,
    pub coordinator_locator: String,
    pub backups: Vec<(HostRecord, String)>,
    pub old_master: (HostRecord, String),
    pub new_masters: Vec<(HostRecord, String)>,
    pub client: HostRecord,
}

/// Assigns hosts and locators to cluster roles. The coordinator always takes
/// pool[0]; backups and recovery masters each take the first K hosts of the
/// pool rotated so the coordinator's host comes last. Small trials therefore
/// prefer distinct hosts and only wrap onto pool[0] when the requested counts
/// approach the pool size.
pub fn plan_topology(
    pool: &HostPool,
    num_backups: usize,
    num_partitions: usize,
) -> Result<RoleAssignment, TrialError> {
    if num_backups > pool.len() {
        return Err(TrialError::Configuration(format!(
            "{} backups requested but only {} hosts available",
            num_backups,
            pool.len()
        )));
    }
    if num_partitions > pool.len() {
        return Err(TrialError::Configuration(format!(
            "{} recovery masters requested but only {} hosts available",
            num_partitions,
            pool.len()
        )));
    }

    let hosts = pool.hosts();
    let coordinator = hosts[0].clone();
    let coordinator_locator = locator(&coordinator.address, COORDINATOR_PORT);

    let rotated: Vec<&HostRecord> = hosts[1..].iter().chain(hosts.first()).collect();
    let backups = rotated
        .iter()
        .take(num_backups)
        .map(|h| ((*h).clone(), locator(&h.address, BACKUP_PORT)))
        .collect();
    let new_masters = rotated
        .iter()
        .take(num_partitions)
        .map(|h| ((*h).clone(), locator(&h.address, NEW_MASTER_PORT)))
        .collect();
    let old_master = (
        coordinator.clone(),
        locator(&coordinator.address, OLD_MASTER_PORT),
    );

    Ok(RoleAssignment {
        client: coordinator.clone(),
        coordinator,
        coordinator_locator,
        backups,
        old_master,
        new_masters,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialParams {
    pub num_backups: usize,
    pub num_partitions: usize,
    pub object_size: u64,
    pub num_objects: u64,
    pub replicas: u32,
    /// Backup storage device for on-disk mode; in-memory storage when unset.
    pub disk: Option<String>,
    pub timeout_secs: u64,
    pub coordinator_args: String,
    pub backup_args: String,
    pub old_master_args: String,
    pub new_master_args: String,
    pub client_args: String,
}

impl Default for TrialParams {
    fn default() -> Self {
        TrialParams {
            num_backups: 1,
            num_partitions: 1,
            object_size: 1024,
            num_objects: 626012,
            replicas: 1,
            disk: None,
            timeout_secs: 60,
            coordinator_args: String::new(),
            backup_args: String::new(),
            old_master_args: "-m 2048".to_string(),
            new_master_args: "-m 2048".to_string(),
            client_args: String::new(),
        }
    }
}

impl TrialParams {
    fn validate(&self) -> Result<(), TrialError> {
        if self.num_backups == 0 {
            return Err(TrialError::Configuration(
                "at least one backup is required".to_string(),
            ));
        }
        if self.num_partitions == 0 {
            return Err(TrialError::Configuration(
                "at least one recovery partition is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Paths of the externally built cluster binaries.
#[derive(Debug, Clone)]
pub struct ClusterBinaries {
    pub coordinator: PathBuf,
    pub backup: PathBuf,
    pub server: PathBuf,
    pub client: PathBuf,
    pub ensure_hosts: PathBuf,
}

impl ClusterBinaries {
    pub fn from_build_dir(build_dir: &Path) -> Self {
        ClusterBinaries {
            coordinator: build_dir.join("coordinator"),
            backup: build_dir.join("backup"),
            server: build_dir.join("server"),
            client: build_dir.join("client"),
            ensure_hosts: build_dir.join("ensureHosts"),
        }
    }
}

/// Handle to one remote background invocation. The exit status updates
/// asynchronously as the remote process runs.
pub trait RemoteProcess {
    /// Exit code once the process has finished, `None` while it is still
    /// running. Deaths without an exit code report as -1.
    fn try_wait(&mut self) -> Option<i32>;
    /// Best-effort termination; never fails, never blocks indefinitely.
    fn terminate(&mut self);
    /// Tail of the captured output, for failure diagnostics.
    fn captured_output(&mut self) -> String;
}

/// The remote execution primitive: run a command on a host, either in the
/// background with output captured to a log file, or in the foreground
/// blocking until exit.
pub trait RemoteExec {
    fn spawn(
        &self,
        host: &HostRecord,
        command: &str,
        log_path: &Path,
    ) -> Result<Box<dyn RemoteProcess>, ExecError>;

    fn run(&self, host: &HostRecord, command: &str) -> Result<(), ExecError>;
}

/// Production executor shelling out over ssh. Background launches redirect
/// stdout and stderr into the per-process log file; termination kills the
/// local ssh supervisor.
pub struct SshExecutor;

impl RemoteExec for SshExecutor {
    fn spawn(
        &self,
        host: &HostRecord,
        command: &str,
        log_path: &Path,
    ) -> Result<Box<dyn RemoteProcess>, ExecError> {
        let spawn_err = |source| ExecError::Spawn {
            host: host.name.clone(),
            command: command.to_string(),
            source,
        };
        let log = fs::File::create(log_path).map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;
        let child = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&host.name)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(spawn_err)?;
        Ok(Box::new(SshProcess {
            child,
            log_path: log_path.to_path_buf(),
        }))
    }

    fn run(&self, host: &HostRecord, command: &str) -> Result<(), ExecError> {
        let status = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&host.name)
            .arg(command)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| ExecError::Spawn {
                host: host.name.clone(),
                command: command.to_string(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::NonZero {
                host: host.name.clone(),
                command: command.to_string(),
                status: status.code().unwrap_or(-1),
            })
        }
    }
}

struct SshProcess {
    child: Child,
    log_path: PathBuf,
}

impl RemoteProcess for SshProcess {
    fn try_wait(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            // A poll error leaves the status unknown; report it next time.
            Ok(None) | Err(_) => None,
        }
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn captured_output(&mut self) -> String {
        read_log_tail(&self.log_path).unwrap_or_default()
    }
}

fn read_log_tail(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let skip = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    Ok(String::from_utf8_lossy(&bytes[skip..]).into_owned())
}

/// One trial attempt's artifact directory: a timestamp-named directory under
/// the runs root holding one log file per launched process, with a `latest`
/// link always pointing at the most recent attempt.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub dir: PathBuf,
}

impl RunContext {
    pub fn create(runs_root: &Path) -> Result<Self, TrialError> {
        fs::create_dir_all(runs_root)?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut run_id = stamp.clone();
        let mut attempt = 1u32;
        let dir = loop {
            let candidate = runs_root.join(&run_id);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    run_id = format!("{}-{}", stamp, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        };
        update_latest_link(runs_root, &run_id)?;
        Ok(RunContext { run_id, dir })
    }

    pub fn log_path(&self, role: Role, host: &HostRecord) -> PathBuf {
        self.dir.join(format!("{}.{}.log", role, host.name))
    }
}

#[cfg(unix)]
fn update_latest_link(runs_root: &Path, run_id: &str) -> io::Result<()> {
    let staged = runs_root.join(format!(".latest.{}", std::process::id()));
    let _ = fs::remove_file(&staged);
    symlink(run_id, &staged)?;
    fs::rename(&staged, runs_root.join("latest"))
}

#[cfg(not(unix))]
fn update_latest_link(_runs_root: &Path, _run_id: &str) -> io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessId(usize);

struct Managed {
    name: String,
    process: Box<dyn RemoteProcess>,
    status: Option<i32>,
    reported: bool,
}

/// Owns every background process launched during one trial attempt. Dropping
/// the sandbox terminates whatever is still running, on success and failure
/// alike; the orchestrator never touches process handles directly.
pub struct Sandbox<'a> {
    exec: &'a dyn RemoteExec,
    procs: Vec<Managed>,
}

impl<'a> Sandbox<'a> {
    pub fn new(exec: &'a dyn RemoteExec) -> Self {
        Sandbox {
            exec,
            procs: Vec::new(),
        }
    }

    pub fn launch(
        &mut self,
        role: Role,
        host: &HostRecord,
        command: &str,
        log_path: &Path,
    ) -> Result<ProcessId, TrialError> {
        let process = self.exec.spawn(host, command, log_path)?;
        self.procs.push(Managed {
            name: format!("{} on {}", role, host.name),
            process,
            status: None,
            reported: false,
        });
        Ok(ProcessId(self.procs.len() - 1))
    }

    pub fn run_on(&self, host: &HostRecord, command: &str) -> Result<(), ExecError> {
        self.exec.run(host, command)
    }

    pub fn poll(&mut self, id: ProcessId) -> Option<i32> {
        let managed = &mut self.procs[id.0];
        if managed.status.is_none() {
            managed.status = managed.process.try_wait();
        }
        managed.status
    }

    /// Fails with the identity and captured output of the first launched
    /// process found to have exited abnormally. Each failure is reported at
    /// most once.
    pub fn check_failures(&mut self) -> Result<(), TrialError> {
        for managed in &mut self.procs {
            if managed.status.is_none() {
                managed.status = managed.process.try_wait();
            }
            if let Some(status) = managed.status {
                if status != 0 && !managed.reported {
                    managed.reported = true;
                    return Err(TrialError::FleetProcess {
                        name: managed.name.clone(),
                        status,
                        output: managed.process.captured_output(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for Sandbox<'_> {
    fn drop(&mut self) {
        let leftover = self.procs.iter().filter(|m| m.status.is_none()).count();
        if leftover > 0 {
            debug!(leftover, "terminating remaining cluster processes");
        }
        for managed in &mut self.procs {
            if managed.status.is_none() {
                managed.process.terminate();
            }
        }
    }
}

/// Blocks until the coordinator reports exactly `expected` registered
/// participants, by running the readiness query on the client host. A dead
/// fleet process is a more actionable diagnosis than a failed query, so the
/// sandbox failure state is checked before the query and again as soon as
/// the query itself fails.
fn await_registration(
    sandbox: &mut Sandbox<'_>,
    binaries: &ClusterBinaries,
    client: &HostRecord,
    coordinator_locator: &str,
    expected: usize,
) -> Result<(), TrialError> {
    sandbox.check_failures()?;
    let command = format!(
        "{} -C {} -n {} -l 1",
        binaries.ensure_hosts.display(),
        coordinator_locator,
        expected
    );
    if let Err(err) = sandbox.run_on(client, &command) {
        sandbox.check_failures()?;
        return Err(TrialError::Barrier {
            expected,
            reason: err.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetrics {
    #[serde(rename = "recoveryNs")]
    pub recovery_ns: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub client: ClientMetrics,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Reader for the performance metrics recorded into the run directory by the
/// cluster binaries.
pub trait MetricsReader {
    fn parse_recovery(&self, run_dir: &Path) -> Result<RecoveryMetrics, TrialError>;
}

/// Reads `metrics.json` as written into the run directory by the external
/// metrics tooling.
pub struct JsonMetricsReader;

impl MetricsReader for JsonMetricsReader {
    fn parse_recovery(&self, run_dir: &Path) -> Result<RecoveryMetrics, TrialError> {
        let path = run_dir.join("metrics.json");
        let bytes = fs::read(&path)
            .map_err(|e| TrialError::Metrics(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TrialError::Metrics(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub object_count: u64,
    pub object_size: u64,
    pub recovery_ns: u64,
    pub elapsed: Duration,
    pub metrics: RecoveryMetrics,
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let staged = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&staged)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&staged, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn write_trial_result(result: &TrialResult) -> Result<(), TrialError> {
    let bytes = serde_json::to_vec_pretty(result).map_err(io::Error::other)?;
    atomic_write_bytes(&result.run_dir.join("trial_result.json"), &bytes)?;
    Ok(())
}

/// Runs one complete recovery trial: brings the cluster up phase by phase
/// with a readiness barrier between phases, launches the client workload,
/// polls it to completion against the timeout while watching the fleet for
/// crashes, and assembles the result from the recorded metrics. Every
/// launched process is owned by a sandbox that tears the fleet down on all
/// exit paths.
pub fn run_recovery(
    params: &TrialParams,
    pool: &HostPool,
    binaries: &ClusterBinaries,
    exec: &dyn RemoteExec,
    metrics: &dyn MetricsReader,
    ctx: &RunContext,
) -> Result<TrialResult, TrialError> {
    params.validate()?;
    let assignment = plan_topology(pool, params.num_backups, params.num_partitions)?;
    let mut sandbox = Sandbox::new(exec);

    sandbox.launch(
        Role::Coordinator,
        &assignment.coordinator,
        &format!(
            "{} -C {} {}",
            binaries.coordinator.display(),
            assignment.coordinator_locator,
            params.coordinator_args
        ),
        &ctx.log_path(Role::Coordinator, &assignment.coordinator),
    )?;
    await_registration(
        &mut sandbox,
        binaries,
        &assignment.client,
        &assignment.coordinator_locator,
        0,
    )?;

    let storage = match &params.disk {
        Some(device) => format!("-f {}", device),
        None => "-m".to_string(),
    };
    for (host, backup_locator) in &assignment.backups {
        sandbox.launch(
            Role::Backup,
            host,
            &format!(
                "{} {} -C {} -L {} {}",
                binaries.backup.display(),
                storage,
                assignment.coordinator_locator,
                backup_locator,
                params.backup_args
            ),
            &ctx.log_path(Role::Backup, host),
        )?;
    }
    await_registration(
        &mut sandbox,
        binaries,
        &assignment.client,
        &assignment.coordinator_locator,
        params.num_backups,
    )?;

    let (old_master_host, old_master_locator) = &assignment.old_master;
    sandbox.launch(
        Role::OldMaster,
        old_master_host,
        &format!(
            "{} -r {} -C {} -L {} {}",
            binaries.server.display(),
            params.replicas,
            assignment.coordinator_locator,
            old_master_locator,
            params.old_master_args
        ),
        &ctx.log_path(Role::OldMaster, old_master_host),
    )?;
    await_registration(
        &mut sandbox,
        binaries,
        &assignment.client,
        &assignment.coordinator_locator,
        params.num_backups + 1,
    )?;

    for (host, new_master_locator) in &assignment.new_masters {
        sandbox.launch(
            Role::NewMaster,
            host,
            &format!(
                "{} -r {} -C {} -L {} {}",
                binaries.server.display(),
                params.replicas,
                assignment.coordinator_locator,
                new_master_locator,
                params.new_master_args
            ),
            &ctx.log_path(Role::NewMaster, host),
        )?;
    }
    await_registration(
        &mut sandbox,
        binaries,
        &assignment.client,
        &assignment.coordinator_locator,
        params.num_backups + 1 + params.num_partitions,
    )?;

    let client = sandbox.launch(
        Role::Client,
        &assignment.client,
        &format!(
            "{} -d -C {} -n {} -s {} -t {} -k {} {}",
            binaries.client.display(),
            assignment.coordinator_locator,
            params.num_objects,
            params.object_size,
            params.num_partitions,
            params.num_partitions,
            params.client_args
        ),
        &ctx.log_path(Role::Client, &assignment.client),
    )?;

    let timeout = Duration::from_secs(params.timeout_secs);
    let start = Instant::now();
    loop {
        // A crashed backup or master is reported in preference to the
        // timeout, even once the deadline has passed.
        sandbox.check_failures()?;
        if sandbox.poll(client).is_some() {
            break;
        }
        if start.elapsed() > timeout {
            return Err(TrialError::Timeout { timeout });
        }
        thread::sleep(POLL_INTERVAL);
    }
    let elapsed = start.elapsed();

    let recovery = metrics.parse_recovery(&ctx.dir)?;
    let result = TrialResult {
        run_id: ctx.run_id.clone(),
        run_dir: ctx.dir.clone(),
        object_count: params.num_objects,
        object_size: params.object_size,
        recovery_ns: recovery.client.recovery_ns,
        elapsed,
        metrics: recovery,
    };
    write_trial_result(&result)?;
    Ok(result)
}

/// Repeats full trial attempts with identical parameters until one succeeds,
/// creating a fresh run context every time. Transient failures (a crashed
/// fleet process, a failed barrier, a timeout, unreadable metrics) log a
/// short diagnosis and restart; anything else propagates. `max_attempts`
/// bounds the loop; `None` retries indefinitely.
pub fn run_until_success(
    params: &TrialParams,
    pool: &HostPool,
    binaries: &ClusterBinaries,
    exec: &dyn RemoteExec,
    metrics: &dyn MetricsReader,
    runs_root: &Path,
    max_attempts: Option<u32>,
) -> Result<TrialResult, TrialError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let ctx = RunContext::create(runs_root)?;
        match run_recovery(params, pool, binaries, exec, metrics, &ctx) {
            Ok(result) => return Ok(result),
            Err(err) if err.is_transient() => {
                warn!(attempt, error = %err, "recovery attempt failed, trying again");
                if let Some(max) = max_attempts {
                    if attempt >= max {
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}
