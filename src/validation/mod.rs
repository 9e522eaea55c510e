//! External validation jobs (backtest + off-policy evaluation) run against a
//! candidate before it may be promoted.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::PromotionError;

/// How long to wait for output readers after the child is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for `window_days` (ten years)
const MAX_WINDOW_DAYS: i64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    pub program: String,
    pub backtest_args: Vec<String>,
    /// Kind selector appended to the backtest invocation
    pub backtest_selector: Vec<String>,
    pub ope_args: Vec<String>,
    pub ope_policies: Vec<String>,
    /// Trailing window ending now
    pub window_days: i64,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            program: "pnpm".to_string(),
            backtest_args: vec!["backtest".to_string()],
            backtest_selector: vec!["--use-alpha".to_string()],
            ope_args: vec!["ope".to_string()],
            ope_policies: vec!["fee".to_string(), "sizing".to_string()],
            window_days: 14,
            timeout_secs: 30 * 60,
            output_limit_bytes: 2000,
        }
    }
}

impl ValidationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the job invocations for a window ending at `now`
    pub fn plan(&self, now: DateTime<Utc>) -> ValidationPlan {
        let to = now.date_naive();
        let from = ChronoDuration::try_days(self.window_days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(now)
            .date_naive();
        let window = |base: &[String]| -> Vec<String> {
            let mut args = base.to_vec();
            args.extend([
                "--from".to_string(),
                from.format("%Y-%m-%d").to_string(),
                "--to".to_string(),
                to.format("%Y-%m-%d").to_string(),
            ]);
            args
        };

        let mut backtest_args = window(self.backtest_args.as_slice());
        backtest_args.extend(self.backtest_selector.iter().cloned());
        let backtest = JobSpec::new("backtest", &self.program, backtest_args);

        let ope = self
            .ope_policies
            .iter()
            .map(|policy| {
                let mut args = window(self.ope_args.as_slice());
                args.extend(["--policy".to_string(), policy.clone()]);
                JobSpec::new(format!("ope:{}", policy), &self.program, args)
            })
            .collect();

        ValidationPlan { from, to, backtest, ope }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.program.trim().is_empty() {
            errors.push("validation.program must not be empty".to_string());
        }
        if self.ope_policies.is_empty() {
            errors.push("validation.ope_policies must name at least one policy".to_string());
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.window_days) {
            errors.push(format!("validation.window_days must be in 1..={}", MAX_WINDOW_DAYS));
        }
        if self.timeout_secs == 0 {
            errors.push("validation.timeout_secs must be > 0".to_string());
        }
        if self.output_limit_bytes == 0 {
            errors.push("validation.output_limit_bytes must be > 0".to_string());
        }
        errors
    }
}

/// One external command: program plus an explicit argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }
}

impl std::fmt::Display for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ValidationPlan {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub backtest: JobSpec,
    pub ope: Vec<JobSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Exited(i32),
    /// Killed by a signal
    Terminated,
    TimedOut,
    SpawnFailed(String),
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Exited(code) => write!(f, "exit({})", code),
            JobStatus::Terminated => write!(f, "terminated"),
            JobStatus::TimedOut => write!(f, "timeout"),
            JobStatus::SpawnFailed(cause) => write!(f, "spawn_failed({})", cause),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    pub status: JobStatus,
    /// Tail of combined stdout and stderr
    pub output: String,
}

impl JobResult {
    pub fn new(name: impl Into<String>, status: JobStatus, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            output: output.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Exited(0)
    }
}

/// Results of one validation attempt
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub backtest: JobResult,
    pub ope: Vec<JobResult>,
    pub passed: bool,
}

impl ValidationOutcome {
    pub fn new(from: NaiveDate, to: NaiveDate, backtest: JobResult, ope: Vec<JobResult>) -> Self {
        let passed = backtest.succeeded() && ope.iter().all(JobResult::succeeded);
        Self {
            from,
            to,
            backtest,
            ope,
            passed,
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobResult> {
        std::iter::once(&self.backtest).chain(self.ope.iter())
    }

    /// The first failed job as a pipeline error
    pub fn failure(&self) -> Option<PromotionError> {
        self.jobs()
            .find(|job| !job.succeeded())
            .map(|job| PromotionError::ValidationJobFailed {
                job: job.name.clone(),
                failure: job.status.to_string(),
            })
    }
}

/// Runs a single job. Implementations must not fail: every problem is a `JobStatus`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &JobSpec, env: &HashMap<String, String>) -> JobResult;
}

/// Executes jobs as child processes with a hard timeout
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
    output_limit: usize,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration, output_limit: usize) -> Self {
        Self {
            timeout,
            output_limit,
        }
    }

    pub fn from_settings(settings: &ValidationSettings) -> Self {
        Self::new(settings.timeout(), settings.output_limit_bytes)
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: &JobSpec, env: &HashMap<String, String>) -> JobResult {
        debug!("Running {}: {}", job.name, job);

        let mut cmd = Command::new(&job.program);
        cmd.args(&job.args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so a timeout also reaches what the job forked
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {} ({}): {}", job.name, job.program, e);
                return JobResult::new(&job.name, JobStatus::SpawnFailed(e.to_string()), "");
            }
        };

        let pid = child.id();
        let limit = self.output_limit;
        let stdout_task = tokio::spawn(read_tail(child.stdout.take(), limit));
        let stderr_task = tokio::spawn(read_tail(child.stderr.take(), limit));

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => match status.code() {
                Some(code) => JobStatus::Exited(code),
                None => JobStatus::Terminated,
            },
            Ok(Err(e)) => {
                warn!("Failed waiting on {}: {}", job.name, e);
                kill_group(pid);
                let _ = child.kill().await;
                JobStatus::SpawnFailed(format!("wait: {}", e))
            }
            Err(_) => {
                warn!("{} exceeded {:?}, killing", job.name, self.timeout);
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", job.name, e);
                }
                JobStatus::TimedOut
            }
        };

        let (stdout, stderr) = tokio::join!(collect_output(stdout_task), collect_output(stderr_task));
        let combined = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{}\n{}", stdout, stderr)
        };

        JobResult::new(&job.name, status, tail_str(&combined, limit))
    }
}

/// SIGKILL the whole process group led by `pid`
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("killpg {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn read_tail<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

async fn collect_output(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // a grandchild still holds the pipe open
            abort.abort();
            String::new()
        }
    }
}

/// Last `limit` bytes of `s`, cut on a char boundary
fn tail_str(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Runs the backtest and OPE jobs for one candidate
#[derive(Clone)]
pub struct ValidationRunner {
    executor: Arc<dyn JobExecutor>,
    settings: ValidationSettings,
}

impl ValidationRunner {
    pub fn new(executor: Arc<dyn JobExecutor>, settings: ValidationSettings) -> Self {
        Self { executor, settings }
    }

    pub async fn run_validation(&self, env_overrides: &HashMap<String, String>) -> ValidationOutcome {
        self.run_validation_at(env_overrides, Utc::now()).await
    }

    pub async fn run_validation_at(
        &self,
        env_overrides: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> ValidationOutcome {
        let env: HashMap<String, String> = env_overrides
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let plan = self.settings.plan(now);
        info!("Validating window {} .. {} ({} jobs)", plan.from, plan.to, 1 + plan.ope.len());

        let backtest = self.executor.execute(&plan.backtest, &env).await;
        log_job(&backtest);

        let mut ope = Vec::with_capacity(plan.ope.len());
        for job in &plan.ope {
            let result = self.executor.execute(job, &env).await;
            log_job(&result);
            ope.push(result);
        }

        ValidationOutcome::new(plan.from, plan.to, backtest, ope)
    }
}

fn log_job(result: &JobResult) {
    if result.succeeded() {
        info!("Job {} passed", result.name);
    } else {
        warn!("Job {} failed: {}", result.name, result.status);
    }
    if !result.output.is_empty() {
        debug!("Job {} output:\n{}", result.name, result.output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 10, 30, 0).unwrap()
    }

    fn sh(script: &str) -> JobSpec {
        JobSpec::new("sh", "sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_plan_arguments() {
        let plan = ValidationSettings::default().plan(fixed_now());
        assert_eq!(plan.from.to_string(), "2024-05-01");
        assert_eq!(plan.to.to_string(), "2024-05-15");
        assert_eq!(
            plan.backtest.to_string(),
            "pnpm backtest --from 2024-05-01 --to 2024-05-15 --use-alpha"
        );
        assert_eq!(plan.ope.len(), 2);
        assert_eq!(plan.ope[0].name, "ope:fee");
        assert_eq!(
            plan.ope[1].args,
            vec!["ope", "--from", "2024-05-01", "--to", "2024-05-15", "--policy", "sizing"]
        );
    }

    #[test]
    fn test_arguments_are_not_shell_split() {
        let settings = ValidationSettings {
            ope_policies: vec!["fee; rm -rf /".to_string()],
            ..ValidationSettings::default()
        };
        let plan = settings.plan(fixed_now());
        assert_eq!(plan.ope[0].args.last().unwrap(), "fee; rm -rf /");
    }

    #[test]
    fn test_tail_str_respects_char_boundaries() {
        assert_eq!(tail_str("abcdef", 3), "def");
        assert_eq!(tail_str("ab", 3), "ab");
        let cut = tail_str("aé", 1);
        assert!(cut.len() <= 1);
    }

    #[test]
    fn test_settings_validation() {
        assert!(ValidationSettings::default().validate().is_empty());
        let bad = ValidationSettings {
            ope_policies: vec![],
            timeout_secs: 0,
            ..ValidationSettings::default()
        };
        assert_eq!(bad.validate().len(), 2);

        let huge = ValidationSettings {
            window_days: i64::MAX,
            ..ValidationSettings::default()
        };
        assert_eq!(huge.validate(), vec!["validation.window_days must be in 1..=3650".to_string()]);
    }

    #[test]
    fn test_plan_with_out_of_range_window_does_not_panic() {
        let settings = ValidationSettings {
            window_days: i64::MAX,
            ..ValidationSettings::default()
        };
        let plan = settings.plan(fixed_now());
        assert_eq!(plan.from, plan.to);
    }

    #[tokio::test]
    async fn test_runner_passes_when_all_jobs_succeed() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(3)
            .withf(|_, env| {
                env.get("ALPHA_MODEL_PATH").map(String::as_str) == Some("/models/alpha.json")
                    && !env.contains_key("EMPTY_OVERRIDE")
            })
            .returning(|job, _| JobResult::new(&job.name, JobStatus::Exited(0), "ok"));

        let runner = ValidationRunner::new(Arc::new(executor), ValidationSettings::default());
        let env = HashMap::from([
            ("ALPHA_MODEL_PATH".to_string(), "/models/alpha.json".to_string()),
            ("EMPTY_OVERRIDE".to_string(), String::new()),
        ]);
        let outcome = runner.run_validation_at(&env, fixed_now()).await;

        assert!(outcome.passed);
        assert!(outcome.failure().is_none());
        assert_eq!(outcome.jobs().count(), 3);
    }

    #[tokio::test]
    async fn test_runner_fails_when_one_ope_policy_fails() {
        let mut executor = MockJobExecutor::new();
        executor.expect_execute().times(3).returning(|job, _| {
            let status = if job.name == "ope:sizing" {
                JobStatus::TimedOut
            } else {
                JobStatus::Exited(0)
            };
            JobResult::new(&job.name, status, "")
        });

        let runner = ValidationRunner::new(Arc::new(executor), ValidationSettings::default());
        let outcome = runner.run_validation_at(&HashMap::new(), fixed_now()).await;

        assert!(!outcome.passed);
        assert!(outcome.backtest.succeeded());
        assert_eq!(
            outcome.failure().unwrap().to_string(),
            "validation_failed:ope:sizing=timeout"
        );
    }

    #[tokio::test]
    async fn test_process_exit_codes() {
        let executor = ProcessExecutor::new(Duration::from_secs(10), 2000);
        let env = HashMap::new();

        let ok = executor.execute(&sh("exit 0"), &env).await;
        assert!(ok.succeeded());

        let failed = executor.execute(&sh("echo out; echo err >&2; exit 3"), &env).await;
        assert_eq!(failed.status, JobStatus::Exited(3));
        assert!(failed.output.contains("out"));
        assert!(failed.output.contains("err"));
    }

    #[tokio::test]
    async fn test_process_timeout_kills_child() {
        let executor = ProcessExecutor::new(Duration::from_millis(200), 2000);
        let started = std::time::Instant::now();
        let result = executor
            .execute(&JobSpec::new("slow", "sleep", vec!["30".to_string()]), &HashMap::new())
            .await;
        assert_eq!(result.status, JobStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_process_timeout_kills_forked_children() {
        let executor = ProcessExecutor::new(Duration::from_millis(300), 2000);
        let started = std::time::Instant::now();
        let result = executor.execute(&sh("sleep 300 & echo $!; wait"), &HashMap::new()).await;
        let elapsed = started.elapsed();

        assert_eq!(result.status, JobStatus::TimedOut);
        // a surviving grandchild would hold the pipes open for the full reader grace
        assert!(elapsed < READER_GRACE, "took {:?}", elapsed);

        let pid: u32 = result.output.trim().parse().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !process_gone(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process_gone(pid), "sleep {} still running", pid);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let executor = ProcessExecutor::new(Duration::from_secs(5), 2000);
        let job = JobSpec::new("ghost", "/nonexistent/definitely-not-here", vec![]);
        let result = executor.execute(&job, &HashMap::new()).await;
        assert!(matches!(result.status, JobStatus::SpawnFailed(_)));
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let executor = ProcessExecutor::new(Duration::from_secs(10), 100);
        let result = executor
            .execute(&sh("i=0; while [ $i -lt 500 ]; do echo line-$i; i=$((i+1)); done"), &HashMap::new())
            .await;
        assert!(result.succeeded());
        assert!(result.output.len() <= 100);
        assert!(result.output.contains("line-499"));
    }

    #[tokio::test]
    async fn test_env_overrides_reach_the_child() {
        let executor = ProcessExecutor::new(Duration::from_secs(10), 2000);
        let env = HashMap::from([("FILLNET_MODEL_PATH".to_string(), "/tmp/cand.json".to_string())]);
        let result = executor
            .execute(&sh("test \"$FILLNET_MODEL_PATH\" = /tmp/cand.json && test -n \"$PATH\""), &env)
            .await;
        assert!(result.succeeded(), "status {}", result.status);
    }
}
