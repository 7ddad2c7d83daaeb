// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Container Job Runner
//!
//! Turns a [`RunSpec`] into one isolated container job on whichever
//! [`JobBackend`] is configured, follows it to a terminal state, extracts
//! the structured result from its logs and guarantees that the job and its
//! input volume are removed on every exit path.
//!
//! Within one run the status poller and the log follower run concurrently;
//! terminal detection cancels the log follower through a
//! [`CancellationToken`].

use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::output_protocol::{
    self, INPUT_DIR, INPUT_PATH_ENV, OUTPUT_DIR, OUTPUT_PATH_ENV, PARAMS_FILE, RESULT_FILE,
    RUN_ID_ENV, WRITABLE_MOUNTS_ENV,
};
use crate::domain::job::{Job, JobName, JobState, JobStatus};
use crate::domain::naming::{self, LABEL_JOB, LABEL_NODE};
use crate::domain::run_spec::{PullPolicy, RunSpec};
use crate::domain::runtime::{ExecutionContext, JobBackend, JobRequest, LogSink, RuntimeError};
use crate::domain::runtime_config::ExecutionSettings;
use crate::domain::volume::{
    checked_target, IsolatedVolume, VolumeFiles, VolumeMount, VolumeProvider, VolumeScope,
};

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    pub container_wait_timeout: Duration,
    pub service_ready_timeout: Duration,
    pub log_tail_lines: usize,
    pub pull_policy: PullPolicy,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

impl From<&ExecutionSettings> for JobRunnerConfig {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            default_timeout: settings.default_timeout,
            poll_interval: settings.poll_interval,
            container_wait_timeout: settings.container_wait_timeout,
            service_ready_timeout: settings.service_ready_timeout,
            log_tail_lines: settings.log_tail_lines,
            pull_policy: settings.image_pull_policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_name: JobName,
    pub result: Value,
    /// Files captured from writable mounts, keyed by mount target.
    pub files: BTreeMap<String, VolumeFiles>,
    /// `false` when the result was recovered heuristically from the logs.
    pub structured: bool,
    pub logs: String,
    pub exit_code: i64,
}

/// A running stay-up container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub job_name: JobName,
    pub container_id: String,
    pub endpoint: String,
}

pub struct JobRunner {
    backend: Arc<dyn JobBackend>,
    volumes: Arc<dyn VolumeProvider>,
    config: JobRunnerConfig,
}

async fn release(backend: &dyn JobBackend, job: &JobName, volumes: &[Arc<dyn IsolatedVolume>]) {
    if let Err(e) = backend.cleanup(job).await {
        warn!(job = %job, error = %e, "Failed to clean up job resources");
    }
    for volume in volumes {
        volume.cleanup().await;
    }
    debug!(job = %job, "Released job resources");
}

/// Releases a job and the volumes it owns exactly once: explicitly through
/// [`finish`](CleanupGuard::finish), or from a spawned task if the owning
/// future is dropped first.
struct CleanupGuard {
    backend: Arc<dyn JobBackend>,
    job: JobName,
    volumes: Vec<Arc<dyn IsolatedVolume>>,
    armed: bool,
}

impl CleanupGuard {
    fn new(backend: Arc<dyn JobBackend>, job: JobName, volumes: Vec<Arc<dyn IsolatedVolume>>) -> Self {
        Self {
            backend,
            job,
            volumes,
            armed: true,
        }
    }

    /// Runs the release on its own task, so cancelling the caller while it
    /// is in flight neither aborts it nor schedules a second one.
    async fn finish(mut self) {
        self.armed = false;
        let backend = self.backend.clone();
        let job = self.job.clone();
        let volumes = std::mem::take(&mut self.volumes);
        let task = tokio::spawn(async move {
            release(backend.as_ref(), &job, &volumes).await;
        });
        if let Err(e) = task.await {
            error!(job = %self.job, error = %e, "Cleanup task failed");
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = self.backend.clone();
        let job = self.job.clone();
        let volumes = std::mem::take(&mut self.volumes);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(job = %job, "Run cancelled; scheduling cleanup");
                handle.spawn(async move {
                    release(backend.as_ref(), &job, &volumes).await;
                });
            }
            Err(_) => {
                error!(job = %job, "Run dropped outside a runtime; job resources leaked");
            }
        }
    }
}

fn set_state(job: &mut Job, next: JobState) {
    if let Err(e) = job.transition(next) {
        warn!(error = %e, "Ignoring job state transition");
    }
}

fn submit_error(job: &JobName, err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::Configuration(_) | RuntimeError::Container { .. } => err,
        other => RuntimeError::Container {
            message: format!("failed to submit job {}: {}", job, other),
            log_tail: None,
        },
    }
}

impl JobRunner {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        volumes: Arc<dyn VolumeProvider>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            backend,
            volumes,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn volume_provider(&self) -> &Arc<dyn VolumeProvider> {
        &self.volumes
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    /// Execute `spec` once with `params` as its input document.
    pub async fn run(
        &self,
        spec: &RunSpec,
        params: &Value,
        ctx: &ExecutionContext,
    ) -> Result<RunOutcome, RuntimeError> {
        spec.validate()?;

        let started = Instant::now();
        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        let deadline = started + timeout;

        let mut job = Job::new(
            JobName::generate(ctx.run_id.as_str(), &ctx.node_ref),
            self.backend.namespace(),
        );
        let input = self.volumes.create_volume(VolumeScope::new(
            ctx.tenant.clone(),
            ctx.run_id.clone(),
            "input",
        ));
        let guard = CleanupGuard::new(self.backend.clone(), job.name.clone(), vec![input.clone()]);

        info!(
            job = %job.name,
            run_id = %ctx.run_id,
            node = %ctx.node_ref,
            image = %spec.image,
            backend = self.backend.name(),
            "Starting container job"
        );

        let result = self
            .execute(&mut job, spec, params, ctx, input.as_ref(), started, deadline)
            .await;

        guard.finish().await;

        if !job.state().is_terminal() {
            let next = match &result {
                Err(RuntimeError::Timeout { .. }) if job.state().can_transition_to(JobState::TimedOut) => {
                    JobState::TimedOut
                }
                _ => JobState::Failed,
            };
            set_state(&mut job, next);
        }
        set_state(&mut job, JobState::Cleaned);

        match &result {
            Ok(outcome) => info!(
                job = %job.name,
                exit_code = outcome.exit_code,
                structured = outcome.structured,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Container job succeeded"
            ),
            Err(e) => warn!(job = %job.name, error = %e, "Container job failed"),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        job: &mut Job,
        spec: &RunSpec,
        params: &Value,
        ctx: &ExecutionContext,
        input: &dyn IsolatedVolume,
        started: Instant,
        deadline: Instant,
    ) -> Result<RunOutcome, RuntimeError> {
        let params_json = serde_json::to_vec(params)
            .map_err(|e| RuntimeError::Configuration(format!("params are not serializable: {}", e)))?;
        let mut files = VolumeFiles::new();
        files.insert(PARAMS_FILE, params_json)?;
        input.initialize(files).await?;

        let mut mounts: Vec<VolumeMount> = spec.volumes.clone();
        mounts.push(input.mount_config(INPUT_DIR, true)?);
        for attached in &ctx.volumes {
            mounts.push(attached.volume.mount_config(&attached.target, attached.read_only)?);
        }

        let mut seen = BTreeSet::from([OUTPUT_DIR.to_string()]);
        let mut writable = Vec::new();
        for mount in &mounts {
            let target = checked_target(&mount.target)?;
            if !seen.insert(target.clone()) {
                return Err(RuntimeError::Configuration(format!(
                    "mount target '{}' is used more than once",
                    target
                )));
            }
            if !mount.read_only {
                writable.push(target);
            }
        }

        let mut env = spec.env.clone();
        env.insert(RUN_ID_ENV.to_string(), ctx.run_id.to_string());
        env.insert(INPUT_PATH_ENV.to_string(), format!("{}/{}", INPUT_DIR, PARAMS_FILE));
        env.insert(OUTPUT_PATH_ENV.to_string(), format!("{}/{}", OUTPUT_DIR, RESULT_FILE));
        if !writable.is_empty() {
            env.insert(WRITABLE_MOUNTS_ENV.to_string(), writable.join(" "));
        }

        let wrapped = output_protocol::wrap_command(
            spec.entrypoint.as_deref(),
            &spec.command,
            !writable.is_empty(),
            spec.distroless,
        );
        debug!(job = %job.name, mode = ?wrapped.mode, "Prepared container command");

        let request = JobRequest {
            name: job.name.clone(),
            image: spec.image.clone(),
            entrypoint: wrapped.entrypoint,
            command: wrapped.command,
            env,
            mounts,
            scratch_dirs: vec![OUTPUT_DIR.to_string()],
            network: spec.network.clone(),
            labels: self.job_labels(ctx, &job.name),
            timeout: Some(deadline.saturating_duration_since(Instant::now())),
            pull_policy: self.config.pull_policy,
            service_port: None,
        };

        if let Err(e) = self.backend.submit(&request).await {
            set_state(job, JobState::Failed);
            return Err(submit_error(&job.name, e));
        }
        set_state(job, JobState::Scheduled);

        let status = self
            .await_completion(job, ctx.log_sink.clone(), started, deadline)
            .await?;

        match status {
            JobStatus::Failed { exit_code, reason } => {
                set_state(job, JobState::Failed);
                let logs = self.backend.final_logs(&job.name).await.unwrap_or_else(|e| {
                    warn!(job = %job.name, error = %e, "Could not read logs of failed job");
                    String::new()
                });
                let exit = exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default();
                Err(RuntimeError::Container {
                    message: format!("job {} failed: {}{}", job.name, reason, exit),
                    log_tail: Some(output_protocol::log_tail(&logs, self.config.log_tail_lines)),
                })
            }
            JobStatus::Succeeded { exit_code } => {
                set_state(job, JobState::Succeeded);
                let logs = self.backend.final_logs(&job.name).await?;
                let parsed = output_protocol::parse_output(&logs);
                if !parsed.structured {
                    warn!(job = %job.name, "No result delimiter in container output; using heuristic result");
                }

                for attached in ctx.volumes.iter().filter(|v| !v.read_only) {
                    let target = checked_target(&attached.target)?;
                    if let Some(captured) = parsed.files.get(&target) {
                        debug!(job = %job.name, target = %target, files = captured.len(), "Writing back captured files");
                        attached.volume.write_back(captured).await?;
                    }
                }

                Ok(RunOutcome {
                    job_name: job.name.clone(),
                    result: parsed.result,
                    files: parsed.files,
                    structured: parsed.structured,
                    logs,
                    exit_code,
                })
            }
            JobStatus::Pending | JobStatus::Running => Err(RuntimeError::container(format!(
                "job {} reported a non-terminal status after completion",
                job.name
            ))),
        }
    }

    fn job_labels(&self, ctx: &ExecutionContext, job: &JobName) -> BTreeMap<String, String> {
        let mut labels = naming::resource_labels(&ctx.tenant, &ctx.run_id);
        labels.insert(LABEL_NODE.to_string(), naming::label_value(&ctx.node_ref));
        labels.insert(LABEL_JOB.to_string(), job.to_string());
        labels
    }

    async fn await_completion(
        &self,
        job: &mut Job,
        sink: Arc<dyn LogSink>,
        started: Instant,
        deadline: Instant,
    ) -> Result<JobStatus, RuntimeError> {
        let token = CancellationToken::new();
        let name = job.name.clone();
        let (status, ()) = tokio::try_join!(
            self.poll_status(job, &token, started, deadline),
            self.follow_logs(&name, sink, &token, started, deadline),
        )?;
        Ok(status)
    }

    async fn poll_status(
        &self,
        job: &mut Job,
        token: &CancellationToken,
        started: Instant,
        deadline: Instant,
    ) -> Result<JobStatus, RuntimeError> {
        loop {
            if Instant::now() >= deadline {
                token.cancel();
                return Err(RuntimeError::Timeout {
                    message: format!("job {} did not finish in time", job.name),
                    elapsed: started.elapsed(),
                });
            }

            match self.backend.status(&job.name).await {
                Ok(status) if status.is_terminal() => {
                    token.cancel();
                    return Ok(status);
                }
                Ok(JobStatus::Running) if job.state() == JobState::Scheduled => {
                    set_state(job, JobState::Running);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Status poll failed; retrying");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    async fn follow_logs(
        &self,
        job: &JobName,
        sink: Arc<dyn LogSink>,
        token: &CancellationToken,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        let wait_until = deadline.min(Instant::now() + self.config.container_wait_timeout);

        let container = loop {
            if token.is_cancelled() {
                break None;
            }
            match self.backend.find_container(job).await {
                Ok(Some(id)) => break Some(id),
                Ok(None) => {}
                Err(e) => debug!(job = %job, error = %e, "Container lookup failed"),
            }
            if Instant::now() >= wait_until {
                token.cancel();
                return Err(RuntimeError::Timeout {
                    message: format!("container for job {} never appeared", job),
                    elapsed: started.elapsed(),
                });
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        // The status poller cancels the token once the job is terminal; a job
        // that finished before streaming started gets its final logs once.
        let Some(container) = container.filter(|_| !token.is_cancelled()) else {
            match self.backend.final_logs(job).await {
                Ok(logs) => sink.emit(job, &logs),
                Err(e) => debug!(job = %job, error = %e, "Could not read final logs"),
            }
            return Ok(());
        };
        debug!(job = %job, container = %container, "Container is up; following logs");

        let mut stream = match self.backend.stream_logs(job, &container).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(job = %job, error = %e, "Live log streaming unavailable");
                return Ok(());
            }
        };
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => sink.emit(job, &chunk),
                    Some(Err(e)) => {
                        debug!(job = %job, error = %e, "Log stream ended with error");
                        break;
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Start a long-lived container exposing `port` and wait until it is
    /// reachable. The job is removed again if it never becomes ready.
    pub async fn start_service(
        &self,
        spec: &RunSpec,
        ctx: &ExecutionContext,
        port: u16,
    ) -> Result<ServiceHandle, RuntimeError> {
        spec.validate()?;

        let name = JobName::generate(ctx.run_id.as_str(), &ctx.node_ref);
        let mut mounts = spec.volumes.clone();
        for attached in &ctx.volumes {
            mounts.push(attached.volume.mount_config(&attached.target, attached.read_only)?);
        }
        let mut env = spec.env.clone();
        env.insert(RUN_ID_ENV.to_string(), ctx.run_id.to_string());

        let request = JobRequest {
            name: name.clone(),
            image: spec.image.clone(),
            entrypoint: spec.entrypoint.clone(),
            command: spec.command.clone(),
            env,
            mounts,
            scratch_dirs: Vec::new(),
            network: spec.network.clone(),
            labels: self.job_labels(ctx, &name),
            timeout: None,
            pull_policy: self.config.pull_policy,
            service_port: Some(port),
        };

        info!(job = %name, image = %spec.image, port, "Starting service container");
        let guard = CleanupGuard::new(self.backend.clone(), name.clone(), Vec::new());

        let ready = async {
            self.backend
                .submit(&request)
                .await
                .map_err(|e| submit_error(&name, e))?;
            let container_id = self.wait_until_serving(&name).await?;
            let endpoint = self.backend.service_endpoint(&name, port).await?;
            Ok::<_, RuntimeError>((container_id, endpoint))
        }
        .await;

        match ready {
            Ok((container_id, endpoint)) => {
                guard.disarm();
                info!(job = %name, endpoint = %endpoint, "Service container ready");
                Ok(ServiceHandle {
                    job_name: name,
                    container_id,
                    endpoint,
                })
            }
            Err(e) => {
                guard.finish().await;
                Err(e)
            }
        }
    }

    async fn wait_until_serving(&self, name: &JobName) -> Result<String, RuntimeError> {
        let started = Instant::now();
        let deadline = started + self.config.service_ready_timeout;
        loop {
            match self.backend.status(name).await {
                Ok(JobStatus::Running) => match self.backend.find_container(name).await {
                    Ok(Some(id)) => return Ok(id),
                    Ok(None) => {}
                    Err(e) => warn!(job = %name, error = %e, "Container lookup failed; retrying"),
                },
                Ok(JobStatus::Pending) => {}
                Err(e) => warn!(job = %name, error = %e, "Status poll failed; retrying"),
                Ok(terminal) => {
                    let logs = self.backend.final_logs(name).await.unwrap_or_default();
                    let reason = match terminal {
                        JobStatus::Failed { reason, .. } => reason,
                        _ => "exited".to_string(),
                    };
                    return Err(RuntimeError::Container {
                        message: format!("service {} stopped before becoming ready: {}", name, reason),
                        log_tail: Some(output_protocol::log_tail(&logs, self.config.log_tail_lines)),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Timeout {
                    message: format!("service {} was not running in time", name),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Remove a service started with [`start_service`](Self::start_service).
    pub async fn stop_service(&self, handle: &ServiceHandle) {
        info!(job = %handle.job_name, "Stopping service container");
        release(self.backend.as_ref(), &handle.job_name, &[]).await;
    }
}
