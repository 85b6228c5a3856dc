//! In-process job queue.
//!
//! Jobs run on the submitting task as soon as every job they depend on has
//! finished: immediately at submission, or later when the last dependency
//! finishes. Jobs whose dependencies failed stay deferred forever, the same
//! as on a real worker queue.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::queue::{JobHandle, JobMeta, JobPayload, JobQueue, JobRequest, JobStatus};
use nodeflow_core::types::{JobId, Kwargs};

#[derive(Debug, Clone)]
struct JobState {
    status: JobStatus,
    result: Option<Value>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// A job held by a [`LocalQueue`].
#[derive(Debug)]
pub struct LocalJob {
    id: JobId,
    name: String,
    queue: String,
    meta: JobMeta,
    depends_on: Vec<JobId>,
    options: Kwargs,
    enqueued_at: DateTime<Utc>,
    state: watch::Sender<JobState>,
}

impl LocalJob {
    fn new(queue: &str, request: &JobRequest) -> Self {
        let (state, _) = watch::channel(JobState {
            status: JobStatus::Queued,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
        });
        Self {
            id: JobId::new(Uuid::new_v4().to_string()),
            name: request.payload.name().to_string(),
            queue: queue.to_string(),
            meta: request.meta.clone(),
            depends_on: request.depends_on.clone(),
            options: request.options.clone(),
            enqueued_at: Utc::now(),
            state,
        }
    }

    /// Node type or task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn depends_on(&self) -> &[JobId] {
        &self.depends_on
    }

    pub fn options(&self) -> &Kwargs {
        &self.options
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().ended_at
    }

    /// Wait until the job finished or failed.
    ///
    /// Never returns for a job stuck behind a failed dependency.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.state.subscribe();
        let status = match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(state) => state.status,
            Err(_) => self.status(),
        };
        status
    }

    fn set_status(&self, status: JobStatus) {
        self.state.send_modify(|s| {
            s.status = status;
            if status == JobStatus::Started {
                s.started_at = Some(Utc::now());
            }
        });
    }

    fn complete(&self, outcome: anyhow::Result<Value>) {
        self.state.send_modify(|s| {
            s.ended_at = Some(Utc::now());
            match outcome {
                Ok(value) => {
                    s.status = JobStatus::Finished;
                    s.result = Some(value);
                }
                Err(e) => {
                    s.status = JobStatus::Failed;
                    s.error = Some(format!("{:#}", e));
                }
            }
        });
    }
}

impl JobHandle for LocalJob {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn status(&self) -> JobStatus {
        self.state.borrow().status
    }

    fn result(&self) -> Option<Value> {
        self.state.borrow().result.clone()
    }

    fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    fn meta(&self) -> JobMeta {
        self.meta.clone()
    }
}

/// What to run once a deferred job's dependencies finish.
struct Work {
    payload: JobPayload,
    kwargs: Kwargs,
}

/// In-memory [`JobQueue`] that executes jobs on the submitting task.
pub struct LocalQueue {
    name: String,
    jobs: Mutex<HashMap<JobId, Arc<LocalJob>>>,
    deferred: Mutex<Vec<(Arc<LocalJob>, Work)>>,
}

impl LocalQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Submit and keep the concrete handle.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Arc<LocalJob>> {
        let job = Arc::new(LocalJob::new(&self.name, &request));
        let work = Work {
            payload: request.payload,
            kwargs: request.kwargs,
        };

        // Registration and the deferral decision hold both locks, taken in
        // the same order as `run_ready`.
        let runnable = {
            let mut jobs = self.jobs.lock().await;
            if let Some(missing) = job.depends_on.iter().find(|id| !jobs.contains_key(*id)) {
                return Err(NodeflowError::Queue {
                    queue: self.name.clone(),
                    message: format!("depends on unknown job {}", missing),
                });
            }
            jobs.insert(job.id.clone(), job.clone());
            info!(
                queue = %self.name,
                job_id = %job.id,
                name = %job.name,
                depends_on = job.depends_on.len(),
                "Job enqueued"
            );

            if all_finished(&jobs, &job.depends_on) {
                Some(work)
            } else {
                let mut deferred = self.deferred.lock().await;
                job.set_status(JobStatus::Deferred);
                deferred.push((job.clone(), work));
                None
            }
        };

        match runnable {
            Some(work) => {
                self.perform(&job, work).await;
                self.run_ready().await;
            }
            None => debug!(queue = %self.name, job_id = %job.id, "Job deferred"),
        }
        Ok(job)
    }

    /// Concrete handle of a submitted job.
    pub async fn get(&self, job_id: &JobId) -> Option<Arc<LocalJob>> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// Every job submitted so far, oldest first.
    pub async fn jobs(&self) -> Vec<Arc<LocalJob>> {
        let mut jobs: Vec<Arc<LocalJob>> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.enqueued_at);
        jobs
    }

    /// Number of jobs still waiting on dependencies.
    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Run deferred jobs whose dependencies have all finished, until none are left.
    async fn run_ready(&self) {
        loop {
            let next = {
                let jobs = self.jobs.lock().await;
                let mut deferred = self.deferred.lock().await;
                let ready = deferred
                    .iter()
                    .position(|(job, _)| all_finished(&jobs, &job.depends_on));
                ready.map(|i| deferred.remove(i))
            };
            match next {
                Some((job, work)) => self.perform(&job, work).await,
                None => break,
            }
        }
    }

    async fn perform(&self, job: &LocalJob, work: Work) {
        job.set_status(JobStatus::Started);
        debug!(queue = %self.name, job_id = %job.id, "Job started");

        let run = self.execute(job, work);
        let outcome = match job_timeout(&job.options) {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("job exceeded timeout of {:?}", limit)),
            },
            None => run.await,
        };

        match &outcome {
            Ok(_) => info!(queue = %self.name, job_id = %job.id, "Job finished"),
            Err(e) => error!(queue = %self.name, job_id = %job.id, error = %e, "Job failed"),
        }
        job.complete(outcome);
    }

    async fn execute(&self, job: &LocalJob, work: Work) -> anyhow::Result<Value> {
        let call: BoxFuture<'static, anyhow::Result<Value>> = match work.payload {
            JobPayload::Node { entry, .. } => {
                let mut kwargs = work.kwargs;
                kwargs.extend(self.connection_kwargs(&job.meta).await?);
                Box::pin(async move { entry.callable.invoke(kwargs).await })
            }
            JobPayload::Task { run, .. } => run(),
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("job panicked: {}", message))
            }
        }
    }

    /// Values for connected input ports, read from the upstream jobs'
    /// mapped results.
    async fn connection_kwargs(&self, meta: &JobMeta) -> anyhow::Result<Kwargs> {
        let mut kwargs = Kwargs::new();
        let Some(connections) = &meta.node_connections else {
            return Ok(kwargs);
        };
        let jobs = self.jobs.lock().await;
        for (port, conns) in &connections.inputs {
            let Some(conn) = conns.first() else {
                continue;
            };
            let job_id = conn.job_id.as_ref().ok_or_else(|| {
                anyhow::anyhow!("input '{}' is not linked to an upstream job", port)
            })?;
            let upstream = jobs
                .get(job_id)
                .ok_or_else(|| anyhow::anyhow!("upstream job {} not found", job_id))?;
            let mapped = upstream
                .result_mapped()
                .ok_or_else(|| anyhow::anyhow!("upstream job {} has no result", job_id))?;
            let value = mapped.get(&conn.port_name).ok_or_else(|| {
                anyhow::anyhow!("upstream job {} has no output '{}'", job_id, conn.port_name)
            })?;
            kwargs.insert(port.clone(), value.clone());
        }
        Ok(kwargs)
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

impl JobQueue for LocalQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, request: JobRequest) -> BoxFuture<'_, Result<Arc<dyn JobHandle>>> {
        Box::pin(async move {
            let job = self.enqueue(request).await?;
            Ok(job as Arc<dyn JobHandle>)
        })
    }

    fn fetch<'a>(&'a self, job_id: &'a JobId) -> BoxFuture<'a, Result<Arc<dyn JobHandle>>> {
        Box::pin(async move {
            match self.get(job_id).await {
                Some(job) => Ok(job as Arc<dyn JobHandle>),
                None => Err(NodeflowError::JobNotFound(job_id.to_string())),
            }
        })
    }
}

fn all_finished(jobs: &HashMap<JobId, Arc<LocalJob>>, depends_on: &[JobId]) -> bool {
    depends_on.iter().all(|id| {
        jobs.get(id)
            .map(|dep| dep.status() == JobStatus::Finished)
            .unwrap_or(false)
    })
}

/// `job_timeout` option, in seconds. Values too large for a `Duration`
/// mean no limit.
fn job_timeout(options: &Kwargs) -> Option<Duration> {
    options
        .get("job_timeout")
        .and_then(Value::as_f64)
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
