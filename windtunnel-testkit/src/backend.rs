use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use windtunnel::*;

/// How a simulated task behaves once it leaves the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskScript {
    /// Every stage succeeds.
    Succeed,
    /// The given stage reports failure.
    FailAt(SolverStage),
    /// The task stays on its first stage forever.
    Stall,
}

/// In-memory [`ComputeBackend`].
///
/// Each status poll of a task first reports `queued` for `queued_polls`
/// polls, then advances the task through its [`CommandPipeline`] by one
/// stage per poll according to its [`TaskScript`].
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

#[derive(Default)]
struct BackendState {
    tasks: HashMap<TaskId, SimulatedTask>,
    pools: HashMap<PoolId, PoolRecord>,
    submissions: Vec<SubmitRequest>,
    next_id: u64,
    default_script: Option<TaskScript>,
    queued_polls: u32,
    provisioning_failure: Option<String>,
}

#[derive(Clone, Debug)]
struct SimulatedTask {
    request: SubmitRequest,
    script: TaskScript,
    progress: PipelineProgress,
    polls: u32,
    status_override: Option<TaskStatus>,
    unreachable: bool,
}

#[derive(Clone, Debug)]
pub struct PoolRecord {
    pub spec: MachinePoolSpec,
    pub released: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    /// Script applied to tasks submitted from now on.
    pub fn with_script(self, script: TaskScript) -> Self {
        self.state.lock().default_script = Some(script);
        self
    }

    /// Polls that report `queued` before a task starts advancing.
    pub fn with_queued_polls(self, polls: u32) -> Self {
        self.state.lock().queued_polls = polls;
        self
    }

    pub fn shared(&self) -> Arc<dyn ComputeBackend> {
        Arc::new(self.clone())
    }

    /// Make every later `provision_pool` call fail with `message`.
    pub fn fail_provisioning(&self, message: impl Into<String>) {
        self.state.lock().provisioning_failure = Some(message.into());
    }

    pub fn set_script(&self, task_id: &TaskId, script: TaskScript) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            task.script = script;
        }
    }

    /// Jump a task straight to a terminal state.
    pub fn finish(&self, task_id: &TaskId, succeeded: bool) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            let stage = task.progress.current().unwrap_or(SolverStage::ExtractFeatures);
            task.progress = if succeeded {
                PipelineProgress::Complete
            } else {
                PipelineProgress::Failed(stage)
            };
            task.polls = task.polls.max(1);
        }
    }

    /// Forget a task, as a backend does once its records expire.
    pub fn purge(&self, task_id: &TaskId) -> bool {
        self.state.lock().tasks.remove(task_id).is_some()
    }

    /// Report `status` on the next poll regardless of progress.
    pub fn report_once(&self, task_id: &TaskId, status: TaskStatus) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            task.status_override = Some(status);
        }
    }

    /// Fail status queries and downloads for a task with a transport error.
    pub fn make_unreachable(&self, task_id: &TaskId) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            task.unreachable = true;
        }
    }

    pub fn progress(&self, task_id: &TaskId) -> Option<PipelineProgress> {
        self.state.lock().tasks.get(task_id).map(|t| t.progress)
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state.lock().submissions.clone()
    }

    pub fn pool(&self, pool_id: &PoolId) -> Option<PoolRecord> {
        self.state.lock().pools.get(pool_id).cloned()
    }

    pub fn active_pools(&self) -> usize {
        self.state.lock().pools.values().filter(|p| !p.released).count()
    }

    pub fn assert_submission_count_eq(&self, expected: usize) {
        let actual = self.state.lock().submissions.len();
        assert_eq!(actual, expected, "Expected {expected} submissions, got {actual}");
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn task_mut(&mut self, task_id: &TaskId) -> BackendResult<&mut SimulatedTask> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BackendError::UnknownTask(task_id.clone()))?;
        if task.unreachable {
            return Err(BackendError::Transport(format!("connection reset polling {task_id}")));
        }
        Ok(task)
    }
}

impl SimulatedTask {
    fn poll(&mut self, queued_polls: u32) -> TaskStatus {
        self.polls += 1;
        if let Some(status) = self.status_override.take() {
            return status;
        }
        if self.polls <= queued_polls && !self.progress.is_terminal() {
            return TaskStatus::Queued;
        }

        if let Some(stage) = self.progress.current() {
            let next = match self.script {
                TaskScript::Stall => None,
                TaskScript::FailAt(failing) if failing == stage => {
                    self.progress.advance(false).ok()
                }
                _ => self.progress.advance(true).ok(),
            };
            if let Some(next) = next {
                self.progress = next;
            }
        }

        match self.progress {
            PipelineProgress::Pending(_) => TaskStatus::Running,
            PipelineProgress::Complete => TaskStatus::Success,
            PipelineProgress::Failed(_) => TaskStatus::Failed,
        }
    }
}

#[async_trait]
impl ComputeBackend for InMemoryBackend {
    async fn provision_pool(&self, spec: &MachinePoolSpec) -> BackendResult<PoolId> {
        let mut state = self.state.lock();
        if let Some(message) = &state.provisioning_failure {
            return Err(BackendError::Provisioning(message.clone()));
        }
        let pool_id = PoolId::new(state.next_id("pool"));
        state.pools.insert(
            pool_id.clone(),
            PoolRecord {
                spec: spec.clone(),
                released: false,
            },
        );
        tracing::debug!(pool_id = %pool_id, machine_type = spec.machine_type(), "pool provisioned");
        Ok(pool_id)
    }

    async fn release_pool(&self, pool: &PoolId) -> BackendResult<()> {
        let mut state = self.state.lock();
        let record = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| BackendError::UnknownPool(pool.clone()))?;
        record.released = true;
        Ok(())
    }

    async fn submit(&self, request: SubmitRequest) -> BackendResult<TaskId> {
        let mut state = self.state.lock();
        if let Some(pool) = &request.pool {
            match state.pools.get(pool) {
                Some(record) if !record.released => {}
                _ => return Err(BackendError::UnknownPool(pool.clone())),
            }
        }

        let task_id = TaskId::new(state.next_id("task"));
        let script = state.default_script.unwrap_or(TaskScript::Succeed);
        state.submissions.push(request.clone());
        state.tasks.insert(
            task_id.clone(),
            SimulatedTask {
                request,
                script,
                progress: CommandPipeline::steady_state().start(),
                polls: 0,
                status_override: None,
                unreachable: false,
            },
        );
        Ok(task_id)
    }

    async fn task_status(&self, task: &TaskId) -> BackendResult<TaskStatus> {
        let mut state = self.state.lock();
        let queued_polls = state.queued_polls;
        Ok(state.task_mut(task)?.poll(queued_polls))
    }

    async fn download_outputs(&self, task: &TaskId, dest: &Path) -> BackendResult<PathBuf> {
        let (commands, progress) = {
            let mut state = self.state.lock();
            let task = state.task_mut(task)?;
            (task.request.commands.clone(), task.progress)
        };
        if progress != PipelineProgress::Complete {
            return Err(BackendError::Transport(format!("outputs of {task} are not available")));
        }

        tokio::fs::create_dir_all(dest.join("postProcessing")).await?;
        tokio::fs::write(dest.join("log.txt"), commands.join("\n")).await?;
        tokio::fs::write(
            dest.join("postProcessing/forceCoeffs.dat"),
            format!("# task {task}\n0 0.31 0.02\n"),
        )
        .await?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            input_dir: PathBuf::from("/cases/one"),
            commands: CommandPipeline::steady_state().commands(),
            pool: None,
        }
    }

    #[tokio::test]
    async fn test_task_walks_pipeline_to_success() {
        let backend = InMemoryBackend::new().with_queued_polls(1);
        let id = backend.submit(request()).await.unwrap();

        assert_eq!(backend.task_status(&id).await.unwrap(), TaskStatus::Queued);
        let mut polls = 0;
        let status = loop {
            polls += 1;
            let status = backend.task_status(&id).await.unwrap();
            if status.is_terminal() {
                break status;
            }
            assert_eq!(status, TaskStatus::Running);
        };
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(polls, SolverStage::ALL.len());
    }

    #[tokio::test]
    async fn test_scripted_failure_stops_at_stage() {
        let backend =
            InMemoryBackend::new().with_script(TaskScript::FailAt(SolverStage::DecomposeDomain));
        let id = backend.submit(request()).await.unwrap();

        let mut status = TaskStatus::Queued;
        for _ in 0..10 {
            status = backend.task_status(&id).await.unwrap();
        }
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(
            backend.progress(&id),
            Some(PipelineProgress::Failed(SolverStage::DecomposeDomain))
        );
    }

    #[tokio::test]
    async fn test_purged_task_is_unknown() {
        let backend = InMemoryBackend::new();
        let id = backend.submit(request()).await.unwrap();
        assert!(backend.purge(&id));
        assert_eq!(
            backend.task_status(&id).await,
            Err(BackendError::UnknownTask(id))
        );
    }

    #[tokio::test]
    async fn test_submit_to_released_pool_is_rejected() {
        let backend = InMemoryBackend::new();
        let spec = MachinePoolSpec::new("c2-standard-16", PoolSizing::Fixed { count: 1 }, 70)
            .unwrap();
        let pool = backend.provision_pool(&spec).await.unwrap();
        backend.release_pool(&pool).await.unwrap();

        let mut req = request();
        req.pool = Some(pool.clone());
        assert_eq!(backend.submit(req).await, Err(BackendError::UnknownPool(pool)));
    }
}
