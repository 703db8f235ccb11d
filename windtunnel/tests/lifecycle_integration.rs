//! End-to-end job lifecycle tests against the in-memory backend.
//!
//! Covers case assembly, pool state rules, submission, polling, waiting with
//! timeout and cancellation, and output download.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use windtunnel::*;
use windtunnel_testkit::{
    example_parameters, example_wind_tunnel, InMemoryBackend, TaskScript, Workspace, BINARY_ASSET,
    VEHICLE_OBJ,
};

fn fast_wait() -> WaitOptions {
    WaitOptions::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_timeout(Duration::from_secs(5))
}

fn pool_spec() -> MachinePoolSpec {
    MachinePoolSpec::new("c2-standard-16", PoolSizing::Elastic { min: 1, max: 4 }, 70).unwrap()
}

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

async fn submit_case(backend: &InMemoryBackend, workspace: &Workspace) -> TaskHandle {
    let scenario = WindTunnelScenario::new(
        example_wind_tunnel(),
        workspace.template(),
        workspace.config(),
        backend.shared(),
    );
    scenario
        .simulate(&workspace.mesh(), &example_parameters(), None)
        .await
        .unwrap()
}

#[tokio::test]
async fn example_scenario_runs_to_downloaded_outputs() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_queued_polls(2);
    let pool = MachinePool::create(pool_spec(), backend.shared());
    let pool_id = pool.start().await.unwrap();

    let scenario = WindTunnelScenario::new(
        example_wind_tunnel(),
        workspace.template(),
        workspace.config(),
        backend.shared(),
    );
    let task = scenario
        .simulate(&workspace.mesh(), &example_parameters(), Some(&pool))
        .await
        .unwrap();

    let case_root = task.input_dir().unwrap().to_path_buf();
    assert!(case_root.starts_with(workspace.working_dir()));
    assert_eq!(
        std::fs::read_to_string(case_root.join("system/controlDict")).unwrap(),
        "application simpleFoam;\nendTime 50;\nwriteInterval 50;\n"
    );
    assert!(std::fs::read_to_string(case_root.join("0/U"))
        .unwrap()
        .starts_with("internalField uniform (30 0 0);"));
    assert_eq!(
        std::fs::read_to_string(case_root.join("0/include/initialConditions")).unwrap(),
        "flowVelocity (30 0 0);\n"
    );
    assert_eq!(
        std::fs::read_to_string(case_root.join(OBJECT_MESH_PATH)).unwrap(),
        VEHICLE_OBJ
    );
    assert_eq!(std::fs::read(case_root.join("constant/geometry.gz")).unwrap(), BINARY_ASSET);

    let submissions = backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].commands, CommandPipeline::steady_state().commands());
    assert_eq!(submissions[0].pool, Some(pool_id));
    assert_eq!(submissions[0].input_dir, case_root);

    let records = JobLog::new(workspace.job_log()).read().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].task_id, task.id());
    assert_eq!(records[0].input_dir, case_root);
    assert!(records[0].submitted_at.is_some());

    assert_eq!(task.wait(fast_wait()).await.unwrap(), TaskStatus::Success);

    let outputs = task
        .download_outputs(&case_root.join("downloaded_outputs"))
        .await
        .unwrap();
    assert!(outputs.is_dir());
    assert!(outputs.join("postProcessing/forceCoeffs.dat").is_file());

    pool.stop().await.unwrap();
    assert_eq!(backend.active_pools(), 0);
}

#[tokio::test]
async fn assembly_is_byte_identical_across_runs() {
    let workspace = Workspace::new().unwrap();
    let assembler = CaseAssembler::new(workspace.template());
    let params = example_wind_tunnel()
        .to_params()
        .merged_with(&example_parameters().to_params());

    let first = workspace.root().join("first");
    let second = workspace.root().join("second");
    let case_a = assembler
        .assemble(&workspace.mesh(), &params, &first, AssemblyOptions::default())
        .unwrap();
    let case_b = assembler
        .assemble(&workspace.mesh(), &params, &second, AssemblyOptions::default())
        .unwrap();

    assert_eq!(case_a.files(), case_b.files());
    assert_eq!(snapshot(&first), snapshot(&second));
    assert!(case_a.object_mesh().is_file());

    // Re-running into an occupied destination needs overwrite.
    let err = assembler
        .assemble(&workspace.mesh(), &params, &first, AssemblyOptions::default())
        .unwrap_err();
    assert!(matches!(err, TemplateResolutionError::DestinationExists(_)));

    std::fs::write(first.join("stale.txt"), "left over").unwrap();
    assembler
        .assemble(&workspace.mesh(), &params, &first, AssemblyOptions::overwrite())
        .unwrap();
    assert_eq!(snapshot(&first), snapshot(&second));
}

#[tokio::test]
async fn unresolved_placeholder_fails_without_leaving_a_case() {
    let workspace = Workspace::new().unwrap();
    let assembler = CaseAssembler::new(workspace.template());
    let destination = workspace.root().join("broken");
    let err = assembler
        .assemble(
            &workspace.mesh(),
            &example_wind_tunnel().to_params(),
            &destination,
            AssemblyOptions::default(),
        )
        .unwrap_err();

    match err {
        TemplateResolutionError::Unresolved { name, file } => {
            assert_eq!(name, "num_iterations");
            assert_eq!(file, PathBuf::from("system/controlDict"));
        }
        other => panic!("expected unresolved placeholder, got {other:?}"),
    }
    assert!(!destination.exists());

    std::fs::write(
        workspace.template().join("constant/turbulenceProperties"),
        "model {{ turbulence_model }};\n",
    )
    .unwrap();
    let params = example_wind_tunnel()
        .to_params()
        .merged_with(&example_parameters().to_params());
    let err = assembler
        .assemble(&workspace.mesh(), &params, &destination, AssemblyOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        TemplateResolutionError::Unresolved { ref name, .. } if name == "turbulence_model"
    ));
}

#[tokio::test]
async fn missing_template_root_is_reported() {
    let workspace = Workspace::new().unwrap();
    let assembler = CaseAssembler::new(workspace.root().join("no-such-template"));
    let err = assembler
        .assemble(
            &workspace.mesh(),
            &ParamMap::new(),
            &workspace.root().join("case"),
            AssemblyOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TemplateResolutionError::MissingTemplateRoot(_)));
}

#[tokio::test]
async fn download_before_success_is_illegal() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_script(TaskScript::Stall);
    let task = submit_case(&backend, &workspace).await;

    let dest = workspace.root().join("outputs");
    let err = task.download_outputs(&dest).await.unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)), "got {err:?}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn failed_task_reports_failure_and_has_no_outputs() {
    let workspace = Workspace::new().unwrap();
    let backend =
        InMemoryBackend::new().with_script(TaskScript::FailAt(SolverStage::SteadyStateSolve));
    let task = submit_case(&backend, &workspace).await;

    assert_eq!(task.wait(fast_wait()).await.unwrap(), TaskStatus::Failed);
    assert_eq!(
        backend.progress(task.id()),
        Some(PipelineProgress::Failed(SolverStage::SteadyStateSolve))
    );
    let err = task
        .download_outputs(&workspace.root().join("outputs"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IllegalState(ref e) if e.state == "task is failed"));
}

#[tokio::test]
async fn wait_timeout_returns_last_status() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_script(TaskScript::Stall);
    let task = submit_case(&backend, &workspace).await;

    let options = WaitOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(60));
    let err = timeout(Duration::from_secs(5), task.wait(options))
        .await
        .expect("wait should honour its own timeout")
        .unwrap_err();

    match err {
        Error::Timeout {
            task_id,
            last_status,
        } => {
            assert_eq!(&task_id, task.id());
            assert_eq!(last_status, TaskStatus::Running);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_is_cancellable_and_task_survives() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_script(TaskScript::Stall);
    let task = submit_case(&backend, &workspace).await;

    let token = ShutdownToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        })
    };

    let options = WaitOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_shutdown(token);
    let err = timeout(Duration::from_secs(5), task.wait(options))
        .await
        .expect("cancellation should end the wait")
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(
        err,
        Error::WaitCancelled {
            last_status: TaskStatus::Running,
            ..
        }
    ));

    // Cancelling the wait does not touch the remote task.
    backend.finish(task.id(), true);
    assert_eq!(task.wait(fast_wait()).await.unwrap(), TaskStatus::Success);
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_script(TaskScript::Stall);
    let task = submit_case(&backend, &workspace).await;

    assert_eq!(task.get_status().await.unwrap(), TaskStatus::Running);
    backend.report_once(task.id(), TaskStatus::Queued);
    assert_eq!(task.get_status().await.unwrap(), TaskStatus::Running);

    backend.finish(task.id(), false);
    assert_eq!(task.get_status().await.unwrap(), TaskStatus::Failed);
    backend.report_once(task.id(), TaskStatus::Success);
    assert_eq!(task.get_status().await.unwrap(), TaskStatus::Failed);
    assert_eq!(task.last_status().await, TaskStatus::Failed);
}

#[tokio::test]
async fn unknown_task_id_is_unknown_job() {
    let backend = InMemoryBackend::new();
    let task = TaskHandle::attach(TaskId::new("task-does-not-exist"), backend.shared());
    let err = task.get_status().await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownJob(UnknownJobError { ref task_id }) if task_id.as_str() == "task-does-not-exist"
    ));
}

#[tokio::test]
async fn pool_must_be_started_before_binding() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new();
    let pool = MachinePool::create(pool_spec(), backend.shared());
    let case_root = workspace.root().join("case");
    let pipeline = CommandPipeline::steady_state();

    let err = submit(backend.shared(), &case_root, &pipeline, Some(&pool))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IllegalState(ref e) if e.state == "created"));
    backend.assert_submission_count_eq(0);

    let first = pool.start().await.unwrap();
    let second = pool.start().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(pool.state().await, PoolState::Started);
    assert_eq!(backend.active_pools(), 1);

    submit(backend.shared(), &case_root, &pipeline, Some(&pool))
        .await
        .unwrap();

    pool.stop().await.unwrap();
    pool.stop().await.unwrap();
    assert_eq!(pool.state().await, PoolState::Stopped);
    assert!(backend.pool(&first).unwrap().released);

    let err = submit(backend.shared(), &case_root, &pipeline, Some(&pool))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
    assert!(matches!(pool.start().await, Err(Error::IllegalState(_))));
    backend.assert_submission_count_eq(1);
}

#[tokio::test]
async fn provisioning_failure_is_surfaced_not_retried() {
    let backend = InMemoryBackend::new();
    backend.fail_provisioning("quota exceeded for c2-standard-16");
    let pool = MachinePool::create(pool_spec(), backend.shared());

    let err = pool.start().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "backend failed to provision pool: quota exceeded for c2-standard-16"
    );
    match err {
        Error::Provisioning(ProvisioningError::Backend(message)) => {
            assert_eq!(message, "quota exceeded for c2-standard-16");
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }
    assert_eq!(pool.state().await, PoolState::Created);
    assert_eq!(backend.active_pools(), 0);
}

#[tokio::test]
async fn default_pool_submission_has_no_pool_binding() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new();
    submit_case(&backend, &workspace).await;
    assert_eq!(backend.submissions()[0].pool, None);
}

#[tokio::test]
async fn concurrent_submissions_share_one_pool() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new();
    let pool = MachinePool::create(pool_spec(), backend.shared());
    let pool_id = pool.start().await.unwrap();
    let pipeline = CommandPipeline::steady_state();

    let cases: Vec<PathBuf> = (0..16)
        .map(|i| workspace.root().join(format!("case-{i}")))
        .collect();
    let handles = join_all(cases.iter().map(|case| {
        let pool = pool.clone();
        let backend = backend.shared();
        let pipeline = &pipeline;
        async move { submit(backend, case, pipeline, Some(&pool)).await }
    }))
    .await;

    let mut ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.unwrap().id().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    backend.assert_submission_count_eq(16);
    assert!(backend
        .submissions()
        .iter()
        .all(|s| s.pool.as_ref() == Some(&pool_id)));
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let workspace = Workspace::new().unwrap();
    let backend = InMemoryBackend::new().with_queued_polls(1);
    let bus: Arc<dyn TaskEventPublisher> = Arc::new(InProcEventBus::new(64));
    let mut rx = bus.subscribe();
    let events = Some(Arc::clone(&bus));

    let pool = MachinePool::with_events(pool_spec(), backend.shared(), events.clone());
    pool.start().await.unwrap();
    let scenario = WindTunnelScenario::new(
        example_wind_tunnel(),
        workspace.template(),
        workspace.config(),
        backend.shared(),
    )
    .with_events(events);
    let task = scenario
        .simulate(&workspace.mesh(), &example_parameters(), Some(&pool))
        .await
        .unwrap();
    task.wait(fast_wait()).await.unwrap();
    pool.stop().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event.payload {
            TaskEventPayload::PoolStarted { .. } => "pool_started".to_string(),
            TaskEventPayload::PoolStopped { .. } => "pool_stopped".to_string(),
            TaskEventPayload::Submitted { .. } => "submitted".to_string(),
            TaskEventPayload::StatusChanged { from, to, .. } => format!("{from}->{to}"),
            TaskEventPayload::OutputsDownloaded { .. } => "downloaded".to_string(),
            _ => "other".to_string(),
        });
    }
    assert_eq!(
        kinds,
        vec![
            "pool_started",
            "submitted",
            "queued->running",
            "running->success",
            "pool_stopped"
        ]
    );
}
