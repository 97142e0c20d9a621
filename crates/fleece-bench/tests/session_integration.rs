//! End-to-end session tests with in-process engine and GPU fakes

use async_trait::async_trait;
use fleece_bench::{
    BenchError, BenchMode, EngineOutput, GpuMonitor, GpuSnapshot, GroupKey, InferenceEngine,
    InvocationRequest, PromptSpec, Result, Session, SessionConfig, StatField,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn transcript(rate: f64) -> String {
    format!(
        "Here is a response.\n\n\
         total duration:       1.5s\n\
         load duration:        10ms\n\
         prompt eval count:    12 token(s)\n\
         prompt eval duration: 100ms\n\
         prompt eval rate:     120.00 tokens/s\n\
         eval count:           100 token(s)\n\
         eval duration:        1.0s\n\
         eval rate:            {:.2} tokens/s\n",
        rate
    )
}

#[derive(Default)]
struct FakeEngine {
    invocations: AtomicUsize,
    unloads: AtomicUsize,
    rates: Mutex<VecDeque<f64>>,
    delay: Option<Duration>,
    fail: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeEngine {
    fn with_rates(rates: &[f64]) -> Self {
        Self {
            rates: Mutex::new(rates.iter().copied().collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn invoke(&self, request: &InvocationRequest) -> Result<EngineOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(BenchError::Engine("engine binary missing".to_string()));
        }
        let rate = self.rates.lock().unwrap().pop_front().unwrap_or(100.0);
        Ok(EngineOutput {
            transcript: transcript(rate),
            exit_code: Some(0),
        })
    }

    async fn unload(&self, _model: &str) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Err(BenchError::Engine("model not loaded".to_string()))
    }

    async fn version(&self) -> Option<String> {
        Some("fake-engine 1.0".to_string())
    }
}

struct FixedMonitor;

#[async_trait]
impl GpuMonitor for FixedMonitor {
    async fn query(&self) -> Result<GpuSnapshot> {
        Ok(GpuSnapshot {
            memory_used: 6144.0,
            memory_total: 24576.0,
            utilization_pct: 95.0,
            power_draw: 280.0,
            temperature: 68.0,
        })
    }

    async fn describe(&self) -> Option<String> {
        Some("Fake GPU, 550.00".to_string())
    }
}

#[derive(Default)]
struct CountingMonitor {
    calls: AtomicUsize,
}

#[async_trait]
impl GpuMonitor for CountingMonitor {
    async fn query(&self) -> Result<GpuSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        FixedMonitor.query().await
    }
}

struct BrokenMonitor;

#[async_trait]
impl GpuMonitor for BrokenMonitor {
    async fn query(&self) -> Result<GpuSnapshot> {
        Err(BenchError::Telemetry("nvidia-smi not found".to_string()))
    }
}

fn matrix(dir: &Path) -> SessionConfig {
    SessionConfig {
        models: vec!["llama3:8b".to_string(), "qwen2:7b".to_string()],
        prompts: vec![
            PromptSpec::new("short", "Why is the sky blue?"),
            PromptSpec::new("long", "Write an essay about rivers."),
        ],
        repeats: 3,
        warmup: 1,
        output_dir: dir.to_path_buf(),
        telemetry_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn single_cell(dir: &Path, model: &str) -> SessionConfig {
    SessionConfig {
        models: vec![model.to_string()],
        prompts: vec![PromptSpec::new("short", "Why is the sky blue?")],
        repeats: 1,
        warmup: 0,
        output_dir: dir.to_path_buf(),
        telemetry_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn run_default_matrix(dir: &Path) -> fleece_bench::SessionOutcome {
    let engine = Arc::new(FakeEngine::default());
    Session::new(matrix(dir), engine, Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_by_two_by_three_matrix() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(FakeEngine::default());
    let session = Session::new(matrix(dir.path()), engine.clone(), Arc::new(FixedMonitor));

    let outcome = session.run().await.unwrap();

    assert_eq!(outcome.records.len(), 12);
    assert!(outcome.records.iter().all(|r| r.ran_this_time));
    assert!(outcome.records.iter().all(|r| r.metrics.eval_rate == Some(100.0)));
    assert!(outcome.records.iter().all(|r| r.run_end >= r.run_start));
    // 12 cells plus one warmup per model
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 14);
    assert_eq!(engine.unloads.load(Ordering::SeqCst), 0);

    let fine: Vec<_> = outcome
        .summary
        .iter()
        .filter(|r| r.group_value(GroupKey::Prompt) != Some("ALL"))
        .collect();
    assert_eq!(fine.len(), 4);
    for row in fine {
        let rate = row.stat(StatField::EvalRate).unwrap();
        assert_eq!(row.runs, 3);
        assert_eq!(rate.mean, 100.0);
        assert_eq!(rate.stddev, 0.0);
        assert!(!row.high_variance);
    }
    assert_eq!(outcome.summary.len(), 6);

    let results = std::fs::read_to_string(&outcome.paths.results_csv).unwrap();
    assert_eq!(results.lines().count(), 13);
    let summary = std::fs::read_to_string(&outcome.paths.summary_csv).unwrap();
    assert_eq!(summary.lines().count(), 7);
    let run_log = std::fs::read_to_string(&outcome.paths.run_log).unwrap();
    assert!(run_log.contains("SESSION STARTED"));
    assert!(run_log.contains("engine: fake-engine 1.0"));
    assert!(run_log.contains("SESSION COMPLETE: 12 records"));
}

#[tokio::test]
async fn test_resume_skips_complete_artifacts() {
    let dir = tempdir().unwrap();
    run_default_matrix(dir.path()).await;

    let mut config = matrix(dir.path());
    config.resume = true;
    let engine = Arc::new(FakeEngine::default());
    let second = Session::new(config, engine.clone(), Arc::new(FixedMonitor));
    let outcome = second.run().await.unwrap();

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.records.len(), 12);
    for record in &outcome.records {
        assert!(!record.ran_this_time);
        assert!(record.run_start.is_none());
        assert!(record.run_end.is_none());
        assert_eq!(record.metrics.eval_rate, Some(100.0));
    }
    let run_log = std::fs::read_to_string(&outcome.paths.run_log).unwrap();
    assert!(run_log.contains("SESSION RESUMED"));
}

#[tokio::test]
async fn test_resume_reruns_incomplete_artifact() {
    let dir = tempdir().unwrap();
    let outcome = run_default_matrix(dir.path()).await;

    let broken = outcome
        .paths
        .artifact("qwen2:7b", "long", BenchMode::Steady, 2);
    std::fs::write(&broken, "total duration: 1.5s\n(interrupted)").unwrap();

    let mut config = matrix(dir.path());
    config.resume = true;
    let engine = Arc::new(FakeEngine::default());
    let second = Session::new(config, engine.clone(), Arc::new(FixedMonitor));
    let outcome = second.run().await.unwrap();

    // the re-run cell plus one warmup for its model
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 2);
    let ran: Vec<_> = outcome.records.iter().filter(|r| r.ran_this_time).collect();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].model, "qwen2:7b");
    assert_eq!(ran[0].prompt_id, "long");
    assert_eq!(ran[0].repeat_index, 2);
}

#[tokio::test]
async fn test_resume_does_not_cross_modes() {
    let dir = tempdir().unwrap();
    run_default_matrix(dir.path()).await;

    let mut config = matrix(dir.path());
    config.resume = true;
    config.mode = BenchMode::Fresh;
    let engine = Arc::new(FakeEngine::default());
    let outcome = Session::new(config, engine.clone(), Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    assert!(outcome.records.iter().all(|r| r.ran_this_time && r.mode == BenchMode::Fresh));
}

#[tokio::test]
async fn test_fresh_mode_unloads_before_every_repeat() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.mode = BenchMode::Fresh;
    config.warmup = 0;
    let engine = Arc::new(FakeEngine::default());
    let outcome = Session::new(config, engine.clone(), Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    assert_eq!(engine.unloads.load(Ordering::SeqCst), 12);
    assert!(outcome.records.iter().all(|r| r.mode == BenchMode::Fresh));
    assert!(outcome
        .summary
        .iter()
        .all(|r| r.group_value(GroupKey::Mode) == Some("fresh")));
}

#[tokio::test]
async fn test_config_error_aborts_before_sampling() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let mut config = matrix(&out);
    config.models.clear();
    let engine = Arc::new(FakeEngine::default());

    let result = Session::new(config, engine.clone(), Arc::new(FixedMonitor)).run().await;

    assert!(matches!(result, Err(BenchError::Config(_))));
    assert!(!out.join("telemetry.log").exists());
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_engine_failures_are_recorded_not_raised() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    let engine = Arc::new(FakeEngine {
        fail: true,
        ..Default::default()
    });

    let outcome = Session::new(config, engine, Arc::new(BrokenMonitor))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 6);
    for record in &outcome.records {
        assert!(record.ran_this_time);
        assert!(record.metrics.is_empty());
        assert!(record.parse_warnings.contains("engine_error"));
        assert!(record.parse_warnings.contains("empty_transcript"));
        assert!(record.parse_warnings.contains("no_telemetry_samples"));
        assert_eq!(record.gpu.sample_count, 0);
    }
    assert!(outcome.summary.iter().all(|r| r.stat(StatField::EvalRate).is_none()));
    assert_eq!(outcome.sampler.samples_written, 0);
}

#[tokio::test]
async fn test_timeout_is_a_warning() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    config.prompts.truncate(1);
    config.repeats = 1;
    config.warmup = 0;
    config.invocation_timeout = Some(Duration::from_millis(20));
    let engine = Arc::new(FakeEngine {
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });

    let outcome = Session::new(config, engine, Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.records[0].parse_warnings.contains("engine_timeout"));
    assert!(outcome.records[0].ran_this_time);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_telemetry_is_correlated_per_run() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    config.prompts.truncate(1);
    config.repeats = 2;
    config.warmup = 0;
    let engine = Arc::new(FakeEngine {
        delay: Some(Duration::from_millis(150)),
        ..Default::default()
    });

    let outcome = Session::new(config, engine, Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    for record in &outcome.records {
        assert!(record.gpu.sample_count > 0);
        assert_eq!(record.gpu.util_mean, Some(95.0));
        assert_eq!(record.gpu.power_max, Some(280.0));
        assert_eq!(record.gpu.mem_max, Some(6144.0));
        assert!(!record.parse_warnings.contains("no_telemetry_samples"));
    }
    assert!(outcome.sampler.samples_written > 0);
}

#[tokio::test]
async fn test_injected_variance_at_threshold() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    config.prompts.truncate(1);
    config.warmup = 0;
    let engine = Arc::new(FakeEngine::with_rates(&[90.0, 100.0, 110.0]));

    let outcome = Session::new(config, engine, Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    let row = &outcome.summary[0];
    let rate = row.stat(StatField::EvalRate).unwrap();
    assert_eq!(rate.mean, 100.0);
    assert!((rate.stddev - 10.0).abs() < 1e-9);
    assert!((rate.cv_pct.unwrap() - 10.0).abs() < 1e-9);
    assert!(!row.high_variance);
}

#[tokio::test]
async fn test_document_is_prepended() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    config.prompts.truncate(1);
    config.repeats = 1;
    config.warmup = 0;
    config.document = Some("CONTEXT DOC".to_string());
    let engine = Arc::new(FakeEngine::default());

    Session::new(config, engine.clone(), Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    let prompts = engine.prompts.lock().unwrap();
    assert_eq!(prompts.as_slice(), ["CONTEXT DOC\n\nWhy is the sky blue?".to_string()]);
}

#[tokio::test]
async fn test_progress_events() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models.truncate(1);
    let seen = Arc::new(AtomicUsize::new(0));
    let warmups = Arc::new(AtomicUsize::new(0));
    let (seen_cb, warmups_cb) = (seen.clone(), warmups.clone());

    Session::new(config, Arc::new(FakeEngine::default()), Arc::new(FixedMonitor))
        .with_progress(move |event| match event {
            fleece_bench::SessionEvent::CellFinished { .. } => {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            }
            fleece_bench::SessionEvent::Warmup { eval_rate, .. } => {
                assert_eq!(*eval_rate, Some(100.0));
                warmups_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .run()
        .await
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 6);
    assert_eq!(warmups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_keeps_similar_model_names_apart() {
    let dir = tempdir().unwrap();
    let first = Session::new(
        single_cell(dir.path(), "org/model"),
        Arc::new(FakeEngine::with_rates(&[42.0])),
        Arc::new(FixedMonitor),
    );
    first.run().await.unwrap();

    let mut config = single_cell(dir.path(), "org_model");
    config.resume = true;
    let engine = Arc::new(FakeEngine::default());
    let outcome = Session::new(config, engine.clone(), Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
    let record = &outcome.records[0];
    assert_eq!(record.model, "org_model");
    assert!(record.ran_this_time);
    assert_eq!(record.metrics.eval_rate, Some(100.0));

    let original = outcome.paths.artifact("org/model", "short", BenchMode::Steady, 1);
    let renamed = outcome.paths.artifact("org_model", "short", BenchMode::Steady, 1);
    assert_ne!(original, renamed);
    assert!(std::fs::read_to_string(original).unwrap().contains("42.00 tokens/s"));
}

#[tokio::test]
async fn test_duplicate_model_is_a_config_error() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.models = vec!["llama3:8b".to_string(), "llama3:8b".to_string()];
    let engine = Arc::new(FakeEngine::default());

    let result = Session::new(config, engine.clone(), Arc::new(FixedMonitor)).run().await;

    assert!(matches!(result, Err(BenchError::Config(_))));
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prompt_named_like_rollup_is_a_config_error() {
    let dir = tempdir().unwrap();
    let mut config = matrix(dir.path());
    config.prompts.push(PromptSpec::new("ALL", "Answer every question."));

    let result = Session::new(config, Arc::new(FakeEngine::default()), Arc::new(FixedMonitor))
        .run()
        .await;

    assert!(matches!(result, Err(BenchError::Config(_))));
}

#[tokio::test]
async fn test_cancelled_session_stops_sampling() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(FakeEngine {
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let monitor = Arc::new(CountingMonitor::default());
    let session = Session::new(single_cell(dir.path(), "llama3:8b"), engine, monitor.clone());

    let result = tokio::time::timeout(Duration::from_millis(200), session.run()).await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_cancel = monitor.calls.load(Ordering::SeqCst);
    assert!(after_cancel > 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.calls.load(Ordering::SeqCst), after_cancel);
}

#[tokio::test]
async fn test_io_error_after_sampler_start_stops_sampling() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("results.csv")).unwrap();
    let monitor = Arc::new(CountingMonitor::default());
    let engine = Arc::new(FakeEngine::default());
    let config = single_cell(dir.path(), "llama3:8b");
    let session = Session::new(config, engine.clone(), monitor.clone());

    let result = session.run().await;

    assert!(matches!(result, Err(BenchError::Io(_))));
    assert!(dir.path().join("telemetry.log").exists());
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);

    let after_error = monitor.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.calls.load(Ordering::SeqCst), after_error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_carries_over_previous_results() {
    let dir = tempdir().unwrap();
    let mut config = single_cell(dir.path(), "llama3:8b");
    config.repeats = 2;
    let engine = Arc::new(FakeEngine {
        delay: Some(Duration::from_millis(150)),
        ..Default::default()
    });
    let first = Session::new(config.clone(), engine, Arc::new(FixedMonitor))
        .run()
        .await
        .unwrap();
    assert!(first.records.iter().all(|r| r.gpu.sample_count > 0));

    config.resume = true;
    let engine = Arc::new(FakeEngine::default());
    let outcome = Session::new(config, engine.clone(), Arc::new(BrokenMonitor))
        .run()
        .await
        .unwrap();

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
    for (before, after) in first.records.iter().zip(&outcome.records) {
        assert!(!after.ran_this_time);
        assert!(after.run_start.is_none());
        assert_eq!(after.exit_code, Some(0));
        assert_eq!(after.gpu, before.gpu);
        assert_eq!(after.parse_warnings, before.parse_warnings);
    }
    let util = outcome.summary[0].stat(StatField::GpuUtilMean).unwrap();
    assert_eq!(util.count, 2);
    assert_eq!(util.mean, 95.0);

    let reloaded = fleece_bench::report::read_results_csv(&outcome.paths.results_csv).unwrap();
    assert!(reloaded.iter().all(|r| r.gpu.sample_count > 0));
    let run_log = std::fs::read_to_string(&outcome.paths.run_log).unwrap();
    assert!(run_log.contains("carrying over 2 rows"));
}
