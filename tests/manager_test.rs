/// Session manager behaviour against the scripted fake runtime
mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use codecell::constants::{LIMIT_EXIT_STATUS, TIMEOUT_EXIT_STATUS, TRUNCATION_MARKER};
    use codecell::events::SessionEvent;
    use codecell::language::Language;
    use codecell::manager::SessionManager;
    use codecell::session::SessionState;
    use codecell::{ExecError, ExecutionRequest, InputFile, TerminationReason};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn python(script: &str) -> ExecutionRequest {
        ExecutionRequest::new(Language::Python, script)
    }

    #[tokio::test]
    async fn test_hello_world_completes_and_tears_down() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager.execute(python("print hello")).await.unwrap();

        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_eq!(result.exit_status, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert!(!result.truncated);
        assert!(result.session_id.is_some());

        assert_eq!(manager.live_count(), 0);
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.destroyed(), 1);
        assert!(session_dirs(root.path()).is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_still_completed() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager
            .execute(python("eprint boom\nexit 3\nprint unreachable"))
            .await
            .unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.stderr, "boom\n");
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn test_compile_failure_skips_run_step() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager
            .execute(ExecutionRequest::new(
                Language::Cpp,
                "COMPILE_ERROR\nprint never",
            ))
            .await
            .unwrap();

        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_eq!(result.exit_status, 1);
        assert_eq!(result.message.as_deref(), Some("build step failed"));
        assert!(result.stderr.contains("error: COMPILE_ERROR"));
        assert_eq!(result.stdout, "");
        assert_eq!(runtime.execs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compiled_languages_build_then_run() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let cpp = manager
            .execute(ExecutionRequest::new(Language::Cpp, "print from cpp"))
            .await
            .unwrap();
        assert_eq!(cpp.stdout, "from cpp\n");

        let java_source = "public class Greeter {\nprint from java\n}";
        let java = manager
            .execute(ExecutionRequest::new(Language::Java, java_source))
            .await
            .unwrap();
        assert_eq!(java.exit_status, 0);
        assert_eq!(java.stdout, "from java\n");
        assert_eq!(runtime.execs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_kills_process() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let started = Instant::now();
        let result = manager
            .execute(python("print started\nsleep 10000").with_timeout_ms(200))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.termination_reason, TerminationReason::Timeout);
        assert_eq!(result.exit_status, TIMEOUT_EXIT_STATUS);
        assert_eq!(
            result.message.as_deref(),
            Some("wall-clock limit of 200 ms exceeded")
        );
        assert_eq!(result.stdout, "started\n");
        assert!(result.elapsed_ms >= 200);
        assert_eq!(runtime.kills(), 1);
        assert_eq!(runtime.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_override_clamped_to_ceiling() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.default_timeout_ms = 100;
        config.max_timeout_ms = 300;
        let manager = manager_with(config, &runtime);

        let result = manager
            .execute(python("sleep 10000").with_timeout_ms(60_000))
            .await
            .unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Timeout);
        assert_eq!(
            result.message.as_deref(),
            Some("wall-clock limit of 300 ms exceeded")
        );
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let err = manager
            .execute(python("print x").with_timeout_ms(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn test_oom_kill_reports_resource_limit() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager.execute(python("alloc 4096")).await.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::ResourceLimit);
        assert_eq!(result.exit_status, LIMIT_EXIT_STATUS);
        assert!(result.message.unwrap().contains("memory limit"));
    }

    #[tokio::test]
    async fn test_plain_sigkill_exit_is_not_a_limit() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager.execute(python("exit 137")).await.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_eq!(result.exit_status, 137);
        assert!(result.message.is_none());
    }

    #[tokio::test]
    async fn test_cpu_rlimit_reports_resource_limit() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.limits.cpu_time_ms = Some(2_000);
        let manager = manager_with(config, &runtime);

        let result = manager.execute(python("print spin\nxcpu")).await.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::ResourceLimit);
        assert_eq!(result.exit_status, LIMIT_EXIT_STATUS);
        assert_eq!(
            result.message.as_deref(),
            Some("cpu time limit of 2000 ms exceeded")
        );
        assert_eq!(result.stdout, "spin\n");
    }

    #[tokio::test]
    async fn test_sigxcpu_without_cpu_limit_is_plain_exit() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager.execute(python("xcpu")).await.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_eq!(result.exit_status, 152);
    }

    #[tokio::test]
    async fn test_memory_monitor_kills_runaway() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager
            .execute(python("hold 4096\nsleep 10000"))
            .await
            .unwrap();
        assert_eq!(result.termination_reason, TerminationReason::ResourceLimit);
        assert!(result.message.unwrap().contains("memory limit"));
        assert_eq!(runtime.kills(), 1);
    }

    #[tokio::test]
    async fn test_disk_quota_breach() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.limits.disk_bytes = 1024;
        let manager = manager_with(config, &runtime);

        let result = manager
            .execute(python("write big.bin 8192\nsleep 10000"))
            .await
            .unwrap();
        assert_eq!(result.termination_reason, TerminationReason::ResourceLimit);
        assert!(result.message.unwrap().contains("disk quota of 1024 bytes"));
        assert!(session_dirs(root.path()).is_empty());
    }

    #[tokio::test]
    async fn test_output_truncated_at_cap() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager
            .execute(python("spam 100000\neprint still here"))
            .await
            .unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 4096 + TRUNCATION_MARKER.len());
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.stderr, "still here\n");
    }

    #[tokio::test]
    async fn test_input_file_visible_to_program() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let request = python("cat data.txt")
            .with_input(InputFile::new("data.txt", b"1 2 3\n".to_vec()));
        let result = manager.execute(request).await.unwrap();
        assert_eq!(result.stdout, "1 2 3\n");
    }

    #[tokio::test]
    async fn test_sessions_never_see_each_others_files() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let first = manager
            .execute(python("write secret.txt 10\nls"))
            .await
            .unwrap();
        assert!(first.stdout.contains("secret.txt"));

        let second = manager.execute(python("ls")).await.unwrap();
        assert_eq!(second.stdout, "main.py\n");
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_disabled_language_is_unknown() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.languages = Some(vec![Language::Python]);
        let manager = manager_with(config, &runtime);

        let err = manager
            .execute(ExecutionRequest::new(Language::Javascript, "print x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::UnknownLanguage(_)));
        assert_eq!(manager.sessions_created(), 0);
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn test_unknown_language_identifier() {
        let err = ExecutionRequest::parse("cobol", "DISPLAY 'HI'").unwrap_err();
        assert!(matches!(err, ExecError::UnknownLanguage(_)));
    }

    #[tokio::test]
    async fn test_oversized_source_rejected() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.max_source_bytes = 16;
        let manager = manager_with(config, &runtime);

        let err = manager
            .execute(python("print this source is far too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidSource(_)));
    }

    #[tokio::test]
    async fn test_allocation_failure_is_internal_error_result() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        runtime.fail_create.store(true, Ordering::SeqCst);
        let manager = manager_with(test_config(root.path()), &runtime);

        let result = manager.execute(python("print x")).await.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::InternalError);
        assert_eq!(result.exit_status, 125);
        assert!(result.message.unwrap().contains("sandbox allocation failed"));
        assert_eq!(manager.live_count(), 0);
        assert!(session_dirs(root.path()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_slots() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .execute(python(&format!("sleep 50\nprint {}", i)))
                    .await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.stdout, format!("{}\n", i));
        }

        assert_eq!(runtime.created(), 6);
        assert_eq!(runtime.destroyed(), 6);
        assert!(runtime.peak_live() <= 2);
        assert!(manager.metrics().snapshot().peak_in_flight <= 2);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_slots_granted_in_arrival_order() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut config = test_config(root.path());
        config.max_sessions = 1;
        let manager =
            SessionManager::with_observer(config, runtime.clone(), observer.clone()).unwrap();

        let mut tasks = vec![{
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(python("sleep 200\nprint 0")).await })
        }];
        assert!(eventually(|| manager.live_count() == 1).await);
        for i in 1..=4 {
            let manager_for_task = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager_for_task
                    .execute(python(&format!("print {}", i)))
                    .await
            }));
            assert!(eventually(|| manager.queued() == i).await);
        }

        let mut result_ids = Vec::new();
        for (i, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.stdout, format!("{}\n", i));
            result_ids.push(result.session_id.unwrap());
        }

        let created_ids: Vec<_> = observer
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Created { session_id, .. } => Some(*session_id),
                _ => None,
            })
            .collect();
        assert_eq!(created_ids, result_ids);
        assert_eq!(runtime.peak_live(), 1);
    }

    #[tokio::test]
    async fn test_queue_wait_exhausted_is_overloaded() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.max_sessions = 1;
        config.queue_wait_ms = 50;
        let manager = manager_with(config, &runtime);

        let busy = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(python("sleep 1000")).await })
        };
        assert!(eventually(|| manager.live_count() == 1).await);

        let err = manager.execute(python("print late")).await.unwrap_err();
        match err {
            ExecError::Overloaded { waited_ms, .. } => assert!(waited_ms >= 50),
            other => panic!("expected Overloaded, got {:?}", other),
        }
        assert!(busy.await.unwrap().is_ok());
        assert_eq!(runtime.created(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.max_sessions = 1;
        config.max_queue_depth = 1;
        let manager = manager_with(config, &runtime);

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(python("sleep 300")).await })
        };
        assert!(eventually(|| manager.live_count() == 1).await);
        let queued = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(python("print queued")).await })
        };
        assert!(eventually(|| manager.queued() == 1).await);

        let started = Instant::now();
        let err = manager.execute(python("print third")).await.unwrap_err();
        assert!(matches!(err, ExecError::Overloaded { waited_ms: 0, .. }));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(running.await.unwrap().is_ok());
        assert_eq!(queued.await.unwrap().unwrap().stdout, "queued\n");
    }

    #[tokio::test]
    async fn test_observer_sees_lifecycle_in_order() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let observer = Arc::new(RecordingObserver::default());
        let manager =
            SessionManager::with_observer(test_config(root.path()), runtime.clone(), observer.clone())
                .unwrap();

        manager.execute(python("print hi")).await.unwrap();

        let events = observer.events.lock();
        let names: Vec<&str> = events
            .iter()
            .map(|e| match e {
                SessionEvent::Queued { .. } => "queued",
                SessionEvent::Created { .. } => "created",
                SessionEvent::Provisioned { .. } => "provisioned",
                SessionEvent::Running { .. } => "running",
                SessionEvent::Finished { .. } => "finished",
                SessionEvent::TornDown { .. } => "torn_down",
            })
            .collect();
        assert_eq!(
            names,
            vec!["created", "provisioned", "running", "finished", "torn_down"]
        );
        let ids: Vec<_> = events.iter().filter_map(|e| e.session_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        drop(events);
        assert_eq!(observer.finished_states(), vec![SessionState::Completed]);
    }

    #[tokio::test]
    async fn test_metrics_count_outcomes() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let manager = manager_with(test_config(root.path()), &runtime);

        manager.execute(python("print ok")).await.unwrap();
        manager
            .execute(python("sleep 5000").with_timeout_ms(50))
            .await
            .unwrap();
        let _ = manager.execute(python("")).await;

        let snap = manager.metrics().snapshot();
        assert_eq!(snap.created, 2);
        assert_eq!(snap.torn_down, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.in_flight, 0);
        assert!(manager
            .metrics()
            .encode()
            .contains("codecell_session_outcomes"));
    }

    #[tokio::test]
    async fn test_health_reports_missing_images() {
        let root = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_config(root.path());
        config.languages = Some(vec![Language::Python, Language::Java]);
        let manager = manager_with(config, &runtime);

        let healthy = manager.health().await;
        assert!(healthy.healthy);
        assert_eq!(healthy.images.len(), 2);
        assert_eq!(healthy.runtime_version.as_deref(), Some("fake 1.0"));

        runtime.mark_missing("stellar-java-sandbox:latest");
        let degraded = manager.health().await;
        assert!(!degraded.healthy);
        let java = degraded
            .images
            .iter()
            .find(|i| i.language == Language::Java)
            .unwrap();
        assert!(!java.available);

        runtime.unreachable.store(true, Ordering::SeqCst);
        let down = manager.health().await;
        assert!(!down.healthy);
        assert!(down.runtime_error.is_some());
    }
}
