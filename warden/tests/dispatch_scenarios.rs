//! End-to-end dispatch scenarios against a scripted remote.
//!
//! Each test drives `run_dispatch` through the full probe sequence and checks
//! the resolved outcome, its exit code, and which remote steps ran.

use std::time::Duration;

use warden::cancel::{CancelCause, CancelToken, TriggerKind};
use warden::core::types::DispatchOutcome;
use warden::dispatch::{
    DispatchContext, DispatchRequest, DispatchResult, DispatchSinks, NotBootstrappedError,
    run_dispatch,
};
use warden::exit_codes;
use warden::io::config::WardenConfig;
use warden::io::credentials::Credentials;
use warden::io::guards::ActiveSessionError;
use warden::io::probes::Probe;
use warden::io::remote::ExecOutput;
use warden::offrails::OffRailsConfig;
use warden::stream::StreamMode;
use warden::test_support::{Reply, ScriptedRemote, SessionEnd, SharedBuf};

const TARGET: &str = "moss";

struct Harness {
    config: WardenConfig,
    credentials: Credentials,
    offrails: OffRailsConfig,
    cancel: CancelToken,
    stdout: SharedBuf,
    stderr: SharedBuf,
    alerts: SharedBuf,
}

impl Harness {
    fn new() -> Self {
        Self {
            config: WardenConfig::default(),
            credentials: Credentials::from_pairs([("GITHUB_TOKEN", "ghp_test")]),
            offrails: OffRailsConfig {
                silence_abort: Duration::from_secs(60),
                silence_warn: Duration::from_secs(30),
                error_repeat: 3,
                check_interval: Duration::from_millis(20),
            },
            cancel: CancelToken::new(),
            stdout: SharedBuf::new(),
            stderr: SharedBuf::new(),
            alerts: SharedBuf::new(),
        }
    }

    fn with_silence_abort(mut self, abort: Duration) -> Self {
        self.offrails.silence_abort = abort;
        self.offrails.silence_warn = abort / 2;
        self
    }

    fn run(&self, remote: &ScriptedRemote, request: &DispatchRequest) -> anyhow::Result<DispatchResult> {
        let ctx = DispatchContext {
            remote,
            config: &self.config,
            credentials: &self.credentials,
            offrails: self.offrails.clone(),
            cancel: self.cancel.clone(),
        };
        let sinks = DispatchSinks {
            stdout: Box::new(self.stdout.clone()),
            stderr: Box::new(self.stderr.clone()),
            alerts: Box::new(self.alerts.clone()),
        };
        run_dispatch(&ctx, request, sinks)
    }
}

fn request() -> DispatchRequest {
    DispatchRequest {
        target: TARGET.to_string(),
        task: "fix the flaky retry test".to_string(),
        repo: "misty-step/heartbeat".parse().expect("repo"),
        timeout: Duration::from_secs(30 * 60),
        max_iterations: 12,
        dry_run: false,
        mode: StreamMode::Narrate,
    }
}

fn outcome(result: &DispatchResult) -> &DispatchOutcome {
    match result {
        DispatchResult::Completed { outcome, .. } => outcome,
        DispatchResult::Ready(_) => panic!("expected a completed dispatch, got dry run"),
    }
}

fn marker_absent() -> ExecOutput {
    ExecOutput::with_code(1, "")
}

fn tool_error_event(message: &str) -> String {
    format!(
        "{{\"type\":\"user\",\"message\":{{\"content\":[{{\"type\":\"tool_result\",\"content\":\"{message}\",\"is_error\":true}}]}}}}\n"
    )
}

#[test]
fn clean_exit_runs_every_step_in_order() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new()
        .on(Probe::Verify, ExecOutput::ok("abc1234 fix retry\n"))
        .session_stdout([
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working on it\"}]}}\n",
        ])
        .session_end(SessionEnd::Exit(0));

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(outcome(&result), &DispatchOutcome::Success);
    assert_eq!(result.exit_code(), exit_codes::OK);
    assert_eq!(
        remote.probes(),
        vec![
            Probe::Connectivity,
            Probe::Bootstrap,
            Probe::ActiveLoop,
            Probe::Cleanup,
            Probe::Sync,
            Probe::ClearMarkers,
            Probe::UploadTask,
            Probe::RecordStatus,
            Probe::Session,
            Probe::Verify,
        ]
    );
    assert!(harness.stdout.contents().contains("working on it"));
    let progress = harness.stderr.contents();
    assert!(progress.contains("=== work produced ==="), "{progress}");
    assert!(progress.contains("abc1234 fix retry"), "{progress}");
    assert!(progress.contains("=== task completed ==="), "{progress}");
}

#[test]
fn uploaded_task_and_status_carry_the_request() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new();

    harness.run(&remote, &request()).expect("dispatch");

    let task = remote.stdin(Probe::UploadTask).expect("task upload");
    assert!(task.contains("fix the flaky retry test"), "{task}");
    assert!(task.contains("misty-step/heartbeat"), "{task}");

    let status = remote.stdin(Probe::RecordStatus).expect("status upload");
    let payload: serde_json::Value = serde_json::from_str(&status).expect("status json");
    assert_eq!(payload["task"], "fix the flaky retry test");
    assert_eq!(payload["repo"], "misty-step/heartbeat");
    assert_eq!(payload["mode"], "dispatch");

    let session = remote.scripts(Probe::Session).remove(0);
    assert!(session.contains("MAX_ITERATIONS=12"), "{session}");
    assert!(session.contains("WARDEN_TIMEOUT_SEC=1800"), "{session}");
}

#[test]
fn silence_abort_with_completion_marker_counts_as_success() {
    let harness = Harness::new().with_silence_abort(Duration::from_millis(150));
    let remote = ScriptedRemote::new()
        .on(Probe::CompletionMarker, ExecOutput::ok(""))
        .session_end(SessionEnd::HangUntilCancelled);

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(outcome(&result), &DispatchOutcome::OffRailsCompleted);
    assert_eq!(result.exit_code(), exit_codes::OK);
    assert_eq!(remote.count(Probe::NewWork), 0);
    assert_eq!(
        harness.cancel.cause().map(|cause| cause.kind),
        Some(TriggerKind::Silence)
    );
    assert!(harness.alerts.contents().contains("[off-rails] aborting"));
}

#[test]
fn silence_abort_with_new_commits_counts_as_work_found() {
    let harness = Harness::new().with_silence_abort(Duration::from_millis(150));
    let remote = ScriptedRemote::new()
        .on(Probe::CompletionMarker, marker_absent())
        .on(Probe::NewWork, ExecOutput::ok("abc1234 partial fix\n"))
        .session_end(SessionEnd::HangUntilCancelled);

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(outcome(&result), &DispatchOutcome::OffRailsWorkFound);
    assert_eq!(result.exit_code(), exit_codes::OK);
}

#[test]
fn silence_abort_without_evidence_exits_off_rails() {
    let harness = Harness::new().with_silence_abort(Duration::from_millis(150));
    let remote = ScriptedRemote::new()
        .on(Probe::CompletionMarker, marker_absent())
        .on(Probe::NewWork, ExecOutput::with_code(1, ""))
        .session_end(SessionEnd::HangUntilCancelled);

    let result = harness.run(&remote, &request()).expect("dispatch");

    let DispatchOutcome::OffRailsNoWork(cause) = outcome(&result) else {
        panic!("expected off-rails without work, got {:?}", outcome(&result));
    };
    assert_eq!(cause.kind, TriggerKind::Silence);
    assert!(cause.message.contains("no output for"), "{}", cause.message);
    assert_eq!(result.exit_code(), exit_codes::OFF_RAILS);
    assert!(
        harness
            .stderr
            .contents()
            .contains("=== dispatch stopped by off-rails detector")
    );
}

#[test]
fn failed_evidence_probes_count_as_no_work() {
    let harness = Harness::new().with_silence_abort(Duration::from_millis(150));
    let remote = ScriptedRemote::new()
        .on_error(Probe::CompletionMarker, "connection reset")
        .on(Probe::NewWork, ExecOutput::with_code(2, ""))
        .session_end(SessionEnd::HangUntilCancelled);

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(result.exit_code(), exit_codes::OFF_RAILS);
}

#[test]
fn repeated_tool_error_aborts_as_error_loop() {
    let harness = Harness::new();
    let error = tool_error_event("Error: file /tmp/build-123/out.log not found");
    let remote = ScriptedRemote::new()
        .on(Probe::CompletionMarker, marker_absent())
        .on(Probe::NewWork, ExecOutput::with_code(1, ""))
        .session_stdout([error.clone(), error.clone(), error])
        .session_end(SessionEnd::HangUntilCancelled);

    let result = harness.run(&remote, &request()).expect("dispatch");

    let DispatchOutcome::OffRailsNoWork(cause) = outcome(&result) else {
        panic!("expected error loop abort, got {:?}", outcome(&result));
    };
    assert_eq!(cause.kind, TriggerKind::ErrorLoop);
    assert!(cause.message.contains("repeated 3 times"), "{}", cause.message);
    assert!(harness.alerts.contents().contains("same error repeated 3 times"));
}

#[test]
fn off_rails_cause_wins_over_clean_exit() {
    let harness = Harness::new();
    let error = tool_error_event("permission denied");
    let remote = ScriptedRemote::new()
        .on(Probe::CompletionMarker, marker_absent())
        .on(Probe::NewWork, ExecOutput::with_code(1, ""))
        .session_stdout([error.clone(), error.clone(), error])
        .session_end(SessionEnd::Exit(0));

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(result.exit_code(), exit_codes::OFF_RAILS);
}

#[test]
fn blocked_exit_reports_reason() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new()
        .on(
            Probe::BlockedReason,
            ExecOutput::ok("need a staging database URL\n"),
        )
        .session_end(SessionEnd::Exit(exit_codes::BLOCKED));

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(
        outcome(&result),
        &DispatchOutcome::Blocked("need a staging database URL".to_string())
    );
    assert_eq!(result.exit_code(), exit_codes::BLOCKED);
    assert!(
        harness
            .stderr
            .contents()
            .contains("=== agent blocked: need a staging database URL ===")
    );
}

#[test]
fn blocked_without_note_points_at_target() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new()
        .on_error(Probe::BlockedReason, "timed out")
        .session_end(SessionEnd::Exit(exit_codes::BLOCKED));

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(
        outcome(&result),
        &DispatchOutcome::Blocked("check BLOCKED.md on moss".to_string())
    );
}

#[test]
fn other_exit_code_is_forwarded() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().session_end(SessionEnd::Exit(17));

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(outcome(&result), &DispatchOutcome::OtherFailure(Some(17)));
    assert_eq!(result.exit_code(), 17);
    assert_eq!(remote.count(Probe::CompletionMarker), 0);
}

#[test]
fn active_session_blocks_dispatch() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().on(
        Probe::ActiveLoop,
        ExecOutput::with_code(1, "4242 bash /home/sprite/workspace/.ralph.sh\n"),
    );

    let err = harness.run(&remote, &request()).expect_err("guard should block");

    let active = err
        .downcast_ref::<ActiveSessionError>()
        .expect("active session error");
    assert!(active.listing.contains("4242"));
    assert_eq!(remote.count(Probe::Cleanup), 0);
    assert_eq!(remote.count(Probe::Session), 0);
}

#[test]
fn missing_bootstrap_names_setup_command() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().on(Probe::Bootstrap, ExecOutput::with_code(1, ""));

    let err = harness.run(&remote, &request()).expect_err("not bootstrapped");

    let missing = err
        .downcast_ref::<NotBootstrappedError>()
        .expect("bootstrap error");
    assert_eq!(missing.hint, "run: bb setup moss --repo misty-step/heartbeat");
    assert_eq!(
        remote.probes(),
        vec![Probe::Connectivity, Probe::Bootstrap]
    );
}

#[test]
fn unreachable_target_fails_before_any_change() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().on_error(Probe::Connectivity, "ssh: connect refused");

    let err = harness.run(&remote, &request()).expect_err("unreachable");

    assert!(format!("{err:#}").contains("unreachable"), "{err:#}");
    assert_eq!(remote.probes(), vec![Probe::Connectivity]);
}

#[test]
fn missing_credentials_fail_before_remote_calls() {
    let mut harness = Harness::new();
    harness.credentials = Credentials::collect(&["GITHUB_TOKEN".to_string()], |_| None);
    let remote = ScriptedRemote::new();

    let err = harness.run(&remote, &request()).expect_err("missing token");

    assert_eq!(err.to_string(), "missing required credentials: GITHUB_TOKEN");
    assert!(remote.probes().is_empty());
}

#[test]
fn dry_run_stops_after_preconditions() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new();
    let mut request = request();
    request.dry_run = true;

    let result = harness.run(&remote, &request).expect("dry run");

    let DispatchResult::Ready(run) = &result else {
        panic!("expected dry run result");
    };
    assert_eq!(run.grace, Duration::from_secs(5 * 60));
    assert_eq!(result.exit_code(), exit_codes::OK);
    assert_eq!(
        remote.probes(),
        vec![Probe::Connectivity, Probe::Bootstrap, Probe::ActiveLoop]
    );
}

#[test]
fn sync_failure_aborts_before_session() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().on(Probe::Sync, ExecOutput::with_code(128, ""));

    let err = harness.run(&remote, &request()).expect_err("sync fails");

    assert!(format!("{err:#}").contains("repo sync"), "{err:#}");
    assert_eq!(remote.count(Probe::UploadTask), 0);
    assert_eq!(remote.count(Probe::Session), 0);
}

#[test]
fn best_effort_steps_do_not_abort() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new()
        .on_error(Probe::Cleanup, "cleanup hung")
        .on(Probe::ClearMarkers, ExecOutput::with_code(1, ""))
        .on_sequence(
            Probe::Verify,
            vec![Reply::TransportError("verify timed out".to_string())],
        );

    let result = harness.run(&remote, &request()).expect("dispatch");

    assert_eq!(result.exit_code(), exit_codes::OK);
    assert_eq!(remote.count(Probe::Session), 1);
    assert!(!harness.stderr.contents().contains("=== work produced ==="));
}

#[test]
fn status_record_failure_aborts_before_session() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().on_error(Probe::RecordStatus, "disk full");

    let err = harness.run(&remote, &request()).expect_err("status write fails");

    assert!(format!("{err:#}").contains("record status"), "{err:#}");
    assert_eq!(remote.count(Probe::UploadTask), 1);
    assert_eq!(remote.count(Probe::Session), 0);
}

#[test]
fn interrupt_before_launch_skips_session() {
    let harness = Harness::new();
    harness.cancel.cancel(CancelCause::new(
        TriggerKind::Interrupted,
        "received interrupt",
    ));
    let remote = ScriptedRemote::new();

    let err = harness.run(&remote, &request()).expect_err("interrupted");

    assert_eq!(err.to_string(), "dispatch interrupted before launch");
    assert_eq!(remote.count(Probe::Session), 0);
}

#[test]
fn machine_mode_forwards_only_valid_json() {
    let harness = Harness::new();
    let remote = ScriptedRemote::new().session_stdout([
        "{\"type\":\"system\",\"subtype\":\"init\"}\n",
        "not json at all\n",
        "{\"type\":\"result\",\"result\":\"done\"}\n",
    ]);
    let mut request = request();
    request.mode = StreamMode::Machine;

    harness.run(&remote, &request).expect("dispatch");

    assert_eq!(
        harness.stdout.contents(),
        "{\"type\":\"system\",\"subtype\":\"init\"}\n{\"type\":\"result\",\"result\":\"done\"}\n"
    );
}

#[test]
fn session_transport_error_propagates() {
    let harness = Harness::new();
    let remote =
        ScriptedRemote::new().session_end(SessionEnd::TransportError("ssh died".to_string()));

    let err = harness.run(&remote, &request()).expect_err("transport error");

    assert!(format!("{err:#}").contains("ssh died"), "{err:#}");
}
