//! Remote scripts run against a target, and their exit-code conventions.
//!
//! Every script starts with a `# warden:<name>` tag line naming the probe.
//! The tag shows up in remote process listings and lets scripted remotes in
//! tests recognise which step is calling.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::status::{
    MARKER_AGENT_STATE, MARKER_BLOCKED_B64, MARKER_HAS_BLOCKED, MARKER_HAS_COMPLETE,
    MARKER_RESULT_URL, MARKER_STATUS_JSON, ProbeReport, parse_status_probe,
};
use crate::core::types::RepoRef;
use crate::io::config::DispatchConfig;
use crate::io::credentials::Credentials;
use crate::io::remote::{ExecOutput, ExecRequest, RemoteExec};

pub const TASK_COMPLETE: &str = "TASK_COMPLETE";
pub const TASK_COMPLETE_MD: &str = "TASK_COMPLETE.md";
pub const BLOCKED_MD: &str = "BLOCKED.md";
pub const BLOCKED_LEGACY: &str = "BLOCKED";
pub const RESULT_URL_FILE: &str = "PR_URL";
pub const TASK_FILE: &str = ".dispatch-prompt.md";
pub const STATUS_FILE: &str = "STATUS.json";
pub const WORKSPACE_POINTER: &str = ".warden-workspace";

/// Worker processes killed by the pre-launch cleanup, bracketed so the
/// pattern never matches the shell running it.
const WORKER_PROCESS_PATTERN: &str = "[c]laude";

const TAG_PREFIX: &str = "# warden:";

/// Which remote step a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    Connectivity,
    Bootstrap,
    ActiveLoop,
    Cleanup,
    Sync,
    ClearMarkers,
    UploadTask,
    RecordStatus,
    Session,
    CompletionMarker,
    NewWork,
    BlockedReason,
    Verify,
    Status,
}

impl Probe {
    pub const ALL: [Probe; 14] = [
        Probe::Connectivity,
        Probe::Bootstrap,
        Probe::ActiveLoop,
        Probe::Cleanup,
        Probe::Sync,
        Probe::ClearMarkers,
        Probe::UploadTask,
        Probe::RecordStatus,
        Probe::Session,
        Probe::CompletionMarker,
        Probe::NewWork,
        Probe::BlockedReason,
        Probe::Verify,
        Probe::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Bootstrap => "bootstrap",
            Self::ActiveLoop => "active-loop",
            Self::Cleanup => "cleanup",
            Self::Sync => "sync",
            Self::ClearMarkers => "clear-markers",
            Self::UploadTask => "upload-task",
            Self::RecordStatus => "record-status",
            Self::Session => "session",
            Self::CompletionMarker => "completion-marker",
            Self::NewWork => "new-work",
            Self::BlockedReason => "blocked-reason",
            Self::Verify => "verify",
            Self::Status => "status",
        }
    }

    /// Identify the probe a script was built for from its tag line.
    pub fn of_script(script: &str) -> Option<Probe> {
        let name = script.lines().next()?.strip_prefix(TAG_PREFIX)?;
        Self::ALL.into_iter().find(|probe| probe.name() == name)
    }

    fn script(self, body: &str) -> String {
        format!("{TAG_PREFIX}{}\n{body}", self.name())
    }
}

/// Where things live on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    pub workspace_root: String,
    pub loop_script: String,
}

impl RemoteLayout {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.trim_end_matches('/').to_string(),
            loop_script: config.loop_script.clone(),
        }
    }

    pub fn loop_script_path(&self) -> String {
        format!("{}/{}", self.workspace_root, self.loop_script)
    }

    /// Checkout directory for `repo`.
    pub fn repo_workspace(&self, repo: &RepoRef) -> String {
        format!("{}/{}", self.workspace_root, repo.name())
    }

    fn root_file(&self, name: &str) -> String {
        format!("{}/{name}", self.workspace_root)
    }

    /// `pgrep -f` pattern matching the loop script but not a shell whose
    /// argv contains the pattern itself: `/root/\.[r]alph\.sh`.
    pub fn loop_process_pattern(&self) -> String {
        let path = regex::escape(&self.loop_script_path());
        let name_start = path.rfind('/').map_or(0, |idx| idx + 1);
        let Some((offset, ch)) = path[name_start..]
            .char_indices()
            .find(|(_, ch)| ch.is_ascii_alphanumeric())
        else {
            return path;
        };
        let at = name_start + offset;
        format!("{}[{ch}]{}", &path[..at], &path[at + ch.len_utf8()..])
    }
}

pub(crate) fn quote(value: &str) -> String {
    shell_escape::unix::escape(value.into()).into_owned()
}

fn in_workspace(workspace: &str, name: &str) -> String {
    quote(&format!("{workspace}/{name}"))
}

pub fn connectivity_script() -> String {
    Probe::Connectivity.script("echo ok")
}

/// Exit 0 when the loop script is installed.
pub fn bootstrap_script(layout: &RemoteLayout) -> String {
    Probe::Bootstrap.script(&format!("test -f {}", quote(&layout.loop_script_path())))
}

/// Exit 0 = idle, 1 = loop running (listing on stdout), other = probe error.
pub fn active_loop_script(layout: &RemoteLayout) -> String {
    let pattern = quote(&layout.loop_process_pattern());
    Probe::ActiveLoop.script(&format!(
        r#"if ! command -v pgrep >/dev/null 2>&1; then
  echo "pgrep missing" >&2
  exit 3
fi
busy="$(pgrep -af {pattern} 2>&1)"
status=$?
if [ "$status" -eq 0 ]; then
  echo "$busy"
  exit 1
fi
if [ "$status" -eq 1 ]; then
  exit 0
fi
echo "$busy" >&2
exit "$status""#
    ))
}

/// Kill leftovers from an earlier failed run. Always exits 0.
pub fn cleanup_script(layout: &RemoteLayout) -> String {
    let pattern = quote(&format!(
        "{}|{WORKER_PROCESS_PATTERN}",
        layout.loop_process_pattern()
    ));
    Probe::Cleanup.script(&format!("pkill -9 -f {pattern} 2>/dev/null; sleep 1; exit 0"))
}

/// Check out the default branch and fast-forward it.
pub fn sync_script(workspace: &str, credentials: &Credentials) -> String {
    let ws = quote(workspace);
    let mut body = String::new();
    if let Some(exports) = credentials.export_line() {
        body.push_str(&exports);
        body.push('\n');
    }
    body.push_str(&format!(
        "git config --global --add safe.directory {ws} 2>/dev/null\n\
         cd {ws} || exit 1\n\
         {{ git checkout master 2>/dev/null || git checkout main 2>/dev/null; }} || {{ echo \"no master or main branch\" >&2; exit 1; }}\n\
         git pull --ff-only 2>&1"
    ));
    Probe::Sync.script(&body)
}

pub fn clear_markers_script(workspace: &str) -> String {
    let files: Vec<String> = [
        TASK_COMPLETE,
        TASK_COMPLETE_MD,
        BLOCKED_MD,
        BLOCKED_LEGACY,
        RESULT_URL_FILE,
    ]
    .iter()
    .map(|name| in_workspace(workspace, name))
    .collect();
    Probe::ClearMarkers.script(&format!("rm -f {}", files.join(" ")))
}

/// Writes stdin to the task file.
pub fn upload_task_script(workspace: &str) -> String {
    Probe::UploadTask.script(&format!(
        "mkdir -p {} && cat > {}",
        quote(workspace),
        in_workspace(workspace, TASK_FILE)
    ))
}

/// Writes stdin to the status file and points the status probe at `workspace`.
pub fn record_status_script(layout: &RemoteLayout, workspace: &str) -> String {
    Probe::RecordStatus.script(&format!(
        "cat > {} && printf '%s\\n' {} > {}",
        quote(&layout.root_file(STATUS_FILE)),
        quote(workspace),
        quote(&layout.root_file(WORKSPACE_POINTER)),
    ))
}

/// Parameters for the supervised loop.
#[derive(Debug, Clone)]
pub struct SessionParams<'a> {
    pub workspace: &'a str,
    pub max_iterations: u32,
    pub timeout: Duration,
}

pub fn session_script(
    layout: &RemoteLayout,
    params: &SessionParams<'_>,
    credentials: &Credentials,
) -> String {
    let ws = quote(params.workspace);
    let mut body = String::new();
    if let Some(exports) = credentials.export_line() {
        body.push_str(&exports);
        body.push('\n');
    }
    body.push_str(&format!(
        "export WORKSPACE={ws} PROMPT_FILE={} MAX_ITERATIONS={} WARDEN_TIMEOUT_SEC={} LEFTHOOK=0\n\
         cd {ws} && exec bash {}",
        in_workspace(params.workspace, TASK_FILE),
        params.max_iterations,
        params.timeout.as_secs(),
        quote(&layout.loop_script_path()),
    ));
    Probe::Session.script(&body)
}

/// Exit 0 = completion marker present, 1 = absent.
pub fn completion_marker_script(workspace: &str) -> String {
    Probe::CompletionMarker.script(&format!(
        "if [ -f {} ] || [ -f {} ]; then\n  exit 0\nfi\nexit 1",
        in_workspace(workspace, TASK_COMPLETE),
        in_workspace(workspace, TASK_COMPLETE_MD),
    ))
}

/// Exit 0 = commits ahead of the default branch (oneline on stdout),
/// 1 = none, 2 = not a git workspace.
pub fn new_work_script(workspace: &str) -> String {
    Probe::NewWork.script(&format!(
        r#"cd {} 2>/dev/null && git rev-parse --git-dir >/dev/null 2>&1 || exit 2
commits="$(git log --oneline origin/master..HEAD 2>/dev/null || git log --oneline origin/main..HEAD 2>/dev/null)"
if [ -n "$commits" ]; then
  printf '%s\n' "$commits"
  exit 0
fi
exit 1"#,
        quote(workspace)
    ))
}

pub fn blocked_reason_script(workspace: &str) -> String {
    Probe::BlockedReason.script(&format!(
        "cat {} 2>/dev/null || cat {} 2>/dev/null || true",
        in_workspace(workspace, BLOCKED_MD),
        in_workspace(workspace, BLOCKED_LEGACY),
    ))
}

/// Print new commits and open pull requests, for the operator only.
pub fn verify_script(workspace: &str, credentials: &Credentials) -> String {
    let mut body = String::new();
    if let Some(exports) = credentials.export_line() {
        body.push_str(&exports);
        body.push('\n');
    }
    body.push_str(&format!(
        r#"cd {} || exit 1
echo "--- commits ---"
git log --oneline origin/master..HEAD 2>/dev/null || git log --oneline origin/main..HEAD 2>/dev/null
echo "--- pull requests ---"
gh pr list --json url,title 2>/dev/null || echo "(gh not available)""#,
        quote(workspace)
    ));
    Probe::Verify.script(&body)
}

/// Read-only status probe printing one `__KEY__value` line per signal.
pub fn status_script(layout: &RemoteLayout) -> String {
    let status_file = quote(&layout.root_file(STATUS_FILE));
    let pointer = quote(&layout.root_file(WORKSPACE_POINTER));
    let pattern = quote(&layout.loop_process_pattern());
    Probe::Status.script(&format!(
        r#"ws="$(head -n 1 {pointer} 2>/dev/null)"
status="$(tr -d '\n' < {status_file} 2>/dev/null)"
[ -n "$status" ] || status='{{}}'
printf '__{MARKER_STATUS_JSON}__%s\n' "$status"
if pgrep -f {pattern} >/dev/null 2>&1; then
  echo "__{MARKER_AGENT_STATE}__alive"
else
  echo "__{MARKER_AGENT_STATE}__dead"
fi
if [ -n "$ws" ] && {{ [ -f "$ws/{TASK_COMPLETE}" ] || [ -f "$ws/{TASK_COMPLETE_MD}" ]; }}; then
  echo "__{MARKER_HAS_COMPLETE}__yes"
else
  echo "__{MARKER_HAS_COMPLETE}__no"
fi
if [ -n "$ws" ] && [ -f "$ws/{BLOCKED_MD}" ]; then
  echo "__{MARKER_HAS_BLOCKED}__yes"
  printf '__{MARKER_BLOCKED_B64}__%s\n' "$(head -c 4096 "$ws/{BLOCKED_MD}" | base64 | tr -d '\n')"
else
  echo "__{MARKER_HAS_BLOCKED}__no"
fi
url=""
if [ -n "$ws" ] && [ -f "$ws/{RESULT_URL_FILE}" ]; then
  url="$(tr -d '[:space:]' < "$ws/{RESULT_URL_FILE}")"
fi
if [ -z "$url" ] && [ -n "$ws" ]; then
  url="$(cat "$ws/{TASK_COMPLETE}" "$ws/{TASK_COMPLETE_MD}" 2>/dev/null | grep -oE 'https://github.com/[^/ ]+/[^/ ]+/pull/[0-9]+' | head -n 1)"
fi
printf '__{MARKER_RESULT_URL}__%s\n' "$url""#
    ))
}

/// Run `script` and fail unless it exits 0.
pub fn run_checked(
    remote: &dyn RemoteExec,
    request: &ExecRequest,
    what: &str,
) -> Result<ExecOutput> {
    let output = remote.exec(request).with_context(|| what.to_string())?;
    if !output.success() {
        bail!("{what} failed ({})", output.failure_summary());
    }
    Ok(output)
}

/// Fail unless the target answers a trivial command.
pub fn probe_connectivity(remote: &dyn RemoteExec, target: &str, timeout: Duration) -> Result<()> {
    let request = ExecRequest::new(target, connectivity_script(), timeout);
    run_checked(remote, &request, "connectivity probe")
        .with_context(|| format!("target {target:?} unreachable"))?;
    Ok(())
}

/// Whether the loop script is installed on the target.
pub fn check_bootstrapped(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    timeout: Duration,
) -> Result<bool> {
    let request = ExecRequest::new(target, bootstrap_script(layout), timeout);
    let output = remote.exec(&request).context("check bootstrap")?;
    match output.code {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => bail!("bootstrap check failed ({})", output.failure_summary()),
    }
}

/// Whether the worker wrote its completion marker.
pub fn check_completion_marker(
    remote: &dyn RemoteExec,
    target: &str,
    workspace: &str,
    timeout: Duration,
) -> Result<bool> {
    let request = ExecRequest::new(target, completion_marker_script(workspace), timeout);
    let output = remote.exec(&request).context("check completion marker")?;
    match output.code {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => bail!(
            "completion marker check failed ({})",
            output.failure_summary()
        ),
    }
}

/// Commits ahead of the default branch, oldest last; empty when there are none.
pub fn check_new_work(
    remote: &dyn RemoteExec,
    target: &str,
    workspace: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let request = ExecRequest::new(target, new_work_script(workspace), timeout);
    let output = remote.exec(&request).context("check new commits")?;
    match output.code {
        Some(0) => {
            let commits: Vec<String> = output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            debug!(count = commits.len(), "new commits found");
            Ok(commits)
        }
        Some(1) => Ok(Vec::new()),
        Some(2) => bail!("new commits check exited 2: {workspace} is not a git workspace"),
        _ => bail!("new commits check failed ({})", output.failure_summary()),
    }
}

/// Contents of the worker's blocked note, trimmed; empty when absent.
pub fn read_blocked_reason(
    remote: &dyn RemoteExec,
    target: &str,
    workspace: &str,
    timeout: Duration,
) -> Result<String> {
    let request = ExecRequest::new(target, blocked_reason_script(workspace), timeout);
    let output = run_checked(remote, &request, "read blocked reason")?;
    Ok(output.stdout.trim().to_string())
}

/// Run the status probe once.
pub fn fetch_status(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    timeout: Duration,
) -> Result<ProbeReport> {
    let request = ExecRequest::new(target, status_script(layout), timeout);
    let output = run_checked(remote, &request, "status probe")?;
    Ok(parse_status_probe(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRemote;

    fn layout() -> RemoteLayout {
        RemoteLayout::from_config(&DispatchConfig::default())
    }

    const WS: &str = "/home/sprite/workspace/heartbeat";
    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn scripts_are_tagged() {
        let creds = Credentials::default();
        let layout = layout();
        let params = SessionParams {
            workspace: WS,
            max_iterations: 5,
            timeout: TIMEOUT,
        };
        let scripts = [
            (Probe::Connectivity, connectivity_script()),
            (Probe::Bootstrap, bootstrap_script(&layout)),
            (Probe::ActiveLoop, active_loop_script(&layout)),
            (Probe::Cleanup, cleanup_script(&layout)),
            (Probe::Sync, sync_script(WS, &creds)),
            (Probe::ClearMarkers, clear_markers_script(WS)),
            (Probe::UploadTask, upload_task_script(WS)),
            (Probe::RecordStatus, record_status_script(&layout, WS)),
            (Probe::Session, session_script(&layout, &params, &creds)),
            (Probe::CompletionMarker, completion_marker_script(WS)),
            (Probe::NewWork, new_work_script(WS)),
            (Probe::BlockedReason, blocked_reason_script(WS)),
            (Probe::Verify, verify_script(WS, &creds)),
            (Probe::Status, status_script(&layout)),
        ];
        for (probe, script) in scripts {
            assert_eq!(Probe::of_script(&script), Some(probe), "{script}");
        }
        assert_eq!(Probe::of_script("echo ok"), None);
    }

    #[test]
    fn loop_pattern_uses_bracket_trick() {
        assert_eq!(
            layout().loop_process_pattern(),
            r"/home/sprite/workspace/\.[r]alph\.sh"
        );
    }

    #[test]
    fn session_script_forwards_limits_and_credentials() {
        let creds = Credentials::from_pairs([("GITHUB_TOKEN", "ghp_x")]);
        let script = session_script(
            &layout(),
            &SessionParams {
                workspace: WS,
                max_iterations: 7,
                timeout: Duration::from_secs(2100),
            },
            &creds,
        );
        assert!(script.contains("export GITHUB_TOKEN=ghp_x GH_TOKEN=ghp_x"));
        assert!(script.contains("MAX_ITERATIONS=7"));
        assert!(script.contains("WARDEN_TIMEOUT_SEC=2100"));
        assert!(script.contains("exec bash /home/sprite/workspace/.ralph.sh"));
    }

    #[test]
    fn clear_markers_removes_every_signal_file() {
        let script = clear_markers_script(WS);
        for name in [TASK_COMPLETE, TASK_COMPLETE_MD, BLOCKED_MD, RESULT_URL_FILE] {
            assert!(script.contains(&format!("{WS}/{name}")), "{name}");
        }
    }

    #[test]
    fn completion_marker_convention() {
        let present = ScriptedRemote::new().on(Probe::CompletionMarker, ExecOutput::ok(""));
        assert!(check_completion_marker(&present, "moss", WS, TIMEOUT).expect("probe"));

        let absent =
            ScriptedRemote::new().on(Probe::CompletionMarker, ExecOutput::with_code(1, ""));
        assert!(!check_completion_marker(&absent, "moss", WS, TIMEOUT).expect("probe"));

        let broken =
            ScriptedRemote::new().on(Probe::CompletionMarker, ExecOutput::with_code(255, ""));
        assert!(check_completion_marker(&broken, "moss", WS, TIMEOUT).is_err());
    }

    #[test]
    fn new_work_convention() {
        let found = ScriptedRemote::new().on(
            Probe::NewWork,
            ExecOutput::ok("abc123 fix login\ndef456 add test\n"),
        );
        assert_eq!(
            check_new_work(&found, "moss", WS, TIMEOUT).expect("probe"),
            vec!["abc123 fix login".to_string(), "def456 add test".to_string()]
        );

        let none = ScriptedRemote::new().on(Probe::NewWork, ExecOutput::with_code(1, ""));
        assert!(check_new_work(&none, "moss", WS, TIMEOUT)
            .expect("probe")
            .is_empty());

        let not_git = ScriptedRemote::new().on(Probe::NewWork, ExecOutput::with_code(2, ""));
        let err = check_new_work(&not_git, "moss", WS, TIMEOUT).expect_err("exit 2");
        assert!(err.to_string().contains("exited 2"));
    }

    #[test]
    fn bootstrap_convention() {
        let layout = layout();
        let missing = ScriptedRemote::new().on(Probe::Bootstrap, ExecOutput::with_code(1, ""));
        assert!(!check_bootstrapped(&missing, "moss", &layout, TIMEOUT).expect("probe"));
        let present = ScriptedRemote::new();
        assert!(check_bootstrapped(&present, "moss", &layout, TIMEOUT).expect("probe"));
    }

    #[test]
    fn connectivity_failure_names_target() {
        let remote = ScriptedRemote::new().on_error(Probe::Connectivity, "ssh: connection refused");
        let err = probe_connectivity(&remote, "moss", TIMEOUT).expect_err("unreachable");
        let rendered = format!("{err:#}");
        assert!(rendered.contains("\"moss\" unreachable"), "{rendered}");
        assert!(rendered.contains("connection refused"), "{rendered}");
    }

    #[test]
    fn fetch_status_parses_markers() {
        let remote = ScriptedRemote::new().on(
            Probe::Status,
            ExecOutput::ok("__STATUS_JSON__{\"repo\":\"misty-step/api\"}\n__AGENT_STATE__alive\n"),
        );
        let report = fetch_status(&remote, "moss", &layout(), TIMEOUT).expect("status");
        assert!(report.alive);
        assert_eq!(report.payload.repo, "misty-step/api");
    }
}
