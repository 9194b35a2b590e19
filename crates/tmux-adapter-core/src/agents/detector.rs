//! Agent detection.
//!
//! Decides whether a tmux session hosts a live coding agent and classifies
//! its role, rig, runtime and working directory. Pure given its inputs: all
//! external lookups (environment values, pane details, process tree) are
//! injected by the caller.

use std::collections::VecDeque;
use std::path::PathBuf;

use super::{Agent, PaneInfo, Role, Runtime};

/// Child-walk bounds when the pane command is a shell wrapping the runtime.
const WALK_MAX_DEPTH: usize = 3;
const WALK_MAX_FANOUT: usize = 16;

/// Detector settings.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Town root; agent working directories must lie under it.
    pub gt_dir: PathBuf,
}

/// Session environment values read via show-environment.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    /// `GT_AGENT`: runtime hint used when pane inspection is inconclusive.
    pub agent: Option<String>,
    /// `GT_ROLE`: authoritative role when it names a known role.
    pub role: Option<String>,
    /// `GT_RIG`: authoritative rig for rig-level agents.
    pub rig: Option<String>,
}

/// A process observed during the child walk.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: i32,
    pub command: String,
}

/// Process-tree lookups injected into the detector.
pub trait ProcessInspector: Send + Sync {
    /// Whether the pid refers to a live (non-zombie) process.
    fn pid_alive(&self, pid: i32) -> bool;
    /// Direct children of a pid.
    fn children(&self, pid: i32) -> Vec<Process>;
}

/// Why a session was not recognised as an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Name does not start with `hq-` or `gt-`.
    WrongPrefix,
    /// Neither `GT_ROLE` nor the session name yields a known role.
    NoRole,
    /// Pane path lies outside the configured town directory.
    WorkDirOutsideTown(PathBuf),
    /// No recognised runtime on the pane or its children.
    NoRuntime(String),
    /// Pane process is gone (zombie filter).
    DeadPane(i32),
}

/// Classify a session. Rules applied in order: prefix gate, role, rig,
/// working directory, runtime, liveness.
pub fn detect_agent(
    config: &DetectorConfig,
    name: &str,
    attached: bool,
    pane: &PaneInfo,
    env: &SessionEnv,
    inspector: &dyn ProcessInspector,
) -> Result<Agent, Rejection> {
    let town_level = name.starts_with("hq-");
    if !town_level && !name.starts_with("gt-") {
        return Err(Rejection::WrongPrefix);
    }

    let role = env
        .role
        .as_deref()
        .and_then(Role::from_keyword)
        .or_else(|| role_from_name(name))
        .ok_or(Rejection::NoRole)?;

    let rig = if town_level {
        None
    } else {
        env.rig
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| rig_from_name(name))
    };

    if !pane.work_dir.starts_with(&config.gt_dir) {
        return Err(Rejection::WorkDirOutsideTown(pane.work_dir.clone()));
    }

    let runtime = detect_runtime(pane, env, inspector)
        .ok_or_else(|| Rejection::NoRuntime(pane.command.clone()))?;

    if !inspector.pid_alive(pane.pid) {
        return Err(Rejection::DeadPane(pane.pid));
    }

    Ok(Agent {
        name: name.to_string(),
        role,
        runtime,
        rig,
        work_dir: pane.work_dir.clone(),
        attached,
    })
}

/// Infer the role from the session name: `hq-mayor` → mayor,
/// `gt-foo-crew-bar` → crew.
fn role_from_name(name: &str) -> Option<Role> {
    name.split('-').skip(1).find_map(Role::from_keyword)
}

/// Rig from a `gt-<rig>-<role>-...` name: the segments between the prefix and
/// the role keyword.
fn rig_from_name(name: &str) -> Option<String> {
    let segments: Vec<&str> = name.split('-').collect();
    let role_idx = segments
        .iter()
        .skip(1)
        .position(|s| Role::from_keyword(s).is_some())?
        + 1;
    if role_idx <= 1 {
        return None;
    }
    Some(segments[1..role_idx].join("-"))
}

fn detect_runtime(
    pane: &PaneInfo,
    env: &SessionEnv,
    inspector: &dyn ProcessInspector,
) -> Option<Runtime> {
    if let Some(rt) = runtime_from_command_name(&pane.command) {
        return Some(rt);
    }

    if looks_like_shell(&pane.command) {
        if let Some(rt) = find_runtime_in_children(pane.pid, inspector) {
            return Some(rt);
        }
    }

    // Last resort: trust the GT_AGENT hint when it names a known runtime.
    env.agent.as_deref().and_then(Runtime::from_command)
}

/// Direct runtime match, accepting bare version strings (e.g. `2.1.38`) as
/// claude, whose launcher rewrites argv[0] to the version.
fn runtime_from_command_name(command: &str) -> Option<Runtime> {
    if let Some(rt) = Runtime::from_command(command) {
        return Some(rt);
    }
    if is_bare_version(command) {
        return Some(Runtime::Claude);
    }
    None
}

fn is_bare_version(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn looks_like_shell(command: &str) -> bool {
    // Login shells report a leading dash.
    let name = command.strip_prefix('-').unwrap_or(command);
    matches!(name, "sh" | "bash" | "zsh" | "fish" | "dash" | "ksh" | "tcsh")
}

/// Breadth-first walk below the pane shell looking for a runtime binary,
/// bounded in depth and fanout.
fn find_runtime_in_children(root: i32, inspector: &dyn ProcessInspector) -> Option<Runtime> {
    let mut queue = VecDeque::from([(root, 0usize)]);

    while let Some((pid, depth)) = queue.pop_front() {
        if depth >= WALK_MAX_DEPTH {
            continue;
        }
        for child in inspector.children(pid).into_iter().take(WALK_MAX_FANOUT) {
            if let Some(rt) = runtime_from_command_name(&child.command) {
                return Some(rt);
            }
            queue.push_back((child.pid, depth + 1));
        }
    }
    None
}

/// `/proc`-backed inspector used in production.
#[derive(Debug, Clone, Default)]
pub struct ProcInspector;

impl ProcessInspector for ProcInspector {
    fn pid_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        pid_alive_impl(pid)
    }

    fn children(&self, pid: i32) -> Vec<Process> {
        children_impl(pid)
    }
}

/// Liveness via the stat state, which filters zombies out, not just
/// missing pids.
#[cfg(target_os = "linux")]
fn pid_alive_impl(pid: i32) -> bool {
    matches!(proc_state(pid), Some(state) if state != 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_alive_impl(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive_impl(_pid: i32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn children_impl(pid: i32) -> Vec<Process> {
    scan_proc_children(pid)
}

#[cfg(not(target_os = "linux"))]
fn children_impl(_pid: i32) -> Vec<Process> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn proc_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // State is the first field after the parenthesised comm.
    let rest = stat.rsplit_once(") ")?.1;
    rest.chars().next()
}

#[cfg(target_os = "linux")]
fn scan_proc_children(parent: i32) -> Vec<Process> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Some((head, tail)) = stat.rsplit_once(") ") else {
            continue;
        };
        let comm = head.split_once('(').map(|(_, c)| c).unwrap_or("");
        let ppid: i32 = tail
            .split_whitespace()
            .nth(1)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        if ppid == parent {
            out.push(Process {
                pid,
                command: comm.to_string(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;

    struct FakeInspector {
        alive: HashSet<i32>,
        children: HashMap<i32, Vec<Process>>,
    }

    impl FakeInspector {
        fn new() -> Self {
            Self {
                alive: HashSet::new(),
                children: HashMap::new(),
            }
        }

        fn with_alive(mut self, pid: i32) -> Self {
            self.alive.insert(pid);
            self
        }

        fn with_child(mut self, parent: i32, pid: i32, command: &str) -> Self {
            self.children.entry(parent).or_default().push(Process {
                pid,
                command: command.to_string(),
            });
            self
        }
    }

    impl ProcessInspector for FakeInspector {
        fn pid_alive(&self, pid: i32) -> bool {
            self.alive.contains(&pid)
        }

        fn children(&self, pid: i32) -> Vec<Process> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            gt_dir: PathBuf::from("/home/u/gt"),
        }
    }

    fn pane(command: &str, pid: i32, work_dir: &str) -> PaneInfo {
        PaneInfo {
            pane_id: "%1".to_string(),
            command: command.to_string(),
            pid,
            work_dir: Path::new(work_dir).to_path_buf(),
        }
    }

    #[test]
    fn rejects_unrecognised_prefix() {
        let inspector = FakeInspector::new().with_alive(10);
        let result = detect_agent(
            &config(),
            "scratch",
            false,
            &pane("claude", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        );
        assert_eq!(result.unwrap_err(), Rejection::WrongPrefix);
    }

    #[test]
    fn env_role_wins_over_name() {
        let inspector = FakeInspector::new().with_alive(10);
        let env = SessionEnv {
            role: Some("witness".to_string()),
            ..Default::default()
        };
        let agent = detect_agent(
            &config(),
            "gt-foo-crew-bar",
            false,
            &pane("claude", 10, "/home/u/gt/rigs/foo"),
            &env,
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.role, Role::Witness);
    }

    #[test]
    fn role_inferred_from_town_name() {
        let inspector = FakeInspector::new().with_alive(10);
        let agent = detect_agent(
            &config(),
            "hq-mayor",
            true,
            &pane("claude", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.role, Role::Mayor);
        assert_eq!(agent.rig, None);
        assert!(agent.attached);
    }

    #[test]
    fn crew_name_yields_role_and_rig() {
        let inspector = FakeInspector::new().with_alive(10);
        let agent = detect_agent(
            &config(),
            "gt-foo-crew-bar",
            false,
            &pane("gemini", 10, "/home/u/gt/rigs/foo"),
            &SessionEnv::default(),
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.role, Role::Crew);
        assert_eq!(agent.rig.as_deref(), Some("foo"));
        assert_eq!(agent.runtime, Runtime::Gemini);
    }

    #[test]
    fn env_rig_wins_over_name() {
        let inspector = FakeInspector::new().with_alive(10);
        let env = SessionEnv {
            rig: Some("ironworks".to_string()),
            ..Default::default()
        };
        let agent = detect_agent(
            &config(),
            "gt-foo-polecat-x",
            false,
            &pane("claude", 10, "/home/u/gt/rigs/ironworks"),
            &env,
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.rig.as_deref(), Some("ironworks"));
        assert_eq!(agent.role, Role::Polecat);
    }

    #[test]
    fn multi_segment_rig() {
        let inspector = FakeInspector::new().with_alive(10);
        let agent = detect_agent(
            &config(),
            "gt-iron-works-crew-a",
            false,
            &pane("claude", 10, "/home/u/gt/x"),
            &SessionEnv::default(),
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.rig.as_deref(), Some("iron-works"));
    }

    #[test]
    fn no_role_rejected() {
        let inspector = FakeInspector::new().with_alive(10);
        let result = detect_agent(
            &config(),
            "gt-foo-unknown",
            false,
            &pane("claude", 10, "/home/u/gt/x"),
            &SessionEnv::default(),
            &inspector,
        );
        assert_eq!(result.unwrap_err(), Rejection::NoRole);
    }

    #[test]
    fn work_dir_outside_town_rejected() {
        let inspector = FakeInspector::new().with_alive(10);
        let result = detect_agent(
            &config(),
            "hq-mayor",
            false,
            &pane("claude", 10, "/etc"),
            &SessionEnv::default(),
            &inspector,
        );
        assert!(matches!(
            result.unwrap_err(),
            Rejection::WorkDirOutsideTown(_)
        ));
    }

    #[test]
    fn bare_version_command_is_claude() {
        let inspector = FakeInspector::new().with_alive(10);
        let agent = detect_agent(
            &config(),
            "hq-deacon",
            false,
            &pane("2.1.38", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.runtime, Runtime::Claude);
    }

    #[test]
    fn shell_walks_children_for_runtime() {
        let inspector = FakeInspector::new()
            .with_alive(10)
            .with_child(10, 11, "node")
            .with_child(11, 12, "codex");
        let agent = detect_agent(
            &config(),
            "hq-mayor",
            false,
            &pane("bash", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.runtime, Runtime::Codex);
    }

    #[test]
    fn child_walk_respects_depth_bound() {
        // Runtime sits four levels down; the bounded walk must not find it.
        let inspector = FakeInspector::new()
            .with_alive(10)
            .with_child(10, 11, "node")
            .with_child(11, 12, "node")
            .with_child(12, 13, "node")
            .with_child(13, 14, "claude");
        let result = detect_agent(
            &config(),
            "hq-mayor",
            false,
            &pane("zsh", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        );
        assert!(matches!(result.unwrap_err(), Rejection::NoRuntime(_)));
    }

    #[test]
    fn gt_agent_hint_rescues_unknown_command() {
        let inspector = FakeInspector::new().with_alive(10);
        let env = SessionEnv {
            agent: Some("opencode".to_string()),
            ..Default::default()
        };
        let agent = detect_agent(
            &config(),
            "hq-mayor",
            false,
            &pane("node", 10, "/home/u/gt"),
            &env,
            &inspector,
        )
        .unwrap();
        assert_eq!(agent.runtime, Runtime::Opencode);
    }

    #[test]
    fn dead_pane_rejected() {
        let inspector = FakeInspector::new();
        let result = detect_agent(
            &config(),
            "hq-mayor",
            false,
            &pane("claude", 10, "/home/u/gt"),
            &SessionEnv::default(),
            &inspector,
        );
        assert_eq!(result.unwrap_err(), Rejection::DeadPane(10));
    }

    #[test]
    fn login_shell_is_recognised() {
        assert!(looks_like_shell("-zsh"));
        assert!(looks_like_shell("bash"));
        assert!(!looks_like_shell("node"));
    }

    #[test]
    fn version_strings() {
        assert!(is_bare_version("2.1.38"));
        assert!(is_bare_version("10"));
        assert!(!is_bare_version("v2.1.38"));
        assert!(!is_bare_version(""));
        assert!(!is_bare_version("2.1.38-beta"));
    }
}
