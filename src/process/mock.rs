//! Recorded fake launcher for tests and dry runs.
//!
//! Programs are matched either by their full string or by their final path
//! component, so `missing("novnc_proxy")` also covers
//! `/opt/noVNC/utils/novnc_proxy`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    program_name, CommandOutput, CommandSpec, ExitInfo, ManagedProcess, ProcessLauncher,
    ProcessState,
};
use crate::{Error, Result};

const FIRST_PID: u32 = 1000;

#[derive(Default)]
struct MockState {
    next_pid: u32,
    missing: HashSet<String>,
    early_exit: HashMap<String, i32>,
    ignores_sigterm: HashSet<String>,
    failing_stop: HashSet<String>,
    run_outputs: HashMap<String, CommandOutput>,
    spawned: Vec<(u32, CommandSpec)>,
    runs: Vec<CommandSpec>,
    signals: Vec<(u32, i32)>,
    alive: HashMap<u32, Arc<AtomicBool>>,
}

impl MockState {
    fn lookup<'a, T>(map: &'a HashMap<String, T>, program: &str) -> Option<&'a T> {
        map.get(program).or_else(|| map.get(program_name(program)))
    }

    fn contains(set: &HashSet<String>, program: &str) -> bool {
        set.contains(program) || set.contains(program_name(program))
    }
}

/// Launcher that never touches the OS.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend `program` is not installed.
    pub fn missing(self, program: impl Into<String>) -> Self {
        self.state().missing.insert(program.into());
        self
    }

    /// Spawned `program` dies immediately with `code`.
    pub fn exits_immediately(self, program: impl Into<String>, code: i32) -> Self {
        self.state().early_exit.insert(program.into(), code);
        self
    }

    /// Spawned `program` survives SIGTERM and needs SIGKILL.
    pub fn ignores_sigterm(self, program: impl Into<String>) -> Self {
        self.state().ignores_sigterm.insert(program.into());
        self
    }

    /// Terminating `program` reports an error.
    pub fn failing_stop(self, program: impl Into<String>) -> Self {
        self.state().failing_stop.insert(program.into());
        self
    }

    /// Canned result for `run` of `program`.
    pub fn with_run_output(self, program: impl Into<String>, output: CommandOutput) -> Self {
        self.state().run_outputs.insert(program.into(), output);
        self
    }

    /// Every spawned command with the pid it was given, in order.
    pub fn spawned(&self) -> Vec<(u32, CommandSpec)> {
        self.state().spawned.clone()
    }

    /// Every `run` command, in order.
    pub fn runs(&self) -> Vec<CommandSpec> {
        self.state().runs.clone()
    }

    /// Signals delivered as `(pid, signal)`.
    pub fn signals(&self) -> Vec<(u32, i32)> {
        self.state().signals.clone()
    }

    /// Pids of processes still alive.
    pub fn live_pids(&self) -> Vec<u32> {
        let state = self.state();
        let mut pids: Vec<u32> = state
            .alive
            .iter()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Simulate a process crashing behind its manager's back.
    pub fn crash(&self, pid: u32) {
        if let Some(alive) = self.state().alive.get(&pid) {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for MockLauncher {
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        if MockState::contains(&self.state().missing, program) {
            return None;
        }
        if program.contains('/') {
            Some(PathBuf::from(program))
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let mut state = self.state();
        if MockState::contains(&state.missing, &spec.program) {
            return Err(Error::CommandNotFound(spec.program.clone()));
        }

        if state.next_pid == 0 {
            state.next_pid = FIRST_PID;
        }
        let pid = state.next_pid;
        state.next_pid += 1;

        let early_exit = MockState::lookup(&state.early_exit, &spec.program).copied();
        let alive = Arc::new(AtomicBool::new(early_exit.is_none()));
        state.alive.insert(pid, alive.clone());
        state.spawned.push((pid, spec.clone()));

        Ok(Box::new(MockProcess {
            pid,
            name: spec.program_name().to_string(),
            alive,
            exit: early_exit.map(ExitInfo::code),
            ignores_sigterm: MockState::contains(&state.ignores_sigterm, &spec.program),
            failing_stop: MockState::contains(&state.failing_stop, &spec.program),
            state: self.state.clone(),
        }))
    }

    async fn run(&self, spec: &CommandSpec, _timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state();
        if MockState::contains(&state.missing, &spec.program) {
            return Err(Error::CommandNotFound(spec.program.clone()));
        }
        state.runs.push(spec.clone());
        Ok(MockState::lookup(&state.run_outputs, &spec.program)
            .cloned()
            .unwrap_or(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            }))
    }
}

struct MockProcess {
    pid: u32,
    name: String,
    alive: Arc<AtomicBool>,
    exit: Option<ExitInfo>,
    ignores_sigterm: bool,
    failing_stop: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockProcess {
    fn record_signal(&self, signal: i32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.signals.push((self.pid, signal));
    }
}

#[async_trait::async_trait]
impl ManagedProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn try_status(&mut self) -> Result<ProcessState> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(ProcessState::Running)
        } else {
            Ok(ProcessState::Exited(self.exit.unwrap_or_default()))
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(self.exit.unwrap_or_default());
        }
        if self.failing_stop {
            return Err(Error::Process(format!("{} refused to stop", self.name)));
        }

        self.record_signal(libc::SIGTERM);
        if self.ignores_sigterm {
            tokio::time::sleep(grace).await;
            self.record_signal(libc::SIGKILL);
            self.exit = Some(ExitInfo::signal(libc::SIGKILL));
        } else {
            self.exit = Some(ExitInfo::signal(libc::SIGTERM));
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(self.exit.unwrap_or_default())
    }
}

impl Drop for MockProcess {
    // Mirrors kill_on_drop on real children.
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
