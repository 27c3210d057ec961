//! Deterministic command execution for driver tests.
//!
//! [`ScriptedExecutor`] records every command it receives and fails commands
//! either from a script (the n-th command with a given label) or at random
//! with a seeded RNG, so failure scenarios reproduce exactly.
//!
//! # Example
//!
//! ```rust,ignore
//! use datafed_test_utils::simulation::{ScriptedExecutor, FaultConfig};
//!
//! let executor = ScriptedExecutor::with_seed(7).configure_faults(FaultConfig {
//!     failure_rate: 0.2,
//!     ..FaultConfig::default()
//! });
//! executor.fail_nth("raw_data_transfer", 0, true);
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use datafed_core::TaskId;
use datafed_tasks::driver::{CommandExecutor, CommandFailure};
use datafed_tasks::task::Command;

/// Random failure injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that any command attempt fails (0.0 - 1.0).
    pub failure_rate: f64,
    /// Whether random failures are permanent.
    pub permanent: bool,
}

/// One executed command attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Task the command belongs to.
    pub task_id: TaskId,
    /// The command.
    pub command: Command,
    /// Whether the attempt succeeded.
    pub succeeded: bool,
}

#[derive(Debug)]
struct State {
    rng: StdRng,
    faults: FaultConfig,
    script: HashMap<(&'static str, usize), bool>,
    seen: HashMap<&'static str, usize>,
    log: Vec<Execution>,
}

/// A command executor with scripted and random failures.
#[derive(Debug)]
pub struct ScriptedExecutor {
    state: Mutex<State>,
}

impl ScriptedExecutor {
    /// An executor that never fails unless scripted to.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// An executor whose random failures derive from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(State {
                rng: StdRng::seed_from_u64(seed),
                faults: FaultConfig::default(),
                script: HashMap::new(),
                seen: HashMap::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Replaces the random failure configuration.
    #[must_use]
    pub fn configure_faults(self, faults: FaultConfig) -> Self {
        self.state.lock().unwrap().faults = faults;
        self
    }

    /// Fails the `n`-th attempt (0-based) of commands labelled `label`.
    pub fn fail_nth(&self, label: &'static str, n: usize, permanent: bool) {
        self.state.lock().unwrap().script.insert((label, n), permanent);
    }

    /// Every attempt so far, in order.
    pub fn executions(&self) -> Vec<Execution> {
        self.state.lock().unwrap().log.clone()
    }

    /// Labels of every attempt so far, in order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.executions()
            .iter()
            .map(|e| e.command.as_label())
            .collect()
    }

    /// Commands of successful attempts for `task_id`.
    pub fn succeeded_for(&self, task_id: &TaskId) -> Vec<Command> {
        self.executions()
            .into_iter()
            .filter(|e| e.succeeded && &e.task_id == task_id)
            .map(|e| e.command)
            .collect()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, task_id: &TaskId, command: &Command) -> Result<(), CommandFailure> {
        let mut state = self.state.lock().unwrap();
        let label = command.as_label();
        let index = {
            let seen = state.seen.entry(label).or_insert(0);
            *seen += 1;
            *seen - 1
        };

        let failure = if let Some(permanent) = state.script.get(&(label, index)).copied() {
            Some(CommandFailure {
                message: format!("scripted {label} failure"),
                permanent,
            })
        } else {
            let rate = state.faults.failure_rate;
            let permanent = state.faults.permanent;
            (rate > 0.0 && state.rng.gen_bool(rate.min(1.0))).then(|| CommandFailure {
                message: format!("injected {label} failure"),
                permanent,
            })
        };

        state.log.push(Execution {
            task_id: *task_id,
            command: command.clone(),
            succeeded: failure.is_none(),
        });
        failure.map_or(Ok(()), Err)
    }
}
