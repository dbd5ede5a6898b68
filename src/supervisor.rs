//! Auto-restart supervisor for crashed agents.
//!
//! Tracks restart state per agent and decides whether to restart or mark
//! permanently dead based on configurable policies (max restarts, cooldown,
//! consecutive failure limits).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::AgentSpec;

/// Configurable restart policy attached to an agent at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    2000
}
fn default_max_consecutive() -> u32 {
    3
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            cooldown_ms: 2000,
            max_consecutive_failures: 3,
        }
    }
}

/// Internal state tracked per agent for restart decisions.
struct RestartState {
    total_restarts: u32,
    consecutive_failures: u32,
    last_exit: Option<Instant>,
    policy: RestartPolicy,
    pub spec: AgentSpec,
    pub initial_task: Option<String>,
    pub parent: Option<String>,
}

/// Decision returned by the supervisor after an agent exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    PermanentlyDead { reason: String },
}

/// Info about an agent pending restart, exposed for the event loop.
pub struct PendingRestart {
    pub spec: AgentSpec,
    pub parent: Option<String>,
    pub initial_task: Option<String>,
    pub restart_count: u32,
}

/// Manages restart state for all supervised agents.
pub struct Supervisor {
    states: HashMap<String, RestartState>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Register an agent for supervision. Called at spawn time.
    pub fn register(
        &mut self,
        name: &str,
        spec: AgentSpec,
        parent: Option<String>,
        initial_task: Option<String>,
        policy: RestartPolicy,
    ) {
        self.states.insert(
            name.to_string(),
            RestartState {
                total_restarts: 0,
                consecutive_failures: 0,
                last_exit: None,
                policy,
                spec,
                initial_task,
                parent,
            },
        );
    }

    /// Unregister an agent (intentional release — no restart).
    pub fn unregister(&mut self, name: &str) {
        self.states.remove(name);
    }

    /// Called when an agent process exits. Returns a restart decision.
    ///
    /// Returns `None` if the agent is not supervised (was released or never registered).
    pub fn on_exit(
        &mut self,
        name: &str,
        _exit_code: Option<i32>,
        _signal: Option<&str>,
    ) -> Option<RestartDecision> {
        let state = self.states.get_mut(name)?;

        if !state.policy.enabled {
            return Some(RestartDecision::PermanentlyDead {
                reason: "restart policy disabled".to_string(),
            });
        }

        state.consecutive_failures += 1;
        state.last_exit = Some(Instant::now());

        if state.total_restarts >= state.policy.max_restarts {
            return Some(RestartDecision::PermanentlyDead {
                reason: format!(
                    "exceeded max restarts ({})",
                    state.policy.max_restarts
                ),
            });
        }

        if state.consecutive_failures > state.policy.max_consecutive_failures {
            return Some(RestartDecision::PermanentlyDead {
                reason: format!(
                    "exceeded max consecutive failures ({})",
                    state.policy.max_consecutive_failures
                ),
            });
        }

        let delay = Duration::from_millis(state.policy.cooldown_ms);
        Some(RestartDecision::Restart { delay })
    }

    /// Called after a successful restart to reset consecutive failure count.
    pub fn on_restarted(&mut self, name: &str) {
        if let Some(state) = self.states.get_mut(name) {
            state.total_restarts += 1;
            state.consecutive_failures = 0;
        }
    }

    /// Returns agents that have exited and whose cooldown has elapsed.
    pub fn pending_restarts(&self) -> Vec<(String, PendingRestart)> {
        let now = Instant::now();
        self.states
            .iter()
            .filter_map(|(name, state)| {
                let last_exit = state.last_exit?;
                let cooldown = Duration::from_millis(state.policy.cooldown_ms);
                if now.duration_since(last_exit) >= cooldown
                    && state.total_restarts < state.policy.max_restarts
                    && state.consecutive_failures <= state.policy.max_consecutive_failures
                    && state.policy.enabled
                {
                    Some((
                        name.clone(),
                        PendingRestart {
                            spec: state.spec.clone(),
                            parent: state.parent.clone(),
                            initial_task: state.initial_task.clone(),
                            restart_count: state.total_restarts + 1,
                        },
                    ))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Get the current restart count for an agent.
    pub fn restart_count(&self, name: &str) -> u32 {
        self.states
            .get(name)
            .map(|s| s.total_restarts)
            .unwrap_or(0)
    }

    /// Check if an agent is registered with the supervisor.
    pub fn is_supervised(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }
}
