use anyhow::Result;
use ndarray::Array3;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{Buttons, Emulator};
use crate::obs::{build_observation, ObsConfig};
use crate::telemetry::{read_telemetry, RawTelemetry};

// =============================================================================
// Errors
// =============================================================================

/// Caller-contract violations, kept as a distinct type so the training
/// harness can tell a misconfigured policy head apart from a dead emulator.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("action {action} out of range for action space of size {space}")]
    InvalidAction { action: usize, space: usize },
}

// =============================================================================
// Action Space
// =============================================================================

/// Discrete driving actions. The first three form the reduced action space;
/// the drift variants extend it to six. Index 0 is always
/// accelerate-straight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Forward = 0,
    ForwardLeft = 1,
    ForwardRight = 2,
    Drift = 3,
    DriftLeft = 4,
    DriftRight = 5,
}

impl Action {
    pub const COUNT: usize = 6;

    /// Map an action index into `[0, space)` to its button combination,
    /// failing fast on out-of-range input.
    pub fn from_index(i: usize, space: usize) -> Result<Self, EnvError> {
        if i >= space || i >= Self::COUNT {
            return Err(EnvError::InvalidAction {
                action: i,
                space: space.min(Self::COUNT),
            });
        }
        // SAFETY: repr(u8) and we checked bounds
        Ok(unsafe { std::mem::transmute::<u8, Action>(i as u8) })
    }

    pub fn buttons(self) -> Buttons {
        match self {
            Action::Forward => Buttons::A,
            Action::ForwardLeft => Buttons::A | Buttons::LEFT,
            Action::ForwardRight => Buttons::A | Buttons::RIGHT,
            Action::Drift => Buttons::A | Buttons::R,
            Action::DriftLeft => Buttons::A | Buttons::R | Buttons::LEFT,
            Action::DriftRight => Buttons::A | Buttons::R | Buttons::RIGHT,
        }
    }
}

// =============================================================================
// Reward & Watchdog Tuning Knobs
// =============================================================================

pub struct RewardConfig {
    pub speed_multiplier: f64,
    pub checkpoint_bonus: f64,
    pub offroad_threshold: f64,
    pub offroad_multiplier: f64,
    pub lap_bonus: f64,
    pub final_lap: u8,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            speed_multiplier: 2.0,
            checkpoint_bonus: 15.0,
            offroad_threshold: 0.9,
            offroad_multiplier: 0.5,
            lap_bonus: 100.0,
            final_lap: 3,
        }
    }
}

pub struct WatchdogConfig {
    pub backward_penalty: f64,
    /// Race-timer ticks without checkpoint or lap advance before the
    /// timeout fires. Counted against the internal race clock, never
    /// wall-clock.
    pub checkpoint_timeout_ticks: u32,
    pub timeout_penalty: f64,
    /// Speed below this floor together with a drop from the previous step
    /// larger than `collision_speed_drop` reads as hitting a wall.
    pub collision_speed_floor: f64,
    pub collision_speed_drop: f64,
    pub collision_penalty: f64,
    /// Inter-step displacement below this (decoded units) counts as not
    /// moving. 100 raw units at 1/4096 scale.
    pub stuck_distance: f64,
    pub stuck_limit: u32,
    pub stuck_penalty: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            backward_penalty: -50.0,
            checkpoint_timeout_ticks: 10,
            timeout_penalty: -15.0,
            collision_speed_floor: 0.5,
            collision_speed_drop: 2.0,
            collision_penalty: -30.0,
            stuck_distance: 100.0 / 4096.0,
            stuck_limit: 100,
            stuck_penalty: -20.0,
        }
    }
}

impl WatchdogConfig {
    /// Stuck tolerance scales with action-space granularity: with fewer
    /// actions there is less the agent could have done, so give up sooner.
    pub fn for_action_space(space: usize) -> Self {
        Self {
            stuck_limit: if space <= 3 { 100 } else { 150 },
            ..Default::default()
        }
    }
}

pub struct EnvConfig {
    /// Size of the discrete action space: 3 (steer only) or 6 (with drift).
    pub action_space: usize,
    /// Simulation ticks advanced per step. Fixed, never adapted.
    pub ticks_per_step: u32,
    pub obs: ObsConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            action_space: 3,
            ticks_per_step: 4,
            obs: ObsConfig::default(),
        }
    }
}

// =============================================================================
// Episode bookkeeping
// =============================================================================

/// Per-episode tracking state, private to one environment instance.
/// Created at reset, advanced once per step, discarded at the next reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeHistory {
    pub prev_checkpoint: u8,
    pub prev_lap: u8,
    pub prev_speed: f64,
    pub last_position: [f64; 3],
    pub stuck_counter: u32,
    /// Race-timer value at the last forward progress, seeding the
    /// checkpoint-timeout watchdog.
    pub last_checkpoint_timestamp: u32,
}

impl EpisodeHistory {
    /// Fresh history at reset. The timeout reference is the race timer as
    /// it stands now, so a restarted race is not charged for time spent in
    /// earlier episodes.
    pub fn at_reset(telemetry: &RawTelemetry) -> Self {
        Self {
            prev_checkpoint: 0,
            prev_lap: 0,
            prev_speed: 0.0,
            last_position: telemetry.position,
            stuck_counter: 0,
            last_checkpoint_timestamp: telemetry.race_timer,
        }
    }

    fn advance(&mut self, curr: &RawTelemetry, stuck_counter: u32) {
        if curr.checkpoint > self.prev_checkpoint || curr.lap > self.prev_lap {
            self.last_checkpoint_timestamp = curr.race_timer;
        }
        self.prev_checkpoint = curr.checkpoint;
        self.prev_lap = curr.lap;
        self.prev_speed = curr.speed;
        self.last_position = curr.position;
        self.stuck_counter = stuck_counter;
    }
}

// =============================================================================
// Termination State Machine + Reward
// =============================================================================

/// Which watchdog (or win condition) ended the episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    BackwardDriving,
    CheckpointTimeout,
    Collision,
    Stuck,
    LapComplete,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::BackwardDriving => "backward_driving",
            TerminalReason::CheckpointTimeout => "checkpoint_timeout",
            TerminalReason::Collision => "collision",
            TerminalReason::Stuck => "stuck",
            TerminalReason::LapComplete => "lap_complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Running,
    Terminated,
    Truncated,
}

/// Outcome of one step's evaluation: the scalar reward, the episode fate,
/// and the stuck counter to carry into the next step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecision {
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub reason: Option<TerminalReason>,
    pub stuck_counter: u32,
}

fn displacement(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Evaluate the watchdog list and the reward formula for one step.
///
/// The watchdogs form a strict priority list with first-match-wins
/// semantics: backward driving, then checkpoint timeout, then collision,
/// then stuck. A firing watchdog supplies the whole reward for the step;
/// the standard formula only applies when none fired. Pure in `curr` and
/// `hist`, so every branch is unit-testable without an emulator.
pub fn evaluate_step(
    curr: &RawTelemetry,
    hist: &EpisodeHistory,
    reward: &RewardConfig,
    watchdog: &WatchdogConfig,
) -> StepDecision {
    let moved = displacement(curr.position, hist.last_position);
    let stuck_counter = if moved < watchdog.stuck_distance {
        hist.stuck_counter + 1
    } else {
        0
    };
    let terminal = |reward, truncated, reason| StepDecision {
        reward,
        terminated: true,
        truncated,
        reason: Some(reason),
        stuck_counter,
    };

    // 1. Backward driving: checkpoint regressed within the same lap.
    if curr.checkpoint < hist.prev_checkpoint && curr.lap == hist.prev_lap {
        return terminal(
            watchdog.backward_penalty,
            false,
            TerminalReason::BackwardDriving,
        );
    }

    // 2. Checkpoint timeout: no forward progress for too many race-timer
    // ticks. Ended by an external budget, so it both terminates and
    // truncates.
    let advanced = curr.checkpoint > hist.prev_checkpoint || curr.lap > hist.prev_lap;
    let idle_ticks = curr.race_timer.saturating_sub(hist.last_checkpoint_timestamp);
    if !advanced && idle_ticks > watchdog.checkpoint_timeout_ticks {
        return terminal(
            watchdog.timeout_penalty,
            true,
            TerminalReason::CheckpointTimeout,
        );
    }

    // 3. Collision: near-standstill reached through a sudden speed drop.
    if curr.speed < watchdog.collision_speed_floor
        && hist.prev_speed - curr.speed > watchdog.collision_speed_drop
    {
        return terminal(watchdog.collision_penalty, false, TerminalReason::Collision);
    }

    // 4. Stuck: barely moving for too many consecutive steps.
    if stuck_counter > watchdog.stuck_limit {
        return terminal(watchdog.stuck_penalty, false, TerminalReason::Stuck);
    }

    // 5. Normal play.
    let mut value = curr.speed * reward.speed_multiplier;
    if curr.checkpoint > hist.prev_checkpoint {
        value += reward.checkpoint_bonus;
    }
    if curr.offroad < reward.offroad_threshold {
        value *= reward.offroad_multiplier;
    }
    let mut reason = None;
    let mut terminated = false;
    if curr.lap >= reward.final_lap {
        value += reward.lap_bonus;
        terminated = true;
        reason = Some(TerminalReason::LapComplete);
    }
    StepDecision {
        reward: value,
        terminated,
        truncated: false,
        reason,
        stuck_counter,
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Read-only diagnostics attached to every step, for the external logger.
/// Not part of the learning signal.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StepInfo {
    pub speed: f64,
    pub offroad: f64,
    pub pos_x: f64,
    pub pos_z: f64,
    pub action: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
}

#[derive(Debug)]
pub struct StepResult {
    pub observation: Array3<u8>,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

/// One synchronous racing environment over one simulation instance.
///
/// `step` and `reset` block until the backend has advanced and state has
/// been read back; there is no internal concurrency. Scaling out means
/// running independent instances in separate processes, fanned out by an
/// external vectorizing harness. The backend is owned, so it is torn down
/// on every exit path, including unwinding mid-step.
pub struct MkdsEnv<B: Emulator> {
    backend: B,
    config: EnvConfig,
    reward_config: RewardConfig,
    watchdog_config: WatchdogConfig,
    history: EpisodeHistory,
    state: EpisodeState,
    steps: u64,
}

impl<B: Emulator> MkdsEnv<B> {
    pub fn new(backend: B, config: EnvConfig) -> Self {
        let watchdog_config = WatchdogConfig::for_action_space(config.action_space);
        Self::with_tuning(backend, config, RewardConfig::default(), watchdog_config)
    }

    pub fn with_tuning(
        backend: B,
        config: EnvConfig,
        reward_config: RewardConfig,
        watchdog_config: WatchdogConfig,
    ) -> Self {
        let history = EpisodeHistory::at_reset(&read_telemetry(&backend));
        Self {
            backend,
            config,
            reward_config,
            watchdog_config,
            history,
            state: EpisodeState::Running,
            steps: 0,
        }
    }

    pub fn action_space(&self) -> usize {
        self.config.action_space.min(Action::COUNT)
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn history(&self) -> &EpisodeHistory {
        &self.history
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Decode the current race state without stepping.
    pub fn telemetry(&self) -> RawTelemetry {
        read_telemetry(&self.backend)
    }

    /// Rewind to the initial race snapshot and start a fresh episode. A
    /// backend without a snapshot degrades to continuing from whatever
    /// state is loaded; that is a known risk, logged rather than masked.
    pub fn reset(&mut self) -> Result<Array3<u8>> {
        if !self.backend.load_snapshot()? {
            warn!("no initial snapshot available; continuing from current simulation state");
        }
        let telemetry = read_telemetry(&self.backend);
        self.history = EpisodeHistory::at_reset(&telemetry);
        self.state = EpisodeState::Running;
        self.steps = 0;
        Ok(build_observation(
            self.backend.frame_buffer(),
            &self.config.obs,
        ))
    }

    /// Advance one environment step: assert the action's buttons, run the
    /// fixed tick budget, then observe, score, and judge the new state.
    pub fn step(&mut self, action: usize) -> Result<StepResult> {
        let mapped = Action::from_index(action, self.config.action_space)?;

        // Replacing the whole button set releases anything held last step.
        self.backend.set_buttons(mapped.buttons());
        for _ in 0..self.config.ticks_per_step {
            self.backend.tick()?;
        }

        let observation = build_observation(self.backend.frame_buffer(), &self.config.obs);
        let telemetry = read_telemetry(&self.backend);
        let decision = evaluate_step(
            &telemetry,
            &self.history,
            &self.reward_config,
            &self.watchdog_config,
        );

        self.steps += 1;
        debug!(
            step = self.steps,
            speed = telemetry.speed,
            checkpoint = telemetry.checkpoint,
            lap = telemetry.lap,
            reward = decision.reward,
            reason = decision.reason.map(TerminalReason::as_str),
            "step"
        );

        self.state = if decision.truncated {
            EpisodeState::Truncated
        } else if decision.terminated {
            EpisodeState::Terminated
        } else {
            EpisodeState::Running
        };
        self.history.advance(&telemetry, decision.stuck_counter);

        Ok(StepResult {
            observation,
            reward: decision.reward,
            terminated: decision.terminated,
            truncated: decision.truncated,
            info: StepInfo {
                speed: telemetry.speed,
                offroad: telemetry.offroad,
                pos_x: telemetry.position[0],
                pos_z: telemetry.position[2],
                action,
                terminal_reason: decision.reason,
            },
        })
    }
}
