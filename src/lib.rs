//! Mario Kart DS reinforcement-learning environment.
//!
//! Decodes race telemetry out of emulator memory, turns the framebuffer
//! into a grayscale observation, maps discrete actions onto the DS keypad,
//! and judges every step with a reward function and a prioritized set of
//! termination watchdogs. The emulator itself is behind the
//! [`backend::Emulator`] trait, so the whole environment runs against the
//! scripted backend in tests.

/// DS screen width, pixels.
pub const SCREEN_WIDTH: usize = 256;
/// Height of the top (race view) screen.
pub const SCREEN_HEIGHT: usize = 192;
/// Height of both screens stacked, as the framebuffer delivers them.
pub const SCREEN_HEIGHT_BOTH: usize = 384;

/// Default observation resolution.
pub const OBS_WIDTH: usize = 84;
pub const OBS_HEIGHT: usize = 84;

pub mod backend;
pub mod env;
pub mod logger;
pub mod obs;
pub mod telemetry;

pub use backend::{Buttons, Emulator, ScriptFrame, ScriptedBackend};
pub use env::{
    evaluate_step, Action, EnvConfig, EnvError, EpisodeHistory, EpisodeState, MkdsEnv,
    RewardConfig, StepDecision, StepInfo, StepResult, TerminalReason, WatchdogConfig,
};
pub use logger::TelemetryLogger;
pub use obs::{build_observation, ObsConfig};
pub use telemetry::{fixed_to_float, mem, read_telemetry, RawTelemetry};
