// =============================================================================
// Mario Kart DS RL Environment — scripted-backend demo tooling
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- demo --episodes 5 --log telemetry_log.csv
//   cargo run --release -- probe --ticks 300

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use mkds_rl::{
    Emulator, EnvConfig, MkdsEnv, ObsConfig, ScriptedBackend, TelemetryLogger, SCREEN_HEIGHT_BOTH,
    SCREEN_WIDTH,
};

fn blit_rgbx_to_u32(fb: &[u8], out: &mut [u32]) {
    for (dst, src) in out.iter_mut().zip(fb.chunks_exact(4)) {
        *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
    }
}

// =============================================================================
// demo: random-policy episodes over the scripted backend
// =============================================================================

#[derive(Serialize)]
struct EpisodeSummary {
    episode: usize,
    steps: u64,
    total_reward: f64,
    reason: Option<&'static str>,
}

fn demo(args: &DemoArgs) -> Result<()> {
    let config = EnvConfig {
        action_space: args.action_space,
        ticks_per_step: args.ticks_per_step,
        obs: ObsConfig::default(),
    };
    // Checkpoints every 8 ticks keeps the synthetic kart inside the
    // 10-tick checkpoint-timeout budget while it drives cleanly.
    let backend = ScriptedBackend::synthetic_race(args.script_ticks, 8, 26);
    let mut env = MkdsEnv::new(backend, config);

    let mut logger = match &args.log {
        Some(path) => Some(TelemetryLogger::create(path, 5_000)?),
        None => None,
    };
    let mut rng = match args.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    let mut window = if args.render {
        Some(
            minifb::Window::new(
                "mkds-rl demo",
                SCREEN_WIDTH,
                SCREEN_HEIGHT_BOTH,
                minifb::WindowOptions::default(),
            )
            .context("failed to open render window")?,
        )
    } else {
        None
    };
    let mut pixels = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT_BOTH];

    let mut summaries = Vec::new();
    let mut global_step = 0u64;

    for episode in 0..args.episodes {
        env.reset()?;
        let mut total_reward = 0.0;
        let mut steps = 0u64;
        let mut reason = None;

        loop {
            let action = rng.random_range(0..env.action_space());
            let result = env.step(action)?;
            total_reward += result.reward;
            steps += 1;
            global_step += 1;

            if let Some(logger) = logger.as_mut() {
                logger.record(global_step, &result.info);
            }
            if let Some(window) = window.as_mut() {
                blit_rgbx_to_u32(env.backend().frame_buffer(), &mut pixels);
                window.update_with_buffer(&pixels, SCREEN_WIDTH, SCREEN_HEIGHT_BOTH)?;
                if !window.is_open() {
                    anyhow::bail!("render window closed");
                }
            }

            if result.terminated || result.truncated {
                reason = result.info.terminal_reason.map(|r| r.as_str());
                break;
            }
            if env.backend().exhausted() || steps >= args.max_steps {
                break;
            }
        }

        tracing::info!(episode, steps, total_reward, reason, "episode finished");
        summaries.push(EpisodeSummary {
            episode,
            steps,
            total_reward,
            reason,
        });
    }

    if let Some(path) = &args.summary {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create summary {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &summaries)?;
    }

    for s in &summaries {
        println!(
            "episode {:>3}: {:>5} steps, return {:>9.2}, end: {}",
            s.episode,
            s.steps,
            s.total_reward,
            s.reason.unwrap_or("script exhausted")
        );
    }
    Ok(())
}

// =============================================================================
// probe: live telemetry readout, one line per step
// =============================================================================

fn probe(args: &ProbeArgs) -> Result<()> {
    let backend = ScriptedBackend::synthetic_race(args.ticks, 8, 26);
    let mut env = MkdsEnv::new(
        backend,
        EnvConfig {
            ticks_per_step: 1,
            ..Default::default()
        },
    );
    env.reset()?;

    println!(
        "{:>5} {:>8} {:>7} {:>4} {:>3} {:>8} {:>8}  surface",
        "tick", "speed", "angle", "cp", "lap", "pos_x", "pos_z"
    );
    while !env.backend().exhausted() {
        env.step(0)?;
        let t = env.telemetry();
        let surface = if t.offroad < 0.9 {
            "OFFROAD [SLOWED]"
        } else {
            "ROAD"
        };
        println!(
            "{:>5} {:>8.3} {:>7} {:>4} {:>3} {:>8.2} {:>8.2}  {}",
            t.race_timer,
            t.speed,
            t.angle,
            t.checkpoint,
            t.lap,
            t.position[0],
            t.position[2],
            surface
        );
    }
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "mkds-rl", about = "Mario Kart DS RL environment demo tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll out random-policy episodes, logging telemetry
    Demo(DemoArgs),
    /// Print a per-tick telemetry dashboard
    Probe(ProbeArgs),
}

#[derive(Parser)]
struct DemoArgs {
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "3")]
    action_space: usize,
    #[arg(long, default_value = "4")]
    ticks_per_step: u32,
    /// Length of the synthetic race script, ticks
    #[arg(long, default_value = "4000")]
    script_ticks: usize,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
    /// CSV telemetry log path
    #[arg(long)]
    log: Option<PathBuf>,
    /// JSON episode summary path
    #[arg(long)]
    summary: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    render: bool,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser)]
struct ProbeArgs {
    #[arg(long, default_value = "300")]
    ticks: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Demo(args) => demo(args),
        Commands::Probe(args) => probe(args),
    }
}
