//! CLI entry point for the microfluidic rig.
//!
//! Brings the rig up from a hardware file (or the simulated families when
//! none is given), runs one command, then shuts everything down.
//!
//! ```bash
//! mfc --config hardware.toml status
//! mfc --config hardware.toml valve set 3 on
//! mfc --config hardware.toml pressure set all 120 --unit mbar
//! mfc watch --seconds 10
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use microfluidic_control::{
    load_hardware, ChannelTarget, ChipConfig, DeviceState, DriverRegistry, HardwareConfig,
    PressureControl, PressureUnit, Rig, Role, StageControl, SubsystemReport, ValveControl,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mfc")]
#[command(about = "Microfluidic rig control: valves, pressure and stage", long_about = None)]
struct Cli {
    /// Hardware configuration file (TOML or JSON)
    /// If not provided, every subsystem runs on a simulated device
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Named profile inside the configuration file
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Chip metadata (chipConfig.json), lets valves be named instead of numbered
    #[arg(long, global = true)]
    chip: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show each subsystem's driver, status and unit
    Status,

    /// Valve bank commands
    #[command(subcommand)]
    Valve(ValveCommands),

    /// Pressure controller commands
    #[command(subcommand)]
    Pressure(PressureCommands),

    /// Stage commands
    #[command(subcommand)]
    Stage(StageCommands),

    /// Poll every subsystem and print published snapshots
    Watch {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ValveState {
    On,
    Off,
}

#[derive(Subcommand)]
enum ValveCommands {
    /// Open or close a valve (channel number, chip name, or `all`)
    Set { target: String, state: ValveState },
    /// Read one valve, or all of them
    Read { target: Option<String> },
    /// Invert one valve
    Switch { target: String },
}

#[derive(Subcommand)]
enum PressureCommands {
    /// Set a channel (or `all`) to a pressure
    Set {
        target: String,
        value: f64,
        /// mbar, kpa or psi (default: the driver's unit)
        #[arg(long)]
        unit: Option<String>,
    },
    /// Read every pressure channel
    Read {
        #[arg(long)]
        unit: Option<String>,
    },
}

#[derive(Subcommand)]
enum StageCommands {
    /// Move to an absolute position in mm
    MoveAbs {
        #[arg(allow_negative_numbers = true)]
        x: f64,
        #[arg(allow_negative_numbers = true)]
        y: f64,
    },
    /// Move by an offset in mm
    MoveRel {
        #[arg(allow_negative_numbers = true)]
        dx: f64,
        #[arg(allow_negative_numbers = true)]
        dy: f64,
    },
    /// Move to the origin
    Home,
    /// Halt motion
    Stop,
    /// Show the speed, or set it in mm/s (one value sets both axes)
    Speed { x: Option<f64>, y: Option<f64> },
    /// Show the current position
    Position,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_hardware(path, cli.profile.as_deref())?,
        None => {
            if cli.profile.is_some() {
                bail!("--profile needs --config");
            }
            tracing::info!("No hardware config given, using simulated devices");
            HardwareConfig::simulated()
        }
    };
    let chip = cli
        .chip
        .as_deref()
        .map(ChipConfig::load)
        .transpose()?;

    let registry = DriverRegistry::with_defaults();
    let mut rig = Rig::bring_up(&config, &registry).await;

    let outcome = run(&cli.command, &mut rig, chip.as_ref()).await;
    rig.shutdown().await;
    outcome
}

async fn run(command: &Commands, rig: &mut Rig, chip: Option<&ChipConfig>) -> Result<()> {
    match command {
        Commands::Status => {
            for report in rig.report() {
                print_report(&report);
            }
            Ok(())
        }
        Commands::Valve(cmd) => valve_command(cmd, valves(rig)?, chip).await,
        Commands::Pressure(cmd) => pressure_command(cmd, pressure(rig)?).await,
        Commands::Stage(cmd) => stage_command(cmd, stage(rig)?).await,
        Commands::Watch { seconds } => watch(rig, seconds.map(Duration::from_secs), chip).await,
    }
}

// =============================================================================
// Subsystem Access
// =============================================================================

fn unavailable(rig: &Rig, role: Role) -> anyhow::Error {
    anyhow!("{role} subsystem is {}", rig.status(role))
}

fn valves(rig: &Rig) -> Result<Arc<dyn ValveControl>> {
    rig.valves().ok_or_else(|| unavailable(rig, Role::Valving))
}

fn pressure(rig: &Rig) -> Result<Arc<dyn PressureControl>> {
    rig.pressure().ok_or_else(|| unavailable(rig, Role::Flowing))
}

fn stage(rig: &Rig) -> Result<Arc<dyn StageControl>> {
    rig.stage().ok_or_else(|| unavailable(rig, Role::Collecting))
}

/// Channel number, `all`, or a valve name from the chip file.
fn valve_target(spec: &str, chip: Option<&ChipConfig>) -> Result<ChannelTarget> {
    if let Ok(target) = spec.parse::<ChannelTarget>() {
        return Ok(target);
    }
    chip.and_then(|chip| chip.valve_by_name(spec))
        .map(ChannelTarget::One)
        .ok_or_else(|| anyhow!("'{spec}' is not a channel number, 'all', or a known valve name"))
}

fn single_channel(spec: &str, chip: Option<&ChipConfig>) -> Result<u16> {
    match valve_target(spec, chip)? {
        ChannelTarget::One(channel) => Ok(channel),
        ChannelTarget::All => bail!("a single valve is required"),
    }
}

fn parse_unit(unit: Option<&str>) -> Result<Option<PressureUnit>> {
    unit.map(|u| u.parse::<PressureUnit>())
        .transpose()
        .context("Invalid pressure unit")
}

// =============================================================================
// Commands
// =============================================================================

async fn valve_command(
    cmd: &ValveCommands,
    valves: Arc<dyn ValveControl>,
    chip: Option<&ChipConfig>,
) -> Result<()> {
    match cmd {
        ValveCommands::Set { target, state } => {
            let target = valve_target(target, chip)?;
            let open = matches!(state, ValveState::On);
            let readback = valves.valve_set(open, target).await?;
            if !readback.matches(open) {
                tracing::warn!(%target, open, "valve read-back does not match the request");
            }
            print_valves(target, &readback.into_vec(), chip);
        }
        ValveCommands::Read { target } => {
            let target = match target {
                Some(spec) => valve_target(spec, chip)?,
                None => ChannelTarget::All,
            };
            let readback = valves.valve_read(target).await?;
            print_valves(target, &readback.into_vec(), chip);
        }
        ValveCommands::Switch { target } => {
            let channel = single_channel(target, chip)?;
            let open = valves.valve_switch(channel).await?;
            print_valves(ChannelTarget::One(channel), &[open], chip);
        }
    }
    Ok(())
}

async fn pressure_command(cmd: &PressureCommands, pressure: Arc<dyn PressureControl>) -> Result<()> {
    match cmd {
        PressureCommands::Set {
            target,
            value,
            unit,
        } => {
            let target: ChannelTarget = target.parse().map_err(|e: String| anyhow!(e))?;
            let unit = parse_unit(unit.as_deref())?;
            pressure.set_pressure(*value, target, unit).await?;
            let shown = unit.unwrap_or_else(|| pressure.pressure_unit());
            println!("{target} -> {value} {shown}");
        }
        PressureCommands::Read { unit } => {
            let unit = parse_unit(unit.as_deref())?;
            let values = pressure.read_pressure(ChannelTarget::All, unit).await?;
            let shown = unit.unwrap_or_else(|| pressure.pressure_unit());
            for (index, value) in values.iter().enumerate() {
                println!("{:>3}: {value:.2} {shown}", index + 1);
            }
        }
    }
    Ok(())
}

async fn stage_command(cmd: &StageCommands, stage: Arc<dyn StageControl>) -> Result<()> {
    let position = match cmd {
        StageCommands::MoveAbs { x, y } => stage.move_abs(*x, *y).await?,
        StageCommands::MoveRel { dx, dy } => stage.move_rel(*dx, *dy).await?,
        StageCommands::Home => stage.home().await?,
        StageCommands::Stop => {
            stage.stop().await?;
            println!("stopped");
            return Ok(());
        }
        StageCommands::Speed { x: None, .. } => {
            let (x, y) = stage.speed().await?;
            println!("speed: x {x:.2} mm/s, y {y:.2} mm/s");
            return Ok(());
        }
        StageCommands::Speed { x: Some(x), y } => {
            stage.set_speed(*x, y.unwrap_or(*x)).await?;
            let (x, y) = stage.speed().await?;
            println!("speed: x {x:.2} mm/s, y {y:.2} mm/s");
            return Ok(());
        }
        StageCommands::Position => stage.position().await?,
    };
    println!("position: x {:.4} mm, y {:.4} mm", position.x, position.y);
    Ok(())
}

async fn watch(rig: &mut Rig, limit: Option<Duration>, chip: Option<&ChipConfig>) -> Result<()> {
    rig.start_polling();
    let mut receivers: Vec<_> = Role::ALL
        .into_iter()
        .filter_map(|role| rig.subscribe(role).map(|rx| (role, rx)))
        .collect();
    if receivers.is_empty() {
        bail!("no subsystem is ready");
    }

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let interrupted = signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut tick = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("Interrupted");
                break;
            }
            () = &mut deadline => break,
            _ = tick.tick() => {
                for (role, rx) in &mut receivers {
                    if rx.has_changed().unwrap_or(false) {
                        let snapshot = rx.borrow_and_update().clone();
                        println!(
                            "{} {role:<10} {}",
                            snapshot.captured_at.format("%H:%M:%S%.3f"),
                            describe(&snapshot.state, chip)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_report(report: &SubsystemReport) {
    let family = report
        .family
        .map_or_else(|| "-".to_string(), |f| f.to_string());
    let unit = report.unit.map_or_else(String::new, |u| format!(" [{u}]"));
    println!("{:<10} {family:<10} {}{unit}", report.role, report.status);
}

fn valve_label(channel: u16, chip: Option<&ChipConfig>) -> String {
    match chip.and_then(|chip| chip.valve_name(channel)) {
        Some(name) => format!("{channel} ({name})"),
        None => channel.to_string(),
    }
}

fn print_valves(target: ChannelTarget, states: &[bool], chip: Option<&ChipConfig>) {
    let first = match target {
        ChannelTarget::One(channel) => channel,
        ChannelTarget::All => 1,
    };
    for (channel, open) in (first..).zip(states) {
        let state = if *open { "open" } else { "closed" };
        println!("{:>12}: {state}", valve_label(channel, chip));
    }
}

fn describe(state: &DeviceState, chip: Option<&ChipConfig>) -> String {
    match state {
        DeviceState::Empty => "(no reading)".to_string(),
        DeviceState::Valves(valves) => {
            let open: Vec<_> = valves
                .iter()
                .zip(1u16..)
                .filter(|(open, _)| **open)
                .map(|(_, channel)| valve_label(channel, chip))
                .collect();
            if open.is_empty() {
                "all closed".to_string()
            } else {
                format!("open: {}", open.join(", "))
            }
        }
        DeviceState::Pressure(values) => values
            .iter()
            .map(|v| format!("{v:.1}"))
            .collect::<Vec<_>>()
            .join(" ")
            + " mbar",
        DeviceState::Position(p) => format!("x {:.4} mm, y {:.4} mm", p.x, p.y),
    }
}
