//! Operator console for the DPS programming fixture.
//!
//! Reads one command per line from stdin and prints runner events to stdout.
//!
//! ```bash
//! dps_cnc --config config/dps_cnc.toml --plate thule_4x3 --firmware thule_flash
//! dps_cnc --simulate
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dps_cnc::config::{FirmwareKind, LoggingConfig, Settings};
use dps_cnc::dps::MessageFormatter;
use dps_cnc::hardware::mock::{NoDelay, SimulatedDps};
use dps_cnc::hardware::sysfs::{IioAdc, SysfsGpio};
use dps_cnc::hardware::SpinDelay;
use dps_cnc::motion::Axis;
use dps_cnc::programmer::{ScriptedProcessRunner, TokioProcessRunner};
use dps_cnc::runner::{Cell, Hardware, Runner, RunnerEvent, RunnerState};

/// Raster programmer and tester for DPS boards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drive a simulated fixture instead of GPIO, ADC and the programming tool
    #[arg(long)]
    simulate: bool,

    /// Log filter, overrides RUST_LOG and `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Plate to select at startup
    #[arg(long)]
    plate: Option<String>,

    /// Firmware to select at startup
    #[arg(long)]
    firmware: Option<String>,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

const HELP: &str = "\
commands:
  home                 drive to the origin
  set-home             declare the current position as origin
  jog <x|y|z> <mm>     move one axis by a signed distance
  start <col> <row>    start the automatic cycle at a cell
  pause | resume       interrupt / continue the cycle
  finish               leave a paused or completed cycle
  stop                 hard stop
  plate <name>         select a plate
  firmware <name>      select a firmware
  status               show state, position and selection
  erase                erase the board under the head
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Settings::default(),
    };

    if args.dump_config {
        print!("{}", toml::to_string_pretty(&settings).context("failed to render configuration")?);
        return Ok(());
    }

    init_tracing(&settings.logging, args.log_level.as_deref())?;

    let (hardware, simulated) = build_hardware(&settings, args.simulate);
    let runner = Runner::new(settings, hardware).context("failed to initialise the fixture")?;

    if let Some(name) = &args.plate {
        runner.select_plate(name)?;
    }
    if let Some(name) = &args.firmware {
        let kind = runner.select_firmware(name)?;
        if let Some(dps) = &simulated {
            dps.set_kind(kind);
        }
    }

    runner.start();
    spawn_event_printer(&runner);
    let mut lines = spawn_stdin_reader();

    println!("{HELP}");
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(line) = line else { break };

        match execute(&runner, simulated.as_deref(), &line, &mut lines).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    runner.shutdown().await;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .context("invalid logging.level")?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build_hardware(settings: &Settings, simulate: bool) -> (Hardware, Option<Arc<SimulatedDps>>) {
    if simulate {
        info!("using simulated fixture");
        let dps = Arc::new(SimulatedDps::new(settings.pins.clone(), FirmwareKind::Flash));
        let hardware = Hardware {
            io: dps.clone(),
            adc: dps.clone(),
            delay: Arc::new(NoDelay),
            process: Arc::new(
                ScriptedProcessRunner::succeeding().with_run_time(Duration::from_millis(500)),
            ),
        };
        (hardware, Some(dps))
    } else {
        let hardware = Hardware {
            io: Arc::new(SysfsGpio::new()),
            adc: Arc::new(IioAdc::new()),
            delay: Arc::new(SpinDelay),
            process: Arc::new(TokioProcessRunner),
        };
        (hardware, None)
    }
}

fn spawn_event_printer(runner: &Runner) {
    let mut events = runner.subscribe();
    tokio::spawn(async move {
        let mut last_state = None;
        loop {
            match events.recv().await {
                Ok(RunnerEvent::State(state)) => {
                    if last_state != Some(state) {
                        println!("state: {state}");
                        last_state = Some(state);
                    }
                }
                Ok(RunnerEvent::TargetCell(cell)) => println!("moving to {cell}"),
                Ok(RunnerEvent::CellLogged(log)) => {
                    if log.operation_successful() {
                        println!("{} OK", log.cell);
                    } else {
                        print!("{}", MessageFormatter::error_message(&log));
                    }
                }
                Ok(RunnerEvent::CycleCompleted) => println!("cycle completed"),
                Ok(RunnerEvent::OperationCompleted) => println!("move completed"),
                Ok(RunnerEvent::Position(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

enum Flow {
    Continue,
    Quit,
}

fn require(runner: &Runner, allowed: &[RunnerState], command: &str) -> Result<()> {
    let state = runner.state();
    if !allowed.contains(&state) {
        bail!("'{command}' is not available in state {state}");
    }
    Ok(())
}

async fn confirm(lines: &mut mpsc::Receiver<String>, question: &str) -> bool {
    println!("{question} [y/n]");
    matches!(lines.recv().await.as_deref().map(str::trim), Some("y" | "Y" | "yes"))
}

async fn execute(
    runner: &Runner,
    simulated: Option<&SimulatedDps>,
    line: &str,
    lines: &mut mpsc::Receiver<String>,
) -> Result<Flow> {
    use RunnerState::Stopped;

    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["help"] => println!("{HELP}"),
        ["quit" | "exit"] => return Ok(Flow::Quit),
        ["status"] => print_status(runner),
        ["stop"] => runner.stop(),
        ["home"] => {
            require(runner, &[Stopped], "home")?;
            runner.go_home();
        }
        ["set-home"] => {
            require(runner, &[Stopped], "set-home")?;
            runner.set_home();
        }
        ["jog", axis, distance] => {
            require(runner, &[Stopped], "jog")?;
            let axis: Axis = axis.parse().map_err(anyhow::Error::msg)?;
            let delta_mm: f64 = distance.parse().context("distance must be a number of mm")?;
            if runner.jog_requires_confirmation(axis, delta_mm)
                && !confirm(lines, "The head may hit the boards. Move anyway?").await
            {
                println!("jog cancelled");
                return Ok(Flow::Continue);
            }
            // the state may have changed while waiting for the answer
            require(runner, &[Stopped], "jog")?;
            runner.jog(axis, delta_mm);
        }
        // cycle states also change on the worker; checked under the runner lock
        ["start", column, row] => {
            let cell = Cell::new(
                column.parse().context("column must be a cell index")?,
                row.parse().context("row must be a cell index")?,
            );
            runner.try_start_cycle(cell)?;
        }
        ["pause"] => runner.try_pause_cycle()?,
        ["resume"] => runner.try_resume_cycle()?,
        ["finish"] => runner.try_finish_cycle()?,
        ["plate", name] => {
            require(runner, &[Stopped], "plate")?;
            runner.select_plate(name)?;
        }
        ["firmware", name] => {
            require(runner, &[Stopped], "firmware")?;
            let kind = runner.select_firmware(name)?;
            if let Some(dps) = simulated {
                dps.set_kind(kind);
            }
        }
        ["erase"] => {
            require(runner, &[Stopped], "erase")?;
            let output = runner.erase().await?;
            if output.success() {
                println!("erased");
            } else {
                println!("erase failed (exit {}):\n{}", output.exit_code, output.output.trim_end());
            }
        }
        _ => bail!("unknown command '{line}', try 'help'"),
    }
    Ok(Flow::Continue)
}

fn print_status(runner: &Runner) {
    let logs = runner.dps_logs();
    let passed = logs.values().filter(|log| log.operation_successful()).count();
    println!("state:     {}", runner.state());
    println!("position:  {}", runner.position_mm());
    println!("home set:  {}", runner.home_set());
    println!("plate:     {}", runner.selected_plate().as_deref().unwrap_or("-"));
    println!("firmware:  {}", runner.selected_firmware().as_deref().unwrap_or("-"));
    match runner.resume_point() {
        Some(cell) => println!("resume at: {cell}"),
        None => println!("resume at: -"),
    }
    println!("cells:     {} logged, {passed} passed", logs.len());
}
