use flume::{RecvError, Selector};
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use super::collector::Collector;
use super::collector_status::{CollectorStatus, RunState};
use super::command::Command;
use super::config::Config;
use super::constants::STATUS_INTERVAL;
use super::error::{CollectorError, ProcessorError};
use super::file_writer::NativeFileWriter;
use super::node::FatalError;

/// What woke the run loop up
enum Wake {
    Command(Result<Command, RecvError>),
    Fatal(Result<FatalError, RecvError>),
}

/// What the run loop does after a command
enum Flow {
    Continue,
    Exit,
}

fn open_collector(config: &Config) -> Result<Collector, CollectorError> {
    Collector::start(config, Box::new(NativeFileWriter::new(config)))
}

/// Replace the collector with one built from `config`. Producers have to reconnect.
fn restart(collector: &mut Option<Collector>, config: &Config) -> Result<Flow, ProcessorError> {
    if let Some(previous) = collector.take() {
        previous.shutdown()?;
    }
    *collector = Some(open_collector(config)?);
    Ok(Flow::Continue)
}

fn reconfigure(
    path: Option<PathBuf>,
    config: &mut Config,
    collector: &mut Option<Collector>,
) -> Result<Flow, ProcessorError> {
    if collector
        .as_ref()
        .is_some_and(|c| c.state() == RunState::Running)
    {
        spdlog::warn!("Cannot configure while a run is in progress; stop it first");
        return Ok(Flow::Continue);
    }
    if let Some(path) = path {
        spdlog::info!("Loading config from {}...", path.to_string_lossy());
        *config = Config::read_config_file(&path)?;
    }
    restart(collector, config)?;
    spdlog::info!("Collector configured.");
    Ok(Flow::Continue)
}

/// Commands that act on the running collector
fn apply(
    command: Command,
    collector: &mut Collector,
    status_tx: &Sender<CollectorStatus>,
) -> Result<Flow, ProcessorError> {
    match command {
        Command::Start(run_number) => collector.start_run(run_number)?,
        Command::Stop => collector.stop_run()?,
        Command::Status => {
            let status = collector.status();
            spdlog::info!("{status}");
            status_tx.send(status)?;
        }
        Command::Terminate => return Ok(Flow::Exit),
        Command::Relay { subcommand, args } => match subcommand.as_str() {
            "EXIT" => return Ok(Flow::Exit),
            "HELP" => spdlog::info!(
                "Commands: configure [file], start <run>, stop, reset, terminate, status, cmd <HELP|SETUP|EXIT>"
            ),
            _ => spdlog::warn!("Unknown relay command {subcommand} {}", args.join(" ")),
        },
        Command::Configure(_) | Command::Reset => {
            spdlog::warn!("Command {} needs to rebuild the collector", command.verb())
        }
    }
    Ok(Flow::Continue)
}

/// The run loop of the collector.
///
/// Starts a collector for the given configuration, then applies run-control commands as
/// they arrive. Fatal pipeline errors abort the current run. A status snapshot is sent
/// every [`STATUS_INTERVAL`] and whenever a `status` command asks for one. Returns once a
/// terminate command arrives or the command channel closes.
pub fn process(
    config: Config,
    status_tx: &Sender<CollectorStatus>,
    commands: &flume::Receiver<Command>,
) -> Result<(), ProcessorError> {
    let mut config = config;
    let mut collector: Option<Collector> = None;

    loop {
        if collector.is_none() {
            collector = Some(open_collector(&config)?);
        }
        let Some(current) = collector.as_mut() else {
            break;
        };
        let fatal_rx = match current.fatal_errors() {
            Some(rx) => rx,
            None => {
                spdlog::error!("Collector has no pipeline; stopping the run loop");
                break;
            }
        };
        let wake = Selector::new()
            .recv(commands, Wake::Command)
            .recv(&fatal_rx, Wake::Fatal)
            .wait_timeout(STATUS_INTERVAL);

        match wake {
            Ok(Wake::Command(Ok(command))) => {
                spdlog::debug!("Applying command {}", command.verb());
                let result = match command {
                    Command::Configure(path) => reconfigure(path, &mut config, &mut collector),
                    Command::Relay { subcommand, .. } if subcommand == "SETUP" => {
                        reconfigure(None, &mut config, &mut collector)
                    }
                    Command::Reset => {
                        spdlog::info!("Resetting the collector; producers must reconnect");
                        restart(&mut collector, &config)
                    }
                    command => apply(command, current, status_tx),
                };
                match result {
                    Ok(Flow::Continue) => (),
                    Ok(Flow::Exit) => break,
                    // a bad configure or start must not take the collector down
                    Err(ProcessorError::ConfigError(e)) => spdlog::error!("{e}"),
                    Err(ProcessorError::CollectorError(CollectorError::PipelineError(e))) => {
                        spdlog::error!("Command failed: {e}")
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(Wake::Command(Err(_))) => {
                spdlog::info!("Command channel closed.");
                break;
            }
            Ok(Wake::Fatal(Ok(fatal))) => current.abort_run(&fatal),
            Ok(Wake::Fatal(Err(_))) | Err(_) => (),
        }
        if let Some(c) = collector.as_ref() {
            status_tx.send(c.status())?;
        }
    }

    if let Some(c) = collector.take() {
        let mut status = c.status();
        c.shutdown()?;
        status.state = RunState::Terminated;
        spdlog::info!("{status}");
        status_tx.send(status)?;
    }
    Ok(())
}
