//! # daq_collector_cli
//!
//! Part of the daq_collector crate family.
//!
//! Command line front end of the data collector. Run control commands are read from
//! standard input, one per line:
//!
//! ```text
//! configure [file]
//! start <run>
//! stop
//! reset
//! status
//! terminate
//! cmd HELP
//! ```
//!
//! Make a template configuration with `daq_collector_cli -p config.yml new`, then start
//! the collector with `daq_collector_cli -p config.yml`.
use clap::{Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use libdaq_collector::collector_status::CollectorStatus;
use libdaq_collector::command::Command as RunCommand;
use libdaq_collector::config::Config;
use libdaq_collector::process::process;

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => spdlog::info!("Done."),
        Err(e) => spdlog::error!("Could not write template config: {e}"),
    }
}

/// Log to ./daq_collector.log and to the terminal
fn setup_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./daq_collector.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create the log file!"),
    );
    let terminal_sinks = spdlog::default_logger().sinks().to_owned();
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sinks(terminal_sinks)
            .sink(file_sink)
            .build()
            .expect("Could not create the logger!"),
    );
    spdlog::set_default_logger(logger);
}

/// Forward stdin lines to the run loop until stdin closes
fn read_commands(tx: flume::Sender<RunCommand>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                spdlog::error!("Failed to read from stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match RunCommand::parse(&line) {
            Ok(command) => {
                if tx.send(command).is_err() {
                    break;
                }
            }
            Err(e) => spdlog::warn!("{e}"),
        }
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("daq_collector_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    setup_logging();

    let config_path = match matches.get_one::<String>("path") {
        Some(path) => PathBuf::from(path),
        None => {
            spdlog::error!("A configuration path is required");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Listening on: {}", config.listen_address);
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    spdlog::info!("Merge Mode: {:?}", config.merger.mode);
    spdlog::info!("Stages: {}", config.stages.len());

    let (status_tx, status_rx) = mpsc::channel::<CollectorStatus>();
    let (command_tx, command_rx) = flume::unbounded::<RunCommand>();
    let handle = std::thread::spawn(move || process(config, &status_tx, &command_rx));
    // the reader blocks on stdin forever, so it is never joined
    std::thread::spawn(move || read_commands(command_tx));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or(ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    loop {
        if let Ok(status) = status_rx.recv_timeout(Duration::from_secs(1)) {
            spinner.set_message(status.to_string());
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(_) => spdlog::info!("Collector terminated cleanly."),
                    Err(e) => spdlog::error!("Collector failed with error: {e}"),
                },
                Err(_) => spdlog::error!("Failed to join the collector task!"),
            }
            break;
        }
    }

    spinner.finish();
    spdlog::info!("Done.");
}
