use human_bytes::human_bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::config::Config;
use super::error::SinkError;
use super::event::EventRef;
use super::wire::write_event;

/// Somewhere merged events end up.
///
/// A sink that cannot take an event right now returns an IO error of kind `WouldBlock`;
/// the pipeline then offers the same event again later.
pub trait EventSink: Send {
    /// Write one event, returning the number of bytes written
    fn write(&mut self, event: &EventRef) -> Result<usize, SinkError>;

    /// Flush and release whatever the sink holds open
    fn close(&mut self) -> Result<(), SinkError>;
}

/// A run file that is currently being written
#[derive(Debug)]
struct RunFile {
    run_number: u32,
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

/// Writes every run to its own file of wire frames in the configured output directory.
///
/// The file is opened by the merged begin-of-run event and closed by the merged
/// end-of-run event. Data outside of an open run is an error.
#[derive(Debug)]
pub struct NativeFileWriter {
    config: Config,
    current: Option<RunFile>,
    total_bytes: u64,
}

impl NativeFileWriter {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            current: None,
            total_bytes: 0,
        }
    }

    /// Path of the file currently open, if any
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|file| file.path.as_path())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn open(&mut self, run_number: u32) -> Result<(), SinkError> {
        if let Some(previous) = self.current.as_ref() {
            spdlog::warn!(
                "Run {} was never closed before run {run_number} began; closing it now",
                previous.run_number
            );
            self.close()?;
        }
        let path = self.config.get_run_file_name(run_number)?;
        let writer = BufWriter::new(File::create(&path)?);
        spdlog::info!("Opened run file {}", path.display());
        self.current = Some(RunFile {
            run_number,
            path,
            writer,
            bytes_written: 0,
        });
        Ok(())
    }
}

impl EventSink for NativeFileWriter {
    fn write(&mut self, event: &EventRef) -> Result<usize, SinkError> {
        if event.is_bore() {
            self.open(event.run_number())?;
        }
        let file = match self.current.as_mut() {
            Some(file) if file.run_number == event.run_number() => file,
            _ => return Err(SinkError::NoOpenRun(event.run_number())),
        };
        let written = write_event(&mut file.writer, event)?;
        file.bytes_written += written as u64;
        self.total_bytes += written as u64;
        if event.is_eore() {
            self.close()?;
        }
        Ok(written)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.current.take() {
            file.writer.flush()?;
            spdlog::info!(
                "Closed run file {} after {}",
                file.path.display(),
                human_bytes(file.bytes_written as f64)
            );
        }
        Ok(())
    }
}

impl Drop for NativeFileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            spdlog::error!("Failed to close run file: {e}");
        }
    }
}
