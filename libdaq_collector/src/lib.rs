//! # daq_collector
//!
//! daq_collector is a data collector for distributed data acquisition systems, written in
//! Rust. Producers (detector readout, trigger logic units, ...) connect over TCP and
//! stream their events; the collector merges the streams into one stream of combined
//! events and writes it to one file per run.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installing the toolchain.
//!
//! To build and install the CLI use `cargo install --path ./daq_collector_cli` from the
//! top level of the repository.
//!
//! ## Merging
//!
//! Two merge modes are available:
//!
//! - `trigger`: events of all sources carrying the same trigger number are combined. A
//! source that skips a trigger number stalls the merge until the other sources move on.
//! - `timestamp`: every event covers a half-open interval `[begin, end)` of time. The
//! collector cuts the time axis into windows and combines all events that overlap a
//! window. An event reaching past a window also contributes to the next one.
//!
//! Each merged event holds shared references to the original events as sub-events.
//! Begin-of-run and end-of-run events of all sources are gathered into one framing event
//! each.
//!
//! ## Pipeline
//!
//! Between the merger and the output file sits a graph of processing nodes. Nodes that are
//! fed from more than one thread (or that are explicitly queued) get their own thread and
//! dispatch queue, called a hub; everything else runs inline on the thread feeding it. A
//! node can push back (`BusyRetry`), drop single events (`BusySkip`), ignore events
//! (`SkipEvent`) or stop the chain feeding it (`Stop`).
//!
//! ## Configuration
//!
//! Configurations are YAML files. A template can be generated with the CLI `new`
//! subcommand:
//!
//! ```yml
//! listen_address: 127.0.0.1:44000
//! collector_name: dc
//! collector_id: 0
//! output_path: /data/runs
//! file_prefix: ''
//! merger:
//!   mode: trigger
//!   queue_capacity: 4096
//!   overflow_policy: reject
//!   required_sources: []
//! stages:
//!   - name: physics
//!     kind: trigger_filter
//!     params: {first: 100, last: 20000}
//! sink_buffer_capacity: 256
//! hub_capacity: 1024
//! ```
//!
//! ## Output
//!
//! Each run is written to `<output_path>/<file_prefix>run<NNNNNN>.raw` as a sequence of
//! frames: a little-endian `u32` length, a `u8` frame type and the serialized event. The
//! same framing is used on producer connections.
pub mod buffer_node;
pub mod collector;
pub mod collector_status;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod event_builder;
pub mod file_writer;
pub mod graph;
pub mod hub;
pub mod merger;
pub mod node;
pub mod process;
pub mod registry;
pub mod source_queue;
pub mod stages;
pub mod timestamp_merger;
pub mod trigger_merger;
pub mod wire;
