//! # ADCP Wave Pipeline
//!
//! Library behind the `adcp_waves` command-line tool. It talks to a
//! current/wave profiler, downloads the files stored on the instrument,
//! decodes the binary ensemble stream and folds the ensembles into wave
//! bursts for downstream spectral analysis.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the `Transport` trait for the instrument link, with a
//!   mock instrument and a serial implementation (feature `instrument_serial`).
//! - **`download`**: `DownloadCoordinator`, the bounded-time download loop
//!   with a single retry pass and cooperative cancellation.
//! - **`ensemble`**: wire format, incremental decoder with resynchronization,
//!   and an encoder used by the mock instrument.
//! - **`burst`**: `BurstAccumulator`, burst naming, JSON/CSV writers and the
//!   wave processor hand-off.
//! - **`display`**: `DisplayFeed`, a non-blocking queue of finalized bursts
//!   drained by a single consumer at a time.
//! - **`import`**: decoding of stored files into bursts.
//! - **`config`**: persisted options (Figment + TOML), saved after each change.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the crate-wide `WaveError`.
//!
//! ## Data flow
//!
//! ```text
//! Transport -> DownloadCoordinator -> file on disk
//!                                        |
//!                      decode_file -> BurstAccumulator -> BurstWriter
//!                                                       -> DisplayFeed
//! ```

pub mod burst;
pub mod config;
pub mod display;
pub mod download;
pub mod ensemble;
pub mod error;
pub mod import;
pub mod logging;
pub mod transport;

pub use download::{DownloadCoordinator, DownloadReport, DownloadSession};
pub use error::{AppResult, WaveError};
pub use import::{ImportReport, WaveImporter};
