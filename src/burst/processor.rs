//! Hand-off point to the spectral wave processor.
//!
//! Wave-parameter math (spectra, significant height, periods) lives outside
//! this crate. The importer passes every finalized burst to a
//! [`WaveProcessor`] together with the site parameters from the options.

use super::WaveBurst;
use crate::error::AppResult;
use serde::{Deserialize, Serialize};

/// Site and quality parameters for wave analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveParameters {
    /// Degrees, positive north.
    pub latitude: f64,
    /// Degrees, positive east.
    pub longitude: f64,
    /// Metres added to the pressure-derived depth.
    pub pressure_offset: f64,
    /// Samples with correlation below this are flagged by the processor.
    pub correlation_threshold: f64,
    /// Bin indices the processor evaluates.
    pub selected_bins: Vec<u16>,
}

impl Default for WaveParameters {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            pressure_offset: 0.0,
            correlation_threshold: 0.25,
            selected_bins: vec![0, 1, 2],
        }
    }
}

/// External wave-parameter computation.
pub trait WaveProcessor: Send + Sync {
    /// Process one finalized burst.
    fn process(&self, burst: &WaveBurst, params: &WaveParameters) -> AppResult<()>;
}
