//! Persisted options.
//!
//! Options are loaded with Figment from a TOML document merged with
//! environment variables prefixed `ADCP_WAVES_` (nested keys use `__`, e.g.
//! `ADCP_WAVES_SERIAL__PORT=/dev/ttyUSB1`). A missing file yields defaults.
//!
//! [`OptionsStore::update`] applies a mutation, validates the result and
//! writes the whole document back before the new values become visible.
//!
//! # Example
//! ```no_run
//! use adcp_waves::config::OptionsStore;
//!
//! # fn main() -> adcp_waves::error::AppResult<()> {
//! let store = OptionsStore::open(OptionsStore::default_path())?;
//! store.update(|o| o.download_timeout_minutes = 5)?;
//! # Ok(())
//! # }
//! ```

use crate::burst::{BurstWriter, JsonBurstWriter, WaveParameters};
use crate::download::DownloadSession;
use crate::error::{AppResult, WaveError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Burst output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BurstFormat {
    /// `serde_json` document per burst.
    Json,
    /// One CSV row per sample, bin and beam.
    Csv,
}

impl BurstFormat {
    /// Writer producing this format.
    pub fn writer(self) -> AppResult<Arc<dyn BurstWriter>> {
        match self {
            BurstFormat::Json => Ok(Arc::new(JsonBurstWriter)),
            #[cfg(feature = "storage_csv")]
            BurstFormat::Csv => Ok(Arc::new(crate::burst::CsvBurstWriter)),
            #[cfg(not(feature = "storage_csv"))]
            BurstFormat::Csv => Err(WaveError::Storage(
                "CSV output requires the storage_csv feature".to_string(),
            )),
        }
    }
}

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Bits per second.
    pub baud_rate: u32,
    /// Overall limit for one command reply, in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: 115_200,
            read_timeout_ms: 2000,
        }
    }
}

fn default_serial_port() -> String {
    if cfg!(windows) {
        "COM1".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

/// Top-level options document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveOptions {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Per-file download timeout in minutes.
    pub download_timeout_minutes: u64,
    /// Where downloaded files (and burst outputs) are stored.
    pub download_dir: PathBuf,
    /// Download files that already exist locally.
    pub overwrite: bool,
    /// Decode each file into wave bursts right after it is downloaded.
    pub parse_on_download: bool,
    /// Correlation below this marks a sample as low quality.
    pub correlation_threshold: f64,
    /// Metres added to the pressure-derived depth.
    pub pressure_offset: f64,
    /// Bin indices: height source, then velocity bins.
    pub selected_bins: Vec<u16>,
    /// Site latitude, degrees (-90..=90).
    pub latitude: f64,
    /// Site longitude, degrees (-180..=180).
    pub longitude: f64,
    /// Burst file format.
    pub output_format: BurstFormat,
    /// Serial link settings.
    pub serial: SerialOptions,
}

impl Default for WaveOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            download_timeout_minutes: 10,
            download_dir: default_download_dir(),
            overwrite: false,
            parse_on_download: false,
            correlation_threshold: 0.25,
            pressure_offset: 0.0,
            selected_bins: vec![0, 1, 2],
            latitude: 0.0,
            longitude: 0.0,
            output_format: BurstFormat::Json,
            serial: SerialOptions::default(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("adcp_waves").join("downloads"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

impl WaveOptions {
    /// Load options from `path` (if it exists) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let options: WaveOptions = Figment::from(Serialized::defaults(WaveOptions::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ADCP_WAVES_").split("__"))
            .extract()?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option values after loading or mutation.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(WaveError::ConfigValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.download_timeout_minutes == 0 {
            return Err(WaveError::ConfigValidation(
                "download_timeout_minutes must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return Err(WaveError::ConfigValidation(format!(
                "Invalid correlation_threshold {}. Must be 0-1",
                self.correlation_threshold
            )));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(WaveError::ConfigValidation(format!(
                "Invalid latitude {}",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(WaveError::ConfigValidation(format!(
                "Invalid longitude {}",
                self.longitude
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(WaveError::ConfigValidation("baud_rate must be > 0".to_string()));
        }
        Ok(())
    }

    /// Per-file timeout as a `Duration`.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_minutes * 60)
    }

    /// Session settings for a batch download into `download_dir`.
    pub fn download_session(&self) -> DownloadSession {
        DownloadSession::new(&self.download_dir)
            .with_timeout(self.download_timeout())
            .with_overwrite(self.overwrite)
            .with_parse(self.parse_on_download)
    }

    /// Session for one run with command-line flags on top of the options.
    ///
    /// A flag can only turn a policy on, and only for this session.
    pub fn download_session_with(&self, overwrite: bool, parse: bool) -> DownloadSession {
        let session = self.download_session();
        let overwrite = overwrite || session.overwrite;
        let parse = parse || session.parse;
        session.with_overwrite(overwrite).with_parse(parse)
    }

    /// Site parameters for the wave processor.
    pub fn wave_parameters(&self) -> WaveParameters {
        WaveParameters {
            latitude: self.latitude,
            longitude: self.longitude,
            pressure_offset: self.pressure_offset,
            correlation_threshold: self.correlation_threshold,
            selected_bins: self.selected_bins.clone(),
        }
    }
}

/// Options document bound to a file, saved after every mutation.
pub struct OptionsStore {
    path: PathBuf,
    options: RwLock<WaveOptions>,
}

impl OptionsStore {
    /// Default location: `<config dir>/adcp_waves/options.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("adcp_waves"))
            .unwrap_or_else(|| PathBuf::from("config"))
            .join("options.toml")
    }

    /// Load the document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let options = WaveOptions::load_from(&path)?;
        debug!(file = %path.display(), "Options loaded");
        Ok(Self {
            path,
            options: RwLock::new(options),
        })
    }

    /// File the options are saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current options.
    pub fn get(&self) -> WaveOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `mutate`, validate, persist, then publish the new values.
    ///
    /// On any error the stored options are left unchanged.
    pub fn update<F>(&self, mutate: F) -> AppResult<WaveOptions>
    where
        F: FnOnce(&mut WaveOptions),
    {
        let mut guard = self.options.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        mutate(&mut next);
        next.validate()?;
        save(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }

    /// Write the current options to disk.
    pub fn save(&self) -> AppResult<()> {
        save(&self.path, &self.get())
    }
}

fn save(path: &Path, options: &WaveOptions) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let text = toml::to_string_pretty(options)?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    debug!(file = %path.display(), "Options saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = OptionsStore::open(dir.path().join("absent.toml")).unwrap();
        let options = store.get();
        assert_eq!(options.download_timeout_minutes, 10);
        assert_eq!(options.output_format, BurstFormat::Json);
        assert!(!options.overwrite);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        fs::write(
            &path,
            "download_timeout_minutes = 3\noutput_format = \"csv\"\n[serial]\nbaud_rate = 9600\n",
        )
        .unwrap();

        let options = WaveOptions::load_from(&path).unwrap();
        assert_eq!(options.download_timeout_minutes, 3);
        assert_eq!(options.download_timeout(), Duration::from_secs(180));
        assert_eq!(options.output_format, BurstFormat::Csv);
        assert_eq!(options.serial.baud_rate, 9600);
        assert_eq!(options.serial.read_timeout_ms, 2000);
    }

    #[test]
    fn update_persists_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("options.toml");
        let store = OptionsStore::open(&path).unwrap();

        store.update(|o| o.latitude = 47.5).unwrap();
        store.update(|o| o.selected_bins = vec![2, 4, 6]).unwrap();

        let reloaded = WaveOptions::load_from(&path).unwrap();
        assert_eq!(reloaded.latitude, 47.5);
        assert_eq!(reloaded.selected_bins, vec![2, 4, 6]);
    }

    #[test]
    fn invalid_update_is_rejected_and_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        let store = OptionsStore::open(&path).unwrap();

        let err = store.update(|o| o.download_timeout_minutes = 0).unwrap_err();
        assert!(matches!(err, WaveError::ConfigValidation(_)));
        assert_eq!(store.get().download_timeout_minutes, 10);
        assert!(!path.exists());
    }

    #[test]
    fn derived_values_follow_options() {
        let options = WaveOptions {
            latitude: 10.0,
            longitude: -20.0,
            correlation_threshold: 0.4,
            overwrite: true,
            ..WaveOptions::default()
        };
        let params = options.wave_parameters();
        assert_eq!(params.latitude, 10.0);
        assert_eq!(params.longitude, -20.0);
        assert_eq!(params.correlation_threshold, 0.4);

        let session = options.download_session();
        assert!(session.overwrite);
        assert_eq!(session.per_file_timeout, Duration::from_secs(600));
    }

    #[test]
    fn run_flags_apply_to_one_session_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        let store = OptionsStore::open(&path).unwrap();
        store.update(|o| o.latitude = 1.0).unwrap();

        let options = store.get();
        let session = options.download_session_with(true, true);
        assert!(session.overwrite);
        assert!(session.parse);

        // Nothing was written back, so the next run starts from the file.
        let reloaded = OptionsStore::open(&path).unwrap().get();
        assert!(!reloaded.overwrite);
        assert!(!reloaded.parse_on_download);
        let next = reloaded.download_session_with(false, false);
        assert!(!next.overwrite);
        assert!(!next.parse);
    }
}
