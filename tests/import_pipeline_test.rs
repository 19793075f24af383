//! End-to-end import: stored ensemble files -> decoder -> bursts -> writer

use adcp_waves::burst::{JsonBurstWriter, WaveBurst, WaveParameters, WaveProcessor};
use adcp_waves::config::WaveOptions;
use adcp_waves::ensemble::BAD_VELOCITY;
use adcp_waves::import::WaveImporter;
use adcp_waves::transport::mock::synthesize_ensembles;
use adcp_waves::AppResult;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CapturingProcessor {
    calls: Mutex<Vec<(String, usize, WaveParameters)>>,
}

impl WaveProcessor for CapturingProcessor {
    fn process(&self, burst: &WaveBurst, params: &WaveParameters) -> AppResult<()> {
        self.calls.lock().unwrap().push((
            burst.output_name().to_string(),
            burst.len(),
            params.clone(),
        ));
        Ok(())
    }
}

#[test]
fn test_import_batch_with_corruption_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let clean = dir.path().join("B0000001.ENS");
    std::fs::write(&clean, synthesize_ensembles("SN77", 30)).unwrap();

    // Second file: a damaged span in the middle.
    let mut damaged = synthesize_ensembles("SN77", 10);
    let middle = damaged.len() / 2;
    damaged[middle] ^= 0x5A;
    let damaged_path = dir.path().join("B0000002.ENS");
    std::fs::write(&damaged_path, damaged).unwrap();

    let missing = dir.path().join("B0000003.ENS");

    let options = WaveOptions {
        latitude: 36.8,
        longitude: -121.9,
        selected_bins: vec![1, 2, 3],
        ..WaveOptions::default()
    };
    let processor = Arc::new(CapturingProcessor::default());
    let mut importer = WaveImporter::new(dir.path().join("waves"), Arc::new(JsonBurstWriter))
        .with_processor(processor.clone(), options.wave_parameters());

    let report = importer.import_files([&clean, &damaged_path, &missing]);

    assert_eq!(report.files_imported, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, missing);
    assert_eq!(report.ensembles, 30 + 9);
    assert!(report.bytes_discarded > 0);
    assert_eq!(
        report.outputs,
        vec![
            dir.path().join("waves").join("W0000001.json"),
            dir.path().join("waves").join("W0000002.json"),
        ]
    );

    let calls = processor.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "W0000001.json");
    assert_eq!(calls[0].1, 30);
    assert_eq!(calls[1].1, 9);
    assert_eq!(calls[0].2.latitude, 36.8);
    assert_eq!(calls[0].2.selected_bins, vec![1, 2, 3]);

    let text = std::fs::read_to_string(&report.outputs[0]).unwrap();
    let burst: WaveBurst = serde_json::from_str(&text).unwrap();
    // Every seventh synthesized ensemble carries a bad velocity.
    let bad: usize = burst.samples().iter().map(|s| s.bad_velocity_count()).sum();
    assert_eq!(bad, 4);
    assert_eq!(burst.samples()[6].velocities[0][0], BAD_VELOCITY);
}
