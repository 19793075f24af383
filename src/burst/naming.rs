//! Output file naming for wave bursts.

use chrono::NaiveDateTime;

/// Leading character of burst files recorded by the instrument.
pub const SOURCE_MARKER: char = 'B';

/// Leading character of wave files written by this crate.
pub const WAVE_MARKER: char = 'W';

/// Map a source file name to its wave output name.
///
/// The source marker is replaced with the wave marker (the first occurrence;
/// a name without it just gets the wave marker prepended) and the extension is
/// replaced with `extension`.
///
/// ```
/// use adcp_waves::burst::naming::wave_file_name;
/// assert_eq!(wave_file_name("B0000003.ENS", "json"), "W0000003.json");
/// ```
pub fn wave_file_name(source_name: &str, extension: &str) -> String {
    let stem = match source_name.rfind('.') {
        Some(dot) if dot > 0 => &source_name[..dot],
        _ => source_name,
    };
    let renamed = match stem.find(SOURCE_MARKER) {
        Some(at) => {
            let mut s = String::with_capacity(stem.len());
            s.push_str(&stem[..at]);
            s.push(WAVE_MARKER);
            s.push_str(&stem[at + SOURCE_MARKER.len_utf8()..]);
            s
        }
        None => format!("{}{}", WAVE_MARKER, stem),
    };
    format!("{}.{}", renamed, extension)
}

/// Output name for a burst whose source file is unknown (live stream).
pub fn derived_file_name(serial_number: &str, first: NaiveDateTime, extension: &str) -> String {
    let serial: String = serial_number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    format!(
        "{}{}_{}.{}",
        WAVE_MARKER,
        serial,
        first.format("%Y%m%d%H%M%S"),
        extension
    )
}

/// Append `_n` before the extension.
pub(crate) fn with_suffix(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_{}", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn replaces_marker_and_extension() {
        assert_eq!(wave_file_name("B0000003.ENS", "json"), "W0000003.json");
        assert_eq!(wave_file_name("B0000003.ENS", "csv"), "W0000003.csv");
    }

    #[test]
    fn name_without_marker_gets_prefix() {
        assert_eq!(wave_file_name("A0000001.ENS", "json"), "WA0000001.json");
        assert_eq!(wave_file_name("noext", "csv"), "Wnoext.csv");
    }

    #[test]
    fn derived_name_uses_serial_and_time() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .unwrap();
        assert_eq!(
            derived_file_name("01 300/0001", ts, "json"),
            "W013000001_20240102030405.json"
        );
    }

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(with_suffix("W1.json", 2), "W1_2.json");
        assert_eq!(with_suffix("W1", 1), "W1_1");
    }
}
