//! Directory listing reply parsing.
//!
//! The instrument answers the directory command with text such as:
//!
//! ```text
//! DSDIR
//! Total Space:                       3781.500 MB
//! Used Space:                           0.072 MB
//! B0000001.ENS 2024/03/09 06:00:00      0.056234
//! B0000002.ENS 2024/03/09 07:00:00      1.250000
//! ```
//!
//! Entry sizes are in megabytes. Lines that match neither form are ignored.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One file stored on the instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// File name.
    pub name: String,
    pub modified: Option<NaiveDateTime>,
    /// Size in bytes; 0 if the instrument did not report it.
    pub size: i64,
}

/// Parsed directory reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListing {
    /// Card capacity, MB.
    pub total_space_mb: f64,
    pub used_space_mb: f64,
    /// Stored files, in listing order.
    pub entries: Vec<DirectoryEntry>,
}

/// Parse the text reply of the directory command.
pub fn parse_directory_listing(text: &str) -> DirectoryListing {
    let mut listing = DirectoryListing::default();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("Total Space:") {
            listing.total_space_mb = parse_mb(rest).unwrap_or(0.0);
        } else if let Some(rest) = line.strip_prefix("Used Space:") {
            listing.used_space_mb = parse_mb(rest).unwrap_or(0.0);
        } else if let Some(entry) = parse_entry(line) {
            listing.entries.push(entry);
        } else {
            debug!(line, "Ignoring directory line");
        }
    }

    listing
}

fn parse_mb(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

fn parse_entry(line: &str) -> Option<DirectoryEntry> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    if !name.contains('.') {
        return None;
    }
    let date = parts.next()?;
    let time = parts.next()?;
    let size_mb: f64 = parts.next()?.parse().ok()?;

    let modified =
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y/%m/%d %H:%M:%S").ok();

    Some(DirectoryEntry {
        name: name.to_string(),
        modified,
        size: (size_mb * BYTES_PER_MB).round() as i64,
    })
}

/// Render a listing in the instrument's reply format.
pub fn format_directory_listing(listing: &DirectoryListing) -> String {
    let mut out = String::from("DSDIR\r\n");
    out.push_str(&format!("Total Space: {:>20.3} MB\r\n", listing.total_space_mb));
    out.push_str(&format!("Used Space: {:>21.3} MB\r\n", listing.used_space_mb));
    for entry in &listing.entries {
        let modified = entry
            .modified
            .map(|m| m.format("%Y/%m/%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "1970/01/01 00:00:00".to_string());
        out.push_str(&format!(
            "{} {} {:>13.6}\r\n",
            entry.name,
            modified,
            entry.size as f64 / BYTES_PER_MB
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "DSDIR\r\n\
        Total Space:                       3781.500 MB\r\n\
        Used Space:                           0.072 MB\r\n\
        B0000001.ENS 2024/03/09 06:00:00      0.500000\r\n\
        B0000002.ENS 2024/03/09 07:00:00      1.000000\r\n\
        garbage line\r\n";

    #[test]
    fn parses_space_and_entries() {
        let listing = parse_directory_listing(REPLY);
        assert_eq!(listing.total_space_mb, 3781.5);
        assert_eq!(listing.used_space_mb, 0.072);
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].name, "B0000001.ENS");
        assert_eq!(listing.entries[0].size, 512 * 1024);
        assert_eq!(listing.entries[1].size, 1024 * 1024);
        assert!(listing.entries[1].modified.is_some());
    }

    #[test]
    fn formatted_listing_parses_back() {
        let listing = parse_directory_listing(REPLY);
        let again = parse_directory_listing(&format_directory_listing(&listing));
        assert_eq!(again.entries, listing.entries);
    }

    #[test]
    fn unparseable_date_keeps_entry() {
        let listing = parse_directory_listing("B1.ENS 2024/13/40 99:00:00 0.25");
        assert_eq!(listing.entries.len(), 1);
        assert!(listing.entries[0].modified.is_none());
    }
}
