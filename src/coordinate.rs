//! Build coordinate value object
//!
//! A build within a branch is identified by `(buildDate, sequence)` where the
//! date is a `YYYYMMDD` day and the sequence is a positive counter within
//! that day. Ordering is date first, then sequence, which the derived `Ord`
//! on `(NaiveDate, u32)` gives us directly.

use chrono::NaiveDate;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Date format used in artifact URLs and on-disk directory names.
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Errors produced when constructing a [`BuildCoordinate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinateError {
    #[error("invalid build date '{0}': expected YYYYMMDD")]
    InvalidDate(String),

    #[error("invalid build sequence {0}: must be >= 1")]
    InvalidSequence(u32),
}

/// Identifies one build within a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildCoordinate {
    date: NaiveDate,
    seq: u32,
}

impl BuildCoordinate {
    /// Build a coordinate from a date and a positive sequence number.
    pub fn new(date: NaiveDate, seq: u32) -> Result<Self, CoordinateError> {
        if seq == 0 {
            return Err(CoordinateError::InvalidSequence(seq));
        }
        Ok(Self { date, seq })
    }

    /// Parse a coordinate from its stored form: a `YYYYMMDD` date string and
    /// a sequence number.
    pub fn parse(date: &str, seq: u32) -> Result<Self, CoordinateError> {
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|_| CoordinateError::InvalidDate(date.to_string()))?;
        Self::new(date, seq)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// The `YYYYMMDD` rendering used in URLs, paths and the database.
    pub fn date_str(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    /// The URL path segment for this build: `Build20250102.3`.
    pub fn url_segment(&self) -> String {
        format!("Build{}.{}", self.date_str(), self.seq)
    }

    /// The directory name for this build: `20250102.3`.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.date_str(), self.seq)
    }

    /// The coordinate for the next sequence on the same date.
    pub fn next_seq(&self) -> Self {
        Self {
            date: self.date,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for BuildCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.date_str(), self.seq)
    }
}

impl Serialize for BuildCoordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(date: &str, seq: u32) -> BuildCoordinate {
        BuildCoordinate::parse(date, seq).unwrap()
    }

    #[test]
    fn parses_and_renders_canonical_forms() {
        let c = coord("20250102", 3);
        assert_eq!(c.date_str(), "20250102");
        assert_eq!(c.url_segment(), "Build20250102.3");
        assert_eq!(c.dir_name(), "20250102.3");
        assert_eq!(c.to_string(), "20250102.3");
    }

    #[test]
    fn rejects_malformed_dates() {
        assert_eq!(
            BuildCoordinate::parse("2025-01-02", 1),
            Err(CoordinateError::InvalidDate("2025-01-02".to_string()))
        );
        assert_eq!(
            BuildCoordinate::parse("20251340", 1),
            Err(CoordinateError::InvalidDate("20251340".to_string()))
        );
        assert_eq!(
            BuildCoordinate::parse("", 1),
            Err(CoordinateError::InvalidDate(String::new()))
        );
    }

    #[test]
    fn rejects_zero_sequence() {
        assert_eq!(
            BuildCoordinate::parse("20250102", 0),
            Err(CoordinateError::InvalidSequence(0))
        );
    }

    #[test]
    fn orders_by_date_then_sequence() {
        // A later date beats any sequence on an earlier date.
        assert!(coord("20250103", 1) > coord("20250102", 999));
        // Within a date, sequence is numeric, not lexicographic.
        assert!(coord("20250102", 10) > coord("20250102", 9));
        assert_eq!(coord("20250102", 5), coord("20250102", 5));
    }

    #[test]
    fn next_seq_stays_on_the_same_date() {
        let c = coord("20250102", 7).next_seq();
        assert_eq!(c, coord("20250102", 8));
    }

    #[test]
    fn serializes_as_dotted_string() {
        let json = serde_json::to_string(&coord("20250102", 3)).unwrap();
        assert_eq!(json, r#""20250102.3""#);
    }
}
