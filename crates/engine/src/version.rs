//! Version identifiers: `m<yymmdd>_<hhmmss>_<name>`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Extension of SQL script migrations
pub const SCRIPT_EXTENSION: &str = "sql";

/// Extension of code migrations compiled into the binary
pub const CODE_EXTENSION: &str = "rs";

const VERSION_PREFIX_FORMAT: &str = "m%y%m%d_%H%M%S";

static VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^m(\d{6})_?(\d{6})_([\w\\]+)$").expect("valid version regex"));

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w\\]+$").expect("valid name regex"));

/// Parse an identifier into its comparable key (date and time digits as one integer).
pub fn parse_version(identifier: &str) -> EngineResult<u64> {
    let captures = VERSION_REGEX
        .captures(identifier)
        .ok_or_else(|| invalid(identifier))?;

    let digits = format!("{}{}", &captures[1], &captures[2]);
    digits.parse::<u64>().map_err(|_| invalid(identifier))
}

/// Whether `identifier` is a syntactically valid version
pub fn is_valid_version(identifier: &str) -> bool {
    VERSION_REGEX.is_match(identifier)
}

/// Derive the identifier from a `{identifier}.{ext}` migration file name.
pub fn version_from_filename(path: &Path) -> EngineResult<String> {
    let extension = path.extension().and_then(|ext| ext.to_str());
    if !matches!(extension, Some(SCRIPT_EXTENSION) | Some(CODE_EXTENSION)) {
        return Err(EngineError::UnsupportedExtension {
            path: path.to_path_buf(),
        });
    }

    let base = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| EngineError::MalformedFilename {
            path: path.to_path_buf(),
        })?;

    match base.split('.').collect::<Vec<_>>().as_slice() {
        [identifier, _] if !identifier.is_empty() => Ok((*identifier).to_string()),
        _ => Err(EngineError::MalformedFilename {
            path: path.to_path_buf(),
        }),
    }
}

/// File name for an identifier with the given extension
pub fn filename_for(identifier: &str, extension: &str) -> String {
    format!("{}.{}", identifier, extension)
}

/// Build a new identifier stamped with `timestamp`.
pub fn build_version(timestamp: DateTime<Utc>, name: &str) -> EngineResult<String> {
    if !NAME_REGEX.is_match(name) {
        return Err(EngineError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(format!("{}_{}", timestamp.format(VERSION_PREFIX_FORMAT), name))
}

/// Inclusive range membership over comparable keys.
///
/// `low == high == 0` selects everything. When `high < low` the bounds are swapped,
/// so the same call serves upward and downward selections.
pub fn in_range(key: u64, low: u64, high: u64) -> bool {
    if low == 0 && high == 0 {
        return true;
    }
    if high >= low {
        low <= key && key <= high
    } else {
        high <= key && key <= low
    }
}

fn invalid(identifier: &str) -> EngineError {
    EngineError::InvalidVersionFormat {
        version: identifier.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("m210131_171852_add_user_table").unwrap(),
            210131171852
        );
        assert_eq!(parse_version("m210131171852_compact").unwrap(), 210131171852);
        assert_eq!(parse_version("m000000_000000_base").unwrap(), 0);
    }

    #[test]
    fn test_parse_version_rejects_bad_shapes() {
        for bad in [
            "",
            "210131_171852_name",
            "m2101_171852_name",
            "m210131_171852",
            "m210131_171852_",
            "m210131_171852_bad-name",
            "x210131_171852_name",
        ] {
            assert!(
                matches!(parse_version(bad), Err(EngineError::InvalidVersionFormat { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_keys_follow_timestamp_order() {
        let earlier = parse_version("m201231_235959_zzz").unwrap();
        let later = parse_version("m210101_000000_aaa").unwrap();
        assert!(earlier < later);

        // Same timestamp, different names: distinct identifiers, equal keys.
        assert_eq!(
            parse_version("m210101_000000_a").unwrap(),
            parse_version("m210101_000000_b").unwrap()
        );
    }

    #[test]
    fn test_version_from_filename() {
        let path = PathBuf::from("/migrations/m210131_171852_add_user_table.sql");
        assert_eq!(
            version_from_filename(&path).unwrap(),
            "m210131_171852_add_user_table"
        );

        let path = PathBuf::from("m210131_171852_add_user_table.rs");
        assert_eq!(
            version_from_filename(&path).unwrap(),
            "m210131_171852_add_user_table"
        );
    }

    #[test]
    fn test_version_from_filename_errors() {
        assert!(matches!(
            version_from_filename(Path::new("m210131_171852_a.txt")),
            Err(EngineError::UnsupportedExtension { .. })
        ));
        assert!(matches!(
            version_from_filename(Path::new("m210131_171852_a")),
            Err(EngineError::UnsupportedExtension { .. })
        ));
        assert!(matches!(
            version_from_filename(Path::new("m210131_171852_a.up.sql")),
            Err(EngineError::MalformedFilename { .. })
        ));
    }

    #[test]
    fn test_filename_builder_recovers_identifier() {
        let identifier = "m210205_143505_zulul_kek";
        for ext in [SCRIPT_EXTENSION, CODE_EXTENSION] {
            let name = filename_for(identifier, ext);
            assert_eq!(version_from_filename(Path::new(&name)).unwrap(), identifier);
        }
    }

    #[test]
    fn test_build_version() {
        let timestamp = Utc.with_ymd_and_hms(2021, 2, 5, 16, 55, 28).unwrap();
        let version = build_version(timestamp, "lolkek").unwrap();
        assert_eq!(version, "m210205_165528_lolkek");
        assert_eq!(parse_version(&version).unwrap(), 210205165528);

        assert!(matches!(
            build_version(timestamp, "has space"),
            Err(EngineError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_in_range() {
        assert!(in_range(5, 0, 0));
        assert!(in_range(5, 5, 5));
        assert!(!in_range(4, 5, 5));

        assert!(in_range(5, 3, 7));
        assert!(!in_range(8, 3, 7));

        // Reversed bounds describe the same closed interval.
        assert!(in_range(5, 7, 3));
        assert!(in_range(3, 7, 3));
        assert!(!in_range(2, 7, 3));
    }
}
