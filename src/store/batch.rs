use serde::{Deserialize, Serialize};

/// Fallback rows per statement when the row shape is unknown.
pub const DEFAULT_BULK_INSERT_BATCH_SIZE: usize = 3000;

/// SQLITE_MAX_VARIABLE_NUMBER: hard cap on bound parameters per statement.
pub const SQLITE_MAX_VARIABLES: usize = 32766;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DbConfig {
    pub path: String,
    /// Accepted for compatibility and echoed by --dump-config. Batch sizes
    /// always come from `safe_batch_size`.
    pub bulk_insert_batch_size: usize,
}

impl DbConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bulk_insert_batch_size: DEFAULT_BULK_INSERT_BATCH_SIZE,
        }
    }
}

/// Largest row count for one multi-row INSERT that keeps
/// `rows * fields_per_row <= SQLITE_MAX_VARIABLES`.
pub fn safe_batch_size(fields_per_row: i64) -> usize {
    if fields_per_row <= 0 {
        return DEFAULT_BULK_INSERT_BATCH_SIZE;
    }
    SQLITE_MAX_VARIABLES / fields_per_row as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_batch_size_examples() {
        let cases = [
            (0, DEFAULT_BULK_INSERT_BATCH_SIZE),
            (-1, DEFAULT_BULK_INSERT_BATCH_SIZE),
            (10, 3276), // stop_times
            (5, 6553),  // shapes
            (1, 32766),
        ];
        for (fields, expected) in cases {
            assert_eq!(safe_batch_size(fields), expected, "fields_per_row={fields}");
        }
    }

    #[test]
    fn test_safe_batch_size_never_exceeds_limit() {
        for fields in 1..=500i64 {
            let rows = safe_batch_size(fields);
            assert!(rows * fields as usize <= SQLITE_MAX_VARIABLES);
            assert_eq!(rows, SQLITE_MAX_VARIABLES / fields as usize);
        }
        // One more row must overflow for every shape the loader uses.
        for fields in [3i64, 5, 7, 8, 10] {
            assert!((safe_batch_size(fields) + 1) * fields as usize > SQLITE_MAX_VARIABLES);
        }
    }

    #[test]
    fn test_configured_batch_size_is_informational() {
        let mut config = DbConfig::new(":memory:");
        assert_eq!(config.bulk_insert_batch_size, DEFAULT_BULK_INSERT_BATCH_SIZE);
        config.bulk_insert_batch_size = 10;
        // The configured value never feeds into sizing.
        assert_eq!(safe_batch_size(10), 3276);
    }
}
