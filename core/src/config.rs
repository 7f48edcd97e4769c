//! Classification settings.

use crate::error::{KnnError, Result};
use crate::shard::ShardOptions;
use serde::Deserialize;
use shardknn_kernels::Metric;
use std::path::Path;
use std::time::Duration;

/// Settings for one classification call.
///
/// Every field has a default, so a configuration file only needs the values it changes:
///
/// ```rust
/// use shardknn::config::ClassifyConfig;
///
/// let config = ClassifyConfig::from_toml_str("k = 3\nbatch_size = 128").unwrap();
/// assert_eq!(config.k, 3);
/// assert_eq!(config.index_tile_rows, ClassifyConfig::default().index_tile_rows);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifyConfig {
    /// Number of neighbors that vote.
    pub k: usize,
    /// Query rows searched per round.
    pub batch_size: usize,
    pub metric: Metric,
    /// Index rows whose distances are resident at once, per query batch.
    pub index_tile_rows: usize,
    /// Convert buffers of another dtype instead of failing.
    pub convert_dtype: bool,
    /// Check caller layout flags against the buffers' actual layouts.
    pub validate_layout: bool,
    /// How long a rank waits on a peer in one round; `0` waits forever.
    pub round_timeout_ms: u64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            k: 5,
            batch_size: 1024,
            metric: Metric::Euclidean,
            index_tile_rows: 4096,
            convert_dtype: false,
            validate_layout: true,
            round_timeout_ms: 60_000,
        }
    }
}

impl ClassifyConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_index_tile_rows(mut self, rows: usize) -> Self {
        self.index_tile_rows = rows;
        self
    }

    pub fn with_convert_dtype(mut self, convert: bool) -> Self {
        self.convert_dtype = convert;
        self
    }

    pub fn with_validate_layout(mut self, validate: bool) -> Self {
        self.validate_layout = validate;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Option<Duration>) -> Self {
        // Sub-millisecond limits round up, so that `Some` never turns into "no limit".
        self.round_timeout_ms = timeout.map_or(0, |t| {
            u64::try_from(t.as_millis())
                .unwrap_or(u64::MAX)
                .max(1)
        });
        self
    }

    /// Per-round timeout, `None` meaning no limit.
    pub fn round_timeout(&self) -> Option<Duration> {
        (self.round_timeout_ms > 0).then(|| Duration::from_millis(self.round_timeout_ms))
    }

    pub fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            convert_dtype: self.convert_dtype,
            validate_layout: self.validate_layout,
        }
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KnnError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks the values that are invalid regardless of the data.
    ///
    /// `k` against the index size is only known at classification time.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(KnnError::InvalidK {
                k: 0,
                total_rows: 0,
            });
        }
        if self.batch_size == 0 {
            return Err(KnnError::InvalidBatchSize(self.batch_size));
        }
        if self.index_tile_rows == 0 {
            return Err(KnnError::Config("index_tile_rows must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClassifyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.round_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.shard_options(), ShardOptions::default());
    }

    #[test]
    fn test_from_toml() {
        let config = ClassifyConfig::from_toml_str(
            r#"
            k = 7
            metric = "cosine"
            convert_dtype = true
            round_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.k, 7);
        assert_eq!(config.metric, Metric::Cosine);
        assert!(config.convert_dtype);
        assert_eq!(config.round_timeout(), None);
        assert_eq!(config.batch_size, 1024);
    }

    #[test]
    fn test_from_toml_rejects_bad_input() {
        assert!(matches!(
            ClassifyConfig::from_toml_str("neighbours = 3"),
            Err(KnnError::Config(_))
        ));
        assert!(matches!(
            ClassifyConfig::from_toml_str("batch_size = 0"),
            Err(KnnError::InvalidBatchSize(0))
        ));
        assert!(matches!(
            ClassifyConfig::from_toml_str("k = 0"),
            Err(KnnError::InvalidK { .. })
        ));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "k = 2\nindex_tile_rows = 16").unwrap();
        let config = ClassifyConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.k, 2);
        assert_eq!(config.index_tile_rows, 16);

        let missing = ClassifyConfig::from_toml_file("/nonexistent/shardknn.toml");
        assert!(matches!(missing, Err(KnnError::Config(_))));
    }

    #[test]
    fn test_builders() {
        let config = ClassifyConfig::default()
            .with_k(3)
            .with_batch_size(2)
            .with_metric(Metric::Manhattan)
            .with_index_tile_rows(8)
            .with_convert_dtype(true)
            .with_validate_layout(false)
            .with_round_timeout(None);
        assert_eq!(config.k, 3);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.metric, Metric::Manhattan);
        assert!(!config.shard_options().validate_layout);
        assert_eq!(config.round_timeout_ms, 0);
    }

    #[test]
    fn test_round_timeout_conversion() {
        let config = ClassifyConfig::default().with_round_timeout(Some(Duration::from_millis(50)));
        assert_eq!(config.round_timeout(), Some(Duration::from_millis(50)));

        let config = ClassifyConfig::default().with_round_timeout(Some(Duration::from_micros(10)));
        assert_eq!(config.round_timeout(), Some(Duration::from_millis(1)));

        let config = ClassifyConfig::default().with_round_timeout(Some(Duration::MAX));
        assert_eq!(config.round_timeout_ms, u64::MAX);
    }
}
