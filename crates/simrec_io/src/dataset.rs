//! Per-entity time-series dataset files.
//!
//! One file per entity holds one fixed-length series per recorded variable
//! plus the run metadata. A resumed run extends every series by its own
//! window; earlier samples are kept in place.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Header (integrity frame)                                 │
//! │  - Magic "SRDS", version u16, CRC32 u32, length u64       │
//! │  - bincode payload: attrs, total_steps, chunk_len,        │
//! │    variable names                                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Data region (little-endian)                              │
//! │  - per variable, in declaration order:                    │
//! │    total_steps × f64, preallocated (zero) at creation     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `chunk_len` is the block size the writer stages in memory; every write
//! lands on a chunk boundary of the current window and covers at most one
//! chunk.

use crate::codec;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Magic bytes opening every dataset file.
pub const DATASET_MAGIC: [u8; 4] = *b"SRDS";

/// Current dataset format version.
pub const DATASET_VERSION: u16 = 2;

/// File extension of dataset files.
pub const DATASET_EXTENSION: &str = "tsd";

const SAMPLE_BYTES: u64 = std::mem::size_of::<f64>() as u64;

/// Errors from dataset creation, writes and reads.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Underlying file operation failed.
    #[error("Dataset I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// File contents do not follow the dataset layout.
    #[error("Malformed dataset {path}: {message}")]
    Format {
        /// File involved
        path: PathBuf,
        /// What was wrong
        message: String,
    },

    /// Existing dataset cannot be extended with the requested layout.
    #[error("Cannot extend dataset {path}: {message}")]
    Incompatible {
        /// File involved
        path: PathBuf,
        /// What differs
        message: String,
    },

    /// Variable list cannot be stored (empty or duplicate name).
    #[error("Invalid variable '{name}': {message}")]
    InvalidVariable {
        /// Offending name
        name: String,
        /// Why it was rejected
        message: String,
    },

    /// Variable not present in the dataset.
    #[error("Variable '{name}' not found in dataset {path}")]
    UnknownVariable {
        /// Requested name
        name: String,
        /// File involved
        path: PathBuf,
    },

    /// Write would fall outside `[0, total_steps)`.
    #[error("Write of {len} samples at step {start} exceeds dataset length {total_steps}")]
    OutOfBounds {
        /// First step of the write
        start: usize,
        /// Number of samples
        len: usize,
        /// Fixed dataset length
        total_steps: usize,
    },
}

/// Result type for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run metadata stored with every dataset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetAttrs {
    /// Time step.
    pub dt: f64,
    /// Simulated start time.
    pub tstart: f64,
    /// Simulated stop time.
    pub tstop: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetHeader {
    attrs: DatasetAttrs,
    total_steps: u64,
    chunk_len: u64,
    variables: Vec<String>,
}

fn validate_variables(variables: &[String]) -> DatasetResult<()> {
    for (i, name) in variables.iter().enumerate() {
        if name.is_empty() {
            return Err(DatasetError::InvalidVariable {
                name: name.clone(),
                message: "name is empty".to_string(),
            });
        }
        if variables[..i].contains(name) {
            return Err(DatasetError::InvalidVariable {
                name: name.clone(),
                message: "declared twice".to_string(),
            });
        }
    }
    Ok(())
}

/// Byte length of the data region, `None` on overflow.
fn data_len(n_vars: usize, total_steps: usize) -> Option<u64> {
    (n_vars as u64)
        .checked_mul(total_steps as u64)?
        .checked_mul(SAMPLE_BYTES)
}

// =============================================================================
// Writer
// =============================================================================

/// Open, writable dataset for one entity.
///
/// The handle stays open for the lifetime of the writer and is released on
/// drop, so every exit path closes the file. Call [`sync`](Self::sync) to
/// make writes durable before dropping.
#[derive(Debug)]
pub struct DatasetWriter {
    path: PathBuf,
    file: File,
    data_offset: u64,
    total_steps: usize,
    chunk_len: usize,
    window_start: usize,
    variables: Vec<String>,
}

impl DatasetWriter {
    /// Creates (or truncates) the dataset at `path`.
    ///
    /// The data region is sized to exactly `total_steps` samples per
    /// variable and zero-filled.
    ///
    /// # Errors
    ///
    /// - [`DatasetError::InvalidVariable`] for empty or duplicate names
    /// - [`DatasetError::Io`] if the file cannot be created or sized
    pub fn create(
        path: impl Into<PathBuf>,
        attrs: DatasetAttrs,
        variables: &[String],
        total_steps: usize,
        chunk_len: usize,
    ) -> DatasetResult<Self> {
        let path = path.into();
        validate_variables(variables)?;
        let malformed = |message: String| DatasetError::Format {
            path: path.clone(),
            message,
        };

        let header = DatasetHeader {
            attrs,
            total_steps: total_steps as u64,
            chunk_len: chunk_len as u64,
            variables: variables.to_vec(),
        };
        let header = codec::encode(DATASET_MAGIC, DATASET_VERSION, &header)
            .map_err(|err| malformed(err.to_string()))?;
        let data_len = data_len(variables.len(), total_steps)
            .ok_or_else(|| malformed(format!("{total_steps} steps overflow the data region")))?;

        let mut file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.write_all(&header).map_err(io_error(&path))?;

        let data_offset = header.len() as u64;
        file.set_len(data_offset + data_len)
            .map_err(io_error(&path))?;
        debug!(path = %path.display(), total_steps, variables = variables.len(), "Dataset created");

        Ok(Self {
            path,
            file,
            data_offset,
            total_steps,
            chunk_len,
            window_start: 0,
            variables: variables.to_vec(),
        })
    }

    /// Grows the existing dataset at `path` by `window_steps` samples per
    /// variable and opens it for writing the new window.
    ///
    /// The stored series are copied to the front of the grown series and
    /// the new tail is zero-filled; [`window_start`](Self::window_start)
    /// is the old length. `tstart` keeps its stored value while `tstop`
    /// becomes `attrs.tstop`. The grown file is staged next to the old one
    /// and renamed over it, so a failure leaves the stored samples intact.
    ///
    /// # Errors
    ///
    /// - [`DatasetError::Incompatible`] if the variables or `dt` differ
    /// - [`DatasetError::Format`] if the existing file is malformed
    /// - [`DatasetError::Io`] on any file failure
    pub fn extend(
        path: impl Into<PathBuf>,
        attrs: DatasetAttrs,
        variables: &[String],
        window_steps: usize,
        chunk_len: usize,
    ) -> DatasetResult<Self> {
        let path = path.into();
        let existing = DatasetReader::open(&path)?;
        let incompatible = |message: String| DatasetError::Incompatible {
            path: path.clone(),
            message,
        };

        if existing.variables() != variables {
            return Err(incompatible(format!(
                "stored variables {:?}, requested {:?}",
                existing.variables(),
                variables
            )));
        }
        let stored = existing.attrs();
        if stored.dt != attrs.dt {
            return Err(incompatible(format!(
                "stored dt {}, requested {}",
                stored.dt, attrs.dt
            )));
        }
        let window_start = existing.total_steps();
        let total_steps = window_start
            .checked_add(window_steps)
            .ok_or_else(|| incompatible(format!("{window_steps} more steps overflow")))?;

        let grown = DatasetAttrs {
            tstart: stored.tstart,
            ..attrs
        };
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let mut staged = Self::create(&staging, grown, variables, total_steps, chunk_len)?;
        for (index, name) in variables.iter().enumerate() {
            staged.write_series(index, 0, &existing.read(name)?)?;
        }
        staged.sync()?;
        let data_offset = staged.data_offset;
        drop(staged);

        fs::rename(&staging, &path).map_err(io_error(&path))?;
        let file = File::options()
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        info!(
            path = %path.display(),
            window_start,
            total_steps,
            "Dataset extended"
        );

        Ok(Self {
            path,
            file,
            data_offset,
            total_steps,
            chunk_len,
            window_start,
            variables: variables.to_vec(),
        })
    }

    /// Path of the dataset file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fixed series length.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// First step of the window this writer was opened for: zero for a new
    /// dataset, the previous length for an extended one.
    pub fn window_start(&self) -> usize {
        self.window_start
    }

    /// Chunk length declared in the header.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Variables in declaration order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Writes `samples` into variable `variable` (declaration index) at
    /// steps `[start, start + samples.len())`.
    ///
    /// # Errors
    ///
    /// - [`DatasetError::OutOfBounds`] if the range exceeds the dataset length
    /// - [`DatasetError::UnknownVariable`] for an index past the variable list
    /// - [`DatasetError::Io`] on write failure
    pub fn write_series(
        &mut self,
        variable: usize,
        start: usize,
        samples: &[f64],
    ) -> DatasetResult<()> {
        let end = start.checked_add(samples.len());
        if end.map_or(true, |end| end > self.total_steps) {
            return Err(DatasetError::OutOfBounds {
                start,
                len: samples.len(),
                total_steps: self.total_steps,
            });
        }
        if variable >= self.variables.len() {
            return Err(DatasetError::UnknownVariable {
                name: format!("#{}", variable),
                path: self.path.clone(),
            });
        }
        if samples.is_empty() {
            return Ok(());
        }

        let series_offset = variable as u64 * self.total_steps as u64 * SAMPLE_BYTES;
        let offset = self.data_offset + series_offset + start as u64 * SAMPLE_BYTES;

        let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_BYTES as usize);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_error(&self.path))?;
        self.file.write_all(&bytes).map_err(io_error(&self.path))
    }

    /// Flushes file contents and metadata to storage.
    pub fn sync(&self) -> DatasetResult<()> {
        self.file.sync_all().map_err(io_error(&self.path))
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Read-only view of a complete dataset file.
///
/// # Examples
///
/// ```rust,ignore
/// let reader = DatasetReader::open("output/cellvars/7.tsd")?;
/// assert_eq!(reader.attrs().dt, 0.1);
/// let voltage = reader.read("v")?;
/// assert_eq!(voltage.len(), reader.total_steps());
/// ```
#[derive(Debug, Clone)]
pub struct DatasetReader {
    path: PathBuf,
    attrs: DatasetAttrs,
    total_steps: usize,
    chunk_len: usize,
    variables: Vec<String>,
    data: Vec<u8>,
}

impl DatasetReader {
    /// Reads and validates the dataset at `path`.
    ///
    /// # Errors
    ///
    /// - [`DatasetError::Format`] if the header frame fails its checks or
    ///   the data region does not match the declared shape
    /// - [`DatasetError::Io`] if the file cannot be read
    pub fn open(path: impl AsRef<Path>) -> DatasetResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        let malformed = |message: String| DatasetError::Format {
            path: path.clone(),
            message,
        };

        let (header, region): (DatasetHeader, _) =
            codec::decode(DATASET_MAGIC, DATASET_VERSION, &bytes)
                .map_err(|err| malformed(err.to_string()))?;

        let total_steps = usize::try_from(header.total_steps)
            .map_err(|_| malformed(format!("total_steps {} overflows", header.total_steps)))?;
        let chunk_len = usize::try_from(header.chunk_len)
            .map_err(|_| malformed(format!("chunk_len {} overflows", header.chunk_len)))?;
        let expected = data_len(header.variables.len(), total_steps).ok_or_else(|| {
            malformed(format!(
                "{} variables of {} steps overflow the data region",
                header.variables.len(),
                total_steps
            ))
        })?;
        if region.len() as u64 != expected {
            return Err(malformed(format!(
                "data region is {} bytes, expected {}",
                region.len(),
                expected
            )));
        }

        Ok(Self {
            path,
            attrs: header.attrs,
            total_steps,
            chunk_len,
            variables: header.variables,
            data: region.to_vec(),
        })
    }

    /// Run metadata.
    pub fn attrs(&self) -> DatasetAttrs {
        self.attrs
    }

    /// Fixed series length.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Chunk length the series were written with.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Variables in declaration order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Full series of `name`.
    pub fn read(&self, name: &str) -> DatasetResult<Vec<f64>> {
        let index = self
            .variables
            .iter()
            .position(|v| v == name)
            .ok_or_else(|| DatasetError::UnknownVariable {
                name: name.to_string(),
                path: self.path.clone(),
            })?;

        let width = SAMPLE_BYTES as usize;
        let start = index * self.total_steps * width;
        let series = &self.data[start..start + self.total_steps * width];

        Ok(series
            .chunks_exact(width)
            .map(|raw| {
                let mut word = [0u8; 8];
                word.copy_from_slice(raw);
                f64::from_le_bytes(word)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn attrs() -> DatasetAttrs {
        DatasetAttrs {
            dt: 0.1,
            tstart: 0.0,
            tstop: 1.0,
        }
    }

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_preallocates_zeroed_series() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.tsd");
        let writer = DatasetWriter::create(&path, attrs(), &vars(&["v", "cai"]), 10, 4).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.total_steps(), 10);
        assert_eq!(reader.chunk_len(), 4);
        assert_eq!(reader.variables(), &["v".to_string(), "cai".to_string()]);
        assert_relative_eq!(reader.attrs().dt, 0.1);
        assert_relative_eq!(reader.attrs().tstop, 1.0);
        assert_eq!(reader.read("v").unwrap(), vec![0.0; 10]);
        assert_eq!(reader.read("cai").unwrap(), vec![0.0; 10]);
    }

    #[test]
    fn test_writes_land_in_the_right_series_and_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2.tsd");
        let mut writer =
            DatasetWriter::create(&path, attrs(), &vars(&["v", "cai"]), 6, 3).unwrap();

        writer.write_series(1, 3, &[7.0, 8.0, 9.0]).unwrap();
        writer.write_series(0, 0, &[1.0, 2.0, 3.0]).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.read("v").unwrap(), vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(reader.read("cai").unwrap(), vec![0.0, 0.0, 0.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer =
            DatasetWriter::create(dir.path().join("3.tsd"), attrs(), &vars(&["v"]), 5, 5)
                .unwrap();
        let result = writer.write_series(0, 3, &[1.0, 2.0, 3.0]);
        assert!(matches!(
            result,
            Err(DatasetError::OutOfBounds {
                start: 3,
                len: 3,
                total_steps: 5
            })
        ));
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let dir = tempdir().unwrap();
        let result =
            DatasetWriter::create(dir.path().join("4.tsd"), attrs(), &vars(&["v", "v"]), 5, 5);
        assert!(matches!(result, Err(DatasetError::InvalidVariable { .. })));
    }

    #[test]
    fn test_create_in_missing_directory_is_io_error() {
        let dir = tempdir().unwrap();
        let result = DatasetWriter::create(
            dir.path().join("missing").join("5.tsd"),
            attrs(),
            &vars(&["v"]),
            5,
            5,
        );
        assert!(matches!(result, Err(DatasetError::Io { .. })));
    }

    #[test]
    fn test_reader_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.tsd");
        fs::write(&path, b"not a dataset").unwrap();
        assert!(matches!(
            DatasetReader::open(&path),
            Err(DatasetError::Format { .. })
        ));
    }

    #[test]
    fn test_overflowing_shape_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.tsd");
        let header = DatasetHeader {
            attrs: attrs(),
            total_steps: u64::MAX / 2,
            chunk_len: 4,
            variables: vars(&["v", "cai", "ik"]),
        };
        fs::write(
            &path,
            codec::encode(DATASET_MAGIC, DATASET_VERSION, &header).unwrap(),
        )
        .unwrap();

        match DatasetReader::open(&path) {
            Err(DatasetError::Format { message, .. }) => assert!(message.contains("overflow")),
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_header_fails_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7.tsd");
        DatasetWriter::create(&path, attrs(), &vars(&["v"]), 3, 3).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        // First byte of the bincode payload.
        bytes[codec::FRAME_HEADER_SIZE] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        match DatasetReader::open(&path) {
            Err(DatasetError::Format { message, .. }) => assert!(message.contains("checksum")),
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn test_extend_keeps_stored_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("8.tsd");
        let mut head = DatasetWriter::create(&path, attrs(), &vars(&["v", "cai"]), 3, 3).unwrap();
        head.write_series(0, 0, &[1.0, 2.0, 3.0]).unwrap();
        head.write_series(1, 0, &[-1.0, -2.0, -3.0]).unwrap();
        head.sync().unwrap();
        drop(head);

        let window = DatasetAttrs {
            dt: 0.1,
            tstart: 1.0,
            tstop: 1.2,
        };
        let mut tail = DatasetWriter::extend(&path, window, &vars(&["v", "cai"]), 2, 2).unwrap();
        assert_eq!(tail.window_start(), 3);
        assert_eq!(tail.total_steps(), 5);
        tail.write_series(0, 3, &[4.0, 5.0]).unwrap();
        tail.sync().unwrap();
        drop(tail);

        let reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.read("v").unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(reader.read("cai").unwrap(), vec![-1.0, -2.0, -3.0, 0.0, 0.0]);
        assert_relative_eq!(reader.attrs().tstart, 0.0);
        assert_relative_eq!(reader.attrs().tstop, 1.2);
        assert!(!dir.path().join("8.tsd.tmp").exists());
    }

    #[test]
    fn test_extend_rejects_other_variables_and_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("9.tsd");
        let mut head = DatasetWriter::create(&path, attrs(), &vars(&["v"]), 2, 2).unwrap();
        head.write_series(0, 0, &[7.0, 8.0]).unwrap();
        drop(head);

        assert!(matches!(
            DatasetWriter::extend(&path, attrs(), &vars(&["v", "cai"]), 2, 2),
            Err(DatasetError::Incompatible { .. })
        ));
        let other_dt = DatasetAttrs { dt: 0.05, ..attrs() };
        assert!(matches!(
            DatasetWriter::extend(&path, other_dt, &vars(&["v"]), 2, 2),
            Err(DatasetError::Incompatible { .. })
        ));
        assert_eq!(DatasetReader::open(&path).unwrap().read("v").unwrap(), vec![7.0, 8.0]);
    }

    #[test]
    fn test_reader_unknown_variable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("6.tsd");
        DatasetWriter::create(&path, attrs(), &vars(&["v"]), 2, 2).unwrap();
        let reader = DatasetReader::open(&path).unwrap();
        assert!(matches!(
            reader.read("ik"),
            Err(DatasetError::UnknownVariable { .. })
        ));
    }
}
