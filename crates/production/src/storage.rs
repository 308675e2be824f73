//! # RocksDB Storage
//!
//! Durable [`Dber`] for validator processes.
//!
//! All operations are synchronous blocking I/O. Consensus records are small
//! and written once per sequence, so the runner writes them inline.

use crate::metrics;
use pbft_core::{prefixed, Dber, StorageError};
use rocksdb::{Options, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// RocksDB-backed key-value store.
///
/// Keys are stored with the `pbft_` prefix, so the database can be shared
/// with application data.
pub struct RocksDbStorage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl RocksDbStorage {
    /// Open or create a database at `path` with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        opts.set_max_background_jobs(config.max_background_jobs);
        if config.bytes_per_sync > 0 {
            opts.set_bytes_per_sync(config.bytes_per_sync as u64);
        }
        opts.set_keep_log_file_num(config.keep_log_file_num);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path).map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }
}

impl Dber for RocksDbStorage {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db
            .put_opt(prefixed(key), value, &write_opts)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        metrics::record_storage_write(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn restore(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.db
            .get(prefixed(key))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// Compression algorithm for stored records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Snappy,
    Zlib,
    #[default]
    Lz4,
    Lz4hc,
    Zstd,
}

impl CompressionType {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Zlib => rocksdb::DBCompressionType::Zlib,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Lz4hc => rocksdb::DBCompressionType::Lz4hc,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of background jobs
    pub max_background_jobs: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Block cache size in bytes (None to disable)
    pub block_cache_size: Option<usize>,
    /// Compression type
    pub compression: CompressionType,
    /// Bloom filter bits per key (0 to disable)
    pub bloom_filter_bits: f64,
    /// Bytes per sync (0 to disable)
    pub bytes_per_sync: usize,
    /// Number of log files to keep
    pub keep_log_file_num: usize,
    /// fsync every write before returning
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 2,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            block_cache_size: Some(32 * 1024 * 1024), // 32MB
            compression: CompressionType::Lz4,
            bloom_filter_bits: 10.0,
            bytes_per_sync: 1024 * 1024, // 1MB
            keep_log_file_num: 10,
            sync_writes: true,
        }
    }
}
