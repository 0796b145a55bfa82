use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{Bucket, Dimension, MediaKind, StorageSettings};
use super::tables::*;
use crate::config::{ConfigError, ConfigProvider};

const STORAGE_SETTINGS_KEY: &str = "storage";

fn dimension_key(dimension: &Dimension) -> String {
    format!("{}/{}", dimension.file_type.as_str(), dimension.name)
}

impl Database {
    // ========================================================================
    // Settings
    // ========================================================================

    /// Stored settings, or `None` before the store has been seeded
    pub fn get_settings(&self) -> Result<Option<StorageSettings>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SETTINGS)?;

        match table.get(STORAGE_SETTINGS_KEY)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_settings(&self, settings: &StorageSettings) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            let data = rmp_serde::to_vec_named(settings)?;
            table.insert(STORAGE_SETTINGS_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ========================================================================
    // Buckets
    // ========================================================================

    pub fn list_buckets(&self) -> Result<Vec<Bucket>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(BUCKETS)?;

        let mut buckets = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            buckets.push(rmp_serde::from_slice::<Bucket>(value.value())?);
        }
        Ok(buckets)
    }

    pub fn put_bucket(&self, bucket: &Bucket) -> Result<(), DatabaseError> {
        debug_assert!(!bucket.id.is_empty(), "bucket id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(BUCKETS)?;
            let data = rmp_serde::to_vec_named(bucket)?;
            table.insert(bucket.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete_bucket(&self, id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(BUCKETS)?;
            let removed = table.remove(id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Add `bytes` to a bucket's usage counter. Unknown buckets are ignored.
    pub fn add_bucket_usage(&self, id: &str, bytes: u64) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(BUCKETS)?;
            let existing: Option<Bucket> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            if let Some(mut bucket) = existing {
                bucket.used_bytes = bucket.used_bytes.saturating_add(bytes);
                let data = rmp_serde::to_vec_named(&bucket)?;
                table.insert(id, data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ========================================================================
    // Dimensions
    // ========================================================================

    pub fn list_dimensions(&self) -> Result<Vec<Dimension>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DIMENSIONS)?;

        let mut dimensions = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            dimensions.push(rmp_serde::from_slice::<Dimension>(value.value())?);
        }
        Ok(dimensions)
    }

    pub fn put_dimension(&self, dimension: &Dimension) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(DIMENSIONS)?;
            let data = rmp_serde::to_vec_named(dimension)?;
            table.insert(dimension_key(dimension).as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace the whole dimension table.
    pub fn replace_dimensions(&self, dimensions: &[Dimension]) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let table = write_txn.open_table(DIMENSIONS)?;
            let keys: Vec<String> = table
                .iter()?
                .map(|r| r.map(|(k, _)| k.value().to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            drop(table);

            let mut table = write_txn.open_table(DIMENSIONS)?;
            for key in keys {
                table.remove(key.as_str())?;
            }
            for dimension in dimensions {
                let data = rmp_serde::to_vec_named(dimension)?;
                table.insert(dimension_key(dimension).as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write bootstrap configuration, leaving anything already stored untouched.
    pub fn seed_config(
        &self,
        settings: &StorageSettings,
        buckets: &[Bucket],
        dimensions: &[Dimension],
    ) -> Result<(), DatabaseError> {
        if self.get_settings()?.is_none() {
            self.put_settings(settings)?;
        }
        if self.list_buckets()?.is_empty() {
            for bucket in buckets {
                self.put_bucket(bucket)?;
            }
        }
        if self.list_dimensions()?.is_empty() {
            self.replace_dimensions(dimensions)?;
        }
        Ok(())
    }
}

impl ConfigProvider for Database {
    fn settings(&self) -> Result<StorageSettings, ConfigError> {
        Ok(self.get_settings()?.unwrap_or_default())
    }

    fn buckets(&self) -> Result<Vec<Bucket>, ConfigError> {
        Ok(self.list_buckets()?)
    }

    fn dimensions(&self, file_type: MediaKind) -> Result<Vec<Dimension>, ConfigError> {
        Ok(self
            .list_dimensions()?
            .into_iter()
            .filter(|d| d.file_type == file_type)
            .collect())
    }

    fn record_usage(&self, bucket_id: &str, bytes: u64) -> Result<(), ConfigError> {
        Ok(self.add_bucket_usage(bucket_id, bytes)?)
    }
}
