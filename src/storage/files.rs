use redb::{ReadableTable, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::db::{Database, DatabaseError};
use super::models::{
    FileInstance, FileLocation, FileRecord, LocationStatus, MediaKind, ProcessingStatus,
};
use super::tables::*;

type BlobTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Measured properties of a finished rendition.
#[derive(Debug, Clone)]
pub struct RenditionOutput {
    pub mime_type: String,
    pub extension: String,
    pub checksum: String,
    pub byte_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

fn load_list<T: DeserializeOwned>(table: &BlobTable<'_>, key: &str) -> Result<Vec<T>, DatabaseError> {
    match table.get(key)? {
        Some(data) => Ok(rmp_serde::from_slice(data.value())?),
        None => Ok(Vec::new()),
    }
}

fn store_list<T: Serialize>(
    table: &mut BlobTable<'_>,
    key: &str,
    items: &[T],
) -> Result<(), DatabaseError> {
    if items.is_empty() {
        table.remove(key)?;
    } else {
        let data = rmp_serde::to_vec_named(items)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}

fn push_id(table: &mut BlobTable<'_>, key: &str, id: &str) -> Result<(), DatabaseError> {
    let mut ids: Vec<String> = load_list(table, key)?;
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
        store_list(table, key, &ids)?;
    }
    Ok(())
}

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Store a file record and update the owner index
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.id.as_str(), data.as_slice())?;

            if let Some(ref owner_id) = file.owner_id {
                let mut owner_table = write_txn.open_table(OWNER_FILES)?;
                push_id(&mut owner_table, owner_id, &file.id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its UUID, including soft-deleted ones
    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Soft-delete a file. Returns false when the file is unknown or already deleted.
    pub fn mark_file_deleted(&self, id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match existing {
                Some(mut file) if !file.is_deleted() => {
                    file.deleted_at = Some(chrono::Utc::now());
                    let data = rmp_serde::to_vec_named(&file)?;
                    table.insert(id, data.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Get all live files for an owner
    pub fn get_files_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let owner_table = read_txn.open_table(OWNER_FILES)?;
        let files_table = read_txn.open_table(FILES)?;

        let file_ids: Vec<String> = match owner_table.get(owner_id)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut files = Vec::new();
        for file_id in file_ids {
            if let Some(data) = files_table.get(file_id.as_str())? {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                if !file.is_deleted() {
                    files.push(file);
                }
            }
        }

        Ok(files)
    }

    /// List live files with optional type and owner filters, oldest first
    pub fn list_files(
        &self,
        file_type: Option<MediaKind>,
        owner_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let mut files = match owner_id {
            Some(owner) => self.get_files_by_owner(owner)?,
            None => {
                let read_txn = self.begin_read()?;
                let table = read_txn.open_table(FILES)?;
                let mut files = Vec::new();
                for result in table.iter()? {
                    let (_, value) = result?;
                    let file: FileRecord = rmp_serde::from_slice(value.value())?;
                    if !file.is_deleted() {
                        files.push(file);
                    }
                }
                files
            }
        };

        if let Some(kind) = file_type {
            files.retain(|f| f.file_type == kind);
        }
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    // ========================================================================
    // Instance operations
    // ========================================================================

    /// Insert a new instance row and index it under its file
    pub fn put_instance(&self, instance: &FileInstance) -> Result<(), DatabaseError> {
        debug_assert!(!instance.id.is_empty(), "instance id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(INSTANCES)?;
            let data = rmp_serde::to_vec_named(instance)?;
            table.insert(instance.id.as_str(), data.as_slice())?;

            let mut index = write_txn.open_table(FILE_INSTANCES)?;
            push_id(&mut index, &instance.file_id, &instance.id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All instances of a file, in creation order
    pub fn instances_for_file(&self, file_id: &str) -> Result<Vec<FileInstance>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(FILE_INSTANCES)?;
        let table = read_txn.open_table(INSTANCES)?;

        let ids: Vec<String> = match index.get(file_id)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(data) = table.get(id.as_str())? {
                instances.push(rmp_serde::from_slice::<FileInstance>(data.value())?);
            }
        }
        Ok(instances)
    }

    /// Resolve the instance serving `variant_name`: the newest completed row,
    /// falling back to the newest row of any status.
    pub fn find_instance(
        &self,
        file_id: &str,
        variant_name: &str,
    ) -> Result<Option<FileInstance>, DatabaseError> {
        let mut candidates: Vec<FileInstance> = self
            .instances_for_file(file_id)?
            .into_iter()
            .filter(|i| i.variant_name == variant_name)
            .collect();
        candidates.sort_by(|a, b| {
            let a_done = a.processing_status == ProcessingStatus::Completed;
            let b_done = b.processing_status == ProcessingStatus::Completed;
            a_done.cmp(&b_done).then(a.created_at.cmp(&b.created_at))
        });
        Ok(candidates.pop())
    }

    /// Move an instance along its processing state machine.
    pub fn set_instance_status(
        &self,
        id: &str,
        next: ProcessingStatus,
    ) -> Result<FileInstance, DatabaseError> {
        let write_txn = self.begin_write()?;
        let instance = {
            let mut table = write_txn.open_table(INSTANCES)?;
            let mut instance = read_instance(&table, id)?;
            if !instance.processing_status.can_transition_to(next) {
                return Err(DatabaseError::InvalidTransition {
                    from: instance.processing_status,
                    to: next,
                });
            }
            instance.processing_status = next;
            let data = rmp_serde::to_vec_named(&instance)?;
            table.insert(id, data.as_slice())?;
            instance
        };
        write_txn.commit()?;
        Ok(instance)
    }

    /// Record a finished rendition and its replicas in one transaction.
    /// The checksum is only written if none was recorded before.
    pub fn complete_instance(
        &self,
        id: &str,
        output: &RenditionOutput,
        locations: &[FileLocation],
    ) -> Result<FileInstance, DatabaseError> {
        let write_txn = self.begin_write()?;
        let instance = {
            let mut table = write_txn.open_table(INSTANCES)?;
            let mut instance = read_instance(&table, id)?;
            if !instance
                .processing_status
                .can_transition_to(ProcessingStatus::Completed)
            {
                return Err(DatabaseError::InvalidTransition {
                    from: instance.processing_status,
                    to: ProcessingStatus::Completed,
                });
            }
            if instance.checksum.is_none() {
                instance.checksum = Some(output.checksum.clone());
            }
            instance.mime_type = output.mime_type.clone();
            instance.extension = output.extension.clone();
            instance.byte_size = output.byte_size;
            instance.width = output.width;
            instance.height = output.height;
            instance.processing_status = ProcessingStatus::Completed;
            let data = rmp_serde::to_vec_named(&instance)?;
            table.insert(id, data.as_slice())?;

            let mut location_table = write_txn.open_table(LOCATIONS)?;
            let mut existing: Vec<FileLocation> = load_list(&location_table, id)?;
            existing.extend_from_slice(locations);
            store_list(&mut location_table, id, &existing)?;
            instance
        };
        write_txn.commit()?;
        Ok(instance)
    }

    // ========================================================================
    // Location operations
    // ========================================================================

    pub fn locations_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<FileLocation>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LOCATIONS)?;

        match table.get(instance_id)? {
            Some(data) => Ok(rmp_serde::from_slice(data.value())?),
            None => Ok(Vec::new()),
        }
    }

    /// Update the status of every replica of an instance held in `bucket_id`,
    /// or of all replicas when `bucket_id` is `None`. Returns the number changed.
    pub fn set_location_status(
        &self,
        instance_id: &str,
        bucket_id: Option<&str>,
        status: LocationStatus,
    ) -> Result<usize, DatabaseError> {
        let write_txn = self.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(LOCATIONS)?;
            let mut locations: Vec<FileLocation> = load_list(&table, instance_id)?;
            let mut changed = 0;
            for location in locations
                .iter_mut()
                .filter(|l| bucket_id.map_or(true, |b| l.bucket_id == b))
            {
                if location.status != status {
                    location.status = status;
                    location.last_verified_at = Some(chrono::Utc::now());
                    changed += 1;
                }
            }
            store_list(&mut table, instance_id, &locations)?;
            changed
        };
        write_txn.commit()?;
        Ok(changed)
    }
}

fn read_instance(table: &BlobTable<'_>, id: &str) -> Result<FileInstance, DatabaseError> {
    match table.get(id)? {
        Some(data) => Ok(rmp_serde::from_slice(data.value())?),
        None => Err(DatabaseError::MissingRecord(id.to_string())),
    }
}
