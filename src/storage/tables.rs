use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Owner index: owner_id -> msgpack Vec of file UUIDs
pub const OWNER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("owner_files");

/// Instance records: uuid -> FileInstance (msgpack)
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Instance index: file_id -> msgpack Vec of instance UUIDs
pub const FILE_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("file_instances");

/// Replicas: instance_id -> msgpack Vec<FileLocation>
pub const LOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");

/// Buckets: bucket_id -> Bucket (msgpack)
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");

/// Dimensions: "<file_type>/<name>" -> Dimension (msgpack)
pub const DIMENSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("dimensions");

/// Runtime settings: key -> msgpack value
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
