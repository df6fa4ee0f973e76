use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ticket_semaphore_core::{StoreError, Ticket, TicketStore, SCHEMA_VERSION};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Longest accepted semaphore name.
pub const MAX_NAME_LEN: usize = 64;

/// Longest directory name most filesystems accept.
const MAX_COMPONENT_LEN: usize = 255;

const TICKET_EXT: &str = "ticket";
const EMPTY_NAME_DIR: &str = "%";
const SCHEMA_FILE: &str = "schema.json";

/// Schema marker written by [`FileStore::ensure_schema`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaMarker {
    version: String,
    provisioned_at: chrono::DateTime<chrono::Utc>,
}

/// Ticket store on a directory shared by every participating process.
///
/// Layout:
/// ```text
/// {base_dir}/
///   schema.json
///   {encoded name}/       percent-encoded semaphore name
///     {index}.ticket      JSON-encoded Ticket
/// ```
///
/// Inserts write the ticket to a private temp file and hard-link it into
/// place. `link(2)` fails if the target exists, which gives an atomic
/// insert-if-absent on `(name, index)` across processes, and readers never
/// observe a partially written ticket.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a new FileStore with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the directory holding tickets for a semaphore name.
    fn name_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(Self::encode_name(name))
    }

    /// Get the path to a ticket file.
    fn ticket_path(&self, name: &str, index: u64) -> PathBuf {
        self.name_dir(name).join(format!("{}.{}", index, TICKET_EXT))
    }

    fn schema_path(&self) -> PathBuf {
        self.base_dir.join(SCHEMA_FILE)
    }

    /// Percent-encode a name into a single path component.
    ///
    /// A leading `.` is escaped too so `.`, `..` and hidden temp files cannot
    /// collide with a name. The empty name maps to a lone `%`, which the
    /// encoder never emits for any other input.
    fn encode_name(name: &str) -> String {
        if name.is_empty() {
            return EMPTY_NAME_DIR.to_string();
        }
        let encoded = urlencoding::encode(name);
        match encoded.strip_prefix('.') {
            Some(rest) => format!("%2E{}", rest),
            None => encoded.into_owned(),
        }
    }

    /// Inverse of [`encode_name`](Self::encode_name). Foreign directories yield `None`.
    fn decode_name(component: &str) -> Option<String> {
        if component == EMPTY_NAME_DIR {
            return Some(String::new());
        }
        let decoded = urlencoding::decode(component).ok()?.into_owned();
        (Self::encode_name(&decoded) == component).then_some(decoded)
    }

    /// Names are limited to [`MAX_NAME_LEN`] characters, matching the
    /// `varchar(64)` column of the relational schema, and must encode to a
    /// component the filesystem accepts.
    fn validate_name(name: &str) -> Result<(), StoreError> {
        let chars = name.chars().count();
        if chars > MAX_NAME_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "Semaphore name must be at most {} characters, got {}",
                MAX_NAME_LEN, chars
            )));
        }
        let encoded = Self::encode_name(name).len();
        if encoded > MAX_COMPONENT_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "Semaphore name encodes to {} bytes, limit is {}",
                encoded, MAX_COMPONENT_LEN
            )));
        }
        Ok(())
    }

    /// Parse `{index}.ticket` file names. Temp files and strays yield `None`.
    fn parse_index(path: &Path) -> Option<u64> {
        if path.extension().is_none_or(|ext| ext != TICKET_EXT) {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    /// Indices present for `name`, read from file names only.
    async fn indices(&self, name: &str) -> Result<Vec<u64>, StoreError> {
        let dir = self.name_dir(name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            if let Some(index) = Self::parse_index(&entry.path()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Read one ticket. A ticket deleted since listing reads as `None`.
    async fn read_ticket(&self, name: &str, index: u64) -> Result<Option<Ticket>, StoreError> {
        let path = self.ticket_path(name, index);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let ticket: Ticket = serde_json::from_slice(&data).map_err(|e| {
            StoreError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(ticket))
    }

    /// All tickets for `name` in index order.
    async fn tickets(&self, name: &str) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets = Vec::new();
        for index in self.indices(name).await? {
            if let Some(ticket) = self.read_ticket(name, index).await? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    async fn write_schema_marker(&self) -> Result<(), StoreError> {
        let marker = SchemaMarker {
            version: SCHEMA_VERSION.to_string(),
            provisioned_at: chrono::Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&marker)
            .map_err(|e| StoreError::Serialization(format!("Failed to encode schema: {}", e)))?;

        let path = self.schema_path();
        let temp_path = self
            .base_dir
            .join(format!(".{}.{}.tmp", SCHEMA_FILE, uuid::Uuid::new_v4()));
        fs::write(&temp_path, json).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StoreError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to create store dir {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        let path = self.schema_path();
        let current = match fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<SchemaMarker>(&data) {
                Ok(marker) => Some(marker.version),
                Err(e) => {
                    warn!("Unreadable schema marker {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(StoreError::Schema(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        if current.as_deref() == Some(SCHEMA_VERSION) {
            debug!("Schema {} already provisioned", SCHEMA_VERSION);
            return Ok(());
        }

        self.write_schema_marker().await?;
        info!(
            "Provisioned ticket store at {} (schema {} -> {})",
            self.base_dir.display(),
            current.as_deref().unwrap_or("none"),
            SCHEMA_VERSION
        );
        Ok(())
    }

    #[instrument(
        skip(self, ticket),
        level = "debug",
        fields(name = %ticket.name, index = ticket.index)
    )]
    async fn insert_unique(&self, ticket: &Ticket) -> Result<(), StoreError> {
        Self::validate_name(&ticket.name)?;
        let dir = self.name_dir(&ticket.name);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
        })?;

        let json = serde_json::to_vec(ticket)
            .map_err(|e| StoreError::Serialization(format!("Failed to encode ticket: {}", e)))?;
        let temp_path = dir.join(format!(".{}.{}.tmp", ticket.index, uuid::Uuid::new_v4()));
        fs::write(&temp_path, json).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;

        let path = self.ticket_path(&ticket.name, ticket.index);
        let linked = fs::hard_link(&temp_path, &path).await;
        if let Err(e) = fs::remove_file(&temp_path).await {
            warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
        }

        match linked {
            Ok(()) => {
                debug!("Inserted ticket {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::DuplicateKey {
                    name: ticket.name.clone(),
                    index: ticket.index,
                })
            }
            Err(e) => Err(StoreError::Io(format!(
                "Failed to link {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, name: &str, index: u64) -> Result<bool, StoreError> {
        Self::validate_name(name)?;
        let path = self.ticket_path(name, index);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted ticket {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn count_live_before(
        &self,
        name: &str,
        index_less_than: u64,
        expiration_at_or_after: i64,
    ) -> Result<u64, StoreError> {
        Self::validate_name(name)?;
        let mut count = 0;
        for index in self.indices(name).await? {
            if index >= index_less_than {
                break;
            }
            if let Some(ticket) = self.read_ticket(name, index).await? {
                if ticket.expiration_time >= expiration_at_or_after {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn max_index(&self, name: &str) -> Result<Option<u64>, StoreError> {
        Self::validate_name(name)?;
        Ok(self.indices(name).await?.last().copied())
    }

    async fn list(&self, name: &str) -> Result<Vec<Ticket>, StoreError> {
        Self::validate_name(name)?;
        self.tickets(name).await
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read dir {}: {}",
                    self.base_dir.display(),
                    e
                )))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| StoreError::Io(format!("Failed to get file type: {}", e)))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(Self::decode_name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    async fn purge_expired(&self, name: &str, before: i64) -> Result<u64, StoreError> {
        Self::validate_name(name)?;
        let mut purged = 0;
        for ticket in self.tickets(name).await? {
            if ticket.expiration_time < before && self.delete(name, ticket.index).await? {
                purged += 1;
            }
        }
        debug!("Purged {} expired tickets for {}", purged, name);
        Ok(purged)
    }
}
