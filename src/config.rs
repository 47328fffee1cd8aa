use std::path::PathBuf;

/// WAL durability on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync the WAL on every commit.
    Full,
    /// Append without syncing; durability is best-effort.
    Off,
}

#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Backing file for the block arena. `None` maps anonymous memory.
    pub block_path: Option<PathBuf>,
    /// Write-ahead log path. `None` disables logging and recovery.
    pub wal_path: Option<PathBuf>,
    /// Upper bound of the block address space in bytes (power of two).
    pub capacity: u64,
    /// Number of vertex-table slots reserved up front. The table is a
    /// sparse mapping; untouched slots cost nothing.
    pub max_vertex_id: u64,
    /// Capacity of the lock-free read-epoch registry.
    pub reader_slots: usize,
    pub sync_mode: SyncMode,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            block_path: None,
            wal_path: None,
            capacity: 1 << 32,
            max_vertex_id: 1 << 24,
            reader_slots: 1024,
            sync_mode: SyncMode::Full,
        }
    }
}

impl GraphOptions {
    /// Anonymous, non-durable graph sized for tests and scratch work.
    pub fn in_memory() -> Self {
        Self {
            capacity: 1 << 28,
            max_vertex_id: 1 << 20,
            ..Self::default()
        }
    }

    /// File-backed graph with WAL durability.
    pub fn durable(block_path: impl Into<PathBuf>, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            block_path: Some(block_path.into()),
            wal_path: Some(wal_path.into()),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_vertex_id(mut self, max_vertex_id: u64) -> Self {
        self.max_vertex_id = max_vertex_id;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}
