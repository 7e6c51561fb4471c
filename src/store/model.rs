use uuid::Uuid;

/// Key of a tracked inode row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InodeKey {
    pub vol_id: i64,
    pub ino: u64,
}


/// A filesystem, identified by its UUID. Created on first sight, never
/// deleted.
#[derive(Clone, Debug)]
pub struct FilesystemRow {
    pub id: i64,
    pub uuid: Uuid,
}


/// Durable state of one subvolume.
#[derive(Clone, Debug)]
pub struct VolumeRow {
    pub id: i64,
    pub fs_id: i64,
    pub root_id: u64,
    /// Files below this size are not tracked.
    pub size_cutoff: u64,
    /// Generation watermark of the last completed scan.
    pub last_tracked_generation: u64,
    /// Cutoff the last completed scan ran with. A later, smaller cutoff
    /// invalidates the watermark.
    pub last_tracked_size_cutoff: Option<u64>,
    pub last_known_mountpoint: Option<String>,
    pub desc: String,
}


/// A tracked inode with its cached fingerprints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeRow {
    pub vol_id: i64,
    pub ino: u64,
    pub size: u64,
    /// Pending dedup candidate.
    pub has_updates: bool,
    pub mini_hash: Option<u32>,
    pub fiemap_hash: Option<u32>,
}

impl InodeRow {
    pub fn key(&self) -> InodeKey
    {
        InodeKey { vol_id: self.vol_id, ino: self.ino }
    }
}


/// Inodes sharing one size across a volume set; the first narrowing stage.
#[derive(Clone, Debug)]
pub struct SizeGroup {
    pub size: u64,
    pub inodes: Vec<InodeRow>,
}


/// A size group narrowed by equal head-prefix hash.
#[derive(Clone, Debug)]
pub struct MiniGroup {
    pub size: u64,
    pub mini_hash: u32,
    pub inodes: Vec<InodeRow>,
}


/// The strongest grouping: equal size, head-prefix hash and extent-map
/// hash. What the deduper verifies and clones.
#[derive(Clone, Debug)]
pub struct Cohort {
    pub size: u64,
    pub inodes: Vec<InodeRow>,
}
