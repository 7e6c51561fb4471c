use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{bail, Context as _};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

mod model;

pub use model::{
    Cohort,
    FilesystemRow,
    InodeKey,
    InodeRow,
    MiniGroup,
    SizeGroup,
    VolumeRow,
};

/// Tracking below this size is rarely worth the scan and database cost.
pub const DEFAULT_SIZE_CUTOFF: u64 = 8 * 1024 * 1024;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE filesystem (
    id   INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE
);

CREATE TABLE volume (
    id                       INTEGER PRIMARY KEY,
    fs_id                    INTEGER NOT NULL REFERENCES filesystem (id),
    root_id                  INTEGER NOT NULL,
    size_cutoff              INTEGER NOT NULL,
    last_tracked_generation  INTEGER NOT NULL DEFAULT 0,
    last_tracked_size_cutoff INTEGER,
    last_known_mountpoint    TEXT,
    desc                     TEXT NOT NULL DEFAULT '',
    UNIQUE (fs_id, root_id)
);

CREATE TABLE inode (
    vol_id      INTEGER NOT NULL REFERENCES volume (id),
    ino         INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    has_updates INTEGER NOT NULL,
    mini_hash   INTEGER,
    fiemap_hash INTEGER,
    PRIMARY KEY (vol_id, ino)
);

CREATE INDEX inode_vol_size ON inode (vol_id, size);

CREATE TABLE volume_path_history (
    id     INTEGER PRIMARY KEY,
    vol_id INTEGER NOT NULL REFERENCES volume (id),
    path   TEXT NOT NULL,
    UNIQUE (vol_id, path)
);

CREATE TABLE dedup_event (
    id        INTEGER PRIMARY KEY,
    fs_id     INTEGER NOT NULL REFERENCES filesystem (id),
    item_size INTEGER NOT NULL,
    created   INTEGER NOT NULL
);

CREATE TABLE dedup_event_inode (
    id       INTEGER PRIMARY KEY,
    event_id INTEGER NOT NULL REFERENCES dedup_event (id),
    vol_id   INTEGER NOT NULL REFERENCES volume (id),
    ino      INTEGER NOT NULL
);
";


/// Commit-time fsync policy. `Bulk` keeps WAL consistency but may lose
/// the most recent commits in a crash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Durability {
    Bulk,
    Full,
}


/// The durable model of filesystems, volumes, inodes and dedup events.
///
/// Mutating calls open a deferred transaction lazily; `commit` closes it.
/// Anything not committed is rolled back when the connection drops.
pub struct TrackingStore {
    conn: Connection,
    in_tx: bool,
}

impl TrackingStore {
    pub fn open(path: &Path) -> anyhow::Result<Self>
    {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self>
    {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self>
    {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(SCHEMA).context("creating schema")?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            SCHEMA_VERSION => {}
            other => bail!("unsupported database schema version {}", other),
        }

        Ok(Self { conn, in_tx: false })
    }

    pub fn set_durability(&mut self, durability: Durability) -> anyhow::Result<()>
    {
        // The pragma applies to whole commits; flush first.
        self.commit()?;

        let value = match durability {
            Durability::Bulk => "NORMAL",
            Durability::Full => "FULL",
        };
        self.conn.pragma_update(None, "synchronous", value)?;

        Ok(())
    }

    fn tx(&mut self) -> anyhow::Result<()>
    {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_tx = true;
        }

        Ok(())
    }

    pub fn commit(&mut self) -> anyhow::Result<()>
    {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }

        Ok(())
    }

    // Filesystems and volumes.

    pub fn get_or_create_fs(&mut self, uuid: &Uuid) -> anyhow::Result<(i64, bool)>
    {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM filesystem WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        self.tx()?;
        self.conn.execute(
            "INSERT INTO filesystem (uuid) VALUES (?1)",
            params![uuid.to_string()],
        )?;

        Ok((self.conn.last_insert_rowid(), true))
    }

    pub fn get_or_create_volume(&mut self, fs_id: i64, root_id: u64) -> anyhow::Result<(i64, bool)>
    {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM volume WHERE fs_id = ?1 AND root_id = ?2",
                params![fs_id, root_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        self.tx()?;
        self.conn.execute(
            "INSERT INTO volume (fs_id, root_id, size_cutoff) VALUES (?1, ?2, ?3)",
            params![fs_id, root_id, DEFAULT_SIZE_CUTOFF],
        )?;

        Ok((self.conn.last_insert_rowid(), true))
    }

    pub fn volume(&self, vol_id: i64) -> anyhow::Result<VolumeRow>
    {
        let row = self.conn.query_row(
            "SELECT id, fs_id, root_id, size_cutoff, last_tracked_generation,
                    last_tracked_size_cutoff, last_known_mountpoint, desc
             FROM volume WHERE id = ?1",
            params![vol_id],
            |row| {
                Ok(VolumeRow {
                    id: row.get(0)?,
                    fs_id: row.get(1)?,
                    root_id: row.get::<_, i64>(2)? as u64,
                    size_cutoff: row.get::<_, i64>(3)? as u64,
                    last_tracked_generation: row.get::<_, i64>(4)? as u64,
                    last_tracked_size_cutoff: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                    last_known_mountpoint: row.get(6)?,
                    desc: row.get(7)?,
                })
            },
        )?;

        Ok(row)
    }

    pub fn set_size_cutoff(&mut self, vol_id: i64, cutoff: u64) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "UPDATE volume SET size_cutoff = ?2 WHERE id = ?1",
            params![vol_id, cutoff],
        )?;

        Ok(())
    }

    /// Notes where a volume was seen mounted. The path also goes into the
    /// append-only name history.
    pub fn note_volume_seen(&mut self, vol_id: i64, path: &str) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO volume_path_history (vol_id, path) VALUES (?1, ?2)",
            params![vol_id, path],
        )?;
        self.conn.execute(
            "UPDATE volume SET desc = ?2, last_known_mountpoint = ?2 WHERE id = ?1",
            params![vol_id, path],
        )?;

        Ok(())
    }

    /// Drops every tracked inode of the volume and resets the generation
    /// watermark, forcing the next scan to start over.
    pub fn forget_volume(&mut self, vol_id: i64) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute("DELETE FROM inode WHERE vol_id = ?1", params![vol_id])?;
        self.conn.execute(
            "UPDATE volume SET last_tracked_generation = 0 WHERE id = ?1",
            params![vol_id],
        )?;

        Ok(())
    }

    pub fn set_last_tracked(&mut self, vol_id: i64, generation: u64, cutoff: u64)
        -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "UPDATE volume
             SET last_tracked_generation = ?2, last_tracked_size_cutoff = ?3
             WHERE id = ?1",
            params![vol_id, generation, cutoff],
        )?;

        Ok(())
    }

    // Inodes.

    /// Inserts or refreshes a tracked inode, flagging it as a pending
    /// candidate. A size change invalidates the cached fingerprints.
    pub fn upsert_inode(&mut self, vol_id: i64, ino: u64, size: u64) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "INSERT INTO inode (vol_id, ino, size, has_updates) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (vol_id, ino) DO UPDATE SET
                 mini_hash = CASE WHEN size = excluded.size THEN mini_hash ELSE NULL END,
                 fiemap_hash = CASE WHEN size = excluded.size THEN fiemap_hash ELSE NULL END,
                 size = excluded.size,
                 has_updates = 1",
            params![vol_id, ino, size],
        )?;

        Ok(())
    }

    pub fn delete_inode(&mut self, key: InodeKey) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "DELETE FROM inode WHERE vol_id = ?1 AND ino = ?2",
            params![key.vol_id, key.ino],
        )?;

        Ok(())
    }

    pub fn set_mini_hash(&mut self, key: InodeKey, hash: u32) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "UPDATE inode SET mini_hash = ?3 WHERE vol_id = ?1 AND ino = ?2",
            params![key.vol_id, key.ino, hash],
        )?;

        Ok(())
    }

    pub fn set_fiemap_hash(&mut self, key: InodeKey, hash: u32) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "UPDATE inode SET fiemap_hash = ?3 WHERE vol_id = ?1 AND ino = ?2",
            params![key.vol_id, key.ino, hash],
        )?;

        Ok(())
    }

    pub fn set_has_updates(&mut self, key: InodeKey, value: bool) -> anyhow::Result<()>
    {
        self.tx()?;
        self.conn.execute(
            "UPDATE inode SET has_updates = ?3 WHERE vol_id = ?1 AND ino = ?2",
            params![key.vol_id, key.ino, value],
        )?;

        Ok(())
    }

    pub fn inode(&self, key: InodeKey) -> anyhow::Result<Option<InodeRow>>
    {
        let row = self
            .conn
            .query_row(
                "SELECT vol_id, ino, size, has_updates, mini_hash, fiemap_hash
                 FROM inode WHERE vol_id = ?1 AND ino = ?2",
                params![key.vol_id, key.ino],
                inode_from_row,
            )
            .optional()?;

        Ok(row)
    }

    // Commonality queries.

    /// The largest tracked size across the volume set, if anything is
    /// tracked at all. The grouper's initial window bound.
    pub fn max_tracked_size(&self, vol_ids: &[i64]) -> anyhow::Result<Option<u64>>
    {
        let sql = format!(
            "SELECT MAX(size) FROM inode WHERE vol_id IN ({})",
            id_list(vol_ids)
        );
        let max: Option<u64> = self
            .conn
            .query_row(&sql, [], |row| row.get::<_, Option<i64>>(0))?
            .map(|v| v as u64);

        Ok(max)
    }

    /// One page of sizes shared by at least two inodes across the volume
    /// set, largest first, bounded above by `window_start` (inclusive).
    /// Groups where no member has a pending update are not interesting
    /// and are filtered out, which is what makes a rerun on an unchanged
    /// store come up empty.
    pub fn size_groups_page(&self, vol_ids: &[i64], window_start: u64, limit: usize)
        -> anyhow::Result<Vec<SizeGroup>>
    {
        let sql = format!(
            "SELECT size FROM inode
             WHERE vol_id IN ({}) AND size <= ?1
             GROUP BY size
             HAVING COUNT(*) >= 2 AND MAX(has_updates) > 0
             ORDER BY size DESC
             LIMIT ?2",
            id_list(vol_ids)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sizes = stmt
            .query_map(params![db_size(window_start), limit as i64], |row| {
                row.get::<_, i64>(0).map(|v| v as u64)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(sizes.len());
        for size in sizes {
            groups.push(SizeGroup { size, inodes: self.inodes_of_size(vol_ids, size)? });
        }

        Ok(groups)
    }

    fn inodes_of_size(&self, vol_ids: &[i64], size: u64) -> anyhow::Result<Vec<InodeRow>>
    {
        let sql = format!(
            "SELECT vol_id, ino, size, has_updates, mini_hash, fiemap_hash
             FROM inode
             WHERE vol_id IN ({}) AND size = ?1
             ORDER BY vol_id, ino",
            id_list(vol_ids)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![size], inode_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Members of a size group regrouped by equal head-prefix hash,
    /// keeping groups of at least two.
    pub fn refine_by_mini_hash(&self, vol_ids: &[i64], group: &SizeGroup)
        -> anyhow::Result<Vec<MiniGroup>>
    {
        let sql = format!(
            "SELECT mini_hash FROM inode
             WHERE vol_id IN ({}) AND size = ?1 AND mini_hash IS NOT NULL
             GROUP BY mini_hash
             HAVING COUNT(*) >= 2
             ORDER BY mini_hash",
            id_list(vol_ids)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let hashes = stmt
            .query_map(params![group.size], |row| row.get::<_, u32>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(hashes.len());
        for mini_hash in hashes {
            let sql = format!(
                "SELECT vol_id, ino, size, has_updates, mini_hash, fiemap_hash
                 FROM inode
                 WHERE vol_id IN ({}) AND size = ?1 AND mini_hash = ?2
                 ORDER BY vol_id, ino",
                id_list(vol_ids)
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let inodes = stmt
                .query_map(params![group.size, mini_hash], inode_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            groups.push(MiniGroup { size: group.size, mini_hash, inodes });
        }

        Ok(groups)
    }

    /// The final narrowing: at most one cohort per mini-hash group, the
    /// extent-map-hash bucket with the most members (ties broken towards
    /// the smaller hash).
    pub fn refine_by_fiemap_hash(&self, vol_ids: &[i64], group: &MiniGroup)
        -> anyhow::Result<Option<Cohort>>
    {
        let sql = format!(
            "SELECT fiemap_hash FROM inode
             WHERE vol_id IN ({}) AND size = ?1 AND mini_hash = ?2
                   AND fiemap_hash IS NOT NULL
             GROUP BY fiemap_hash
             HAVING COUNT(*) >= 2
             ORDER BY COUNT(*) DESC, fiemap_hash
             LIMIT 1",
            id_list(vol_ids)
        );
        let fiemap_hash: Option<u32> = self
            .conn
            .query_row(&sql, params![group.size, group.mini_hash], |row| row.get(0))
            .optional()?;

        let fiemap_hash = match fiemap_hash {
            Some(h) => h,
            None => return Ok(None),
        };

        let sql = format!(
            "SELECT vol_id, ino, size, has_updates, mini_hash, fiemap_hash
             FROM inode
             WHERE vol_id IN ({}) AND size = ?1 AND mini_hash = ?2 AND fiemap_hash = ?3
             ORDER BY vol_id, ino",
            id_list(vol_ids)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let inodes = stmt
            .query_map(params![group.size, group.mini_hash, fiemap_hash], inode_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(Cohort { size: group.size, inodes }))
    }

    /// Clears the pending flag for every inode in the volumes whose size
    /// falls in `[low, high]`, both ends inclusive.
    pub fn clear_updates(&mut self, vol_ids: &[i64], low: u64, high: u64) -> anyhow::Result<()>
    {
        self.tx()?;
        let sql = format!(
            "UPDATE inode SET has_updates = 0
             WHERE vol_id IN ({}) AND size BETWEEN ?1 AND ?2",
            id_list(vol_ids)
        );
        self.conn.execute(&sql, params![db_size(low), db_size(high)])?;

        Ok(())
    }

    // Dedup events.

    pub fn record_event(&mut self, fs_id: i64, item_size: u64, participants: &[InodeKey])
        -> anyhow::Result<i64>
    {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.tx()?;
        self.conn.execute(
            "INSERT INTO dedup_event (fs_id, item_size, created) VALUES (?1, ?2, ?3)",
            params![fs_id, item_size, created],
        )?;
        let event_id = self.conn.last_insert_rowid();

        for key in participants {
            self.conn.execute(
                "INSERT INTO dedup_event_inode (event_id, vol_id, ino) VALUES (?1, ?2, ?3)",
                params![event_id, key.vol_id, key.ino],
            )?;
        }

        Ok(event_id)
    }

    // Reporting.

    pub fn filesystems(&self) -> anyhow::Result<Vec<FilesystemRow>>
    {
        let mut stmt = self.conn.prepare("SELECT id, uuid FROM filesystem ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, uuid)| {
                Ok(FilesystemRow {
                    id,
                    uuid: Uuid::parse_str(&uuid).context("malformed uuid in database")?,
                })
            })
            .collect()
    }

    pub fn volumes_of(&self, fs_id: i64) -> anyhow::Result<Vec<VolumeRow>>
    {
        let mut stmt = self.conn.prepare(
            "SELECT id, fs_id, root_id, size_cutoff, last_tracked_generation,
                    last_tracked_size_cutoff, last_known_mountpoint, desc
             FROM volume WHERE fs_id = ?1 ORDER BY root_id",
        )?;
        let rows = stmt
            .query_map(params![fs_id], |row| {
                Ok(VolumeRow {
                    id: row.get(0)?,
                    fs_id: row.get(1)?,
                    root_id: row.get::<_, i64>(2)? as u64,
                    size_cutoff: row.get::<_, i64>(3)? as u64,
                    last_tracked_generation: row.get::<_, i64>(4)? as u64,
                    last_tracked_size_cutoff: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                    last_known_mountpoint: row.get(6)?,
                    desc: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    pub fn inode_count(&self, vol_id: i64) -> anyhow::Result<u64>
    {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM inode WHERE vol_id = ?1",
            params![vol_id],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }

    pub fn event_count(&self, fs_id: i64) -> anyhow::Result<u64>
    {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dedup_event WHERE fs_id = ?1",
            params![fs_id],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }

    pub fn event_inode_count(&self, event_id: i64) -> anyhow::Result<u64>
    {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dedup_event_inode WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }
}


fn inode_from_row(row: &rusqlite::Row) -> rusqlite::Result<InodeRow>
{
    Ok(InodeRow {
        vol_id: row.get(0)?,
        ino: row.get::<_, i64>(1)? as u64,
        size: row.get::<_, i64>(2)? as u64,
        has_updates: row.get(3)?,
        mini_hash: row.get(4)?,
        fiemap_hash: row.get(5)?,
    })
}


/// Size bounds come in as u64 with u64::MAX standing for "no bound";
/// SQLite integers are signed, so saturate there.
fn db_size(value: u64) -> i64
{
    value.min(i64::MAX as u64) as i64
}


/// Renders a volume id set for an IN clause. The ids are our own row ids,
/// not untrusted input.
fn id_list(ids: &[i64]) -> String
{
    let mut out = String::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&id.to_string());
    }

    out
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (TrackingStore, i64, i64)
    {
        let mut store = TrackingStore::open_in_memory().unwrap();
        let uuid = Uuid::from_bytes([7; 16]);
        let (fs_id, created) = store.get_or_create_fs(&uuid).unwrap();
        assert!(created);
        let (vol_id, created) = store.get_or_create_volume(fs_id, 256).unwrap();
        assert!(created);

        (store, fs_id, vol_id)
    }

    fn key(vol_id: i64, ino: u64) -> InodeKey
    {
        InodeKey { vol_id, ino }
    }

    mod rows {
        use super::*;

        #[test]
        fn get_or_create_is_idempotent()
        {
            let (mut store, fs_id, vol_id) = fresh();

            let uuid = Uuid::from_bytes([7; 16]);
            assert_eq!(store.get_or_create_fs(&uuid).unwrap(), (fs_id, false));
            assert_eq!(store.get_or_create_volume(fs_id, 256).unwrap(), (vol_id, false));
        }

        #[test]
        fn new_volume_gets_the_default_cutoff()
        {
            let (store, _, vol_id) = fresh();

            let vol = store.volume(vol_id).unwrap();
            assert_eq!(vol.size_cutoff, DEFAULT_SIZE_CUTOFF);
            assert_eq!(vol.last_tracked_generation, 0);
            assert_eq!(vol.last_tracked_size_cutoff, None);
        }

        #[test]
        fn note_volume_seen_keeps_history()
        {
            let (mut store, _, vol_id) = fresh();

            store.note_volume_seen(vol_id, "/mnt/a").unwrap();
            store.note_volume_seen(vol_id, "/mnt/b").unwrap();
            store.note_volume_seen(vol_id, "/mnt/a").unwrap();

            let vol = store.volume(vol_id).unwrap();
            assert_eq!(vol.last_known_mountpoint.as_deref(), Some("/mnt/a"));

            let paths: i64 = store
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM volume_path_history WHERE vol_id = ?1",
                    params![vol_id],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(paths, 2);
        }

        #[test]
        fn upsert_invalidates_hashes_on_size_change()
        {
            let (mut store, _, vol_id) = fresh();

            store.upsert_inode(vol_id, 300, 1000).unwrap();
            store.set_mini_hash(key(vol_id, 300), 0xaabb).unwrap();
            store.set_fiemap_hash(key(vol_id, 300), 0xccdd).unwrap();

            // Same size: hashes survive.
            store.upsert_inode(vol_id, 300, 1000).unwrap();
            let row = store.inode(key(vol_id, 300)).unwrap().unwrap();
            assert_eq!(row.mini_hash, Some(0xaabb));
            assert_eq!(row.fiemap_hash, Some(0xccdd));

            // Grown: hashes are stale and dropped.
            store.upsert_inode(vol_id, 300, 2000).unwrap();
            let row = store.inode(key(vol_id, 300)).unwrap().unwrap();
            assert_eq!(row.size, 2000);
            assert_eq!(row.mini_hash, None);
            assert_eq!(row.fiemap_hash, None);
            assert!(row.has_updates);
        }

        #[test]
        fn forget_drops_inodes_and_resets_the_watermark()
        {
            let (mut store, _, vol_id) = fresh();

            store.upsert_inode(vol_id, 300, 1000).unwrap();
            store.set_last_tracked(vol_id, 42, 500).unwrap();
            store.forget_volume(vol_id).unwrap();
            store.commit().unwrap();

            assert_eq!(store.inode_count(vol_id).unwrap(), 0);
            assert_eq!(store.volume(vol_id).unwrap().last_tracked_generation, 0);
        }
    }


    mod commonality {
        use super::*;

        fn seed(store: &mut TrackingStore, vol_id: i64)
        {
            // Two pairs and a singleton.
            store.upsert_inode(vol_id, 300, 4096).unwrap();
            store.upsert_inode(vol_id, 301, 4096).unwrap();
            store.upsert_inode(vol_id, 302, 8192).unwrap();
            store.upsert_inode(vol_id, 303, 8192).unwrap();
            store.upsert_inode(vol_id, 304, 12288).unwrap();
        }

        #[test]
        fn pages_come_largest_first()
        {
            let (mut store, _, vol_id) = fresh();
            seed(&mut store, vol_id);

            let groups = store.size_groups_page(&[vol_id], u64::MAX, 10).unwrap();

            assert_eq!(groups.len(), 2);
            assert_eq!(groups[0].size, 8192);
            assert_eq!(groups[1].size, 4096);
            assert_eq!(groups[0].inodes.len(), 2);
        }

        #[test]
        fn window_bound_and_limit_apply()
        {
            let (mut store, _, vol_id) = fresh();
            seed(&mut store, vol_id);

            let groups = store.size_groups_page(&[vol_id], 8191, 10).unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].size, 4096);

            let groups = store.size_groups_page(&[vol_id], u64::MAX, 1).unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].size, 8192);
        }

        #[test]
        fn groups_span_volumes()
        {
            let (mut store, fs_id, vol_a) = fresh();
            let (vol_b, _) = store.get_or_create_volume(fs_id, 257).unwrap();

            store.upsert_inode(vol_a, 300, 4096).unwrap();
            store.upsert_inode(vol_b, 300, 4096).unwrap();

            let groups = store.size_groups_page(&[vol_a, vol_b], u64::MAX, 10).unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].inodes.len(), 2);

            // Restricted to one volume, the pair dissolves.
            let groups = store.size_groups_page(&[vol_a], u64::MAX, 10).unwrap();
            assert!(groups.is_empty());
        }

        #[test]
        fn settled_groups_are_not_reoffered()
        {
            let (mut store, _, vol_id) = fresh();
            seed(&mut store, vol_id);

            store.clear_updates(&[vol_id], 0, u64::MAX).unwrap();

            assert!(store.size_groups_page(&[vol_id], u64::MAX, 10).unwrap().is_empty());

            // One member updating revives its group, and only its group.
            store.upsert_inode(vol_id, 300, 4096).unwrap();
            let groups = store.size_groups_page(&[vol_id], u64::MAX, 10).unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].size, 4096);
        }

        #[test]
        fn clear_updates_is_range_inclusive()
        {
            let (mut store, _, vol_id) = fresh();
            seed(&mut store, vol_id);

            store.clear_updates(&[vol_id], 4096, 8192).unwrap();

            assert!(!store.inode(key(vol_id, 300)).unwrap().unwrap().has_updates);
            assert!(!store.inode(key(vol_id, 303)).unwrap().unwrap().has_updates);
            assert!(store.inode(key(vol_id, 304)).unwrap().unwrap().has_updates);
        }

        #[test]
        fn refinement_narrows_by_mini_then_fiemap()
        {
            let (mut store, _, vol_id) = fresh();
            for ino in 300..306 {
                store.upsert_inode(vol_id, ino, 4096).unwrap();
            }

            // 300/301/302 share a prefix hash, 303/304 another, 305 is odd
            // one out.
            for ino in [300, 301, 302] {
                store.set_mini_hash(key(vol_id, ino), 1).unwrap();
            }
            for ino in [303, 304] {
                store.set_mini_hash(key(vol_id, ino), 2).unwrap();
            }
            store.set_mini_hash(key(vol_id, 305), 3).unwrap();

            let group = SizeGroup { size: 4096, inodes: Vec::new() };
            let minis = store.refine_by_mini_hash(&[vol_id], &group).unwrap();
            assert_eq!(minis.len(), 2);
            assert_eq!(minis[0].mini_hash, 1);
            assert_eq!(minis[0].inodes.len(), 3);
            assert_eq!(minis[1].mini_hash, 2);

            // Within the first mini group, 300/301 share extents already
            // hashed; 302 lacks a fiemap hash and cannot take part.
            store.set_fiemap_hash(key(vol_id, 300), 9).unwrap();
            store.set_fiemap_hash(key(vol_id, 301), 9).unwrap();

            let cohort = store.refine_by_fiemap_hash(&[vol_id], &minis[0]).unwrap().unwrap();
            assert_eq!(cohort.inodes.len(), 2);
            assert_eq!(cohort.inodes[0].ino, 300);

            // The second mini group has no shared extent hash at all.
            assert!(store.refine_by_fiemap_hash(&[vol_id], &minis[1]).unwrap().is_none());
        }

        #[test]
        fn fiemap_refinement_prefers_the_biggest_bucket()
        {
            let (mut store, _, vol_id) = fresh();
            for ino in 300..305 {
                store.upsert_inode(vol_id, ino, 4096).unwrap();
                store.set_mini_hash(key(vol_id, ino), 1).unwrap();
            }
            for ino in [300, 301] {
                store.set_fiemap_hash(key(vol_id, ino), 5).unwrap();
            }
            for ino in [302, 303, 304] {
                store.set_fiemap_hash(key(vol_id, ino), 6).unwrap();
            }

            let group = MiniGroup { size: 4096, mini_hash: 1, inodes: Vec::new() };
            let cohort = store.refine_by_fiemap_hash(&[vol_id], &group).unwrap().unwrap();

            assert_eq!(cohort.inodes.len(), 3);
            assert_eq!(cohort.inodes[0].ino, 302);
        }
    }


    mod events {
        use super::*;

        #[test]
        fn record_event_writes_one_row_per_participant()
        {
            let (mut store, fs_id, vol_id) = fresh();

            let participants = [key(vol_id, 300), key(vol_id, 301), key(vol_id, 302)];
            let event_id = store.record_event(fs_id, 4096, &participants).unwrap();
            store.commit().unwrap();

            assert_eq!(store.event_count(fs_id).unwrap(), 1);
            assert_eq!(store.event_inode_count(event_id).unwrap(), 3);
        }
    }


    mod engine {
        use super::*;

        #[test]
        fn commit_without_writes_is_fine()
        {
            let (mut store, _, _) = fresh();

            store.commit().unwrap();
            store.commit().unwrap();
        }

        #[test]
        fn durability_can_flip_mid_run()
        {
            let (mut store, _, vol_id) = fresh();

            store.set_durability(Durability::Bulk).unwrap();
            store.upsert_inode(vol_id, 300, 4096).unwrap();
            store.commit().unwrap();
            store.set_durability(Durability::Full).unwrap();

            assert_eq!(store.inode_count(vol_id).unwrap(), 1);
        }

        #[test]
        fn id_list_renders()
        {
            assert_eq!(id_list(&[1]), "1");
            assert_eq!(id_list(&[1, 2, 9]), "1,2,9");
        }
    }
}
