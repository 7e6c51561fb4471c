use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use anyhow::{bail, Context as _};

use crate::btrfs::{self, InodeItem, SearchKey, BTRFS_INODE_ITEM_KEY, SEARCH_BATCH};
use crate::logger::Logger;
use crate::mounts;
use crate::store::{InodeKey, TrackingStore};


/// Transient, per-run state of one opened subvolume. The durable
/// counterpart lives in the store; they are joined by the volume row id.
#[derive(Debug)]
pub struct VolumeSession {
    pub vol_id: i64,
    pub fs_id: i64,
    pub root_id: u64,
    pub st_dev: u64,
    pub desc: String,
    fd: File,
}

impl VolumeSession {
    pub fn fd(&self) -> RawFd
    {
        self.fd.as_raw_fd()
    }
}


/// The opened volumes of one filesystem, keyed by volume row id.
#[derive(Debug, Default)]
pub struct VolSet(BTreeMap<i64, VolumeSession>);

impl VolSet {
    pub fn new() -> Self
    {
        Self(BTreeMap::new())
    }

    /// Adds a session. A volume named twice on the command line keeps its
    /// first session; the later open is dropped, closing its fd.
    pub fn insert(&mut self, vol: VolumeSession)
    {
        self.0.entry(vol.vol_id).or_insert(vol);
    }

    pub fn get(&self, vol_id: i64) -> Option<&VolumeSession>
    {
        self.0.get(&vol_id)
    }

    pub fn ids(&self) -> Vec<i64>
    {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize
    {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeSession>
    {
        self.0.values()
    }

    pub fn fs_id(&self) -> anyhow::Result<i64>
    {
        let mut ids = self.0.values().map(|vol| vol.fs_id);
        let first = match ids.next() {
            Some(id) => id,
            None => bail!("empty volume set"),
        };
        if ids.any(|id| id != first) {
            bail!("volume set spans multiple filesystems");
        }

        Ok(first)
    }
}


/// Opens a subvolume directory and makes sure the store knows about it.
/// An explicit cutoff overrides whatever the volume row carries.
pub fn open_volume(
    store: &mut TrackingStore,
    path: &Path,
    size_cutoff: Option<u64>,
    logger: &mut Logger,
) -> anyhow::Result<VolumeSession>
{
    let path = path
        .canonicalize()
        .with_context(|| format!("resolving {}", path.display()))?;
    let dir = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    if !mounts::is_subvolume(&dir)? {
        logger.log(1, &format!("{} is not the top of a subvolume", path.display()));
    }

    let uuid = btrfs::fsid(dir.as_raw_fd())
        .with_context(|| format!("{} is not on btrfs, or not accessible", path.display()))?;
    let root_id = btrfs::root_id(dir.as_raw_fd())?;

    let (fs_id, _) = store.get_or_create_fs(&uuid)?;
    let (vol_id, _) = store.get_or_create_volume(fs_id, root_id)?;
    if let Some(cutoff) = size_cutoff {
        store.set_size_cutoff(vol_id, cutoff)?;
    }

    let desc = path.to_string_lossy().into_owned();
    store.note_volume_seen(vol_id, &desc)?;

    let st_dev = dir.metadata()?.dev();

    Ok(VolumeSession { vol_id, fs_id, root_id, st_dev, desc, fd: dir })
}


/// Lower generation bound for the next scan. A cutoff decrease since the
/// last scan makes older files newly eligible, so everything must be
/// walked again.
fn min_generation(last_cutoff: Option<u64>, last_generation: u64, cutoff: u64) -> u64
{
    match last_cutoff {
        Some(prev) if prev <= cutoff => last_generation + 1,
        _ => 0,
    }
}


/// Per-record generation filter. Inodes at least as large as the previous
/// cutoff were covered by the last scan, so only strictly newer
/// generations count for them; smaller ones may have become eligible only
/// now and get the looser bound.
fn record_wanted(item: &InodeItem, last_cutoff: Option<u64>, last_generation: u64, min_gen: u64)
    -> bool
{
    if let Some(prev) = last_cutoff {
        if item.size >= prev {
            return item.generation > last_generation;
        }
    }

    item.generation >= min_gen
}


/// Upserts every regular file of the volume that is at least the cutoff
/// in size and changed since the watermark, marking each as a pending
/// candidate. Advances the watermark on completion.
pub fn track_updated_files(
    store: &mut TrackingStore,
    vol: &VolumeSession,
    logger: &mut Logger,
) -> anyhow::Result<()>
{
    let row = store.volume(vol.vol_id)?;
    let top_generation = btrfs::root_generation(vol.fd())
        .with_context(|| format!("reading the generation of {}", vol.desc))?;
    let min_gen = min_generation(
        row.last_tracked_size_cutoff,
        row.last_tracked_generation,
        row.size_cutoff,
    );

    logger.log(1, &format!(
        "scanning {} generations {} to {}, size cutoff {}",
        vol.desc, min_gen, top_generation, row.size_cutoff,
    ));
    if min_gen > top_generation {
        logger.log(1, "generation didn't change, skipping scan");
        store.commit()?;
        return Ok(());
    }

    let mut key = SearchKey::new(0);
    key.min_transid = min_gen;
    key.max_type = BTRFS_INODE_ITEM_KEY;

    let mut tracked: u64 = 0;

    loop {
        let items = btrfs::tree_search(vol.fd(), &key, SEARCH_BATCH)
            .with_context(|| format!("searching the tree of {}", vol.desc))?;
        let last = match items.last() {
            Some(item) => item.header,
            None => break,
        };

        for item in &items {
            // The search cannot be narrowed to one type without pinning
            // the objectid; skip whatever else it returns.
            if item.header.item_type != BTRFS_INODE_ITEM_KEY {
                continue;
            }

            let inode_item = btrfs::parse_inode_item(&item.data)?;
            if inode_item.size < row.size_cutoff {
                continue;
            }
            if !record_wanted(
                &inode_item,
                row.last_tracked_size_cutoff,
                row.last_tracked_generation,
                min_gen,
            ) {
                continue;
            }
            if inode_item.mode & libc::S_IFMT != libc::S_IFREG {
                continue;
            }

            let ino = item.header.objectid;
            store.upsert_inode(vol.vol_id, ino, inode_item.size)?;

            match btrfs::lookup_ino_path_one(vol.fd(), ino) {
                Ok(path) => {
                    tracked += 1;
                    // Display only; paths that don't decode aren't logged.
                    if let Some(path) = path.to_str() {
                        logger.log(2, &format!(
                            "{} (ino {} outer gen {} inner gen {} size {})",
                            path, ino, item.header.transid, inode_item.generation,
                            inode_item.size,
                        ));
                    }
                }
                Err(err) => {
                    logger.log(0, &format!("error at path lookup of inode {}: {}", ino, err));
                    store.delete_inode(InodeKey { vol_id: vol.vol_id, ino })?;
                }
            }
        }

        key.advance_past(&last);
    }

    store.set_last_tracked(vol.vol_id, top_generation, row.size_cutoff)?;
    store.commit()?;
    logger.log(1, &format!("tracked {} updated items on {}", tracked, vol.desc));

    Ok(())
}


/// User-facing reset: drop everything tracked about a volume.
pub fn forget_volume(
    store: &mut TrackingStore,
    vol: &VolumeSession,
    logger: &mut Logger,
) -> anyhow::Result<()>
{
    store.forget_volume(vol.vol_id)?;
    store.commit()?;
    logger.log(0, &format!("forgot tracked inodes of {}", vol.desc));

    Ok(())
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;

    mod watermark {
        use super::*;

        #[test]
        fn first_scan_starts_at_zero()
        {
            assert_eq!(min_generation(None, 0, 8 << 20), 0);
        }

        #[test]
        fn unchanged_cutoff_resumes_past_the_watermark()
        {
            assert_eq!(min_generation(Some(8 << 20), 41, 8 << 20), 42);
        }

        #[test]
        fn raised_cutoff_still_resumes()
        {
            // Fewer files are eligible than before; the old coverage
            // remains valid.
            assert_eq!(min_generation(Some(8 << 20), 41, 16 << 20), 42);
        }

        #[test]
        fn lowered_cutoff_forces_a_full_rescan()
        {
            assert_eq!(min_generation(Some(16 << 20), 41, 8 << 20), 0);
        }
    }


    mod record_filter {
        use super::*;

        fn item(generation: u64, size: u64) -> InodeItem
        {
            InodeItem { generation, size, ..Default::default() }
        }

        #[test]
        fn covered_sizes_need_a_newer_generation()
        {
            let last_cutoff = Some(8u64 << 20);

            // Covered last time at generation 41: unchanged files skip.
            assert!(!record_wanted(&item(41, 9 << 20), last_cutoff, 41, 0));
            assert!(record_wanted(&item(42, 9 << 20), last_cutoff, 41, 0));
        }

        #[test]
        fn newly_eligible_sizes_take_any_generation()
        {
            // Cutoff went from 16M to 8M: a 9M file from long ago is new
            // to us.
            let last_cutoff = Some(16u64 << 20);

            assert!(record_wanted(&item(3, 9 << 20), last_cutoff, 41, 0));
            // But a 17M file was covered and must have changed.
            assert!(!record_wanted(&item(3, 17 << 20), last_cutoff, 41, 0));
        }

        #[test]
        fn fresh_volume_takes_everything()
        {
            assert!(record_wanted(&item(0, 9 << 20), None, 0, 0));
        }

        #[test]
        fn resumed_scan_honours_the_lower_bound()
        {
            // No previous cutoff recorded but a nonzero bound: the bound
            // decides.
            assert!(!record_wanted(&item(9, 9 << 20), None, 0, 10));
            assert!(record_wanted(&item(10, 9 << 20), None, 0, 10));
        }
    }
}
