use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use anyhow::bail;
use bincode::{DefaultOptions, Options};

use crate::btrfs::{self, fiemap};
use crate::dedup::{self, FdBudget};
use crate::logger::Logger;
use crate::scan::VolSet;
use crate::store::{Durability, InodeKey, InodeRow, SizeGroup, TrackingStore};

/// Size groups processed per window.
pub const WINDOW_SIZE: usize = 200;

/// Length of the head prefix the mini-hash covers. Every file must be
/// hashed over the same span for a collision to mean anything.
pub const MINI_HASH_SPAN: usize = 8192;


/// Potential savings seen by each narrowing pass, assuming every group
/// collapses to a single copy.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpaceGain {
    pub by_size: u64,
    pub by_mini_hash: u64,
    pub by_fiemap_hash: u64,
}

impl SpaceGain {
    fn count(total: &mut u64, size: u64, members: usize)
    {
        *total += size * (members as u64 - 1);
    }
}


/// One page of the windowed traversal: the inclusive size span it covers
/// and the duplicate-size groups inside it.
#[derive(Clone, Debug)]
pub struct Window {
    pub high: u64,
    pub low: u64,
    pub groups: Vec<SizeGroup>,
}


/// Restartable cursor over descending-size pages. The final page is
/// empty and spans down to size zero, so update flags below the last
/// group are cleared too; after it the cursor is exhausted.
#[derive(Clone, Debug)]
pub struct SizeWindows {
    window_start: u64,
    per: usize,
    done: bool,
}

impl SizeWindows {
    pub fn new(window_start: u64, per: usize) -> Self
    {
        Self { window_start, per, done: false }
    }

    pub fn next_page(&mut self, store: &TrackingStore, vol_ids: &[i64])
        -> anyhow::Result<Option<Window>>
    {
        if self.done {
            return Ok(None);
        }

        let groups = store.size_groups_page(vol_ids, self.window_start, self.per)?;
        let high = self.window_start;
        let low = match groups.last() {
            Some(group) => group.size,
            None => 0,
        };

        if low == 0 {
            self.done = true;
        } else {
            self.window_start = low - 1;
        }

        Ok(Some(Window { high, low, groups }))
    }
}


/// Walks duplicate-size groups of the volume set in descending-size
/// windows, narrows each through the fingerprint filters, and hands the
/// final cohorts to the deduper. Window bookkeeping keeps the pending
/// flags honest: everything a window covered is cleared, except what the
/// deduper had to skip.
pub fn dedup_tracked(
    store: &mut TrackingStore,
    vols: &VolSet,
    logger: &mut Logger,
    defrag: bool,
) -> anyhow::Result<()>
{
    let vol_ids = vols.ids();
    let fs_id = vols.fs_id()?;

    // Start above every tracked size, so sizes without a duplicate peer
    // get their flags cleared as well.
    let window_start = match store.max_tracked_size(&vol_ids)? {
        Some(size) => size,
        None => return Ok(()),
    };

    let mut budget = FdBudget::from_rlimit(7 + vols.len() as u64)?;
    let mut gain = SpaceGain::default();
    let mut skipped: Vec<InodeKey> = Vec::new();

    // Per-cohort commits during the loop don't need to survive a crash;
    // relax fsync until the traversal is over.
    store.set_durability(Durability::Bulk)?;

    let mut windows = SizeWindows::new(window_start, WINDOW_SIZE);
    while let Some(window) = windows.next_page(store, &vol_ids)? {
        for group in &window.groups {
            process_size_group(
                store, vols, &vol_ids, fs_id, group,
                &mut budget, &mut gain, &mut skipped, logger, defrag,
            )?;
        }

        store.clear_updates(&vol_ids, window.low, window.high)?;
        for key in skipped.drain(..) {
            store.set_has_updates(key, true)?;
        }
        store.commit()?;
    }

    logger.log(0, &format!(
        "potential space gain: pass 1 {}, pass 2 {}, pass 3 {}",
        gain.by_size, gain.by_mini_hash, gain.by_fiemap_hash,
    ));

    store.set_durability(Durability::Full)?;
    store.commit()?;

    Ok(())
}


fn process_size_group(
    store: &mut TrackingStore,
    vols: &VolSet,
    vol_ids: &[i64],
    fs_id: i64,
    group: &SizeGroup,
    budget: &mut FdBudget,
    gain: &mut SpaceGain,
    skipped: &mut Vec<InodeKey>,
    logger: &mut Logger,
    defrag: bool,
) -> anyhow::Result<()>
{
    SpaceGain::count(&mut gain.by_size, group.size, group.inodes.len());
    logger.log(2, &format!(
        "size group {} with {} inodes", group.size, group.inodes.len(),
    ));

    for inode in &group.inodes {
        if inode.mini_hash.is_some() {
            continue;
        }
        if let Some(file) = open_for_hashing(store, vols, inode, logger)? {
            let hash = mini_hash(&file)?;
            store.set_mini_hash(inode.key(), hash)?;
        }
    }

    for mini_group in store.refine_by_mini_hash(vol_ids, group)? {
        SpaceGain::count(&mut gain.by_mini_hash, mini_group.size, mini_group.inodes.len());

        for inode in &mini_group.inodes {
            if inode.fiemap_hash.is_some() {
                continue;
            }
            if let Some(file) = open_for_hashing(store, vols, inode, logger)? {
                let hash = fiemap_hash(&file)?;
                store.set_fiemap_hash(inode.key(), hash)?;
            }
        }

        if let Some(cohort) = store.refine_by_fiemap_hash(vol_ids, &mini_group)? {
            SpaceGain::count(&mut gain.by_fiemap_hash, cohort.size, cohort.inodes.len());
            dedup::dedup_cohort(store, vols, fs_id, &cohort, budget, skipped, logger, defrag)?;
        }
    }

    Ok(())
}


/// Opens an inode read-only for fingerprinting. A record whose path or
/// file is already gone is stale: the row is dropped and `None` returned.
fn open_for_hashing(
    store: &mut TrackingStore,
    vols: &VolSet,
    inode: &InodeRow,
    logger: &mut Logger,
) -> anyhow::Result<Option<File>>
{
    let vol = match vols.get(inode.vol_id) {
        Some(vol) => vol,
        None => bail!("inode {} belongs to a volume outside this run", inode.ino),
    };

    let path = match btrfs::lookup_ino_path_one(vol.fd(), inode.ino) {
        Ok(path) => path,
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
            store.delete_inode(inode.key())?;
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    match btrfs::fopenat(vol.fd(), &path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
            logger.log(1, &format!("file {} vanished before hashing", path.display()));
            store.delete_inode(inode.key())?;
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}


/// Castagnoli CRC of the file's head prefix; the cheapest content
/// fingerprint, computed before the extent map is even looked at.
pub fn mini_hash(mut file: &File) -> io::Result<u32>
{
    let mut buf = [0u8; MINI_HASH_SPAN];

    file.seek(SeekFrom::Start(0))?;

    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(crc::crc32::checksum_castagnoli(&buf[..filled]))
}


/// Castagnoli CRC over the file's extent tuples. Files that already share
/// all their extents hash identically, which is the point: such pairs can
/// be recognised without reading any content.
pub fn fiemap_hash(file: &File) -> anyhow::Result<u32>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let mut hash: u32 = 0;
    for extent in fiemap::fiemap(file)? {
        let raw = bincode_opt.serialize(&fiemap::extent_tuple(&extent))?;
        hash = crc::crc32::update(hash, &crc::crc32::CASTAGNOLI_TABLE, &raw);
    }

    Ok(hash)
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TrackingStore;
    use uuid::Uuid;

    mod windows {
        use super::*;

        fn seeded() -> (TrackingStore, i64)
        {
            let mut store = TrackingStore::open_in_memory().unwrap();
            let (fs_id, _) = store.get_or_create_fs(&Uuid::from_bytes([1; 16])).unwrap();
            let (vol_id, _) = store.get_or_create_volume(fs_id, 256).unwrap();

            for (ino, size) in [(300, 4096), (301, 4096), (302, 8192), (303, 8192), (304, 12288)] {
                store.upsert_inode(vol_id, ino, size).unwrap();
            }

            (store, vol_id)
        }

        #[test]
        fn pages_step_down_and_finish_with_an_empty_span()
        {
            let (store, vol_id) = seeded();
            let mut windows = SizeWindows::new(12288, 1);

            let page = windows.next_page(&store, &[vol_id]).unwrap().unwrap();
            assert_eq!((page.high, page.low), (12288, 8192));
            assert_eq!(page.groups.len(), 1);
            assert_eq!(page.groups[0].size, 8192);

            let page = windows.next_page(&store, &[vol_id]).unwrap().unwrap();
            assert_eq!((page.high, page.low), (8191, 4096));
            assert_eq!(page.groups[0].size, 4096);

            // The tail page is empty and runs down to zero.
            let page = windows.next_page(&store, &[vol_id]).unwrap().unwrap();
            assert_eq!((page.high, page.low), (4095, 0));
            assert!(page.groups.is_empty());

            assert!(windows.next_page(&store, &[vol_id]).unwrap().is_none());
        }

        #[test]
        fn window_bookkeeping_clears_spans_and_restores_skips()
        {
            let (mut store, vol_id) = seeded();
            let mut windows = SizeWindows::new(12288, WINDOW_SIZE);

            // One page holds everything; pretend the deduper skipped 302.
            let page = windows.next_page(&store, &[vol_id]).unwrap().unwrap();
            assert_eq!((page.high, page.low), (12288, 4096));

            store.clear_updates(&[vol_id], page.low, page.high).unwrap();
            store
                .set_has_updates(InodeKey { vol_id, ino: 302 }, true)
                .unwrap();
            store.commit().unwrap();

            // The singleton 12288 was inside the span and got cleared too.
            let flag = |ino| {
                store
                    .inode(InodeKey { vol_id, ino })
                    .unwrap()
                    .unwrap()
                    .has_updates
            };
            assert!(!flag(304));
            assert!(!flag(300));
            assert!(flag(302));

            // Next run: only the revived group comes back.
            let groups = store.size_groups_page(&[vol_id], u64::MAX, 10).unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].size, 8192);
        }

        #[test]
        fn empty_store_never_pages()
        {
            let store = TrackingStore::open_in_memory().unwrap();
            let mut windows = SizeWindows::new(0, WINDOW_SIZE);

            let page = windows.next_page(&store, &[]).unwrap().unwrap();
            assert!(page.groups.is_empty());
            assert!(windows.next_page(&store, &[]).unwrap().is_none());
        }
    }


    mod hashing {
        use super::*;
        use std::io::Write;

        fn file_with(content: &[u8]) -> File
        {
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(content).unwrap();
            f
        }

        #[test]
        fn mini_hash_is_stable_and_position_independent()
        {
            let data = vec![0x5au8; MINI_HASH_SPAN * 2];
            let a = file_with(&data);
            let b = file_with(&data);

            let first = mini_hash(&a).unwrap();
            assert_eq!(first, mini_hash(&b).unwrap());
            // A second pass over the same file must rewind.
            assert_eq!(first, mini_hash(&a).unwrap());
        }

        #[test]
        fn mini_hash_sees_only_the_head()
        {
            let mut data = vec![1u8; MINI_HASH_SPAN * 2];
            let a = file_with(&data);
            data[MINI_HASH_SPAN] = 2;
            let b = file_with(&data);

            assert_eq!(mini_hash(&a).unwrap(), mini_hash(&b).unwrap());
        }

        #[test]
        fn mini_hash_differs_within_the_head()
        {
            let mut data = vec![1u8; MINI_HASH_SPAN];
            let a = file_with(&data);
            data[0] = 2;
            let b = file_with(&data);

            assert_ne!(mini_hash(&a).unwrap(), mini_hash(&b).unwrap());
        }

        #[test]
        fn mini_hash_handles_short_files()
        {
            let a = file_with(b"tiny");
            let b = file_with(b"tiny");

            assert_eq!(mini_hash(&a).unwrap(), mini_hash(&b).unwrap());
        }
    }
}
