use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use anyhow::{bail, Context as _};
use sha1::{Digest, Sha1};

use crate::btrfs::{self, ImmutableFds};
use crate::logger::Logger;
use crate::scan::VolSet;
use crate::store::{Cohort, InodeKey, TrackingStore};

/// Read chunk for hashing and comparison.
pub const BUFSIZE: usize = 8192;


/// Open-file budget against RLIMIT_NOFILE. A cohort needs two
/// descriptors per file on top of what the process reserves for itself;
/// the soft limit may be raised up to the hard limit, never beyond.
#[derive(Clone, Copy, Debug)]
pub struct FdBudget {
    soft: u64,
    hard: u64,
    reserved: u64,
}

enum Fit {
    Fits,
    Raise(u64),
    Exceeded,
}

impl FdBudget {
    pub fn from_rlimit(reserved: u64) -> io::Result<Self>
    {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            soft: limit.rlim_cur as u64,
            hard: limit.rlim_max as u64,
            reserved,
        })
    }

    pub fn required(&self, cohort_len: usize) -> u64
    {
        2 * cohort_len as u64 + self.reserved
    }

    fn check(&self, cohort_len: usize) -> Fit
    {
        let need = self.required(cohort_len);
        if need <= self.soft {
            Fit::Fits
        } else if need <= self.hard {
            Fit::Raise(need)
        } else {
            Fit::Exceeded
        }
    }

    /// Makes room for a cohort, raising the soft limit when the hard
    /// limit allows. `false` means the cohort cannot be processed.
    pub fn ensure(&mut self, cohort_len: usize) -> io::Result<bool>
    {
        let need = match self.check(cohort_len) {
            Fit::Fits => return Ok(true),
            Fit::Exceeded => return Ok(false),
            Fit::Raise(need) => need,
        };

        let limit = libc::rlimit {
            rlim_cur: need as libc::rlim_t,
            rlim_max: self.hard as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } < 0 {
            return Err(io::Error::last_os_error());
        }
        self.soft = need;

        Ok(true)
    }

    pub fn limits(&self) -> (u64, u64)
    {
        (self.soft, self.hard)
    }
}


/// Verifies and deduplicates one cohort: files of equal size whose head
/// prefix and extent map hashes matched.
///
/// Everything is opened read-write up front; the clone source can only
/// be picked once the content hash is in. Under the immutability guard
/// each file is hashed, re-checked against its tracked identity, bucketed
/// by digest, byte-compared against the bucket head and cloned. Skipped
/// inodes are reported back through `skipped` so the caller can restore
/// their pending flag.
pub fn dedup_cohort(
    store: &mut TrackingStore,
    vols: &VolSet,
    fs_id: i64,
    cohort: &Cohort,
    budget: &mut FdBudget,
    skipped: &mut Vec<InodeKey>,
    logger: &mut Logger,
    defrag: bool,
) -> anyhow::Result<()>
{
    if !budget.ensure(cohort.inodes.len())? {
        let (soft, hard) = budget.limits();
        logger.log(0, &format!(
            "too many duplicates ({} at size {}), would bring us over the \
             open files limit ({}, {})",
            cohort.inodes.len(), cohort.size, soft, hard,
        ));
        for inode in &cohort.inodes {
            if inode.has_updates {
                skipped.push(inode.key());
            }
        }
        return Ok(());
    }

    // Open pass. Stale rows drop out, transient losers get skipped.
    let mut files: Vec<(File, InodeKey, PathBuf)> = Vec::new();
    for inode in &cohort.inodes {
        let vol = match vols.get(inode.vol_id) {
            Some(vol) => vol,
            None => bail!("inode {} belongs to a volume outside this run", inode.ino),
        };

        let path = match btrfs::lookup_ino_path_one(vol.fd(), inode.ino) {
            Ok(path) => path,
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                store.delete_inode(inode.key())?;
                continue;
            }
            Err(err) => return Err(err).context("path lookup failed"),
        };

        let file = match btrfs::fopenat_rw(vol.fd(), &path) {
            Ok(file) => file,
            Err(err) => match err.raw_os_error() {
                Some(libc::ETXTBSY) => {
                    logger.log(0, &format!("file {} is busy, skipping", path.display()));
                    skipped.push(inode.key());
                    continue;
                }
                Some(libc::EACCES) => {
                    logger.log(0, &format!("access denied on {}, skipping", path.display()));
                    skipped.push(inode.key());
                    continue;
                }
                Some(libc::ENOENT) => {
                    logger.log(0, &format!("file {} may have moved, skipping", path.display()));
                    skipped.push(inode.key());
                    continue;
                }
                _ => return Err(err).with_context(|| format!("opening {}", path.display())),
            },
        };

        files.push((file, inode.key(), path));
    }

    if files.len() < 2 {
        return Ok(());
    }

    let fds: Vec<RawFd> = files.iter().map(|(file, ..)| file.as_raw_fd()).collect();

    // The guard is declared after `files`, so it is dropped first and the
    // attributes are restored while the fds are still open.
    let lock = ImmutableFds::acquire(&fds).context("setting the immutable attribute")?;

    // Hash pass, with the re-checks that close the races left open
    // between lookup and lock.
    let mut by_hash: BTreeMap<[u8; 20], Vec<usize>> = BTreeMap::new();
    for (index, (file, key, path)) in files.iter().enumerate() {
        if lock.fds_in_write_use().contains(&file.as_raw_fd()) {
            logger.log(0, &format!("file {} is in use, skipping", path.display()));
            skipped.push(*key);
            continue;
        }

        let (digest, read_size) = sha1_of(file)?;

        let meta = file.metadata()?;
        let vol = match vols.get(key.vol_id) {
            Some(vol) => vol,
            None => bail!("inode {} belongs to a volume outside this run", key.ino),
        };
        if meta.ino() != key.ino || meta.dev() != vol.st_dev {
            skipped.push(*key);
            continue;
        }

        if read_size != cohort.size {
            if read_size < store.volume(key.vol_id)?.size_cutoff {
                // Left in place, this row would breed spurious groups in
                // every future run.
                store.delete_inode(*key)?;
            } else {
                skipped.push(*key);
            }
            continue;
        }

        by_hash.entry(digest).or_default().push(index);
    }

    // Clone pass.
    for bucket in by_hash.values() {
        if bucket.len() < 2 {
            continue;
        }

        let (src_file, src_key, src_path) = &files[bucket[0]];
        if defrag {
            if let Err(err) = btrfs::defragment(src_file.as_raw_fd()) {
                logger.log(1, &format!(
                    "defragmenting {} failed: {}", src_path.display(), err,
                ));
            }
        }

        let mut successful: Vec<InodeKey> = Vec::new();
        for &dst in &bucket[1..] {
            let (dst_file, dst_key, dst_path) = &files[dst];

            if !cmp_files(src_file, dst_file)? {
                logger.log(0, &format!(
                    "files differ after an equal content hash: {} {}",
                    src_path.display(), dst_path.display(),
                ));
                panic!(
                    "content hash collision between {:?} and {:?}",
                    src_path, dst_path,
                );
            }

            if btrfs::clone_data(dst_file, src_file, true)? {
                logger.log(0, &format!(
                    "deduplicated: {} {}", src_path.display(), dst_path.display(),
                ));
                successful.push(*dst_key);
            } else {
                logger.log(1, &format!(
                    "did not deduplicate (same extents): {} {}",
                    src_path.display(), dst_path.display(),
                ));
            }
        }

        if !successful.is_empty() {
            let mut participants = vec![*src_key];
            participants.extend(successful);
            store.record_event(fs_id, cohort.size, &participants)?;
            store.commit()?;
        }
    }

    Ok(())
}


/// Streams the whole file into SHA-1, returning the digest and the byte
/// count, which doubles as the final file position.
fn sha1_of(mut file: &File) -> io::Result<([u8; 20], u64)>
{
    let mut hasher = Sha1::new();
    let mut buf = [0u8; BUFSIZE];
    let mut total: u64 = 0;

    file.seek(SeekFrom::Start(0))?;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize().into(), total))
}


/// Bytewise comparison of two open files.
pub fn cmp_files(mut a: &File, mut b: &File) -> io::Result<bool>
{
    let mut buf_a = [0u8; BUFSIZE];
    let mut buf_b = [0u8; BUFSIZE];

    a.seek(SeekFrom::Start(0))?;
    b.seek(SeekFrom::Start(0))?;

    loop {
        let n_a = read_full(a, &mut buf_a)?;
        let n_b = read_full(b, &mut buf_b)?;

        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}


/// Reads until the buffer is full or the file ends, so both sides of a
/// comparison advance in lockstep regardless of short reads.
fn read_full(mut file: &File, buf: &mut [u8]) -> io::Result<usize>
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(filled)
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;

    mod budget {
        use super::*;

        fn budget(soft: u64, hard: u64, reserved: u64) -> FdBudget
        {
            FdBudget { soft, hard, reserved }
        }

        #[test]
        fn required_doubles_and_reserves()
        {
            assert_eq!(budget(0, 0, 8).required(3), 14);
            assert_eq!(budget(0, 0, 10).required(4096), 8202);
        }

        #[test]
        fn small_cohorts_fit()
        {
            assert!(matches!(budget(1024, 4096, 8).check(100), Fit::Fits));
        }

        #[test]
        fn the_soft_limit_is_raised_when_the_hard_one_allows()
        {
            match budget(1024, 4096, 8).check(1000) {
                Fit::Raise(need) => assert_eq!(need, 2008),
                _ => panic!("expected a raise"),
            }
        }

        #[test]
        fn the_hard_limit_is_final()
        {
            assert!(matches!(budget(1024, 1024, 8).check(4096), Fit::Exceeded));
        }
    }


    mod compare {
        use super::*;
        use std::io::Write;
        use rand::RngCore;

        fn file_with(content: &[u8]) -> File
        {
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(content).unwrap();
            f
        }

        fn random_bytes(len: usize) -> Vec<u8>
        {
            let mut data = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut data);
            data
        }

        #[test]
        fn equal_files_compare_equal()
        {
            let data = random_bytes(3 * BUFSIZE + 17);
            let a = file_with(&data);
            let b = file_with(&data);

            assert!(cmp_files(&a, &b).unwrap());
        }

        #[test]
        fn first_byte_difference_is_caught()
        {
            let mut data = random_bytes(2 * BUFSIZE);
            let a = file_with(&data);
            data[0] ^= 0xff;
            let b = file_with(&data);

            assert!(!cmp_files(&a, &b).unwrap());
        }

        #[test]
        fn last_byte_difference_is_caught()
        {
            let mut data = random_bytes(2 * BUFSIZE + 1);
            let a = file_with(&data);
            let last = data.len() - 1;
            data[last] ^= 0xff;
            let b = file_with(&data);

            assert!(!cmp_files(&a, &b).unwrap());
        }

        #[test]
        fn length_difference_is_caught()
        {
            let data = random_bytes(BUFSIZE);
            let a = file_with(&data);
            let b = file_with(&data[..BUFSIZE - 1]);

            assert!(!cmp_files(&a, &b).unwrap());
        }

        #[test]
        fn empty_files_are_equal()
        {
            let a = file_with(b"");
            let b = file_with(b"");

            assert!(cmp_files(&a, &b).unwrap());
        }

        #[test]
        fn comparison_rewinds_after_hashing()
        {
            let data = random_bytes(BUFSIZE);
            let a = file_with(&data);
            let b = file_with(&data);

            // Leave both positions at EOF, as the hash pass does.
            let (digest_a, size_a) = sha1_of(&a).unwrap();
            let (digest_b, _) = sha1_of(&b).unwrap();
            assert_eq!(digest_a, digest_b);
            assert_eq!(size_a, data.len() as u64);

            assert!(cmp_files(&a, &b).unwrap());
        }
    }
}
