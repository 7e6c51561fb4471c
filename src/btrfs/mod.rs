use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{c_void, CString, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use bincode::{DefaultOptions, Options};
use uuid::Uuid;

pub mod fiemap;
mod ioctl;
#[macro_use]
mod macros;

pub use ioctl::{
    parse_inode_item,
    tree_search,
    InodeItem,
    SearchHeader,
    SearchItem,
    SearchKey,
    BTRFS_FIRST_FREE_OBJECTID,
    BTRFS_INODE_ITEM_KEY,
};

use ioctl::{
    ioctl_raw,
    invalid_data,
    le_u64_at,
    DataContainerHeader,
    FsInfoArgs,
    InoLookupArgs,
    InoPathArgs,
    RootRef,
    BTRFS_IOC_CLONE,
    BTRFS_IOC_DEFRAG,
    BTRFS_IOC_FS_INFO,
    BTRFS_IOC_INO_LOOKUP,
    BTRFS_IOC_INO_PATHS,
    BTRFS_ROOT_BACKREF_KEY,
    BTRFS_ROOT_ITEM_KEY,
    BTRFS_ROOT_SUBVOL_RDONLY,
    BTRFS_ROOT_TREE_OBJECTID,
    BTRFS_FS_TREE_OBJECTID,
    DATA_CONTAINER_HEADER_SIZE,
    FS_IMMUTABLE_FL,
    FS_IOC_GETFLAGS,
    FS_IOC_SETFLAGS,
    ROOT_ITEM_FLAGS_OFFSET,
    ROOT_ITEM_GENERATION_OFFSET,
    ROOT_REF_SIZE,
};

/// Records requested per tree-search batch.
pub const SEARCH_BATCH: u32 = 4096;


/// The UUID identifying the filesystem an open directory belongs to.
pub fn fsid(fd: RawFd) -> io::Result<Uuid>
{
    let mut args = FsInfoArgs::zeroed();
    ioctl_raw(fd, BTRFS_IOC_FS_INFO, &mut args as *mut FsInfoArgs as *mut c_void)?;

    Ok(Uuid::from_bytes(args.fsid))
}


/// The root id of the subvolume tree containing the open directory.
pub fn root_id(fd: RawFd) -> io::Result<u64>
{
    let mut args = InoLookupArgs {
        treeid: 0,
        objectid: BTRFS_FIRST_FREE_OBJECTID,
        name: [0; 4080],
    };
    ioctl_raw(fd, BTRFS_IOC_INO_LOOKUP, &mut args as *mut InoLookupArgs as *mut c_void)?;

    Ok(args.treeid)
}


/// The generation recorded in the subvolume's root item, bumped by every
/// committed transaction that touches the subvolume.
pub fn root_generation(fd: RawFd) -> io::Result<u64>
{
    let rid = root_id(fd)?;

    let mut key = SearchKey::new(BTRFS_ROOT_TREE_OBJECTID);
    key.min_objectid = rid;
    key.max_objectid = rid;
    key.min_type = BTRFS_ROOT_ITEM_KEY;
    key.max_type = BTRFS_ROOT_ITEM_KEY;

    let mut generation = None;

    loop {
        let items = tree_search(fd, &key, SEARCH_BATCH)?;
        let last = match items.last() {
            Some(item) => item.header,
            None => break,
        };

        for item in &items {
            if item.header.item_type != BTRFS_ROOT_ITEM_KEY || item.header.objectid != rid {
                continue;
            }
            if let Some(gen) = le_u64_at(&item.data, ROOT_ITEM_GENERATION_OFFSET) {
                generation = Some(generation.unwrap_or(0).max(gen));
            }
        }

        key.advance_past(&last);
    }

    generation.ok_or_else(|| invalid_data(format!("no root item for root {}", rid)))
}


/// Reporting view of one subvolume in the root tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootInfo {
    pub path: PathBuf,
    pub is_frozen: bool,
}


/// A read-only snapshot of the subvolume tree: root id to path within the
/// filesystem plus the read-only flag. Used for reporting.
pub fn read_root_tree(fd: RawFd) -> io::Result<BTreeMap<u64, RootInfo>>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let mut key = SearchKey::new(BTRFS_ROOT_TREE_OBJECTID);
    key.min_type = BTRFS_ROOT_ITEM_KEY;
    key.max_type = BTRFS_ROOT_BACKREF_KEY;

    let mut frozen: BTreeMap<u64, bool> = BTreeMap::new();
    let mut refs: BTreeMap<u64, RootLink> = BTreeMap::new();

    loop {
        let items = tree_search(fd, &key, SEARCH_BATCH)?;
        let last = match items.last() {
            Some(item) => item.header,
            None => break,
        };

        for item in &items {
            match item.header.item_type {
                BTRFS_ROOT_ITEM_KEY => {
                    let id = item.header.objectid;
                    if id != BTRFS_FS_TREE_OBJECTID && id < BTRFS_FIRST_FREE_OBJECTID {
                        continue;
                    }
                    let flags = le_u64_at(&item.data, ROOT_ITEM_FLAGS_OFFSET).unwrap_or(0);
                    frozen.insert(id, flags & BTRFS_ROOT_SUBVOL_RDONLY != 0);
                }
                BTRFS_ROOT_BACKREF_KEY => {
                    let root_ref: RootRef =
                        bincode_opt.deserialize(&item.data).map_err(invalid_data)?;
                    let name_end = ROOT_REF_SIZE + root_ref.name_len as usize;
                    let name = item
                        .data
                        .get(ROOT_REF_SIZE..name_end)
                        .ok_or_else(|| invalid_data("root backref name out of bounds"))?;

                    let parent = item.header.offset;
                    // The directory holding the subvolume, relative to the
                    // top of the parent subvolume.
                    let dir = ino_lookup(fd, parent, root_ref.dirid)?;

                    refs.insert(item.header.objectid, RootLink {
                        parent,
                        dir,
                        name: OsString::from_vec(name.to_vec()),
                    });
                }
                _ => {}
            }
        }

        key.advance_past(&last);
    }

    let paths = resolve_root_paths(&refs);

    let mut out = BTreeMap::new();
    for (id, path) in paths {
        out.insert(id, RootInfo {
            path,
            is_frozen: frozen.get(&id).copied().unwrap_or(false),
        });
    }

    Ok(out)
}


/// A subvolume's link into its parent: which subvolume, in which directory,
/// under which name.
#[derive(Clone, Debug)]
struct RootLink {
    parent: u64,
    dir: PathBuf,
    name: OsString,
}


/// Joins backref links into full paths. The top-level tree is `/`;
/// subvolumes whose parent chain left the tree (deleted parents) are
/// dropped.
fn resolve_root_paths(refs: &BTreeMap<u64, RootLink>) -> BTreeMap<u64, PathBuf>
{
    let mut paths: BTreeMap<u64, PathBuf> = BTreeMap::new();
    paths.insert(BTRFS_FS_TREE_OBJECTID, PathBuf::from("/"));

    // Parent ids are not ordered relative to children, so iterate until a
    // whole pass resolves nothing new.
    loop {
        let mut progressed = false;

        for (&id, link) in refs {
            if paths.contains_key(&id) {
                continue;
            }
            let base = match paths.get(&link.parent) {
                Some(p) => p.clone(),
                None => continue,
            };

            paths.insert(id, base.join(&link.dir).join(&link.name));
            progressed = true;
        }

        if !progressed {
            break;
        }
    }

    paths
}


/// Path of an inode within the given tree, as INO_LOOKUP reports it: a
/// directory prefix with a trailing slash, or empty for the tree's top.
fn ino_lookup(fd: RawFd, treeid: u64, objectid: u64) -> io::Result<PathBuf>
{
    let mut args = InoLookupArgs { treeid, objectid, name: [0; 4080] };
    ioctl_raw(fd, BTRFS_IOC_INO_LOOKUP, &mut args as *mut InoLookupArgs as *mut c_void)?;

    let len = args.name.iter().position(|&b| b == 0).unwrap_or(args.name.len());

    Ok(PathBuf::from(OsString::from_vec(args.name[..len].to_vec())))
}


/// One valid path of an inode, relative to the subvolume the fd is in.
/// ENOENT when the inode no longer exists.
pub fn lookup_ino_path_one(fd: RawFd, ino: u64) -> io::Result<PathBuf>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let mut buf = vec![0u8; 4096];
    let mut args = InoPathArgs::new(ino, &mut buf);
    ioctl_raw(fd, BTRFS_IOC_INO_PATHS, &mut args as *mut InoPathArgs as *mut c_void)?;

    let header: DataContainerHeader = bincode_opt
        .deserialize(&buf[..DATA_CONTAINER_HEADER_SIZE])
        .map_err(invalid_data)?;
    if header.elem_cnt == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    // The val array holds offsets relative to its own start.
    let val = &buf[DATA_CONTAINER_HEADER_SIZE..];
    let first: u64 = bincode_opt.deserialize(&val[..8]).map_err(invalid_data)?;
    let path = val
        .get(first as usize..)
        .ok_or_else(|| invalid_data("ino path offset out of bounds"))?;
    let len = path.iter().position(|&b| b == 0).unwrap_or(path.len());

    Ok(PathBuf::from(OsString::from_vec(path[..len].to_vec())))
}


/// Opens a path relative to an open directory, read-only.
pub fn fopenat(dirfd: RawFd, path: &Path) -> io::Result<File>
{
    openat(dirfd, path, libc::O_RDONLY)
}


/// Opens a path relative to an open directory, read-write.
pub fn fopenat_rw(dirfd: RawFd, path: &Path) -> io::Result<File>
{
    openat(dirfd, path, libc::O_RDWR)
}


fn openat(dirfd: RawFd, path: &Path, flags: libc::c_int) -> io::Result<File>
{
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    let fd = unsafe { libc::openat(dirfd, cpath.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { File::from_raw_fd(fd) })
}


/// Clones the whole of `src` over `dest`, sharing extents. With
/// `check_first`, a destination that already shares all of the source's
/// extents is left alone and `false` is returned.
pub fn clone_data(dest: &File, src: &File, check_first: bool) -> io::Result<bool>
{
    if check_first && fiemap::same_extents(dest, src)? {
        return Ok(false);
    }

    let ret = unsafe { libc::ioctl(dest.as_raw_fd(), BTRFS_IOC_CLONE as _, src.as_raw_fd()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(true)
}


/// Best-effort whole-file defragmentation.
pub fn defragment(fd: RawFd) -> io::Result<()>
{
    ioctl_raw(fd, BTRFS_IOC_DEFRAG, std::ptr::null_mut())
}


fn get_flags(fd: RawFd) -> io::Result<libc::c_long>
{
    let mut flags: libc::c_long = 0;
    ioctl_raw(fd, FS_IOC_GETFLAGS, &mut flags as *mut libc::c_long as *mut c_void)?;

    Ok(flags)
}


fn set_flags(fd: RawFd, mut flags: libc::c_long) -> io::Result<()>
{
    ioctl_raw(fd, FS_IOC_SETFLAGS, &mut flags as *mut libc::c_long as *mut c_void)
}


/// Scoped immutability over a set of open files.
///
/// Acquisition sets the immutable attribute on every fd that does not
/// already carry it and records which fds had writers in other processes
/// at that moment. Dropping the guard restores the previous attributes on
/// every path out, unwinding included.
#[derive(Debug)]
pub struct ImmutableFds {
    restore: Vec<(RawFd, libc::c_long)>,
    in_write_use: BTreeSet<RawFd>,
}

impl ImmutableFds {
    pub fn acquire(fds: &[RawFd]) -> io::Result<Self>
    {
        let mut guard = Self {
            restore: Vec::new(),
            in_write_use: BTreeSet::new(),
        };

        // A failure partway through drops `guard`, clearing what was set.
        for &fd in fds {
            let flags = get_flags(fd)?;
            if flags & FS_IMMUTABLE_FL == 0 {
                set_flags(fd, flags | FS_IMMUTABLE_FL)?;
                guard.restore.push((fd, flags));
            }
        }

        guard.in_write_use = fds_in_write_use(fds)?;

        Ok(guard)
    }

    /// The fds whose inodes had writers elsewhere when the attribute was
    /// set; their contents cannot be assumed stable.
    pub fn fds_in_write_use(&self) -> &BTreeSet<RawFd>
    {
        &self.in_write_use
    }
}

impl Drop for ImmutableFds {
    fn drop(&mut self)
    {
        for &(fd, flags) in self.restore.iter().rev() {
            let _ = set_flags(fd, flags);
        }
    }
}


/// Which of the given fds point at inodes some other process holds open
/// for writing. Identities come from fstat, open modes from fdinfo.
fn fds_in_write_use(fds: &[RawFd]) -> io::Result<BTreeSet<RawFd>>
{
    let mut ours: BTreeMap<(u64, u64), Vec<RawFd>> = BTreeMap::new();
    for &fd in fds {
        ours.entry(fstat_dev_ino(fd)?).or_default().push(fd);
    }

    let own_pid = std::process::id().to_string();
    let mut hit = BTreeSet::new();

    for entry in fs::read_dir("/proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if name == own_pid || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        let fd_dir = entry.path().join("fd");
        let listing = match fs::read_dir(&fd_dir) {
            Ok(l) => l,
            // Other users' processes, or a process that just exited.
            Err(_) => continue,
        };

        for fd_entry in listing.flatten() {
            let meta = match fs::metadata(fd_entry.path()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let matched = match ours.get(&(meta.dev(), meta.ino())) {
                Some(m) => m,
                None => continue,
            };

            let info_path = entry.path().join("fdinfo").join(fd_entry.file_name());
            let info = match fs::read_to_string(&info_path) {
                Ok(i) => i,
                Err(_) => continue,
            };
            if fdinfo_has_write(&info) {
                hit.extend(matched.iter().copied());
            }
        }
    }

    Ok(hit)
}


/// Whether an fdinfo dump shows an access mode other than read-only.
fn fdinfo_has_write(info: &str) -> bool
{
    for line in info.lines() {
        if let Some(rest) = line.strip_prefix("flags:") {
            if let Ok(flags) = libc::c_int::from_str_radix(rest.trim(), 8) {
                return flags & libc::O_ACCMODE != libc::O_RDONLY;
            }
        }
    }

    false
}


fn fstat_dev_ino(fd: RawFd) -> io::Result<(u64, u64)>
{
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((st.st_dev as u64, st.st_ino as u64))
}


// Tests.
