use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::{ior, iow, iowr};


// Source: https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/btrfs.h

pub const BTRFS_IOCTL_MAGIC: u64 = 0x94;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

pub const BTRFS_INODE_ITEM_KEY: u32 = 1;
pub const BTRFS_ROOT_ITEM_KEY: u32 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u32 = 144;

/// `flags` bit of a root item marking a read-only (frozen) subvolume.
pub const BTRFS_ROOT_SUBVOL_RDONLY: u64 = 1 << 0;

const INO_LOOKUP_PATH_MAX: usize = 4080;
const VOL_NAME_MAX: usize = 4088;

pub const BTRFS_IOC_DEFRAG: u64 = iow!(BTRFS_IOCTL_MAGIC, 2, VolArgs);
pub const BTRFS_IOC_CLONE: u64 = iow!(BTRFS_IOCTL_MAGIC, 9, libc::c_int);
pub const BTRFS_IOC_TREE_SEARCH: u64 = iowr!(BTRFS_IOCTL_MAGIC, 17, SearchArgs);
pub const BTRFS_IOC_INO_LOOKUP: u64 = iowr!(BTRFS_IOCTL_MAGIC, 18, InoLookupArgs);
pub const BTRFS_IOC_FS_INFO: u64 = ior!(BTRFS_IOCTL_MAGIC, 31, FsInfoArgs);
pub const BTRFS_IOC_INO_PATHS: u64 = iowr!(BTRFS_IOCTL_MAGIC, 35, InoPathArgs);

pub const FS_IOC_GETFLAGS: u64 = ior!(0x66, 1, libc::c_long);
pub const FS_IOC_SETFLAGS: u64 = iow!(0x66, 2, libc::c_long);

/// Inode attribute bit: the kernel rejects all writes while it is set.
pub const FS_IMMUTABLE_FL: libc::c_long = 0x10;


/// Search key of the generic B-tree search ioctl.
///
/// The kernel treats the `min_*` fields as an iteration cursor over
/// `(objectid, type, offset)` tuple order, not as per-field filters; the
/// caller advances the cursor past the last returned header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

impl SearchKey {
    /// A key spanning the whole of `tree_id`. Tree id 0 addresses the tree
    /// of the subvolume the ioctl is issued on.
    pub fn new(tree_id: u64) -> Self
    {
        Self {
            tree_id,
            min_objectid: 0,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: 0,
            max_type: u32::MAX,
            nr_items: 0,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        }
    }

    /// Advance the cursor just past the given header.
    pub fn advance_past(&mut self, header: &SearchHeader)
    {
        self.min_objectid = header.objectid;
        self.min_type = header.item_type;
        self.min_offset = header.offset + 1;
    }
}


pub const SEARCH_BUF_SIZE: usize = 4096 - std::mem::size_of::<SearchKey>();

#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; SEARCH_BUF_SIZE],
}


/// Header preceding every record in a tree-search reply buffer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

pub const SEARCH_HEADER_SIZE: usize = 32;


/// Leading fields of a btrfs inode item, little-endian on the wire.
/// Timestamps and reserved fields follow; they are left unparsed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}


/// Fixed part of a root backref item; the child's name follows it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name_len: u16,
}

pub const ROOT_REF_SIZE: usize = 18;

/// Byte offset of the `generation` field inside a root item, right after
/// the embedded inode item.
pub const ROOT_ITEM_GENERATION_OFFSET: usize = 160;

/// Byte offset of the `flags` field inside a root item.
pub const ROOT_ITEM_FLAGS_OFFSET: usize = 208;


#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; INO_LOOKUP_PATH_MAX],
}

#[repr(C)]
pub struct InoPathArgs {
    pub inum: u64,
    pub size: u64,
    reserved: [u64; 4],
    pub fspath: u64,
}

impl InoPathArgs {
    pub fn new(inum: u64, buf: &mut [u8]) -> Self
    {
        Self {
            inum,
            size: buf.len() as u64,
            reserved: [0; 4],
            fspath: buf.as_mut_ptr() as u64,
        }
    }
}

/// Header of the container the INO_PATHS reply is written into. The `val`
/// array follows: `elem_cnt` u64 offsets, each relative to the start of
/// the array, pointing at NUL-terminated path strings.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataContainerHeader {
    pub bytes_left: u32,
    pub bytes_missing: u32,
    pub elem_cnt: u32,
    pub elem_missed: u32,
}

pub const DATA_CONTAINER_HEADER_SIZE: usize = 16;


#[repr(C)]
pub struct VolArgs {
    pub fd: i64,
    pub name: [u8; VOL_NAME_MAX],
}

#[repr(C)]
pub struct FsInfoArgs {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; 16],
    pub nodesize: u32,
    pub sectorsize: u32,
    pub clone_alignment: u32,
    reserved: [u8; 980],
}

impl FsInfoArgs {
    pub fn zeroed() -> Self
    {
        // All-zero is a valid initial value for every field.
        unsafe { std::mem::zeroed() }
    }
}


/// Issues an ioctl, turning a negative return into the calling errno.
pub(super) fn ioctl_raw(fd: RawFd, request: u64, arg: *mut c_void) -> io::Result<()>
{
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}


pub(super) fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}


/// One record returned by a tree search: its header and raw payload.
#[derive(Clone, Debug)]
pub struct SearchItem {
    pub header: SearchHeader,
    pub data: Vec<u8>,
}


/// One batch of the generic tree-search ioctl. An empty result means the
/// iteration is over; otherwise the caller advances `key` past the last
/// returned header and calls again.
pub fn tree_search(fd: RawFd, key: &SearchKey, nr_items: u32) -> io::Result<Vec<SearchItem>>
{
    let mut args = SearchArgs { key: *key, buf: [0; SEARCH_BUF_SIZE] };
    args.key.nr_items = nr_items;

    ioctl_raw(fd, BTRFS_IOC_TREE_SEARCH, &mut args as *mut SearchArgs as *mut c_void)?;

    parse_search_buf(&args.buf, args.key.nr_items)
}


/// Splits a search reply buffer into records.
pub fn parse_search_buf(buf: &[u8], nr_items: u32) -> io::Result<Vec<SearchItem>>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let mut items = Vec::with_capacity(nr_items as usize);
    let mut offset = 0;

    for _ in 0..nr_items {
        let header: SearchHeader = bincode_opt
            .deserialize(buf.get(offset..).ok_or_else(|| invalid_data("truncated search reply"))?)
            .map_err(invalid_data)?;
        offset += SEARCH_HEADER_SIZE;

        let end = offset + header.len as usize;
        let data = buf
            .get(offset..end)
            .ok_or_else(|| invalid_data("search item payload out of bounds"))?
            .to_vec();
        offset = end;

        items.push(SearchItem { header, data });
    }

    Ok(items)
}


/// Reads the `(generation, size, mode)` carrying prefix of an inode item.
pub fn parse_inode_item(data: &[u8]) -> io::Result<InodeItem>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    bincode_opt.deserialize(data).map_err(invalid_data)
}


/// Reads a little-endian u64 at a byte offset of an item payload. Short
/// payloads (older item formats) read as `None`.
pub fn le_u64_at(data: &[u8], offset: usize) -> Option<u64>
{
    let raw = data.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}


// Tests.
