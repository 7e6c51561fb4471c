use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::iowr;
use super::ioctl::ioctl_raw;


// Source: https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/fiemap.h

pub const FIEMAP_FLAG_SYNC: u32 = 0x1;
pub const FIEMAP_EXTENT_LAST: u32 = 0x1;

/// Extents fetched per ioctl call.
const EXTENT_BATCH: usize = 128;


/// One entry of a file's logical-to-physical extent map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FiemapExtent {
    pub fe_logical: u64,
    pub fe_physical: u64,
    pub fe_length: u64,
    fe_reserved64: [u64; 2],
    pub fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// The fixed header of the FIEMAP argument; the request code is computed
/// from its size alone, the extent array is not counted.
#[repr(C)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
struct FiemapArgs {
    header: FiemapHeader,
    extents: [FiemapExtent; EXTENT_BATCH],
}

pub const FS_IOC_FIEMAP: u64 = iowr!(0x66, 11, FiemapHeader);


/// The full extent map of an open file, after syncing dirty pages so the
/// mapping reflects what is on disk.
pub fn fiemap(file: &File) -> io::Result<Vec<FiemapExtent>>
{
    let mut out: Vec<FiemapExtent> = Vec::new();
    let mut start: u64 = 0;

    loop {
        let mut args = FiemapArgs {
            header: FiemapHeader {
                fm_start: start,
                fm_length: u64::MAX - start,
                fm_flags: FIEMAP_FLAG_SYNC,
                fm_mapped_extents: 0,
                fm_extent_count: EXTENT_BATCH as u32,
                fm_reserved: 0,
            },
            extents: [FiemapExtent::default(); EXTENT_BATCH],
        };

        ioctl_raw(
            file.as_raw_fd(),
            FS_IOC_FIEMAP,
            &mut args as *mut FiemapArgs as *mut c_void,
        )?;

        let mapped = (args.header.fm_mapped_extents as usize).min(EXTENT_BATCH);
        if mapped == 0 {
            break;
        }

        out.extend_from_slice(&args.extents[..mapped]);

        let tail = out[out.len() - 1];
        if tail.fe_flags & FIEMAP_EXTENT_LAST != 0 {
            break;
        }
        start = tail.fe_logical + tail.fe_length;
    }

    Ok(out)
}


/// True when both files report identical extent tuples, meaning a clone
/// of one over the other would not change anything.
pub fn same_extents(a: &File, b: &File) -> io::Result<bool>
{
    let map_a = fiemap(a)?;
    let map_b = fiemap(b)?;

    if map_a.len() != map_b.len() {
        return Ok(false);
    }

    Ok(map_a.iter().zip(&map_b).all(|(x, y)| extent_tuple(x) == extent_tuple(y)))
}


/// The identity of an extent for sharing comparisons. The LAST marker is
/// positional, not physical, so it is masked out.
pub fn extent_tuple(e: &FiemapExtent) -> (u64, u64, u64, u32)
{
    (
        e.fe_logical,
        e.fe_physical,
        e.fe_length,
        e.fe_flags & !FIEMAP_EXTENT_LAST,
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_code()
    {
        assert_eq!(FS_IOC_FIEMAP, 0xc020_660b);
    }

    #[test]
    fn extent_struct_size()
    {
        assert_eq!(std::mem::size_of::<FiemapExtent>(), 56);
        assert_eq!(std::mem::size_of::<FiemapHeader>(), 32);
    }

    #[test]
    fn tuple_masks_the_last_marker()
    {
        let mut a = FiemapExtent::default();
        a.fe_logical = 0;
        a.fe_physical = 4096;
        a.fe_length = 8192;
        a.fe_flags = FIEMAP_EXTENT_LAST;

        let mut b = a;
        b.fe_flags = 0;

        assert_eq!(extent_tuple(&a), extent_tuple(&b));
    }
}
