use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use serde::Serialize;

use crate::btrfs::BTRFS_FIRST_FREE_OBJECTID;


/// One btrfs mount as reported by the kernel mount table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BtrfsMount {
    pub device: PathBuf,
    pub subvol_path: String,
    pub mountpoint: PathBuf,
}


/// Where the host's mounted btrfs volumes are. Injected where needed so
/// reporting can be fed from something else entirely in tests.
pub trait HostEnum {
    /// Mounted btrfs volumes, grouped by canonical backing device.
    fn mounted_btrfs(&mut self) -> io::Result<&BTreeMap<PathBuf, Vec<BtrfsMount>>>;
}


/// Host enumeration backed by /proc/self/mountinfo, read once per run.
#[derive(Debug, Default)]
pub struct ProcMounts {
    cached: Option<BTreeMap<PathBuf, Vec<BtrfsMount>>>,
}

impl ProcMounts {
    pub fn new() -> Self
    {
        Self::default()
    }
}

impl HostEnum for ProcMounts {
    fn mounted_btrfs(&mut self) -> io::Result<&BTreeMap<PathBuf, Vec<BtrfsMount>>>
    {
        if self.cached.is_none() {
            let text = fs::read_to_string("/proc/self/mountinfo")?;
            let mut map: BTreeMap<PathBuf, Vec<BtrfsMount>> = BTreeMap::new();

            for line in text.lines() {
                if let Some(mount) = parse_mountinfo_line(line) {
                    let dev = fs::canonicalize(&mount.device)
                        .unwrap_or_else(|_| mount.device.clone());
                    map.entry(dev).or_default().push(mount);
                }
            }

            self.cached = Some(map);
        }

        Ok(self.cached.get_or_insert_with(BTreeMap::new))
    }
}


/// Parses one mountinfo line into a btrfs mount, if it is one.
///
/// The line is space-separated: mount root is field 3, mountpoint field 4;
/// after the `-` separator come the filesystem type and its source device.
fn parse_mountinfo_line(line: &str) -> Option<BtrfsMount>
{
    let items: Vec<&str> = line.split(' ').collect();

    let sep = items.iter().position(|&item| item == "-")?;
    if *items.get(sep + 1)? != "btrfs" {
        return None;
    }

    Some(BtrfsMount {
        subvol_path: (*items.get(3)?).to_string(),
        mountpoint: PathBuf::from(items.get(4)?),
        device: PathBuf::from(items.get(sep + 2)?),
    })
}


/// True when the open directory sits at the top of a subvolume: the
/// first usable objectid doubles as the root directory's inode number.
pub fn is_subvolume(dir: &File) -> io::Result<bool>
{
    Ok(dir.metadata()?.ino() == BTRFS_FIRST_FREE_OBJECTID)
}


// Tests.
