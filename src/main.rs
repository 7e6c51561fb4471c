use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use clap::{Parser, Subcommand};
use serde::Serialize;

mod btrfs;
mod dedup;
mod group;
mod logger;
mod mounts;
mod scan;
mod store;

use logger::Logger;
use mounts::HostEnum;
use scan::VolSet;
use store::TrackingStore;

#[derive(Debug, Parser)]
#[clap(version, about = "Incremental deduplication for btrfs")]
struct Args {
    /// Tracking database
    #[clap(short, long, parse(from_os_str), value_name = "FILE", default_value = "btrdedup.db")]
    db: PathBuf,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, parse(from_occurrences), global = true)]
    verbose: u32,

    /// Log file
    #[clap(short, long, parse(from_os_str), value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Track new and updated files on the given volumes
    Scan {
        /// Minimum tracked file size in bytes
        #[clap(long, value_name = "BYTES")]
        size_cutoff: Option<u64>,

        /// Subvolume mount points
        #[clap(parse(from_os_str), required = true, value_name = "VOLUME")]
        volumes: Vec<PathBuf>,
    },

    /// Scan the given volumes, then deduplicate tracked files
    Dedup {
        /// Minimum tracked file size in bytes
        #[clap(long, value_name = "BYTES")]
        size_cutoff: Option<u64>,

        /// Defragment clone sources first (may unshare extents)
        #[clap(long)]
        defrag: bool,

        /// Subvolume mount points
        #[clap(parse(from_os_str), required = true, value_name = "VOLUME")]
        volumes: Vec<PathBuf>,
    },

    /// Drop all tracked inodes of the given volumes
    Forget {
        /// Subvolume mount points
        #[clap(parse(from_os_str), required = true, value_name = "VOLUME")]
        volumes: Vec<PathBuf>,
    },

    /// Show tracked filesystems, volumes and current mounts
    Show {
        /// Machine-readable output
        #[clap(long)]
        json: bool,
    },
}

fn main()
{
    let args = Args::parse();

    let mut log_file = None;

    // Create the log file in rw mode.

    if let Some(path) = &args.log_file {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);

        log_file = match f {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("error: {}: {}", &path.display(), e);
                None
            }
        };
    }

    let mut logger = Logger::new(args.verbose, log_file);

    let mut store = match TrackingStore::open(&args.db) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {}: {:#}", args.db.display(), e);
            return;
        }
    };

    let status = match args.command {
        Command::Scan { size_cutoff, volumes } => {
            cmd_scan(&mut store, &mut logger, size_cutoff, &volumes)
        }
        Command::Dedup { size_cutoff, defrag, volumes } => {
            cmd_dedup(&mut store, &mut logger, size_cutoff, defrag, &volumes)
        }
        Command::Forget { volumes } => cmd_forget(&mut store, &mut logger, &volumes),
        Command::Show { json } => cmd_show(&store, json),
    };

    if let Err(e) = status {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}


fn cmd_scan(
    store: &mut TrackingStore,
    logger: &mut Logger,
    size_cutoff: Option<u64>,
    volumes: &[PathBuf],
) -> anyhow::Result<()>
{
    for path in volumes {
        let vol = scan::open_volume(store, path, size_cutoff, logger)?;
        scan::track_updated_files(store, &vol, logger)?;
    }

    Ok(())
}


fn cmd_dedup(
    store: &mut TrackingStore,
    logger: &mut Logger,
    size_cutoff: Option<u64>,
    defrag: bool,
    volumes: &[PathBuf],
) -> anyhow::Result<()>
{
    // Extent sharing cannot cross filesystem boundaries; partition the
    // sessions by filesystem and run each set on its own.
    let mut by_fs: BTreeMap<i64, VolSet> = BTreeMap::new();
    for path in volumes {
        let vol = scan::open_volume(store, path, size_cutoff, logger)?;
        by_fs.entry(vol.fs_id).or_insert_with(VolSet::new).insert(vol);
    }

    for set in by_fs.values() {
        for vol in set.iter() {
            scan::track_updated_files(store, vol, logger)?;
        }
        group::dedup_tracked(store, set, logger, defrag)?;
    }

    Ok(())
}


fn cmd_forget(
    store: &mut TrackingStore,
    logger: &mut Logger,
    volumes: &[PathBuf],
) -> anyhow::Result<()>
{
    for path in volumes {
        let vol = scan::open_volume(store, path, None, logger)?;
        scan::forget_volume(store, &vol, logger)?;
    }

    Ok(())
}


#[derive(Debug, Serialize)]
struct VolumeReport {
    root_id: u64,
    size_cutoff: u64,
    last_tracked_generation: u64,
    tracked_inodes: u64,
    last_known_mountpoint: Option<String>,
    /// Path within the filesystem, when it is mounted right now.
    path: Option<String>,
    frozen: bool,
    /// The filesystem is reachable but no longer knows this root id.
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct FilesystemReport {
    uuid: String,
    dedup_events: u64,
    volumes: Vec<VolumeReport>,
}

#[derive(Debug, Serialize)]
struct ShowReport {
    filesystems: Vec<FilesystemReport>,
    mounted: BTreeMap<String, Vec<mounts::BtrfsMount>>,
}


fn cmd_show(store: &TrackingStore, json: bool) -> anyhow::Result<()>
{
    // Without /proc (or outside Linux entirely) the store alone still
    // makes a useful report.
    let mut host = mounts::ProcMounts::new();
    let mounted: BTreeMap<String, Vec<mounts::BtrfsMount>> = match host.mounted_btrfs() {
        Ok(map) => map
            .iter()
            .map(|(dev, mounts)| (dev.to_string_lossy().into_owned(), mounts.clone()))
            .collect(),
        Err(_) => BTreeMap::new(),
    };

    let live = live_root_trees(&mounted);

    let mut filesystems = Vec::new();
    for fs in store.filesystems()? {
        let root_info = live.get(&fs.uuid.to_string());
        let mut volumes = Vec::new();
        for vol in store.volumes_of(fs.id)? {
            let info = root_info.and_then(|tree| tree.get(&vol.root_id));
            volumes.push(VolumeReport {
                root_id: vol.root_id,
                size_cutoff: vol.size_cutoff,
                last_tracked_generation: vol.last_tracked_generation,
                tracked_inodes: store.inode_count(vol.id)?,
                last_known_mountpoint: vol.last_known_mountpoint,
                path: info.map(|i| i.path.to_string_lossy().into_owned()),
                frozen: info.map(|i| i.is_frozen).unwrap_or(false),
                deleted: root_info.is_some() && info.is_none(),
            });
        }
        filesystems.push(FilesystemReport {
            uuid: fs.uuid.to_string(),
            dedup_events: store.event_count(fs.id)?,
            volumes,
        });
    }

    let report = ShowReport { filesystems, mounted };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for fs in &report.filesystems {
        println!("UUID: {}", fs.uuid);
        if fs.dedup_events > 0 {
            println!("  {} dedup events", fs.dedup_events);
        }
        for vol in &fs.volumes {
            println!("  Volume {}", vol.root_id);
            println!(
                "    last tracked generation {} size cutoff {}",
                vol.last_tracked_generation, vol.size_cutoff,
            );
            if vol.tracked_inodes > 0 {
                println!("    {} inodes tracked", vol.tracked_inodes);
            }
            if let Some(path) = &vol.path {
                println!("    Path {}", path);
            }
            if vol.frozen {
                println!("    Frozen");
            }
            if vol.deleted {
                println!("    Deleted");
            }
            if let Some(mountpoint) = &vol.last_known_mountpoint {
                println!("    Last mounted on {}", mountpoint);
            }
        }
    }

    for (dev, mounts) in &report.mounted {
        println!("Device: {}", dev);
        for mount in mounts {
            println!("  {} mounted on {}", mount.subvol_path, mount.mountpoint.display());
        }
    }

    Ok(())
}


/// Reads the subvolume tree of every mounted btrfs filesystem we can
/// reach, keyed by filesystem UUID. Failures (not root, raced unmounts)
/// just leave a filesystem out of the live view.
fn live_root_trees(
    mounted: &BTreeMap<String, Vec<mounts::BtrfsMount>>,
) -> BTreeMap<String, BTreeMap<u64, btrfs::RootInfo>>
{
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let mut live = BTreeMap::new();

    for mounts in mounted.values() {
        let mount = match mounts.first() {
            Some(m) => m,
            None => continue,
        };
        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&mount.mountpoint);
        let dir = match dir {
            Ok(d) => d,
            Err(_) => continue,
        };
        let uuid = match btrfs::fsid(dir.as_raw_fd()) {
            Ok(u) => u,
            Err(_) => continue,
        };
        if let Ok(tree) = btrfs::read_root_tree(dir.as_raw_fd()) {
            live.insert(uuid.to_string(), tree);
        }
    }

    live
}
