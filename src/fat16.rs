//! Minimal FAT16-style filesystem over a single container file.
//!
//! The container starts with a 16-byte boot record, keeps its allocation
//! table in one cluster and its directory entries in a flat chain of
//! clusters — no subdirectories, permissions or journaling. Every mutating
//! operation is write-through: refresh, mutate in memory, persist, return.
//!
//! All container I/O is abstracted behind `ContainerStore`, making the
//! module unit-testable with an in-memory mock.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

// ─── Container store abstraction ───────────────────────────────────────────────

/// Positional byte access to the container. Implementations must fail a read
/// that cannot fill `buf` completely with `ErrorKind::UnexpectedEof`.
pub trait ContainerStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&mut self) -> io::Result<u64>;
}

// ─── Constants ─────────────────────────────────────────────────────────────────

pub const BOOT_RECORD_LEN: usize = 16;
pub const DIR_ENTRY_LEN:   usize = 128;
pub const NAME_LEN:        usize = 112;
const FAT_ENTRY_LEN:       usize = 4;

pub const FAT_FREE: u32 = 0x0000;
pub const FAT_EOC:  u32 = 0xFFFF;

/// The only entry type the engine ever creates.
pub const TYPE_FILE: u32 = 0;

const FAT_INDEX:  u32 = 1;
const ROOT_INDEX: u32 = 2;

const MIN_FS_SIZE: u32 = 5 * 1024 * 1024;
const MAX_FS_SIZE: u32 = 50 * 1024 * 1024;
const MIN_CLUSTER_SIZE: u32 = 8 * 1024;
const MAX_CLUSTER_SIZE: u32 = 16 * 1024;

// ─── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file does not exist")]
    NotFound,
    #[error("not enough free space in system")]
    InsufficientSpace,
    #[error("no free cluster or directory slot available")]
    NoSpace,
    #[error("invalid filesystem geometry")]
    InvalidSize,
    #[error("cannot copy a non-file entry")]
    NotAFile,
    #[error("container is corrupt or truncated")]
    CorruptContainer,
    #[error("container I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Container reads must always fill the buffer; a short read means the
/// container was truncated behind our back.
fn read_exact_at<S: ContainerStore>(
    store: &mut S,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), FsError> {
    store.read_at(offset, buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FsError::CorruptContainer,
        _ => FsError::Io(e),
    })
}

fn u32_at(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ─── Boot record ───────────────────────────────────────────────────────────────

/// 16-byte geometry header at offset 0: four little-endian u32s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord {
    pub cluster_size: u32,
    pub fs_size:      u32,
    pub root_index:   u32,
    pub fat_index:    u32,
}

impl BootRecord {
    pub fn for_geometry(cluster_size: u32, fs_size: u32) -> Self {
        Self { cluster_size, fs_size, root_index: ROOT_INDEX, fat_index: FAT_INDEX }
    }

    pub fn num_clusters(&self) -> u32 {
        self.fs_size / self.cluster_size
    }

    /// Geometry sanity. Beyond the size ranges, the FAT must fit inside its
    /// single cluster (4 bytes per cluster), so no cluster can ever lack a
    /// persisted FAT slot.
    pub fn is_sane(&self) -> bool {
        if self.cluster_size < MIN_CLUSTER_SIZE || self.cluster_size > MAX_CLUSTER_SIZE {
            return false;
        }
        if self.fs_size < MIN_FS_SIZE || self.fs_size > MAX_FS_SIZE {
            return false;
        }
        if self.cluster_size as usize % DIR_ENTRY_LEN != 0 {
            return false;
        }
        let n = self.num_clusters();
        if n > self.cluster_size || n * FAT_ENTRY_LEN as u32 > self.cluster_size {
            return false;
        }
        self.fat_index != 0
            && self.root_index != 0
            && self.fat_index != self.root_index
            && self.fat_index < n
            && self.root_index < n
    }

    fn decode(raw: &[u8; BOOT_RECORD_LEN]) -> Self {
        Self {
            cluster_size: u32_at(raw, 0),
            fs_size:      u32_at(raw, 4),
            root_index:   u32_at(raw, 8),
            fat_index:    u32_at(raw, 12),
        }
    }

    fn encode(&self) -> [u8; BOOT_RECORD_LEN] {
        let mut raw = [0u8; BOOT_RECORD_LEN];
        raw[0..4].copy_from_slice(&self.cluster_size.to_le_bytes());
        raw[4..8].copy_from_slice(&self.fs_size.to_le_bytes());
        raw[8..12].copy_from_slice(&self.root_index.to_le_bytes());
        raw[12..16].copy_from_slice(&self.fat_index.to_le_bytes());
        raw
    }
}

// ─── Directory entry wire format ───────────────────────────────────────────────

/// Fixed 128-byte record: 112 name bytes (NUL-terminated), then four
/// little-endian u32s (start cluster, size, type, creation time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name:     String,
    pub index:    u32,
    pub size:     u32,
    pub kind:     u32,
    pub creation: u32,
}

impl DirEntry {
    /// A slot is free when its first name byte is 0x00 (never used) or
    /// 0xFF (tombstoned).
    fn is_vacant(raw: &[u8]) -> bool {
        raw[0] == 0x00 || raw[0] == 0xFF
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            name:     String::from_utf8_lossy(name_field(raw)).into_owned(),
            index:    u32_at(raw, NAME_LEN),
            size:     u32_at(raw, NAME_LEN + 4),
            kind:     u32_at(raw, NAME_LEN + 8),
            creation: u32_at(raw, NAME_LEN + 12),
        }
    }

    fn encode(&self) -> [u8; DIR_ENTRY_LEN] {
        let mut raw = [0u8; DIR_ENTRY_LEN];
        let name = clamp_name(&self.name);
        raw[..name.len()].copy_from_slice(name);
        raw[NAME_LEN..NAME_LEN + 4].copy_from_slice(&self.index.to_le_bytes());
        raw[NAME_LEN + 4..NAME_LEN + 8].copy_from_slice(&self.size.to_le_bytes());
        raw[NAME_LEN + 8..NAME_LEN + 12].copy_from_slice(&self.kind.to_le_bytes());
        raw[NAME_LEN + 12..NAME_LEN + 16].copy_from_slice(&self.creation.to_le_bytes());
        raw
    }
}

/// The stored name: bytes up to the first NUL in the 112-byte field.
fn name_field(raw: &[u8]) -> &[u8] {
    let end = raw[..NAME_LEN].iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    &raw[..end]
}

/// Names longer than the field are truncated, on write and on lookup alike,
/// so a long name always refers to the same stored entry.
fn clamp_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(NAME_LEN - 1)]
}

// ─── Filesystem session ────────────────────────────────────────────────────────

/// Space report: cluster counts plus a percentage for `df`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub total: u32,
    pub used:  u32,
    pub free:  u32,
    pub percent_used: f64,
}

pub struct Fat16<S> {
    pub store: S,
    boot: BootRecord,
    fat:  Vec<u32>,
}

impl<S: ContainerStore> Fat16<S> {
    /// Mount an existing container: parse the boot record, sanity-check the
    /// geometry against the store length, load the FAT.
    pub fn mount(mut store: S) -> Result<Self, FsError> {
        let mut raw = [0u8; BOOT_RECORD_LEN];
        read_exact_at(&mut store, 0, &mut raw)?;
        let boot = BootRecord::decode(&raw);
        if !boot.is_sane() || store.len()? < boot.fs_size as u64 {
            return Err(FsError::CorruptContainer);
        }
        let mut fs = Self {
            store,
            boot,
            fat: vec![FAT_FREE; boot.num_clusters() as usize],
        };
        fs.refresh_fat()?;
        log::info!(
            "mounted container: {} clusters of {} bytes",
            boot.num_clusters(),
            boot.cluster_size
        );
        Ok(fs)
    }

    /// Build a fresh container: zero-fill every cluster, write the boot
    /// record, reserve clusters 0, FAT and root in a fresh FAT.
    pub fn format(mut store: S, cluster_size: u32, fs_size: u32) -> Result<Self, FsError> {
        let boot = BootRecord::for_geometry(cluster_size, fs_size);
        if !boot.is_sane() {
            return Err(FsError::InvalidSize);
        }
        log::info!("initializing {} clusters of {} bytes", boot.num_clusters(), cluster_size);
        let zeros = vec![0u8; cluster_size as usize];
        for i in 0..boot.num_clusters() {
            store.write_at(i as u64 * cluster_size as u64, &zeros)?;
        }
        store.write_at(0, &boot.encode())?;
        let mut fs = Self {
            store,
            boot,
            fat: vec![FAT_FREE; boot.num_clusters() as usize],
        };
        fs.fat[0] = FAT_EOC;
        fs.fat[boot.fat_index as usize] = FAT_EOC;
        fs.fat[boot.root_index as usize] = FAT_EOC;
        fs.persist_fat()?;
        Ok(fs)
    }

    pub fn boot(&self) -> &BootRecord {
        &self.boot
    }

    pub fn cluster_size(&self) -> u32 {
        self.boot.cluster_size
    }

    pub fn num_clusters(&self) -> u32 {
        self.boot.num_clusters()
    }

    // ─── Cluster I/O ───────────────────────────────────────────────────────────

    fn cluster_offset(&self, index: u32) -> u64 {
        index as u64 * self.boot.cluster_size as u64
    }

    fn read_cluster(&mut self, index: u32) -> Result<Vec<u8>, FsError> {
        let mut buf = vec![0u8; self.boot.cluster_size as usize];
        let offset = self.cluster_offset(index);
        read_exact_at(&mut self.store, offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `bytes` at the start of a cluster. Tail bytes past `bytes.len()`
    /// keep whatever the cluster held before; `free_chain` zeroes released
    /// clusters, so a fresh allocation starts blank anyway.
    fn write_cluster(&mut self, index: u32, bytes: &[u8]) -> Result<(), FsError> {
        self.store.write_at(self.cluster_offset(index), bytes)?;
        Ok(())
    }

    // ─── FAT chain management ──────────────────────────────────────────────────

    pub fn free_clusters(&self) -> u32 {
        self.fat.iter().filter(|&&e| e == FAT_FREE).count() as u32
    }

    /// Claim the lowest-indexed free cluster and mark it end-of-chain.
    /// Lowest-index-first keeps allocation order deterministic.
    fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        for i in 1..self.boot.num_clusters() {
            if i == self.boot.fat_index || i == self.boot.root_index {
                continue;
            }
            if self.fat[i as usize] == FAT_FREE {
                self.fat[i as usize] = FAT_EOC;
                return Ok(i);
            }
        }
        Err(FsError::NoSpace)
    }

    fn extend_chain(&mut self, tail: u32) -> Result<u32, FsError> {
        let next = self.allocate_cluster()?;
        self.fat[tail as usize] = next;
        Ok(next)
    }

    fn next_in_chain(&self, index: u32) -> Result<Option<u32>, FsError> {
        match self.fat.get(index as usize).copied() {
            Some(FAT_EOC) => Ok(None),
            Some(FAT_FREE) | None => Err(FsError::CorruptContainer),
            Some(next) if (next as usize) < self.fat.len() => Ok(Some(next)),
            Some(_) => Err(FsError::CorruptContainer),
        }
    }

    /// Every cluster of the chain rooted at `start`, in chain order.
    /// A free link, an out-of-range link or a loop is corruption.
    fn collect_chain(&self, start: u32) -> Result<Vec<u32>, FsError> {
        let mut chain = Vec::new();
        let mut cur = start;
        loop {
            if chain.len() > self.fat.len() {
                return Err(FsError::CorruptContainer);
            }
            chain.push(cur);
            match self.next_in_chain(cur)? {
                Some(next) => cur = next,
                None => return Ok(chain),
            }
        }
    }

    /// Release a chain: zero each cluster on disk, then mark its entry free.
    fn free_chain(&mut self, start: u32) -> Result<(), FsError> {
        let chain = self.collect_chain(start)?;
        let zeros = vec![0u8; self.boot.cluster_size as usize];
        for cluster in chain {
            self.write_cluster(cluster, &zeros)?;
            self.fat[cluster as usize] = FAT_FREE;
        }
        Ok(())
    }

    /// Write-through of the FAT into its single on-disk cluster.
    fn persist_fat(&mut self) -> Result<(), FsError> {
        let mut region = vec![0u8; self.boot.cluster_size as usize];
        for (i, entry) in self.fat.iter().enumerate() {
            region[i * FAT_ENTRY_LEN..(i + 1) * FAT_ENTRY_LEN]
                .copy_from_slice(&entry.to_le_bytes());
        }
        let offset = self.cluster_offset(self.boot.fat_index);
        self.store.write_at(offset, &region)?;
        Ok(())
    }

    /// Read the FAT back from disk. Called before any operation that depends
    /// on state another process may have changed since the last mount.
    pub fn refresh_fat(&mut self) -> Result<(), FsError> {
        let region = self.read_cluster(self.boot.fat_index)?;
        for i in 0..self.fat.len() {
            self.fat[i] = u32_at(&region, i * FAT_ENTRY_LEN);
        }
        Ok(())
    }

    // ─── Directory table management ────────────────────────────────────────────

    fn entries_per_cluster(&self) -> usize {
        self.boot.cluster_size as usize / DIR_ENTRY_LEN
    }

    /// Linear scan of the directory chain for `name`. First match wins.
    /// Returns the record's absolute offset and its decoded entry.
    fn find_slot(&mut self, name: &str) -> Result<Option<(u64, DirEntry)>, FsError> {
        let wanted = clamp_name(name);
        for cluster in self.collect_chain(self.boot.root_index)? {
            let raw = self.read_cluster(cluster)?;
            for i in 0..self.entries_per_cluster() {
                let rec = &raw[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN];
                if DirEntry::is_vacant(rec) || name_field(rec) != wanted {
                    continue;
                }
                let offset = self.cluster_offset(cluster) + (i * DIR_ENTRY_LEN) as u64;
                return Ok(Some((offset, DirEntry::decode(rec))));
            }
        }
        Ok(None)
    }

    pub fn find_entry(&mut self, name: &str) -> Result<Option<DirEntry>, FsError> {
        Ok(self.find_slot(name)?.map(|(_, entry)| entry))
    }

    /// First vacant slot in the directory chain; grows the chain with a
    /// fresh zeroed cluster when every slot is taken.
    fn find_free_slot(&mut self) -> Result<u64, FsError> {
        let chain = self.collect_chain(self.boot.root_index)?;
        for &cluster in &chain {
            let raw = self.read_cluster(cluster)?;
            for i in 0..self.entries_per_cluster() {
                if DirEntry::is_vacant(&raw[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN]) {
                    return Ok(self.cluster_offset(cluster) + (i * DIR_ENTRY_LEN) as u64);
                }
            }
        }
        let tail = chain.last().copied().ok_or(FsError::CorruptContainer)?;
        let fresh = self.extend_chain(tail)?;
        let zeros = vec![0u8; self.boot.cluster_size as usize];
        self.write_cluster(fresh, &zeros)?;
        self.persist_fat()?;
        Ok(self.cluster_offset(fresh))
    }

    /// Write the entry over a same-named slot if one exists, else into a
    /// free slot. Never touches the entry's data chain.
    fn upsert_entry(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        let offset = match self.find_slot(&entry.name)? {
            Some((offset, _)) => offset,
            None => self.find_free_slot()?,
        };
        self.store.write_at(offset, &entry.encode())?;
        Ok(())
    }

    fn remove_entry_at(&mut self, offset: u64) -> Result<(), FsError> {
        self.store.write_at(offset, &[0u8; DIR_ENTRY_LEN])?;
        Ok(())
    }

    // ─── File operations ───────────────────────────────────────────────────────

    /// `touch`: a fresh zero-byte file. An existing file of the same name is
    /// deleted first, so its whole chain returns to the free pool.
    pub fn create_empty(&mut self, name: &str) -> Result<(), FsError> {
        self.refresh_fat()?;
        if self.find_slot(name)?.is_some() {
            self.delete(name)?;
        }
        let start = self.allocate_cluster()?;
        self.persist_fat()?;
        self.upsert_entry(&DirEntry {
            name: name.to_string(),
            index: start,
            size: 0,
            kind: TYPE_FILE,
            creation: unix_now(),
        })
    }

    /// `cat`: one chunk per cluster in chain order, the last chunk cut to
    /// the declared file size. Each call starts a fresh walk.
    pub fn read_all(&mut self, name: &str) -> Result<FileChunks<'_, S>, FsError> {
        self.refresh_fat()?;
        let entry = self.find_entry(name)?.ok_or(FsError::NotFound)?;
        let chain = self.collect_chain(entry.index)?;
        Ok(FileChunks {
            chain: chain.into_iter(),
            remaining: entry.size as u64,
            fs: self,
        })
    }

    /// Stream `total_size` bytes from `source` into a fresh chain, then
    /// publish the directory entry. An interrupted write leaves an orphaned
    /// chain with no directory reference, never a half-described file.
    pub fn write_new<R: Read>(
        &mut self,
        name: &str,
        source: &mut R,
        total_size: u64,
    ) -> Result<(), FsError> {
        if total_size > u32::MAX as u64 {
            return Err(FsError::InsufficientSpace);
        }
        self.refresh_fat()?;
        let start = self.allocate_cluster()?;
        let cluster_size = self.boot.cluster_size as u64;
        let mut cur = start;
        let mut remaining = total_size;
        while remaining > 0 {
            let take = cluster_size.min(remaining) as usize;
            let mut buf = vec![0u8; take];
            source.read_exact(&mut buf)?;
            self.write_cluster(cur, &buf)?;
            remaining -= take as u64;
            if remaining > 0 {
                cur = self.extend_chain(cur)?;
            }
        }
        self.persist_fat()?;
        self.upsert_entry(&DirEntry {
            name: name.to_string(),
            index: start,
            size: total_size as u32,
            kind: TYPE_FILE,
            creation: unix_now(),
        })
    }

    /// `rm`: release the data chain, tombstone the entry.
    pub fn delete(&mut self, name: &str) -> Result<(), FsError> {
        self.refresh_fat()?;
        let (offset, entry) = self.find_slot(name)?.ok_or(FsError::NotFound)?;
        self.free_chain(entry.index)?;
        self.remove_entry_at(offset)?;
        self.persist_fat()?;
        Ok(())
    }

    /// Host file → embedded file. Space is checked before anything is
    /// touched, so a failed copy never leaves a partial destination.
    pub fn copy_in(&mut self, host_path: &Path, name: &str) -> Result<(), FsError> {
        self.refresh_fat()?;
        let mut file = std::fs::File::open(host_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::Io(e),
        })?;
        let size = file.metadata()?.len();
        if (self.free_clusters() as u64) * (self.boot.cluster_size as u64) < size {
            return Err(FsError::InsufficientSpace);
        }
        if self.find_slot(name)?.is_some() {
            self.delete(name)?;
        }
        self.write_new(name, &mut file, size)
    }

    /// Embedded file → host file. The host destination is truncated.
    pub fn copy_out(&mut self, name: &str, host_path: &Path) -> Result<(), FsError> {
        self.refresh_fat()?;
        let entry = self.find_entry(name)?.ok_or(FsError::NotFound)?;
        if entry.kind != TYPE_FILE {
            return Err(FsError::NotAFile);
        }
        let chain = self.collect_chain(entry.index)?;
        let mut out = std::fs::File::create(host_path)?;
        let cluster_size = self.boot.cluster_size as u64;
        let mut remaining = entry.size as u64;
        for cluster in chain {
            if remaining == 0 {
                break;
            }
            let take = cluster_size.min(remaining) as usize;
            let buf = self.read_cluster(cluster)?;
            out.write_all(&buf[..take])?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Embedded file → embedded file, cluster by cluster into a new chain.
    pub fn copy_within(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        if clamp_name(src) == clamp_name(dst) {
            return Ok(());
        }
        self.refresh_fat()?;
        let entry = self.find_entry(src)?.ok_or(FsError::NotFound)?;
        if entry.kind != TYPE_FILE {
            return Err(FsError::NotAFile);
        }
        if (self.free_clusters() as u64) * (self.boot.cluster_size as u64) < entry.size as u64 {
            return Err(FsError::InsufficientSpace);
        }
        if self.find_slot(dst)?.is_some() {
            self.delete(dst)?;
        }
        let chain = self.collect_chain(entry.index)?;
        let cluster_size = self.boot.cluster_size as u64;
        let start = self.allocate_cluster()?;
        let mut cur = start;
        let mut remaining = entry.size as u64;
        let mut first = true;
        for cluster in chain {
            if remaining == 0 {
                break;
            }
            if !first {
                cur = self.extend_chain(cur)?;
            }
            first = false;
            let take = cluster_size.min(remaining) as usize;
            let buf = self.read_cluster(cluster)?;
            self.write_cluster(cur, &buf[..take])?;
            remaining -= take as u64;
        }
        self.persist_fat()?;
        self.upsert_entry(&DirEntry {
            name: dst.to_string(),
            index: start,
            size: entry.size,
            kind: entry.kind,
            creation: unix_now(),
        })
    }

    /// `ls`: live entries in on-disk order, no sorting.
    pub fn list(&mut self) -> Result<Vec<DirEntry>, FsError> {
        self.refresh_fat()?;
        let mut entries = Vec::new();
        for cluster in self.collect_chain(self.boot.root_index)? {
            let raw = self.read_cluster(cluster)?;
            for i in 0..self.entries_per_cluster() {
                let rec = &raw[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN];
                if DirEntry::is_vacant(rec) {
                    continue;
                }
                entries.push(DirEntry::decode(rec));
            }
        }
        Ok(entries)
    }

    // ─── Usage accounting & dumps ──────────────────────────────────────────────

    /// `df` numbers. `used + free == total` by construction.
    pub fn usage(&mut self) -> Result<Usage, FsError> {
        self.refresh_fat()?;
        let total = self.boot.num_clusters();
        let free = self.free_clusters();
        let used = total - free;
        Ok(Usage {
            total,
            used,
            free,
            percent_used: used as f64 / total as f64 * 100.0,
        })
    }

    /// `printDT`: every slot of every directory cluster, vacant ones included.
    pub fn dump_directory(&mut self) -> Result<Vec<DirEntry>, FsError> {
        self.refresh_fat()?;
        let mut slots = Vec::new();
        for cluster in self.collect_chain(self.boot.root_index)? {
            let raw = self.read_cluster(cluster)?;
            for i in 0..self.entries_per_cluster() {
                slots.push(DirEntry::decode(&raw[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN]));
            }
        }
        Ok(slots)
    }

    /// `printFAT`: the non-free FAT entries with their link targets.
    pub fn dump_fat(&mut self) -> Result<Vec<(u32, u32)>, FsError> {
        self.refresh_fat()?;
        Ok(self
            .fat
            .iter()
            .enumerate()
            .filter(|&(_, &e)| e != FAT_FREE)
            .map(|(i, &e)| (i as u32, e))
            .collect())
    }
}

// ─── Lazy file reader ──────────────────────────────────────────────────────────

/// Chunked walk over one file's cluster chain. Finite, not restartable;
/// `read_all` builds a fresh one per call.
pub struct FileChunks<'a, S> {
    fs: &'a mut Fat16<S>,
    chain: std::vec::IntoIter<u32>,
    remaining: u64,
}

impl<S: ContainerStore> Iterator for FileChunks<'_, S> {
    type Item = Result<Vec<u8>, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let cluster = self.chain.next()?;
        let take = (self.fs.boot.cluster_size as u64).min(self.remaining) as usize;
        match self.fs.read_cluster(cluster) {
            Ok(mut buf) => {
                buf.truncate(take);
                self.remaining -= take as u64;
                Some(Ok(buf))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // ── Mock container backed by Vec<u8> ─────────────────────────────────────

    struct MemStore(Vec<u8>);

    impl ContainerStore for MemStore {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            let off = offset as usize;
            if off + buf.len() > self.0.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of container",
                ));
            }
            buf.copy_from_slice(&self.0[off..off + buf.len()]);
            Ok(())
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
            let off = offset as usize;
            if off + buf.len() > self.0.len() {
                self.0.resize(off + buf.len(), 0);
            }
            self.0[off..off + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn len(&mut self) -> io::Result<u64> {
            Ok(self.0.len() as u64)
        }
    }

    const CS: u32 = 8 * 1024;
    const FS_SIZE: u32 = 5 * 1024 * 1024; // 640 clusters, 637 allocatable

    fn make_fs() -> Fat16<MemStore> {
        Fat16::format(MemStore(Vec::new()), CS, FS_SIZE).unwrap()
    }

    fn patterned(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_bytes(fs: &mut Fat16<MemStore>, name: &str, data: &[u8]) {
        let mut cursor = data;
        fs.write_new(name, &mut cursor, data.len() as u64).unwrap();
    }

    fn read_back(fs: &mut Fat16<MemStore>, name: &str) -> Vec<u8> {
        fs.read_all(name)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
            .concat()
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fat16_test_{}_{}", std::process::id(), tag))
    }

    // ── Boot record & geometry ───────────────────────────────────────────────

    #[test]
    fn boot_record_wire_roundtrip() {
        let boot = BootRecord::for_geometry(CS, FS_SIZE);
        assert_eq!(BootRecord::decode(&boot.encode()), boot);
        assert_eq!(boot.fat_index, 1);
        assert_eq!(boot.root_index, 2);
        assert_eq!(boot.num_clusters(), 640);
    }

    #[test]
    fn format_rejects_out_of_range_sizes() {
        assert!(matches!(
            Fat16::format(MemStore(Vec::new()), CS, 4 * 1024 * 1024),
            Err(FsError::InvalidSize)
        ));
        assert!(matches!(
            Fat16::format(MemStore(Vec::new()), CS, 51 * 1024 * 1024),
            Err(FsError::InvalidSize)
        ));
        assert!(matches!(
            Fat16::format(MemStore(Vec::new()), 4 * 1024, FS_SIZE),
            Err(FsError::InvalidSize)
        ));
        assert!(matches!(
            Fat16::format(MemStore(Vec::new()), 32 * 1024, FS_SIZE),
            Err(FsError::InvalidSize)
        ));
    }

    #[test]
    fn format_rejects_fat_that_cannot_fit() {
        // 50 MiB / 8 KiB = 6400 clusters; 6400 * 4 bytes won't fit in one
        // 8 KiB FAT cluster.
        assert!(matches!(
            Fat16::format(MemStore(Vec::new()), 8 * 1024, 50 * 1024 * 1024),
            Err(FsError::InvalidSize)
        ));
        // 16 KiB clusters leave room: 3200 * 4 <= 16384.
        assert!(Fat16::format(MemStore(Vec::new()), 16 * 1024, 50 * 1024 * 1024).is_ok());
    }

    #[test]
    fn mount_reads_back_formatted_geometry() {
        let fs = make_fs();
        let fs = Fat16::mount(fs.store).unwrap();
        assert_eq!(fs.boot().cluster_size, CS);
        assert_eq!(fs.boot().fs_size, FS_SIZE);
        assert_eq!(fs.num_clusters(), 640);
    }

    #[test]
    fn mount_rejects_garbage_header() {
        let store = MemStore(vec![0xABu8; 64 * 1024]);
        assert!(matches!(Fat16::mount(store), Err(FsError::CorruptContainer)));
    }

    #[test]
    fn mount_rejects_truncated_container() {
        let mut fs = make_fs();
        fs.store.0.truncate(FS_SIZE as usize / 2);
        assert!(matches!(
            Fat16::mount(fs.store),
            Err(FsError::CorruptContainer)
        ));
    }

    #[test]
    fn format_reserves_system_clusters() {
        let mut fs = make_fs();
        let fat = fs.dump_fat().unwrap();
        assert_eq!(fat, vec![(0, FAT_EOC), (1, FAT_EOC), (2, FAT_EOC)]);
        assert_eq!(fs.usage().unwrap().used, 3);
    }

    // ── Directory entry wire format ──────────────────────────────────────────

    #[test]
    fn dir_entry_wire_roundtrip() {
        let entry = DirEntry {
            name: "notes.txt".to_string(),
            index: 7,
            size: 1234,
            kind: TYPE_FILE,
            creation: 1_700_000_000,
        };
        assert_eq!(DirEntry::decode(&entry.encode()), entry);
    }

    #[test]
    fn vacant_slot_markers() {
        assert!(DirEntry::is_vacant(&[0x00; DIR_ENTRY_LEN]));
        assert!(DirEntry::is_vacant(&[0xFF; DIR_ENTRY_LEN]));
        let live = DirEntry {
            name: "a".to_string(),
            index: 3,
            size: 0,
            kind: TYPE_FILE,
            creation: 0,
        };
        assert!(!DirEntry::is_vacant(&live.encode()));
    }

    #[test]
    fn long_names_truncate_consistently() {
        let long = "x".repeat(200);
        let mut fs = make_fs();
        fs.create_empty(&long).unwrap();
        // Lookup with the same over-long name resolves to the stored entry.
        let entry = fs.find_entry(&long).unwrap().unwrap();
        assert_eq!(entry.name.len(), NAME_LEN - 1);
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    #[test]
    fn allocation_is_lowest_index_first() {
        let mut fs = make_fs();
        fs.create_empty("a").unwrap();
        fs.create_empty("b").unwrap();
        assert_eq!(fs.find_entry("a").unwrap().unwrap().index, 3);
        assert_eq!(fs.find_entry("b").unwrap().unwrap().index, 4);
    }

    #[test]
    fn freed_clusters_are_reused_lowest_first() {
        let mut fs = make_fs();
        fs.create_empty("a").unwrap();
        fs.create_empty("b").unwrap();
        fs.delete("a").unwrap();
        fs.create_empty("c").unwrap();
        assert_eq!(fs.find_entry("c").unwrap().unwrap().index, 3);
    }

    #[test]
    fn allocation_fails_with_no_space() {
        let mut fs = make_fs();
        let mut err = None;
        for i in 0..usize::MAX {
            match fs.create_empty(&format!("f{i}")) {
                Ok(()) => {}
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(err, Some(FsError::NoSpace)));
        assert_eq!(fs.usage().unwrap().free, 0);
    }

    // ── Round trips ──────────────────────────────────────────────────────────

    #[test]
    fn roundtrip_empty_file() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "empty", &[]);
        assert_eq!(read_back(&mut fs, "empty"), Vec::<u8>::new());
        let entry = fs.find_entry("empty").unwrap().unwrap();
        assert_eq!(entry.size, 0);
        // Even a zero-byte file roots a terminal cluster.
        assert_eq!(fs.collect_chain(entry.index).unwrap().len(), 1);
    }

    #[test]
    fn roundtrip_exactly_one_cluster() {
        let data = patterned(CS as usize);
        let mut fs = make_fs();
        write_bytes(&mut fs, "one", &data);
        assert_eq!(read_back(&mut fs, "one"), data);
        let entry = fs.find_entry("one").unwrap().unwrap();
        assert_eq!(fs.collect_chain(entry.index).unwrap().len(), 1);
    }

    #[test]
    fn roundtrip_one_byte_over_a_cluster() {
        let data = patterned(CS as usize + 1);
        let mut fs = make_fs();
        write_bytes(&mut fs, "two", &data);
        assert_eq!(read_back(&mut fs, "two"), data);
        let entry = fs.find_entry("two").unwrap().unwrap();
        assert_eq!(fs.collect_chain(entry.index).unwrap().len(), 2);
    }

    #[test]
    fn read_all_missing_file_is_not_found() {
        let mut fs = make_fs();
        assert!(matches!(fs.read_all("ghost"), Err(FsError::NotFound)));
    }

    // ── Delete ───────────────────────────────────────────────────────────────

    #[test]
    fn delete_missing_is_not_found_and_leaves_bytes_unchanged() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "keep", &patterned(100));
        let before = fs.store.0.clone();
        assert!(matches!(fs.delete("ghost"), Err(FsError::NotFound)));
        assert_eq!(fs.store.0, before);
    }

    #[test]
    fn delete_zeroes_released_clusters() {
        let data = patterned(2 * CS as usize + 5);
        let mut fs = make_fs();
        write_bytes(&mut fs, "gone", &data);
        let gone_index = fs.find_entry("gone").unwrap().unwrap().index;
        let chain = fs.collect_chain(gone_index).unwrap();
        assert_eq!(chain.len(), 3);
        fs.delete("gone").unwrap();
        for cluster in chain {
            let raw = fs.read_cluster(cluster).unwrap();
            assert!(raw.iter().all(|&b| b == 0), "cluster {cluster} not zeroed");
        }
        assert!(fs.find_entry("gone").unwrap().is_none());
    }

    #[test]
    fn tombstoned_slot_is_reused() {
        let mut fs = make_fs();
        fs.create_empty("a").unwrap();
        fs.create_empty("b").unwrap();
        fs.delete("a").unwrap();
        fs.create_empty("c").unwrap();
        let names: Vec<_> = fs.list().unwrap().into_iter().map(|e| e.name).collect();
        // "c" landed in "a"'s vacated slot, ahead of "b" in on-disk order.
        assert_eq!(names, vec!["c", "b"]);
    }

    // ── Chain invariants ─────────────────────────────────────────────────────

    #[test]
    fn live_chains_are_disjoint() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "a", &patterned(3 * CS as usize));
        write_bytes(&mut fs, "b", &patterned(2 * CS as usize + 9));
        write_bytes(&mut fs, "c", &[1, 2, 3]);
        let mut seen = std::collections::HashSet::new();
        for entry in fs.list().unwrap() {
            for cluster in fs.collect_chain(entry.index).unwrap() {
                assert!(seen.insert(cluster), "cluster {cluster} in two chains");
            }
        }
    }

    #[test]
    fn usage_accounting_tracks_creates() {
        let mut fs = make_fs();
        let baseline = fs.usage().unwrap();
        for i in 0..5 {
            fs.create_empty(&format!("f{i}")).unwrap();
        }
        let after = fs.usage().unwrap();
        assert_eq!(after.free, baseline.free - 5);
        assert_eq!(after.used + after.free, after.total);
    }

    #[test]
    fn usage_used_plus_free_is_total() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "a", &patterned(4 * CS as usize));
        fs.create_empty("b").unwrap();
        fs.delete("a").unwrap();
        let usage = fs.usage().unwrap();
        assert_eq!(usage.used + usage.free, usage.total);
        assert_eq!(usage.total, 640);
    }

    #[test]
    fn touch_existing_frees_old_chain() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "a", &patterned(3 * CS as usize));
        let a_index = fs.find_entry("a").unwrap().unwrap().index;
        let old_chain = fs.collect_chain(a_index).unwrap();
        assert_eq!(old_chain.len(), 3);
        let baseline = fs.usage().unwrap();
        fs.create_empty("a").unwrap();
        let entry = fs.find_entry("a").unwrap().unwrap();
        assert_eq!(entry.size, 0);
        assert_eq!(fs.collect_chain(entry.index).unwrap().len(), 1);
        // Three clusters released, one fresh terminal cluster claimed.
        assert_eq!(fs.usage().unwrap().free, baseline.free + 2);
    }

    // ── Directory growth ─────────────────────────────────────────────────────

    #[test]
    fn directory_chain_grows_when_slots_run_out() {
        let mut fs = make_fs();
        let slots = fs.entries_per_cluster(); // 64 with 8 KiB clusters
        for i in 0..slots + 1 {
            fs.create_empty(&format!("f{i}")).unwrap();
        }
        assert_eq!(fs.list().unwrap().len(), slots + 1);
        let dir_chain = fs.collect_chain(fs.boot().root_index).unwrap();
        assert_eq!(dir_chain.len(), 2);
        // slots+1 data clusters plus the extra directory cluster.
        assert_eq!(fs.usage().unwrap().used, 3 + slots as u32 + 1 + 1);
    }

    // ── Copy: host ↔ embedded ────────────────────────────────────────────────

    #[test]
    fn copy_in_then_out_roundtrips_through_host() {
        let data = patterned(20_000);
        let src = temp_path("copy_src");
        let dst = temp_path("copy_dst");
        std::fs::write(&src, &data).unwrap();

        let mut fs = make_fs();
        fs.copy_in(&src, "blob").unwrap();
        assert_eq!(read_back(&mut fs, "blob"), data);
        fs.copy_out("blob", &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), data);

        std::fs::remove_file(&src).unwrap();
        std::fs::remove_file(&dst).unwrap();
    }

    #[test]
    fn copy_in_missing_host_file_is_not_found() {
        let mut fs = make_fs();
        assert!(matches!(
            fs.copy_in(&temp_path("no_such_host_file"), "x"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn copy_exactly_filling_free_space_succeeds() {
        let mut fs = make_fs();
        let free_bytes = fs.usage().unwrap().free as u64 * CS as u64;
        let src = temp_path("exact_fit");
        std::fs::write(&src, patterned(free_bytes as usize)).unwrap();
        fs.copy_in(&src, "full").unwrap();
        assert_eq!(fs.usage().unwrap().free, 0);
        assert_eq!(fs.find_entry("full").unwrap().unwrap().size as u64, free_bytes);
        std::fs::remove_file(&src).unwrap();
    }

    #[test]
    fn copy_one_byte_over_free_space_fails_clean() {
        let mut fs = make_fs();
        let baseline = fs.usage().unwrap();
        let src = temp_path("one_over");
        std::fs::write(&src, patterned(baseline.free as usize * CS as usize + 1)).unwrap();
        assert!(matches!(
            fs.copy_in(&src, "toobig"),
            Err(FsError::InsufficientSpace)
        ));
        assert_eq!(fs.usage().unwrap(), baseline);
        assert!(fs.find_entry("toobig").unwrap().is_none());
        std::fs::remove_file(&src).unwrap();
    }

    // ── Copy: embedded ↔ embedded ────────────────────────────────────────────

    #[test]
    fn copy_within_duplicates_content_on_disjoint_chains() {
        let data = patterned(2 * CS as usize + 100);
        let mut fs = make_fs();
        write_bytes(&mut fs, "src", &data);
        fs.copy_within("src", "dst").unwrap();
        assert_eq!(read_back(&mut fs, "dst"), data);
        let src_index = fs.find_entry("src").unwrap().unwrap().index;
        let src_chain = fs.collect_chain(src_index).unwrap();
        let dst_index = fs.find_entry("dst").unwrap().unwrap().index;
        let dst_chain = fs.collect_chain(dst_index).unwrap();
        assert!(src_chain.iter().all(|c| !dst_chain.contains(c)));
    }

    #[test]
    fn copy_within_onto_itself_is_a_no_op() {
        let data = patterned(300);
        let mut fs = make_fs();
        write_bytes(&mut fs, "same", &data);
        let before = fs.usage().unwrap();
        fs.copy_within("same", "same").unwrap();
        assert_eq!(read_back(&mut fs, "same"), data);
        assert_eq!(fs.usage().unwrap(), before);
    }

    #[test]
    fn copy_within_replaces_existing_destination() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "src", &patterned(CS as usize + 1));
        write_bytes(&mut fs, "dst", &patterned(77));
        fs.copy_within("src", "dst").unwrap();
        assert_eq!(read_back(&mut fs, "dst"), patterned(CS as usize + 1));
        // Exactly one directory entry per name.
        let names: Vec<_> = fs.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names.iter().filter(|n| *n == "dst").count(), 1);
    }

    // ── Corruption surfacing ─────────────────────────────────────────────────

    #[test]
    fn broken_chain_link_is_corrupt() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "a", &patterned(CS as usize + 1));
        let start = fs.find_entry("a").unwrap().unwrap().index;
        fs.fat[start as usize] = FAT_FREE;
        fs.persist_fat().unwrap();
        assert!(matches!(fs.read_all("a"), Err(FsError::CorruptContainer)));
    }

    #[test]
    fn chain_loop_is_corrupt() {
        let mut fs = make_fs();
        write_bytes(&mut fs, "a", &patterned(CS as usize + 1));
        let start = fs.find_entry("a").unwrap().unwrap().index;
        fs.fat[start as usize] = start;
        fs.persist_fat().unwrap();
        assert!(matches!(fs.read_all("a"), Err(FsError::CorruptContainer)));
    }

    // ── End to end (10 MiB / 8 KiB geometry) ─────────────────────────────────

    #[test]
    fn end_to_end_touch_copy_list_remove() {
        let mut fs = Fat16::format(MemStore(Vec::new()), 8192, 10 * 1024 * 1024).unwrap();
        assert_eq!(fs.num_clusters(), 1280);
        let baseline = fs.usage().unwrap();

        fs.create_empty("a.txt").unwrap();
        let listed = fs.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.txt");
        assert_eq!(listed[0].size, 0);
        assert_eq!(listed[0].kind, TYPE_FILE);
        assert!(listed[0].creation > 0);

        let src = temp_path("end_to_end");
        std::fs::write(&src, patterned(20_000)).unwrap();
        fs.copy_in(&src, "a.txt").unwrap();
        std::fs::remove_file(&src).unwrap();

        let listed = fs.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 20_000);
        // ceil(20000 / 8192) = 3 clusters.
        assert_eq!(fs.collect_chain(listed[0].index).unwrap().len(), 3);
        assert_eq!(fs.usage().unwrap().used, baseline.used + 3);

        fs.delete("a.txt").unwrap();
        assert!(fs.list().unwrap().is_empty());
        assert_eq!(fs.usage().unwrap().free, baseline.free);
    }
}
