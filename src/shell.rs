//! Command dispatch for the interactive shell.
//!
//! Routes each typed command to one engine operation, using the path
//! resolver to decide which arguments address the embedded filesystem.
//! Host command execution is deliberately not provided here; a command that
//! resolves to the host side gets a diagnostic instead.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::fat16::{ContainerStore, DirEntry, Fat16, FsError, Usage};
use crate::resolve::{Domain, MountPoint};

// ─── Production container backend ──────────────────────────────────────────────

/// File-backed store. The handle and the canonical path are both taken at
/// open time, so container I/O is immune to later `cd` commands.
pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, path: path.canonicalize()? })
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file, path: path.canonicalize()? })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContainerStore for FileStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

// ─── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit,
}

/// Everything one shell needs: the mounted engine, the mount path and
/// whether the user has `cd`-ed into it. Owned by the REPL, passed nowhere.
pub struct ShellSession {
    pub fs: Fat16<FileStore>,
    pub mount: MountPoint,
    pub inside_mount: bool,
    fs_name: String,
}

impl ShellSession {
    pub fn new(fs: Fat16<FileStore>, container: &str) -> Self {
        Self {
            fs,
            mount: MountPoint::new(container),
            inside_mount: false,
            fs_name: container.to_string(),
        }
    }

    /// Handle one typed line. Engine errors are printed, never fatal.
    pub fn handle_line(&mut self, line: &str) -> Outcome {
        let argv: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = argv.first() else {
            return Outcome::Continue;
        };
        match cmd {
            "exit" => return Outcome::Exit,
            "cd" => self.change_dir(argv.get(1).copied()),
            _ => {
                if let Err(e) = self.dispatch(cmd, &argv[1..]) {
                    eprintln!("{cmd}: {e}");
                }
            }
        }
        Outcome::Continue
    }

    fn dispatch(&mut self, cmd: &str, args: &[&str]) -> Result<(), FsError> {
        match cmd {
            "ls" => {
                if !self.listing_targets_mount(args) {
                    return self.host_fallthrough(cmd);
                }
                print!("{}", render_ls(&self.fs.list()?));
            }
            "df" => {
                if !self.listing_targets_mount(args) {
                    return self.host_fallthrough(cmd);
                }
                let usage = self.fs.usage()?;
                print!(
                    "{}",
                    render_df(&self.fs_name, self.mount.as_str(), self.fs.cluster_size(), usage)
                );
            }
            // Diagnostic dumps only exist inside the engine.
            "printDT" => print!("{}", render_dir_dump(&self.fs.dump_directory()?)),
            "printFAT" => print!("{}", render_fat_dump(&self.fs.dump_fat()?)),
            "touch" | "cat" | "rm" => return self.file_command(cmd, args),
            "cp" | "mv" => return self.copy_command(cmd, args),
            _ => return self.host_fallthrough(cmd),
        }
        Ok(())
    }

    /// `ls` and `df` follow the current location unless an argument names
    /// the mount explicitly.
    fn listing_targets_mount(&self, args: &[&str]) -> bool {
        match args.first() {
            Some(&arg) => self.mount.classify(arg, self.inside_mount) == Domain::Embedded,
            None => self.inside_mount,
        }
    }

    fn file_command(&mut self, cmd: &str, args: &[&str]) -> Result<(), FsError> {
        let Some(&arg) = args.first() else {
            eprintln!("{cmd}: missing operand");
            return Ok(());
        };
        if self.mount.classify(arg, self.inside_mount) == Domain::Host {
            return self.host_fallthrough(cmd);
        }
        let name = self.mount.strip(arg);
        match cmd {
            "touch" => self.fs.create_empty(name),
            "rm" => self.fs.delete(name),
            "cat" => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                for chunk in self.fs.read_all(name)? {
                    out.write_all(&chunk?)?;
                }
                writeln!(out)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn copy_command(&mut self, cmd: &str, args: &[&str]) -> Result<(), FsError> {
        let (Some(&src), Some(&dst)) = (args.first(), args.get(1)) else {
            eprintln!("{cmd}: missing operand");
            return Ok(());
        };
        let src_domain = self.mount.classify(src, self.inside_mount);
        let dst_domain = self.mount.classify(dst, self.inside_mount);
        match (src_domain, dst_domain) {
            (Domain::Embedded, Domain::Embedded) => {
                self.fs.copy_within(self.mount.strip(src), self.mount.strip(dst))?;
            }
            (Domain::Embedded, Domain::Host) => {
                self.fs.copy_out(self.mount.strip(src), Path::new(dst))?;
            }
            (Domain::Host, Domain::Embedded) => {
                self.fs.copy_in(Path::new(src), self.mount.strip(dst))?;
            }
            // Host-to-host copies never reach the engine.
            (Domain::Host, Domain::Host) => return self.host_fallthrough(cmd),
        }
        if cmd == "mv" {
            let same_embedded_name = src_domain == Domain::Embedded
                && dst_domain == Domain::Embedded
                && self.mount.strip(src) == self.mount.strip(dst);
            if !same_embedded_name {
                match src_domain {
                    Domain::Embedded => self.fs.delete(self.mount.strip(src))?,
                    Domain::Host => std::fs::remove_file(src)?,
                }
            }
        }
        Ok(())
    }

    fn change_dir(&mut self, arg: Option<&str>) {
        let Some(arg) = arg else {
            eprintln!("cd: missing operand");
            return;
        };
        if self.mount.matches(arg) {
            self.inside_mount = true;
        } else if let Err(e) = std::env::set_current_dir(arg) {
            eprintln!("cd: {arg}: {e}");
        } else {
            self.inside_mount = false;
        }
    }

    fn host_fallthrough(&self, cmd: &str) -> Result<(), FsError> {
        eprintln!("{cmd}: host command execution is not supported");
        Ok(())
    }
}

// ─── Output rendering ──────────────────────────────────────────────────────────

pub fn render_ls(entries: &[DirEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(
            out,
            "{:>15}{:>20}{:>10}{:>26}",
            e.size,
            e.name,
            e.kind,
            format_timestamp(e.creation)
        );
    }
    out
}

pub fn render_df(fs_name: &str, mount: &str, cluster_size: u32, u: Usage) -> String {
    let blocks = format!("{}K-Blocks", cluster_size / 1024);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>11}{:>15}{:>15}{:>15}{:>10}{:>15}",
        "File System", blocks, "Used", "Available", "Used%", "Mount Point"
    );
    let _ = writeln!(
        out,
        "{:>11}{:>15}{:>15}{:>15}{:>10.1}{:>15}",
        fs_name, u.total, u.used, u.free, u.percent_used, mount
    );
    out
}

pub fn render_dir_dump(slots: &[DirEntry]) -> String {
    let mut out = String::new();
    for (i, e) in slots.iter().enumerate() {
        let _ = writeln!(out, "Entry {i}");
        let _ = writeln!(out, "\tName: {}", e.name);
        let _ = writeln!(out, "\tIndex: {}", e.index);
        let _ = writeln!(out, "\tSize: {}", e.size);
        let _ = writeln!(out, "\tType: {}", e.kind);
        let _ = writeln!(out, "\tCreation: {}", e.creation);
    }
    out
}

pub fn render_fat_dump(links: &[(u32, u32)]) -> String {
    let mut out = String::from("Occupied FAT entries:\n");
    for (index, link) in links {
        let _ = writeln!(out, "{index}: {link}");
    }
    out
}

// ─── Timestamps ────────────────────────────────────────────────────────────────

fn is_leap_year(y: u32) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Convert (days since 1970-01-01) -> (year, month 1-12, day 1-31).
fn civil_from_days(total_days: u32) -> (u32, u32, u32) {
    let mut remaining = total_days;
    let mut year = 1970u32;
    loop {
        let dy = if is_leap_year(year) { 366 } else { 365 };
        if remaining < dy {
            break;
        }
        remaining -= dy;
        year += 1;
    }
    const DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let leap = is_leap_year(year);
    let mut month = 1u32;
    for m in 0..12u32 {
        let dim = if m == 1 && leap { 29 } else { DAYS[m as usize] };
        if remaining < dim {
            month = m + 1;
            break;
        }
        remaining -= dim;
        if m == 11 {
            month = 12;
        }
    }
    (year, month, remaining + 1)
}

/// Creation times render as UTC `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(ts: u32) -> String {
    let (year, month, day) = civil_from_days(ts / 86400);
    let secs = ts % 86400;
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
