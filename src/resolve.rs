//! Decides which command arguments address the embedded filesystem.
//!
//! The mount path is `/<container name as given on the command line>`. An
//! argument is embedded when its mount-length prefix equals the mount path,
//! or when the shell's current location is inside the mount and the argument
//! carries no path separator. Everything else belongs to the host.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Embedded,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    path: String,
}

impl MountPoint {
    pub fn new(container: &str) -> Self {
        Self { path: format!("/{container}") }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Prefix match, the way the dispatcher compares: the argument truncated
    /// to mount length must equal the mount path.
    pub fn matches(&self, arg: &str) -> bool {
        arg.as_bytes().get(..self.path.len()) == Some(self.path.as_bytes())
    }

    /// Classify one argument relative to this mount.
    pub fn classify(&self, arg: &str, inside_mount: bool) -> Domain {
        if self.matches(arg) || (inside_mount && !arg.contains('/')) {
            Domain::Embedded
        } else {
            Domain::Host
        }
    }

    /// Strip `<mount>/` from a prefixed argument; bare names pass through.
    pub fn strip<'a>(&self, arg: &'a str) -> &'a str {
        if self.matches(arg) {
            arg.get(self.path.len() + 1..).unwrap_or("")
        } else {
            arg
        }
    }
}
