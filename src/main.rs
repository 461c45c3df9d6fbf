//! Interactive shell over an embedded container filesystem.
//!
//! `fs_shell <container>` mounts the container (creating and formatting it
//! after a confirmation and geometry prompts when absent), then reads
//! commands line by line until `exit` or end of input.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;

use fat16_impl::fat16::{Fat16, FsError};
use fat16_impl::logger;
use fat16_impl::shell::{FileStore, Outcome, ShellSession};

fn main() -> ExitCode {
    logger::init();
    let mut args = std::env::args().skip(1);
    let Some(container) = args.next() else {
        eprintln!("usage: fs_shell <container>");
        return ExitCode::from(2);
    };

    let fs = match open_or_create(&container) {
        Ok(Some(fs)) => fs,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            log::error!("cannot open container {container}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut session = ShellSession::new(fs, &container);
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("fs_shell> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::error!("stdin: {e}");
                break;
            }
        }
        if session.handle_line(line.trim_end()) == Outcome::Exit {
            break;
        }
    }
    ExitCode::SUCCESS
}

/// Mount an existing container, or confirm and format a new one.
/// `Ok(None)` means the user declined creation.
fn open_or_create(container: &str) -> Result<Option<Fat16<FileStore>>, FsError> {
    let path = Path::new(container);
    if path.exists() {
        return Ok(Some(Fat16::mount(FileStore::open(path)?)?));
    }

    print!("Are you sure you want to create a new filesystem [Y]? ");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    if !matches!(answer.trim(), "y" | "Y") {
        println!("Exiting.");
        return Ok(None);
    }

    let fs_size = prompt_size("Enter the maximum size for this file system in MB: ", 5, 50)?
        * 1024
        * 1024;
    let cluster_size =
        prompt_size("Enter the cluster size for this file system in KB: ", 8, 16)? * 1024;

    let store = FileStore::create(path)?;
    match Fat16::format(store, cluster_size, fs_size) {
        Ok(fs) => Ok(Some(fs)),
        Err(e) => {
            // Both prompts were range-checked, so this is the FAT-fit
            // rejection; drop the half-made container.
            let _ = std::fs::remove_file(path);
            log::error!("FAT table will not fit in one cluster");
            Err(e)
        }
    }
}

/// Prompt until the user enters an integer inside `[lo, hi]`.
fn prompt_size(prompt: &str, lo: u32, hi: u32) -> Result<u32, FsError> {
    let stdin = io::stdin();
    let mut text = prompt;
    loop {
        print!("{text}");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of input during prompt",
            )));
        }
        match line.trim().parse::<u32>() {
            Ok(v) if (lo..=hi).contains(&v) => return Ok(v),
            _ => text = "Error: Invalid size, try again: ",
        }
    }
}
