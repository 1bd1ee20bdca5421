//! `.nfs` install manifests.
//!
//! A manifest is UTF-8 text, one entry per line. Blank lines and lines starting with `#` are
//! skipped. An entry is either a command with one argument:
//!
//! ```text
//! file_exist sys/HWINFO_S.dat     check, runs in dry run only
//! dir_exist  title/00030017       check, runs in dry run only
//! rm         shared2/0000         mutating, runs in execute only
//! rm         photo/private/*      every regular file in the directory
//! ```
//!
//! or a file line in `sha1sum` binary form, `<40 hex digits> *<path>`, naming a file below the
//! source directory that is to be copied to the same path below the target root.
//!
//! A dry run touches nothing and reports what an execute pass would find. The execute pass
//! copies and re-hashes every file and stops at the first failure.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::crypto::{sha1_reader, SHA1_LEN};
use crate::error::Error;
use crate::scratch::ScratchPool;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    FileExists,
    DirExists,
    Remove,
}

impl Command {
    const ALL: [(&'static str, Command); 3] =
        [("file_exist", Command::FileExists), ("dir_exist", Command::DirExists), ("rm", Command::Remove)];

    /// Check commands run during the dry run, the others during execution.
    pub fn is_check(self) -> bool {
        !matches!(self, Command::Remove)
    }

    fn parse(line: &str) -> Option<(Command, &str)> {
        Self::ALL.iter().find_map(|&(name, command)| {
            let rest = line.strip_prefix(name)?;
            if !rest.starts_with(|c: char| c.is_whitespace()) {
                return None;
            }
            let arg = rest.trim_start();
            (!arg.is_empty()).then(|| (command, arg))
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::ALL.iter().find(|(_, command)| command == self).map(|(name, _)| *name).unwrap_or("?");
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    Command { command: Command, arg: String },
    File { digest: [u8; SHA1_LEN], path: String },
    Irregular(String),
}

impl Entry {
    /// Parse one trimmed, non-comment line.
    fn parse(line: &str) -> Entry {
        if let Some((command, arg)) = Command::parse(line) {
            return Entry::Command { command, arg: convert_backslashes(arg) };
        }
        let parsed = (|| {
            let (digest, rest) = (line.get(..2 * SHA1_LEN)?, line.get(2 * SHA1_LEN..)?);
            let path = rest.strip_prefix(" *")?;
            if path.is_empty() {
                return None;
            }
            let digest: [u8; SHA1_LEN] = hex::decode(digest).ok()?.try_into().ok()?;
            Some(Entry::File { digest, path: convert_backslashes(path) })
        })();
        parsed.unwrap_or_else(|| Entry::Irregular(line.to_string()))
    }
}

fn convert_backslashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// A parsed manifest. Each entry keeps its 1-based line number.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Script {
    pub entries: Vec<(usize, Entry)>,
}

impl Script {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    None
                } else {
                    Some((i + 1, Entry::parse(line)))
                }
            })
            .collect();
        Script { entries }
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = fs::read_to_string(path).map_err(|source| ScriptError::Open { path: path.to_path_buf(), source })?;
        Ok(Self::parse(&text))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    DryRun,
    Execute,
}

/// Counters of one pass over a manifest.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Summary {
    pub ok: usize,
    pub missing: usize,
    pub wrong: usize,
    pub irregular: usize,
    pub invalid: usize,
    pub copied: usize,
    /// Bytes hashed in a dry run, bytes copied when executing.
    pub bytes: u64,
}

impl Summary {
    /// Entries that would stop a careful caller from executing.
    pub fn problems(&self) -> usize {
        self.missing + self.wrong + self.irregular + self.invalid
    }

    pub fn is_clean(&self) -> bool {
        self.problems() == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}/{} OK/All, {} bytes", self.ok, self.ok + self.missing + self.wrong, self.bytes)?;
        if self.missing + self.wrong > 0 {
            writeln!(f, "{} wrong, {} missing", self.wrong, self.missing)?;
        }
        if self.irregular > 0 {
            writeln!(f, "{} irregular line(s)", self.irregular)?;
        }
        if self.invalid > 0 {
            writeln!(f, "{} invalid target path(s)", self.invalid)?;
        }
        if self.copied > 0 {
            writeln!(f, "{} file(s) copied and verified", self.copied)?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScriptError {
    #[error("line {line}: {command} {arg} failed")]
    CommandFailed { line: usize, command: Command, arg: String },
    #[error("failed to copy to {path}, the target may now be inconsistent")]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is missing right after being copied")]
    VanishedAfterCopy(PathBuf),
    #[error("{0} does not match its digest after copying, the target may now be inconsistent")]
    VerifyFailed(PathBuf),
    #[error("cannot read manifest {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Scratch(#[from] Error),
}

/// Is `name` a plain relative path that stays below the root?
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}

/// Like a dry run of `mkdir -p` followed by creating a file: nothing on the way may already
/// exist with the wrong type.
fn validate_path(root: &Path, name: &str) -> bool {
    if !is_contained(name) {
        return false;
    }
    let full = root.join(name);
    if let Ok(metadata) = fs::metadata(&full) {
        return metadata.is_file();
    }
    let mut ancestor = root.to_path_buf();
    let components: Vec<_> = Path::new(name).components().collect();
    for component in &components[..components.len().saturating_sub(1)] {
        ancestor.push(component);
        match fs::metadata(&ancestor) {
            Err(_) => return true,
            Ok(metadata) if !metadata.is_dir() => return false,
            Ok(_) => {}
        }
    }
    true
}

#[derive(Debug)]
pub struct Engine<'a> {
    /// Where the files go, the mounted NAND partition.
    root: PathBuf,
    /// Where the manifest's file paths are looked up.
    source: PathBuf,
    pool: &'a ScratchPool,
}

impl<'a> Engine<'a> {
    pub fn new(root: impl Into<PathBuf>, source: impl Into<PathBuf>, pool: &'a ScratchPool) -> Self {
        Self { root: root.into(), source: source.into(), pool }
    }

    pub fn run(&self, script: &Script, mode: Mode) -> Result<Summary, ScriptError> {
        let mut summary = Summary::default();
        for (line, entry) in &script.entries {
            match entry {
                Entry::Command { command, arg } => {
                    if command.is_check() == (mode == Mode::DryRun) {
                        self.command(*line, *command, arg)?;
                    }
                }
                Entry::Irregular(text) => {
                    debug!("line {}: irregular: {:?}", line, text);
                    summary.irregular += 1;
                }
                Entry::File { digest, path } => {
                    if !validate_path(&self.root, path) {
                        info!("{} invalid path", path);
                        summary.invalid += 1;
                        continue;
                    }
                    match mode {
                        Mode::DryRun => self.check_file(digest, path, &mut summary)?,
                        Mode::Execute => self.install_file(digest, path, &mut summary)?,
                    }
                }
            }
        }
        match mode {
            Mode::DryRun => info!("dry run: {}", summary.to_string().trim_end().replace('\n', "; ")),
            Mode::Execute => info!("executed: {} file(s), {} bytes", summary.copied, summary.bytes),
        }
        Ok(summary)
    }

    fn command(&self, line: usize, command: Command, arg: &str) -> Result<(), ScriptError> {
        if !is_contained(arg.trim_end_matches("/*")) {
            warn!("line {}: {} {} leaves the target root", line, command, arg);
            return Err(ScriptError::CommandFailed { line, command, arg: arg.to_string() });
        }
        match command {
            Command::FileExists | Command::DirExists => {
                let exists = match fs::metadata(self.root.join(arg)) {
                    Ok(metadata) if command == Command::FileExists => metadata.is_file(),
                    Ok(metadata) => metadata.is_dir(),
                    Err(_) => false,
                };
                info!("{} {}", arg, if exists { "exists" } else { "doesn't exist" });
                if !exists {
                    return Err(ScriptError::CommandFailed { line, command, arg: arg.to_string() });
                }
            }
            Command::Remove => match arg.strip_suffix("/*") {
                Some(dir) => self.remove_all_files(&self.root.join(dir)),
                None => {
                    remove(&self.root.join(arg));
                }
            },
        }
        Ok(())
    }

    /// Remove every regular file directly in `dir`.
    ///
    /// Entries are listed into an owned snapshot before anything is deleted, and the
    /// directory is listed again until a pass finds no file or removes none.
    fn remove_all_files(&self, dir: &Path) {
        loop {
            let snapshot: Vec<PathBuf> = match fs::read_dir(dir) {
                Ok(entries) => entries
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| fs::metadata(path).map(|m| m.is_file()).unwrap_or(false))
                    .collect(),
                Err(_) => return,
            };
            let removed = snapshot.iter().filter(|path| remove(path)).count();
            if snapshot.is_empty() || removed == 0 {
                return;
            }
        }
    }

    fn hash(&self, path: &Path) -> Result<io::Result<([u8; SHA1_LEN], u64)>, ScriptError> {
        let mut buf = self.pool.alloc()?;
        Ok(File::open(path).and_then(|file| sha1_reader(file, &mut buf)))
    }

    fn check_file(&self, digest: &[u8; SHA1_LEN], name: &str, summary: &mut Summary) -> Result<(), ScriptError> {
        match self.hash(&self.source.join(name))? {
            Err(_) => {
                info!("{} missing", name);
                summary.missing += 1;
            }
            Ok((actual, size)) => {
                summary.bytes += size;
                if actual == *digest {
                    info!("{} OK", name);
                    summary.ok += 1;
                } else {
                    info!("{} wrong", name);
                    summary.wrong += 1;
                }
            }
        }
        Ok(())
    }

    fn install_file(&self, digest: &[u8; SHA1_LEN], name: &str, summary: &mut Summary) -> Result<(), ScriptError> {
        let target = self.root.join(name);
        if let Some(parent) = target.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("mkdir {} failed: {}", parent.display(), e);
            }
        }
        let copied = self
            .copy(&self.source.join(name), &target)
            .map_err(|source| ScriptError::CopyFailed { path: target.clone(), source })?;

        match self.hash(&target)? {
            Err(_) => Err(ScriptError::VanishedAfterCopy(target)),
            Ok((actual, _)) if actual != *digest => Err(ScriptError::VerifyFailed(target)),
            Ok(_) => {
                info!("{} copied and verified", name);
                summary.copied += 1;
                summary.bytes += copied;
                Ok(())
            }
        }
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let mut buf = self.pool.alloc().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut from = File::open(from)?;
        let mut to = File::create(to)?;
        let mut total = 0u64;
        loop {
            let read = match from.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            to.write_all(&buf[..read])?;
            total += read as u64;
        }
        to.flush()?;
        Ok(total)
    }
}

/// Remove one file or empty directory, logging the outcome. Failures are not fatal.
fn remove(path: &Path) -> bool {
    let removed = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir(path),
        _ => fs::remove_file(path),
    };
    match removed {
        Ok(()) => {
            info!("removed: {}", path.display());
            true
        }
        Err(e) => {
            warn!("failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
