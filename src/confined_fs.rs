use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::SessionError;

const DEFAULT_IGNORE: &[&str] = &["__pycache__", "*.pyc", "*.pyo", ".git", ".mypy_cache"];

/// Capability for file access beneath one root directory. Every path handed
/// in is resolved against the root, `..` is folded lexically, symlinks of the
/// existing prefix are followed, and the result must stay under the root.
#[derive(Debug, Clone)]
pub struct ConfinedFs {
    root: PathBuf,
}

impl ConfinedFs {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, SessionError> {
        let joined = self.root.join(path.as_ref());
        let normalized = normalize_lexically(&joined);
        let resolved = resolve_existing_prefix(&normalized);
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(SessionError::Confinement { path: resolved })
        }
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<File, SessionError> {
        Ok(File::open(self.resolve(path)?)?)
    }

    /// Creates (or truncates) a file, creating missing parent directories.
    pub fn create(&self, path: impl AsRef<Path>) -> Result<File, SessionError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)?)
    }

    pub fn write(&self, path: impl AsRef<Path>, contents: &str) -> Result<PathBuf, SessionError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents)?;
        Ok(target)
    }

    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String, SessionError> {
        Ok(fs::read_to_string(self.resolve(path)?)?)
    }

    /// Copies host files or directories to `dest` under the root. The
    /// destination is validated before anything is touched.
    pub fn import<P: AsRef<Path>>(
        &self,
        sources: &[P],
        dest: impl AsRef<Path>,
        options: &ImportOptions,
    ) -> Result<Vec<PathBuf>, SessionError> {
        let dest = self.resolve(dest)?;
        let ignore = options.ignore_set()?;
        let multiple = sources.len() > 1;

        for source in sources {
            if !source.as_ref().exists() {
                return Err(SessionError::SourceMissing(source.as_ref().to_path_buf()));
            }
        }

        let mut copied = Vec::new();
        for source in sources {
            let source = source.as_ref();
            // Several sources, or a directory destination, land inside `dest`.
            let target = if multiple || (dest.is_dir() && source.is_file()) {
                match source.file_name() {
                    Some(name) => self.resolve(dest.join(name))?,
                    None => dest.clone(),
                }
            } else {
                dest.clone()
            };

            if source.is_dir() {
                if target.exists() && !options.merge {
                    return Err(SessionError::TargetExists(target));
                }
                self.copy_tree(source, &target, &ignore, options.overwrite)?;
            } else {
                if target.exists() && !options.overwrite {
                    return Err(SessionError::TargetExists(target));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(source, &target)?;
            }
            copied.push(target);
        }
        Ok(copied)
    }

    fn copy_tree(
        &self,
        source: &Path,
        target: &Path,
        ignore: &GlobSet,
        overwrite: bool,
    ) -> Result<(), SessionError> {
        let walker = WalkDir::new(source)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !ignore.is_match(entry.file_name()));

        for entry in walker {
            let entry = entry.map_err(|err| {
                SessionError::Io(err.into_io_error().unwrap_or_else(|| {
                    io::Error::other("filesystem loop while walking import source")
                }))
            })?;
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let destination = self.resolve(target.join(relative))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&destination)?;
            } else if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
                if destination.exists() && !overwrite {
                    debug!(path = %destination.display(), "keeping existing file");
                    continue;
                }
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &destination)?;
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular entry");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Put the destination on the running worker's `sys.path`.
    pub add_to_sys_path: bool,
    /// Copy a directory into an existing one instead of failing.
    pub merge: bool,
    pub overwrite: bool,
    /// Globs matched against each entry's file name.
    pub ignore: Vec<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            add_to_sys_path: false,
            merge: true,
            overwrite: true,
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ImportOptions {
    fn ignore_set(&self) -> Result<GlobSet, SessionError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.ignore {
            let glob = Glob::new(pattern).map_err(|err| {
                SessionError::Io(io::Error::new(io::ErrorKind::InvalidInput, err))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|err| SessionError::Io(io::Error::new(io::ErrorKind::InvalidInput, err)))
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalizes the longest existing ancestor and re-appends the rest, so
/// a symlink inside the root that points elsewhere is seen for what it is.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(&existing) {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}
