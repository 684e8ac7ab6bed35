//! Moving snapshots between memory and disk.
//!
//! Reads walk the fixed `<group>/<variant>/manifest.json` layout. Writes never
//! touch the live tree in place: the next tree is rendered into a staging
//! directory beside the catalog root and swapped in with two renames once it
//! has been validated. A leftover set-aside tree from an interrupted swap is
//! restored on the next run. Dot-entries belong to whoever else shares the
//! root (VCS metadata, attributes files); they are carried into every staged
//! tree unchanged.

use super::index::{CatalogIndex, INDEX_FILE_NAME};
use super::{CatalogPath, ManifestRecord, Snapshot, StoredRecord, MANIFEST_FILE_NAME};
use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

const STAGING_SUFFIX: &str = ".staging-";
const PREVIOUS_SUFFIX: &str = ".previous";

/// Load every manifest under `root` into a snapshot.
///
/// A missing root is an empty catalog. Anything that does not fit the managed
/// layout, or two files claiming one id, makes the prior state untrustworthy
/// and fails the load.
pub fn load_snapshot(root: &Path) -> SyncResult<Snapshot> {
    let mut snapshot = Snapshot::new();
    if !root.exists() {
        return Ok(snapshot);
    }

    for group in sorted_entries(root)? {
        let group_name = entry_name(&group)?;
        if group_name.starts_with('.') || group_name == INDEX_FILE_NAME {
            continue;
        }
        if !group.is_dir() {
            return Err(snapshot_error(&group, "unmanaged file in catalog root"));
        }
        for variant in sorted_entries(&group)? {
            let variant_name = entry_name(&variant)?;
            if variant_name.starts_with('.') {
                continue;
            }
            if !variant.is_dir() {
                return Err(snapshot_error(&variant, "unmanaged file in group directory"));
            }
            let stored = load_variant(&variant, &format!("{group_name}/{variant_name}"))?;
            let path = stored.path.clone();
            if let Some(previous) = snapshot.insert(stored) {
                return Err(snapshot_error(
                    &variant,
                    &format!(
                        "id {} is held by both {} and {}",
                        previous.record.id, previous.path, path
                    ),
                ));
            }
        }
    }

    debug!(root = %root.display(), records = snapshot.len(), "loaded prior catalog");
    Ok(snapshot)
}

fn load_variant(dir: &Path, relative_dir: &str) -> SyncResult<StoredRecord> {
    let mut manifest = None;
    for entry in sorted_entries(dir)? {
        let name = entry_name(&entry)?;
        if name.starts_with('.') {
            continue;
        }
        if name != MANIFEST_FILE_NAME || !entry.is_file() {
            return Err(snapshot_error(&entry, "unmanaged entry in variant directory"));
        }
        manifest = Some(entry);
    }
    let manifest = manifest.ok_or_else(|| snapshot_error(dir, "variant directory has no manifest"))?;

    let data = fs::read(&manifest).map_err(|err| snapshot_error(&manifest, &err.to_string()))?;
    let record: ManifestRecord = serde_json::from_slice(&data)
        .map_err(|err| snapshot_error(&manifest, &format!("parsing manifest: {err}")))?;
    let path = CatalogPath::parse(&format!("{relative_dir}/{MANIFEST_FILE_NAME}"))
        .map_err(|err| snapshot_error(&manifest, &err))?;
    Ok(StoredRecord { path, record })
}

fn sorted_entries(dir: &Path) -> SyncResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .and_then(|iter| iter.map(|entry| entry.map(|e| e.path())).collect::<io::Result<Vec<_>>>())
        .map_err(|err| snapshot_error(dir, &err.to_string()))?;
    entries.sort();
    Ok(entries)
}

fn entry_name(path: &Path) -> SyncResult<String> {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(str::to_string)
        .ok_or_else(|| snapshot_error(path, "entry name is not valid UTF-8"))
}

fn snapshot_error(path: &Path, message: &str) -> SyncError {
    SyncError::Snapshot {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Pretty JSON with a trailing newline; the only encoding written to disk.
pub(crate) fn render_json<T: Serialize>(value: &T, target: &Path) -> SyncResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| SyncError::write(target, io::Error::new(io::ErrorKind::InvalidData, err)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write `bytes` to a temporary sibling of `path`, then rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|err| SyncError::write(parent, err))?;
    let mut temp = published(0o644)
        .tempfile_in(parent)
        .map_err(|err| SyncError::write(parent, err))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| SyncError::write(path, err))?;
    temp.persist(path)
        .map_err(|err| SyncError::write(path, err.error))?;
    Ok(())
}

/// A fully rendered next catalog tree that is not yet visible.
pub struct StagedCatalog {
    dir: TempDir,
    root: PathBuf,
    manifests: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReport {
    pub root: PathBuf,
    pub manifests_written: usize,
    pub replaced_previous: bool,
}

impl StagedCatalog {
    /// Staged tree location; validators read the candidate state from here.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Swap the staged tree in place of the live root.
    ///
    /// The live tree is renamed aside first; if the staged rename then fails
    /// the old tree is put back, so either the old or the new tree is visible.
    pub fn commit(self) -> SyncResult<CommitReport> {
        let previous = sibling_path(&self.root, PREVIOUS_SUFFIX)?;
        if previous.exists() {
            fs::remove_dir_all(&previous).map_err(|err| SyncError::write(&previous, err))?;
        }

        let replaced_previous = self.root.exists();
        if replaced_previous {
            fs::rename(&self.root, &previous).map_err(|err| SyncError::write(&self.root, err))?;
        }

        if let Err(err) = fs::rename(self.dir.path(), &self.root) {
            if replaced_previous {
                if let Err(restore) = fs::rename(&previous, &self.root) {
                    warn!(
                        root = %self.root.display(),
                        error = %restore,
                        "could not restore previous catalog; it remains at the set-aside path"
                    );
                }
            }
            return Err(SyncError::write(&self.root, err));
        }

        if replaced_previous {
            if let Err(err) = fs::remove_dir_all(&previous) {
                warn!(path = %previous.display(), error = %err, "stale previous catalog left behind");
            }
        }

        info!(root = %self.root.display(), manifests = self.manifests, "catalog committed");
        Ok(CommitReport {
            root: self.root,
            manifests_written: self.manifests,
            replaced_previous,
        })
    }
}

/// Render `snapshot` and `index` into a fresh staging directory beside `root`.
pub fn stage_catalog(
    root: &Path,
    snapshot: &Snapshot,
    index: &CatalogIndex,
) -> SyncResult<StagedCatalog> {
    let parent = parent_dir(root);
    fs::create_dir_all(parent).map_err(|err| SyncError::write(parent, err))?;
    let prefix = format!(".{}{STAGING_SUFFIX}", root_name(root)?);
    let dir = published(0o755)
        .prefix(&prefix)
        .tempdir_in(parent)
        .map_err(|err| SyncError::write(parent, err))?;

    for stored in snapshot.iter() {
        let target = stored.path.resolve(dir.path());
        let bytes = render_json(&stored.record, &target)?;
        write_atomic(&target, &bytes)?;
    }
    super::index::write_index_atomic(dir.path(), index)?;
    let carried = carry_dot_entries(root, dir.path())?;

    debug!(
        staging = %dir.path().display(),
        manifests = snapshot.len(),
        carried,
        "catalog staged"
    );
    Ok(StagedCatalog {
        dir,
        root: root.to_path_buf(),
        manifests: snapshot.len(),
    })
}

/// Copy the dot-entries of the live tree into `staged`, at the root, group
/// and variant levels where the scan tolerates them. Returns how many
/// top-level dot-entries were carried.
fn carry_dot_entries(live: &Path, staged: &Path) -> SyncResult<usize> {
    if !live.is_dir() {
        return Ok(0);
    }
    let mut carried = carry_level(live, staged)?;
    for group in sorted_entries(live)? {
        let group_name = entry_name(&group)?;
        if group_name.starts_with('.') || !group.is_dir() {
            continue;
        }
        let staged_group = staged.join(&group_name);
        carried += carry_level(&group, &staged_group)?;
        for variant in sorted_entries(&group)? {
            let variant_name = entry_name(&variant)?;
            if variant_name.starts_with('.') || !variant.is_dir() {
                continue;
            }
            carried += carry_level(&variant, &staged_group.join(&variant_name))?;
        }
    }
    Ok(carried)
}

fn carry_level(from: &Path, to: &Path) -> SyncResult<usize> {
    let mut carried = 0;
    for entry in sorted_entries(from)? {
        let name = entry_name(&entry)?;
        if !name.starts_with('.') {
            continue;
        }
        fs::create_dir_all(to).map_err(|err| SyncError::write(to, err))?;
        copy_entry(&entry, &to.join(&name))?;
        carried += 1;
    }
    Ok(carried)
}

/// Recursive copy that hard-links regular files where the filesystem allows
/// and recreates symlinks rather than following them.
fn copy_entry(from: &Path, to: &Path) -> SyncResult<()> {
    let meta = fs::symlink_metadata(from).map_err(|err| SyncError::write(from, err))?;
    let kind = meta.file_type();
    if kind.is_symlink() {
        let target = fs::read_link(from).map_err(|err| SyncError::write(from, err))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, to).map_err(|err| SyncError::write(to, err))?;
        #[cfg(not(unix))]
        warn!(
            path = %from.display(),
            target = %target.display(),
            "symlink not carried into staged catalog"
        );
    } else if kind.is_dir() {
        fs::create_dir(to).map_err(|err| SyncError::write(to, err))?;
        let entries = fs::read_dir(from).map_err(|err| SyncError::write(from, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::write(from, err))?;
            copy_entry(&entry.path(), &to.join(entry.file_name()))?;
        }
        fs::set_permissions(to, meta.permissions()).map_err(|err| SyncError::write(to, err))?;
    } else if fs::hard_link(from, to).is_err() {
        fs::copy(from, to).map_err(|err| SyncError::write(to, err))?;
    }
    Ok(())
}

/// Undo the effects of an interrupted commit.
///
/// Restores the set-aside tree when the live root is missing, drops a stale
/// set-aside tree when the swap finished, and removes abandoned staging
/// directories. Returns true when a tree was restored.
pub fn recover_interrupted(root: &Path) -> SyncResult<bool> {
    let previous = sibling_path(root, PREVIOUS_SUFFIX)?;
    let mut restored = false;
    if previous.exists() {
        if root.exists() {
            fs::remove_dir_all(&previous).map_err(|err| SyncError::write(&previous, err))?;
        } else {
            fs::rename(&previous, root).map_err(|err| SyncError::write(root, err))?;
            warn!(root = %root.display(), "restored catalog from interrupted commit");
            restored = true;
        }
    }

    let parent = parent_dir(root);
    if parent.exists() {
        let prefix = format!(".{}{STAGING_SUFFIX}", root_name(root)?);
        let entries = fs::read_dir(parent).map_err(|err| SyncError::write(parent, err))?;
        for entry in entries.flatten() {
            let stale = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(&prefix))
                .unwrap_or(false);
            if stale {
                let path = entry.path();
                debug!(path = %path.display(), "removing abandoned staging directory");
                fs::remove_dir_all(&path).map_err(|err| SyncError::write(&path, err))?;
            }
        }
    }
    Ok(restored)
}

/// Temp builder whose output is readable by catalog consumers once renamed
/// into place; tempfile defaults to owner-only modes.
fn published<'a>(mode: u32) -> Builder<'a, 'a> {
    let mut builder = Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder
}

fn parent_dir(root: &Path) -> &Path {
    root.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

fn root_name(root: &Path) -> SyncResult<String> {
    root.file_name()
        .and_then(OsStr::to_str)
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::Config(format!(
                "catalog root {} must end in a UTF-8 directory name",
                root.display()
            ))
        })
}

fn sibling_path(root: &Path, suffix: &str) -> SyncResult<PathBuf> {
    Ok(parent_dir(root).join(format!(".{}{suffix}", root_name(root)?)))
}
