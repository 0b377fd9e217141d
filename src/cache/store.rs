//! On-disk content store for cached registry objects.
//!
//! Objects are opaque byte files under a fixed root directory, addressed by
//! registry-relative path. Metadata (media type, entity tag, last-validation
//! timestamp) lives in extended attributes so the payload can be served
//! byte-identical. In-flight uploads are staged under the reserved `-/tmp/`
//! subtree and published with an atomic rename.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use filetime::FileTime;

/// Reserved subtree for staged uploads. Never contains published objects.
pub const TMP_SUBDIR: &str = "-/tmp";

const XATTR_MIMETYPE: &str = "user.com.authenticvision.cachistry.mimetype";
const XATTR_ETAG: &str = "user.com.authenticvision.cachistry.etag";
const XATTR_VALIDATED: &str = "user.com.authenticvision.cachistry.validated";

/// Attribute values are read into a fixed-size buffer; longer values are
/// truncated, so writers must keep them short.
const ATTR_MAX: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Metadata of a published object, read back from its extended attributes.
#[derive(Debug, Clone)]
pub struct CachedObject {
    /// Upstream `Content-Type` at fetch time.
    pub media_type: String,
    /// Upstream `ETag` at fetch time; may be empty.
    pub etag: String,
    /// Last time the object was fetched or revalidated, UTC.
    pub validated_at: DateTime<Utc>,
}

/// A staged object under `-/tmp/`, not yet visible at any cache path.
///
/// Dropping an unpublished `TempObject` unlinks the staged file, so cleanup
/// runs on every exit path; after [`ObjectStore::publish`] the drop is a
/// no-op because the file has been renamed away.
pub struct TempObject {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    published: bool,
}

impl TempObject {
    /// Write handle for streaming the object body.
    pub fn file_mut(&mut self) -> &mut tokio::fs::File {
        self.file.as_mut().expect("staged file already closed")
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        self.file.take();
        if !self.published {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Path-scoped content store rooted at the cache directory.
///
/// All paths are interpreted relative to the root; `..` segments and leading
/// separators are neutralized before joining, so resolved paths cannot
/// escape it.
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open the store, creating the root and the `-/tmp/` subtree.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(TMP_SUBDIR))
            .with_context(|| format!("create staging dir under {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute on-disk path for a cache key, confined to the store root.
    pub fn object_path(&self, path: &str) -> PathBuf {
        self.root.join(sanitize(path))
    }

    /// Look up an object's metadata, touching its access time.
    ///
    /// Returns `Ok(None)` when nothing is published at `path`. An existing
    /// file with unreadable or missing attributes is an error, not a miss.
    pub fn get(&self, path: &str) -> Result<Option<CachedObject>> {
        let full = self.object_path(path);
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("stat cached object {}", full.display()))
            }
        };
        if !meta.is_file() {
            return Ok(None);
        }

        // atime seeds the recency ordering at startup; mtime stays untouched.
        filetime::set_file_atime(&full, FileTime::now())
            .with_context(|| format!("touch atime of {}", full.display()))?;

        let media_type = read_attr(&full, XATTR_MIMETYPE)?;
        let etag = read_attr(&full, XATTR_ETAG)?;
        let validated = read_attr(&full, XATTR_VALIDATED)?;
        let validated_at = DateTime::parse_from_rfc3339(validated.trim())
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("parse validation timestamp {validated:?}"))?;

        Ok(Some(CachedObject {
            media_type,
            etag,
            validated_at,
        }))
    }

    /// Stage a new object under `-/tmp/` with exclusive-create semantics and
    /// all three metadata attributes set (`validated` = now).
    pub fn open_temp(&self, media_type: &str, etag: &str) -> Result<TempObject> {
        let tmp_path = self
            .root
            .join(TMP_SUBDIR)
            .join(format!("{:016x}", rand::random::<u64>()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .with_context(|| format!("create staging file {}", tmp_path.display()))?;

        // From here on the drop guard owns the file; a failed attribute write
        // below still releases the staged file.
        let tmp = TempObject {
            file: Some(tokio::fs::File::from_std(file)),
            tmp_path,
            published: false,
        };
        set_attr(&tmp.tmp_path, XATTR_MIMETYPE, media_type)?;
        set_attr(&tmp.tmp_path, XATTR_ETAG, etag)?;
        set_attr(&tmp.tmp_path, XATTR_VALIDATED, &now_rfc3339())?;
        Ok(tmp)
    }

    /// Move a staged object to its final path, overwriting any prior file.
    /// Rename within one filesystem is atomic.
    pub fn publish(&self, mut tmp: TempObject, path: &str) -> Result<()> {
        tmp.file.take();

        let dest = self.object_path(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create parent dirs for {}", dest.display()))?;
        }
        fs::rename(&tmp.tmp_path, &dest).with_context(|| {
            format!(
                "publish {} -> {}",
                tmp.tmp_path.display(),
                dest.display()
            )
        })?;
        tmp.published = true;
        Ok(())
    }

    /// Rewrite only the `validated` attribute to now.
    pub fn touch_validated(&self, path: &str) -> Result<()> {
        set_attr(&self.object_path(path), XATTR_VALIDATED, &now_rfc3339())
    }

    /// Unlink a published object. Returns `Ok(false)` when it was already
    /// gone (another request may have evicted it).
    pub fn remove(&self, path: &str) -> Result<bool> {
        let full = self.object_path(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("unlink {}", full.display())),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lexically resolve a cache key into a relative path that cannot climb out
/// of the store root: `..` pops, absolute prefixes are stripped.
fn sanitize(path: &str) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::ParentDir => {
                clean.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    clean
}

fn read_attr(path: &Path, name: &str) -> Result<String> {
    let value = xattr::get(path, name)
        .with_context(|| format!("getxattr {name} on {}", path.display()))?
        .ok_or_else(|| anyhow!("missing attribute {name} on {}", path.display()))?;
    let end = value.len().min(ATTR_MAX);
    Ok(String::from_utf8_lossy(&value[..end]).into_owned())
}

fn set_attr(path: &Path, name: &str, value: &str) -> Result<()> {
    xattr::set(path, name, value.as_bytes())
        .with_context(|| format!("setxattr {name} on {}", path.display()))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
