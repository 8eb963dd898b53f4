//! Filesystem operations module.
//!
//! Every filesystem touch the engine makes goes through the [`FileSystem`]
//! trait so that tests can run against temp directories with injected faults.
//! [`LocalFs`] is the real implementation:
//! - Enumerating directory trees without following nested links
//! - Copying files through a temp sibling with metadata preservation
//! - Creating and removing junctions (symlinks on Unix)
//! - Free-space and writability probes

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;
use walkdir::WalkDir;

use crate::platform;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Metadata of a path, read without following a final link.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
    pub is_file: bool,
    /// Symlink or junction
    pub is_link: bool,
}

/// Contents of a directory tree, as paths relative to its root.
#[derive(Debug, Default, Clone)]
pub struct TreeListing {
    /// Regular files and their sizes
    pub files: Vec<(PathBuf, u64)>,
    /// Directories, parents before children
    pub dirs: Vec<PathBuf>,
    /// Nested symlinks and junctions; never followed
    pub links: Vec<PathBuf>,
}

impl TreeListing {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, size)| size).sum()
    }
}

/// Filesystem capability used by the engine.
pub trait FileSystem: Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Enumerate `root` recursively. A link at `root` itself is followed.
    fn list_tree(&self, root: &Path) -> io::Result<TreeListing>;

    /// Copy `src` over `dst`, preserving timestamps. Returns bytes copied.
    /// A chunk taking longer than `stall_timeout` fails with `TimedOut`. The
    /// check runs once a read returns, so a read blocked forever is not caught.
    fn copy_file(&self, src: &Path, dst: &Path, stall_timeout: Duration) -> io::Result<u64>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool>;

    /// Immediate children of `dir`.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Target stored in the symlink or junction at `path`.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create a directory junction at `link` resolving to `target`.
    fn create_junction(&self, link: &Path, target: &Path) -> io::Result<()>;

    /// Remove the junction at `link`; the target is left alone.
    fn remove_junction(&self, link: &Path) -> io::Result<()>;

    fn is_junction(&self, path: &Path) -> io::Result<bool>;

    /// Bytes available to this user on the volume holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    /// Check that a file can be created inside `dir`.
    fn probe_writable(&self, dir: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }
}

/// The local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let is_link = file_type.is_symlink() || platform::is_junction(path)?;
        Ok(FileStat {
            len: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
            is_file: file_type.is_file(),
            is_link,
        })
    }

    fn list_tree(&self, root: &Path) -> io::Result<TreeListing> {
        let mut listing = TreeListing::default();
        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                .to_path_buf();
            let file_type = entry.file_type();
            if file_type.is_symlink() || platform::is_junction(entry.path())? {
                listing.links.push(relative);
            } else if file_type.is_dir() {
                listing.dirs.push(relative);
            } else {
                let len = entry.metadata().map_err(io::Error::from)?.len();
                listing.files.push((relative, len));
            }
        }
        Ok(listing)
    }

    fn copy_file(&self, src: &Path, dst: &Path, stall_timeout: Duration) -> io::Result<u64> {
        ensure_parent_dir_exists(dst)?;
        let tmp = temp_sibling(dst)?;
        // A killed run can leave its temp file behind.
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match copy_into(src, &tmp, stall_timeout) {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&tmp, dst) {
                    let _ = fs::remove_file(&tmp);
                    return Err(e);
                }
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
        Ok(fs::read_dir(path)?.next().is_none())
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn create_junction(&self, link: &Path, target: &Path) -> io::Result<()> {
        platform::create_junction(link, target)
    }

    fn remove_junction(&self, link: &Path) -> io::Result<()> {
        if !platform::is_junction(link)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a junction", link.display()),
            ));
        }
        platform::remove_junction(link)
    }

    fn is_junction(&self, path: &Path) -> io::Result<bool> {
        platform::is_junction(path)
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        let existing = nearest_existing_ancestor(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existing ancestor for {}", path.display()),
            )
        })?;
        fs2::available_space(existing)
    }

    fn probe_writable(&self, dir: &Path) -> io::Result<()> {
        let probe = dir.join(format!(".relocator-probe-{}", Uuid::new_v4().simple()));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&probe)?;
        let written = file.write_all(b"probe");
        drop(file);
        let removed = fs::remove_file(&probe);
        written.and(removed)
    }
}

/// Stream `src` into a newly created `dst`, fsync it and copy the timestamps.
fn copy_into(src: &Path, dst: &Path, stall_timeout: Duration) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let src_meta = reader.metadata()?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(dst)?;

    let total = copy_stream(&mut reader, &mut writer, stall_timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            io::Error::new(io::ErrorKind::TimedOut, format!("copy of {} stalled", src.display()))
        } else {
            e
        }
    })?;
    writer.sync_all()?;
    drop(writer);

    let mtime = filetime::FileTime::from_last_modification_time(&src_meta);
    let atime = filetime::FileTime::from_last_access_time(&src_meta);
    filetime::set_file_times(dst, atime, mtime)?;
    Ok(total)
}

/// Chunked copy that fails with `TimedOut` when one read and write together
/// take longer than `stall_timeout`.
fn copy_stream<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    stall_timeout: Duration,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let started = Instant::now();
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
        if started.elapsed() > stall_timeout {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
    }
    Ok(total)
}

/// Hidden sibling used while a copy is in flight: `.<name>.relocator-tmp`.
pub fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".relocator-tmp");
    Ok(path.with_file_name(tmp_name))
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => match fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} exists but is not a directory", parent.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
            Err(e) => Err(e),
        },
        _ => Ok(()),
    }
}

/// Closest ancestor of `path` (itself included) that exists on disk.
pub fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
}

/// True if `inner` equals `outer` or lies beneath it. Compares components.
pub fn path_within(inner: &Path, outer: &Path) -> bool {
    let normalize = |p: &Path| -> Vec<String> {
        p.components()
            .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
            .collect()
    };
    let inner = normalize(inner);
    let outer = normalize(outer);
    inner.len() >= outer.len() && inner[..outer.len()] == outer[..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, data: &[u8]) {
        ensure_parent_dir_exists(path).expect("Failed to create parent");
        fs::write(path, data).expect("Failed to write file");
    }

    #[test]
    fn test_list_tree_nested() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write(&src.join("file1.txt"), b"data1");
        write(&src.join("subdir").join("file2.txt"), b"data22");
        fs::create_dir_all(src.join("empty")).expect("Failed to create empty dir");

        let listing = LocalFs::new().list_tree(&src).expect("Failed to enumerate");
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.dirs.len(), 2);
        assert_eq!(listing.total_bytes(), 11);
        assert!(listing.links.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_list_tree_does_not_follow_nested_links() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let outside = temp_dir.path().join("outside");
        write(&src.join("a.txt"), b"a");
        write(&outside.join("big.bin"), &[0u8; 64]);
        std::os::unix::fs::symlink(&outside, src.join("link")).expect("Failed to link");

        let fs_ops = LocalFs::new();
        let listing = fs_ops.list_tree(&src).expect("Failed to enumerate");
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.links, vec![PathBuf::from("link")]);
        assert_eq!(fs_ops.read_link(&src.join("link")).expect("read link"), outside);
        assert_eq!(
            fs_ops.list_dir(&src).expect("list dir").len(),
            2,
            "a.txt and link"
        );
    }

    #[test]
    fn test_list_tree_missing_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = LocalFs::new().list_tree(&temp_dir.path().join("nonexistent"));
        assert!(result.is_err());
    }

    #[test]
    fn test_copy_file_replaces_and_keeps_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.txt");
        let dst = temp_dir.path().join("out").join("dest.txt");
        write(&src, b"test content");
        write(&dst, b"older and longer content");
        let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&src, mtime).expect("Failed to set mtime");

        let bytes = LocalFs::new()
            .copy_file(&src, &dst, Duration::from_secs(30))
            .expect("Failed to copy");
        assert_eq!(bytes, 12);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"test content");

        let meta = fs::metadata(&dst).expect("Failed to stat dest");
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), mtime);
        assert!(!temp_sibling(&dst).expect("temp name").exists());
    }

    #[test]
    fn test_copy_file_replaces_stale_temp() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("song.mp3");
        let dst = temp_dir.path().join("Music").join("song.mp3");
        write(&src, b"fresh bytes");
        write(&temp_sibling(&dst).expect("temp name"), b"left by a killed run");

        let bytes = LocalFs::new()
            .copy_file(&src, &dst, Duration::from_secs(30))
            .expect("Failed to copy over stale temp");
        assert_eq!(bytes, 11);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"fresh bytes");
        assert!(!temp_sibling(&dst).expect("temp name").exists());
    }

    struct SlowReader {
        chunks: usize,
        delay: Duration,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks == 0 {
                return Ok(0);
            }
            self.chunks -= 1;
            std::thread::sleep(self.delay);
            buf[0] = 7;
            Ok(1)
        }
    }

    #[test]
    fn test_copy_stream_detects_stalled_chunk() {
        let mut out = Vec::new();
        let mut fast = SlowReader {
            chunks: 3,
            delay: Duration::ZERO,
        };
        let copied = copy_stream(&mut fast, &mut out, Duration::from_secs(5)).expect("copy");
        assert_eq!(copied, 3);

        let mut slow = SlowReader {
            chunks: 3,
            delay: Duration::from_millis(50),
        };
        let err = copy_stream(&mut slow, &mut out, Duration::from_millis(5))
            .expect_err("stall must be reported");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_copy_missing_source_leaves_no_temp() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("dest.txt");
        let result =
            LocalFs::new().copy_file(&temp_dir.path().join("gone"), &dst, Duration::from_secs(1));
        assert!(result.is_err());
        assert!(!dst.exists());
        assert!(!temp_sibling(&dst).expect("temp name").exists());
    }

    #[test]
    fn test_junction_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let target = temp_dir.path().join("target");
        write(&target.join("inside.txt"), b"x");
        let link = temp_dir.path().join("link");
        let fs_ops = LocalFs::new();

        fs_ops.create_junction(&link, &target).expect("Failed to create junction");
        assert!(fs_ops.is_junction(&link).expect("stat link"));
        assert!(link.join("inside.txt").exists());

        fs_ops.remove_junction(&link).expect("Failed to remove junction");
        assert!(!link.exists());
        assert!(target.join("inside.txt").exists());
    }

    #[test]
    fn test_remove_junction_refuses_plain_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = LocalFs::new().remove_junction(temp_dir.path());
        assert!(result.is_err());
        assert!(temp_dir.path().exists());
    }

    #[test]
    fn test_space_and_probe_use_existing_ancestor() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let deep = temp_dir.path().join("not").join("yet").join("there");
        assert_eq!(nearest_existing_ancestor(&deep), Some(temp_dir.path()));
        let fs_ops = LocalFs::new();
        assert!(fs_ops.available_space(&deep).expect("free space") > 0);
        fs_ops.probe_writable(temp_dir.path()).expect("writable");
        assert!(fs_ops.is_empty_dir(temp_dir.path()).expect("read dir"));
    }

    #[test]
    fn test_path_within() {
        assert!(path_within(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(path_within(Path::new("/a/b"), Path::new("/a/b")));
        assert!(!path_within(Path::new("/a/bc"), Path::new("/a/b")));
        assert!(!path_within(Path::new("/a"), Path::new("/a/b")));
    }
}
