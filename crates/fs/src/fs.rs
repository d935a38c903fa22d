use anyhow::{anyhow, Context as _, Result};
use smol::io::AsyncWriteExt;
use std::{
    io,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;

#[cfg(any(test, feature = "test-support"))]
use futures::lock::Mutex;
#[cfg(any(test, feature = "test-support"))]
use std::{
    collections::{btree_map, BTreeMap},
    sync::Arc,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Failure codes a content store reports for reads and writes. Anything
/// else is surfaced as a plain `anyhow` error with no code attached.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum FsError {
    #[error("file does not exist")]
    NotFound,
    #[error("file has not been modified since the last read")]
    NotModifiedSince,
    #[error("file has been modified since the last read")]
    ModifiedSince,
}

pub fn error_code(error: &anyhow::Error) -> Option<FsError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<FsError>().copied())
}

pub fn is_not_found_error(error: &anyhow::Error) -> bool {
    error_code(error) == Some(FsError::NotFound)
}

pub fn is_not_modified_error(error: &anyhow::Error) -> bool {
    error_code(error) == Some(FsError::NotModifiedSince)
}

pub fn is_modified_since_error(error: &anyhow::Error) -> bool {
    error_code(error) == Some(FsError::ModifiedSince)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    pub inode: u64,
    pub mtime: SystemTime,
    pub len: u64,
    pub is_symlink: bool,
    pub is_dir: bool,
}

#[derive(Clone, Debug)]
pub struct LoadedFile {
    pub bytes: Vec<u8>,
    pub metadata: Metadata,
}

#[derive(Copy, Clone, Default)]
pub struct ReadOptions {
    /// Fail with `FsError::NotModifiedSince` while the file's mtime still
    /// matches this timestamp.
    pub if_modified_since: Option<SystemTime>,
}

#[derive(Copy, Clone, Default)]
pub struct WriteOptions {
    /// Fail with `FsError::ModifiedSince` unless the file's current mtime
    /// matches this timestamp. A file that has been removed fails the check
    /// as well.
    pub expected_mtime: Option<SystemTime>,
}

#[derive(Copy, Clone, Default)]
pub struct RemoveOptions {
    pub ignore_if_not_exists: bool,
}

#[async_trait::async_trait]
pub trait Fs: Send + Sync {
    async fn load(&self, path: &Path) -> Result<String>;
    async fn read(&self, path: &Path, options: ReadOptions) -> Result<LoadedFile>;
    async fn write(&self, path: &Path, data: &[u8], options: WriteOptions) -> Result<Metadata>;
    async fn metadata(&self, path: &Path) -> Result<Option<Metadata>>;
    async fn remove_file(&self, path: &Path, options: RemoveOptions) -> Result<()>;
    async fn is_file(&self, path: &Path) -> bool;
    fn is_fake(&self) -> bool;
    #[cfg(any(test, feature = "test-support"))]
    fn as_fake(&self) -> &FakeFs;
}

pub struct RealFs;

#[async_trait::async_trait]
impl Fs for RealFs {
    async fn load(&self, path: &Path) -> Result<String> {
        let file = self.read(path, Default::default()).await?;
        Ok(String::from_utf8(file.bytes)?)
    }

    async fn read(&self, path: &Path, options: ReadOptions) -> Result<LoadedFile> {
        let path = normalize_path(path);
        let metadata = self
            .metadata(&path)
            .await?
            .ok_or(FsError::NotFound)
            .with_context(|| format!("reading {path:?}"))?;
        if options.if_modified_since == Some(metadata.mtime) {
            return Err(FsError::NotModifiedSince).with_context(|| format!("reading {path:?}"));
        }
        let bytes = match smol::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::NotFound).with_context(|| format!("reading {path:?}"))
            }
            Err(err) => return Err(err).with_context(|| format!("reading {path:?}")),
        };
        Ok(LoadedFile { bytes, metadata })
    }

    async fn write(&self, path: &Path, data: &[u8], options: WriteOptions) -> Result<Metadata> {
        let path = normalize_path(path);
        if let Some(expected_mtime) = options.expected_mtime {
            let mtime = self.metadata(&path).await?.map(|metadata| metadata.mtime);
            if mtime != Some(expected_mtime) {
                return Err(FsError::ModifiedSince).with_context(|| format!("writing {path:?}"));
            }
        }

        let buffer_size = data.len().min(10 * 1024);
        let file = smol::fs::File::create(&path)
            .await
            .with_context(|| format!("writing {path:?}"))?;
        let mut writer = smol::io::BufWriter::with_capacity(buffer_size, file);
        writer.write_all(data).await?;
        writer.flush().await?;

        self.metadata(&path)
            .await?
            .ok_or_else(|| anyhow!("file vanished while writing: {path:?}"))
    }

    async fn metadata(&self, path: &Path) -> Result<Option<Metadata>> {
        let symlink_metadata = match smol::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                return match (err.kind(), err.raw_os_error()) {
                    (io::ErrorKind::NotFound, _) => Ok(None),
                    #[cfg(unix)]
                    (io::ErrorKind::Other, Some(libc::ENOTDIR)) => Ok(None),
                    _ => Err(anyhow::Error::new(err)),
                }
            }
        };

        let is_symlink = symlink_metadata.file_type().is_symlink();
        let metadata = if is_symlink {
            smol::fs::metadata(path).await?
        } else {
            symlink_metadata
        };
        Ok(Some(Metadata {
            #[cfg(unix)]
            inode: metadata.ino(),
            #[cfg(not(unix))]
            inode: 0,
            mtime: metadata.modified()?,
            len: metadata.len(),
            is_symlink,
            is_dir: metadata.file_type().is_dir(),
        }))
    }

    async fn remove_file(&self, path: &Path, options: RemoveOptions) -> Result<()> {
        match smol::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound && options.ignore_if_not_exists => {
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound).with_context(|| format!("removing {path:?}"))
            }
            Err(err) => Err(err)?,
        }
    }

    async fn is_file(&self, path: &Path) -> bool {
        smol::fs::metadata(path)
            .await
            .map_or(false, |metadata| metadata.is_file())
    }

    fn is_fake(&self) -> bool {
        false
    }

    #[cfg(any(test, feature = "test-support"))]
    fn as_fake(&self) -> &FakeFs {
        panic!("called `RealFs::as_fake`")
    }
}

#[cfg(any(test, feature = "test-support"))]
pub struct FakeFs {
    // Use an unfair lock to ensure tests are deterministic.
    state: Mutex<FakeFsState>,
}

#[cfg(any(test, feature = "test-support"))]
struct FakeFsState {
    root: Arc<Mutex<FakeFsEntry>>,
    next_inode: u64,
    next_mtime: SystemTime,
}

#[cfg(any(test, feature = "test-support"))]
#[derive(Debug)]
enum FakeFsEntry {
    File {
        inode: u64,
        mtime: SystemTime,
        content: Vec<u8>,
    },
    Dir {
        inode: u64,
        mtime: SystemTime,
        entries: BTreeMap<String, Arc<Mutex<FakeFsEntry>>>,
    },
}

#[cfg(any(test, feature = "test-support"))]
impl FakeFsState {
    // Mtimes advance by a fixed step per mutation; tests never need to
    // sleep to observe a change.
    fn advance_mtime(&mut self) -> SystemTime {
        let mtime = self.next_mtime;
        self.next_mtime += Duration::from_secs(1);
        mtime
    }

    async fn read_path(&self, target: &Path) -> Result<Arc<Mutex<FakeFsEntry>>> {
        self.try_read_path(target)
            .await
            .ok_or(FsError::NotFound)
            .with_context(|| format!("path does not exist: {}", target.display()))
    }

    async fn try_read_path(&self, target: &Path) -> Option<Arc<Mutex<FakeFsEntry>>> {
        let mut entry_stack = Vec::new();
        for component in target.components() {
            match component {
                Component::Prefix(_) => panic!("prefix paths aren't supported"),
                Component::RootDir => {
                    entry_stack.clear();
                    entry_stack.push(self.root.clone());
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    entry_stack.pop()?;
                }
                Component::Normal(name) => {
                    let current_entry = entry_stack.last().cloned()?;
                    let current_entry = current_entry.lock().await;
                    if let FakeFsEntry::Dir { entries, .. } = &*current_entry {
                        entry_stack.push(entries.get(name.to_str().unwrap()).cloned()?);
                    } else {
                        return None;
                    }
                }
            }
        }
        entry_stack.pop()
    }

    async fn write_path<Fn, T>(&self, path: &Path, callback: Fn) -> Result<T>
    where
        Fn: FnOnce(btree_map::Entry<String, Arc<Mutex<FakeFsEntry>>>) -> Result<T>,
    {
        let path = normalize_path(path);
        let filename = path
            .file_name()
            .ok_or_else(|| anyhow!("cannot overwrite the root"))?;
        let parent_path = path.parent().unwrap();

        let parent = self.read_path(parent_path).await?;
        let mut parent = parent.lock().await;
        let new_entry = parent
            .dir_entries(parent_path)?
            .entry(filename.to_str().unwrap().into());
        callback(new_entry)
    }
}

#[cfg(any(test, feature = "test-support"))]
impl FakeFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeFsState {
                root: Arc::new(Mutex::new(FakeFsEntry::Dir {
                    inode: 0,
                    mtime: SystemTime::UNIX_EPOCH,
                    entries: Default::default(),
                })),
                next_inode: 1,
                next_mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1),
            }),
        })
    }

    pub async fn insert_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock().await;
        let path = path.as_ref();
        let inode = state.next_inode;
        state.next_inode += 1;
        let mtime = state.advance_mtime();
        state
            .write_path(path, |entry| {
                entry.or_insert(Arc::new(Mutex::new(FakeFsEntry::Dir {
                    inode,
                    mtime,
                    entries: Default::default(),
                })));
                Ok(())
            })
            .await
            .unwrap();
    }

    pub async fn insert_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        let path = path.as_ref();
        let inode = state.next_inode;
        state.next_inode += 1;
        let mtime = state.advance_mtime();
        let file = Arc::new(Mutex::new(FakeFsEntry::File {
            inode,
            mtime,
            content: content.into(),
        }));
        state
            .write_path(path, move |entry| {
                match entry {
                    btree_map::Entry::Vacant(e) => {
                        e.insert(file);
                    }
                    btree_map::Entry::Occupied(mut e) => {
                        *e.get_mut() = file;
                    }
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[must_use]
    pub fn insert_tree<'a>(
        &'a self,
        path: impl 'a + AsRef<Path> + Send,
        tree: serde_json::Value,
    ) -> futures::future::BoxFuture<'a, ()> {
        use futures::FutureExt as _;
        use serde_json::Value::*;

        async move {
            let path = path.as_ref();

            match tree {
                Object(map) => {
                    self.insert_dir(path).await;
                    for (name, contents) in map {
                        let mut path = PathBuf::from(path);
                        path.push(name);
                        self.insert_tree(&path, contents).await;
                    }
                }
                Null => {
                    self.insert_dir(&path).await;
                }
                String(contents) => {
                    self.insert_file(&path, contents).await;
                }
                _ => {
                    panic!("JSON object must contain only objects, strings, or null");
                }
            }
        }
        .boxed()
    }

    pub async fn files(&self) -> Vec<PathBuf> {
        let mut result = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((PathBuf::from("/"), self.state.lock().await.root.clone()));
        while let Some((path, entry)) = queue.pop_front() {
            let e = entry.lock().await;
            match &*e {
                FakeFsEntry::File { .. } => result.push(path),
                FakeFsEntry::Dir { entries, .. } => {
                    for (name, entry) in entries {
                        queue.push_back((path.join(name), entry.clone()));
                    }
                }
            }
        }
        result
    }

    // One deterministic yield per operation stands in for real I/O latency;
    // concurrent callers interleave even on a single-threaded executor.
    async fn simulate_delay(&self) {
        smol::future::yield_now().await;
    }
}

#[cfg(any(test, feature = "test-support"))]
impl FakeFsEntry {
    fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    fn metadata(&self) -> Metadata {
        match self {
            Self::File {
                inode,
                mtime,
                content,
            } => Metadata {
                inode: *inode,
                mtime: *mtime,
                len: content.len() as u64,
                is_symlink: false,
                is_dir: false,
            },
            Self::Dir { inode, mtime, .. } => Metadata {
                inode: *inode,
                mtime: *mtime,
                len: 0,
                is_symlink: false,
                is_dir: true,
            },
        }
    }

    fn file_content(&self, path: &Path) -> Result<&Vec<u8>> {
        if let Self::File { content, .. } = self {
            Ok(content)
        } else {
            Err(anyhow!("not a file: {}", path.display()))
        }
    }

    fn set_file_content(&mut self, path: &Path, new_content: Vec<u8>, new_mtime: SystemTime) -> Result<()> {
        if let Self::File { content, mtime, .. } = self {
            *mtime = new_mtime;
            *content = new_content;
            Ok(())
        } else {
            Err(anyhow!("not a file: {}", path.display()))
        }
    }

    fn dir_entries(
        &mut self,
        path: &Path,
    ) -> Result<&mut BTreeMap<String, Arc<Mutex<FakeFsEntry>>>> {
        if let Self::Dir { entries, .. } = self {
            Ok(entries)
        } else {
            Err(anyhow!("not a directory: {}", path.display()))
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait::async_trait]
impl Fs for FakeFs {
    async fn load(&self, path: &Path) -> Result<String> {
        let file = self.read(path, Default::default()).await?;
        Ok(String::from_utf8(file.bytes)?)
    }

    async fn read(&self, path: &Path, options: ReadOptions) -> Result<LoadedFile> {
        self.simulate_delay().await;
        let path = normalize_path(path);
        let state = self.state.lock().await;
        let entry = state.read_path(&path).await?;
        let entry = entry.lock().await;
        let metadata = entry.metadata();
        if options.if_modified_since == Some(metadata.mtime) {
            return Err(FsError::NotModifiedSince).with_context(|| format!("reading {path:?}"));
        }
        Ok(LoadedFile {
            bytes: entry.file_content(&path)?.clone(),
            metadata,
        })
    }

    async fn write(&self, path: &Path, data: &[u8], options: WriteOptions) -> Result<Metadata> {
        self.simulate_delay().await;
        let path = normalize_path(path);
        let mut state = self.state.lock().await;

        if let Some(expected_mtime) = options.expected_mtime {
            let mtime = match state.try_read_path(&path).await {
                Some(entry) => Some(entry.lock().await.metadata().mtime),
                None => None,
            };
            if mtime != Some(expected_mtime) {
                return Err(FsError::ModifiedSince).with_context(|| format!("writing {path:?}"));
            }
        }

        let inode = state.next_inode;
        state.next_inode += 1;
        let mtime = state.advance_mtime();
        let entry = state
            .write_path(&path, |entry| {
                Ok(match entry {
                    btree_map::Entry::Vacant(e) => e
                        .insert(Arc::new(Mutex::new(FakeFsEntry::File {
                            inode,
                            mtime,
                            content: Vec::new(),
                        })))
                        .clone(),
                    btree_map::Entry::Occupied(e) => e.get().clone(),
                })
            })
            .await?;
        let mut entry = entry.lock().await;
        entry.set_file_content(&path, data.to_vec(), mtime)?;
        Ok(entry.metadata())
    }

    async fn metadata(&self, path: &Path) -> Result<Option<Metadata>> {
        self.simulate_delay().await;
        let path = normalize_path(path);
        let state = self.state.lock().await;
        if let Some(entry) = state.try_read_path(&path).await {
            Ok(Some(entry.lock().await.metadata()))
        } else {
            Ok(None)
        }
    }

    async fn remove_file(&self, path: &Path, options: RemoveOptions) -> Result<()> {
        self.simulate_delay().await;
        let path = normalize_path(path);
        let parent_path = path
            .parent()
            .ok_or_else(|| anyhow!("cannot remove the root"))?;
        let base_name = path.file_name().unwrap();
        let state = self.state.lock().await;
        let parent_entry = state.read_path(parent_path).await?;
        let mut parent_entry = parent_entry.lock().await;
        let entry = parent_entry
            .dir_entries(parent_path)?
            .entry(base_name.to_str().unwrap().into());
        match entry {
            btree_map::Entry::Vacant(_) => {
                if !options.ignore_if_not_exists {
                    return Err(FsError::NotFound)
                        .with_context(|| format!("removing {path:?}"));
                }
            }
            btree_map::Entry::Occupied(e) => {
                e.get().lock().await.file_content(&path)?;
                e.remove();
            }
        }
        Ok(())
    }

    async fn is_file(&self, path: &Path) -> bool {
        self.simulate_delay().await;
        let path = normalize_path(path);
        let state = self.state.lock().await;
        if let Some(entry) = state.try_read_path(&path).await {
            entry.lock().await.is_file()
        } else {
            false
        }
    }

    fn is_fake(&self) -> bool {
        true
    }

    fn as_fake(&self) -> &FakeFs {
        self
    }
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };

    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => {
                ret.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                ret.pop();
            }
            Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}
