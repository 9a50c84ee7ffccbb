

//! One shared image index per opened path, and a pool of file readers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::index::ImageIndex;
use crate::io::FileReader;
use crate::meta::ImageInfo;


/// Hands out file readers, reusing them across requests of the same path.
/// A reader carries a mutable offset, so it is never shared; a checkout
/// removes it from the pool and dropping the guard returns it.
#[derive(Debug, Default)]
pub struct FilePool {
    readers: Mutex<HashMap<PathBuf, Vec<FileReader>>>,
}

/// The number of idle readers kept per path.
const POOLED_READERS_PER_PATH: usize = 8;

impl FilePool {

    pub fn new() -> Self { FilePool::default() }

    /// Checks a reader for the given path out of the pool,
    /// opening a new one when none is idle.
    pub fn open(&self, path: &Path) -> Result<PooledReader<'_>> {
        let pooled = match self.readers.lock() {
            Ok(mut readers) => readers.get_mut(path).and_then(Vec::pop),
            Err(_) => return Err(Error::internal("file pool mutex poisoned")),
        };

        let mut reader = match pooled {
            Some(reader) => reader,
            None => FileReader::open(path)?,
        };

        reader.seek_to(0)?;

        Ok(PooledReader {
            pool: self,
            path: path.to_owned(),
            reader: Some(reader),
        })
    }

    fn check_in(&self, path: PathBuf, reader: FileReader) {
        if let Ok(mut readers) = self.readers.lock() {
            let idle = readers.entry(path).or_insert_with(Vec::new);

            if idle.len() < POOLED_READERS_PER_PATH {
                idle.push(reader);
            }
        }
    }
}


/// A file reader checked out of the pool.
/// Returns itself to the pool when dropped.
#[derive(Debug)]
pub struct PooledReader<'p> {
    pool: &'p FilePool,
    path: PathBuf,
    reader: Option<FileReader>,
}

impl Deref for PooledReader<'_> {
    type Target = FileReader;
    fn deref(&self) -> &FileReader {
        self.reader.as_ref().expect("reader present until drop")
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut FileReader {
        self.reader.as_mut().expect("reader present until drop")
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.check_in(std::mem::take(&mut self.path), reader);
        }
    }
}


/// Opens images below a configured root directory and shares one
/// `ImageIndex` per path among all sessions. The index is dropped when
/// the last session releases its handle; re-opening the path later
/// reconstructs it from the file alone.
#[derive(Debug)]
pub struct ImageCache {
    root: PathBuf,
    caching_folder: Option<PathBuf>,
    images: Mutex<HashMap<PathBuf, Weak<ImageIndex>>>,
    pool: FilePool,
}

impl ImageCache {

    /// A cache serving images below the given root directory.
    pub fn new(images_folder: impl Into<PathBuf>) -> Self {
        ImageCache {
            root: images_folder.into(),
            caching_folder: None,
            images: Mutex::new(HashMap::new()),
            pool: FilePool::new(),
        }
    }

    /// Also persist parse results to this folder, so that re-opening an
    /// unchanged image after a restart skips walking the file again.
    pub fn with_caching_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.caching_folder = Some(folder.into());
        self
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let cache = ImageCache::new(&config.images_folder);

        match &config.caching_folder {
            Some(folder) => cache.with_caching_folder(folder),
            None => cache,
        }
    }

    /// The pooled file readers for this repository.
    pub fn pool(&self) -> &FilePool { &self.pool }

    /// The path a request target resolves to.
    /// A leading `/` on the target is stripped before concatenation.
    pub fn resolve(&self, target: &str) -> PathBuf {
        self.root.join(target.trim_start_matches('/'))
    }

    /// Opens an image, reusing the shared index if any session
    /// already has it open.
    pub fn open(&self, target: &str) -> Result<Arc<ImageIndex>> {
        let path = self.resolve(target);

        let mut images = self.images.lock()
            .map_err(|_| Error::internal("image cache mutex poisoned"))?;

        if let Some(shared) = images.get(&path).and_then(Weak::upgrade) {
            debug!("reusing the open index of {:?}", path);
            return Ok(shared);
        }

        let info = self.parse_or_load(&path)?;
        let index = Arc::new(ImageIndex::from_info(path.clone(), info));

        images.retain(|_, weak| weak.strong_count() > 0);
        images.insert(path.clone(), Arc::downgrade(&index));

        info!("opened image {:?}", path);
        Ok(index)
    }

    /// Parses the image, or reloads a previous parse result
    /// if one was persisted and the file size still matches.
    fn parse_or_load(&self, path: &Path) -> Result<ImageInfo> {
        let file_size = std::fs::metadata(path)
            .map_err(|_| Error::bad_image(format!("cannot stat {:?}", path)))?
            .len();

        let checkpoint = self.caching_folder.as_ref()
            .map(|folder| folder.join(index_checkpoint_name(path)));

        if let Some(checkpoint) = &checkpoint {
            if let Some(info) = load_info_checkpoint(checkpoint, file_size) {
                debug!("loaded the index of {:?} from {:?}", path, checkpoint);
                return Ok(info);
            }
        }

        let info = ImageInfo::read_from_file(path, &self.root)?;

        if let Some(checkpoint) = &checkpoint {
            store_info_checkpoint(checkpoint, file_size, &info);
        }

        Ok(info)
    }
}


fn index_checkpoint_name(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}.index.json", hasher.finish())
}

fn load_info_checkpoint(checkpoint: &Path, expected_size: u64) -> Option<ImageInfo> {
    let bytes = std::fs::read(checkpoint).ok()?;
    let (stored_size, info): (u64, ImageInfo) = serde_json::from_slice(&bytes).ok()?;

    if stored_size != expected_size {
        debug!("discarding stale index checkpoint {:?}", checkpoint);
        return None;
    }

    Some(info)
}

fn store_info_checkpoint(checkpoint: &Path, file_size: u64, info: &ImageInfo) {
    let write = serde_json::to_vec(&(file_size, info)).ok()
        .and_then(|bytes| std::fs::write(checkpoint, bytes).ok());

    if write.is_none() {
        warn!("could not persist the index checkpoint {:?}", checkpoint);
    }
}
