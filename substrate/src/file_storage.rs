//! File-backed storage: a directory of fixed-size, pre-sized segment files.

use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::storage::{AccessCost, BulkSink, BulkWriter, Page, Storage};
use crate::{PageId, PAGE_SIZE};

/// Default segment size: 16 MiB, i.e. 4096 pages.
pub const DEFAULT_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;
pub const DEFAULT_PREFIX: &str = "strata";

#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub segment_bytes: u64,
}

impl FileStorageConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileStorageConfig {
            dir: dir.as_ref().to_path_buf(),
            prefix: DEFAULT_PREFIX.to_string(),
            segment_bytes: DEFAULT_SEGMENT_BYTES,
        }
    }
}

/// Page `p` lives in segment `p / pages_per_segment` at offset
/// `(p % pages_per_segment) * PAGE_SIZE`. Segments are created and pre-sized
/// on first write; `close` forces every open segment to disk.
pub struct FileStorage {
    config: FileStorageConfig,
    pages_per_segment: u32,
    segments: Mutex<HashMap<u32, File>>,
    next_free: Mutex<PageId>,
    cost: AccessCost,
}

impl FileStorage {
    pub fn open(config: FileStorageConfig) -> Result<Self> {
        create_dir_all(&config.dir)?;
        let pages_per_segment = (config.segment_bytes / PAGE_SIZE as u64) as u32;
        debug!(
            "opening file storage at {:?}, {} pages per segment",
            config.dir, pages_per_segment
        );

        // Resume the id space after the highest existing segment.
        let mut max_segment: Option<u32> = None;
        let suffix = ".seg";
        for entry in std::fs::read_dir(&config.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy().into_owned();
            let head = format!("{}-", config.prefix);
            if let Some(rest) = name.strip_prefix(&head) {
                if let Some(num) = rest.strip_suffix(suffix) {
                    if let Ok(seg) = num.parse::<u32>() {
                        max_segment = Some(max_segment.map_or(seg, |m| m.max(seg)));
                    }
                }
            }
        }
        let next_free = match max_segment {
            Some(seg) => (seg + 1) as PageId * pages_per_segment as PageId,
            None => 0,
        };

        Ok(FileStorage {
            config,
            pages_per_segment,
            segments: Mutex::new(HashMap::new()),
            next_free: Mutex::new(next_free),
            cost: AccessCost::default(),
        })
    }

    fn segment_path(&self, segment: u32) -> PathBuf {
        self.config
            .dir
            .join(format!("{}-{}.seg", self.config.prefix, segment))
    }

    fn locate(&self, page_id: PageId) -> (u32, u64) {
        let segment = page_id as u32 / self.pages_per_segment;
        let offset = (page_id as u32 % self.pages_per_segment) as u64 * PAGE_SIZE as u64;
        (segment, offset)
    }

    /// Runs `f` over the segment's file, opening (and pre-sizing) it first.
    /// Without `create`, a segment that does not exist on disk yields `None`.
    fn with_segment<R>(
        &self,
        segment: u32,
        create: bool,
        f: impl FnOnce(Option<&mut File>) -> Result<R>,
    ) -> Result<R> {
        let mut segments = self.segments.lock();
        if !segments.contains_key(&segment) {
            let path = self.segment_path(segment);
            if path.exists() || create {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                if file.metadata()?.len() < self.config.segment_bytes {
                    file.set_len(self.config.segment_bytes)?;
                }
                segments.insert(segment, file);
            }
        }
        f(segments.get_mut(&segment))
    }

    fn fetch(&self, page_id: PageId) -> Result<Page> {
        let (segment, offset) = self.locate(page_id);
        let mut page = Page::new(page_id);
        self.with_segment(segment, false, |file| {
            if let Some(file) = file {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut page.data[..])?;
            }
            Ok(())
        })?;
        let mut next_free = self.next_free.lock();
        if page_id >= *next_free {
            *next_free = page_id + 1;
        }
        Ok(page)
    }

    fn store(&self, page: &Page) -> Result<()> {
        let (segment, offset) = self.locate(page.id);
        self.with_segment(segment, true, |file| {
            // `create` guarantees the file is present.
            let file =
                file.ok_or_else(|| std::io::Error::other("segment vanished while locked"))?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&page.data[..])?;
            Ok(())
        })?;
        let mut next_free = self.next_free.lock();
        if page.id >= *next_free {
            *next_free = page.id + 1;
        }
        Ok(())
    }

    fn resolve_start(&self, start: PageId) -> Result<PageId> {
        if start == -1 {
            Ok(*self.next_free.lock())
        } else if start < 0 {
            Err(StoreError::NegativePageId(start))
        } else {
            Ok(start)
        }
    }

    /// Forces every open segment to disk.
    pub fn close(&self) -> Result<()> {
        for file in self.segments.lock().values() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Storage for FileStorage {
    fn read(&self, page_id: PageId) -> Result<Page> {
        if page_id < 0 {
            return Err(StoreError::NegativePageId(page_id));
        }
        trace!("file read page {page_id}");
        self.cost.random();
        self.fetch(page_id)
    }

    fn write(&self, page: &Page) -> Result<()> {
        if page.id < 0 {
            return Err(StoreError::NegativePageId(page.id));
        }
        trace!("file write page {}", page.id);
        self.cost.random();
        self.store(page)
    }

    fn bulk_read(&self, start: PageId, count: u32, consumer: &mut dyn FnMut(Page)) -> Result<()> {
        let start = self.resolve_start(start)?;
        self.cost.bulk(count);
        for offset in 0..count {
            consumer(self.fetch(start + offset as PageId)?);
        }
        Ok(())
    }

    fn bulk_write(&self, start: PageId) -> Result<BulkWriter<'_>> {
        let start = self.resolve_start(start)?;
        Ok(BulkWriter::new(self, start))
    }

    fn access_cost(&self) -> f64 {
        self.cost.total()
    }
}

impl BulkSink for FileStorage {
    fn store_sequential(&self, page: &Page) -> Result<()> {
        self.store(page)
    }

    fn cost(&self) -> &AccessCost {
        &self.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pages_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = FileStorageConfig::new(dir.path());
        {
            let storage = FileStorage::open(config.clone()).unwrap();
            let mut page = Page::new(12);
            page.data[100] = 42;
            storage.write(&page).unwrap();
            storage.close().unwrap();
        }
        let storage = FileStorage::open(config).unwrap();
        assert_eq!(storage.read(12).unwrap().data[100], 42);
    }

    #[test]
    fn segments_are_pre_sized_on_first_touch() {
        let dir = tempdir().unwrap();
        let mut config = FileStorageConfig::new(dir.path());
        config.segment_bytes = 8 * PAGE_SIZE as u64;
        let storage = FileStorage::open(config.clone()).unwrap();
        storage.write(&Page::new(0)).unwrap();

        let seg0 = dir.path().join(format!("{}-0.seg", config.prefix));
        assert_eq!(std::fs::metadata(seg0).unwrap().len(), config.segment_bytes);
    }

    #[test]
    fn page_placement_crosses_segment_boundaries() {
        let dir = tempdir().unwrap();
        let mut config = FileStorageConfig::new(dir.path());
        config.segment_bytes = 4 * PAGE_SIZE as u64;
        let storage = FileStorage::open(config.clone()).unwrap();

        // Page 5 lands in segment 1 at offset 1 * PAGE_SIZE.
        let mut page = Page::new(5);
        page.data[0] = 7;
        storage.write(&page).unwrap();

        let seg1 = dir.path().join(format!("{}-1.seg", config.prefix));
        assert!(seg1.exists());
        let mut contents = Vec::new();
        File::open(seg1)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents[PAGE_SIZE], 7);
    }

    #[test]
    fn read_of_untouched_region_is_zeroed() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(FileStorageConfig::new(dir.path())).unwrap();
        let page = storage.read(99).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_resumes_id_space_after_existing_segments() {
        let dir = tempdir().unwrap();
        let mut config = FileStorageConfig::new(dir.path());
        config.segment_bytes = 4 * PAGE_SIZE as u64;
        {
            let storage = FileStorage::open(config.clone()).unwrap();
            storage.write(&Page::new(2)).unwrap();
        }
        let storage = FileStorage::open(config).unwrap();
        let writer = storage.bulk_write(-1).unwrap();
        assert_eq!(writer.next_id(), 4);
    }
}
