// On-disk store of processed frames
//
// Frames live as `<temp>/preview/<target>/<source>/<zfilled(index)>.png`.
// An in-memory membership set mirrors the directory so `has` never touches
// the filesystem. Writers go through a temp file plus rename, so readers
// only ever see complete PNGs. Frames stored under an explicit name are
// recorded in `names.json` so a reload maps them back to their index.

use crate::error::{FramecastError, Result};
use crate::frame::{Frame, NumberedFrame};
use crate::pipeline::manifest;
use image::ImageFormat;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub const PREVIEW_DIR: &str = "preview";
pub const NAMES_FILE: &str = "names.json";

const READ_ATTEMPTS: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct Membership {
    indices: BTreeSet<u64>,
    /// Frames stored under an explicit name instead of their zero-padded index.
    names: BTreeMap<u64, String>,
}

impl Membership {
    /// Index stored under `stem`: a recorded name first, then a plain number.
    fn index_of(&self, stem: &str) -> Option<u64> {
        self.names
            .iter()
            .find(|(_, name)| name.as_str() == stem)
            .map(|(index, _)| *index)
            .or_else(|| {
                let index = stem.parse::<u64>().ok()?;
                // A named index has no plain-numbered file.
                (!self.names.contains_key(&index)).then_some(index)
            })
    }
}

#[derive(Debug)]
pub struct FrameBuffer {
    source_id: String,
    target_id: String,
    path: PathBuf,
    zfill: usize,
    membership: RwLock<Membership>,
    miss: AtomicU64,
}

/// Digits needed to print `frames_count`.
pub fn zfill_width(frames_count: u64) -> usize {
    frames_count.to_string().len()
}

impl FrameBuffer {
    /// Materializes the buffer directory for `(source_id, target_id)` under
    /// `temp_dir` and indexes the frames already stored there.
    pub fn load(temp_dir: &Path, source_id: &str, target_id: &str, frames_count: u64) -> Result<Self> {
        let root = std::path::absolute(temp_dir).map_err(|e| FramecastError::io(temp_dir, e))?;
        let path = root.join(PREVIEW_DIR).join(target_id).join(source_id);
        fs::create_dir_all(&path).map_err(|e| FramecastError::io(&path, e))?;

        let mut membership = Membership {
            names: read_names(&path)?,
            ..Membership::default()
        };
        for entry in fs::read_dir(&path).map_err(|e| FramecastError::io(&path, e))? {
            let entry = entry.map_err(|e| FramecastError::io(&path, e))?;
            let file_path = entry.path();
            let is_png = file_path
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.eq_ignore_ascii_case("png"))
                .unwrap_or(false);
            if !is_png {
                continue;
            }
            let Some(index) = file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| membership.index_of(s))
            else {
                continue;
            };
            // Zero-byte files are leftovers of interrupted writes.
            match entry.metadata() {
                Ok(meta) if meta.len() > 0 => {
                    membership.indices.insert(index);
                }
                _ => tracing::warn!("Ignoring empty buffer file {:?}", file_path),
            }
        }

        manifest::write_manifest(&path, source_id, target_id, frames_count)?;

        tracing::info!(
            "FrameBuffer: loaded {:?} with {} stored frames (frames_count={})",
            path,
            membership.indices.len(),
            frames_count
        );

        Ok(Self {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            path,
            zfill: zfill_width(frames_count),
            membership: RwLock::new(membership),
            miss: AtomicU64::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Membership> {
        self.membership.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Membership> {
        self.membership.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Index of the frame stored as `<stem>.png`, if the stem names one.
    pub fn index_of_stem(&self, stem: &str) -> Option<u64> {
        self.read().index_of(stem)
    }

    pub fn file_stem(&self, index: u64) -> String {
        format!("{:0width$}", index, width = self.zfill)
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        let stem = self
            .read()
            .names
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.file_stem(index));
        self.path.join(format!("{stem}.png"))
    }

    /// Stores a frame. The file is complete on disk before the index becomes
    /// visible through `has`.
    pub fn add(&self, nf: &NumberedFrame) -> Result<()> {
        let stem = nf.name.clone().unwrap_or_else(|| self.file_stem(nf.index));
        let final_path = self.path.join(format!("{stem}.png"));
        let tmp_path = self.path.join(format!(
            ".{stem}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = nf.frame.save_with_format(&tmp_path, ImageFormat::Png) {
            let _ = fs::remove_file(&tmp_path);
            return Err(match e {
                image::ImageError::IoError(io) => FramecastError::io(&tmp_path, io),
                other => FramecastError::Image(other),
            });
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(FramecastError::io(&final_path, e));
        }

        let mut membership = self.write();
        let names_changed = match &nf.name {
            Some(name) => membership.names.insert(nf.index, name.clone()).as_ref() != Some(name),
            None => membership.names.remove(&nf.index).is_some(),
        };
        if names_changed {
            write_names(&self.path, &membership.names)?;
        }
        membership.indices.insert(nf.index);
        Ok(())
    }

    /// Point lookup, or with `return_previous` the highest readable stored
    /// frame at or below `index`. Updates `miss` on every hit.
    pub fn get(&self, index: u64, return_previous: bool) -> Option<NumberedFrame> {
        let mut upper = index;
        loop {
            let candidate = {
                let membership = self.read();
                if return_previous {
                    membership.indices.range(..=upper).next_back().copied()
                } else if membership.indices.contains(&index) {
                    Some(index)
                } else {
                    None
                }
            }?;

            match self.read_frame(candidate) {
                Some(frame) => {
                    self.miss.store(index - candidate, Ordering::Relaxed);
                    let mut nf = NumberedFrame::new(candidate, frame);
                    if let Some(name) = self.read().names.get(&candidate) {
                        nf.name = Some(name.clone());
                    }
                    return Some(nf);
                }
                None if return_previous && candidate > 1 => upper = candidate - 1,
                None => return None,
            }
        }
    }

    /// Reads a stored frame, retrying while a concurrent writer may hold it.
    fn read_frame(&self, index: u64) -> Option<Frame> {
        let path = self.frame_path(index);
        for attempt in 0..READ_ATTEMPTS {
            match fs::metadata(&path) {
                Ok(meta) if meta.len() == 0 => {
                    tracing::warn!("FrameBuffer: {:?} is empty, treating as missing", path);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("FrameBuffer: {:?} not readable: {}", path, e);
                    return None;
                }
            }
            match image::open(&path) {
                Ok(img) => return Some(img.to_rgb8()),
                Err(e) => {
                    tracing::debug!(
                        "FrameBuffer: read attempt {} of {:?} failed: {}",
                        attempt + 1,
                        path,
                        e
                    );
                    std::thread::sleep(READ_RETRY_DELAY);
                }
            }
        }
        tracing::warn!("FrameBuffer: giving up on {:?}", path);
        None
    }

    pub fn has(&self, index: u64) -> bool {
        self.read().indices.contains(&index)
    }

    pub fn indices(&self) -> Vec<u64> {
        self.read().indices.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().indices.is_empty()
    }

    pub fn max_index(&self) -> Option<u64> {
        self.read().indices.iter().next_back().copied()
    }

    pub fn miss(&self) -> u64 {
        self.miss.load(Ordering::Relaxed)
    }

    pub fn reset_miss(&self) {
        self.miss.store(0, Ordering::Relaxed);
    }

    /// Picks up a frame written into the directory by another process.
    pub fn refresh(&self, index: u64) -> bool {
        let path = self.path.join(format!("{}.png", self.file_stem(index)));
        let present = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if present {
            self.write().indices.insert(index);
        }
        present
    }

    /// Deletes a stored frame. Returns whether it was a member.
    pub fn remove(&self, index: u64) -> Result<bool> {
        let path = self.frame_path(index);
        let was_member = {
            let mut membership = self.write();
            if membership.names.remove(&index).is_some() {
                write_names(&self.path, &membership.names)?;
            }
            membership.indices.remove(&index)
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(was_member),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(was_member),
            Err(e) => Err(FramecastError::io(&path, e)),
        }
    }
}

fn read_names(dir: &Path) -> Result<BTreeMap<u64, String>> {
    let path = dir.join(NAMES_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(FramecastError::io(&path, e)),
    }
}

fn write_names(dir: &Path, names: &BTreeMap<u64, String>) -> Result<()> {
    let path = dir.join(NAMES_FILE);
    let tmp_path = dir.join(format!(
        ".{NAMES_FILE}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp_path, serde_json::to_string_pretty(names)?)
        .map_err(|e| FramecastError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, &path).map_err(|e| FramecastError::io(&path, e))
}
