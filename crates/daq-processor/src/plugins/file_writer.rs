//! Raw file sink.
//!
//! Each acquisition gets three files in the output directory:
//!
//! - `<acq>_<dataset>.raw`: frame bytes back to back, as received
//! - `<acq>_<dataset>.index.jsonl`: one [`IndexEntry`] per frame
//! - `<acq>_<dataset>.json`: the [`DatasetDefinition`] and frame count
//!
//! Files open on the first frame of an acquisition and close at end of
//! acquisition, when the acquisition id changes, or once the expected number
//! of frames has been written. Frames of that acquisition arriving after the
//! expected count are dropped until end of acquisition.
//!
//! Existing files are never overwritten: if `<acq>_<dataset>.*` is taken, the
//! writer numbers the stem (`<acq>_<dataset>_1.*`, `_2`, ...).

use crate::plugin::{FrameOutput, FramePlugin};
use daq_core::{
    join_key, CompressionType, DaqError, DatasetDefinition, Frame, ParamMessage, Result,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Index record for one written frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Frame index
    pub frame_number: u64,
    /// Byte offset in the raw file
    pub offset: u64,
    /// Stored bytes
    pub len: usize,
    /// Compression of the stored bytes
    pub compression: CompressionType,
    /// Frame timed out with data missing
    pub incomplete: bool,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    acquisition_id: &'a str,
    dataset: &'a DatasetDefinition,
    frames_written: u64,
}

/// Paths written for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionFiles {
    /// Frame data
    pub raw: PathBuf,
    /// JSON-lines frame index
    pub index: PathBuf,
    /// Dataset sidecar
    pub meta: PathBuf,
}

impl AcquisitionFiles {
    /// File names for `acquisition_id` and `dataset` under `dir`.
    #[must_use]
    pub fn new(dir: &Path, acquisition_id: &str, dataset: &str) -> Self {
        Self::numbered(dir, acquisition_id, dataset, 0)
    }

    /// File names with sequence number `n` appended to the stem; 0 gives the
    /// plain names of [`AcquisitionFiles::new`].
    #[must_use]
    pub fn numbered(dir: &Path, acquisition_id: &str, dataset: &str, n: u32) -> Self {
        let acquisition = if acquisition_id.is_empty() {
            "acquisition"
        } else {
            acquisition_id
        };
        let stem = match n {
            0 => format!("{acquisition}_{dataset}"),
            n => format!("{acquisition}_{dataset}_{n}"),
        };
        Self {
            raw: dir.join(format!("{stem}.raw")),
            index: dir.join(format!("{stem}.index.jsonl")),
            meta: dir.join(format!("{stem}.json")),
        }
    }

    fn any_exists(&self) -> bool {
        [&self.raw, &self.index, &self.meta].iter().any(|p| p.exists())
    }
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

struct OpenAcquisition {
    acquisition_id: String,
    files: AcquisitionFiles,
    raw: BufWriter<File>,
    index: BufWriter<File>,
    offset: u64,
    frames_written: u64,
    last_frame: Option<u64>,
}

/// Sink stage writing frames to disk. Forwards nothing.
pub struct FileWriter {
    name: String,
    directory: PathBuf,
    dataset: DatasetDefinition,
    open: Option<OpenAcquisition>,
    /// Acquisition closed on reaching the expected frame count.
    finished: Option<String>,
    frames_written: u64,
    frames_dropped: u64,
    out_of_order: u64,
    acquisitions_closed: u64,
    last_files: Option<AcquisitionFiles>,
}

impl FileWriter {
    /// Plugin type name.
    pub const TYPE: &'static str = "file_writer";

    /// Writer for stage `name`, writing to the working directory until configured.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            directory: PathBuf::from("."),
            dataset: DatasetDefinition::default(),
            open: None,
            finished: None,
            frames_written: 0,
            frames_dropped: 0,
            out_of_order: 0,
            acquisitions_closed: 0,
            last_files: None,
        }
    }

    /// True while an acquisition's files are open.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.open.is_some()
    }

    /// Files of the open or most recently closed acquisition.
    #[must_use]
    pub fn current_files(&self) -> Option<&AcquisitionFiles> {
        self.open.as_ref().map(|o| &o.files).or(self.last_files.as_ref())
    }

    /// Dataset descriptor in use.
    #[must_use]
    pub fn dataset(&self) -> &DatasetDefinition {
        &self.dataset
    }

    /// Create the raw and index files under the first free stem.
    fn create_files(&self, acquisition_id: &str) -> Result<(AcquisitionFiles, File, File)> {
        let mut n = 0u32;
        loop {
            let files = AcquisitionFiles::numbered(&self.directory, acquisition_id, &self.dataset.name, n);
            if !files.any_exists() {
                match create_new(&files.raw) {
                    Ok(raw) => {
                        let index = create_new(&files.index)?;
                        return Ok((files, raw, index));
                    }
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
            }
            n = n.checked_add(1).ok_or_else(|| {
                DaqError::plugin(&self.name, "no free file name for acquisition")
            })?;
        }
    }

    fn open_acquisition(&mut self, frame: &Frame) -> Result<()> {
        let meta = frame.metadata();
        if self.dataset.frame_dimensions.is_empty() {
            self.dataset.frame_dimensions = meta.dimensions.clone();
        }
        fs::create_dir_all(&self.directory)?;
        let (files, raw, index) = self.create_files(&meta.acquisition_id)?;
        let raw = BufWriter::new(raw);
        let index = BufWriter::new(index);
        self.finished = None;
        info!(
            stage = %self.name,
            acquisition_id = %meta.acquisition_id,
            path = %files.raw.display(),
            expected_frames = self.dataset.num_frames,
            "Opened acquisition files"
        );
        let open = OpenAcquisition {
            acquisition_id: meta.acquisition_id.clone(),
            files,
            raw,
            index,
            offset: 0,
            frames_written: 0,
            last_frame: None,
        };
        self.write_sidecar(&open)?;
        self.open = Some(open);
        Ok(())
    }

    fn write_sidecar(&self, open: &OpenAcquisition) -> Result<()> {
        let sidecar = Sidecar {
            acquisition_id: &open.acquisition_id,
            dataset: &self.dataset,
            frames_written: open.frames_written,
        };
        let mut file = BufWriter::new(File::create(&open.files.meta)?);
        serde_json::to_writer_pretty(&mut file, &sidecar)?;
        file.flush()?;
        Ok(())
    }

    fn close_acquisition(&mut self, reason: &str) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        open.raw.flush()?;
        open.index.flush()?;
        self.write_sidecar(&open)?;
        self.acquisitions_closed += 1;
        info!(
            stage = %self.name,
            acquisition_id = %open.acquisition_id,
            frames = open.frames_written,
            bytes = open.offset,
            reason,
            "Closed acquisition files"
        );
        self.last_files = Some(open.files);
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<bool> {
        let expected = self.dataset.num_frames;
        let Some(open) = self.open.as_mut() else {
            return Err(DaqError::plugin(&self.name, "no acquisition open"));
        };
        let meta = frame.metadata();
        if let Some(last) = open.last_frame {
            if meta.frame_number != last + 1 {
                self.out_of_order += 1;
                warn!(
                    stage = %self.name,
                    expected = last + 1,
                    frame_number = meta.frame_number,
                    "Out-of-order frame"
                );
            }
        }

        open.raw.write_all(frame.data())?;
        let entry = IndexEntry {
            frame_number: meta.frame_number,
            offset: open.offset,
            len: frame.data().len(),
            compression: meta.compression,
            incomplete: meta.incomplete,
        };
        serde_json::to_writer(&mut open.index, &entry)?;
        open.index.write_all(b"\n")?;

        open.offset += frame.data().len() as u64;
        open.frames_written += 1;
        open.last_frame = Some(meta.frame_number);
        self.frames_written += 1;
        Ok(expected > 0 && open.frames_written >= expected)
    }
}

impl FramePlugin for FileWriter {
    fn plugin_type(&self) -> &'static str {
        Self::TYPE
    }

    fn process_frame(&mut self, frame: Frame, _out: &mut FrameOutput) -> Result<()> {
        let acquisition_id = &frame.metadata().acquisition_id;
        if self.open.is_none() && self.finished.as_ref() == Some(acquisition_id) {
            self.frames_dropped += 1;
            warn!(
                stage = %self.name,
                acquisition_id = %acquisition_id,
                frame_number = frame.metadata().frame_number,
                "Frame past expected count - dropped"
            );
            return Ok(());
        }
        if self
            .open
            .as_ref()
            .is_some_and(|open| &open.acquisition_id != acquisition_id)
        {
            self.close_acquisition("acquisition changed")?;
        }
        if self.open.is_none() {
            self.open_acquisition(&frame)?;
        }
        if self.write_frame(&frame)? {
            self.close_acquisition("expected frames written")?;
            self.finished = Some(frame.metadata().acquisition_id.clone());
        }
        Ok(())
    }

    fn process_end_of_acquisition(&mut self, _out: &mut FrameOutput) -> Result<()> {
        self.finished = None;
        self.close_acquisition("end of acquisition")
    }

    fn configure(&mut self, params: &ParamMessage) -> Result<()> {
        let directory = match params.get_str("file_path")? {
            Some(path) => PathBuf::from(path),
            None => self.directory.clone(),
        };
        let mut dataset = self.dataset.clone();
        if let Some(update) = params.subtree("dataset") {
            let mut merged = ParamMessage::from_value(serde_json::to_value(&dataset)?)?;
            merged.merge(&update);
            dataset = serde_json::from_value(merged.as_value())
                .map_err(|e| DaqError::malformed_parameter("dataset", e.to_string()))?;
        }
        if let Some(frames) = params.get_u64("frames")? {
            dataset.num_frames = frames;
        }
        self.directory = directory;
        self.dataset = dataset;
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "file_path"), self.directory.display().to_string());
        msg.set(&join_key(prefix, "frames"), self.dataset.num_frames);
        if let Ok(dataset) = serde_json::to_value(&self.dataset) {
            msg.set(&join_key(prefix, "dataset"), dataset);
        }
    }

    fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "writing"), self.is_writing());
        msg.set(&join_key(prefix, "frames_written"), self.frames_written);
        msg.set(&join_key(prefix, "frames_dropped"), self.frames_dropped);
        msg.set(&join_key(prefix, "out_of_order"), self.out_of_order);
        msg.set(&join_key(prefix, "acquisitions_closed"), self.acquisitions_closed);
        if let Some(open) = &self.open {
            msg.set(&join_key(prefix, "acquisition_id"), open.acquisition_id.as_str());
            msg.set(&join_key(prefix, "acquisition_frames"), open.frames_written);
        }
        if let Some(files) = self.current_files() {
            msg.set(&join_key(prefix, "file_name"), files.raw.display().to_string());
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close_acquisition("stage stopped") {
            warn!(stage = %self.name, error = %err, "Failed to close acquisition files");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{DataBlock, FrameMetadata, PixelType};
    use tracing_test::traced_test;

    fn frame(number: u64, acquisition: &str) -> Frame {
        let mut meta = FrameMetadata::new(number, "data", PixelType::Raw8, vec![4, 4]);
        meta.acquisition_id = acquisition.to_string();
        Frame::new(meta, DataBlock::from_vec(vec![number as u8; 16])).unwrap()
    }

    fn writer(dir: &Path, frames: u64) -> FileWriter {
        let mut writer = FileWriter::new("writer");
        let mut params = ParamMessage::new();
        params.set("file_path", dir.display().to_string());
        params.set("frames", frames);
        params.set("dataset/name", "images");
        writer.configure(&params).unwrap();
        writer
    }

    fn read_index(path: &Path) -> Vec<IndexEntry> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_writes_raw_index_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 0);
        let mut out = FrameOutput::new();
        for n in 0..3 {
            writer.process_frame(frame(n, "run1"), &mut out).unwrap();
        }
        assert!(out.is_empty());
        writer.process_end_of_acquisition(&mut out).unwrap();
        assert!(!writer.is_writing());

        let files = AcquisitionFiles::new(dir.path(), "run1", "images");
        let raw = fs::read(&files.raw).unwrap();
        assert_eq!(raw.len(), 48);
        assert_eq!(&raw[16..32], &[1u8; 16]);

        let index = read_index(&files.index);
        assert_eq!(index.len(), 3);
        assert_eq!(index[2].offset, 32);
        assert_eq!(index[2].compression, CompressionType::None);

        let sidecar: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&files.meta).unwrap()).unwrap();
        assert_eq!(sidecar["frames_written"], 3);
        assert_eq!(sidecar["dataset"]["name"], "images");
        assert_eq!(sidecar["dataset"]["frame_dimensions"], serde_json::json!([4, 4]));
    }

    #[test]
    fn test_closes_after_expected_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 2);
        let mut out = FrameOutput::new();
        writer.process_frame(frame(0, "a"), &mut out).unwrap();
        assert!(writer.is_writing());
        writer.process_frame(frame(1, "a"), &mut out).unwrap();
        assert!(!writer.is_writing());

        // A new acquisition id reopens under a new name.
        writer.process_frame(frame(0, "b"), &mut out).unwrap();
        assert_eq!(
            writer.current_files().unwrap().raw,
            dir.path().join("b_images.raw")
        );
    }

    #[test]
    #[traced_test]
    fn test_frames_past_expected_count_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 2);
        let mut out = FrameOutput::new();
        for n in 0..3 {
            writer.process_frame(frame(n, "a"), &mut out).unwrap();
        }
        assert!(!writer.is_writing());
        writer.process_end_of_acquisition(&mut out).unwrap();

        let files = AcquisitionFiles::new(dir.path(), "a", "images");
        let raw = fs::read(&files.raw).unwrap();
        assert_eq!(raw.len(), 32);
        assert_eq!(raw[0], 0);
        assert_eq!(read_index(&files.index).len(), 2);
        assert!(!AcquisitionFiles::numbered(dir.path(), "a", "images", 1).raw.exists());
        assert!(logs_contain("Frame past expected count - dropped"));

        let mut status = ParamMessage::new();
        writer.status("w", &mut status);
        assert_eq!(status.get_u64("w/frames_dropped").unwrap(), Some(1));
        assert_eq!(status.get_u64("w/frames_written").unwrap(), Some(2));
    }

    #[test]
    fn test_existing_files_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = FrameOutput::new();

        let mut first = writer(dir.path(), 0);
        first.process_frame(frame(7, ""), &mut out).unwrap();
        first.process_end_of_acquisition(&mut out).unwrap();

        let mut second = writer(dir.path(), 0);
        second.process_frame(frame(1, ""), &mut out).unwrap();
        second.process_frame(frame(2, ""), &mut out).unwrap();
        second.process_end_of_acquisition(&mut out).unwrap();

        let plain = AcquisitionFiles::new(dir.path(), "", "images");
        assert_eq!(plain.raw, dir.path().join("acquisition_images.raw"));
        assert_eq!(fs::read(&plain.raw).unwrap(), vec![7u8; 16]);
        assert_eq!(read_index(&plain.index).len(), 1);

        let next = AcquisitionFiles::numbered(dir.path(), "", "images", 1);
        assert_eq!(second.current_files(), Some(&next));
        assert_eq!(fs::read(&next.raw).unwrap().len(), 32);
        assert_eq!(read_index(&next.index)[0].frame_number, 1);
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_frames_logged() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 0);
        let mut out = FrameOutput::new();
        for n in [0, 2, 1] {
            writer.process_frame(frame(n, "run"), &mut out).unwrap();
        }
        assert!(logs_contain("Out-of-order frame"));
        let mut status = ParamMessage::new();
        writer.status("w", &mut status);
        assert_eq!(status.get_u64("w/out_of_order").unwrap(), Some(2));
    }

    #[test]
    fn test_bad_dataset_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 5);
        let mut params = ParamMessage::new();
        params.set("dataset/pixel_type", "complex128");
        params.set("frames", 9);
        assert!(writer.configure(&params).unwrap_err().is_configuration());
        assert_eq!(writer.dataset().num_frames, 5);
        assert_eq!(writer.dataset().pixel_type, PixelType::Raw16);
    }
}
