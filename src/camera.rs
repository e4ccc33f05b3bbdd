//! # Cameras
//!
//! Frame sources for the stream loop. A [`CameraSource`] knows how to open a
//! device; the opened [`Camera`] is the device handle and releases it when
//! dropped, so no exit path (normal stop, error, panic) can leak it.
//!
//! - [`FrameDirSource`] replays the image files of a directory in file-name
//!   order. Used for recorded sessions and tests.
//! - [`FfmpegSource`] captures a webcam through `ffmpeg`, which writes an
//!   MJPEG stream to stdout; frames are cut out of it on JPEG markers.

use crate::sampler::Frame;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Unblocks a camera's pending read from another thread.
pub type CameraInterrupt = Arc<dyn Fn() + Send + Sync>;

/// An opened frame source.
pub trait Camera: Send {
    /// Next frame, or `None` once the stream has ended.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Hook that makes a blocked [`read_frame`](Self::read_frame) return.
    /// Cameras whose reads cannot block for long need none.
    fn interrupt_handle(&self) -> Option<CameraInterrupt> {
        None
    }
}

/// Opens cameras. Called at session start and again to recover from a
/// failed read.
pub trait CameraSource: Send {
    fn open(&self) -> Result<Box<dyn Camera>>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Replays a directory of JPEG/PNG frames.
#[derive(Debug, Clone)]
pub struct FrameDirSource {
    dir: PathBuf,
}

impl FrameDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CameraSource for FrameDirSource {
    fn open(&self) -> Result<Box<dyn Camera>> {
        Ok(Box::new(FrameDirCamera::open(&self.dir)?))
    }
}

/// Camera over a fixed, sorted list of image files.
#[derive(Debug)]
pub struct FrameDirCamera {
    frames: std::vec::IntoIter<PathBuf>,
}

impl FrameDirCamera {
    /// Lists the frames of `dir`. Fails if the directory is unreadable or
    /// holds no image files.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut frames: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();

        if frames.is_empty() {
            bail!("No JPEG or PNG frames found in {}", dir.display());
        }
        frames.sort();

        info!("Replaying {} frames from {}", frames.len(), dir.display());
        Ok(Self {
            frames: frames.into_iter(),
        })
    }
}

impl Camera for FrameDirCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.frames.next() else {
            return Ok(None);
        };
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read frame {}", path.display()))?;
        Ok(Some(Frame::new(bytes)))
    }
}

/// Captures a V4L2 webcam through `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    device: String,
    framerate: u32,
}

impl FfmpegSource {
    pub fn new(device: impl Into<String>, framerate: u32) -> Self {
        Self {
            device: device.into(),
            framerate: framerate.max(1),
        }
    }
}

impl CameraSource for FfmpegSource {
    fn open(&self) -> Result<Box<dyn Camera>> {
        Ok(Box::new(FfmpegCamera::spawn(&self.device, self.framerate)?))
    }
}

/// Running `ffmpeg` capture. Dropping it stops the capture.
pub struct FfmpegCamera {
    child: Arc<Mutex<Child>>,
    frames: MjpegReader<BufReader<ChildStdout>>,
}

impl FfmpegCamera {
    pub fn spawn(device: &str, framerate: u32) -> Result<Self> {
        info!("Opening camera {device} through ffmpeg at {framerate} fps");

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "v4l2"])
            .args(["-framerate", &framerate.to_string()])
            .args(["-i", device])
            .args(["-f", "mjpeg", "-q:v", "5", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to start ffmpeg. Try installing ffmpeg.")?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture ffmpeg output")?;
        let mut camera = Self {
            child: Arc::new(Mutex::new(child)),
            frames: MjpegReader::new(BufReader::new(stdout)),
        };

        // A camera that cannot deliver one frame is not usable.
        match camera.frames.next_jpeg() {
            Ok(Some(_)) => Ok(camera),
            Ok(None) => bail!("Camera {device} produced no frames"),
            Err(e) => Err(e).with_context(|| format!("Failed to read from camera {device}")),
        }
    }
}

impl Camera for FfmpegCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.next_jpeg()?.map(Frame::new))
    }

    /// Kills ffmpeg; the pending read then sees end of stream.
    fn interrupt_handle(&self) -> Option<CameraInterrupt> {
        let child = Arc::clone(&self.child);
        Some(Arc::new(move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }))
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        debug!("Releasing ffmpeg camera");
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest image the reader buffers while waiting for its end marker.
pub const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

/// Cuts JPEG images out of a concatenated MJPEG byte stream.
pub struct MjpegReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
    limit: usize,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_JPEG_BYTES)
    }

    /// An image still open after `limit` bytes is dropped and the reader
    /// resyncs on the next start marker.
    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
            limit,
        }
    }

    /// Next complete JPEG, `None` at end of stream. A truncated trailing
    /// image is discarded.
    pub fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find(&self.buf, &JPEG_SOI, 0) {
                if let Some(end) = find(&self.buf, &JPEG_EOI, start + JPEG_SOI.len()) {
                    let end = end + JPEG_EOI.len();
                    let jpeg = self.buf[start..end].to_vec();
                    self.buf.drain(..end);
                    return Ok(Some(jpeg));
                }
                if self.buf.len() - start > self.limit {
                    warn!("Dropping MJPEG image without end marker after {} bytes", self.limit);
                    self.buf.drain(..start + JPEG_SOI.len());
                    continue;
                }
            } else if self.buf.len() > 1 {
                // Keep a possible split marker byte.
                let keep = self.buf.len() - 1;
                self.buf.drain(..keep);
            }

            if self.eof {
                return Ok(None);
            }

            let mut chunk = [0u8; 16 * 1024];
            match self.inner.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("Failed to read MJPEG stream"),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Reader that hands out one byte at a time, to split markers.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        let mut bytes = JPEG_SOI.to_vec();
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&JPEG_EOI);
        bytes
    }

    #[test]
    fn test_mjpeg_reader_splits_frames() -> Result<()> {
        let mut stream = vec![0x00, 0x01];
        stream.extend(fake_jpeg(b"one"));
        stream.extend(fake_jpeg(b"two"));

        let mut reader = MjpegReader::new(Cursor::new(stream));
        assert_eq!(reader.next_jpeg()?, Some(fake_jpeg(b"one")));
        assert_eq!(reader.next_jpeg()?, Some(fake_jpeg(b"two")));
        assert_eq!(reader.next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn test_mjpeg_reader_handles_split_markers() -> Result<()> {
        let mut stream = fake_jpeg(b"abc");
        stream.extend(fake_jpeg(b"def"));

        let mut reader = MjpegReader::new(Trickle(Cursor::new(stream)));
        assert_eq!(reader.next_jpeg()?, Some(fake_jpeg(b"abc")));
        assert_eq!(reader.next_jpeg()?, Some(fake_jpeg(b"def")));
        assert_eq!(reader.next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn test_mjpeg_reader_drops_truncated_frame() -> Result<()> {
        let mut stream = fake_jpeg(b"full");
        stream.extend_from_slice(&JPEG_SOI);
        stream.extend_from_slice(b"cut off");

        let mut reader = MjpegReader::new(Cursor::new(stream));
        assert!(reader.next_jpeg()?.is_some());
        assert_eq!(reader.next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn test_mjpeg_reader_resyncs_after_oversized_frame() -> Result<()> {
        let mut stream = JPEG_SOI.to_vec();
        stream.extend(std::iter::repeat(0x11).take(40));
        stream.extend(fake_jpeg(b"ok"));

        let mut reader = MjpegReader::with_limit(Trickle(Cursor::new(stream)), 16);
        assert_eq!(reader.next_jpeg()?, Some(fake_jpeg(b"ok")));
        assert_eq!(reader.next_jpeg()?, None);
        assert!(reader.buf.len() <= 16 + JPEG_SOI.len());
        Ok(())
    }

    #[test]
    fn test_frame_dir_camera_needs_no_interrupt() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("frame.jpg"), b"bytes")?;
        let camera = FrameDirSource::new(dir.path()).open()?;
        assert!(camera.interrupt_handle().is_none());
        Ok(())
    }

    #[test]
    fn test_frame_dir_replays_in_name_order() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("frame_002.jpg"), b"second")?;
        fs::write(dir.path().join("frame_001.png"), b"first")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut camera = FrameDirSource::new(dir.path()).open()?;
        assert_eq!(camera.read_frame()?.map(|f| f.bytes), Some(b"first".to_vec()));
        assert_eq!(camera.read_frame()?.map(|f| f.bytes), Some(b"second".to_vec()));
        assert!(camera.read_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn test_frame_dir_without_images_fails_to_open() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("readme.md"), b"no frames here")?;

        assert!(FrameDirSource::new(dir.path()).open().is_err());
        assert!(FrameDirSource::new(dir.path().join("missing")).open().is_err());
        Ok(())
    }
}
