use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::AgentConfig;

use super::{CameraDevice, CameraOpener, DeviceError};

const READ_CHUNK: usize = 64 * 1024;
const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;
const FIRST_FRAME_POLL: Duration = Duration::from_millis(50);
const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

struct Frame {
    data: Vec<u8>,
    captured_at: Instant,
}

type FrameSlot = Arc<Mutex<Option<Frame>>>;

/// Settings for starting an ffmpeg-backed V4L2 capture.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    device: String,
    width: u32,
    height: u32,
    fps: u32,
    warmup: Duration,
    max_frame_age: Duration,
}

impl FfmpegOpener {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            device: config.device.clone(),
            width: config.frame_width,
            height: config.frame_height,
            fps: config.stream_fps,
            warmup: config.warmup(),
            max_frame_age: Duration::from_secs(2),
        }
    }
}

impl CameraOpener for FfmpegOpener {
    type Camera = FfmpegCamera;

    fn open(&self) -> Result<FfmpegCamera, DeviceError> {
        FfmpegCamera::start(self)
    }
}

/// Continuous MJPEG capture through an ffmpeg child process. A reader thread
/// keeps the newest frame; stills and preview frames are served from it.
pub struct FfmpegCamera {
    device: String,
    child: Mutex<Option<Child>>,
    latest: FrameSlot,
    max_frame_age: Duration,
    reader: Option<JoinHandle<()>>,
}

impl FfmpegCamera {
    pub fn start(opener: &FfmpegOpener) -> Result<Self, DeviceError> {
        let mut child = spawn_ffmpeg(opener)?;
        let stdout = child.stdout.take().ok_or(DeviceError::FfmpegFailed(
            "failed to capture stdout".to_string(),
        ))?;

        let latest: FrameSlot = Arc::new(Mutex::new(None));
        let reader = {
            let latest = Arc::clone(&latest);
            let device = opener.device.clone();
            thread::spawn(move || read_frames(stdout, latest, device))
        };

        let camera = Self {
            device: opener.device.clone(),
            child: Mutex::new(Some(child)),
            latest,
            max_frame_age: opener.max_frame_age,
            reader: Some(reader),
        };

        let deadline = Instant::now() + opener.warmup;
        loop {
            if camera.latest_frame().is_some() {
                tracing::info!(device = %camera.device, "camera warmed up");
                return Ok(camera);
            }
            if !camera.is_alive() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(FIRST_FRAME_POLL);
        }

        // camera is dropped here, which stops ffmpeg
        Err(DeviceError::NoFrame(opener.device.clone()))
    }

    fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => child
                .as_mut()
                .map(|c| c.try_wait().ok().flatten().is_none())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl CameraDevice for FfmpegCamera {
    fn capture_still(&self) -> Result<Vec<u8>, DeviceError> {
        if !self.is_alive() {
            return Err(DeviceError::FfmpegFailed("ffmpeg exited".to_string()));
        }

        let slot = self
            .latest
            .lock()
            .map_err(|_| DeviceError::FfmpegFailed("frame slot poisoned".to_string()))?;
        match slot.as_ref() {
            Some(frame) if frame.captured_at.elapsed() <= self.max_frame_age => {
                Ok(frame.data.clone())
            }
            _ => Err(DeviceError::NoFrame(self.device.clone())),
        }
    }

    fn latest_frame(&self) -> Option<Vec<u8>> {
        self.latest
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|f| f.data.clone()))
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if let Some(mut child) = child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        // stdout is closed now, so the reader thread finishes
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        tracing::info!(device = %self.device, "camera released");
    }
}

fn spawn_ffmpeg(opener: &FfmpegOpener) -> Result<Child, DeviceError> {
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "warning",
            "-f",
            "v4l2",
            "-video_size",
            &format!("{}x{}", opener.width, opener.height),
            "-framerate",
            &opener.fps.to_string(),
            "-i",
            &opener.device,
            "-an",
            "-f",
            "mjpeg",
            "-q:v",
            "5",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeviceError::FfmpegNotFound
            } else {
                DeviceError::Io(e)
            }
        })
}

fn read_frames(mut stdout: ChildStdout, latest: FrameSlot, device: String) {
    let mut splitter = MjpegSplitter::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => {
                tracing::warn!(device = %device, "ffmpeg stream ended");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "camera read failed");
                return;
            }
        };

        if let Some(data) = splitter.push(&buf[..n]).pop() {
            if let Ok(mut slot) = latest.lock() {
                *slot = Some(Frame {
                    data,
                    captured_at: Instant::now(),
                });
            }
        }
    }
}

/// Splits a concatenated MJPEG byte stream into individual JPEG images.
#[derive(Debug, Default)]
pub struct MjpegSplitter {
    pending: Vec<u8>,
}

impl MjpegSplitter {
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.pending, SOI, 0) else {
                // keep a trailing 0xFF, it may begin the next marker
                let keep_tail = self.pending.last() == Some(&0xFF);
                self.pending.clear();
                if keep_tail {
                    self.pending.push(0xFF);
                }
                break;
            };

            let Some(end) = find_marker(&self.pending, EOI, start + 2) else {
                self.pending.drain(..start);
                break;
            };

            frames.push(self.pending[start..end + 2].to_vec());
            self.pending.drain(..end + 2);
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            tracing::warn!(bytes = self.pending.len(), "dropping oversized partial frame");
            self.pending.clear();
        }

        frames
    }
}

fn find_marker(data: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == marker.as_slice())
        .map(|p| p + from)
}
