/// FFmpeg 解码视频源
/// Video files and capture devices decoded through FFmpeg
///
/// 解码在独立线程中运行, 帧过滤器把每帧转成 RGB 后送入有界通道, 播放线程按需读取.
/// 通道满时解码线程等待, 文件源最多领先几帧. 跳转 = 取消当前解码 + 从目标时间重新打开.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use ez_ffmpeg::container_info::get_duration_us;
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::stream_info::{find_video_stream_info, StreamInfo};
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;

use crate::error::{PipelineError, Result};
use crate::source::VideoSource;

/// 解码线程最多领先的帧数
const DECODE_AHEAD: usize = 4;
/// 读取一帧的最长等待
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// 打开摄像头时等待首帧
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// 通道满时检查取消标志的间隔
const SEND_POLL: Duration = Duration::from_millis(100);

type Decoded = std::result::Result<RgbImage, String>;

#[derive(Clone, Debug)]
enum InputKind {
    File(PathBuf),
    Device { index: u32, url: String },
}

impl InputKind {
    fn url(&self) -> String {
        match self {
            InputKind::File(path) => path.to_string_lossy().into_owned(),
            InputKind::Device { url, .. } => url.clone(),
        }
    }

    fn to_input(&self, start_us: Option<i64>) -> Input {
        let url = self.url();
        match self {
            InputKind::File(_) => {
                let input = Input::new(url.as_str());
                match start_us {
                    Some(us) if us > 0 => input.set_start_time_us(us),
                    _ => input,
                }
            }
            // 分辨率和帧率交给设备协商, 很多摄像头不支持固定的 1280x720@30
            InputKind::Device { .. } => Input::new(url.as_str()).set_format(capture_format()),
        }
    }
}

/// 各平台的采集格式
fn capture_format() -> &'static str {
    #[cfg(target_os = "windows")]
    let format = "dshow";

    #[cfg(target_os = "macos")]
    let format = "avfoundation";

    #[cfg(target_os = "linux")]
    let format = "v4l2";

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let format = "video4linux2";

    format
}

/// 摄像头地址: Windows 按设备名, 其他平台按编号
fn camera_url(index: u32) -> Result<String> {
    #[cfg(target_os = "windows")]
    {
        let devices = ez_ffmpeg::device::get_input_video_devices()
            .map_err(|e| PipelineError::source(format!("获取摄像头列表失败: {}", e)))?;
        devices
            .get(index as usize)
            .map(|name| format!("video={}", name))
            .ok_or_else(|| PipelineError::source(format!("摄像头 {} 不存在", index)))
    }
    #[cfg(target_os = "linux")]
    {
        Ok(format!("/dev/video{}", index))
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Ok(index.to_string())
    }
}

/// 帧号 → 起始时间 (微秒)
fn start_time_us(index: u64, fps: f64) -> i64 {
    (index as f64 / fps * 1_000_000.0).round() as i64
}

/// 读取视频流信息: (帧率, 总帧数)
fn read_stream_info(path: &Path) -> Result<(Option<f64>, Option<u64>)> {
    let url = path.to_string_lossy().into_owned();
    let info = find_video_stream_info(url.as_str())
        .map_err(|e| PipelineError::source(format!("无法读取 {}: {}", url, e)))?
        .ok_or_else(|| PipelineError::source(format!("{} 中没有视频流", url)))?;
    let StreamInfo::Video { fps, nb_frames, .. } = info else {
        return Err(PipelineError::source(format!("{} 中没有视频流", url)));
    };

    let fps = (fps.is_finite() && fps > 0.0).then_some(fps);
    let frames = if nb_frames > 0 {
        Some(nb_frames as u64)
    } else {
        // 部分容器不记录帧数, 用时长估算
        match (fps, get_duration_us(url.as_str())) {
            (Some(fps), Ok(us)) if us > 0 => Some((us as f64 / 1_000_000.0 * fps).round() as u64),
            _ => None,
        }
    };
    Ok((fps, frames))
}

/// 读取 rgb24 帧, 空帧/损坏帧返回 None
///
/// 像素格式由滤镜链 "format=rgb24" 保证
unsafe fn rgb24_to_image(frame: &Frame) -> Option<RgbImage> {
    if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
        return None;
    }
    let raw = &*frame.as_ptr();
    if raw.width <= 0 || raw.height <= 0 || raw.data[0].is_null() {
        return None;
    }
    let (w, h) = (raw.width as usize, raw.height as usize);
    let stride = raw.linesize[0];
    if stride < (w * 3) as i32 {
        return None;
    }

    let mut buf = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let row = std::slice::from_raw_parts(raw.data[0].add(y * stride as usize), w * 3);
        buf.extend_from_slice(row);
    }
    RgbImage::from_raw(w as u32, h as u32, buf)
}

/// 帧过滤器: 解码帧 → RGB → 通道
struct RgbForward {
    tx: Sender<Decoded>,
    cancel: Arc<AtomicBool>,
    decoded: u64,
    skipped: u64,
}

impl FrameFilter for RgbForward {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        log::debug!("解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        if self.cancel.load(Ordering::Acquire) {
            return Err("decoder cancelled".to_string());
        }
        let Some(image) = (unsafe { rgb24_to_image(&frame) }) else {
            self.skipped += 1;
            if self.skipped <= 10 {
                log::warn!("⚠️  丢弃帧: 空帧/损坏帧 (累计 {})", self.skipped);
            }
            return Ok(None);
        };

        let mut item: Decoded = Ok(image);
        loop {
            match self.tx.send_timeout(item, SEND_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.load(Ordering::Acquire) {
                        return Err("decoder cancelled".to_string());
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err("reader closed".to_string());
                }
            }
        }
        self.decoded += 1;
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        log::debug!("解码线程退出: 解码 {} 帧, 丢弃 {} 帧", self.decoded, self.skipped);
    }
}

/// 一次解码: 线程 + 输出通道. 丢弃即取消
struct DecodeJob {
    rx: Receiver<Decoded>,
    cancel: Arc<AtomicBool>,
}

impl DecodeJob {
    fn start(kind: &InputKind, start_us: Option<i64>) -> Result<Self> {
        let (tx, rx) = bounded(DECODE_AHEAD);
        let cancel = Arc::new(AtomicBool::new(false));
        let kind = kind.clone();
        let thread_cancel = cancel.clone();

        thread::Builder::new()
            .name("tsr-decode".into())
            .spawn(move || {
                let filter = RgbForward {
                    tx: tx.clone(),
                    cancel: thread_cancel.clone(),
                    decoded: 0,
                    skipped: 0,
                };
                match run_decoder(kind.to_input(start_us), filter) {
                    Ok(()) => log::debug!("解码结束: {}", kind.url()),
                    Err(e) if thread_cancel.load(Ordering::Acquire) => {
                        log::debug!("解码已取消: {} ({})", kind.url(), e)
                    }
                    Err(e) => {
                        log::error!("❌ 解码失败 {}: {}", kind.url(), e);
                        let _ = tx.send_timeout(Err(e), READ_TIMEOUT);
                    }
                }
            })?;
        Ok(Self { rx, cancel })
    }
}

impl Drop for DecodeJob {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}

fn run_decoder(input: Input, filter: RgbForward) -> std::result::Result<(), String> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("rgb", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=rgb24"].into())
        .output(out)
        .build()
        .map_err(|e| format!("构建失败: {}", e))?;
    let sch = ctx.start().map_err(|e| format!("启动失败: {}", e))?;
    sch.wait().map_err(|e| format!("解码中断: {}", e))
}

/// FFmpeg 视频源: 视频文件 (可跳转) 或摄像头 (实时)
pub struct FfmpegSource {
    kind: InputKind,
    fps: Option<f64>,
    frames: Option<u64>,
    pos: u64,
    job: Option<DecodeJob>,
    pending: Option<RgbImage>,
}

impl FfmpegSource {
    /// 打开视频文件, 读取帧率和总帧数
    pub fn open_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::source(format!("文件不存在: {}", path.display())));
        }
        let (fps, frames) = read_stream_info(path)?;
        let kind = InputKind::File(path.to_path_buf());
        let job = DecodeJob::start(&kind, None)?;
        log::info!(
            "🎬 打开视频文件: {} | 帧率 {} | 总帧数 {}",
            path.display(),
            fps.map_or("未知".to_string(), |f| format!("{:.2}", f)),
            frames.map_or("未知".to_string(), |n| n.to_string())
        );
        Ok(Self {
            kind,
            fps,
            frames,
            pos: 0,
            job: Some(job),
            pending: None,
        })
    }

    /// 打开摄像头, 等到首帧才算成功
    pub fn open_device(index: u32) -> Result<Self> {
        let kind = InputKind::Device {
            index,
            url: camera_url(index)?,
        };
        log::info!("📷 打开摄像头 {}: {} ({})", index, kind.url(), capture_format());
        let job = DecodeJob::start(&kind, None)?;
        let first = match job.rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                return Err(PipelineError::source(format!("无法打开摄像头 {}: {}", index, e)))
            }
            Err(_) => {
                return Err(PipelineError::source(format!("摄像头 {} 没有画面", index)));
            }
        };
        log::info!("✅ 摄像头连接成功: {}x{}", first.width(), first.height());
        Ok(Self {
            kind,
            fps: None,
            frames: None,
            pos: 0,
            job: Some(job),
            pending: Some(first),
        })
    }
}

impl VideoSource for FfmpegSource {
    fn read_next(&mut self) -> Result<Option<RgbImage>> {
        if let Some(image) = self.pending.take() {
            self.pos += 1;
            return Ok(Some(image));
        }
        let Some(job) = &self.job else {
            return Ok(None);
        };
        match job.rx.recv_timeout(READ_TIMEOUT) {
            Ok(Ok(image)) => {
                self.pos += 1;
                Ok(Some(image))
            }
            Ok(Err(e)) => Err(PipelineError::source(e)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::source(format!(
                "{}: 读取超时",
                self.describe()
            ))),
        }
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        if let InputKind::Device { .. } = self.kind {
            return Err(PipelineError::source("摄像头不支持跳转"));
        }
        let fps = self
            .fps
            .ok_or_else(|| PipelineError::source("帧率未知, 无法跳转"))?;
        let index = self.frames.map_or(index, |n| index.min(n));

        self.pending = None;
        self.job = None;
        self.job = Some(DecodeJob::start(&self.kind, Some(start_time_us(index, fps)))?);
        self.pos = index;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        self.frames
    }

    fn release(&mut self) {
        self.pending = None;
        self.job = None;
    }

    fn describe(&self) -> String {
        match &self.kind {
            InputKind::File(path) => path.display().to_string(),
            InputKind::Device { index, .. } => format!("摄像头 {}", index),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.kind, InputKind::Device { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_target_time() {
        assert_eq!(start_time_us(0, 25.0), 0);
        assert_eq!(start_time_us(50, 25.0), 2_000_000);
        assert_eq!(start_time_us(1, 30.0), 33_333);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_camera_path() {
        assert_eq!(camera_url(2).unwrap(), "/dev/video2");
        assert_eq!(capture_format(), "v4l2");
    }

    #[test]
    fn missing_file_is_source_error() {
        let err = FfmpegSource::open_file(Path::new("/nonexistent/clip.mp4")).err().unwrap();
        assert!(matches!(err, PipelineError::Source(_)));
    }

    #[test]
    fn garbage_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not a video").unwrap();
        assert!(matches!(
            FfmpegSource::open_file(&path),
            Err(PipelineError::Source(_))
        ));
    }
}
