/// 视频源模块
/// Video sources consumed by the playback driver
///
/// - 图像序列目录 (按文件名排序) 或单张图片
/// - 合成测试源 (可指定帧数/帧率, 也可模拟实时源)
/// - 视频文件与摄像头: FFmpeg 解码 (--features ffmpeg)
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};

use crate::error::{PipelineError, Result};

/// 支持的图片扩展名
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// 视频源接口, 只在 UI 线程使用
pub trait VideoSource {
    /// 读取下一帧, 播放结束返回 Ok(None)
    fn read_next(&mut self) -> Result<Option<RgbImage>>;

    /// 跳到指定帧 (下一次 read_next 返回该帧)
    fn seek(&mut self, index: u64) -> Result<()>;

    /// 当前位置 = 已读取的帧数
    fn position(&self) -> u64;

    /// 源帧率, 未知时返回 None
    fn frame_rate(&self) -> Option<f64>;

    /// 总帧数, 实时源返回 None
    fn frame_count(&self) -> Option<u64>;

    fn release(&mut self) {}

    fn describe(&self) -> String;

    fn is_live(&self) -> bool {
        self.frame_count().is_none()
    }
}

/// 视频源描述: 路径 / 设备索引 / 合成源
#[derive(Clone, Debug, PartialEq)]
pub enum SourceSpec {
    Path(PathBuf),
    Device(u32),
    /// "synthetic:帧数[@帧率]", 帧数为 0 表示实时源
    Synthetic { frames: u64, fps: Option<f64> },
}

impl FromStr for SourceSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PipelineError::source("视频源为空"));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(SourceSpec::Device(index));
        }
        if let Some(rest) = s.strip_prefix("synthetic:") {
            let (frames, fps) = match rest.split_once('@') {
                Some((n, fps)) => (n, Some(fps)),
                None => (rest, None),
            };
            let frames = frames
                .parse::<u64>()
                .map_err(|_| PipelineError::source(format!("无效的合成源帧数: {}", frames)))?;
            let fps = fps
                .map(|f| {
                    f.parse::<f64>()
                        .map_err(|_| PipelineError::source(format!("无效的帧率: {}", f)))
                })
                .transpose()?;
            return Ok(SourceSpec::Synthetic { frames, fps });
        }
        Ok(SourceSpec::Path(PathBuf::from(s)))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Path(p) => write!(f, "{}", p.display()),
            SourceSpec::Device(i) => write!(f, "设备 {}", i),
            SourceSpec::Synthetic { frames, fps } => match fps {
                Some(fps) => write!(f, "synthetic:{}@{}", frames, fps),
                None => write!(f, "synthetic:{}", frames),
            },
        }
    }
}

/// 打开视频源
pub fn open_source(spec: &SourceSpec) -> Result<Box<dyn VideoSource>> {
    match spec {
        SourceSpec::Device(index) => open_device(*index),
        SourceSpec::Synthetic { frames, fps } => {
            let source = if *frames == 0 {
                TestPatternSource::live(*fps)
            } else {
                TestPatternSource::new(*frames, *fps)
            };
            Ok(Box::new(source))
        }
        SourceSpec::Path(path) => {
            if path.is_dir() {
                Ok(Box::new(ImageSequenceSource::from_dir(path)?))
            } else if !path.is_file() {
                Err(PipelineError::source(format!("文件不存在: {}", path.display())))
            } else if is_image_file(path) {
                Ok(Box::new(ImageSequenceSource::from_file(path)?))
            } else {
                open_video_file(path)
            }
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn open_device(index: u32) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(crate::decoder::FfmpegSource::open_device(index)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_device(index: u32) -> Result<Box<dyn VideoSource>> {
    Err(PipelineError::source(format!(
        "无法打开摄像头 {}: FFmpeg 解码未编译, 请使用 --features ffmpeg 重新构建",
        index
    )))
}

#[cfg(feature = "ffmpeg")]
fn open_video_file(path: &Path) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(crate::decoder::FfmpegSource::open_file(path)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video_file(path: &Path) -> Result<Box<dyn VideoSource>> {
    Err(PipelineError::source(format!(
        "无法打开视频 {}: FFmpeg 解码未编译, 请使用 --features ffmpeg 重新构建",
        path.display()
    )))
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 图像序列源
pub struct ImageSequenceSource {
    name: String,
    files: Vec<PathBuf>,
    pos: u64,
    fps: Option<f64>,
}

impl ImageSequenceSource {
    /// 目录内所有图片, 按文件名排序
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image_file(p))
            .collect();
        if files.is_empty() {
            return Err(PipelineError::source(format!(
                "目录中没有图片: {}",
                dir.display()
            )));
        }
        files.sort();
        log::info!("🎬 打开图像序列: {} ({} 帧)", dir.display(), files.len());
        Ok(Self {
            name: dir.display().to_string(),
            files,
            pos: 0,
            fps: None,
        })
    }

    /// 单张图片, 作为只有一帧的序列
    pub fn from_file(path: &Path) -> Result<Self> {
        if !is_image_file(path) {
            return Err(PipelineError::source(format!(
                "不支持的文件格式: {}",
                path.display()
            )));
        }
        Ok(Self {
            name: path.display().to_string(),
            files: vec![path.to_path_buf()],
            pos: 0,
            fps: None,
        })
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }
}

impl VideoSource for ImageSequenceSource {
    fn read_next(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.pos as usize) else {
            return Ok(None);
        };
        // 先前进, 坏文件不会卡住播放
        self.pos += 1;
        let image = image::open(path)
            .map_err(|e| PipelineError::source(format!("读取 {} 失败: {}", path.display(), e)))?;
        Ok(Some(image.to_rgb8()))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        self.pos = index.min(self.files.len() as u64);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.files.len() as u64)
    }

    fn release(&mut self) {
        self.files.clear();
        self.pos = 0;
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// 合成测试源: 渐变背景 + 移动的红色方块
pub struct TestPatternSource {
    frames: Option<u64>,
    fps: Option<f64>,
    width: u32,
    height: u32,
    pos: u64,
    read_delay: Option<Duration>,
}

impl TestPatternSource {
    pub fn new(frames: u64, fps: Option<f64>) -> Self {
        Self {
            frames: Some(frames),
            fps,
            width: 160,
            height: 120,
            pos: 0,
            read_delay: None,
        }
    }

    /// 无限长、不可跳转的实时源
    pub fn live(fps: Option<f64>) -> Self {
        Self {
            frames: None,
            ..Self::new(0, fps)
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    /// 每次读取前等待, 模拟解码耗时
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    fn render(&self, index: u64) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let side = (w.min(h) / 4).max(1);
        let x0 = (index as u32 * 4) % w.saturating_sub(side).max(1);
        let y0 = (h - side.min(h)) / 2;
        RgbImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x0 + side && y >= y0 && y < y0 + side {
                Rgb([220, 30, 30])
            } else {
                Rgb([
                    (x * 255 / w) as u8,
                    (y * 255 / h) as u8,
                    (index % 256) as u8,
                ])
            }
        })
    }
}

impl VideoSource for TestPatternSource {
    fn read_next(&mut self) -> Result<Option<RgbImage>> {
        if let Some(total) = self.frames {
            if self.pos >= total {
                return Ok(None);
            }
        }
        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }
        let image = self.render(self.pos);
        self.pos += 1;
        Ok(Some(image))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        match self.frames {
            Some(total) => {
                self.pos = index.min(total);
                Ok(())
            }
            None => Err(PipelineError::source("实时源不支持跳转")),
        }
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

    fn describe(&self) -> String {
        match self.frames {
            Some(n) => format!("合成源 ({} 帧)", n),
            None => "合成实时源".to_string(),
        }
    }
}
