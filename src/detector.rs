/// 检测器统一接口 (External detector capability)
///
/// ## 核心流程
/// ```text
/// DetectorLoader::load(config) → Box<dyn Detector>   (检测线程内加载, 独占所有权)
///          ↓
/// Detector::infer(frame, size_hint) → Inference { rendered, detections }
/// ```
///
/// 具体模型只需要实现这两个 trait, 流水线不关心推理细节
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::Detection;

/// 推理设备
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
}

impl FromStr for Device {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if s == "cuda" {
            return Ok(Device::Cuda(0));
        }
        // "cuda:0" 或纯数字 "0"
        let id = s.strip_prefix("cuda:").unwrap_or(&s);
        id.parse::<i32>()
            .map(Device::Cuda)
            .map_err(|_| PipelineError::config(format!("无法识别的设备: {}", s)))
    }
}

impl TryFrom<String> for Device {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(d: Device) -> String {
        d.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

/// 检测器配置参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub device: Device,
    pub conf_threshold: f32, // 置信度阈值
    pub iou_threshold: f32,  // NMS IOU阈值
    pub max_detections: usize,
    pub agnostic: bool,    // NMS 是否忽略类别
    pub multi_label: bool, // 每个框允许多个类别
    pub size_hint: u32,    // 推理输入尺寸
    pub class_names: Vec<String>,
    pub font_path: Option<PathBuf>, // 标签字体, 为空则只画框
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/best.onnx"),
            device: Device::Cpu,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 1000,
            agnostic: false,
            multi_label: false,
            size_hint: 416,
            class_names: Vec::new(),
            font_path: None,
        }
    }
}

impl DetectorConfig {
    /// 类别名称, 未配置时回退为 "classN"
    pub fn label_for(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }
}

/// 单帧推理输出
#[derive(Clone, Debug)]
pub struct Inference {
    pub rendered: RgbImage, // 已画好检测框的图像
    pub detections: Vec<Detection>,
}

/// 统一的检测器接口, 由检测线程独占
pub trait Detector: Send {
    /// 推理: 图像 → 渲染图 + 检测记录 (坐标为输入图像像素坐标)
    fn infer(&mut self, image: &RgbImage, size_hint: u32) -> Result<Inference>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 检测器加载器. 加载失败对检测线程是致命的
pub trait DetectorLoader: Send {
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn Detector>>;
}

impl<F> DetectorLoader for F
where
    F: Fn(&DetectorConfig) -> Result<Box<dyn Detector>> + Send,
{
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn Detector>> {
        self(config)
    }
}

/// 检测后端类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    /// 空检测器: 不做推理, 原样输出 (用于预览预处理效果)
    Noop,
    /// ONNX YOLOv5 (需要 --features onnx)
    Onnx,
}

impl FromStr for DetectorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "noop" => Ok(DetectorKind::Noop),
            "onnx" | "yolov5" => Ok(DetectorKind::Onnx),
            other => Err(PipelineError::config(format!("未知检测器类型: {}", other))),
        }
    }
}

/// 根据类型创建加载器
pub fn loader_for(kind: DetectorKind) -> Box<dyn DetectorLoader> {
    match kind {
        DetectorKind::Noop => Box::new(NoopLoader),
        DetectorKind::Onnx => onnx_loader(),
    }
}

#[cfg(feature = "onnx")]
fn onnx_loader() -> Box<dyn DetectorLoader> {
    Box::new(crate::onnx::OnnxLoader)
}

#[cfg(not(feature = "onnx"))]
fn onnx_loader() -> Box<dyn DetectorLoader> {
    Box::new(|_: &DetectorConfig| -> Result<Box<dyn Detector>> {
        Err(PipelineError::model_load(
            "ONNX 后端未编译, 请使用 --features onnx 重新构建",
        ))
    })
}

/// 空检测器
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn infer(&mut self, image: &RgbImage, _size_hint: u32) -> Result<Inference> {
        Ok(Inference {
            rendered: image.clone(),
            detections: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

pub struct NoopLoader;

impl DetectorLoader for NoopLoader {
    fn load(&self, _config: &DetectorConfig) -> Result<Box<dyn Detector>> {
        Ok(Box::new(NoopDetector))
    }
}

/// 非极大值抑制: 按置信度降序, 丢弃与已保留框 IOU 过大的框
///
/// `agnostic` 为 false 时只在同类别之间抑制
pub fn non_max_suppression(
    dets: &mut Vec<Detection>,
    iou_threshold: f32,
    agnostic: bool,
    max_detections: usize,
) {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..dets.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let same_class = agnostic || dets[prev_index].class_id == dets[index].class_id;
            if same_class && dets[prev_index].bbox.iou(&dets[index].bbox) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            dets.swap(current_index, index);
            current_index += 1;
        }
    }
    dets.truncate(current_index.min(max_detections));
}

/// 检测框绘制 (绿色框 + 标签背景 + 白色文字)
pub struct OverlayRenderer {
    font: Option<FontVec>,
    color: Rgb<u8>,
    thickness: u32,
    scale: f32,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self {
            font: None,
            color: Rgb([0, 255, 0]),
            thickness: 2,
            scale: 18.0,
        }
    }
}

impl OverlayRenderer {
    /// 按配置加载标签字体
    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        let mut renderer = Self::default();
        if let Some(path) = &config.font_path {
            let bytes = std::fs::read(path)?;
            let font = FontVec::try_from_vec(bytes).map_err(|e| {
                PipelineError::config(format!("字体加载失败 {}: {}", path.display(), e))
            })?;
            renderer.font = Some(font);
        }
        Ok(renderer)
    }

    pub fn render(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.clone();
        let (w, h) = canvas.dimensions();

        for det in detections {
            let b = det.bbox.clamp_to(w, h);
            let (x1, y1) = (b.x1 as i32, b.y1 as i32);
            let (bw, bh) = (b.width() as u32, b.height() as u32);

            // 画矩形 (通过内缩实现线宽)
            for t in 0..self.thickness {
                if bw <= 2 * t || bh <= 2 * t {
                    break;
                }
                let rect = Rect::at(x1 + t as i32, y1 + t as i32).of_size(bw - 2 * t, bh - 2 * t);
                draw_hollow_rect_mut(&mut canvas, rect, self.color);
            }

            // 在框上方写标签文字
            if let Some(font) = &self.font {
                let text = format!("{} {:.2}", det.label, det.confidence);
                let scale = PxScale::from(self.scale);
                let (tw, th) = text_size(scale, font, &text);
                if tw == 0 || th == 0 {
                    continue;
                }
                let top = (y1 - th as i32 - 4).max(0);
                draw_filled_rect_mut(&mut canvas, Rect::at(x1, top).of_size(tw, th + 4), self.color);
                draw_text_mut(&mut canvas, Rgb([255, 255, 255]), x1, top + 2, scale, font, &text);
            }
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BBox;

    fn det(class_id: usize, conf: f32, x: f32) -> Detection {
        Detection::new(format!("c{}", class_id), class_id, conf, BBox::new(x, 0.0, x + 10.0, 10.0))
    }

    #[test]
    fn device_parses_common_spellings() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("0".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn nms_suppresses_overlaps_per_class() {
        let mut dets = vec![det(0, 0.6, 1.0), det(0, 0.9, 0.0), det(1, 0.8, 0.0), det(0, 0.7, 50.0)];
        non_max_suppression(&mut dets, 0.45, false, 100);
        let kept: Vec<(usize, f32)> = dets.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(kept, vec![(0, 0.9), (1, 0.8), (0, 0.7)]);

        let mut dets = vec![det(0, 0.9, 0.0), det(1, 0.8, 0.0)];
        non_max_suppression(&mut dets, 0.45, true, 100);
        assert_eq!(dets.len(), 1);
    }

    #[test]
    fn nms_respects_max_detections() {
        let mut dets: Vec<Detection> = (0..5).map(|i| det(0, 0.5, i as f32 * 100.0)).collect();
        non_max_suppression(&mut dets, 0.45, false, 2);
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn overlay_draws_green_box_edges() {
        let image = RgbImage::new(40, 40);
        let dets = vec![Detection::new("停车", 0, 0.9, BBox::new(5.0, 5.0, 25.0, 25.0))];
        let out = OverlayRenderer::default().render(&image, &dets);
        assert_eq!(out.get_pixel(5, 5), &Rgb([0, 255, 0]));
        assert_eq!(out.get_pixel(6, 15), &Rgb([0, 255, 0]));
        assert_eq!(out.get_pixel(15, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_boxes_are_ignored() {
        let image = RgbImage::new(10, 10);
        let dets = vec![Detection::new("x", 0, 0.5, BBox::new(20.0, 20.0, 30.0, 30.0))];
        let out = OverlayRenderer::default().render(&image, &dets);
        assert_eq!(out, image);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn onnx_loader_without_feature_fails_to_load() {
        let loader = loader_for(DetectorKind::Onnx);
        let err = loader.load(&DetectorConfig::default()).err().unwrap();
        assert!(err.is_fatal());
    }
}
