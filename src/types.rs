/// 检测流水线数据结构定义
/// Data structures shared by the detection pipeline
use std::sync::Arc;

use image::RgbImage;

use crate::preprocess::PreprocessMethod;

/// 无检测结果时的日志文本
pub const NO_DETECTION_TEXT: &str = "未检测到目标";

// ========== 数据结构 ==========

/// 视频帧 (播放线程 → 检测线程)
///
/// 像素数据用 Arc 共享: 入队的是同一份数据的廉价拷贝, 原始帧可以继续用于显示
#[derive(Clone, Debug)]
pub struct Frame {
    pub index: u64, // 源帧序号 (到达顺序)
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self {
            index,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// 检测框, 原始帧像素坐标 (x1,y1)-(x2,y2)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    /// 裁剪到图像范围内
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// 检测记录 (检测线程 → UI), 创建后不再修改
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub class_id: usize,
    pub confidence: f32, // [0,1]
    pub bbox: BBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, class_id: usize, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            class_id,
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// 检测结果拼成一行文本, 例如 "步行:0.85, 禁止超车:0.72"
pub fn summarize(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return NO_DETECTION_TEXT.to_string();
    }
    detections
        .iter()
        .map(|d| format!("{}:{:.2}", d.label, d.confidence))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 控制消息 (UI线程 → 检测线程)
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    SetPreprocess(Vec<PreprocessMethod>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_joins_labels_with_two_decimals() {
        let dets = vec![
            Detection::new("步行", 3, 0.854, BBox::new(0.0, 0.0, 10.0, 10.0)),
            Detection::new("禁止超车", 7, 0.72, BBox::new(5.0, 5.0, 20.0, 20.0)),
        ];
        assert_eq!(summarize(&dets), "步行:0.85, 禁止超车:0.72");
        assert_eq!(summarize(&[]), NO_DETECTION_TEXT);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn confidence_is_clamped() {
        let d = Detection::new("限速", 0, 1.3, BBox::default());
        assert_eq!(d.confidence, 1.0);
    }
}
