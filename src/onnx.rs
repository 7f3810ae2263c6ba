// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// ONNX YOLOv5 检测后端
///
/// ## 流程
/// ```text
/// RgbImage → letterbox(size×size, 填充114) → NCHW f32 [0,1]
///          → Session::run → [1, N, 5+nc] (cx, cy, w, h, obj, cls...)
///          → 置信度过滤 → 还原到原图坐标 → NMS → 绘制
/// ```
use image::{imageops, Rgb, RgbImage};
use ndarray::Array4;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::Tensor;

use crate::detector::{
    non_max_suppression, Detector, DetectorConfig, DetectorLoader, Device, Inference,
    OverlayRenderer,
};
use crate::error::{PipelineError, Result};
use crate::types::{BBox, Detection};

/// letterbox 填充色
const PAD_VALUE: u8 = 114;

pub struct OnnxLoader;

impl DetectorLoader for OnnxLoader {
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn Detector>> {
        Ok(Box::new(OnnxDetector::new(config)?))
    }
}

pub struct OnnxDetector {
    session: Session,
    config: DetectorConfig,
    renderer: OverlayRenderer,
}

impl OnnxDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        if config.size_hint == 0 {
            return Err(PipelineError::model_load("输入尺寸 size_hint 不能为 0"));
        }
        if !config.model_path.exists() {
            return Err(PipelineError::model_load(format!(
                "模型文件不存在: {}",
                config.model_path.display()
            )));
        }

        let builder = Session::builder()
            .map_err(|e| PipelineError::model_load(format!("创建会话失败: {}", e)))?;
        let builder = match config.device {
            Device::Cpu => builder,
            Device::Cuda(id) => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(id)
                    .build()])
                .map_err(|e| PipelineError::model_load(format!("注册 CUDA 失败: {}", e)))?,
        };
        let session = builder
            .commit_from_file(&config.model_path)
            .map_err(|e| {
                PipelineError::model_load(format!("{}: {}", config.model_path.display(), e))
            })?;

        let renderer = OverlayRenderer::from_config(config)
            .map_err(|e| PipelineError::model_load(e.to_string()))?;
        log::info!(
            "✅ ONNX 模型加载完成: {} | 设备: {}",
            config.model_path.display(),
            config.device
        );
        Ok(Self {
            session,
            config: config.clone(),
            renderer,
        })
    }
}

impl Detector for OnnxDetector {
    fn infer(&mut self, image: &RgbImage, size_hint: u32) -> Result<Inference> {
        let size = if size_hint == 0 { self.config.size_hint } else { size_hint };
        let (input, letterbox) = letterbox(image, size);

        let value = Tensor::from_array(input)
            .map_err(|e| PipelineError::inference(format!("创建输入张量失败: {}", e)))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| PipelineError::inference(e.to_string()))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| PipelineError::inference("模型没有输出"))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::inference(format!("读取输出失败: {}", e)))?;
        if shape.len() != 3 || shape[2] < 6 {
            return Err(PipelineError::inference(format!("输出形状不支持: {:?}", shape)));
        }
        let rows = shape[1] as usize;
        let stride = shape[2] as usize;

        let mut detections = decode_yolov5(data, rows, stride, &self.config, &letterbox, image);
        non_max_suppression(
            &mut detections,
            self.config.iou_threshold,
            self.config.agnostic,
            self.config.max_detections,
        );

        let rendered = self.renderer.render(image, &detections);
        Ok(Inference {
            rendered,
            detections,
        })
    }

    fn name(&self) -> &str {
        "yolov5-onnx"
    }
}

/// letterbox 参数: 输入坐标 = 原图坐标 * ratio + pad
struct Letterbox {
    ratio: f32,
    pad_x: f32,
    pad_y: f32,
}

fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, Letterbox) {
    let (w, h) = image.dimensions();
    let ratio = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
    let (nw, nh) = (
        ((w as f32 * ratio).round() as u32).clamp(1, size),
        ((h as f32 * ratio).round() as u32).clamp(1, size),
    );
    let resized = imageops::resize(image, nw, nh, imageops::FilterType::Triangle);
    let (px, py) = ((size - nw) / 2, (size - nh) / 2);

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, px as i64, py as i64);

    let s = size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, p) in canvas.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = p[c] as f32 / 255.0;
        }
    }
    (
        input,
        Letterbox {
            ratio,
            pad_x: px as f32,
            pad_y: py as f32,
        },
    )
}

/// 解码 YOLOv5 输出, 每行 (cx, cy, w, h, obj, cls0, cls1, ...)
fn decode_yolov5(
    data: &[f32],
    rows: usize,
    stride: usize,
    config: &DetectorConfig,
    lb: &Letterbox,
    image: &RgbImage,
) -> Vec<Detection> {
    let (w, h) = image.dimensions();
    let mut out = Vec::new();

    for row in data.chunks_exact(stride).take(rows) {
        let obj = row[4];
        if obj < config.conf_threshold {
            continue;
        }
        let to_box = || {
            let (cx, cy, bw, bh) = (row[0], row[1], row[2], row[3]);
            BBox::new(
                (cx - bw / 2.0 - lb.pad_x) / lb.ratio,
                (cy - bh / 2.0 - lb.pad_y) / lb.ratio,
                (cx + bw / 2.0 - lb.pad_x) / lb.ratio,
                (cy + bh / 2.0 - lb.pad_y) / lb.ratio,
            )
            .clamp_to(w, h)
        };
        let scores = &row[5..];

        if config.multi_label {
            for (class_id, &s) in scores.iter().enumerate() {
                let conf = obj * s;
                if conf >= config.conf_threshold {
                    out.push(Detection::new(config.label_for(class_id), class_id, conf, to_box()));
                }
            }
        } else if let Some((class_id, &s)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        {
            let conf = obj * s;
            if conf >= config.conf_threshold {
                out.push(Detection::new(config.label_for(class_id), class_id, conf, to_box()));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_to_square() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
        let (input, lb) = letterbox(&image, 64);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 16.0);
        assert!((input[[0, 0, 0, 0]] - PAD_VALUE as f32 / 255.0).abs() < 1e-6);
        assert!((input[[0, 0, 32, 32]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decode_maps_boxes_back_to_source() {
        let config = DetectorConfig {
            class_names: vec!["限速".into(), "停车".into()],
            ..Default::default()
        };
        let lb = Letterbox {
            ratio: 0.5,
            pad_x: 0.0,
            pad_y: 10.0,
        };
        let image = RgbImage::new(200, 100);
        #[rustfmt::skip]
        let data = [
            20.0, 30.0, 10.0, 10.0, 0.9, 0.1, 0.8,
            20.0, 30.0, 10.0, 10.0, 0.1, 0.9, 0.9,
        ];
        let dets = decode_yolov5(&data, 2, 7, &config, &lb, &image);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "停车");
        assert_eq!(dets[0].bbox, BBox::new(30.0, 30.0, 50.0, 50.0));
        assert!((dets[0].confidence - 0.72).abs() < 1e-6);
    }

    #[test]
    fn missing_model_is_load_error() {
        let config = DetectorConfig {
            model_path: "/nonexistent/best.onnx".into(),
            ..Default::default()
        };
        assert!(OnnxLoader.load(&config).err().unwrap().is_fatal());
    }

    #[test]
    fn zero_input_size_is_load_error() {
        let config = DetectorConfig {
            size_hint: 0,
            ..Default::default()
        };
        let err = OnnxLoader.load(&config).err().unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("size_hint"));
    }
}
