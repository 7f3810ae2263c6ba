/// 预处理调度器 (Preprocessing dispatcher)
///
/// 推理前按配置对帧做增强, 在画质与延迟之间折中:
/// - 限频: 距上次预处理不足 min_interval 时直接复用最近一次结果
/// - 降采样: 先缩小 (重滤镜缩得更小) 再滤波, 最后放大回原尺寸.
///   滤镜作用在低分辨率代理图上, 不是原图
/// - 时域平滑: 新结果与上一结果按 0.8/0.2 加权融合, 减少自适应滤镜的闪烁
/// - 未选择任何滤镜 (或只有 none) 时原样返回, 不限频也不缓存
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use fast_image_resize as fr;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::filters::{self, ImageFilter};

/// 预处理方法 (固定枚举, 迭代顺序即声明顺序)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessMethod {
    None,
    Clahe,
    HistEq,
    Sharpen,
    Denoise,
    Contrast,
}

impl PreprocessMethod {
    pub const ALL: [PreprocessMethod; 6] = [
        PreprocessMethod::None,
        PreprocessMethod::Clahe,
        PreprocessMethod::HistEq,
        PreprocessMethod::Sharpen,
        PreprocessMethod::Denoise,
        PreprocessMethod::Contrast,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PreprocessMethod::None => "none",
            PreprocessMethod::Clahe => "clahe",
            PreprocessMethod::HistEq => "histeq",
            PreprocessMethod::Sharpen => "sharpen",
            PreprocessMethod::Denoise => "denoise",
            PreprocessMethod::Contrast => "contrast",
        }
    }

    /// 开销大的滤镜, 使用更小的降采样比例
    pub fn is_heavy(&self) -> bool {
        matches!(self, PreprocessMethod::Clahe | PreprocessMethod::Denoise)
    }
}

impl fmt::Display for PreprocessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PreprocessMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        PreprocessMethod::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| PipelineError::config(format!("未知预处理方法: {}", s)))
    }
}

/// 解析逗号分隔的方法列表, 例如 "clahe,sharpen"
pub fn parse_methods(list: &str) -> Result<Vec<PreprocessMethod>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// 去重、排序、去掉 none
pub fn normalize_methods(methods: &[PreprocessMethod]) -> Vec<PreprocessMethod> {
    let mut out: Vec<_> = methods
        .iter()
        .copied()
        .filter(|m| *m != PreprocessMethod::None)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// 预处理参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessSettings {
    pub methods: Vec<PreprocessMethod>,
    pub min_interval_ms: u64,  // 两次预处理最小间隔 (约 1/15 秒)
    pub downscale: f32,        // 普通滤镜的线性缩放比例
    pub heavy_downscale: f32,  // CLAHE/去噪 的缩放比例
    pub blend_weight: f32,     // 新帧权重, 旧帧为 1 - w
    pub history_len: usize,    // 时域缓存长度
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            min_interval_ms: 66,
            downscale: 0.5,
            heavy_downscale: 0.35,
            blend_weight: 0.8,
            history_len: 2,
        }
    }
}

impl PreprocessSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// 本次预处理走了哪条路径
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Bypassed,  // 无滤镜, 原样返回
    Throttled, // 限频, 复用缓存或原图
    Applied,   // 实际执行了滤镜链
}

/// 预处理结果
pub struct Preprocessed {
    pub image: RgbImage,
    pub outcome: Outcome,
    pub errors: Vec<PipelineError>, // 单个滤镜失败不影响其它滤镜
}

/// 预处理调度器, 由检测线程独占
pub struct Preprocessor {
    settings: PreprocessSettings,
    methods: Vec<PreprocessMethod>,
    filters: BTreeMap<PreprocessMethod, Box<dyn ImageFilter>>,
    history: VecDeque<RgbImage>,
    last_applied: Option<Instant>,
    resizer: fr::Resizer,
}

impl Preprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        let mut bank: BTreeMap<PreprocessMethod, Box<dyn ImageFilter>> = BTreeMap::new();
        bank.insert(PreprocessMethod::Clahe, Box::new(filters::clahe));
        bank.insert(PreprocessMethod::HistEq, Box::new(filters::equalize));
        bank.insert(PreprocessMethod::Sharpen, Box::new(filters::sharpen));
        bank.insert(PreprocessMethod::Denoise, Box::new(filters::denoise));
        bank.insert(PreprocessMethod::Contrast, Box::new(filters::adjust_contrast));

        let methods = normalize_methods(&settings.methods);
        Self {
            settings,
            methods,
            filters: bank,
            history: VecDeque::new(),
            last_applied: None,
            resizer: fr::Resizer::new(),
        }
    }

    /// 替换某个方法的实现
    pub fn with_filter(mut self, method: PreprocessMethod, filter: Box<dyn ImageFilter>) -> Self {
        self.filters.insert(method, filter);
        self
    }

    pub fn methods(&self) -> &[PreprocessMethod] {
        &self.methods
    }

    /// 更新方法集合; 集合变化时清空缓存, 避免复用旧配置的结果
    pub fn set_methods(&mut self, methods: &[PreprocessMethod]) {
        let methods = normalize_methods(methods);
        if methods != self.methods {
            log::info!("🎛️  预处理方法更新: {:?} → {:?}", self.methods, methods);
            self.methods = methods;
            self.history.clear();
            self.last_applied = None;
        }
    }

    pub fn apply(&mut self, image: &RgbImage) -> Preprocessed {
        self.apply_at(image, Instant::now())
    }

    pub fn apply_at(&mut self, image: &RgbImage, now: Instant) -> Preprocessed {
        if self.methods.is_empty() {
            return Preprocessed {
                image: image.clone(),
                outcome: Outcome::Bypassed,
                errors: Vec::new(),
            };
        }

        if let Some(last) = self.last_applied {
            if now.saturating_duration_since(last) < self.settings.min_interval() {
                let image = match self.history.back() {
                    Some(buffered) if buffered.dimensions() == image.dimensions() => buffered.clone(),
                    _ => image.clone(),
                };
                return Preprocessed {
                    image,
                    outcome: Outcome::Throttled,
                    errors: Vec::new(),
                };
            }
        }

        let mut errors = Vec::new();
        let (w, h) = image.dimensions();
        let scale = if self.methods.iter().any(PreprocessMethod::is_heavy) {
            self.settings.heavy_downscale
        } else {
            self.settings.downscale
        }
        .clamp(0.01, 1.0);
        let (sw, sh) = (
            ((w as f32 * scale).round() as u32).max(1),
            ((h as f32 * scale).round() as u32).max(1),
        );

        // 1. 降采样
        let mut work = match self.resize(image, sw, sh) {
            Ok(small) => small,
            Err(e) => {
                errors.push(e);
                image.clone()
            }
        };

        // 2. 滤镜链 (固定顺序)
        for method in &self.methods {
            let Some(filter) = self.filters.get(method) else {
                errors.push(PipelineError::preprocess(format!("{}: 未注册", method)));
                continue;
            };
            match filter.apply(&work) {
                Ok(out) if out.dimensions() == work.dimensions() => work = out,
                Ok(out) => errors.push(PipelineError::preprocess(format!(
                    "{}: 输出尺寸 {:?} 与输入 {:?} 不一致",
                    method,
                    out.dimensions(),
                    work.dimensions()
                ))),
                Err(e) => {
                    log::warn!("⚠️  预处理滤镜 {} 失败: {}", method, e);
                    errors.push(e);
                }
            }
        }

        // 3. 放大回原尺寸
        let restored = match self.resize(&work, w, h) {
            Ok(full) => full,
            Err(e) => {
                errors.push(e);
                image.clone()
            }
        };

        // 4. 时域平滑
        let output = match self.history.back() {
            Some(prev) if prev.dimensions() == restored.dimensions() => {
                blend(&restored, prev, self.settings.blend_weight)
            }
            _ => restored,
        };

        self.history.push_back(output.clone());
        while self.history.len() > self.settings.history_len.max(1) {
            self.history.pop_front();
        }
        self.last_applied = Some(now);

        Preprocessed {
            image: output,
            outcome: Outcome::Applied,
            errors,
        }
    }

    fn resize(&mut self, image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
        if image.dimensions() == (width, height) {
            return Ok(image.clone());
        }
        let src = fr::images::ImageRef::new(
            image.width(),
            image.height(),
            image.as_raw(),
            fr::PixelType::U8x3,
        )
        .map_err(|e| PipelineError::preprocess(format!("缩放源图像无效: {}", e)))?;
        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .map_err(|e| PipelineError::preprocess(format!("缩放失败: {}", e)))?;
        RgbImage::from_raw(width, height, dst.buffer().to_vec())
            .ok_or_else(|| PipelineError::preprocess("缩放结果尺寸不匹配"))
    }
}

/// 加权融合: w * new + (1 - w) * prev
pub fn blend(new: &RgbImage, prev: &RgbImage, weight: f32) -> RgbImage {
    let w = weight.clamp(0.0, 1.0);
    let data: Vec<u8> = new
        .as_raw()
        .iter()
        .zip(prev.as_raw())
        .map(|(&a, &b)| (w * a as f32 + (1.0 - w) * b as f32).round().clamp(0.0, 255.0) as u8)
        .collect();
    RgbImage::from_raw(new.width(), new.height(), data).unwrap_or_else(|| new.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32, offset: u8) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 7 + offset as u32) as u8,
                (y * 5) as u8,
                ((x + y) * 3) as u8,
            ])
        })
    }

    fn settings(methods: &[PreprocessMethod]) -> PreprocessSettings {
        PreprocessSettings {
            methods: methods.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn none_is_pixel_identical_and_never_throttled() {
        let mut pre = Preprocessor::new(settings(&[PreprocessMethod::None]));
        let img = gradient(32, 24, 0);
        let t0 = Instant::now();
        for _ in 0..3 {
            let out = pre.apply_at(&img, t0);
            assert_eq!(out.outcome, Outcome::Bypassed);
            assert_eq!(out.image, img);
        }
        let mut empty = Preprocessor::new(settings(&[]));
        assert_eq!(empty.apply_at(&img, t0).image, img);
    }

    #[test]
    fn calls_within_interval_return_buffered_output() {
        let mut pre = Preprocessor::new(settings(&[PreprocessMethod::Clahe]));
        let t0 = Instant::now();
        let first = pre.apply_at(&gradient(40, 30, 0), t0);
        assert_eq!(first.outcome, Outcome::Applied);
        assert!(first.errors.is_empty());

        let second = pre.apply_at(&gradient(40, 30, 90), t0 + Duration::from_millis(10));
        assert_eq!(second.outcome, Outcome::Throttled);
        assert_eq!(second.image, first.image);

        let third = pre.apply_at(&gradient(40, 30, 90), t0 + Duration::from_millis(200));
        assert_eq!(third.outcome, Outcome::Applied);
        assert_eq!(third.image.dimensions(), (40, 30));
    }

    #[test]
    fn output_keeps_original_dimensions() {
        let mut pre = Preprocessor::new(settings(&[
            PreprocessMethod::Sharpen,
            PreprocessMethod::Contrast,
            PreprocessMethod::Denoise,
        ]));
        let out = pre.apply_at(&gradient(101, 57, 3), Instant::now());
        assert_eq!(out.image.dimensions(), (101, 57));
    }

    #[test]
    fn failing_filter_does_not_abort_chain() {
        let failing = |_: &RgbImage| -> Result<RgbImage> {
            Err(PipelineError::preprocess("boom"))
        };
        let invert = |img: &RgbImage| -> Result<RgbImage> {
            let mut out = img.clone();
            image::imageops::invert(&mut out);
            Ok(out)
        };
        let mut pre = Preprocessor::new(PreprocessSettings {
            methods: vec![PreprocessMethod::Clahe, PreprocessMethod::Contrast],
            downscale: 1.0,
            heavy_downscale: 1.0,
            ..Default::default()
        })
        .with_filter(PreprocessMethod::Clahe, Box::new(failing))
        .with_filter(PreprocessMethod::Contrast, Box::new(invert));

        let img = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let out = pre.apply_at(&img, Instant::now());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.image.get_pixel(0, 0), &Rgb([245, 235, 225]));
    }

    #[test]
    fn consecutive_results_are_blended() {
        let identity = |img: &RgbImage| -> Result<RgbImage> { Ok(img.clone()) };
        let mut pre = Preprocessor::new(PreprocessSettings {
            methods: vec![PreprocessMethod::Sharpen],
            downscale: 1.0,
            ..Default::default()
        })
        .with_filter(PreprocessMethod::Sharpen, Box::new(identity));

        let t0 = Instant::now();
        pre.apply_at(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 0])), t0);
        let out = pre.apply_at(
            &RgbImage::from_pixel(4, 4, Rgb([100, 200, 250])),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(out.image.get_pixel(1, 1), &Rgb([80, 160, 200]));
    }

    #[test]
    fn changing_methods_resets_buffer() {
        let mut pre = Preprocessor::new(settings(&[PreprocessMethod::HistEq]));
        let t0 = Instant::now();
        pre.apply_at(&gradient(16, 16, 0), t0);
        pre.set_methods(&[PreprocessMethod::Sharpen, PreprocessMethod::None]);
        assert_eq!(pre.methods(), &[PreprocessMethod::Sharpen]);
        let out = pre.apply_at(&gradient(16, 16, 0), t0 + Duration::from_millis(1));
        assert_eq!(out.outcome, Outcome::Applied);
    }

    #[test]
    fn methods_parse_and_normalize() {
        let parsed = parse_methods("sharpen, CLAHE,none,sharpen").unwrap();
        assert_eq!(
            normalize_methods(&parsed),
            vec![PreprocessMethod::Clahe, PreprocessMethod::Sharpen]
        );
        assert!(parse_methods("clahe,blur").is_err());
        assert!(parse_methods("").unwrap().is_empty());
    }
}
