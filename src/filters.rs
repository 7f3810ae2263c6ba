//! 图像增强滤镜 (CLAHE / 直方图均衡 / 锐化 / 去噪 / 对比度)
//!
//! 亮度类滤镜只作用于亮度通道, 再把亮度变化量加回 RGB, 色度基本不变

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::{median_filter, sharpen3x3};

use crate::error::{PipelineError, Result};

/// CLAHE 网格数 (每个方向)
pub const CLAHE_TILES: u32 = 8;
/// CLAHE 裁剪系数
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;
/// 对比度增强百分比
pub const CONTRAST_AMOUNT: f32 = 30.0;
/// 中值滤波半径
pub const DENOISE_RADIUS: u32 = 1;

/// 单个滤镜: 输入图像 → 输出图像 (尺寸不变)
pub trait ImageFilter: Send {
    fn apply(&self, image: &RgbImage) -> Result<RgbImage>;
}

impl<F> ImageFilter for F
where
    F: Fn(&RgbImage) -> Result<RgbImage> + Send,
{
    fn apply(&self, image: &RgbImage) -> Result<RgbImage> {
        self(image)
    }
}

fn ensure_not_empty(image: &RgbImage, name: &str) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::preprocess(format!("{}: 空图像", name)));
    }
    Ok(())
}

/// 限制对比度的自适应直方图均衡
pub fn clahe(image: &RgbImage) -> Result<RgbImage> {
    ensure_not_empty(image, "clahe")?;
    Ok(map_luma(image, |y| clahe_gray(y, CLAHE_TILES, CLAHE_CLIP_LIMIT)))
}

/// 全局直方图均衡
pub fn equalize(image: &RgbImage) -> Result<RgbImage> {
    ensure_not_empty(image, "histeq")?;
    Ok(map_luma(image, equalize_histogram))
}

/// 3x3 锐化
pub fn sharpen(image: &RgbImage) -> Result<RgbImage> {
    ensure_not_empty(image, "sharpen")?;
    Ok(map_luma(image, sharpen3x3))
}

/// 中值滤波去噪
pub fn denoise(image: &RgbImage) -> Result<RgbImage> {
    ensure_not_empty(image, "denoise")?;
    Ok(median_filter(image, DENOISE_RADIUS, DENOISE_RADIUS))
}

/// 线性对比度增强
pub fn adjust_contrast(image: &RgbImage) -> Result<RgbImage> {
    ensure_not_empty(image, "contrast")?;
    Ok(image::imageops::contrast(image, CONTRAST_AMOUNT))
}

/// BT.601 亮度
fn luma_of(p: &Rgb<u8>) -> u8 {
    let [r, g, b] = p.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// 对亮度通道做变换, 再把亮度差加回三个通道
fn map_luma<F>(image: &RgbImage, f: F) -> RgbImage
where
    F: FnOnce(&GrayImage) -> GrayImage,
{
    let (w, h) = image.dimensions();
    let luma = GrayImage::from_fn(w, h, |x, y| Luma([luma_of(image.get_pixel(x, y))]));
    let mapped = f(&luma);

    let mut out = image.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        let delta = mapped.get_pixel(x, y)[0] as i16 - luma.get_pixel(x, y)[0] as i16;
        for c in p.0.iter_mut() {
            *c = (*c as i16 + delta).clamp(0, 255) as u8;
        }
    }
    out
}

/// 灰度图 CLAHE: 分块直方图裁剪均衡, 块之间双线性插值
pub fn clahe_gray(image: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let tile_w = w.div_ceil(tiles.clamp(1, w));
    let tile_h = h.div_ceil(tiles.clamp(1, h));
    // 向上取整后块数可能变少, 只保留含有像素的块
    let tx = w.div_ceil(tile_w);
    let ty = h.div_ceil(tile_h);

    // 每个块的查找表
    let mut luts = vec![[0u8; 256]; (tx * ty) as usize];
    for j in 0..ty {
        for i in 0..tx {
            let (x0, y0) = (i * tile_w, j * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(w), (y0 + tile_h).min(h));

            let mut hist = [0u32; 256];
            let mut n = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                    n += 1;
                }
            }
            luts[(j * tx + i) as usize] = clipped_equalization_lut(&mut hist, n, clip_limit);
        }
    }

    let center = |pos: u32, size: u32, count: u32| -> (usize, usize, f32) {
        let f = (pos as f32 + 0.5) / size as f32 - 0.5;
        let lo = f.floor().clamp(0.0, (count - 1) as f32);
        let hi = (lo + 1.0).min((count - 1) as f32);
        let a = (f - lo).clamp(0.0, 1.0);
        (lo as usize, hi as usize, a)
    };

    GrayImage::from_fn(w, h, |x, y| {
        let v = image.get_pixel(x, y)[0] as usize;
        let (i0, i1, ax) = center(x, tile_w, tx);
        let (j0, j1, ay) = center(y, tile_h, ty);
        let lut = |i: usize, j: usize| luts[j * tx as usize + i][v] as f32;

        let top = lut(i0, j0) * (1.0 - ax) + lut(i1, j0) * ax;
        let bottom = lut(i0, j1) * (1.0 - ax) + lut(i1, j1) * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

/// 裁剪直方图并把超出部分平均分配, 返回累积分布查找表
fn clipped_equalization_lut(hist: &mut [u32; 256], n: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if n == 0 {
        return lut;
    }
    let clip = ((clip_limit * n as f32 / 256.0) as u32).max(1);

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let (share, remainder) = (excess / 256, excess % 256);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from((i as u32) < remainder);
    }

    let mut cdf = 0u32;
    for (v, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[v] = ((cdf as f32 * 255.0 / n as f32).round()).clamp(0.0, 255.0) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 低对比度渐变图
    fn dull(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, _| {
            let v = 100 + (x * 20 / w.max(1)) as u8;
            Rgb([v, v, v])
        })
    }

    fn spread(image: &RgbImage) -> u8 {
        let lumas: Vec<u8> = image.pixels().map(luma_of).collect();
        lumas.iter().max().unwrap() - lumas.iter().min().unwrap()
    }

    #[test]
    fn equalization_stretches_dull_image() {
        let img = dull(64, 16);
        assert!(spread(&equalize(&img).unwrap()) > spread(&img));
        assert_ne!(clahe(&img).unwrap(), img);
    }

    #[test]
    fn clahe_lut_is_monotonic() {
        let mut hist = [0u32; 256];
        hist[10] = 500;
        hist[200] = 12;
        let lut = clipped_equalization_lut(&mut hist, 512, 4.0);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lut[255], 255);
    }

    #[test]
    fn filters_keep_dimensions() {
        let img = dull(33, 17);
        let filters: [fn(&RgbImage) -> Result<RgbImage>; 5] =
            [clahe, equalize, sharpen, denoise, adjust_contrast];
        for f in filters {
            assert_eq!(f(&img).unwrap().dimensions(), (33, 17));
        }
    }

    #[test]
    fn empty_image_is_an_error() {
        let empty = RgbImage::new(0, 0);
        assert!(matches!(clahe(&empty), Err(PipelineError::Preprocess(_))));
        assert!(denoise(&empty).is_err());
    }

    #[test]
    fn denoise_removes_salt_pixel() {
        let mut img = RgbImage::from_pixel(9, 9, Rgb([50, 50, 50]));
        img.put_pixel(4, 4, Rgb([255, 255, 255]));
        assert_eq!(denoise(&img).unwrap().get_pixel(4, 4), &Rgb([50, 50, 50]));
    }

    #[test]
    fn clahe_handles_images_smaller_than_grid() {
        let img = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 40 + y * 10) as u8]));
        assert_eq!(clahe_gray(&img, 8, 2.0).dimensions(), (3, 2));
    }

    #[test]
    fn clahe_uniform_small_image_has_no_edge_seam() {
        // 10 / 8 向上取整为 2, 只能切出 5 块
        let img = GrayImage::from_pixel(10, 10, Luma([128]));
        let out = clahe_gray(&img, 8, 2.0);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));

        let tall = GrayImage::from_pixel(7, 23, Luma([90]));
        let out = clahe_gray(&tall, 8, 2.0);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }
}
