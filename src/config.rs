//! 播放器配置 - 通过JSON文件调整参数

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::detector::DetectorConfig;
use crate::playback::EndOfStream;
use crate::preprocess::PreprocessSettings;
use crate::queue::DEFAULT_CAPACITY;

/// 帧队列参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,     // 队列容量, 满则丢帧
    pub pop_timeout_ms: u64, // 检测线程取帧超时, 用于轮询停止标志
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            pop_timeout_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms.max(1))
    }
}

/// 播放参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub default_fps: f64,         // 视频源未提供帧率时使用
    pub end_of_stream: EndOfStream, // 播放结束策略: stop / loop
    pub log_history: usize,       // 检测日志最多保留条数
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_fps: 30.0,
            end_of_stream: EndOfStream::Stop,
            log_history: 100,
        }
    }
}

/// 播放器完整配置
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    pub queue: QueueConfig,
    pub detector: DetectorConfig,
    pub preprocess: PreprocessSettings,
    pub playback: PlaybackConfig,
}

impl PlayerConfig {
    /// 从JSON文件加载配置, 文件不存在时写出默认配置, 解析失败时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    log::info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    log::error!("❌ 保存配置失败: {:#}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, json).with_context(|| format!("写入 {} 失败", path.display()))?;
        log::info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        log::info!("🎛️  当前播放器配置:");
        log::info!(
            "  队列容量: {} | 取帧超时: {}ms",
            self.queue.capacity,
            self.queue.pop_timeout_ms
        );
        log::info!(
            "  模型: {} | 设备: {} | 置信度: {:.2} | IOU: {:.2}",
            self.detector.model_path.display(),
            self.detector.device,
            self.detector.conf_threshold,
            self.detector.iou_threshold
        );
        log::info!(
            "  预处理: {:?} | 最小间隔: {}ms | 降采样: {:.2}/{:.2} | 融合权重: {:.2}",
            self.preprocess.methods,
            self.preprocess.min_interval_ms,
            self.preprocess.downscale,
            self.preprocess.heavy_downscale,
            self.preprocess.blend_weight
        );
        log::info!(
            "  默认帧率: {:.1} | 播放结束: {:?}",
            self.playback.default_fps,
            self.playback.end_of_stream
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessMethod;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        let config = PlayerConfig::load(&path);
        assert_eq!(config, PlayerConfig::default());
        assert!(path.exists());
        assert_eq!(PlayerConfig::load(&path), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        fs::write(
            &path,
            r#"{ "queue": { "capacity": 1 }, "preprocess": { "methods": ["clahe", "sharpen"] },
                 "playback": { "end_of_stream": "loop" } }"#,
        )
        .unwrap();

        let config = PlayerConfig::load(&path);
        assert_eq!(config.queue.capacity, 1);
        assert_eq!(config.queue.pop_timeout_ms, 100);
        assert_eq!(
            config.preprocess.methods,
            vec![PreprocessMethod::Clahe, PreprocessMethod::Sharpen]
        );
        assert_eq!(config.playback.end_of_stream, EndOfStream::Loop);
        assert_eq!(config.detector.iou_threshold, 0.45);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(PlayerConfig::load(&path), PlayerConfig::default());
    }
}
