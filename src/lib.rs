#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 播放器配置
#[cfg(feature = "ffmpeg")]
pub mod decoder; // FFmpeg 视频文件/摄像头解码
pub mod detector; // 检测器接口 + 检测框绘制
pub mod error; // 错误类型
pub mod filters; // 图像增强滤镜
pub mod playback; // 播放驱动
pub mod player; // 播放控制器
pub mod preprocess; // 预处理调度
pub mod queue; // 帧队列
pub mod source; // 视频源
pub mod startup; // 启动同步
pub mod types; // 公共数据结构
pub mod worker; // 检测线程

#[cfg(feature = "onnx")]
pub mod onnx; // ONNX YOLOv5 后端

pub use crate::config::PlayerConfig;
pub use crate::detector::{Detector, DetectorConfig, DetectorKind, DetectorLoader, Device, Inference};
pub use crate::error::{PipelineError, Result};
pub use crate::player::{Player, UiSink};
pub use crate::preprocess::{PreprocessMethod, PreprocessSettings, Preprocessor};
pub use crate::queue::{FrameQueue, Popped};
pub use crate::source::{open_source, SourceSpec, VideoSource};
pub use crate::types::{BBox, Detection, Frame};
pub use crate::worker::{WorkerEvent, WorkerHandle, WorkerState};

/// 本地时间字符串, 用于文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}
