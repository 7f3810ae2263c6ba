//! 流水线错误类型 (Pipeline error types)

use thiserror::Error;

/// 库内统一的 Result 别名
pub type Result<T> = std::result::Result<T, PipelineError>;

/// 检测流水线可能出现的错误
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 模型加载失败 (对检测线程是致命错误)
    #[error("模型加载失败: {0}")]
    ModelLoad(String),

    /// 单帧推理失败 (可恢复)
    #[error("推理失败: {0}")]
    Inference(String),

    /// 预处理滤镜失败 (可恢复)
    #[error("预处理失败: {0}")]
    Preprocess(String),

    /// 视频源打开/读取失败
    #[error("视频源错误: {0}")]
    Source(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("图像处理错误: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn preprocess<S: Into<String>>(msg: S) -> Self {
        Self::Preprocess(msg.into())
    }

    pub fn source<S: Into<String>>(msg: S) -> Self {
        Self::Source(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// 是否为致命错误 (检测线程必须退出)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModelLoad(_))
    }
}
