//! 启动同步: 第 0 帧的检测结果到达之前不启动播放定时器
//!
//! 打开视频源后保留第 0 帧原图. 收到第一个检测结果 (或该帧的推理错误) 时,
//! 把保留的原图与结果配对显示, 然后切换到 Streaming, 由调用方启动定时器.

use crate::types::Frame;

#[derive(Clone, Debug)]
pub enum StartupState {
    AwaitingFirstResult { first: Frame },
    Streaming,
}

#[derive(Clone, Debug)]
pub struct StartupSync {
    state: StartupState,
}

impl StartupSync {
    pub fn begin(first: Frame) -> Self {
        Self {
            state: StartupState::AwaitingFirstResult { first },
        }
    }

    pub fn state(&self) -> &StartupState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, StartupState::Streaming)
    }

    /// 等待中的第 0 帧
    pub fn pending(&self) -> Option<&Frame> {
        match &self.state {
            StartupState::AwaitingFirstResult { first } => Some(first),
            StartupState::Streaming => None,
        }
    }

    /// 启动期间跳转: 改为保留跳转后读到的帧
    pub fn retain(&mut self, frame: Frame) {
        if let StartupState::AwaitingFirstResult { first } = &mut self.state {
            log::debug!("启动期间跳转, 保留帧 #{} 替换 #{}", frame.index, first.index);
            *first = frame;
        }
    }

    /// 收到一个结果. 首次调用返回保留的原始帧并切换到 Streaming, 之后返回 None
    ///
    /// 结果的帧号不必为 0 (启动期间跳转过), 仍与保留帧配对
    pub fn complete(&mut self) -> Option<Frame> {
        match std::mem::replace(&mut self.state, StartupState::Streaming) {
            StartupState::AwaitingFirstResult { first } => {
                log::info!("✅ 首帧检测完成, 开始播放");
                Some(first)
            }
            StartupState::Streaming => None,
        }
    }
}
