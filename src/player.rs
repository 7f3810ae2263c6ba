/// 播放控制器 (UI线程)
/// Player controller: wires source, queue, worker and startup sync together
///
/// ## 调用方式
/// ```text
/// player.open(spec)          // 停掉旧检测线程, 读第 0 帧送检, 定时器不启动
/// loop {
///     player.poll(now)       // 处理检测事件 + 定时器到期时播放一帧
/// }
/// player.close()
/// ```
///
/// 所有显示都经过 UiSink, 控制器本身不依赖任何 GUI 库
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver};
use image::RgbImage;

use crate::config::PlayerConfig;
use crate::detector::DetectorLoader;
use crate::error::{PipelineError, Result};
use crate::gen_time_string;
use crate::playback::{PlaybackDriver, PlaybackTimer, TickOutcome};
use crate::preprocess::{normalize_methods, PreprocessMethod};
use crate::queue::FrameQueue;
use crate::source::{open_source, SourceSpec};
use crate::startup::StartupSync;
use crate::types::{ControlMessage, Frame};
use crate::worker::{self, FrameStage, WorkerEvent, WorkerHandle, WorkerOptions, WorkerState};

/// 显示端接口
pub trait UiSink {
    /// 左侧: 原始帧
    fn show_raw(&mut self, frame: &Frame);

    /// 右侧: 检测结果帧
    fn show_rendered(&mut self, frame_index: u64, image: &RgbImage);

    /// 叠加层关闭时清空右侧
    fn clear_rendered(&mut self) {}

    /// 检测日志面板追加一行
    fn log_line(&mut self, line: &str);

    /// 状态栏
    fn status(&mut self, text: &str);

    /// 时间标签 "hh:mm:ss / hh:mm:ss"
    fn time_label(&mut self, _text: &str) {}

    /// 阻塞式错误提示 (检测器加载失败)
    fn fatal(&mut self, message: &str);
}

/// 带时间戳的检测日志, 超出容量时丢弃最旧的行
#[derive(Clone, Debug)]
pub struct DetectionLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DetectionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// 追加一行并返回带时间戳的文本
    pub fn push(&mut self, text: &str) -> String {
        let line = format!("[{}] {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), text);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        line
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// 导出为纯文本, 每行一条
    pub fn export(&self, path: &Path) -> Result<()> {
        let mut text = self.lines().collect::<Vec<_>>().join("\n");
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }
}

/// 创建检测器加载器 (每次打开视频源调用一次)
pub type LoaderFactory = Box<dyn Fn() -> Box<dyn DetectorLoader>>;

/// 一次打开的视频源
struct Session {
    driver: PlaybackDriver,
    worker: WorkerHandle,
    events: Receiver<WorkerEvent>,
    startup: StartupSync,
    timer: PlaybackTimer,
    fatal: bool,
    finished: bool,
}

pub struct Player<S: UiSink> {
    config: PlayerConfig,
    loaders: LoaderFactory,
    sink: S,
    session: Option<Session>,
    log: DetectionLog,
    overlay: bool,
    preprocess: Vec<PreprocessMethod>,
    current: Option<Frame>,
    out_dir: PathBuf,
}

impl<S: UiSink> Player<S> {
    pub fn new(config: PlayerConfig, loaders: LoaderFactory, sink: S) -> Self {
        let log = DetectionLog::new(config.playback.log_history);
        let preprocess = normalize_methods(&config.preprocess.methods);
        Self {
            config,
            loaders,
            sink,
            session: None,
            log,
            overlay: true,
            preprocess,
            current: None,
            out_dir: PathBuf::from("."),
        }
    }

    /// 截图默认保存目录
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn log(&self) -> &DetectionLog {
        &self.log
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.timer.is_active())
    }

    pub fn is_streaming(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.startup.is_streaming())
    }

    /// 播放已结束 (Stop 策略) 且检测线程已退出
    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.finished && s.worker.state() == WorkerState::Stopped)
    }

    /// 检测器加载失败, 需要重新打开
    pub fn has_fatal(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.fatal)
    }

    pub fn overlay_enabled(&self) -> bool {
        self.overlay
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        self.session.as_ref().map(|s| s.worker.state())
    }

    pub fn queue_dropped(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.driver.queue().dropped())
    }

    /// 打开视频源: 读第 0 帧送检, 等首个结果到达后才开始播放
    pub fn open(&mut self, spec: &SourceSpec) -> Result<()> {
        self.close();

        let source = match open_source(spec) {
            Ok(source) => source,
            Err(e) => {
                self.sink.status("无法打开视频文件");
                return Err(e);
            }
        };

        let queue = FrameQueue::new(self.config.queue.capacity);
        let mut driver = PlaybackDriver::new(
            source,
            queue.clone(),
            self.config.playback.default_fps,
            self.config.playback.end_of_stream,
        );

        let first = match driver.tick() {
            TickOutcome::Frame { frame, .. } => frame,
            TickOutcome::EndOfStream => {
                self.sink.status("无法读取第一帧");
                return Err(PipelineError::source(format!("{}: 没有可读取的帧", spec)));
            }
            TickOutcome::Error(e) => {
                self.sink.status("无法读取第一帧");
                return Err(e);
            }
        };

        let (worker, rx) = self.spawn_worker(queue)?;

        let timer = PlaybackTimer::new(driver.period());
        self.sink.time_label(&driver.time_label());
        self.session = Some(Session {
            driver,
            worker,
            events: rx,
            startup: StartupSync::begin(first),
            timer,
            fatal: false,
            finished: false,
        });
        self.current = None;
        self.log.clear();
        self.sink.status("视频已打开，正在等待首帧检测…");
        log::info!("🎬 已打开: {}", spec);
        Ok(())
    }

    /// 在指定队列上启动检测线程
    fn spawn_worker(&self, queue: FrameQueue) -> Result<(WorkerHandle, Receiver<WorkerEvent>)> {
        let (tx, rx) = unbounded();
        let mut options = WorkerOptions {
            detector: self.config.detector.clone(),
            preprocess: self.config.preprocess.clone(),
            pop_timeout: self.config.queue.pop_timeout(),
        };
        options.preprocess.methods = self.preprocess.clone();
        let worker = worker::spawn(queue, (self.loaders)(), options, tx)?;
        Ok((worker, rx))
    }

    /// 播放结束后检测线程已退出, 再次播放前在同一队列上重新启动
    fn revive(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.finished {
            return Ok(());
        }
        session.worker.join();
        let queue = session.driver.queue().clone();
        // 退出时可能残留停止哨兵
        queue.drain();

        let (worker, events) = self.spawn_worker(queue)?;
        if let Some(session) = self.session.as_mut() {
            session.worker = worker;
            session.events = events;
            session.finished = false;
        }
        log::info!("🔁 播放结束后重新启动检测线程");
        Ok(())
    }

    /// 处理检测事件, 定时器到期时播放一帧
    pub fn poll(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let events: Vec<WorkerEvent> = session.events.try_iter().collect();
        for event in events {
            self.handle_event(event, now);
        }

        let due = self.session.as_mut().map_or(false, |s| s.timer.due(now));
        if due {
            self.play_one();
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            WorkerEvent::Detection(out) => {
                if let Some(first) = session.startup.complete() {
                    session.timer.start(now);
                    self.sink.show_raw(&first);
                    self.sink.time_label(&session.driver.time_label());
                    self.sink.status("视频已打开，正在播放并实时检测…");
                    self.current = Some(first);
                }
                if self.overlay {
                    self.sink.show_rendered(out.frame_index, &out.rendered);
                }
                let line = self.log.push(&out.summary);
                self.sink.log_line(&line);
            }
            WorkerEvent::FrameError {
                frame_index,
                stage,
                message,
            } => {
                let line = self.log.push(&format!("帧 #{} 处理失败: {}", frame_index, message));
                self.sink.log_line(&line);
                // 推理失败时该帧没有结果, 启动阶段用原图代替, 避免一直等待
                if stage == FrameStage::Inference {
                    if let Some(first) = session.startup.complete() {
                        session.timer.start(now);
                        self.sink.show_raw(&first);
                        if self.overlay {
                            self.sink.show_rendered(first.index, &first.image);
                        }
                        self.sink.status("视频已打开，正在播放并实时检测…");
                        self.current = Some(first);
                    }
                }
            }
            WorkerEvent::Fatal(message) => {
                session.fatal = true;
                session.timer.stop();
                log::error!("❌ 检测线程启动失败: {}", message);
                self.sink.fatal(&message);
                self.sink.status("检测器加载失败");
            }
            WorkerEvent::Stopped {
                processed,
                failed,
                discarded,
            } => {
                log::info!(
                    "检测线程已停止: 处理 {} / 失败 {} / 丢弃 {}",
                    processed,
                    failed,
                    discarded
                );
            }
        }
    }

    fn play_one(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.driver.tick() {
            TickOutcome::Frame { frame, .. } => {
                self.sink.show_raw(&frame);
                self.sink.time_label(&session.driver.time_label());
                self.current = Some(frame);
            }
            TickOutcome::EndOfStream => {
                session.timer.stop();
                session.finished = true;
                session.worker.stop();
                self.sink.status("播放结束");
                log::info!("🏁 播放结束");
            }
            TickOutcome::Error(e) => {
                log::warn!("⚠️  读取帧失败: {}", e);
                self.sink.status(&format!("读取帧失败: {}", e));
            }
        }
    }

    /// 播放/暂停. 首帧检测完成前无效, 播放结束后从头重新播放
    pub fn toggle_play(&mut self, now: Instant) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.startup.is_streaming() || session.fatal {
            return false;
        }
        if session.finished {
            let rewound = session.driver.seek(0).map(|_| ());
            if let Err(e) = rewound.and_then(|_| self.revive()) {
                log::warn!("⚠️  重新播放失败: {}", e);
                self.sink.status(&format!("重新播放失败: {}", e));
                return false;
            }
            if let Some(session) = &self.session {
                self.sink.time_label(&session.driver.time_label());
            }
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.timer.is_active() {
            session.timer.stop();
            self.sink.status("已暂停");
        } else {
            session.timer.start(now);
            self.sink.status("播放中…");
        }
        true
    }

    /// 跳转到指定帧, 清空队列中的旧帧
    ///
    /// 首帧结果到达前跳转时, 读取新位置的帧送检并作为保留帧
    pub fn seek(&mut self, index: u64) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if !session.driver.is_seekable() {
            self.sink.status("实时源不支持跳转");
            return Err(PipelineError::source("实时源不支持跳转"));
        }
        self.revive()?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.driver.seek(index)?;
        if !session.startup.is_streaming() {
            match session.driver.tick() {
                TickOutcome::Frame { frame, .. } => session.startup.retain(frame),
                outcome => {
                    if let TickOutcome::Error(e) = outcome {
                        log::warn!("⚠️  跳转后读取帧失败: {}", e);
                    }
                    // 新位置读不到帧, 重新送检原来保留的帧
                    if let Some(first) = session.startup.pending() {
                        session.driver.queue().push(first.clone());
                    }
                }
            }
        }
        self.sink.time_label(&session.driver.time_label());
        Ok(())
    }

    /// 保存当前原始帧为 PNG, 未指定路径时按时间戳命名
    pub fn save_frame(&mut self, path: Option<&Path>) -> Result<PathBuf> {
        let frame = self
            .current
            .as_ref()
            .or_else(|| self.session.as_ref().and_then(|s| s.startup.pending()))
            .ok_or_else(|| PipelineError::source("没有可保存的帧"))?;
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self
                .out_dir
                .join(format!("frame_{}.png", gen_time_string("-"))),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        frame.image.save(&path)?;
        self.sink.status(&format!("已保存：{}", path.display()));
        log::info!("💾 截图已保存: {}", path.display());
        Ok(path)
    }

    /// 切换检测叠加层, 返回切换后的状态
    pub fn toggle_overlay(&mut self) -> bool {
        self.overlay = !self.overlay;
        if !self.overlay {
            self.sink.clear_rendered();
        }
        self.sink
            .status(if self.overlay { "叠加层开启" } else { "叠加层关闭" });
        self.overlay
    }

    /// 更新预处理方法, 检测线程在下一帧前生效
    pub fn set_preprocess(&mut self, methods: &[PreprocessMethod]) {
        self.preprocess = normalize_methods(methods);
        if let Some(session) = &self.session {
            session
                .worker
                .send_control(ControlMessage::SetPreprocess(self.preprocess.clone()));
        }
        let names: Vec<&str> = self.preprocess.iter().map(|m| m.name()).collect();
        let text = if names.is_empty() {
            "预处理: 无".to_string()
        } else {
            format!("预处理: {}", names.join(" + "))
        };
        self.sink.status(&text);
    }

    /// 导出检测日志
    pub fn export_log(&mut self, path: &Path) -> Result<()> {
        self.log.export(path)?;
        self.sink.status(&format!("日志已导出：{}", path.display()));
        Ok(())
    }

    /// 关闭视频源: 停止定时器, 释放源, 停止并等待检测线程
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.timer.stop();
            session.driver.release();
            session.worker.stop_and_join();
            for event in session.events.try_iter() {
                if let WorkerEvent::Stopped { processed, failed, discarded } = event {
                    log::info!(
                        "检测线程已停止: 处理 {} / 失败 {} / 丢弃 {}",
                        processed,
                        failed,
                        discarded
                    );
                }
            }
            self.current = None;
            self.sink.status("已关闭");
        }
    }
}

impl<S: UiSink> Drop for Player<S> {
    fn drop(&mut self) {
        self.close();
    }
}
