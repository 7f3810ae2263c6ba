/// 检测线程模块
/// Background detection worker
///
/// ## 数据流
/// ```text
/// FrameQueue ──pop(100ms)──→ 预处理 ──→ Detector::infer ──→ WorkerEvent ──→ UI线程
///      ↑                                                         (crossbeam 通道)
///   Shutdown 哨兵 / running 标志
/// ```
///
/// 检测器在本线程内加载并独占, 线程退出时随之释放.
/// 检测线程从不接触 UI 状态, 结果只通过事件通道发送
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbImage;

use crate::detector::{Detector, DetectorConfig, DetectorLoader};
use crate::error::{PipelineError, Result};
use crate::preprocess::{PreprocessSettings, Preprocessor};
use crate::queue::{FrameQueue, Popped};
use crate::types::{summarize, ControlMessage, Detection, Frame};

/// 检测线程生命周期
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// 单帧检测结果
#[derive(Clone, Debug)]
pub struct DetectionOutput {
    pub frame_index: u64,
    pub rendered: RgbImage,
    pub detections: Vec<Detection>,
    pub summary: String,
    pub elapsed_ms: f64, // 预处理 + 推理耗时
}

/// 单帧出错的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStage {
    /// 某个滤镜失败, 该帧仍会继续推理
    Preprocess,
    /// 推理失败或 panic, 该帧没有结果
    Inference,
}

/// 检测线程 → UI线程 的事件
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    /// 检测器加载失败, 线程随即退出
    Fatal(String),
    Detection(DetectionOutput),
    FrameError {
        frame_index: u64,
        stage: FrameStage,
        message: String,
    },
    /// 线程已退出
    Stopped {
        processed: u64,
        failed: u64,
        discarded: usize,
    },
}

/// 检测线程参数
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub detector: DetectorConfig,
    pub preprocess: PreprocessSettings,
    pub pop_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            preprocess: PreprocessSettings::default(),
            pop_timeout: Duration::from_millis(100),
        }
    }
}

/// 检测线程句柄 (UI线程持有)
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    queue: FrameQueue,
    control: Sender<ControlMessage>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 发送控制消息, 检测线程在处理下一帧前生效
    pub fn send_control(&self, msg: ControlMessage) -> bool {
        self.control.send(msg).is_ok()
    }

    /// 请求停止 (幂等, 任意线程可调用)
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.state.compare_exchange(
                WorkerState::Running as u8,
                WorkerState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if !self.queue.close() {
                log::debug!("队列已满, 哨兵未放入, 检测线程将在下一帧后退出");
            }
            log::info!("🛑 请求停止检测线程");
        }
    }

    /// 等待线程结束
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("❌ 检测线程异常退出");
                self.state.store(WorkerState::Stopped as u8, Ordering::Release);
            }
        }
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        self.join();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// 启动检测线程
pub fn spawn(
    queue: FrameQueue,
    loader: Box<dyn DetectorLoader>,
    options: WorkerOptions,
    events: Sender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
    let (control_tx, control_rx) = unbounded();

    let worker = DetectionWorker {
        queue: queue.clone(),
        running: running.clone(),
        state: state.clone(),
        control: control_rx,
        events,
        preprocessor: Preprocessor::new(options.preprocess.clone()),
        options,
        processed: 0,
        failed: 0,
    };

    let thread = thread::Builder::new()
        .name("tsr-detect".into())
        .spawn(move || worker.run(loader))?;

    Ok(WorkerHandle {
        running,
        state,
        queue,
        control: control_tx,
        thread: Some(thread),
    })
}

struct DetectionWorker {
    queue: FrameQueue,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    control: Receiver<ControlMessage>,
    events: Sender<WorkerEvent>,
    preprocessor: Preprocessor,
    options: WorkerOptions,
    processed: u64,
    failed: u64,
}

impl DetectionWorker {
    fn run(mut self, loader: Box<dyn DetectorLoader>) {
        self.set_state(WorkerState::Running);
        log::info!("✅ 检测线程启动");

        let loaded = catch_unwind(AssertUnwindSafe(|| loader.load(&self.options.detector)))
            .unwrap_or_else(|payload| Err(PipelineError::model_load(panic_message(&payload))));
        let mut detector = match loaded {
            Ok(d) => {
                log::info!(
                    "✅ 检测器加载成功: {} ({})",
                    d.name(),
                    self.options.detector.model_path.display()
                );
                d
            }
            Err(e) => {
                log::error!("❌ 检测器加载失败: {}", e);
                self.emit(WorkerEvent::Fatal(e.to_string()));
                self.running.store(false, Ordering::Release);
                self.set_state(WorkerState::Stopped);
                return;
            }
        };

        let mut count = 0u32;
        let mut last = Instant::now();
        let mut total_ms = 0.0;
        let mut discarded = 0usize;

        while self.running.load(Ordering::Acquire) {
            match self.queue.pop(self.options.pop_timeout) {
                Popped::Timeout => {}
                Popped::Shutdown => break,
                Popped::Frame(frame) => {
                    if !self.running.load(Ordering::Acquire) {
                        discarded += 1;
                        break;
                    }
                    self.apply_control();
                    if let Some(ms) = self.process(detector.as_mut(), frame) {
                        total_ms += ms;
                    }
                    count += 1;
                }
            }

            // 每秒统计一次
            let elapsed = last.elapsed();
            if elapsed >= Duration::from_secs(1) {
                if count > 0 {
                    log::info!(
                        "📊 检测: {:.1} FPS | {:.1}ms/帧 | 累计 {} 帧, 失败 {} 帧, 丢帧 {}",
                        count as f64 / elapsed.as_secs_f64(),
                        total_ms / count as f64,
                        self.processed,
                        self.failed,
                        self.queue.dropped()
                    );
                }
                count = 0;
                total_ms = 0.0;
                last = Instant::now();
            }
        }

        self.running.store(false, Ordering::Release);
        self.set_state(WorkerState::Stopping);
        discarded += self.queue.drain();
        drop(detector);
        self.set_state(WorkerState::Stopped);
        log::info!(
            "🏁 检测线程退出: 处理 {} 帧, 失败 {} 帧, 丢弃 {} 帧",
            self.processed,
            self.failed,
            discarded
        );
        self.emit(WorkerEvent::Stopped {
            processed: self.processed,
            failed: self.failed,
            discarded,
        });
    }

    /// 只保留最新的预处理配置
    fn apply_control(&mut self) {
        let mut latest = None;
        for msg in self.control.try_iter() {
            match msg {
                ControlMessage::SetPreprocess(methods) => latest = Some(methods),
            }
        }
        if let Some(methods) = latest {
            self.preprocessor.set_methods(&methods);
        }
    }

    /// 处理单帧, 成功时返回耗时 (ms)
    fn process(&mut self, detector: &mut dyn Detector, frame: Frame) -> Option<f64> {
        let start = Instant::now();
        let index = frame.index;

        let pre = self.preprocessor.apply(&frame.image);
        for e in pre.errors {
            self.emit(WorkerEvent::FrameError {
                frame_index: index,
                stage: FrameStage::Preprocess,
                message: e.to_string(),
            });
        }

        let size_hint = self.options.detector.size_hint;
        let input = &pre.image;
        let result = catch_unwind(AssertUnwindSafe(|| detector.infer(input, size_hint)))
            .unwrap_or_else(|payload| {
                Err(PipelineError::inference(format!("panic: {}", panic_message(&payload))))
            });

        match result {
            Ok(inference) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.processed += 1;
                let summary = summarize(&inference.detections);
                log::debug!("帧 #{}: {} ({:.1}ms)", index, summary, elapsed_ms);
                self.emit(WorkerEvent::Detection(DetectionOutput {
                    frame_index: index,
                    rendered: inference.rendered,
                    detections: inference.detections,
                    summary,
                    elapsed_ms,
                }));
                Some(elapsed_ms)
            }
            Err(e) => {
                self.failed += 1;
                log::warn!("⚠️  帧 #{} 推理失败: {}", index, e);
                self.emit(WorkerEvent::FrameError {
                    frame_index: index,
                    stage: FrameStage::Inference,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("事件通道已关闭, 丢弃事件");
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Inference, NoopDetector};
    use crate::preprocess::PreprocessMethod;
    use crate::types::BBox;

    struct Counting {
        calls: u64,
        fail_on: u64,
    }

    impl Detector for Counting {
        fn infer(&mut self, image: &RgbImage, _size_hint: u32) -> Result<Inference> {
            self.calls += 1;
            if self.calls == self.fail_on {
                panic!("bad frame");
            }
            Ok(Inference {
                rendered: image.clone(),
                detections: vec![Detection::new("限速", 0, 0.9, BBox::new(0.0, 0.0, 2.0, 2.0))],
            })
        }
    }

    fn noop_loader() -> Box<dyn DetectorLoader> {
        Box::new(|_: &DetectorConfig| -> Result<Box<dyn Detector>> { Ok(Box::new(NoopDetector)) })
    }

    fn frame(index: u64) -> Frame {
        Frame::new(index, RgbImage::from_pixel(4, 4, image::Rgb([40, 80, 120])))
    }

    fn collect_until_stopped(rx: &Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(ev, WorkerEvent::Stopped { .. } | WorkerEvent::Fatal(_));
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn processes_frames_then_stops_on_sentinel() {
        let queue = FrameQueue::new(5);
        let (tx, rx) = unbounded();
        for i in 0..3 {
            assert!(queue.push(frame(i)));
        }
        queue.close();
        let mut handle = spawn(queue, noop_loader(), WorkerOptions::default(), tx).unwrap();
        let events = collect_until_stopped(&rx);
        handle.join();

        let indices: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Detection(d) => Some(d.frame_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Stopped { processed: 3, failed: 0, .. })
        ));
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn load_failure_is_fatal_once() {
        let queue = FrameQueue::new(5);
        queue.push(frame(0));
        let (tx, rx) = unbounded();
        let loader: Box<dyn DetectorLoader> =
            Box::new(|_: &DetectorConfig| -> Result<Box<dyn Detector>> {
                Err(PipelineError::model_load("missing weights"))
            });
        let mut handle = spawn(queue, loader, WorkerOptions::default(), tx).unwrap();
        handle.join();

        let events: Vec<WorkerEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Fatal(msg) if msg.contains("missing weights")));
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn panic_in_inference_is_a_frame_error() {
        let queue = FrameQueue::new(5);
        let (tx, rx) = unbounded();
        for i in 0..3 {
            queue.push(frame(i));
        }
        queue.close();
        let loader: Box<dyn DetectorLoader> =
            Box::new(|_: &DetectorConfig| -> Result<Box<dyn Detector>> {
                Ok(Box::new(Counting { calls: 0, fail_on: 2 }))
            });
        let mut handle = spawn(queue, loader, WorkerOptions::default(), tx).unwrap();
        let events = collect_until_stopped(&rx);
        handle.join();

        let errors: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::FrameError {
                    frame_index,
                    stage: FrameStage::Inference,
                    ..
                } => Some(*frame_index),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![1]);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Stopped { processed: 2, failed: 1, .. })
        ));
    }

    struct Slow(Duration);

    impl Detector for Slow {
        fn infer(&mut self, image: &RgbImage, _size_hint: u32) -> Result<Inference> {
            thread::sleep(self.0);
            Ok(Inference {
                rendered: image.clone(),
                detections: Vec::new(),
            })
        }
    }

    #[test]
    fn stop_with_full_queue_is_bounded() {
        let queue = FrameQueue::new(2);
        let (tx, rx) = unbounded();
        assert!(queue.push(frame(0)));
        assert!(queue.push(frame(1)));
        let loader: Box<dyn DetectorLoader> =
            Box::new(|_: &DetectorConfig| -> Result<Box<dyn Detector>> {
                Ok(Box::new(Slow(Duration::from_millis(150))))
            });
        let mut handle = spawn(queue.clone(), loader, WorkerOptions::default(), tx).unwrap();

        // 第 0 帧推理中, 队列再次填满, 哨兵放不进去
        thread::sleep(Duration::from_millis(40));
        assert!(queue.push(frame(2)));
        assert_eq!(queue.len(), queue.capacity());

        let start = Instant::now();
        handle.stop_and_join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(queue.is_empty());

        let events = collect_until_stopped(&rx);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Stopped { processed: 1, failed: 0, discarded: 2 })
        ));
    }

    #[test]
    fn stop_on_idle_queue_is_bounded_and_idempotent() {
        let queue = FrameQueue::new(2);
        let (tx, rx) = unbounded();
        let mut handle = spawn(queue, noop_loader(), WorkerOptions::default(), tx).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), WorkerState::Running);

        let start = Instant::now();
        handle.stop();
        handle.stop();
        handle.join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!handle.is_running());
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(matches!(
            rx.try_iter().last(),
            Some(WorkerEvent::Stopped { processed: 0, .. })
        ));
    }

    #[test]
    fn control_message_switches_preprocessing() {
        let queue = FrameQueue::new(5);
        let (tx, rx) = unbounded();
        let handle = spawn(queue.clone(), noop_loader(), WorkerOptions::default(), tx).unwrap();

        queue.push(frame(0));
        let first = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Detection(d) => d.rendered,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(&first, frame(0).image.as_ref());

        assert!(handle.send_control(ControlMessage::SetPreprocess(vec![PreprocessMethod::Contrast])));
        queue.push(frame(1));
        let second = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Detection(d) => d.rendered,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(&second, frame(1).image.as_ref());
        drop(handle);
    }
}
