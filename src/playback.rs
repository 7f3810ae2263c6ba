/// 播放驱动
/// Timer-driven read → display → enqueue loop, owned by the UI thread
///
/// 每个定时周期读取一帧, 原图交给显示, 同一帧的共享拷贝非阻塞地送入检测队列.
/// 队列满时该帧只显示不检测
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::queue::FrameQueue;
use crate::source::VideoSource;
use crate::types::Frame;

/// 播放到末尾后的处理
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndOfStream {
    /// 停止播放并结束检测线程
    #[default]
    Stop,
    /// 回到第 0 帧继续播放
    Loop,
}

/// 一次 tick 的结果
#[derive(Debug)]
pub enum TickOutcome {
    Frame { frame: Frame, enqueued: bool },
    EndOfStream,
    Error(PipelineError),
}

/// 根据源帧率计算播放帧率: 实时源或帧率无效时使用默认值
pub fn resolve_fps(source_fps: Option<f64>, live: bool, default_fps: f64) -> f64 {
    let default_fps = if default_fps.is_finite() && default_fps > 0.0 {
        default_fps
    } else {
        30.0
    };
    if live {
        return default_fps;
    }
    match source_fps {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps,
        _ => default_fps,
    }
}

/// 毫秒 → "hh:mm:ss"
pub fn format_clock(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// "当前 / 总时长", 实时源没有总时长
pub fn time_label(position: u64, total: Option<u64>, fps: f64) -> String {
    let to_ms = |frames: u64| (frames as f64 / fps * 1000.0) as u64;
    match total {
        Some(total) => format!("{} / {}", format_clock(to_ms(position)), format_clock(to_ms(total))),
        None => format!("{} / --:--:--", format_clock(to_ms(position))),
    }
}

/// 播放定时器, 由 UI 线程轮询
///
/// 落后超过一个周期时不补帧, 从当前时间重新计时
#[derive(Clone, Debug)]
pub struct PlaybackTimer {
    period: Duration,
    next: Option<Instant>,
}

impl PlaybackTimer {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub fn start(&mut self, now: Instant) {
        if self.next.is_none() {
            self.next = Some(now + self.period);
        }
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_active(&self) -> bool {
        self.next.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// 到期则返回 true 并安排下一次
    pub fn due(&mut self, now: Instant) -> bool {
        let Some(next) = self.next else {
            return false;
        };
        if now < next {
            return false;
        }
        let following = next + self.period;
        self.next = Some(if following <= now { now + self.period } else { following });
        true
    }
}

pub struct PlaybackDriver {
    source: Box<dyn VideoSource>,
    queue: FrameQueue,
    fps: f64,
    policy: EndOfStream,
}

impl PlaybackDriver {
    pub fn new(
        source: Box<dyn VideoSource>,
        queue: FrameQueue,
        default_fps: f64,
        policy: EndOfStream,
    ) -> Self {
        let fps = resolve_fps(source.frame_rate(), source.is_live(), default_fps);
        log::info!(
            "🎬 播放源: {} | {:.2} FPS | 总帧数: {}",
            source.describe(),
            fps,
            source
                .frame_count()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "实时".to_string())
        );
        Self {
            source,
            queue,
            fps,
            policy,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// 定时器周期 = 1000 / fps 毫秒
    pub fn period(&self) -> Duration {
        Duration::from_millis(((1000.0 / self.fps) as u64).max(1))
    }

    pub fn policy(&self) -> EndOfStream {
        self.policy
    }

    pub fn set_policy(&mut self, policy: EndOfStream) {
        self.policy = policy;
    }

    /// 读取位置, 直接来自视频源
    pub fn position(&self) -> u64 {
        self.source.position()
    }

    pub fn frame_count(&self) -> Option<u64> {
        self.source.frame_count()
    }

    pub fn is_seekable(&self) -> bool {
        !self.source.is_live()
    }

    pub fn time_label(&self) -> String {
        time_label(self.position(), self.frame_count(), self.fps)
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// 读一帧并送入队列
    pub fn tick(&mut self) -> TickOutcome {
        match self.read_and_enqueue() {
            Ok(Some(outcome)) => outcome,
            Ok(None) => match self.policy {
                EndOfStream::Stop => TickOutcome::EndOfStream,
                EndOfStream::Loop => {
                    log::info!("🔁 播放结束, 从头开始");
                    if let Err(e) = self.seek(0) {
                        return TickOutcome::Error(e);
                    }
                    match self.read_and_enqueue() {
                        Ok(Some(outcome)) => outcome,
                        Ok(None) => TickOutcome::EndOfStream,
                        Err(e) => TickOutcome::Error(e),
                    }
                }
            },
            Err(e) => TickOutcome::Error(e),
        }
    }

    fn read_and_enqueue(&mut self) -> Result<Option<TickOutcome>> {
        let index = self.source.position();
        let Some(image) = self.source.read_next()? else {
            return Ok(None);
        };
        let frame = Frame::new(index, image);
        let enqueued = self.queue.push(frame.clone());
        if !enqueued {
            log::debug!("队列已满, 丢弃帧 #{}", index);
        }
        Ok(Some(TickOutcome::Frame { frame, enqueued }))
    }

    /// 跳转并清空队列中的旧帧, 返回被丢弃的帧数
    pub fn seek(&mut self, index: u64) -> Result<usize> {
        self.source.seek(index)?;
        let discarded = self.queue.clear();
        log::debug!("跳转到帧 #{}, 清空 {} 帧", index, discarded);
        Ok(discarded)
    }

    pub fn release(&mut self) {
        self.source.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Popped;
    use crate::source::TestPatternSource;

    fn driver(frames: u64, fps: Option<f64>, capacity: usize, policy: EndOfStream) -> PlaybackDriver {
        PlaybackDriver::new(
            Box::new(TestPatternSource::new(frames, fps).with_size(8, 8)),
            FrameQueue::new(capacity),
            30.0,
            policy,
        )
    }

    #[test]
    fn period_follows_source_rate() {
        assert_eq!(driver(1, Some(25.0), 1, EndOfStream::Stop).period(), Duration::from_millis(40));
        assert_eq!(driver(1, None, 1, EndOfStream::Stop).period(), Duration::from_millis(33));
        assert_eq!(driver(1, Some(0.0), 1, EndOfStream::Stop).fps(), 30.0);
        assert_eq!(driver(1, Some(-5.0), 1, EndOfStream::Stop).fps(), 30.0);
        assert_eq!(resolve_fps(Some(60.0), true, 30.0), 30.0);
    }

    #[test]
    fn stop_policy_reports_end_of_stream() {
        let mut d = driver(2, Some(10.0), 5, EndOfStream::Stop);
        assert!(matches!(d.tick(), TickOutcome::Frame { enqueued: true, .. }));
        assert!(matches!(d.tick(), TickOutcome::Frame { enqueued: true, .. }));
        assert!(matches!(d.tick(), TickOutcome::EndOfStream));
        assert_eq!(d.position(), 2);
    }

    #[test]
    fn loop_policy_rewinds_and_purges_queue() {
        let mut d = driver(2, Some(10.0), 5, EndOfStream::Loop);
        d.tick();
        d.tick();
        match d.tick() {
            TickOutcome::Frame { frame, enqueued } => {
                assert_eq!(frame.index, 0);
                assert!(enqueued);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(d.queue().len(), 1);
        assert_eq!(d.position(), 1);
    }

    #[test]
    fn full_queue_drops_but_still_displays() {
        let mut d = driver(3, None, 1, EndOfStream::Stop);
        assert!(matches!(d.tick(), TickOutcome::Frame { enqueued: true, .. }));
        match d.tick() {
            TickOutcome::Frame { frame, enqueued } => {
                assert_eq!(frame.index, 1);
                assert!(!enqueued);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(d.queue().dropped(), 1);
        match d.queue().pop(Duration::from_millis(10)) {
            Popped::Frame(f) => assert_eq!(f.index, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn seek_clears_queue() {
        let mut d = driver(10, None, 5, EndOfStream::Stop);
        d.tick();
        d.tick();
        assert_eq!(d.seek(7).unwrap(), 2);
        assert_eq!(d.position(), 7);
        assert!(d.queue().is_empty());
    }

    #[test]
    fn timer_fires_once_per_period_without_bursts() {
        let t0 = Instant::now();
        let mut timer = PlaybackTimer::new(Duration::from_millis(100));
        assert!(!timer.due(t0 + Duration::from_secs(1)));

        timer.start(t0);
        assert!(timer.is_active());
        assert!(!timer.due(t0 + Duration::from_millis(50)));
        assert!(timer.due(t0 + Duration::from_millis(100)));
        assert!(!timer.due(t0 + Duration::from_millis(150)));
        // 落后很多时只触发一次
        assert!(timer.due(t0 + Duration::from_millis(1000)));
        assert!(!timer.due(t0 + Duration::from_millis(1050)));

        timer.stop();
        assert!(!timer.due(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(0), "00:00:00");
        assert_eq!(format_clock(3_725_000), "01:02:05");
        assert_eq!(time_label(150, Some(300), 30.0), "00:00:05 / 00:00:10");
        assert_eq!(time_label(30, None, 30.0), "00:00:01 / --:--:--");
    }
}
