/// 帧队列模块
/// Bounded frame queue between the playback driver and the detection worker
///
/// 丢帧策略: 队列满时丢弃"最新"的帧 (正在 push 的那一帧), 保证播放线程永不阻塞
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::types::Frame;

/// 默认队列容量
pub const DEFAULT_CAPACITY: usize = 5;

enum QueueItem {
    Frame(Frame),
    Shutdown, // 哨兵: 仅用于唤醒阻塞中的 pop
}

/// pop 的结果
#[derive(Debug)]
pub enum Popped {
    Frame(Frame),
    Shutdown,
    Timeout,
}

/// 有界帧队列 (单生产者/单消费者)
///
/// 克隆得到的是同一个队列的句柄
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        // bounded(0) 是同步通道, 会让 try_send 永远失败
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 非阻塞入队, 队列满则丢弃该帧并返回 false
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(QueueItem::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// 最多阻塞 timeout 等待一帧
    pub fn pop(&self, timeout: Duration) -> Popped {
        match self.rx.recv_timeout(timeout) {
            Ok(QueueItem::Frame(frame)) => Popped::Frame(frame),
            Ok(QueueItem::Shutdown) => Popped::Shutdown,
            Err(RecvTimeoutError::Timeout) => Popped::Timeout,
            Err(RecvTimeoutError::Disconnected) => Popped::Shutdown,
        }
    }

    /// 放入哨兵, 解除 pop 阻塞. 队列满时放不进去, 返回 false
    /// (此时消费者马上能取到帧, 随后会检查运行标志)
    pub fn close(&self) -> bool {
        self.tx.try_send(QueueItem::Shutdown).is_ok()
    }

    /// 清空队列中的帧 (跳帧时丢弃旧帧), 返回丢弃的帧数
    ///
    /// 与并发的 pop 存在竞争: 清空前一瞬间被取走的帧仍会被处理
    pub fn clear(&self) -> usize {
        let mut discarded = 0;
        let mut saw_shutdown = false;
        loop {
            match self.rx.try_recv() {
                Ok(QueueItem::Frame(_)) => discarded += 1,
                Ok(QueueItem::Shutdown) => saw_shutdown = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        // 哨兵不能被跳帧吞掉
        if saw_shutdown {
            let _ = self.tx.try_send(QueueItem::Shutdown);
        }
        discarded
    }

    /// 丢弃所有剩余项 (包括哨兵), 检测线程退出前调用
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        while let Ok(item) = self.rx.try_recv() {
            if let QueueItem::Frame(_) = item {
                discarded += 1;
            }
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 因队列满而被丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::time::Instant;

    fn frame(index: u64) -> Frame {
        Frame::new(index, RgbImage::new(2, 2))
    }

    #[test]
    fn overflow_drops_newest_without_blocking() {
        let q = FrameQueue::new(3);
        let start = Instant::now();
        let accepted: Vec<bool> = (0..10).map(|i| q.push(frame(i))).collect();
        assert!(start.elapsed() < Duration::from_millis(100));

        assert_eq!(accepted, [true, true, true, false, false, false, false, false, false, false]);
        assert_eq!(q.dropped(), 7);
        assert_eq!(q.len(), 3);

        // 保留的是最早的三帧
        for expected in 0..3 {
            match q.pop(Duration::from_millis(10)) {
                Popped::Frame(f) => assert_eq!(f.index, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let q = FrameQueue::new(2);
        let start = Instant::now();
        assert!(matches!(q.pop(Duration::from_millis(20)), Popped::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_unblocks_pending_pop() {
        let q = FrameQueue::new(2);
        let consumer = q.clone();
        let handle = std::thread::spawn(move || consumer.pop(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(q.close());
        let popped = handle.join().unwrap();
        assert!(matches!(popped, Popped::Shutdown));
    }

    #[test]
    fn clear_discards_frames_but_keeps_sentinel() {
        let q = FrameQueue::new(4);
        q.push(frame(0));
        q.push(frame(1));
        q.close();
        assert_eq!(q.clear(), 2);
        assert!(matches!(q.pop(Duration::from_millis(10)), Popped::Shutdown));
        assert!(q.is_empty());
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let q = FrameQueue::new(0);
        assert_eq!(q.capacity(), 1);
        assert!(q.push(frame(0)));
        assert!(!q.push(frame(1)));
    }
}
