use clap::Parser;
/// 交通标志实时检测播放器 (无界面版本)
/// Headless traffic-sign detection player
///
/// 主程序入口 - 直接运行: cargo run --bin tsr-player --release -- <视频源>
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::RgbImage;
use realtime_tsr::detector::{loader_for, DetectorKind};
use realtime_tsr::playback::EndOfStream;
use realtime_tsr::player::LoaderFactory;
use realtime_tsr::preprocess::parse_methods;
use realtime_tsr::{Frame, Player, PlayerConfig, SourceSpec, UiSink};

/// 交通标志实时检测
#[derive(Parser, Debug)]
#[command(author, version, about = "交通标志实时检测播放器", long_about = None)]
struct Args {
    /// 视频源: 视频文件 / 图片目录 / 单张图片 / 摄像头编号 / synthetic:帧数[@帧率]
    source: String,

    /// 配置文件 (不存在时自动创建)
    #[arg(short, long, default_value = "player.json")]
    config: PathBuf,

    /// 检测后端: onnx 或 none
    #[arg(long, default_value = "onnx")]
    detector: String,

    /// 模型路径
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 推理设备: cpu / cuda:0
    #[arg(long)]
    device: Option<String>,

    /// 置信度阈值
    #[arg(long)]
    conf: Option<f32>,

    /// NMS IOU阈值
    #[arg(long)]
    iou: Option<f32>,

    /// 预处理方法, 逗号分隔: clahe,histeq,sharpen,denoise,contrast
    #[arg(short, long)]
    preprocess: Option<String>,

    /// 播放结束后从头循环
    #[arg(long = "loop")]
    loop_playback: bool,

    /// 帧队列容量
    #[arg(short, long)]
    queue: Option<usize>,

    /// 截图与检测结果输出目录
    #[arg(short, long, default_value = "output")]
    out_dir: PathBuf,

    /// 保存每一帧检测结果图
    #[arg(long)]
    save_rendered: bool,

    /// 结束时导出检测日志
    #[arg(long)]
    export_log: Option<PathBuf>,

    /// 最长运行时间 (秒), 实时源或循环播放时使用
    #[arg(long)]
    max_seconds: Option<u64>,
}

/// 控制台输出
struct ConsoleSink {
    out_dir: PathBuf,
    save_rendered: bool,
    rendered: u64,
}

impl UiSink for ConsoleSink {
    fn show_raw(&mut self, frame: &Frame) {
        log::debug!("原始帧 #{} ({}x{})", frame.index, frame.width(), frame.height());
    }

    fn show_rendered(&mut self, frame_index: u64, image: &RgbImage) {
        self.rendered += 1;
        if self.save_rendered {
            let path = self.out_dir.join(format!("rendered_{:06}.png", frame_index));
            if let Err(e) = image.save(&path) {
                log::warn!("⚠️  保存检测结果失败 {}: {}", path.display(), e);
            }
        }
    }

    fn log_line(&mut self, line: &str) {
        println!("{}", line);
    }

    fn status(&mut self, text: &str) {
        log::info!("📝 {}", text);
    }

    fn time_label(&mut self, text: &str) {
        log::debug!("⏱️  {}", text);
    }

    fn fatal(&mut self, message: &str) {
        log::error!("❌ {}", message);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // 配置文件 + 命令行覆盖
    let mut config = PlayerConfig::load(&args.config);
    if let Some(model) = args.model {
        config.detector.model_path = model;
    }
    if let Some(device) = &args.device {
        config.detector.device = device.parse().context("解析设备失败")?;
    }
    if let Some(conf) = args.conf {
        config.detector.conf_threshold = conf;
    }
    if let Some(iou) = args.iou {
        config.detector.iou_threshold = iou;
    }
    if let Some(list) = &args.preprocess {
        config.preprocess.methods = parse_methods(list).context("解析预处理方法失败")?;
    }
    if let Some(capacity) = args.queue {
        config.queue.capacity = capacity;
    }
    if args.loop_playback {
        config.playback.end_of_stream = EndOfStream::Loop;
    }
    config.print_summary();

    let kind: DetectorKind = args.detector.parse().context("解析检测后端失败")?;
    let spec: SourceSpec = args.source.parse().context("解析视频源失败")?;
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("创建输出目录 {} 失败", args.out_dir.display()))?;

    let sink = ConsoleSink {
        out_dir: args.out_dir.clone(),
        save_rendered: args.save_rendered,
        rendered: 0,
    };
    let loaders: LoaderFactory = Box::new(move || loader_for(kind));
    let mut player = Player::new(config, loaders, sink).with_output_dir(&args.out_dir);
    player
        .open(&spec)
        .with_context(|| format!("打开视频源 {} 失败", spec))?;

    let started = Instant::now();
    let deadline = args.max_seconds.map(|s| started + Duration::from_secs(s));
    loop {
        let now = Instant::now();
        player.poll(now);
        if player.is_finished() || player.has_fatal() {
            break;
        }
        if deadline.map_or(false, |d| now >= d) {
            log::info!("⏱️  达到最长运行时间");
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    let fatal = player.has_fatal();
    log::info!(
        "📊 运行 {:.1}s | 检测结果 {} 帧 | 丢帧 {}",
        started.elapsed().as_secs_f64(),
        player.sink().rendered,
        player.queue_dropped()
    );
    if let Some(path) = &args.export_log {
        player
            .export_log(path)
            .with_context(|| format!("导出日志到 {} 失败", path.display()))?;
    }
    player.close();

    if fatal {
        anyhow::bail!("检测器加载失败");
    }
    Ok(())
}
