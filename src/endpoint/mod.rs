//! 端点：一块生产者/消费者共享的环形传输区
//!
//! 包含：
//! - Ring: lock-free SPSC 帧环形缓冲区
//! - Backend: 硬件/混音器后端的能力接口（MMAP 式 / 流式）
//! - Registry: 配置 → 端点 的唯一映射，独占/共享仲裁与引用计数
//!
//! Endpoint 本体把三者拼在一起，再加一个时间戳闩（生产者向会话
//! 发布 (帧位置, 纳秒) 上报的无锁信道）。

pub mod backend;
pub mod registry;
pub mod ring;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::format::SampleFormat;

use backend::EndpointBackend;
use ring::RingBufferEndpoint;

/// 数据方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 采集：设备 → 客户端
    Input,
    /// 播放：客户端 → 设备
    Output,
}

/// 共享模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharingMode {
    /// 独占硬件端点，同一设备同时只允许一个
    Exclusive,
    /// 经混音/重采样级共享，同一 (设备, 方向) 复用一个端点
    Shared,
}

/// 端点配置
///
/// 跨边界传递的全部配置面：固定大小的普通结构体
#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    pub device_id: u32,
    pub direction: Direction,
    pub sharing_mode: SharingMode,
    /// 设备侧样本格式
    pub sample_format: SampleFormat,
    pub channel_count: u32,
    pub sample_rate: u32,
    /// 每次唤醒期望传输的帧数
    pub frames_per_burst: u32,
    /// 环形缓冲区容量（帧），会向上取整到 2 的幂
    pub capacity_frames: usize,
}

impl EndpointConfig {
    /// 每帧字节数（设备侧格式）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channel_count as usize
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            direction: Direction::Input,
            sharing_mode: SharingMode::Shared,
            sample_format: SampleFormat::I16,
            channel_count: 2,
            sample_rate: 48000,
            frames_per_burst: 240,
            capacity_frames: 4096,
        }
    }
}

/// 一次时间戳上报
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub position: i64,
    pub nanos: i64,
}

/// 时间戳闩：单写多读的 (位置, 时间) 发布槽
///
/// seqlock 方案：序号为奇表示写入进行中，读侧重试直到前后序号一致。
/// 生产者永不阻塞，读侧最多重试几次。
pub struct TimestampLatch {
    seq: AtomicU64,
    position: AtomicI64,
    nanos: AtomicI64,
}

impl TimestampLatch {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            position: AtomicI64::new(0),
            nanos: AtomicI64::new(0),
        }
    }

    /// 发布一次上报（仅生产者侧调用）
    pub fn publish(&self, timestamp: Timestamp) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq + 1, Ordering::Release); // 奇数：写入中
        self.position.store(timestamp.position, Ordering::Relaxed);
        self.nanos.store(timestamp.nanos, Ordering::Relaxed);
        self.seq.store(seq + 2, Ordering::Release);
    }

    /// 读取最近一次上报；尚未发布过返回 None
    pub fn latest(&self) -> Option<Timestamp> {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 == 0 {
                return None;
            }
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let position = self.position.load(Ordering::Relaxed);
            let nanos = self.nanos.load(Ordering::Relaxed);
            if self.seq.load(Ordering::Acquire) == s1 {
                return Some(Timestamp { position, nanos });
            }
        }
    }
}

impl Default for TimestampLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// 共享传输端点
///
/// 生命周期归 EndpointRegistry 所有：注册表创建、引用计数、
/// 最后一个引用 close 时物理关闭。会话只持有非拥有引用，
/// 绝不直接碰后端。
pub struct Endpoint {
    config: EndpointConfig,
    ring: RingBufferEndpoint,
    backend: Mutex<Box<dyn EndpointBackend>>,
    /// 打开引用计数，只在注册表对应的锁下修改
    open_count: AtomicU32,
    timestamps: TimestampLatch,

    /// 后端硬故障标记（致命，会话观察到后停止并通知错误回调）
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Endpoint {
    pub(crate) fn new(config: EndpointConfig, backend: Box<dyn EndpointBackend>) -> Self {
        let free_running = backend.is_free_running();
        let ring = RingBufferEndpoint::with_min_capacity(
            config.capacity_frames,
            config.bytes_per_frame(),
            free_running,
        );

        Self {
            config,
            ring,
            backend: Mutex::new(backend),
            open_count: AtomicU32::new(1),
            timestamps: TimestampLatch::new(),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[inline]
    pub fn ring(&self) -> &RingBufferEndpoint {
        &self.ring
    }

    #[inline]
    pub fn is_free_running(&self) -> bool {
        self.ring.is_free_running()
    }

    /// 生产者发布时间戳上报
    pub fn publish_timestamp(&self, position: i64, nanos: i64) {
        self.timestamps.publish(Timestamp { position, nanos });
    }

    /// 会话读取最近一次时间戳上报
    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.timestamps.latest()
    }

    /// 后端上报硬设备故障（致命；会话下个循环观察到）
    pub fn report_failure(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!(
            "Endpoint device {} failure: {}",
            self.config.device_id,
            message
        );
        *self.failure.lock().unwrap() = Some(message);
        self.failed.store(true, Ordering::Release);
    }

    /// 是否有待处理的硬故障
    #[inline]
    pub fn has_failure(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// 故障描述（没有故障时为 None）
    pub fn failure_message(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }

    // 引用计数只允许注册表在持锁状态下操作

    pub(crate) fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) -> u32 {
        self.open_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release(&self) -> u32 {
        let prev = self.open_count.load(Ordering::Acquire);
        if prev == 0 {
            return 0;
        }
        self.open_count.store(prev - 1, Ordering::Release);
        prev - 1
    }

    /// 物理关闭后端（仅注册表在计数归零后调用一次）
    pub(crate) fn close_backend(&self) {
        let mut backend = self.backend.lock().unwrap();
        backend.close();
        log::info!(
            "Endpoint closed: device {} {:?} {:?} via {}",
            self.config.device_id,
            self.config.direction,
            self.config.sharing_mode,
            backend.describe()
        );
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("open_count", &self.open_count())
            .field("free_running", &self.is_free_running())
            .finish_non_exhaustive()
    }
}
