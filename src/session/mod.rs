//! 流会话（采集方向）
//!
//! 一个客户端对一个端点的使用：把环形缓冲区的原始读取变成
//! 格式正确、位置单调的客户端缓冲区，并把唤醒压到最少。
//!
//! 核心设计：
//! - 数据路径完全无锁，会话循环是核心里唯一有意睡眠的地方，
//!   每次睡眠的 deadline 都由时钟模型重新计算、有界
//! - 对外可见的位置计数器单调不减：内部 catch-up 重置计数器时
//!   把跳变量累进一个偏移，调用方永远看不到倒退
//! - stop 请求由循环在每轮顶部观察，绝不在传输中途截断
//!
//! 会话不拥有端点：所有权在注册表，会话关闭只是释放一个引用。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::fmt;

use crate::clock::ClockModel;
use crate::endpoint::registry::{EndpointRegistry, RegistryError};
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::format::{self, SampleFormat};
use crate::timing::{now_nanos, sleep_until_nanos};

/// 起步阶段的短轮询间隔：时钟模型还没跑起来时 2ms 再看一次
pub const DEFAULT_STARTUP_POLL_NANOS: i64 = 2_000_000;

/// 会话状态机
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// 已打开，尚未启动
    Open = 0,
    /// 已启动，等待时钟模型就绪和首次 catch-up
    Starting = 1,
    /// 稳态读取循环
    Started = 2,
    /// 停止请求已发出，循环将在下轮顶部退出
    Stopping = 3,
    /// 已停止
    Stopped = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// 数据回调的返回值
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Stop,
}

/// 会话层错误
#[derive(Debug)]
pub enum SessionError {
    /// 设备被占用（独占冲突或反向互斥）
    EndpointUnavailable,
    /// 后端打开失败
    OpenFailed(String),
    /// 设备格式与客户端格式的组合不在转换矩阵内（致命，需关闭会话）
    UnsupportedFormat {
        device: SampleFormat,
        client: SampleFormat,
    },
    /// 操作与当前状态不符
    InvalidState(&'static str),
    /// 后端硬故障（致命，不自动重试）
    DeviceFailure(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointUnavailable => write!(f, "endpoint unavailable: device busy"),
            Self::OpenFailed(s) => write!(f, "endpoint open failed: {}", s),
            Self::UnsupportedFormat { device, client } => {
                write!(f, "unsupported format conversion: {} -> {}", device, client)
            }
            Self::InvalidState(s) => write!(f, "invalid state: {}", s),
            Self::DeviceFailure(s) => write!(f, "device failure: {}", s),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::EndpointUnavailable => Self::EndpointUnavailable,
            RegistryError::OpenFailed(s) => Self::OpenFailed(s),
        }
    }
}

/// 一次非阻塞处理的结果
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    /// 实际拷贝的帧数（可能小于请求，绝不内部阻塞）
    pub frames: usize,
    /// 建议的下次唤醒时刻（单调纳秒）
    pub next_wake_nanos: i64,
}

/// 跨线程共享的会话控制面
///
/// 完全基于原子操作：读循环线程和控制线程都要碰
struct SessionControl {
    state: AtomicU8,
    needs_catch_up: AtomicBool,
    /// over/underrun 观测计数（可观测性，不致命）
    xrun_count: AtomicU32,
    /// catch-up 跳变累计偏移，保证对外位置单调
    frames_offset: AtomicI64,
    /// frames_written 的历史最大值：free-running 外推的写计数器
    /// 会被较慢的时间戳上报重新锚定到更低位置，对外取最大值
    max_frames_written: AtomicI64,
    /// 错误回调恰好通知一次的闩
    error_notified: AtomicBool,
}

impl SessionControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Open as u8),
            needs_catch_up: AtomicBool::new(false),
            xrun_count: AtomicU32::new(0),
            frames_offset: AtomicI64::new(0),
            max_frames_written: AtomicI64::new(0),
            error_notified: AtomicBool::new(false),
        }
    }

    #[inline]
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// 读循环工作体：时钟模型和处理逻辑都在这里
///
/// 阻塞读模式下留在会话里，回调模式下整体移进回调线程
struct CaptureWorker {
    endpoint: Arc<Endpoint>,
    control: Arc<SessionControl>,
    clock: ClockModel,
    device_format: SampleFormat,
    client_format: SampleFormat,
    channel_count: u32,
    frames_per_burst: u32,
    startup_poll_nanos: i64,
    /// 标称 burst 周期，时钟模型没就绪时的唤醒回退
    nominal_burst_nanos: i64,
}

impl CaptureWorker {
    /// 非阻塞处理一轮：读尽可能多（至多 num_frames）帧进 dst，
    /// 返回实际帧数和下次唤醒时刻
    fn process_data_now(
        &mut self,
        dst: &mut [u8],
        num_frames: usize,
        now: i64,
    ) -> Result<Progress, SessionError> {
        // 致命的后端故障优先于一切
        if self.endpoint.has_failure() {
            return Err(SessionError::DeviceFailure(
                self.endpoint
                    .failure_message()
                    .unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        // 吸收生产者的时间戳上报（去重交给时钟模型的不前进过滤）
        if let Some(ts) = self.endpoint.latest_timestamp() {
            self.clock.process_timestamp(ts.position, ts.nanos);
        }

        let ring = self.endpoint.ring();

        if ring.is_free_running() {
            // 时钟模型没跑起来之前没有足够信息安全读取，短轮询再来
            if self.clock.is_starting() {
                return Ok(Progress {
                    frames: 0,
                    next_wake_nanos: now + self.startup_poll_nanos,
                });
            }

            // 没有硬件中断告诉我们写到哪了，用时钟外推替代
            ring.set_write_counter(self.clock.convert_time_to_position(now));
        }

        // 首次读取或停顿之后：把读计数器吸到写计数器上，
        // 跳变量计入偏移，外部可见位置不倒退
        if self.control.needs_catch_up.swap(false, Ordering::AcqRel) {
            let read = ring.read_counter();
            let write = ring.write_counter();
            let jump = (read - write).max(0);
            if jump > 0 {
                self.control.frames_offset.fetch_add(jump, Ordering::AcqRel);
            }
            ring.set_read_counter(write);
            log::debug!(
                "Catch-up: read {} -> {}, offset bump {}",
                read,
                write,
                jump
            );
        }

        if self.control.state() == StreamState::Starting {
            self.control.set_state(StreamState::Started);
            log::info!("Stream session started (device {})", self.endpoint.config().device_id);
        }

        // 负的剩余空间 = 生产者已经覆盖未读数据：overrun 观测，只计数
        if ring.empty_frames_available() < 0 {
            let count = self.control.xrun_count.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("Overrun observed (total {})", count);
        }

        // 有界读取：至多两段连续区域，逐段转换格式
        let frames = self.read_regions(dst, num_frames)?;

        let next_wake_nanos = self.next_wake(now);
        Ok(Progress {
            frames,
            next_wake_nanos,
        })
    }

    /// 从环形缓冲区读并转换至多 num_frames 帧
    fn read_regions(&mut self, dst: &mut [u8], num_frames: usize) -> Result<usize, SessionError> {
        let ring = self.endpoint.ring();
        let client_bpf = self.client_format.bytes_per_sample() * self.channel_count as usize;
        let num_frames = num_frames.min(dst.len() / client_bpf);

        let regions = ring.full_frames_regions(num_frames);
        if regions.is_empty() {
            return Ok(0);
        }

        let device_bpf = ring.bytes_per_frame();
        let mut copied_frames = 0usize;

        for src in [regions.first, regions.second] {
            if src.is_empty() {
                continue;
            }
            let out = &mut dst[copied_frames * client_bpf..];
            let samples = format::convert_samples(src, self.device_format, out, self.client_format)
                .map_err(|e| SessionError::UnsupportedFormat {
                    device: e.from,
                    client: e.to,
                })?;
            debug_assert_eq!(samples * self.device_format.bytes_per_sample() % device_bpf, 0);
            copied_frames += samples / self.channel_count as usize;
        }

        ring.advance_read_index(copied_frames as i64);
        Ok(copied_frames)
    }

    /// 计算下次唤醒时刻
    ///
    /// 稳态下用时钟模型推算下一个 burst 就绪的时刻——这是整个
    /// 延迟最小化机制的核心；其余状态用短默认值
    fn next_wake(&self, now: i64) -> i64 {
        if self.control.state() == StreamState::Started && !self.clock.is_starting() {
            let target = self.endpoint.ring().read_counter() + self.frames_per_burst as i64;
            self.clock.convert_position_to_time(target)
        } else if self.control.state() == StreamState::Started {
            // coupled 端点可能从不发时间戳：按标称速率等一个 burst
            now + self.nominal_burst_nanos
        } else {
            now + self.startup_poll_nanos
        }
    }
}

/// 数据回调：收到一个填好的缓冲区（字节）和帧数，决定继续或停止
pub type DataCallback = Box<dyn FnMut(&[u8], usize) -> CallbackResult + Send>;

/// 错误回调：致命错误恰好通知一次
pub type ErrorCallback = Box<dyn FnMut(&SessionError) + Send>;

/// 采集流会话
pub struct StreamSession {
    registry: Arc<EndpointRegistry>,
    endpoint: Arc<Endpoint>,
    control: Arc<SessionControl>,
    client_format: SampleFormat,
    frames_per_burst: u32,
    client_bytes_per_frame: usize,
    /// 回调线程运行期间被移走
    worker: Option<CaptureWorker>,
    callback_thread: Option<JoinHandle<CaptureWorker>>,
    released: bool,
}

impl StreamSession {
    /// 对着注册表打开一个采集会话
    ///
    /// 格式组合在这里就检查：不支持的组合立刻失败并释放端点引用
    pub fn open(
        registry: Arc<EndpointRegistry>,
        config: EndpointConfig,
        client_format: SampleFormat,
    ) -> Result<Self, SessionError> {
        let endpoint = registry.open_endpoint(config)?;

        if !format::is_conversion_supported(config.sample_format, client_format) {
            registry.close_endpoint(&endpoint);
            return Err(SessionError::UnsupportedFormat {
                device: config.sample_format,
                client: client_format,
            });
        }

        let control = Arc::new(SessionControl::new());
        let nominal_burst_nanos =
            config.frames_per_burst as i64 * 1_000_000_000 / config.sample_rate as i64;

        let worker = CaptureWorker {
            endpoint: Arc::clone(&endpoint),
            control: Arc::clone(&control),
            clock: ClockModel::new(config.sample_rate),
            device_format: config.sample_format,
            client_format,
            channel_count: config.channel_count,
            frames_per_burst: config.frames_per_burst,
            startup_poll_nanos: DEFAULT_STARTUP_POLL_NANOS,
            nominal_burst_nanos,
        };

        log::info!(
            "Stream session opened: device {} {:?} {:?}, {} -> {}, burst {}",
            config.device_id,
            config.direction,
            config.sharing_mode,
            config.sample_format,
            client_format,
            config.frames_per_burst
        );

        Ok(Self {
            registry,
            endpoint,
            control,
            client_format,
            frames_per_burst: config.frames_per_burst,
            client_bytes_per_frame: client_format.bytes_per_sample()
                * config.channel_count as usize,
            worker: Some(worker),
            callback_thread: None,
            released: false,
        })
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        self.control.state()
    }

    #[inline]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// over/underrun 观测计数
    #[inline]
    pub fn xrun_count(&self) -> u32 {
        self.control.xrun_count.load(Ordering::Relaxed)
    }

    /// 对外可见的已读帧位置，跨 catch-up 单调不减
    #[inline]
    pub fn frames_read(&self) -> i64 {
        self.endpoint.ring().read_counter() + self.control.frames_offset.load(Ordering::Acquire)
    }

    /// 对外可见的已写帧位置，单调不减
    ///
    /// free-running 稳态下写计数器是时钟模型的位置估计（每轮被外推值
    /// 覆盖），较慢的时间戳上报会把模型重新锚定到更低位置；对外
    /// 返回历史最大值，估计值的回撤不外泄
    pub fn frames_written(&self) -> i64 {
        let current = self.endpoint.ring().write_counter()
            + self.control.frames_offset.load(Ordering::Acquire);
        let previous = self
            .control
            .max_frames_written
            .fetch_max(current, Ordering::AcqRel);
        previous.max(current)
    }

    /// 启动会话（阻塞读模式；回调模式用 start_with_callback）
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.control.state() {
            StreamState::Open | StreamState::Stopped => {}
            _ => return Err(SessionError::InvalidState("start: session already active")),
        }
        let Some(worker) = self.worker.as_mut() else {
            return Err(SessionError::InvalidState("start: callback thread running"));
        };

        // 传输区锁页是尽力而为：失败只是多一点抖动风险
        self.endpoint.ring().lock_memory();

        worker.clock.reset();
        self.control.error_notified.store(false, Ordering::Release);
        self.control.needs_catch_up.store(true, Ordering::Release);
        self.control.set_state(StreamState::Starting);
        Ok(())
    }

    /// 非阻塞处理一轮（阻塞读和回调循环的公共内核，也便于测试）
    pub fn process_data_now(
        &mut self,
        dst: &mut [u8],
        num_frames: usize,
        now: i64,
    ) -> Result<Progress, SessionError> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(SessionError::InvalidState(
                "process_data_now: callback thread running",
            ));
        };
        worker.process_data_now(dst, num_frames, now)
    }

    /// 阻塞读取：凑满 num_frames 帧或超时为止
    ///
    /// 每轮顶部观察 Stopping；每次睡眠的 deadline 都有界
    pub fn read(
        &mut self,
        dst: &mut [u8],
        num_frames: usize,
        timeout_nanos: i64,
    ) -> Result<usize, SessionError> {
        match self.control.state() {
            StreamState::Starting | StreamState::Started => {}
            _ => return Err(SessionError::InvalidState("read: session not started")),
        }
        if self.worker.is_none() {
            return Err(SessionError::InvalidState("read: callback thread running"));
        }

        let bpf = self.client_bytes_per_frame;
        let deadline = now_nanos() + timeout_nanos;
        let mut total = 0usize;

        while total < num_frames {
            // stop 请求在每轮顶部观察，不截断部分传输
            if matches!(
                self.control.state(),
                StreamState::Stopping | StreamState::Stopped
            ) {
                break;
            }

            let now = now_nanos();
            let progress = {
                let worker = self.worker.as_mut().expect("worker present in read mode");
                worker.process_data_now(&mut dst[total * bpf..], num_frames - total, now)
            };

            let progress = match progress {
                Ok(p) => p,
                Err(e) => {
                    self.notify_error(&e, None);
                    return Err(e);
                }
            };
            total += progress.frames;

            if total >= num_frames || now >= deadline {
                break;
            }
            sleep_until_nanos(progress.next_wake_nanos.min(deadline));
        }

        Ok(total)
    }

    /// 启动会话并在内部线程上跑回调循环
    ///
    /// 每次交付至多一个 burst；数据回调返回 Stop 或出现致命错误时
    /// 循环干净退出，错误回调恰好调用一次
    pub fn start_with_callback(
        &mut self,
        mut data_callback: DataCallback,
        mut error_callback: Option<ErrorCallback>,
    ) -> Result<(), SessionError> {
        self.start()?;
        let mut worker = self.worker.take().expect("start() checked worker presence");

        let control = Arc::clone(&self.control);
        let burst_frames = self.frames_per_burst as usize;
        let client_bpf = self.client_bytes_per_frame;
        let burst_bytes = burst_frames * client_bpf;

        let handle = thread::Builder::new()
            .name("aqueduct-capture".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; burst_bytes];
                log::debug!("Capture callback thread started");

                loop {
                    match control.state() {
                        StreamState::Stopping | StreamState::Stopped => break,
                        _ => {}
                    }

                    let now = now_nanos();
                    match worker.process_data_now(&mut buffer, burst_frames, now) {
                        Ok(progress) => {
                            if progress.frames > 0 {
                                let bytes = progress.frames * client_bpf;
                                if data_callback(&buffer[..bytes], progress.frames)
                                    == CallbackResult::Stop
                                {
                                    log::info!("Data callback requested stop");
                                    control.set_state(StreamState::Stopping);
                                    continue;
                                }
                            }
                            sleep_until_nanos(progress.next_wake_nanos);
                        }
                        Err(e) => {
                            log::error!("Fatal session error: {}", e);
                            if !control.error_notified.swap(true, Ordering::AcqRel) {
                                if let Some(cb) = error_callback.as_mut() {
                                    cb(&e);
                                }
                            }
                            break;
                        }
                    }
                }

                control.set_state(StreamState::Stopped);
                log::debug!("Capture callback thread finished");
                worker
            })
            .map_err(|e| {
                self.control.set_state(StreamState::Stopped);
                SessionError::OpenFailed(format!("spawn callback thread: {}", e))
            })?;

        self.callback_thread = Some(handle);
        Ok(())
    }

    /// 可跨线程的停止把手
    ///
    /// 阻塞读模式下会话本体被读线程独占借用，其它线程通过把手
    /// 发出停止请求，读循环在下轮顶部观察到 Stopping 后退出
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// 请求停止并等待循环退出
    pub fn stop(&mut self) {
        match self.control.state() {
            StreamState::Starting | StreamState::Started => {
                self.control.set_state(StreamState::Stopping);
            }
            _ => {}
        }

        if let Some(handle) = self.callback_thread.take() {
            match handle.join() {
                Ok(worker) => self.worker = Some(worker),
                Err(_) => log::error!("Capture callback thread panicked"),
            }
        }

        if self.control.state() != StreamState::Stopped {
            self.control.set_state(StreamState::Stopped);
        }
        log::info!(
            "Stream session stopped: device {}, xruns {}",
            self.endpoint.config().device_id,
            self.xrun_count()
        );
    }

    /// 关闭会话，释放端点引用（所有权在注册表，这里只还引用）
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop();
        self.registry.close_endpoint(&self.endpoint);
    }

    fn notify_error(&self, error: &SessionError, callback: Option<&mut ErrorCallback>) {
        if !self.control.error_notified.swap(true, Ordering::AcqRel) {
            if let Some(cb) = callback {
                cb(error);
            }
        }
        self.control.set_state(StreamState::Stopped);
    }

    /// 客户端侧样本格式
    #[inline]
    pub fn client_format(&self) -> SampleFormat {
        self.client_format
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("device", &self.endpoint.config().device_id)
            .field("state", &self.control.state())
            .field("client_format", &self.client_format)
            .finish_non_exhaustive()
    }
}

/// 跨线程停止请求
pub struct StopHandle {
    control: Arc<SessionControl>,
}

impl StopHandle {
    /// 请求停止；读/回调循环在下轮顶部退出，不截断部分传输
    pub fn request_stop(&self) {
        match self.control.state() {
            StreamState::Starting | StreamState::Started => {
                self.control.set_state(StreamState::Stopping);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::backend::SimulatedDeviceFactory;
    use crate::endpoint::{Direction, SharingMode};
    use std::sync::atomic::AtomicUsize;

    const MS: i64 = 1_000_000;
    /// 测试里所有单调时间都从一个远离 0 的基准出发
    const T0: i64 = 1_000_000_000;

    fn registry() -> Arc<EndpointRegistry> {
        Arc::new(EndpointRegistry::new(Box::new(SimulatedDeviceFactory::new(4))))
    }

    fn mono_config(sharing_mode: SharingMode, device_format: SampleFormat) -> EndpointConfig {
        EndpointConfig {
            device_id: 0,
            direction: Direction::Input,
            sharing_mode,
            sample_format: device_format,
            channel_count: 1,
            sample_rate: 48000,
            frames_per_burst: 240,
            capacity_frames: 4096,
        }
    }

    fn i16_frames(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_unsupported_format_rejected_and_endpoint_released() {
        let registry = registry();
        let config = mono_config(SharingMode::Exclusive, SampleFormat::I24);

        let err = StreamSession::open(Arc::clone(&registry), config, SampleFormat::F32)
            .unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedFormat { .. }));

        // 失败路径必须释放端点引用，设备立即重新可用
        let config = mono_config(SharingMode::Exclusive, SampleFormat::I16);
        StreamSession::open(registry, config, SampleFormat::F32).unwrap();
    }

    #[test]
    fn test_coupled_read_with_conversion() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::F32).unwrap();
        session.start().unwrap();

        // 第一轮读触发 catch-up（空环上是 no-op），之后写入的数据才可见
        let mut scratch = vec![0u8; 240 * 4];
        let _ = session.read(&mut scratch, 240, MS).unwrap();

        let samples: [i16; 4] = [0, 8192, -8192, 32767];
        session.endpoint().ring().write_frames(&i16_frames(&samples));

        let mut buf = vec![0u8; 4 * 4];
        let n = session.read(&mut buf, 4, 100 * MS).unwrap();
        assert_eq!(n, 4);

        for (i, &expected) in samples.iter().enumerate() {
            let f = f32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(f, expected as f32 / 32768.0, "sample {} mismatch", i);
        }
    }

    #[test]
    fn test_catch_up_keeps_frames_read_monotonic() {
        let registry = registry();
        let config = mono_config(SharingMode::Exclusive, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), StreamState::Starting);

        // 模拟会话的读计数器领先于服务端（陈旧状态）
        session.endpoint().ring().set_read_counter(5000);
        let before = session.frames_read();
        assert_eq!(before, 5000);

        let mut buf = vec![0u8; 240 * 2];

        // 时钟模型未就绪：只要求短轮询，不读取，也不 catch-up
        session.endpoint().publish_timestamp(0, T0);
        let p = session.process_data_now(&mut buf, 240, T0 + MS).unwrap();
        assert_eq!(p.frames, 0);
        assert_eq!(session.state(), StreamState::Starting);
        assert_eq!(p.next_wake_nanos, T0 + MS + DEFAULT_STARTUP_POLL_NANOS);

        // 第二个锚点让时钟跑起来，catch-up 把读计数器吸到写计数器
        session.endpoint().publish_timestamp(240, T0 + 5 * MS);
        session.process_data_now(&mut buf, 240, T0 + 5 * MS).unwrap();
        assert_eq!(session.state(), StreamState::Started);

        // 内部读计数器倒退了（5000 → 240），对外位置不许倒退
        let after = session.frames_read();
        assert!(after >= before, "frames_read regressed: {} -> {}", before, after);
        assert_eq!(after, 5000);

        // 继续推进后严格增长
        session.endpoint().publish_timestamp(480, T0 + 10 * MS);
        let p = session.process_data_now(&mut buf, 240, T0 + 10 * MS).unwrap();
        assert_eq!(p.frames, 240);
        assert_eq!(session.frames_read(), 5000 + 240);
        assert!(session.frames_written() >= session.frames_read());
    }

    #[test]
    fn test_frames_written_monotonic_across_slow_reports() {
        let registry = registry();
        let config = mono_config(SharingMode::Exclusive, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();
        session.start().unwrap();

        let mut buf = vec![0u8; 240 * 2];
        session.endpoint().publish_timestamp(0, T0);
        session.process_data_now(&mut buf, 240, T0 + MS).unwrap();
        session.endpoint().publish_timestamp(480, T0 + 5 * MS);
        session.process_data_now(&mut buf, 240, T0 + 5 * MS).unwrap();

        // 没有新上报时外推把写位置推到 960
        session.process_data_now(&mut buf, 240, T0 + 10 * MS).unwrap();
        let peak = session.frames_written();
        assert!(peak >= 960, "extrapolation should reach 960, got {}", peak);

        // 慢于外推的上报把时钟模型重新锚定到更低的位置（600 @ 10ms），
        // 内部写计数器回撤，对外位置不许倒退
        session.endpoint().publish_timestamp(600, T0 + 10 * MS);
        session.process_data_now(&mut buf, 240, T0 + 10 * MS).unwrap();
        assert!(
            session.endpoint().ring().write_counter() < peak,
            "re-anchoring should pull the raw write counter back"
        );
        assert!(
            session.frames_written() >= peak,
            "frames_written regressed: {} -> {}",
            peak,
            session.frames_written()
        );
    }

    #[test]
    fn test_short_read_wakes_earlier_than_full_burst_wait() {
        let registry = registry();
        let config = mono_config(SharingMode::Exclusive, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();
        session.start().unwrap();

        let mut buf = vec![0u8; 240 * 2];
        session.endpoint().publish_timestamp(0, T0);
        session.process_data_now(&mut buf, 240, T0 + MS).unwrap();
        session.endpoint().publish_timestamp(240, T0 + 5 * MS);
        // catch-up 把读计数器对齐到 240
        session.process_data_now(&mut buf, 240, T0 + 5 * MS).unwrap();

        // 再过 100 帧的时间：请求 240 帧只能拿到 ~100 帧
        let now = T0 + 5 * MS + 100 * 5 * MS / 240;
        let p = session.process_data_now(&mut buf, 240, now).unwrap();
        assert!(p.frames > 0 && p.frames < 240, "expected a short read, got {}", p.frames);

        // 短读后的唤醒必须早于等满 240 帧的唤醒时刻
        // （读到 240+240 帧就绪 = T0 + 15ms）
        let full_burst_wake = T0 + 15 * MS;
        assert!(
            p.next_wake_nanos < full_burst_wake,
            "wake {}ns not earlier than full-burst wait {}ns",
            p.next_wake_nanos,
            full_burst_wake
        );
    }

    #[test]
    fn test_overrun_is_counted_not_fatal() {
        let registry = registry();
        let mut config = mono_config(SharingMode::Exclusive, SampleFormat::I16);
        config.capacity_frames = 256;
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();
        session.start().unwrap();

        let mut buf = vec![0u8; 240 * 2];
        session.endpoint().publish_timestamp(0, T0);
        session.process_data_now(&mut buf, 240, T0 + MS).unwrap();
        session.endpoint().publish_timestamp(240, T0 + 5 * MS);
        session.process_data_now(&mut buf, 240, T0 + 5 * MS).unwrap();
        assert_eq!(session.xrun_count(), 0);

        // 服务端位置猛跳，超过缓冲区容量：overrun 观测，流继续
        session.endpoint().publish_timestamp(20000, T0 + 10 * MS);
        let p = session.process_data_now(&mut buf, 240, T0 + 10 * MS);
        assert!(p.is_ok(), "overrun must not be fatal");
        assert!(session.xrun_count() >= 1);
    }

    #[test]
    fn test_callback_delivers_and_stop_joins() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cb = Arc::clone(&delivered);
        session
            .start_with_callback(
                Box::new(move |_bytes, frames| {
                    delivered_cb.fetch_add(frames, Ordering::SeqCst);
                    CallbackResult::Continue
                }),
                None,
            )
            .unwrap();

        // 回调线程跑起来之后再灌数据（启动时的 catch-up 会跳过旧数据）
        std::thread::sleep(std::time::Duration::from_millis(20));
        let samples = vec![100i16; 480];
        session.endpoint().ring().write_frames(&i16_frames(&samples));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while delivered.load(Ordering::SeqCst) < 480 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 480);

        session.stop();
        assert_eq!(session.state(), StreamState::Stopped);
    }

    #[test]
    fn test_callback_stop_request_terminates_loop() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();

        session
            .start_with_callback(
                Box::new(move |_bytes, _frames| CallbackResult::Stop),
                None,
            )
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        session.endpoint().ring().write_frames(&i16_frames(&[1i16; 240]));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while session.state() != StreamState::Stopped && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(session.state(), StreamState::Stopped);
        session.stop();
    }

    #[test]
    fn test_fatal_error_notifies_exactly_once() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let notified_cb = Arc::clone(&notified);
        session
            .start_with_callback(
                Box::new(|_bytes, _frames| CallbackResult::Continue),
                Some(Box::new(move |err| {
                    assert!(matches!(err, SessionError::DeviceFailure(_)));
                    notified_cb.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        session.endpoint().report_failure("simulated device yank");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while session.state() != StreamState::Stopped && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(session.state(), StreamState::Stopped);
        assert_eq!(notified.load(Ordering::SeqCst), 1, "error callback must fire exactly once");

        session.stop();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_requires_start() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();

        let mut buf = vec![0u8; 16];
        let err = session.read(&mut buf, 8, MS).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[test]
    fn test_stop_handle_interrupts_blocking_read() {
        let registry = registry();
        let config = mono_config(SharingMode::Shared, SampleFormat::I16);
        let mut session =
            StreamSession::open(registry, config, SampleFormat::I16).unwrap();
        session.start().unwrap();

        let handle = session.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            handle.request_stop();
        });

        // 没有生产者，这个读只能靠 stop 或超时结束；stop 先到
        let mut buf = vec![0u8; 240 * 2];
        let started = std::time::Instant::now();
        let n = session.read(&mut buf, 240, 5_000 * MS).unwrap();
        assert_eq!(n, 0);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "stop request must interrupt the read well before the timeout"
        );
        stopper.join().unwrap();
    }
}
