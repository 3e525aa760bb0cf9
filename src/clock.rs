//! 时钟模型
//!
//! 根据生产者不定期上报的 (帧位置, 单调纳秒) 时间戳，估计
//! 「时间 ↔ 帧位置」的线性映射：
//! - convert_time_to_position：free-running 端点靠它推算当前可读数据量
//! - convert_position_to_time：唤醒调度靠它推算下一个 burst 就绪的时刻
//!
//! 锚点间隔会被钳制到一个上限（默认 20ms）：长时间没有活跃流之后，
//! 陈旧的上一锚点会推导出离谱的长周期。钳制后速率被高估，唤醒偏早，
//! 宁可多醒一次也不等一个由陈旧数据推出来的超长间隔。钳制值只影响
//! 平滑质量，不影响正确性，所以做成构造参数而不是常量。
//!
//! 本模块从不报错：返回尽力而为的数值，由上层解释。

/// 默认锚点间隔上限：20ms
pub const DEFAULT_MAX_PERIOD_NANOS: i64 = 20_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClockModelState {
    /// 锚点不足，无法计算周期
    Starting,
    /// 已有两个有效锚点，可以外推
    Running,
}

/// 时间 ↔ 帧位置 估计器
#[derive(Debug)]
pub struct ClockModel {
    state: ClockModelState,
    /// 标称采样率，锚点不足时的回退速率
    sample_rate: u32,
    max_period_nanos: i64,

    /// 最新锚点
    marker_position: i64,
    marker_nanos: i64,

    /// 最近两个锚点之间的间隔（已钳制）和跨越的帧数，
    /// 两者合起来就是当前的速率估计
    period_nanos: i64,
    period_frames: i64,

    /// 是否已经记录过第一个锚点
    has_marker: bool,
}

impl ClockModel {
    /// 创建时钟模型，使用默认的 20ms 间隔钳制
    pub fn new(sample_rate: u32) -> Self {
        Self::with_max_period(sample_rate, DEFAULT_MAX_PERIOD_NANOS)
    }

    /// 创建时钟模型并指定间隔钳制上限
    pub fn with_max_period(sample_rate: u32, max_period_nanos: i64) -> Self {
        assert!(sample_rate > 0, "sample rate must be non-zero");
        assert!(max_period_nanos > 0, "max period must be positive");

        Self {
            state: ClockModelState::Starting,
            sample_rate,
            max_period_nanos,
            marker_position: 0,
            marker_nanos: 0,
            period_nanos: 0,
            period_frames: 0,
            has_marker: false,
        }
    }

    /// 是否仍处于起步阶段（锚点不足两个）
    #[inline]
    pub fn is_starting(&self) -> bool {
        self.state == ClockModelState::Starting
    }

    /// 回到起步状态（会话重启时调用）
    pub fn reset(&mut self) {
        self.state = ClockModelState::Starting;
        self.has_marker = false;
        self.marker_position = 0;
        self.marker_nanos = 0;
        self.period_nanos = 0;
        self.period_frames = 0;
    }

    /// 记录一次时间戳上报
    ///
    /// 不前进的上报（时间或位置没有增长）被丢弃
    pub fn process_timestamp(&mut self, position: i64, nanos: i64) {
        if !self.has_marker {
            self.marker_position = position;
            self.marker_nanos = nanos;
            self.has_marker = true;
            return;
        }

        let frames = position - self.marker_position;
        let elapsed = nanos - self.marker_nanos;
        if frames <= 0 || elapsed <= 0 {
            log::debug!(
                "ClockModel: non-advancing timestamp ignored (dp={}, dt={}ns)",
                frames,
                elapsed
            );
            return;
        }

        // 钳制间隔：陈旧锚点推出的长周期会让唤醒等得过久，
        // 高估速率比那要便宜
        self.period_nanos = elapsed.min(self.max_period_nanos);
        self.period_frames = frames;
        self.marker_position = position;
        self.marker_nanos = nanos;

        if self.state == ClockModelState::Starting {
            self.state = ClockModelState::Running;
            log::debug!(
                "ClockModel running: {} frames / {}ns per report",
                self.period_frames,
                self.period_nanos
            );
        }
    }

    /// 估计指定时刻对应的帧位置
    ///
    /// 前置条件：调用方先检查 is_starting()；起步期间退回标称速率外推
    pub fn convert_time_to_position(&self, nanos: i64) -> i64 {
        let (period_nanos, period_frames) = self.rate();
        let dt = nanos - self.marker_nanos;
        self.marker_position + muldiv(dt, period_frames, period_nanos)
    }

    /// 估计指定帧位置就绪的时刻（唤醒 deadline 计算）
    pub fn convert_position_to_time(&self, position: i64) -> i64 {
        let (period_nanos, period_frames) = self.rate();
        let dp = position - self.marker_position;
        self.marker_nanos + muldiv(dp, period_nanos, period_frames)
    }

    /// 当前速率估计；测量不足时退回标称采样率
    #[inline]
    fn rate(&self) -> (i64, i64) {
        if self.period_frames > 0 && self.period_nanos > 0 {
            (self.period_nanos, self.period_frames)
        } else {
            (1_000_000_000, self.sample_rate as i64)
        }
    }
}

/// a * b / c，中间结果走 i128 防溢出
#[inline]
fn muldiv(a: i64, b: i64, c: i64) -> i64 {
    (a as i128 * b as i128 / c as i128) as i64
}
