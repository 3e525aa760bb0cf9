//! 单调时钟
//!
//! 整个引擎只使用单调纳秒时间，不使用墙上时钟（epoch 时间）。
//! ClockModel 的外推和唤醒调度都建立在这个时间源之上。

/// 获取当前单调时间（纳秒）
///
/// unix 平台直接走 CLOCK_MONOTONIC，避免 Instant 的额外封装开销
#[cfg(unix)]
#[inline]
pub fn now_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC 在所有支持的平台上都存在，调用不会失败
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(not(unix))]
#[inline]
pub fn now_nanos() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as i64
}

/// 睡眠到指定的单调时间点
///
/// 已经过期的 deadline 直接返回，不睡眠
pub fn sleep_until_nanos(deadline_nanos: i64) {
    let now = now_nanos();
    if deadline_nanos > now {
        std::thread::sleep(std::time::Duration::from_nanos(
            (deadline_nanos - now) as u64,
        ));
    }
}
