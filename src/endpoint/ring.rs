//! Lock-free 单生产者/单消费者音频帧环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者通过两个单调递增的 i64 计数器同步，
//!   每个计数器只有一方写入
//! - 零分配：所有内存在创建时预分配
//! - 缓存友好：计数器用 CachePadded 隔离，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 计数器永不回绕（i64 按 48kHz 计数要跑几十万年），所以
//! `write - read` 直接就是缓冲区内的帧数。正确使用下它落在
//! `[0, capacity]`；越界在写侧是 overrun、读侧是 underrun，
//! 由上层按计数上报，这一层不产生任何错误。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// 一次读取可见的至多两段连续字节区域（缓冲区回绕时分裂为两段）
#[derive(Debug)]
pub struct Regions<'a> {
    pub first: &'a [u8],
    pub second: &'a [u8],
}

impl Regions<'_> {
    /// 两段区域覆盖的总字节数
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// 是否没有可用数据
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }
}

/// SPSC 帧环形缓冲区
///
/// 既服务于 coupled 模式（生产者显式 write_frames），
/// 也服务于 free-running 模式（写计数器由时钟模型外推直接设置）
pub struct RingBufferEndpoint {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity_frames: usize,
    bytes_per_frame: usize,
    mask: usize,

    write_counter: CachePadded<AtomicI64>,
    read_counter: CachePadded<AtomicI64>,

    /// 生产者是否自主推进（硬件 MMAP/DMA 风格），而不是被本进程的
    /// 显式写调用驱动
    free_running: bool,

    memory_locked: AtomicBool,
}

// SPSC 契约：同一时刻至多一个线程写 write_counter/数据，至多一个线程
// 写 read_counter。数据槽的可见性由计数器的 Acquire/Release 配对保证。
unsafe impl Send for RingBufferEndpoint {}
unsafe impl Sync for RingBufferEndpoint {}

impl RingBufferEndpoint {
    /// 创建环形缓冲区
    ///
    /// capacity_frames 必须是 2 的幂
    pub fn new(capacity_frames: usize, bytes_per_frame: usize, free_running: bool) -> Self {
        assert!(
            capacity_frames.is_power_of_two(),
            "capacity must be power of two"
        );
        assert!(bytes_per_frame > 0, "frame size must be non-zero");

        let bytes = capacity_frames * bytes_per_frame;
        let buffer: Vec<UnsafeCell<u8>> = (0..bytes).map(|_| UnsafeCell::new(0)).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity_frames,
            bytes_per_frame,
            mask: capacity_frames - 1,
            write_counter: CachePadded::new(AtomicI64::new(0)),
            read_counter: CachePadded::new(AtomicI64::new(0)),
            free_running,
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的缓冲区（向上取整到 2 的幂）
    pub fn with_min_capacity(
        min_capacity_frames: usize,
        bytes_per_frame: usize,
        free_running: bool,
    ) -> Self {
        Self::new(
            min_capacity_frames.next_power_of_two(),
            bytes_per_frame,
            free_running,
        )
    }

    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    #[inline]
    pub fn is_free_running(&self) -> bool {
        self.free_running
    }

    /// 当前可读帧数 = write - read
    ///
    /// 计数器被外部直接设置后该值可能超过 capacity（overrun 观测），
    /// 这不是错误，由上层计数
    #[inline]
    pub fn full_frames_available(&self) -> i64 {
        let write = self.write_counter.load(Ordering::Acquire);
        let read = self.read_counter.load(Ordering::Acquire);
        write - read
    }

    /// 当前可写帧数 = capacity - (write - read)
    ///
    /// 可能为负：生产者已经覆盖了尚未读取的数据（overrun 观测），
    /// 返回给上层计数，不是错误
    #[inline]
    pub fn empty_frames_available(&self) -> i64 {
        self.capacity_frames as i64 - self.full_frames_available()
    }

    /// 取至多 max_frames 帧的可读区域（消费者调用）
    ///
    /// 缓冲区回绕时分裂为两段。绝不阻塞，空缓冲返回空区域。
    pub fn full_frames_regions(&self, max_frames: usize) -> Regions<'_> {
        let read = self.read_counter.load(Ordering::Relaxed);
        let write = self.write_counter.load(Ordering::Acquire);

        // 负可用（计数器被重置途中）按空处理；超容量按满处理
        let available = (write - read).clamp(0, self.capacity_frames as i64) as usize;
        let frames = available.min(max_frames);

        let index = (read as u64 as usize) & self.mask;
        let first_frames = frames.min(self.capacity_frames - index);
        let second_frames = frames - first_frames;

        let bpf = self.bytes_per_frame;
        let base = self.buffer.as_ptr() as *const u8;
        unsafe {
            Regions {
                first: std::slice::from_raw_parts(base.add(index * bpf), first_frames * bpf),
                second: std::slice::from_raw_parts(base, second_frames * bpf),
            }
        }
    }

    /// 写入帧数据（coupled 模式生产者调用）
    ///
    /// 返回实际写入的帧数，wait-free，绝不阻塞
    pub fn write_frames(&self, data: &[u8]) -> usize {
        debug_assert_eq!(data.len() % self.bytes_per_frame, 0);

        let write = self.write_counter.load(Ordering::Relaxed);
        let read = self.read_counter.load(Ordering::Acquire);

        let free = (self.capacity_frames as i64 - (write - read)).max(0) as usize;
        let frames = (data.len() / self.bytes_per_frame).min(free);

        let index = (write as u64 as usize) & self.mask;
        let first_frames = frames.min(self.capacity_frames - index);
        let second_frames = frames - first_frames;

        let bpf = self.bytes_per_frame;
        let base = self.buffer.as_ptr() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                base.add(index * bpf),
                first_frames * bpf,
            );
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(first_frames * bpf),
                base,
                second_frames * bpf,
            );
        }

        self.write_counter
            .store(write + frames as i64, Ordering::Release);
        frames
    }

    /// 推进读计数器（消费者调用，调用方负责不越过可用数据）
    #[inline]
    pub fn advance_read_index(&self, frames: i64) {
        let read = self.read_counter.load(Ordering::Relaxed);
        self.read_counter.store(read + frames, Ordering::Release);
    }

    /// 推进写计数器
    #[inline]
    pub fn advance_write_index(&self, frames: i64) {
        let write = self.write_counter.load(Ordering::Relaxed);
        self.write_counter.store(write + frames, Ordering::Release);
    }

    #[inline]
    pub fn read_counter(&self) -> i64 {
        self.read_counter.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_counter(&self) -> i64 {
        self.write_counter.load(Ordering::Acquire)
    }

    /// 直接设置读计数器（catch-up 用）
    #[inline]
    pub fn set_read_counter(&self, frames: i64) {
        self.read_counter.store(frames, Ordering::Release);
    }

    /// 直接设置写计数器（free-running 同步用）
    #[inline]
    pub fn set_write_counter(&self, frames: i64) {
        self.write_counter.store(frames, Ordering::Release);
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 实时路径上 page fault 会造成严重的时序抖动。返回是否成功。
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.buffer.len();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    #[cfg(unix)]
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.buffer.len();

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    #[cfg(not(unix))]
    pub fn unlock_memory(&self) {}
}

impl Drop for RingBufferEndpoint {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
