//! 端点后端能力接口
//!
//! 核心对被排除的硬件/混音器世界只有一条窄边界：打开、关闭、
//! 以及「生产者是否自主推进」。后端变体在构造时选定，
//! 不使用 C 风格函数指针表。
//!
//! - MMAP 式后端：free-running，硬件 DMA 自己推进位置，
//!   靠周期性时间戳上报告诉我们推进了多少
//! - 流式后端：coupled，由本进程的显式写调用驱动

use std::fmt;

use super::EndpointConfig;

/// 打开后端失败（硬件占用、设备不存在等）
///
/// 独立于其它错误类型：调用方据此回退到共享模式
#[derive(Debug)]
pub struct OpenFailed(pub String);

impl fmt::Display for OpenFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to open endpoint backend: {}", self.0)
    }
}

impl std::error::Error for OpenFailed {}

/// 已打开的后端
///
/// open 发生在工厂里（构造即打开）；这里只剩运行期能力
pub trait EndpointBackend: Send {
    /// 生产者是否自主推进位置（MMAP/DMA 风格）
    fn is_free_running(&self) -> bool;

    /// 物理关闭，释放硬件/混音器资源。注册表保证只调用一次。
    fn close(&mut self);

    /// 诊断用简短描述
    fn describe(&self) -> &'static str;
}

impl fmt::Debug for dyn EndpointBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointBackend")
            .field("kind", &self.describe())
            .field("free_running", &self.is_free_running())
            .finish()
    }
}

/// 后端工厂：配置 → 已打开的后端
///
/// 注册表持有一个工厂实例；没有任何全局状态
pub trait EndpointBackendFactory: Send + Sync {
    fn open(&self, config: &EndpointConfig) -> Result<Box<dyn EndpointBackend>, OpenFailed>;
}

/// MMAP 式后端（free-running）
///
/// 进程内模拟件：真实实现对应一块硬件 MMAP 缓冲区。
/// 数据与时间戳由外部生产者灌入端点，这里只管理打开状态。
pub struct MmapBackend {
    device_id: u32,
    closed: bool,
}

impl MmapBackend {
    pub fn new(device_id: u32) -> Self {
        log::info!("MmapBackend opened for device {}", device_id);
        Self {
            device_id,
            closed: false,
        }
    }
}

impl EndpointBackend for MmapBackend {
    fn is_free_running(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log::info!("MmapBackend closed for device {}", self.device_id);
        }
    }

    fn describe(&self) -> &'static str {
        "mmap"
    }
}

/// 流式后端（coupled）
///
/// 生产者通过显式写调用推进位置；共享模式的混音级走这条路
pub struct StreamBackend {
    device_id: u32,
    closed: bool,
}

impl StreamBackend {
    pub fn new(device_id: u32) -> Self {
        log::info!("StreamBackend opened for device {}", device_id);
        Self {
            device_id,
            closed: false,
        }
    }
}

impl EndpointBackend for StreamBackend {
    fn is_free_running(&self) -> bool {
        false
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log::info!("StreamBackend closed for device {}", self.device_id);
        }
    }

    fn describe(&self) -> &'static str {
        "stream"
    }
}

/// 模拟设备工厂
///
/// 设备号 [0, device_count) 存在，其余打开失败。
/// 独占请求给 MMAP 式（硬件直通），共享请求给流式（混音级）。
pub struct SimulatedDeviceFactory {
    device_count: u32,
}

impl SimulatedDeviceFactory {
    pub fn new(device_count: u32) -> Self {
        Self { device_count }
    }
}

impl EndpointBackendFactory for SimulatedDeviceFactory {
    fn open(&self, config: &EndpointConfig) -> Result<Box<dyn EndpointBackend>, OpenFailed> {
        if config.device_id >= self.device_count {
            return Err(OpenFailed(format!(
                "no such device: {} (have {})",
                config.device_id, self.device_count
            )));
        }

        match config.sharing_mode {
            super::SharingMode::Exclusive => Ok(Box::new(MmapBackend::new(config.device_id))),
            super::SharingMode::Shared => Ok(Box::new(StreamBackend::new(config.device_id))),
        }
    }
}
