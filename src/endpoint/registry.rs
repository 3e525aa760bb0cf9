//! 端点注册表
//!
//! (设备, 方向, 共享模式) → 活动端点 的唯一事实来源：
//! - 独占端点：同一 (设备, 方向) 同时至多一个，且与共享端点互斥
//! - 共享端点：同一 (设备, 方向) 复用一个，引用计数
//! - 两个集合各有一把锁，独占和共享查找互不竞争
//!
//! 显式构造、显式 shutdown，没有任何全局单例。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{EndpointBackendFactory, OpenFailed};
use super::{Direction, Endpoint, EndpointConfig, SharingMode};

/// 注册表层错误
///
/// 独占冲突是正常的预期结果（第二个独占客户端被拒绝），
/// 打开失败单独成类，调用方可以据此回退到共享模式
#[derive(Debug)]
pub enum RegistryError {
    /// 设备已被占用（独占冲突或反向互斥）
    EndpointUnavailable,
    /// 后端打开失败
    OpenFailed(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointUnavailable => write!(f, "endpoint unavailable: device busy"),
            Self::OpenFailed(s) => write!(f, "endpoint open failed: {}", s),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<OpenFailed> for RegistryError {
    fn from(e: OpenFailed) -> Self {
        Self::OpenFailed(e.0)
    }
}

/// 端点注册表
pub struct EndpointRegistry {
    factory: Box<dyn EndpointBackendFactory>,
    exclusive: Mutex<Vec<Arc<Endpoint>>>,
    shared: Mutex<Vec<Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new(factory: Box<dyn EndpointBackendFactory>) -> Self {
        Self {
            factory,
            exclusive: Mutex::new(Vec::new()),
            shared: Mutex::new(Vec::new()),
        }
    }

    /// 打开端点
    ///
    /// 独占请求：设备上已有任何端点（独占或共享）即失败；
    /// 共享请求：设备被独占持有即失败，否则复用或新建
    pub fn open_endpoint(&self, config: EndpointConfig) -> Result<Arc<Endpoint>, RegistryError> {
        match config.sharing_mode {
            SharingMode::Exclusive => self.open_exclusive(config),
            SharingMode::Shared => self.open_shared(config),
        }
    }

    fn open_exclusive(&self, config: EndpointConfig) -> Result<Arc<Endpoint>, RegistryError> {
        // 锁序固定：先独占集再共享集
        let mut exclusive = self.exclusive.lock().unwrap();
        {
            let shared = self.shared.lock().unwrap();
            if find(&exclusive, config.device_id, config.direction).is_some()
                || find(&shared, config.device_id, config.direction).is_some()
            {
                log::info!(
                    "Exclusive open denied: device {} {:?} already in use",
                    config.device_id,
                    config.direction
                );
                return Err(RegistryError::EndpointUnavailable);
            }
        }

        let backend = self.factory.open(&config)?;
        let endpoint = Arc::new(Endpoint::new(config, backend));
        exclusive.push(Arc::clone(&endpoint));
        log::info!(
            "Exclusive endpoint opened: device {} {:?}",
            config.device_id,
            config.direction
        );
        Ok(endpoint)
    }

    fn open_shared(&self, config: EndpointConfig) -> Result<Arc<Endpoint>, RegistryError> {
        // 锁序固定：先独占集再共享集。独占守卫必须跨越整个共享
        // 查找/插入：提前放掉会留出一个窗口，让并发的独占打开在
        // 共享端点插入前通过检查，同一设备被双重持有
        let exclusive = self.exclusive.lock().unwrap();
        if find(&exclusive, config.device_id, config.direction).is_some() {
            log::info!(
                "Shared open denied: device {} {:?} held exclusively",
                config.device_id,
                config.direction
            );
            return Err(RegistryError::EndpointUnavailable);
        }

        let mut shared = self.shared.lock().unwrap();
        if let Some(existing) = find(&shared, config.device_id, config.direction) {
            let count = existing.retain();
            log::debug!(
                "Shared endpoint reused: device {} {:?}, open count {}",
                config.device_id,
                config.direction,
                count
            );
            return Ok(Arc::clone(existing));
        }

        let backend = self.factory.open(&config)?;
        let endpoint = Arc::new(Endpoint::new(config, backend));
        shared.push(Arc::clone(&endpoint));
        log::info!(
            "Shared endpoint opened: device {} {:?}",
            config.device_id,
            config.direction
        );
        Ok(endpoint)
    }

    /// 关闭端点（释放一个引用）
    ///
    /// 计数归零时从集合移除并物理关闭后端，且只关闭一次；
    /// 重复 close 是 no-op
    pub fn close_endpoint(&self, endpoint: &Arc<Endpoint>) {
        let mut set = self.set_for(endpoint.config().sharing_mode);

        let Some(index) = set.iter().position(|e| Arc::ptr_eq(e, endpoint)) else {
            log::debug!("close_endpoint: endpoint already removed, ignoring");
            return;
        };

        let remaining = endpoint.release();
        if remaining == 0 {
            let endpoint = set.swap_remove(index);
            drop(set); // 物理关闭不需要持锁
            endpoint.close_backend();
        } else {
            log::debug!(
                "Endpoint released: device {}, open count {}",
                endpoint.config().device_id,
                remaining
            );
        }
    }

    /// 关闭所有剩余端点（显式停机）
    pub fn shutdown(&self) {
        for set in [&self.exclusive, &self.shared] {
            let drained: Vec<_> = set.lock().unwrap().drain(..).collect();
            for endpoint in drained {
                log::warn!(
                    "Registry shutdown closing endpoint: device {} (open count {})",
                    endpoint.config().device_id,
                    endpoint.open_count()
                );
                endpoint.close_backend();
            }
        }
    }

    fn set_for(&self, mode: SharingMode) -> MutexGuard<'_, Vec<Arc<Endpoint>>> {
        match mode {
            SharingMode::Exclusive => self.exclusive.lock().unwrap(),
            SharingMode::Shared => self.shared.lock().unwrap(),
        }
    }
}

fn find(
    set: &[Arc<Endpoint>],
    device_id: u32,
    direction: Direction,
) -> Option<&Arc<Endpoint>> {
    set.iter()
        .find(|e| e.config().device_id == device_id && e.config().direction == direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::backend::{EndpointBackend, SimulatedDeviceFactory};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 统计物理关闭次数的测试工厂
    struct CountingFactory {
        closes: Arc<AtomicU32>,
    }

    struct CountingBackend {
        free_running: bool,
        closes: Arc<AtomicU32>,
    }

    impl EndpointBackend for CountingBackend {
        fn is_free_running(&self) -> bool {
            self.free_running
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> &'static str {
            "counting"
        }
    }

    impl EndpointBackendFactory for CountingFactory {
        fn open(&self, config: &EndpointConfig) -> Result<Box<dyn EndpointBackend>, OpenFailed> {
            Ok(Box::new(CountingBackend {
                free_running: config.sharing_mode == SharingMode::Exclusive,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(Box::new(SimulatedDeviceFactory::new(4)))
    }

    fn config(device_id: u32, sharing_mode: SharingMode) -> EndpointConfig {
        EndpointConfig {
            device_id,
            sharing_mode,
            ..EndpointConfig::default()
        }
    }

    #[test]
    fn test_shared_open_twice_returns_same_endpoint() {
        let registry = registry();

        let a = registry.open_endpoint(config(1, SharingMode::Shared)).unwrap();
        let b = registry.open_endpoint(config(1, SharingMode::Shared)).unwrap();

        assert!(Arc::ptr_eq(&a, &b), "same (device, direction) must share one endpoint");
        assert_eq!(a.open_count(), 2);
    }

    #[test]
    fn test_shared_refcount_teardown_once() {
        let closes = Arc::new(AtomicU32::new(0));
        let registry = EndpointRegistry::new(Box::new(CountingFactory {
            closes: Arc::clone(&closes),
        }));

        let a = registry.open_endpoint(config(1, SharingMode::Shared)).unwrap();
        let b = registry.open_endpoint(config(1, SharingMode::Shared)).unwrap();

        // 一个客户端关闭，另一个还持有，不能物理关闭
        registry.close_endpoint(&a);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(b.open_count(), 1);

        // 最后一个客户端关闭，物理关闭恰好一次
        registry.close_endpoint(&b);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // 重复 close 是 no-op
        registry.close_endpoint(&b);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exclusive_collision() {
        let registry = registry();

        let _held = registry.open_endpoint(config(2, SharingMode::Exclusive)).unwrap();
        let err = registry
            .open_endpoint(config(2, SharingMode::Exclusive))
            .unwrap_err();
        assert!(matches!(err, RegistryError::EndpointUnavailable));
    }

    #[test]
    fn test_exclusive_denied_when_shared_held() {
        let registry = registry();

        let _shared = registry.open_endpoint(config(2, SharingMode::Shared)).unwrap();
        let err = registry
            .open_endpoint(config(2, SharingMode::Exclusive))
            .unwrap_err();
        assert!(matches!(err, RegistryError::EndpointUnavailable));
    }

    #[test]
    fn test_concurrent_shared_and_exclusive_opens_are_arbitrated() {
        use std::sync::Barrier;

        // 同一设备上并发的共享打开和独占打开：任何交错下都恰好
        // 一个成功，绝不出现同时被共享和独占持有
        for _ in 0..200 {
            let registry = Arc::new(registry());
            let barrier = Arc::new(Barrier::new(2));

            let shared = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.open_endpoint(config(1, SharingMode::Shared)).is_ok()
                })
            };
            let exclusive = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .open_endpoint(config(1, SharingMode::Exclusive))
                        .is_ok()
                })
            };

            let shared_ok = shared.join().unwrap();
            let exclusive_ok = exclusive.join().unwrap();
            assert!(
                shared_ok != exclusive_ok,
                "exactly one concurrent open must win (shared {}, exclusive {})",
                shared_ok,
                exclusive_ok
            );
        }
    }

    #[test]
    fn test_shared_denied_when_exclusive_held() {
        let registry = registry();

        let _held = registry.open_endpoint(config(2, SharingMode::Exclusive)).unwrap();
        let err = registry
            .open_endpoint(config(2, SharingMode::Shared))
            .unwrap_err();
        assert!(matches!(err, RegistryError::EndpointUnavailable));
    }

    #[test]
    fn test_device_freed_after_close() {
        let registry = registry();

        let held = registry.open_endpoint(config(2, SharingMode::Exclusive)).unwrap();
        registry.close_endpoint(&held);

        // 关闭后设备重新可用
        registry.open_endpoint(config(2, SharingMode::Shared)).unwrap();
    }

    #[test]
    fn test_different_directions_do_not_collide() {
        let registry = registry();

        let input = config(1, SharingMode::Exclusive);
        let output = EndpointConfig {
            direction: Direction::Output,
            ..input
        };
        registry.open_endpoint(input).unwrap();
        registry.open_endpoint(output).unwrap();
    }

    #[test]
    fn test_open_failed_propagates() {
        let registry = registry();

        let err = registry
            .open_endpoint(config(99, SharingMode::Exclusive))
            .unwrap_err();
        match err {
            RegistryError::OpenFailed(msg) => assert!(msg.contains("no such device")),
            other => panic!("expected OpenFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let closes = Arc::new(AtomicU32::new(0));
        let registry = EndpointRegistry::new(Box::new(CountingFactory {
            closes: Arc::clone(&closes),
        }));

        let _a = registry.open_endpoint(config(0, SharingMode::Shared)).unwrap();
        let _b = registry.open_endpoint(config(1, SharingMode::Exclusive)).unwrap();

        registry.shutdown();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
