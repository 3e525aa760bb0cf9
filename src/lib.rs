//! Aqueduct
//!
//! 低延迟音频流引擎：
//! - 客户端与服务端之间 lock-free 的共享环形缓冲传输
//! - 时钟漂移建模（时间 ↔ 帧位置），唤醒刚好卡在下一个 burst 就绪时刻
//! - 端点注册表：独占/共享仲裁 + 引用计数的端点复用
//! - 流会话：格式转换、catch-up、对外单调的位置计数

pub mod clock;
pub mod endpoint;
pub mod format;
pub mod session;
pub mod timing;

pub use clock::ClockModel;
pub use endpoint::registry::{EndpointRegistry, RegistryError};
pub use endpoint::{Direction, Endpoint, EndpointConfig, SharingMode};
pub use format::SampleFormat;
pub use session::{CallbackResult, SessionError, StreamSession, StreamState};
