//! P2P-трансляция с камеры с ручным обменом дескрипторами.
//!
//! Камера работает как инициатор [`Session`], зритель как ответчик.
//! Дескрипторы переносятся вручную, сервера сигналинга нет; ICE-кандидаты
//! собираются полностью до того, как дескриптор отдаётся пользователю.

pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
mod session;
pub mod utils;

pub use config::{DescriptorFormat, IceServerConfig, SessionConfig, TurnSecret};
pub use error::{CodecError, ConfigError, EngineError, MediaError, SessionError};
pub use peer::connection::{check_ice_server_availability, WebrtcEngine};
pub use peer::engine::{MediaSource, TransportEngine};
pub use peer::types::{
    ConnectionSignal, Descriptor, DescriptorKind, EngineSignal, GatheringState, LifecycleState,
    LinkHealthSnapshot, LocalTrack, MediaKind, PairState, Role, SessionNotice, StatsReport,
};
pub use session::Session;
