//! Интерфейсы, через которые сессия управляет внешними компонентами.
//!
//! Транспортный движок делает всю сетевую работу (ICE, DTLS, SRTP), источник
//! медиа владеет устройствами захвата. Сессия только вызывает их через эти трейты.

use crate::error::{EngineError, MediaError};
use crate::peer::types::{Descriptor, EngineSignal, LocalTrack, Role, StatsReport};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Добавляет локальный трек захвата, чтобы он попал в offer.
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError>;

    /// Offer для инициатора, answer для ответчика.
    async fn create_local_descriptor(&self, role: Role) -> Result<Descriptor, EngineError>;

    async fn set_local_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError>;

    /// Возвращает [`EngineError::Rejected`] для дескриптора, который не подходит
    /// к текущему согласованию.
    async fn set_remote_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError>;

    /// Текущий локальный дескриптор со всеми собранными на данный момент кандидатами.
    async fn current_local_descriptor(&self) -> Option<Descriptor>;

    async fn statistics(&self) -> Vec<StatsReport>;

    /// Ход сбора кандидатов, состояние соединения и появление треков в порядке генерации.
    /// Приёмник отдаётся один раз, дальше `None`.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<EngineSignal>>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Локальные камера и микрофон, принадлежат инициатору.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MediaError>;

    /// Останавливает все захваченные треки.
    fn release(&self);
}
