use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Роль стороны в сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Камера: создаёт offer, ждёт answer
    Initiator,
    /// Зритель: принимает offer, создаёт answer
    Responder,
}

impl Role {
    /// Какой дескриптор роль создаёт локально.
    pub fn local_kind(self) -> DescriptorKind {
        match self {
            Role::Initiator => DescriptorKind::Offer,
            Role::Responder => DescriptorKind::Answer,
        }
    }

    /// Какой дескриптор роль ждёт от другой стороны.
    pub fn remote_kind(self) -> DescriptorKind {
        match self {
            Role::Initiator => DescriptorKind::Answer,
            Role::Responder => DescriptorKind::Offer,
        }
    }

    /// Состояние, в котором принимается `consume_remote_descriptor`.
    pub fn accepting_state(self) -> LifecycleState {
        match self {
            Role::Initiator => LifecycleState::AwaitingRemoteDescriptor,
            Role::Responder => LifecycleState::Initializing,
        }
    }

    /// Качество канала по умолчанию замеряет только зритель.
    pub fn samples_by_default(self) -> bool {
        matches!(self, Role::Responder)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Initializing,
    GatheringLocalDescriptor,
    ReadyToTransmit,
    AwaitingRemoteDescriptor,
    DescriptorReceived,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    /// Закрыта владельцем до другого терминального состояния.
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Disconnected | LifecycleState::Failed | LifecycleState::Closed
        )
    }
}

/// Монотонно: в пределах сессии назад не откатывается.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum GatheringState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

/// Состояние соединения со слов транспортного движка.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSignal {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

/// Описание сессии в том виде, в каком его отдаёт браузер: `{"type": "...", "sdp": "..."}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub sdp: String,
}

impl Descriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Число `a=candidate` строк в SDP.
    pub fn candidate_count(&self) -> usize {
        self.sdp
            .lines()
            .filter(|l| l.trim_start().starts_with("a=candidate:"))
            .count()
    }
}

/// Полезная нагрузка SDP с метаданными
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPayload {
    pub sdp: Descriptor,
    /// Пусто, если другая сторона прислала «голый» дескриптор браузера.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ts: i64,
}

/// Событие транспортного движка; колбэки движка сводятся в очередь таких событий.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    Gathering(GatheringState),
    Connection(ConnectionSignal),
    RemoteTrack(MediaKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// Запись из отчёта статистики движка. Счётчики накопительные.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsReport {
    InboundMedia {
        kind: MediaKind,
        bytes_received: u64,
        packets_received: u64,
        packets_lost: i64,
    },
    CandidatePair {
        id: String,
        state: PairState,
        nominated: bool,
        /// В секундах, как отдаёт движок.
        round_trip_secs: f64,
        bytes_sent: u64,
        bytes_received: u64,
    },
}

/// Снимок качества канала за один тик
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LinkHealthSnapshot {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub video_kbps: u64,
    pub audio_kbps: u64,
    pub packet_loss_percent: f64,
    pub round_trip_ms: u64,
}

/// Локальный трек захвата, который источник медиа отдаёт движку.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
}

/// Уведомления для UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StateChanged(LifecycleState),
    LocalDescriptorReady,
    RemoteTrack(MediaKind),
    LinkHealth(LinkHealthSnapshot),
    Failure(SessionError),
}
