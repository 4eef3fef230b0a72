use crate::peer::types::LifecycleState;
use thiserror::Error;

/// Ошибки [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Не удалось открыть камеру или микрофон (нет разрешения, устройство занято).
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    /// Вставленный текст дескриптора не разбирается.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Удалённый дескриптор уже принят этой сессией.
    #[error("remote descriptor already consumed")]
    AlreadyConsumed,

    /// Движок отклонил корректный дескриптор.
    #[error("descriptor rejected by transport engine: {0}")]
    RejectedDescriptor(String),

    /// Движок сообщил о провале соединения.
    #[error("transport failed")]
    TransportFailed,

    /// Движок потерял уже установленное соединение.
    #[error("transport disconnected")]
    TransportDisconnected,

    /// Операция недоступна в текущем состоянии.
    #[error("operation not allowed in state {0:?}")]
    InvalidState(LifecycleState),

    /// Прочие ошибки движка.
    #[error("transport engine error: {0}")]
    Engine(String),

    /// Истёк заданный вызывающим срок сбора кандидатов.
    #[error("candidate gathering did not complete in time")]
    GatheringTimedOut,

    /// Сессия завершилась раньше, чем наступило ожидаемое событие.
    #[error("session ended in state {0:?}")]
    Closed(LifecycleState),
}

/// Ошибки [`crate::peer::engine::TransportEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Internal(String),
}

impl From<webrtc::Error> for EngineError {
    fn from(e: webrtc::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

/// Ошибки [`crate::peer::engine::MediaSource`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MediaError(pub String);

/// Ошибки кодирования и декодирования текста дескриптора.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("descriptor exceeds {0} bytes once decompressed")]
    TooLarge(u64),

    #[error("descriptor has an empty sdp body")]
    EmptySdp,
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::MalformedDescriptor(e.to_string())
    }
}

/// Некорректная [`crate::config::SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ice server {0}: url cannot be empty")]
    EmptyUrl(String),

    #[error("ice server {0}: TURN servers require username and credential")]
    MissingTurnCredentials(String),

    #[error("sampling interval must be greater than zero")]
    ZeroSamplingInterval,

    #[error("turn secret cannot be empty")]
    EmptyTurnSecret,

    #[error("cannot mint turn credentials: {0}")]
    TurnCredentials(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
