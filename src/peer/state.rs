//! Таблица переходов жизненного цикла сессии.
//!
//! Единственный источник истины: и операции владельца сессии, и сигналы
//! движка проходят через [`next`].

use crate::peer::types::{ConnectionSignal, LifecycleState, Role};

/// Входное событие автомата.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start,
    MediaFailed,
    /// Локальный дескриптор создан и применён в движке.
    LocalDescriptorApplied,
    /// Сборщик отдал финальный локальный дескриптор.
    GatheringComplete,
    /// Автоматический выход из `ReadyToTransmit`.
    Published,
    /// Движок принял удалённый дескриптор.
    RemoteAccepted,
    Connection(ConnectionSignal),
    /// Неисправимая ошибка движка.
    Fault,
    Teardown,
}

/// Следующее состояние или `None`, если событие в этом состоянии не применимо.
pub fn next(role: Role, state: LifecycleState, input: Input) -> Option<LifecycleState> {
    use LifecycleState::*;

    if state.is_terminal() {
        return None;
    }

    match (role, state, input) {
        (_, _, Input::Teardown) => Some(Closed),
        (_, _, Input::Fault) | (_, _, Input::Connection(ConnectionSignal::Failed)) => Some(Failed),

        (_, Idle, Input::Start) => Some(Initializing),

        (Role::Initiator, Initializing, Input::MediaFailed) => Some(Failed),
        (Role::Initiator, Initializing, Input::LocalDescriptorApplied) => {
            Some(GatheringLocalDescriptor)
        }

        (Role::Responder, Initializing, Input::RemoteAccepted) => Some(DescriptorReceived),
        (Role::Responder, DescriptorReceived, Input::LocalDescriptorApplied) => {
            Some(GatheringLocalDescriptor)
        }

        (_, GatheringLocalDescriptor, Input::GatheringComplete) => Some(ReadyToTransmit),

        (Role::Initiator, ReadyToTransmit, Input::Published) => Some(AwaitingRemoteDescriptor),
        (Role::Responder, ReadyToTransmit, Input::Published) => Some(Negotiating),

        (Role::Initiator, AwaitingRemoteDescriptor, Input::RemoteAccepted) => Some(Negotiating),

        (_, Negotiating, Input::Connection(ConnectionSignal::Connected)) => Some(Connected),
        (_, Connected, Input::Connection(ConnectionSignal::Disconnected)) => Some(Disconnected),

        _ => None,
    }
}

/// Сигналы соединения, которые могут прийти раньше `Negotiating`;
/// их надо проиграть заново после входа в `Negotiating`.
pub fn is_deferred(state: LifecycleState, signal: ConnectionSignal) -> bool {
    use LifecycleState::*;
    matches!(
        signal,
        ConnectionSignal::Connected | ConnectionSignal::Disconnected
    ) && matches!(
        state,
        Initializing
            | GatheringLocalDescriptor
            | ReadyToTransmit
            | AwaitingRemoteDescriptor
            | DescriptorReceived
    )
}
