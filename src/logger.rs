use crate::peer::types::{PairState, StatsReport};
use tracing::{info, warn};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

const DEFAULT_FILTER: &str = "info,webrtc=warn";

/// Логирование с временными метками.
///
/// Устанавливает глобальный subscriber один раз; повторные вызовы ничего не делают.
/// В release-сборке логирование выключено (см. [`crate::config::LOGGING_ENABLED`]).
pub fn init() {
    if !crate::config::LOGGING_ENABLED {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Быстрый снимок статистики → выбранная пара
pub fn dump_selected_pair(reports: &[StatsReport], moment: &str) {
    let mut found = false;
    for report in reports {
        if let StatsReport::CandidatePair {
            id,
            state,
            nominated,
            round_trip_secs,
            bytes_sent,
            bytes_received,
        } = report
        {
            if *nominated || *state == PairState::Succeeded {
                found = true;
                info!(
                    "STATS {moment}: pair={id} state={state:?} nominated={nominated} bytes={bytes_sent}/{bytes_received} rtt={round_trip_secs:.3}s"
                );
            }
        }
    }
    if !found {
        warn!("STATS {moment}: no selected candidate pair");
    }
}
