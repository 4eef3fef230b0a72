use crate::peer::types::{Descriptor, GatheringState};
use tracing::{debug, info, warn};

/// Отслеживает сбор ICE-кандидатов и отдаёт финальный дескриптор ровно один раз.
///
/// Trickle ICE не используется: дескриптор передаётся вручную одним куском,
/// поэтому кандидаты, найденные после `Complete`, в него уже не попадают.
#[derive(Debug, Default)]
pub struct DescriptorGatherer {
    state: GatheringState,
    handed_over: bool,
}

impl DescriptorGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GatheringState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == GatheringState::Complete
    }

    /// Учитывает прогресс движка. `true` только для первого `Complete`,
    /// откаты и повторы игнорируются.
    pub fn observe(&mut self, progress: GatheringState) -> bool {
        if progress <= self.state {
            if progress == GatheringState::Complete {
                debug!("Duplicate gathering-complete signal ignored");
            }
            return false;
        }
        debug!("ICE gathering state: {:?} -> {:?}", self.state, progress);
        self.state = progress;
        self.state == GatheringState::Complete
    }

    /// Забирает единственную передачу финального дескриптора.
    pub fn claim(&mut self) -> bool {
        if !self.is_complete() || self.handed_over {
            return false;
        }
        self.handed_over = true;
        true
    }
}

/// Сводка кандидатов финального дескриптора
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn total(&self) -> usize {
        self.host + self.srflx + self.prflx + self.relay
    }
}

pub fn analyze_candidates(descriptor: &Descriptor) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for line in descriptor.sdp.lines() {
        let line = line.trim();
        if !line.starts_with("a=candidate:") {
            continue;
        }
        if line.contains("typ host") {
            summary.host += 1;
        } else if line.contains("typ srflx") {
            summary.srflx += 1;
        } else if line.contains("typ prflx") {
            summary.prflx += 1;
        } else if line.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} prflx, {} relay",
        summary.host, summary.srflx, summary.prflx, summary.relay
    );

    if summary.total() == 0 {
        warn!("Descriptor carries no candidates; the other side has no path to reach us");
    } else if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }

    summary
}
