use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Логирование с временными метками. `RUST_LOG` имеет приоритет над профилем сборки.
/// Повторный вызов ничего не делает.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(peer: &str, label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            peer,
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index
        );
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(peer: &str, pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    peer,
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
