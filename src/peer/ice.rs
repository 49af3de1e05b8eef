use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::peer::transport::DirectConnection;
use crate::peer::types::IceCandidate;

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Mutex<Vec<IceCandidate>>,
}

impl PendingCandidates {
    /// Применяет кандидат сразу или откладывает до remote description
    pub async fn apply_or_park(
        &self,
        peer: &str,
        conn: &dyn DirectConnection,
        candidate: IceCandidate,
    ) {
        if conn.has_remote_description().await {
            apply(peer, conn, candidate).await;
            return;
        }
        debug!(peer, "Remote description not set yet, queuing candidate");
        self.queue.lock().push(candidate);

        // description могла появиться, пока кандидат вставал в очередь
        if conn.has_remote_description().await {
            self.flush(peer, conn).await;
        }
    }

    /// Применяет все отложенные кандидаты после установки remote description
    pub async fn flush(&self, peer: &str, conn: &dyn DirectConnection) {
        let candidates: Vec<IceCandidate> = self.queue.lock().drain(..).collect();
        for candidate in candidates {
            debug!(peer, "Applying pending candidate: {}", candidate.candidate);
            apply(peer, conn, candidate).await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Неприменимый кандидат не ошибка: пишем в debug и забываем
async fn apply(peer: &str, conn: &dyn DirectConnection, candidate: IceCandidate) {
    match conn.add_ice_candidate(candidate).await {
        Ok(()) => debug!(peer, "Successfully added ICE candidate"),
        Err(e) => debug!(peer, "Discarding ICE candidate: {e}"),
    }
}

/// Типы локальных кандидатов одного соединения
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        let line = candidate.candidate.as_str();
        if line.contains("typ host") {
            self.host += 1;
        } else if line.contains("typ srflx") {
            self.srflx += 1;
        } else if line.contains("typ relay") {
            self.relay += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay
    }

    /// Итог сбора кандидатов
    pub fn report(&self, peer: &str) {
        info!(
            peer,
            "Candidate analysis: {} host, {} srflx, {} relay",
            self.host,
            self.srflx,
            self.relay
        );
        if self.relay == 0 {
            warn!(peer, "No TURN relay candidates found! Connection through NAT may fail.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockNetwork;
    use crate::peer::transport::ConnectionFactory;

    fn candidate(kind: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 1 10.0.0.1 5000 typ {kind}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn counts_candidate_types() {
        let mut stats = CandidateStats::default();
        for kind in ["host", "host", "srflx", "relay", "prflx"] {
            stats.record(&candidate(kind));
        }
        assert_eq!(
            stats,
            CandidateStats {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn parks_until_remote_description() {
        let net = MockNetwork::new();
        let alice = net.endpoint("alice").connect("bob").await.unwrap();
        let bob = net.endpoint("bob").connect("alice").await.unwrap();
        let pending = PendingCandidates::default();

        pending
            .apply_or_park("alice", bob.connection.as_ref(), candidate("host"))
            .await;
        assert_eq!(pending.len(), 1);

        let offer = alice.connection.create_offer().await.unwrap();
        bob.connection.apply_remote(offer).await.unwrap();
        pending.flush("alice", bob.connection.as_ref()).await;
        assert!(pending.is_empty());

        pending
            .apply_or_park("alice", bob.connection.as_ref(), candidate("srflx"))
            .await;
        assert!(pending.is_empty());
    }
}
