use std::{cmp::Ordering, net::SocketAddr, sync::Arc, time::Duration};

use rand::prelude::IteratorRandom;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{config::cfg::Cfg, piece_store::store::PieceStore};

use super::{
    peer_connection::PeerConnection,
    peer_message::{Message, MessageId},
    peer_scorer::PeerScorer,
};

/// Headroom added to the measured global download rate before sizing the
/// unchoke set, so a cold session can still open slots.
const BOOTSTRAP_RATE: f64 = 50.0 * 1024.0;
/// Upload liability earned per unchoke slot, in bytes per second.
const RATE_PER_SLOT: f64 = 20.0 * 1024.0;
const MIN_SLOTS: usize = 2;
const MAX_SLOTS: usize = 10;

/// Send a keep-alive to peers whose outbound side has been silent this
/// long. Well below the common 2 minute drop threshold.
const KEEP_ALIVE_SILENCE: Duration = Duration::from_secs(100);

/// One peer's measurements for a choke round.
#[derive(Debug, Clone)]
pub struct RoundSample {
    pub addr: SocketAddr,
    pub downloaded: u64,
    pub duration: Duration,
    pub peer_interested: bool,
    pub closed: bool,
}

/// The outcome of a choke round: how many slots were open and which peers
/// ended up in the unchoke set.
#[derive(Debug)]
pub struct RoundDecision {
    pub slots: usize,
    pub unchoke: Vec<SocketAddr>,
}

impl RoundDecision {
    pub fn unchokes(&self, addr: SocketAddr) -> bool {
        self.unchoke.contains(&addr)
    }
}

/// Implements the reciprocal-upload choking algorithm with reputation
/// scoring.
///
/// Every round it reads-and-resets each peer's byte meters, scores the
/// interested peers, unchokes the best ones (slot count scaled to the
/// global download rate), and every third round optimistically unchokes one
/// random additional peer to discover new good connections.
pub struct ChokeManager {
    config: Cfg,
    scorer: PeerScorer,
    optimistic: Option<SocketAddr>,
    round: u64,
}

impl ChokeManager {
    pub fn new(config: Cfg) -> Self {
        Self {
            config,
            scorer: PeerScorer::new(),
            optimistic: None,
            round: 0,
        }
    }

    /// Periodic task: one round every `choke_period_s`, until the torrent
    /// completes.
    pub async fn run(mut self, store: Arc<PieceStore>, mut done: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.choke_period_s);
        loop {
            tokio::select! {
                _ = sleep(period) => (),
                _ = done.wait_for(|done| *done) => {
                    debug!("Choke task stopping");
                    return;
                }
            }
            let peers = store.peers_snapshot();
            self.run_round(&peers).await;
        }
    }

    /// Executes one full round against live connections: sample, decide,
    /// send the choke changes, and keep quiet links alive.
    pub async fn run_round(&mut self, peers: &[Arc<PeerConnection>]) {
        let samples: Vec<RoundSample> = peers
            .iter()
            .map(|peer| {
                let (downloaded, _uploaded, duration) = peer.reset_stats();
                RoundSample {
                    addr: peer.addr(),
                    downloaded,
                    duration,
                    peer_interested: peer.peer_interested(),
                    closed: peer.is_closed(),
                }
            })
            .collect();

        let decision = self.decide(&samples);
        debug!(
            "Choke round {}: {} slots, {} unchoked",
            self.round,
            decision.slots,
            decision.unchoke.len()
        );

        for peer in peers {
            if peer.is_closed() {
                continue;
            }
            if decision.unchokes(peer.addr()) && peer.we_choking() {
                info!("Unchoking {}", peer.addr());
                if let Err(err) = peer.send(Message::new(MessageId::Unchoke, vec![])).await {
                    warn!("Could not unchoke {}: {:?}", peer.addr(), err);
                }
            } else if !decision.unchokes(peer.addr()) && !peer.we_choking() {
                info!("Choking {}", peer.addr());
                if let Err(err) = peer.send(Message::new(MessageId::Choke, vec![])).await {
                    warn!("Could not choke {}: {:?}", peer.addr(), err);
                }
            }
        }

        for peer in peers {
            if !peer.is_closed() && peer.outbound_silence() >= KEEP_ALIVE_SILENCE {
                let _ = peer.send(Message::keep_alive()).await;
            }
        }
    }

    /// Computes one round's unchoke set from the per-peer samples.
    ///
    /// Only interested, open peers compete. Score ties break towards the
    /// lower address so rounds are deterministic. The optimistic pick made
    /// every `optimistic_every` rounds persists through the rounds between.
    pub fn decide(&mut self, samples: &[RoundSample]) -> RoundDecision {
        self.round += 1;

        let global_down: f64 = samples
            .iter()
            .filter(|sample| sample.duration.as_secs_f64() > 0.0)
            .map(|sample| sample.downloaded as f64 / sample.duration.as_secs_f64())
            .sum();
        let slots = self.slot_count(global_down);

        let mut scored: Vec<(f64, SocketAddr)> = samples
            .iter()
            .filter(|sample| sample.peer_interested && !sample.closed)
            .map(|sample| {
                let seconds = sample.duration.as_secs_f64();
                let rate = if seconds > 0.0 {
                    sample.downloaded as f64 / seconds
                } else {
                    0.0
                };
                (self.scorer.score(sample.addr, rate), sample.addr)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut unchoke: Vec<SocketAddr> =
            scored.iter().take(slots).map(|(_, addr)| *addr).collect();
        for addr in &unchoke {
            self.scorer.record_win(*addr);
        }

        if self.round % u64::from(self.config.optimistic_every.max(1)) == 0 {
            self.optimistic = scored
                .iter()
                .skip(slots)
                .map(|(_, addr)| *addr)
                .choose(&mut rand::thread_rng());
        }
        if let Some(addr) = self.optimistic {
            let still_interested = samples
                .iter()
                .any(|sample| sample.addr == addr && sample.peer_interested && !sample.closed);
            if still_interested && !unchoke.contains(&addr) {
                unchoke.push(addr);
            }
        }

        RoundDecision { slots, unchoke }
    }

    /// `clamp(floor((global_down + 50 KiB/s) / 20 KiB/s), 2, 10)`: upload
    /// liability tracks download earned, with a floor for bootstrap and a
    /// ceiling against thrashing.
    ///
    /// While no download rate has been measured yet the configured
    /// `unchoke_base_slots` is the slot count, clamped into the same range.
    fn slot_count(&self, global_down: f64) -> usize {
        if global_down <= 0.0 {
            return (self.config.unchoke_base_slots as usize).clamp(MIN_SLOTS, MAX_SLOTS);
        }
        let slots = ((global_down + BOOTSTRAP_RATE) / RATE_PER_SLOT).floor() as usize;
        slots.clamp(MIN_SLOTS, MAX_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::peer_message::handshake::{Handshake, HANDSHAKE_LEN};
    use crate::{PeerId, Sha1Hash};
    use std::collections::HashSet;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    const INFO_HASH: Sha1Hash = [7; 20];
    const OUR_ID: PeerId = *b"-RB0001-012345678901";

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn sample(port: u16, downloaded: u64) -> RoundSample {
        RoundSample {
            addr: addr(port),
            downloaded,
            duration: Duration::from_secs(1),
            peer_interested: true,
            closed: false,
        }
    }

    fn manager() -> ChokeManager {
        ChokeManager::new(Cfg::default())
    }

    fn manager_with_base_slots(unchoke_base_slots: u32) -> ChokeManager {
        ChokeManager::new(Cfg {
            unchoke_base_slots,
            ..Cfg::default()
        })
    }

    /// Connects a loopback peer whose remote immediately declares interest
    /// and then records every frame id it receives until the client hangs
    /// up.
    async fn interested_peer(id_suffix: u8) -> (Arc<PeerConnection>, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut remote_id: PeerId = *b"-RB0001-remotechoke0";
        remote_id[19] = id_suffix;

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut incoming = [0; HANDSHAKE_LEN];
            socket.read_exact(&mut incoming).await.unwrap();
            socket
                .write_all(&Handshake::new(INFO_HASH, remote_id).as_bytes())
                .await
                .unwrap();
            socket
                .write_all(&Message::new(MessageId::Interested, vec![]).as_bytes())
                .await
                .unwrap();

            let mut received = Vec::new();
            loop {
                let mut len_buf = [0; 4];
                if socket.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf);
                if len == 0 {
                    continue;
                }
                let mut body = vec![0; len as usize];
                if socket.read_exact(&mut body).await.is_err() {
                    break;
                }
                received.push(body[0]);
            }
            received
        });

        let conn = Arc::new(
            PeerConnection::connect(addr, INFO_HASH, OUR_ID, 4, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        conn.read_message().await.unwrap(); // the INTERESTED
        (conn, handle)
    }

    #[test]
    fn test_slot_count_uses_base_slots_before_any_download() {
        assert_eq!(manager().slot_count(0.0), 4);
        assert_eq!(manager_with_base_slots(8).slot_count(0.0), 8);
    }

    #[test]
    fn test_slot_count_base_slots_clamped() {
        assert_eq!(manager_with_base_slots(1).slot_count(0.0), 2);
        assert_eq!(manager_with_base_slots(20).slot_count(0.0), 10);
    }

    #[test]
    fn test_slot_count_clamps_low() {
        // Any measured rate switches to the formula, whose floor is two.
        assert_eq!(manager_with_base_slots(8).slot_count(1.0), 2);
    }

    #[test]
    fn test_slot_count_clamps_high() {
        assert_eq!(manager().slot_count(1e9), 10);
    }

    #[test]
    fn test_slot_count_scales_with_rate() {
        // (100 KiB/s + 50 KiB/s) / 20 KiB/s = 7.5
        assert_eq!(manager().slot_count(100.0 * 1024.0), 7);
    }

    /// Six peers at 1000..100 B/s: the global rate only earns the floor of
    /// two slots, which the two fastest peers win.
    #[test]
    fn test_round_with_slow_swarm_unchokes_top_two() {
        let mut manager = manager();
        let samples = vec![
            sample(1, 1000),
            sample(2, 800),
            sample(3, 600),
            sample(4, 400),
            sample(5, 200),
            sample(6, 100),
        ];

        let decision = manager.decide(&samples);

        assert_eq!(decision.slots, 2);
        assert_eq!(decision.unchoke, vec![addr(1), addr(2)]);
    }

    /// Seven peers at 13.5 KiB/s each: ~94.5 KiB/s global earns seven
    /// slots, so everyone is unchoked.
    #[test]
    fn test_round_with_fast_swarm_unchokes_everyone() {
        let mut manager = manager();
        let samples: Vec<RoundSample> = (1..=7)
            .map(|port| sample(port, (13.5 * 1024.0) as u64))
            .collect();

        let decision = manager.decide(&samples);

        assert_eq!(decision.slots, 7);
        assert_eq!(decision.unchoke.len(), 7);
    }

    #[test]
    fn test_uninterested_peers_never_unchoked() {
        let mut manager = manager();
        let mut idle = sample(1, 100_000);
        idle.peer_interested = false;
        let samples = vec![idle, sample(2, 10)];

        let decision = manager.decide(&samples);

        assert_eq!(decision.unchoke, vec![addr(2)]);
    }

    #[test]
    fn test_closed_peers_never_unchoked() {
        let mut manager = manager();
        let mut dead = sample(1, 100_000);
        dead.closed = true;
        let samples = vec![dead, sample(2, 10)];

        let decision = manager.decide(&samples);

        assert_eq!(decision.unchoke, vec![addr(2)]);
    }

    #[test]
    fn test_score_ties_break_by_lower_address() {
        let mut manager = manager_with_base_slots(2);
        let samples = vec![sample(4, 0), sample(2, 0), sample(3, 0), sample(1, 0)];

        let decision = manager.decide(&samples);

        assert_eq!(decision.unchoke, vec![addr(1), addr(2)]);
    }

    /// Every third round one extra peer outside the top tier is unchoked,
    /// and the pick persists through the two rounds in between.
    #[test]
    fn test_optimistic_unchoke_cadence() {
        let mut manager = manager_with_base_slots(2);
        let samples: Vec<RoundSample> = (1..=5).map(|port| sample(port, 0)).collect();
        let top_tier: HashSet<SocketAddr> = [addr(1), addr(2)].into_iter().collect();

        let first = manager.decide(&samples);
        let second = manager.decide(&samples);
        assert_eq!(first.unchoke.len(), 2);
        assert_eq!(second.unchoke.len(), 2);

        let third = manager.decide(&samples);
        assert_eq!(third.unchoke.len(), 3);
        let optimistic = third.unchoke[2];
        assert!(!top_tier.contains(&optimistic));

        // The same optimistic peer stays unchoked until the next pick.
        let fourth = manager.decide(&samples);
        assert_eq!(fourth.unchoke.len(), 3);
        assert_eq!(fourth.unchoke[2], optimistic);
    }

    /// Over many rounds with more interested peers than slots, the set of
    /// distinct peers ever unchoked keeps growing until all were sampled.
    #[test]
    fn test_optimistic_unchoke_eventually_samples_everyone() {
        let mut manager = manager();
        let samples: Vec<RoundSample> = (1..=6).map(|port| sample(port, 0)).collect();

        let mut seen: HashSet<SocketAddr> = HashSet::new();
        for _ in 0..200 {
            seen.extend(manager.decide(&samples).unchoke);
            if seen.len() == 6 {
                break;
            }
        }

        assert_eq!(seen.len(), 6);
    }

    /// A full round against live connections: with idle meters the
    /// configured base of two slots applies, so exactly two of the three
    /// interested peers end up unchoked and the wire carries exactly those
    /// two UNCHOKE messages.
    #[tokio::test]
    async fn test_run_round_unchokes_exactly_slot_count_peers() {
        let mut manager = manager_with_base_slots(2);
        let mut peers = Vec::new();
        let mut remotes = Vec::new();
        for suffix in 0..3 {
            let (peer, remote) = interested_peer(suffix).await;
            peers.push(peer);
            remotes.push(remote);
        }

        manager.run_round(&peers).await;

        let unchoked: Vec<_> = peers.iter().filter(|peer| !peer.we_choking()).collect();
        assert_eq!(unchoked.len(), 2);

        // A second idle round keeps the same set and resends nothing.
        manager.run_round(&peers).await;
        for peer in &peers {
            peer.close().await;
        }
        let mut unchoke_frames = 0;
        for remote in remotes {
            let frames = remote.await.unwrap();
            assert!(frames.len() <= 1);
            unchoke_frames += frames.iter().filter(|id| **id == 1).count();
        }
        assert_eq!(unchoke_frames, 2);
    }

    #[test]
    fn test_consistent_winner_gains_trust() {
        let mut manager = manager();

        for _ in 0..50 {
            manager.decide(&[sample(1, 1000), sample(2, 10)]);
        }
        // Peer 1 has won 50 rounds; its trust bonus now beats a slightly
        // faster newcomer.
        let decision = manager.decide(&[sample(1, 1000), sample(2, 10), sample(3, 1100)]);

        assert_eq!(decision.unchoke[0], addr(1));
    }
}
