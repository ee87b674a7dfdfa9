use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::packet::{
    CapturedPacket, Direction, PacketFunction, Payload, Protocol, TcpFields, TransportMeta,
    UdpFields,
};
use crate::utils::error::{AppError, AppResult};

/// A collaborator that delivers captured packets to the engine.
///
/// `spawn` starts delivery on `tx` and must return once `stop` flips to true.
pub trait CaptureSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn spawn(
        &self,
        tx: mpsc::Sender<CapturedPacket>,
        stop: watch::Receiver<bool>,
    ) -> AppResult<JoinHandle<()>>;
}

/// Generates demo traffic at a random pace
pub struct SimulatedSource {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(500))
    }
}

impl SimulatedSource {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    fn generate(rng: &mut StdRng, counter: u64) -> CapturedPacket {
        let function = PacketFunction::ALL[rng.gen_range(0..PacketFunction::ALL.len())];
        let direction = function.direction();
        let local = format!("192.168.1.{}:{}", 100 + counter % 155, 50_000 + counter % 10_000);
        let remote_host = format!("203.0.113.{}", counter % 255);

        let (protocol, data, transport) = match rng.gen_range(0..10) {
            0..=2 => {
                let data = match direction {
                    Direction::Send => format!(
                        "GET /api/items/{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: hookshark-sim\r\n\r\n",
                        counter, remote_host
                    )
                    .into_bytes(),
                    Direction::Receive => {
                        let body = format!("{{\"id\":{}}}", counter);
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        )
                        .into_bytes()
                    }
                };
                (Protocol::Http, data, Some(Self::tcp(rng)))
            }
            3..=6 => {
                let len = rng.gen_range(16..900);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                (Protocol::Tcp, data, Some(Self::tcp(rng)))
            }
            _ => {
                let len: u16 = rng.gen_range(8..512);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let transport = TransportMeta::Udp(UdpFields {
                    length: len + 8,
                    checksum: rng.gen(),
                });
                (Protocol::Udp, data, Some(transport))
            }
        };

        let (src_addr, dst_addr) = match direction {
            Direction::Send => (local, format!("{}:8080", remote_host)),
            Direction::Receive => (format!("{}:8080", remote_host), local),
        };

        CapturedPacket {
            timestamp: chrono::Utc::now().timestamp_millis(),
            process_id: 1234 + (counter % 10) as u32,
            process_name: format!("process_{}", counter % 5),
            protocol,
            direction,
            src_addr,
            dst_addr,
            size: data.len(),
            socket: Some(counter % 1000),
            packet_function: Some(function),
            packet_data: None,
            raw_data: Some(Payload::from(data)),
            duration: None,
            http: None,
            transport,
        }
    }

    fn tcp(rng: &mut StdRng) -> TransportMeta {
        TransportMeta::Tcp(TcpFields {
            seq: rng.gen(),
            ack: rng.gen(),
            flags: 0x18,
        })
    }
}

impl CaptureSource for SimulatedSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn spawn(
        &self,
        tx: mpsc::Sender<CapturedPacket>,
        mut stop: watch::Receiver<bool>,
    ) -> AppResult<JoinHandle<()>> {
        let (min, max) = (self.min_delay, self.max_delay);

        Ok(tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut counter: u64 = 0;
            info!("Simulated capture started");

            loop {
                let packet = Self::generate(&mut rng, counter);
                counter += 1;
                if tx.send(packet).await.is_err() {
                    debug!("Packet receiver closed, ending simulated capture");
                    break;
                }

                let delay = if max > min {
                    rng.gen_range(min..=max)
                } else {
                    min
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Simulated capture stopped after {} packets", counter);
        }))
    }
}

/// Packets pushed over HTTP by an external hook
#[derive(Default)]
pub struct RemoteFeed {
    sender: Arc<Mutex<Option<mpsc::Sender<CapturedPacket>>>>,
}

impl RemoteFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Forward pushed packets to the running capture
    pub async fn push(&self, packets: Vec<CapturedPacket>) -> AppResult<usize> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| AppError::CaptureError("capture is not running".to_string()))?;

        let mut accepted = 0;
        for packet in packets {
            if sender.send(packet).await.is_err() {
                warn!("Remote feed closed while pushing packets");
                break;
            }
            accepted += 1;
        }
        Ok(accepted)
    }
}

impl CaptureSource for RemoteFeed {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn spawn(
        &self,
        tx: mpsc::Sender<CapturedPacket>,
        mut stop: watch::Receiver<bool>,
    ) -> AppResult<JoinHandle<()>> {
        *self.sender.lock() = Some(tx);
        let sender = self.sender.clone();

        Ok(tokio::spawn(async move {
            info!("Remote feed accepting packets");
            loop {
                if *stop.borrow() {
                    break;
                }
                if stop.changed().await.is_err() {
                    break;
                }
            }
            sender.lock().take();
            info!("Remote feed closed");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_packets_are_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        for counter in 0..200 {
            let p = SimulatedSource::generate(&mut rng, counter);
            let function = p.packet_function.unwrap();
            assert_eq!(p.direction, function.direction());
            assert_eq!(p.size, p.raw_data.as_ref().unwrap().len());
            match p.protocol {
                Protocol::Udp => assert!(matches!(p.transport, Some(TransportMeta::Udp(_)))),
                _ => assert!(matches!(p.transport, Some(TransportMeta::Tcp(_)))),
            }
        }
    }

    #[actix_rt::test]
    async fn test_simulated_source_stops_on_signal() {
        let source = SimulatedSource::new(Duration::from_millis(1), Duration::from_millis(2));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = source.spawn(tx, stop_rx).unwrap();
        assert!(rx.recv().await.is_some());
        stop_tx.send(true).unwrap();
        while rx.recv().await.is_some() {}
        handle.await.unwrap();
    }

    #[actix_rt::test]
    async fn test_remote_feed_lifecycle() {
        let feed = Arc::new(RemoteFeed::new());
        let packet = SimulatedSource::generate(&mut StdRng::seed_from_u64(1), 0);
        assert!(feed.push(vec![packet.clone()]).await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = feed.spawn(tx, stop_rx).unwrap();

        assert_eq!(feed.push(vec![packet.clone(), packet]).await.unwrap(), 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!feed.is_open());
    }
}
