//! Request/response correlation on the shared Stick channel
//!
//! The Stick multiplexes every Circle over one serial line. A request is
//! first acknowledged by the Stick itself with a sequence number; the
//! device reply later carries the same number. Everything else on the line
//! (replies to earlier requests that arrived late, pongs, join
//! announcements, firmware trace output) has to be skipped or recorded
//! without losing the reply being waited for.
//!
//! An [`Exchange`] holds the channel lock from the moment the request is
//! written until the caller has its reply, so exchanges never interleave.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard};

use crate::codec::{HEADER, HEADER_PREFIX, MIN_FRAME_LEN};
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::logging::{CommLogger, CommRecord};
use crate::protocol::{AckStatus, Mac, Request, Response, ResponseKind};
use crate::transport::{StickTransport, TransportStats};

/// Read timeout per attempt
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra read attempts per frame
pub const DEFAULT_RETRIES: u32 = 5;

/// Timing and logging for a [`Channel`]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub read_timeout: Duration,
    pub retries: u32,
    pub logger: CommLogger,
}

impl ChannelConfig {
    /// Longest a single frame is waited for
    pub fn frame_budget(&self) -> Duration {
        self.read_timeout * (self.retries + 1)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            retries: DEFAULT_RETRIES,
            logger: CommLogger::disabled(),
        }
    }
}

/// Unsolicited traffic seen while waiting for other replies
#[derive(Debug, Default)]
struct Unsolicited {
    pongs: HashSet<Mac>,
    unjoined: BTreeSet<Mac>,
}

/// The shared Stick connection
pub struct Channel {
    transport: Mutex<Box<dyn StickTransport>>,
    config: ChannelConfig,
    unsolicited: StdMutex<Unsolicited>,
}

impl Channel {
    pub fn new(transport: Box<dyn StickTransport>, config: ChannelConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            config,
            unsolicited: StdMutex::new(Unsolicited::default()),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn logger(&self) -> &CommLogger {
        &self.config.logger
    }

    /// Write a request and wait for the Stick to accept it
    ///
    /// The returned exchange keeps the channel locked; drop it to release.
    pub async fn begin(&self, request: &Request) -> PlugwiseResult<Exchange<'_>> {
        let frame = request.encode();
        let mut exchange = Exchange {
            channel: self,
            transport: self.transport.lock().await,
            seq: 0,
            pending: Vec::new(),
            operation: request.function_code().to_string(),
        };

        self.config.logger.record(CommRecord::Send, &frame);
        exchange.transport.write_frame(&frame).await?;

        loop {
            let response = exchange.next_response().await?;
            if response.kind() != ResponseKind::Ack {
                self.note_unsolicited(&response);
                continue;
            }
            match response.ack_status() {
                Some(AckStatus::Success) => {
                    exchange.seq = response.seq;
                    debug!("{} accepted with seq {:04X}", exchange.operation, response.seq);
                    return Ok(exchange);
                }
                Some(AckStatus::Error) => {
                    return Err(PlugwiseError::unexpected_status(
                        AckStatus::Error.to_u16(),
                        format!("Stick rejected {}", exchange.operation),
                    ));
                }
                Some(AckStatus::Unreachable) => {
                    debug!("skipping late acknowledgement for seq {:04X}", response.seq);
                }
                other => {
                    debug!(
                        "ignoring acknowledgement {:?} seq {:04X} while waiting for the Stick",
                        other, response.seq
                    );
                }
            }
        }
    }

    /// Send a request and wait for one reply of `kind` from its target
    pub async fn transact(&self, request: &Request, kind: ResponseKind) -> PlugwiseResult<Response> {
        let mut exchange = self.begin(request).await?;
        exchange.expect(kind, request.target()).await
    }

    /// Send a request whose reply is not waited for; returns the sequence
    pub async fn send(&self, request: &Request) -> PlugwiseResult<u16> {
        Ok(self.begin(request).await?.seq())
    }

    /// Remove and return whether a pong from `mac` arrived since the last call
    pub fn take_pong(&self, mac: &Mac) -> bool {
        self.registry().pongs.remove(mac)
    }

    /// Drain the addresses of nodes that asked to join
    pub fn take_unjoined(&self) -> Vec<Mac> {
        std::mem::take(&mut self.registry().unjoined).into_iter().collect()
    }

    /// Record an unjoined node, e.g. from a node table scan
    pub fn note_unjoined(&self, mac: Mac) {
        self.registry().unjoined.insert(mac);
    }

    /// Read frames nobody asked for until the line stays quiet
    ///
    /// Pongs and join announcements found this way are recorded as if they
    /// had arrived during an exchange. Returns the number of frames seen.
    pub async fn drain_unsolicited(&self) -> PlugwiseResult<usize> {
        let mut transport = self.transport.lock().await;
        let mut pending = Vec::new();
        let mut seen = 0;
        loop {
            let chunk = transport.read_line(self.config.read_timeout).await?;
            if chunk.is_empty() {
                break;
            }
            pending.extend_from_slice(&chunk);
            if !pending.ends_with(b"\n") {
                continue;
            }
            let line = std::mem::take(&mut pending);
            if let Some(response) = classify_line(&line, &self.config.logger) {
                seen += 1;
                self.note_unsolicited(&response);
            }
        }
        if !pending.is_empty() {
            debug!("dropping {} bytes of an incomplete line", pending.len());
        }
        Ok(seen)
    }

    /// Reopen the underlying transport
    pub async fn reopen(&self) -> PlugwiseResult<()> {
        self.transport.lock().await.reopen().await
    }

    pub async fn close(&self) -> PlugwiseResult<()> {
        self.transport.lock().await.close().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    pub async fn stats(&self) -> TransportStats {
        self.transport.lock().await.get_stats()
    }

    fn registry(&self) -> StdMutexGuard<'_, Unsolicited> {
        self.unsolicited.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// File away a frame that belongs to nobody currently waiting
    fn note_unsolicited(&self, response: &Response) {
        match (response.kind(), &response.mac) {
            (ResponseKind::PingReply, Some(mac)) => {
                debug!("pong from {}", mac);
                self.registry().pongs.insert(mac.clone());
            }
            (ResponseKind::NodeAdvertise, Some(mac)) => {
                info!("node {} is advertising and not joined", mac);
                self.registry().unjoined.insert(mac.clone());
            }
            (ResponseKind::NodeAssociate, Some(mac)) => {
                info!("node {} is associating", mac);
            }
            (kind, mac) => {
                debug!(
                    "unhandled {:?} seq {:04X} from {}",
                    kind,
                    response.seq,
                    mac.as_ref().map(Mac::as_str).unwrap_or("stick")
                );
            }
        }
    }
}

/// One request in flight, holding the channel until dropped
pub struct Exchange<'a> {
    channel: &'a Channel,
    transport: MutexGuard<'a, Box<dyn StickTransport>>,
    seq: u16,
    pending: Vec<u8>,
    operation: String,
}

impl<'a> Exchange<'a> {
    /// Sequence number the Stick assigned to this request
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Wait for the reply of `kind` carrying this exchange's sequence
    ///
    /// An acknowledgement frame with the right sequence is returned even
    /// when another kind was asked for; the caller decides what its status
    /// means. With `mac` set, frames from other devices are skipped.
    pub async fn expect(&mut self, kind: ResponseKind, mac: Option<&Mac>) -> PlugwiseResult<Response> {
        loop {
            let response = self.next_response().await?;
            let from_target = match (mac, &response.mac) {
                (None, _) => true,
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
            };
            let is_ack = matches!(response.kind(), ResponseKind::Ack | ResponseKind::AckMac);

            if response.seq == self.seq {
                if response.kind() == kind && from_target {
                    return Ok(response);
                }
                if is_ack && (from_target || response.mac.is_none()) {
                    return Ok(response);
                }
                if !from_target {
                    warn!(
                        "{}: seq {:04X} answered by {:?} instead of {:?}",
                        self.operation,
                        self.seq,
                        response.mac,
                        mac
                    );
                } else {
                    warn!(
                        "{}: seq {:04X} answered with {:?}, expected {:?}",
                        self.operation,
                        self.seq,
                        response.kind(),
                        kind
                    );
                }
            } else {
                debug!(
                    "{}: sequence mismatch, waiting for {:04X} got {:04X}",
                    self.operation, self.seq, response.seq
                );
            }
            self.channel.note_unsolicited(&response);
        }
    }

    /// Next frame on the line that decodes, skipping noise
    async fn next_response(&mut self) -> PlugwiseResult<Response> {
        let channel = self.channel;
        loop {
            let line = self.read_frame().await?;
            if let Some(response) = classify_line(&line, &channel.config.logger) {
                return Ok(response);
            }
        }
    }

    /// Read one complete line within the per-frame budget
    async fn read_frame(&mut self) -> PlugwiseResult<Vec<u8>> {
        let channel = self.channel;
        let config = &channel.config;
        for _ in 0..=config.retries {
            let chunk = self.transport.read_line(config.read_timeout).await?;
            self.pending.extend_from_slice(&chunk);
            if self.pending.ends_with(b"\n") {
                return Ok(std::mem::take(&mut self.pending));
            }
        }
        config.logger.timeout(&self.operation);
        Err(PlugwiseError::timeout(
            self.operation.clone(),
            config.frame_budget().as_millis() as u64,
        ))
    }
}

/// Decode one received line, logging whatever is not a usable frame
fn classify_line(line: &[u8], logger: &CommLogger) -> Option<Response> {
    let frame = strip_noise(line, logger);
    if frame.contains(&b'#') {
        logger.record(CommRecord::Dtrc, frame);
        return None;
    }
    if frame.len() < MIN_FRAME_LEN {
        logger.record(CommRecord::Dshr, frame);
        return None;
    }
    logger.record(CommRecord::Recv, frame);
    match Response::decode(frame) {
        Ok(response) => Some(response),
        Err(e) => {
            logger.record(CommRecord::Rerr, frame);
            debug!("dropping undecodable frame: {}", e);
            None
        }
    }
}

/// Cut everything before the frame header, logging it as stray data
fn strip_noise<'f>(line: &'f [u8], logger: &CommLogger) -> &'f [u8] {
    let Some(pos) = line.windows(HEADER.len()).position(|w| w == HEADER) else {
        return line;
    };
    let start = if pos > 0 && line[pos - 1] == HEADER_PREFIX { pos - 1 } else { pos };
    if start > 0 {
        logger.record(CommRecord::Dstr, &line[..start]);
    }
    &line[start..]
}
