//! The Stick: the USB radio gateway every request passes through

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{PlugwiseError, PlugwiseResult};
use crate::protocol::{AckStatus, Mac, Request, ResponseBody, ResponseKind};
use crate::transaction::Channel;

/// Network details reported by the Stick on initialisation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StickStatus {
    pub mac: Option<Mac>,
    pub network_online: bool,
    pub network_id: Option<u64>,
    pub short_id: Option<u16>,
    /// Coordinator address derived from the network id
    pub circle_plus: Option<Mac>,
}

/// Gateway operations on the shared channel
pub struct Stick {
    channel: Arc<Channel>,
    reconnect_backoff: Duration,
    status: StickStatus,
    joining: bool,
}

impl Stick {
    pub fn new(channel: Arc<Channel>, reconnect_backoff: Duration) -> Self {
        Self {
            channel,
            reconnect_backoff,
            status: StickStatus::default(),
            joining: false,
        }
    }

    /// The channel shared with every Circle
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn status(&self) -> &StickStatus {
        &self.status
    }

    pub fn mac(&self) -> Option<&Mac> {
        self.status.mac.as_ref()
    }

    pub fn circle_plus(&self) -> Option<&Mac> {
        self.status.circle_plus.as_ref()
    }

    pub fn joining_enabled(&self) -> bool {
        self.joining
    }

    /// Query the Stick and record its network
    pub async fn init(&mut self) -> PlugwiseResult<&StickStatus> {
        let response = self
            .channel
            .transact(&Request::StickInit, ResponseKind::StickStatus)
            .await?;
        let ResponseBody::StickStatus { network_online, network_id, short_id } = response.body else {
            return Err(PlugwiseError::protocol(format!(
                "Stick init answered with {:?}",
                response.kind()
            )));
        };

        let circle_plus = match network_id {
            Some(id) => Some(circle_plus_address(id)?),
            None => None,
        };
        self.status = StickStatus {
            mac: response.mac,
            network_online,
            network_id,
            short_id,
            circle_plus,
        };
        match (&self.status.mac, &self.status.circle_plus) {
            (Some(mac), Some(plus)) => {
                info!("🔌 Stick {} online, Circle+ {} (network {})", mac, plus, network_online)
            }
            (mac, _) => warn!("Stick {:?} reports no Circle+ network", mac),
        }
        Ok(&self.status)
    }

    /// Open or close the network for new nodes
    pub async fn enable_joining(&mut self, enabled: bool) -> PlugwiseResult<()> {
        let response = self
            .channel
            .transact(&Request::EnableJoining { enabled }, ResponseKind::AckMac)
            .await?;
        match response.ack_status() {
            Some(AckStatus::Success) => {
                debug!("joining {}", if enabled { "enabled" } else { "disabled" });
                self.joining = enabled;
                Ok(())
            }
            Some(status) => Err(PlugwiseError::unexpected_status(
                status.to_u16(),
                "enable joining",
            )),
            None => Err(PlugwiseError::protocol("enable joining answered without status")),
        }
    }

    /// Accept or reject a node that asked to join; only the Stick answers
    pub async fn join_node(&mut self, node: &Mac, accept: bool) -> PlugwiseResult<()> {
        let request = Request::JoinNode { node: node.clone(), accept };
        self.channel.send(&request).await?;
        info!("{} join request of {}", if accept { "accepted" } else { "rejected" }, node);
        Ok(())
    }

    /// Nodes that advertised themselves since the last call
    pub fn take_unjoined(&self) -> Vec<Mac> {
        self.channel.take_unjoined()
    }

    /// Close the port, wait the backoff, reopen and initialise again
    pub async fn reconnect(&mut self) -> PlugwiseResult<()> {
        warn!("reconnecting to the Stick");
        if let Err(e) = self.channel.close().await {
            debug!("close before reconnect failed: {}", e);
        }
        tokio::time::sleep(self.reconnect_backoff).await;
        self.channel.reopen().await?;
        self.init().await?;
        Ok(())
    }
}

/// Circle+ address for a network id: `00` followed by the id's last 14 digits
pub fn circle_plus_address(network_id: u64) -> PlugwiseResult<Mac> {
    let hex = format!("{:016X}", network_id);
    format!("00{}", &hex[2..]).parse()
}
