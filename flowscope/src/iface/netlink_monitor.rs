//! Link event subscription.
//!
//! A dedicated OS thread blocks on a netlink socket bound to the `RTMGRP_LINK`
//! multicast group and forwards parsed changes over a tokio channel to the
//! reconciliation task.

use std::thread::JoinHandle;

use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::iface::{
    IfaceError,
    discovery::{LinkInfo, parse_messages},
};

/// Bitmask for the link multicast group, set in the socket address rather
/// than through `NETLINK_ADD_MEMBERSHIP`.
const RTMGRP_LINK: u32 = 0x0000_0001;

const RECV_BUFFER_LEN: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    /// New or modified link that is administratively up.
    Up(LinkInfo),
    /// Link deleted or brought down.
    Down(String),
}

impl LinkChange {
    pub fn from_message(msg: &RouteNetlinkMessage) -> Option<Self> {
        match msg {
            RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::SetLink(link) => {
                let info = LinkInfo::from_message(link)?;
                Some(if info.up {
                    LinkChange::Up(info)
                } else {
                    LinkChange::Down(info.name)
                })
            }
            RouteNetlinkMessage::DelLink(link) => {
                LinkInfo::from_message(link).map(|info| LinkChange::Down(info.name))
            }
            _ => None,
        }
    }

    pub fn iface(&self) -> &str {
        match self {
            LinkChange::Up(info) => &info.name,
            LinkChange::Down(name) => name,
        }
    }
}

/// Subscribes to link events and starts the receive thread. The socket is
/// bound before returning so subscription failures surface to the caller.
/// The thread exits once `tx` has no receiver and the next event arrives.
pub fn spawn_link_monitor(
    tx: mpsc::UnboundedSender<LinkChange>,
) -> Result<JoinHandle<()>, IfaceError> {
    let mut socket = Socket::new(NETLINK_ROUTE).map_err(IfaceError::netlink)?;
    socket
        .bind(&SocketAddr::new(0, RTMGRP_LINK))
        .map_err(IfaceError::netlink)?;

    debug!(
        event.name = "iface.link_monitor.subscribed",
        rtmgrp_link_bitmask = format!("0x{RTMGRP_LINK:08x}"),
        "subscribed to link events"
    );

    std::thread::Builder::new()
        .name("flowscope-netlink".to_string())
        .spawn(move || monitor_loop(socket, tx))
        .map_err(IfaceError::netlink)
}

fn monitor_loop(socket: Socket, tx: mpsc::UnboundedSender<LinkChange>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        let n = match socket.recv(&mut &mut buf[..], 0) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    event.name = "iface.link_monitor.recv_failed",
                    error.message = %e,
                    "error receiving from netlink socket"
                );
                break;
            }
        };
        trace!(
            event.name = "iface.link_monitor.received",
            bytes = n,
            "received netlink data"
        );

        for message in parse_messages(&buf[..n]) {
            let NetlinkPayload::InnerMessage(msg) = message.payload else {
                continue;
            };
            if let Some(change) = LinkChange::from_message(&msg)
                && tx.send(change).is_err()
            {
                debug!(
                    event.name = "iface.link_monitor.receiver_dropped",
                    "reconciliation task gone, stopping link monitor"
                );
                return;
            }
        }
    }

    info!(
        event.name = "iface.link_monitor.stopped",
        "link monitor stopped"
    );
}

#[cfg(test)]
mod tests {
    use netlink_packet_route::link::InfoKind;

    use super::*;
    use crate::iface::discovery::tests::{link, link_message};

    #[test]
    fn test_new_link_up_is_up_change() {
        let msg = RouteNetlinkMessage::NewLink(link_message("veth3", Some(InfoKind::Veth), true));

        let change = LinkChange::from_message(&msg).unwrap();
        assert_eq!(change, LinkChange::Up(link("veth3", Some("veth"), true)));
        assert_eq!(change.iface(), "veth3");
    }

    #[test]
    fn test_set_link_down_is_down_change() {
        let msg = RouteNetlinkMessage::SetLink(link_message("veth3", None, false));

        assert_eq!(
            LinkChange::from_message(&msg),
            Some(LinkChange::Down("veth3".to_string()))
        );
    }

    #[test]
    fn test_del_link_is_down_even_when_flagged_up() {
        let msg = RouteNetlinkMessage::DelLink(link_message("veth3", None, true));

        assert_eq!(
            LinkChange::from_message(&msg),
            Some(LinkChange::Down("veth3".to_string()))
        );
    }

    #[test]
    fn test_other_messages_ignored() {
        let msg = RouteNetlinkMessage::GetLink(link_message("veth3", None, true));
        assert!(LinkChange::from_message(&msg).is_none());
    }
}
