//! Link enumeration and the policy deciding which links get the classifier.

use std::collections::HashSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use netlink_packet_core::{
    NLM_F_DUMP, NLM_F_REQUEST, NetlinkBuffer, NetlinkHeader, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo as IflaInfo, LinkMessage},
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use pnet::datalink;
use tracing::{debug, trace, warn};

use crate::{
    iface::IfaceError,
    runtime::conf::{AttachConf, AttachMode},
};

const RECV_BUFFER_LEN: usize = 16 * 1024;

/// One network link as seen by netlink or pnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    /// `IFLA_INFO_KIND`, e.g. `veth`. Physical devices have none.
    pub kind: Option<String>,
    pub up: bool,
}

impl LinkInfo {
    /// Extracts the fields we care about from an `RTM_NEWLINK` payload.
    /// `None` when the message carries no interface name.
    pub fn from_message(msg: &LinkMessage) -> Option<Self> {
        let mut name = None;
        let mut kind = None;

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = Some(n.clone()),
                LinkAttribute::LinkInfo(infos) => {
                    kind = infos.iter().find_map(|info| match info {
                        IflaInfo::Kind(k) => Some(kind_name(k)),
                        _ => None,
                    });
                }
                _ => {}
            }
        }

        Some(Self {
            index: msg.header.index,
            name: name?,
            kind,
            up: msg.header.flags.contains(LinkFlags::Up),
        })
    }
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(other) => other.clone(),
        known => format!("{known:?}").to_lowercase(),
    }
}

/// Which links the agent attaches to.
#[derive(Debug, Clone)]
pub enum AttachPolicy {
    /// Exactly one named interface.
    Fixed { interface: String },
    /// Every up link whose name matches a pattern or whose kind is listed.
    Discover {
        patterns: GlobSet,
        kinds: HashSet<String>,
    },
}

impl AttachPolicy {
    pub fn from_conf(conf: &AttachConf) -> Result<Self, IfaceError> {
        match conf.mode {
            AttachMode::Fixed => Ok(Self::Fixed {
                interface: conf.interface.clone(),
            }),
            AttachMode::Discover => {
                let mut builder = GlobSetBuilder::new();
                for pattern in &conf.patterns {
                    let glob = Glob::new(pattern).map_err(|source| IfaceError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })?;
                    builder.add(glob);
                }
                let patterns = builder.build().map_err(|source| IfaceError::InvalidPattern {
                    pattern: conf.patterns.join(","),
                    source,
                })?;
                Ok(Self::Discover {
                    patterns,
                    kinds: conf.kinds.iter().cloned().collect(),
                })
            }
        }
    }

    pub fn is_discover(&self) -> bool {
        matches!(self, Self::Discover { .. })
    }

    /// Whether the agent should be attached to `link` right now.
    pub fn matches(&self, link: &LinkInfo) -> bool {
        match self {
            Self::Fixed { interface } => link.name == *interface,
            Self::Discover { patterns, kinds } => {
                link.up
                    && (patterns.is_match(&link.name)
                        || link.kind.as_ref().is_some_and(|k| kinds.contains(k)))
            }
        }
    }
}

/// Links the policy selects on this host at this moment.
pub fn candidate_links(policy: &AttachPolicy) -> Result<Vec<LinkInfo>, IfaceError> {
    let links = match policy {
        AttachPolicy::Fixed { interface } => match find_interface(interface) {
            Some(link) => vec![link],
            None => {
                warn!(
                    event.name = "iface.interface_missing",
                    network.interface.name = %interface,
                    "configured interface does not exist"
                );
                Vec::new()
            }
        },
        AttachPolicy::Discover { .. } => list_links()?,
    };

    let selected: Vec<LinkInfo> = links.into_iter().filter(|l| policy.matches(l)).collect();
    debug!(
        event.name = "iface.candidates_resolved",
        iface_count = selected.len(),
        ifaces = ?selected.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
        "resolved candidate interfaces"
    );
    Ok(selected)
}

/// Looks a single interface up by name.
pub fn find_interface(name: &str) -> Option<LinkInfo> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| LinkInfo {
            index: iface.index,
            up: iface.is_up(),
            name: iface.name,
            kind: None,
        })
}

/// Dumps every link with `RTM_GETLINK`.
pub fn list_links() -> Result<Vec<LinkInfo>, IfaceError> {
    let mut socket = Socket::new(NETLINK_ROUTE).map_err(IfaceError::netlink)?;
    socket.bind_auto().map_err(IfaceError::netlink)?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .map_err(IfaceError::netlink)?;

    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    let mut request = NetlinkMessage::new(
        header,
        NetlinkPayload::from(RouteNetlinkMessage::GetLink(LinkMessage::default())),
    );
    request.finalize();
    let mut send_buf = vec![0u8; request.buffer_len()];
    request.serialize(&mut send_buf);
    socket.send(&send_buf, 0).map_err(IfaceError::netlink)?;

    let mut links = Vec::new();
    let mut recv_buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let n = socket
            .recv(&mut &mut recv_buf[..], 0)
            .map_err(IfaceError::netlink)?;
        for message in parse_messages(&recv_buf[..n]) {
            match message.payload {
                NetlinkPayload::Done(_) => return Ok(links),
                NetlinkPayload::Error(e) => return Err(IfaceError::netlink(e)),
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(msg)) => {
                    if let Some(link) = LinkInfo::from_message(&msg) {
                        trace!(
                            event.name = "iface.link_listed",
                            network.interface.name = %link.name,
                            network.interface.kind = ?link.kind,
                            "link listed"
                        );
                        links.push(link);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Splits a receive buffer into route messages. Stops at the first message
/// that does not parse.
pub fn parse_messages(buf: &[u8]) -> Vec<NetlinkMessage<RouteNetlinkMessage>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let bytes = &buf[offset..];
        let len = match NetlinkBuffer::new_checked(bytes) {
            Ok(nl_buf) => nl_buf.length() as usize,
            Err(_) => break,
        };
        match NetlinkMessage::<RouteNetlinkMessage>::deserialize(bytes) {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!(
                    event.name = "iface.netlink_parse_failed",
                    error.message = %e,
                    "failed to parse netlink message"
                );
                break;
            }
        }
        if len == 0 {
            break;
        }
        offset += (len + 3) & !3;
    }

    messages
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn link(name: &str, kind: Option<&str>, up: bool) -> LinkInfo {
        LinkInfo {
            index: 7,
            name: name.to_string(),
            kind: kind.map(str::to_string),
            up,
        }
    }

    pub fn link_message(name: &str, kind: Option<InfoKind>, up: bool) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = 7;
        if up {
            msg.header.flags = LinkFlags::Up;
        }
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        if let Some(kind) = kind {
            msg.attributes
                .push(LinkAttribute::LinkInfo(vec![IflaInfo::Kind(kind)]));
        }
        msg
    }

    fn discover(patterns: &[&str], kinds: &[&str]) -> AttachPolicy {
        AttachPolicy::from_conf(&AttachConf {
            mode: AttachMode::Discover,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fixed_policy_matches_only_named_interface() {
        let policy = AttachPolicy::from_conf(&AttachConf {
            mode: AttachMode::Fixed,
            interface: "cni0".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert!(!policy.is_discover());
        assert!(policy.matches(&link("cni0", Some("bridge"), true)));
        assert!(policy.matches(&link("cni0", None, false)));
        assert!(!policy.matches(&link("veth1", Some("veth"), true)));
    }

    #[test]
    fn test_discover_policy_matches_pattern_or_kind() {
        let policy = discover(&["cali*", "flannel.*"], &["veth"]);

        assert!(policy.is_discover());
        assert!(policy.matches(&link("cali123abc", None, true)));
        assert!(policy.matches(&link("flannel.1", Some("vxlan"), true)));
        assert!(policy.matches(&link("lxc42", Some("veth"), true)));
        assert!(!policy.matches(&link("eth0", None, true)));
        assert!(!policy.matches(&link("docker0", Some("bridge"), true)));
        assert!(!policy.matches(&link("flannel-1", None, true)));
    }

    #[test]
    fn test_discover_policy_requires_link_up() {
        let policy = discover(&["veth*"], &[]);

        assert!(policy.matches(&link("veth0", None, true)));
        assert!(!policy.matches(&link("veth0", None, false)));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = AttachPolicy::from_conf(&AttachConf {
            mode: AttachMode::Discover,
            patterns: vec!["veth[".to_string()],
            ..Default::default()
        })
        .unwrap_err();

        assert!(matches!(err, IfaceError::InvalidPattern { ref pattern, .. } if pattern == "veth["));
    }

    #[test]
    fn test_link_info_from_message() {
        let info = LinkInfo::from_message(&link_message("veth9", Some(InfoKind::Veth), true)).unwrap();
        assert_eq!(info, link("veth9", Some("veth"), true));

        let info = LinkInfo::from_message(&link_message(
            "wg0",
            Some(InfoKind::Other("wireguard".to_string())),
            false,
        ))
        .unwrap();
        assert_eq!(info.kind.as_deref(), Some("wireguard"));
        assert!(!info.up);

        let mut nameless = LinkMessage::default();
        nameless.header.index = 3;
        assert!(LinkInfo::from_message(&nameless).is_none());
    }

    #[test]
    fn test_parse_messages_splits_buffer() {
        let mut buf = Vec::new();
        for name in ["veth0", "veth1"] {
            let mut message = NetlinkMessage::new(
                NetlinkHeader::default(),
                NetlinkPayload::from(RouteNetlinkMessage::NewLink(link_message(name, None, true))),
            );
            message.finalize();
            let mut bytes = vec![0u8; message.buffer_len()];
            message.serialize(&mut bytes);
            buf.extend_from_slice(&bytes);
        }

        let names: Vec<String> = parse_messages(&buf)
            .into_iter()
            .filter_map(|m| match m.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(msg)) => {
                    LinkInfo::from_message(&msg).map(|l| l.name)
                }
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["veth0", "veth1"]);
    }

    #[test]
    fn test_parse_messages_stops_on_garbage() {
        assert!(parse_messages(&[0xff; 3]).is_empty());
        assert!(parse_messages(&[]).is_empty());
    }
}
