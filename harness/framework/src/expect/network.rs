// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use edge_api_types::config::{
    AclAction, AclEntry, AclMatch, Adapter, DhcpMode, IpRange, IpSpec,
    NetworkInstanceConfig, NetworkInstanceKind, PhysicalIo, PhysicalIoKind,
    UuidAndVersion,
};
use edge_api_types::Kind;
use ipnetwork::Ipv4Network;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExpectationError, ExpectationResolver, NetworkRequest, Txn};

/// Port label local and cloud instances share with the management network.
const SHARED_UPLINK: &str = "uplink";

fn kind_name(kind: NetworkInstanceKind) -> &'static str {
    match kind {
        NetworkInstanceKind::Switch => "switch",
        NetworkInstanceKind::Local => "local",
        NetworkInstanceKind::Cloud => "cloud",
    }
}

/// Builds the addressing for a NAT'd instance on `subnet`: the first host
/// address is the gateway and DNS server, the rest of the subnet (less the
/// broadcast address) is handed out over DHCP.
pub(super) fn local_ip_spec(subnet: &str) -> Result<IpSpec, ExpectationError> {
    let bad = || ExpectationError::BadSubnet(subnet.to_owned());

    let net: Ipv4Network = subnet.parse().map_err(|_| bad())?;
    if net.prefix() > 30 {
        return Err(bad());
    }

    let gateway = net.nth(1).ok_or_else(bad)?.to_string();
    let start = net.nth(2).ok_or_else(bad)?;
    let end = Ipv4Addr::from(u32::from(net.broadcast()) - 1);

    Ok(IpSpec {
        dhcp: DhcpMode::Server,
        subnet: format!("{}/{}", net.network(), net.prefix()),
        gateway: gateway.clone(),
        dns: vec![gateway],
        dhcp_range: Some(IpRange { start: start.to_string(), end: end.to_string() }),
    })
}

/// Turns `outer:inner` port mappings into ACL entries, followed by an entry
/// admitting all other traffic.
pub(super) fn acls(
    request: &NetworkRequest,
) -> Result<Vec<AclEntry>, ExpectationError> {
    let mut entries = Vec::with_capacity(request.port_publish.len() + 1);

    for (idx, mapping) in request.port_publish.iter().enumerate() {
        let bad = || ExpectationError::BadPortMapping(mapping.clone());
        let (outer, inner) = mapping.split_once(':').ok_or_else(bad)?;
        let outer_port: u16 = outer.trim().parse().map_err(|_| bad())?;
        let app_port: u16 = inner.trim().parse().map_err(|_| bad())?;

        entries.push(AclEntry {
            id: idx as u32 + 1,
            matches: vec![
                AclMatch { kind: "protocol".into(), value: "tcp".into() },
                AclMatch { kind: "lport".into(), value: outer_port.to_string() },
            ],
            actions: vec![AclAction::PortMap { outer_port, app_port }],
        });
    }

    entries.push(AclEntry {
        id: entries.len() as u32 + 1,
        matches: vec![AclMatch { kind: "ip".into(), value: "0.0.0.0/0".into() }],
        actions: vec![AclAction::Allow],
    });

    Ok(entries)
}

impl ExpectationResolver<'_> {
    /// Returns the network instance on the device that satisfies `request`,
    /// creating it if there is none.
    pub(super) fn network_instance(
        &self,
        txn: &mut Txn,
        request: &NetworkRequest,
    ) -> Result<String, ExpectationError> {
        let (port, ip) = match request.kind {
            NetworkInstanceKind::Switch => {
                let uplink = request
                    .uplink
                    .as_deref()
                    .or_else(|| txn.device.model().first_adapter_for_switch())
                    .unwrap_or_default()
                    .to_owned();
                self.check_switch_adapter(txn, &uplink)?;
                (Adapter { kind: PhysicalIoKind::NetEth, name: uplink }, None)
            }
            NetworkInstanceKind::Local | NetworkInstanceKind::Cloud => {
                let subnet = request
                    .subnet
                    .as_deref()
                    .unwrap_or(&self.config.default_local_subnet);
                (
                    Adapter {
                        kind: PhysicalIoKind::NetEth,
                        name: SHARED_UPLINK.to_owned(),
                    },
                    Some(local_ip_spec(subnet)?),
                )
            }
        };

        for id in txn.device.ids(Kind::NetworkInstanceConfig) {
            let ni = txn.store.get::<NetworkInstanceConfig>(id)?;
            let matched = match &request.name {
                Some(name) => &ni.display_name == name,
                None => {
                    ni.kind == request.kind
                        && ni.port == port
                        && ni.ip.as_ref().map(|ip| &ip.subnet)
                            == ip.as_ref().map(|ip| &ip.subnet)
                }
            };
            if matched {
                debug!(id, name = ni.display_name, "reusing network instance");
                return Ok(id.clone());
            }
        }

        let id = Uuid::new_v4().to_string();
        let display_name = match &request.name {
            Some(name) => name.clone(),
            None => format!("{}-{}", kind_name(request.kind), &id[..8]),
        };
        let ni = NetworkInstanceConfig {
            uuid_and_version: UuidAndVersion::new(id.clone(), "1"),
            display_name,
            kind: request.kind,
            activate: true,
            port,
            ip,
        };
        info!(
            id,
            name = ni.display_name,
            kind = kind_name(ni.kind),
            "created network instance"
        );

        txn.store.add(ni)?;
        txn.device.push(Kind::NetworkInstanceConfig, &id);
        Ok(id)
    }

    fn check_switch_adapter(
        &self,
        txn: &Txn,
        uplink: &str,
    ) -> Result<(), ExpectationError> {
        for id in txn.device.ids(Kind::PhysicalIo) {
            if txn.store.get::<PhysicalIo>(id)?.logical_label == uplink {
                return Ok(());
            }
        }

        Err(ExpectationError::MissingSwitchAdapter { adapter: uplink.to_owned() })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expect::fakes::Fixture;

    #[test]
    fn local_subnets_get_gateway_and_dhcp_range() {
        let ip = local_ip_spec("10.11.12.77/24").unwrap();
        assert_eq!(ip.subnet, "10.11.12.0/24");
        assert_eq!(ip.gateway, "10.11.12.1");
        assert_eq!(ip.dns, ["10.11.12.1"]);
        let range = ip.dhcp_range.unwrap();
        assert_eq!(range.start, "10.11.12.2");
        assert_eq!(range.end, "10.11.12.254");

        let wide = local_ip_spec("172.16.0.0/12").unwrap();
        assert_eq!(wide.gateway, "172.16.0.1");
        assert_eq!(wide.dhcp_range.unwrap().end, "172.31.255.254");

        for bad in ["10.0.0.0", "10.0.0.0/31", "10.0.0.0/x", "fd00::/64"] {
            assert!(local_ip_spec(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn port_publishing_becomes_acls() {
        let mut req = NetworkRequest::new(NetworkInstanceKind::Local);
        req.port_publish = vec!["8028:80".into(), "2222:22".into()];

        let acls = acls(&req).unwrap();
        assert_eq!(acls.len(), 3);
        assert_eq!(
            acls[0].actions,
            [AclAction::PortMap { outer_port: 8028, app_port: 80 }]
        );
        assert_eq!(acls[1].id, 2);
        assert_eq!(acls[2].actions, [AclAction::Allow]);

        req.port_publish = vec!["80".into()];
        assert!(matches!(
            super::acls(&req),
            Err(ExpectationError::BadPortMapping(_))
        ));
    }

    #[test]
    fn instances_are_matched_by_kind_and_subnet() {
        let mut fx = Fixture::new();
        let resolver = fx.resolver();
        let mut txn = Txn::begin(&fx.store, &fx.device);

        let local = NetworkRequest::new(NetworkInstanceKind::Local);
        let a = resolver.network_instance(&mut txn, &local).unwrap();
        let b = resolver.network_instance(&mut txn, &local).unwrap();
        assert_eq!(a, b);

        let mut other = NetworkRequest::new(NetworkInstanceKind::Local);
        other.subnet = Some("10.20.0.0/16".into());
        let c = resolver.network_instance(&mut txn, &other).unwrap();
        assert_ne!(a, c);

        let mut named = NetworkRequest::new(NetworkInstanceKind::Local);
        named.name = Some("backend".into());
        let d = resolver.network_instance(&mut txn, &named).unwrap();
        assert_ne!(d, a);
        assert_eq!(resolver.network_instance(&mut txn, &named).unwrap(), d);

        assert_eq!(txn.device.ids(Kind::NetworkInstanceConfig).len(), 3);
        txn.commit(&mut fx.store, &mut fx.device);
        assert_eq!(fx.store.len::<NetworkInstanceConfig>(), 3);
    }

    #[test]
    fn switches_bridge_onto_device_adapters() {
        let fx = Fixture::new();
        let resolver = fx.resolver();
        let mut txn = Txn::begin(&fx.store, &fx.device);

        let switch = NetworkRequest::new(NetworkInstanceKind::Switch);
        let id = resolver.network_instance(&mut txn, &switch).unwrap();
        let ni = txn.store.get::<NetworkInstanceConfig>(&id).unwrap();
        assert_eq!(ni.port.name, "eth1");
        assert!(ni.ip.is_none());

        let mut missing = NetworkRequest::new(NetworkInstanceKind::Switch);
        missing.uplink = Some("eth7".into());
        assert!(matches!(
            resolver.network_instance(&mut txn, &missing),
            Err(ExpectationError::MissingSwitchAdapter { adapter }) if adapter == "eth7"
        ));
    }
}
