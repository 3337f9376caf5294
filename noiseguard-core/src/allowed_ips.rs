//! Longest-prefix-match routing of inner addresses to peers (spec §4.3).
//!
//! `ip_network_table::IpNetworkTable` already gives us one radix tree per
//! family internally; the rehome/count bookkeeping on top of it is the part
//! the spec actually cares about, so that's what this module owns.

use std::collections::HashSet;
use std::net::IpAddr;

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;

use crate::peer::PeerId;

#[derive(Default)]
pub struct AllowedIps {
    table: IpNetworkTable<PeerId>,
    /// Mirrors the "owning peer's aip-count equals the number of entries on
    /// its list" invariant from the data model without needing a back-link
    /// from every tree node.
    owned: ahash::AHashMap<PeerId, HashSet<IpNetwork>>,
}

impl AllowedIps {
    pub fn new() -> Self {
        Self {
            table: IpNetworkTable::new(),
            owned: ahash::AHashMap::new(),
        }
    }

    /// Insert `net` owned by `peer`. Re-homes an existing identical
    /// `(address, mask, family)` entry rather than duplicating it.
    pub fn insert(&mut self, peer: PeerId, net: IpNetwork) {
        if let Some(prev_owner) = self.table.insert(net, peer) {
            if prev_owner != peer {
                if let Some(set) = self.owned.get_mut(&prev_owner) {
                    set.remove(&net);
                }
            }
        }
        self.owned.entry(peer).or_default().insert(net);
    }

    pub fn longest_match(&self, addr: IpAddr) -> Option<PeerId> {
        self.table.longest_match(addr).map(|(_, id)| *id)
    }

    pub fn exact_match(&self, net: IpNetwork) -> Option<PeerId> {
        self.table.exact_match(net).copied()
    }

    /// Remove every entry owned by `peer`. Leaves `peer`'s list empty and
    /// its count at zero, as required by §8's allowed-ips invariant.
    pub fn remove_all(&mut self, peer: PeerId) {
        let Some(nets) = self.owned.remove(&peer) else {
            return;
        };
        for net in nets {
            self.table.remove(net);
        }
    }

    pub fn count(&self, peer: PeerId) -> usize {
        self.owned.get(&peer).map_or(0, |s| s.len())
    }

    pub fn iter_owned(&self, peer: PeerId) -> impl Iterator<Item = IpNetwork> + '_ {
        self.owned.get(&peer).into_iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn insert_lookup_v4_scenario() {
        let (peer_a, peer_b, peer_c) = (PeerId(1), PeerId(2), PeerId(3));
        let mut aips = AllowedIps::new();
        aips.insert(peer_a, net("192.168.4.0/24"));
        aips.insert(peer_b, net("192.168.4.4/32"));
        aips.insert(peer_c, net("192.168.0.0/16"));

        assert_eq!(
            aips.longest_match("192.168.4.20".parse().unwrap()),
            Some(peer_a)
        );
        assert_eq!(
            aips.longest_match("192.168.4.4".parse().unwrap()),
            Some(peer_b)
        );
        assert_eq!(
            aips.longest_match("192.168.200.182".parse().unwrap()),
            Some(peer_c)
        );
    }

    #[test]
    fn insert_lookup_v6_scenario() {
        let (peer_c, peer_d) = (PeerId(3), PeerId(4));
        let mut aips = AllowedIps::new();
        aips.insert(peer_c, net("2607:5300:60:6b00::/64"));
        aips.insert(peer_d, net("2607:5300:60:6b00::c05f:543/128"));

        assert_eq!(
            aips.longest_match("2607:5300:60:6b00::c05f:543".parse().unwrap()),
            Some(peer_d)
        );
        assert_eq!(
            aips.longest_match("2607:5300:60:6b00::c02e:1ee".parse().unwrap()),
            Some(peer_c)
        );
    }

    #[test]
    fn rehome_decrements_old_owner_and_increments_new() {
        let (peer_a, peer_b) = (PeerId(1), PeerId(2));
        let mut aips = AllowedIps::new();
        let n = net("10.0.0.0/24");
        aips.insert(peer_a, n);
        assert_eq!(aips.count(peer_a), 1);

        aips.insert(peer_b, n);
        assert_eq!(aips.count(peer_a), 0);
        assert_eq!(aips.count(peer_b), 1);
        assert_eq!(aips.longest_match("10.0.0.5".parse().unwrap()), Some(peer_b));
    }

    #[test]
    fn idempotent_insert_of_same_tuple() {
        let peer_a = PeerId(1);
        let mut aips = AllowedIps::new();
        let n = net("10.0.0.0/24");
        aips.insert(peer_a, n);
        aips.insert(peer_a, n);
        assert_eq!(aips.count(peer_a), 1);
    }

    #[test]
    fn remove_all_clears_owner_and_count() {
        let peer_a = PeerId(1);
        let mut aips = AllowedIps::new();
        aips.insert(peer_a, net("10.0.0.0/24"));
        aips.insert(peer_a, net("10.0.1.0/24"));
        aips.remove_all(peer_a);

        assert_eq!(aips.count(peer_a), 0);
        assert_eq!(aips.longest_match("10.0.0.5".parse().unwrap()), None);
    }
}
