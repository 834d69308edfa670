//! Zone store.
//!
//! Holds the ordered list of locally-owned zones behind a single
//! reader/writer lock.  Query handling only ever takes the read side; the
//! management endpoint takes the write side to merge new definitions.

use std::net::Ipv4Addr;

use hickory_server::proto::rr::RecordType;
use tokio::sync::RwLock;

use crate::types::Zone;

/// Outcome of matching one question against the configured zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAnswer {
    /// No zone owns the name.
    Unclaimed,
    /// A zone owns the name but only answers A queries.
    Declined,
    /// A record (or the zone default) matched.
    Address(Ipv4Addr),
    /// The zone owns the name and nothing matched.
    NameError,
}

#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: RwLock<Vec<Zone>>,
}

impl ZoneStore {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self {
            zones: RwLock::new(zones),
        }
    }

    /// Snapshot of every zone, in match order.
    pub async fn list(&self) -> Vec<Zone> {
        self.zones.read().await.clone()
    }

    /// Merge a zone definition into the store.
    ///
    /// If a zone with the same name exists, the incoming records are placed
    /// ahead of the existing ones and the merged zone replaces the old one
    /// at the same position.  Otherwise the zone is appended.
    pub async fn merge(&self, mut zone: Zone) {
        let mut zones = self.zones.write().await;
        match zones.iter_mut().find(|z| z.name == zone.name) {
            Some(existing) => {
                zone.records.append(&mut existing.records);
                *existing = zone;
            }
            None => zones.push(zone),
        }
    }

    /// Match `qname` (fully qualified, as it appears in the question) against
    /// the zones.  The first zone whose dotted suffix ends the name owns it.
    pub async fn answer(&self, qname: &str, qtype: RecordType) -> ZoneAnswer {
        let qname = fqdn(qname);
        let lowered = qname.to_ascii_lowercase();
        let zones = self.zones.read().await;

        for zone in zones.iter() {
            let suffix = format!(".{}", fqdn(&zone.name).to_ascii_lowercase());
            let Some(lowered_relative) = lowered.strip_suffix(&suffix) else {
                continue;
            };
            // ASCII lowering keeps byte offsets, patterns see the name as asked.
            let relative = &qname[..lowered_relative.len()];
            if qtype != RecordType::A {
                return ZoneAnswer::Declined;
            }
            if let Some(record) = zone.records.iter().find(|r| r.matcher.matches(relative)) {
                return ZoneAnswer::Address(record.ip);
            }
            return match zone.default_ip {
                Some(ip) => ZoneAnswer::Address(ip),
                None => ZoneAnswer::NameError,
            };
        }

        ZoneAnswer::Unclaimed
    }
}

fn fqdn(name: &str) -> std::borrow::Cow<'_, str> {
    if name.ends_with('.') {
        name.into()
    } else {
        format!("{}.", name).into()
    }
}
