//! In-memory DNS server for tests: a [`FakeZone`] implements
//! [`DnsTransport`] over a record table, following CNAME chains the way a
//! recursive resolver would, and counts queries so cache behavior can be
//! asserted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::message::{Message, RData, Rr, TYPE_CNAME};
use crate::transport::DnsTransport;
use crate::{DnsError, DnsResult};

/// A scripted DNS zone served from memory.
pub struct FakeZone {
    records: Mutex<Vec<Rr>>,
    nxdomain: Mutex<HashSet<String>>,
    counts: Mutex<HashMap<(String, u16), usize>>,
}

impl FakeZone {
    pub fn new(records: Vec<Rr>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            nxdomain: Mutex::new(HashSet::new()),
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the record table.
    pub fn set_records(&self, records: Vec<Rr>) {
        *self.records.lock().expect("zone lock") = records;
    }

    /// Names that answer NXDOMAIN for every query type.
    pub fn set_nxdomain<I: IntoIterator<Item = S>, S: Into<String>>(&self, names: I) {
        let mut set = self.nxdomain.lock().expect("zone lock");
        set.clear();
        set.extend(names.into_iter().map(|n| normalize(&n.into())));
    }

    /// Network queries observed for `(name, qtype)`.
    pub fn query_count(&self, name: &str, qtype: u16) -> usize {
        *self
            .counts
            .lock()
            .expect("zone lock")
            .get(&(normalize(name), qtype))
            .unwrap_or(&0)
    }

    pub fn total_queries(&self) -> usize {
        self.counts.lock().expect("zone lock").values().sum()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[async_trait]
impl DnsTransport for FakeZone {
    async fn query(&self, packet: &[u8]) -> DnsResult<Vec<u8>> {
        let query = Message::decode(packet)?;
        let question = query
            .question
            .first()
            .ok_or_else(|| DnsError::Decode("no question".into()))?
            .clone();
        self.counts
            .lock()
            .expect("zone lock")
            .entry((normalize(&question.name), question.qtype))
            .and_modify(|c| *c += 1)
            .or_insert(1);

        let mut response = query.clone();
        response.qr = 1;
        response.additional.clear();

        if self
            .nxdomain
            .lock()
            .expect("zone lock")
            .contains(&normalize(&question.name))
        {
            response.rcode = 3;
            return response.encode();
        }

        let records = self.records.lock().expect("zone lock").clone();
        let mut want = normalize(&question.name);
        let mut i = 0;
        while i < records.len() {
            let rr = &records[i];
            i += 1;
            if normalize(&rr.name) != want {
                continue;
            }
            if rr.typ == TYPE_CNAME && question.qtype != TYPE_CNAME {
                if let RData::Name(target) = &rr.data {
                    response.answer.push(rr.clone());
                    want = normalize(target);
                    i = 0;
                    continue;
                }
            }
            if rr.typ == question.qtype {
                response.answer.push(rr.clone());
            }
        }
        response.encode()
    }
}

/// Convenience constructor for zone records.
pub fn rr(name: &str, typ: u16, ttl: u32, data: RData) -> Rr {
    Rr {
        name: name.to_string(),
        typ,
        class: 1,
        ttl,
        data,
    }
}
