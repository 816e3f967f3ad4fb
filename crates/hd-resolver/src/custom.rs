//! Local authority over configured hostnames and aliases.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hd_codec::header::Header;
use hd_codec::name::normalize;
use hd_codec::{Packet, Record, RecordType};

use crate::{DnsRequest, DnsResponse, QueryContext, Resolve, ResolveError, SOURCE_CUSTOM};

/// TTL on locally-authoritative answers.
const CUSTOM_TTL: u32 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomDnsConfig {
    /// hostname -> addresses (IPv4 and/or IPv6, mixed freely)
    #[serde(default)]
    pub hosts: HashMap<String, Vec<String>>,
    /// alias -> canonical hostname
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

pub struct CustomDnsResolver {
    hosts: FxHashMap<String, Vec<IpAddr>>,
    aliases: FxHashMap<String, String>,
}

impl CustomDnsResolver {
    pub fn new(config: &CustomDnsConfig) -> Self {
        let mut hosts: FxHashMap<String, Vec<IpAddr>> = FxHashMap::default();
        for (name, addrs) in &config.hosts {
            let parsed: Vec<IpAddr> = addrs
                .iter()
                .filter_map(|addr| match addr.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!("ignoring unparseable address {} for {}", addr, name);
                        None
                    }
                })
                .collect();
            if !parsed.is_empty() {
                hosts.insert(normalize(name), parsed);
            }
        }

        let aliases = config
            .aliases
            .iter()
            .map(|(alias, canonical)| (normalize(alias), normalize(canonical)))
            .collect();

        Self { hosts, aliases }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.aliases.is_empty()
    }

    fn address_records(&self, owner: &str, name: &str, qtype: RecordType) -> Vec<Record> {
        let Some(addrs) = self.hosts.get(name) else {
            return Vec::new();
        };
        addrs
            .iter()
            .filter_map(|addr| match (qtype, addr) {
                (RecordType::A, IpAddr::V4(v4)) => Some(Record::a(owner, *v4, CUSTOM_TTL)),
                (RecordType::AAAA, IpAddr::V6(v6)) => Some(Record::aaaa(owner, *v6, CUSTOM_TTL)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Resolve for CustomDnsResolver {
    async fn resolve(
        &self,
        _ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError> {
        let question = req
            .packet
            .first_question()
            .ok_or(ResolveError::NoQuestion)?;
        let name = normalize(&question.name);
        let qtype = question.qtype;

        let answers = if let Some(canonical) = self.aliases.get(&name) {
            let mut answers = vec![Record::cname(&question.name, canonical, CUSTOM_TTL)];
            if matches!(qtype, RecordType::A | RecordType::AAAA) {
                answers.extend(self.address_records(canonical, canonical, qtype));
            }
            answers
        } else if self.hosts.contains_key(&name) {
            self.address_records(&question.name, &name, qtype)
        } else {
            return Err(ResolveError::NotInCustomDns);
        };

        debug!("answered {} {} locally ({} records)", name, qtype, answers.len());

        let mut header = Header {
            id: req.packet.header.id,
            ..Default::default()
        };
        header.set_response();
        header.set_authoritative();

        let response = Packet {
            header,
            questions: vec![question.clone()],
            answers,
            ..Default::default()
        };
        Ok(DnsResponse {
            bytes: response.marshal()?,
            source: SOURCE_CUSTOM,
        })
    }
}
