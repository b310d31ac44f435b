//! Wire codec adapter: RFC 1035 messages in and out, [`DnsAnswer`] in the
//! middle. A thin layer over `hickory-proto`; everything protocol-shaped
//! (name compression, label rules, EDNS framing) stays in the library.

use crate::answer::{DnsAnswer, DnsQuery, JsonRecord};
use crate::error::{ResolveError, Result};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::debug;

/// EDNS payload size advertised in responses.
const EDNS_PAYLOAD: u16 = 4096;

/// The parsed essentials of one inbound datagram.
#[derive(Debug, Clone)]
pub struct InboundQuery {
    pub id: u16,
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub has_edns: bool,
    pub wants_nsid: bool,
    /// The resolver-facing view of the question.
    pub query: DnsQuery,
}

/// Parse an inbound datagram into its first question. Messages with no
/// question, or that are not queries, are rejected as malformed.
pub fn parse_query(data: &[u8]) -> Result<InboundQuery> {
    let message = Message::from_vec(data).map_err(|e| ResolveError::Malformed(e.to_string()))?;
    if message.message_type() != MessageType::Query || message.op_code() != OpCode::Query {
        return Err(ResolveError::Malformed("not a standard query".to_string()));
    }
    let question = message
        .queries()
        .first()
        .ok_or_else(|| ResolveError::Malformed("no question".to_string()))?;

    let edns = message.extensions().as_ref();
    let do_flag = edns.map(|e| e.dnssec_ok()).unwrap_or(false);
    let wants_nsid = edns
        .map(|e| e.options().get(EdnsCode::NSID).is_some())
        .unwrap_or(false);

    let qname = question.name().to_lowercase();
    let qtype = question.query_type();
    let query = DnsQuery {
        qname: qname.to_utf8(),
        qtype: u16::from(qtype),
        do_flag,
    };
    Ok(InboundQuery {
        id: message.id(),
        qname,
        qtype,
        qclass: question.query_class(),
        has_edns: edns.is_some(),
        wants_nsid,
        query,
    })
}

/// Build the wire response for `answer`, echoing the inbound question.
///
/// Flags and RCODE come from the answer; records from its Answer, Authority
/// and Additional sections. If the request carried an NSID option, the reply
/// identifies the winning resolver as `hermod/<NameClient>[: <Comment>]`.
pub fn build_response(inbound: &InboundQuery, answer: &DnsAnswer) -> Result<Vec<u8>> {
    let mut message = response_skeleton(inbound);
    message.set_truncated(answer.tc);
    message.set_recursion_desired(answer.rd);
    message.set_recursion_available(answer.ra);
    message.set_authentic_data(answer.ad);
    message.set_checking_disabled(answer.cd);
    message.set_response_code(rcode_from_status(answer.status));

    for record in records_from_json(&answer.answer) {
        message.add_answer(record);
    }
    for record in records_from_json(&answer.authority) {
        message.add_name_server(record);
    }
    for record in records_from_json(&answer.additional) {
        message.add_additional(record);
    }

    if inbound.has_edns {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_version(0);
        edns.set_dnssec_ok(inbound.query.do_flag);
        if inbound.wants_nsid {
            let mut nsid = format!("hermod/{}", answer.name_client);
            if let Some(comment) = &answer.comment {
                nsid.push_str(": ");
                nsid.push_str(comment);
            }
            edns.options_mut()
                .insert(EdnsOption::Unknown(u16::from(EdnsCode::NSID), nsid.into_bytes()));
        }
        *message.extensions_mut() = Some(edns);
    }

    message
        .to_vec()
        .map_err(|e| ResolveError::Malformed(format!("response encode failed: {e}")))
}

/// Build a minimal SERVFAIL: QR set, question echoed, nothing else.
pub fn build_servfail(inbound: &InboundQuery) -> Result<Vec<u8>> {
    let mut message = response_skeleton(inbound);
    message.set_response_code(ResponseCode::ServFail);
    message
        .to_vec()
        .map_err(|e| ResolveError::Malformed(format!("response encode failed: {e}")))
}

fn response_skeleton(inbound: &InboundQuery) -> Message {
    let mut message = Message::new();
    message.set_id(inbound.id);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    let mut question = Query::query(inbound.qname.clone(), inbound.qtype);
    question.set_query_class(inbound.qclass);
    message.add_query(question);
    message
}

fn rcode_from_status(status: u8) -> ResponseCode {
    match status {
        0 => ResponseCode::NoError,
        1 => ResponseCode::FormErr,
        2 => ResponseCode::ServFail,
        3 => ResponseCode::NXDomain,
        4 => ResponseCode::NotImp,
        5 => ResponseCode::Refused,
        6 => ResponseCode::YXDomain,
        7 => ResponseCode::YXRRSet,
        8 => ResponseCode::NXRRSet,
        9 => ResponseCode::NotAuth,
        10 => ResponseCode::NotZone,
        _ => ResponseCode::ServFail,
    }
}

fn records_from_json(records: &[JsonRecord]) -> Vec<Record> {
    records
        .iter()
        .filter_map(|r| match record_from_json(r) {
            Some(record) => Some(record),
            None => {
                debug!("skipping unencodable record {} type {}", r.name, r.rtype);
                None
            }
        })
        .collect()
}

fn record_from_json(record: &JsonRecord) -> Option<Record> {
    let name = Name::from_utf8(&record.name).ok()?;
    let rdata = rdata_from_presentation(record.rtype, &record.data)?;
    let mut built = Record::from_rdata(name, record.ttl, rdata);
    built.set_dns_class(DNSClass::IN);
    Some(built)
}

/// Decode a presentation-format `data` string for the common record types
/// the DoH JSON API hands back. Types outside this set are dropped from the
/// wire response (they were still cached and still count as an answer).
fn rdata_from_presentation(rtype: u16, data: &str) -> Option<RData> {
    match RecordType::from(rtype) {
        RecordType::A => data.parse::<Ipv4Addr>().ok().map(|ip| RData::A(A(ip))),
        RecordType::AAAA => data.parse::<Ipv6Addr>().ok().map(|ip| RData::AAAA(AAAA(ip))),
        RecordType::CNAME => name_of(data).map(|n| RData::CNAME(CNAME(n))),
        RecordType::NS => name_of(data).map(|n| RData::NS(NS(n))),
        RecordType::PTR => name_of(data).map(|n| RData::PTR(PTR(n))),
        RecordType::MX => {
            let (preference, exchange) = data.split_once(' ')?;
            Some(RData::MX(MX::new(
                preference.parse().ok()?,
                name_of(exchange)?,
            )))
        }
        RecordType::TXT => {
            // The JSON API quotes TXT character-strings.
            let text = data.trim_matches('"').to_string();
            Some(RData::TXT(TXT::new(vec![text])))
        }
        RecordType::SOA => {
            let fields: Vec<&str> = data.split_whitespace().collect();
            if fields.len() != 7 {
                return None;
            }
            Some(RData::SOA(SOA::new(
                name_of(fields[0])?,
                name_of(fields[1])?,
                fields[2].parse().ok()?,
                fields[3].parse().ok()?,
                fields[4].parse().ok()?,
                fields[5].parse().ok()?,
                fields[6].parse().ok()?,
            )))
        }
        RecordType::SRV => {
            let fields: Vec<&str> = data.split_whitespace().collect();
            if fields.len() != 4 {
                return None;
            }
            Some(RData::SRV(SRV::new(
                fields[0].parse().ok()?,
                fields[1].parse().ok()?,
                fields[2].parse().ok()?,
                name_of(fields[3])?,
            )))
        }
        _ => None,
    }
}

fn name_of(data: &str) -> Option<Name> {
    Name::from_str(data).ok()
}
