//! The internal answer model, shaped after the DoH JSON API (RFC 8427 style)
//! that cloudflare and google speak. Upstream replies deserialize straight
//! into [`DnsAnswer`]; the cache synthesizes the same shape; the wire codec
//! turns it back into an RFC 1035 message.

use serde::{Deserialize, Serialize};

/// DNS record type number for CNAME.
pub const TYPE_CNAME: u16 = 5;
/// DNS record type number for ANY (`*`).
pub const TYPE_ANY: u16 = 255;

/// One downstream question, extracted from the first question of an inbound
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Lowercased, fully qualified (trailing dot) question name.
    pub qname: String,
    pub qtype: u16,
    /// DNSSEC OK bit from the request's OPT record, passed through upstream.
    pub do_flag: bool,
}

impl DnsQuery {
    pub fn new(qname: impl Into<String>, qtype: u16) -> Self {
        Self {
            qname: qname.into(),
            qtype,
            do_flag: false,
        }
    }

    pub fn is_any(&self) -> bool {
        self.qtype == TYPE_ANY
    }
}

/// A question entry inside a [`DnsAnswer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
}

/// A resource record inside a [`DnsAnswer`], with data in presentation
/// format (e.g. `"93.184.216.34"`, `"x.com."`, `"10 mail.x.com."`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub data: String,
}

/// A complete logical DNS answer.
///
/// Invariant: every answer sent downstream or stored in the cache carries a
/// non-empty `name_client` (provenance) and a non-empty first question name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    /// RCODE of the response.
    #[serde(rename = "Status", default)]
    pub status: u8,
    #[serde(rename = "TC", default)]
    pub tc: bool,
    #[serde(rename = "RD", default)]
    pub rd: bool,
    #[serde(rename = "RA", default)]
    pub ra: bool,
    #[serde(rename = "AD", default)]
    pub ad: bool,
    #[serde(rename = "CD", default)]
    pub cd: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", default, skip_serializing_if = "Vec::is_empty")]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Additional", default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<JsonRecord>,
    /// Which resolver produced this answer: `"Cache"`, `"cloudflare"`, ...
    #[serde(rename = "NameClient", default)]
    pub name_client: String,
    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl DnsAnswer {
    /// Name of the first question, if any.
    pub fn qname(&self) -> Option<&str> {
        self.question.first().map(|q| q.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_doh_json() {
        let json = r#"{
            "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false, "CD": false,
            "Question": [{"name": "example.com.", "type": 1}],
            "Answer": [{"name": "example.com.", "type": 1, "TTL": 3600, "data": "93.184.216.34"}]
        }"#;
        let answer: DnsAnswer = serde_json::from_str(json).expect("valid answer JSON");
        assert_eq!(answer.status, 0);
        assert!(answer.rd && answer.ra);
        assert_eq!(answer.qname(), Some("example.com."));
        assert_eq!(answer.answer.len(), 1);
        assert_eq!(answer.answer[0].data, "93.184.216.34");
        assert!(answer.name_client.is_empty());
    }

    #[test]
    fn tolerates_missing_sections() {
        // NXDOMAIN answers come back with no Answer list at all.
        let json = r#"{"Status": 3, "Question": [{"name": "nope.invalid.", "type": 1}]}"#;
        let answer: DnsAnswer = serde_json::from_str(json).expect("valid answer JSON");
        assert_eq!(answer.status, 3);
        assert!(answer.answer.is_empty());
        assert!(answer.authority.is_empty());
    }

    #[test]
    fn any_query_detected() {
        assert!(DnsQuery::new("example.com.", TYPE_ANY).is_any());
        assert!(!DnsQuery::new("example.com.", 1).is_any());
    }
}
