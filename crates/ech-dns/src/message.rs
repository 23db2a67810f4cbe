//! RFC 1035 DNS message codec.
//!
//! Queries are encoded from [`Message::query`]; full responses are decoded
//! with [`Message::decode`], including the RFC 9460 SVCB/HTTPS record
//! shapes the resolver needs. Name decompression follows pointers only
//! backwards: a pointer whose target is at or past its own offset is a loop
//! or forward jump and the message is rejected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ech_wire::Builder;

use crate::{DnsError, DnsResult};

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_LOC: u16 = 29;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_CERT: u16 = 37;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_DS: u16 = 43;
pub const TYPE_RRSIG: u16 = 46;
pub const TYPE_NSEC: u16 = 47;
pub const TYPE_DNSKEY: u16 = 48;
pub const TYPE_SVCB: u16 = 64;
pub const TYPE_HTTPS: u16 = 65;
pub const TYPE_URI: u16 = 256;
pub const TYPE_CAA: u16 = 257;

const CLASS_IN: u16 = 1;

/// EDNS0 padding option code (RFC 7830).
const OPT_PADDING: u16 = 12;
/// Advertised UDP payload size in the OPT pseudo-record.
const EDNS_PAYLOAD_SIZE: u16 = 1232;

/// An RFC 1035 DNS message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: u16,
    pub qr: u8,
    pub opcode: u8,
    pub aa: u8,
    pub tc: u8,
    pub rd: u8,
    pub ra: u8,
    pub rcode: u8,

    pub question: Vec<Question>,
    pub answer: Vec<Rr>,
    pub authority: Vec<Rr>,
    pub additional: Vec<Rr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub class: u16,
}

/// A resource record.
#[derive(Debug, Clone, PartialEq)]
pub struct Rr {
    pub name: String,
    pub typ: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

/// Decoded RDATA, by record type.
#[derive(Debug, Clone, PartialEq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// NS, CNAME, PTR
    Name(String),
    Soa(Soa),
    Mx(Mx),
    Txt(Vec<String>),
    Srv(Srv),
    Caa(Caa),
    Loc(Loc),
    Nsec(Nsec),
    Ds(Ds),
    Dnskey(Dnskey),
    Rrsig(Rrsig),
    Cert(Cert),
    Uri(Uri),
    Svcb(Svcb),
    Https(HttpsRecord),
    /// Anything we don't interpret, OPT included.
    Raw(Vec<u8>),
}

impl RData {
    /// The IP address carried by an A or AAAA record.
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            RData::A(ip) => Some(IpAddr::V4(*ip)),
            RData::Aaaa(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mx {
    pub preference: u16,
    pub exchange: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srv {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caa {
    pub flags: u8,
    pub tag: String,
    pub value: String,
}

/// RFC 1876, sizes and precisions in meters, coordinates in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Loc {
    pub version: u8,
    pub size: f64,
    pub horiz_pre: f64,
    pub vert_pre: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsec {
    pub next_domain_name: String,
    pub type_bit_maps: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnskey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrsig {
    pub type_covered: u16,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub signature_expiration: u32,
    pub signature_inception: u32,
    pub key_tag: u16,
    pub signer_name: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cert {
    pub typ: u16,
    pub key_tag: u16,
    pub algorithm: u8,
    pub certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
}

/// An RFC 9460 SVCB record with uninterpreted parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Svcb {
    pub priority: u16,
    pub target: String,
    pub params: Vec<SvcbParam>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvcbParam {
    pub key: u16,
    pub value: Vec<u8>,
}

/// An RFC 9460 HTTPS record. `priority == 0` is AliasMode: `target` names
/// the alias and the service parameters are meaningless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpsRecord {
    pub priority: u16,
    pub target: String,
    pub alpn: Vec<String>,
    pub no_default_alpn: bool,
    pub port: u16,
    pub ipv4_hint: Vec<Ipv4Addr>,
    pub ipv6_hint: Vec<Ipv6Addr>,
    pub ech: Vec<u8>,
}

impl std::fmt::Display for HttpsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}.", self.priority, self.target)?;
        if !self.alpn.is_empty() {
            write!(f, " alpn={}", self.alpn.join(","))?;
        }
        if self.no_default_alpn {
            write!(f, " no-default-alpn")?;
        }
        if self.port != 0 {
            write!(f, " port={}", self.port)?;
        }
        for ip in &self.ipv4_hint {
            write!(f, " ipv4hint={ip}")?;
        }
        for ip in &self.ipv6_hint {
            write!(f, " ipv6hint={ip}")?;
        }
        if !self.ech.is_empty() {
            write!(f, " ech={} bytes", self.ech.len())?;
        }
        Ok(())
    }
}

impl Message {
    /// A recursion-desired query for one question.
    pub fn query(name: &str, qtype: u16) -> Self {
        Message {
            rd: 1,
            question: vec![Question {
                name: name.to_string(),
                qtype,
                class: CLASS_IN,
            }],
            ..Message::default()
        }
    }

    /// Serializes the message.
    pub fn encode(&self) -> DnsResult<Vec<u8>> {
        self.encode_inner(None)
    }

    /// Serializes the message with an EDNS0 padding option sized so the
    /// total length is a multiple of `block` (RFC 8467 recommends 128 for
    /// queries), hiding the queried name's length class.
    pub fn encode_padded(&self, block: usize) -> DnsResult<Vec<u8>> {
        self.encode_inner(Some(block.max(1)))
    }

    fn encode_inner(&self, pad_block: Option<usize>) -> DnsResult<Vec<u8>> {
        let mut b = Builder::new();
        b.push_u16(self.id);
        b.push_u16(
            u16::from(self.qr & 1) << 15
                | u16::from(self.opcode & 0xf) << 11
                | u16::from(self.aa & 1) << 10
                | u16::from(self.tc & 1) << 9
                | u16::from(self.rd & 1) << 8
                | u16::from(self.ra & 1) << 7
                | u16::from(self.rcode & 0xf),
        );
        b.push_u16(self.question.len() as u16);
        b.push_u16(self.answer.len() as u16);
        b.push_u16(self.authority.len() as u16);
        b.push_u16(self.additional.len() as u16 + u16::from(pad_block.is_some()));
        for q in &self.question {
            push_name(&mut b, &q.name)?;
            b.push_u16(q.qtype);
            b.push_u16(q.class);
        }
        for rr in self
            .answer
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            rr.encode(&mut b)?;
        }
        let mut out = b.into_bytes();
        if let Some(block) = pad_block {
            // OPT header is 11 bytes, the padding option header 4 more.
            let base = out.len() + 15;
            let pad = (block - base % block) % block;
            let mut b = Builder::new();
            b.push_u8(0); // root owner name
            b.push_u16(TYPE_OPT);
            b.push_u16(EDNS_PAYLOAD_SIZE);
            b.push_u32(0);
            b.u16_prefixed(|b| {
                b.push_u16(OPT_PADDING);
                b.push_u16(pad as u16);
                b.push_bytes(&vec![0u8; pad]);
                Ok(())
            })
            .map_err(DnsError::from)?;
            out.extend_from_slice(&b.into_bytes());
        }
        Ok(out)
    }

    /// Decodes a DNS message.
    pub fn decode(raw: &[u8]) -> DnsResult<Message> {
        Decoder { raw }.decode()
    }
}

impl Rr {
    fn encode(&self, b: &mut Builder) -> DnsResult<()> {
        push_name(b, &self.name)?;
        b.push_u16(self.typ);
        b.push_u16(self.class);
        b.push_u32(self.ttl);
        let mut rb = Builder::new();
        encode_rdata(&mut rb, &self.data)?;
        let rdata = rb.into_bytes();
        if rdata.len() > u16::MAX as usize {
            return Err(DnsError::Decode("rdata too long".into()));
        }
        b.push_u16(rdata.len() as u16);
        b.push_bytes(&rdata);
        Ok(())
    }
}

fn encode_rdata(b: &mut Builder, data: &RData) -> DnsResult<()> {
    match data {
        RData::A(ip) => b.push_bytes(&ip.octets()),
        RData::Aaaa(ip) => b.push_bytes(&ip.octets()),
        RData::Name(name) => push_name(b, name)?,
        RData::Soa(soa) => {
            push_name(b, &soa.mname)?;
            push_name(b, &soa.rname)?;
            b.push_u32(soa.serial);
            b.push_u32(soa.refresh);
            b.push_u32(soa.retry);
            b.push_u32(soa.expire);
            b.push_u32(soa.minimum);
        }
        RData::Mx(mx) => {
            b.push_u16(mx.preference);
            push_name(b, &mx.exchange)?;
        }
        RData::Txt(strings) => {
            for s in strings {
                b.u8_prefixed(|b| {
                    b.push_bytes(s.as_bytes());
                    Ok(())
                })?;
            }
        }
        RData::Srv(srv) => {
            b.push_u16(srv.priority);
            b.push_u16(srv.weight);
            b.push_u16(srv.port);
            push_name(b, &srv.target)?;
        }
        RData::Caa(caa) => {
            b.push_u8(caa.flags);
            b.u8_prefixed(|b| {
                b.push_bytes(caa.tag.as_bytes());
                Ok(())
            })?;
            b.push_bytes(caa.value.as_bytes());
        }
        RData::Nsec(nsec) => {
            push_name(b, &nsec.next_domain_name)?;
            b.push_bytes(&nsec.type_bit_maps);
        }
        RData::Ds(ds) => {
            b.push_u16(ds.key_tag);
            b.push_u8(ds.algorithm);
            b.push_u8(ds.digest_type);
            b.push_bytes(&ds.digest);
        }
        RData::Dnskey(key) => {
            b.push_u16(key.flags);
            b.push_u8(key.protocol);
            b.push_u8(key.algorithm);
            b.push_bytes(&key.public_key);
        }
        RData::Rrsig(sig) => {
            b.push_u16(sig.type_covered);
            b.push_u8(sig.algorithm);
            b.push_u8(sig.labels);
            b.push_u32(sig.original_ttl);
            b.push_u32(sig.signature_expiration);
            b.push_u32(sig.signature_inception);
            b.push_u16(sig.key_tag);
            push_name(b, &sig.signer_name)?;
            b.push_bytes(&sig.signature);
        }
        RData::Cert(cert) => {
            b.push_u16(cert.typ);
            b.push_u16(cert.key_tag);
            b.push_u8(cert.algorithm);
            b.push_bytes(&cert.certificate);
        }
        RData::Uri(uri) => {
            b.push_u16(uri.priority);
            b.push_u16(uri.weight);
            b.push_bytes(uri.target.as_bytes());
        }
        RData::Svcb(svcb) => {
            b.push_u16(svcb.priority);
            push_name(b, &svcb.target)?;
            for param in &svcb.params {
                b.push_u16(param.key);
                b.u16_prefixed(|b| {
                    b.push_bytes(&param.value);
                    Ok(())
                })?;
            }
        }
        RData::Https(https) => encode_https(b, https)?,
        RData::Raw(bytes) => b.push_bytes(bytes),
        RData::Loc(_) => {
            return Err(DnsError::Decode("LOC re-encoding not supported".into()));
        }
    }
    Ok(())
}

/// Service parameters must be emitted in ascending key order (RFC 9460
/// §2.2): alpn(1), no-default-alpn(2), port(3), ipv4hint(4), ech(5),
/// ipv6hint(6).
fn encode_https(b: &mut Builder, https: &HttpsRecord) -> DnsResult<()> {
    b.push_u16(https.priority);
    push_name(b, &https.target)?;
    if !https.alpn.is_empty() {
        b.push_u16(1);
        b.u16_prefixed(|b| {
            for proto in &https.alpn {
                b.u8_prefixed(|b| {
                    b.push_bytes(proto.as_bytes());
                    Ok(())
                })?;
            }
            Ok(())
        })?;
    }
    if https.no_default_alpn {
        b.push_u16(2);
        b.push_u16(0);
    }
    if https.port != 0 {
        b.push_u16(3);
        b.u16_prefixed(|b| {
            b.push_u16(https.port);
            Ok(())
        })?;
    }
    if !https.ipv4_hint.is_empty() {
        b.push_u16(4);
        b.u16_prefixed(|b| {
            for ip in &https.ipv4_hint {
                b.push_bytes(&ip.octets());
            }
            Ok(())
        })?;
    }
    if !https.ech.is_empty() {
        b.push_u16(5);
        b.u16_prefixed(|b| {
            b.push_bytes(&https.ech);
            Ok(())
        })?;
    }
    if !https.ipv6_hint.is_empty() {
        b.push_u16(6);
        b.u16_prefixed(|b| {
            for ip in &https.ipv6_hint {
                b.push_bytes(&ip.octets());
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn push_name(b: &mut Builder, name: &str) -> DnsResult<()> {
    let trimmed = name.trim_end_matches('.');
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.len() > 63 {
                return Err(DnsError::Decode(format!("label too long: {label}")));
            }
            b.u8_prefixed(|b| {
                b.push_bytes(label.as_bytes());
                Ok(())
            })?;
        }
    }
    b.push_u8(0);
    Ok(())
}

struct Decoder<'a> {
    raw: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn decode(&self) -> DnsResult<Message> {
        let mut msg = Message::default();
        let mut pos = 0usize;

        msg.id = self.u16(&mut pos)?;
        let flags = self.u16(&mut pos)?;
        msg.qr = ((flags & 0x8000) >> 15) as u8;
        msg.opcode = ((flags & 0x7800) >> 11) as u8;
        msg.aa = ((flags & 0x0400) >> 10) as u8;
        msg.tc = ((flags & 0x0200) >> 9) as u8;
        msg.rd = ((flags & 0x0100) >> 8) as u8;
        msg.ra = ((flags & 0x0080) >> 7) as u8;
        msg.rcode = (flags & 0x000f) as u8;

        let qd_count = self.u16(&mut pos)?;
        let an_count = self.u16(&mut pos)?;
        let ns_count = self.u16(&mut pos)?;
        let ar_count = self.u16(&mut pos)?;

        for _ in 0..qd_count {
            let name = self.name(&mut pos)?;
            msg.question.push(Question {
                name,
                qtype: self.u16(&mut pos)?,
                class: self.u16(&mut pos)?,
            });
        }
        for _ in 0..an_count {
            msg.answer.push(self.rr(&mut pos)?);
        }
        for _ in 0..ns_count {
            msg.authority.push(self.rr(&mut pos)?);
        }
        for _ in 0..ar_count {
            msg.additional.push(self.rr(&mut pos)?);
        }
        Ok(msg)
    }

    fn u8(&self, pos: &mut usize) -> DnsResult<u8> {
        let b = *self
            .raw
            .get(*pos)
            .ok_or_else(|| DnsError::Decode("truncated".into()))?;
        *pos += 1;
        Ok(b)
    }

    fn u16(&self, pos: &mut usize) -> DnsResult<u16> {
        let b = self.take(pos, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&self, pos: &mut usize) -> DnsResult<u32> {
        let b = self.take(pos, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take(&self, pos: &mut usize, n: usize) -> DnsResult<&'a [u8]> {
        let out = self
            .raw
            .get(*pos..*pos + n)
            .ok_or_else(|| DnsError::Decode("truncated".into()))?;
        *pos += n;
        Ok(out)
    }

    /// Reads a possibly-compressed name starting at `*pos`, leaving `*pos`
    /// just past the name in the original stream.
    ///
    /// Pointer safety: a pointer must target an offset strictly before the
    /// pointer's own position, and the accumulated name is capped at 255
    /// bytes, so malicious pointer chains always terminate in an error.
    fn name(&self, pos: &mut usize) -> DnsResult<String> {
        let mut labels: Vec<String> = Vec::new();
        let mut cur = *pos;
        let mut jumped = false;
        let mut total = 0usize;
        loop {
            let len_byte = *self
                .raw
                .get(cur)
                .ok_or_else(|| DnsError::Decode("truncated name".into()))?;
            match len_byte {
                0 => {
                    cur += 1;
                    break;
                }
                l if l & 0xc0 == 0xc0 => {
                    let b2 = *self
                        .raw
                        .get(cur + 1)
                        .ok_or_else(|| DnsError::Decode("truncated pointer".into()))?;
                    let target = (((l & 0x3f) as usize) << 8) | b2 as usize;
                    if target >= cur {
                        return Err(DnsError::Decode(
                            "compression pointer does not point backwards".into(),
                        ));
                    }
                    if !jumped {
                        *pos = cur + 2;
                        jumped = true;
                    }
                    cur = target;
                }
                l if l & 0xc0 != 0 => {
                    return Err(DnsError::Decode(format!("invalid label length 0x{l:02x}")));
                }
                l => {
                    let len = l as usize; // <= 63 by the tag check
                    let bytes = self
                        .raw
                        .get(cur + 1..cur + 1 + len)
                        .ok_or_else(|| DnsError::Decode("truncated label".into()))?;
                    total += len + 1;
                    if total > 255 {
                        return Err(DnsError::Decode("name longer than 255 bytes".into()));
                    }
                    labels.push(String::from_utf8_lossy(bytes).into_owned());
                    cur += 1 + len;
                }
            }
        }
        if !jumped {
            *pos = cur;
        }
        Ok(labels.join("."))
    }

    fn rr(&self, pos: &mut usize) -> DnsResult<Rr> {
        let name = self.name(pos)?;
        let typ = self.u16(pos)?;
        let class = self.u16(pos)?;
        let ttl = self.u32(pos)?;
        let rd_len = self.u16(pos)? as usize;
        let rd_start = *pos;
        let rd_end = rd_start + rd_len;
        if rd_end > self.raw.len() {
            return Err(DnsError::Decode("truncated rdata".into()));
        }
        *pos = rd_end;
        let rdata = &self.raw[rd_start..rd_end];

        let data = match typ {
            TYPE_A => {
                let octets: [u8; 4] = rdata
                    .try_into()
                    .map_err(|_| DnsError::Decode("bad A rdata length".into()))?;
                RData::A(Ipv4Addr::from(octets))
            }
            TYPE_AAAA => {
                let octets: [u8; 16] = rdata
                    .try_into()
                    .map_err(|_| DnsError::Decode("bad AAAA rdata length".into()))?;
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            TYPE_NS | TYPE_CNAME | TYPE_PTR => {
                let mut p = rd_start;
                RData::Name(self.name(&mut p)?)
            }
            TYPE_SOA => {
                let mut p = rd_start;
                RData::Soa(Soa {
                    mname: self.name(&mut p)?,
                    rname: self.name(&mut p)?,
                    serial: self.u32(&mut p)?,
                    refresh: self.u32(&mut p)?,
                    retry: self.u32(&mut p)?,
                    expire: self.u32(&mut p)?,
                    minimum: self.u32(&mut p)?,
                })
            }
            TYPE_MX => {
                let mut p = rd_start;
                RData::Mx(Mx {
                    preference: self.u16(&mut p)?,
                    exchange: self.name(&mut p)?,
                })
            }
            TYPE_TXT => {
                let mut strings = Vec::new();
                let mut r = ech_wire::Reader::new(rdata);
                while !r.is_empty() {
                    strings.push(String::from_utf8_lossy(r.read_u8_prefixed()?).into_owned());
                }
                RData::Txt(strings)
            }
            TYPE_LOC => RData::Loc(decode_loc(rdata)?),
            TYPE_SRV => {
                let mut p = rd_start;
                RData::Srv(Srv {
                    priority: self.u16(&mut p)?,
                    weight: self.u16(&mut p)?,
                    port: self.u16(&mut p)?,
                    target: self.name(&mut p)?,
                })
            }
            TYPE_CERT => {
                let mut r = ech_wire::Reader::new(rdata);
                RData::Cert(Cert {
                    typ: r.read_u16()?,
                    key_tag: r.read_u16()?,
                    algorithm: r.read_u8()?,
                    certificate: r.read_exact(r.remaining())?.to_vec(),
                })
            }
            TYPE_DS => {
                let mut r = ech_wire::Reader::new(rdata);
                RData::Ds(Ds {
                    key_tag: r.read_u16()?,
                    algorithm: r.read_u8()?,
                    digest_type: r.read_u8()?,
                    digest: r.read_exact(r.remaining())?.to_vec(),
                })
            }
            TYPE_RRSIG => {
                let mut p = rd_start;
                let type_covered = self.u16(&mut p)?;
                let algorithm = self.u8(&mut p)?;
                let labels = self.u8(&mut p)?;
                let original_ttl = self.u32(&mut p)?;
                let signature_expiration = self.u32(&mut p)?;
                let signature_inception = self.u32(&mut p)?;
                let key_tag = self.u16(&mut p)?;
                let signer_name = self.name(&mut p)?;
                if p > rd_end {
                    return Err(DnsError::Decode("truncated RRSIG".into()));
                }
                RData::Rrsig(Rrsig {
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    signature_expiration,
                    signature_inception,
                    key_tag,
                    signer_name,
                    signature: self.raw[p..rd_end].to_vec(),
                })
            }
            TYPE_NSEC => {
                let mut p = rd_start;
                let next_domain_name = self.name(&mut p)?;
                if p > rd_end {
                    return Err(DnsError::Decode("truncated NSEC".into()));
                }
                RData::Nsec(Nsec {
                    next_domain_name,
                    type_bit_maps: self.raw[p..rd_end].to_vec(),
                })
            }
            TYPE_DNSKEY => {
                let mut r = ech_wire::Reader::new(rdata);
                RData::Dnskey(Dnskey {
                    flags: r.read_u16()?,
                    protocol: r.read_u8()?,
                    algorithm: r.read_u8()?,
                    public_key: r.read_exact(r.remaining())?.to_vec(),
                })
            }
            TYPE_SVCB => {
                let mut p = rd_start;
                let priority = self.u16(&mut p)?;
                let target = self.name(&mut p)?;
                if p > rd_end {
                    return Err(DnsError::Decode("truncated SVCB".into()));
                }
                let mut params = Vec::new();
                let mut r = ech_wire::Reader::new(&self.raw[p..rd_end]);
                while !r.is_empty() {
                    params.push(SvcbParam {
                        key: r.read_u16()?,
                        value: r.read_u16_prefixed()?.to_vec(),
                    });
                }
                RData::Svcb(Svcb {
                    priority,
                    target,
                    params,
                })
            }
            TYPE_HTTPS => {
                let mut p = rd_start;
                let priority = self.u16(&mut p)?;
                let target = self.name(&mut p)?;
                if p > rd_end {
                    return Err(DnsError::Decode("truncated HTTPS".into()));
                }
                RData::Https(decode_https_params(priority, target, &self.raw[p..rd_end])?)
            }
            TYPE_URI => {
                let mut r = ech_wire::Reader::new(rdata);
                RData::Uri(Uri {
                    priority: r.read_u16()?,
                    weight: r.read_u16()?,
                    target: String::from_utf8_lossy(r.read_exact(r.remaining())?).into_owned(),
                })
            }
            TYPE_CAA => {
                let mut r = ech_wire::Reader::new(rdata);
                RData::Caa(Caa {
                    flags: r.read_u8()?,
                    tag: String::from_utf8_lossy(r.read_u8_prefixed()?).into_owned(),
                    value: String::from_utf8_lossy(r.read_exact(r.remaining())?).into_owned(),
                })
            }
            _ => RData::Raw(rdata.to_vec()),
        };
        Ok(Rr {
            name,
            typ,
            class,
            ttl,
            data,
        })
    }
}

/// Service parameter keys: 0 mandatory (ignored here), 1 alpn,
/// 2 no-default-alpn, 3 port, 4 ipv4hint, 5 ech, 6 ipv6hint. Unknown keys
/// are skipped.
fn decode_https_params(priority: u16, target: String, params: &[u8]) -> DnsResult<HttpsRecord> {
    let mut record = HttpsRecord {
        priority,
        target,
        ..HttpsRecord::default()
    };
    let mut r = ech_wire::Reader::new(params);
    while !r.is_empty() {
        let key = r.read_u16()?;
        let value = r.read_u16_prefixed()?;
        match key {
            0 => {} // mandatory keys
            1 => {
                let mut v = ech_wire::Reader::new(value);
                while !v.is_empty() {
                    record
                        .alpn
                        .push(String::from_utf8_lossy(v.read_u8_prefixed()?).into_owned());
                }
            }
            2 => record.no_default_alpn = true,
            3 => {
                let mut v = ech_wire::Reader::new(value);
                record.port = v.read_u16()?;
            }
            4 => {
                if value.len() % 4 != 0 {
                    return Err(DnsError::Decode("bad ipv4hint length".into()));
                }
                for chunk in value.chunks_exact(4) {
                    let octets: [u8; 4] = chunk.try_into().expect("chunked by 4");
                    record.ipv4_hint.push(Ipv4Addr::from(octets));
                }
            }
            5 => record.ech = value.to_vec(),
            6 => {
                if value.len() % 16 != 0 {
                    return Err(DnsError::Decode("bad ipv6hint length".into()));
                }
                for chunk in value.chunks_exact(16) {
                    let octets: [u8; 16] = chunk.try_into().expect("chunked by 16");
                    record.ipv6_hint.push(Ipv6Addr::from(octets));
                }
            }
            _ => {}
        }
    }
    Ok(record)
}

fn decode_loc(rdata: &[u8]) -> DnsResult<Loc> {
    let mut r = ech_wire::Reader::new(rdata);
    let version = r.read_u8()?;
    let prec = |v: u8| -> f64 {
        let mantissa = f64::from(v >> 4);
        let exponent = i32::from(v & 0x0f);
        mantissa * 10f64.powi(exponent) / 100.0
    };
    let size = prec(r.read_u8()?);
    let horiz_pre = prec(r.read_u8()?);
    let vert_pre = prec(r.read_u8()?);
    let latitude = (f64::from(r.read_u32()?) - 2147483648.0) / 3_600_000.0;
    let longitude = (f64::from(r.read_u32()?) - 2147483648.0) / 3_600_000.0;
    let altitude = (f64::from(r.read_u32()?) - 10_000_000.0) / 100.0;
    Ok(Loc {
        version,
        size,
        horiz_pre,
        vert_pre,
        latitude,
        longitude,
        altitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_query_wire_format() {
        let msg = Message::query("example.com", TYPE_A);
        let bytes = msg.encode().unwrap();
        let expected: &[u8] = &[
            0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0x07, b'e', b'x', b'a', b'm',
            b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn padded_queries_share_a_size() {
        let short = Message::query("a.com", TYPE_HTTPS)
            .encode_padded(128)
            .unwrap();
        let long = Message::query("a-considerably-longer-name.example.com", TYPE_HTTPS)
            .encode_padded(128)
            .unwrap();
        assert_eq!(short.len() % 128, 0);
        assert_eq!(long.len() % 128, 0);
        assert_eq!(short.len(), long.len());
        // The padded query still decodes; the OPT RR lands in additional.
        let decoded = Message::decode(&short).unwrap();
        assert_eq!(decoded.question[0].name, "a.com");
        assert_eq!(decoded.additional.len(), 1);
        assert_eq!(decoded.additional[0].typ, TYPE_OPT);
    }

    #[test]
    fn decode_response_with_compression() {
        // Header: QR=1, QD=1, AN=2
        let mut resp = vec![
            0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
        ];
        resp.extend_from_slice(&[
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00,
            0x01, 0x00, 0x01,
        ]);
        // AN1: pointer to offset 12, A, TTL=30, 1.2.3.4
        resp.extend_from_slice(&[
            0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 30, 0x00, 0x04, 1, 2, 3, 4,
        ]);
        // AN2: pointer to offset 12, A, TTL=5, 5.6.7.8
        resp.extend_from_slice(&[
            0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 5, 0x00, 0x04, 5, 6, 7, 8,
        ]);
        let msg = Message::decode(&resp).unwrap();
        assert_eq!(msg.id, 0x1234);
        assert_eq!(msg.qr, 1);
        assert_eq!(msg.answer.len(), 2);
        assert_eq!(msg.answer[0].name, "example.com");
        assert_eq!(msg.answer[0].ttl, 30);
        assert_eq!(msg.answer[0].data, RData::A(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(msg.answer[1].ttl, 5);
    }

    #[test]
    fn rejects_forward_pointer() {
        // A question name that is a pointer to its own offset (12).
        let mut resp = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        resp.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        let err = Message::decode(&resp).unwrap_err();
        assert!(matches!(err, DnsError::Decode(_)), "{err}");
    }

    #[test]
    fn rejects_pointer_past_self() {
        // Pointer at offset 12 targeting offset 14 (forward jump).
        let mut resp = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        resp.extend_from_slice(&[0xc0, 0x0e, 0x00, 0x00, 0x01, 0x00, 0x01]);
        assert!(Message::decode(&resp).is_err());
    }

    #[test]
    fn rejects_mutual_pointer_loop() {
        // Name at 12 points backwards into the header, whose bytes spell a
        // label chain that eventually exceeds the 255-byte cap or runs into
        // an invalid tag; either way, decoding must terminate with an error.
        let mut resp = vec![
            0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e, 0x3e,
        ];
        resp[4..6].copy_from_slice(&[0x00, 0x01]); // QDCOUNT=1
        resp.extend_from_slice(&[0xc0, 0x00, 0x00, 0x01, 0x00, 0x01]);
        assert!(Message::decode(&resp).is_err());
    }

    #[test]
    fn rejects_name_longer_than_255() {
        let mut resp = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for _ in 0..5 {
            resp.push(63);
            resp.extend_from_slice(&[b'a'; 63]);
        }
        resp.push(0);
        resp.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        let err = Message::decode(&resp).unwrap_err();
        assert!(matches!(err, DnsError::Decode(_)));
    }

    #[test]
    fn https_record_roundtrip() {
        let https = HttpsRecord {
            priority: 1,
            target: "svc.example.com".into(),
            alpn: vec!["h2".into(), "http/1.1".into()],
            no_default_alpn: false,
            port: 8443,
            ipv4_hint: vec![Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::new(192, 168, 0, 2)],
            ipv6_hint: vec!["2001:db8::1".parse().unwrap()],
            ech: vec![0xfe, 0x0d, 0x00, 0x01],
        };
        let mut msg = Message::query("svc.example.com", TYPE_HTTPS);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "svc.example.com".into(),
            typ: TYPE_HTTPS,
            class: 1,
            ttl: 300,
            data: RData::Https(https.clone()),
        });
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.answer[0].data, RData::Https(https));
    }

    #[test]
    fn https_alias_mode_empty_target() {
        let mut msg = Message::query("example.com", TYPE_HTTPS);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_HTTPS,
            class: 1,
            ttl: 60,
            data: RData::Https(HttpsRecord {
                priority: 0,
                target: "www.example.com".into(),
                ..HttpsRecord::default()
            }),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match &decoded.answer[0].data {
            RData::Https(h) => {
                assert_eq!(h.priority, 0);
                assert_eq!(h.target, "www.example.com");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn https_unknown_param_keys_ignored() {
        let mut b = Builder::new();
        b.push_u16(1); // priority
        b.push_u8(0); // root target
        b.push_u16(0x1234); // unknown key
        b.u16_prefixed(|b| {
            b.push_bytes(&[1, 2, 3]);
            Ok(())
        })
        .unwrap();
        b.push_u16(3); // port
        b.u16_prefixed(|b| {
            b.push_u16(444);
            Ok(())
        })
        .unwrap();
        let https = decode_https_params(1, String::new(), &b.into_bytes()[3..]).unwrap();
        assert_eq!(https.port, 444);
        assert!(https.alpn.is_empty());
    }

    #[test]
    fn decodes_cname_srv_txt() {
        let mut msg = Message::query("example.com", TYPE_A);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_CNAME,
            class: 1,
            ttl: 60,
            data: RData::Name("www.example.com".into()),
        });
        msg.answer.push(Rr {
            name: "_svc._tcp.example.com".into(),
            typ: TYPE_SRV,
            class: 1,
            ttl: 60,
            data: RData::Srv(Srv {
                priority: 10,
                weight: 5,
                port: 8080,
                target: "host.example.com".into(),
            }),
        });
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_TXT,
            class: 1,
            ttl: 60,
            data: RData::Txt(vec!["v=spf1 -all".into(), "other".into()]),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.answer, msg.answer);
    }

    #[test]
    fn decodes_soa_and_mx() {
        let mut msg = Message::query("example.com", TYPE_SOA);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_SOA,
            class: 1,
            ttl: 3600,
            data: RData::Soa(Soa {
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            }),
        });
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_MX,
            class: 1,
            ttl: 3600,
            data: RData::Mx(Mx {
                preference: 10,
                exchange: "mail.example.com".into(),
            }),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.answer, msg.answer);
    }

    #[test]
    fn decodes_aaaa() {
        let ip: Ipv6Addr = "2606:4700::6810:84e5".parse().unwrap();
        let mut msg = Message::query("example.com", TYPE_AAAA);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: TYPE_AAAA,
            class: 1,
            ttl: 60,
            data: RData::Aaaa(ip),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.answer[0].data.as_ip(), Some(IpAddr::V6(ip)));
    }

    #[test]
    fn https_record_display() {
        let https = HttpsRecord {
            priority: 1,
            target: "svc.example.com".into(),
            alpn: vec!["h2".into()],
            port: 8443,
            ech: vec![1, 2, 3],
            ..HttpsRecord::default()
        };
        assert_eq!(
            https.to_string(),
            "1 svc.example.com. alpn=h2 port=8443 ech=3 bytes"
        );
    }

    #[test]
    fn unknown_rr_type_kept_raw() {
        let mut msg = Message::query("example.com", 999);
        msg.qr = 1;
        msg.answer.push(Rr {
            name: "example.com".into(),
            typ: 999,
            class: 1,
            ttl: 60,
            data: RData::Raw(vec![1, 2, 3, 4]),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.answer[0].data, RData::Raw(vec![1, 2, 3, 4]));
    }
}
