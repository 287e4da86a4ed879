//! Minimal SIP message model
//!
//! The transaction layer only needs a handful of headers to do its job:
//! the Via stack (for the branch and the response path), From/To tags,
//! Call-ID, CSeq, Contact, Route, Retry-After and Warning. This module
//! models exactly those, plus the transport metadata the stack attaches to
//! every message (where it came from, whether it came from the wire, which
//! Transaction User owns it).
//!
//! Header grammar is intentionally shallow; see [`codec`] for the wire form.

pub mod builders;
pub mod codec;
mod uri;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

pub use builders::{
    generate_branch, generate_tag, make_100, make_cancel, make_failure_ack, make_response,
    make_try_later, reason_phrase,
};
pub use codec::{decode, drain_frames, encode};
pub use uri::Uri;

use crate::error::{Error, Result};
use crate::tuple::{TransportType, Tuple};

/// RFC 3261 branch prefix
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Info,
    Message,
    Notify,
    Subscribe,
    Refer,
    Prack,
    Update,
    Publish,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Refer => "REFER",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Publish => "PUBLISH",
            Method::Extension(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)) {
            return Err(Error::parse(format!("invalid method '{}'", s)));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "REGISTER" => Method::Register,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "REFER" => Method::Refer,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "PUBLISH" => Method::Publish,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// One Via header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: TransportType,
    /// sent-by host; empty until the transport selector fills it in
    pub host: String,
    pub port: Option<u16>,
    pub branch: Option<String>,
    pub rport: bool,
    pub received: Option<String>,
}

impl Via {
    pub fn new(transport: TransportType, host: impl Into<String>, port: Option<u16>, branch: impl Into<String>) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            branch: Some(branch.into()),
            rport: false,
            received: None,
        }
    }

    /// A Via with an empty sent-by, completed at transmission time
    pub fn unfilled(branch: impl Into<String>) -> Self {
        Self::new(TransportType::Unknown, "", None, branch)
    }

    pub fn with_rport(mut self) -> Self {
        self.rport = true;
        self
    }

    /// Whether the branch carries the RFC 3261 magic cookie
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .is_some_and(|b| b.len() > MAGIC_COOKIE.len() && b[..MAGIC_COOKIE.len()].eq_ignore_ascii_case(MAGIC_COOKIE))
    }

    /// The sent-by as `host[:port]`
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// From / To / Contact / Route value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// CSeq header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

/// Warning header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub code: u16,
    pub agent: String,
    pub text: String,
}

/// Request or status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: Uri },
    Response { code: u16, reason: String },
}

/// Identifier of a registered Transaction User
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TuId(pub u32);

impl fmt::Display for TuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tu-{}", self.0)
    }
}

/// A SIP request or response together with its transport metadata
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    pub vias: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contacts: Vec<NameAddr>,
    pub routes: Vec<NameAddr>,
    pub max_forwards: Option<u32>,
    pub retry_after: Option<u32>,
    pub warnings: Vec<Warning>,
    /// Headers the stack does not interpret, in order
    pub headers: Vec<(String, String)>,
    pub body: Bytes,

    /// Where the message came from (wire messages only)
    pub source: Option<Tuple>,
    /// Explicit destination (flow) chosen by the TU
    pub destination: Option<Tuple>,
    /// Overrides Route/Request-URI for DNS resolution
    pub force_target: Option<Uri>,
    /// True when the message arrived from the network
    pub external: bool,
    /// Owning Transaction User
    pub tu: Option<TuId>,
    /// Set when the message parsed but violates request policy
    pub invalid_reason: Option<String>,
}

impl SipMessage {
    /// Create a request with the mandatory headers
    pub fn request(method: Method, uri: Uri, from: NameAddr, to: NameAddr, call_id: impl Into<String>, seq: u32) -> Self {
        Self {
            cseq: CSeq {
                seq,
                method: method.clone(),
            },
            start: StartLine::Request { method, uri },
            vias: Vec::new(),
            from,
            to,
            call_id: call_id.into(),
            contacts: Vec::new(),
            routes: Vec::new(),
            max_forwards: Some(70),
            retry_after: None,
            warnings: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            source: None,
            destination: None,
            force_target: None,
            external: false,
            tu: None,
            invalid_reason: None,
        }
    }

    pub fn with_via(mut self, via: Via) -> Self {
        self.vias.insert(0, via);
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contacts.push(contact);
        self
    }

    pub fn with_tu(mut self, tu: TuId) -> Self {
        self.tu = Some(tu);
        self
    }

    pub fn with_destination(mut self, destination: Tuple) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Mark the message as received from the network
    pub fn received_from(mut self, source: Tuple) -> Self {
        self.source = Some(source);
        self.external = true;
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    /// Method of a request, or the CSeq method of a response
    pub fn method(&self) -> &Method {
        match &self.start {
            StartLine::Request { method, .. } => method,
            StartLine::Response { .. } => &self.cseq.method,
        }
    }

    pub fn request_uri(&self) -> Option<&Uri> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn set_status(&mut self, code: u16, reason: impl Into<String>) {
        self.start = StartLine::Response {
            code,
            reason: reason.into(),
        };
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.vias.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.vias.first_mut()
    }

    /// Transaction identifier of the message.
    ///
    /// RFC 3261 branches are used verbatim. For RFC 2543 peers an identifier
    /// is composed from the dialog identifiers and the top Via sent-by.
    /// Returns `None` when the message has no Via.
    pub fn transaction_id(&self) -> Option<String> {
        let via = self.top_via()?;
        if via.has_rfc3261_branch() {
            return via.branch.clone();
        }
        Some(format!(
            "{}|{}|{}|{}|{}",
            self.call_id,
            self.from.tag.as_deref().unwrap_or_default(),
            self.cseq.seq,
            via.sent_by(),
            via.branch.as_deref().unwrap_or_default()
        ))
    }

    /// One-line summary for logs
    pub fn brief(&self) -> String {
        match &self.start {
            StartLine::Request { method, uri } => {
                format!("{} {} cseq={} call-id={}", method, uri, self.cseq.seq, self.call_id)
            }
            StartLine::Response { code, .. } => {
                format!("{} {} cseq={} call-id={}", code, self.cseq.method, self.cseq.seq, self.call_id)
            }
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.brief())
    }
}
