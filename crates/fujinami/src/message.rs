//! Header level view of a message, plus the Message-ID encoding
//! used to attribute replies to the external party they answer.
use data_encoding::BASE64;
use thiserror::Error;

const THREAD_PREFIX: &str = "fujinami+";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("{0} Not Found")]
    MissingHeader(&'static str),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    /// Raw value; folded continuation lines are kept, joined by CRLF
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The value with folding removed
    pub fn unfolded(&self) -> String {
        self.value.replace("\r\n", "")
    }

    fn is(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
    }
}

/// Ordered header list; the order is the wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn get(&self, key: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.is(key))
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.is(key))
    }

    /// Changes the value of the first header named `key`.
    /// Returns false if there is no such header.
    pub fn replace(&mut self, key: &str, value: impl Into<String>) -> bool {
        match self.0.iter_mut().find(|h| h.is(key)) {
            Some(header) => {
                header.value = value.into();
                true
            }
            None => false,
        }
    }

    pub fn replace_all(&mut self, key: &str, value: &str) -> usize {
        let mut count = 0;
        for header in self.0.iter_mut().filter(|h| h.is(key)) {
            header.value = value.to_string();
            count += 1;
        }
        count
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Header> {
        self.0.iter_mut()
    }

    pub fn prepend(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, Header::new(key, value));
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for header in &self.0 {
            out.extend_from_slice(header.key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.trim_end().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// A message split into its parsed header block and untouched body
#[derive(Debug, Clone)]
pub struct Mail {
    pub headers: Headers,
    body: Vec<u8>,
}

fn split_lines(data: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut lines = vec![];
    let mut pos = 0;
    while pos < data.len() {
        let end = data[pos..].iter().position(|&b| b == b'\n').map(|i| pos + i);
        let (line, next) = match end {
            Some(end) => (&data[pos..end], end + 1),
            None => (&data[pos..], data.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return (lines, &data[next..]);
        }
        lines.push(line);
        pos = next;
    }
    (lines, &[])
}

impl Mail {
    pub fn parse(data: &[u8]) -> Result<Self, MessageError> {
        let (lines, body) = split_lines(data);
        let mut headers = Headers::default();

        for line in lines {
            let line = String::from_utf8_lossy(line);
            if line.starts_with([' ', '\t']) {
                match headers.0.last_mut() {
                    Some(current) => {
                        current.value.push_str("\r\n");
                        current.value.push_str(&line);
                    }
                    None => return Err(MessageError::MalformedHeader(line.to_string())),
                }
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(MessageError::MalformedHeader(line.to_string()));
            };
            headers.push(key.trim_end(), value.trim_start());
        }

        Ok(Self {
            headers,
            body: body.to_vec(),
        })
    }

    pub fn check(&self) -> Result<(), MessageError> {
        for name in ["Subject", "From", "To"] {
            if self.headers.get(name).is_none() {
                return Err(MessageError::MissingHeader(name));
            }
        }
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 1024);
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Extracts the address from a header value such as
/// `"Bob Smith" <bob@example.com>` by taking the last
/// space separated token and stripping angle brackets.
pub fn parse_address(value: &str) -> String {
    let value = value.replace("\r\n", " ");
    value
        .trim()
        .rsplit(' ')
        .next()
        .unwrap_or("")
        .trim_matches(|c| c == ' ' || c == '<' || c == '>')
        .to_string()
}

/// Splits an address into local part and domain. Returns None if
/// there is no `@` or either side is empty.
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}

/// `uuid@host`, without angle brackets
pub fn new_message_id(host: &str) -> String {
    format!("{}@{host}", uuid::Uuid::new_v4())
}

/// Wraps `original_id` so that a reply quoting it can be
/// attributed back to `recipient`.
pub fn encode_thread_id(recipient: &str, original_id: &str) -> String {
    let original_id = original_id.trim().trim_matches(|c| c == '<' || c == '>');
    format!(
        "<{THREAD_PREFIX}{}+{original_id}>",
        BASE64.encode(recipient.as_bytes())
    )
}

/// The inverse of [encode_thread_id]. Returns the recipient and the
/// restored original id (with angle brackets), or None when `id`
/// was not produced by us.
///
/// Standard base64 may itself contain `+`, so every split position
/// is tried from the left until the prefix decodes to an address.
pub fn decode_thread_id(id: &str) -> Option<(String, String)> {
    let id = id.trim().trim_matches(|c| c == '<' || c == '>');
    let rest = id.strip_prefix(THREAD_PREFIX)?;

    for (idx, _) in rest.match_indices('+') {
        let (encoded, original) = (&rest[..idx], &rest[idx + 1..]);
        if encoded.is_empty() || original.is_empty() {
            continue;
        }
        let Ok(decoded) = BASE64.decode(encoded.as_bytes()) else {
            continue;
        };
        let Ok(recipient) = String::from_utf8(decoded) else {
            continue;
        };
        if split_address(&recipient).is_some() {
            return Some((recipient, format!("<{original}>")));
        }
    }
    None
}

/// Decodes every thread id in an `In-Reply-To` or `References`
/// value. Returns the rewritten value and the first recipient found.
pub fn decode_thread_header(value: &str) -> Option<(String, String)> {
    let mut recipient = None;
    let ids: Vec<String> = value
        .replace("\r\n", " ")
        .split_whitespace()
        .map(|token| match decode_thread_id(token) {
            Some((addr, original)) => {
                recipient.get_or_insert(addr);
                original
            }
            None => token.to_string(),
        })
        .collect();
    recipient.map(|r| (r, ids.join(" ")))
}
