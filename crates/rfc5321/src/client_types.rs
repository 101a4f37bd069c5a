use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_ehlo_timeout",
        with = "humantime_serde"
    )]
    pub ehlo_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_mail_from_timeout",
        with = "humantime_serde"
    )]
    pub mail_from_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rcpt_to_timeout",
        with = "humantime_serde"
    )]
    pub rcpt_to_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_data_timeout",
        with = "humantime_serde"
    )]
    pub data_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_data_dot_timeout",
        with = "humantime_serde"
    )]
    pub data_dot_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_rset_timeout",
        with = "humantime_serde"
    )]
    pub rset_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_idle_timeout",
        with = "humantime_serde"
    )]
    pub idle_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_starttls_timeout",
        with = "humantime_serde"
    )]
    pub starttls_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            ehlo_timeout: Self::default_ehlo_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            data_timeout: Self::default_data_timeout(),
            data_dot_timeout: Self::default_data_dot_timeout(),
            rset_timeout: Self::default_rset_timeout(),
            idle_timeout: Self::default_idle_timeout(),
            starttls_timeout: Self::default_starttls_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_ehlo_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_dot_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rset_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_starttls_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(20);
        Self {
            connect_timeout: short,
            ehlo_timeout: short,
            mail_from_timeout: short,
            rcpt_to_timeout: short,
            data_timeout: short,
            data_dot_timeout: short,
            rset_timeout: short,
            idle_timeout: short,
            starttls_timeout: short,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatusCode {
    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

pub(crate) fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((EnhancedStatusCode::new(class, subject, detail), remainder))
}

fn remove_line_break(data: &str) -> String {
    let mut normalized = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' => normalized.push(' '),
            c => normalized.push(c),
        }
    }
    normalized
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        if line.len() < 4 || !line.is_char_boundary(4) {
            return None;
        }

        let is_final = match line.as_bytes()[3] {
            b' ' => true,
            b'-' => false,
            _ => return None,
        };
        let code = line[0..3].parse::<u16>().ok()?;

        Some(Self {
            code,
            is_final,
            content: &line[4..],
        })
    }
}

/// Accumulates the lines of a possibly multi-line reply.
/// Continuation lines that repeat the enhanced status code
/// have it stripped so that `content` reads naturally.
pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> bool {
        if parsed.code != self.code {
            return false;
        }

        self.content.push('\n');

        let content = match &self.enhanced_code {
            Some(enh) => parsed
                .content
                .strip_prefix(&format!("{enh} "))
                .unwrap_or(parsed.content),
            None => parsed.content,
        };

        self.content.push_str(content);
        true
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
            command,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn remove_crlf() {
        assert_equal!(remove_line_break("hello\r\nthere\r\n"), "hello there ");
        assert_equal!(remove_line_break("hello\r"), "hello ");
        assert_equal!(remove_line_break("hello\nthere\r\n"), "hello there ");
    }

    #[test]
    fn response_parsing() {
        assert_equal!(
            parse_enhanced_status_code("2.0.1 w00t"),
            Some((EnhancedStatusCode::new(2, 0, 1), "w00t"))
        );
        assert_equal!(parse_enhanced_status_code("3.0.0 w00t"), None);
        assert_equal!(parse_enhanced_status_code("2.0.0.1 w00t"), None);
    }

    #[test]
    fn response_line_parsing() {
        assert_equal!(
            ResponseLine::parse("220 woot"),
            Some(ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            })
        );
        assert_equal!(
            ResponseLine::parse("220-woot"),
            Some(ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            })
        );
        assert_equal!(ResponseLine::parse("220_woot"), None);
        assert_equal!(ResponseLine::parse("not really"), None);
    }

    #[test]
    fn multi_line_builder() {
        let first = ResponseLine::parse("250-5.1.0 first").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        assert!(builder.add_line(&ResponseLine::parse("250 5.1.0 second").unwrap()));
        assert!(!builder.add_line(&ResponseLine::parse("251 other").unwrap()));
        let response = builder.build(None);
        assert_equal!(response.content, "first\nsecond");
        assert_equal!(
            response.to_single_line(),
            "250 5.1.0 first second".to_string()
        );
    }
}
