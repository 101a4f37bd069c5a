use crate::client_types::SmtpClientTimeouts;
use std::time::Duration;

/// A single SMTP (or LMTP) command line.
///
/// Addresses are carried as the raw text found between the angle
/// brackets; interpretation of their local part and domain is left
/// to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    Lhlo(String),
    MailFrom {
        address: String,
        parameters: Vec<String>,
    },
    RcptTo {
        address: String,
        parameters: Vec<String>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    Noop(Option<String>),
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
    Unknown(String),
}

fn prefix_match(line: &str, candidate: &str) -> bool {
    line.len() >= candidate.len()
        && line.is_char_boundary(candidate.len())
        && line[..candidate.len()].eq_ignore_ascii_case(candidate)
}

/// Splits `<address> PARAM=VALUE ...` into the address and the
/// trailing ESMTP parameters.
fn extract_envelope(text: &str) -> Result<(String, Vec<String>), String> {
    // Some clients send "MAIL FROM: <addr>"
    let text = text.trim_start();
    if !text.starts_with('<') {
        return Err(format!("expected <: {text:?}"));
    }
    let rangle = text
        .find('>')
        .ok_or_else(|| format!("expected >: {text:?}"))?;

    let address = text[1..rangle].trim().to_string();
    let parameters = text[rangle + 1..]
        .split_ascii_whitespace()
        .map(|p| p.to_string())
        .collect();

    Ok((address, parameters))
}

fn argument(line: &str, verb_len: usize) -> Result<String, String> {
    let arg = line[verb_len..].trim();
    if arg.is_empty() {
        return Err(format!("{} requires an argument", &line[..verb_len].trim()));
    }
    Ok(arg.to_string())
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop(None)
        } else if prefix_match(line, "NOOP ") {
            Self::Noop(Some(line[5..].to_string()))
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(argument(line, 5)?)
        } else if prefix_match(line, "HELO ") {
            Self::Helo(argument(line, 5)?)
        } else if prefix_match(line, "LHLO ") {
            Self::Lhlo(argument(line, 5)?)
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, parameters) = extract_envelope(&line[10..])?;
            Self::MailFrom {
                address,
                parameters,
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (address, parameters) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                return Err("Null sender not permitted as a recipient".to_string());
            }
            Self::RcptTo {
                address,
                parameters,
            }
        } else if prefix_match(line, "AUTH ") {
            let mut fields = line[5..].split_ascii_whitespace();
            let sasl_mech = fields
                .next()
                .ok_or_else(|| "AUTH requires a mechanism".to_string())?
                .to_ascii_uppercase();
            let initial_response = fields.next().map(|s| s.to_string());
            Self::Auth {
                sasl_mech,
                initial_response,
            }
        } else {
            Self::Unknown(line.to_string())
        })
    }

    pub fn encode(&self) -> String {
        fn with_params(verb: &str, address: &str, parameters: &[String]) -> String {
            let mut params = String::new();
            for p in parameters {
                params.push(' ');
                params.push_str(p);
            }
            format!("{verb}<{address}>{params}\r\n")
        }

        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::Lhlo(domain) => format!("LHLO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => with_params("MAIL FROM:", address, parameters),
            Self::RcptTo {
                address,
                parameters,
            } => with_params("RCPT TO:", address, parameters),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
            Self::Unknown(line) => format!("{line}\r\n"),
        }
    }

    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) | Self::Lhlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit | Self::Noop(_) | Self::Auth { .. } | Self::Unknown(_) => {
                timeouts.idle_timeout
            }
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
