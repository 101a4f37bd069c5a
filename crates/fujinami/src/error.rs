use rfc5321::EnhancedStatusCode;
use thiserror::Error;

/// A reply to send back to the SMTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub enhanced: Option<EnhancedStatusCode>,
    pub message: String,
    /// Close the connection after sending the reply
    pub close: bool,
}

impl SmtpReply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: None,
            message: message.into(),
            close: false,
        }
    }

    pub fn enhanced(mut self, class: u8, subject: u16, detail: u16) -> Self {
        self.enhanced.replace(EnhancedStatusCode::new(class, subject, detail));
        self
    }

    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Every way a transaction can be refused. Each variant maps to
/// exactly one SMTP reply.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("<{0}>... User unknown, not local address.")]
    PolicyDenied(String),

    #[error("cannot find a mail server for <{0}>.")]
    RecipientUnresolvable(String),

    #[error("Bad sequence of commands")]
    BadSequence,

    #[error("Error: nested MAIL command")]
    NestedMail,

    #[error("Error: need MAIL command")]
    NeedMail,

    #[error("Error: need RCPT command")]
    NeedRcpt,

    #[error("Error: Do not Empty")]
    EmptySender,

    #[error("Error: You are in too many blacklists.")]
    ReputationRejected { positive_count: usize },

    #[error("{0}")]
    MessageInvalid(String),

    #[error("Message exceeds fixed maximum message size")]
    MessageTooBig,

    #[error("{0}")]
    Transient(String),
}

impl RelayError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn reply(&self) -> SmtpReply {
        let message = self.to_string();
        match self {
            Self::PolicyDenied(_) => SmtpReply::new(553, message).enhanced(5, 3, 0).closing(),
            Self::RecipientUnresolvable(_) => SmtpReply::new(550, message).enhanced(5, 5, 0),
            Self::BadSequence => SmtpReply::new(503, message).enhanced(5, 0, 3),
            Self::NestedMail | Self::NeedMail | Self::NeedRcpt | Self::MessageInvalid(_) => {
                SmtpReply::new(503, message).enhanced(5, 5, 1)
            }
            Self::EmptySender => SmtpReply::new(501, message).enhanced(5, 0, 1).closing(),
            Self::ReputationRejected { .. } => {
                SmtpReply::new(550, message).enhanced(5, 7, 0).closing()
            }
            Self::MessageTooBig => SmtpReply::new(552, message).enhanced(5, 3, 4),
            Self::Transient(_) => SmtpReply::new(451, message).enhanced(4, 5, 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn replies() {
        let reply = RelayError::PolicyDenied("bob@example.com".to_string()).reply();
        assert_equal!(reply.code, 553);
        assert_equal!(reply.enhanced, Some(EnhancedStatusCode::new(5, 3, 0)));
        assert_equal!(
            reply.message,
            "<bob@example.com>... User unknown, not local address."
        );
        assert!(reply.close);

        let reply = RelayError::ReputationRejected { positive_count: 9 }.reply();
        assert_equal!((reply.code, reply.close), (550, true));

        let reply = RelayError::transient("connection refused").reply();
        assert_equal!(reply.code, 451);
        assert_equal!(reply.enhanced, Some(EnhancedStatusCode::new(4, 5, 1)));
        assert!(!reply.close);

        assert_equal!(RelayError::NeedRcpt.reply().code, 503);
        assert_equal!(
            RelayError::BadSequence.reply().enhanced,
            Some(EnhancedStatusCode::new(5, 0, 3))
        );
    }
}
