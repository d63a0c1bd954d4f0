//! SMTP reply lines.

/// A numeric reply with one or more text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Multi-line reply (`250-first`, …, `250 last`).
    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Wire form, CRLF-terminated.
    pub fn format(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        let mut out = String::new();
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{sep}{line}\r\n", self.code));
        }
        out
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        assert_eq!(Reply::ok().format(), "250 OK\r\n");
    }

    #[test]
    fn test_multiline() {
        let reply = Reply::multiline(250, vec!["host".into(), "SIZE 10".into(), "8BITMIME".into()]);
        assert_eq!(reply.format(), "250-host\r\n250-SIZE 10\r\n250 8BITMIME\r\n");
    }

    #[test]
    fn test_positive() {
        assert!(Reply::new(354, "go").is_positive());
        assert!(!Reply::new(451, "later").is_positive());
    }
}
