//! Email address lists from `From:`/`To:` style headers (RFC 5322 §3.4).

use serde::Serialize;

use crate::parser::header::decode_encoded_words;

/// A mailbox: optional display name plus the bare address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    /// Parse a comma-separated address list.
    ///
    /// Accepts `a@b.c`, `<a@b.c>`, `Name <a@b.c>`, `"Last, First" <a@b.c>`
    /// and encoded-word display names. Group syntax (`team: a@b.c;`) is
    /// flattened. Entries without an address are skipped.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for ch in raw.chars() {
            match ch {
                '"' if !in_angle => {
                    in_quotes = !in_quotes;
                    current.push(ch);
                }
                '<' if !in_quotes => {
                    in_angle = true;
                    current.push(ch);
                }
                '>' if !in_quotes => {
                    in_angle = false;
                    current.push(ch);
                }
                ':' if !in_quotes && !in_angle => current.clear(),
                ',' | ';' if !in_quotes && !in_angle => {
                    out.extend(Self::parse_one(&current));
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        out.extend(Self::parse_one(&current));
        out
    }

    fn parse_one(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (name, address) = match (trimmed.rfind('<'), trimmed.rfind('>')) {
            (Some(open), Some(close)) if close > open => {
                (&trimmed[..open], trimmed[open + 1..close].trim())
            }
            _ => ("", trimmed),
        };
        if address.is_empty() {
            return None;
        }

        let name = name.trim().trim_matches('"').trim();
        Some(Self {
            name: (!name.is_empty()).then(|| decode_encoded_words(name)),
            address: address.to_string(),
        })
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_and_angle() {
        let list = EmailAddress::parse_list("a@b.com, <c@d.com>");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "a@b.com");
        assert_eq!(list[1].address, "c@d.com");
        assert!(list[1].name.is_none());
    }

    #[test]
    fn test_quoted_comma_in_name() {
        let list = EmailAddress::parse_list("\"Last, First\" <a@b.com>, other@c.com");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name.as_deref(), Some("Last, First"));
        assert_eq!(list[1].address, "other@c.com");
    }

    #[test]
    fn test_encoded_display_name() {
        let list = EmailAddress::parse_list("=?UTF-8?B?Sm9zw6k=?= <jose@example.com>");
        assert_eq!(list[0].name.as_deref(), Some("José"));
        assert_eq!(list[0].to_string(), "José <jose@example.com>");
    }

    #[test]
    fn test_group_syntax() {
        let list = EmailAddress::parse_list("team: a@b.com, c@d.com;");
        let addrs: Vec<_> = list.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addrs, vec!["a@b.com", "c@d.com"]);
    }

    #[test]
    fn test_empty() {
        assert!(EmailAddress::parse_list("  ").is_empty());
    }
}
