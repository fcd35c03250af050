use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Connection mode of the tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    /// Named tunnel driven by a JSON credentials file
    Fixed,
    /// Named tunnel driven by a connector token
    Token,
    /// Anonymous quick tunnel with a generated hostname
    Temporary,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9a-z=]{120,250}$").expect("static regex"))
}

impl TunnelType {
    /// Classifies the tunnel credentials.
    pub fn analyze(auth: &str) -> Self {
        if auth.is_empty() {
            return TunnelType::Temporary;
        }

        if auth.contains("TunnelSecret") {
            return TunnelType::Fixed;
        }

        if token_pattern().is_match(auth) {
            return TunnelType::Token;
        }

        TunnelType::Temporary
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Fixed => "fixed",
            TunnelType::Token => "token",
            TunnelType::Temporary => "temporary",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_auth_is_temporary() {
        assert_eq!(TunnelType::analyze(""), TunnelType::Temporary);
    }

    #[test]
    fn test_json_secret_is_fixed() {
        let auth = r#"{"TunnelSecret":"test","TunnelID":"test"}"#;
        assert_eq!(TunnelType::analyze(auth), TunnelType::Fixed);
    }

    #[test]
    fn test_token_length_bounds() {
        let token = "A".repeat(160);
        assert_eq!(TunnelType::analyze(&token), TunnelType::Token);

        // too short for a connector token
        let short = "AQEDAHh6eXq1tbW2t7i5vL3AwcHCw8TFxsfIycrLzM3Oz9DR0g==";
        assert_eq!(TunnelType::analyze(short), TunnelType::Temporary);

        let with_symbols = format!("{}-{}", "a".repeat(80), "b".repeat(80));
        assert_eq!(TunnelType::analyze(&with_symbols), TunnelType::Temporary);
    }
}
