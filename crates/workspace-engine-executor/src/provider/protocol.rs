//! Provider CLI stream protocol.
//!
//! The provider prints one JSON object per line. Lines that do not parse
//! as a known event are dropped: the CLI interleaves diagnostics with
//! protocol output.

use serde::Deserialize;

/// An event emitted by the provider CLI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Upstream session started; the CLI's own `system` init event has the same shape.
    #[serde(alias = "system")]
    Session {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Incremental response text.
    #[serde(alias = "content_fragment", alias = "content-fragment")]
    Content {
        #[serde(default)]
        text: String,
    },
    /// Final event of a turn.
    Result {
        #[serde(default, alias = "result")]
        text: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Parse one output line, or `None` if it is not a protocol event.
#[must_use]
pub fn parse_line(line: &str) -> Option<ProviderEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::trace!(error = %e, "Dropping non-protocol line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_documented_kinds() {
        assert_eq!(
            parse_line(r#"{"type":"session","session_id":"s1"}"#),
            Some(ProviderEvent::Session {
                session_id: Some("s1".into())
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"content","text":"A"}"#),
            Some(ProviderEvent::Content { text: "A".into() })
        );
        assert_eq!(
            parse_line(r#"{"type":"result","text":"B"}"#),
            Some(ProviderEvent::Result {
                text: Some("B".into()),
                session_id: None
            })
        );
    }

    #[test]
    fn test_parses_cli_spelling() {
        assert_eq!(
            parse_line(r#"{"type":"system","subtype":"init","session_id":"s2","tools":[]}"#),
            Some(ProviderEvent::Session {
                session_id: Some("s2".into())
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"result","subtype":"success","result":"done","session_id":"s2"}"#),
            Some(ProviderEvent::Result {
                text: Some("done".into()),
                session_id: Some("s2".into())
            })
        );
    }

    #[test]
    fn test_drops_garbage() {
        assert_eq!(parse_line("garbage"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line(r#"{"type":"assistant","message":{}}"#), None);
        assert_eq!(parse_line(r#"{"text":"no type"}"#), None);
    }
}
