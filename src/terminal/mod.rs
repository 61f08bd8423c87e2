//! Terminal bridge: pty-backed shells relayed over a WebSocket.

pub mod bridge;
pub mod pty;

pub use bridge::{
    run, CloseReason, PtyEvent, PtyProcess, RelayContext, SessionState, SessionTeardown,
    TerminalSession,
};
pub use pty::{attach, NativePty};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Inclusive bounds every terminal size is clamped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionBounds {
    pub min_cols: u16,
    pub max_cols: u16,
    pub min_rows: u16,
    pub max_rows: u16,
}

impl Default for DimensionBounds {
    fn default() -> Self {
        Self {
            min_cols: 20,
            max_cols: 500,
            min_rows: 5,
            max_rows: 100,
        }
    }
}

impl DimensionBounds {
    /// Clamp arbitrary requested values. Never fails.
    pub fn clamp(&self, cols: i64, rows: i64) -> Dimensions {
        Dimensions {
            cols: cols.clamp(self.min_cols as i64, self.max_cols as i64) as u16,
            rows: rows.clamp(self.min_rows as i64, self.max_rows as i64) as u16,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min_cols > 0 && self.min_rows > 0 && self.min_cols <= self.max_cols && self.min_rows <= self.max_rows
    }
}

/// Read `cols` and `rows` from query parameters.
///
/// A missing or non-numeric value falls back to 80x24 for that dimension;
/// numbers too large for an integer saturate. The result is always within
/// `bounds`.
pub fn parse_requested_dimensions(query: &HashMap<String, String>, bounds: &DimensionBounds) -> Dimensions {
    let default = Dimensions::default();
    let cols = query
        .get("cols")
        .and_then(|v| parse_saturating(v))
        .unwrap_or(default.cols as i64);
    let rows = query
        .get("rows")
        .and_then(|v| parse_saturating(v))
        .unwrap_or(default.rows as i64);
    bounds.clamp(cols, rows)
}

fn parse_saturating(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return Some(if negative { i64::MIN } else { i64::MAX });
    }
    None
}

/// In-band control message from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Requested size, not yet clamped.
    Resize { cols: i64, rows: i64 },
}

/// One inbound client frame, classified exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    Control(ControlFrame),
    Literal(&'a [u8]),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireControl {
    Resize { cols: Option<i64>, rows: Option<i64> },
}

impl<'a> InboundFrame<'a> {
    /// Classify `bytes`. Only a JSON object `{"type":"resize",...}` with both
    /// dimensions present and non-zero is a control frame; everything else is
    /// keystrokes.
    pub fn decode(bytes: &'a [u8]) -> Self {
        // Typed input almost never starts with '{'; skip the parser for it.
        let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
        if first != Some(&b'{') {
            return InboundFrame::Literal(bytes);
        }
        match serde_json::from_slice::<WireControl>(bytes) {
            Ok(WireControl::Resize {
                cols: Some(cols),
                rows: Some(rows),
            }) if cols != 0 && rows != 0 => InboundFrame::Control(ControlFrame::Resize { cols, rows }),
            _ => InboundFrame::Literal(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_dimensions_default_when_missing_or_garbage() {
        let b = DimensionBounds::default();
        assert_eq!(parse_requested_dimensions(&query(&[]), &b), Dimensions { cols: 80, rows: 24 });
        assert_eq!(
            parse_requested_dimensions(&query(&[("cols", "wide"), ("rows", "")]), &b),
            Dimensions { cols: 80, rows: 24 }
        );
        assert_eq!(
            parse_requested_dimensions(&query(&[("cols", "120"), ("rows", "1e3")]), &b),
            Dimensions { cols: 120, rows: 24 }
        );
    }

    #[test]
    fn test_dimensions_clamped() {
        let b = DimensionBounds::default();
        assert_eq!(
            parse_requested_dimensions(&query(&[("cols", "5"), ("rows", "1000")]), &b),
            Dimensions { cols: 20, rows: 100 }
        );
        assert_eq!(
            parse_requested_dimensions(&query(&[("cols", "-40"), ("rows", "0")]), &b),
            Dimensions { cols: 20, rows: 5 }
        );
        assert_eq!(
            parse_requested_dimensions(
                &query(&[("cols", "99999999999999999999999"), ("rows", "-99999999999999999999999")]),
                &b
            ),
            Dimensions { cols: 500, rows: 5 }
        );
    }

    #[test]
    fn test_clamp_covers_whole_range() {
        let b = DimensionBounds::default();
        for v in [i64::MIN, -1, 0, 19, 20, 77, 500, 501, i64::MAX] {
            let d = b.clamp(v, v);
            assert!((20..=500).contains(&d.cols), "cols {} from {}", d.cols, v);
            assert!((5..=100).contains(&d.rows), "rows {} from {}", d.rows, v);
        }
    }

    #[test]
    fn test_resize_frame_is_control() {
        assert_eq!(
            InboundFrame::decode(br#"{"type":"resize","cols":100,"rows":40}"#),
            InboundFrame::Control(ControlFrame::Resize { cols: 100, rows: 40 })
        );
        assert_eq!(
            InboundFrame::decode(br#" {"rows":2000,"type":"resize","cols":-3,"extra":true}"#),
            InboundFrame::Control(ControlFrame::Resize { cols: -3, rows: 2000 })
        );
    }

    #[test]
    fn test_everything_else_is_literal() {
        for input in [
            &b"ls -la\r"[..],
            b"{not json",
            br#"{"type":"resize","cols":100}"#,
            br#"{"type":"resize","cols":0,"rows":40}"#,
            br#"{"type":"ping"}"#,
            br#"{"cols":100,"rows":40}"#,
            br#"{"type":"resize","cols":"100","rows":40}"#,
            b"\x1b[A",
            b"",
        ] {
            assert_eq!(InboundFrame::decode(input), InboundFrame::Literal(input));
        }
    }
}
