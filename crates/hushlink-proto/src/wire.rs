//! Prefix multiplexing for decrypted text frames.
//!
//! Classification is a sequence of exact `starts_with` checks, case
//! sensitive, in a fixed order. Anything that matches no prefix is plain
//! chat text — unknown future prefixes therefore degrade to visible chat
//! rather than being dropped silently.

use crate::error::ProtocolError;

/// Prefix for group invitation control messages.
pub const GROUP_INVITE_PREFIX: &str = "ginv:";

/// Prefix for group data envelopes.
pub const GROUP_DATA_PREFIX: &str = "gmsg:";

/// Prefix for group sync control messages (clock summaries, gap repair).
pub const GROUP_SYNC_PREFIX: &str = "gsyn:";

/// Prefix for typing indicator signals.
pub const TYPING_PREFIX: &str = "typ:";

/// Prefix for delivery receipts.
pub const RECEIPT_PREFIX: &str = "rcpt:";

/// Kind of delivery receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    /// Message reached the peer's device (`d`).
    Delivered,
    /// Message was displayed to the user (`r`).
    Read,
}

impl ReceiptKind {
    /// Wire representation of this receipt kind.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Delivered => "d",
            Self::Read => "r",
        }
    }

    /// Parse the wire representation. `None` for unknown codes.
    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "d" => Some(Self::Delivered),
            "r" => Some(Self::Read),
            _ => None,
        }
    }
}

/// A classified text frame.
///
/// Borrows from the input; payloads are the raw text after the prefix and
/// still need JSON decoding where applicable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireText<'a> {
    /// `ginv:` group invitation payload (JSON).
    GroupInvite(&'a str),
    /// `gmsg:` group data envelope payload (JSON).
    GroupData(&'a str),
    /// `gsyn:` group sync control payload (JSON).
    GroupSync(&'a str),
    /// `typ:` typing indicator; `true` when typing started.
    Typing(bool),
    /// `rcpt:` delivery receipt.
    Receipt(ReceiptKind),
    /// No prefix matched: plain chat text.
    Chat(&'a str),
}

/// Classify a decrypted text frame by wire prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] when a prefix matches but
/// its payload is invalid (e.g. `typ:x`). A matched prefix never falls
/// back to chat.
pub fn classify(text: &str) -> Result<WireText<'_>, ProtocolError> {
    if let Some(rest) = text.strip_prefix(GROUP_INVITE_PREFIX) {
        return Ok(WireText::GroupInvite(rest));
    }
    if let Some(rest) = text.strip_prefix(GROUP_DATA_PREFIX) {
        return Ok(WireText::GroupData(rest));
    }
    if let Some(rest) = text.strip_prefix(GROUP_SYNC_PREFIX) {
        return Ok(WireText::GroupSync(rest));
    }
    if let Some(rest) = text.strip_prefix(TYPING_PREFIX) {
        return match rest {
            "1" => Ok(WireText::Typing(true)),
            "0" => Ok(WireText::Typing(false)),
            other => Err(ProtocolError::MalformedPayload {
                kind: "typing",
                reason: format!("expected 0 or 1, got {other:?}"),
            }),
        };
    }
    if let Some(rest) = text.strip_prefix(RECEIPT_PREFIX) {
        return ReceiptKind::from_wire(rest).map(WireText::Receipt).ok_or_else(|| {
            ProtocolError::MalformedPayload {
                kind: "receipt",
                reason: format!("unknown receipt code {rest:?}"),
            }
        });
    }
    Ok(WireText::Chat(text))
}

/// Encode a typing indicator frame.
pub fn typing_frame(typing: bool) -> String {
    format!("{TYPING_PREFIX}{}", u8::from(typing))
}

/// Encode a delivery receipt frame.
pub fn receipt_frame(kind: ReceiptKind) -> String {
    format!("{RECEIPT_PREFIX}{}", kind.as_wire())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_frames_classify() {
        assert_eq!(classify("typ:1").unwrap(), WireText::Typing(true));
        assert_eq!(classify("typ:0").unwrap(), WireText::Typing(false));
    }

    #[test]
    fn receipt_frames_classify() {
        assert_eq!(classify("rcpt:d").unwrap(), WireText::Receipt(ReceiptKind::Delivered));
        assert_eq!(classify("rcpt:r").unwrap(), WireText::Receipt(ReceiptKind::Read));
    }

    #[test]
    fn group_frames_classify() {
        assert_eq!(classify("ginv:{\"x\":1}").unwrap(), WireText::GroupInvite("{\"x\":1}"));
        assert_eq!(classify("gmsg:{\"x\":1}").unwrap(), WireText::GroupData("{\"x\":1}"));
        assert_eq!(classify("gsyn:{\"x\":1}").unwrap(), WireText::GroupSync("{\"x\":1}"));
    }

    #[test]
    fn plain_text_falls_back_to_chat() {
        assert_eq!(classify("hello there").unwrap(), WireText::Chat("hello there"));
        // Prefix-like text that doesn't start-match stays chat.
        assert_eq!(classify("say typ:1 to me").unwrap(), WireText::Chat("say typ:1 to me"));
    }

    #[test]
    fn prefixes_are_case_sensitive() {
        assert_eq!(classify("TYP:1").unwrap(), WireText::Chat("TYP:1"));
        assert_eq!(classify("Rcpt:d").unwrap(), WireText::Chat("Rcpt:d"));
        assert_eq!(classify("GINV:x").unwrap(), WireText::Chat("GINV:x"));
    }

    #[test]
    fn matched_prefix_with_bad_payload_is_an_error_not_chat() {
        assert!(classify("typ:2").is_err());
        assert!(classify("typ:").is_err());
        assert!(classify("rcpt:z").is_err());
    }

    #[test]
    fn encode_round_trips() {
        assert_eq!(classify(&typing_frame(true)).unwrap(), WireText::Typing(true));
        assert_eq!(classify(&typing_frame(false)).unwrap(), WireText::Typing(false));
        assert_eq!(
            classify(&receipt_frame(ReceiptKind::Read)).unwrap(),
            WireText::Receipt(ReceiptKind::Read)
        );
    }

    #[test]
    fn group_invite_not_intercepted_by_other_handlers() {
        // ginv: payloads may themselves contain typ:/rcpt: text.
        let frame = "ginv:typ:1";
        assert_eq!(classify(frame).unwrap(), WireText::GroupInvite("typ:1"));
    }

    #[test]
    fn empty_text_is_chat() {
        assert_eq!(classify("").unwrap(), WireText::Chat(""));
    }
}
