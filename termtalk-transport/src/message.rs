//! Zeroizing message wrapper.
//!
//! Received plaintext is short-lived. Callers opt in to copying it.

use std::fmt;

use zeroize::Zeroizing;

/// A received, authenticated text message that zeroizes on drop.
///
/// Not `Clone`. Use [`Message::into_string`] to keep the text.
pub struct Message(Zeroizing<String>);

impl Message {
    /// Wrap already-authenticated text.
    pub(crate) fn new(text: String) -> Self {
        Self(Zeroizing::new(text))
    }

    /// Message text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Message length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message is empty. Never true for a received message.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy the text out. The wrapped buffer is zeroized on return.
    pub fn into_string(self) -> String {
        self.0.as_str().to_owned()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let msg = Message::new("hello world".to_string());
        assert_eq!(msg.as_str(), "hello world");
        assert_eq!(msg.len(), 11);
        assert!(!msg.is_empty());
        assert_eq!(msg.into_string(), "hello world");
    }

    #[test]
    fn test_debug_hides_text() {
        let msg = Message::new("secret message".to_string());
        let rendered = format!("{:?}", msg);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("14"));
    }
}
