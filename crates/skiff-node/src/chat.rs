//! Chat line payload: the author's name as a [`Guid`] followed by UTF-8
//! text. The host relays lines unchanged, so the author survives the hop.

use bytes::{BufMut, Bytes, BytesMut};
use skiff_transport::connection::GUID_LEN;
use skiff_transport::Guid;

/// User message type carrying chat lines.
pub const CHAT: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub author: Guid,
    pub text: String,
}

impl ChatLine {
    pub fn new(author: &str, text: &str) -> Self {
        ChatLine {
            author: Guid::from_name(author),
            text: text.to_owned(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(GUID_LEN + self.text.len());
        buf.put_slice(self.author.as_bytes());
        buf.put_slice(self.text.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Option<Self> {
        let mut buf = payload.clone();
        let author = Guid::decode(&mut buf)?;
        let text = String::from_utf8_lossy(&buf).into_owned();
        Some(ChatLine { author, text })
    }
}
