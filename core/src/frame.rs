use std::collections::VecDeque;
use std::fmt;

/// One opaque frame of a transport message.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The empty delimiter frame separating routing addresses from content.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix.as_bytes())
    }

    /// Uppercase hex rendering, used as the registry key for peer identities.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}"),
            _ => write!(f, "0x{}", self.hex()),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Ordered list of frames making up one transport message.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    frames: VecDeque<Frame>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push_front(&mut self, frame: impl Into<Frame>) {
        self.frames.push_front(frame.into());
    }

    pub fn push_back(&mut self, frame: impl Into<Frame>) {
        self.frames.push_back(frame.into());
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn pop_back(&mut self) -> Option<Frame> {
        self.frames.pop_back()
    }

    pub fn front(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn back(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut Frame> {
        self.frames.back_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Prepends `other` in order, so `other`'s first frame becomes ours.
    pub fn prepend(&mut self, other: Multipart) {
        for frame in other.frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    pub fn append(&mut self, other: Multipart) {
        self.frames.extend(other.frames);
    }

    /// Builder-style push used when assembling wire sequences.
    pub fn with(mut self, frame: impl Into<Frame>) -> Self {
        self.push_back(frame);
        self
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames.into()
    }
}

impl fmt::Debug for Multipart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames.iter()).finish()
    }
}

impl FromIterator<Frame> for Multipart {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Multipart {
    type Item = Frame;
    type IntoIter = std::collections::vec_deque::IntoIter<Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl From<muf_proto::Multipart> for Multipart {
    fn from(msg: muf_proto::Multipart) -> Self {
        msg.frames.into_iter().map(Frame::from).collect()
    }
}

impl From<Multipart> for muf_proto::Multipart {
    fn from(msg: Multipart) -> Self {
        muf_proto::Multipart {
            frames: msg.frames.into_iter().map(Frame::into_bytes).collect(),
        }
    }
}
