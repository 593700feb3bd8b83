use crate::frame::{Frame, Multipart};

/// Routing envelope: a stack of return-address frames around a message body.
///
/// The broker wraps every client request with the client's transport
/// identity before handing it to a worker. The worker echoes the envelope
/// back untouched in its reply, and the broker unwraps it to find the
/// client again. Neither endpoint ever learns the other's address.
///
/// On the wire each address is followed by an empty delimiter frame,
/// outermost address first:
///
/// ```text
/// [addrN][""] ... [addr1][""][body...]
/// ```
///
/// Operations never mutate in place; `wrap`/`unwrap` consume and return a
/// new envelope, `duplicate` produces a structural copy.
///
/// # Examples
///
/// ```
/// use muf_core::{Envelope, Frame, Multipart};
///
/// let env = Envelope::new(Multipart::new().with("hello")).wrap("client-1");
/// assert_eq!(env.depth(), 1);
///
/// let wire = env.to_multipart();
/// assert_eq!(wire.len(), 3); // address, delimiter, body
///
/// let parsed = Envelope::parse(wire, 1).expect("well-formed envelope");
/// let (addr, rest) = parsed.unwrap();
/// assert_eq!(addr, Some(Frame::from("client-1")));
/// assert_eq!(rest.depth(), 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    // innermost first; the last entry is the outermost address
    route: Vec<Frame>,
    body: Multipart,
}

impl Envelope {
    /// Creates an envelope with no return addresses.
    pub fn new(body: Multipart) -> Self {
        Self {
            route: Vec::new(),
            body,
        }
    }

    /// Pushes a return address on top of the stack.
    pub fn wrap(mut self, address: impl Into<Frame>) -> Self {
        self.route.push(address.into());
        self
    }

    /// Pops the outermost return address.
    ///
    /// Returns `None` as the address when the stack is already empty.
    pub fn unwrap(mut self) -> (Option<Frame>, Self) {
        let address = self.route.pop();
        (address, self)
    }

    /// Structural copy of the whole envelope.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Outermost return address, if any.
    pub fn address(&self) -> Option<&Frame> {
        self.route.last()
    }

    pub fn depth(&self) -> usize {
        self.route.len()
    }

    pub fn body(&self) -> &Multipart {
        &self.body
    }

    pub fn into_body(self) -> Multipart {
        self.body
    }

    /// Same return route, different body. Used by workers to answer a request.
    pub fn with_body(mut self, body: Multipart) -> Self {
        self.body = body;
        self
    }

    /// Serializes the envelope into wire frames.
    pub fn to_multipart(&self) -> Multipart {
        let mut out = Multipart::new();
        for address in self.route.iter().rev() {
            out.push_back(address.clone());
            out.push_back(Frame::empty());
        }
        out.append(self.body.clone());
        out
    }

    /// Reads `depth` address/delimiter pairs from the front of `frames`;
    /// whatever follows is the body.
    ///
    /// Returns `None` if an address is missing or not followed by a delimiter.
    pub fn parse(mut frames: Multipart, depth: usize) -> Option<Self> {
        let mut outer_first = Vec::with_capacity(depth);
        for _ in 0..depth {
            let address = frames.pop_front()?;
            let delimiter = frames.pop_front()?;
            if !delimiter.is_empty() {
                return None;
            }
            outer_first.push(address);
        }
        outer_first.reverse();
        Some(Self {
            route: outer_first,
            body: frames,
        })
    }
}
