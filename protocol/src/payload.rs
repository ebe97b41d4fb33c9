use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_PAYLOADS: AtomicUsize = AtomicUsize::new(0);

/// Heap blob carried by an event: strings, call stacks, symbol data.
///
/// The producing thread moves it into a queue; whichever consumer path
/// takes the event out (transmit or clear) drops it. Every allocation is
/// counted so a harness can check that nothing leaks.
pub struct Payload(Box<[u8]>);

impl Payload {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        LIVE_PAYLOADS.fetch_add(1, Ordering::Relaxed);
        Payload(bytes.into())
    }

    pub fn text(s: &str) -> Self {
        Self::new(s.as_bytes())
    }

    /// Packs call-stack addresses as little-endian u64 words.
    pub fn from_addresses(addrs: &[u64]) -> Self {
        let mut bytes = Vec::with_capacity(addrs.len() * 8);
        for addr in addrs {
            bytes.extend_from_slice(&addr.to_le_bytes());
        }
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
    }

    /// Number of payloads currently allocated in this process.
    pub fn live() -> usize {
        LIVE_PAYLOADS.load(Ordering::Relaxed)
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        let prev = LIVE_PAYLOADS.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "payload released more often than allocated");
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::text(s)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::new(s.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::new(bytes)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}
