use protocol::Payload;

/// Resolves addresses for the peer. Results are opaque blobs the agent only
/// forwards; every lookup defaults to "unavailable".
pub trait Symbolizer: Send + Sync {
    /// Frames for a call stack entry, innermost first.
    fn callstack_frames(&self, _addr: u64) -> Option<Payload> {
        None
    }

    /// Source line and file of the symbol containing `addr`.
    fn symbol(&self, _addr: u64) -> Option<(u32, Payload)> {
        None
    }

    /// Raw machine code of `len` bytes at `addr`.
    fn symbol_code(&self, _addr: u64, _len: u32) -> Option<Payload> {
        None
    }

    /// Source text of `file`, optionally scoped to the image it was built
    /// into.
    fn source_code(&self, _file: &str, _image: Option<&str>) -> Option<Payload> {
        None
    }
}

/// Answers every lookup with "unavailable".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbolizer;

impl Symbolizer for NoSymbolizer {}
