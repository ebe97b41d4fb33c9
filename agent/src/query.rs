use protocol::event::{
    CallstackFrame, SourceCode, StringData, SymbolCode, SymbolInformation, ThreadName,
};
use protocol::{Event, Payload, ServerQuery, ServerQueryPacket, TARGET_FRAME_SIZE};
use tracing::{debug, trace};

use crate::registry::NameRegistry;
use crate::symbolizer::Symbolizer;

/// Largest source file sent in one record, leaving room for the header.
const MAX_SOURCE_SIZE: usize = TARGET_FRAME_SIZE - 64;

#[derive(Debug, PartialEq)]
pub(crate) enum QueryAction {
    Reply(Event),
    /// Peer is going away; close after flushing.
    Disconnect,
    /// Peer acknowledged our terminate.
    Terminate,
}

/// Bytes the peer pushes ahead of a source code query: the file name,
/// preceded optionally by the image it belongs to.
#[derive(Default)]
struct DataTransfer {
    data: Option<Vec<u8>>,
    image: Option<Vec<u8>>,
    expected: usize,
}

impl DataTransfer {
    fn begin(&mut self, len: usize) {
        if let Some(previous) = self.data.take() {
            self.image = Some(previous);
        }
        self.data = Some(Vec::with_capacity(len + ServerQueryPacket::SIZE));
        self.expected = len;
    }

    fn part(&mut self, ptr: u64, extra: u32) {
        if let Some(data) = &mut self.data {
            data.extend_from_slice(&ptr.to_le_bytes());
            data.extend_from_slice(&extra.to_le_bytes());
        }
    }

    fn take(&mut self) -> (Option<String>, Option<String>) {
        let expected = self.expected;
        let file = self.data.take().map(|d| nul_terminated(&d, expected));
        let image = self.image.take().map(|d| nul_terminated(&d, usize::MAX));
        self.expected = 0;
        (file, image)
    }
}

fn nul_terminated(bytes: &[u8], limit: usize) -> String {
    let bytes = &bytes[..bytes.len().min(limit)];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Answers peer queries for one connection.
pub(crate) struct QueryResponder {
    code_transfer: bool,
    transfer: DataTransfer,
}

impl QueryResponder {
    pub fn new(code_transfer: bool) -> Self {
        QueryResponder {
            code_transfer,
            transfer: DataTransfer::default(),
        }
    }

    pub fn answer(
        &mut self,
        packet: &ServerQueryPacket,
        names: &NameRegistry,
        symbolizer: &dyn Symbolizer,
    ) -> QueryAction {
        let ptr = packet.ptr;
        let Some(query) = packet.query() else {
            debug!(opcode = packet.opcode, "unknown query");
            return QueryAction::Reply(Event::AckServerQueryNoop);
        };
        trace!(?query, ptr, extra = packet.extra, "query");

        let reply = match query {
            ServerQuery::Terminate => return QueryAction::Terminate,
            ServerQuery::Disconnect => return QueryAction::Disconnect,
            ServerQuery::String
            | ServerQuery::PlotName
            | ServerQuery::FrameName
            | ServerQuery::ExternalName => Event::StringData(StringData {
                ptr,
                text: Payload::text(names.string(ptr).unwrap_or("")),
            }),
            ServerQuery::ThreadString => Event::ThreadName(ThreadName {
                thread: ptr,
                name: Payload::text(&names.thread_name(ptr as u32)),
            }),
            ServerQuery::SourceLocation => match names.source_location(ptr) {
                Some(location) => Event::SourceLocation(location),
                None => Event::AckServerQueryNoop,
            },
            ServerQuery::Parameter => {
                if !names.update_parameter(ptr as u32, packet.extra as i32) {
                    debug!(idx = ptr, "value for unknown parameter");
                }
                Event::AckServerQueryNoop
            }
            ServerQuery::CallstackFrame => Event::CallstackFrame(CallstackFrame {
                ptr,
                frames: symbolizer
                    .callstack_frames(ptr)
                    .unwrap_or_else(|| Payload::new(Vec::new())),
            }),
            ServerQuery::Symbol => {
                let (line, file) = symbolizer
                    .symbol(ptr)
                    .unwrap_or_else(|| (0, Payload::new(Vec::new())));
                Event::SymbolInformation(SymbolInformation {
                    addr: ptr,
                    line,
                    file,
                })
            }
            ServerQuery::SymbolCode => self.symbol_code(ptr, packet.extra, symbolizer),
            ServerQuery::SourceCode => self.source_code(ptr as u32, symbolizer),
            ServerQuery::DataTransfer => {
                self.transfer.begin(ptr as usize);
                Event::AckServerQueryNoop
            }
            ServerQuery::DataTransferPart => {
                self.transfer.part(ptr, packet.extra);
                Event::AckServerQueryNoop
            }
        };
        QueryAction::Reply(reply)
    }

    fn symbol_code(&self, addr: u64, len: u32, symbolizer: &dyn Symbolizer) -> Event {
        let code = if self.code_transfer {
            symbolizer
                .symbol_code(addr, len)
                .filter(|code| code.len() <= MAX_SOURCE_SIZE)
        } else {
            None
        };
        match code {
            Some(code) => Event::SymbolCode(SymbolCode { addr, code }),
            None => Event::AckSymbolCodeNotAvailable { addr },
        }
    }

    fn source_code(&mut self, id: u32, symbolizer: &dyn Symbolizer) -> Event {
        let (file, image) = self.transfer.take();
        let Some(file) = file else {
            return Event::AckSourceCodeNotAvailable { id };
        };
        let text = symbolizer
            .source_code(&file, image.as_deref())
            .or_else(|| self.read_source(&file))
            .filter(|text| text.len() <= MAX_SOURCE_SIZE);
        match text {
            Some(text) => Event::SourceCode(SourceCode { id, text }),
            None => Event::AckSourceCodeNotAvailable { id },
        }
    }

    fn read_source(&self, file: &str) -> Option<Payload> {
        if !self.code_transfer {
            return None;
        }
        let meta = std::fs::metadata(file).ok()?;
        if !meta.is_file() || meta.len() as usize > MAX_SOURCE_SIZE {
            return None;
        }
        std::fs::read(file).ok().map(Payload::new)
    }
}
