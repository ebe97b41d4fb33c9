// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use protocol::{DecodedEvent, Event, WelcomeFlags, WelcomeMessage};
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct Header<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    program_name: &'a str,
    pid: u64,
    timer_mul: f64,
    init_begin: i64,
    init_end: i64,
    resolution: u64,
    epoch: u64,
    on_demand: bool,
    code_transfer: bool,
    host_info: &'a str,
}

#[derive(Serialize)]
struct Line<'a> {
    thread: u32,
    event: &'a Event,
}

/// Writes a capture as newline separated JSON: one header describing the
/// client, then one object per record.
pub struct JsonLinesWriter<W: Write> {
    writer: W,
    records: u64,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, records: 0 }
    }

    pub fn write_header(&mut self, welcome: &WelcomeMessage) -> eyre::Result<()> {
        let header = Header {
            kind: "Welcome",
            program_name: &welcome.program_name,
            pid: welcome.pid,
            timer_mul: welcome.timer_mul,
            init_begin: welcome.init_begin,
            init_end: welcome.init_end,
            resolution: welcome.resolution,
            epoch: welcome.epoch,
            on_demand: welcome.flags.contains(WelcomeFlags::ON_DEMAND),
            code_transfer: welcome.flags.contains(WelcomeFlags::CODE_TRANSFER),
            host_info: &welcome.host_info,
        };
        serde_json::to_writer(&mut self.writer, &header)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Transport markers carry no data of their own and are skipped.
    pub fn write_event(&mut self, decoded: &DecodedEvent) -> eyre::Result<()> {
        if matches!(decoded.event, Event::ThreadContext(_) | Event::KeepAlive) {
            return Ok(());
        }
        let line = Line {
            thread: decoded.thread,
            event: &decoded.event,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> eyre::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::event::{Message, ThreadContext, ZoneBegin};
    use protocol::Payload;
    use rstest::*;
    use serde_json::Value;

    fn lines(bytes: &[u8]) -> Vec<Value> {
        std::str::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[rstest]
    fn test_records_are_tagged_by_type() {
        let mut writer = JsonLinesWriter::new(Vec::new());
        let events = [
            Event::ThreadContext(ThreadContext { thread: 3 }),
            Event::ZoneBegin(ZoneBegin {
                time: 500,
                srcloc: 9,
            }),
            Event::KeepAlive,
            Event::Message(Message {
                time: 510,
                color: 0,
                text: Payload::text("hello"),
            }),
            Event::Terminate,
        ];
        for event in events {
            writer
                .write_event(&DecodedEvent { thread: 3, event })
                .unwrap();
        }
        assert_eq!(writer.records(), 3);

        let out = lines(&writer.writer);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["thread"], 3);
        assert_eq!(out[0]["event"]["type"], "ZoneBegin");
        assert_eq!(out[0]["event"]["time"], 500);
        assert_eq!(out[1]["event"]["type"], "Message");
        assert_eq!(out[1]["event"]["text"], "hello");
        assert_eq!(out[2]["event"]["type"], "Terminate");
    }
}
