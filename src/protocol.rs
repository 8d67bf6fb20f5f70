//! Controller request parsing and reply framing.
//!
//! Requests are single text lines. Replies are NUL-terminated headers:
//! "0" or "0 <value>" on success, the numeric error code otherwise, and
//! "0 attach <n>" or "0 <offset> attach <n>" when `n` bytes follow.

use std::fs::File;
use std::io;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::core::SnifferCore;
use crate::error::{Result, SnifferError};
use crate::sniffer::SnifferId;
use crate::transport::Transport;
use crate::tree;

/// What `get_sniffers` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffersQuery {
    /// Started sniffers with new data, offsets probed from disk.
    Sync,
    /// All started live sniffers with their delivered offsets.
    NoSync,
    /// Current offset of one sniffer.
    Mark(SnifferId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get(String),
    Set(String, String),
    Add(String),
    Del(String),
    List(String),
    GetSniffers(SniffersQuery),
    GetDump(SnifferId),
}

impl Request {
    /// Whether the request streams capture bytes.
    pub fn is_dump(&self) -> bool {
        matches!(self, Request::GetDump(_))
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], s[end..].trim_start()),
        None => (s, ""),
    }
}

impl FromStr for Request {
    type Err = SnifferError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n', '\0']);
        let (command, rest) = split_word(line);
        let (path, value) = split_word(rest);

        let need_path = || {
            if path.is_empty() {
                Err(SnifferError::Invalid(format!("'{}' needs a path", command)))
            } else {
                Ok(path.to_string())
            }
        };

        match command {
            "get" => Ok(Request::Get(need_path()?)),
            "set" => Ok(Request::Set(need_path()?, value.to_string())),
            "add" => Ok(Request::Add(need_path()?)),
            "del" => Ok(Request::Del(need_path()?)),
            "list" => Ok(Request::List(need_path()?)),
            "get_sniffers" => Ok(Request::GetSniffers(match rest.trim() {
                "sync" => SniffersQuery::Sync,
                "nosync" => SniffersQuery::NoSync,
                id => SniffersQuery::Mark(id.parse()?),
            })),
            "get_snif_dump" => Ok(Request::GetDump(rest.parse()?)),
            "" => Err(SnifferError::Invalid("empty request".to_string())),
            other => Err(SnifferError::Invalid(format!("unknown command '{}'", other))),
        }
    }
}

fn reply_status(transport: &mut dyn Transport, result: Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => transport.reply("0"),
        Err(e) => {
            debug!("Request failed: {}", e);
            transport.reply(&e.code().to_string())
        }
    }
}

fn reply_attachment(transport: &mut dyn Transport, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return transport.reply("0");
    }
    transport.reply(&format!("0 attach {}", data.len()))?;
    transport.send_attachment(data)
}

/// Remembers whether a reply header has gone out.
struct Tracked<'a> {
    inner: &'a mut dyn Transport,
    replied: bool,
}

impl Transport for Tracked<'_> {
    fn reply(&mut self, header: &str) -> io::Result<()> {
        self.replied = true;
        self.inner.reply(header)
    }

    fn send_attachment(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.send_attachment(data)
    }

    fn send_file(&mut self, file: &File, len: u64) -> io::Result<u64> {
        self.inner.send_file(file, len)
    }
}

/// Stream one dump. Any failure before the header is sent answers "0";
/// a failure mid-body is returned since the stream can't be recovered.
pub fn handle_dump(
    core: &mut SnifferCore,
    id: &SnifferId,
    transport: &mut dyn Transport,
) -> io::Result<()> {
    let mut tracked = Tracked {
        inner: transport,
        replied: false,
    };
    match core.stream_dump(id, &mut tracked) {
        Ok(_) => Ok(()),
        Err(e) if !tracked.replied => {
            match e {
                SnifferError::NoData => debug!("No capture data for sniffer {}", id),
                ref e => warn!("Dump of sniffer {} failed: {}", id, e),
            }
            tracked.reply("0")
        }
        Err(SnifferError::Io(e)) => Err(e),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

/// `get_sniffers`: the offset list or one sniffer's mark.
pub fn handle_sniffers(
    core: &mut SnifferCore,
    query: &SniffersQuery,
    transport: &mut dyn Transport,
) -> io::Result<()> {
    let data = match query {
        SniffersQuery::Sync => core.list_with_offsets(true),
        SniffersQuery::NoSync => core.list_with_offsets(false),
        SniffersQuery::Mark(id) => match core.current_offset(id) {
            Ok(offset) => {
                let mut buf = format!("{} {}", id, offset).into_bytes();
                buf.push(0);
                buf
            }
            Err(e) => {
                warn!("Couldn't get offset of sniffer {}: {}", id, e);
                Vec::new()
            }
        },
    };
    reply_attachment(transport, &data)
}

/// Execute one request against the core and write its reply.
pub fn execute(
    core: &mut SnifferCore,
    request: &Request,
    transport: &mut dyn Transport,
) -> io::Result<()> {
    debug!("Controller request: {:?}", request);
    match request {
        Request::Get(path) => match tree::get(core, path) {
            Ok(value) => transport.reply(&format!("0 {}", value)),
            Err(e) => reply_status(transport, Err(e)),
        },
        Request::Set(path, value) => reply_status(transport, tree::set(core, path, value)),
        Request::Add(path) => reply_status(transport, tree::add(core, path)),
        Request::Del(path) => reply_status(transport, tree::del(core, path)),
        Request::List(path) => match tree::list(core, path) {
            Ok(names) => transport.reply(&format!("0 {}", names.join(" "))),
            Err(e) => reply_status(transport, Err(e)),
        },
        Request::GetSniffers(query) => handle_sniffers(core, query, transport),
        Request::GetDump(id) => handle_dump(core, id, transport),
    }
}

/// Reply to a line that didn't parse.
pub fn reject(error: &SnifferError, transport: &mut dyn Transport) -> io::Result<()> {
    warn!("Bad controller request: {}", error);
    transport.reply(&error.code().to_string())
}
