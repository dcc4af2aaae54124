use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RequestError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest record accepted by [`read_message`], newline included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One client request, e.g. `{"op":"incr","target":"ctr","arg":"3"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    #[serde(alias = "Op")]
    pub op: String,
    #[serde(default, alias = "Target")]
    pub target: String,
    #[serde(default, alias = "Arg", skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
}

impl Request {
    pub fn new(op: Operation, target: impl Into<String>) -> Self {
        Self {
            op: op.name().to_string(),
            target: target.into(),
            arg: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    pub fn lock(target: impl Into<String>) -> Self {
        Self::new(Operation::Lock, target)
    }

    pub fn unlock(target: impl Into<String>) -> Self {
        Self::new(Operation::Unlock, target)
    }
}

/// Operations a client may name in [`Request::op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Lock,
    Unlock,
    Get,
    Set,
    Incr,
}

impl Operation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "lock" => Some(Operation::Lock),
            "unlock" => Some(Operation::Unlock),
            "get" => Some(Operation::Get),
            "set" => Some(Operation::Set),
            "incr" => Some(Operation::Incr),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Incr => "incr",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Ko,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
            value: None,
        }
    }

    pub fn value(value: i64) -> Self {
        Self {
            value: Some(value.to_string()),
            ..Self::ok()
        }
    }

    pub fn failure(error: RequestError) -> Self {
        Self {
            status: Status::Ko,
            error: Some(error.to_string()),
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // One JSON record per line, blank lines are skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record longer than {MAX_LINE_BYTES} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Like [`write_message`] without the flush, for callers batching several
/// records before one flush.
pub async fn write_buffered<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
