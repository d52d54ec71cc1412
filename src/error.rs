use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connect error")]
    Connect,
    #[error("Connection timeout")]
    Timeout,
    #[error("Response body error")]
    ResponseBody,
    #[error("Response status not success: {status_code:?}")]
    Status { status_code: u16 },
    #[error("Network error: {msg:?}")]
    Other { msg: String },
}

#[derive(Error, Debug)]
pub enum DlmError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("File's Content-Length is zero or unknown. Aborting.")]
    UnknownContentLength,
    #[error("Given url is a directory.")]
    UrlIsDirectory,
    #[error("Can't read urls file.")]
    UrlListUnreadable,
    #[error("Failed to parse url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("Can't derive a file name from url: {url}")]
    NoFilename { url: String },
    #[error("Standard I/O error: {e}")]
    StdIoError { e: std::io::Error },
    #[error("Task error: {e}")]
    TaskError { e: JoinError },
    #[error("Channel error: {e}")]
    ChannelError { e: async_channel::RecvError },
    #[error("Chunk queue closed before the range was fully enqueued")]
    ChannelClosed,
    #[error("Waited too long for a single chunk.")]
    ChunkWaitTimeout,
    #[error("Download did not finish within the allotted time.")]
    RunTimeout,
    #[error("Server closed the stream {missing} bytes short of the requested range")]
    ShortRead { missing: u64 },
    #[error("Download interrupted")]
    Interrupted,
    #[error("Couldn't delete Metadata file: {}", path.display())]
    Cleanup { path: PathBuf, e: std::io::Error },
    #[error("CLI argument error: {message:?}")]
    CliError { message: String },
}

impl From<reqwest::Error> for DlmError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if !status.is_success() {
                return Self::Network(NetworkError::Status {
                    status_code: status.as_u16(),
                });
            }
        }
        if e.is_timeout() {
            return DlmError::Network(NetworkError::Timeout);
        }

        if e.is_body() {
            return DlmError::Network(NetworkError::ResponseBody);
        }

        if e.is_connect() {
            return DlmError::Network(NetworkError::Connect);
        }

        if let Some(io_err) = e.source().and_then(|s| s.downcast_ref::<std::io::Error>()) {
            if io_err.kind() == std::io::ErrorKind::TimedOut {
                return DlmError::Network(NetworkError::Timeout);
            }
        }

        Self::Network(NetworkError::Other { msg: e.to_string() })
    }
}

impl From<std::io::Error> for DlmError {
    fn from(e: std::io::Error) -> Self {
        Self::StdIoError { e }
    }
}

impl From<JoinError> for DlmError {
    fn from(e: JoinError) -> Self {
        Self::TaskError { e }
    }
}

impl From<async_channel::RecvError> for DlmError {
    fn from(e: async_channel::RecvError) -> Self {
        Self::ChannelError { e }
    }
}

impl From<crate::coordinator::DownloaderBuilderError> for DlmError {
    fn from(e: crate::coordinator::DownloaderBuilderError) -> Self {
        Self::CliError {
            message: e.to_string(),
        }
    }
}
