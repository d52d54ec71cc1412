use std::path::{Path, PathBuf};

use reqwest::Url;
use tokio::io::AsyncBufReadExt;

use crate::error::DlmError;

/// Resolve the CLI input into the mirror list: a path to an existing regular
/// file is read line-by-line (one URL per line, blank lines skipped), and
/// anything else is taken as a single URL.
pub async fn read_urls(input: &str) -> Result<Vec<Url>, DlmError> {
    let path = Path::new(input);

    if path.is_dir() {
        return Err(DlmError::UrlIsDirectory);
    }

    let mut raw = Vec::new();
    if path.exists() {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|_| DlmError::UrlListUnreadable)?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|_| DlmError::UrlListUnreadable)?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            raw.push(trimmed.to_string());
        }
        if raw.is_empty() {
            return Err(DlmError::CliError {
                message: format!("Url list file `{input}` contains no urls"),
            });
        }
    } else {
        raw.push(input.to_string());
    }

    raw.into_iter()
        .map(|s| {
            let cleaned = strip_format_chars(&s);
            Url::parse(&cleaned).map_err(|e| DlmError::InvalidUrl {
                url: cleaned.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Remove Unicode format characters (category Cf). Urls copied out of chat
/// clients or rich-text pages routinely pick up zero-width spaces, word
/// joiners and direction marks that are invisible but break parsing.
pub fn strip_format_chars(input: &str) -> String {
    input.chars().filter(|c| !is_format_char(*c)).collect()
}

fn is_format_char(c: char) -> bool {
    matches!(c,
        '\u{00AD}'
        | '\u{0600}'..='\u{0605}'
        | '\u{061C}'
        | '\u{06DD}'
        | '\u{070F}'
        | '\u{08E2}'
        | '\u{180E}'
        | '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2060}'..='\u{2064}'
        | '\u{2066}'..='\u{206F}'
        | '\u{FEFF}'
        | '\u{FFF9}'..='\u{FFFB}'
        | '\u{110BD}'
        | '\u{110CD}'
        | '\u{1BCA0}'..='\u{1BCA3}'
        | '\u{1D173}'..='\u{1D17A}'
        | '\u{E0001}'
        | '\u{E0020}'..='\u{E007F}')
}

/// Last path segment of the url, used as the local file name.
pub fn file_name_for(url: &Url) -> Result<String, DlmError> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| {
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .ok_or_else(|| DlmError::NoFilename {
            url: url.to_string(),
        })
}

/// Destination path for the download: the url's basename under the current
/// working directory.
pub fn dest_path(url: &Url) -> Result<PathBuf, DlmError> {
    let name = file_name_for(url)?;
    Ok(std::env::current_dir()?.join(name))
}
