//! Filter selection, rolling file sink and secret redaction for `tracing`.
//!
//! The subscriber itself is installed by the binary; this module only
//! decides what to install so the decisions stay testable.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "vidgen";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Target used for forwarded ffmpeg stderr lines.
pub const FFMPEG_STDERR_TARGET: &str = "ffmpeg_stderr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default.
/// The noise filter is only prepended when nothing was chosen explicitly.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => filter.to_string(),
        (None, v) if v >= 2 => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, _) => options
            .rust_log_env
            .clone()
            .filter(|filter| !filter.trim().is_empty())
            .unwrap_or_else(|| options.default_log_filter.clone()),
    };

    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    let noise = options.noise_filter.trim();
    if !implicit || noise.is_empty() {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    // The file keeps ffmpeg chatter at debug so failed encodes can be diagnosed.
    let file_noise: Vec<String> = noise
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((target, _)) if target.trim() == FFMPEG_STDERR_TARGET => {
                format!("{FFMPEG_STDERR_TARGET}=debug")
            }
            _ => directive.to_string(),
        })
        .collect();

    LoggingFilterPlan {
        console_filter: format!("{noise},{user_filter}"),
        file_filter: format!("{},{user_filter}", file_noise.join(",")),
        user_filter,
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir)
    {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Wraps a [`MakeWriter`] so every line is passed through [`redact_secrets`].
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until a newline so a secret split across writes is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.pending.drain(..upto).collect();
        let redacted = redact_secrets(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(last_newline) = self.pending.iter().rposition(|byte| *byte == b'\n') {
            self.emit(last_newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.emit(self.pending.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Mask URL userinfo, bearer tokens, `sk-` style keys and `key=value`
/// pairs whose key names a credential.
pub fn redact_secrets(text: &str) -> String {
    let text = mask_url_userinfo(text);
    let text = mask_bearer_tokens(&text);
    let text = mask_credential_assignments(&text);
    mask_prefixed_keys(&text)
}

fn is_value_end(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '&' | ',' | ';' | ')' | ']' | '}' | '"' | '\'')
}

fn mask_url_userinfo(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("://") {
        let authority_start = pos + 3;
        out.push_str(&rest[..authority_start]);
        rest = &rest[authority_start..];

        let authority_len = rest
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '/' | '?' | '#' | '"' | '\'' | '<' | '>'))
            .unwrap_or(rest.len());
        let authority = &rest[..authority_len];

        match authority.rfind('@') {
            Some(at) if at > 0 => {
                out.push_str(REDACTION_PLACEHOLDER);
                out.push_str(&authority[at..]);
            }
            _ => out.push_str(authority),
        }
        rest = &rest[authority_len..];
    }

    out.push_str(rest);
    out
}

fn mask_bearer_tokens(text: &str) -> String {
    const BEARER: &str = "bearer ";
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = lower[cursor..].find(BEARER) {
        let token_start = cursor + offset + BEARER.len();
        let token_len = text[token_start..]
            .find(is_value_end)
            .unwrap_or(text.len() - token_start);
        out.push_str(&text[cursor..token_start]);
        if token_len > 0 {
            out.push_str(REDACTION_PLACEHOLDER);
        }
        cursor = token_start + token_len;
    }

    out.push_str(&text[cursor..]);
    out
}

fn is_credential_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "key"
        || key.ends_with("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}

fn mask_credential_assignments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for (sep, sep_char) in text.match_indices(['=', ':']) {
        if sep < cursor {
            continue;
        }
        let key_start = text[..sep]
            .rfind(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'))
            .map(|i| i + 1)
            .unwrap_or(0);
        if key_start == sep || !is_credential_key(&text[key_start..sep]) {
            continue;
        }

        let after = &text[sep + sep_char.len()..];
        let value_offset = after.len() - after.trim_start().len();
        let mut value_start = sep + sep_char.len() + value_offset;
        let quote = text[value_start..].chars().next().filter(|ch| matches!(ch, '"' | '\''));
        if quote.is_some() {
            value_start += 1;
        }
        if text[value_start..].starts_with(REDACTION_PLACEHOLDER) {
            continue;
        }

        let remaining = &text[value_start..];
        let value_len = match quote {
            Some(quote) => remaining.find(quote),
            None => remaining.find(is_value_end),
        }
        .unwrap_or(remaining.len());
        if value_len == 0 {
            continue;
        }

        out.push_str(&text[cursor..value_start]);
        out.push_str(REDACTION_PLACEHOLDER);
        cursor = value_start + value_len;
    }

    out.push_str(&text[cursor..]);
    out
}

fn mask_prefixed_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find("sk-") {
        let start = cursor + offset;
        let at_word_start = text[..start]
            .chars()
            .next_back()
            .map_or(true, |ch| !ch.is_ascii_alphanumeric());
        let len = text[start..]
            .find(is_value_end)
            .unwrap_or(text.len() - start);

        out.push_str(&text[cursor..start]);
        if at_word_start && len >= 12 {
            out.push_str(REDACTION_PLACEHOLDER);
        } else {
            out.push_str(&text[start..start + len]);
        }
        cursor = start + len.max(3);
    }

    out.push_str(&text[cursor..]);
    out
}
