use std::fmt;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use base64::Engine;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy)]
pub struct HttpDebugOptions {
    pub enabled: bool,
    pub max_body_bytes: usize,
}

fn env_bool(key: &str) -> bool {
    let Ok(v) = std::env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Read once from `SENSE_PROXY_HTTP_DEBUG` / `SENSE_PROXY_HTTP_DEBUG_BODY_MAX`.
pub fn http_debug_options() -> HttpDebugOptions {
    static OPT: OnceLock<HttpDebugOptions> = OnceLock::new();
    *OPT.get_or_init(|| {
        let enabled = env_bool("SENSE_PROXY_HTTP_DEBUG");
        let max_body_bytes = std::env::var("SENSE_PROXY_HTTP_DEBUG_BODY_MAX")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(64 * 1024);
        HttpDebugOptions {
            enabled,
            max_body_bytes,
        }
    })
}

/// Truncated, log-safe rendering of an HTTP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPreview {
    pub encoding: &'static str,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

impl fmt::Display for BodyPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.encoding != "utf8" {
            write!(f, "[{}] ", self.encoding)?;
        }
        f.write_str(&self.data)?;
        if self.truncated {
            write!(f, "... ({} bytes total)", self.original_len)?;
        }
        Ok(())
    }
}

/// Text bodies are kept as (lossy) UTF-8 up to `max` bytes; anything that is
/// not valid UTF-8 in the kept prefix is base64-encoded instead.
pub fn make_body_preview(bytes: &[u8], max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];

    let text_ok = match std::str::from_utf8(slice) {
        Ok(_) => true,
        // Cut in the middle of a multi-byte char is still text.
        Err(e) => e.error_len().is_none(),
    };
    if text_ok {
        return BodyPreview {
            encoding: "utf8",
            data: String::from_utf8_lossy(slice).into_owned(),
            truncated,
            original_len,
        };
    }

    BodyPreview {
        encoding: "base64",
        data: base64::engine::general_purpose::STANDARD.encode(slice),
        truncated,
        original_len,
    }
}

/// Install the global subscriber: stdout always, plus a JSON daily-rolling
/// file when `logging.file_dir` is set. `RUST_LOG` beats the configured level.
///
/// The returned guard must be held until shutdown so file logs flush.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let default_filter = format!("sense_proxy={},warn", cfg.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = cfg.file_dir.as_ref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("could not create log directory {:?}", dir))?;
    let file_appender = tracing_appender::rolling::daily(dir, &cfg.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Ok(Some(guard))
}
