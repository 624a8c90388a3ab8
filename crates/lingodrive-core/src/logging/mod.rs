//! Per-instance JSONL logging
//!
//! Console output goes to stderr through `tracing-subscriber`'s fmt layer. When enabled,
//! every event is also appended to a machine-readable file per node instance:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-16_host.jsonl
//!     └── 2026-10-16_reader.jsonl
//! ```
//!
//! ```bash
//! jq 'select(.level == "warn")' logs/raw/*.jsonl
//! ```

mod entry;
mod layer;
mod writer;

pub use entry::LogRecord;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_records, InstanceLogWriter};

/// Filter directive for a `-v` count.
pub fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "lingodrive=info,lingodrive_core=info,warn",
        1 => "lingodrive=debug,lingodrive_core=debug,info",
        2 => "lingodrive=trace,lingodrive_core=trace,iroh=info,info",
        _ => "trace",
    }
}
