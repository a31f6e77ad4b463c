//! Semantic colors, resolved to a concrete value only when rendering

use serde::{Deserialize, Serialize};

use crate::event::{DisplayEvent, WorkerStatus};

/// What a piece of output means, not how it looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorTag {
    Text,
    Muted,
    Info,
    Success,
    Warning,
    Error,
    Tool,
    /// Cycling per-worker accents
    Lane(u8),
}

/// Number of distinct lane colors before they repeat
pub const LANE_COUNT: u8 = 6;

/// Target renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Palette {
    /// SGR escape sequences for terminals
    #[default]
    Ansi,
    /// `#rrggbb` strings for web or TUI renderers
    Hex,
    /// No color at all
    Plain,
}

const ANSI_LANES: [&str; LANE_COUNT as usize] = [
    "\x1b[36m", "\x1b[35m", "\x1b[33m", "\x1b[34m", "\x1b[32m", "\x1b[96m",
];
const HEX_LANES: [&str; LANE_COUNT as usize] =
    ["#22d3ee", "#c084fc", "#facc15", "#60a5fa", "#4ade80", "#67e8f9"];

pub const ANSI_RESET: &str = "\x1b[0m";

/// Renderer value for a tag; `Plain` maps everything to the empty string
pub fn color_for(tag: ColorTag, palette: Palette) -> &'static str {
    match palette {
        Palette::Plain => "",
        Palette::Ansi => match tag {
            ColorTag::Text => "\x1b[39m",
            ColorTag::Muted => "\x1b[90m",
            ColorTag::Info => "\x1b[36m",
            ColorTag::Success => "\x1b[32m",
            ColorTag::Warning => "\x1b[33m",
            ColorTag::Error => "\x1b[31m",
            ColorTag::Tool => "\x1b[35m",
            ColorTag::Lane(n) => ANSI_LANES[(n % LANE_COUNT) as usize],
        },
        Palette::Hex => match tag {
            ColorTag::Text => "#e5e7eb",
            ColorTag::Muted => "#6b7280",
            ColorTag::Info => "#38bdf8",
            ColorTag::Success => "#22c55e",
            ColorTag::Warning => "#eab308",
            ColorTag::Error => "#ef4444",
            ColorTag::Tool => "#a855f7",
            ColorTag::Lane(n) => HEX_LANES[(n % LANE_COUNT) as usize],
        },
    }
}

/// Wrap `text` in terminal escapes; other palettes return it unchanged
pub fn paint(text: &str, tag: ColorTag, palette: Palette) -> String {
    match palette {
        Palette::Ansi => format!("{}{}{}", color_for(tag, palette), text, ANSI_RESET),
        Palette::Hex | Palette::Plain => text.to_string(),
    }
}

impl ColorTag {
    pub fn for_status(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Idle => Self::Muted,
            WorkerStatus::Running => Self::Info,
            WorkerStatus::Paused | WorkerStatus::Cancelled => Self::Warning,
            WorkerStatus::Completed => Self::Success,
            WorkerStatus::Error => Self::Error,
        }
    }

    pub fn for_event(event: &DisplayEvent) -> Self {
        match event {
            DisplayEvent::Text { .. } => Self::Text,
            DisplayEvent::ToolUse { .. } => Self::Tool,
            DisplayEvent::ToolResult { is_error: true, .. } | DisplayEvent::Error { .. } => Self::Error,
            DisplayEvent::ToolResult { .. } => Self::Muted,
        }
    }

    /// Stable accent for a worker id like `worker-3`
    pub fn for_worker(worker_id: &str) -> Self {
        let index = worker_id
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or_else(|| worker_id.bytes().map(u64::from).sum());
        Self::Lane((index % u64::from(LANE_COUNT)) as u8)
    }
}
