//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[..]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Stage kinds
pub static AGENT: Emoji<'_, '_> = Emoji("🤖 ", "[A]");
pub static SYNTHESIS: Emoji<'_, '_> = Emoji("🧩 ", "[S]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");

pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
