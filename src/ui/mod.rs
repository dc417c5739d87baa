//! Embeds and button rows shown in Discord.

pub mod buttons;
pub mod embeds;
