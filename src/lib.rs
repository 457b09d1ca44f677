pub mod commands;
pub mod config;
pub mod data;
pub mod db;
pub mod expiry;
pub mod handlers;
pub mod logging;
pub mod snipe;

// Customize these constants for your bot
pub const BOT_NAME: &str = "warden";
pub const COMMAND_TARGET: &str = "warden::command";
pub const ERROR_TARGET: &str = "warden::error";
pub const EVENT_TARGET: &str = "warden::handlers";
pub const EXPIRY_TARGET: &str = "warden::expiry";
pub const CONSOLE_TARGET: &str = "warden";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
