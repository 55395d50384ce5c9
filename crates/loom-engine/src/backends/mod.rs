mod command;
mod scripted;

pub use command::CommandBackend;
pub use scripted::{Gate, ScriptedBackend, ScriptedTurn};
