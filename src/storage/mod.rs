pub mod server;
pub mod session;

pub use server::{ChatMessage, LlmProvider, ServerStorage, TerminalSessionRow};
pub use session::{CommandRecord, SessionStorage};
