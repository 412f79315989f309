pub mod audit;
pub mod chat;
pub mod cost;
pub mod llm;
pub mod usage;
pub mod user;
