pub mod directory;
pub mod fanout;
pub mod lifecycle;
pub mod session_manager;
