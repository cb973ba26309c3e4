pub mod admin;
pub mod wsroute;
