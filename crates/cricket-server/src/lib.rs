// Library root for the cricket auction server.

pub mod app;
pub mod config;
pub mod protocol;
pub mod seasons;
pub mod ws_server;
