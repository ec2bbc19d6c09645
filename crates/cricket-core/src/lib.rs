// Library root for the auction domain: scoring, set generation, the room
// aggregate and its state machine, squad layout, and SQLite persistence.

pub mod auction;
pub mod bidding;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod layout;
pub mod room;
pub mod rules;
pub mod scoring;
pub mod sets;
