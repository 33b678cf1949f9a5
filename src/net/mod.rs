pub mod budget;
pub mod classify;
pub mod connection;
pub mod packet;
pub mod queue;
pub mod shaper;
pub mod worldmap;
