pub mod events;
pub mod teams;
pub mod transfers;
