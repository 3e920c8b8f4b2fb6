pub mod gateway;
pub mod verify;
