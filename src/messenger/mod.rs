pub mod messenger;
pub mod resender;
