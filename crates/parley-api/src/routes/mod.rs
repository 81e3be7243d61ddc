pub mod admin;
pub mod groups;
pub mod messages;
pub mod presence;
pub mod reactions;
pub mod scheduled;
